use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use thiserror::Error;

use crate::{
    action::{split_action, Action},
    alarm::{clock_slot, Alarm, AlarmParseError, AlarmScheduler, DayOfWeek},
    config::{ControllerConfig, PersistedSettings},
    debounce::Debouncer,
    motion::{MotionTransition, PirSensor},
    registry::{ChannelAddress, DeviceChannel, DeviceRegistry, PollOutcome, ToggleStart},
    router::{classify, decode_payload, normalize, BusCommand, Inbound},
    topics::TOPIC_PREFIX,
    types::{
        ControllerStatus, DeviceView, LightView, PirSwitch, Room, RoomLight, SensorDisplay,
        SensorId, SensorView, UiEvent,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

/// Side effects requested by the engine. The host performs them in order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    Publish { topic: String, message: String },
    /// Reply to a vendor bind request; the host stamps the time.
    AckBind { topic: String, message_id: String },
    ToggleChannel { key: String, desired: Option<bool> },
    SaveAlarms(Vec<String>),
    SaveSettings(PersistedSettings),
    Notify(UiEvent),
    Log { level: LogLevel, message: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DelayError {
    #[error("`{0}` is not a whole number of seconds")]
    NotANumber(String),
    #[error("{0}s is longer than a day")]
    TooLong(u64),
}

pub fn parse_delay(value: &str) -> Result<u32, DelayError> {
    let value = value.trim();
    let seconds: u64 = value
        .parse()
        .map_err(|_| DelayError::NotANumber(value.to_string()))?;
    if seconds > u64::from(PersistedSettings::MAX_DELAY_S) {
        return Err(DelayError::TooLong(seconds));
    }
    Ok(seconds as u32)
}

fn publish(message: impl Into<String>) -> EngineAction {
    EngineAction::Publish {
        topic: TOPIC_PREFIX.to_string(),
        message: message.into(),
    }
}

fn log(level: LogLevel, message: impl Into<String>) -> EngineAction {
    EngineAction::Log {
        level,
        message: message.into(),
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

/// Boolean spelling peers expect in `<Name>_PIR = ...` messages.
fn capitalised(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// All controller state. Every mutation goes through `&mut self`, so the host only
/// has to serialise access to one value.
#[derive(Debug, Clone)]
pub struct HomeEngine {
    config: ControllerConfig,
    settings: PersistedSettings,

    lights: [RoomLight; 4],
    brightness_off_at_ms: [Option<u64>; 4],

    sensors: [PirSensor; 2],
    any_pir: bool,
    motion_action: Action,

    alarms: AlarmScheduler,
    last_alarm_slot: Option<String>,

    registry: DeviceRegistry,
    device_status: String,
    switch_states: BTreeMap<String, bool>,

    messages: Debouncer,
    controls: Debouncer,

    shown_displays: [Option<SensorDisplay>; 2],
    shown_next_alarm: Option<(Option<String>, String)>,
}

impl HomeEngine {
    /// Builds the engine from persisted state. The returned actions announce the
    /// loaded alarms to peers and, when nothing was stored, seed and save the
    /// configured defaults.
    pub fn new(
        config: ControllerConfig,
        mut settings: PersistedSettings,
        stored_alarms: Vec<String>,
    ) -> (Self, Vec<EngineAction>) {
        settings.sanitize();
        let mut actions = Vec::new();

        let (mut alarms, rejected) = AlarmScheduler::load(&stored_alarms);
        for err in rejected {
            actions.push(log(LogLevel::Warn, format!("Discarded stored alarm: {err}")));
        }
        if stored_alarms.is_empty() && !config.default_alarms.is_empty() {
            let (defaults, rejected) = AlarmScheduler::load(&config.default_alarms);
            for err in rejected {
                actions.push(log(LogLevel::Warn, format!("Discarded default alarm: {err}")));
            }
            alarms = defaults;
            actions.push(EngineAction::SaveAlarms(alarms.entries()));
        }
        for entry in alarms.entries() {
            actions.push(publish(format!("Add_Alarm:{entry}")));
        }

        let engine = Self {
            sensors: [
                PirSensor::new(SensorId::Bedroom, settings.bedroom_delay_s),
                PirSensor::new(SensorId::Sittingroom, settings.sittingroom_delay_s),
            ],
            motion_action: Action::parse(&settings.motion_action),
            messages: Debouncer::new(config.message_debounce_ms),
            controls: Debouncer::new(config.button_debounce_ms),
            config,
            settings,
            lights: [RoomLight::new(); 4],
            brightness_off_at_ms: [None; 4],
            any_pir: false,
            alarms,
            last_alarm_slot: None,
            registry: DeviceRegistry::default(),
            device_status: String::new(),
            switch_states: BTreeMap::new(),
            shown_displays: [None; 2],
            shown_next_alarm: None,
        };
        (engine, actions)
    }

    pub fn settings(&self) -> &PersistedSettings {
        &self.settings
    }

    pub fn light(&self, room: Room) -> RoomLight {
        self.lights[room.index()]
    }

    pub fn sensor(&self, sensor: SensorId) -> &PirSensor {
        &self.sensors[sensor.index()]
    }

    pub fn any_pir(&self) -> bool {
        self.any_pir
    }

    pub fn alarms(&self) -> &AlarmScheduler {
        &self.alarms
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn device_status(&self) -> &str {
        &self.device_status
    }

    /// One-second driver: alarms, motion, countdowns, brightness auto-off and the
    /// front-end displays that depend on time.
    pub fn tick(&mut self, now_ms: u64, wall: DateTime<FixedOffset>) -> Vec<EngineAction> {
        let mut actions = self.check_alarms(wall);
        actions.extend(self.process_motion(now_ms));
        actions.extend(self.check_countdowns(now_ms));
        actions.extend(self.check_brightness(now_ms));
        actions.extend(self.refresh_brightness_displays());
        actions.extend(self.refresh_sensor_displays(now_ms));
        actions.extend(self.refresh_next_alarm(wall));
        actions
    }

    pub fn handle_bus_message(
        &mut self,
        topic: &str,
        payload: &str,
        origin_id: &str,
        now_ms: u64,
    ) -> Vec<EngineAction> {
        let message = match decode_payload(payload, origin_id) {
            Inbound::Own => return Vec::new(),
            Inbound::Message(message) => message,
        };

        let command = classify(topic, &message);
        if command.is_debounced() {
            let key = format!("message:{}", normalize(message.trim()));
            if self.messages.should_suppress(&key, now_ms) {
                return vec![log(
                    LogLevel::Debug,
                    format!("Duplicate message suppressed: {message}"),
                )];
            }
        }

        let mut actions = vec![log(LogLevel::Debug, format!("{topic}: {message}"))];
        actions.extend(self.dispatch(topic, command, now_ms));
        actions
    }

    fn dispatch(&mut self, topic: &str, command: BusCommand, now_ms: u64) -> Vec<EngineAction> {
        match command {
            BusCommand::BindRequest { message_id } => vec![
                log(LogLevel::Info, format!("Acknowledging bind request on {topic}")),
                EngineAction::AckBind {
                    topic: topic.replace("publish", "subscribe"),
                    message_id,
                },
            ],
            BusCommand::Motion { sensor, motion } => {
                self.sensors[sensor.index()].set_motion(motion);
                let mut actions = self.process_motion(now_ms);
                actions.extend(self.refresh_sensor_displays(now_ms));
                actions
            }
            BusCommand::Brightness { room, bright } => self.set_brightness(room, bright, now_ms),
            BusCommand::LightState { room, on } => {
                self.switch_states.insert(room.as_str().to_string(), on);
                let light = &mut self.lights[room.index()];
                if light.on == on {
                    return Vec::new();
                }
                light.on = on;
                vec![EngineAction::Notify(UiEvent::Light { room, on })]
            }
            BusCommand::SwitchState { name, on } => {
                self.switch_states.insert(name, on);
                Vec::new()
            }
            BusCommand::Delay { sensor, value } => match self.set_delay(sensor, &value, now_ms) {
                Ok(actions) => actions,
                Err(err) => vec![log(
                    LogLevel::Warn,
                    format!("Invalid {} message: {err}", sensor.delay_name()),
                )],
            },
            BusCommand::PirEnable { switch, on } => self.sync_pir(switch, on),
            BusCommand::MotionAction(raw) => {
                if !self.apply_motion_action(&raw) {
                    return Vec::new();
                }
                vec![
                    EngineAction::SaveSettings(self.settings.clone()),
                    log(LogLevel::Info, format!("Motion action synced from bus: {raw}")),
                ]
            }
            BusCommand::AddAlarm(raw) => match Alarm::parse(&raw) {
                Ok(alarm) => self.insert_alarm(alarm, false),
                Err(err) => vec![log(LogLevel::Warn, format!("Rejected alarm `{raw}`: {err}"))],
            },
            BusCommand::Outlet {
                base_name,
                outlet,
                on,
            } => match self.registry.resolve_outlet(&base_name, outlet) {
                Some(channel) if channel.status != on && !channel.is_locked() => {
                    vec![EngineAction::ToggleChannel {
                        key: channel.key.clone(),
                        desired: Some(on),
                    }]
                }
                Some(_) => Vec::new(),
                None => vec![log(
                    LogLevel::Debug,
                    format!("No channel for {base_name} outlet {outlet}"),
                )],
            },
            BusCommand::Execute(action) => self.execute_action(&action),
            BusCommand::Unhandled => {
                vec![log(LogLevel::Debug, format!("Unhandled message on {topic}"))]
            }
        }
    }

    /// Applies an action, doing nothing when the target is already in the desired
    /// state.
    pub fn execute_action(&mut self, action: &Action) -> Vec<EngineAction> {
        match action {
            Action::RoomLightSet { room, on } => self.set_light(*room, *on),
            Action::PirEnableSet { switch, on } => {
                if self.pir_enabled(*switch) == *on {
                    Vec::new()
                } else {
                    self.toggle_pir(*switch)
                }
            }
            Action::ChannelToggle { target, on } => self.request_channel(target, *on),
            Action::Unknown(raw) if raw.is_empty() => Vec::new(),
            Action::Unknown(raw) => {
                vec![log(LogLevel::Info, format!("Unknown action `{raw}`, ignored"))]
            }
        }
    }

    fn request_channel(&self, target: &str, on: bool) -> Vec<EngineAction> {
        let Some(channel) = self.registry.resolve(target) else {
            return vec![log(
                LogLevel::Info,
                format!("Unknown action base `{target}`, ignored"),
            )];
        };
        if channel.status == on {
            return Vec::new();
        }
        if channel.is_locked() {
            return vec![log(
                LogLevel::Debug,
                format!("{} is busy, request dropped", channel.key),
            )];
        }
        vec![EngineAction::ToggleChannel {
            key: channel.key.clone(),
            desired: Some(on),
        }]
    }

    fn set_light(&mut self, room: Room, on: bool) -> Vec<EngineAction> {
        let light = &mut self.lights[room.index()];
        if light.on == on {
            return Vec::new();
        }
        light.on = on;
        vec![
            publish(format!("{}_is_{}", room.as_str(), on_off(on))),
            EngineAction::Notify(UiEvent::Light { room, on }),
        ]
    }

    pub fn press_light_button(&mut self, room: Room, now_ms: u64) -> Vec<EngineAction> {
        let key = format!("light_button_{}", room.as_str());
        if self.controls.should_suppress(&key, now_ms) {
            return vec![log(LogLevel::Debug, format!("{key} debounced"))];
        }
        let on = !self.lights[room.index()].on;
        self.set_light(room, on)
    }

    fn pir_enabled(&self, switch: PirSwitch) -> bool {
        match switch.sensor() {
            Some(sensor) => self.sensors[sensor.index()].is_enabled(),
            None => self.any_pir,
        }
    }

    fn pir_event(&self) -> EngineAction {
        let [bedroom, sittingroom] = &self.sensors;
        EngineAction::Notify(UiEvent::Pir {
            any: self.any_pir,
            bedroom: bedroom.is_enabled(),
            sittingroom: sittingroom.is_enabled(),
            bedroom_connected: bedroom.is_connected(),
            sittingroom_connected: sittingroom.is_connected(),
        })
    }

    /// Flips an enable switch and announces it. Switching `Any_PIR` off also
    /// disables both sensors.
    pub fn toggle_pir(&mut self, switch: PirSwitch) -> Vec<EngineAction> {
        let on = match switch.sensor() {
            Some(sensor) => {
                let pir = &mut self.sensors[sensor.index()];
                let on = !pir.is_enabled();
                pir.set_enabled(on);
                on
            }
            None => {
                self.any_pir = !self.any_pir;
                if !self.any_pir {
                    for pir in &mut self.sensors {
                        pir.set_enabled(false);
                    }
                }
                self.any_pir
            }
        };
        vec![
            publish(format!("{} = {}", switch.identity(), capitalised(on))),
            self.pir_event(),
        ]
    }

    /// Enable flag reported by a peer; applied without echoing it back.
    fn sync_pir(&mut self, switch: PirSwitch, on: bool) -> Vec<EngineAction> {
        let changed = match switch.sensor() {
            Some(sensor) => self.sensors[sensor.index()].set_enabled(on),
            None => {
                let mut changed = self.any_pir != on;
                self.any_pir = on;
                if !on {
                    for pir in &mut self.sensors {
                        changed |= pir.set_enabled(false);
                    }
                }
                changed
            }
        };
        if changed {
            vec![self.pir_event()]
        } else {
            Vec::new()
        }
    }

    pub fn set_bus_connected(&mut self, connected: bool) -> Vec<EngineAction> {
        let mut changed = false;
        for pir in &mut self.sensors {
            changed |= pir.set_connected(connected);
        }

        let mut actions = Vec::new();
        if connected {
            for sensor in SensorId::ALL {
                actions.push(publish(format!(
                    "{} = {}",
                    sensor.delay_name(),
                    self.settings.delay_for(sensor)
                )));
            }
        }
        if changed {
            actions.push(self.pir_event());
        }
        actions
    }

    /// Updates a countdown delay from user or peer input. Unchanged values are a
    /// no-op; changes are debounced per sensor, republished and persisted.
    pub fn set_delay(
        &mut self,
        sensor: SensorId,
        value: &str,
        now_ms: u64,
    ) -> Result<Vec<EngineAction>, DelayError> {
        let seconds = parse_delay(value)?;
        if seconds == self.settings.delay_for(sensor) {
            return Ok(Vec::new());
        }

        let key = format!("{}_delay_entry", sensor.room().as_str().to_ascii_lowercase());
        if self.controls.should_suppress(&key, now_ms) {
            return Ok(vec![log(LogLevel::Debug, format!("{key} debounced"))]);
        }

        self.settings.set_delay(sensor, seconds);
        self.sensors[sensor.index()].set_delay(seconds);
        Ok(vec![
            publish(format!("{} = {seconds}", sensor.delay_name())),
            EngineAction::SaveSettings(self.settings.clone()),
            log(
                LogLevel::Info,
                format!("{} delay set to {seconds}s", sensor.label()),
            ),
        ])
    }

    fn apply_motion_action(&mut self, raw: &str) -> bool {
        let raw = raw.trim();
        if raw == self.settings.motion_action {
            return false;
        }
        self.settings.motion_action = raw.to_string();
        self.motion_action = Action::parse(raw);
        true
    }

    pub fn set_motion_action(&mut self, raw: &str) -> Vec<EngineAction> {
        if !self.apply_motion_action(raw) {
            return Vec::new();
        }
        vec![
            publish(format!("Motion_Action = {}", self.settings.motion_action)),
            EngineAction::SaveSettings(self.settings.clone()),
            log(
                LogLevel::Info,
                format!("Motion action set to `{}`", self.settings.motion_action),
            ),
        ]
    }

    pub fn select_sensor(&mut self, sensor: SensorId) -> Vec<EngineAction> {
        if self.settings.selected_sensor == sensor {
            return Vec::new();
        }
        self.settings.selected_sensor = sensor;
        vec![
            EngineAction::SaveSettings(self.settings.clone()),
            log(LogLevel::Info, format!("Selected motion sensor: {}", sensor.label())),
        ]
    }

    fn set_brightness(&mut self, room: Room, bright: bool, now_ms: u64) -> Vec<EngineAction> {
        self.lights[room.index()].bright = bright;
        self.schedule_brightness_off(room, now_ms);
        self.refresh_brightness_displays()
    }

    fn refresh_brightness_displays(&mut self) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for room in Room::ALL {
            let light = &mut self.lights[room.index()];
            if light.previous_bright != light.bright {
                light.previous_bright = light.bright;
                actions.push(EngineAction::Notify(UiEvent::Brightness {
                    room,
                    bright: light.bright,
                }));
            }
        }
        actions
    }

    fn schedule_brightness_off(&mut self, room: Room, now_ms: u64) {
        let light = self.lights[room.index()];
        let pending = &mut self.brightness_off_at_ms[room.index()];
        if light.on && light.bright && pending.is_none() {
            *pending = Some(now_ms.saturating_add(self.config.brightness_off_delay_ms));
        }
    }

    fn check_brightness(&mut self, now_ms: u64) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for room in Room::ALL {
            let index = room.index();
            if let Some(deadline) = self.brightness_off_at_ms[index] {
                if now_ms >= deadline {
                    self.brightness_off_at_ms[index] = None;
                    let light = self.lights[index];
                    if light.on && light.bright {
                        actions.push(log(
                            LogLevel::Info,
                            format!("{} is bright, switching light off", room.as_str()),
                        ));
                        actions.extend(self.set_light(room, false));
                    }
                }
            }
            self.schedule_brightness_off(room, now_ms);
        }
        actions
    }

    /// Only the selected sensor drives the motion action. The other one keeps its
    /// edge detector current so a later selection does not see a stale edge.
    fn process_motion(&mut self, now_ms: u64) -> Vec<EngineAction> {
        let selected = self.settings.selected_sensor;
        let delayed_off = self.motion_action.ends_on();
        let mut actions = Vec::new();

        for sensor in SensorId::ALL {
            let pir = &mut self.sensors[sensor.index()];
            if sensor != selected {
                pir.track();
                continue;
            }

            match pir.observe(now_ms, delayed_off) {
                MotionTransition::Started => {
                    actions.push(log(
                        LogLevel::Info,
                        format!("Motion detected on {}", sensor.label()),
                    ));
                    let action = self.motion_action.clone();
                    actions.extend(self.execute_action(&action));
                }
                MotionTransition::CountdownArmed { deadline_ms } => actions.push(log(
                    LogLevel::Debug,
                    format!(
                        "{} countdown armed for {}s",
                        sensor.label(),
                        deadline_ms.saturating_sub(now_ms) / 1_000
                    ),
                )),
                MotionTransition::Ceased => actions.push(log(
                    LogLevel::Debug,
                    format!("Motion ceased on {}", sensor.label()),
                )),
                MotionTransition::Seeded | MotionTransition::None => {}
            }
        }
        actions
    }

    fn check_countdowns(&mut self, now_ms: u64) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for sensor in SensorId::ALL {
            if !self.sensors[sensor.index()].take_expired_countdown(now_ms) {
                continue;
            }
            actions.push(log(
                LogLevel::Info,
                format!("{} countdown finished", sensor.label()),
            ));
            if self.motion_action.ends_on() {
                let off = self.motion_action.with_state(false);
                actions.extend(self.execute_action(&off));
            }
        }
        actions
    }

    fn refresh_sensor_displays(&mut self, now_ms: u64) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for sensor in SensorId::ALL {
            let index = sensor.index();
            let display = self.sensors[index].display(now_ms);
            if self.shown_displays[index] != Some(display) {
                self.shown_displays[index] = Some(display);
                actions.push(EngineAction::Notify(UiEvent::Sensor { sensor, display }));
            }
        }
        actions
    }

    /// Runs the alarms due in this wall-clock second, at most once per second.
    fn check_alarms(&mut self, wall: DateTime<FixedOffset>) -> Vec<EngineAction> {
        let slot = clock_slot(wall);
        if self.last_alarm_slot.as_deref() == Some(slot.as_str()) {
            return Vec::new();
        }
        self.last_alarm_slot = Some(slot);

        let due: Vec<(String, Action)> = self
            .alarms
            .due(wall)
            .into_iter()
            .map(|alarm| (alarm.to_string(), Action::parse(alarm.action())))
            .collect();

        let mut actions = Vec::new();
        for (entry, action) in due {
            actions.push(log(LogLevel::Info, format!("Alarm fired: {entry}")));
            actions.extend(self.execute_action(&action));
        }
        actions
    }

    /// Adds an alarm from the front-end. A `"<display> Ch<n> on|off"` choice is
    /// stored under the channel key so renaming a device keeps its alarms.
    pub fn add_alarm(
        &mut self,
        choice: &str,
        day: DayOfWeek,
        time: &str,
    ) -> Result<Vec<EngineAction>, AlarmParseError> {
        let action = self.alarm_action_for(choice);
        let alarm = Alarm::new(&action, day, time)?;
        Ok(self.insert_alarm(alarm, true))
    }

    fn alarm_action_for(&self, choice: &str) -> String {
        if let Some((base, on)) = split_action(choice) {
            if let Some(channel) = self
                .registry
                .iter()
                .find(|channel| channel.channel_label() == base)
            {
                return format!("{}_{}", channel.key, on_off(on));
            }
        }
        choice.trim().replace(' ', "_")
    }

    fn insert_alarm(&mut self, alarm: Alarm, announce: bool) -> Vec<EngineAction> {
        let entry = alarm.to_string();
        if !self.alarms.add(alarm) {
            return vec![log(LogLevel::Debug, format!("Alarm already scheduled: {entry}"))];
        }

        let mut actions = Vec::new();
        if announce {
            actions.push(publish(format!("Add_Alarm:{entry}")));
        }
        actions.push(EngineAction::SaveAlarms(self.alarms.entries()));
        actions.push(log(LogLevel::Info, format!("Added alarm {entry}")));
        actions
    }

    /// Text and button label for the alarm under the browse cursor.
    pub fn next_alarm(&self, wall: DateTime<FixedOffset>) -> (Option<String>, String) {
        match self.alarms.selected_upcoming(wall) {
            Some((index, alarm)) => {
                let action = self
                    .registry
                    .display_action(alarm.action())
                    .unwrap_or_else(|| alarm.action().to_string());
                (
                    Some(format!("{action} {} {}", alarm.day(), alarm.time())),
                    format!("Alarm {}", index + 1),
                )
            }
            None => (None, "No more today".to_string()),
        }
    }

    fn refresh_next_alarm(&mut self, wall: DateTime<FixedOffset>) -> Vec<EngineAction> {
        let view = self.next_alarm(wall);
        if self.shown_next_alarm.as_ref() == Some(&view) {
            return Vec::new();
        }
        let (text, button) = view.clone();
        self.shown_next_alarm = Some(view);
        vec![EngineAction::Notify(UiEvent::NextAlarm {
            text: text.unwrap_or_default(),
            button,
        })]
    }

    pub fn cycle_next_alarm(&mut self, wall: DateTime<FixedOffset>) -> Vec<EngineAction> {
        self.alarms.advance(wall);
        self.refresh_next_alarm(wall)
    }

    pub fn press_device_button(&mut self, key: &str, now_ms: u64) -> Vec<EngineAction> {
        if self.registry.get(key).is_none() {
            return vec![log(LogLevel::Warn, format!("Unknown device key {key}"))];
        }
        if self.controls.should_suppress(key, now_ms) {
            return vec![log(LogLevel::Debug, format!("{key} debounced"))];
        }
        vec![EngineAction::ToggleChannel {
            key: key.to_string(),
            desired: None,
        }]
    }

    /// Replaces the channel set and announces every channel's current status.
    pub fn install_channels(&mut self, channels: Vec<DeviceChannel>) -> Vec<EngineAction> {
        self.registry.replace(channels);
        let mut actions: Vec<EngineAction> = self
            .registry
            .iter()
            .flat_map(|channel| self.channel_updates(channel))
            .collect();
        actions.push(log(
            LogLevel::Info,
            format!("Registered {} device channels", self.registry.len()),
        ));
        actions
    }

    pub fn begin_toggle(&mut self, key: &str, desired: Option<bool>) -> ToggleStart {
        self.registry.begin_toggle(key, desired)
    }

    /// Releases the channel lock with the final status and publishes it if it
    /// changed.
    pub fn finish_toggle(&mut self, key: &str, status: bool) -> Vec<EngineAction> {
        let changed = self.registry.finish_toggle(key, status);
        let Some(channel) = self.registry.get(key) else {
            return vec![log(
                LogLevel::Warn,
                format!("{key} disappeared during its toggle"),
            )];
        };
        if changed {
            self.channel_updates(channel)
        } else {
            vec![self.button_event(channel)]
        }
    }

    pub fn poll_targets(&self) -> Vec<ChannelAddress> {
        self.registry.poll_targets()
    }

    /// Applies a polled live status for `target`. Reads that raced a toggle on
    /// the same channel are dropped.
    pub fn apply_polled_status(&mut self, target: &ChannelAddress, status: bool) -> Vec<EngineAction> {
        if self.registry.apply_polled(target, status) != PollOutcome::Changed {
            return Vec::new();
        }
        match self.registry.get(&target.key) {
            Some(channel) => {
                let mut actions = vec![log(
                    LogLevel::Info,
                    format!("{} changed remotely to {}", channel.key, on_off(status)),
                )];
                actions.extend(self.channel_updates(channel));
                actions
            }
            None => Vec::new(),
        }
    }

    fn button_event(&self, channel: &DeviceChannel) -> EngineAction {
        EngineAction::Notify(UiEvent::DeviceButton {
            key: channel.key.clone(),
            label: channel.button_label(),
            color: channel.button_color(),
        })
    }

    fn channel_updates(&self, channel: &DeviceChannel) -> Vec<EngineAction> {
        let mut actions: Vec<EngineAction> = channel
            .status_messages()
            .into_iter()
            .map(|(topic, message)| EngineAction::Publish {
                topic: topic.to_string(),
                message,
            })
            .collect();
        actions.push(self.button_event(channel));
        actions
    }

    pub fn set_device_status(&mut self, text: &str) -> Vec<EngineAction> {
        if self.device_status == text {
            return Vec::new();
        }
        self.device_status = text.to_string();
        vec![
            log(LogLevel::Info, format!("Device integration: {text}")),
            EngineAction::Notify(UiEvent::DeviceStatus {
                text: text.to_string(),
            }),
        ]
    }

    pub fn status(
        &self,
        now_ms: u64,
        wall: DateTime<FixedOffset>,
        timezone: &str,
    ) -> ControllerStatus {
        let (next_alarm, alarm_button) = self.next_alarm(wall);
        ControllerStatus {
            lights: Room::ALL
                .into_iter()
                .map(|room| {
                    let light = self.lights[room.index()];
                    LightView {
                        room,
                        on: light.on,
                        bright: light.bright,
                    }
                })
                .collect(),
            any_pir: self.any_pir,
            sensors: self
                .sensors
                .iter()
                .map(|pir| SensorView {
                    sensor: pir.id(),
                    enabled: pir.is_enabled(),
                    connected: pir.is_connected(),
                    motion: pir.motion(),
                    state: pir.state().as_str(),
                    display: pir.display(now_ms),
                    delay_seconds: pir.delay_s(),
                })
                .collect(),
            selected_sensor: self.settings.selected_sensor,
            motion_action: self.settings.motion_action.clone(),
            next_alarm,
            alarm_button,
            alarm_count: self.alarms.len(),
            devices: self
                .registry
                .iter()
                .map(|channel| DeviceView {
                    key: channel.key.clone(),
                    label: channel.button_label(),
                    on: channel.status,
                    locked: channel.is_locked(),
                })
                .collect(),
            device_status: self.device_status.clone(),
            switch_states: self.switch_states.clone(),
            timezone: timezone.to_string(),
        }
    }
}
