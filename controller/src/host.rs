use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use homectl_common::{
    CloudConfig, DayOfWeek, EngineAction, HomeEngine, LogLevel, PirSwitch,
    Room, RuntimeConfig, SensorId, UiEvent, TOPIC_APPLIANCE_FILTER, TOPIC_PLUG_STATUS,
    TOPIC_PREFIX_FILTER,
};

use crate::{
    bus::{self, BusPublisher},
    devices::{self, ActionSink, DeviceApi, SimulatedDeviceApi},
    store::AppStore,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 4096;

type ToggleRequest = (String, Option<bool>);

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<HomeEngine>>,
    bus: BusPublisher,
    store: AppStore,
    api: Arc<dyn DeviceApi>,
    cloud: Arc<CloudConfig>,
    timezone: Arc<str>,
    toggles: mpsc::UnboundedSender<ToggleRequest>,
    actions: ActionSink,
    ui: broadcast::Sender<UiEvent>,
}

impl AppState {
    /// Applies `change` and queues its actions before the engine lock is released.
    async fn update(&self, change: impl FnOnce(&mut HomeEngine) -> Vec<EngineAction>) {
        let mut engine = self.engine.lock().await;
        let actions = change(&mut engine);
        devices::emit(&self.actions, actions);
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct AlarmsView {
    alarms: Vec<String>,
    #[serde(rename = "nextAlarm")]
    next_alarm: Option<String>,
    #[serde(rename = "alarmButton")]
    alarm_button: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::from_env();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.cloud.reachability_targets = runtime.reachability_targets();
    runtime.settings.sanitize();
    runtime.cloud.sanitize();
    if runtime.timezone.parse::<Tz>().is_err() {
        warn!("unknown timezone {:?}; using UTC", runtime.timezone);
        runtime.timezone = "UTC".to_string();
    }

    let stored_alarms = match store.load_alarms().await {
        Ok(alarms) => alarms.unwrap_or_default(),
        Err(err) => {
            warn!("failed to load alarms from store: {err:#}");
            Vec::new()
        }
    };
    let (engine, startup_actions) = HomeEngine::new(
        runtime.controller.clone(),
        runtime.settings.clone(),
        stored_alarms,
    );

    let origin_id = bus::origin_id(&runtime.network);
    let mut mqtt_options = MqttOptions::new(
        bus::mqtt_client_id(&origin_id),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    info!(
        "bus origin {origin_id}, broker {}:{}",
        runtime.network.mqtt_host, runtime.network.mqtt_port
    );

    let (toggles, toggle_requests) = mpsc::unbounded_channel();
    let (actions, action_queue) = mpsc::unbounded_channel();
    let (ui, _) = broadcast::channel(64);
    let api: Arc<dyn DeviceApi> = Arc::new(SimulatedDeviceApi::new(&runtime.cloud));

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        bus: BusPublisher::new(mqtt, &origin_id, runtime.controller.message_debounce_ms),
        store,
        api,
        cloud: Arc::new(runtime.cloud.clone()),
        timezone: Arc::from(runtime.timezone.as_str()),
        toggles,
        actions,
        ui,
    };

    spawn_ui_log(&app_state);
    devices::emit(&app_state.actions, startup_actions);
    let executor = tokio::spawn(execute_queued(app_state.clone(), action_queue));
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_toggle_worker(app_state.clone(), toggle_requests);
    spawn_control_loop(app_state.clone());
    spawn_device_init(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/lights/{room}/toggle", post(handle_toggle_light))
        .route("/api/pir/{switch}/toggle", post(handle_toggle_pir))
        .route("/api/delay", post(handle_set_delay))
        .route("/api/motion/action", post(handle_set_motion_action))
        .route("/api/motion/sensor", post(handle_select_sensor))
        .route("/api/alarms", get(handle_get_alarms).post(handle_add_alarm))
        .route("/api/alarms/next", post(handle_next_alarm))
        .route("/api/devices/{key}/toggle", post(handle_toggle_device))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state.clone());

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown(&app_state, executor).await;
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        runtime.network.mqtt_pass = pass;
    }
    if let Ok(email) = std::env::var("CLOUD_EMAIL") {
        runtime.cloud.email = email;
    }
    if let Ok(password) = std::env::var("CLOUD_PASSWORD") {
        runtime.cloud.password = password;
    }
    if let Ok(api_url) = std::env::var("CLOUD_API_URL") {
        runtime.cloud.api_url = api_url;
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

/// Stops the executor so nothing queued can land after the final flush, then
/// writes the engine's current alarms and settings.
async fn shutdown(state: &AppState, executor: JoinHandle<()>) {
    executor.abort();
    let _ = executor.await;

    let (alarms, settings) = {
        let engine = state.engine.lock().await;
        (engine.alarms().entries(), engine.settings().clone())
    };
    if let Err(err) = state.store.save_alarms(&alarms).await {
        warn!("failed to flush alarms: {err:#}");
    }
    if let Err(err) = state.store.update_settings(settings).await {
        warn!("failed to flush settings: {err:#}");
    }
    if let Err(err) = state.bus.client().disconnect().await {
        warn!("mqtt disconnect failed: {err}");
    }
}

fn subscribe_topics(mqtt: &AsyncClient) {
    for topic in [TOPIC_PREFIX_FILTER, TOPIC_PLUG_STATUS, TOPIC_APPLIANCE_FILTER] {
        if let Err(err) = mqtt.try_subscribe(topic, QoS::AtLeastOnce) {
            warn!("subscribe to {topic} failed: {err}");
        }
    }
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        let mut connected = false;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    connected = true;
                    subscribe_topics(app_state.bus.client());
                    app_state
                        .update(|engine| engine.set_bus_connected(true))
                        .await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    if connected {
                        connected = false;
                        app_state
                            .update(|engine| engine.set_bus_connected(false))
                            .await;
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let origin_id = app_state.bus.origin_id();
    app_state
        .update(|engine| {
            engine.handle_bus_message(&topic, &message, origin_id, monotonic_ms())
        })
        .await;
    Ok(())
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();
            let wall = wall_clock(&app_state.timezone);
            app_state.update(|engine| engine.tick(now_ms, wall)).await;
        }
    });
}

fn spawn_toggle_worker(
    app_state: AppState,
    mut requests: mpsc::UnboundedReceiver<ToggleRequest>,
) {
    tokio::spawn(async move {
        while let Some((key, desired)) = requests.recv().await {
            let app_state = app_state.clone();
            tokio::spawn(async move {
                let timeout = Duration::from_millis(app_state.cloud.request_timeout_ms);
                devices::toggle_channel(
                    &app_state.engine,
                    app_state.api.clone(),
                    &key,
                    desired,
                    timeout,
                    &app_state.actions,
                )
                .await;
            });
        }
    });
}

fn spawn_device_init(app_state: AppState) {
    tokio::spawn(async move {
        devices::initialize_devices(
            &app_state.engine,
            app_state.api.as_ref(),
            &app_state.cloud,
            &app_state.actions,
        )
        .await;

        let cloud = app_state.cloud.clone();
        let timeout = Duration::from_millis(cloud.request_timeout_ms);
        let reachability_timeout = Duration::from_millis(cloud.reachability_timeout_ms);
        let mut interval = tokio::time::interval(Duration::from_millis(cloud.poll_interval_ms));
        loop {
            interval.tick().await;
            if app_state.engine.lock().await.registry().is_empty() {
                continue;
            }
            if !devices::network_reachable(&cloud.reachability_targets, reachability_timeout).await {
                debug!("network unreachable; skipping device poll");
                continue;
            }
            devices::poll_channels(
                &app_state.engine,
                app_state.api.as_ref(),
                timeout,
                &app_state.actions,
            )
            .await;
        }
    });
}

fn spawn_ui_log(app_state: &AppState) {
    let mut events = app_state.ui.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!("ui event: {event:?}"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("ui log skipped {skipped} events")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// The only place actions run. Batches execute one at a time in the order the
/// engine produced them.
async fn execute_queued(
    app_state: AppState,
    mut queue: mpsc::UnboundedReceiver<Vec<EngineAction>>,
) {
    while let Some(actions) = queue.recv().await {
        execute_actions(&app_state, actions).await;
    }
}

async fn execute_actions(app_state: &AppState, actions: Vec<EngineAction>) {
    for action in actions {
        match action {
            EngineAction::Publish { topic, message } => {
                if let Err(err) = app_state.bus.publish(&topic, &message, monotonic_ms()).await {
                    warn!("publish to {topic} failed: {err:#}");
                }
            }
            EngineAction::AckBind { topic, message_id } => {
                if let Err(err) = app_state.bus.ack_bind(&topic, &message_id).await {
                    warn!("bind acknowledgement on {topic} failed: {err:#}");
                }
            }
            EngineAction::ToggleChannel { key, desired } => {
                if app_state.toggles.send((key, desired)).is_err() {
                    warn!("toggle worker is gone");
                }
            }
            EngineAction::SaveAlarms(alarms) => {
                if let Err(err) = app_state.store.save_alarms(&alarms).await {
                    warn!("failed to save alarms: {err:#}");
                }
            }
            EngineAction::SaveSettings(settings) => {
                if let Err(err) = app_state.store.update_settings(settings).await {
                    warn!("failed to persist settings: {err:#}");
                }
            }
            EngineAction::Notify(event) => {
                // No receivers only means nothing is attached.
                let _ = app_state.ui.send(event);
            }
            EngineAction::Log { level, message } => match level {
                LogLevel::Debug => debug!("{message}"),
                LogLevel::Info => info!("{message}"),
                LogLevel::Warn => warn!("{message}"),
            },
        }
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let now_ms = monotonic_ms();
    let wall = wall_clock(&state.timezone);
    let status = {
        let engine = state.engine.lock().await;
        engine.status(now_ms, wall, &state.timezone)
    };
    Json(status)
}

async fn handle_toggle_light(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> impl IntoResponse {
    let Some(room) = Room::from_name(&room) else {
        return error_response(StatusCode::NOT_FOUND, "Unknown room");
    };

    state.update(|engine| engine.press_light_button(room, monotonic_ms())).await;
    handle_get_status(State(state)).await.into_response()
}

fn parse_pir_switch(name: &str) -> Option<PirSwitch> {
    PirSwitch::from_identity(name)
        .or_else(|| PirSwitch::from_identity(&format!("{name}_PIR")))
        .or_else(|| {
            SensorId::from_label(name).map(|sensor| match sensor {
                SensorId::Bedroom => PirSwitch::Bedroom,
                SensorId::Sittingroom => PirSwitch::Sittingroom,
            })
        })
}

async fn handle_toggle_pir(
    State(state): State<AppState>,
    Path(switch): Path<String>,
) -> impl IntoResponse {
    let Some(switch) = parse_pir_switch(&switch) else {
        return error_response(StatusCode::NOT_FOUND, "Unknown PIR switch");
    };

    state.update(|engine| engine.toggle_pir(switch)).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_delay(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(sensor) = params.get("sensor").and_then(|value| SensorId::from_label(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or unknown 'sensor' parameter");
    };
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };

    let result = {
        let mut engine = state.engine.lock().await;
        engine
            .set_delay(sensor, value, monotonic_ms())
            .map(|actions| devices::emit(&state.actions, actions))
    };
    match result {
        Ok(()) => handle_get_status(State(state)).await.into_response(),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn handle_set_motion_action(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };

    state.update(|engine| engine.set_motion_action(value)).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_select_sensor(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(sensor) = params.get("value").and_then(|value| SensorId::from_label(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or unknown 'value' parameter");
    };

    state.update(|engine| engine.select_sensor(sensor)).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_alarms(State(state): State<AppState>) -> impl IntoResponse {
    let wall = wall_clock(&state.timezone);
    let engine = state.engine.lock().await;
    let (next_alarm, alarm_button) = engine.next_alarm(wall);
    Json(AlarmsView {
        alarms: engine.alarms().entries(),
        next_alarm,
        alarm_button,
    })
}

async fn handle_add_alarm(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let (Some(action), Some(day), Some(time)) =
        (params.get("action"), params.get("day"), params.get("time"))
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Expected 'action', 'day' and 'time' parameters",
        );
    };
    let Ok(day) = day.parse::<DayOfWeek>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid day value");
    };

    let result = {
        let mut engine = state.engine.lock().await;
        engine
            .add_alarm(action, day, time)
            .map(|actions| devices::emit(&state.actions, actions))
    };
    match result {
        Ok(()) => handle_get_alarms(State(state)).await.into_response(),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn handle_next_alarm(State(state): State<AppState>) -> impl IntoResponse {
    let wall = wall_clock(&state.timezone);
    state.update(|engine| engine.cycle_next_alarm(wall)).await;
    handle_get_alarms(State(state)).await.into_response()
}

async fn handle_toggle_device(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    {
        let mut engine = state.engine.lock().await;
        if engine.registry().get(&key).is_none() {
            return error_response(StatusCode::NOT_FOUND, "Unknown device channel");
        }
        let actions = engine.press_device_button(&key, monotonic_ms());
        devices::emit(&state.actions, actions);
    }
    handle_get_status(State(state)).await.into_response()
}

fn now_in_timezone(timezone: &str) -> Option<DateTime<FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

fn wall_clock(timezone: &str) -> DateTime<FixedOffset> {
    now_in_timezone(timezone).unwrap_or_else(|| Utc::now().fixed_offset())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use homectl_common::{ControllerConfig, PersistedSettings};
    use rumqttc::EventLoop;

    use super::*;

    fn test_state(data_dir: &std::path::Path) -> (AppState, EventLoop) {
        let (mqtt, eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 16);
        let (engine, _) = HomeEngine::new(
            ControllerConfig::default(),
            PersistedSettings::default(),
            Vec::new(),
        );
        let cloud = CloudConfig::default();
        let (toggles, _) = mpsc::unbounded_channel();
        let (actions, _) = mpsc::unbounded_channel();
        let (ui, _) = broadcast::channel(8);
        let state = AppState {
            engine: Arc::new(Mutex::new(engine)),
            bus: BusPublisher::new(mqtt, "test", 1_000),
            store: AppStore::new(data_dir),
            api: Arc::new(SimulatedDeviceApi::new(&cloud)),
            cloud: Arc::new(cloud),
            timezone: Arc::from("UTC"),
            toggles,
            actions,
            ui,
        };
        (state, eventloop)
    }

    #[tokio::test]
    async fn queued_saves_land_in_emission_order() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _eventloop) = test_state(dir.path());
        let (sink, queue) = mpsc::unbounded_channel();

        let hall = "Hall_Light_on:Mon 08:00:00".to_string();
        let bedroom = "Bedroom_Light_off:Tue 22:00:00".to_string();
        let mut early = PersistedSettings::default();
        early.bedroom_delay_s = 10;
        let mut late = PersistedSettings::default();
        late.bedroom_delay_s = 20;

        devices::emit(&sink, vec![EngineAction::SaveAlarms(vec![hall.clone()])]);
        devices::emit(&sink, vec![EngineAction::SaveSettings(early)]);
        devices::emit(
            &sink,
            vec![
                EngineAction::SaveAlarms(vec![hall.clone(), bedroom.clone()]),
                EngineAction::SaveSettings(late.clone()),
            ],
        );
        drop(sink);
        execute_queued(state.clone(), queue).await;

        assert_eq!(
            state.store.load_alarms().await.unwrap(),
            Some(vec![bedroom, hall])
        );
        assert_eq!(state.store.load_runtime_config().await.unwrap().settings, late);
    }

    #[tokio::test]
    async fn engine_updates_are_queued_in_lock_order() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, _eventloop) = test_state(dir.path());
        let (sink, mut queue) = mpsc::unbounded_channel();
        state.actions = sink;

        state.update(|engine| engine.set_device_status("Discovering devices...")).await;
        state.update(|engine| engine.set_device_status("Found 1 device(s)")).await;
        state.update(|engine| engine.set_device_status("Found 1 device(s)")).await;

        let statuses: Vec<String> = std::iter::from_fn(|| queue.try_recv().ok())
            .flatten()
            .filter_map(|action| match action {
                EngineAction::Notify(UiEvent::DeviceStatus { text }) => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec!["Discovering devices...", "Found 1 device(s)"]);
    }

    #[test]
    fn pir_switch_accepts_identities_and_room_names() {
        assert_eq!(parse_pir_switch("Any_PIR"), Some(PirSwitch::Any));
        assert_eq!(parse_pir_switch("any"), Some(PirSwitch::Any));
        assert_eq!(parse_pir_switch("Sittingroom"), Some(PirSwitch::Sittingroom));
        assert_eq!(parse_pir_switch("Bedroom PIR"), Some(PirSwitch::Bedroom));
        assert_eq!(parse_pir_switch("Garage"), None);
    }

    #[test]
    fn wall_clock_follows_configured_zone() {
        let tokyo = wall_clock("Asia/Tokyo");
        assert_eq!(tokyo.offset().local_minus_utc(), 9 * 3600);
        assert_eq!(wall_clock("Not/AZone").offset().local_minus_utc(), 0);
    }
}
