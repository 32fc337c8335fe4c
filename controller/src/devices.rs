use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tracing::{debug, info, warn};

use homectl_common::{
    ChannelAddress, CloudConfig, DeviceChannel, DeviceDescriptor, EngineAction,
    HomeEngine, ToggleStart,
};

#[derive(Debug, Error)]
pub enum DeviceApiError {
    #[error("request timed out")]
    Timeout,
    #[error("device {0} is unreachable")]
    Unreachable(String),
    #[error("credentials were rejected")]
    Auth,
    #[error("remote call failed: {0}")]
    Remote(String),
}

/// Remote smart-plug backend.
///
/// Channels are 0-based. Every call may fail or hang; callers bound them with a
/// timeout.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn validate_credentials(&self) -> Result<bool, DeviceApiError>;

    async fn discover(&self) -> Result<Vec<DeviceDescriptor>, DeviceApiError>;

    async fn turn_on(&self, device_id: &str, channel: u8) -> Result<(), DeviceApiError>;

    async fn turn_off(&self, device_id: &str, channel: u8) -> Result<(), DeviceApiError>;

    /// Live on/off status of one channel.
    async fn refresh_status(&self, device_id: &str, channel: u8) -> Result<bool, DeviceApiError>;
}

/// In-process backend serving the inventory listed in `cloud.devices`. All
/// channels start off.
pub struct SimulatedDeviceApi {
    email: String,
    password: String,
    devices: Vec<DeviceDescriptor>,
    states: StdMutex<HashMap<(String, u8), bool>>,
}

impl SimulatedDeviceApi {
    pub fn new(cloud: &CloudConfig) -> Self {
        Self {
            email: cloud.email.clone(),
            password: cloud.password.clone(),
            devices: cloud.devices.clone(),
            states: StdMutex::new(HashMap::new()),
        }
    }

    fn check_channel(&self, device_id: &str, channel: u8) -> Result<(), DeviceApiError> {
        let known = self
            .devices
            .iter()
            .any(|device| device.id == device_id && channel < device.channels.max(1));
        if known {
            Ok(())
        } else {
            Err(DeviceApiError::Unreachable(format!("{device_id}#{channel}")))
        }
    }

    fn set(&self, device_id: &str, channel: u8, on: bool) -> Result<(), DeviceApiError> {
        self.check_channel(device_id, channel)?;
        let mut states = self
            .states
            .lock()
            .map_err(|_| DeviceApiError::Remote("device state poisoned".to_string()))?;
        states.insert((device_id.to_string(), channel), on);
        Ok(())
    }
}

#[async_trait]
impl DeviceApi for SimulatedDeviceApi {
    async fn validate_credentials(&self) -> Result<bool, DeviceApiError> {
        Ok(!self.email.is_empty() && !self.password.is_empty())
    }

    async fn discover(&self) -> Result<Vec<DeviceDescriptor>, DeviceApiError> {
        if self.email.is_empty() {
            return Err(DeviceApiError::Auth);
        }
        Ok(self.devices.clone())
    }

    async fn turn_on(&self, device_id: &str, channel: u8) -> Result<(), DeviceApiError> {
        self.set(device_id, channel, true)
    }

    async fn turn_off(&self, device_id: &str, channel: u8) -> Result<(), DeviceApiError> {
        self.set(device_id, channel, false)
    }

    async fn refresh_status(&self, device_id: &str, channel: u8) -> Result<bool, DeviceApiError> {
        self.check_channel(device_id, channel)?;
        let states = self
            .states
            .lock()
            .map_err(|_| DeviceApiError::Remote("device state poisoned".to_string()))?;
        Ok(states
            .get(&(device_id.to_string(), channel))
            .copied()
            .unwrap_or(false))
    }
}

/// Lightweight reachability check: true as soon as any target accepts a TCP
/// connection within `timeout`. No targets means nothing to check.
pub async fn network_reachable(targets: &[String], timeout: Duration) -> bool {
    if targets.is_empty() {
        return true;
    }

    let mut checks = JoinSet::new();
    for target in targets {
        let target = target.clone();
        checks.spawn(async move {
            matches!(
                tokio::time::timeout(timeout, TcpStream::connect(target.as_str())).await,
                Ok(Ok(_))
            )
        });
    }

    while let Some(result) = checks.join_next().await {
        if matches!(result, Ok(true)) {
            checks.abort_all();
            return true;
        }
    }
    false
}

async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, DeviceApiError>
where
    F: Future<Output = Result<T, DeviceApiError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(DeviceApiError::Timeout))
}

async fn switch_remote(
    api: &dyn DeviceApi,
    address: &ChannelAddress,
    on: bool,
) -> Result<bool, DeviceApiError> {
    if on {
        api.turn_on(&address.device_id, address.channel).await?;
    } else {
        api.turn_off(&address.device_id, address.channel).await?;
    }
    api.refresh_status(&address.device_id, address.channel).await
}

/// Queue feeding the host's single action executor.
pub type ActionSink = mpsc::UnboundedSender<Vec<EngineAction>>;

/// Queues `actions` for execution. Callers hold the engine lock while emitting
/// so the queue follows the order in which the engine changed.
pub fn emit(sink: &ActionSink, actions: Vec<EngineAction>) {
    if actions.is_empty() {
        return;
    }
    if sink.send(actions).is_err() {
        warn!("action executor is gone; dropping actions");
    }
}

/// Drives one channel toggle end to end.
///
/// A request for a channel that is already mid-toggle is dropped. The remote
/// call runs in its own task so a timeout or a panic inside the backend still
/// reaches the release below. Whatever the backend reports, the channel ends at
/// the requested status.
pub async fn toggle_channel(
    engine: &Mutex<HomeEngine>,
    api: Arc<dyn DeviceApi>,
    key: &str,
    desired: Option<bool>,
    request_timeout: Duration,
    sink: &ActionSink,
) {
    let start = engine.lock().await.begin_toggle(key, desired);
    let (address, target) = match start {
        ToggleStart::Started { address, target } => (address, target),
        ToggleStart::UnknownKey => {
            warn!("toggle requested for unknown channel {key}");
            return;
        }
        ToggleStart::Busy => {
            info!("{key} is locked by another toggle; request dropped");
            return;
        }
        ToggleStart::Unchanged => {
            debug!("{key} already at requested status");
            return;
        }
    };

    let call_address = address.clone();
    let mut call =
        tokio::spawn(async move { switch_remote(api.as_ref(), &call_address, target).await });
    let outcome = match tokio::time::timeout(request_timeout, &mut call).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(DeviceApiError::Remote(join_err.to_string())),
        Err(_) => {
            call.abort();
            Err(DeviceApiError::Timeout)
        }
    };

    match outcome {
        Ok(live) if live == target => info!("{key} switched {}", on_off(target)),
        Ok(live) => warn!(
            "{key} reports {} after switching {}; keeping {}",
            on_off(live),
            on_off(target),
            on_off(target)
        ),
        Err(err) => warn!("{key} toggle failed: {err}; assuming {}", on_off(target)),
    }

    let mut engine = engine.lock().await;
    let actions = engine.finish_toggle(&address.key, target);
    emit(sink, actions);
}

/// Re-reads every unlocked channel and applies any out-of-band change. A read
/// that overlapped a toggle of the same channel is discarded.
pub async fn poll_channels(
    engine: &Mutex<HomeEngine>,
    api: &dyn DeviceApi,
    request_timeout: Duration,
    sink: &ActionSink,
) {
    let targets = engine.lock().await.poll_targets();
    for address in targets {
        match bounded(
            request_timeout,
            api.refresh_status(&address.device_id, address.channel),
        )
        .await
        {
            Ok(status) => {
                let mut engine = engine.lock().await;
                let actions = engine.apply_polled_status(&address, status);
                emit(sink, actions);
            }
            Err(err) => debug!("status poll for {} failed: {err}", address.key),
        }
    }
}

/// Validates credentials, then discovers devices with the configured retry
/// delays, registering every supported channel. Progress goes to `sink` as it
/// happens. Failures leave the registry empty and never return an error.
pub async fn initialize_devices(
    engine: &Mutex<HomeEngine>,
    api: &dyn DeviceApi,
    cloud: &CloudConfig,
    sink: &ActionSink,
) {
    let request_timeout = Duration::from_millis(cloud.request_timeout_ms);
    let reachability_timeout = Duration::from_millis(cloud.reachability_timeout_ms);

    report(engine, sink, "Validating credentials...").await;
    match bounded(request_timeout, api.validate_credentials()).await {
        Ok(true) => {}
        Ok(false) => {
            report(engine, sink, "Auth failed: invalid credentials").await;
            return;
        }
        Err(err) => {
            warn!("credential validation failed: {err}");
            report(engine, sink, "Auth failed: invalid credentials").await;
            return;
        }
    }

    report(engine, sink, "Checking network connectivity...").await;
    let attempts = cloud.retry_delays_s.len();
    for (index, delay_s) in cloud.retry_delays_s.iter().enumerate() {
        let attempt = index + 1;
        let delay = Duration::from_secs(*delay_s);

        if !network_reachable(&cloud.reachability_targets, reachability_timeout).await {
            let text = format!("Network check failed, retrying ({attempt}/{attempts})...");
            report(engine, sink, &text).await;
            tokio::time::sleep(delay).await;
            continue;
        }

        report(engine, sink, "Discovering devices...").await;
        let discovered = match bounded(request_timeout, api.discover()).await {
            Ok(devices) => devices,
            Err(DeviceApiError::Timeout) => {
                let text = format!("Device API timeout, retrying ({attempt}/{attempts})...");
                report(engine, sink, &text).await;
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }
            Err(err) => {
                warn!("device discovery failed: {err}");
                if attempt < attempts {
                    let text = format!("Device init failed: {err}");
                    report(engine, sink, &text).await;
                    tokio::time::sleep(delay).await;
                    continue;
                }
                break;
            }
        };

        for device in &discovered {
            info!(
                "found device: name={}, type={}, id={}",
                device.name, device.device_type, device.id
            );
        }

        let supported = supported_devices(discovered, cloud);
        if supported.is_empty() {
            let text = format!(
                "No compatible devices found. Supported types: {}",
                cloud.supported_types.join(", ")
            );
            report(engine, sink, &text).await;
            return;
        }

        let channels = build_channels(api, &supported, request_timeout).await;
        let text = format!("Found {} device(s)", supported.len());
        let mut engine = engine.lock().await;
        let mut actions = engine.set_device_status(&text);
        actions.extend(engine.install_channels(channels));
        emit(sink, actions);
        return;
    }

    report(engine, sink, "Device initialization failed").await;
}

async fn report(engine: &Mutex<HomeEngine>, sink: &ActionSink, text: &str) {
    let mut engine = engine.lock().await;
    let actions = engine.set_device_status(text);
    emit(sink, actions);
}

fn supported_devices(discovered: Vec<DeviceDescriptor>, cloud: &CloudConfig) -> Vec<DeviceDescriptor> {
    let mut seen = HashSet::new();
    discovered
        .into_iter()
        .filter(|device| cloud.supports(&device.device_type))
        .filter(|device| seen.insert(device.id.clone()))
        .collect()
}

/// One channel per outlet, seeded with its live status. Devices whose status
/// cannot be read in time are skipped.
async fn build_channels(
    api: &dyn DeviceApi,
    devices: &[DeviceDescriptor],
    request_timeout: Duration,
) -> Vec<DeviceChannel> {
    let mut channels = Vec::new();
    'devices: for device in devices {
        let mut device_channels = Vec::new();
        for channel in 0..device.channels.max(1) {
            match bounded(request_timeout, api.refresh_status(&device.id, channel)).await {
                Ok(status) => device_channels.push(DeviceChannel::new(device, channel, status)),
                Err(err) => {
                    warn!("skipping device {}: {err}", device.id);
                    continue 'devices;
                }
            }
        }
        channels.extend(device_channels);
    }
    channels
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use homectl_common::{ControllerConfig, PersistedSettings, UiEvent};
    use tokio::sync::{mpsc::UnboundedReceiver, Notify};

    use super::*;

    fn plug(id: &str, device_type: &str, channels: u8) -> DeviceDescriptor {
        DeviceDescriptor {
            id: id.to_string(),
            name: "Desk Strip".to_string(),
            device_type: device_type.to_string(),
            channels,
        }
    }

    /// Counts calls; can be told to fail, hang, report a fixed status, or park
    /// the next status read until released.
    #[derive(Default)]
    struct MockDeviceApi {
        devices: Vec<DeviceDescriptor>,
        credentials_ok: bool,
        switch_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
        fail_switch: bool,
        hang_switch: bool,
        reported: Option<bool>,
        switch_gate: Option<Arc<Notify>>,
        refresh_gate: StdMutex<Option<Arc<Notify>>>,
        live: StdMutex<HashMap<(String, u8), bool>>,
    }

    impl MockDeviceApi {
        fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
            Self {
                devices,
                credentials_ok: true,
                ..Self::default()
            }
        }

        fn set_live(&self, device_id: &str, channel: u8, on: bool) {
            self.live
                .lock()
                .unwrap()
                .insert((device_id.to_string(), channel), on);
        }

        fn live(&self, device_id: &str, channel: u8) -> bool {
            self.live
                .lock()
                .unwrap()
                .get(&(device_id.to_string(), channel))
                .copied()
                .unwrap_or(false)
        }

        fn calls(&self) -> usize {
            self.switch_calls.load(Ordering::SeqCst)
        }

        fn refreshes(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }

        async fn switch(&self, device_id: &str, channel: u8, on: bool) -> Result<(), DeviceApiError> {
            self.switch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.switch_gate {
                gate.notified().await;
            }
            if self.hang_switch {
                std::future::pending::<()>().await;
            }
            if self.fail_switch {
                return Err(DeviceApiError::Remote("relay stuck".to_string()));
            }
            self.set_live(device_id, channel, on);
            Ok(())
        }
    }

    #[async_trait]
    impl DeviceApi for MockDeviceApi {
        async fn validate_credentials(&self) -> Result<bool, DeviceApiError> {
            Ok(self.credentials_ok)
        }

        async fn discover(&self) -> Result<Vec<DeviceDescriptor>, DeviceApiError> {
            Ok(self.devices.clone())
        }

        async fn turn_on(&self, device_id: &str, channel: u8) -> Result<(), DeviceApiError> {
            self.switch(device_id, channel, true).await
        }

        async fn turn_off(&self, device_id: &str, channel: u8) -> Result<(), DeviceApiError> {
            self.switch(device_id, channel, false).await
        }

        async fn refresh_status(&self, device_id: &str, channel: u8) -> Result<bool, DeviceApiError> {
            let status = self.reported.unwrap_or_else(|| self.live(device_id, channel));
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.refresh_gate.lock().unwrap().take();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            Ok(status)
        }
    }

    fn engine_with_plug() -> Mutex<HomeEngine> {
        let (mut engine, _) = HomeEngine::new(
            ControllerConfig::default(),
            PersistedSettings::default(),
            vec!["Hall_Light_on:Mon 08:00:00".to_string()],
        );
        let device = plug("uuid-abcdef", "mss420f", 2);
        engine.install_channels(vec![
            DeviceChannel::new(&device, 0, false),
            DeviceChannel::new(&device, 1, false),
        ]);
        Mutex::new(engine)
    }

    fn empty_engine() -> Mutex<HomeEngine> {
        let (engine, _) = HomeEngine::new(
            ControllerConfig::default(),
            PersistedSettings::default(),
            vec!["Hall_Light_on:Mon 08:00:00".to_string()],
        );
        Mutex::new(engine)
    }

    fn status(engine: &HomeEngine, key: &str) -> (bool, bool) {
        let channel = engine.registry().get(key).unwrap();
        (channel.status, channel.is_locked())
    }

    fn drain(queue: &mut UnboundedReceiver<Vec<EngineAction>>) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        while let Ok(batch) = queue.try_recv() {
            actions.extend(batch);
        }
        actions
    }

    fn published(actions: &[EngineAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|action| match action {
                EngineAction::Publish { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn on_forms(channel: u16) -> Vec<String> {
        vec![
            format!("Device_abcdef_ch{channel}_on"),
            format!("Desk_Strip_ch{channel}_on"),
            format!("Desk_Strip_Outlet_{channel}:ON"),
        ]
    }

    const KEY: &str = "Device_abcdef_ch1";
    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn toggle_switches_and_publishes_all_forms() {
        let engine = engine_with_plug();
        let api = Arc::new(MockDeviceApi::with_devices(Vec::new()));
        let (sink, mut queue) = mpsc::unbounded_channel();

        toggle_channel(&engine, api.clone(), KEY, None, TIMEOUT, &sink).await;

        assert_eq!(api.calls(), 1);
        assert_eq!(status(&*engine.lock().await, KEY), (true, false));
        assert_eq!(published(&drain(&mut queue)), on_forms(1));
    }

    #[tokio::test]
    async fn second_request_while_locked_is_dropped() {
        let engine = Arc::new(engine_with_plug());
        let gate = Arc::new(Notify::new());
        let api = Arc::new(MockDeviceApi {
            switch_gate: Some(gate.clone()),
            ..MockDeviceApi::with_devices(Vec::new())
        });
        let (sink, mut queue) = mpsc::unbounded_channel();

        let first = {
            let engine = engine.clone();
            let api: Arc<dyn DeviceApi> = api.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                toggle_channel(&engine, api, KEY, None, Duration::from_secs(5), &sink).await
            })
        };
        while api.calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(status(&*engine.lock().await, KEY), (false, true));

        toggle_channel(&engine, api.clone(), KEY, Some(true), TIMEOUT, &sink).await;
        assert!(drain(&mut queue).is_empty());
        assert_eq!(api.calls(), 1);
        assert_eq!(status(&*engine.lock().await, KEY), (false, true));

        gate.notify_one();
        first.await.unwrap();
        assert_eq!(api.calls(), 1);
        assert_eq!(status(&*engine.lock().await, KEY), (true, false));
    }

    #[tokio::test]
    async fn poll_read_overtaken_by_a_toggle_is_discarded() {
        let engine = Arc::new(engine_with_plug());
        let gate = Arc::new(Notify::new());
        let api = Arc::new(MockDeviceApi {
            refresh_gate: StdMutex::new(Some(gate.clone())),
            ..MockDeviceApi::with_devices(Vec::new())
        });
        let (sink, mut queue) = mpsc::unbounded_channel();

        let poll = {
            let engine = engine.clone();
            let api = api.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                poll_channels(&engine, api.as_ref(), Duration::from_secs(5), &sink).await
            })
        };
        while api.refreshes() == 0 {
            tokio::task::yield_now().await;
        }

        toggle_channel(&engine, api.clone(), KEY, Some(true), TIMEOUT, &sink).await;
        gate.notify_one();
        poll.await.unwrap();

        assert!(api.live("uuid-abcdef", 0));
        assert_eq!(status(&*engine.lock().await, KEY), (true, false));
        assert_eq!(published(&drain(&mut queue)), on_forms(1));
    }

    #[tokio::test]
    async fn desired_status_already_held_makes_no_call() {
        let engine = engine_with_plug();
        let api = Arc::new(MockDeviceApi::with_devices(Vec::new()));
        let (sink, mut queue) = mpsc::unbounded_channel();

        toggle_channel(&engine, api.clone(), KEY, Some(false), TIMEOUT, &sink).await;

        assert!(drain(&mut queue).is_empty());
        assert_eq!(api.calls(), 0);
        assert_eq!(status(&*engine.lock().await, KEY), (false, false));
    }

    #[tokio::test]
    async fn failed_call_still_flips_and_releases() {
        let engine = engine_with_plug();
        let api = Arc::new(MockDeviceApi {
            fail_switch: true,
            ..MockDeviceApi::with_devices(Vec::new())
        });
        let (sink, mut queue) = mpsc::unbounded_channel();

        toggle_channel(&engine, api.clone(), KEY, Some(true), TIMEOUT, &sink).await;

        assert_eq!(published(&drain(&mut queue)).len(), 3);
        assert_eq!(status(&*engine.lock().await, KEY), (true, false));

        toggle_channel(&engine, api.clone(), KEY, None, TIMEOUT, &sink).await;
        assert_eq!(api.calls(), 2);
        assert_eq!(status(&*engine.lock().await, KEY), (false, false));
    }

    #[tokio::test]
    async fn hung_call_times_out_and_releases() {
        let engine = engine_with_plug();
        let api = Arc::new(MockDeviceApi {
            hang_switch: true,
            ..MockDeviceApi::with_devices(Vec::new())
        });
        let (sink, _queue) = mpsc::unbounded_channel();

        toggle_channel(&engine, api.clone(), KEY, Some(true), Duration::from_millis(20), &sink).await;

        assert_eq!(status(&*engine.lock().await, KEY), (true, false));
    }

    #[tokio::test]
    async fn disagreeing_live_status_keeps_requested_one() {
        let engine = engine_with_plug();
        let api = Arc::new(MockDeviceApi {
            reported: Some(false),
            ..MockDeviceApi::with_devices(Vec::new())
        });
        let (sink, _queue) = mpsc::unbounded_channel();

        toggle_channel(&engine, api.clone(), KEY, Some(true), TIMEOUT, &sink).await;

        assert_eq!(status(&*engine.lock().await, KEY), (true, false));
    }

    #[tokio::test]
    async fn unknown_key_is_a_no_op() {
        let engine = engine_with_plug();
        let api = Arc::new(MockDeviceApi::with_devices(Vec::new()));
        let (sink, mut queue) = mpsc::unbounded_channel();

        toggle_channel(&engine, api.clone(), "Plug_ch9", None, TIMEOUT, &sink).await;

        assert!(drain(&mut queue).is_empty());
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn poll_picks_up_out_of_band_changes() {
        let engine = engine_with_plug();
        let api = MockDeviceApi::with_devices(Vec::new());
        api.set_live("uuid-abcdef", 1, true);
        let (sink, mut queue) = mpsc::unbounded_channel();

        poll_channels(&engine, &api, TIMEOUT, &sink).await;

        assert_eq!(published(&drain(&mut queue)), on_forms(2));
        assert_eq!(status(&*engine.lock().await, "Device_abcdef_ch2"), (true, false));

        poll_channels(&engine, &api, TIMEOUT, &sink).await;
        assert!(drain(&mut queue).is_empty());
    }

    #[tokio::test]
    async fn initialization_registers_supported_devices_once() {
        let engine = empty_engine();
        let api = MockDeviceApi::with_devices(vec![
            plug("uuid-abcdef", "mss420f", 2),
            plug("uuid-abcdef", "mss420f", 2),
            plug("uuid-123456", "msh300", 1),
        ]);
        api.set_live("uuid-abcdef", 0, true);
        let cloud = CloudConfig {
            retry_delays_s: vec![0],
            reachability_targets: Vec::new(),
            ..CloudConfig::default()
        };
        let (sink, mut queue) = mpsc::unbounded_channel();

        initialize_devices(&engine, &api, &cloud, &sink).await;

        let engine = engine.lock().await;
        assert_eq!(engine.registry().len(), 2);
        assert_eq!(status(&engine, KEY), (true, false));
        assert_eq!(engine.device_status(), "Found 1 device(s)");
        assert!(published(&drain(&mut queue)).contains(&"Device_abcdef_ch2_off".to_string()));
    }

    #[tokio::test]
    async fn rejected_credentials_stop_initialization() {
        let engine = empty_engine();
        let api = MockDeviceApi {
            credentials_ok: false,
            ..MockDeviceApi::with_devices(vec![plug("uuid-abcdef", "mss420f", 1)])
        };
        let (sink, _queue) = mpsc::unbounded_channel();

        initialize_devices(&engine, &api, &CloudConfig::default(), &sink).await;

        let engine = engine.lock().await;
        assert!(engine.registry().is_empty());
        assert_eq!(engine.device_status(), "Auth failed: invalid credentials");
    }

    #[tokio::test]
    async fn unreachable_network_exhausts_retries() {
        let engine = empty_engine();
        let api = MockDeviceApi::with_devices(vec![plug("uuid-abcdef", "mss420f", 1)]);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = listener.local_addr().unwrap().to_string();
        drop(listener);
        let cloud = CloudConfig {
            retry_delays_s: vec![0, 0],
            reachability_targets: vec![closed],
            ..CloudConfig::default()
        };
        let (sink, mut queue) = mpsc::unbounded_channel();

        initialize_devices(&engine, &api, &cloud, &sink).await;

        let statuses: Vec<String> = drain(&mut queue)
            .into_iter()
            .filter_map(|action| match action {
                EngineAction::Notify(UiEvent::DeviceStatus { text }) => Some(text),
                _ => None,
            })
            .collect();
        assert!(engine.lock().await.registry().is_empty());
        assert_eq!(
            statuses.last().map(String::as_str),
            Some("Device initialization failed")
        );
        assert!(statuses.contains(&"Network check failed, retrying (2/2)...".to_string()));
    }

    #[tokio::test]
    async fn reachability_passes_when_any_target_answers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().to_string();
        let listener2 = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = listener2.local_addr().unwrap().to_string();
        drop(listener2);

        assert!(network_reachable(&[closed.clone(), open], Duration::from_millis(500)).await);
        assert!(!network_reachable(&[closed], Duration::from_millis(500)).await);
        assert!(network_reachable(&[], Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn simulated_backend_tracks_switches() {
        let cloud = CloudConfig {
            email: "me@example.com".to_string(),
            password: "secret".to_string(),
            devices: vec![plug("uuid-abcdef", "mss310", 1)],
            ..CloudConfig::default()
        };
        let api = SimulatedDeviceApi::new(&cloud);

        assert!(api.validate_credentials().await.unwrap());
        api.turn_on("uuid-abcdef", 0).await.unwrap();
        assert!(api.refresh_status("uuid-abcdef", 0).await.unwrap());
        assert!(matches!(
            api.turn_on("uuid-abcdef", 3).await,
            Err(DeviceApiError::Unreachable(_))
        ));
        assert!(!SimulatedDeviceApi::new(&CloudConfig::default())
            .validate_credentials()
            .await
            .unwrap());
    }
}
