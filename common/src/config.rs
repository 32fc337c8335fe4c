use serde::{Deserialize, Serialize};

use crate::types::{DeviceDescriptor, SensorId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub message_debounce_ms: u64,
    pub button_debounce_ms: u64,
    pub brightness_off_delay_ms: u64,
    pub default_alarms: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            message_debounce_ms: 1_000,
            button_debounce_ms: 1_000,
            brightness_off_delay_ms: 3_000,
            default_alarms: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistedSettings {
    pub bedroom_delay_s: u32,
    pub sittingroom_delay_s: u32,
    pub motion_action: String,
    pub selected_sensor: SensorId,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            bedroom_delay_s: 100,
            sittingroom_delay_s: 100,
            motion_action: String::new(),
            selected_sensor: SensorId::Bedroom,
        }
    }
}

impl PersistedSettings {
    pub const MAX_DELAY_S: u32 = 86_400;

    pub fn sanitize(&mut self) {
        self.bedroom_delay_s = self.bedroom_delay_s.min(Self::MAX_DELAY_S);
        self.sittingroom_delay_s = self.sittingroom_delay_s.min(Self::MAX_DELAY_S);
        self.motion_action = self.motion_action.trim().to_string();
    }

    pub fn delay_for(&self, sensor: SensorId) -> u32 {
        match sensor {
            SensorId::Bedroom => self.bedroom_delay_s,
            SensorId::Sittingroom => self.sittingroom_delay_s,
        }
    }

    pub fn set_delay(&mut self, sensor: SensorId, seconds: u32) {
        match sensor {
            SensorId::Bedroom => self.bedroom_delay_s = seconds,
            SensorId::Sittingroom => self.sittingroom_delay_s = seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub client_id: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "192.168.10.21".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            client_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub email: String,
    pub password: String,
    pub api_url: String,
    pub request_timeout_ms: u64,
    pub retry_delays_s: Vec<u64>,
    pub poll_interval_ms: u64,
    pub reachability_timeout_ms: u64,
    pub reachability_targets: Vec<String>,
    pub supported_types: Vec<String>,
    pub devices: Vec<DeviceDescriptor>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            password: String::new(),
            api_url: "https://iotx-eu.meross.com".to_string(),
            request_timeout_ms: 10_000,
            retry_delays_s: vec![1, 2, 4],
            poll_interval_ms: 10_000,
            reachability_timeout_ms: 5_000,
            reachability_targets: vec!["iotx-eu.meross.com:443".to_string()],
            supported_types: ["mss420f", "mss305", "mss310", "msl120"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            devices: Vec::new(),
        }
    }
}

impl CloudConfig {
    pub fn sanitize(&mut self) {
        if self.retry_delays_s.is_empty() {
            self.retry_delays_s = vec![1, 2, 4];
        }
        self.request_timeout_ms = self.request_timeout_ms.clamp(500, 120_000);
        self.reachability_timeout_ms = self.reachability_timeout_ms.clamp(100, 60_000);
        self.poll_interval_ms = self.poll_interval_ms.max(1_000);
    }

    pub fn supports(&self, device_type: &str) -> bool {
        self.supported_types
            .iter()
            .any(|supported| supported.eq_ignore_ascii_case(device_type))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub settings: PersistedSettings,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
}

impl RuntimeConfig {
    /// Hosts dialled by the network check: the configured targets plus the bus
    /// broker, so a LAN-only outage is noticed too.
    pub fn reachability_targets(&self) -> Vec<String> {
        let mut targets = self.cloud.reachability_targets.clone();
        if !self.network.mqtt_host.trim().is_empty() {
            let broker = format!("{}:{}", self.network.mqtt_host, self.network.mqtt_port);
            if !targets.contains(&broker) {
                targets.push(broker);
            }
        }
        targets
    }
}

fn default_timezone() -> String {
    "Europe/London".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            settings: PersistedSettings::default(),
            timezone: default_timezone(),
            network: NetworkConfig::default(),
            cloud: CloudConfig::default(),
        }
    }
}
