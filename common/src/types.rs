use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Room {
    Bedroom,
    Sittingroom,
    Hall,
    Kitchen,
}

impl Room {
    pub const ALL: [Room; 4] = [Room::Bedroom, Room::Sittingroom, Room::Hall, Room::Kitchen];

    pub fn index(self) -> usize {
        match self {
            Self::Bedroom => 0,
            Self::Sittingroom => 1,
            Self::Hall => 2,
            Self::Kitchen => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bedroom => "Bedroom",
            Self::Sittingroom => "Sittingroom",
            Self::Hall => "Hall",
            Self::Kitchen => "Kitchen",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|room| room.as_str().eq_ignore_ascii_case(name))
    }

    /// Action base for this room's light, e.g. `Bedroom_Light`.
    pub fn light_identity(self) -> String {
        format!("{}_Light", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SensorId {
    #[serde(rename = "Bedroom PIR")]
    Bedroom,
    #[serde(rename = "Sittingroom PIR")]
    Sittingroom,
}

impl SensorId {
    pub const ALL: [SensorId; 2] = [SensorId::Bedroom, SensorId::Sittingroom];

    pub fn index(self) -> usize {
        match self {
            Self::Bedroom => 0,
            Self::Sittingroom => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Bedroom => "Bedroom PIR",
            Self::Sittingroom => "Sittingroom PIR",
        }
    }

    pub fn room(self) -> Room {
        match self {
            Self::Bedroom => Room::Bedroom,
            Self::Sittingroom => Room::Sittingroom,
        }
    }

    /// Name used by the delay sync messages (`Bedroom_delay = 5`, `Sr_delay = 5`).
    pub fn delay_name(self) -> &'static str {
        match self {
            Self::Bedroom => "Bedroom_delay",
            Self::Sittingroom => "Sr_delay",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().replace('_', " ");
        Self::ALL.into_iter().find(|sensor| {
            sensor.label().eq_ignore_ascii_case(&normalized)
                || sensor.room().as_str().eq_ignore_ascii_case(&normalized)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PirSwitch {
    Bedroom,
    Sittingroom,
    Any,
}

impl PirSwitch {
    pub const ALL: [PirSwitch; 3] = [PirSwitch::Bedroom, PirSwitch::Sittingroom, PirSwitch::Any];

    pub fn identity(self) -> &'static str {
        match self {
            Self::Bedroom => "Bedroom_PIR",
            Self::Sittingroom => "Sittingroom_PIR",
            Self::Any => "Any_PIR",
        }
    }

    pub fn from_identity(identity: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|switch| switch.identity().eq_ignore_ascii_case(identity))
    }

    pub fn sensor(self) -> Option<SensorId> {
        match self {
            Self::Bedroom => Some(SensorId::Bedroom),
            Self::Sittingroom => Some(SensorId::Sittingroom),
            Self::Any => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomLight {
    pub on: bool,
    pub bright: bool,
    pub previous_bright: bool,
}

impl RoomLight {
    pub fn new() -> Self {
        // Seeded opposite to `bright` so the first brightness report is displayed.
        Self {
            on: false,
            bright: false,
            previous_bright: true,
        }
    }
}

/// A remote smart-plug as reported by device discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default = "default_channel_count")]
    pub channels: u8,
}

fn default_channel_count() -> u8 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "seconds", rename_all = "lowercase")]
pub enum SensorDisplay {
    Waiting,
    Motion,
    Countdown(u64),
}

impl SensorDisplay {
    pub fn text(self) -> String {
        match self {
            Self::Waiting => "Waiting".to_string(),
            Self::Motion => "Motion".to_string(),
            Self::Countdown(remaining) => remaining.to_string(),
        }
    }
}

/// State changes pushed to whatever front-end is attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum UiEvent {
    Light {
        room: Room,
        on: bool,
    },
    Brightness {
        room: Room,
        bright: bool,
    },
    Pir {
        any: bool,
        bedroom: bool,
        sittingroom: bool,
        #[serde(rename = "bedroomConnected")]
        bedroom_connected: bool,
        #[serde(rename = "sittingroomConnected")]
        sittingroom_connected: bool,
    },
    Sensor {
        sensor: SensorId,
        display: SensorDisplay,
    },
    NextAlarm {
        text: String,
        button: String,
    },
    DeviceButton {
        key: String,
        label: String,
        color: &'static str,
    },
    DeviceStatus {
        text: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LightView {
    pub room: Room,
    pub on: bool,
    pub bright: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorView {
    pub sensor: SensorId,
    pub enabled: bool,
    pub connected: bool,
    pub motion: bool,
    pub state: &'static str,
    pub display: SensorDisplay,
    pub delay_seconds: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub key: String,
    pub label: String,
    pub on: bool,
    pub locked: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub lights: Vec<LightView>,
    pub any_pir: bool,
    pub sensors: Vec<SensorView>,
    pub selected_sensor: SensorId,
    pub motion_action: String,
    pub next_alarm: Option<String>,
    pub alarm_button: String,
    pub alarm_count: usize,
    pub devices: Vec<DeviceView>,
    pub device_status: String,
    /// Last reported state of every `<name>_is_<value>` switch seen on the bus.
    pub switch_states: BTreeMap<String, bool>,
    pub timezone: String,
}

/// Acknowledgement for a vendor `Appliance.Control.Bind` request.
#[derive(Debug, Clone, Serialize)]
pub struct BindAck {
    pub header: BindAckHeader,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindAckHeader {
    pub method: &'static str,
    pub namespace: &'static str,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub timestamp: i64,
}

impl BindAck {
    pub fn new(message_id: String, timestamp: i64) -> Self {
        Self {
            header: BindAckHeader {
                method: "SETACK",
                namespace: "Appliance.Control.Bind",
                message_id,
                timestamp,
            },
            payload: serde_json::Map::new(),
        }
    }
}
