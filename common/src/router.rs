use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    action::Action,
    topics::{
        TOPIC_APPLIANCE_PREFIX, TOPIC_BEDROOM_DELAY, TOPIC_PLUG_STATUS, TOPIC_PREFIX,
        TOPIC_SITTINGROOM_DELAY,
    },
    types::{PirSwitch, Room, SensorId},
};

const ADD_ALARM_PREFIX: &str = "Add_Alarm:";
const MOTION_ACTION_NAME: &str = "Motion_Action";
const BIND_NAMESPACE: &str = "Appliance.Control.Bind";

/// Messages on foreign topics are only accepted when they start with one of these.
const ROUTED_PREFIXES: [&str; 7] = [
    "Sittingroom_PIR_",
    "Bedroom_PIR_",
    "Any_PIR_",
    "Motion_Action_",
    "Bedroom_delay_",
    "Sr_delay_",
    ADD_ALARM_PREFIX,
];

/// Wire form of every controller publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub client_id: String,
    pub message: String,
}

impl Envelope {
    pub fn new(client_id: &str, message: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            message: message.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Our own publish, retained or echoed back by the broker.
    Own,
    Message(String),
}

/// Unwraps an inbound payload. JSON objects carry `client_id`/`message`; objects
/// without a `message` and anything that is not a JSON object are taken verbatim.
pub fn decode_payload(payload: &str, own_id: &str) -> Inbound {
    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(payload) else {
        return Inbound::Message(payload.to_string());
    };

    if object.get("client_id").and_then(Value::as_str) == Some(own_id) {
        return Inbound::Own;
    }

    match object.get("message") {
        Some(Value::String(message)) => Inbound::Message(message.clone()),
        Some(other) => Inbound::Message(other.to_string()),
        None => Inbound::Message(payload.to_string()),
    }
}

/// Spaces become underscores before any matching.
pub fn normalize(message: &str) -> String {
    message.replace(' ', "_")
}

/// A classified bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCommand {
    BindRequest { message_id: String },
    Motion { sensor: SensorId, motion: bool },
    Brightness { room: Room, bright: bool },
    LightState { room: Room, on: bool },
    /// `<name>_is_<value>` for anything that is not a room.
    SwitchState { name: String, on: bool },
    Delay { sensor: SensorId, value: String },
    PirEnable { switch: PirSwitch, on: bool },
    MotionAction(String),
    AddAlarm(String),
    Outlet { base_name: String, outlet: u16, on: bool },
    Execute(Action),
    Unhandled,
}

impl BusCommand {
    /// Whether the inbound message debounce applies.
    pub fn is_debounced(&self) -> bool {
        !matches!(self, Self::BindRequest { .. } | Self::Unhandled)
    }
}

fn is_routed_topic(topic: &str) -> bool {
    [
        TOPIC_PREFIX,
        TOPIC_PLUG_STATUS,
        TOPIC_BEDROOM_DELAY,
        TOPIC_SITTINGROOM_DELAY,
    ]
    .contains(&topic)
}

/// Classifies an unwrapped message received on `topic`.
pub fn classify(topic: &str, message: &str) -> BusCommand {
    if topic.starts_with(TOPIC_APPLIANCE_PREFIX) {
        return if message.contains(BIND_NAMESPACE) {
            bind_message_id(message)
                .map(|message_id| BusCommand::BindRequest { message_id })
                .unwrap_or(BusCommand::Unhandled)
        } else {
            BusCommand::Unhandled
        };
    }

    let normalized = normalize(message.trim());
    let accepted = is_routed_topic(topic)
        || ROUTED_PREFIXES
            .iter()
            .any(|prefix| normalized.starts_with(prefix));
    if !accepted {
        return BusCommand::Unhandled;
    }

    classify_normalized(&normalized, message.trim())
}

fn bind_message_id(message: &str) -> Option<String> {
    let value: Value = serde_json::from_str(message).ok()?;
    value
        .get("header")?
        .get("messageId")?
        .as_str()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Text after `<name>_=` or `<name> =`, without padding.
fn assignment<'a>(normalized: &'a str, name: &str) -> Option<&'a str> {
    let rest = normalized.strip_prefix(name)?;
    let value = rest.strip_prefix("_=").or_else(|| rest.strip_prefix('='))?;
    Some(value.trim_matches(|c: char| c == '_' || c.is_whitespace()))
}

fn classify_normalized(normalized: &str, raw: &str) -> BusCommand {
    for sensor in SensorId::ALL {
        let prefix = format!("{}_Motion_is_", sensor.room().as_str());
        match normalized.strip_prefix(&prefix) {
            Some("1") => return BusCommand::Motion { sensor, motion: true },
            Some("0") => return BusCommand::Motion { sensor, motion: false },
            _ => {}
        }
    }

    for room in Room::ALL {
        let prefix = format!("{}_light_is_", room.as_str());
        match normalized.strip_prefix(&prefix) {
            Some("True") => return BusCommand::Brightness { room, bright: true },
            Some("False") => return BusCommand::Brightness { room, bright: false },
            _ => {}
        }
    }

    for sensor in SensorId::ALL {
        if let Some(value) = assignment(normalized, sensor.delay_name()) {
            return BusCommand::Delay {
                sensor,
                value: value.to_string(),
            };
        }
    }

    for switch in PirSwitch::ALL {
        if let Some(value) = assignment(normalized, switch.identity()) {
            return BusCommand::PirEnable {
                switch,
                on: value.eq_ignore_ascii_case("true"),
            };
        }
    }

    if normalized.starts_with(ADD_ALARM_PREFIX) {
        // Normalising never changes byte offsets, so the raw text can be sliced too.
        let alarm = raw.get(ADD_ALARM_PREFIX.len()..).unwrap_or_default().trim();
        return BusCommand::AddAlarm(alarm.to_string());
    }

    if assignment(normalized, MOTION_ACTION_NAME).is_some() {
        let value = raw
            .split_once('=')
            .map(|(_, value)| value.trim_matches(|c: char| c == '_' || c.is_whitespace()))
            .unwrap_or_default();
        return BusCommand::MotionAction(value.to_string());
    }

    if let Some(command) = switch_state(normalized) {
        return command;
    }

    if normalized.contains(':') && normalized.contains("Outlet") {
        return outlet(normalized).unwrap_or(BusCommand::Unhandled);
    }

    match Action::parse(normalized) {
        Action::Unknown(_) => BusCommand::Unhandled,
        action => BusCommand::Execute(action),
    }
}

fn switch_state(normalized: &str) -> Option<BusCommand> {
    let (name, value) = normalized.rsplit_once("_is_")?;
    if name.is_empty() {
        return None;
    }
    let on = match value.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => true,
        "off" | "0" | "false" => false,
        _ => return None,
    };

    Some(match Room::ALL.into_iter().find(|room| room.as_str() == name) {
        Some(room) => BusCommand::LightState { room, on },
        None => BusCommand::SwitchState {
            name: name.to_string(),
            on,
        },
    })
}

fn outlet(normalized: &str) -> Option<BusCommand> {
    let (device, status) = normalized.split_once(':')?;
    let (base_name, outlet) = device.split_once("_Outlet_")?;
    Some(BusCommand::Outlet {
        base_name: base_name.to_string(),
        outlet: outlet.trim().parse().ok()?,
        on: status.trim().eq_ignore_ascii_case("on"),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn own_publishes_are_dropped() {
        let own = Envelope::new("abc", "Bedroom_is_on").to_json();
        assert_eq!(decode_payload(&own, "abc"), Inbound::Own);
        assert_eq!(
            decode_payload(&own, "other"),
            Inbound::Message("Bedroom_is_on".to_string())
        );
    }

    #[test]
    fn raw_and_non_object_payloads_pass_through() {
        assert_eq!(
            decode_payload("Bedroom_Motion_is_1", "abc"),
            Inbound::Message("Bedroom_Motion_is_1".to_string())
        );
        assert_eq!(decode_payload("42", "abc"), Inbound::Message("42".to_string()));
        let bind = r#"{"header":{"messageId":"m1"}}"#;
        assert_eq!(decode_payload(bind, "abc"), Inbound::Message(bind.to_string()));
    }

    #[test]
    fn classifies_sensor_vocabulary() {
        assert_eq!(
            classify("frog", "Bedroom_Motion_is_1"),
            BusCommand::Motion {
                sensor: SensorId::Bedroom,
                motion: true
            }
        );
        assert_eq!(
            classify("frog", "Kitchen_light_is_True"),
            BusCommand::Brightness {
                room: Room::Kitchen,
                bright: true
            }
        );
        assert_eq!(
            classify("frog", "Hall_is_False"),
            BusCommand::LightState {
                room: Room::Hall,
                on: false
            }
        );
        assert_eq!(
            classify("frog", "Porch_is_1"),
            BusCommand::SwitchState {
                name: "Porch".to_string(),
                on: true
            }
        );
    }

    #[test]
    fn classifies_settings_sync() {
        assert_eq!(
            classify("frog/Sr_delay", "Sr_delay = 30"),
            BusCommand::Delay {
                sensor: SensorId::Sittingroom,
                value: "30".to_string()
            }
        );
        assert_eq!(
            classify("frog", "Any_PIR = False"),
            BusCommand::PirEnable {
                switch: PirSwitch::Any,
                on: false
            }
        );
        assert_eq!(
            classify("frog", "Motion_Action = Bedroom_Light on"),
            BusCommand::MotionAction("Bedroom_Light on".to_string())
        );
        assert_eq!(
            classify("frog", "Add_Alarm:Desk Strip Ch1 on:Mon 07:00:00"),
            BusCommand::AddAlarm("Desk Strip Ch1 on:Mon 07:00:00".to_string())
        );
    }

    #[test]
    fn foreign_topics_need_a_known_prefix() {
        assert_eq!(
            classify("home/other", "Bedroom_PIR = True"),
            BusCommand::PirEnable {
                switch: PirSwitch::Bedroom,
                on: true
            }
        );
        assert_eq!(classify("home/other", "Bedroom_Motion_is_1"), BusCommand::Unhandled);
    }

    #[test]
    fn classifies_device_forms() {
        assert_eq!(
            classify("meross/plugs/status", "Desk_Strip_Outlet_2:OFF"),
            BusCommand::Outlet {
                base_name: "Desk_Strip".to_string(),
                outlet: 2,
                on: false
            }
        );
        assert_eq!(
            classify("frog", "Device_abcdef_ch1_on"),
            BusCommand::Execute(Action::ChannelToggle {
                target: "Device_abcdef_ch1".to_string(),
                on: true
            })
        );
        assert_eq!(classify("frog", "hello"), BusCommand::Unhandled);
    }

    #[test]
    fn bind_requests_need_a_message_id() {
        let request = r#"{"header":{"namespace":"Appliance.Control.Bind","messageId":"m1"}}"#;
        assert_eq!(
            classify("/appliance/abc/publish", request),
            BusCommand::BindRequest {
                message_id: "m1".to_string()
            }
        );

        let anonymous = r#"{"header":{"namespace":"Appliance.Control.Bind"}}"#;
        assert_eq!(classify("/appliance/abc/publish", anonymous), BusCommand::Unhandled);
    }
}
