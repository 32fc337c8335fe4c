use std::fmt;

use crate::types::{PirSwitch, Room};

/// A symbolic automation action, parsed once at the edge.
///
/// Text forms accepted: `"<base> on"` / `"<base> off"` (case-insensitive), and the
/// legacy underscore-joined `"<base>_on"` / `"<base>_off"` found in stored alarms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RoomLightSet { room: Room, on: bool },
    PirEnableSet { switch: PirSwitch, on: bool },
    /// Remote channel, addressed by `"<display> Ch<n>"`, its legacy underscore form,
    /// or a raw channel key. Resolved against the device registry at execution time.
    ChannelToggle { target: String, on: bool },
    Unknown(String),
}

const SUFFIXES: [(&str, bool); 4] = [(" on", true), (" off", false), ("_on", true), ("_off", false)];

/// Splits `"<base> on|off"` into its base and desired state.
pub fn split_action(raw: &str) -> Option<(&str, bool)> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();

    SUFFIXES.iter().find_map(|(suffix, on)| {
        if lower.ends_with(suffix) && lower.len() > suffix.len() {
            let base = trimmed[..trimmed.len() - suffix.len()].trim_end();
            (!base.is_empty()).then_some((base, *on))
        } else {
            None
        }
    })
}

impl Action {
    pub fn parse(raw: &str) -> Self {
        let Some((base, on)) = split_action(raw) else {
            return Self::Unknown(raw.trim().to_string());
        };

        let identity = base.replace(' ', "_");
        if let Some(room) = Room::ALL
            .into_iter()
            .find(|room| room.light_identity().eq_ignore_ascii_case(&identity))
        {
            return Self::RoomLightSet { room, on };
        }
        if let Some(switch) = PirSwitch::from_identity(&identity) {
            return Self::PirEnableSet { switch, on };
        }

        Self::ChannelToggle {
            target: base.to_string(),
            on,
        }
    }

    pub fn desired(&self) -> Option<bool> {
        match self {
            Self::RoomLightSet { on, .. }
            | Self::PirEnableSet { on, .. }
            | Self::ChannelToggle { on, .. } => Some(*on),
            Self::Unknown(_) => None,
        }
    }

    /// Motion actions that switch something on have a delayed "off" half.
    pub fn ends_on(&self) -> bool {
        self.desired() == Some(true)
    }

    /// Same target, different desired state. `Unknown` stays as it is.
    pub fn with_state(&self, on: bool) -> Self {
        match self {
            Self::RoomLightSet { room, .. } => Self::RoomLightSet { room: *room, on },
            Self::PirEnableSet { switch, .. } => Self::PirEnableSet {
                switch: *switch,
                on,
            },
            Self::ChannelToggle { target, .. } => Self::ChannelToggle {
                target: target.clone(),
                on,
            },
            Self::Unknown(raw) => Self::Unknown(raw.clone()),
        }
    }
}

fn state_word(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoomLightSet { room, on } => {
                write!(f, "{} {}", room.light_identity(), state_word(*on))
            }
            Self::PirEnableSet { switch, on } => {
                write!(f, "{} {}", switch.identity(), state_word(*on))
            }
            Self::ChannelToggle { target, on } => write!(f, "{target} {}", state_word(*on)),
            Self::Unknown(raw) => f.write_str(raw),
        }
    }
}
