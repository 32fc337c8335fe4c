pub mod action;
pub mod alarm;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod motion;
pub mod registry;
pub mod router;
pub mod topics;
pub mod types;

pub use action::Action;
pub use alarm::{Alarm, AlarmParseError, AlarmScheduler, DayOfWeek};
pub use config::{CloudConfig, ControllerConfig, NetworkConfig, PersistedSettings, RuntimeConfig};
pub use debounce::Debouncer;
pub use engine::{DelayError, EngineAction, HomeEngine, LogLevel};
pub use registry::{ChannelAddress, DeviceChannel, DeviceRegistry, ToggleStart};
pub use router::Envelope;
pub use topics::*;
pub use types::{ControllerStatus, DeviceDescriptor, PirSwitch, Room, SensorId, UiEvent};
