use crate::types::{SensorDisplay, SensorId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Disabled,
    Idle,
    Active,
    CountingDown,
}

impl MotionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "DISABLED",
            Self::Idle => "IDLE",
            Self::Active => "ACTIVE",
            Self::CountingDown => "COUNTING_DOWN",
        }
    }
}

/// What a single evaluation of a sensor observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionTransition {
    None,
    /// First reading after (re)enable; recorded without firing anything.
    Seeded,
    /// Motion started; any pending countdown was cancelled.
    Started,
    /// Motion stopped and the delayed "off" was scheduled.
    CountdownArmed { deadline_ms: u64 },
    /// Motion stopped with nothing to schedule.
    Ceased,
}

/// One PIR sensor and its countdown-to-off timer.
///
/// `previous_motion` is `None` only between an enable (or reconnect) and the next
/// evaluation; `countdown_deadline_ms` being set is what "counting down" means.
#[derive(Debug, Clone)]
pub struct PirSensor {
    id: SensorId,
    enabled: bool,
    connected: bool,
    motion: bool,
    previous_motion: Option<bool>,
    countdown_deadline_ms: Option<u64>,
    delay_s: u32,
}

impl PirSensor {
    pub fn new(id: SensorId, delay_s: u32) -> Self {
        Self {
            id,
            enabled: false,
            connected: false,
            motion: false,
            previous_motion: None,
            countdown_deadline_ms: None,
            delay_s,
        }
    }

    pub fn id(&self) -> SensorId {
        self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn motion(&self) -> bool {
        self.motion
    }

    pub fn delay_s(&self) -> u32 {
        self.delay_s
    }

    pub fn countdown_deadline_ms(&self) -> Option<u64> {
        self.countdown_deadline_ms
    }

    pub fn is_live(&self) -> bool {
        self.enabled && self.connected
    }

    pub fn state(&self) -> MotionState {
        if !self.is_live() {
            MotionState::Disabled
        } else if self.countdown_deadline_ms.is_some() {
            MotionState::CountingDown
        } else if self.motion {
            MotionState::Active
        } else {
            MotionState::Idle
        }
    }

    pub fn set_motion(&mut self, motion: bool) {
        self.motion = motion;
    }

    pub fn set_delay(&mut self, delay_s: u32) {
        self.delay_s = delay_s;
    }

    /// Returns `true` when the flag changed.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if self.enabled == enabled {
            return false;
        }
        self.enabled = enabled;
        if enabled {
            self.previous_motion = None;
        }
        true
    }

    /// Returns `true` when the flag changed.
    pub fn set_connected(&mut self, connected: bool) -> bool {
        if self.connected == connected {
            return false;
        }
        self.connected = connected;
        if connected {
            self.previous_motion = None;
        }
        true
    }

    /// Keeps the edge detector current without driving any action.
    pub fn track(&mut self) {
        self.previous_motion = Some(self.motion);
    }

    /// Runs one step of the edge detector. `delayed_off` says whether the configured
    /// motion action has an "off" half that should wait for the delay.
    pub fn observe(&mut self, now_ms: u64, delayed_off: bool) -> MotionTransition {
        if !self.is_live() {
            self.track();
            return MotionTransition::None;
        }

        let Some(previous) = self.previous_motion else {
            self.track();
            return MotionTransition::Seeded;
        };

        let transition = match (previous, self.motion) {
            (false, true) => {
                self.countdown_deadline_ms = None;
                MotionTransition::Started
            }
            (true, false) if delayed_off => match self.countdown_deadline_ms {
                Some(_) => MotionTransition::None,
                None => {
                    let deadline_ms = now_ms.saturating_add(u64::from(self.delay_s) * 1_000);
                    self.countdown_deadline_ms = Some(deadline_ms);
                    MotionTransition::CountdownArmed { deadline_ms }
                }
            },
            (true, false) => MotionTransition::Ceased,
            _ => MotionTransition::None,
        };

        self.track();
        transition
    }

    /// Clears and reports a countdown whose deadline has been reached.
    pub fn take_expired_countdown(&mut self, now_ms: u64) -> bool {
        match self.countdown_deadline_ms {
            Some(deadline) if now_ms >= deadline => {
                self.countdown_deadline_ms = None;
                true
            }
            _ => false,
        }
    }

    pub fn countdown_remaining_s(&self, now_ms: u64) -> u64 {
        self.countdown_deadline_ms
            .map(|deadline| deadline.saturating_sub(now_ms).div_ceil(1_000))
            .unwrap_or(0)
    }

    pub fn display(&self, now_ms: u64) -> SensorDisplay {
        if self.countdown_deadline_ms.is_some() {
            SensorDisplay::Countdown(self.countdown_remaining_s(now_ms))
        } else if self.motion && self.is_live() {
            SensorDisplay::Motion
        } else {
            SensorDisplay::Waiting
        }
    }
}
