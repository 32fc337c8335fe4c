use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        DayOfWeek::Mon,
        DayOfWeek::Tue,
        DayOfWeek::Wed,
        DayOfWeek::Thu,
        DayOfWeek::Fri,
        DayOfWeek::Sat,
        DayOfWeek::Sun,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mon => "Mon",
            Self::Tue => "Tue",
            Self::Wed => "Wed",
            Self::Thu => "Thu",
            Self::Fri => "Fri",
            Self::Sat => "Sat",
            Self::Sun => "Sun",
        }
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DayOfWeek {
    type Err = AlarmParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|day| day.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| AlarmParseError::UnknownDay(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlarmParseError {
    #[error("alarm '{0}' has no ':' separating action from schedule")]
    MissingSchedule(String),
    #[error("alarm '{0}' has an empty action")]
    EmptyAction(String),
    #[error("alarm schedule '{0}' is not '<day> <time>'")]
    MalformedSchedule(String),
    #[error("unknown day '{0}'")]
    UnknownDay(String),
    #[error("invalid time of day '{0}'")]
    InvalidTime(String),
}

/// A weekly alarm. Identity is the canonical `"<action>:<day> <time>"` string, so
/// `07:00` and `07:00:00` are two different alarms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    action: String,
    day: DayOfWeek,
    time: String,
}

impl Alarm {
    pub fn new(action: &str, day: DayOfWeek, time: &str) -> Result<Self, AlarmParseError> {
        let action = action.trim();
        if action.is_empty() {
            return Err(AlarmParseError::EmptyAction(format!("{day} {time}")));
        }

        let time = time.trim();
        let valid_time = NaiveTime::parse_from_str(time, "%H:%M:%S").is_ok()
            || NaiveTime::parse_from_str(time, "%H:%M").is_ok();
        if !valid_time {
            return Err(AlarmParseError::InvalidTime(time.to_string()));
        }

        Ok(Self {
            action: action.to_string(),
            day,
            time: time.to_string(),
        })
    }

    /// Parses `"<action>:<day> <time>"`. The day/time separator may also be `_`, which
    /// is what space-normalised bus messages carry.
    pub fn parse(raw: &str) -> Result<Self, AlarmParseError> {
        let raw = raw.trim();
        let (action, schedule) = raw
            .split_once(':')
            .ok_or_else(|| AlarmParseError::MissingSchedule(raw.to_string()))?;
        let (day, time) = schedule
            .trim()
            .split_once(|c: char| c == ' ' || c == '_')
            .ok_or_else(|| AlarmParseError::MalformedSchedule(schedule.to_string()))?;

        Self::new(action, day.parse()?, time)
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn day(&self) -> DayOfWeek {
        self.day
    }

    pub fn time(&self) -> &str {
        &self.time
    }

    /// `"<day> <time>"`, compared verbatim against the clock.
    pub fn slot(&self) -> String {
        format!("{} {}", self.day, self.time)
    }
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} {}", self.action, self.day, self.time)
    }
}

/// Current clock as `"<day> HH:MM:SS"`, the only form alarms are matched against.
pub fn clock_slot(now: DateTime<FixedOffset>) -> String {
    format!(
        "{} {}",
        DayOfWeek::from_chrono(now.weekday()),
        now.format("%H:%M:%S")
    )
}

#[derive(Debug, Clone, Default)]
pub struct AlarmScheduler {
    alarms: Vec<Alarm>,
    cursor: usize,
}

impl AlarmScheduler {
    /// Builds a scheduler from stored strings, returning the entries that were
    /// discarded as malformed.
    pub fn load<I, S>(entries: I) -> (Self, Vec<AlarmParseError>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut scheduler = Self::default();
        let mut rejected = Vec::new();
        for entry in entries {
            match Alarm::parse(entry.as_ref()) {
                Ok(alarm) => {
                    scheduler.add(alarm);
                }
                Err(err) => rejected.push(err),
            }
        }
        (scheduler, rejected)
    }

    /// Returns `false` for an exact duplicate.
    pub fn add(&mut self, alarm: Alarm) -> bool {
        if self.alarms.contains(&alarm) {
            return false;
        }
        self.alarms.push(alarm);
        true
    }

    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Alarm> {
        self.alarms.iter()
    }

    /// Sorted, deduplicated canonical strings, the persisted form.
    pub fn entries(&self) -> Vec<String> {
        let mut entries: Vec<String> = self.alarms.iter().map(Alarm::to_string).collect();
        entries.sort();
        entries.dedup();
        entries
    }

    /// Alarms whose slot equals the clock exactly. A second that is never evaluated
    /// is not caught up later.
    pub fn due(&self, now: DateTime<FixedOffset>) -> Vec<&Alarm> {
        let slot = clock_slot(now);
        self.alarms
            .iter()
            .filter(|alarm| alarm.slot() == slot)
            .collect()
    }

    /// Today's alarms strictly later than now, earliest first.
    pub fn upcoming(&self, now: DateTime<FixedOffset>) -> Vec<&Alarm> {
        let today = DayOfWeek::from_chrono(now.weekday());
        let clock = now.format("%H:%M:%S").to_string();

        let mut upcoming: Vec<&Alarm> = self
            .alarms
            .iter()
            .filter(|alarm| alarm.day == today && alarm.time.as_str() > clock.as_str())
            .collect();
        upcoming.sort_by(|a, b| a.time.cmp(&b.time));
        upcoming
    }

    /// The alarm under the browse cursor, with its zero-based position. A cursor left
    /// past the end of a shrunken list reads as the first entry.
    pub fn selected_upcoming(&self, now: DateTime<FixedOffset>) -> Option<(usize, &Alarm)> {
        let upcoming = self.upcoming(now);
        let cursor = if self.cursor < upcoming.len() {
            self.cursor
        } else {
            0
        };
        upcoming.get(cursor).map(|alarm| (cursor, *alarm))
    }

    /// Moves the browse cursor to the next upcoming alarm, wrapping around.
    pub fn advance(&mut self, now: DateTime<FixedOffset>) {
        let count = self.upcoming(now).len();
        self.cursor = if count == 0 {
            0
        } else if self.cursor >= count {
            1 % count
        } else {
            (self.cursor + 1) % count
        };
    }
}
