use std::collections::BTreeMap;

use crate::{
    action::split_action,
    topics::{TOPIC_PLUG_STATUS, TOPIC_PREFIX},
    types::DeviceDescriptor,
};

const VENDOR_DEFAULT_NAME: &str = "Smart Plug";

/// `Device_<last six characters of the id>`.
pub fn device_slug(device_id: &str) -> String {
    let chars: Vec<char> = device_id.chars().collect();
    let suffix: String = chars[chars.len().saturating_sub(6)..].iter().collect();
    format!("Device_{suffix}")
}

/// One output channel of a remote smart-plug.
///
/// `status` is the last value confirmed by (or optimistically assumed from) the
/// remote API. `locked` is held for the whole duration of a toggle and is the only
/// per-device concurrency guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChannel {
    pub key: String,
    pub device_id: String,
    /// Zero-based channel index on the device.
    pub channel: u8,
    pub display_name: String,
    pub status: bool,
    locked: bool,
    /// Bumped by every finished toggle.
    generation: u64,
}

impl DeviceChannel {
    pub fn new(descriptor: &DeviceDescriptor, channel: u8, status: bool) -> Self {
        let slug = device_slug(&descriptor.id);
        let name = descriptor.name.trim();
        let display_name = if name.is_empty() || name == VENDOR_DEFAULT_NAME {
            slug.clone()
        } else {
            name.to_string()
        };

        Self {
            key: format!("{slug}_ch{}", u16::from(channel) + 1),
            device_id: descriptor.id.clone(),
            channel,
            display_name,
            status,
            locked: false,
            generation: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn address(&self) -> ChannelAddress {
        ChannelAddress {
            key: self.key.clone(),
            device_id: self.device_id.clone(),
            channel: self.channel,
            generation: self.generation,
        }
    }

    pub fn number(&self) -> u16 {
        u16::from(self.channel) + 1
    }

    /// `"<display> Ch<n>"`, the form offered to users.
    pub fn channel_label(&self) -> String {
        format!("{} Ch{}", self.display_name, self.number())
    }

    /// `"<display_with_underscores>_ch<n>"`, the form older alarms and peers use.
    pub fn legacy_label(&self) -> String {
        format!("{}_ch{}", self.display_name.replace(' ', "_"), self.number())
    }

    pub fn button_label(&self) -> String {
        format!(
            "{} {}",
            self.channel_label(),
            if self.status { "ON" } else { "OFF" }
        )
    }

    pub fn button_color(&self) -> &'static str {
        if self.status {
            "green"
        } else {
            "red"
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let name = name.trim();
        name == self.channel_label() || name == self.key || name.eq_ignore_ascii_case(&self.legacy_label())
    }

    /// The three message shapes downstream consumers expect for a status change:
    /// internal key, display-name channel, and vendor "Outlet" form.
    pub fn status_messages(&self) -> Vec<(&'static str, String)> {
        let word = if self.status { "on" } else { "off" };
        vec![
            (TOPIC_PREFIX, format!("{}_{word}", self.key)),
            (TOPIC_PREFIX, format!("{}_{word}", self.legacy_label())),
            (
                TOPIC_PLUG_STATUS,
                format!(
                    "{}_Outlet_{}:{}",
                    self.display_name.replace(' ', "_"),
                    self.number(),
                    word.to_ascii_uppercase()
                ),
            ),
        ]
    }
}

/// Where a remote call for one channel should go, stamped with the channel's
/// toggle generation at the time it was handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAddress {
    pub key: String,
    pub device_id: String,
    pub channel: u8,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleStart {
    UnknownKey,
    /// Another toggle holds the lock; the request is dropped.
    Busy,
    /// Already at the desired status; nothing was locked.
    Unchanged,
    Started {
        address: ChannelAddress,
        target: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Skipped,
    Unchanged,
    Changed,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    channels: BTreeMap<String, DeviceChannel>,
}

impl DeviceRegistry {
    pub fn replace(&mut self, channels: Vec<DeviceChannel>) {
        self.channels = channels
            .into_iter()
            .map(|channel| (channel.key.clone(), channel))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&DeviceChannel> {
        self.channels.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceChannel> {
        self.channels.values()
    }

    /// Display-name form first, then the raw key, then the legacy underscore form.
    pub fn resolve(&self, name: &str) -> Option<&DeviceChannel> {
        let name = name.trim();
        self.channels
            .values()
            .find(|channel| channel.channel_label() == name)
            .or_else(|| self.channels.get(name))
            .or_else(|| self.channels.values().find(|channel| channel.matches(name)))
    }

    /// Maps the `_Outlet_<n>` form back to a channel.
    pub fn resolve_outlet(&self, base_name: &str, outlet: u16) -> Option<&DeviceChannel> {
        self.channels
            .values()
            .find(|channel| {
                channel.display_name.replace(' ', "_") == base_name && channel.number() == outlet
            })
            .or_else(|| self.channels.get(&format!("{base_name}_ch{outlet}")))
    }

    /// Takes the channel lock unless it is already held or there is nothing to do.
    /// With no `desired` status the current one is inverted.
    pub fn begin_toggle(&mut self, key: &str, desired: Option<bool>) -> ToggleStart {
        let Some(channel) = self.channels.get_mut(key) else {
            return ToggleStart::UnknownKey;
        };
        if channel.locked {
            return ToggleStart::Busy;
        }

        let target = desired.unwrap_or(!channel.status);
        if target == channel.status {
            return ToggleStart::Unchanged;
        }

        channel.locked = true;
        ToggleStart::Started {
            address: channel.address(),
            target,
        }
    }

    /// Records the final status and releases the lock. Returns whether the status
    /// changed.
    pub fn finish_toggle(&mut self, key: &str, status: bool) -> bool {
        let Some(channel) = self.channels.get_mut(key) else {
            return false;
        };
        channel.locked = false;
        channel.generation += 1;
        let changed = channel.status != status;
        channel.status = status;
        changed
    }

    /// Every channel not currently being toggled.
    pub fn poll_targets(&self) -> Vec<ChannelAddress> {
        self.channels
            .values()
            .filter(|channel| !channel.locked)
            .map(DeviceChannel::address)
            .collect()
    }

    /// Applies a live status read by the periodic poll. The read is discarded when
    /// a toggle started or finished since `target` was handed out.
    pub fn apply_polled(&mut self, target: &ChannelAddress, status: bool) -> PollOutcome {
        let Some(channel) = self.channels.get_mut(&target.key) else {
            return PollOutcome::Skipped;
        };
        if channel.locked || channel.generation != target.generation {
            return PollOutcome::Skipped;
        }
        if channel.status == status {
            return PollOutcome::Unchanged;
        }
        channel.status = status;
        PollOutcome::Changed
    }

    /// Rewrites an action naming a channel key into `"<display> Ch<n> <state>"`.
    pub fn display_action(&self, action: &str) -> Option<String> {
        let (base, on) = split_action(action)?;
        let channel = self.resolve(base)?;
        Some(format!(
            "{} {}",
            channel.channel_label(),
            if on { "on" } else { "off" }
        ))
    }
}
