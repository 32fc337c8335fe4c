use std::collections::HashMap;

/// Fixed-window suppression of repeated triggers, keyed by an arbitrary string.
///
/// Entries are never evicted; a lookup only compares the elapsed time against the
/// window, so the map grows with the number of distinct keys seen.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window_ms: u64,
    last_fired: HashMap<String, u64>,
}

impl Debouncer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_fired: HashMap::new(),
        }
    }

    /// Returns `true` when `key` fired less than one window ago. Otherwise records
    /// `now_ms` as the key's last firing and returns `false`.
    pub fn should_suppress(&mut self, key: &str, now_ms: u64) -> bool {
        if let Some(last) = self.last_fired.get(key) {
            if now_ms.saturating_sub(*last) < self.window_ms {
                return true;
            }
        }
        self.last_fired.insert(key.to_string(), now_ms);
        false
    }
}
