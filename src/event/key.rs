//! Keyboard Event Type
//!
//! Normalized key events with the pressed-key snapshot the subscriber stage
//! matches combinations against.

use serde::{Deserialize, Serialize};

use super::EventFlags;

/// Key event action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAction {
    /// Key pressed.
    Down,
    /// Key released.
    Up,
    /// In-flight key state abandoned (focus loss, device removal).
    Cancel,
}

/// A normalized keyboard event.
///
/// `pressed_keys` is the full set of keys held at the instant the event was
/// produced: the key going down is included on `Down`, the key going up is
/// already removed on `Up`. The normalize stage stamps and maintains it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEvent {
    /// Source-assigned event id.
    pub id: i64,
    /// Linux evdev keycode of the acting key.
    pub key_code: i32,
    /// What happened to the acting key.
    pub action: KeyAction,
    /// When the acting key went down, microseconds, monotonic.
    pub down_time_us: i64,
    /// When this action happened, microseconds, monotonic.
    pub action_time_us: i64,
    /// Delivery control flags.
    #[serde(default)]
    pub flags: EventFlags,
    /// Keys held at this instant, sorted ascending.
    #[serde(default)]
    pub pressed_keys: Vec<i32>,
}

impl KeyEvent {
    /// Create a key event with an empty pressed-key snapshot.
    pub fn new(id: i64, key_code: i32, action: KeyAction, action_time_us: i64) -> Self {
        Self {
            id,
            key_code,
            action,
            down_time_us: action_time_us,
            action_time_us,
            flags: EventFlags::empty(),
            pressed_keys: Vec::new(),
        }
    }

    /// Keys held other than the acting key.
    pub fn pressed_keys_except_acting(&self) -> Vec<i32> {
        self.pressed_keys
            .iter()
            .copied()
            .filter(|&k| k != self.key_code)
            .collect()
    }

    /// Duration the acting key has been held, in microseconds.
    ///
    /// Zero when the down timestamp is missing or in the future.
    pub fn held_duration_us(&self) -> i64 {
        (self.action_time_us - self.down_time_us).max(0)
    }
}
