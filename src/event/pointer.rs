//! Pointer Event Types
//!
//! Normalized pointer events covering mouse motion, touchscreen contacts and
//! touchpad gestures. A touchscreen sequence is the span from the first
//! finger's `Down` to the `Up` that empties the pressed set; the monitor
//! stage tracks consumption per sequence.

use serde::{Deserialize, Serialize};

use super::EventFlags;

/// Which device category produced a pointer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSource {
    /// Relative pointing device.
    Mouse,
    /// Direct-touch display.
    Touchscreen,
    /// Touchpad (gesture source).
    Touchpad,
}

/// Pointer event action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointerAction {
    /// Contact or button down.
    Down,
    /// Contact or button up.
    Up,
    /// Motion while down (or hover motion for mouse).
    Move,
    /// Sequence abandoned; clients must discard in-flight gesture state.
    Cancel,
    /// Touchpad gesture started.
    GestureBegin,
    /// Touchpad gesture updated.
    GestureUpdate,
    /// Touchpad gesture finished.
    GestureEnd,
}

/// Touchpad gesture classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GestureKind {
    /// Multi-finger swipe.
    Swipe,
    /// Two-or-more-finger pinch.
    Pinch,
}

/// Gesture details attached to touchpad gesture events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GestureMeta {
    /// Gesture classification.
    pub kind: GestureKind,
    /// Number of fingers involved.
    pub fingers: u8,
}

/// One contact or button within a pointer event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointerItem {
    /// Stable id of this contact within its sequence.
    pub pointer_id: i32,
    /// Window the contact currently targets.
    pub window_id: i32,
    /// Display-space x.
    pub x: f64,
    /// Display-space y.
    pub y: f64,
    /// Whether the contact is currently down.
    pub pressed: bool,
}

/// A normalized pointer event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointerEvent {
    /// Source-assigned event id.
    pub id: i64,
    /// Producing device category.
    pub source: DeviceSource,
    /// What happened.
    pub action: PointerAction,
    /// Which item in `pointers` is acting.
    pub pointer_id: i32,
    /// When this action happened, microseconds, monotonic.
    pub action_time_us: i64,
    /// Delivery control flags.
    #[serde(default)]
    pub flags: EventFlags,
    /// All live contacts, including the acting one.
    pub pointers: Vec<PointerItem>,
    /// Present on touchpad gesture events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gesture: Option<GestureMeta>,
}

impl PointerEvent {
    /// Create a pointer event with no contacts.
    pub fn new(id: i64, source: DeviceSource, action: PointerAction, action_time_us: i64) -> Self {
        Self {
            id,
            source,
            action,
            pointer_id: 0,
            action_time_us,
            flags: EventFlags::empty(),
            pointers: Vec::new(),
            gesture: None,
        }
    }

    /// The acting contact, if present in the item list.
    pub fn acting_item(&self) -> Option<&PointerItem> {
        self.pointers.iter().find(|p| p.pointer_id == self.pointer_id)
    }

    /// Number of contacts currently down.
    pub fn pressed_count(&self) -> usize {
        self.pointers.iter().filter(|p| p.pressed).count()
    }

    /// Whether this is a touchpad gesture event.
    pub fn is_gesture(&self) -> bool {
        matches!(
            self.action,
            PointerAction::GestureBegin | PointerAction::GestureUpdate | PointerAction::GestureEnd
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(pointer_id: i32, pressed: bool) -> PointerItem {
        PointerItem {
            pointer_id,
            window_id: 10,
            x: 0.0,
            y: 0.0,
            pressed,
        }
    }

    #[test]
    fn test_acting_item_lookup() {
        let mut ev = PointerEvent::new(7, DeviceSource::Touchscreen, PointerAction::Down, 500);
        ev.pointer_id = 2;
        ev.pointers = vec![item(1, true), item(2, true)];
        assert_eq!(ev.acting_item().unwrap().pointer_id, 2);
    }

    #[test]
    fn test_pressed_count_ignores_lifted() {
        let mut ev = PointerEvent::new(7, DeviceSource::Touchscreen, PointerAction::Up, 500);
        ev.pointers = vec![item(1, false), item(2, true)];
        assert_eq!(ev.pressed_count(), 1);
    }

    #[test]
    fn test_gesture_detection() {
        let mut ev = PointerEvent::new(3, DeviceSource::Touchpad, PointerAction::GestureUpdate, 100);
        ev.gesture = Some(GestureMeta {
            kind: GestureKind::Swipe,
            fingers: 3,
        });
        assert!(ev.is_gesture());

        let plain = PointerEvent::new(4, DeviceSource::Mouse, PointerAction::Move, 200);
        assert!(!plain.is_gesture());
    }
}
