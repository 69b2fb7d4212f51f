//! Normalized Input Event Model
//!
//! Shared event types that flow through the dispatch pipeline. Raw device
//! ingestion happens upstream; by the time an event reaches this crate it is
//! one of the normalized structures defined here.
//!
//! # Event identity
//!
//! Every event carries a monotonically increasing `id` assigned by its source.
//! Pointer events additionally carry a per-pointer item list so multi-touch
//! state survives the trip to clients. Timestamps are microseconds on the
//! service's monotonic clock.
//!
//! # Masks
//!
//! Handler registrations filter events by [`HandleEventType`] (what kind of
//! event) and [`DeviceTags`] (which device category produced it). Both are
//! bitmasks so a single registration can span categories.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub mod key;
pub mod pointer;

pub use key::{KeyAction, KeyEvent};
pub use pointer::{DeviceSource, GestureKind, GestureMeta, PointerAction, PointerEvent, PointerItem};

/// Upper bound of live handlers per handler type.
pub const MAX_HANDLERS_PER_TYPE: usize = 16;

/// Smallest valid handler id.
pub const MIN_HANDLER_ID: i32 = 1;

/// One past the largest valid handler id.
pub const MAX_HANDLER_ID: i32 = i32::MAX;

/// Largest number of pre-keys a key subscription may carry.
pub const MAX_PRE_KEYS: usize = 4;

bitflags! {
    /// Per-event delivery control flags.
    ///
    /// Set on synthesized events (for example the CANCEL produced by
    /// `mark_consumed`) to route them past specific pipeline stages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        /// Event must not be offered to interceptors.
        const NO_INTERCEPT = 0x1;
        /// Event must not be offered to monitors.
        const NO_MONITOR = 0x2;
    }
}

bitflags! {
    /// Event categories a handler registration subscribes to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleEventType: u32 {
        /// Keyboard events.
        const KEY = 0x1;
        /// Pointer events (mouse, touchscreen).
        const POINTER = 0x2;
        /// Touchpad gesture events.
        const TOUCH_GESTURE = 0x4;
    }
}

impl HandleEventType {
    /// Every event category.
    pub const ALL: HandleEventType = HandleEventType::all();
}

bitflags! {
    /// Physical device categories a registration applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceTags: u32 {
        /// Keyboards.
        const KEYBOARD = 0x1;
        /// Mice.
        const MOUSE = 0x2;
        /// Touchscreens.
        const TOUCHSCREEN = 0x4;
        /// Touchpads.
        const TOUCHPAD = 0x8;
    }
}

impl DeviceTags {
    /// Every device category.
    pub const ALL: DeviceTags = DeviceTags::all();

    /// Tag for the device category that produced a pointer event.
    pub fn for_source(source: DeviceSource) -> DeviceTags {
        match source {
            DeviceSource::Mouse => DeviceTags::MOUSE,
            DeviceSource::Touchscreen => DeviceTags::TOUCHSCREEN,
            DeviceSource::Touchpad => DeviceTags::TOUCHPAD,
        }
    }
}

// Masks travel the wire as their raw bits; unknown bits from newer peers
// are dropped on decode.
macro_rules! mask_wire_repr {
    ($($mask:ty),+) => {
        $(
            impl Default for $mask {
                fn default() -> Self {
                    Self::empty()
                }
            }

            impl Serialize for $mask {
                fn serialize<S: serde::Serializer>(
                    &self,
                    serializer: S,
                ) -> std::result::Result<S::Ok, S::Error> {
                    serializer.serialize_u32(self.bits())
                }
            }

            impl<'de> Deserialize<'de> for $mask {
                fn deserialize<D: serde::Deserializer<'de>>(
                    deserializer: D,
                ) -> std::result::Result<Self, D::Error> {
                    Ok(Self::from_bits_truncate(u32::deserialize(deserializer)?))
                }
            }
        )+
    };
}

mask_wire_repr!(EventFlags, HandleEventType, DeviceTags);

/// Microseconds since service start, on the monotonic clock.
///
/// All event and ANR timestamps in this crate come from here so they are
/// directly comparable.
pub fn now_us() -> i64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as i64
}

/// An event entering the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InputEvent {
    /// Keyboard event.
    Key(KeyEvent),
    /// Pointer event (mouse, touchscreen, touchpad gesture).
    Pointer(PointerEvent),
}

impl InputEvent {
    /// The event's source id.
    pub fn id(&self) -> i64 {
        match self {
            InputEvent::Key(ev) => ev.id,
            InputEvent::Pointer(ev) => ev.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_all_covers_every_category() {
        assert!(HandleEventType::ALL.contains(HandleEventType::KEY));
        assert!(HandleEventType::ALL.contains(HandleEventType::POINTER));
        assert!(HandleEventType::ALL.contains(HandleEventType::TOUCH_GESTURE));
    }

    #[test]
    fn test_device_tag_for_source() {
        assert_eq!(
            DeviceTags::for_source(DeviceSource::Touchscreen),
            DeviceTags::TOUCHSCREEN
        );
        assert_eq!(DeviceTags::for_source(DeviceSource::Mouse), DeviceTags::MOUSE);
        assert_eq!(
            DeviceTags::for_source(DeviceSource::Touchpad),
            DeviceTags::TOUCHPAD
        );
    }

    #[test]
    fn test_flags_roundtrip_serde() {
        let flags = EventFlags::NO_INTERCEPT | EventFlags::NO_MONITOR;
        let json = serde_json::to_string(&flags).unwrap();
        let back: EventFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(flags, back);
    }
}
