//! Normalize Stage
//!
//! First stage of the chain. Stamps key events with the pressed-key snapshot
//! and the acting key's down timestamp, and rejects malformed touchscreen
//! events before they reach delivery stages.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::warn;

use crate::event::{DeviceSource, KeyAction, KeyEvent, PointerAction, PointerEvent};

use super::{PipelineStage, StageResult};

#[derive(Default)]
struct KeyboardState {
    pressed: BTreeSet<i32>,
    down_times_us: HashMap<i32, i64>,
}

/// Pressed-key bookkeeping and event validation.
#[derive(Default)]
pub struct NormalizeStage {
    state: Mutex<KeyboardState>,
}

impl NormalizeStage {
    /// Create the stage with an empty pressed set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently held, for diagnostics.
    pub fn pressed_keys(&self) -> Vec<i32> {
        self.state.lock().pressed.iter().copied().collect()
    }
}

impl PipelineStage for NormalizeStage {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn handle_key(&self, event: &mut KeyEvent) -> StageResult {
        let mut state = self.state.lock();
        match event.action {
            KeyAction::Down => {
                state.pressed.insert(event.key_code);
                state
                    .down_times_us
                    .entry(event.key_code)
                    .or_insert(event.action_time_us);
                event.down_time_us = state.down_times_us[&event.key_code];
            }
            KeyAction::Up => {
                state.pressed.remove(&event.key_code);
                if let Some(down) = state.down_times_us.remove(&event.key_code) {
                    event.down_time_us = down;
                }
            }
            KeyAction::Cancel => {
                state.pressed.clear();
                state.down_times_us.clear();
            }
        }
        event.pressed_keys = state.pressed.iter().copied().collect();
        StageResult::Forward
    }

    fn handle_pointer(&self, event: &mut PointerEvent) -> StageResult {
        // Touchscreen contacts must reference a live item; a contact event
        // without one cannot be routed and is dropped here.
        if event.source == DeviceSource::Touchscreen
            && matches!(
                event.action,
                PointerAction::Down | PointerAction::Up | PointerAction::Move
            )
            && event.acting_item().is_none()
        {
            warn!(
                "Dropping touchscreen event {}: acting pointer {} missing from item list",
                event.id, event.pointer_id
            );
            return StageResult::Consumed;
        }
        StageResult::Forward
    }
}
