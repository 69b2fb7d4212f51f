//! Filter Stage
//!
//! In-process event filters registered by service components (palm
//! rejection, accessibility gates). A filter returning `true` swallows the
//! event before interception or dispatch. Filters run in priority order and
//! the table is bounded like the handler tables.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::event::{KeyEvent, PointerEvent, MAX_HANDLERS_PER_TYPE};

use super::{PipelineStage, StageResult};

/// An in-process event filter.
///
/// Default implementations pass everything through, so a filter only
/// overrides the event kinds it cares about.
pub trait EventFilter: Send + Sync {
    /// Filter name for logging.
    fn name(&self) -> &'static str;

    /// Return `true` to swallow a key event.
    fn filter_key(&self, _event: &KeyEvent) -> bool {
        false
    }

    /// Return `true` to swallow a pointer event.
    fn filter_pointer(&self, _event: &PointerEvent) -> bool {
        false
    }
}

struct FilterEntry {
    id: i32,
    priority: i32,
    filter: Arc<dyn EventFilter>,
}

/// Priority-ordered filter table.
#[derive(Default)]
pub struct FilterStage {
    filters: Mutex<Vec<FilterEntry>>,
    next_id: AtomicI32,
}

impl FilterStage {
    /// Create the stage with no filters.
    pub fn new() -> Self {
        Self {
            filters: Mutex::new(Vec::new()),
            next_id: AtomicI32::new(1),
        }
    }

    /// Register a filter; lower priority runs first.
    ///
    /// Returns the filter id used for removal, or `None` when the table is
    /// at capacity.
    pub fn add_filter(&self, priority: i32, filter: Arc<dyn EventFilter>) -> Option<i32> {
        let mut filters = self.filters.lock();
        if filters.len() >= MAX_HANDLERS_PER_TYPE {
            warn!("Filter table full: {} refused", filter.name());
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!("Filter added: {} (id={}, priority={})", filter.name(), id, priority);
        filters.push(FilterEntry { id, priority, filter });
        filters.sort_by_key(|e| (e.priority, e.id));
        Some(id)
    }

    /// Remove a filter by id. Unknown ids are a logged no-op.
    pub fn remove_filter(&self, id: i32) {
        let mut filters = self.filters.lock();
        let before = filters.len();
        filters.retain(|e| e.id != id);
        if filters.len() == before {
            warn!("Remove of unknown filter id={} ignored", id);
        }
    }

    /// Number of registered filters.
    pub fn filter_count(&self) -> usize {
        self.filters.lock().len()
    }
}

impl PipelineStage for FilterStage {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn handle_key(&self, event: &mut KeyEvent) -> StageResult {
        let filters = self.filters.lock();
        for entry in filters.iter() {
            if entry.filter.filter_key(event) {
                debug!("Key event {} swallowed by filter {}", event.id, entry.filter.name());
                return StageResult::Consumed;
            }
        }
        StageResult::Forward
    }

    fn handle_pointer(&self, event: &mut PointerEvent) -> StageResult {
        let filters = self.filters.lock();
        for entry in filters.iter() {
            if entry.filter.filter_pointer(event) {
                debug!(
                    "Pointer event {} swallowed by filter {}",
                    event.id,
                    entry.filter.name()
                );
                return StageResult::Consumed;
            }
        }
        StageResult::Forward
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KeyAction;

    struct KeyCodeFilter {
        code: i32,
    }

    impl EventFilter for KeyCodeFilter {
        fn name(&self) -> &'static str {
            "keycode"
        }

        fn filter_key(&self, event: &KeyEvent) -> bool {
            event.key_code == self.code
        }
    }

    #[test]
    fn test_matching_filter_swallows() {
        let stage = FilterStage::new();
        stage.add_filter(0, Arc::new(KeyCodeFilter { code: 30 })).unwrap();

        let mut hit = KeyEvent::new(1, 30, KeyAction::Down, 100);
        assert_eq!(stage.handle_key(&mut hit), StageResult::Consumed);

        let mut miss = KeyEvent::new(2, 31, KeyAction::Down, 100);
        assert_eq!(stage.handle_key(&mut miss), StageResult::Forward);
    }

    #[test]
    fn test_remove_restores_flow() {
        let stage = FilterStage::new();
        let id = stage.add_filter(0, Arc::new(KeyCodeFilter { code: 30 })).unwrap();
        stage.remove_filter(id);

        let mut event = KeyEvent::new(1, 30, KeyAction::Down, 100);
        assert_eq!(stage.handle_key(&mut event), StageResult::Forward);
    }

    #[test]
    fn test_capacity_bound() {
        let stage = FilterStage::new();
        for _ in 0..MAX_HANDLERS_PER_TYPE {
            assert!(stage.add_filter(0, Arc::new(KeyCodeFilter { code: 1 })).is_some());
        }
        assert!(stage.add_filter(0, Arc::new(KeyCodeFilter { code: 1 })).is_none());
        assert_eq!(stage.filter_count(), MAX_HANDLERS_PER_TYPE);
    }
}
