//! Handler Registration Tables
//!
//! The [`HandlerRegistry`] owns the interceptor and monitor registration
//! tables. Each table is bounded, keyed by handler id, and holds only the
//! owning session's fd; live sessions are resolved through the
//! [`SessionRegistry`](crate::transport::SessionRegistry) at delivery time.
//!
//! # Identity and merging
//!
//! `(handler_id, handler_type)` is unique across live registrations. A
//! re-registration with the same id, type and owning session merges: the
//! record's masks widen to the union of old and new. The same id from a
//! different session is rejected, never silently rebound.
//!
//! # Aggregate masks
//!
//! The union mask across a table is a pure function of the table snapshot,
//! recomputed on demand by [`HandlerRegistry::aggregate`]. Stages query it
//! instead of holding a pushed copy, so the mask can never diverge from the
//! table contents.
//!
//! # Session cleanup
//!
//! The first successful registration lazily installs a session-deleted hook
//! (exactly once, atomic init flag) that bulk-purges every registration owned
//! by the vanished session.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::event::{
    DeviceTags, GestureMeta, HandleEventType, MAX_HANDLERS_PER_TYPE, MAX_HANDLER_ID, MIN_HANDLER_ID,
};
use crate::transport::SessionRegistry;

/// Result type for registry mutations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry mutation errors, relayed to clients as negative status codes.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// Table for this handler type is full
    #[error("Handler table full: {0:?} holds {1} registrations")]
    CapacityExceeded(HandlerType, usize),

    /// Handler id outside the valid range, or owned by another session
    #[error("Invalid handler id: {0}")]
    InvalidId(i32),

    /// Registration with handler type None
    #[error("Handler type None cannot be registered")]
    InvalidType,
}

impl RegistryError {
    /// Wire status code for command replies.
    pub fn status_code(&self) -> i32 {
        match self {
            RegistryError::CapacityExceeded(_, _) => -2,
            RegistryError::InvalidId(_) => -3,
            RegistryError::InvalidType => -4,
        }
    }
}

/// Kind of handler a registration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerType {
    /// Placeholder for uninitialized client state; never registrable.
    None,
    /// First-refusal handler, runs before normal dispatch.
    Interceptor,
    /// Copy observer, runs alongside normal dispatch.
    Monitor,
}

/// One live handler registration.
#[derive(Debug, Clone)]
pub struct HandlerRecord {
    /// Unique within the handler type's table.
    pub id: i32,
    /// Which table the record lives in.
    pub handler_type: HandlerType,
    /// Owning session's fd (back-reference, never ownership).
    pub session_fd: i32,
    /// Event categories the handler wants.
    pub event_types: HandleEventType,
    /// Device categories the handler wants.
    pub device_tags: DeviceTags,
    /// Fan-out ordering, lower first.
    pub priority: i32,
    /// Gesture filter for touchpad-gesture monitors.
    pub gesture: Option<GestureMeta>,
}

impl HandlerRecord {
    /// Whether this record wants events of `event_type` from a device in `tags`.
    pub fn matches(&self, event_type: HandleEventType, tags: DeviceTags) -> bool {
        self.event_types.intersects(event_type) && self.device_tags.intersects(tags)
    }
}

/// Union of the masks across one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateMask {
    /// Union event-type mask.
    pub event_types: HandleEventType,
    /// Union device-tag mask.
    pub device_tags: DeviceTags,
}

#[derive(Default)]
struct Tables {
    interceptors: BTreeMap<i32, HandlerRecord>,
    monitors: BTreeMap<i32, HandlerRecord>,
}

impl Tables {
    fn table(&self, handler_type: HandlerType) -> &BTreeMap<i32, HandlerRecord> {
        match handler_type {
            HandlerType::Interceptor => &self.interceptors,
            HandlerType::Monitor => &self.monitors,
            HandlerType::None => unreachable!("None rejected before table access"),
        }
    }

    fn table_mut(&mut self, handler_type: HandlerType) -> &mut BTreeMap<i32, HandlerRecord> {
        match handler_type {
            HandlerType::Interceptor => &mut self.interceptors,
            HandlerType::Monitor => &mut self.monitors,
            HandlerType::None => unreachable!("None rejected before table access"),
        }
    }

    fn id_in_use(&self, id: i32) -> bool {
        self.interceptors.contains_key(&id) || self.monitors.contains_key(&id)
    }
}

/// Parameters for [`HandlerRegistry::add_handler`].
#[derive(Debug, Clone)]
pub struct AddHandler {
    /// Caller-chosen handler id.
    pub id: i32,
    /// Target table.
    pub handler_type: HandlerType,
    /// Owning session's fd.
    pub session_fd: i32,
    /// Event categories to receive.
    pub event_types: HandleEventType,
    /// Device categories to receive.
    pub device_tags: DeviceTags,
    /// Fan-out ordering, lower first.
    pub priority: i32,
    /// Gesture filter for touchpad-gesture monitors.
    pub gesture: Option<GestureMeta>,
}

/// Bounded interceptor/monitor registration tables.
pub struct HandlerRegistry {
    tables: Mutex<Tables>,
    sessions: Arc<SessionRegistry>,
    next_id: AtomicI32,
    session_hook_installed: AtomicBool,
}

impl HandlerRegistry {
    /// Create an empty registry bound to the session registry it will
    /// install its cleanup hook on.
    pub fn new(sessions: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(Tables::default()),
            sessions,
            next_id: AtomicI32::new(MIN_HANDLER_ID),
            session_hook_installed: AtomicBool::new(false),
        })
    }

    /// Register or merge a handler.
    ///
    /// Fails with [`RegistryError::CapacityExceeded`] when the target table
    /// already holds [`MAX_HANDLERS_PER_TYPE`] distinct handlers, and with
    /// [`RegistryError::InvalidId`] for an out-of-range id or an id owned by
    /// a different session. A duplicate from the owning session merges masks
    /// in place.
    pub fn add_handler(self: &Arc<Self>, req: AddHandler) -> Result<()> {
        if req.handler_type == HandlerType::None {
            return Err(RegistryError::InvalidType);
        }
        if !(MIN_HANDLER_ID..MAX_HANDLER_ID).contains(&req.id) {
            return Err(RegistryError::InvalidId(req.id));
        }

        {
            let mut tables = self.tables.lock();
            let table = tables.table_mut(req.handler_type);

            if let Some(existing) = table.get_mut(&req.id) {
                if existing.session_fd != req.session_fd {
                    warn!(
                        "Handler id {} ({:?}) already owned by session fd={}",
                        req.id, req.handler_type, existing.session_fd
                    );
                    return Err(RegistryError::InvalidId(req.id));
                }
                // Merge: widen the record, never duplicate it.
                existing.event_types |= req.event_types;
                existing.device_tags |= req.device_tags;
                if req.gesture.is_some() {
                    existing.gesture = req.gesture;
                }
                debug!(
                    "Handler merged: id={}, type={:?}, events={:?}, tags={:?}",
                    req.id, req.handler_type, existing.event_types, existing.device_tags
                );
            } else {
                if table.len() >= MAX_HANDLERS_PER_TYPE {
                    return Err(RegistryError::CapacityExceeded(req.handler_type, table.len()));
                }
                debug!(
                    "Handler added: id={}, type={:?}, session fd={}, events={:?}, tags={:?}, priority={}",
                    req.id, req.handler_type, req.session_fd, req.event_types, req.device_tags,
                    req.priority
                );
                table.insert(
                    req.id,
                    HandlerRecord {
                        id: req.id,
                        handler_type: req.handler_type,
                        session_fd: req.session_fd,
                        event_types: req.event_types,
                        device_tags: req.device_tags,
                        priority: req.priority,
                        gesture: req.gesture,
                    },
                );
            }
        }

        self.ensure_session_hook();
        Ok(())
    }

    /// Remove a handler owned by `session_fd`.
    ///
    /// A missing id, or an id owned by another session, is a logged no-op.
    pub fn remove_handler(&self, id: i32, handler_type: HandlerType, session_fd: i32) {
        if handler_type == HandlerType::None {
            warn!("Remove with handler type None ignored: id={}", id);
            return;
        }
        let mut tables = self.tables.lock();
        let table = tables.table_mut(handler_type);
        match table.get(&id) {
            Some(record) if record.session_fd == session_fd => {
                table.remove(&id);
                debug!("Handler removed: id={}, type={:?}", id, handler_type);
            }
            Some(record) => {
                warn!(
                    "Remove of handler id={} ({:?}) ignored: owned by fd={}, requested by fd={}",
                    id, handler_type, record.session_fd, session_fd
                );
            }
            None => {
                warn!("Remove of unknown handler id={} ({:?}) ignored", id, handler_type);
            }
        }
    }

    /// Purge every registration owned by a vanished session.
    pub fn on_session_lost(&self, session_fd: i32) {
        let mut tables = self.tables.lock();
        let before =
            tables.interceptors.len() + tables.monitors.len();
        tables.interceptors.retain(|_, r| r.session_fd != session_fd);
        tables.monitors.retain(|_, r| r.session_fd != session_fd);
        let purged = before - (tables.interceptors.len() + tables.monitors.len());
        if purged > 0 {
            info!("Purged {} handler registrations for session fd={}", purged, session_fd);
        }
    }

    /// Allocate the next free handler id.
    ///
    /// Wraps at `i32::MAX` back to [`MIN_HANDLER_ID`] and probes linearly
    /// past live ids; O(n) under heavy churn is accepted.
    pub fn take_next_id(&self) -> i32 {
        let tables = self.tables.lock();
        loop {
            let candidate = self.next_id.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(if v >= MAX_HANDLER_ID - 1 { MIN_HANDLER_ID } else { v + 1 })
            });
            let id = candidate.unwrap_or(MIN_HANDLER_ID);
            if !tables.id_in_use(id) {
                return id;
            }
        }
    }

    /// Union mask over one table, computed from the current snapshot.
    pub fn aggregate(&self, handler_type: HandlerType) -> AggregateMask {
        if handler_type == HandlerType::None {
            return AggregateMask::default();
        }
        let tables = self.tables.lock();
        let mut mask = AggregateMask::default();
        for record in tables.table(handler_type).values() {
            mask.event_types |= record.event_types;
            mask.device_tags |= record.device_tags;
        }
        mask
    }

    /// Interceptors matching an event, sorted by priority then id.
    pub fn interceptors_matching(
        &self,
        event_type: HandleEventType,
        tags: DeviceTags,
    ) -> Vec<HandlerRecord> {
        let tables = self.tables.lock();
        let mut matched: Vec<HandlerRecord> = tables
            .interceptors
            .values()
            .filter(|r| r.matches(event_type, tags))
            .cloned()
            .collect();
        matched.sort_by_key(|r| (r.priority, r.id));
        matched
    }

    /// Snapshot of every monitor registration.
    pub fn monitors_snapshot(&self) -> Vec<HandlerRecord> {
        self.tables.lock().monitors.values().cloned().collect()
    }

    /// Monitor registration by id.
    pub fn monitor_by_id(&self, id: i32) -> Option<HandlerRecord> {
        self.tables.lock().monitors.get(&id).cloned()
    }

    /// Whether `session_fd` owns at least one monitor registration.
    pub fn session_has_monitor(&self, session_fd: i32) -> bool {
        self.tables
            .lock()
            .monitors
            .values()
            .any(|r| r.session_fd == session_fd)
    }

    /// Live registration count for one table.
    pub fn handler_count(&self, handler_type: HandlerType) -> usize {
        if handler_type == HandlerType::None {
            return 0;
        }
        self.tables.lock().table(handler_type).len()
    }

    /// Install the session-loss purge hook, exactly once.
    fn ensure_session_hook(self: &Arc<Self>) {
        if self
            .session_hook_installed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let weak = Arc::downgrade(self);
        self.sessions.add_session_deleted_callback(Box::new(move |session| {
            if let Some(registry) = weak.upgrade() {
                registry.on_session_lost(session.fd());
            }
        }));
        debug!("Handler registry session-loss hook installed");
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("HandlerRegistry")
            .field("interceptors", &tables.interceptors.len())
            .field("monitors", &tables.monitors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<HandlerRegistry> {
        HandlerRegistry::new(Arc::new(SessionRegistry::new(8)))
    }

    fn add(id: i32, handler_type: HandlerType, fd: i32) -> AddHandler {
        AddHandler {
            id,
            handler_type,
            session_fd: fd,
            event_types: HandleEventType::KEY,
            device_tags: DeviceTags::KEYBOARD,
            priority: 0,
            gesture: None,
        }
    }

    #[test]
    fn test_id_uniqueness_across_sessions() {
        let registry = registry();
        registry.add_handler(add(1, HandlerType::Monitor, 10)).unwrap();
        let err = registry
            .add_handler(add(1, HandlerType::Monitor, 11))
            .unwrap_err();
        assert_eq!(err, RegistryError::InvalidId(1));
        assert_eq!(registry.handler_count(HandlerType::Monitor), 1);
    }

    #[test]
    fn test_capacity_17th_rejected_table_unchanged() {
        let registry = registry();
        for id in 1..=16 {
            registry.add_handler(add(id, HandlerType::Monitor, 10)).unwrap();
        }
        let err = registry
            .add_handler(add(17, HandlerType::Monitor, 10))
            .unwrap_err();
        assert!(matches!(err, RegistryError::CapacityExceeded(HandlerType::Monitor, 16)));
        assert_eq!(registry.handler_count(HandlerType::Monitor), 16);

        // The other table is not affected by monitor capacity.
        registry
            .add_handler(add(17, HandlerType::Interceptor, 10))
            .unwrap();
    }

    #[test]
    fn test_invalid_id_range() {
        let registry = registry();
        assert_eq!(
            registry.add_handler(add(0, HandlerType::Monitor, 10)).unwrap_err(),
            RegistryError::InvalidId(0)
        );
        assert_eq!(
            registry
                .add_handler(add(i32::MAX, HandlerType::Monitor, 10))
                .unwrap_err(),
            RegistryError::InvalidId(i32::MAX)
        );
    }

    #[test]
    fn test_handler_type_none_rejected() {
        let registry = registry();
        assert_eq!(
            registry.add_handler(add(1, HandlerType::None, 10)).unwrap_err(),
            RegistryError::InvalidType
        );
    }

    #[test]
    fn test_merge_is_idempotent_and_widens() {
        let registry = registry();
        registry.add_handler(add(1, HandlerType::Monitor, 10)).unwrap();

        // Same masks again: no duplicate, aggregate unchanged.
        registry.add_handler(add(1, HandlerType::Monitor, 10)).unwrap();
        assert_eq!(registry.handler_count(HandlerType::Monitor), 1);
        let aggregate = registry.aggregate(HandlerType::Monitor);
        assert_eq!(aggregate.event_types, HandleEventType::KEY);

        // Wider mask merges into the same record and widens the aggregate.
        let mut wider = add(1, HandlerType::Monitor, 10);
        wider.event_types = HandleEventType::POINTER;
        wider.device_tags = DeviceTags::TOUCHSCREEN;
        registry.add_handler(wider).unwrap();
        assert_eq!(registry.handler_count(HandlerType::Monitor), 1);

        let aggregate = registry.aggregate(HandlerType::Monitor);
        assert_eq!(
            aggregate.event_types,
            HandleEventType::KEY | HandleEventType::POINTER
        );
        assert_eq!(
            aggregate.device_tags,
            DeviceTags::KEYBOARD | DeviceTags::TOUCHSCREEN
        );
    }

    #[test]
    fn test_remove_shrinks_aggregate() {
        let registry = registry();
        registry.add_handler(add(1, HandlerType::Interceptor, 10)).unwrap();
        let mut pointer = add(2, HandlerType::Interceptor, 10);
        pointer.event_types = HandleEventType::POINTER;
        pointer.device_tags = DeviceTags::MOUSE;
        registry.add_handler(pointer).unwrap();

        registry.remove_handler(2, HandlerType::Interceptor, 10);
        let aggregate = registry.aggregate(HandlerType::Interceptor);
        assert_eq!(aggregate.event_types, HandleEventType::KEY);
        assert_eq!(aggregate.device_tags, DeviceTags::KEYBOARD);
    }

    #[test]
    fn test_remove_foreign_session_is_noop() {
        let registry = registry();
        registry.add_handler(add(1, HandlerType::Monitor, 10)).unwrap();
        registry.remove_handler(1, HandlerType::Monitor, 99);
        assert_eq!(registry.handler_count(HandlerType::Monitor), 1);
    }

    #[test]
    fn test_session_purge_clears_both_tables() {
        let registry = registry();
        registry.add_handler(add(1, HandlerType::Interceptor, 10)).unwrap();
        registry.add_handler(add(2, HandlerType::Monitor, 10)).unwrap();
        registry.add_handler(add(3, HandlerType::Monitor, 11)).unwrap();

        registry.on_session_lost(10);
        assert_eq!(registry.handler_count(HandlerType::Interceptor), 0);
        assert_eq!(registry.handler_count(HandlerType::Monitor), 1);
        assert!(registry.monitor_by_id(3).is_some());
    }

    #[test]
    fn test_session_hook_purges_on_disconnect() {
        let sessions = Arc::new(SessionRegistry::new(8));
        let registry = HandlerRegistry::new(Arc::clone(&sessions));

        let (session, _rx) = crate::transport::Session::channel(10, 100, 1000);
        sessions.add_session(session).unwrap();
        registry.add_handler(add(1, HandlerType::Monitor, 10)).unwrap();

        sessions.remove_session(10);
        assert_eq!(registry.handler_count(HandlerType::Monitor), 0);
    }

    #[test]
    fn test_take_next_id_probes_past_live_ids() {
        let registry = registry();
        let first = registry.take_next_id();
        assert_eq!(first, MIN_HANDLER_ID);

        registry
            .add_handler(add(MIN_HANDLER_ID + 1, HandlerType::Monitor, 10))
            .unwrap();
        let next = registry.take_next_id();
        assert_eq!(next, MIN_HANDLER_ID + 2);
    }

    #[test]
    fn test_interceptor_matching_sorted_by_priority() {
        let registry = registry();
        let mut low = add(1, HandlerType::Interceptor, 10);
        low.priority = 5;
        let mut high = add(2, HandlerType::Interceptor, 10);
        high.priority = 1;
        registry.add_handler(low).unwrap();
        registry.add_handler(high).unwrap();

        let matched =
            registry.interceptors_matching(HandleEventType::KEY, DeviceTags::KEYBOARD);
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].id, 2);
        assert_eq!(matched[1].id, 1);
    }
}
