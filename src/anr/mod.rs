//! ANR (Application Not Responding) Tracking
//!
//! Per-session backpressure for event delivery. Every successful dispatch
//! records a pending entry; the client acknowledges processing with
//! `MARK_PROCESSED`, which clears entries up to the acknowledged id. While a
//! session's oldest pending entry is older than the configured timeout the
//! session counts as blocked and the dispatch/monitor stages withhold
//! deliveries to it — a deliberate drop, not an error.
//!
//! The pipeline only depends on the [`AnrController`] seam; [`AnrManager`] is
//! the shipped implementation. Timer callbacks hold a weak reference and
//! re-check the ledger before declaring anything, since the acknowledgement
//! may have arrived while the timer was in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Which delivery path a pending entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnrKind {
    /// Normal app dispatch.
    Dispatch,
    /// Monitor fan-out (touchscreen deliveries).
    Monitor,
}

/// Backpressure decisions consumed by the pipeline stages.
pub trait AnrController: Send + Sync {
    /// Whether delivery to `session_fd` must currently be withheld.
    ///
    /// `true` means the session is considered non-responsive for `kind`;
    /// callers drop the delivery without arming a new timer.
    fn trigger_anr(&self, kind: AnrKind, now_us: i64, session_fd: i32) -> bool;

    /// Record a successfully dispatched event and start its timeout clock.
    fn add_timer(&self, kind: AnrKind, event_id: i64, now_us: i64, session_fd: i32);
}

#[derive(Debug, Clone, Copy)]
struct PendingEvent {
    event_id: i64,
    sent_at_us: i64,
}

#[derive(Debug, Default)]
struct Ledger {
    /// Pending (unacknowledged) events per session and path.
    pending: HashMap<(i32, AnrKind), VecDeque<PendingEvent>>,
    /// Paths already reported as blocked, to log the transition once.
    reported: HashMap<(i32, AnrKind), bool>,
}

struct AnrInner {
    ledger: Mutex<Ledger>,
    timeout_us: i64,
}

impl AnrInner {
    fn still_pending(&self, kind: AnrKind, session_fd: i32, event_id: i64) -> bool {
        self.ledger
            .lock()
            .pending
            .get(&(session_fd, kind))
            .map(|q| q.iter().any(|p| p.event_id == event_id))
            .unwrap_or(false)
    }

    fn oldest(&self, kind: AnrKind, session_fd: i32) -> Option<PendingEvent> {
        self.ledger
            .lock()
            .pending
            .get(&(session_fd, kind))
            .and_then(|q| q.front())
            .copied()
    }
}

/// Shipped [`AnrController`]: pending-event ledger with one-shot timers.
pub struct AnrManager {
    inner: Arc<AnrInner>,
}

impl AnrManager {
    /// Create a manager with the given timeout in milliseconds.
    pub fn new(timeout_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(AnrInner {
                ledger: Mutex::new(Ledger::default()),
                timeout_us: (timeout_ms as i64) * 1_000,
            }),
        })
    }

    /// Clear pending entries up to and including `event_id` for a session.
    ///
    /// Unblocks the session as soon as the overdue entries are gone.
    pub fn mark_processed(&self, session_fd: i32, event_id: i64) {
        let mut ledger = self.inner.ledger.lock();
        for kind in [AnrKind::Dispatch, AnrKind::Monitor] {
            if let Some(queue) = ledger.pending.get_mut(&(session_fd, kind)) {
                let before = queue.len();
                queue.retain(|p| p.event_id > event_id);
                if queue.len() != before {
                    debug!(
                        "Session fd={} acknowledged through event {} ({:?}, {} cleared)",
                        session_fd,
                        event_id,
                        kind,
                        before - queue.len()
                    );
                }
            }
            ledger.reported.remove(&(session_fd, kind));
        }
    }

    /// Drop all state for a vanished session.
    pub fn on_session_lost(&self, session_fd: i32) {
        let mut ledger = self.inner.ledger.lock();
        ledger.pending.retain(|(fd, _), _| *fd != session_fd);
        ledger.reported.retain(|(fd, _), _| *fd != session_fd);
    }

    /// Number of pending entries for one session and path.
    pub fn pending_count(&self, kind: AnrKind, session_fd: i32) -> usize {
        self.inner
            .ledger
            .lock()
            .pending
            .get(&(session_fd, kind))
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

impl AnrController for AnrManager {
    fn trigger_anr(&self, kind: AnrKind, now_us: i64, session_fd: i32) -> bool {
        let Some(oldest) = self.inner.oldest(kind, session_fd) else {
            return false;
        };
        let blocked = now_us - oldest.sent_at_us >= self.inner.timeout_us;
        if blocked {
            let mut ledger = self.inner.ledger.lock();
            let reported = ledger.reported.entry((session_fd, kind)).or_insert(false);
            if !*reported {
                *reported = true;
                warn!(
                    "Session fd={} not responding ({:?}): event {} pending for {}us",
                    session_fd,
                    kind,
                    oldest.event_id,
                    now_us - oldest.sent_at_us
                );
            }
        }
        blocked
    }

    fn add_timer(&self, kind: AnrKind, event_id: i64, now_us: i64, session_fd: i32) {
        {
            let mut ledger = self.inner.ledger.lock();
            ledger
                .pending
                .entry((session_fd, kind))
                .or_default()
                .push_back(PendingEvent {
                    event_id,
                    sent_at_us: now_us,
                });
        }

        // One-shot timeout check. The ledger is re-read on fire: an
        // acknowledgement that landed in the meantime makes this a no-op.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak: Weak<AnrInner> = Arc::downgrade(&self.inner);
            let timeout = Duration::from_micros(self.inner.timeout_us.max(0) as u64);
            handle.spawn(async move {
                tokio::time::sleep(timeout).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.still_pending(kind, session_fd, event_id) {
                    warn!(
                        "ANR timer fired: session fd={}, {:?}, event {} still unacknowledged",
                        session_fd, kind, event_id
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unblocked_without_pending() {
        let manager = AnrManager::new(100);
        assert!(!manager.trigger_anr(AnrKind::Dispatch, 1_000_000, 5));
    }

    #[test]
    fn test_blocked_after_timeout_elapses() {
        let manager = AnrManager::new(100);
        manager.add_timer(AnrKind::Dispatch, 1, 0, 5);

        // Fresh entry: not blocked yet.
        assert!(!manager.trigger_anr(AnrKind::Dispatch, 50_000, 5));
        // Past the 100ms timeout.
        assert!(manager.trigger_anr(AnrKind::Dispatch, 150_000, 5));
    }

    #[test]
    fn test_mark_processed_unblocks() {
        let manager = AnrManager::new(100);
        manager.add_timer(AnrKind::Dispatch, 1, 0, 5);
        manager.add_timer(AnrKind::Dispatch, 2, 10, 5);
        assert!(manager.trigger_anr(AnrKind::Dispatch, 200_000, 5));

        manager.mark_processed(5, 2);
        assert!(!manager.trigger_anr(AnrKind::Dispatch, 200_000, 5));
        assert_eq!(manager.pending_count(AnrKind::Dispatch, 5), 0);
    }

    #[test]
    fn test_partial_ack_keeps_newer_pending() {
        let manager = AnrManager::new(100);
        manager.add_timer(AnrKind::Dispatch, 1, 0, 5);
        manager.add_timer(AnrKind::Dispatch, 2, 10, 5);

        manager.mark_processed(5, 1);
        assert_eq!(manager.pending_count(AnrKind::Dispatch, 5), 1);
    }

    #[test]
    fn test_paths_tracked_independently() {
        let manager = AnrManager::new(100);
        manager.add_timer(AnrKind::Monitor, 1, 0, 5);

        assert!(manager.trigger_anr(AnrKind::Monitor, 200_000, 5));
        assert!(!manager.trigger_anr(AnrKind::Dispatch, 200_000, 5));
    }

    #[test]
    fn test_session_loss_purges_ledger() {
        let manager = AnrManager::new(100);
        manager.add_timer(AnrKind::Dispatch, 1, 0, 5);
        manager.on_session_lost(5);
        assert!(!manager.trigger_anr(AnrKind::Dispatch, 200_000, 5));
        assert_eq!(manager.pending_count(AnrKind::Dispatch, 5), 0);
    }
}
