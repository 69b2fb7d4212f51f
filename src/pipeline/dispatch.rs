//! Dispatch Stage
//!
//! Terminal stage: resolves the owning client session for an event through
//! the window resolver and performs the final send, gated by the ANR
//! contract.
//!
//! Outcome taxonomy (see the crate docs): unresolved routes and vanished
//! sessions are logged drops, ANR withholding is deliberate backpressure,
//! and only a transport write failure surfaces as an error to the caller.
//! Successful sends arm the destination session's ANR timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::anr::{AnrController, AnrKind};
use crate::event::{now_us, KeyEvent, PointerEvent};
use crate::transport::message::{MessageId, Packet, ReportKeyEvent, ReportPointerEvent};
use crate::transport::SessionRegistry;
use crate::window::WindowResolver;

use super::{PipelineStage, StageResult};

/// Handler id used in report bodies for normal app dispatch, below the
/// valid registration range.
pub const DISPATCH_HANDLER_ID: i32 = 0;

/// Dispatch failure outcomes.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// No window route for this event
    #[error("No target window for event {0}")]
    NoRoute(i64),

    /// Route resolved to a session that no longer exists
    #[error("Session fd={0} not found for event {1}")]
    SessionGone(i32, i64),

    /// Transport write failed; the one reportable dispatch error
    #[error("Send to session fd={0} failed for event {1}")]
    SendFailed(i32, i64),
}

/// Counters for dispatch outcomes.
#[derive(Debug, Default)]
pub struct DispatchStats {
    dispatched: AtomicU64,
    no_route: AtomicU64,
    withheld: AtomicU64,
    send_failures: AtomicU64,
}

impl DispatchStats {
    /// Events delivered to a session.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Events dropped for lack of a route or session.
    pub fn no_route(&self) -> u64 {
        self.no_route.load(Ordering::Relaxed)
    }

    /// Events withheld by ANR backpressure.
    pub fn withheld(&self) -> u64 {
        self.withheld.load(Ordering::Relaxed)
    }

    /// Transport write failures.
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }
}

/// Final delivery to the owning client session.
pub struct DispatchStage {
    windows: Arc<dyn WindowResolver>,
    sessions: Arc<SessionRegistry>,
    anr: Arc<dyn AnrController>,
    stats: DispatchStats,
}

impl DispatchStage {
    /// Create the stage over its collaborators.
    pub fn new(
        windows: Arc<dyn WindowResolver>,
        sessions: Arc<SessionRegistry>,
        anr: Arc<dyn AnrController>,
    ) -> Self {
        Self {
            windows,
            sessions,
            anr,
            stats: DispatchStats::default(),
        }
    }

    /// Dispatch outcome counters.
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Deliver a key event to the focused window's session.
    pub fn dispatch_key_event(&self, event: &KeyEvent) -> Result<(), DispatchError> {
        let Some(fd) = self.windows.update_target(event) else {
            self.stats.no_route.fetch_add(1, Ordering::Relaxed);
            return Err(DispatchError::NoRoute(event.id));
        };
        let Some(session) = self.sessions.get_session(fd) else {
            self.stats.no_route.fetch_add(1, Ordering::Relaxed);
            return Err(DispatchError::SessionGone(fd, event.id));
        };

        let now = now_us();
        if self.anr.trigger_anr(AnrKind::Dispatch, now, fd) {
            self.stats.withheld.fetch_add(1, Ordering::Relaxed);
            warn!("Key event {} withheld: session fd={} not responding", event.id, fd);
            return Ok(());
        }

        let body = ReportKeyEvent {
            handler_id: DISPATCH_HANDLER_ID,
            event: event.clone(),
        };
        let packet = Packet::encode(MessageId::ReportKeyEvent, &body)
            .map_err(|_| DispatchError::SendFailed(fd, event.id))?;
        if !session.send_msg(packet) {
            self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            return Err(DispatchError::SendFailed(fd, event.id));
        }

        self.anr.add_timer(AnrKind::Dispatch, event.id, now, fd);
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!("Key event {} dispatched to session fd={}", event.id, fd);
        Ok(())
    }

    /// Deliver a pointer event to the session owning its target window.
    ///
    /// Pointer items targeting windows of other processes are stripped
    /// before marshalling; a session only sees items belonging to windows
    /// it owns.
    pub fn dispatch_pointer_event(&self, event: &PointerEvent) -> Result<(), DispatchError> {
        let Some(fd) = self.windows.client_fd(event) else {
            self.stats.no_route.fetch_add(1, Ordering::Relaxed);
            return Err(DispatchError::NoRoute(event.id));
        };
        let Some(session) = self.sessions.get_session(fd) else {
            self.stats.no_route.fetch_add(1, Ordering::Relaxed);
            return Err(DispatchError::SessionGone(fd, event.id));
        };

        let now = now_us();
        if self.anr.trigger_anr(AnrKind::Dispatch, now, fd) {
            self.stats.withheld.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Pointer event {} withheld: session fd={} not responding",
                event.id, fd
            );
            return Ok(());
        }

        let mut outgoing = event.clone();
        let dest_pid = session.pid();
        outgoing.pointers.retain(|item| {
            match self.windows.window_pid(item.window_id) {
                Some(pid) if pid == dest_pid => true,
                _ => {
                    debug!(
                        "Pointer item {} stripped: window {} not owned by pid {}",
                        item.pointer_id, item.window_id, dest_pid
                    );
                    false
                }
            }
        });

        let body = ReportPointerEvent {
            handler_id: DISPATCH_HANDLER_ID,
            event: outgoing,
        };
        let packet = Packet::encode(MessageId::ReportPointerEvent, &body)
            .map_err(|_| DispatchError::SendFailed(fd, event.id))?;
        if !session.send_msg(packet) {
            self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            return Err(DispatchError::SendFailed(fd, event.id));
        }

        self.anr.add_timer(AnrKind::Dispatch, event.id, now, fd);
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!("Pointer event {} dispatched to session fd={}", event.id, fd);
        Ok(())
    }
}

impl PipelineStage for DispatchStage {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    fn handle_key(&self, event: &mut KeyEvent) -> StageResult {
        if let Err(e) = self.dispatch_key_event(event) {
            error!("Key dispatch failed: {}", e);
        }
        StageResult::Consumed
    }

    fn handle_pointer(&self, event: &mut PointerEvent) -> StageResult {
        if let Err(e) = self.dispatch_pointer_event(event) {
            error!("Pointer dispatch failed: {}", e);
        }
        StageResult::Consumed
    }
}
