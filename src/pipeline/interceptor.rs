//! Interceptor Stage
//!
//! Privileged clients registered as interceptors get first refusal on
//! events: a wire copy goes to every matching interceptor, and an event
//! matched by at least one interceptor is consumed — it never reaches
//! subscribers, monitors, or app dispatch. Events flagged `NO_INTERCEPT`
//! (synthesized cancels) bypass the stage entirely.
//!
//! Delivery failures are logged per destination and do not affect the rest
//! of the fan-out; session teardown is driven solely by the session-deleted
//! notification.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::event::{DeviceTags, EventFlags, HandleEventType, KeyEvent, PointerEvent};
use crate::registry::HandlerRegistry;
use crate::transport::message::{MessageId, Packet, ReportKeyEvent, ReportPointerEvent};
use crate::transport::SessionRegistry;

use super::{PipelineStage, StageResult};

/// First-refusal fan-out over the interceptor table.
pub struct InterceptorStage {
    registry: Arc<HandlerRegistry>,
    sessions: Arc<SessionRegistry>,
}

impl InterceptorStage {
    /// Create the stage over the shared registration tables.
    pub fn new(registry: Arc<HandlerRegistry>, sessions: Arc<SessionRegistry>) -> Self {
        Self { registry, sessions }
    }

    fn deliver(&self, handler_id: i32, session_fd: i32, packet: Packet) {
        match self.sessions.get_session(session_fd) {
            Some(session) => {
                if !session.send_msg(packet) {
                    warn!(
                        "Interceptor delivery failed: handler id={}, session fd={}",
                        handler_id, session_fd
                    );
                }
            }
            None => {
                // Session vanished between snapshot and delivery; cleanup
                // arrives through the session-deleted callback.
                debug!(
                    "Interceptor session fd={} gone before delivery (handler id={})",
                    session_fd, handler_id
                );
            }
        }
    }
}

impl PipelineStage for InterceptorStage {
    fn name(&self) -> &'static str {
        "interceptor"
    }

    fn handle_key(&self, event: &mut KeyEvent) -> StageResult {
        if event.flags.contains(EventFlags::NO_INTERCEPT) {
            return StageResult::Forward;
        }
        let matched = self
            .registry
            .interceptors_matching(HandleEventType::KEY, DeviceTags::KEYBOARD);
        if matched.is_empty() {
            return StageResult::Forward;
        }

        for record in &matched {
            let body = ReportKeyEvent {
                handler_id: record.id,
                event: event.clone(),
            };
            match Packet::encode(MessageId::ReportKeyEvent, &body) {
                Ok(packet) => self.deliver(record.id, record.session_fd, packet),
                Err(e) => warn!("Key event {} encode failed: {}", event.id, e),
            }
        }
        debug!(
            "Key event {} intercepted by {} handler(s)",
            event.id,
            matched.len()
        );
        StageResult::Consumed
    }

    fn handle_pointer(&self, event: &mut PointerEvent) -> StageResult {
        if event.flags.contains(EventFlags::NO_INTERCEPT) {
            return StageResult::Forward;
        }
        let event_type = if event.is_gesture() {
            HandleEventType::TOUCH_GESTURE
        } else {
            HandleEventType::POINTER
        };
        let tags = DeviceTags::for_source(event.source);

        let matched = self.registry.interceptors_matching(event_type, tags);
        if matched.is_empty() {
            return StageResult::Forward;
        }

        for record in &matched {
            let body = ReportPointerEvent {
                handler_id: record.id,
                event: event.clone(),
            };
            match Packet::encode(MessageId::ReportPointerEvent, &body) {
                Ok(packet) => self.deliver(record.id, record.session_fd, packet),
                Err(e) => warn!("Pointer event {} encode failed: {}", event.id, e),
            }
        }
        debug!(
            "Pointer event {} intercepted by {} handler(s)",
            event.id,
            matched.len()
        );
        StageResult::Consumed
    }
}
