//! Monitor Stage
//!
//! Monitors receive a copy of events alongside normal dispatch. For
//! touchscreen sequences a monitor may additionally claim the sequence with
//! `mark_consumed`: the app receives a synthesized CANCEL and subsequent
//! events of the sequence stop reaching it, while monitor deliveries
//! continue.
//!
//! Touchscreen fan-out is gated per destination by the ANR check; a blocked
//! session silently misses the delivery. Events flagged `NO_MONITOR` (the
//! synthesized CANCEL itself) bypass the stage entirely so they can reach
//! dispatch.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::anr::{AnrController, AnrKind};
use crate::event::{
    now_us, DeviceSource, EventFlags, HandleEventType, InputEvent, KeyEvent, PointerAction,
    PointerEvent,
};
use crate::registry::{HandlerRecord, HandlerRegistry};
use crate::transport::message::{MessageId, Packet, ReportKeyEvent, ReportPointerEvent};
use crate::transport::SessionRegistry;

use super::{EventInjector, PipelineStage, StageResult};

/// Consumption state of the active touchscreen sequence.
#[derive(Debug, Default)]
struct ConsumptionState {
    /// Event id of the DOWN that opened the active sequence.
    down_event_id: Option<i64>,
    /// Whether a monitor has claimed the active sequence.
    is_consumed: bool,
    /// Last touchscreen event seen, source for the synthesized CANCEL.
    last_event: Option<PointerEvent>,
}

/// Copy fan-out over the monitor table, with touch-sequence consumption.
pub struct MonitorStage {
    registry: Arc<HandlerRegistry>,
    sessions: Arc<SessionRegistry>,
    anr: Arc<dyn AnrController>,
    injector: EventInjector,
    state: Mutex<ConsumptionState>,
}

impl MonitorStage {
    /// Create the stage over the shared registration tables.
    pub fn new(
        registry: Arc<HandlerRegistry>,
        sessions: Arc<SessionRegistry>,
        anr: Arc<dyn AnrController>,
        injector: EventInjector,
    ) -> Self {
        Self {
            registry,
            sessions,
            anr,
            injector,
            state: Mutex::new(ConsumptionState::default()),
        }
    }

    /// Claim the active touch sequence for a monitor client.
    ///
    /// No-op (logged) when the session has no monitor registered, the
    /// sequence is already consumed, no sequence is active, or `event_id`
    /// belongs to a superseded sequence. Otherwise synthesizes a CANCEL
    /// from the last seen event and re-injects it at the pipeline entry,
    /// flagged to bypass interceptors and monitors.
    pub fn mark_consumed(&self, monitor_id: i32, event_id: i64, session_fd: i32) {
        let Some(record) = self.registry.monitor_by_id(monitor_id) else {
            warn!("mark_consumed: no monitor id={} registered", monitor_id);
            return;
        };
        if record.session_fd != session_fd {
            warn!(
                "mark_consumed: monitor id={} owned by fd={}, requested by fd={}",
                monitor_id, record.session_fd, session_fd
            );
            return;
        }

        let cancel = {
            let mut state = self.state.lock();
            if state.is_consumed {
                debug!("mark_consumed: sequence already consumed, ignoring");
                return;
            }
            let (Some(down_id), Some(last)) = (state.down_event_id, state.last_event.as_ref())
            else {
                debug!("mark_consumed: no active touch sequence");
                return;
            };
            if down_id > event_id {
                debug!(
                    "mark_consumed: event {} superseded by newer sequence (down id {})",
                    event_id, down_id
                );
                return;
            }

            let mut cancel = last.clone();
            state.is_consumed = true;
            cancel.action = PointerAction::Cancel;
            cancel.action_time_us = now_us();
            cancel.flags |= EventFlags::NO_INTERCEPT | EventFlags::NO_MONITOR;
            cancel
        };

        info!(
            "Touch sequence consumed by monitor id={} (fd={}), cancel synthesized",
            monitor_id, session_fd
        );
        self.injector.inject(InputEvent::Pointer(cancel));
    }

    /// Track the active sequence. Returns whether the sequence is consumed
    /// as of this event (captured before an emptying UP clears the state).
    fn update_consumption(&self, event: &PointerEvent) -> bool {
        let mut state = self.state.lock();

        if event.action == PointerAction::Down && event.pressed_count() == 1 {
            // Fresh sequence: single finger down.
            state.down_event_id = Some(event.id);
            state.is_consumed = false;
        }
        state.last_event = Some(event.clone());

        let consumed = state.is_consumed;
        if event.action == PointerAction::Up && event.pressed_count() == 0 {
            state.down_event_id = None;
            state.last_event = None;
        }
        consumed
    }

    fn matching_monitors(&self, event: &PointerEvent) -> Vec<HandlerRecord> {
        let monitors = self.registry.monitors_snapshot();
        if event.is_gesture() {
            monitors
                .into_iter()
                .filter(|r| r.event_types.contains(HandleEventType::TOUCH_GESTURE))
                .filter(|r| match (r.gesture, event.gesture) {
                    (Some(filter), Some(meta)) => {
                        filter.kind == meta.kind && filter.fingers == meta.fingers
                    }
                    (Some(_), None) => false,
                    (None, _) => true,
                })
                .collect()
        } else {
            let tags = crate::event::DeviceTags::for_source(event.source);
            monitors
                .into_iter()
                .filter(|r| r.matches(HandleEventType::POINTER, tags))
                .collect()
        }
    }

    fn fan_out_pointer(&self, event: &PointerEvent) {
        let gate_by_anr = event.source == DeviceSource::Touchscreen;
        for record in self.matching_monitors(event) {
            let Some(session) = self.sessions.get_session(record.session_fd) else {
                debug!(
                    "Monitor session fd={} gone before delivery (id={})",
                    record.session_fd, record.id
                );
                continue;
            };

            let now = now_us();
            if gate_by_anr && self.anr.trigger_anr(AnrKind::Monitor, now, record.session_fd) {
                // Deliberate withholding, not an error.
                debug!(
                    "Monitor delivery withheld: session fd={} blocked",
                    record.session_fd
                );
                continue;
            }

            let body = ReportPointerEvent {
                handler_id: record.id,
                event: event.clone(),
            };
            match Packet::encode(MessageId::ReportPointerEvent, &body) {
                Ok(packet) => {
                    if session.send_msg(packet) {
                        if gate_by_anr {
                            self.anr.add_timer(AnrKind::Monitor, event.id, now, record.session_fd);
                        }
                    } else {
                        warn!(
                            "Monitor delivery failed: id={}, session fd={}",
                            record.id, record.session_fd
                        );
                    }
                }
                Err(e) => warn!("Pointer event {} encode failed: {}", event.id, e),
            }
        }
    }

    fn fan_out_key(&self, event: &KeyEvent) {
        for record in self.registry.monitors_snapshot() {
            if !record.event_types.contains(HandleEventType::KEY) {
                continue;
            }
            let Some(session) = self.sessions.get_session(record.session_fd) else {
                continue;
            };
            let body = ReportKeyEvent {
                handler_id: record.id,
                event: event.clone(),
            };
            match Packet::encode(MessageId::ReportKeyEvent, &body) {
                Ok(packet) => {
                    if !session.send_msg(packet) {
                        warn!(
                            "Monitor delivery failed: id={}, session fd={}",
                            record.id, record.session_fd
                        );
                    }
                }
                Err(e) => warn!("Key event {} encode failed: {}", event.id, e),
            }
        }
    }
}

impl PipelineStage for MonitorStage {
    fn name(&self) -> &'static str {
        "monitor"
    }

    fn handle_key(&self, event: &mut KeyEvent) -> StageResult {
        if event.flags.contains(EventFlags::NO_MONITOR) {
            return StageResult::Forward;
        }
        self.fan_out_key(event);
        // Monitors observe key events, they never consume them.
        StageResult::Forward
    }

    fn handle_pointer(&self, event: &mut PointerEvent) -> StageResult {
        if event.flags.contains(EventFlags::NO_MONITOR) {
            return StageResult::Forward;
        }

        let consumed = if event.source == DeviceSource::Touchscreen {
            self.update_consumption(event)
        } else {
            false
        };

        self.fan_out_pointer(event);

        // Only touchscreen sequences can be withheld from the app.
        if consumed {
            debug!("Pointer event {} withheld from dispatch: sequence consumed", event.id);
            StageResult::Consumed
        } else {
            StageResult::Forward
        }
    }
}
