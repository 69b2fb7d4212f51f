//! Event Dispatch Pipeline
//!
//! Events pass through a fixed, ordered chain of stages:
//!
//! ```text
//! device event
//!     ↓
//! ┌───────────┐   ┌────────┐   ┌─────────────┐   ┌────────────┐   ┌─────────┐   ┌──────────┐
//! │ Normalize │ → │ Filter │ → │ Interceptor │ → │ Subscriber │ → │ Monitor │ → │ Dispatch │
//! └───────────┘   └────────┘   └─────────────┘   └────────────┘   └─────────┘   └──────────┘
//!                                                                                   ↓
//!                                                                             client session
//! ```
//!
//! The [`EventPipeline`] owns the ordered stage list and walks it for every
//! event; a stage returning [`StageResult::Consumed`] ends the pass. Stages
//! never hold a "next" reference — conditional stages are simply included or
//! left out when the list is built.
//!
//! One event is processed at a time, in arrival order. Timer callbacks
//! (subscriber durations, ANR timeouts) fire asynchronously and re-validate
//! their state against the current tables before acting.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::event::{InputEvent, KeyEvent, PointerEvent};

pub mod dispatch;
pub mod filter;
pub mod interceptor;
pub mod monitor;
pub mod normalize;
pub mod subscriber;

pub use dispatch::DispatchStage;
pub use filter::{EventFilter, FilterStage};
pub use interceptor::InterceptorStage;
pub use monitor::MonitorStage;
pub use normalize::NormalizeStage;
pub use subscriber::SubscriberStage;

/// What a stage decided about the event it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageResult {
    /// Stage claimed the event; later stages never see it.
    Consumed,
    /// Pass to the next stage.
    Forward,
}

/// One stage of the pipeline.
///
/// The default implementations forward, so a stage only overrides the event
/// kinds it participates in. Events are mutable because the normalize stage
/// stamps state onto them; later stages treat them as read-only and clone
/// before retaining anything.
pub trait PipelineStage: Send + Sync {
    /// Stage name for logging.
    fn name(&self) -> &'static str;

    /// Handle a key event.
    fn handle_key(&self, _event: &mut KeyEvent) -> StageResult {
        StageResult::Forward
    }

    /// Handle a pointer event.
    fn handle_pointer(&self, _event: &mut PointerEvent) -> StageResult {
        StageResult::Forward
    }
}

/// Handle for injecting events at the pipeline entry.
///
/// Cloned into the monitor stage so `mark_consumed` can feed its synthesized
/// CANCEL back through normalization and dispatch, and used by tests and the
/// device-event source alike.
#[derive(Debug, Clone)]
pub struct EventInjector {
    sender: mpsc::UnboundedSender<InputEvent>,
}

impl EventInjector {
    /// Create an injector and the receiver the event pump drains.
    pub fn channel() -> (EventInjector, mpsc::UnboundedReceiver<InputEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (EventInjector { sender }, receiver)
    }

    /// Queue an event for the next pump iteration.
    pub fn inject(&self, event: InputEvent) {
        if self.sender.send(event).is_err() {
            warn!("Event injection failed: pipeline pump stopped");
        }
    }
}

/// The ordered stage list.
pub struct EventPipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
}

impl EventPipeline {
    /// Build a pipeline from an ordered stage list.
    pub fn new(stages: Vec<Arc<dyn PipelineStage>>) -> Self {
        debug!(
            "Pipeline assembled: [{}]",
            stages.iter().map(|s| s.name()).collect::<Vec<_>>().join(" -> ")
        );
        Self { stages }
    }

    /// Run one event through the chain.
    ///
    /// Returns `true` when a stage consumed the event before the end.
    pub fn handle_event(&self, event: &mut InputEvent) -> bool {
        for stage in &self.stages {
            let result = match event {
                InputEvent::Key(ev) => stage.handle_key(ev),
                InputEvent::Pointer(ev) => stage.handle_pointer(ev),
            };
            if result == StageResult::Consumed {
                trace!("Event {} consumed by stage {}", event.id(), stage.name());
                return true;
            }
        }
        false
    }

    /// Stage names in order, for diagnostics.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}
