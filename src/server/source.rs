//! Device Event Sources
//!
//! The seam between raw device ingestion (out of process, out of scope) and
//! the dispatch pipeline. A source yields normalized events; the server's
//! event pump drains it serially.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::event::InputEvent;

/// Produces normalized input events for the pipeline pump.
#[async_trait]
pub trait EventSource: Send {
    /// Next event, or `None` when the source is exhausted.
    async fn next_event(&mut self) -> Option<InputEvent>;
}

/// Channel-backed source fed by an
/// [`EventInjector`](crate::pipeline::EventInjector).
///
/// This is both the production entry point (the ingestion layer holds the
/// injector) and the re-entry point for synthesized CANCEL events.
pub struct ChannelEventSource {
    receiver: mpsc::UnboundedReceiver<InputEvent>,
}

impl ChannelEventSource {
    /// Wrap the receiving side of an injector channel.
    pub fn new(receiver: mpsc::UnboundedReceiver<InputEvent>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn next_event(&mut self) -> Option<InputEvent> {
        self.receiver.recv().await
    }
}
