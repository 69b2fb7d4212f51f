//! Server Orchestration
//!
//! Assembles the pipeline, its collaborators and the UNIX-socket listener
//! into the running service.
//!
//! # Architecture
//!
//! ```text
//! InputHubServer
//!   ├─> SessionRegistry   (live client sessions, deleted callbacks)
//!   ├─> HandlerRegistry   (interceptor/monitor tables)
//!   ├─> WindowManager     (event -> owning session routing)
//!   ├─> AnrManager        (per-session dispatch backpressure)
//!   ├─> EventPipeline     (normalize -> filter -> interceptor ->
//!   │                      subscriber -> monitor -> dispatch)
//!   └─> UnixListener      (one reader/writer task pair per client)
//! ```
//!
//! # Threading Model
//!
//! - **Event pump task:** drains the injector channel and runs each event
//!   through the whole chain before the next; there is no intra-pipeline
//!   parallelism.
//! - **Connection tasks:** one reader and one writer per client. Requests
//!   mutate the registration tables under their own locks, concurrently
//!   with the pump.
//! - **Timer tasks:** subscriber durations and ANR timeouts; every timer
//!   callback re-validates state before acting.

mod connection;
mod source;

pub use source::{ChannelEventSource, EventSource};

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::anr::AnrManager;
use crate::config::Config;
use crate::event::InputEvent;
use crate::pipeline::{
    DispatchStage, EventInjector, EventPipeline, FilterStage, InterceptorStage, MonitorStage,
    NormalizeStage, PipelineStage, SubscriberStage,
};
use crate::registry::HandlerRegistry;
use crate::transport::SessionRegistry;
use crate::window::{WindowManager, WindowResolver};

use connection::RequestTargets;

/// The assembled input service.
pub struct InputHubServer {
    config: Arc<Config>,
    sessions: Arc<SessionRegistry>,
    registry: Arc<HandlerRegistry>,
    windows: Arc<WindowManager>,
    anr: Arc<AnrManager>,
    filter: Arc<FilterStage>,
    subscriber: Arc<SubscriberStage>,
    monitor: Arc<MonitorStage>,
    dispatch: Arc<DispatchStage>,
    pipeline: Arc<EventPipeline>,
    injector: EventInjector,
    event_rx: Option<mpsc::UnboundedReceiver<InputEvent>>,
}

impl InputHubServer {
    /// Assemble the service from configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let sessions = Arc::new(SessionRegistry::new(config.server.max_sessions));
        let registry = HandlerRegistry::new(Arc::clone(&sessions));
        let windows = Arc::new(WindowManager::new());
        let anr = AnrManager::new(config.anr.timeout_ms);
        let (injector, event_rx) = EventInjector::channel();

        let filter = Arc::new(FilterStage::new());
        let subscriber = Arc::new(SubscriberStage::new(Arc::clone(&sessions)));
        let monitor = Arc::new(MonitorStage::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&anr) as Arc<dyn crate::anr::AnrController>,
            injector.clone(),
        ));
        let dispatch = Arc::new(DispatchStage::new(
            Arc::clone(&windows) as Arc<dyn WindowResolver>,
            Arc::clone(&sessions),
            Arc::clone(&anr) as Arc<dyn crate::anr::AnrController>,
        ));

        // Per-session cleanup beyond the handler registry's own hook. Weak
        // references keep the registry from owning its owners.
        let weak_subscriber: Weak<SubscriberStage> = Arc::downgrade(&subscriber);
        let weak_anr: Weak<AnrManager> = Arc::downgrade(&anr);
        let weak_windows: Weak<WindowManager> = Arc::downgrade(&windows);
        sessions.add_session_deleted_callback(Box::new(move |session| {
            let fd = session.fd();
            if let Some(subscriber) = weak_subscriber.upgrade() {
                subscriber.on_session_lost(fd);
            }
            if let Some(anr) = weak_anr.upgrade() {
                anr.on_session_lost(fd);
            }
            if let Some(windows) = weak_windows.upgrade() {
                windows.on_session_lost(fd);
            }
        }));

        let mut stages: Vec<Arc<dyn PipelineStage>> = Vec::new();
        stages.push(Arc::new(NormalizeStage::new()));
        if config.input.enable_filters {
            stages.push(Arc::clone(&filter) as Arc<dyn PipelineStage>);
        }
        stages.push(Arc::new(InterceptorStage::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
        )));
        stages.push(Arc::clone(&subscriber) as Arc<dyn PipelineStage>);
        stages.push(Arc::clone(&monitor) as Arc<dyn PipelineStage>);
        stages.push(Arc::clone(&dispatch) as Arc<dyn PipelineStage>);
        let pipeline = Arc::new(EventPipeline::new(stages));

        Ok(Self {
            config,
            sessions,
            registry,
            windows,
            anr,
            filter,
            subscriber,
            monitor,
            dispatch,
            pipeline,
            injector,
            event_rx: Some(event_rx),
        })
    }

    /// Injector feeding the pipeline entry (device ingestion side).
    pub fn injector(&self) -> EventInjector {
        self.injector.clone()
    }

    /// Window table for routing updates.
    pub fn window_manager(&self) -> Arc<WindowManager> {
        Arc::clone(&self.windows)
    }

    /// Live session table.
    pub fn session_registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.sessions)
    }

    /// Handler registration tables.
    pub fn handler_registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.registry)
    }

    /// In-process filter stage.
    pub fn filter_stage(&self) -> Arc<FilterStage> {
        Arc::clone(&self.filter)
    }

    /// Dispatch stage, for outcome counters.
    pub fn dispatch_stage(&self) -> Arc<DispatchStage> {
        Arc::clone(&self.dispatch)
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn run(mut self) -> Result<()> {
        let socket_path = self.config.server.socket_path.clone();
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory {:?}", parent))?;
        }
        // A stale socket file from a previous run blocks bind.
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("Failed to remove stale socket {:?}", socket_path))?;
        }
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind {:?}", socket_path))?;
        info!("Listening on {:?}", socket_path);

        // Event pump: one event at a time through the whole chain.
        let pipeline = Arc::clone(&self.pipeline);
        let gestures_enabled = self.config.input.enable_touch_gestures;
        let event_rx = self.event_rx.take().context("Server already running")?;
        let pump = tokio::spawn(async move {
            let mut source = ChannelEventSource::new(event_rx);
            while let Some(mut event) = source.next_event().await {
                if !gestures_enabled {
                    if let InputEvent::Pointer(ev) = &event {
                        if ev.is_gesture() {
                            debug!("Gesture event {} dropped: gestures disabled", ev.id);
                            continue;
                        }
                    }
                }
                pipeline.handle_event(&mut event);
            }
            debug!("Event pump stopped: injector closed");
        });

        let targets = Arc::new(RequestTargets {
            sessions: Arc::clone(&self.sessions),
            registry: Arc::clone(&self.registry),
            subscriber: Arc::clone(&self.subscriber),
            monitor: Arc::clone(&self.monitor),
            anr: Arc::clone(&self.anr),
        });

        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            tokio::spawn(connection::handle_connection(
                                stream,
                                Arc::clone(&targets),
                            ));
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
            }
        }

        pump.abort();
        if let Err(e) = std::fs::remove_file(&socket_path) {
            debug!("Socket cleanup failed: {}", e);
        }
        info!("Server stopped");
        Ok(())
    }
}
