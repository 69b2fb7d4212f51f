//! # inputhub-server
//!
//! Service-side core of a multimodal input subsystem: normalized device
//! events are routed through a prioritized handler chain and delivered to
//! client windows over UNIX-domain-socket IPC, under a per-session
//! Application-Not-Responding (ANR) contract.
//!
//! # Architecture
//!
//! ```text
//! inputhub-server
//!   ├─> Event Pipeline (normalize -> filter -> interceptor ->
//!   │                   subscriber -> monitor -> dispatch)
//!   ├─> Handler Registry (bounded interceptor/monitor tables)
//!   ├─> Session Registry (UDS clients, lifecycle callbacks)
//!   ├─> Window Manager  (event -> owning session routing)
//!   └─> ANR Manager     (pending-event ledger, backpressure)
//! ```
//!
//! # Data Flow
//!
//! **Event path:** device source → pipeline → owning client session
//!
//! **Registration path:** client request → registry/subscriber tables →
//! affects subsequent event passes
//!
//! **Consumption path:** monitor `MARK_CONSUMED` → synthesized CANCEL →
//! re-injected at the pipeline entry, bypassing interceptors and monitors
//!
//! # Delivery semantics
//!
//! An event intercepted by at least one interceptor never reaches
//! subscribers, monitors, or the app. Monitors receive copies and may claim
//! an in-flight touch sequence. Dispatch is withheld, without error, while
//! the destination session is ANR-blocked.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// ANR backpressure tracking
pub mod anr;

/// Server configuration
pub mod config;

/// Normalized event model
pub mod event;

/// Pipeline stages and orchestration
pub mod pipeline;

/// Handler registration tables
pub mod registry;

/// Server assembly and run loop
pub mod server;

/// UDS transport, sessions, wire messages
pub mod transport;

/// Target window resolution
pub mod window;
