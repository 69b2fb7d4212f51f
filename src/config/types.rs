//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UNIX socket path clients connect to
    pub socket_path: PathBuf,
    /// Maximum concurrent client sessions
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/inputhub/inputhub.sock"),
            max_sessions: 64,
        }
    }
}

/// ANR (Application Not Responding) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnrConfig {
    /// How long a dispatched event may stay unacknowledged before the
    /// session counts as blocked, in milliseconds
    pub timeout_ms: u64,
}

impl Default for AnrConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

/// Input pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Whether touchpad gesture events are processed at all
    pub enable_touch_gestures: bool,
    /// Whether the in-process filter stage is included in the chain
    pub enable_filters: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            enable_touch_gestures: true,
            enable_filters: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace|debug|info|warn|error)
    pub level: String,
    /// Log format (json|pretty|compact)
    pub format: String,
    /// Optional log file path (in addition to stdout)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}
