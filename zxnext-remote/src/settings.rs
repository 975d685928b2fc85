//! Session settings, captured once at construction.

use std::path::PathBuf;
use std::time::Duration;

use dzrp_protocol::Endpoint;

/// Configuration snapshot handed in by the embedding debugger.
#[derive(Debug, Clone)]
pub struct Settings {
    pub endpoint: Endpoint,
    /// Transport connect timeout.
    pub connect_timeout: Duration,
    /// Per-request response timeout; also bounds the window between a
    /// manual pause request and its notification.
    pub response_timeout: Duration,
    /// Wall-clock bound on a single step-out.
    pub step_out_watchdog: Duration,
    /// Snapshot to load right after connecting.
    pub auto_load: Option<PathBuf>,
}

impl Settings {
    pub fn new(endpoint: Endpoint) -> Self {
        Settings {
            endpoint,
            connect_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(3),
            step_out_watchdog: Duration::from_secs(5),
            auto_load: None,
        }
    }
}
