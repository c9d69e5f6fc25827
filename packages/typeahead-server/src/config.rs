//! Server configuration
//!
//! Defaults carry the keepalive and paging constants the browser client is
//! written against. The binary maps its command-line flags onto these.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Results delivered per page (and buffered per search session).
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// A connection is dropped if nothing (pong or data) arrives within this window.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(10);

/// A single outbound write that cannot complete within this window ends the
/// connection.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Largest inbound frame accepted from a client, in bytes.
pub const DEFAULT_READ_LIMIT: usize = 512;

/// Rendered fragments waiting for the writer, per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 8;

/// Per-connection settings shared by every connection of a registry.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub page_size: usize,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub read_limit: usize,
    pub outbound_capacity: usize,
    /// Start an empty-prefix search as soon as a connection is registered.
    pub initial_search: bool,
}

impl SessionConfig {
    /// Ping cadence: 90% of the read-deadline window, so a healthy client's
    /// pong always lands before the deadline.
    pub fn ping_interval(&self) -> Duration {
        self.pong_wait * 9 / 10
    }

    /// Page size with the floor of one item applied.
    pub fn effective_page_size(&self) -> usize {
        self.page_size.max(1)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pong_wait: DEFAULT_PONG_WAIT,
            write_wait: DEFAULT_WRITE_WAIT,
            read_limit: DEFAULT_READ_LIMIT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            initial_search: true,
        }
    }
}

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Newline-delimited dictionary the index is built from.
    pub words_path: PathBuf,
    pub session: SessionConfig,
    /// Collect metrics and log a snapshot every `metrics_interval`.
    pub metrics: bool,
    pub metrics_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 4040)),
            words_path: PathBuf::from("words.txt"),
            session: SessionConfig::default(),
            metrics: false,
            metrics_interval: Duration::from_secs(60),
        }
    }
}
