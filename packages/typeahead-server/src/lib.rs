//! Typeahead - live prefix search over WebSocket
//!
//! A read-only dictionary is loaded into a [`PrefixIndex`] once at startup.
//! Each browser connection types a prefix, gets the first page of matching
//! keys as an htmx fragment, and pulls further pages by scrolling. A new
//! keystroke supersedes the running search; the old walk is cancelled and
//! none of its results reach the client.

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod metrics;
pub mod prefix_index;
pub mod render;
pub mod server;
pub mod session;
pub mod session_registry;

pub use config::{ServerConfig, SessionConfig};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{Result, SearchError};
pub use event::{Envelope, Event};
pub use metrics::{Metrics, MetricsSnapshot};
pub use prefix_index::{PrefixIndex, WalkOutcome};
pub use server::Server;
pub use session::{Page, SearchSession, SessionState};
pub use session_registry::{ConnectionInfo, SessionRegistry};
