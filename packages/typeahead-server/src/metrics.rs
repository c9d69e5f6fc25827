//! Server-wide metrics for the typeahead server
//!
//! Lightweight, thread-safe counters plus a rolling window of page
//! collection latencies. Metrics are per server (not per connection).
//!
//! # Overview
//!
//! - Connection lifecycle counts (opened, closed, currently open)
//! - Searches started and superseded
//! - Pages and items delivered, with latency percentiles (p50, p95, p99)
//! - Error counts by kind (protocol, routing, socket)
//!
//! Disabled unless the server runs with `--metrics`; the registry then
//! records into one shared `Arc<Metrics>` and the binary logs a snapshot
//! periodically.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use typeahead::metrics::Metrics;
//!
//! let metrics = Metrics::new();
//! metrics.record_page(Duration::from_micros(250), 50);
//!
//! let snap = metrics.snapshot();
//! assert_eq!(snap.pages_served, 1);
//! assert_eq!(snap.items_delivered, 50);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::SearchError;

/// Number of page latencies retained for percentile calculation.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Pages slower than this are counted separately.
pub const SLOW_PAGE_THRESHOLD: Duration = Duration::from_millis(50);

/// Thread-safe metrics collector.
///
/// Create one per server and share it (wrapped in `Arc`) with the registry.
pub struct Metrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,

    searches_started: AtomicU64,
    searches_superseded: AtomicU64,

    pages_served: AtomicU64,
    items_delivered: AtomicU64,
    slow_pages: AtomicU64,

    /// Rolling window of recent page latencies in microseconds.
    latencies_us: Mutex<VecDeque<u64>>,
    latency_sum_us: AtomicU64,

    protocol_errors: AtomicU64,
    routing_errors: AtomicU64,
    socket_errors: AtomicU64,

    started_at: Instant,
}

/// Point-in-time copy of all metrics.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    /// Opened minus closed
    pub connections_open: u64,

    pub searches_started: u64,
    pub searches_superseded: u64,

    pub pages_served: u64,
    pub items_delivered: u64,
    /// Pages that took at least SLOW_PAGE_THRESHOLD to collect
    pub slow_pages: u64,
    pub page_p50_us: u64,
    pub page_p95_us: u64,
    pub page_p99_us: u64,
    pub page_avg_us: u64,

    pub protocol_errors: u64,
    pub routing_errors: u64,
    pub socket_errors: u64,

    pub uptime_secs: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            searches_started: AtomicU64::new(0),
            searches_superseded: AtomicU64::new(0),
            pages_served: AtomicU64::new(0),
            items_delivered: AtomicU64::new(0),
            slow_pages: AtomicU64::new(0),
            latencies_us: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            latency_sum_us: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            routing_errors: AtomicU64::new(0),
            socket_errors: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a new search; `superseded` is true when it replaced a running one.
    pub fn record_search(&self, superseded: bool) {
        self.searches_started.fetch_add(1, Ordering::Relaxed);
        if superseded {
            self.searches_superseded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record one delivered page.
    ///
    /// O(1) amortized: atomic increments plus a bounded deque push.
    pub fn record_page(&self, elapsed: Duration, items: usize) {
        self.pages_served.fetch_add(1, Ordering::Relaxed);
        self.items_delivered.fetch_add(items as u64, Ordering::Relaxed);
        if elapsed >= SLOW_PAGE_THRESHOLD {
            self.slow_pages.fetch_add(1, Ordering::Relaxed);
        }

        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        let mut latencies = self.latencies_us.lock().unwrap();
        if latencies.len() >= LATENCY_WINDOW_SIZE {
            if let Some(old) = latencies.pop_front() {
                self.latency_sum_us.fetch_sub(old, Ordering::Relaxed);
            }
        }
        latencies.push_back(micros);
        self.latency_sum_us.fetch_add(micros, Ordering::Relaxed);
    }

    /// Count an error by kind.
    pub fn record_error(&self, err: &SearchError) {
        let counter = match err {
            SearchError::Protocol(_) => &self.protocol_errors,
            SearchError::UnknownTrigger(_) | SearchError::BadPayload(_) => &self.routing_errors,
            SearchError::Socket(_) | SearchError::Io(_) | SearchError::ConnectionClosed => {
                &self.socket_errors
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters.
    ///
    /// O(LATENCY_WINDOW_SIZE) for the percentile sort; called on the
    /// logging interval, not per page.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99, avg) = {
            let latencies = self.latencies_us.lock().unwrap();
            if latencies.is_empty() {
                (0, 0, 0, 0)
            } else {
                let mut sorted: Vec<u64> = latencies.iter().copied().collect();
                sorted.sort_unstable();

                let len = sorted.len();
                let p50 = sorted[len * 50 / 100];
                let p95 = sorted[len * 95 / 100];
                let p99 = sorted.get(len * 99 / 100).copied().unwrap_or(sorted[len - 1]);
                let avg = self.latency_sum_us.load(Ordering::Relaxed) / len as u64;

                (p50, p95, p99, avg)
            }
        };

        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);

        MetricsSnapshot {
            connections_opened: opened,
            connections_closed: closed,
            connections_open: opened.saturating_sub(closed),
            searches_started: self.searches_started.load(Ordering::Relaxed),
            searches_superseded: self.searches_superseded.load(Ordering::Relaxed),
            pages_served: self.pages_served.load(Ordering::Relaxed),
            items_delivered: self.items_delivered.load(Ordering::Relaxed),
            slow_pages: self.slow_pages.load(Ordering::Relaxed),
            page_p50_us: p50,
            page_p95_us: p95,
            page_p99_us: p99,
            page_avg_us: avg,
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            routing_errors: self.routing_errors.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
