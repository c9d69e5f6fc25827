//! SearchSession - per-search mailbox between the index walk and a connection
//!
//! Each search gets its own bounded channel and a producer task that walks
//! the shared index and offers every match into the channel. The connection
//! drains the channel one page at a time, so the walk only runs as far ahead
//! as one page of buffered results. A parked producer is just a suspended
//! task; it holds no thread.
//!
//! A session is superseded by cancelling its token. The producer races every
//! send against that token, so an abandoned walk stops at its next offer
//! even when nobody will ever read the channel again. Sessions are
//! never shared: a new search always gets a fresh channel, which is what
//! keeps results of a superseded walk out of later pages.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::prefix_index::PrefixIndex;

/// Lifecycle of a search session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Producer alive, channel open.
    Running = 0,
    /// Superseded or owning connection closed before the walk finished.
    Canceled = 1,
    /// Walk completed; channel closed after the last match.
    Exhausted = 2,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionState::Canceled,
            2 => SessionState::Exhausted,
            _ => SessionState::Running,
        }
    }
}

/// Single-fire latch: the first terminal transition wins, later ones are
/// ignored. Natural completion and cancellation race to set it.
#[derive(Debug)]
struct EndLatch(AtomicU8);

impl EndLatch {
    fn new() -> Self {
        Self(AtomicU8::new(SessionState::Running as u8))
    }

    fn fire(&self, end: SessionState) -> bool {
        self.0
            .compare_exchange(
                SessionState::Running as u8,
                end as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// One page of results drained from a session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Page {
    pub keys: Vec<String>,
    /// True iff the page is full. A full page does not prove another match
    /// exists, it is only the cheapest signal available without reading ahead.
    pub has_more: bool,
}

/// A running (or finished) search over one prefix.
pub struct SearchSession {
    prefix: String,
    cancel: CancellationToken,
    latch: Arc<EndLatch>,
    rx: mpsc::Receiver<String>,
    producer: Option<JoinHandle<()>>,
}

impl SearchSession {
    /// Start streaming every key under `prefix` into a channel holding at
    /// most `capacity` undelivered keys.
    ///
    /// The session's token is a child of `parent`, so cancelling the owning
    /// connection also stops its search. Must be called within a Tokio
    /// runtime.
    pub fn start(
        index: Arc<PrefixIndex<()>>,
        prefix: impl Into<String>,
        capacity: usize,
        parent: &CancellationToken,
    ) -> Self {
        let prefix = prefix.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = parent.child_token();
        let latch = Arc::new(EndLatch::new());

        let producer = tokio::spawn(produce(
            index,
            prefix.clone(),
            tx,
            cancel.clone(),
            Arc::clone(&latch),
        ));

        Self {
            prefix,
            cancel,
            latch,
            rx,
            producer: Some(producer),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn state(&self) -> SessionState {
        self.latch.state()
    }

    /// Raise the cancellation signal. Does not wait for the producer.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if self.latch.fire(SessionState::Canceled) {
            tracing::trace!(prefix = %self.prefix, "search session canceled");
        }
    }

    /// Drain up to `max_items` keys, stopping early if the channel closes.
    pub async fn collect_page(&mut self, max_items: usize) -> Page {
        let mut keys = Vec::with_capacity(max_items);
        while keys.len() < max_items {
            let limit = max_items - keys.len();
            if self.rx.recv_many(&mut keys, limit).await == 0 {
                break;
            }
        }

        let has_more = keys.len() == max_items;
        Page { keys, has_more }
    }

    /// Wait for the producer to exit.
    pub async fn finished(&mut self) {
        if let Some(producer) = self.producer.take() {
            if let Err(e) = producer.await {
                tracing::warn!(prefix = %self.prefix, "search producer failed: {}", e);
            }
        }
    }
}

impl Drop for SearchSession {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for SearchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchSession")
            .field("prefix", &self.prefix)
            .field("state", &self.state())
            .finish()
    }
}

async fn produce(
    index: Arc<PrefixIndex<()>>,
    prefix: String,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    latch: Arc<EndLatch>,
) {
    let mut end = SessionState::Exhausted;
    for (key, _) in index.leaves(&prefix) {
        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = tx.send(key) => sent.is_ok(),
        };
        if !delivered {
            end = SessionState::Canceled;
            break;
        }
    }

    if latch.fire(end) {
        tracing::trace!(prefix = %prefix, state = ?end, "search producer finished");
    }
    // The channel closes here, after the terminal state is recorded.
    drop(tx);
}
