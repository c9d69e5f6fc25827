//! Connection - one client WebSocket and the two loops serving it
//!
//! A connection runs a reader loop and a writer loop as separate tasks:
//!
//! - The reader decodes inbound frames and routes them through the
//!   [`SessionRegistry`]. It owns the read deadline: every pong (or any other
//!   frame) pushes the deadline out by `pong_wait`; when it passes the
//!   connection is torn down.
//! - The writer is the only task that touches the socket sink. It drains the
//!   bounded outbound queue and sends a keepalive ping whenever the ping
//!   ticker fires while nothing is queued.
//!
//! Either loop ending tears the whole connection down through
//! [`SessionRegistry::unregister`], which cancels the connection token. The
//! token is the parent of every search session started on this connection,
//! so teardown also stops any running walk.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Result, SearchError};
use crate::event::Envelope;
use crate::prefix_index::PrefixIndex;
use crate::render;
use crate::session::{Page, SearchSession};
use crate::session_registry::SessionRegistry;

/// Unique identifier for a client connection
pub type ConnectionId = usize;

/// Connection lifecycle. Moves forward only; a closed connection is never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    /// Registered, both loops running.
    Active = 1,
    /// A loop hit a fatal error or the client disconnected.
    Closing = 2,
    /// Removed from the registry, socket closed, session canceled.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Per-client state shared by the reader loop, the writer loop and the
/// registry.
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<String>,
    /// Current search. Written and read by the event path only.
    active: Mutex<Option<SearchSession>>,
    /// Prefix of the current search, readable while a handler holds `active`.
    prefix: StdMutex<Option<String>>,
    closing: CancellationToken,
    state: AtomicU8,
}

impl Connection {
    /// Create a connection in the `Connecting` state together with the
    /// receiving end of its outbound queue, which belongs to the writer loop.
    pub fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        outbound_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(outbound_capacity.max(1));
        let conn = Arc::new(Self {
            id,
            peer,
            outbound,
            active: Mutex::new(None),
            prefix: StdMutex::new(None),
            closing: CancellationToken::new(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Cancelled once teardown starts.
    pub fn closing_token(&self) -> &CancellationToken {
        &self.closing
    }

    /// Prefix of the most recently started search, if any.
    pub fn current_prefix(&self) -> Option<String> {
        self.prefix.lock().unwrap().clone()
    }

    pub(crate) fn mark_active(&self) -> bool {
        self.transition(ConnectionState::Connecting, ConnectionState::Active)
    }

    /// Move to `Closing`. Only the first caller gets `true`.
    pub(crate) fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn finish_close(&self) {
        self.closing.cancel();
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Queue a rendered fragment for the writer, waiting for room.
    ///
    /// Fails with `ConnectionClosed` once teardown has started or the writer
    /// is gone.
    pub async fn enqueue(&self, html: String) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(SearchError::ConnectionClosed),
            sent = self.outbound.send(html) => sent.map_err(|_| SearchError::ConnectionClosed),
        }
    }

    /// Queue a fragment only if there is room right now.
    pub fn try_enqueue(&self, html: String) -> bool {
        !self.closing.is_cancelled() && self.outbound.try_send(html).is_ok()
    }

    /// Cancel the current search (if any), start a new one for `prefix` and
    /// collect its first page.
    ///
    /// Returns the page and whether a previous session was superseded.
    pub(crate) async fn start_search(
        &self,
        index: Arc<PrefixIndex<()>>,
        prefix: String,
        page_size: usize,
    ) -> (Page, bool) {
        let mut slot = self.active.lock().await;

        let superseded = match slot.take() {
            Some(previous) => {
                previous.cancel();
                true
            }
            None => false,
        };
        *self.prefix.lock().unwrap() = Some(prefix.clone());

        let mut session = SearchSession::start(index, prefix, page_size, &self.closing);
        let page = session.collect_page(page_size).await;
        *slot = Some(session);

        (page, superseded)
    }

    /// Collect the next page of the current search. Without a search the
    /// page is empty and offers no continuation.
    pub(crate) async fn next_page(&self, page_size: usize) -> Page {
        let mut slot = self.active.lock().await;
        match slot.as_mut() {
            Some(session) => session.collect_page(page_size).await,
            None => Page::default(),
        }
    }

    /// Run the reader and writer loops until the connection is torn down.
    pub async fn run<S>(
        self: Arc<Self>,
        ws: WebSocketStream<S>,
        outbound: mpsc::Receiver<String>,
        registry: Arc<SessionRegistry>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();

        let writer = tokio::spawn(write_loop(
            Arc::clone(&self),
            sink,
            outbound,
            Arc::clone(&registry),
        ));
        let reader = tokio::spawn(read_loop(Arc::clone(&self), stream, Arc::clone(&registry)));

        let (read_result, write_result) = tokio::join!(reader, writer);
        for result in [read_result, write_result] {
            if let Err(e) = result {
                warn!(conn = self.id, "connection task failed: {}", e);
                registry.unregister(&self);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

async fn read_loop<S>(
    conn: Arc<Connection>,
    mut stream: SplitStream<WebSocketStream<S>>,
    registry: Arc<SessionRegistry>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let pong_wait = registry.config().pong_wait;
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let next = tokio::select! {
            _ = conn.closing.cancelled() => break,
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                debug!(conn = conn.id, "no pong within {:?}, closing", pong_wait);
                break;
            }
            Ok(None) => {
                debug!(conn = conn.id, "stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                log_socket_error(conn.id, "read", &e);
                registry.record_error(&e.into());
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        deadline = Instant::now() + pong_wait;

        let payload = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Ping(_) | Message::Pong(_) => {
                trace!(conn = conn.id, "keepalive");
                continue;
            }
            Message::Close(frame) => {
                debug!(conn = conn.id, ?frame, "client closed connection");
                break;
            }
            Message::Frame(_) => continue,
        };

        let envelope = match Envelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn = conn.id, code = e.code(), "dropping connection: {}", e);
                registry.record_error(&e);
                break;
            }
        };

        if let Err(e) = registry.route_event(envelope, &conn).await {
            if e.is_fatal() {
                debug!(conn = conn.id, code = e.code(), "{}", e);
                break;
            }
            debug!(conn = conn.id, code = e.code(), "rejected event: {}", e);
            if conn.enqueue(render::error_fragment(&e)).await.is_err() {
                break;
            }
        }
    }

    registry.unregister(&conn);
}

/// How a single outbound write ended.
enum WriteEnd {
    Sent,
    /// Write failed or the peer stopped accepting data; the sink is unusable.
    Failed,
    /// Teardown started while the write was pending.
    Abandoned,
}

async fn write_loop<S>(
    conn: Arc<Connection>,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<String>,
    registry: Arc<SessionRegistry>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ping_interval = registry.config().ping_interval();
    let write_wait = registry.config().write_wait;
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end = loop {
        let (message, op) = tokio::select! {
            biased;
            _ = conn.closing.cancelled() => break WriteEnd::Sent,
            queued = outbound.recv() => match queued {
                Some(html) => (Message::Text(html), "write"),
                None => {
                    debug!(conn = conn.id, "outbound queue closed");
                    break WriteEnd::Sent;
                }
            },
            _ = ticker.tick() => (Message::Ping(Vec::new()), "ping"),
        };

        match write_frame(&conn, &mut sink, message, write_wait, &registry, op).await {
            WriteEnd::Sent => {}
            end => break end,
        }
    };

    // A sink that failed or is stuck mid-write gets no close frame; dropping
    // it with the reader half closes the socket.
    if let WriteEnd::Sent = end {
        let _ = tokio::time::timeout(write_wait, async {
            sink.send(Message::Close(None)).await?;
            sink.close().await
        })
        .await;
    }

    registry.unregister(&conn);
}

/// Send one frame, giving up when teardown starts or the peer does not take
/// it within `write_wait`.
async fn write_frame<S>(
    conn: &Connection,
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    message: Message,
    write_wait: Duration,
    registry: &SessionRegistry,
    op: &str,
) -> WriteEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = conn.closing.cancelled() => WriteEnd::Abandoned,
        sent = tokio::time::timeout(write_wait, sink.send(message)) => match sent {
            Ok(Ok(())) => WriteEnd::Sent,
            Ok(Err(e)) => {
                log_socket_error(conn.id, op, &e);
                registry.record_error(&e.into());
                WriteEnd::Failed
            }
            Err(_) => {
                warn!(conn = conn.id, op, "peer accepted nothing for {:?}, closing", write_wait);
                WriteEnd::Failed
            }
        },
    }
}

fn log_socket_error(id: ConnectionId, op: &str, err: &tungstenite::Error) {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            debug!(conn = id, op, "socket closed")
        }
        tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        ) => debug!(conn = id, op, "peer went away without closing"),
        other => warn!(conn = id, op, "socket error: {}", other),
    }
}

#[cfg(test)]
mod connection_tests {
    use super::*;

    fn index_of(words: &[&str]) -> Arc<PrefixIndex<()>> {
        Arc::new(words.iter().map(|w| (*w, ())).collect())
    }

    #[test]
    fn test_state_moves_forward_only() {
        let (conn, _rx) = Connection::new(1, None, 8);
        assert_eq!(conn.state(), ConnectionState::Connecting);

        assert!(conn.mark_active());
        assert!(!conn.mark_active());
        assert_eq!(conn.state(), ConnectionState::Active);

        assert!(conn.begin_close());
        assert!(!conn.begin_close());
        assert_eq!(conn.state(), ConnectionState::Closing);

        conn.finish_close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.mark_active());
        assert!(!conn.begin_close());
        assert!(conn.closing_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let (conn, mut rx) = Connection::new(1, None, 1);
        conn.enqueue("one".into()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("one"));

        conn.begin_close();
        conn.finish_close();
        assert!(matches!(
            conn.enqueue("two".into()).await,
            Err(SearchError::ConnectionClosed)
        ));
        assert!(!conn.try_enqueue("three".into()));
    }

    #[tokio::test]
    async fn test_enqueue_to_dropped_writer_fails() {
        let (conn, rx) = Connection::new(1, None, 1);
        drop(rx);
        assert!(matches!(
            conn.enqueue("x".into()).await,
            Err(SearchError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_try_enqueue_does_not_wait() {
        let (conn, _rx) = Connection::new(1, None, 1);
        assert!(conn.try_enqueue("a".into()));
        assert!(!conn.try_enqueue("b".into()));
    }

    #[tokio::test]
    async fn test_search_then_more_on_same_session() {
        let words: Vec<String> = (0..7).map(|i| format!("a{i}")).collect();
        let index: Arc<PrefixIndex<()>> =
            Arc::new(words.iter().map(|w| (w.as_str(), ())).collect());
        let (conn, _rx) = Connection::new(1, None, 8);

        let (first, superseded) = conn.start_search(index, "a".into(), 3).await;
        assert!(!superseded);
        assert_eq!(first.keys, vec!["a0", "a1", "a2"]);
        assert!(first.has_more);
        assert_eq!(conn.current_prefix().as_deref(), Some("a"));

        let second = conn.next_page(3).await;
        assert_eq!(second.keys, vec!["a3", "a4", "a5"]);
        let third = conn.next_page(3).await;
        assert_eq!(third.keys, vec!["a6"]);
        assert!(!third.has_more);
    }

    #[tokio::test]
    async fn test_new_search_supersedes_previous() {
        let index = index_of(&["cat", "car", "dog", "dot"]);
        let (conn, _rx) = Connection::new(1, None, 8);

        conn.start_search(Arc::clone(&index), "ca".into(), 1).await;
        let (page, superseded) = conn.start_search(index, "do".into(), 1).await;
        assert!(superseded);
        assert_eq!(page.keys, vec!["dog"]);

        let next = conn.next_page(1).await;
        assert_eq!(next.keys, vec!["dot"]);
    }

    #[tokio::test]
    async fn test_prefix_readable_while_session_slot_is_held() {
        let index = index_of(&["cat", "car"]);
        let (conn, _rx) = Connection::new(1, None, 8);
        conn.start_search(index, "ca".into(), 50).await;

        let _busy = conn.active.lock().await;
        assert_eq!(conn.current_prefix().as_deref(), Some("ca"));
    }

    #[tokio::test]
    async fn test_more_without_search_is_empty() {
        let (conn, _rx) = Connection::new(1, None, 8);
        let page = conn.next_page(50).await;
        assert!(page.keys.is_empty());
        assert!(!page.has_more);
        assert!(conn.current_prefix().is_none());
    }
}
