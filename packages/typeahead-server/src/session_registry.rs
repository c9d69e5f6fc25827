//! SessionRegistry - thread-safe set of live connections and the event router
//!
//! The registry owns the shared (read-only) index and the per-connection
//! settings. Every accepted socket is registered here, every inbound event
//! is routed through [`SessionRegistry::route_event`], and every teardown
//! path ends in [`SessionRegistry::unregister`].
//!
//! # Concurrency
//!
//! - The connection map sits behind a `RwLock`; lookups and broadcast take
//!   the read side, register/unregister the write side. The lock is never
//!   held across an await.
//! - Each connection serializes its own events (one reader loop), so the
//!   handlers below never race on a connection's search slot.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionId, ConnectionState};
use crate::error::{Result, SearchError};
use crate::event::{Envelope, Event};
use crate::metrics::Metrics;
use crate::prefix_index::PrefixIndex;
use crate::render::{self, Swap};

/// Connection information for admin listings
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
    pub state: ConnectionState,
    /// Prefix of the current search (None before the first search)
    pub prefix: Option<String>,
}

/// Registry of live connections sharing one index.
pub struct SessionRegistry {
    index: Arc<PrefixIndex<()>>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    config: SessionConfig,
    metrics: Option<Arc<Metrics>>,
    next_id: AtomicUsize,
}

impl SessionRegistry {
    /// Create a registry serving `index`. The index is frozen from here on.
    pub fn new(index: PrefixIndex<()>, config: SessionConfig) -> Self {
        Self {
            index: Arc::new(index),
            connections: RwLock::new(HashMap::new()),
            config,
            metrics: None,
            next_id: AtomicUsize::new(1),
        }
    }

    /// Record into `metrics` from now on.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn index(&self) -> &PrefixIndex<()> {
        &self.index
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Create a connection with a fresh id and register it.
    ///
    /// Returns the connection and the receiving end of its outbound queue.
    pub fn open_connection(
        &self,
        peer: Option<SocketAddr>,
    ) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (conn, outbound) = Connection::new(id, peer, self.config.outbound_capacity);
        self.register(Arc::clone(&conn));
        (conn, outbound)
    }

    /// Add a connection to the live set and mark it active.
    pub fn register(&self, conn: Arc<Connection>) {
        if !conn.mark_active() {
            warn!(conn = conn.id(), state = ?conn.state(), "refusing to register connection");
            return;
        }

        let id = conn.id();
        let peer = conn.peer();
        self.connections.write().unwrap().insert(id, conn);

        if let Some(m) = &self.metrics {
            m.record_connection_opened();
        }
        info!(conn = id, ?peer, "connection registered");
    }

    /// Remove a connection and tear it down. Idempotent: the reader, the
    /// writer and shutdown may all call this for the same connection.
    ///
    /// Cancelling the connection token stops both loops and the current
    /// search. The loops close the socket on their way out.
    pub fn unregister(&self, conn: &Connection) {
        if !conn.begin_close() {
            return;
        }

        self.connections.write().unwrap().remove(&conn.id());
        conn.finish_close();

        if let Some(m) = &self.metrics {
            m.record_connection_closed();
        }
        info!(conn = conn.id(), "connection closed");
    }

    /// Register a freshly upgraded socket and serve it until it closes.
    pub async fn serve<S>(self: Arc<Self>, ws: WebSocketStream<S>, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (conn, outbound) = self.open_connection(peer);

        if self.config.initial_search {
            if let Err(e) = self.handle_search(&conn, String::new()).await {
                debug!(conn = conn.id(), "initial search not delivered: {}", e);
            }
        }

        conn.run(ws, outbound, self).await;
    }

    /// Decode an envelope into an event and dispatch it.
    ///
    /// Routing errors (`UnknownTrigger`, `BadPayload`) are returned for the
    /// caller to report inline; the connection stays usable.
    pub async fn route_event(&self, envelope: Envelope, conn: &Connection) -> Result<()> {
        debug!(
            conn = conn.id(),
            trigger = envelope.trigger(),
            target = ?envelope.headers.target,
            "routing event"
        );

        let result = match Event::try_from(envelope) {
            Ok(event) => self.dispatch(event, conn).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    /// Run the handler for an already decoded event.
    pub async fn dispatch(&self, event: Event, conn: &Connection) -> Result<()> {
        match event {
            Event::Search { input } => self.handle_search(conn, input).await,
            Event::More => self.handle_more(conn).await,
        }
    }

    /// Supersede the connection's search with one for `input` and send its
    /// first page, replacing whatever the client was showing.
    async fn handle_search(&self, conn: &Connection, input: String) -> Result<()> {
        let started = Instant::now();
        let page_size = self.config.effective_page_size();
        debug!(conn = conn.id(), input = %input, "search");

        let (page, superseded) = conn
            .start_search(Arc::clone(&self.index), input, page_size)
            .await;

        if let Some(m) = &self.metrics {
            m.record_search(superseded);
            m.record_page(started.elapsed(), page.keys.len());
        }

        conn.enqueue(render::page_fragment(Swap::Replace, &page)).await
    }

    /// Send the next page of the connection's current search.
    async fn handle_more(&self, conn: &Connection) -> Result<()> {
        let started = Instant::now();
        let page = conn.next_page(self.config.effective_page_size()).await;
        debug!(conn = conn.id(), items = page.keys.len(), has_more = page.has_more, "more");

        if let Some(m) = &self.metrics {
            m.record_page(started.elapsed(), page.keys.len());
        }

        conn.enqueue(render::page_fragment(Swap::Append, &page)).await
    }

    pub(crate) fn record_error(&self, err: &SearchError) {
        if let Some(m) = &self.metrics {
            m.record_error(err);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    pub fn get_connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().unwrap().get(&id).cloned()
    }

    /// List live connections, ordered by id.
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let connections = self.connections.read().unwrap();
        let mut infos: Vec<ConnectionInfo> = connections
            .values()
            .map(|conn| ConnectionInfo {
                id: conn.id(),
                peer: conn.peer(),
                state: conn.state(),
                prefix: conn.current_prefix(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Offer a fragment to every live connection without waiting.
    ///
    /// Connections whose outbound queue is full are skipped. Returns how
    /// many connections accepted it.
    pub fn broadcast(&self, html: &str) -> usize {
        let connections = self.connections.read().unwrap();
        connections
            .values()
            .filter(|conn| conn.try_enqueue(html.to_string()))
            .count()
    }

    /// Tear down every live connection. Used on shutdown.
    pub fn close_all(&self) {
        let live: Vec<Arc<Connection>> = self.connections.read().unwrap().values().cloned().collect();
        if !live.is_empty() {
            info!(count = live.len(), "closing all connections");
        }
        for conn in live {
            self.unregister(&conn);
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("keys", &self.index.len())
            .field("connections", &self.connection_count())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use crate::render::{CONTINUATION_CONTROL, EMPTY_CONTROL};

    fn registry_with(words: &[String], page_size: usize) -> SessionRegistry {
        let index: PrefixIndex<()> = words.iter().map(|w| (w.as_str(), ())).collect();
        let config = SessionConfig {
            page_size,
            ..SessionConfig::default()
        };
        SessionRegistry::new(index, config)
    }

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|w| w.to_string()).collect()
    }

    fn search(input: &str) -> Envelope {
        let frame = format!(
            r#"{{"HEADERS":{{"HX-Trigger":"search"}},"payload":{{"input":"{}"}}}}"#,
            input
        );
        Envelope::decode(frame.as_bytes()).unwrap()
    }

    fn more() -> Envelope {
        Envelope::decode(br#"{"HEADERS":{"HX-Trigger":"more"},"payload":{}}"#).unwrap()
    }

    fn item_count(html: &str) -> usize {
        html.matches("<div class='item'>").count()
    }

    // ============================================================================
    // Registration
    // ============================================================================

    #[test]
    fn test_open_connection_registers_with_unique_ids() {
        let registry = registry_with(&words(&["a"]), 50);
        let (a, _rx_a) = registry.open_connection(None);
        let (b, _rx_b) = registry.open_connection(None);

        assert_ne!(a.id(), b.id());
        assert_eq!(registry.connection_count(), 2);
        assert_eq!(a.state(), ConnectionState::Active);
        assert!(registry.get_connection(a.id()).is_some());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let metrics = Arc::new(Metrics::new());
        let registry = registry_with(&words(&["a"]), 50).with_metrics(Arc::clone(&metrics));
        let (conn, _rx) = registry.open_connection(None);

        registry.unregister(&conn);
        registry.unregister(&conn);

        assert_eq!(registry.connection_count(), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.closing_token().is_cancelled());

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_opened, 1);
        assert_eq!(snap.connections_closed, 1);
    }

    #[test]
    fn test_closed_connection_cannot_register_again() {
        let registry = registry_with(&words(&["a"]), 50);
        let (conn, _rx) = registry.open_connection(None);
        registry.unregister(&conn);

        registry.register(Arc::clone(&conn));
        assert_eq!(registry.connection_count(), 0);
    }

    // ============================================================================
    // Event Routing
    // ============================================================================

    #[tokio::test]
    async fn test_search_sends_replace_fragment() {
        let registry = registry_with(&words(&["cat", "car", "cart", "dog"]), 50);
        let (conn, mut rx) = registry.open_connection(None);

        registry.route_event(search("ca"), &conn).await.unwrap();

        let html = rx.recv().await.unwrap();
        assert!(html.starts_with(r#"<div id="results" hx-swap-oob="innerHTML">"#));
        assert!(html.contains("<div class='item'>cat</div>\n<div class='item'>car</div>\n<div class='item'>cart</div>"));
        assert!(html.ends_with(EMPTY_CONTROL));
    }

    #[tokio::test]
    async fn test_more_continues_current_search() {
        let list: Vec<String> = (0..120).map(|i| format!("a{i:03}")).collect();
        let registry = registry_with(&list, 50);
        let (conn, mut rx) = registry.open_connection(None);

        registry.route_event(search("a"), &conn).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(item_count(&first), 50);
        assert!(first.ends_with(CONTINUATION_CONTROL));

        registry.route_event(more(), &conn).await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.starts_with(r#"<div id="results" hx-swap-oob="beforeend">"#));
        assert_eq!(item_count(&second), 50);
        assert!(second.contains("<div class='item'>a050</div>"));
        assert!(second.ends_with(CONTINUATION_CONTROL));

        registry.route_event(more(), &conn).await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(item_count(&third), 20);
        assert!(third.ends_with(EMPTY_CONTROL));
    }

    #[tokio::test]
    async fn test_more_without_search_sends_empty_page() {
        let registry = registry_with(&words(&["a"]), 50);
        let (conn, mut rx) = registry.open_connection(None);

        registry.route_event(more(), &conn).await.unwrap();
        let html = rx.recv().await.unwrap();
        assert_eq!(item_count(&html), 0);
        assert!(html.ends_with(EMPTY_CONTROL));
    }

    #[tokio::test]
    async fn test_new_search_supersedes_pages() {
        let mut list: Vec<String> = (0..200).map(|i| format!("a{i:03}")).collect();
        list.extend((0..200).map(|i| format!("b{i:03}")));
        let metrics = Arc::new(Metrics::new());
        let registry = registry_with(&list, 50).with_metrics(Arc::clone(&metrics));
        let (conn, mut rx) = registry.open_connection(None);

        registry.route_event(search("a"), &conn).await.unwrap();
        rx.recv().await.unwrap();
        registry.route_event(search("b"), &conn).await.unwrap();
        let replaced = rx.recv().await.unwrap();
        assert!(!replaced.contains("<div class='item'>a"));

        registry.route_event(more(), &conn).await.unwrap();
        let next = rx.recv().await.unwrap();
        assert_eq!(item_count(&next), 50);
        assert!(next.contains("<div class='item'>b050</div>"));
        assert!(!next.contains("<div class='item'>a"));

        let snap = metrics.snapshot();
        assert_eq!(snap.searches_started, 2);
        assert_eq!(snap.searches_superseded, 1);
        assert_eq!(snap.pages_served, 3);
    }

    #[tokio::test]
    async fn test_unknown_trigger_is_returned_not_sent() {
        let metrics = Arc::new(Metrics::new());
        let registry = registry_with(&words(&["a"]), 50).with_metrics(Arc::clone(&metrics));
        let (conn, mut rx) = registry.open_connection(None);

        let envelope = Envelope::decode(br#"{"HEADERS":{"HX-Trigger":"dance"},"payload":{}}"#).unwrap();
        let err = registry.route_event(envelope, &conn).await.unwrap_err();
        assert!(matches!(err, SearchError::UnknownTrigger(_)));
        assert!(!err.is_fatal());
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.snapshot().routing_errors, 1);
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_search_on_closed_connection_fails() {
        let registry = registry_with(&words(&["a"]), 50);
        let (conn, _rx) = registry.open_connection(None);
        registry.unregister(&conn);

        let err = registry.route_event(search("a"), &conn).await.unwrap_err();
        assert!(matches!(err, SearchError::ConnectionClosed));
    }

    // ============================================================================
    // Admin Operations
    // ============================================================================

    #[tokio::test]
    async fn test_list_connections_reports_prefix() {
        let registry = registry_with(&words(&["cat", "dog"]), 50);
        let (a, _rx_a) = registry.open_connection(None);
        let (_b, _rx_b) = registry.open_connection(None);

        registry.dispatch(Event::Search { input: "ca".into() }, &a).await.unwrap();

        let infos = registry.list_connections();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, a.id());
        assert_eq!(infos[0].prefix.as_deref(), Some("ca"));
        assert_eq!(infos[1].prefix, None);
        assert!(infos.iter().all(|i| i.state == ConnectionState::Active));
    }

    #[tokio::test]
    async fn test_broadcast_skips_full_queues() {
        let registry = SessionRegistry::new(
            PrefixIndex::new(),
            SessionConfig {
                outbound_capacity: 1,
                ..SessionConfig::default()
            },
        );
        let (full, _rx_full) = registry.open_connection(None);
        let (_open, mut rx_open) = registry.open_connection(None);
        assert!(full.try_enqueue("occupied".into()));

        assert_eq!(registry.broadcast("<p>hi</p>"), 1);
        assert_eq!(rx_open.recv().await.as_deref(), Some("<p>hi</p>"));
    }

    // ============================================================================
    // Teardown
    // ============================================================================

    #[tokio::test]
    async fn test_peer_that_stops_reading_is_fully_torn_down() {
        use std::time::Duration;
        use tokio_tungstenite::tungstenite::protocol::Role;

        let list: Vec<String> = (0..200).map(|i| format!("w{i:03}")).collect();
        let index: PrefixIndex<()> = list.iter().map(|w| (w.as_str(), ())).collect();
        let config = SessionConfig {
            pong_wait: Duration::from_millis(300),
            ..SessionConfig::default()
        };
        let registry = Arc::new(SessionRegistry::new(index, config));

        // The initial page is far larger than the pipe, so the writer blocks
        // mid-frame and the peer never drains it.
        let (server_io, _peer) = tokio::io::duplex(64);
        let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let serving = tokio::spawn(Arc::clone(&registry).serve(ws, None));

        tokio::time::timeout(Duration::from_secs(3), serving)
            .await
            .expect("connection tasks outlived teardown")
            .unwrap();
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_write_deadline_ends_stuck_connection() {
        use std::time::Duration;
        use tokio_tungstenite::tungstenite::protocol::Role;

        let list: Vec<String> = (0..200).map(|i| format!("w{i:03}")).collect();
        let index: PrefixIndex<()> = list.iter().map(|w| (w.as_str(), ())).collect();
        let config = SessionConfig {
            pong_wait: Duration::from_secs(30),
            write_wait: Duration::from_millis(200),
            ..SessionConfig::default()
        };
        let registry = Arc::new(SessionRegistry::new(index, config));

        let (server_io, _peer) = tokio::io::duplex(64);
        let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let serving = tokio::spawn(Arc::clone(&registry).serve(ws, None));

        tokio::time::timeout(Duration::from_secs(3), serving)
            .await
            .expect("stuck write was not abandoned")
            .unwrap();
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_close_all() {
        let registry = registry_with(&words(&["a"]), 50);
        let conns: Vec<_> = (0..3).map(|_| registry.open_connection(None)).collect();

        registry.close_all();

        assert_eq!(registry.connection_count(), 0);
        for (conn, _rx) in &conns {
            assert_eq!(conn.state(), ConnectionState::Closed);
        }
    }
}
