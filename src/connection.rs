//! Single-peer full-duplex bus connection.
//!
//! Writes from any task serialize through the write-half lock; the read loop
//! is the sole owner of the read half. A connection with a reconnect hook
//! heals itself: `Connect`-class transport failures trigger one recovery
//! cycle and the originating operation is retried on the fresh socket.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{info, warn};

use crate::codec::{decode_envelope, encode_envelope, read_frame, write_frame};
use crate::error::{BusError, NetErrorKind, Result};
use crate::message::{decode_msg_data, Envelope};
use crate::time::now_ms;

/// Pause before redialing once a socket is condemned.
const RECONNECT_PAUSE: Duration = Duration::from_secs(3);

/// A recovery completed within this window satisfies a pending request; the
/// requester rode on someone else's reconnect.
const RECONNECT_FRESH_MS: i64 = 2000;

/// Callback invoked for a dispatched message: `(action, data)`.
pub type Handler = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Re-establishes the underlying socket. Implementations loop, dialing with a
/// pause between attempts, until a socket is obtained — or return `None` once
/// the shutdown signal fires. Its presence makes a connection self-healing.
pub type ReconnectFn = Arc<dyn Fn() -> BoxFuture<'static, Option<TcpStream>> + Send + Sync>;

/// Runs after a successful reconnect (re-subscribe, re-announce identity).
pub type ReinitFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Connection {
    remote: String,
    /// Holds the read half only until the read loop claims it.
    reader_slot: Mutex<Option<OwnedReadHalf>>,
    /// Write-serializing lock: frames reach the wire whole.
    writer: Mutex<Option<OwnedWriteHalf>>,
    ready: AtomicBool,
    refresh_ms: AtomicI64,
    tags: RwLock<HashSet<String>>,
    /// Registration order decides prefix-dispatch priority.
    handlers: RwLock<Vec<(String, Handler)>>,
    reconnect: Option<ReconnectFn>,
    reinit: RwLock<Option<ReinitFn>>,
    /// Failed writers nudge the read loop to run a recovery cycle.
    recover_req: Notify,
    /// Bumped after every successful recovery; waiting writers retry on it.
    epoch_tx: watch::Sender<u64>,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    /// Wraps an established socket. `reconnect` being `None` makes the
    /// connection one-shot: the first `Connect`-class failure is terminal.
    pub fn new(
        stream: TcpStream,
        reconnect: Option<ReconnectFn>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let remote = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        let (epoch_tx, _) = watch::channel(0u64);
        let conn = Arc::new(Self {
            remote,
            reader_slot: Mutex::new(Some(read_half)),
            writer: Mutex::new(Some(write_half)),
            ready: AtomicBool::new(true),
            refresh_ms: AtomicI64::new(now_ms()),
            tags: RwLock::new(HashSet::new()),
            handlers: RwLock::new(Vec::new()),
            reconnect,
            reinit: RwLock::new(None),
            recover_req: Notify::new(),
            epoch_tx,
            shutdown,
        });
        Self::register_builtin_handlers(&conn);
        conn
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// A connection is closed once an unrecovered transport failure marked it
    /// not-ready or it was shut down.
    pub fn is_closed(&self) -> bool {
        !self.ready.load(Ordering::SeqCst)
    }

    /// Timestamp (ms since epoch) of the last successful (re)connect.
    pub fn refresh_ms(&self) -> i64 {
        self.refresh_ms.load(Ordering::SeqCst)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.read().contains(tag)
    }

    pub fn subscribe<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = self.tags.write();
        for tag in tags {
            set.insert(tag.into());
        }
    }

    pub fn unsubscribe<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = self.tags.write();
        for tag in tags {
            set.remove(tag.as_ref());
        }
    }

    /// Registers a handler for every action starting with `prefix`.
    /// Dispatch is first-registered-wins.
    pub fn on<F>(&self, prefix: impl Into<String>, handler: F)
    where
        F: Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.handlers.write().push((prefix.into(), Arc::new(handler)));
    }

    /// Installs the post-reconnect hook.
    pub fn set_reinit<F>(&self, hook: F)
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        *self.reinit.write() = Some(Arc::new(hook));
    }

    fn register_builtin_handlers(conn: &Arc<Self>) {
        let weak = Arc::downgrade(conn);
        conn.on("subscribe", move |_action, data| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(conn) = weak.upgrade() {
                    if let Some(tags) = decode_msg_data::<Vec<String>>(&data, "subscribe") {
                        conn.subscribe(tags);
                    }
                }
            })
        });
        let weak = Arc::downgrade(conn);
        conn.on("unsubscribe", move |_action, data| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(conn) = weak.upgrade() {
                    if let Some(tags) = decode_msg_data::<Vec<String>>(&data, "unsubscribe") {
                        conn.unsubscribe(&tags);
                    }
                }
            })
        });
    }

    /// Encodes and writes one envelope.
    pub async fn write_msg(&self, msg: &Envelope) -> Result<()> {
        let payload = encode_envelope(msg)?;
        self.write(&payload).await
    }

    /// Writes one pre-encoded frame, serialized against other writers. A
    /// `Connect`-class failure on a self-healing connection requests a
    /// recovery cycle and retries once the socket is re-established.
    pub async fn write(&self, payload: &[u8]) -> Result<()> {
        loop {
            let attempt = {
                let mut writer = self.writer.lock().await;
                match writer.as_mut() {
                    Some(sink) => write_frame(sink, payload).await,
                    None => Err(BusError::net(
                        NetErrorKind::Connect,
                        std::io::Error::new(std::io::ErrorKind::NotConnected, "socket closed"),
                    )),
                }
            };
            let err = match attempt {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            self.ready.store(false, Ordering::SeqCst);
            if self.reconnect.is_none() || err.net_kind() != Some(NetErrorKind::Connect) {
                return Err(err);
            }
            warn!(remote = %self.remote, %err, "write failed, waiting for reconnect");
            // Subscribe before checking readiness so a recovery finishing in
            // between cannot be missed.
            let mut epoch_rx = self.epoch_tx.subscribe();
            if self.ready.load(Ordering::SeqCst) {
                continue;
            }
            self.recover_req.notify_one();
            let mut shutdown_rx = self.shutdown.clone();
            tokio::select! {
                changed = epoch_rx.changed() => {
                    if changed.is_err() {
                        return Err(err);
                    }
                }
                _ = shutdown_rx.wait_for(|stop| *stop) => return Err(err),
            }
        }
    }

    /// Reads, decodes, and dispatches messages until a terminal error or
    /// shutdown. Recoverable read failures run the reconnect cycle in place.
    /// The socket is closed on exit and the terminal error is returned.
    pub async fn run_forever(self: Arc<Self>) -> Result<()> {
        let mut read_half = match self.reader_slot.lock().await.take() {
            Some(half) => half,
            None => return Err(BusError::runtime("read loop already running")),
        };
        let mut shutdown_rx = self.shutdown.clone();
        let outcome = loop {
            let event = tokio::select! {
                read = read_frame(&mut read_half) => Some(read),
                _ = self.recover_req.notified() => None,
                _ = shutdown_rx.wait_for(|stop| *stop) => break Ok(()),
            };
            match event {
                // A writer condemned the socket. A request landing just after
                // a completed recovery is stale and dropped.
                None => {
                    if self.ready.load(Ordering::SeqCst)
                        && now_ms() - self.refresh_ms.load(Ordering::SeqCst) < RECONNECT_FRESH_MS
                    {
                        continue;
                    }
                    drop(read_half);
                    match self.recover().await {
                        Some(half) => {
                            read_half = half;
                            continue;
                        }
                        None => break Ok(()),
                    }
                }
                Some(Ok(payload)) => match decode_envelope(&payload) {
                    Ok(msg) => self.dispatch(msg).await,
                    Err(err) => break Err(err),
                },
                Some(Err(err)) => {
                    self.ready.store(false, Ordering::SeqCst);
                    if self.reconnect.is_none() || err.net_kind() != Some(NetErrorKind::Connect) {
                        break Err(err);
                    }
                    warn!(remote = %self.remote, %err, "read failed, running reconnect");
                    drop(read_half);
                    match self.recover().await {
                        Some(half) => {
                            read_half = half;
                            continue;
                        }
                        None => break Err(err),
                    }
                }
            }
        };
        self.close().await;
        outcome
    }

    /// One recovery cycle, run on the read task (the sole reader): condemn
    /// the old socket, pause, redial through the hook, reinstall halves, run
    /// the reinit hook, and wake waiting writers. `None` means shutdown fired
    /// before a socket could be re-established.
    async fn recover(&self) -> Option<OwnedReadHalf> {
        let hook = Arc::clone(self.reconnect.as_ref()?);
        self.ready.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();
        if !self.sleep(RECONNECT_PAUSE).await {
            return None;
        }
        let stream = hook().await?;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.refresh_ms.store(now_ms(), Ordering::SeqCst);
        let reinit = self.reinit.read().clone();
        if let Some(reinit) = reinit {
            reinit().await;
        }
        self.ready.store(true, Ordering::SeqCst);
        self.epoch_tx.send_modify(|epoch| *epoch += 1);
        info!(remote = %self.remote, "connection re-established");
        Some(read_half)
    }

    async fn dispatch(&self, msg: Envelope) {
        let handler = {
            let handlers = self.handlers.read();
            handlers
                .iter()
                .find(|(prefix, _)| msg.action.starts_with(prefix.as_str()))
                .map(|(_, handler)| Arc::clone(handler))
        };
        match handler {
            Some(handler) => handler(msg.action, msg.data).await,
            None => info!(action = %msg.action, "unhandled message"),
        }
    }

    /// Marks the connection closed and drops both socket halves.
    pub async fn close(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.reader_slot.lock().await.take();
        self.writer.lock().await.take();
    }

    /// Sleeps unless the shutdown signal fires first.
    async fn sleep(&self, pause: Duration) -> bool {
        let mut shutdown_rx = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(pause) => true,
            _ = shutdown_rx.wait_for(|stop| *stop) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (dialed.unwrap(), accepted.unwrap().0)
    }

    fn test_conn(stream: TcpStream) -> (Arc<Connection>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (Connection::new(stream, None, shutdown_rx), shutdown_tx)
    }

    #[tokio::test]
    async fn dispatch_prefers_first_registered_prefix() {
        let (local, _peer) = socket_pair().await;
        let (conn, _shutdown) = test_conn(local);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx_on = tx.clone();
        conn.on("on", move |action, _data| {
            let tx = tx_on.clone();
            Box::pin(async move {
                let _ = tx.send(format!("on:{action}"));
            })
        });
        let tx_onget = tx.clone();
        conn.on("onGet", move |action, _data| {
            let tx = tx_onget.clone();
            Box::pin(async move {
                let _ = tx.send(format!("onGet:{action}"));
            })
        });

        conn.dispatch(Envelope::new("onGetPrice", json!(null))).await;
        assert_eq!(rx.recv().await.unwrap(), "on:onGetPrice");
    }

    #[tokio::test]
    async fn dispatch_longer_prefix_wins_when_registered_first() {
        let (local, _peer) = socket_pair().await;
        let (conn, _shutdown) = test_conn(local);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx_onget = tx.clone();
        conn.on("onGet", move |action, _data| {
            let tx = tx_onget.clone();
            Box::pin(async move {
                let _ = tx.send(format!("onGet:{action}"));
            })
        });
        let tx_on = tx.clone();
        conn.on("on", move |action, _data| {
            let tx = tx_on.clone();
            Box::pin(async move {
                let _ = tx.send(format!("on:{action}"));
            })
        });

        conn.dispatch(Envelope::new("onGetPrice", json!(null))).await;
        assert_eq!(rx.recv().await.unwrap(), "onGet:onGetPrice");
    }

    #[tokio::test]
    async fn builtin_subscribe_handler_mutates_tags() {
        let (local, _peer) = socket_pair().await;
        let (conn, _shutdown) = test_conn(local);

        conn.dispatch(Envelope::new("subscribe", json!(["px_BTC", "px_ETH"]))).await;
        assert!(conn.has_tag("px_BTC"));
        assert!(conn.has_tag("px_ETH"));

        conn.dispatch(Envelope::new("unsubscribe", json!(["px_BTC"]))).await;
        assert!(!conn.has_tag("px_BTC"));
        assert!(conn.has_tag("px_ETH"));
    }

    #[tokio::test]
    async fn malformed_subscribe_payload_leaves_tags_untouched() {
        let (local, _peer) = socket_pair().await;
        let (conn, _shutdown) = test_conn(local);

        conn.dispatch(Envelope::new("subscribe", json!({"not": "a list"}))).await;
        assert!(!conn.has_tag("not"));
    }

    #[tokio::test]
    async fn write_without_hook_fails_terminal_after_peer_closes() {
        let (local, peer) = socket_pair().await;
        let (conn, _shutdown) = test_conn(local);
        drop(peer);

        // The first write may still land in the socket buffer; keep writing
        // until the broken pipe surfaces.
        let payload = encode_envelope(&Envelope::new("tick", json!(1))).unwrap();
        let mut last = Ok(());
        for _ in 0..50 {
            last = conn.write(&payload).await;
            if last.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(last.is_err(), "write to a closed peer must eventually fail");
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn run_forever_returns_connect_error_on_peer_eof() {
        let (local, peer) = socket_pair().await;
        let (conn, _shutdown) = test_conn(local);
        drop(peer);

        let err = conn.run_forever().await.unwrap_err();
        assert_eq!(err.net_kind(), Some(NetErrorKind::Connect));
    }

    #[tokio::test]
    async fn shutdown_stops_the_read_loop() {
        let (local, _peer) = socket_pair().await;
        let (conn, shutdown) = test_conn(local);

        let task = tokio::spawn(conn.run_forever());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(outcome.unwrap().unwrap().is_ok());
    }
}
