//! Bus server: accept loop, connection roster, broadcast fan-out, KV RPC
//! handlers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::codec::encode_envelope;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{classify_io, BusError, NetErrorKind, Result};
use crate::kv::KvStore;
use crate::message::{decode_msg_data, Envelope, KeyVal, KeyValExpire};

/// Hook for customizing freshly accepted peer connections (extra handlers,
/// identity exchange) before their read loop starts.
pub type InitConnFn = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Counters logged when the server stops.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub peers_accepted: AtomicU64,
    pub broadcasts: AtomicU64,
    pub sends: AtomicU64,
    pub send_failures: AtomicU64,
}

pub struct BusServer {
    name: String,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    conns: Mutex<Vec<Arc<Connection>>>,
    store: Arc<KvStore>,
    init_conn: Mutex<Option<InitConnFn>>,
    shutdown_tx: watch::Sender<bool>,
    metrics: Arc<ServerMetrics>,
}

impl BusServer {
    /// Binds the listen address and prepares the server; `run_forever`
    /// starts accepting.
    pub async fn bind(config: ServerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr.as_str())
            .await
            .map_err(|err| BusError::net(NetErrorKind::Connect, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| BusError::net(NetErrorKind::Unknown, err))?;
        let (shutdown_tx, _) = watch::channel(false);
        info!(name = %config.name, addr = %local_addr, "bus server listening");
        Ok(Arc::new(Self {
            name: config.name,
            listener: Mutex::new(Some(listener)),
            local_addr,
            conns: Mutex::new(Vec::new()),
            store: Arc::new(KvStore::new()),
            init_conn: Mutex::new(None),
            shutdown_tx,
            metrics: Arc::new(ServerMetrics::default()),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Number of roster entries, closed peers included until the next
    /// broadcast compacts them.
    pub fn peer_count(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn set_init_conn(&self, hook: InitConnFn) {
        *self.init_conn.lock() = Some(hook);
    }

    /// Accepts peers until shutdown, spawning one read loop per peer. A peer
    /// whose read loop exits stays in the roster marked not-ready until the
    /// next broadcast prunes it.
    pub async fn run_forever(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| BusError::runtime("server already running"))?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    let conn = self.wrap_conn(stream);
                    info!(remote = %peer_addr, "peer connected");
                    self.metrics.peers_accepted.fetch_add(1, Ordering::Relaxed);
                    self.conns.lock().push(Arc::clone(&conn));
                    tokio::spawn(async move {
                        let remote = conn.remote().to_string();
                        if let Err(err) = conn.run_forever().await {
                            warn!(remote = %remote, %err, "peer read loop ended");
                        }
                    });
                }
                Err(err) => {
                    error!(%err, "accept failed");
                    return Err(BusError::net(classify_io(&err), err));
                }
            }
        }
        info!(name = %self.name, "bus server shutting down");
        self.close_peers().await;
        self.log_metrics();
        Ok(())
    }

    /// Wraps an accepted socket: KV RPC handlers plus the built-in
    /// subscribe/unsubscribe handlers, then the caller's init hook.
    fn wrap_conn(&self, stream: TcpStream) -> Arc<Connection> {
        let conn = Connection::new(stream, None, self.shutdown_tx.subscribe());

        let store = Arc::clone(&self.store);
        let reply_conn = Arc::downgrade(&conn);
        conn.on("onGetVal", move |_action, data| {
            let store = Arc::clone(&store);
            let reply_conn = reply_conn.clone();
            Box::pin(async move {
                let key = match &data {
                    Value::String(key) => key.clone(),
                    other => other.to_string(),
                };
                let val = store.get(&key).unwrap_or(Value::Null);
                let Some(conn) = reply_conn.upgrade() else { return };
                match Envelope::from_data("onGetValRes", &KeyVal { key, val }) {
                    Ok(msg) => {
                        if let Err(err) = conn.write_msg(&msg).await {
                            error!(remote = %conn.remote(), %err, "failed to send value response");
                        }
                    }
                    Err(err) => error!(%err, "failed to encode value response"),
                }
            })
        });

        let store = Arc::clone(&self.store);
        conn.on("onSetVal", move |_action, data| {
            let store = Arc::clone(&store);
            Box::pin(async move {
                if let Some(args) = decode_msg_data::<KeyValExpire>(&data, "onSetVal") {
                    store.set(&args);
                }
            })
        });

        if let Some(hook) = self.init_conn.lock().clone() {
            hook(&conn);
        }
        conn
    }

    /// Sends `msg` to every live peer subscribed to its action tag,
    /// compacting closed connections out of the roster on the way through.
    /// The envelope is encoded once; sends run concurrently, one task per
    /// recipient, and a failed send never affects the others. Returns the
    /// number of selected recipients.
    pub fn broadcast(&self, msg: &Envelope) -> Result<usize> {
        let targets: Vec<Arc<Connection>> = {
            let mut conns = self.conns.lock();
            conns.retain(|conn| !conn.is_closed());
            conns
                .iter()
                .filter(|conn| conn.has_tag(&msg.action))
                .cloned()
                .collect()
        };
        self.metrics.broadcasts.fetch_add(1, Ordering::Relaxed);
        if targets.is_empty() {
            return Ok(0);
        }
        let payload = Arc::new(encode_envelope(msg)?);
        let selected = targets.len();
        for conn in targets {
            let payload = Arc::clone(&payload);
            let tag = msg.action.clone();
            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                match conn.write(&payload).await {
                    Ok(()) => {
                        metrics.sends.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        metrics.send_failures.fetch_add(1, Ordering::Relaxed);
                        error!(remote = %conn.remote(), %tag, %err, "broadcast send failed");
                    }
                }
            });
        }
        Ok(selected)
    }

    /// Signals every loop — accept, peer reads, reconnect sleeps — to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn close_peers(&self) {
        let conns: Vec<Arc<Connection>> = self.conns.lock().drain(..).collect();
        for conn in conns {
            conn.close().await;
        }
    }

    fn log_metrics(&self) {
        info!(
            name = %self.name,
            peers = self.metrics.peers_accepted.load(Ordering::Relaxed),
            broadcasts = self.metrics.broadcasts.load(Ordering::Relaxed),
            sends = self.metrics.sends.load(Ordering::Relaxed),
            send_failures = self.metrics.send_failures.load(Ordering::Relaxed),
            "bus server stopped"
        );
    }
}
