//! Bus client: dial, waiter-based RPC correlation, transparent reconnection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{error, warn};

use crate::config::ClientConfig;
use crate::connection::{Connection, ReconnectFn};
use crate::error::{BusError, NetErrorKind, Result};
use crate::message::{decode_msg_data, Envelope, KeyVal, KeyValExpire};

/// Default bound on a `get_val` wait.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

pub struct BusClient {
    conn: Arc<Connection>,
    addr: String,
    /// One pending response channel per key. The newest caller owns the
    /// slot; concurrent same-key requests are unsupported.
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
    /// Tags replayed to the server after every reconnect.
    subs: Arc<Mutex<HashSet<String>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl BusClient {
    /// Dials the bus server and spawns the connection's read loop. The
    /// connection heals itself afterwards: the reconnect hook redials every
    /// `dial_retry_secs` until the server answers again.
    pub async fn connect(config: ClientConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let stream = TcpStream::connect(config.addr.as_str())
            .await
            .map_err(|err| BusError::net(NetErrorKind::Connect, err))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dial_addr = config.addr.clone();
        let dial_pause = Duration::from_secs(config.dial_retry_secs);
        let dial_shutdown = shutdown_rx.clone();
        let reconnect: ReconnectFn = Arc::new(move || {
            let addr = dial_addr.clone();
            let mut shutdown = dial_shutdown.clone();
            Box::pin(async move {
                loop {
                    match TcpStream::connect(addr.as_str()).await {
                        Ok(stream) => return Some(stream),
                        Err(err) => {
                            error!(%addr, %err, "dial failed, retrying");
                            tokio::select! {
                                _ = tokio::time::sleep(dial_pause) => {}
                                _ = shutdown.wait_for(|stop| *stop) => return None,
                            }
                        }
                    }
                }
            })
        });

        let conn = Connection::new(stream, Some(reconnect), shutdown_rx);
        let client = Arc::new(Self {
            conn: Arc::clone(&conn),
            addr: config.addr,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            subs: Arc::new(Mutex::new(HashSet::new())),
            shutdown_tx,
        });
        client.register_handlers();
        client.install_reinit();

        tokio::spawn(async move {
            let remote = conn.remote().to_string();
            if let Err(err) = conn.run_forever().await {
                warn!(remote = %remote, %err, "client read loop ended");
            }
        });
        Ok(client)
    }

    /// Routes `onGetValRes` payloads to the waiter registered for the key.
    /// Responses without a waiter are dropped.
    fn register_handlers(&self) {
        let waiters = Arc::clone(&self.waiters);
        self.conn.on("onGetValRes", move |_action, data| {
            let waiters = Arc::clone(&waiters);
            Box::pin(async move {
                if let Some(res) = decode_msg_data::<KeyVal>(&data, "onGetValRes") {
                    if let Some(tx) = waiters.lock().remove(&res.key) {
                        let _ = tx.send(res.val);
                    }
                }
            })
        });
    }

    /// Replays accumulated subscriptions once a reconnect lands.
    fn install_reinit(&self) {
        let conn = Arc::downgrade(&self.conn);
        let subs = Arc::clone(&self.subs);
        self.conn.set_reinit(move || {
            let conn = conn.clone();
            let subs = Arc::clone(&subs);
            Box::pin(async move {
                let tags: Vec<String> = subs.lock().iter().cloned().collect();
                if tags.is_empty() {
                    return;
                }
                let Some(conn) = conn.upgrade() else { return };
                match Envelope::from_data("subscribe", &tags) {
                    Ok(msg) => {
                        if let Err(err) = conn.write_msg(&msg).await {
                            error!(%err, "re-subscribe after reconnect failed");
                        }
                    }
                    Err(err) => error!(%err, "failed to encode re-subscribe"),
                }
            })
        });
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The underlying connection, for handler registration and liveness
    /// inspection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Registers a message handler on the underlying connection.
    pub fn on<F>(&self, prefix: impl Into<String>, handler: F)
    where
        F: Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.conn.on(prefix, handler);
    }

    /// Registers interest in `tags` with the server and remembers them for
    /// replay after a reconnect.
    pub async fn subscribe(&self, tags: &[&str]) -> Result<()> {
        let owned: Vec<String> = tags.iter().map(|tag| tag.to_string()).collect();
        self.subs.lock().extend(owned.iter().cloned());
        let msg = Envelope::from_data("subscribe", &owned)?;
        self.conn.write_msg(&msg).await
    }

    pub async fn unsubscribe(&self, tags: &[&str]) -> Result<()> {
        let owned: Vec<String> = tags.iter().map(|tag| tag.to_string()).collect();
        {
            let mut subs = self.subs.lock();
            for tag in &owned {
                subs.remove(tag);
            }
        }
        let msg = Envelope::from_data("unsubscribe", &owned)?;
        self.conn.write_msg(&msg).await
    }

    /// Fetches `key` from the server's store. `None` means the key is absent
    /// — or that the wait expired, which callers treat the same way.
    pub async fn get_val(&self, key: &str, wait: Option<Duration>) -> Result<Option<Value>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(key.to_string(), tx);
        let msg = Envelope::new("onGetVal", Value::String(key.to_string()));
        if let Err(err) = self.conn.write_msg(&msg).await {
            self.waiters.lock().remove(key);
            return Err(err);
        }
        match timeout(wait.unwrap_or(DEFAULT_READ_TIMEOUT), rx).await {
            Ok(Ok(val)) => Ok(if val.is_null() { None } else { Some(val) }),
            // The waiter slot was taken over by a newer request for this key.
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                self.waiters.lock().remove(key);
                Ok(None)
            }
        }
    }

    /// Fire-and-forget store mutation; no reply is expected.
    pub async fn set_val(&self, args: &KeyValExpire) -> Result<()> {
        let msg = Envelope::from_data("onSetVal", args)?;
        self.conn.write_msg(&msg).await
    }

    /// Stops the read loop and tears down the socket.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        self.conn.close().await;
    }
}
