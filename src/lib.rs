//! TradePulse message bus.
//!
//! Length-prefixed, zlib-compressed, tag-addressed messaging linking the
//! platform's central process with its peers over long-lived TCP
//! connections. One connection per peer carries three services: topic
//! publish/subscribe, a server-owned key/value store with per-key TTL, and
//! cooperative named locks built on top of that store.
//!
//! Wire format per message: 4-byte little-endian length, then that many
//! bytes of zlib-compressed JSON `{"Action": "<tag>", "Data": <arbitrary>}`.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod handle;
pub mod kv;
pub mod lock;
pub mod message;
pub mod server;
pub mod time;

pub use client::BusClient;
pub use config::{ClientConfig, ServerConfig};
pub use connection::{Connection, Handler, ReconnectFn, ReinitFn};
pub use error::{classify_io, BusError, NetErrorKind, Result};
pub use handle::SharedData;
pub use kv::KvStore;
pub use message::{decode_msg_data, Envelope, KeyVal, KeyValExpire};
pub use server::{BusServer, InitConnFn, ServerMetrics};
