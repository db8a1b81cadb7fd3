//! Wire envelope and RPC payload shapes.
//!
//! Every bus message is one envelope: a free-form action tag plus an
//! arbitrary JSON payload. Field names on the wire are capitalized and
//! case-sensitive: `{"Action": "...", "Data": ...}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::error::BusError;

/// One bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub action: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self { action: action.into(), data }
    }

    /// Builds an envelope from any serializable payload.
    pub fn from_data<T: Serialize>(action: impl Into<String>, data: &T) -> crate::Result<Self> {
        let data = serde_json::to_value(data).map_err(BusError::Marshal)?;
        Ok(Self { action: action.into(), data })
    }
}

/// Payload of `onSetVal`: store mutation with an optional TTL in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyValExpire {
    pub key: String,
    #[serde(default)]
    pub val: Value,
    #[serde(default)]
    pub expire_secs: i64,
}

/// Payload of `onGetValRes`: the looked-up value for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyVal {
    pub key: String,
    #[serde(default)]
    pub val: Value,
}

/// Structural-to-typed conversion for handler payloads. Decode failures are
/// logged and reported as `None` so the handler can return without effect.
pub fn decode_msg_data<T: DeserializeOwned>(data: &Value, handler: &str) -> Option<T> {
    match serde_json::from_value(data.clone()) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            error!(handler, %err, raw = %data, "received invalid payload");
            None
        }
    }
}
