//! Cooperative named locks on top of the shared store.
//!
//! A lock is a store entry keyed `lock_<name>` holding a random positive
//! 31-bit nonce that identifies the current holder. The protocol is
//! best-effort: the read-then-write is not atomic at the server, so two
//! acquirers landing within the same poll interval can both succeed. It is
//! not a safety primitive against adversarial peers.

use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::info;

use crate::error::{BusError, Result};
use crate::handle::SharedData;
use crate::message::KeyValExpire;

const LOCK_PREFIX: &str = "lock_";
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
const POLL_PAUSE: Duration = Duration::from_micros(10);

/// Acquires the named lock, returning the nonce identifying this holder.
/// Polls until the lock frees up or `timeout_secs` passes (default 30 when
/// zero). No TTL is set on the entry; holders are expected to release.
pub async fn acquire(data: &SharedData, key: &str, timeout_secs: u64) -> Result<i32> {
    let lock_key = format!("{LOCK_PREFIX}{key}");
    let nonce: i32 = rand::thread_rng().gen_range(1..i32::MAX);
    if data.get(&lock_key).await?.is_none() {
        set_nonce(data, &lock_key, nonce).await?;
        return Ok(nonce);
    }
    let timeout_secs = if timeout_secs == 0 { DEFAULT_ACQUIRE_TIMEOUT_SECS } else { timeout_secs };
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    while Instant::now() < deadline {
        sleep(POLL_PAUSE).await;
        if data.get(&lock_key).await?.is_none() {
            set_nonce(data, &lock_key, nonce).await?;
            return Ok(nonce);
        }
    }
    Err(BusError::timeout(format!("acquire lock {key}"), timeout_secs))
}

/// Releases the lock if `nonce` still owns it. A mismatch means another peer
/// took the lock over; that is logged and treated as success.
pub async fn release(data: &SharedData, key: &str, nonce: i32) -> Result<()> {
    let lock_key = format!("{LOCK_PREFIX}{key}");
    let held = data.get(&lock_key).await?;
    let held_nonce = held.as_ref().and_then(Value::as_i64).unwrap_or(0) as i32;
    if held_nonce == nonce {
        let clear = KeyValExpire { key: lock_key, val: Value::Null, expire_secs: 0 };
        return data.set(&clear).await;
    }
    info!(key, held = held_nonce, expected = nonce, "lock release skipped, holder changed");
    Ok(())
}

async fn set_nonce(data: &SharedData, lock_key: &str, nonce: i32) -> Result<()> {
    let args = KeyValExpire {
        key: lock_key.to_string(),
        val: Value::from(nonce),
        expire_secs: 0,
    };
    data.set(&args).await
}
