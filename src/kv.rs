//! Server-owned key/value store with lazy TTL expiration.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use crate::message::KeyValExpire;
use crate::time::now_ms;

#[derive(Debug)]
struct Entry {
    val: Value,
    expire_at: Option<i64>,
}

/// Shared dictionary backing the bus RPCs. All access goes through one lock;
/// `set` and `get` run on independent peer tasks.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one mutation: a null value deletes the key, `expire_secs > 0`
    /// arms a TTL, and a set without one clears any previous TTL.
    pub fn set(&self, args: &KeyValExpire) {
        let mut entries = self.entries.lock();
        if args.val.is_null() {
            entries.remove(&args.key);
            return;
        }
        let expire_at = (args.expire_secs > 0).then(|| now_ms() + args.expire_secs * 1000);
        entries.insert(args.key.clone(), Entry { val: args.val.clone(), expire_at });
    }

    /// Returns the live value for `key`. Expired entries are removed on read
    /// and report absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) => entry.expire_at.is_some_and(|at| now_ms() >= at),
            None => return None,
        };
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|entry| entry.val.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
