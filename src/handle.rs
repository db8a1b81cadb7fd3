//! Explicit in-process vs. remote access to the shared store.

use std::sync::Arc;

use serde_json::Value;

use crate::client::BusClient;
use crate::error::Result;
use crate::message::KeyValExpire;
use crate::server::BusServer;

/// Where shared values live from this process's point of view: the server
/// process answers from its own store, everyone else asks over the bus. The
/// choice is made per handle instead of through process-wide globals.
#[derive(Clone)]
pub enum SharedData {
    Server(Arc<BusServer>),
    Client(Arc<BusClient>),
}

impl SharedData {
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self {
            SharedData::Server(server) => Ok(server.store().get(key)),
            SharedData::Client(client) => client.get_val(key, None).await,
        }
    }

    pub async fn set(&self, args: &KeyValExpire) -> Result<()> {
        match self {
            SharedData::Server(server) => {
                server.store().set(args);
                Ok(())
            }
            SharedData::Client(client) => client.set_val(args).await,
        }
    }
}
