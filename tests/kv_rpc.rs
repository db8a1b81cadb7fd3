//! Key/value RPCs between client and server over real sockets.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tradepulse_bus::{
    BusClient, BusServer, ClientConfig, KeyValExpire, ServerConfig, SharedData,
};

async fn start_server() -> Arc<BusServer> {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        name: "test-bus".to_string(),
    };
    let server = BusServer::bind(config).await.unwrap();
    let accept = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = accept.run_forever().await;
    });
    server
}

async fn connect(server: &BusServer) -> Arc<BusClient> {
    BusClient::connect(ClientConfig::new(server.local_addr().to_string()))
        .await
        .unwrap()
}

fn kv(key: &str, val: Value, expire_secs: i64) -> KeyValExpire {
    KeyValExpire { key: key.to_string(), val, expire_secs }
}

#[tokio::test]
async fn set_then_get_round_trips() {
    let server = start_server().await;
    let client = connect(&server).await;

    client.set_val(&kv("k", json!("hello"), 0)).await.unwrap();
    let val = client.get_val("k", Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(val, Some(json!("hello")));
}

#[tokio::test]
async fn absent_key_reads_none() {
    let server = start_server().await;
    let client = connect(&server).await;

    let val = client.get_val("never_set", Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(val, None);
}

#[tokio::test]
async fn ttl_expires_between_reads() {
    let server = start_server().await;
    let client = connect(&server).await;

    client.set_val(&kv("t", json!("x"), 1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let val = client.get_val("t", Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(val, Some(json!("x")));

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let val = client.get_val("t", Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(val, None);
}

#[tokio::test]
async fn null_set_deletes_the_key() {
    let server = start_server().await;
    let client = connect(&server).await;

    client.set_val(&kv("k", json!(42), 0)).await.unwrap();
    assert_eq!(
        client.get_val("k", Some(Duration::from_secs(1))).await.unwrap(),
        Some(json!(42))
    );

    client.set_val(&kv("k", Value::Null, 0)).await.unwrap();
    assert_eq!(client.get_val("k", Some(Duration::from_secs(1))).await.unwrap(), None);
}

#[tokio::test]
async fn bare_set_clears_a_previous_ttl() {
    let server = start_server().await;
    let client = connect(&server).await;

    client.set_val(&kv("k", json!("short-lived"), 1)).await.unwrap();
    client.set_val(&kv("k", json!("durable"), 0)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let val = client.get_val("k", Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(val, Some(json!("durable")));
}

#[tokio::test]
async fn get_val_timeout_returns_none_without_error() {
    // A peer that accepts and reads but never replies: the waiter must time
    // out cleanly.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        loop {
            match sock.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let client = BusClient::connect(ClientConfig::new(addr.to_string())).await.unwrap();
    let val = client
        .get_val("k", Some(Duration::from_millis(300)))
        .await
        .unwrap();
    assert_eq!(val, None);
    client.close().await;
}

#[tokio::test]
async fn shared_data_serves_in_process_and_remote() {
    let server = start_server().await;
    let client = connect(&server).await;

    let local = SharedData::Server(Arc::clone(&server));
    let remote = SharedData::Client(client);

    local.set(&kv("side", json!("server"), 0)).await.unwrap();
    assert_eq!(remote.get("side").await.unwrap(), Some(json!("server")));

    remote.set(&kv("side", json!("client"), 0)).await.unwrap();
    // The remote set is fire-and-forget; read back through the bus so the
    // write is known to have landed.
    assert_eq!(remote.get("side").await.unwrap(), Some(json!("client")));
    assert_eq!(local.get("side").await.unwrap(), Some(json!("client")));
}
