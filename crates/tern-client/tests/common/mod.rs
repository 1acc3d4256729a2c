//! Shared helpers for tern-client integration tests.
//!
//! Every test talks to an in-process `MockServer` on an ephemeral port, so
//! tests run in parallel without coordination.
#![allow(dead_code)]

use std::time::Duration;
use tern_client::{Client, ClientConfig, ClientEvent, Message};
use tern_test_harness::MockServer;
use tokio::sync::{broadcast, mpsc};

pub const WAIT: Duration = Duration::from_secs(5);

/// Plaintext config for `server` with fast reconnects.
pub fn config_for(server: &MockServer) -> ClientConfig {
    let mut config = ClientConfig::from_port(server.port());
    config.reconnect.initial_backoff = Duration::from_millis(20);
    config.reconnect.max_backoff = Duration::from_millis(100);
    config
}

pub async fn connect(server: &MockServer) -> Client {
    tern_test_harness::init_tracing();
    Client::connect(config_for(server)).await.expect("connect")
}

/// Handler that forwards each delivered message into a channel.
pub fn collector() -> (
    impl Fn(Message) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Message>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |message: Message| {
            let _ = tx.send(message);
        },
        rx,
    )
}

pub async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("message within timeout")
        .expect("handler channel open")
}

/// Give in-flight deliveries a moment, then assert nothing else arrived.
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Message>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    if let Ok(message) = rx.try_recv() {
        panic!("unexpected message on {}", message.subject);
    }
}

/// Skip events until one satisfies `pred`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event within timeout")
}
