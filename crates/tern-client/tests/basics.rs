//! Integration tests for publish, subscribe, flush and request/reply.
//!
//! # Purpose
//! Drive a real client against the in-process mock server and check the
//! observable delivery behavior: wildcard routing, reply subjects, queue
//! groups, payload limits and flush ordering.
mod common;

use bytes::Bytes;
use common::{assert_quiet, collector, config_for, connect, recv};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tern_client::{Client, Error, INBOX_PREFIX, RequestOptions, Sid, SubscribeOptions};
use tern_test_harness::{MockServer, MockServerConfig};

#[tokio::test]
async fn publish_reaches_exact_subscriber() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let (handler, mut rx) = collector();
    client
        .subscribe("orders.created", SubscribeOptions::default(), handler)
        .expect("subscribe");
    client.flush().await.expect("flush");

    client
        .publish("orders.created", "order-1")
        .expect("publish");
    let message = recv(&mut rx).await;
    assert_eq!(message.subject, "orders.created");
    assert_eq!(message.payload, Bytes::from_static(b"order-1"));
    assert!(message.reply_to.is_none());

    client.publish("orders.updated", "ignored").expect("publish");
    assert_quiet(&mut rx).await;
    client.close().await;
}

#[tokio::test]
async fn wildcards_match_tokens() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let (single, mut single_rx) = collector();
    let (tail, mut tail_rx) = collector();
    client
        .subscribe("metrics.*", SubscribeOptions::default(), single)
        .expect("subscribe *");
    client
        .subscribe("metrics.>", SubscribeOptions::default(), tail)
        .expect("subscribe >");
    client.flush().await.expect("flush");

    client.publish("metrics.cpu", "1").expect("publish");
    client.publish("metrics.cpu.core0", "2").expect("publish");
    client.publish("metrics", "3").expect("publish");
    client.flush().await.expect("flush");

    assert_eq!(recv(&mut single_rx).await.subject, "metrics.cpu");
    assert_eq!(recv(&mut tail_rx).await.subject, "metrics.cpu");
    assert_eq!(recv(&mut tail_rx).await.subject, "metrics.cpu.core0");
    assert_quiet(&mut single_rx).await;
    assert_quiet(&mut tail_rx).await;
    client.close().await;
}

#[tokio::test]
async fn reply_subject_is_delivered_and_answerable() {
    let server = MockServer::start().await.expect("server");
    let responder = connect(&server).await;
    let requester = connect(&server).await;

    let replier = responder.clone();
    responder
        .subscribe("time.now", SubscribeOptions::default(), move |message| {
            if let Some(reply_to) = &message.reply_to {
                let _ = replier.publish(reply_to, "noon");
            }
        })
        .expect("subscribe");
    responder.flush().await.expect("flush");

    let reply = requester
        .request_timeout("time.now", Bytes::new(), Duration::from_secs(2))
        .await
        .expect("reply");
    assert_eq!(reply.payload, Bytes::from_static(b"noon"));
    assert!(reply.subject.starts_with(INBOX_PREFIX));
    // The single-reply inbox subscription is gone.
    assert_eq!(requester.subscription_count(), 0);

    requester.close().await;
    responder.close().await;
}

#[tokio::test]
async fn weak_handle_in_handler_lets_drop_close_connection() {
    let server = MockServer::start().await.expect("server");
    let responder = connect(&server).await;
    let requester = connect(&server).await;

    let replier = responder.downgrade();
    responder
        .subscribe("time.now", SubscribeOptions::default(), move |message| {
            if let (Some(client), Some(reply_to)) = (replier.upgrade(), &message.reply_to) {
                let _ = client.publish(reply_to, "noon");
            }
        })
        .expect("subscribe");
    responder.flush().await.expect("flush");
    let reply = requester
        .request_timeout("time.now", Bytes::new(), Duration::from_secs(2))
        .await
        .expect("reply");
    assert_eq!(reply.payload, Bytes::from_static(b"noon"));

    // Dropping the only strong handle ends the responder's connection.
    drop(responder);
    server.wait_for_connections(1).await.expect("responder gone");
    let err = requester
        .request_timeout("time.now", Bytes::new(), Duration::from_millis(100))
        .await
        .expect_err("no responder");
    assert!(matches!(err, Error::Timeout));
    requester.close().await;
}

#[tokio::test]
async fn request_accepts_up_to_max_replies() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    for _ in 0..3 {
        let replier = client.clone();
        client
            .subscribe("svc.echo", SubscribeOptions::default(), move |message| {
                if let Some(reply_to) = &message.reply_to {
                    let _ = replier.publish(reply_to, message.payload.clone());
                }
            })
            .expect("subscribe responder");
    }
    client.flush().await.expect("flush");

    let (handler, mut rx) = collector();
    client
        .request("svc.echo", "hi", RequestOptions { max: Some(2) }, handler)
        .expect("request");
    recv(&mut rx).await;
    recv(&mut rx).await;
    assert_quiet(&mut rx).await;
    assert_eq!(client.subscription_count(), 3);
    client.close().await;
}

#[tokio::test]
async fn request_timeout_without_responder() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let err = client
        .request_timeout("nobody.home", "?", Duration::from_millis(100))
        .await
        .expect_err("no responder");
    assert!(matches!(err, Error::Timeout));
    assert_eq!(client.subscription_count(), 0);
    client.close().await;
}

#[tokio::test]
async fn publish_flushed_waits_for_server() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let (handler, mut rx) = collector();
    client
        .subscribe("audit", SubscribeOptions::default(), handler)
        .expect("subscribe");
    client
        .publish_flushed("audit", "entry")
        .await
        .expect("publish flushed");
    // MSG precedes the PONG on the wire, so it is already dispatched.
    let message = rx.try_recv().expect("delivered before flush resolved");
    assert_eq!(message.payload, Bytes::from_static(b"entry"));
    client.close().await;
}

#[tokio::test]
async fn unsubscribe_inside_handler_stops_delivery() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let seen = Arc::new(AtomicUsize::new(0));
    let own_sid: Arc<Mutex<Option<Sid>>> = Arc::new(Mutex::new(None));

    let handler_client = client.clone();
    let handler_seen = Arc::clone(&seen);
    let handler_sid = Arc::clone(&own_sid);
    let sid = client
        .subscribe("ticks", SubscribeOptions::default(), move |_| {
            handler_seen.fetch_add(1, Ordering::SeqCst);
            if let Some(sid) = *handler_sid.lock() {
                handler_client.unsubscribe(sid, None).expect("unsubscribe");
            }
        })
        .expect("subscribe");
    *own_sid.lock() = Some(sid);
    client.flush().await.expect("flush");

    for n in 0..5 {
        client.publish("ticks", n.to_string()).expect("publish");
    }
    client.flush().await.expect("flush");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(client.subscription_count(), 0);
    client.close().await;
}

#[tokio::test]
async fn queue_group_delivers_each_message_once() {
    let server = MockServer::start().await.expect("server");
    let first = connect(&server).await;
    let second = connect(&server).await;
    let publisher = connect(&server).await;
    let (a, mut a_rx) = collector();
    let (b, mut b_rx) = collector();
    first
        .subscribe("jobs", SubscribeOptions::queue("workers"), a)
        .expect("subscribe a");
    second
        .subscribe("jobs", SubscribeOptions::queue("workers"), b)
        .expect("subscribe b");
    first.flush().await.expect("flush");
    second.flush().await.expect("flush");

    for n in 0..10 {
        publisher.publish("jobs", n.to_string()).expect("publish");
    }
    publisher.flush().await.expect("flush");
    first.flush().await.expect("flush");
    second.flush().await.expect("flush");

    let mut total = 0;
    while a_rx.try_recv().is_ok() {
        total += 1;
    }
    while b_rx.try_recv().is_ok() {
        total += 1;
    }
    assert_eq!(total, 10);

    for client in [first, second, publisher] {
        client.close().await;
    }
}

#[tokio::test]
async fn oversize_payload_is_rejected_locally() {
    let server = MockServer::start_with(MockServerConfig {
        max_payload: 16,
        ..MockServerConfig::default()
    })
    .await
    .expect("server");
    let client = connect(&server).await;
    assert_eq!(client.server_info().expect("info").max_payload, 16);

    let err = client
        .publish("big", vec![0u8; 17])
        .expect_err("too large");
    assert!(matches!(err, Error::MaxPayloadExceeded { size: 17, max: 16 }));
    client.publish("big", vec![0u8; 16]).expect("at the limit");
    client.flush().await.expect("connection still healthy");
    client.close().await;
}

#[tokio::test]
async fn invalid_subjects_are_rejected() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    assert!(matches!(
        client.publish("bad subject", "x"),
        Err(Error::InvalidSubject(_))
    ));
    assert!(matches!(
        client.publish("wild.*", "x"),
        Err(Error::InvalidSubject(_))
    ));
    assert!(matches!(
        client.subscribe("a.>.b", SubscribeOptions::default(), |_| {}),
        Err(Error::InvalidSubject(_))
    ));
    client.close().await;
}

#[tokio::test]
async fn flushes_resolve_in_order() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for n in 0..5 {
        let client = client.clone();
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            client.flush().await.expect("flush");
            order.lock().push(n);
        }));
        // Let each flush reach the connection task before the next.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for task in tasks {
        task.await.expect("task");
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    client.close().await;
}

#[tokio::test]
async fn echo_disabled_skips_own_messages() {
    let server = MockServer::start().await.expect("server");
    let mut config = config_for(&server);
    config.echo = false;
    let quiet = Client::connect(config).await.expect("connect");
    let other = connect(&server).await;
    let (handler, mut rx) = collector();
    quiet
        .subscribe("chat", SubscribeOptions::default(), handler)
        .expect("subscribe");
    quiet.flush().await.expect("flush");

    quiet.publish("chat", "self").expect("publish");
    quiet.flush().await.expect("flush");
    other.publish("chat", "peer").expect("publish");

    assert_eq!(recv(&mut rx).await.payload, Bytes::from_static(b"peer"));
    assert_quiet(&mut rx).await;
    quiet.close().await;
    other.close().await;
}

#[tokio::test]
async fn channel_subscription_ends_after_max() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let mut subscription = client
        .subscribe_channel("feed", SubscribeOptions::max(2))
        .expect("subscribe");
    client.flush().await.expect("flush");
    for n in 0..4 {
        client.publish("feed", n.to_string()).expect("publish");
    }
    let first = tokio::time::timeout(common::WAIT, subscription.next_message())
        .await
        .expect("first");
    assert_eq!(first.expect("message").payload, Bytes::from_static(b"0"));
    let second = tokio::time::timeout(common::WAIT, subscription.next_message())
        .await
        .expect("second");
    assert_eq!(second.expect("message").payload, Bytes::from_static(b"1"));
    let end = tokio::time::timeout(common::WAIT, subscription.next_message())
        .await
        .expect("end");
    assert!(end.is_none());
    client.close().await;
}

#[tokio::test]
async fn token_auth_failure_fails_connect() {
    let server = MockServer::start_with(MockServerConfig {
        token: Some("s3cret".to_string()),
        ..MockServerConfig::default()
    })
    .await
    .expect("server");

    let mut config = config_for(&server);
    config.token = Some("wrong".to_string());
    let err = Client::connect(config).await.expect_err("rejected");
    assert!(matches!(err, Error::Server(ref message) if message == "Authorization Violation"));

    let mut config = config_for(&server);
    config.token = Some("s3cret".to_string());
    let client = Client::connect(config).await.expect("accepted");
    client.flush().await.expect("flush");
    client.close().await;
}
