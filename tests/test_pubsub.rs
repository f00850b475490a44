//! Publish and subscribe against the mock server

mod test_helpers;

use nats_core_client::{Connection, Event, Headers, NatsError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use test_helpers::{
    MockConfig, MockNatsServer, test_options, wait_for_event, wait_until, with_event_channel,
};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_publish_counts_and_reaches_server() {
    let server = MockNatsServer::start().await;
    let nc = Connection::connect(test_options([server.url()])).await.unwrap();

    nc.publish("foo", b"hello").unwrap();
    nc.flush().await.unwrap();

    let stats = nc.stats();
    assert_eq!(stats.out_msgs, 1);
    assert_eq!(stats.out_bytes, 5);
    assert_eq!(server.published(), vec![("foo".to_string(), b"hello".to_vec())]);
    assert_eq!(server.lines_starting_with("PUB"), vec!["PUB foo 5"]);

    nc.reset_stats();
    assert_eq!(nc.stats().out_msgs, 0);
    nc.close().await;
}

#[tokio::test]
async fn test_connect_sends_connect_then_ping() {
    let server = MockNatsServer::start().await;
    let nc = Connection::connect(test_options([server.url()]).name("probe"))
        .await
        .unwrap();

    let lines = server.lines();
    assert!(lines[0].starts_with("CONNECT {"));
    assert!(lines[0].contains("\"name\":\"probe\""));
    assert!(lines[0].contains("\"headers\":true"));
    assert_eq!(lines[1], "PING");
    assert_eq!(nc.connected_url().as_deref(), Some(server.url().as_str()));
    assert_eq!(nc.connected_server_id().as_deref(), Some("mock"));
    nc.close().await;
}

#[tokio::test]
async fn test_sync_subscription_receives_after_flush() {
    let server = MockNatsServer::start().await;
    let nc = Connection::connect(test_options([server.url()])).await.unwrap();

    let sub = nc.subscribe_sync("foo").unwrap();
    nc.flush().await.unwrap();
    assert!(server.lines().contains(&format!("SUB foo {}", sub.sid())));

    nc.publish("foo", b"one").unwrap();
    let msg = sub.next_msg(WAIT).await.unwrap();
    assert_eq!(msg.subject, "foo");
    assert_eq!(&msg.data[..], b"one");
    assert_eq!(msg.sid(), Some(sub.sid()));
    assert_eq!(sub.delivered(), 1);

    assert!(matches!(
        sub.next_msg(Duration::from_millis(50)).await,
        Err(NatsError::Timeout)
    ));
    nc.close().await;
}

#[tokio::test]
async fn test_wildcard_and_queue_subscriptions() {
    let server = MockNatsServer::start().await;
    let nc = Connection::connect(test_options([server.url()])).await.unwrap();

    let wild = nc.subscribe_sync("orders.>").unwrap();
    let q1 = nc.queue_subscribe_sync("orders.new", "workers").unwrap();
    let q2 = nc.queue_subscribe_sync("orders.new", "workers").unwrap();
    assert_eq!(q1.queue_group(), Some("workers"));
    nc.flush().await.unwrap();

    nc.publish("orders.new", b"x").unwrap();
    nc.flush().await.unwrap();

    assert_eq!(&wild.next_msg(WAIT).await.unwrap().data[..], b"x");
    let (p1, _) = q1.pending();
    let (p2, _) = q2.pending();
    assert_eq!(p1 + p2, 1, "exactly one queue member gets the message");
    nc.close().await;
}

#[tokio::test]
async fn test_async_subscription_runs_handler_in_order() {
    let server = MockNatsServer::start().await;
    let nc = Connection::connect(test_options([server.url()])).await.unwrap();

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = nc
        .subscribe("events", move |msg| {
            sink.lock().push(String::from_utf8_lossy(&msg.data).into_owned());
        })
        .unwrap();
    nc.flush().await.unwrap();

    for i in 0..10 {
        nc.publish("events", format!("{i}").as_bytes()).unwrap();
    }
    assert!(wait_until(|| seen.lock().len() == 10, WAIT).await);
    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(*seen.lock(), expected);
    assert_eq!(sub.delivered(), 10);
    nc.close().await;
}

#[tokio::test]
async fn test_pooled_delivery_workers() {
    let server = MockNatsServer::start().await;
    let opts = nats_core_client::Options {
        subscriber_delivery_task_count: 2,
        ..test_options([server.url()])
    };
    let nc = Connection::connect(opts).await.unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    for subject in ["a", "b", "c"] {
        let count = Arc::clone(&count);
        nc.subscribe(subject, move |_| {
            count.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }
    nc.flush().await.unwrap();
    for subject in ["a", "b", "c"] {
        nc.publish(subject, b"x").unwrap();
    }
    assert!(wait_until(|| count.load(Ordering::Relaxed) == 3, WAIT).await);
    nc.close().await;
}

#[tokio::test]
async fn test_headers_round_trip() {
    let server = MockNatsServer::start().await;
    let nc = Connection::connect(test_options([server.url()])).await.unwrap();

    let sub = nc.subscribe_sync("hdr").unwrap();
    nc.flush().await.unwrap();

    let mut headers = Headers::new();
    headers.insert("Trace-Id", "abc123").unwrap();
    nc.publish_with_headers("hdr", None, &headers, b"body").unwrap();

    let msg = sub.next_msg(WAIT).await.unwrap();
    assert_eq!(&msg.data[..], b"body");
    assert_eq!(msg.headers.as_ref().and_then(|h| h.get("Trace-Id")), Some("abc123"));
    assert!(server.lines_starting_with("HPUB hdr ").len() == 1);

    // Both directions count the header block along with the body
    let stats = nc.stats();
    let expected = (headers.to_bytes().len() + b"body".len()) as u64;
    assert_eq!(stats.out_bytes, expected);
    assert_eq!(stats.in_bytes, expected);
    nc.close().await;
}

#[tokio::test]
async fn test_publish_slice_bounds() {
    let server = MockNatsServer::start().await;
    let nc = Connection::connect(test_options([server.url()])).await.unwrap();

    nc.publish_slice("s", None, b"abcdef", 2, 3).unwrap();
    nc.flush().await.unwrap();
    assert_eq!(server.published()[0].1, b"cde");

    assert!(matches!(
        nc.publish_slice("s", None, b"abc", 2, 5),
        Err(NatsError::InvalidArgument(_))
    ));
    nc.close().await;
}

#[tokio::test]
async fn test_max_payload_enforced() {
    let config = MockConfig {
        max_payload: 16,
        ..MockConfig::default()
    };
    let server = MockNatsServer::start_with(0, config).await;
    let nc = Connection::connect(test_options([server.url()])).await.unwrap();
    assert_eq!(nc.max_payload(), 16);

    nc.publish("p", &[0u8; 16]).unwrap();
    assert!(matches!(
        nc.publish("p", &[0u8; 17]),
        Err(NatsError::MaxPayload { size: 17, max: 16 })
    ));
    nc.close().await;
}

#[tokio::test]
async fn test_invalid_subjects_rejected() {
    let server = MockNatsServer::start().await;
    let nc = Connection::connect(test_options([server.url()])).await.unwrap();

    assert!(matches!(nc.publish("", b"x"), Err(NatsError::BadSubject(_))));
    assert!(matches!(nc.publish("a b", b"x"), Err(NatsError::BadSubject(_))));
    assert!(nc.subscribe_sync("foo..bar").is_err());
    assert!(nc.queue_subscribe_sync("foo", "bad group").is_err());
    nc.close().await;
}

#[tokio::test]
async fn test_slow_consumer_drops_and_reports_once() {
    let server = MockNatsServer::start().await;
    let (opts, mut events) = with_event_channel(test_options([server.url()]));
    let nc = Connection::connect(opts).await.unwrap();

    let sub = nc.subscribe_sync("flood").unwrap();
    sub.set_pending_limits(2, -1).unwrap();
    nc.flush().await.unwrap();

    for _ in 0..5 {
        nc.publish("flood", b"x").unwrap();
    }
    nc.flush().await.unwrap();
    assert!(wait_until(|| sub.dropped() == 3, WAIT).await);
    assert_eq!(sub.pending(), (2, 2));

    let event = wait_for_event(
        &mut events,
        |e| matches!(e, Event::AsyncError(NatsError::SlowConsumer { .. })),
        WAIT,
    )
    .await;
    assert!(event.is_some());
    nc.close().await;
}

#[tokio::test]
async fn test_message_filter_skips_pending_accounting() {
    let server = MockNatsServer::start().await;
    let nc = Connection::connect(test_options([server.url()])).await.unwrap();

    let sub = nc.subscribe_sync("f").unwrap();
    sub.set_message_filter(|msg| msg.data.starts_with(b"keep"));
    nc.flush().await.unwrap();

    nc.publish("f", b"drop-me").unwrap();
    nc.publish("f", b"keep-me").unwrap();
    let msg = sub.next_msg(WAIT).await.unwrap();
    assert_eq!(&msg.data[..], b"keep-me");
    assert_eq!(sub.dropped(), 0);
    nc.close().await;
}

#[tokio::test]
async fn test_auto_unsubscribe_stops_after_limit() {
    let server = MockNatsServer::start().await;
    let nc = Connection::connect(test_options([server.url()])).await.unwrap();

    let sub = nc.subscribe_sync("limited").unwrap();
    sub.auto_unsubscribe(2).unwrap();
    nc.flush().await.unwrap();
    assert!(
        server
            .lines()
            .contains(&format!("UNSUB {} 2", sub.sid()))
    );

    for _ in 0..3 {
        nc.publish("limited", b"x").unwrap();
    }
    nc.flush().await.unwrap();

    assert!(sub.next_msg(WAIT).await.is_ok());
    assert!(sub.next_msg(WAIT).await.is_ok());
    assert!(matches!(
        sub.next_msg(Duration::from_millis(50)).await,
        Err(NatsError::MaxMessagesDelivered)
    ));
    assert!(!sub.is_valid());
    assert_eq!(nc.subscription_count(), 0);
    assert!(matches!(sub.auto_unsubscribe(0), Err(NatsError::InvalidArgument(_))));
    nc.close().await;
}

#[tokio::test]
async fn test_unsubscribe_sends_unsub() {
    let server = MockNatsServer::start().await;
    let nc = Connection::connect(test_options([server.url()])).await.unwrap();

    let sub = nc.subscribe_sync("gone").unwrap();
    sub.unsubscribe().unwrap();
    nc.flush().await.unwrap();
    assert!(server.lines().contains(&format!("UNSUB {}", sub.sid())));
    assert!(matches!(sub.unsubscribe(), Err(NatsError::BadSubscription)));
    assert!(!sub.is_valid());
    nc.close().await;
}

#[tokio::test]
async fn test_close_releases_waiters_and_rejects_calls() {
    let server = MockNatsServer::start().await;
    let (opts, mut events) = with_event_channel(test_options([server.url()]));
    let nc = Connection::connect(opts).await.unwrap();
    let sub = nc.subscribe_sync("x").unwrap();
    nc.flush().await.unwrap();

    server.ignore_pings(true);
    let flusher = {
        let nc = nc.clone();
        tokio::spawn(async move { nc.flush_timeout(Duration::from_secs(10)).await })
    };
    let receiver = {
        let sub = sub.clone();
        tokio::spawn(async move { sub.recv().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    nc.close().await;

    assert!(matches!(flusher.await.unwrap(), Err(NatsError::ConnectionClosed)));
    assert!(receiver.await.unwrap().is_err());
    assert!(nc.is_closed());
    assert!(matches!(nc.publish("x", b"y"), Err(NatsError::ConnectionClosed)));
    assert!(matches!(nc.subscribe_sync("x"), Err(NatsError::ConnectionClosed)));
    assert!(matches!(nc.flush().await, Err(NatsError::ConnectionClosed)));

    assert!(wait_for_event(&mut events, |e| matches!(e, Event::Closed), WAIT).await.is_some());
    // Idempotent
    nc.close().await;
}

#[tokio::test]
async fn test_dropping_last_handle_closes() {
    let server = MockNatsServer::start().await;
    let (opts, mut events) = with_event_channel(test_options([server.url()]));
    let nc = Connection::connect(opts).await.unwrap();
    let clone = nc.clone();
    drop(nc);
    assert!(!clone.is_closed());
    drop(clone);

    assert!(wait_for_event(&mut events, |e| matches!(e, Event::Closed), WAIT).await.is_some());
    assert!(wait_until(|| server.client_count() == 0, WAIT).await);
}

#[tokio::test]
async fn test_new_inbox_is_unique_under_prefix() {
    let server = MockNatsServer::start().await;
    let nc = Connection::connect(test_options([server.url()])).await.unwrap();
    let a = nc.new_inbox();
    let b = nc.new_inbox();
    assert!(a.starts_with("_INBOX."));
    assert_ne!(a, b);
    nc.close().await;
}
