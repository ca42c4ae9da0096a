use super::*;
use futures::StreamExt;
use std::time::Duration;

fn headers(pairs: &[(&str, &str)]) -> HeaderCarrier {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_declare_is_idempotent() {
    let channel = MemoryChannel::new();
    channel.declare_queue("todo.create").await.unwrap();
    channel
        .publish("todo.create", b"abc", HeaderCarrier::new())
        .await
        .unwrap();
    channel.declare_queue("todo.create").await.unwrap();

    assert_eq!(channel.queue_depth("todo.create"), Some(1));
}

#[tokio::test]
async fn test_publish_to_undeclared_queue_is_dropped() {
    let channel = MemoryChannel::new();
    channel
        .publish("nowhere", b"lost", HeaderCarrier::new())
        .await
        .unwrap();
    assert_eq!(channel.queue_depth("nowhere"), None);
}

#[tokio::test]
async fn test_message_waits_for_late_consumer() {
    let channel = MemoryChannel::new();
    channel.declare_queue("todo.create").await.unwrap();
    channel
        .publish("todo.create", b"abc", headers(&[("traceparent", "tp")]))
        .await
        .unwrap();

    let mut stream = channel
        .subscribe("todo.create", "late", AckPolicy::Immediate)
        .await
        .unwrap();
    let message = stream.next().await.unwrap().unwrap();

    assert_eq!(message.body, b"abc");
    assert_eq!(message.headers.get("traceparent"), "tp");
    assert_eq!(channel.queue_depth("todo.create"), Some(0));
}

#[tokio::test]
async fn test_subscribe_undeclared_queue_fails() {
    let channel = MemoryChannel::new();
    let result = channel
        .subscribe("missing", "tag", AckPolicy::Immediate)
        .await;
    assert!(matches!(result, Err(BusError::Subscribe(_))));
}

#[tokio::test]
async fn test_single_consumer_per_queue() {
    let channel = MemoryChannel::new();
    channel.declare_queue("q").await.unwrap();

    let first = channel.subscribe("q", "a", AckPolicy::Immediate).await.unwrap();
    let second = channel.subscribe("q", "b", AckPolicy::Immediate).await;
    assert!(matches!(second, Err(BusError::Subscribe(_))));

    drop(first);
    assert!(channel.subscribe("q", "b", AckPolicy::Immediate).await.is_ok());
}

#[tokio::test]
async fn test_fail_declare() {
    let channel = MemoryChannel::new();
    channel.fail_declare("broken");

    let result = channel.declare_queue("broken").await;
    assert!(matches!(result, Err(BusError::Declare { .. })));
    assert!(channel.declare_queue("fine").await.is_ok());
}

#[tokio::test]
async fn test_fail_on_publish() {
    let channel = MemoryChannel::new();
    channel.declare_queue("q").await.unwrap();
    channel.set_fail_on_publish(true);

    let result = channel.publish("q", b"x", HeaderCarrier::new()).await;
    assert!(matches!(result, Err(BusError::Publish(_))));
    assert_eq!(channel.queue_depth("q"), Some(0));
}

#[tokio::test]
async fn test_manual_ack_and_requeue() {
    let channel = MemoryChannel::new();
    channel.declare_queue("q").await.unwrap();
    channel.publish("q", b"one", HeaderCarrier::new()).await.unwrap();

    let mut stream = channel
        .subscribe("q", "tag", AckPolicy::AfterSuccess)
        .await
        .unwrap();

    let first = stream.next().await.unwrap().unwrap();
    first.nack(true).await.unwrap();
    assert_eq!(channel.requeued_count("q"), 1);

    let redelivered = stream.next().await.unwrap().unwrap();
    assert_eq!(redelivered.body, b"one");
    redelivered.ack().await.unwrap();
    assert_eq!(channel.acked_count("q"), 1);

    // Settling twice is an error.
    assert!(matches!(redelivered.ack().await, Err(BusError::Ack(_))));
}

#[tokio::test]
async fn test_auto_ack_settles_nothing() {
    let channel = MemoryChannel::new();
    channel.declare_queue("q").await.unwrap();
    channel.publish("q", b"one", HeaderCarrier::new()).await.unwrap();

    let mut stream = channel.subscribe("q", "tag", AckPolicy::Immediate).await.unwrap();
    let message = stream.next().await.unwrap().unwrap();
    message.ack().await.unwrap();
    message.ack().await.unwrap();
    assert_eq!(channel.acked_count("q"), 0);
}

#[tokio::test]
async fn test_close_ends_waiting_stream() {
    let channel = Arc::new(MemoryChannel::new());
    channel.declare_queue("q").await.unwrap();
    let mut stream = channel.subscribe("q", "tag", AckPolicy::Immediate).await.unwrap();

    let waiter = tokio::spawn(async move { stream.next().await.is_none() });
    tokio::time::sleep(Duration::from_millis(20)).await;

    channel.close().await.unwrap();
    let ended = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("stream did not end after close")
        .unwrap();
    assert!(ended);
}

#[tokio::test]
async fn test_close_is_idempotent_and_rejects_use() {
    let channel = MemoryChannel::new();
    channel.close().await.unwrap();
    channel.close().await.unwrap();

    assert!(channel.is_closed());
    assert!(matches!(
        channel.declare_queue("q").await,
        Err(BusError::Closed)
    ));
    assert!(matches!(
        channel.publish("q", b"x", HeaderCarrier::new()).await,
        Err(BusError::Closed)
    ));
}

#[tokio::test]
async fn test_publish_wakes_waiting_consumer() {
    let channel = Arc::new(MemoryChannel::new());
    channel.declare_queue("q").await.unwrap();
    let mut stream = channel.subscribe("q", "tag", AckPolicy::Immediate).await.unwrap();

    let receiver = tokio::spawn(async move { stream.next().await.map(|m| m.unwrap().body) });
    tokio::time::sleep(Duration::from_millis(20)).await;
    channel.publish("q", b"late", HeaderCarrier::new()).await.unwrap();

    let body = tokio::time::timeout(Duration::from_secs(1), receiver)
        .await
        .expect("consumer was not woken")
        .unwrap();
    assert_eq!(body, Some(b"late".to_vec()));
}
