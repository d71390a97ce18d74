use super::memory::topic_matches;
use super::*;
use crate::config::{ExchangeKind, Topic};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::time::timeout;

const TTL: Duration = Duration::from_secs(60);

fn args() -> QueueArgs {
    QueueArgs::durable(&Tuning::default())
}

async fn open(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
    broker
        .connect(&MqOptions::default())
        .await
        .expect("connect to memory broker")
}

async fn next(stream: &mut DeliveryStream) -> Delivery {
    timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("delivery within a second")
        .expect("stream still open")
        .expect("delivery is not an error")
}

#[test]
fn test_topic_patterns() {
    assert!(topic_matches("a.b.c", "a.b.c"));
    assert!(!topic_matches("a.b.c", "a.b"));
    assert!(topic_matches("a.*.c", "a.x.c"));
    assert!(!topic_matches("a.*", "a.x.y"));
    assert!(topic_matches("a.#", "a"));
    assert!(topic_matches("a.#", "a.x.y"));
    assert!(topic_matches("#.z", "x.y.z"));
    assert!(topic_matches("#", "anything.at.all"));
    assert!(!topic_matches("a.#.z", "a.x.y"));
}

#[tokio::test]
async fn test_direct_and_fanout_routing() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;

    channel
        .declare_exchange(&Topic::new("direct-ex", ExchangeKind::Direct, "d"))
        .await
        .unwrap();
    channel
        .declare_exchange(&Topic::new("fan-ex", ExchangeKind::Fanout, "f"))
        .await
        .unwrap();
    channel.declare_queue("q1", &args()).await.unwrap();
    channel.declare_queue("q2", &args()).await.unwrap();
    channel.bind_queue("q1", "direct-ex", "d.one").await.unwrap();
    channel.bind_queue("q2", "direct-ex", "d.two").await.unwrap();
    channel.bind_queue("q1", "fan-ex", "ignored").await.unwrap();
    channel.bind_queue("q2", "fan-ex", "ignored").await.unwrap();

    channel.publish("direct-ex", "d.one", b"x", TTL).await.unwrap();
    assert_eq!(broker.queue_depth("q1"), 1);
    assert_eq!(broker.queue_depth("q2"), 0);

    channel.publish("fan-ex", "whatever", b"y", TTL).await.unwrap();
    assert_eq!(broker.queue_depth("q1"), 2);
    assert_eq!(broker.queue_depth("q2"), 1);

    // default exchange routes by queue name
    channel.publish("", "q2", b"z", TTL).await.unwrap();
    assert_eq!(broker.queue_depth("q2"), 2);

    assert_eq!(broker.published().len(), 3);
}

#[tokio::test]
async fn test_topic_exchange_delivers_once_per_queue() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel
        .declare_exchange(&Topic::new("audit", ExchangeKind::Topic, "audit"))
        .await
        .unwrap();
    channel.declare_queue("q", &args()).await.unwrap();
    channel.bind_queue("q", "audit", "audit.*").await.unwrap();
    channel.bind_queue("q", "audit", "audit.#").await.unwrap();

    channel.publish("audit", "audit.login", b"1", TTL).await.unwrap();
    assert_eq!(broker.queue_depth("q"), 1);
    channel.publish("billing", "audit.login", b"2", TTL).await.unwrap_err();
}

#[tokio::test]
async fn test_exchange_redeclare_with_other_kind_fails() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    let topic = Topic::new("ex", ExchangeKind::Direct, "p");
    channel.declare_exchange(&topic).await.unwrap();
    channel.declare_exchange(&topic).await.unwrap();

    let err = channel
        .declare_exchange(&Topic::new("ex", ExchangeKind::Fanout, "p"))
        .await
        .unwrap_err();
    assert!(matches!(err, MqError::Declare { what: "exchange", .. }));
    assert_eq!(broker.exchange_kind("ex"), Some(ExchangeKind::Direct));
}

#[tokio::test]
async fn test_queue_conflict_closes_channel() {
    let broker = MemoryBroker::new();
    broker.seed_queue(
        "q",
        QueueArgs {
            message_ttl: None,
            ..args()
        },
    );
    let channel = open(&broker).await;
    let closed = channel.notify_close();

    let err = channel.declare_queue("q", &args()).await.unwrap_err();
    assert_eq!(err.kind(), crate::utils::error::ErrorKind::QueueConflict);
    assert!(matches!(closed.await, Ok(MqError::ChannelClosed(_))));
    assert!(matches!(
        channel.declare_queue("other", &args()).await,
        Err(MqError::ChannelClosed(_))
    ));
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn test_delete_queue_reports_purged_count() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue("q", &args()).await.unwrap();
    channel.publish("", "q", b"a", TTL).await.unwrap();
    channel.publish("", "q", b"b", TTL).await.unwrap();

    assert_eq!(channel.delete_queue("q").await.unwrap(), 2);
    assert_eq!(channel.delete_queue("q").await.unwrap(), 0);
    assert!(broker.queue_args("q").is_none());
}

#[tokio::test]
async fn test_consume_backlog_then_live_in_order() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue("q", &args()).await.unwrap();
    channel.publish("", "q", b"first", TTL).await.unwrap();

    let mut stream = channel.consume("q", "tag").await.unwrap();
    channel.publish("", "q", b"second", TTL).await.unwrap();

    let first = next(&mut stream).await;
    let second = next(&mut stream).await;
    assert_eq!(first.body, b"first");
    assert_eq!(first.delivery_tag, 1);
    assert_eq!(second.body, b"second");
    assert_eq!(second.delivery_tag, 2);

    first.ack().await.unwrap();
    second.ack().await.unwrap();
    assert_eq!(broker.acked("q"), 2);
    assert_eq!(broker.queue_depth("q"), 0);
}

#[tokio::test]
async fn test_nack_with_requeue_redelivers() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue("q", &args()).await.unwrap();
    let mut stream = channel.consume("q", "tag").await.unwrap();
    channel.publish("", "q", b"retry", TTL).await.unwrap();

    let delivery = next(&mut stream).await;
    assert!(!delivery.redelivered);
    delivery.nack(true).await.unwrap();

    let again = next(&mut stream).await;
    assert!(again.redelivered);
    assert_eq!(again.body, b"retry");
    again.reject(false).await.unwrap();
    assert_eq!(broker.nacked("q"), 2);
    assert_eq!(broker.queue_depth("q"), 0);
}

#[tokio::test]
async fn test_unsettled_deliveries_return_when_channel_closes() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue("q", &args()).await.unwrap();
    let mut stream = channel.consume("q", "tag").await.unwrap();
    channel.publish("", "q", b"one", TTL).await.unwrap();
    channel.publish("", "q", b"two", TTL).await.unwrap();
    channel.publish("", "q", b"three", TTL).await.unwrap();

    let one = next(&mut stream).await;
    let two = next(&mut stream).await;
    let three = next(&mut stream).await;
    two.ack().await.unwrap();
    assert_eq!(broker.unacked("q"), 2);

    channel.close().await.unwrap();
    assert_eq!(broker.unacked("q"), 0);
    assert_eq!(broker.queue_depth("q"), 2);
    assert!(one.ack().await.is_err());
    assert!(three.nack(true).await.is_err());
    assert_eq!(broker.queue_depth("q"), 2);

    let other = open(&broker).await;
    let mut stream = other.consume("q", "tag").await.unwrap();
    let first = next(&mut stream).await;
    let second = next(&mut stream).await;
    assert_eq!(first.body, b"one");
    assert_eq!(second.body, b"three");
    assert!(first.redelivered && second.redelivered);
    first.ack().await.unwrap();
    second.ack().await.unwrap();
    assert_eq!(broker.acked("q"), 3);
}

#[tokio::test]
async fn test_broken_channel_hands_deliveries_to_remaining_consumer() {
    let broker = MemoryBroker::new();
    let a = open(&broker).await;
    let b = open(&broker).await;
    a.declare_queue("q", &args()).await.unwrap();
    let mut on_a = a.consume("q", "a").await.unwrap();
    a.publish("", "q", b"held by a", TTL).await.unwrap();
    let held = next(&mut on_a).await;
    assert!(!held.redelivered);

    let mut on_b = b.consume("q", "b").await.unwrap();
    a.declare_queue("q", &QueueArgs { expires: None, ..args() })
        .await
        .expect_err("conflicting declaration breaks channel a");

    let moved = next(&mut on_b).await;
    assert_eq!(moved.body, b"held by a");
    assert!(moved.redelivered);
    moved.ack().await.unwrap();
    assert_eq!(broker.unacked("q"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_messages_are_not_delivered() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue("q", &args()).await.unwrap();
    channel
        .publish("", "q", b"short", Duration::from_millis(100))
        .await
        .unwrap();
    channel.publish("", "q", b"long", TTL).await.unwrap();

    tokio::time::advance(Duration::from_millis(200)).await;

    let mut stream = channel.consume("q", "tag").await.unwrap();
    assert_eq!(next(&mut stream).await.body, b"long");
}

#[tokio::test]
async fn test_confirms_are_numbered_per_channel() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue("q", &args()).await.unwrap();
    let mut confirms = channel.enable_confirms(4).await.unwrap();

    broker.nack_next(1);
    channel.publish("", "q", b"a", TTL).await.unwrap();
    let first = confirms.recv().await.unwrap();
    assert_eq!(first, Confirmation { delivery_tag: 1, ack: false });

    channel.publish("", "q", b"b", TTL).await.unwrap();
    let second = confirms.recv().await.unwrap();
    assert_eq!(second, Confirmation { delivery_tag: 2, ack: true });

    let other = open(&broker).await;
    let mut other_confirms = other.enable_confirms(4).await.unwrap();
    other.publish("", "q", b"c", TTL).await.unwrap();
    assert_eq!(other_confirms.recv().await.unwrap().delivery_tag, 1);
}

#[tokio::test]
async fn test_failed_send_does_not_take_a_tag() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue("q", &args()).await.unwrap();
    let mut confirms = channel.enable_confirms(4).await.unwrap();

    broker.fail_next_sends(1);
    assert!(matches!(
        channel.publish("", "q", b"lost", TTL).await,
        Err(MqError::Send(_))
    ));
    channel.publish("", "q", b"kept", TTL).await.unwrap();

    assert_eq!(confirms.recv().await.unwrap().delivery_tag, 1);
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn test_held_confirms_and_closed_stream() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    let mut confirms = channel.enable_confirms(4).await.unwrap();

    broker.hold_confirms(true);
    channel.publish("", "nowhere", b"a", TTL).await.unwrap();
    assert!(
        timeout(Duration::from_millis(50), confirms.recv())
            .await
            .is_err()
    );

    broker.release_confirms().await;
    assert_eq!(confirms.recv().await.unwrap().delivery_tag, 1);

    broker.close_confirms();
    assert!(confirms.recv().await.is_none());
}

#[tokio::test]
async fn test_close_channels_notifies_and_ends_consumers() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue("q", &args()).await.unwrap();
    let mut stream = channel.consume("q", "tag").await.unwrap();
    let closed = channel.notify_close();

    broker.close_channels("connection reset");

    match closed.await {
        Ok(MqError::ChannelClosed(reason)) => assert_eq!(reason, "connection reset"),
        other => panic!("unexpected close notification: {other:?}"),
    }
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_client_close_drops_listeners_silently() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    let closed = channel.notify_close();

    channel.close().await.unwrap();
    assert!(closed.await.is_err());
    assert_eq!(broker.open_channels(), 0);
    assert_eq!(broker.connects(), 1);
}

#[tokio::test]
async fn test_refused_connection() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(true);
    let err = broker.connect(&MqOptions::default()).await.err();
    assert!(matches!(err, Some(MqError::Connect(_))));
    assert_eq!(broker.connects(), 0);
}

#[tokio::test]
async fn test_stalled_sends_wait_for_resume() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    broker.stall_sends(true);

    let publisher = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.publish("", "q", b"late", TTL).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(broker.published().is_empty());

    broker.stall_sends(false);
    publisher.await.unwrap().unwrap();
    assert_eq!(broker.published().len(), 1);
}
