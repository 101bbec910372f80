//! Lifecycle tests for the public sender and receiver surfaces. These run
//! against an unreachable broker on purpose: construction is lazy, local
//! state machines are real, and every send fails with a timeout, which is
//! exactly what the delay-error paths need.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use kafka_flow::{
    AckMode, KafkaReceiver, KafkaSender, Partition, ProduceRecord, ReceiverConfig, SendError,
    SendOptions, SenderConfig,
};

// Nothing listens here; producers queue and time out, consumers just never
// receive anything.
const UNREACHABLE: &str = "localhost:19092";

fn sender_config() -> SenderConfig {
    SenderConfig::new(UNREACHABLE)
        .set("message.timeout.ms", "400")
        .close_timeout(Duration::from_millis(500))
}

fn receiver_config() -> ReceiverConfig {
    ReceiverConfig::new(UNREACHABLE, "lifecycle-test-group")
        .poll_timeout(Duration::from_millis(50))
        .close_timeout(Duration::from_millis(200))
}

#[tokio::test]
async fn test_single_send_fails_with_kafka_error_without_broker() {
    let sender = KafkaSender::new(sender_config());

    let result = sender
        .send(ProduceRecord::to("events").key("k").payload("v"))
        .await;

    match result {
        Err(SendError::Kafka(_)) => {}
        other => panic!("expected delivery failure, got {other:?}"),
    }
    sender.close();
}

#[tokio::test]
async fn test_send_stream_delay_error_emits_all_responses() {
    let sender = KafkaSender::new(sender_config());

    let records = stream::iter((0..3).map(|i| {
        (
            ProduceRecord::to("events").payload(format!("message {i}")),
            i,
        )
    }));
    let options = SendOptions {
        max_in_flight: 8,
        delay_error: true,
    };

    let responses: Vec<_> = sender.send_stream_with(records, options).collect().await;

    // Three error-marked responses followed by the deferred terminal error.
    assert_eq!(responses.len(), 4);
    let mut correlators = Vec::new();
    for response in &responses[..3] {
        let result = response.as_ref().expect("marked response");
        assert!(result.delivery.is_err());
        correlators.push(result.correlator);
    }
    correlators.sort_unstable();
    assert_eq!(correlators, vec![0, 1, 2]);
    assert!(responses[3].is_err());

    sender.close();
}

#[tokio::test]
async fn test_send_stream_fail_fast_short_circuits() {
    let sender = KafkaSender::new(sender_config());

    let records = stream::iter((0..5).map(|i| (ProduceRecord::to("events").payload("x"), i)));
    let options = SendOptions {
        max_in_flight: 1,
        delay_error: false,
    };

    let responses: Vec<_> = sender.send_stream_with(records, options).collect().await;

    // max_in_flight = 1 serializes sends, so the first failure terminates
    // the stream before the rest are dispatched.
    assert_eq!(responses.len(), 1);
    assert!(responses[0].is_err());

    sender.close();
}

#[tokio::test]
async fn test_send_all_surfaces_first_failure() {
    let sender = KafkaSender::new(sender_config());

    let records = stream::iter((0..3).map(|i| ProduceRecord::to("events").payload(format!("{i}"))));
    let result = sender.send_all(records).await;
    assert!(result.is_err());

    sender.close();
}

#[tokio::test]
async fn test_sender_clones_share_one_producer() {
    let sender = KafkaSender::new(sender_config());
    let clone = sender.clone();

    let _ = sender.send(ProduceRecord::to("events").payload("x")).await;
    let _ = clone.send(ProduceRecord::to("events").payload("y")).await;

    // Close through either handle releases the shared producer; the second
    // close is a no-op.
    clone.close();
    sender.close();
}

#[tokio::test]
async fn test_receiver_close_resolves_without_broker() {
    let stream = KafkaReceiver::listen_on(receiver_config(), ["events"])
        .auto_ack()
        .expect("subscription starts without a broker");

    tokio::time::timeout(Duration::from_secs(2), stream.close())
        .await
        .expect("close resolves within the poll cycle");
}

#[tokio::test]
async fn test_receiver_drop_cancels_subscription() {
    let stream = KafkaReceiver::listen_on(receiver_config(), ["events"])
        .manual_ack()
        .expect("subscription starts");
    drop(stream);

    // The event loop notices the cancelled subscription on its next
    // iteration; nothing to assert beyond not hanging or panicking.
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_assignment_callback_runs_before_first_fetch() {
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_callback = seen.clone();

    let partitions = vec![
        Partition::new("events", 0),
        Partition::new("events", 1),
    ];
    let stream = KafkaReceiver::assign(receiver_config(), partitions)
        .on_partitions_assigned(move |handles| {
            seen_in_callback.store(handles.len(), Ordering::SeqCst);
            for handle in handles {
                handle.seek_to_beginning()?;
            }
            Ok(())
        })
        .manual_commit()
        .expect("explicit assignment starts");

    // Explicit assignment invokes the callback synchronously during start.
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(stream.ack_mode(), AckMode::ManualCommit);
    stream.close().await;
}

#[tokio::test]
async fn test_assignment_callback_failure_fails_subscription() {
    let partitions = vec![Partition::new("events", 0)];
    let result = KafkaReceiver::assign(receiver_config(), partitions)
        .on_partitions_assigned(|_| anyhow::bail!("refuse assignment"))
        .auto_ack();

    assert!(result.is_err());
}

#[tokio::test]
async fn test_pattern_subscription_starts() {
    let stream = KafkaReceiver::listen_matching(receiver_config(), "events-.*")
        .auto_ack()
        .expect("pattern subscription starts");
    stream.close().await;
}
