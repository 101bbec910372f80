use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors surfaced by the outbound engine.
#[derive(Debug, Error, Clone)]
pub enum SendError {
    #[error("failed to create producer: {0}")]
    ProducerInit(#[source] KafkaError),
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("delivery canceled before an acknowledgement was received")]
    Canceled,
    #[error("sender is closed")]
    PipelineClosed,
}

/// Errors surfaced by the inbound engine. Terminal for the subscription that
/// observes them; other subscriptions are unaffected.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("failed to create consumer: {0}")]
    ConsumerInit(#[source] KafkaError),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("offset commit failed after {attempts} attempts: {source}")]
    CommitExhausted {
        attempts: u32,
        #[source]
        source: KafkaError,
    },
    #[error("partition assignment callback failed: {0}")]
    AssignmentCallback(#[source] anyhow::Error),
    #[error("rebalance failed: {0}")]
    Rebalance(#[source] KafkaError),
}

/// Errors from operations on an [`OffsetHandle`](crate::OffsetHandle) or a
/// [`SeekablePartition`](crate::SeekablePartition).
#[derive(Debug, Error)]
pub enum OffsetError {
    #[error("consumer gone")]
    Gone,
    #[error("partition handle is only usable inside the assignment callback")]
    WindowClosed,
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}
