use std::sync::Weak;

use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::OffsetError;
use crate::event_loop::{LoopCommand, ReceiverShared};
use crate::types::Partition;

/// An inbound Kafka record paired with the offset handle that controls its
/// acknowledgement and commit.
pub struct ConsumerMessage {
    record: OwnedMessage,
    offset: OffsetHandle,
}

impl ConsumerMessage {
    pub(crate) fn new(record: OwnedMessage, shared: Weak<ReceiverShared>) -> Self {
        let partition = Partition::new(record.topic(), record.partition());
        let offset = OffsetHandle {
            partition,
            offset: record.offset(),
            shared,
        };
        Self { record, offset }
    }

    /// The underlying record: topic, partition, offset, key, payload,
    /// headers and timestamp.
    pub fn record(&self) -> &OwnedMessage {
        &self.record
    }

    pub fn offset(&self) -> &OffsetHandle {
        &self.offset
    }

    pub fn topic(&self) -> &str {
        self.record.topic()
    }

    pub fn partition(&self) -> i32 {
        self.record.partition()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.record.payload()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.record.key()
    }
}

impl std::fmt::Debug for ConsumerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerMessage")
            .field("topic", &self.topic())
            .field("partition", &self.partition())
            .field("offset", &self.offset.offset())
            .finish()
    }
}

/// Per-record offset handle. Acknowledgement marks the offset as processed
/// and eligible for a future automatic commit; `commit` asks the event loop
/// to commit it now and resolves once the broker confirms.
///
/// The handle holds a weak reference back to the subscription; once the
/// consumer has shut down every operation fails with [`OffsetError::Gone`].
#[derive(Clone)]
pub struct OffsetHandle {
    partition: Partition,
    offset: i64,
    shared: Weak<ReceiverShared>,
}

impl OffsetHandle {
    pub fn topic_partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Mark this record as processed. Cumulative: acknowledging offset `n`
    /// implies every offset of the partition up to `n`.
    pub fn acknowledge(&self) -> Result<(), OffsetError> {
        let shared = self.shared.upgrade().ok_or(OffsetError::Gone)?;
        shared.manager.acknowledge(&self.partition, self.offset);
        Ok(())
    }

    /// Commit this record's offset (the next offset to consume) and resolve
    /// once the broker confirms. Retries are the caller's responsibility.
    pub async fn commit(&self) -> Result<(), OffsetError> {
        let shared = self.shared.upgrade().ok_or(OffsetError::Gone)?;
        let (reply, response) = oneshot::channel();
        shared
            .commands
            .send(LoopCommand::Commit {
                partition: self.partition.clone(),
                next_offset: self.offset + 1,
                reply,
            })
            .map_err(|_| OffsetError::Gone)?;

        debug!(
            topic = self.partition.topic(),
            partition = self.partition.index(),
            offset = self.offset,
            "commit requested"
        );

        match response.await {
            Ok(result) => result.map_err(OffsetError::Kafka),
            Err(_) => Err(OffsetError::Gone),
        }
    }
}

impl std::fmt::Debug for OffsetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OffsetHandle({}@{})", self.partition, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rdkafka::message::{OwnedHeaders, Timestamp};
    use tokio::sync::mpsc;

    use super::*;
    use crate::offset_manager::OffsetManager;

    fn test_message(topic: &str, partition: i32, offset: i64) -> OwnedMessage {
        OwnedMessage::new(
            Some(b"payload".to_vec()),
            Some(b"key".to_vec()),
            topic.to_string(),
            Timestamp::now(),
            partition,
            offset,
            Some(OwnedHeaders::new()),
        )
    }

    fn test_shared() -> (Arc<ReceiverShared>, mpsc::UnboundedReceiver<LoopCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ReceiverShared {
                manager: Arc::new(OffsetManager::new()),
                commands,
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn test_acknowledge_advances_manager() {
        let (shared, _rx) = test_shared();
        let message = ConsumerMessage::new(test_message("events", 0, 41), Arc::downgrade(&shared));

        message.offset().acknowledge().unwrap();

        let partition = Partition::new("events", 0);
        assert_eq!(shared.manager.acknowledged(&partition), Some(42));
    }

    #[tokio::test]
    async fn test_acknowledge_after_shutdown_fails_deterministically() {
        let (shared, _rx) = test_shared();
        let message = ConsumerMessage::new(test_message("events", 0, 0), Arc::downgrade(&shared));
        drop(shared);

        assert!(matches!(
            message.offset().acknowledge(),
            Err(OffsetError::Gone)
        ));
    }

    #[tokio::test]
    async fn test_commit_sends_next_offset_to_loop() {
        let (shared, mut rx) = test_shared();
        let message = ConsumerMessage::new(test_message("events", 2, 9), Arc::downgrade(&shared));

        let commit = tokio::spawn({
            let handle = message.offset().clone();
            async move { handle.commit().await }
        });

        match rx.recv().await.expect("commit command") {
            LoopCommand::Commit {
                partition,
                next_offset,
                reply,
            } => {
                assert_eq!(partition, Partition::new("events", 2));
                assert_eq!(next_offset, 10);
                reply.send(Ok(())).unwrap();
            }
            other => panic!("unexpected command: {other:?}"),
        }

        commit.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_commit_after_shutdown_fails_deterministically() {
        let (shared, rx) = test_shared();
        let message = ConsumerMessage::new(test_message("events", 0, 0), Arc::downgrade(&shared));
        drop(shared);
        drop(rx);

        assert!(matches!(
            message.offset().commit().await,
            Err(OffsetError::Gone)
        ));
    }
}
