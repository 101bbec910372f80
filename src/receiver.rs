//! Inbound engine: builds the four ack-mode streams over the consumer event
//! loop.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::ReceiverConfig;
use crate::context::{AssignCallback, FlowConsumerContext, RevokeCallback};
use crate::error::ReceiveError;
use crate::event_loop::{ConsumerEventLoop, LoopCommand, ReceiverShared};
use crate::message::ConsumerMessage;
use crate::offset_manager::{CommitPolicy, OffsetManager};
use crate::partition::{AssignmentWindow, SeekTarget, SeekablePartition};
use crate::types::{AckMode, Partition};

const DEFAULT_QUEUE_CAPACITY: usize = 64;

enum Subscription {
    Topics(Vec<String>),
    Pattern(String),
    Assignment(Vec<Partition>),
}

/// Factory for inbound record streams.
pub struct KafkaReceiver;

impl KafkaReceiver {
    /// Subscribe to the given topics through the consumer group.
    pub fn listen_on(
        config: ReceiverConfig,
        topics: impl IntoIterator<Item = impl Into<String>>,
    ) -> ReceiverBuilder {
        ReceiverBuilder::new(
            config,
            Subscription::Topics(topics.into_iter().map(Into::into).collect()),
        )
    }

    /// Subscribe to every topic matching the regex pattern.
    pub fn listen_matching(config: ReceiverConfig, pattern: &str) -> ReceiverBuilder {
        let pattern = if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            // librdkafka treats topics starting with '^' as patterns.
            format!("^{pattern}")
        };
        ReceiverBuilder::new(config, Subscription::Pattern(pattern))
    }

    /// Consume the given partitions directly, bypassing group coordination
    /// and rebalancing.
    pub fn assign(config: ReceiverConfig, partitions: Vec<Partition>) -> ReceiverBuilder {
        ReceiverBuilder::new(config, Subscription::Assignment(partitions))
    }
}

/// Configures a subscription before choosing its ack mode.
pub struct ReceiverBuilder {
    config: ReceiverConfig,
    subscription: Subscription,
    queue_capacity: usize,
    on_assigned: Option<AssignCallback>,
    on_revoked: Option<RevokeCallback>,
}

impl ReceiverBuilder {
    fn new(config: ReceiverConfig, subscription: Subscription) -> Self {
        Self {
            config,
            subscription,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            on_assigned: None,
            on_revoked: None,
        }
    }

    /// Callback invoked on the event-loop thread when partitions are
    /// assigned, before any record is fetched for them. Seeks recorded on
    /// the handles take effect first. An error terminates the subscription.
    pub fn on_partitions_assigned(
        mut self,
        callback: impl Fn(&[SeekablePartition]) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_assigned = Some(Arc::new(callback));
        self
    }

    /// Callback invoked on the event-loop thread when partitions are
    /// revoked, after their acknowledged offsets have been committed.
    pub fn on_partitions_revoked(
        mut self,
        callback: impl Fn(&[Partition]) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_revoked = Some(Arc::new(callback));
        self
    }

    /// Capacity of the per-subscription delivery queue. This is the demand
    /// window: once it fills, fetching pauses until the stream is drained.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Every record is acknowledged on delivery and committed by batch size
    /// or interval.
    pub fn auto_ack(self) -> Result<MessageStream, ReceiveError> {
        self.start(AckMode::AutoAck)
    }

    /// Offsets are committed before delivery; records are never redelivered.
    pub fn at_most_once(self) -> Result<MessageStream, ReceiveError> {
        self.start(AckMode::AtMostOnce)
    }

    /// The application acknowledges records; acknowledged offsets are
    /// committed by batch size or interval.
    pub fn manual_ack(self) -> Result<MessageStream, ReceiveError> {
        self.start(AckMode::ManualAck)
    }

    /// The application owns every commit; nothing is committed
    /// automatically, including on close.
    pub fn manual_commit(self) -> Result<MessageStream, ReceiveError> {
        self.start(AckMode::ManualCommit)
    }

    fn start(self, mode: AckMode) -> Result<MessageStream, ReceiveError> {
        let manager = Arc::new(OffsetManager::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = FlowConsumerContext::new(
            mode,
            manager.clone(),
            events_tx,
            self.on_assigned.clone(),
            self.on_revoked.clone(),
        );

        let consumer: StreamConsumer<FlowConsumerContext> = self
            .config
            .client()
            .create_with_context(context)
            .map_err(ReceiveError::ConsumerInit)?;

        match &self.subscription {
            Subscription::Topics(topics) => {
                let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
                consumer.subscribe(&topics)?;
                info!(?topics, "subscribed");
            }
            Subscription::Pattern(pattern) => {
                consumer.subscribe(&[pattern.as_str()])?;
                info!(pattern = %pattern, "subscribed to pattern");
            }
            Subscription::Assignment(partitions) => {
                let list = self.assignment_list(partitions)?;
                consumer.assign(&list)?;
                info!(count = partitions.len(), "assigned partitions");
            }
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (downstream_tx, downstream_rx) = mpsc::channel(self.queue_capacity);
        let shared = Arc::new(ReceiverShared {
            manager: manager.clone(),
            commands: commands_tx,
        });

        let policy = CommitPolicy::new(
            self.config.commit_batch_size_value(),
            self.config.commit_interval_value(),
            self.config.max_commit_attempts_value(),
            self.config.commit_retry_backoff_value(),
        );

        let event_loop = ConsumerEventLoop::new(
            consumer,
            mode,
            manager,
            policy,
            self.config.poll_timeout_value(),
            self.config.close_timeout_value(),
            self.config.retriable_predicate(),
            commands_rx,
            events_rx,
            downstream_tx,
            Arc::downgrade(&shared),
        );
        tokio::spawn(event_loop.run());

        Ok(MessageStream {
            messages: downstream_rx,
            shared,
            mode,
        })
    }

    /// Explicit assignment never goes through group rebalancing, so the
    /// assigned callback runs here and its seeks become the starting
    /// offsets of the assignment.
    fn assignment_list(
        &self,
        partitions: &[Partition],
    ) -> Result<TopicPartitionList, ReceiveError> {
        let mut starts = Vec::new();
        if let Some(callback) = &self.on_assigned {
            let window = AssignmentWindow::new();
            let handles: Vec<SeekablePartition> = partitions
                .iter()
                .map(|partition| SeekablePartition::new(partition.clone(), None, window.clone()))
                .collect();
            let result = callback(&handles);
            starts = window.close();
            result.map_err(ReceiveError::AssignmentCallback)?;
        }

        let mut list = TopicPartitionList::new();
        for partition in partitions {
            let target = starts
                .iter()
                .rev()
                .find(|request| &request.partition == partition)
                .map(|request| match request.target {
                    SeekTarget::Beginning => Offset::Beginning,
                    SeekTarget::End => Offset::End,
                    SeekTarget::Offset(offset) => Offset::Offset(offset),
                })
                .unwrap_or(Offset::Invalid);
            list.add_partition_offset(partition.topic(), partition.index(), target)?;
            debug!(
                topic = partition.topic(),
                partition = partition.index(),
                start = ?target,
                "assignment start position"
            );
        }
        Ok(list)
    }
}

/// Lazy sequence of inbound records. Dropping the stream cancels the
/// subscription: the event loop commits acknowledged offsets according to
/// the ack mode and closes the consumer.
pub struct MessageStream {
    messages: mpsc::Receiver<Result<ConsumerMessage, ReceiveError>>,
    shared: Arc<ReceiverShared>,
    mode: AckMode,
}

impl MessageStream {
    pub fn ack_mode(&self) -> AckMode {
        self.mode
    }

    /// Gracefully close the subscription and wait for the event loop to
    /// finish its final commit.
    pub async fn close(self) {
        let (reply, done) = oneshot::channel();
        if self
            .shared
            .commands
            .send(LoopCommand::Close { reply })
            .is_ok()
        {
            let _ = done.await;
        }
    }
}

impl Stream for MessageStream {
    type Item = Result<ConsumerMessage, ReceiveError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.poll_recv(cx)
    }
}
