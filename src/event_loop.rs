//! The consumer event loop: sole owner of the underlying Kafka consumer.
//!
//! One spawned task per subscription. Each iteration drains control requests
//! and commit outcomes without blocking, delivers stashed records under
//! back-pressure, evaluates commit triggers, then polls bounded by the
//! configured poll timeout. Slow downstream consumers are absorbed by
//! pausing the assignment while polling continues, which keeps the group
//! membership alive.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Instant;

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::OwnedMessage;
use rdkafka::{Message, Offset, TopicPartitionList};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::RetriablePredicate;
use crate::context::{commit_offsets, ContextEvent, FlowConsumerContext};
use crate::error::ReceiveError;
use crate::message::ConsumerMessage;
use crate::metrics::{RECEIVER_PAUSED, RECEIVER_RECORDS_DELIVERED};
use crate::offset_manager::{CommitPolicy, OffsetManager};
use crate::types::{AckMode, Partition, PartitionOffset};

pub(crate) type Downstream = mpsc::Sender<Result<ConsumerMessage, ReceiveError>>;

/// Control requests accepted by the event loop. Drained between polls.
#[derive(Debug)]
pub(crate) enum LoopCommand {
    /// Commit exactly this next-to-consume offset and reply once the broker
    /// confirms.
    Commit {
        partition: Partition,
        next_offset: i64,
        reply: oneshot::Sender<KafkaResult<()>>,
    },
    /// Graceful shutdown; the reply fires after the final commit.
    Close { reply: oneshot::Sender<()> },
}

/// State shared between the subscription's public handles and the event
/// loop. Offset handles hold this weakly, so a closed subscription turns
/// every handle operation into a deterministic error.
pub(crate) struct ReceiverShared {
    pub(crate) manager: Arc<OffsetManager>,
    pub(crate) commands: mpsc::UnboundedSender<LoopCommand>,
}

/// Why the loop is exiting.
enum Shutdown {
    Closed(Option<oneshot::Sender<()>>),
    Cancelled,
    Failed(ReceiveError),
}

pub(crate) struct ConsumerEventLoop {
    consumer: StreamConsumer<FlowConsumerContext>,
    mode: AckMode,
    manager: Arc<OffsetManager>,
    policy: CommitPolicy,
    poll_timeout: std::time::Duration,
    close_timeout: std::time::Duration,
    retriable: Option<RetriablePredicate>,
    commands: mpsc::UnboundedReceiver<LoopCommand>,
    events: mpsc::UnboundedReceiver<ContextEvent>,
    downstream: Downstream,
    shared: Weak<ReceiverShared>,
    paused: bool,
    pending: VecDeque<ConsumerMessage>,
    /// Snapshot of the async commit currently awaiting its broker outcome.
    awaiting_commit: Option<HashMap<Partition, i64>>,
}

impl ConsumerEventLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: StreamConsumer<FlowConsumerContext>,
        mode: AckMode,
        manager: Arc<OffsetManager>,
        policy: CommitPolicy,
        poll_timeout: std::time::Duration,
        close_timeout: std::time::Duration,
        retriable: Option<RetriablePredicate>,
        commands: mpsc::UnboundedReceiver<LoopCommand>,
        events: mpsc::UnboundedReceiver<ContextEvent>,
        downstream: Downstream,
        shared: Weak<ReceiverShared>,
    ) -> Self {
        Self {
            consumer,
            mode,
            manager,
            policy,
            poll_timeout,
            close_timeout,
            retriable,
            commands,
            events,
            downstream,
            shared,
            paused: false,
            pending: VecDeque::new(),
            awaiting_commit: None,
        }
    }

    pub async fn run(mut self) {
        info!(mode = ?self.mode, "consumer event loop started");
        let reason = self.run_inner().await;
        self.shutdown(reason).await;
    }

    async fn run_inner(&mut self) -> Shutdown {
        loop {
            // Control requests first: seeks were applied by the rebalance
            // callback, commits reply through their sink here.
            loop {
                match self.commands.try_recv() {
                    Ok(LoopCommand::Close { reply }) => return Shutdown::Closed(Some(reply)),
                    Ok(command) => self.handle_command(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Shutdown::Cancelled,
                }
            }

            while let Ok(event) = self.events.try_recv() {
                if let Some(error) = self.handle_event(event) {
                    return Shutdown::Failed(error);
                }
            }

            if let Err(stop) = self.flush_pending().await {
                return stop;
            }

            if self.awaiting_commit.is_none()
                && self
                    .policy
                    .commit_due(self.manager.acked_uncommitted(), Instant::now())
            {
                if let Err(stop) = self.issue_auto_commit() {
                    return stop;
                }
            }

            let polled = timeout(self.poll_timeout, self.consumer.recv()).await;
            match polled {
                // Idle poll; bounds control-request latency and lets the
                // client service heartbeats and callbacks.
                Err(_elapsed) => {}
                Ok(Err(e)) => {
                    error!("poll failed: {e}");
                    return Shutdown::Failed(ReceiveError::Kafka(e));
                }
                Ok(Ok(borrowed)) => {
                    let record = borrowed.detach();
                    drop(borrowed);
                    if let Err(stop) = self.deliver(record).await {
                        return stop;
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: LoopCommand) {
        match command {
            LoopCommand::Commit {
                partition,
                next_offset,
                reply,
            } => {
                let offsets = HashMap::from([(partition, next_offset)]);
                let result = commit_offsets(&self.consumer, &offsets);
                if result.is_ok() {
                    self.manager.mark_committed(&offsets);
                }
                let _ = reply.send(result);
            }
            LoopCommand::Close { .. } => unreachable!("close handled by caller"),
        }
    }

    fn handle_event(&mut self, event: ContextEvent) -> Option<ReceiveError> {
        match event {
            ContextEvent::CommitOutcome { result, offsets } => {
                let awaiting = self.awaiting_commit.take();
                match result {
                    Ok(()) => {
                        if let Some(snapshot) = awaiting {
                            self.manager.mark_committed(&snapshot);
                        } else if !offsets.is_empty() {
                            self.manager.mark_committed(&offsets);
                        }
                        self.policy.record_success(Instant::now());
                        None
                    }
                    // Failures of synchronous commits were already reported
                    // to their caller; only auto-commit outcomes feed the
                    // retry policy.
                    Err(e) if awaiting.is_some() => self.on_commit_failure(e),
                    Err(_) => None,
                }
            }
            ContextEvent::CallbackFailed(e) => Some(ReceiveError::AssignmentCallback(e)),
            ContextEvent::RebalanceFailed(e) => Some(ReceiveError::Rebalance(e)),
        }
    }

    fn issue_auto_commit(&mut self) -> Result<(), Shutdown> {
        let snapshot = self.manager.snapshot_for_commit();
        if snapshot.is_empty() {
            self.policy.record_success(Instant::now());
            return Ok(());
        }

        let list = match to_partition_list(&snapshot) {
            Ok(list) => list,
            Err(e) => return Err(Shutdown::Failed(ReceiveError::Kafka(e))),
        };

        debug!(partitions = snapshot.len(), "committing acknowledged offsets");
        match self.consumer.commit(&list, CommitMode::Async) {
            Ok(()) => {
                self.awaiting_commit = Some(snapshot);
                Ok(())
            }
            Err(e) => match self.on_commit_failure(e) {
                Some(error) => Err(Shutdown::Failed(error)),
                None => Ok(()),
            },
        }
    }

    fn on_commit_failure(&mut self, e: KafkaError) -> Option<ReceiveError> {
        let retriable = match &self.retriable {
            Some(predicate) => predicate(&e),
            None => default_retriable(&e),
        };

        if !retriable {
            error!("non-retriable commit failure: {e}");
            return Some(ReceiveError::CommitExhausted {
                attempts: self.policy.attempts() + 1,
                source: e,
            });
        }

        match self.policy.record_failure(Instant::now()) {
            Some(backoff) => {
                warn!(
                    attempt = self.policy.attempts(),
                    backoff_ms = backoff.as_millis() as u64,
                    "commit failed, will retry: {e}"
                );
                None
            }
            None => {
                error!(attempts = self.policy.attempts(), "commit retries exhausted: {e}");
                Some(ReceiveError::CommitExhausted {
                    attempts: self.policy.attempts(),
                    source: e,
                })
            }
        }
    }

    async fn deliver(&mut self, record: OwnedMessage) -> Result<(), Shutdown> {
        if self.mode == AckMode::AtMostOnce {
            // Commit before delivery: the record is lost rather than
            // redelivered if processing never happens.
            let partition = Partition::new(record.topic(), record.partition());
            let offsets = HashMap::from([(partition, record.offset() + 1)]);
            match commit_offsets(&self.consumer, &offsets) {
                Ok(()) => self.manager.mark_committed(&offsets),
                Err(e) => return Err(Shutdown::Failed(ReceiveError::Kafka(e))),
            }
        }

        let message = ConsumerMessage::new(record, self.shared.clone());
        if self.paused {
            self.pending.push_back(message);
            return Ok(());
        }

        match self.try_send(message) {
            SendOutcome::Sent => Ok(()),
            SendOutcome::Full(message) => {
                self.pause()?;
                self.pending.push_back(message);
                Ok(())
            }
            SendOutcome::Closed => Err(Shutdown::Cancelled),
        }
    }

    /// Drain stashed records once downstream demand returns, then resume
    /// fetching. Bounded waits only; the loop must keep polling.
    async fn flush_pending(&mut self) -> Result<(), Shutdown> {
        if !self.paused {
            return Ok(());
        }

        while let Some(message) = self.pending.pop_front() {
            match self.try_send(message) {
                SendOutcome::Sent => continue,
                SendOutcome::Closed => return Err(Shutdown::Cancelled),
                SendOutcome::Full(message) => {
                    self.pending.push_front(message);
                    match timeout(self.poll_timeout, self.downstream.reserve()).await {
                        // Still no demand: stay paused, go back to polling
                        // so heartbeats and control requests stay serviced.
                        Err(_elapsed) => return Ok(()),
                        Ok(Err(_closed)) => return Err(Shutdown::Cancelled),
                        Ok(Ok(permit)) => {
                            let message = self.pending.pop_front().expect("stash not empty");
                            let note = delivery_note(&message);
                            permit.send(Ok(message));
                            self.note_delivered(note);
                        }
                    }
                }
            }
        }

        self.resume()
    }

    fn try_send(&mut self, message: ConsumerMessage) -> SendOutcome {
        let note = delivery_note(&message);
        match self.downstream.try_send(Ok(message)) {
            Ok(()) => {
                self.note_delivered(note);
                SendOutcome::Sent
            }
            Err(TrySendError::Full(Ok(message))) => SendOutcome::Full(message),
            Err(TrySendError::Full(Err(_))) => unreachable!("only records are stashed"),
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    fn note_delivered(&self, note: PartitionOffset) {
        metrics::counter!(RECEIVER_RECORDS_DELIVERED).increment(1);
        if self.mode == AckMode::AutoAck {
            self.manager.acknowledge(note.partition(), note.offset());
        }
    }

    fn pause(&mut self) -> Result<(), Shutdown> {
        if self.paused {
            return Ok(());
        }
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| Shutdown::Failed(ReceiveError::Kafka(e)))?;
        self.consumer
            .pause(&assignment)
            .map_err(|e| Shutdown::Failed(ReceiveError::Kafka(e)))?;
        self.paused = true;
        metrics::gauge!(RECEIVER_PAUSED).set(1.0);
        debug!("paused fetches, downstream demand exhausted");
        Ok(())
    }

    fn resume(&mut self) -> Result<(), Shutdown> {
        if !self.paused {
            return Ok(());
        }
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| Shutdown::Failed(ReceiveError::Kafka(e)))?;
        self.consumer
            .resume(&assignment)
            .map_err(|e| Shutdown::Failed(ReceiveError::Kafka(e)))?;
        self.paused = false;
        metrics::gauge!(RECEIVER_PAUSED).set(0.0);
        debug!("resumed fetches");
        Ok(())
    }

    async fn shutdown(mut self, reason: Shutdown) {
        // Final commit of acknowledged offsets. Manual-commit mode never
        // commits here: the application owns every commit.
        if matches!(self.mode, AckMode::AutoAck | AckMode::ManualAck) {
            self.commit_on_close().await;
        }

        match reason {
            Shutdown::Closed(reply) => {
                info!("consumer event loop closed");
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Shutdown::Cancelled => {
                info!("subscription cancelled, consumer event loop closed");
            }
            Shutdown::Failed(error) => {
                error!("consumer event loop terminating: {error}");
                let _ = timeout(self.close_timeout, self.downstream.send(Err(error))).await;
            }
        }
    }

    /// Commit outstanding acknowledged offsets, bounded by the close
    /// timeout. Uses an async commit and keeps polling so the confirmation
    /// callback can fire.
    async fn commit_on_close(&mut self) {
        let snapshot = self.manager.snapshot_for_commit();
        if snapshot.is_empty() {
            return;
        }
        let list = match to_partition_list(&snapshot) {
            Ok(list) => list,
            Err(e) => {
                warn!("final commit skipped: {e}");
                return;
            }
        };
        if let Err(e) = self.consumer.commit(&list, CommitMode::Async) {
            warn!("final commit failed: {e}");
            return;
        }

        let deadline = tokio::time::Instant::now() + self.close_timeout;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("close timeout reached before final commit was confirmed");
                    return;
                }
                event = self.events.recv() => match event {
                    Some(ContextEvent::CommitOutcome { result: Ok(()), .. }) => {
                        self.manager.mark_committed(&snapshot);
                        info!(partitions = snapshot.len(), "final offsets committed");
                        return;
                    }
                    Some(ContextEvent::CommitOutcome { result: Err(e), .. }) => {
                        warn!("final commit failed: {e}");
                        return;
                    }
                    // Already shutting down; other events no longer matter.
                    Some(_) => {}
                    None => return,
                },
                // Keep servicing the client so the commit callback can run.
                polled = self.consumer.recv() => {
                    if polled.is_err() {
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }
}

enum SendOutcome {
    Sent,
    Full(ConsumerMessage),
    Closed,
}

fn delivery_note(message: &ConsumerMessage) -> PartitionOffset {
    PartitionOffset::new(
        Partition::new(message.topic(), message.partition()),
        message.offset().offset(),
    )
}

fn to_partition_list(offsets: &HashMap<Partition, i64>) -> KafkaResult<TopicPartitionList> {
    let mut list = TopicPartitionList::new();
    for (partition, next_offset) in offsets {
        list.add_partition_offset(
            partition.topic(),
            partition.index(),
            Offset::Offset(*next_offset),
        )?;
    }
    Ok(list)
}

/// Commit failures worth retrying: broker-side coordination hiccups and
/// transport timeouts. Everything else fails fast unless the application
/// injects its own predicate.
pub(crate) fn default_retriable(e: &KafkaError) -> bool {
    matches!(
        e.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::BrokerNotAvailable
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retriable_classification() {
        let retriable = KafkaError::ConsumerCommit(RDKafkaErrorCode::RequestTimedOut);
        assert!(default_retriable(&retriable));

        let non_retriable = KafkaError::ConsumerCommit(RDKafkaErrorCode::UnknownTopic);
        assert!(!default_retriable(&non_retriable));
    }

    #[test]
    fn test_to_partition_list_carries_next_offsets() {
        let offsets = HashMap::from([
            (Partition::new("events", 0), 5i64),
            (Partition::new("events", 1), 10i64),
        ]);
        let list = to_partition_list(&offsets).unwrap();
        assert_eq!(list.count(), 2);

        let elem = list
            .find_partition("events", 0)
            .expect("partition 0 present");
        assert_eq!(elem.offset(), Offset::Offset(5));
    }
}
