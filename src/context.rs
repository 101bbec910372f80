use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::metrics::{RECEIVER_COMMITS, RECEIVER_COMMIT_FAILURES, RECEIVER_REBALANCES};
use crate::offset_manager::OffsetManager;
use crate::partition::{AssignmentWindow, SeekTarget, SeekablePartition};
use crate::types::{AckMode, Partition};

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// User callback invoked on the event-loop thread when partitions are
/// assigned, before fetching resumes. An error terminates the subscription.
pub type AssignCallback = Arc<dyn Fn(&[SeekablePartition]) -> anyhow::Result<()> + Send + Sync>;

/// User callback invoked on the event-loop thread when partitions are
/// revoked, after acknowledged offsets have been committed.
pub type RevokeCallback = Arc<dyn Fn(&[Partition]) -> anyhow::Result<()> + Send + Sync>;

/// Events the rebalance/commit callbacks push back to the event loop.
#[derive(Debug)]
pub(crate) enum ContextEvent {
    /// Outcome of a broker commit, delivered via librdkafka's commit
    /// callback. Carries the committed offsets as next-to-consume values.
    CommitOutcome {
        result: KafkaResult<()>,
        offsets: HashMap<Partition, i64>,
    },
    /// An assignment or revocation callback returned an error.
    CallbackFailed(anyhow::Error),
    /// librdkafka reported a rebalance-protocol failure.
    RebalanceFailed(KafkaError),
}

/// Consumer context wiring librdkafka's rebalance and commit callbacks into
/// the event loop. Everything here runs on the event-loop thread, inside the
/// consumer poll.
pub(crate) struct FlowConsumerContext {
    mode: AckMode,
    manager: Arc<OffsetManager>,
    events: mpsc::UnboundedSender<ContextEvent>,
    on_assigned: Option<AssignCallback>,
    on_revoked: Option<RevokeCallback>,
}

impl FlowConsumerContext {
    pub fn new(
        mode: AckMode,
        manager: Arc<OffsetManager>,
        events: mpsc::UnboundedSender<ContextEvent>,
        on_assigned: Option<AssignCallback>,
        on_revoked: Option<RevokeCallback>,
    ) -> Self {
        Self {
            mode,
            manager,
            events,
            on_assigned,
            on_revoked,
        }
    }

    fn handle_assign(&self, consumer: &BaseConsumer<Self>, assigned: &TopicPartitionList) {
        let partitions: Vec<Partition> = assigned.elements().into_iter().map(Partition::from).collect();
        info!(count = partitions.len(), "partitions assigned");
        metrics::counter!(RECEIVER_REBALANCES).increment(1);

        let Some(callback) = &self.on_assigned else {
            return;
        };

        // Positions as of assignment time, for SeekablePartition::position.
        let positions = consumer.position().ok();
        let position_of = |partition: &Partition| -> Option<i64> {
            positions.as_ref().and_then(|list| {
                list.elements()
                    .into_iter()
                    .find(|elem| {
                        elem.topic() == partition.topic()
                            && elem.partition() == partition.index()
                    })
                    .and_then(|elem| elem.offset().to_raw())
            })
        };

        let window = AssignmentWindow::new();
        let handles: Vec<SeekablePartition> = partitions
            .iter()
            .map(|partition| {
                SeekablePartition::new(partition.clone(), position_of(partition), window.clone())
            })
            .collect();

        let result = callback(&handles);
        let requests = window.close();

        if let Err(e) = result {
            error!("partitions-assigned callback failed: {e:#}");
            let _ = self.events.send(ContextEvent::CallbackFailed(e));
            return;
        }

        // Seeks recorded in the callback take effect before any fetch for
        // the new assignment.
        for request in requests {
            let offset = match request.target {
                SeekTarget::Beginning => Offset::Beginning,
                SeekTarget::End => Offset::End,
                SeekTarget::Offset(offset) => Offset::Offset(offset),
            };
            if let Err(e) = consumer.seek(
                request.partition.topic(),
                request.partition.index(),
                offset,
                SEEK_TIMEOUT,
            ) {
                error!(
                    topic = request.partition.topic(),
                    partition = request.partition.index(),
                    "seek failed: {e}"
                );
                let _ = self.events.send(ContextEvent::CallbackFailed(e.into()));
                return;
            }
            debug!(
                topic = request.partition.topic(),
                partition = request.partition.index(),
                target = ?request.target,
                "applied seek"
            );
        }
    }

    fn handle_revoke(&self, consumer: &BaseConsumer<Self>, revoked: &TopicPartitionList) {
        let partitions: Vec<Partition> = revoked.elements().into_iter().map(Partition::from).collect();
        info!(count = partitions.len(), "partitions revoked");
        metrics::counter!(RECEIVER_REBALANCES).increment(1);

        // Best-effort commit of acknowledged offsets before ownership moves.
        if matches!(self.mode, AckMode::AutoAck | AckMode::ManualAck) {
            let snapshot = self.manager.snapshot_for_partitions(&partitions);
            if !snapshot.is_empty() {
                match commit_offsets(consumer, &snapshot) {
                    Ok(()) => self.manager.mark_committed(&snapshot),
                    Err(e) => warn!("commit on revoke failed: {e}"),
                }
            }
        }

        if let Some(callback) = &self.on_revoked {
            if let Err(e) = callback(&partitions) {
                error!("partitions-revoked callback failed: {e:#}");
                let _ = self.events.send(ContextEvent::CallbackFailed(e));
            }
        }

        for partition in &partitions {
            self.manager.clear_partition(partition);
        }
    }

    /// A protocol-level rebalance failure is terminal for the subscription;
    /// the event loop surfaces it downstream.
    fn handle_rebalance_error(&self, e: &KafkaError) {
        error!("rebalance error: {e}");
        let _ = self.events.send(ContextEvent::RebalanceFailed(e.clone()));
    }
}

pub(crate) fn commit_offsets<C: ConsumerContext>(
    consumer: &impl Consumer<C>,
    offsets: &HashMap<Partition, i64>,
) -> KafkaResult<()> {
    let mut list = TopicPartitionList::new();
    for (partition, next_offset) in offsets {
        list.add_partition_offset(
            partition.topic(),
            partition.index(),
            Offset::Offset(*next_offset),
        )?;
    }
    consumer.commit(&list, CommitMode::Sync)
}

impl ClientContext for FlowConsumerContext {}

impl ConsumerContext for FlowConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => self.handle_revoke(base_consumer, partitions),
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => self.handle_rebalance_error(e),
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => self.handle_assign(base_consumer, partitions),
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => self.handle_rebalance_error(e),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        let committed: HashMap<Partition, i64> = offsets
            .elements()
            .into_iter()
            .filter_map(|elem| {
                elem.offset()
                    .to_raw()
                    .map(|offset| (Partition::from(elem), offset))
            })
            .collect();

        match &result {
            Ok(()) => {
                debug!(partitions = committed.len(), "commit confirmed");
                metrics::counter!(RECEIVER_COMMITS).increment(1);
            }
            Err(e) => {
                warn!("commit failed: {e}");
                metrics::counter!(RECEIVER_COMMIT_FAILURES).increment(1);
            }
        }

        let _ = self.events.send(ContextEvent::CommitOutcome {
            result,
            offsets: committed,
        });
    }
}
