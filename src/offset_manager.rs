//! Per-partition offset bookkeeping shared between offset handles and the
//! consumer event loop.
//!
//! Two columns are tracked per partition and both only ever advance:
//! - **acknowledged**: the next offset to consume once everything the
//!   application has marked as processed is accounted for. Updated by
//!   [`acknowledge`](OffsetManager::acknowledge), callable from any thread.
//! - **committed**: the last offset confirmed by the broker. Updated by the
//!   event loop after a commit succeeds.
//!
//! The distinction is what bounds redelivery after a crash: Kafka replays
//! from the committed column, while the acknowledged column is what the next
//! commit will push.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::types::Partition;

struct PartitionOffsets {
    /// Next offset to consume after everything acknowledged so far; -1 until
    /// the first acknowledgement.
    acknowledged: i64,
    /// Last offset confirmed by the broker; -1 until the first commit.
    committed: i64,
    /// Records acknowledged on this partition since its offsets were last
    /// committed; feeds the batch-size trigger. Kept per partition so
    /// committing one partition (a revoke, a manual commit) never erases
    /// another partition's backlog.
    uncommitted_acks: u64,
}

pub(crate) struct OffsetManager {
    partitions: DashMap<Partition, PartitionOffsets>,
}

impl OffsetManager {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
        }
    }

    /// Mark `offset` as processed. Acknowledgement is cumulative and
    /// monotonic: the acknowledged column becomes `max(current, offset + 1)`.
    pub fn acknowledge(&self, partition: &Partition, offset: i64) {
        let next = offset + 1;
        let advanced = match self.partitions.entry(partition.clone()) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                if next > state.acknowledged {
                    state.acknowledged = next;
                    state.uncommitted_acks += 1;
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(PartitionOffsets {
                    acknowledged: next,
                    committed: -1,
                    uncommitted_acks: 1,
                });
                true
            }
        };

        if advanced {
            debug!(
                topic = partition.topic(),
                partition = partition.index(),
                next_offset = next,
                "acknowledged offset"
            );
        }
    }

    /// Snapshot of acknowledged offsets that are ahead of the committed
    /// column. The returned offsets are next-to-consume values, ready to be
    /// handed to the broker as-is.
    pub fn snapshot_for_commit(&self) -> HashMap<Partition, i64> {
        self.partitions
            .iter()
            .filter(|entry| entry.value().acknowledged > entry.value().committed)
            .map(|entry| (entry.key().clone(), entry.value().acknowledged))
            .collect()
    }

    /// Like [`snapshot_for_commit`](Self::snapshot_for_commit), restricted
    /// to the given partitions. Used when committing for revoked partitions.
    pub fn snapshot_for_partitions(&self, partitions: &[Partition]) -> HashMap<Partition, i64> {
        partitions
            .iter()
            .filter_map(|partition| {
                self.partitions.get(partition).and_then(|state| {
                    (state.acknowledged > state.committed)
                        .then(|| (partition.clone(), state.acknowledged))
                })
            })
            .collect()
    }

    /// Advance the committed column after the broker confirmed a commit and
    /// reset the batch counter of exactly the committed partitions.
    pub fn mark_committed(&self, offsets: &HashMap<Partition, i64>) {
        for (partition, offset) in offsets {
            self.partitions
                .entry(partition.clone())
                .and_modify(|state| {
                    if *offset > state.committed {
                        state.committed = *offset;
                    }
                    state.uncommitted_acks = 0;
                })
                .or_insert_with(|| PartitionOffsets {
                    acknowledged: *offset,
                    committed: *offset,
                    uncommitted_acks: 0,
                });
        }
    }

    pub fn acknowledged(&self, partition: &Partition) -> Option<i64> {
        self.partitions
            .get(partition)
            .map(|state| state.acknowledged)
            .filter(|offset| *offset >= 0)
    }

    pub fn committed(&self, partition: &Partition) -> Option<i64> {
        self.partitions
            .get(partition)
            .map(|state| state.committed)
            .filter(|offset| *offset >= 0)
    }

    /// Total records acknowledged but not yet committed, summed over every
    /// tracked partition.
    pub fn acked_uncommitted(&self) -> u64 {
        self.partitions
            .iter()
            .map(|entry| entry.value().uncommitted_acks)
            .sum()
    }

    /// Drop bookkeeping for a revoked partition. Pending offsets should have
    /// been committed first.
    pub fn clear_partition(&self, partition: &Partition) {
        if self.partitions.remove(partition).is_some() {
            debug!(
                topic = partition.topic(),
                partition = partition.index(),
                "cleared offsets for revoked partition"
            );
        }
    }
}

/// Decides when the event loop issues an automatic commit and how failed
/// commits are retried. Lives on the event-loop task only.
pub(crate) struct CommitPolicy {
    batch_size: usize,
    interval: Duration,
    max_attempts: u32,
    base_backoff: Duration,
    last_commit: Instant,
    attempts: u32,
    retry_at: Option<Instant>,
}

impl CommitPolicy {
    pub fn new(batch_size: usize, interval: Duration, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            batch_size,
            interval,
            max_attempts,
            base_backoff: backoff,
            last_commit: Instant::now(),
            attempts: 0,
            retry_at: None,
        }
    }

    /// True when a commit should be issued now: the batch threshold was
    /// reached, the interval elapsed, or a retry backoff expired.
    pub fn commit_due(&self, acked_uncommitted: u64, now: Instant) -> bool {
        if let Some(retry_at) = self.retry_at {
            return now >= retry_at;
        }
        if acked_uncommitted == 0 {
            return false;
        }
        if self.batch_size > 0 && acked_uncommitted >= self.batch_size as u64 {
            return true;
        }
        now.duration_since(self.last_commit) >= self.interval
    }

    pub fn record_success(&mut self, now: Instant) {
        self.last_commit = now;
        self.attempts = 0;
        self.retry_at = None;
    }

    /// Register a retriable failure. Returns the next backoff delay, or
    /// `None` when attempts are exhausted and the subscription must fail.
    pub fn record_failure(&mut self, now: Instant) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return None;
        }
        let backoff = self.base_backoff * 2u32.saturating_pow(self.attempts - 1);
        self.retry_at = Some(now + backoff);
        Some(backoff)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_partition(number: i32) -> Partition {
        Partition::new("test-topic", number)
    }

    #[test]
    fn test_acknowledge_initializes_next_offset() {
        let manager = OffsetManager::new();
        let partition = test_partition(0);

        manager.acknowledge(&partition, 41);

        assert_eq!(manager.acknowledged(&partition), Some(42));
        assert_eq!(manager.committed(&partition), None);
    }

    #[test]
    fn test_acknowledge_is_monotonic() {
        let manager = OffsetManager::new();
        let partition = test_partition(0);

        manager.acknowledge(&partition, 10);
        manager.acknowledge(&partition, 5);

        assert_eq!(manager.acknowledged(&partition), Some(11));
    }

    #[test]
    fn test_acknowledge_out_of_order_is_cumulative() {
        let manager = OffsetManager::new();
        let partition = test_partition(0);

        manager.acknowledge(&partition, 7);
        manager.acknowledge(&partition, 3);
        manager.acknowledge(&partition, 9);

        assert_eq!(manager.acknowledged(&partition), Some(10));
    }

    #[test]
    fn test_snapshot_only_returns_uncommitted() {
        let manager = OffsetManager::new();
        let p0 = test_partition(0);
        let p1 = test_partition(1);

        manager.acknowledge(&p0, 4);
        manager.acknowledge(&p1, 9);

        let snapshot = manager.snapshot_for_commit();
        assert_eq!(snapshot.get(&p0), Some(&5));
        assert_eq!(snapshot.get(&p1), Some(&10));

        manager.mark_committed(&snapshot);
        assert!(manager.snapshot_for_commit().is_empty());
        assert_eq!(manager.committed(&p0), Some(5));
    }

    #[test]
    fn test_committed_never_exceeds_acknowledged() {
        let manager = OffsetManager::new();
        let partition = test_partition(0);

        for offset in 0..20 {
            manager.acknowledge(&partition, offset);
            let snapshot = manager.snapshot_for_commit();
            manager.mark_committed(&snapshot);
            let acked = manager.acknowledged(&partition).unwrap();
            let committed = manager.committed(&partition).unwrap();
            assert!(committed <= acked);
        }
    }

    #[test]
    fn test_snapshot_for_partitions_filters() {
        let manager = OffsetManager::new();
        let p0 = test_partition(0);
        let p1 = test_partition(1);

        manager.acknowledge(&p0, 4);
        manager.acknowledge(&p1, 9);

        let snapshot = manager.snapshot_for_partitions(std::slice::from_ref(&p0));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&p0), Some(&5));
    }

    #[test]
    fn test_batch_counter_resets_on_commit() {
        let manager = OffsetManager::new();
        let partition = test_partition(0);

        manager.acknowledge(&partition, 0);
        manager.acknowledge(&partition, 1);
        assert_eq!(manager.acked_uncommitted(), 2);

        manager.mark_committed(&manager.snapshot_for_commit());
        assert_eq!(manager.acked_uncommitted(), 0);
    }

    #[test]
    fn test_partial_commit_keeps_other_partitions_batch_count() {
        let manager = OffsetManager::new();
        let p0 = test_partition(0);
        let p1 = test_partition(1);

        manager.acknowledge(&p0, 0);
        manager.acknowledge(&p0, 1);
        for offset in 0..3 {
            manager.acknowledge(&p1, offset);
        }
        assert_eq!(manager.acked_uncommitted(), 5);

        // Commit only p0, the way a revoke of p0 does.
        let snapshot = manager.snapshot_for_partitions(std::slice::from_ref(&p0));
        manager.mark_committed(&snapshot);

        // p1 keeps its backlog toward the batch-size trigger.
        assert_eq!(manager.acked_uncommitted(), 3);
        assert_eq!(manager.committed(&p0), Some(2));
        assert_eq!(manager.committed(&p1), None);
    }

    #[test]
    fn test_duplicate_acknowledge_does_not_count() {
        let manager = OffsetManager::new();
        let partition = test_partition(0);

        manager.acknowledge(&partition, 5);
        manager.acknowledge(&partition, 5);
        manager.acknowledge(&partition, 4);

        assert_eq!(manager.acked_uncommitted(), 1);
    }

    #[test]
    fn test_clear_partition() {
        let manager = OffsetManager::new();
        let partition = test_partition(0);

        manager.acknowledge(&partition, 5);
        manager.clear_partition(&partition);

        assert_eq!(manager.acknowledged(&partition), None);
        assert!(manager.snapshot_for_commit().is_empty());
    }

    #[test]
    fn test_commit_policy_batch_trigger() {
        let policy = CommitPolicy::new(10, Duration::from_secs(60), 3, Duration::from_millis(100));
        let now = Instant::now();

        assert!(!policy.commit_due(9, now));
        assert!(policy.commit_due(10, now));
        assert!(policy.commit_due(11, now));
    }

    #[test]
    fn test_commit_policy_interval_trigger() {
        let policy = CommitPolicy::new(0, Duration::from_millis(50), 3, Duration::from_millis(100));
        let start = Instant::now();

        assert!(!policy.commit_due(1, start));
        assert!(policy.commit_due(1, start + Duration::from_millis(60)));
        // Nothing acknowledged, nothing to commit no matter how much time passed.
        assert!(!policy.commit_due(0, start + Duration::from_secs(60)));
    }

    #[test]
    fn test_commit_policy_backoff_doubles_until_exhaustion() {
        let mut policy =
            CommitPolicy::new(1, Duration::from_secs(60), 3, Duration::from_millis(100));
        let now = Instant::now();

        assert_eq!(policy.record_failure(now), Some(Duration::from_millis(100)));
        assert_eq!(policy.record_failure(now), Some(Duration::from_millis(200)));
        // Third failure exhausts max_attempts = 3.
        assert_eq!(policy.record_failure(now), None);
    }

    #[test]
    fn test_commit_policy_retry_ignores_batch_state() {
        let mut policy =
            CommitPolicy::new(10, Duration::from_secs(60), 5, Duration::from_millis(100));
        let now = Instant::now();

        policy.record_failure(now);
        // Retry fires on the backoff deadline even with zero newly acked records.
        assert!(!policy.commit_due(0, now + Duration::from_millis(50)));
        assert!(policy.commit_due(0, now + Duration::from_millis(150)));

        policy.record_success(now + Duration::from_millis(150));
        assert_eq!(policy.attempts(), 0);
        assert!(!policy.commit_due(0, now + Duration::from_millis(200)));
    }
}
