use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::OffsetError;
use crate::types::Partition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeekTarget {
    Beginning,
    End,
    Offset(i64),
}

#[derive(Debug)]
pub(crate) struct SeekRequest {
    pub partition: Partition,
    pub target: SeekTarget,
}

/// Collects seek requests recorded during a partitions-assigned callback.
/// The window is open only while the callback runs; the event loop drains
/// and applies the requests before fetching resumes, then the window stays
/// closed forever. Handles that escape the callback fail deterministically.
pub(crate) struct AssignmentWindow {
    open: AtomicBool,
    requests: Mutex<Vec<SeekRequest>>,
}

impl AssignmentWindow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, request: SeekRequest) -> Result<(), OffsetError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(OffsetError::WindowClosed);
        }
        self.requests.lock().expect("seek window poisoned").push(request);
        Ok(())
    }

    /// Close the window and return everything recorded while it was open.
    pub fn close(&self) -> Vec<SeekRequest> {
        self.open.store(false, Ordering::Release);
        std::mem::take(&mut *self.requests.lock().expect("seek window poisoned"))
    }
}

/// Seek-capable handle for one assigned partition, passed to the
/// partitions-assigned callback. Seeks recorded here are applied before the
/// consumer resumes fetching; outside the callback every operation returns
/// [`OffsetError::WindowClosed`].
pub struct SeekablePartition {
    partition: Partition,
    position: Option<i64>,
    window: Arc<AssignmentWindow>,
}

impl SeekablePartition {
    pub(crate) fn new(
        partition: Partition,
        position: Option<i64>,
        window: Arc<AssignmentWindow>,
    ) -> Self {
        Self {
            partition,
            position,
            window,
        }
    }

    pub fn topic_partition(&self) -> &Partition {
        &self.partition
    }

    pub fn seek_to_beginning(&self) -> Result<(), OffsetError> {
        self.record(SeekTarget::Beginning)
    }

    pub fn seek_to_end(&self) -> Result<(), OffsetError> {
        self.record(SeekTarget::End)
    }

    pub fn seek(&self, offset: i64) -> Result<(), OffsetError> {
        self.record(SeekTarget::Offset(offset))
    }

    /// The consumer's position for this partition as captured at assignment
    /// time. `None` when the consumer has not fetched from the partition yet.
    pub fn position(&self) -> Result<Option<i64>, OffsetError> {
        if !self.window.open.load(Ordering::Acquire) {
            return Err(OffsetError::WindowClosed);
        }
        Ok(self.position)
    }

    fn record(&self, target: SeekTarget) -> Result<(), OffsetError> {
        self.window.record(SeekRequest {
            partition: self.partition.clone(),
            target,
        })
    }
}

impl std::fmt::Debug for SeekablePartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SeekablePartition({})", self.partition)
    }
}
