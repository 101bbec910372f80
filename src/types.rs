use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::topic_partition_list::TopicPartitionListElem;

/// One topic partition, the unit of ordering and offset bookkeeping
/// throughout the crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    index: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, index: i32) -> Self {
        Self {
            topic: topic.into(),
            index,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn index(&self) -> i32 {
        self.index
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.index)
    }
}

/// A delivered position on one partition: the offset of a record the
/// consumer handed downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// The next offset to consume, the value a commit of this position
    /// carries to the broker.
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }
}

impl std::fmt::Display for PartitionOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// Policy governing when a delivered record's offset becomes eligible for
/// commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Every record is acknowledged as soon as it is delivered downstream;
    /// commits happen by batch size or interval, and on close.
    AutoAck,
    /// The record's offset is committed synchronously before delivery.
    /// Records may be lost on a crash, never redelivered.
    AtMostOnce,
    /// The application acknowledges records explicitly; commits happen by
    /// batch size or interval, and on close.
    ManualAck,
    /// The application commits offsets explicitly. No automatic commits,
    /// including on close.
    ManualCommit,
}

/// Broker-assigned placement of a successfully produced record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Partition metadata returned by [`partitions_for`](crate::KafkaSender::partitions_for).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDetail {
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub in_sync_replicas: Vec<i32>,
}

/// A record to be produced to Kafka.
#[derive(Debug, Clone, Default)]
pub struct ProduceRecord {
    pub topic: String,
    pub partition: Option<i32>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp: Option<i64>,
}

impl ProduceRecord {
    pub fn to(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    pub(crate) fn owned_headers(&self) -> Option<OwnedHeaders> {
        if self.headers.is_empty() {
            return None;
        }
        let mut headers = OwnedHeaders::new();
        for (key, value) in &self.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value),
            });
        }
        Some(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_display() {
        let partition = Partition::new("events", 3);
        assert_eq!(partition.to_string(), "events-3");

        let position = PartitionOffset::new(partition, 41);
        assert_eq!(position.to_string(), "events-3@41");
        assert_eq!(position.next_offset(), 42);
    }

    #[test]
    fn test_produce_record_builder() {
        let record = ProduceRecord::to("events")
            .partition(1)
            .key("user-1")
            .payload("hello")
            .header("source", "test");

        assert_eq!(record.topic, "events");
        assert_eq!(record.partition, Some(1));
        assert_eq!(record.key.as_deref(), Some(b"user-1".as_slice()));
        assert_eq!(record.payload.as_deref(), Some(b"hello".as_slice()));
        assert_eq!(record.headers.len(), 1);
        assert!(record.owned_headers().is_some());
    }

    #[test]
    fn test_produce_record_without_headers() {
        let record = ProduceRecord::to("events").payload("hello");
        assert!(record.owned_headers().is_none());
    }
}
