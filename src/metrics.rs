//! Metric names emitted by the sender and receiver engines.

/// Counter: records handed to the producer.
pub const SENDER_RECORDS_SENT: &str = "kafka_flow_sender_records_sent";

/// Counter: records that failed to be delivered.
pub const SENDER_RECORDS_FAILED: &str = "kafka_flow_sender_records_failed";

/// Gauge: sends dispatched but not yet acknowledged, per pipeline.
pub const SENDER_RECORDS_IN_FLIGHT: &str = "kafka_flow_sender_records_in_flight";

/// Counter: records delivered downstream by the consumer event loop.
pub const RECEIVER_RECORDS_DELIVERED: &str = "kafka_flow_receiver_records_delivered";

/// Counter: offset commit attempts that succeeded.
pub const RECEIVER_COMMITS: &str = "kafka_flow_receiver_commits";

/// Counter: offset commit attempts that failed.
pub const RECEIVER_COMMIT_FAILURES: &str = "kafka_flow_receiver_commit_failures";

/// Gauge: 1 while fetches are paused for back-pressure, 0 otherwise.
pub const RECEIVER_PAUSED: &str = "kafka_flow_receiver_paused";

/// Counter: rebalance events observed (assign + revoke).
pub const RECEIVER_REBALANCES: &str = "kafka_flow_receiver_rebalances";
