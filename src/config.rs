use std::sync::Arc;
use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::ClientConfig;

/// Predicate deciding whether a failed automatic commit should be retried.
pub type RetriablePredicate = Arc<dyn Fn(&KafkaError) -> bool + Send + Sync>;

/// Producer construction parameters. All librdkafka producer properties are
/// supported through [`set`](SenderConfig::set); the sender itself only adds
/// a close timeout.
#[derive(Clone)]
pub struct SenderConfig {
    client: ClientConfig,
    close_timeout: Duration,
}

impl SenderConfig {
    pub fn new(bootstrap_servers: &str) -> Self {
        let mut client = ClientConfig::new();
        client.set("bootstrap.servers", bootstrap_servers);
        Self {
            client,
            close_timeout: Duration::from_secs(30),
        }
    }

    /// Add any producer configuration property, forwarded opaquely to the
    /// underlying client.
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.client.set(key, value);
        self
    }

    /// Bound on the graceful wait for in-flight deliveries when the sender
    /// is closed.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub(crate) fn close_timeout_value(&self) -> Duration {
        self.close_timeout
    }

    pub(crate) fn client(&self) -> &ClientConfig {
        &self.client
    }
}

/// Consumer construction parameters plus the receiver's own knobs: poll
/// timeout, commit batching, close timeout and the auto-commit retry policy.
#[derive(Clone)]
pub struct ReceiverConfig {
    client: ClientConfig,
    poll_timeout: Duration,
    commit_batch_size: usize,
    commit_interval: Duration,
    close_timeout: Duration,
    max_commit_attempts: u32,
    commit_retry_backoff: Duration,
    retriable: Option<RetriablePredicate>,
}

impl ReceiverConfig {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut client = ClientConfig::new();

        client
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        // The receiver owns offset management; librdkafka must never commit
        // or store offsets on its own.
        client
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        Self {
            client,
            poll_timeout: Duration::from_millis(100),
            commit_batch_size: 0,
            commit_interval: Duration::from_secs(5),
            close_timeout: Duration::from_secs(30),
            max_commit_attempts: 100,
            commit_retry_backoff: Duration::from_millis(100),
            retriable: None,
        }
    }

    /// Add any consumer configuration property, forwarded opaquely to the
    /// underlying client.
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.client.set(key, value);
        self
    }

    /// Override offset reset policy ("earliest" or "latest").
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.client.set("auto.offset.reset", policy);
        self
    }

    /// Bound on a single consumer poll. The event loop wakes at least this
    /// often to service control requests.
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Number of acknowledged-but-uncommitted records that triggers a
    /// commit. Zero disables the count trigger; commits then happen on the
    /// interval only.
    pub fn commit_batch_size(mut self, size: usize) -> Self {
        self.commit_batch_size = size;
        self
    }

    /// Interval at which acknowledged offsets are committed.
    pub fn commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    /// Bound on graceful shutdown, including the final commit.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Number of attempts for a failing automatic commit before the
    /// subscription is terminated with the last error.
    pub fn max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts;
        self
    }

    /// Base delay between automatic commit retries. Doubles per attempt.
    pub fn commit_retry_backoff(mut self, backoff: Duration) -> Self {
        self.commit_retry_backoff = backoff;
        self
    }

    /// Inject a predicate deciding which commit failures are retriable.
    /// Non-retriable failures terminate the subscription immediately.
    pub fn commit_retriable_predicate(
        mut self,
        predicate: impl Fn(&KafkaError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retriable = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn client(&self) -> &ClientConfig {
        &self.client
    }

    pub(crate) fn poll_timeout_value(&self) -> Duration {
        self.poll_timeout
    }

    pub(crate) fn commit_batch_size_value(&self) -> usize {
        self.commit_batch_size
    }

    pub(crate) fn commit_interval_value(&self) -> Duration {
        self.commit_interval
    }

    pub(crate) fn close_timeout_value(&self) -> Duration {
        self.close_timeout
    }

    pub(crate) fn max_commit_attempts_value(&self) -> u32 {
        self.max_commit_attempts
    }

    pub(crate) fn commit_retry_backoff_value(&self) -> Duration {
        self.commit_retry_backoff
    }

    pub(crate) fn retriable_predicate(&self) -> Option<RetriablePredicate> {
        self.retriable.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_config_defaults() {
        let config = ReceiverConfig::new("localhost:9092", "test-group");
        assert_eq!(config.poll_timeout_value(), Duration::from_millis(100));
        assert_eq!(config.commit_batch_size_value(), 0);
        assert_eq!(config.commit_interval_value(), Duration::from_secs(5));
        assert_eq!(config.max_commit_attempts_value(), 100);
    }

    #[test]
    fn test_receiver_config_disables_client_side_commits() {
        let config = ReceiverConfig::new("localhost:9092", "test-group");
        assert_eq!(
            config.client().get("enable.auto.commit"),
            Some("false")
        );
        assert_eq!(
            config.client().get("enable.auto.offset.store"),
            Some("false")
        );
    }

    #[test]
    fn test_sender_config_overrides() {
        let config = SenderConfig::new("localhost:9092")
            .set("linger.ms", "20")
            .close_timeout(Duration::from_secs(1));
        assert_eq!(config.client().get("linger.ms"), Some("20"));
        assert_eq!(config.close_timeout_value(), Duration::from_secs(1));
    }
}
