//! Outbound engine entry point: a thread-safe sender over a single, lazily
//! constructed producer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SenderConfig;
use crate::error::SendError;
use crate::send_pipeline::{run_pipeline, DeliveryDispatch, SendOptions, SendStream};
use crate::types::{Delivery, PartitionDetail, ProduceRecord};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Lazily constructed, shared producer. The first observer triggers
/// construction; everyone else gets the cached outcome, including a cached
/// construction failure. Close is idempotent, and a closed handle refuses
/// further work deterministically.
struct ProducerHandle {
    config: SenderConfig,
    producer: tokio::sync::OnceCell<Result<Arc<FutureProducer>, KafkaError>>,
    has_producer: AtomicBool,
    closed: AtomicBool,
}

impl ProducerHandle {
    fn new(config: SenderConfig) -> Self {
        Self {
            config,
            producer: tokio::sync::OnceCell::new(),
            has_producer: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    async fn get(&self) -> Result<Arc<FutureProducer>, SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::PipelineClosed);
        }

        let outcome = self
            .producer
            .get_or_init(|| async {
                match self.config.client().create::<FutureProducer>() {
                    Ok(producer) => {
                        self.has_producer.store(true, Ordering::SeqCst);
                        info!("producer created");
                        Ok(Arc::new(producer))
                    }
                    Err(e) => {
                        warn!("producer creation failed: {e}");
                        Err(e)
                    }
                }
            })
            .await;

        match outcome {
            Ok(producer) => Ok(producer.clone()),
            Err(e) => Err(SendError::ProducerInit(e.clone())),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.has_producer.swap(false, Ordering::SeqCst) {
            if let Some(Ok(producer)) = self.producer.get() {
                debug!("flushing producer before close");
                if let Err(e) = producer.flush(self.config.close_timeout_value()) {
                    warn!("flush on close failed: {e}");
                }
            }
        }
    }
}

impl DeliveryDispatch for Arc<FutureProducer> {
    fn dispatch(
        &self,
        record: &ProduceRecord,
    ) -> Result<BoxFuture<'static, Result<Delivery, SendError>>, SendError> {
        let future_record = FutureRecord {
            topic: &record.topic,
            partition: record.partition,
            payload: record.payload.as_ref(),
            key: record.key.as_ref(),
            timestamp: record.timestamp,
            headers: record.owned_headers(),
        };

        match self.send_result(future_record) {
            Err((e, _record)) => Err(SendError::Kafka(e)),
            Ok(delivery_future) => {
                let topic = record.topic.clone();
                Ok(Box::pin(async move {
                    match delivery_future.await {
                        Err(_canceled) => Err(SendError::Canceled),
                        Ok(Err((e, _message))) => Err(SendError::Kafka(e)),
                        Ok(Ok((partition, offset))) => Ok(Delivery {
                            topic,
                            partition,
                            offset,
                        }),
                    }
                }))
            }
        }
    }
}

/// Sends records to Kafka topic partitions. Thread-safe and cheap to clone;
/// all clones share one underlying producer, created on first use.
#[derive(Clone)]
pub struct KafkaSender {
    handle: Arc<ProducerHandle>,
    runtime: Option<Handle>,
}

impl KafkaSender {
    pub fn new(config: SenderConfig) -> Self {
        Self {
            handle: Arc::new(ProducerHandle::new(config)),
            runtime: None,
        }
    }

    /// Runtime on which streaming-send drivers are spawned and responses
    /// are published. Defaults to the runtime current at the call site.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn runtime(&self) -> Option<&Handle> {
        self.runtime.as_ref()
    }

    /// Send one record and resolve with the broker acknowledgement.
    pub async fn send(&self, record: ProduceRecord) -> Result<Delivery, SendError> {
        let producer = self.handle.get().await?;
        let delivery = producer.dispatch(&record)?;
        delivery.await
    }

    /// Send a sequence of records; resolves once every record is delivered,
    /// or fails on the first record that is not.
    pub async fn send_all(
        &self,
        records: impl Stream<Item = ProduceRecord> + Send + 'static,
    ) -> Result<(), SendError> {
        let mut responses =
            self.send_stream_with(records.map(|record| (record, ())), SendOptions::default());
        while let Some(response) = responses.next().await {
            response?;
        }
        Ok(())
    }

    /// Streaming send preserving a caller-chosen correlator per record.
    /// Per-partition response order matches record order; responses across
    /// partitions may interleave.
    pub fn send_stream<T>(
        &self,
        records: impl Stream<Item = (ProduceRecord, T)> + Send + 'static,
    ) -> SendStream<T>
    where
        T: Send + 'static,
    {
        self.send_stream_with(records, SendOptions::default())
    }

    /// Streaming send with an explicit in-flight bound and delay-error
    /// behavior.
    pub fn send_stream_with<T>(
        &self,
        records: impl Stream<Item = (ProduceRecord, T)> + Send + 'static,
        options: SendOptions,
    ) -> SendStream<T>
    where
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel(options.max_in_flight.max(1));
        let handle = self.handle.clone();
        let driver = async move {
            let producer = match handle.get().await {
                Ok(producer) => producer,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            run_pipeline(producer, records.map(Ok), options, tx).await;
        };

        let task = match &self.runtime {
            Some(runtime) => runtime.spawn(driver),
            None => tokio::spawn(driver),
        };
        SendStream::new(rx, task)
    }

    /// Partition metadata for a topic, for callers that pick partitions
    /// themselves.
    pub async fn partitions_for(&self, topic: &str) -> Result<Vec<PartitionDetail>, SendError> {
        let producer = self.handle.get().await?;
        let metadata = producer
            .client()
            .fetch_metadata(Some(topic), METADATA_TIMEOUT)
            .map_err(SendError::Kafka)?;

        Ok(metadata
            .topics()
            .iter()
            .filter(|topic_metadata| topic_metadata.name() == topic)
            .flat_map(|topic_metadata| topic_metadata.partitions())
            .map(|partition| PartitionDetail {
                id: partition.id(),
                leader: partition.leader(),
                replicas: partition.replicas().to_vec(),
                in_sync_replicas: partition.isr().to_vec(),
            })
            .collect())
    }

    /// Release the producer, waiting up to the configured close timeout for
    /// in-flight deliveries. Idempotent; a sender that never sent anything
    /// closes without ever creating a producer. After close, every send
    /// fails with [`SendError::PipelineClosed`].
    pub fn close(&self) {
        self.handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_is_lazy() {
        let sender = KafkaSender::new(SenderConfig::new("localhost:9092"));
        assert!(!sender.handle.has_producer.load(Ordering::SeqCst));
        // Closing a sender that never sent is a no-op.
        sender.close();
        sender.close();
        assert!(!sender.handle.has_producer.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_construction_failure_is_cached_and_shared() {
        let config = SenderConfig::new("localhost:9092").set("definitely.not.a.property", "1");
        let sender = KafkaSender::new(config);

        let first = sender.handle.get().await;
        assert!(first.is_err());
        let second = sender.handle.get().await;
        assert!(matches!(second, Err(SendError::ProducerInit(_))));
        assert!(!sender.handle.has_producer.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_producer_created_once_and_closed() {
        let sender = KafkaSender::new(SenderConfig::new("localhost:9092"));

        let first = sender.handle.get().await.unwrap();
        let second = sender.handle.get().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(sender.handle.has_producer.load(Ordering::SeqCst));

        sender.close();
        assert!(!sender.handle.has_producer.load(Ordering::SeqCst));
        // Second close is a no-op.
        sender.close();
    }

    #[tokio::test]
    async fn test_sends_after_close_fail_deterministically() {
        let sender = KafkaSender::new(SenderConfig::new("localhost:9092"));
        let _ = sender.handle.get().await.unwrap();
        sender.close();

        let result = sender.send(ProduceRecord::to("events").payload("x")).await;
        assert!(matches!(result, Err(SendError::PipelineClosed)));
    }
}
