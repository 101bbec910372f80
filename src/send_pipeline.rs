//! Outbound engine: drives a stream of `(record, correlator)` pairs through
//! the producer while preserving per-partition ordering and a bounded
//! in-flight count.
//!
//! In-flight deliveries sit in a [`FuturesOrdered`], so acknowledgements are
//! emitted in submission order. Within a partition submission order is
//! record order, which gives strict per-partition response ordering; the
//! bound on the queue is the in-flight limit.

use std::pin::{pin, Pin};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::FuturesOrdered;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SendError;
use crate::metrics::{SENDER_RECORDS_FAILED, SENDER_RECORDS_IN_FLIGHT, SENDER_RECORDS_SENT};
use crate::types::{Delivery, ProduceRecord};

/// Options for the streaming send forms.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Maximum number of records dispatched but not yet acknowledged.
    pub max_in_flight: usize,
    /// When set, a failed record produces an error-marked response and the
    /// stream keeps going; the first failure is emitted as the terminal
    /// error once the upstream completes and all in-flight sends resolve.
    /// When unset, the first failure terminates the stream immediately.
    pub delay_error: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 256,
            delay_error: false,
        }
    }
}

/// One acknowledgement from the streaming send form, carrying the caller's
/// correlator so responses can be matched to requests.
#[derive(Debug)]
pub struct SendResult<T> {
    pub delivery: Result<Delivery, SendError>,
    pub correlator: T,
}

/// Seam between the pipeline state machine and the producer: a dispatch
/// either fails synchronously or yields a future resolving with the broker
/// acknowledgement. Exactly one terminal signal per record.
pub(crate) trait DeliveryDispatch: Send + Sync + 'static {
    fn dispatch(
        &self,
        record: &ProduceRecord,
    ) -> Result<BoxFuture<'static, Result<Delivery, SendError>>, SendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Active,
    /// Upstream terminated; in-flight callbacks are still resolving.
    OutboundDone,
    Complete,
    Failed,
}

/// Drive `upstream` to completion. Emits results and the terminal signal
/// into `out`; returning closes the channel, which is the stream's
/// completion.
pub(crate) async fn run_pipeline<T, S, D>(
    dispatch: D,
    upstream: S,
    options: SendOptions,
    out: mpsc::Sender<Result<SendResult<T>, SendError>>,
) where
    T: Send + 'static,
    S: Stream<Item = Result<(ProduceRecord, T), SendError>> + Send,
    D: DeliveryDispatch,
{
    let max_in_flight = options.max_in_flight.max(1);
    let mut upstream = pin!(upstream);
    let mut in_flight: FuturesOrdered<BoxFuture<'static, (Result<Delivery, SendError>, T)>> =
        FuturesOrdered::new();
    let mut state = PipelineState::Active;
    let mut first_error: Option<SendError> = None;

    while !matches!(state, PipelineState::Complete | PipelineState::Failed) {
        metrics::gauge!(SENDER_RECORDS_IN_FLIGHT).set(in_flight.len() as f64);

        if state == PipelineState::OutboundDone && in_flight.is_empty() {
            // Upstream finished and every callback resolved.
            state = match first_error.take() {
                Some(e) => {
                    let _ = out.send(Err(e)).await;
                    PipelineState::Failed
                }
                None => PipelineState::Complete,
            };
            continue;
        }

        let can_pull = state == PipelineState::Active && in_flight.len() < max_in_flight;

        tokio::select! {
            biased;

            Some((result, correlator)) = in_flight.next(), if !in_flight.is_empty() => {
                match result {
                    Ok(delivery) => {
                        metrics::counter!(SENDER_RECORDS_SENT).increment(1);
                        let response = SendResult { delivery: Ok(delivery), correlator };
                        if out.send(Ok(response)).await.is_err() {
                            state = PipelineState::Failed;
                        }
                    }
                    Err(e) => {
                        metrics::counter!(SENDER_RECORDS_FAILED).increment(1);
                        if first_error.is_none() {
                            first_error = Some(e.clone());
                        }
                        if options.delay_error {
                            let response = SendResult { delivery: Err(e), correlator };
                            if out.send(Ok(response)).await.is_err() {
                                state = PipelineState::Failed;
                            }
                        } else {
                            warn!("send failed, terminating pipeline: {e}");
                            let _ = out.send(Err(e)).await;
                            state = PipelineState::Failed;
                        }
                    }
                }
            }

            item = upstream.next(), if can_pull => match item {
                Some(Ok((record, correlator))) => match dispatch.dispatch(&record) {
                    Ok(future) => {
                        in_flight.push_back(Box::pin(async move { (future.await, correlator) }));
                    }
                    // A synchronous dispatch failure terminates in both
                    // modes; delay-error still gets its marked response.
                    Err(e) => {
                        metrics::counter!(SENDER_RECORDS_FAILED).increment(1);
                        warn!("synchronous send failure: {e}");
                        if options.delay_error {
                            let response = SendResult { delivery: Err(e.clone()), correlator };
                            let _ = out.send(Ok(response)).await;
                        }
                        let _ = out.send(Err(e)).await;
                        state = PipelineState::Failed;
                    }
                },
                Some(Err(e)) => {
                    // Upstream failure forwards immediately; in-flight sends
                    // are left to resolve inside the client.
                    let _ = out.send(Err(e)).await;
                    state = PipelineState::Failed;
                }
                None => {
                    state = PipelineState::OutboundDone;
                }
            },
        }
    }

    debug!(?state, "send pipeline finished");
}

/// Stream of acknowledgements from a streaming send. Dropping it cancels
/// the upstream subscription; records already handed to the producer keep
/// resolving inside the client and are flushed on close.
pub struct SendStream<T> {
    results: mpsc::Receiver<Result<SendResult<T>, SendError>>,
    driver: JoinHandle<()>,
}

impl<T> SendStream<T> {
    pub(crate) fn new(
        results: mpsc::Receiver<Result<SendResult<T>, SendError>>,
        driver: JoinHandle<()>,
    ) -> Self {
        Self { results, driver }
    }
}

impl<T> Stream for SendStream<T> {
    type Item = Result<SendResult<T>, SendError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.results.poll_recv(cx)
    }
}

impl<T> Drop for SendStream<T> {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
