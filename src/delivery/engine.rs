use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::pin::pin;
use std::sync::Arc;
use tracing::{info, warn};

use super::sink::EventSink;
use crate::error::{PipelineError, Result};
use crate::history::PendingWrite;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Delivered events whose store write failed; they are published again
    /// on a later cycle.
    pub unrecorded: usize,
}

/// A serialized change event and the store write to apply once it is posted.
#[derive(Debug)]
pub struct Outgoing {
    pub payload: Bytes,
    pub on_delivered: Option<PendingWrite>,
}

impl From<Bytes> for Outgoing {
    fn from(payload: Bytes) -> Self {
        Self {
            payload,
            on_delivered: None,
        }
    }
}

/// Posts payloads in fixed-size batches. All requests of a batch run
/// concurrently; the next batch starts only once every request of the
/// current one has settled and the store writes of the delivered ones are
/// committed. Failures are counted, never retried.
pub struct ThrottledDeliveryEngine {
    sink: Arc<dyn EventSink>,
    rate: usize,
}

impl ThrottledDeliveryEngine {
    pub fn new(sink: Arc<dyn EventSink>, rate: usize) -> Result<Self> {
        if rate == 0 {
            return Err(PipelineError::Config(
                "throttle_rate must be at least 1".to_string(),
            ));
        }
        Ok(Self { sink, rate })
    }

    #[tracing::instrument(skip_all, fields(target = %self.sink.target(), rate = self.rate))]
    pub async fn deliver<S>(&self, payloads: S) -> DeliveryReport
    where
        S: Stream<Item = Outgoing>,
    {
        let mut payloads = pin!(payloads);
        let mut report = DeliveryReport::default();
        let mut batch = Vec::with_capacity(self.rate);

        loop {
            let next = payloads.next().await;
            let exhausted = next.is_none();
            if let Some(payload) = next {
                batch.push(payload);
            }

            if batch.len() == self.rate || (exhausted && !batch.is_empty()) {
                self.flush(&mut batch, &mut report).await;
                info!(
                    posted = report.attempted,
                    failed = report.failed,
                    "Posted change events so far"
                );
            }
            if exhausted {
                break;
            }
        }

        if report.failed > 0 {
            warn!(failed = report.failed, attempted = report.attempted, "Some change events were not delivered");
        }
        report
    }

    async fn flush(&self, batch: &mut Vec<Outgoing>, report: &mut DeliveryReport) {
        let (payloads, writes): (Vec<_>, Vec<_>) = batch
            .drain(..)
            .map(|o| (o.payload, o.on_delivered))
            .unzip();
        let results = join_all(payloads.into_iter().map(|p| self.sink.post(p))).await;

        let mut delivered = Vec::new();
        for (result, write) in results.into_iter().zip(writes) {
            report.attempted += 1;
            match result {
                Ok(()) => {
                    report.succeeded += 1;
                    delivered.extend(write);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, "Failed to post change event");
                }
            }
        }
        if !delivered.is_empty() {
            report.unrecorded += commit(delivered).await;
        }
    }
}

/// Applies the store writes of delivered events; returns how many failed.
async fn commit(writes: Vec<PendingWrite>) -> usize {
    let total = writes.len();
    let committed = tokio::task::spawn_blocking(move || {
        let mut failed = 0;
        for write in writes {
            let key = write.key().to_string();
            if let Err(e) = write.commit() {
                failed += 1;
                warn!(key = %key, error = %e, "Delivered change event not recorded");
            }
        }
        failed
    })
    .await;
    committed.unwrap_or_else(|e| {
        warn!(error = %e, "Recording delivered change events failed");
        total
    })
}
