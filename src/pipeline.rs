//! One pass through the staged pipeline: a blocking producer feeding the
//! versioner over a bounded channel, which feeds the delivery engine over a
//! second bounded channel. Backpressure from the sink reaches the producer
//! through the channel bounds. Ledger writes travel with each payload and are
//! committed by the engine only after a successful post.

use futures_util::stream;
use serde::Serialize;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::delivery::{DeliveryReport, Outgoing, ThrottledDeliveryEngine};
use crate::error::Result;
use crate::gtfs::ConnectionIter;
use crate::ldes::ConnectionVersioner;

/// Capacity of each inter-stage channel, in records.
pub const CHANNEL_BOUND: usize = 256;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub produced: usize,
    pub transform_failed: usize,
    pub delivery: DeliveryReport,
}

/// Runs `produce` on the blocking pool and streams its connections through
/// `versioner` into `engine`. Errors raised while setting up the producer
/// fail the pass; per-record errors are counted and skipped.
pub async fn run_pass<F>(
    produce: F,
    mut versioner: ConnectionVersioner,
    engine: &ThrottledDeliveryEngine,
) -> Result<PassReport>
where
    F: FnOnce() -> Result<ConnectionIter> + Send + 'static,
{
    let started = Instant::now();
    let run = versioner.run_timestamp();
    let (raw_tx, mut raw_rx) = mpsc::channel(CHANNEL_BOUND);
    let (out_tx, out_rx) = mpsc::channel::<Outgoing>(CHANNEL_BOUND);

    let producer = tokio::task::spawn_blocking(move || -> Result<()> {
        for item in produce()? {
            if raw_tx.blocking_send(item).is_err() {
                debug!("Versioner stage closed, stopping producer");
                break;
            }
        }
        Ok(())
    });

    let transformer = tokio::spawn(async move {
        let (mut produced, mut failed) = (0usize, 0usize);
        while let Some(item) = raw_rx.recv().await {
            produced += 1;
            let outgoing = item.and_then(|pending| {
                let payload = versioner.process(&pending.connection)?;
                Ok(Outgoing {
                    payload,
                    on_delivered: pending.on_delivered,
                })
            });
            match outgoing {
                Ok(outgoing) => {
                    if out_tx.send(outgoing).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    failed += 1;
                    warn!(error = %e, "Skipping connection");
                }
            }
        }
        (produced, failed, versioner.described_stops())
    });

    let payloads = stream::unfold(out_rx, |mut rx| async move {
        rx.recv().await.map(|payload| (payload, rx))
    });
    let delivery = engine.deliver(payloads).await;

    let (produced, transform_failed, stops) = transformer.await?;
    producer.await??;

    let report = PassReport {
        produced,
        transform_failed,
        delivery,
    };
    info!(
        run = %run,
        produced = report.produced,
        transform_failed = report.transform_failed,
        delivered = report.delivery.succeeded,
        delivery_failed = report.delivery.failed,
        unrecorded = report.delivery.unrecorded,
        stops_described = stops,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Pass finished"
    );
    Ok(report)
}
