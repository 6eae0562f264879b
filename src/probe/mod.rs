//! Ping probe: bounded-time TCP reachability/latency checks
//!
//! A timeout or connection failure is a normal outcome, never an error that
//! aborts the sweep.

use crate::store::Store;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Result of probing one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Latency(u32),
    Unreachable,
}

/// Time a TCP connect to `address:port`, bounded by `timeout`.
pub async fn probe(address: &str, port: u16, timeout: Duration) -> ProbeOutcome {
    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
        Ok(Ok(_stream)) => {
            // 0 is the never-probed sentinel, so a sub-millisecond connect
            // still reports 1ms
            let ms = (start.elapsed().as_millis() as u32).max(1);
            ProbeOutcome::Latency(ms)
        }
        Ok(Err(e)) => {
            debug!(address, port, error = %e, "probe failed");
            ProbeOutcome::Unreachable
        }
        Err(_) => {
            debug!(address, port, timeout_ms = timeout.as_millis() as u64, "probe timed out");
            ProbeOutcome::Unreachable
        }
    }
}

/// Sweep parameters
#[derive(Debug, Clone, Copy)]
pub struct SweepOptions {
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for SweepOptions {
    fn default() -> Self {
        SweepOptions {
            timeout: Duration::from_secs(5),
            concurrency: 16,
        }
    }
}

/// Outcome counts of one full sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub probed: usize,
    pub reachable: usize,
    pub unreachable: usize,
}

/// Probe every record with bounded parallelism and fold the outcomes into
/// each record's measured state. Returns only after the whole fan-out has
/// settled, so callers never act on a partial sweep.
pub async fn sweep(store: &dyn Store, opts: SweepOptions) -> crate::Result<SweepSummary> {
    let records = store.all_records().await?;
    let mut summary = SweepSummary::default();

    let outcomes: Vec<_> = stream::iter(records)
        .map(|record| async move {
            let outcome = probe(&record.address, record.port, opts.timeout).await;
            (record, outcome)
        })
        .buffer_unordered(opts.concurrency.max(1))
        .collect()
        .await;

    let now = Utc::now();
    for (mut record, outcome) in outcomes {
        summary.probed += 1;
        match outcome {
            ProbeOutcome::Latency(ms) => {
                summary.reachable += 1;
                record.measured.record_sample(ms, now);
            }
            ProbeOutcome::Unreachable => {
                summary.unreachable += 1;
                record.measured.record_failure(now);
            }
        }
        // the record may have been deleted while the probe was in flight
        // (a concurrent subscription swap); its result is moot, not fatal
        if let Err(e) = store.update_measured(record.id, record.measured.clone()).await {
            warn!(record = %record.id, error = %e, "dropping probe result for missing record");
        }
    }

    debug!(
        probed = summary.probed,
        reachable = summary.reachable,
        unreachable = summary.unreachable,
        "ping sweep settled"
    );
    Ok(summary)
}
