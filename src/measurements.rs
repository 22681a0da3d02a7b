//! Reduction of per-chunk transfer results into per-proxy figures.
//!
//! Workers of one fan-out fold their [`ChunkResult`] into a shared
//! [`TransferAccumulator`]; once every worker has joined, [`aggregate`] turns
//! the totals and the wall-clock span of the whole fan-out into a
//! [`TransferSummary`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Bandwidth reported when no byte made it through the proxy.
pub const FAILED_BANDWIDTH: f64 = -1.0;

/// Bandwidth a proxy must exceed before its location is looked up.
pub const GEO_BANDWIDTH_EPSILON: f64 = 1e-9;

/// Outcome of one chunk worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkResult {
    /// Body bytes received, including bytes read before a deadline fired.
    pub bytes_transferred: u64,
    /// Time from the start of the attempt to the first response byte.
    pub ttfb: Duration,
    pub ok: bool,
}

impl ChunkResult {
    pub fn failed() -> Self {
        Self { bytes_transferred: 0, ttfb: Duration::ZERO, ok: false }
    }

    /// A chunk that received `bytes` body bytes. Zero bytes is a failure.
    pub fn transferred(bytes: u64, ttfb: Duration) -> Self {
        if bytes == 0 {
            return Self::failed();
        }
        Self { bytes_transferred: bytes, ttfb, ok: true }
    }
}

/// Running sums for one proxy's fan-out, shared by all of its workers.
#[derive(Debug, Default)]
pub struct TransferAccumulator {
    bytes: AtomicU64,
    ttfb_nanos: AtomicU64,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl TransferAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one worker's result in. Failed chunks contribute nothing.
    pub fn record(&self, chunk: &ChunkResult) {
        if !chunk.ok || chunk.bytes_transferred == 0 {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let ttfb_nanos = chunk.ttfb.as_nanos().min(u64::MAX as u128) as u64;

        self.bytes.fetch_add(chunk.bytes_transferred, Ordering::Relaxed);
        self.ttfb_nanos.fetch_add(ttfb_nanos, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> TransferTotals {
        TransferTotals {
            bytes: self.bytes.load(Ordering::Relaxed),
            ttfb_sum: Duration::from_nanos(
                self.ttfb_nanos.load(Ordering::Relaxed),
            ),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a [`TransferAccumulator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferTotals {
    pub bytes: u64,
    /// Sum of TTFB over contributing chunks.
    pub ttfb_sum: Duration,
    pub succeeded: usize,
    pub failed: usize,
}

/// Aggregate transfer figures for one proxy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferSummary {
    /// Bytes per second across the whole fan-out, or [`FAILED_BANDWIDTH`].
    pub bandwidth: f64,
    /// Mean TTFB over the configured concurrency, zero on total failure.
    pub ttfb: Duration,
    pub bytes: u64,
    pub elapsed: Duration,
    pub succeeded: usize,
    pub concurrency: usize,
}

impl TransferSummary {
    pub fn failed(concurrency: usize, elapsed: Duration) -> Self {
        Self {
            bandwidth: FAILED_BANDWIDTH,
            ttfb: Duration::ZERO,
            bytes: 0,
            elapsed,
            succeeded: 0,
            concurrency,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.bytes == 0
    }

    /// Whether enough traffic flowed to be worth a geolocation round trip.
    pub fn qualifies_for_geo(&self) -> bool {
        !self.is_failed() && self.bandwidth > GEO_BANDWIDTH_EPSILON
    }
}

/// Bytes requested from each worker; the remainder is dropped.
pub fn chunk_size(total_size: u64, concurrency: usize) -> u64 {
    total_size / concurrency.max(1) as u64
}

/// Bytes per second over `elapsed`.
pub fn calculate_bandwidth(bytes: u64, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if seconds <= 0.0 {
        return bytes as f64 / 1e-9;
    }
    bytes as f64 / seconds
}

/// Reduce the totals of one fan-out.
///
/// Bandwidth uses the span of the entire fan-out, so it reflects the
/// aggregate throughput of all workers together. The TTFB sum is divided by
/// `concurrency` rather than by the number of successful chunks: failed
/// workers count as zero and pull the mean down.
pub fn aggregate(
    totals: TransferTotals,
    concurrency: usize,
    elapsed: Duration,
) -> TransferSummary {
    let concurrency = concurrency.max(1);

    if totals.bytes == 0 {
        return TransferSummary::failed(concurrency, elapsed);
    }

    let ttfb_nanos = totals.ttfb_sum.as_nanos() / concurrency as u128;

    TransferSummary {
        bandwidth: calculate_bandwidth(totals.bytes, elapsed),
        ttfb: Duration::from_nanos(ttfb_nanos.min(u64::MAX as u128) as u64),
        bytes: totals.bytes,
        elapsed,
        succeeded: totals.succeeded,
        concurrency,
    }
}
