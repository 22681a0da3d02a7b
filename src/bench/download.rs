//! Chunked concurrent download through one proxy.

use super::connection::TunnelClient;
use super::{liveness_url, user_agent};
use crate::measurements::{
    aggregate, chunk_size, ChunkResult, TransferAccumulator, TransferSummary,
};
use crate::proxy::Proxy;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use url::Url;

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Statuses further than this above 200 fail the chunk.
const MAX_STATUS_OFFSET: i32 = 100;

/// Splits a payload across concurrent workers, one tunnel each.
#[derive(Clone)]
pub struct ChunkedDownloader {
    client: TunnelClient,
    liveness_url: String,
}

impl ChunkedDownloader {
    pub fn new(client: TunnelClient, liveness_url: impl Into<String>) -> Self {
        Self { client, liveness_url: liveness_url.into() }
    }

    /// Download `total_size` bytes through `proxy` split over `concurrency`
    /// workers.
    ///
    /// Each worker gets its own `timeout`; there is no shared deadline and a
    /// failing worker does not cancel its siblings. Returns once every worker
    /// has finished or run out of time.
    pub async fn run_concurrent_transfer(
        &self,
        proxy: Arc<dyn Proxy>,
        total_size: u64,
        timeout: Duration,
        concurrency: usize,
    ) -> TransferSummary {
        let concurrency = concurrency.max(1);
        let chunk = chunk_size(total_size, concurrency);

        let url = match liveness_url(&self.liveness_url, chunk) {
            Ok(url) => url,
            Err(e) => {
                warn!("{}: {}", proxy.name(), e);
                return TransferSummary::failed(concurrency, Duration::ZERO);
            }
        };

        info!(
            "{}: downloading {} x {} bytes",
            proxy.name(),
            concurrency,
            chunk
        );

        let accumulator = Arc::new(TransferAccumulator::new());
        let mut workers = JoinSet::new();
        let start = Instant::now();

        for worker in 0..concurrency {
            let proxy = Arc::clone(&proxy);
            let client = self.client.clone();
            let url = url.clone();
            let accumulator = Arc::clone(&accumulator);

            workers.spawn(async move {
                let result =
                    transfer_chunk(&client, proxy.as_ref(), &url, timeout)
                        .await;
                debug!(
                    "{}: worker {} finished: {} bytes, ttfb {:?}, ok={}",
                    proxy.name(),
                    worker,
                    result.bytes_transferred,
                    result.ttfb,
                    result.ok
                );
                accumulator.record(&result);
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("{}: transfer worker aborted: {}", proxy.name(), e);
            }
        }

        let elapsed = start.elapsed();
        let summary = aggregate(accumulator.totals(), concurrency, elapsed);

        if summary.is_failed() {
            warn!(
                "{}: no bytes received from {} workers",
                proxy.name(),
                concurrency
            );
        }

        summary
    }
}

/// Whether a final status counts as a successful transfer.
pub(crate) fn is_transfer_status(status: http::StatusCode) -> bool {
    status.as_u16() as i32 - 200 <= MAX_STATUS_OFFSET
}

/// One worker: fetch `url` through `proxy` and count the body bytes.
///
/// Bytes read before the deadline fires, or before the connection breaks,
/// still count.
pub(crate) async fn transfer_chunk(
    client: &TunnelClient,
    proxy: &dyn Proxy,
    url: &Url,
    timeout: Duration,
) -> ChunkResult {
    let deadline = Instant::now() + timeout;

    let mut response =
        match client.get(proxy, url, &user_agent(), deadline).await {
            Ok(response) => response,
            Err(e) => {
                debug!("{}: {}", proxy.name(), e);
                return ChunkResult::failed();
            }
        };

    if !is_transfer_status(response.head.status) {
        debug!("{}: server answered {}", proxy.name(), response.head.status);
        return ChunkResult::failed();
    }

    let ttfb = response.head.ttfb;
    let mut bytes = 0u64;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match timeout_at(deadline, response.read_body(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => bytes += n as u64,
            Ok(Err(e)) => {
                debug!(
                    "{}: body read failed after {} bytes: {}",
                    proxy.name(),
                    bytes,
                    e
                );
                break;
            }
            Err(_) => {
                debug!(
                    "{}: deadline reached after {} bytes",
                    proxy.name(),
                    bytes
                );
                break;
            }
        }
    }

    ChunkResult::transferred(bytes, ttfb)
}
