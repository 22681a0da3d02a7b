//! Round-trip probes through a proxy.
//!
//! A probe is a zero-byte request against the liveness endpoint over a fresh
//! tunnel. Its round trip is the time to the first response byte; a probe
//! that errors or times out counts as lost.

use super::connection::TunnelClient;
use super::download::is_transfer_status;
use super::{liveness_url, user_agent};
use crate::proxy::Proxy;
use crate::stats::{jitter, median, packet_loss_percent};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Probes used in latency-only mode when none are configured.
pub const DEFAULT_FAST_PROBES: usize = 4;

/// Latency figures for one proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSummary {
    pub sent: usize,
    pub received: usize,
    /// Round-trip times of answered probes, in order.
    pub samples: Vec<Duration>,
    /// Median round trip.
    pub latency: Option<Duration>,
    pub jitter: Option<Duration>,
    /// Share of unanswered probes, 0–100.
    pub packet_loss: f64,
}

impl ProbeSummary {
    pub fn from_samples(sent: usize, samples: Vec<Duration>) -> Self {
        let received = samples.len();

        Self {
            sent,
            received,
            latency: median(&samples),
            jitter: jitter(&samples),
            packet_loss: packet_loss_percent(sent, received),
            samples,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.received > 0
    }
}

#[derive(Clone)]
pub struct LatencyProbe {
    client: TunnelClient,
    liveness_url: String,
}

impl LatencyProbe {
    pub fn new(client: TunnelClient, liveness_url: impl Into<String>) -> Self {
        Self { client, liveness_url: liveness_url.into() }
    }

    /// Send `count` sequential probes through `proxy`.
    pub async fn probe(
        &self,
        proxy: &dyn Proxy,
        count: usize,
        timeout: Duration,
    ) -> ProbeSummary {
        let url = match liveness_url(&self.liveness_url, 0) {
            Ok(url) => url,
            Err(e) => {
                warn!("{}: {}", proxy.name(), e);
                return ProbeSummary::from_samples(count, Vec::new());
            }
        };

        let mut samples = Vec::with_capacity(count);

        for i in 0..count {
            let deadline = Instant::now() + timeout;

            let rtt = match self
                .client
                .get(proxy, &url, &user_agent(), deadline)
                .await
            {
                Ok(mut response)
                    if is_transfer_status(response.head.status) =>
                {
                    let rtt = response.head.ttfb;
                    let mut buf = [0u8; 1024];
                    while let Ok(Ok(n)) =
                        timeout_at(deadline, response.read_body(&mut buf)).await
                    {
                        if n == 0 {
                            break;
                        }
                    }
                    Some(rtt)
                }
                Ok(response) => {
                    debug!(
                        "{}: probe {} answered {}",
                        proxy.name(),
                        i + 1,
                        response.head.status
                    );
                    None
                }
                Err(e) => {
                    debug!("{}: probe {} lost: {}", proxy.name(), i + 1, e);
                    None
                }
            };

            if let Some(rtt) = rtt {
                debug!("{}: probe {} rtt {:?}", proxy.name(), i + 1, rtt);
                samples.push(rtt);
            }
        }

        let summary = ProbeSummary::from_samples(count, samples);

        info!(
            "{}: latency {:?}, jitter {:?}, loss {:.1}%",
            proxy.name(),
            summary.latency,
            summary.jitter,
            summary.packet_loss
        );

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::connection::tls_connector;
    use crate::testing::{MockProxy, MockResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn probe() -> LatencyProbe {
        let client = TunnelClient::new(tls_connector().unwrap());
        LatencyProbe::new(client, "http://speed.test/__down?bytes={bytes}")
    }

    #[test]
    fn test_summary_from_samples() {
        let samples = vec![
            Duration::from_millis(10),
            Duration::from_millis(30),
            Duration::from_millis(20),
        ];
        let summary = ProbeSummary::from_samples(4, samples);

        assert_eq!(summary.received, 3);
        assert_eq!(summary.latency, Some(Duration::from_millis(20)));
        assert_eq!(summary.jitter, Some(Duration::from_millis(15)));
        assert_eq!(summary.packet_loss, 25.0);
        assert!(summary.is_reachable());
    }

    #[test]
    fn test_summary_nothing_answered() {
        let summary = ProbeSummary::from_samples(3, Vec::new());
        assert_eq!(summary.latency, None);
        assert_eq!(summary.jitter, None);
        assert_eq!(summary.packet_loss, 100.0);
        assert!(!summary.is_reachable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_measures_round_trips() {
        let delays = [40u64, 60, 50];
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let proxy = MockProxy::new("p", move |_, _| {
            let i = counter.fetch_add(1, Ordering::SeqCst);
            let delay = Duration::from_millis(delays[i % 3]);
            MockResponse::ok("").with_delay(delay)
        });

        let summary = probe().probe(&proxy, 3, Duration::from_secs(1)).await;

        assert_eq!(summary.sent, 3);
        assert_eq!(summary.received, 3);
        assert_eq!(summary.latency, Some(Duration::from_millis(50)));
        assert_eq!(summary.jitter, Some(Duration::from_millis(15)));
        assert_eq!(summary.packet_loss, 0.0);
        assert!(proxy
            .requests()
            .iter()
            .all(|r| r == "speed.test:80/__down?bytes=0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_probe_counts_as_lost() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let proxy = MockProxy::new("p", move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                MockResponse::ok("").with_delay(Duration::from_secs(10))
            } else {
                MockResponse::ok("")
            }
        });

        let summary = probe().probe(&proxy, 4, Duration::from_secs(1)).await;

        assert_eq!(summary.received, 3);
        assert_eq!(summary.packet_loss, 25.0);
    }

    #[tokio::test]
    async fn test_unreachable_proxy_loses_everything() {
        let proxy = MockProxy::unreachable("down");

        let summary = probe().probe(&proxy, 2, Duration::from_secs(1)).await;

        assert_eq!(summary.packet_loss, 100.0);
        assert_eq!(proxy.tunnel_count(), 2);
    }
}
