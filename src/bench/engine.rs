use super::connection::{tls_connector, TunnelClient};
use super::download::ChunkedDownloader;
use super::geo::{
    GeoResolver, DEFAULT_FALLBACK_ENDPOINT, DEFAULT_TOKEN_ENDPOINT,
};
use super::latency::{LatencyProbe, DEFAULT_FAST_PROBES};
use super::{liveness_url, DEFAULT_LIVENESS_URL};
use crate::errors::BenchError;
use crate::proxy::Proxy;
use crate::results::ProxyResult;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use regex::Regex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Configuration for the test engine.
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Payload source, `{bytes}` is replaced with the chunk size.
    pub liveness_url: String,

    /// Total bytes downloaded through each proxy.
    /// Default: 100 MiB
    pub download_size: u64,

    /// Deadline of each chunk worker and each probe.
    /// Default: 5s
    pub timeout: Duration,

    /// Chunk workers per proxy.
    /// Default: 4
    pub concurrency: usize,

    /// Tokens for the token-bearing geolocation endpoint.
    pub geo_tokens: Vec<String>,

    /// Geolocation timeout as a multiple of `timeout`.
    /// Default: 2
    pub geo_timeout_factor: u32,

    /// Latency probes per proxy, 0 disables probing.
    pub probe_count: usize,

    /// Skip the bulk transfer and only probe.
    pub fast: bool,

    /// Proxies tested at once.
    /// Default: 1
    pub proxy_parallelism: usize,

    /// Only proxies whose name matches this regex are tested.
    /// Default: none, every proxy matches
    pub name_filter: Option<String>,

    /// Token-bearing geolocation endpoint, `{token}` is replaced.
    pub geo_token_endpoint: String,

    /// Token-free geolocation endpoint tried last.
    pub geo_fallback_endpoint: String,

    /// Fixed RNG seed for geolocation shuffling.
    pub seed: Option<u64>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            liveness_url: DEFAULT_LIVENESS_URL.to_string(),
            download_size: 100 * 1024 * 1024,
            timeout: Duration::from_secs(5),
            concurrency: 4,
            geo_tokens: Vec::new(),
            geo_timeout_factor: 2,
            probe_count: 0,
            fast: false,
            proxy_parallelism: 1,
            name_filter: None,
            geo_token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            geo_fallback_endpoint: DEFAULT_FALLBACK_ENDPOINT.to_string(),
            seed: None,
        }
    }
}

impl TestConfig {
    pub fn with_liveness_url(mut self, url: impl Into<String>) -> Self {
        self.liveness_url = url.into();
        self
    }

    pub fn with_download_size(mut self, bytes: u64) -> Self {
        self.download_size = bytes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_geo_tokens(mut self, tokens: Vec<String>) -> Self {
        self.geo_tokens = tokens;
        self
    }

    pub fn with_probe_count(mut self, count: usize) -> Self {
        self.probe_count = count;
        self
    }

    pub fn with_fast(mut self, fast: bool) -> Self {
        self.fast = fast;
        self
    }

    pub fn with_proxy_parallelism(mut self, parallelism: usize) -> Self {
        self.proxy_parallelism = parallelism;
        self
    }

    pub fn with_name_filter(mut self, pattern: impl Into<String>) -> Self {
        self.name_filter = Some(pattern.into());
        self
    }

    pub fn with_geo_endpoints(
        mut self,
        token_endpoint: impl Into<String>,
        fallback_endpoint: impl Into<String>,
    ) -> Self {
        self.geo_token_endpoint = token_endpoint.into();
        self.geo_fallback_endpoint = fallback_endpoint.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Deadline for each geolocation candidate.
    pub fn geo_timeout(&self) -> Duration {
        self.timeout.saturating_mul(self.geo_timeout_factor.max(1))
    }

    /// Probes sent per proxy; fast mode always sends a few.
    pub fn effective_probe_count(&self) -> usize {
        if self.fast {
            self.probe_count.max(DEFAULT_FAST_PROBES)
        } else {
            self.probe_count
        }
    }

    fn compile_name_filter(&self) -> Result<Option<Regex>, BenchError> {
        self.name_filter
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    BenchError::config(format!(
                        "invalid name filter {:?}: {}",
                        pattern, e
                    ))
                    .with_source(e)
                })
            })
            .transpose()
    }

    /// Reject settings that would make every measurement meaningless.
    pub fn validate(&self) -> Result<(), BenchError> {
        liveness_url(&self.liveness_url, 0)?;

        if self.timeout.is_zero() {
            return Err(BenchError::config(
                "timeout must be greater than zero",
            ));
        }

        Url::parse(&self.geo_fallback_endpoint).map_err(|e| {
            BenchError::config(format!(
                "invalid geolocation endpoint {}: {}",
                self.geo_fallback_endpoint, e
            ))
            .with_source(e)
        })?;

        self.compile_name_filter()?;

        Ok(())
    }
}

/// Runs the per-proxy test sequence over a set of proxies.
///
/// # Example
/// ```no_run
/// use proxy_speed::bench::engine::{TestConfig, TestEngine};
/// use proxy_speed::proxy::{DirectProxy, Proxy};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let engine = TestEngine::new(TestConfig::default()).unwrap();
///     let proxies: Vec<Arc<dyn Proxy>> =
///         vec![Arc::new(DirectProxy::default())];
///     for result in engine.run_collect(proxies).await {
///         println!("{}: {:.0} B/s", result.name, result.bandwidth);
///     }
/// }
/// ```
pub struct TestEngine {
    config: TestConfig,
    name_filter: Option<Regex>,
    downloader: ChunkedDownloader,
    probe: LatencyProbe,
    geo: GeoResolver,
}

impl TestEngine {
    pub fn new(config: TestConfig) -> Result<Self, BenchError> {
        config.validate()?;

        let name_filter = config.compile_name_filter()?;
        let client = TunnelClient::new(tls_connector()?);

        let mut geo = GeoResolver::new(client.clone()).with_endpoints(
            config.geo_token_endpoint.clone(),
            config.geo_fallback_endpoint.clone(),
        );
        if let Some(seed) = config.seed {
            geo = geo.with_seed(seed);
        }

        Ok(Self {
            name_filter,
            downloader: ChunkedDownloader::new(
                client.clone(),
                config.liveness_url.clone(),
            ),
            probe: LatencyProbe::new(client, config.liveness_url.clone()),
            geo,
            config,
        })
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    /// Test one proxy: probes, the chunked transfer, then geolocation when
    /// traffic got through.
    pub async fn test_proxy(&self, proxy: Arc<dyn Proxy>) -> ProxyResult {
        let config = &self.config;
        info!("{}: testing ({})", proxy.name(), proxy.proxy_type());

        let mut result = ProxyResult::new(proxy.name(), proxy.proxy_type());

        let probe_count = config.effective_probe_count();
        let probe = if probe_count > 0 {
            let summary = self
                .probe
                .probe(proxy.as_ref(), probe_count, config.timeout)
                .await;
            Some(summary)
        } else {
            None
        };
        if let Some(probe) = &probe {
            result = result.with_probe(probe);
        }

        let reachable = if config.fast {
            probe.as_ref().is_some_and(|p| p.is_reachable())
        } else {
            let transfer = self
                .downloader
                .run_concurrent_transfer(
                    Arc::clone(&proxy),
                    config.download_size,
                    config.timeout,
                    config.concurrency,
                )
                .await;
            result = result.with_transfer(&transfer);
            transfer.qualifies_for_geo()
        };

        if reachable {
            let location = self
                .geo
                .resolve(
                    proxy.as_ref(),
                    config.geo_timeout(),
                    &config.geo_tokens,
                )
                .await;
            if let Ok(location) = location {
                result = result.with_location(location);
            }
        } else {
            debug!("{}: unreachable, skipping geolocation", proxy.name());
        }

        info!(
            "{}: bandwidth {:.0} B/s, ttfb {:?}, location {} {}",
            proxy.name(),
            result.bandwidth,
            result.ttfb,
            result.country_code,
            result.ip
        );

        result
    }

    /// Proxies to test, sorted by name: benchmarkable types whose name
    /// matches the configured filter.
    pub fn select(&self, proxies: Vec<Arc<dyn Proxy>>) -> Vec<Arc<dyn Proxy>> {
        let mut selected: Vec<Arc<dyn Proxy>> = proxies
            .into_iter()
            .filter(|proxy| {
                if !proxy.proxy_type().is_benchmarkable() {
                    debug!(
                        "{}: skipping {} proxy",
                        proxy.name(),
                        proxy.proxy_type()
                    );
                    return false;
                }
                self.name_filter
                    .as_ref()
                    .is_none_or(|filter| filter.is_match(proxy.name()))
            })
            .collect();

        selected.sort_by(|a, b| a.name().cmp(b.name()));
        selected
    }

    /// Test every selected proxy and send each result to `sink` as soon as
    /// it is ready.
    ///
    /// At most `proxy_parallelism` proxies are in flight. Finished results
    /// wait in a local queue while `sink` is full, so a slow receiver never
    /// pauses measurements in progress. Returns the number of results sent;
    /// stops early if the receiver is dropped.
    pub async fn run(
        &self,
        proxies: Vec<Arc<dyn Proxy>>,
        sink: mpsc::Sender<ProxyResult>,
    ) -> usize {
        let total = proxies.len();
        let proxies = self.select(proxies);
        let parallelism = self.config.proxy_parallelism.max(1);

        info!(
            "testing {} of {} proxies, {} at a time",
            proxies.len(),
            total,
            parallelism
        );

        let mut results = stream::iter(proxies)
            .map(|proxy| self.test_proxy(proxy))
            .buffer_unordered(parallelism);

        let mut queued: VecDeque<ProxyResult> = VecDeque::new();
        let mut measuring = true;
        let mut sent = 0;

        while measuring || !queued.is_empty() {
            tokio::select! {
                next = results.next(), if measuring => match next {
                    Some(result) => queued.push_back(result),
                    None => measuring = false,
                },
                permit = sink.reserve(), if !queued.is_empty() => {
                    let Ok(permit) = permit else {
                        warn!("result receiver dropped, stopping");
                        break;
                    };
                    if let Some(result) = queued.pop_front() {
                        permit.send(result);
                        sent += 1;
                    }
                }
            }
        }

        sent
    }

    /// Run all proxies and collect the results in completion order.
    pub async fn run_collect(
        &self,
        proxies: Vec<Arc<dyn Proxy>>,
    ) -> Vec<ProxyResult> {
        let (tx, mut rx) = mpsc::channel(proxies.len().max(1));
        self.run(proxies, tx).await;

        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::FAILED_BANDWIDTH;
    use crate::proxy::ProxyType;
    use crate::results::UNKNOWN;
    use crate::testing::{MockProxy, MockResponse};

    const LIVENESS: &str = "http://speed.test/__down?bytes={bytes}";
    const GEO_HOST: &str = "fallback.test";

    fn config() -> TestConfig {
        TestConfig::default()
            .with_liveness_url(LIVENESS)
            .with_download_size(4_000)
            .with_timeout(Duration::from_secs(2))
            .with_geo_endpoints(
                "http://geo.test/json?token={token}",
                "http://fallback.test/geoip",
            )
            .with_seed(1)
    }

    fn requested_bytes(target: &str) -> usize {
        target
            .rsplit('=')
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Serves the payload and a geolocation answer.
    fn healthy(name: &str) -> Arc<MockProxy> {
        Arc::new(MockProxy::new(name, |metadata, target| {
            if metadata.host == GEO_HOST {
                MockResponse::ok(r#"{"ip":"198.51.100.7","country_code":"FR"}"#)
            } else {
                MockResponse::bytes(requested_bytes(target))
            }
        }))
    }

    fn as_dyn(proxy: &Arc<MockProxy>) -> Arc<dyn Proxy> {
        Arc::clone(proxy) as Arc<dyn Proxy>
    }

    #[test]
    fn test_default_config() {
        let config = TestConfig::default();
        assert_eq!(config.download_size, 104_857_600);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.geo_timeout(), Duration::from_secs(10));
        assert_eq!(config.probe_count, 0);
        assert_eq!(config.proxy_parallelism, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let zero = TestConfig::default().with_timeout(Duration::ZERO);
        assert!(zero.validate().is_err());

        let scheme = TestConfig::default().with_liveness_url("ftp://x/{bytes}");
        let err = scheme.validate().unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Config);

        assert!(TestEngine::new(zero).is_err());
    }

    #[test]
    fn test_effective_probe_count() {
        assert_eq!(config().effective_probe_count(), 0);
        assert_eq!(config().with_fast(true).effective_probe_count(), 4);
        assert_eq!(
            config()
                .with_fast(true)
                .with_probe_count(9)
                .effective_probe_count(),
            9
        );
    }

    #[tokio::test]
    async fn test_successful_transfer_triggers_one_geo_lookup() {
        let engine = TestEngine::new(config()).unwrap();
        let proxy = healthy("good");

        let result = engine.test_proxy(as_dyn(&proxy)).await;

        assert!(result.bandwidth > 0.0);
        assert_eq!(result.ip, "198.51.100.7");
        assert_eq!(result.country_code, "FR");
        assert_eq!(result.latency, None);
        assert_eq!(result.packet_loss, None);
        assert_eq!(proxy.requests_matching(GEO_HOST).len(), 1);
        assert_eq!(proxy.requests_matching("bytes=1000").len(), 4);
    }

    #[tokio::test]
    async fn test_failed_transfer_skips_geolocation() {
        let engine = TestEngine::new(config()).unwrap();
        let proxy = Arc::new(MockProxy::new("bad", |metadata, _| {
            if metadata.host == GEO_HOST {
                MockResponse::ok(r#"{"ip":"198.51.100.7"}"#)
            } else {
                MockResponse::status(502, "bad gateway")
            }
        }));

        let result = engine.test_proxy(as_dyn(&proxy)).await;

        assert_eq!(result.bandwidth, FAILED_BANDWIDTH);
        assert_eq!(result.ttfb, Duration::ZERO);
        assert_eq!(result.ip, UNKNOWN);
        assert_eq!(result.country_code, UNKNOWN);
        assert!(proxy.requests_matching(GEO_HOST).is_empty());
    }

    #[tokio::test]
    async fn test_geo_exhaustion_keeps_marker() {
        let engine = TestEngine::new(config()).unwrap();
        let proxy = Arc::new(MockProxy::new("p", |metadata, target| {
            if metadata.host == GEO_HOST {
                MockResponse::status(503, "")
            } else {
                MockResponse::bytes(requested_bytes(target))
            }
        }));

        let result = engine.test_proxy(as_dyn(&proxy)).await;

        assert!(result.bandwidth > 0.0);
        assert_eq!(result.ip, UNKNOWN);
    }

    #[tokio::test]
    async fn test_probes_fill_latency_fields() {
        let engine = TestEngine::new(config().with_probe_count(3)).unwrap();
        let proxy = healthy("p");

        let result = engine.test_proxy(as_dyn(&proxy)).await;

        assert!(result.latency.is_some());
        assert!(result.jitter.is_some());
        assert_eq!(result.packet_loss, Some(0.0));
        assert_eq!(proxy.requests_matching("bytes=0").len(), 3);
    }

    #[tokio::test]
    async fn test_fast_mode_skips_transfer() {
        let engine = TestEngine::new(config().with_fast(true)).unwrap();
        let proxy = healthy("p");

        let result = engine.test_proxy(as_dyn(&proxy)).await;

        assert_eq!(result.bandwidth, FAILED_BANDWIDTH);
        assert_eq!(result.packet_loss, Some(0.0));
        assert_eq!(result.ip, "198.51.100.7");
        assert_eq!(proxy.requests_matching("bytes=0").len(), 4);
        assert!(proxy.requests_matching("bytes=1000").is_empty());
    }

    #[tokio::test]
    async fn test_fast_mode_unreachable_skips_geolocation() {
        let engine = TestEngine::new(config().with_fast(true)).unwrap();
        let proxy = Arc::new(MockProxy::unreachable("down"));

        let result = engine.test_proxy(as_dyn(&proxy)).await;

        assert_eq!(result.packet_loss, Some(100.0));
        assert_eq!(result.ip, UNKNOWN);
        assert_eq!(proxy.tunnel_count(), 4);
    }

    #[tokio::test]
    async fn test_run_skips_policy_groups() {
        let engine = TestEngine::new(config()).unwrap();
        let group = Arc::new(
            MockProxy::new("auto", |_, _| MockResponse::bytes(10))
                .with_type(ProxyType::UrlTest),
        );
        let reject = Arc::new(
            MockProxy::unreachable("block").with_type(ProxyType::Reject),
        );
        let good = healthy("good");

        let results = engine
            .run_collect(vec![as_dyn(&group), as_dyn(&reject), as_dyn(&good)])
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "good");
        assert_eq!(group.tunnel_count(), 0);
        assert_eq!(reject.tunnel_count(), 0);
    }

    #[tokio::test]
    async fn test_every_proxy_yields_a_result() {
        let engine = TestEngine::new(config()).unwrap();
        let proxies = vec![
            as_dyn(&healthy("a")),
            as_dyn(&Arc::new(MockProxy::unreachable("b"))),
            as_dyn(&healthy("c")),
        ];

        let results = engine.run_collect(proxies).await;

        let names: Vec<&str> =
            results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(results[1].is_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_arrive_in_completion_order() {
        let engine =
            TestEngine::new(config().with_proxy_parallelism(2)).unwrap();

        let slow = Arc::new(MockProxy::new("slow", |metadata, target| {
            if metadata.host == GEO_HOST {
                MockResponse::ok(r#"{"ip":"192.0.2.1"}"#)
            } else {
                MockResponse::bytes(requested_bytes(target))
                    .with_delay(Duration::from_secs(1))
            }
        }));
        let fast = healthy("fast");

        let (tx, mut rx) = mpsc::channel(4);
        let sent = engine.run(vec![as_dyn(&slow), as_dyn(&fast)], tx).await;

        assert_eq!(sent, 2);
        assert_eq!(rx.recv().await.unwrap().name, "fast");
        assert_eq!(rx.recv().await.unwrap().name, "slow");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_receiver_does_not_skew_bandwidth() {
        let engine =
            TestEngine::new(config().with_proxy_parallelism(3)).unwrap();

        let slow = Arc::new(MockProxy::new("c", |metadata, target| {
            if metadata.host == GEO_HOST {
                MockResponse::ok(r#"{"ip":"192.0.2.3"}"#)
            } else {
                MockResponse::bytes(requested_bytes(target))
                    .with_delay(Duration::from_secs(1))
            }
        }));
        let proxies =
            vec![as_dyn(&healthy("a")), as_dyn(&healthy("b")), as_dyn(&slow)];

        let (tx, mut rx) = mpsc::channel(1);
        let reader = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let mut results = Vec::new();
            while let Some(result) = rx.recv().await {
                results.push(result);
            }
            results
        };

        let (sent, results) = tokio::join!(engine.run(proxies, tx), reader);

        assert_eq!(sent, 3);
        let c = results.iter().find(|r| r.name == "c").unwrap();
        assert!(
            (c.bandwidth - 4_000.0).abs() / 4_000.0 < 0.01,
            "bandwidth {} should be close to 4000",
            c.bandwidth
        );
        let ttfb_ms = c.ttfb.as_secs_f64() * 1000.0;
        assert!((ttfb_ms - 1000.0).abs() < 1.0, "ttfb was {}ms", ttfb_ms);
    }

    #[tokio::test]
    async fn test_name_filter_selects_and_sorts() {
        let engine =
            TestEngine::new(config().with_name_filter("^(hk|jp)-")).unwrap();
        let jp = healthy("jp-02");
        let us = healthy("us-01");
        let hk = healthy("hk-01");

        let results = engine
            .run_collect(vec![as_dyn(&jp), as_dyn(&us), as_dyn(&hk)])
            .await;

        let names: Vec<&str> =
            results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["hk-01", "jp-02"]);
        assert_eq!(us.tunnel_count(), 0);
    }

    #[test]
    fn test_select_sorts_by_name_without_filter() {
        let engine = TestEngine::new(config()).unwrap();
        let proxies = vec![
            as_dyn(&healthy("zeta")),
            as_dyn(&healthy("alpha")),
            as_dyn(&healthy("mid")),
        ];

        let selected = engine.select(proxies);

        let names: Vec<&str> = selected.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_invalid_name_filter_is_a_config_error() {
        let err = TestEngine::new(config().with_name_filter("(unclosed"))
            .err()
            .unwrap();
        assert_eq!(err.kind, crate::errors::ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_run_stops_when_receiver_dropped() {
        let engine = TestEngine::new(config()).unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let sent = engine.run(vec![as_dyn(&healthy("a"))], tx).await;

        assert_eq!(sent, 0);
    }
}
