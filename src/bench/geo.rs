//! Egress IP and country lookup through a proxy.
//!
//! Token-bearing endpoints are shuffled to spread load over tokens, then a
//! fixed token-free endpoint is appended so it is always tried last. The
//! first endpoint that answers `200` with a JSON object carrying a non-empty
//! `ip` wins; every other outcome moves on to the next candidate.

use super::connection::TunnelClient;
use crate::errors::{BenchError, GeoError};
use crate::proxy::Proxy;
use http::StatusCode;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use url::Url;

/// Token-bearing endpoint; `{token}` is replaced with each token.
pub const DEFAULT_TOKEN_ENDPOINT: &str = "http://ipinfo.io/json?token={token}";

/// Last-resort endpoint, needs no token.
pub const DEFAULT_FALLBACK_ENDPOINT: &str = "https://api.ip.sb/geoip";

const TOKEN_PLACEHOLDER: &str = "{token}";

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Some lookup services turn away requests without a browser agent.
pub(crate) const USER_AGENTS: [&str; 16] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/116.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.0 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPad; CPU OS 15_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:105.0) Gecko/20100101 Firefox/105.0",
    "Mozilla/5.0 (Linux; Android 13; Pixel 6) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/117.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_0) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/117.0.5938.88 Safari/537.36",
    "Mozilla/5.0 (Windows NT 6.1; WOW64; rv:115.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (X11; Linux i686; rv:91.0) Gecko/20100101 Firefox/91.0",
    "Mozilla/5.0 (Linux; Android 10; SM-G973U) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/109.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (Macintosh; PPC Mac OS X 10_6_8) AppleWebKit/534.30 (KHTML, like Gecko) Version/5.1 Safari/534.30",
    "Mozilla/5.0 (Windows NT 6.3; ARM; Trident/7.0; Touch; rv:11.0) like Gecko",
    "Mozilla/5.0 (X11; Linux i686; rv:68.0) Gecko/20100101 Firefox/68.0",
    "Mozilla/5.0 (Linux; U; Android 9; en-US; SM-J810Y Build/PPR1.180610.011) AppleWebKit/537.36 (KHTML, like Gecko) Version/4.0 Mobile Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36",
];

/// One geolocation candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoEndpoint {
    pub url: String,
    pub requires_token: bool,
}

/// Egress identity of a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoLocation {
    pub ip: String,
    /// `None` when the endpoint knew the IP but not its country.
    pub country_code: Option<String>,
}

/// Extract a location from a lookup response body.
///
/// Needs a JSON object with a non-empty string `ip`. The country comes from
/// `country_code`, then `country`.
pub fn parse_location(body: &[u8]) -> Option<GeoLocation> {
    let object: Map<String, Value> = serde_json::from_slice(body).ok()?;

    let non_empty = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let ip = non_empty("ip")?;
    let country_code =
        non_empty("country_code").or_else(|| non_empty("country"));

    Some(GeoLocation { ip, country_code })
}

/// Resolves the egress location of proxies.
pub struct GeoResolver {
    client: TunnelClient,
    token_endpoint: String,
    fallback_endpoint: String,
    rng: Mutex<StdRng>,
}

impl GeoResolver {
    pub fn new(client: TunnelClient) -> Self {
        Self {
            client,
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            fallback_endpoint: DEFAULT_FALLBACK_ENDPOINT.to_string(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Use a fixed seed for endpoint shuffling and agent choice.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_endpoints(
        mut self,
        token_endpoint: impl Into<String>,
        fallback_endpoint: impl Into<String>,
    ) -> Self {
        self.token_endpoint = token_endpoint.into();
        self.fallback_endpoint = fallback_endpoint.into();
        self
    }

    /// Candidates in the order they will be tried: one shuffled entry per
    /// token, then the fallback.
    pub fn candidates(&self, tokens: &[String]) -> Vec<GeoEndpoint> {
        let mut candidates: Vec<GeoEndpoint> = tokens
            .iter()
            .map(|token| GeoEndpoint {
                url: self.token_endpoint.replace(TOKEN_PLACEHOLDER, token),
                requires_token: true,
            })
            .collect();

        {
            let mut rng =
                self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            candidates.shuffle(&mut *rng);
        }

        candidates.push(GeoEndpoint {
            url: self.fallback_endpoint.clone(),
            requires_token: false,
        });

        candidates
    }

    fn random_user_agent(&self) -> &'static str {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]
    }

    /// Look up the egress IP and country of `proxy`.
    ///
    /// Each candidate gets its own `timeout`.
    pub async fn resolve(
        &self,
        proxy: &dyn Proxy,
        timeout: Duration,
        tokens: &[String],
    ) -> Result<GeoLocation, GeoError> {
        let candidates = self.candidates(tokens);
        let attempts = candidates.len();

        for (i, endpoint) in candidates.iter().enumerate() {
            match self.query(proxy, endpoint, timeout).await {
                Ok(location) => {
                    info!(
                        "{}: egress {} ({}) via candidate {}/{}",
                        proxy.name(),
                        location.ip,
                        location.country_code.as_deref().unwrap_or("?"),
                        i + 1,
                        attempts
                    );
                    return Ok(location);
                }
                Err(e) => {
                    debug!(
                        "{}: geolocation candidate {}/{} failed: {}",
                        proxy.name(),
                        i + 1,
                        attempts,
                        e
                    );
                }
            }
        }

        let error = GeoError::Exhausted { attempts };
        warn!("{}: {}", proxy.name(), error);
        Err(error)
    }

    async fn query(
        &self,
        proxy: &dyn Proxy,
        endpoint: &GeoEndpoint,
        timeout: Duration,
    ) -> Result<GeoLocation, BenchError> {
        let url = Url::parse(&endpoint.url).map_err(|e| {
            BenchError::config(format!(
                "invalid endpoint {}: {}",
                endpoint.url, e
            ))
        })?;
        let deadline = Instant::now() + timeout;

        let mut response = self
            .client
            .get(proxy, &url, self.random_user_agent(), deadline)
            .await?;

        if response.head.status != StatusCode::OK {
            return Err(BenchError::status(response.head.status));
        }

        let read = response.read_to_end(MAX_BODY_BYTES);
        let body = match timeout_at(deadline, read).await {
            Ok(body) => body?,
            Err(_) => {
                return Err(BenchError::timeout("response body timed out"))
            }
        };

        parse_location(&body).ok_or_else(|| {
            BenchError::decode("response is not a JSON object with an ip")
        })
    }
}
