//! Measurements driven through a proxy tunnel.

pub mod connection;
pub mod download;
pub mod engine;
pub mod geo;
pub(crate) mod http;
pub mod latency;

use crate::errors::BenchError;
use url::Url;

/// Default payload source; `{bytes}` is replaced with the requested size.
pub const DEFAULT_LIVENESS_URL: &str =
    "https://speed.cloudflare.com/__down?bytes={bytes}";

const BYTES_PLACEHOLDER: &str = "{bytes}";

const NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent sent on transfer and probe requests.
pub(crate) fn user_agent() -> String {
    format!("{}/{}", NAME, VERSION)
}

/// Expand the liveness template for a request of `bytes` bytes.
///
/// Templates without the placeholder are used verbatim.
pub fn liveness_url(template: &str, bytes: u64) -> Result<Url, BenchError> {
    let url = template.replace(BYTES_PLACEHOLDER, &bytes.to_string());

    let url = Url::parse(&url).map_err(|e| {
        BenchError::config(format!("invalid liveness URL {}: {}", url, e))
            .with_source(e)
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(BenchError::config(format!(
            "liveness URL must be http(s), got {}",
            scheme
        ))),
    }
}
