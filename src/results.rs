//! Per-proxy result record.
//!
//! One [`ProxyResult`] is emitted per tested proxy. It implements Serialize
//! for JSON output; durations are written as fractional milliseconds.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::time::Duration;

use crate::bench::geo::GeoLocation;
use crate::bench::latency::ProbeSummary;
use crate::measurements::{TransferSummary, FAILED_BANDWIDTH};
use crate::proxy::ProxyType;

/// Marker for an unknown country or egress IP.
pub const UNKNOWN: &str = "NIL";

/// Benchmark outcome for one proxy.
///
/// # Example
/// ```no_run
/// use proxy_speed::results::ProxyResult;
/// use proxy_speed::proxy::ProxyType;
///
/// let result = ProxyResult::new("tokyo-01", ProxyType::Trojan);
/// assert!(result.is_failed());
/// let json = serde_json::to_string_pretty(&result).unwrap();
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ProxyResult {
    pub name: String,
    pub proxy_type: ProxyType,
    /// Bytes per second, `-1.0` when nothing was transferred.
    pub bandwidth: f64,
    #[serde(rename = "ttfb_ms", serialize_with = "as_millis")]
    pub ttfb: Duration,
    /// Median probe round trip. Unset when probing is disabled.
    #[serde(
        rename = "latency_ms",
        serialize_with = "as_optional_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub latency: Option<Duration>,
    #[serde(
        rename = "jitter_ms",
        serialize_with = "as_optional_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub jitter: Option<Duration>,
    /// Percentage of lost probes, 0–100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<f64>,
    pub country_code: String,
    pub ip: String,
    pub timestamp: DateTime<Utc>,
}

impl ProxyResult {
    /// A result with failure sentinels and an unknown location.
    pub fn new(name: impl Into<String>, proxy_type: ProxyType) -> Self {
        Self {
            name: name.into(),
            proxy_type,
            bandwidth: FAILED_BANDWIDTH,
            ttfb: Duration::ZERO,
            latency: None,
            jitter: None,
            packet_loss: None,
            country_code: UNKNOWN.to_string(),
            ip: UNKNOWN.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_transfer(mut self, transfer: &TransferSummary) -> Self {
        self.bandwidth = transfer.bandwidth;
        self.ttfb = transfer.ttfb;
        self
    }

    pub fn with_probe(mut self, probe: &ProbeSummary) -> Self {
        self.latency = probe.latency;
        self.jitter = probe.jitter;
        self.packet_loss = Some(probe.packet_loss);
        self
    }

    /// Record the egress location. An empty or missing country keeps the
    /// marker.
    pub fn with_location(mut self, location: GeoLocation) -> Self {
        if !location.ip.is_empty() {
            self.ip = location.ip;
        }
        if let Some(country) = location.country_code.filter(|c| !c.is_empty()) {
            self.country_code = country;
        }
        self
    }

    /// Whether no byte made it through the proxy.
    pub fn is_failed(&self) -> bool {
        self.bandwidth <= 0.0
    }

    pub fn has_location(&self) -> bool {
        self.ip != UNKNOWN
    }
}

fn as_millis<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_nanos() as f64 / 1e6)
}

fn as_optional_millis<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match duration {
        Some(duration) => as_millis(duration, serializer),
        None => serializer.serialize_none(),
    }
}
