//! Proxy benchmarking: chunked concurrent downloads, latency probes and
//! egress geolocation, all driven through caller-supplied proxy tunnels.

pub mod bench;
pub mod errors;
pub mod measurements;
pub mod proxy;
pub mod results;
pub mod stats;

#[cfg(test)]
mod testing;

pub use bench::engine::{TestConfig, TestEngine};
pub use errors::{BenchError, ErrorKind, GeoError};
pub use proxy::{Connection, DirectProxy, Metadata, Proxy, ProxyType};
pub use results::ProxyResult;
