//! Opening HTTP(S) exchanges through a proxy tunnel.
//!
//! Every attempt dials a fresh tunnel, optionally wraps it in TLS, sends one
//! request and hands back the response with its body still unread. Each step
//! is bounded by the caller's deadline.

use super::http::{send_request, Response};
use crate::errors::BenchError;
use crate::proxy::{Connection, Metadata, Proxy};
use log::debug;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::TlsConnector;
use url::Url;

/// The tunnel destination for `url`.
pub(crate) fn metadata_for(url: &Url) -> Result<Metadata, BenchError> {
    let host = url
        .host_str()
        .ok_or_else(|| BenchError::config(format!("{} has no host", url)))?;
    let port = url.port_or_known_default().ok_or_else(|| {
        BenchError::config(format!("{} has no known port", url))
    })?;

    // IPv6 literals come back bracketed from the url crate
    let host = host.trim_start_matches('[').trim_end_matches(']');

    Ok(Metadata::new(host, port))
}

/// TLS client configuration shared by every tunnel.
pub fn tls_connector() -> Result<TlsConnector, BenchError> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| BenchError::tls(e.to_string()).with_source(e))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run `future`, failing with a timeout error once `deadline` passes.
pub(crate) async fn within<T, E, F>(
    deadline: Instant,
    what: &str,
    future: F,
) -> Result<T, BenchError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<BenchError>,
{
    match timeout_at(deadline, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(BenchError::timeout(format!("{} timed out", what))),
    }
}

/// Issues single `GET` requests through proxy tunnels.
#[derive(Clone)]
pub struct TunnelClient {
    tls: TlsConnector,
}

impl TunnelClient {
    pub fn new(tls: TlsConnector) -> Self {
        Self { tls }
    }

    /// Open a tunnel for `url`, upgrading to TLS for `https`.
    pub(crate) async fn connect(
        &self,
        proxy: &dyn Proxy,
        url: &Url,
        deadline: Instant,
    ) -> Result<Box<dyn Connection>, BenchError> {
        let metadata = metadata_for(url)?;
        debug!("{}: opening tunnel to {}", proxy.name(), metadata);

        let stream = within(deadline, "tunnel", proxy.open_tunnel(&metadata))
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    e
                } else {
                    BenchError::tunnel(format!(
                        "{} could not reach {}: {}",
                        proxy.name(),
                        metadata,
                        e.message
                    ))
                }
            })?;

        match url.scheme() {
            "http" => Ok(stream),
            "https" => {
                let server_name = ServerName::try_from(metadata.host.clone())
                    .map_err(|e| {
                        BenchError::tls(format!(
                            "invalid server name {}: {}",
                            metadata.host, e
                        ))
                    })?;

                let stream = within(
                    deadline,
                    "TLS handshake",
                    self.tls.connect(server_name, stream),
                )
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        e
                    } else {
                        BenchError::tls(e.message)
                    }
                })?;

                Ok(Box::new(stream))
            }
            scheme => Err(BenchError::config(format!(
                "unsupported scheme {}",
                scheme
            ))),
        }
    }

    /// Send a `GET` for `url` through `proxy` and read the response head.
    ///
    /// The response's TTFB is measured from the start of this call, so it
    /// includes opening the tunnel.
    pub(crate) async fn get(
        &self,
        proxy: &dyn Proxy,
        url: &Url,
        user_agent: &str,
        deadline: Instant,
    ) -> Result<Response<Box<dyn Connection>>, BenchError> {
        let started = Instant::now();

        let mut stream = self.connect(proxy, url, deadline).await?;

        within(deadline, "request", send_request(&mut stream, url, user_agent))
            .await?;

        within(deadline, "response", Response::read(stream, started)).await
    }
}
