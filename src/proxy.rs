//! The tunnel capability the benchmark drives traffic through.
//!
//! Proxy protocols live outside this crate. An adapter only has to implement
//! [`Proxy`]: given a destination, hand back a byte stream that reaches it
//! through the proxy.

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream opened through a proxy.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Proxy kinds an adapter may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyType {
    #[serde(rename = "direct")]
    Direct,
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "socks5")]
    Socks5,
    #[serde(rename = "ss")]
    Shadowsocks,
    #[serde(rename = "ssr")]
    ShadowsocksR,
    #[serde(rename = "snell")]
    Snell,
    #[serde(rename = "vmess")]
    Vmess,
    #[serde(rename = "vless")]
    Vless,
    #[serde(rename = "trojan")]
    Trojan,
    #[serde(rename = "hysteria")]
    Hysteria,
    #[serde(rename = "hysteria2")]
    Hysteria2,
    #[serde(rename = "wireguard")]
    WireGuard,
    #[serde(rename = "tuic")]
    Tuic,
    #[serde(rename = "reject")]
    Reject,
    #[serde(rename = "relay")]
    Relay,
    #[serde(rename = "select")]
    Selector,
    #[serde(rename = "fallback")]
    Fallback,
    #[serde(rename = "url-test")]
    UrlTest,
    #[serde(rename = "load-balance")]
    LoadBalance,
}

impl ProxyType {
    /// Whether traffic can be pushed through this kind of proxy. Policy
    /// groups and `reject` do not egress on their own.
    pub fn is_benchmarkable(&self) -> bool {
        !matches!(
            self,
            ProxyType::Reject
                | ProxyType::Relay
                | ProxyType::Selector
                | ProxyType::Fallback
                | ProxyType::UrlTest
                | ProxyType::LoadBalance
        )
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyType::Direct => "direct",
            ProxyType::Http => "http",
            ProxyType::Socks5 => "socks5",
            ProxyType::Shadowsocks => "ss",
            ProxyType::ShadowsocksR => "ssr",
            ProxyType::Snell => "snell",
            ProxyType::Vmess => "vmess",
            ProxyType::Vless => "vless",
            ProxyType::Trojan => "trojan",
            ProxyType::Hysteria => "hysteria",
            ProxyType::Hysteria2 => "hysteria2",
            ProxyType::WireGuard => "wireguard",
            ProxyType::Tuic => "tuic",
            ProxyType::Reject => "reject",
            ProxyType::Relay => "relay",
            ProxyType::Selector => "select",
            ProxyType::Fallback => "fallback",
            ProxyType::UrlTest => "url-test",
            ProxyType::LoadBalance => "load-balance",
        };
        write!(f, "{}", name)
    }
}

/// Destination of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    pub host: String,
    pub port: u16,
}

impl Metadata {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An outbound proxy as seen by the benchmark.
#[async_trait]
pub trait Proxy: Send + Sync {
    fn name(&self) -> &str;

    fn proxy_type(&self) -> ProxyType;

    /// Open a connection to `metadata` through this proxy.
    async fn open_tunnel(
        &self,
        metadata: &Metadata,
    ) -> io::Result<Box<dyn Connection>>;
}

/// Dials destinations straight from this host.
///
/// Useful as a baseline next to real proxies.
pub struct DirectProxy {
    name: String,
    resolver: TokioAsyncResolver,
}

impl DirectProxy {
    pub fn new(name: impl Into<String>) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .unwrap_or_else(|_| {
                TokioAsyncResolver::tokio(
                    ResolverConfig::default(),
                    ResolverOpts::default(),
                )
            });

        Self { name: name.into(), resolver }
    }

    /// Resolve `host`, preferring IPv4 addresses.
    async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let response = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;

        let addresses: Vec<IpAddr> = response.iter().collect();

        addresses
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addresses.first())
            .copied()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {}", host),
                )
            })
    }
}

impl Default for DirectProxy {
    fn default() -> Self {
        Self::new("DIRECT")
    }
}

#[async_trait]
impl Proxy for DirectProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Direct
    }

    async fn open_tunnel(
        &self,
        metadata: &Metadata,
    ) -> io::Result<Box<dyn Connection>> {
        let address = self.resolve(&metadata.host).await?;
        debug!("{}: dialing {} ({})", self.name, metadata, address);

        let stream = TcpStream::connect((address, metadata.port)).await?;
        stream.set_nodelay(true)?;

        Ok(Box::new(stream))
    }
}
