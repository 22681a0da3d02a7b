//! Test double for [`Proxy`]: every tunnel is an in-memory duplex pipe with
//! a tiny HTTP server on the far end.

use crate::proxy::{Connection, Metadata, Proxy, ProxyType};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// What the far end of a mock tunnel answers.
#[derive(Debug, Clone)]
pub(crate) struct MockResponse {
    status: u16,
    body: Vec<u8>,
    delay: Duration,
    stall_after: Option<usize>,
    hang_up: bool,
}

impl MockResponse {
    pub(crate) fn status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: Duration::ZERO,
            stall_after: None,
            hang_up: false,
        }
    }

    pub(crate) fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::status(200, body)
    }

    /// A 200 response carrying `len` filler bytes.
    pub(crate) fn bytes(len: usize) -> Self {
        Self::ok(vec![b'0'; len])
    }

    /// Close the connection without answering.
    pub(crate) fn hang_up() -> Self {
        Self { hang_up: true, ..Self::ok(Vec::new()) }
    }

    /// Wait before sending the response head.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Send only the first `sent` body bytes, then keep the connection open
    /// without sending anything else.
    pub(crate) fn stall_after(mut self, sent: usize) -> Self {
        self.stall_after = Some(sent);
        self
    }
}

type Handler = dyn Fn(&Metadata, &str) -> MockResponse + Send + Sync;

/// A proxy whose tunnels are served by `handler`.
pub(crate) struct MockProxy {
    name: String,
    proxy_type: ProxyType,
    handler: Option<Arc<Handler>>,
    tunnels: AtomicUsize,
    requests: Arc<Mutex<Vec<String>>>,
    user_agents: Arc<Mutex<Vec<String>>>,
}

impl MockProxy {
    pub(crate) fn new<F>(name: &str, handler: F) -> Self
    where
        F: Fn(&Metadata, &str) -> MockResponse + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            proxy_type: ProxyType::Shadowsocks,
            handler: Some(Arc::new(handler)),
            tunnels: AtomicUsize::new(0),
            requests: Arc::default(),
            user_agents: Arc::default(),
        }
    }

    /// A proxy whose tunnels always fail to open.
    pub(crate) fn unreachable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            proxy_type: ProxyType::Shadowsocks,
            handler: None,
            tunnels: AtomicUsize::new(0),
            requests: Arc::default(),
            user_agents: Arc::default(),
        }
    }

    pub(crate) fn with_type(mut self, proxy_type: ProxyType) -> Self {
        self.proxy_type = proxy_type;
        self
    }

    /// Number of tunnels requested so far, successful or not.
    pub(crate) fn tunnel_count(&self) -> usize {
        self.tunnels.load(Ordering::SeqCst)
    }

    /// Requests served so far as `host:port/target`, in arrival order.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose target starts with `prefix`.
    pub(crate) fn requests_matching(&self, prefix: &str) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|request| request.contains(prefix))
            .collect()
    }

    pub(crate) fn user_agents(&self) -> Vec<String> {
        self.user_agents.lock().unwrap().clone()
    }
}

#[async_trait]
impl Proxy for MockProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        self.proxy_type
    }

    async fn open_tunnel(
        &self,
        metadata: &Metadata,
    ) -> io::Result<Box<dyn Connection>> {
        self.tunnels.fetch_add(1, Ordering::SeqCst);

        let Some(handler) = self.handler.clone() else {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        };

        let (client, server) = tokio::io::duplex(64 * 1024);
        let metadata = metadata.clone();
        let requests = Arc::clone(&self.requests);
        let user_agents = Arc::clone(&self.user_agents);

        tokio::spawn(async move {
            let mut reader = BufReader::new(server);

            let mut request_line = String::new();
            if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                return;
            }
            let target = request_line
                .split_whitespace()
                .nth(1)
                .unwrap_or("/")
                .to_string();

            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                if line.trim().is_empty() {
                    break;
                }
                if let Some(agent) = line.strip_prefix("User-Agent:") {
                    user_agents.lock().unwrap().push(agent.trim().to_string());
                }
            }

            requests.lock().unwrap().push(format!("{}{}", metadata, target));

            let response = handler(&metadata, &target);
            if !response.delay.is_zero() {
                tokio::time::sleep(response.delay).await;
            }
            if response.hang_up {
                return;
            }

            let mut stream = reader.into_inner();
            let head = format!(
                "HTTP/1.1 {} Mock\r\nContent-Length: {}\r\n\r\n",
                response.status,
                response.body.len()
            );
            if stream.write_all(head.as_bytes()).await.is_err() {
                return;
            }

            match response.stall_after {
                Some(sent) => {
                    let sent = sent.min(response.body.len());
                    let _ = stream.write_all(&response.body[..sent]).await;
                    let _ = stream.flush().await;
                    std::future::pending::<()>().await;
                }
                None => {
                    let _ = stream.write_all(&response.body).await;
                    let _ = stream.shutdown().await;
                }
            }
        });

        Ok(Box::new(client))
    }
}
