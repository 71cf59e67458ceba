//! HTTP Transport
//!
//! Thin adapters over the game API and the public-IP lookup service.
//! Each call is a single attempt; retries belong to the adaptive client.

use async_trait::async_trait;
use reqwest::header;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::core::ticket::parse_ipv4;
use crate::network::client::ClientConfig;

/// Default game API root.
pub const DEFAULT_BASE_URL: &str = "https://ggst-game.guiltygear.com/api";

/// Default public-IP lookup endpoint.
pub const DEFAULT_IP_LOOKUP_URL: &str = "https://checkip.amazonaws.com";

/// User agent the game client sends.
pub const USER_AGENT: &str = "GGST/Steam";

/// Transport-level failure. Never retried by the adaptive client.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Request could not be sent or the response could not be read.
    #[error("HTTP request to {endpoint} failed: {reason}")]
    Request {
        /// Endpoint path or URL.
        endpoint: String,
        /// Underlying error message.
        reason: String,
    },
    /// Server answered with a non-success status.
    #[error("HTTP {status} from {endpoint}")]
    Status {
        /// Endpoint path or URL.
        endpoint: String,
        /// Response status code.
        status: u16,
    },
    /// Lookup returned something that is not an IPv4 address.
    #[error("public IP lookup returned {0:?}")]
    BadAddress(String),
}

/// Posts an encrypted envelope and returns the raw response body.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `data=<envelope>` to `endpoint` (relative to the API root).
    async fn post(&self, endpoint: &str, envelope: &str) -> Result<Vec<u8>, TransportError>;
}

/// Resolves this host's public IPv4 address.
#[async_trait]
pub trait PublicIpResolver: Send + Sync {
    /// Look up the current public address.
    async fn public_ip(&self) -> Result<Ipv4Addr, TransportError>;
}

/// Game API transport over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, TransportError> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Request {
                endpoint: base_url.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self::with_client(client, base_url))
    }

    /// Transport for `config.base_url`, timing out after one attempt's deadline.
    pub fn from_config(config: &ClientConfig) -> Result<Self, TransportError> {
        Self::new(config.base_url.as_str(), config.attempt_timeout)
    }

    /// Transport over an already configured HTTP client.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, endpoint: &str, envelope: &str) -> Result<Vec<u8>, TransportError> {
        let url = self.url(endpoint);
        let request_err = |e: reqwest::Error| TransportError::Request {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        };

        debug!("POST {} ({} byte payload)", url, envelope.len());
        let response = self
            .client
            .post(&url)
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::CACHE_CONTROL, "no-store")
            .header("x-client-version", "1")
            .form(&[("data", envelope)])
            .send()
            .await
            .map_err(request_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(request_err)?;
        debug!("{} responded with {} bytes", endpoint, body.len());
        Ok(body.to_vec())
    }
}

/// Public IP lookup against a plain-text echo service.
#[derive(Debug, Clone)]
pub struct HttpIpResolver {
    client: reqwest::Client,
    url: String,
}

impl HttpIpResolver {
    /// Resolver hitting `url`, which must answer with a bare dotted quad.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    /// Resolver for `config.ip_lookup_url`.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.ip_lookup_url.as_str())
    }

    /// Resolver over an already configured HTTP client.
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl Default for HttpIpResolver {
    fn default() -> Self {
        Self::new(DEFAULT_IP_LOOKUP_URL)
    }
}

#[async_trait]
impl PublicIpResolver for HttpIpResolver {
    async fn public_ip(&self) -> Result<Ipv4Addr, TransportError> {
        let request_err = |e: reqwest::Error| TransportError::Request {
            endpoint: self.url.clone(),
            reason: e.to_string(),
        };

        let text = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(request_err)?
            .text()
            .await
            .map_err(request_err)?;

        parse_ipv4(&text).map_err(|_| TransportError::BadAddress(text.trim().to_string()))
    }
}

/// Resolver that always answers with a fixed address.
#[derive(Debug, Clone, Copy)]
pub struct StaticIpResolver(pub Ipv4Addr);

#[async_trait]
impl PublicIpResolver for StaticIpResolver {
    async fn public_ip(&self) -> Result<Ipv4Addr, TransportError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Accept one HTTP/1.1 request, answer with `status` and `body`, and hand
    /// back the raw request text.
    async fn serve_once(status: &'static str, body: &'static [u8]) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];

            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);

                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text[..end]
                        .lines()
                        .filter_map(|line| line.split_once(':'))
                        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                        .map(|(_, value)| value.trim().parse::<usize>().unwrap())
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + content_length {
                        break;
                    }
                }
            }

            let head = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            let _ = socket.shutdown().await;

            String::from_utf8(raw).unwrap()
        });

        (format!("http://{}", addr), handle)
    }

    fn direct_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test]
    async fn test_post_sends_form_and_game_headers() {
        let (root, server) = serve_once("200 OK", &[0x01, 0xAB, 0xFF]).await;
        let transport = HttpTransport::with_client(direct_client(), format!("{}/api/", root));

        let body = transport.post("user/login", "AbC-_09").await.unwrap();
        assert_eq!(body, vec![0x01, 0xAB, 0xFF]);

        let request = server.await.unwrap();
        let (head, form) = request.split_once("\r\n\r\n").unwrap();
        let head = format!("{}\r\n", head.to_ascii_lowercase());
        assert!(head.starts_with("post /api/user/login http/1.1\r\n"), "{head}");
        assert!(head.contains("\r\nuser-agent: ggst/steam\r\n"), "{head}");
        assert!(head.contains("\r\ncache-control: no-store\r\n"), "{head}");
        assert!(head.contains("\r\nx-client-version: 1\r\n"), "{head}");
        assert!(head.contains("\r\ncontent-type: application/x-www-form-urlencoded"), "{head}");
        assert_eq!(form, "data=AbC-_09");
    }

    #[tokio::test]
    async fn test_post_escapes_padding() {
        let (root, server) = serve_once("200 OK", b"").await;
        let transport = HttpTransport::with_client(direct_client(), root);

        transport.post("x", "AAAA==").await.unwrap();
        let request = server.await.unwrap();
        assert!(request.ends_with("\r\n\r\ndata=AAAA%3D%3D"), "{request}");
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (root, server) = serve_once("503 Service Unavailable", b"busy").await;
        let transport = HttpTransport::with_client(direct_client(), root);

        let err = transport.post("user/login", "AAAA").await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Status { ref endpoint, status: 503 } if endpoint == "user/login"
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ip_resolver_reads_bare_address() {
        let (root, server) = serve_once("200 OK", b"203.0.113.7\n").await;
        let resolver = HttpIpResolver::with_client(direct_client(), root);

        assert_eq!(resolver.public_ip().await.unwrap(), Ipv4Addr::new(203, 0, 113, 7));
        assert!(server.await.unwrap().starts_with("GET / HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_ip_resolver_rejects_garbage() {
        let (root, server) = serve_once("200 OK", b"<html>nope</html>").await;
        let resolver = HttpIpResolver::with_client(direct_client(), root);

        let err = resolver.public_ip().await.unwrap_err();
        assert!(matches!(err, TransportError::BadAddress(ref text) if text == "<html>nope</html>"));
        server.await.unwrap();
    }

    #[test]
    fn test_from_config_uses_configured_urls() {
        let config = ClientConfig {
            base_url: "http://127.0.0.1:9/game/".into(),
            ip_lookup_url: "http://127.0.0.1:9/ip".into(),
            ..ClientConfig::default()
        };

        let transport = HttpTransport::from_config(&config).unwrap();
        assert_eq!(transport.url("user/login"), "http://127.0.0.1:9/game/user/login");
        assert_eq!(HttpIpResolver::from_config(&config).url, "http://127.0.0.1:9/ip");
    }

    #[test]
    fn test_url_joining() {
        let t = HttpTransport::new("https://example.test/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(t.url("user/login"), "https://example.test/api/user/login");
        assert_eq!(t.url("/catalog/get_replay"), "https://example.test/api/catalog/get_replay");
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let r = StaticIpResolver(Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(r.public_ip().await.unwrap(), Ipv4Addr::new(1, 2, 3, 4));
    }
}
