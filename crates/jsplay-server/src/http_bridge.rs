//! Host-side `fetch` backed by reqwest.

use std::collections::BTreeMap;
use std::time::Duration;

use jsplay_error::BridgeError;
use jsplay_sandbox::{HttpBridge, HttpRequest, HttpResponse};
use reqwest::redirect::Policy;
use reqwest::Method;
use url::Url;

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// Settings for [`ReqwestHttpBridge`].
#[derive(Debug, Clone)]
pub struct HttpBridgeConfig {
    /// Whole-request timeout.
    pub timeout: Duration,
    /// Largest response body accepted, in bytes.
    pub max_body_bytes: usize,
    /// `User-Agent` sent when the script sets none.
    pub user_agent: String,
    /// Hosts that may be contacted (subdomains included). Empty allows all.
    pub allowed_hosts: Vec<String>,
}

impl Default for HttpBridgeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_body_bytes: 5 * 1024 * 1024,
            user_agent: concat!("jsplay/", env!("CARGO_PKG_VERSION")).to_string(),
            allowed_hosts: Vec::new(),
        }
    }
}

/// [`HttpBridge`] over a shared reqwest client.
pub struct ReqwestHttpBridge {
    client: reqwest::Client,
    config: HttpBridgeConfig,
}

impl ReqwestHttpBridge {
    /// Build the client. Every redirect hop is held to the same scheme and
    /// host rules as the first URL.
    pub fn new(config: HttpBridgeConfig) -> Result<Self, BridgeError> {
        let allowed_hosts = config.allowed_hosts.clone();
        let redirects = Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error(format!("more than {MAX_REDIRECTS} redirects"));
            }
            let verdict = check_target(&allowed_hosts, attempt.url());
            match verdict {
                Ok(()) => attempt.follow(),
                Err(reason) => attempt.error(format!("redirect refused: {reason}")),
            }
        });
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .redirect(redirects)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;
        Ok(Self { client, config })
    }

    /// Parse `raw` and check it against the scheme and host rules.
    fn check_url(&self, raw: &str) -> Result<Url, BridgeError> {
        let refuse = |message: String| BridgeError::Http {
            url: raw.to_string(),
            message,
        };
        let url = Url::parse(raw).map_err(|e| refuse(format!("invalid URL: {e}")))?;
        check_target(&self.config.allowed_hosts, &url).map_err(refuse)?;
        Ok(url)
    }
}

/// Scheme and host rules for any URL the bridge contacts.
fn check_target(allowed_hosts: &[String], url: &Url) -> Result<(), String> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!(
            "unsupported scheme '{}' (only http and https)",
            url.scheme()
        ));
    }
    let host = url
        .host_str()
        .ok_or_else(|| "URL has no host".to_string())?
        .to_ascii_lowercase();
    if !allowed_hosts.is_empty() && !host_allowed(allowed_hosts, &host) {
        return Err(format!("host '{host}' is not in the allowed list"));
    }
    Ok(())
}

fn host_allowed(allowed_hosts: &[String], host: &str) -> bool {
    allowed_hosts.iter().any(|allowed| {
        let allowed = allowed.to_ascii_lowercase();
        host == allowed || host.ends_with(&format!(".{allowed}"))
    })
}

/// A reqwest error with its causes, so a refused redirect says why.
fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[async_trait::async_trait]
impl HttpBridge for ReqwestHttpBridge {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError> {
        let url = self.check_url(&request.url)?;
        let failed = |message: String| BridgeError::Http {
            url: request.url.clone(),
            message,
        };

        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| failed(format!("invalid method '{}'", request.method)))?;
        tracing::debug!(url = %url, method = %method, "fetch: sending");

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        let mut response = builder.send().await.map_err(|e| failed(error_chain(&e)))?;

        let max = self.config.max_body_bytes;
        if response.content_length().is_some_and(|len| len > max as u64) {
            return Err(failed(format!("response body exceeds {max} bytes")));
        }

        let status = response.status();
        let final_url = response.url().to_string();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| failed(e.to_string()))? {
            if body.len() + chunk.len() > max {
                return Err(failed(format!("response body exceeds {max} bytes")));
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(url = %final_url, status = status.as_u16(), body_len = body.len(), "fetch: complete");
        Ok(HttpResponse {
            data: String::from_utf8_lossy(&body).into_owned(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            url: final_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request(url: &str) -> HttpRequest {
        HttpRequest {
            url: url.into(),
            method: "GET".into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Serve one canned HTTP response on a local port.
    async fn serve_once(body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Test: yes\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}/data")
    }

    /// Answer one request with a 302 to `location`.
    async fn redirect_once(location: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let reply = format!(
                "HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}/start")
    }

    #[tokio::test]
    async fn redirects_to_disallowed_hosts_are_refused() {
        let url = redirect_once("http://localhost:9/secret".into()).await;
        let bridge = ReqwestHttpBridge::new(HttpBridgeConfig {
            allowed_hosts: vec!["127.0.0.1".into()],
            ..Default::default()
        })
        .unwrap();

        let err = bridge.fetch(request(&url)).await.unwrap_err();
        assert_eq!(err.code(), "HTTP_ERROR");
        assert!(
            err.to_string().contains("host 'localhost' is not in the allowed list"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn redirects_to_other_schemes_are_refused() {
        let url = redirect_once("file:///etc/passwd".into()).await;
        let bridge = ReqwestHttpBridge::new(HttpBridgeConfig::default()).unwrap();
        let err = bridge.fetch(request(&url)).await.unwrap_err();
        assert_eq!(err.code(), "HTTP_ERROR");
    }

    #[tokio::test]
    async fn redirects_within_allowed_hosts_are_followed() {
        let target = serve_once("landed".into()).await;
        let url = redirect_once(target.clone()).await;
        let bridge = ReqwestHttpBridge::new(HttpBridgeConfig {
            allowed_hosts: vec!["127.0.0.1".into()],
            ..Default::default()
        })
        .unwrap();

        let resp = bridge.fetch(request(&url)).await.unwrap();
        assert_eq!(resp.data, "landed");
        assert_eq!(resp.url, target);
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let bridge = ReqwestHttpBridge::new(HttpBridgeConfig::default()).unwrap();
        for url in ["file:///etc/passwd", "ftp://example.com/x", "not a url"] {
            let err = bridge.fetch(request(url)).await.unwrap_err();
            assert_eq!(err.code(), "HTTP_ERROR", "{url}");
        }
    }

    #[tokio::test]
    async fn enforces_allowed_hosts() {
        let bridge = ReqwestHttpBridge::new(HttpBridgeConfig {
            allowed_hosts: vec!["example.com".into()],
            ..Default::default()
        })
        .unwrap();
        assert!(bridge.check_url("https://api.example.com/v1").is_ok());
        assert!(bridge.check_url("https://EXAMPLE.com/").is_ok());
        let err = bridge.check_url("https://evil-example.com/").unwrap_err();
        assert!(err.to_string().contains("not in the allowed list"), "{err}");
    }

    #[tokio::test]
    async fn fetches_from_local_server() {
        let url = serve_once("hello".into()).await;
        let bridge = ReqwestHttpBridge::new(HttpBridgeConfig::default()).unwrap();

        let resp = bridge.fetch(request(&url)).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.status_text, "OK");
        assert_eq!(resp.data, "hello");
        assert_eq!(resp.headers["x-test"], "yes");
        assert_eq!(resp.url, url);
    }

    #[tokio::test]
    async fn caps_response_body() {
        let url = serve_once("x".repeat(2048)).await;
        let bridge = ReqwestHttpBridge::new(HttpBridgeConfig {
            max_body_bytes: 1024,
            ..Default::default()
        })
        .unwrap();

        let err = bridge.fetch(request(&url)).await.unwrap_err();
        assert!(err.to_string().contains("exceeds 1024 bytes"), "{err}");
    }

    #[tokio::test]
    async fn rejects_invalid_method() {
        let bridge = ReqwestHttpBridge::new(HttpBridgeConfig::default()).unwrap();
        let mut req = request("https://example.com/");
        req.method = "GE T".into();
        let err = bridge.fetch(req).await.unwrap_err();
        assert!(err.to_string().contains("invalid method"), "{err}");
    }
}
