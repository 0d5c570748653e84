//! Remote unlock policy list
//!
//! The policy list is a plain text document with one `hostname,flag[,...]`
//! record per line. A host may only be unlocked when some line names it
//! with a truthy flag (`yes`, `1`, `true`).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{HOST, USER_AGENT};
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::is_truthy;
use crate::error::{Result, UnlockError};

/// Outcome of evaluating a policy list for one host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Allowed by the (1-based) line number
    Allowed { line: usize },
    Denied,
}

/// One well-formed record of the policy list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyEntry<'a> {
    pub host: &'a str,
    pub allowed: bool,
}

/// Parse a policy line; `None` when it has fewer than two fields
///
/// Fields beyond the second are ignored.
pub fn parse_line(line: &str) -> Option<PolicyEntry<'_>> {
    let mut fields = line.split(',');
    let host = fields.next()?.trim();
    let flag = fields.next()?;
    Some(PolicyEntry {
        host,
        allowed: is_truthy(flag),
    })
}

/// Decide whether `host` may be unlocked according to `body`
///
/// Scanning stops at the first line that names the host with a truthy flag.
/// Blank lines are ignored, other malformed lines are logged and skipped.
pub fn evaluate_policy(body: &str, host: &str) -> PolicyDecision {
    for (idx, line) in body.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }

        let Some(entry) = parse_line(line) else {
            warn!(
                "Skipping malformed policy line {}: expected 'hostname,flag'",
                line_no
            );
            continue;
        };

        if entry.host == host && entry.allowed {
            debug!("Policy line {} allows {}", line_no, host);
            return PolicyDecision::Allowed { line: line_no };
        }
    }

    PolicyDecision::Denied
}

/// A parsed `http://` or `https://` policy list location
#[derive(Debug, Clone)]
pub struct PolicyEndpoint {
    uri: Uri,
    host: String,
    port: u16,
    tls: bool,
}

impl PolicyEndpoint {
    /// Parse and validate a policy URL
    pub fn parse(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| UnlockError::config(format!("Invalid policy URL {:?}: {}", url, e)))?;

        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(other) => {
                return Err(UnlockError::config(format!(
                    "Unsupported policy URL scheme '{}' (use http or https)",
                    other
                )));
            }
            None => {
                return Err(UnlockError::config(format!(
                    "Policy URL {:?} has no scheme",
                    url
                )));
            }
        };

        let host = uri
            .host()
            .ok_or_else(|| UnlockError::config(format!("Policy URL {:?} has no host", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

        Ok(Self {
            uri,
            host,
            port,
            tls,
        })
    }

    fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    fn authority(&self) -> &str {
        self.uri.authority().map(|a| a.as_str()).unwrap_or(&self.host)
    }

    /// Issue the GET request and return the body of a 2xx response
    async fn get(&self) -> Result<String> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                UnlockError::policy_fetch(format!(
                    "connect to {}:{} failed: {}",
                    self.host, self.port, e
                ))
            })?;

        if !self.tls {
            return self.request(stream).await;
        }

        let server_name = ServerName::try_from(self.host.clone()).map_err(|e| {
            UnlockError::policy_fetch(format!("invalid TLS server name {}: {}", self.host, e))
        })?;
        let stream = tls_connector()?
            .connect(server_name, stream)
            .await
            .map_err(|e| UnlockError::policy_fetch(format!("TLS handshake failed: {}", e)))?;

        self.request(stream).await
    }

    /// Send the GET over an established (plain or TLS) stream
    async fn request<S>(&self, stream: S) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| UnlockError::policy_fetch(format!("HTTP handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Policy connection error: {}", e);
            }
        });

        let req = Request::builder()
            .method(Method::GET)
            .uri(self.path_and_query())
            .header(HOST, self.authority())
            .header(USER_AGENT, concat!("ssh-unlock-luks/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())
            .map_err(|e| UnlockError::policy_fetch(format!("failed to build request: {}", e)))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| UnlockError::policy_fetch(format!("request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UnlockError::policy_fetch(format!("HTTP status {}", status)));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| UnlockError::policy_fetch(format!("failed to read response: {}", e)))?
            .to_bytes();

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// TLS client trusting the bundled web PKI roots
fn tls_connector() -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| UnlockError::policy_fetch(format!("TLS setup failed: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Fetch the policy list body
pub async fn fetch_policy(url: &str, limit: Duration) -> Result<String> {
    let endpoint = PolicyEndpoint::parse(url)?;
    debug!("Fetching policy list from {}", url);

    timeout(limit, endpoint.get()).await.map_err(|_| {
        UnlockError::policy_fetch(format!("no response within {}s", limit.as_secs()))
    })?
}

/// Fetch the policy list and require an enabling entry for `host`
pub async fn check_policy(url: &str, host: &str, limit: Duration) -> Result<()> {
    let body = fetch_policy(url, limit).await?;

    match evaluate_policy(&body, host) {
        PolicyDecision::Allowed { line } => {
            info!("Policy list allows unlocking {} (line {})", host, line);
            Ok(())
        }
        PolicyDecision::Denied => Err(UnlockError::PolicyDenied {
            host: host.to_string(),
        }),
    }
}
