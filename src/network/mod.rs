//! Target probes run by the dispatcher before any plugin is admitted
//!
//! - reachability: bare TCP connect to the target's host:port
//! - HTTP baseline: replay of the raw request, response kept on the target
//! - fingerprint: one banner grab per target, gates port-scan plugins

pub mod raw_http;

use crate::targets::Target;
use crate::{ScanError, ScanResult};
use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub use raw_http::RawRequest;

/// Probes the dispatcher runs per target
#[async_trait]
pub trait TargetProbe: Send + Sync {
    /// Fails when the host:port cannot be dialed
    async fn reachable(&self, target: &Target, token: &CancellationToken) -> ScanResult<()>;

    /// Raw response bytes for the target's request
    async fn http_baseline(
        &self,
        target: &Target,
        proxy: Option<&str>,
        token: &CancellationToken,
    ) -> ScanResult<Vec<u8>>;

    /// Service banner, `None` when the service stays silent
    async fn fingerprint(&self, target: &Target) -> ScanResult<Option<String>>;
}

/// Socket and reqwest backed probes
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    connect_timeout: Duration,
    http_timeout: Duration,
    fingerprint_timeout: Duration,
}

impl Default for NetworkProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(10),
            fingerprint_timeout: Duration::from_secs(3),
        }
    }
}

impl NetworkProbe {
    pub fn new(connect_timeout: Duration, http_timeout: Duration, fingerprint_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            http_timeout,
            fingerprint_timeout,
        }
    }

    async fn connect(&self, target: &Target) -> ScanResult<TcpStream> {
        let (host, port) = target.host_port()?;
        match timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ScanError::NetworkError(format!("{}:{} {}", host, port, e))),
            Err(_) => Err(ScanError::NetworkError(format!(
                "{}:{} connect timed out after {:?}",
                host, port, self.connect_timeout
            ))),
        }
    }

    fn client(&self, proxy: Option<&str>) -> ScanResult<reqwest::Client> {
        let builder = reqwest::Client::builder()
            .timeout(self.http_timeout)
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none());
        let builder = match proxy {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy)?),
            None => builder.no_proxy(),
        };
        Ok(builder.build()?)
    }

    async fn grab_banner(stream: &mut TcpStream, is_https: bool) -> Option<String> {
        let mut buffer = vec![0u8; 1024];

        // Services that talk first (ssh, smtp, ftp, redis errors)
        if let Ok(Ok(n)) = timeout(Duration::from_millis(500), stream.read(&mut buffer)).await {
            if n > 0 {
                return Some(first_line(&buffer[..n]));
            }
        }

        if is_https {
            return None;
        }

        // Nudge silent services with a minimal HTTP probe
        if stream.write_all(b"HEAD / HTTP/1.0\r\n\r\n").await.is_err() {
            return None;
        }
        match timeout(Duration::from_millis(1000), stream.read(&mut buffer)).await {
            Ok(Ok(n)) if n > 0 => Some(first_line(&buffer[..n])),
            _ => None,
        }
    }
}

fn first_line(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[async_trait]
impl TargetProbe for NetworkProbe {
    async fn reachable(&self, target: &Target, token: &CancellationToken) -> ScanResult<()> {
        tokio::select! {
            _ = token.cancelled() => Err(ScanError::Cancelled),
            result = self.connect(target) => result.map(drop),
        }
    }

    async fn http_baseline(
        &self,
        target: &Target,
        proxy: Option<&str>,
        token: &CancellationToken,
    ) -> ScanResult<Vec<u8>> {
        let request = RawRequest::parse(&target.request)?;
        let url = request.absolute_url(&target.url)?;
        let client = self.client(proxy)?;

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ScanError::ParseError(format!("bad method {}: {}", request.method, e)))?;
        let mut builder = client.request(method, url);
        for (name, value) in request.forwardable_headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let send = async {
            let response = builder.send().await?;
            raw_http::render_response(response).await
        };
        tokio::select! {
            _ = token.cancelled() => Err(ScanError::Cancelled),
            result = send => result,
        }
    }

    async fn fingerprint(&self, target: &Target) -> ScanResult<Option<String>> {
        let probe = async {
            let mut stream = self.connect(target).await?;
            Ok::<_, ScanError>(Self::grab_banner(&mut stream, target.is_https).await)
        };
        let banner = timeout(self.fingerprint_timeout, probe).await??;
        debug!("Fingerprint {}: {:?}", target.url, banner);
        Ok(banner)
    }
}
