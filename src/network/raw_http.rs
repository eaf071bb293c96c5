//! Raw HTTP request parsing and response rendering

use crate::{ScanError, ScanResult};
use reqwest::Url;

/// Headers reqwest computes itself
const SKIPPED_HEADERS: &[&str] = &["host", "content-length", "connection", "transfer-encoding"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawRequest {
    pub fn parse(raw: &[u8]) -> ScanResult<Self> {
        let (head, body) = split_head(raw);
        let head = String::from_utf8_lossy(head);
        let mut lines = head.lines();

        let request_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| ScanError::ParseError("empty raw request".to_string()))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| ScanError::ParseError("missing method".to_string()))?
            .to_string();
        let path = parts.next().unwrap_or("/").to_string();

        let headers = lines
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        Ok(Self {
            method,
            path,
            headers,
            body: body.to_vec(),
        })
    }

    /// Resolve the request path against the target URL
    pub fn absolute_url(&self, base: &str) -> ScanResult<Url> {
        if self.path.starts_with("http://") || self.path.starts_with("https://") {
            return Url::parse(&self.path)
                .map_err(|e| ScanError::ParseError(format!("invalid request uri {}: {}", self.path, e)));
        }
        let base = Url::parse(base)
            .map_err(|e| ScanError::ParseError(format!("invalid target url {}: {}", base, e)))?;
        base.join(&self.path)
            .map_err(|e| ScanError::ParseError(format!("invalid request path {}: {}", self.path, e)))
    }

    pub fn forwardable_headers(&self) -> impl Iterator<Item = &(String, String)> {
        self.headers
            .iter()
            .filter(|(name, _)| !SKIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
    }
}

fn split_head(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(raw, b"\r\n\r\n") {
        return (&raw[..pos], &raw[pos + 4..]);
    }
    if let Some(pos) = find(raw, b"\n\n") {
        return (&raw[..pos], &raw[pos + 2..]);
    }
    (raw, &[])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Render a received response back to raw bytes
pub async fn render_response(response: reqwest::Response) -> ScanResult<Vec<u8>> {
    let status = response.status();
    let mut raw = format!(
        "{:?} {} {}\r\n",
        response.version(),
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();

    for (name, value) in response.headers() {
        raw.extend_from_slice(name.as_str().as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(&response.bytes().await?);
    Ok(raw)
}
