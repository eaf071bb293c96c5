//! Line oriented target generator
//!
//! Reads targets from raw text and plain text files:
//! - one entry per line (commas also separate entries)
//! - `#` starts a comment line
//! - full `http(s)://` URLs or bare `host[:port]`

use super::{Target, TargetGenerator, TargetInput};
use crate::{ScanError, ScanResult};
use log::{debug, warn};
use reqwest::Url;
use std::collections::HashSet;
use std::fs;

const DEFAULT_REQUEST_TEMPLATE: &str = "{{method}} {{path}} HTTP/1.1\r\n\
Host: {{host}}\r\n\
User-Agent: hybridscan/0.3\r\n\
Accept: */*\r\n\
Connection: close\r\n\r\n";

/// Expands [`TargetInput`] into targets, one per distinct entry
pub struct LineTargetGenerator {
    max_targets: usize,
    method: String,
}

impl Default for LineTargetGenerator {
    fn default() -> Self {
        Self {
            max_targets: 10_000,
            method: "GET".to_string(),
        }
    }
}

impl LineTargetGenerator {
    pub fn new(max_targets: usize) -> Self {
        Self {
            max_targets,
            ..Default::default()
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    fn collect_entries(&self, input: &TargetInput) -> ScanResult<Vec<String>> {
        let mut entries = Vec::new();
        Self::push_entries(&input.raw, &mut entries);

        for path in &input.files {
            let content = fs::read_to_string(path).map_err(|e| {
                ScanError::TargetGeneration(format!("failed to read {}: {}", path.display(), e))
            })?;
            debug!("Read target file {} ({} bytes)", path.display(), content.len());
            Self::push_entries(&content, &mut entries);
        }

        Ok(entries)
    }

    fn push_entries(content: &str, entries: &mut Vec<String>) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            entries.extend(
                line.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }
    }

    /// Normalize one entry into a URL
    fn parse_entry(entry: &str) -> ScanResult<Url> {
        let candidate = if entry.contains("://") {
            entry.to_string()
        } else {
            let scheme = if entry.ends_with(":443") { "https" } else { "http" };
            format!("{}://{}/", scheme, entry)
        };

        let url = Url::parse(&candidate)
            .map_err(|e| ScanError::TargetGeneration(format!("invalid target {}: {}", entry, e)))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ScanError::TargetGeneration(format!(
                    "unsupported scheme {} in {}",
                    other, entry
                )))
            }
        }
        if url.host_str().is_none() {
            return Err(ScanError::TargetGeneration(format!("target without host: {}", entry)));
        }
        Ok(url)
    }

    fn render_request(&self, template: &str, url: &Url) -> Vec<u8> {
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        let host = Self::host_header(url);

        let rendered = template
            .replace("{{method}}", &self.method)
            .replace("{{path}}", &path)
            .replace("{{host}}", &host);

        if rendered.contains("\r\n") {
            rendered.into_bytes()
        } else {
            rendered.replace('\n', "\r\n").into_bytes()
        }
    }

    fn host_header(url: &Url) -> String {
        let host = url.host_str().unwrap_or_default();
        match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }
}

impl TargetGenerator for LineTargetGenerator {
    fn generate(&self, input: &TargetInput) -> ScanResult<Vec<Target>> {
        let entries = self.collect_entries(input)?;
        let template = input
            .request_template
            .as_deref()
            .unwrap_or(DEFAULT_REQUEST_TEMPLATE);

        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for entry in entries {
            let url = Self::parse_entry(&entry)?;
            if !seen.insert(url.to_string()) {
                debug!("Skipping duplicate target {}", url);
                continue;
            }
            if targets.len() >= self.max_targets {
                warn!("Target limit of {} reached", self.max_targets);
                return Err(ScanError::TargetGeneration(format!(
                    "more than {} targets supplied",
                    self.max_targets
                )));
            }

            let is_https = url.scheme() == "https";
            let port = url.port_or_known_default().unwrap_or(80);
            let request = self.render_request(template, &url);
            let target = Target::new(url.to_string(), is_https, request)
                .with_var("url", url.to_string())
                .with_var("scheme", url.scheme())
                .with_var("host", url.host_str().unwrap_or_default())
                .with_var("port", port.to_string())
                .with_var("path", url.path());
            targets.push(target);
        }

        if targets.is_empty() {
            return Err(ScanError::TargetGeneration("no targets in input".to_string()));
        }

        Ok(targets)
    }
}
