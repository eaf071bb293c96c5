//! Scan targets and the generator contract that produces them

pub mod builder;

use crate::{ScanError, ScanResult};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub use builder::LineTargetGenerator;

/// One scan endpoint with its prepared request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub url: String,
    pub is_https: bool,
    /// Raw HTTP request bytes replayed by the baseline probe
    pub request: Vec<u8>,
    /// Baseline response, set once before the target's plugins run
    #[serde(default)]
    pub response: Vec<u8>,
    /// Injectable template variables
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl Target {
    pub fn new(url: impl Into<String>, is_https: bool, request: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            is_https,
            request,
            response: Vec::new(),
            vars: BTreeMap::new(),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Host and port the reachability probe dials
    pub fn host_port(&self) -> ScanResult<(String, u16)> {
        let url = Url::parse(&self.url)
            .map_err(|e| ScanError::ParseError(format!("invalid target url {}: {}", self.url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| ScanError::ParseError(format!("target url has no host: {}", self.url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if self.is_https { 443 } else { 80 });
        Ok((host, port))
    }
}

/// Raw user input a target generator expands
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInput {
    /// Newline or comma separated URLs / host[:port] entries
    #[serde(default)]
    pub raw: String,
    /// Files with one target per line
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Raw request template with `{{method}}`, `{{path}}`, `{{host}}` placeholders
    #[serde(default)]
    pub request_template: Option<String>,
}

impl TargetInput {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.trim().is_empty() && self.files.is_empty()
    }
}

/// Produces the finite target list for a scan.
///
/// Errors surface as a single top-level error, never per item.
pub trait TargetGenerator: Send + Sync {
    fn generate(&self, input: &TargetInput) -> ScanResult<Vec<Target>>;
}

/// Serialize a target list for the task record
pub fn encode_targets(targets: &[Target]) -> ScanResult<String> {
    Ok(serde_json::to_string(targets)?)
}

/// Decode a target list persisted by [`encode_targets`]
pub fn decode_targets(raw: &str) -> ScanResult<Vec<Target>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}
