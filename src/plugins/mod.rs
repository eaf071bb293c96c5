//! Plugin descriptors, catalog contract and the per-scan plugin cache
//!
//! A scan materializes its plugin set exactly once. Every target then gets a
//! fresh cursor over the same immutable sequence, so the catalog is never
//! re-queried mid-scan and every target sees identical plugins.

pub mod catalog;
pub mod executor;

use crate::{ScanError, ScanResult};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

pub use catalog::InMemoryCatalog;
pub use executor::{PluginExecutor, ProcessExecutor};

/// Plugin class, governs the dispatcher's admission gates
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PluginKind {
    /// Mirrored traffic plugin, needs a known-good baseline response
    Mitm,
    /// Waits for the target's one-shot fingerprint probe
    PortScan,
    Yak,
    Nuclei,
    Other(String),
}

impl PluginKind {
    pub fn as_str(&self) -> &str {
        match self {
            PluginKind::Mitm => "mitm",
            PluginKind::PortScan => "port-scan",
            PluginKind::Yak => "yak",
            PluginKind::Nuclei => "nuclei",
            PluginKind::Other(name) => name,
        }
    }
}

impl From<String> for PluginKind {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "mitm" => PluginKind::Mitm,
            "port-scan" | "port_scan" | "portscan" => PluginKind::PortScan,
            "yak" => PluginKind::Yak,
            "nuclei" => PluginKind::Nuclei,
            _ => PluginKind::Other(value),
        }
    }
}

impl From<&str> for PluginKind {
    fn from(value: &str) -> Self {
        PluginKind::from(value.to_string())
    }
}

impl From<PluginKind> for String {
    fn from(kind: PluginKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only plugin metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique within a scan
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PluginKind,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Executable used by [`ProcessExecutor`]
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, kind: impl Into<PluginKind>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            tags: Vec::new(),
            command: None,
            args: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_command(mut self, command: impl Into<String>, args: &[&str]) -> Self {
        self.command = Some(command.into());
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// Catalog filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginFilter {
    #[serde(default)]
    pub kinds: Vec<PluginKind>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub keyword: Option<String>,
}

impl PluginFilter {
    pub fn matches(&self, plugin: &PluginDescriptor) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&plugin.kind) {
            return false;
        }
        if !self.tags.is_empty()
            && !self
                .tags
                .iter()
                .any(|tag| plugin.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
        {
            return false;
        }
        match &self.keyword {
            Some(keyword) => plugin
                .name
                .to_lowercase()
                .contains(&keyword.to_lowercase()),
            None => true,
        }
    }
}

/// Plugin selection for a scan: explicit names and/or a catalog filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub filter: Option<PluginFilter>,
}

impl PluginConfig {
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            names: names.iter().map(|n| n.as_ref().to_string()).collect(),
            filter: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.filter.is_none()
    }
}

/// Plugin catalog lookups, injected instead of a process-wide registry
pub trait PluginCatalog: Send + Sync {
    fn lookup(&self, name: &str) -> Option<PluginDescriptor>;

    /// Catalog order is preserved
    fn query(&self, filter: &PluginFilter) -> ScanResult<Vec<PluginDescriptor>>;
}

/// Immutable, ordered plugin sequence materialized once per scan
#[derive(Debug, Clone)]
pub struct PluginSet {
    plugins: Arc<[Arc<PluginDescriptor>]>,
}

impl PluginSet {
    /// Query the catalog once: explicit names first, then filter matches
    pub fn materialize(catalog: &dyn PluginCatalog, config: &PluginConfig) -> ScanResult<Self> {
        if config.is_empty() {
            return Err(ScanError::ConfigError("no plugin names or filter given".to_string()));
        }

        let mut seen = HashSet::new();
        let mut plugins = Vec::new();

        for name in &config.names {
            let plugin = catalog
                .lookup(name)
                .ok_or_else(|| ScanError::ConfigError(format!("unknown plugin: {}", name)))?;
            if seen.insert(plugin.name.clone()) {
                plugins.push(plugin);
            }
        }

        if let Some(filter) = &config.filter {
            for plugin in catalog.query(filter)? {
                if seen.insert(plugin.name.clone()) {
                    plugins.push(plugin);
                }
            }
        }

        if plugins.is_empty() {
            return Err(ScanError::NoPlugins);
        }

        info!("Materialized {} plugins", plugins.len());
        debug!("Plugins: {:?}", plugins.iter().map(|p| &p.name).collect::<Vec<_>>());
        Ok(Self::from_descriptors(plugins))
    }

    /// Rebuild a persisted set by name, keeping the persisted order
    pub fn restore(catalog: &dyn PluginCatalog, names: &[String]) -> ScanResult<Self> {
        let mut plugins = Vec::with_capacity(names.len());
        for name in names {
            let plugin = catalog.lookup(name).ok_or_else(|| {
                ScanError::ConfigError(format!("plugin {} is no longer in the catalog", name))
            })?;
            plugins.push(plugin);
        }
        if plugins.is_empty() {
            return Err(ScanError::NoPlugins);
        }
        Ok(Self::from_descriptors(plugins))
    }

    pub fn from_descriptors(plugins: Vec<PluginDescriptor>) -> Self {
        Self {
            plugins: plugins.into_iter().map(Arc::new).collect(),
        }
    }

    /// Fresh cursor from the start of the sequence
    pub fn cursor(&self) -> PluginCursor {
        PluginCursor {
            plugins: Arc::clone(&self.plugins),
            position: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name.clone()).collect()
    }
}

/// Restartable finite iterator over a [`PluginSet`]
#[derive(Debug, Clone)]
pub struct PluginCursor {
    plugins: Arc<[Arc<PluginDescriptor>]>,
    position: usize,
}

impl Iterator for PluginCursor {
    type Item = Arc<PluginDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        let plugin = self.plugins.get(self.position)?;
        self.position += 1;
        Some(Arc::clone(plugin))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.plugins.len() - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PluginCursor {}

/// Serialize plugin names for the task record
pub fn encode_plugin_names(names: &[String]) -> ScanResult<String> {
    Ok(serde_json::to_string(names)?)
}

pub fn decode_plugin_names(raw: &str) -> ScanResult<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}
