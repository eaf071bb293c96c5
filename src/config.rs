//! Configuration module for the hybrid scanner

use crate::plugins::PluginConfig;
use crate::targets::TargetInput;
use crate::ScanError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONCURRENCY: usize = 20;
pub const DEFAULT_TOTAL_TIMEOUT_SECS: u64 = 72_000;

/// Original scan request, persisted with the task record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Target input handed to the target generator
    #[serde(default)]
    pub targets: TargetInput,

    /// Explicit plugin names and/or catalog filter
    #[serde(default)]
    pub plugins: PluginConfig,

    /// Maximum concurrently executing plugin workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Deadline for the whole scan in seconds
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,

    /// Proxy passed to probes and plugins
    #[serde(default)]
    pub proxy: Option<String>,

    /// Where the scan was started from
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_total_timeout() -> u64 {
    DEFAULT_TOTAL_TIMEOUT_SECS
}

fn default_source() -> String {
    "cli".to_string()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            targets: TargetInput::default(),
            plugins: PluginConfig::default(),
            concurrency: DEFAULT_CONCURRENCY,
            total_timeout_secs: DEFAULT_TOTAL_TIMEOUT_SECS,
            proxy: None,
            source: default_source(),
        }
    }
}

impl ScanConfig {
    pub fn new(targets: TargetInput, plugins: PluginConfig) -> Self {
        Self {
            targets,
            plugins,
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_total_timeout(mut self, seconds: u64) -> Self {
        self.total_timeout_secs = seconds;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.targets.is_empty() {
            return Err(ScanError::ConfigError("no target input given".to_string()));
        }
        if self.plugins.is_empty() {
            return Err(ScanError::ConfigError("no plugin names or filter given".to_string()));
        }
        if self.concurrency == 0 {
            return Err(ScanError::ConfigError("concurrency must be greater than 0".to_string()));
        }
        if self.total_timeout_secs == 0 {
            return Err(ScanError::ConfigError("total timeout must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Engine settings read from `~/.hybridscan.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Task record directory, `~/.hybridscan/tasks` when unset
    pub storage_dir: Option<PathBuf>,
    /// Plugin catalog file
    pub catalog: Option<PathBuf>,
    pub reachability_timeout_ms: u64,
    pub http_probe_timeout_ms: u64,
    pub fingerprint_timeout_ms: u64,
    /// Random pause after each task, spreads re-probing of one host
    pub task_delay_ms_min: u64,
    pub task_delay_ms_max: u64,
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            storage_dir: None,
            catalog: None,
            reachability_timeout_ms: 5_000,
            http_probe_timeout_ms: 10_000,
            fingerprint_timeout_ms: 3_000,
            task_delay_ms_min: 100,
            task_delay_ms_max: 500,
            log_level: "info".to_string(),
        }
    }
}

impl EngineSettings {
    /// Load settings from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ScanError::ConfigError(format!("Failed to read config file: {}", e))
        })?;
        let settings: EngineSettings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `~/.hybridscan.toml`, falling back to defaults
    pub fn load_default_config() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let path = home_dir.join(".hybridscan.toml");

        if path.exists() {
            match Self::from_toml_file(&path) {
                Ok(settings) => {
                    log::info!("Loaded config from {}", path.display());
                    return settings;
                }
                Err(e) => log::warn!("Ignoring {}: {}", path.display(), e),
            }
        }

        Self::default()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.task_delay_ms_min > self.task_delay_ms_max {
            return Err(ScanError::ConfigError(
                "task_delay_ms_min must not exceed task_delay_ms_max".to_string(),
            ));
        }
        if self.reachability_timeout_ms == 0 {
            return Err(ScanError::ConfigError(
                "reachability_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_millis(self.reachability_timeout_ms)
    }

    pub fn http_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.http_probe_timeout_ms)
    }

    pub fn fingerprint_timeout(&self) -> Duration {
        Duration::from_millis(self.fingerprint_timeout_ms)
    }

    /// Delay window in ms, `None` when disabled
    pub fn task_delay_window(&self) -> Option<(u64, u64)> {
        if self.task_delay_ms_max == 0 {
            None
        } else {
            Some((self.task_delay_ms_min.min(self.task_delay_ms_max), self.task_delay_ms_max))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_from_sparse_json() {
        let config: ScanConfig =
            serde_json::from_str(r#"{"targets":{"raw":"a.example"},"plugins":{"names":["p"]}}"#).unwrap();
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.total_timeout_secs, 72_000);
        assert_eq!(config.source, "cli");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let base = ScanConfig::new(
            TargetInput::from_raw("a.example"),
            PluginConfig::from_names(&["p"]),
        );
        assert!(base.clone().with_concurrency(0).validate().is_err());
        assert!(base.clone().with_total_timeout(0).validate().is_err());
        assert!(ScanConfig::default().validate().is_err());
        assert_eq!(base.with_proxy(Some("  ".into())).proxy, None);
    }

    #[test]
    fn test_settings_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hybridscan.toml");
        fs::write(&path, "task_delay_ms_min = 0\ntask_delay_ms_max = 0\nlog_level = \"debug\"\n").unwrap();

        let settings = EngineSettings::from_toml_file(&path).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.reachability_timeout_ms, 5_000);
        assert!(settings.task_delay_window().is_none());

        fs::write(&path, "task_delay_ms_min = 900\ntask_delay_ms_max = 10\n").unwrap();
        assert!(EngineSettings::from_toml_file(&path).is_err());
    }
}
