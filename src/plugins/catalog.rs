//! In-memory plugin catalog, optionally loaded from a TOML file

use super::{PluginCatalog, PluginDescriptor, PluginFilter};
use crate::{ScanError, ScanResult};
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "plugin")]
    plugins: Vec<PluginDescriptor>,
}

/// Catalog backed by a plain ordered list
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    plugins: Vec<PluginDescriptor>,
}

impl InMemoryCatalog {
    /// Build a catalog, dropping later duplicates of a name
    pub fn new(plugins: Vec<PluginDescriptor>) -> Self {
        let mut seen = HashSet::new();
        let plugins = plugins
            .into_iter()
            .filter(|p| {
                let fresh = seen.insert(p.name.clone());
                if !fresh {
                    warn!("Duplicate plugin {} ignored", p.name);
                }
                fresh
            })
            .collect();
        Self { plugins }
    }

    /// Parse `[[plugin]]` tables
    pub fn from_toml_str(content: &str) -> ScanResult<Self> {
        let file: CatalogFile = toml::from_str(content)?;
        Ok(Self::new(file.plugins))
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ScanError::ConfigError(format!("failed to read plugin catalog {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_toml_str(&content)?;
        info!("Loaded {} plugins from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn plugins(&self) -> &[PluginDescriptor] {
        &self.plugins
    }
}

impl PluginCatalog for InMemoryCatalog {
    fn lookup(&self, name: &str) -> Option<PluginDescriptor> {
        self.plugins.iter().find(|p| p.name == name).cloned()
    }

    fn query(&self, filter: &PluginFilter) -> ScanResult<Vec<PluginDescriptor>> {
        Ok(self
            .plugins
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginKind;

    const CATALOG: &str = r#"
[[plugin]]
name = "weak-ssh"
type = "port-scan"
tags = ["weak-auth"]
command = "./plugins/weak-ssh.sh"
args = ["{host}", "{port}"]

[[plugin]]
name = "reflected-xss"
type = "mitm"
tags = ["xss"]

[[plugin]]
name = "weak-ssh"
type = "yak"
"#;

    #[test]
    fn test_load_from_toml() {
        let catalog = InMemoryCatalog::from_toml_str(CATALOG).unwrap();
        assert_eq!(catalog.len(), 2);

        let ssh = catalog.lookup("weak-ssh").unwrap();
        assert_eq!(ssh.kind, PluginKind::PortScan);
        assert_eq!(ssh.args, vec!["{host}", "{port}"]);
        assert!(catalog.lookup("missing").is_none());
    }

    #[test]
    fn test_query_by_kind_and_keyword() {
        let catalog = InMemoryCatalog::from_toml_str(CATALOG).unwrap();
        let filter = PluginFilter {
            kinds: vec![PluginKind::Mitm],
            ..Default::default()
        };
        let found = catalog.query(&filter).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "reflected-xss");

        let filter = PluginFilter {
            keyword: Some("SSH".to_string()),
            ..Default::default()
        };
        assert_eq!(catalog.query(&filter).unwrap()[0].name, "weak-ssh");
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        assert!(matches!(
            InMemoryCatalog::from_toml_str("[[plugin]]\nname = 3"),
            Err(ScanError::ParseError(_))
        ));
    }
}
