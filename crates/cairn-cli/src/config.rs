use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use cairn_db::DbConfig;
use cairn_server::ServerConfig;
use serde::{Deserialize, Serialize};

/// Contents of `cairn.toml`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub table: Vec<TableConfig>,
}

/// One `[[table]]` of JSON documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    /// Dotted path of the field holding each document's primary key.
    pub primary_key: String,
    #[serde(default)]
    pub indexes: Vec<IndexConfig>,
    /// JSON file holding an array of documents. Without one the table stays
    /// empty.
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// A secondary index over one document field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub name: String,
    pub field: String,
    #[serde(default)]
    pub unique: bool,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl TableConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl CairnConfig {
    /// Read and validate a config file. Relative source paths are resolved
    /// against the file's directory.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: CairnConfig = toml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        if let Some(dir) = path.parent() {
            for table in &mut config.table {
                if let Some(source) = table.source.as_mut() {
                    if source.is_relative() {
                        *source = dir.join(&*source);
                    }
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.db.validate()?;
        let mut names = HashSet::new();
        for table in &self.table {
            if !names.insert(table.name.as_str()) {
                bail!("table {} is declared twice", table.name);
            }
            if table.primary_key.is_empty() {
                bail!("table {} has an empty primary_key", table.name);
            }
            if table.poll_interval_ms == 0 {
                bail!("table {}: poll_interval_ms must be positive", table.name);
            }
            let mut indexes = HashSet::new();
            for index in &table.indexes {
                if !indexes.insert(index.name.as_str()) {
                    bail!("table {}: index {} is declared twice", table.name, index.name);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[db]
gc_interval_ms = 250

[server]
bind_addr = "0.0.0.0:9500"

[[table]]
name = "nodes"
primary_key = "id"
source = "nodes.json"
indexes = [
    { name = "zone", field = "labels.zone" },
    { name = "addr", field = "addr", unique = true },
]

[[table]]
name = "services"
primary_key = "name"
poll_interval_ms = 50
"#;

    #[test]
    fn parses_full_config() {
        let config: CairnConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.db.gc_interval_ms, 250);
        assert_eq!(config.db.gc_batch_limit, DbConfig::default().gc_batch_limit);
        assert_eq!(config.server.bind_addr.port(), 9500);
        assert_eq!(config.table.len(), 2);
        assert_eq!(config.table[0].indexes[0].field, "labels.zone");
        assert!(!config.table[0].indexes[0].unique);
        assert!(config.table[0].indexes[1].unique);
        assert_eq!(config.table[0].poll_interval(), Duration::from_secs(1));
        assert_eq!(config.table[1].source, None);
        assert_eq!(config.table[1].poll_interval_ms, 50);
        config.validate().unwrap();
    }

    #[test]
    fn empty_config_is_default() {
        let config: CairnConfig = toml::from_str("").unwrap();
        assert_eq!(config, CairnConfig::default());
    }

    #[test]
    fn load_resolves_relative_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cairn.toml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(SAMPLE.as_bytes())
            .unwrap();
        let config = CairnConfig::load(&path).unwrap();
        assert_eq!(config.table[0].source, Some(dir.path().join("nodes.json")));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = CairnConfig::load(Path::new("/nonexistent/cairn.toml")).unwrap_err();
        assert!(err.to_string().contains("reading config"));
    }

    #[test]
    fn rejects_duplicate_tables() {
        let config: CairnConfig = toml::from_str(
            r#"
[[table]]
name = "a"
primary_key = "id"
[[table]]
name = "a"
primary_key = "id"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_gc_interval() {
        let config: CairnConfig = toml::from_str("[db]\ngc_interval_ms = 0").unwrap();
        assert!(config.validate().is_err());
    }
}
