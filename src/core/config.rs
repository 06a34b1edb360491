use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

use crate::core::errors::{ClusterError, Result};

/// Static cluster declaration, usually loaded from YAML.
///
/// ```yaml
/// fork_budget: 4
/// processes:
///   - tag_name: api
///     units:
///       - file_path: echo
///         replicas: 2
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    #[serde(default)]
    pub tag_name: Option<String>,
    /// Maximum number of worker processes. Defaults to the CPU count.
    #[serde(default)]
    pub fork_budget: Option<usize>,
    #[serde(default)]
    pub store: HashMap<String, Value>,
    #[serde(default)]
    pub processes: Vec<ProcessConfig>,
}

/// One worker process and the units it hosts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    pub tag_name: String,
    #[serde(default)]
    pub store: HashMap<String, Value>,
    #[serde(default)]
    pub units: Vec<UnitConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitConfig {
    #[serde(default)]
    pub tag_name: Option<String>,
    /// Name of the registered entry point the unit runs
    pub file_path: String,
    #[serde(default)]
    pub store: HashMap<String, Value>,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

fn default_replicas() -> usize {
    1
}

impl ClusterConfig {
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a declaration; `.json` files are read as JSON, anything else as YAML
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| ClusterError::io(format!("reading {}", path.display()), e))?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&source)?,
            _ => Self::from_yaml_str(&source)?,
        };
        info!(path = %path.display(), processes = config.processes.len(), "Loaded cluster declaration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fork_budget == Some(0) {
            return Err(ClusterError::configuration_field(
                "fork_budget must be greater than 0",
                "fork_budget",
            ));
        }
        for process in &self.processes {
            process.validate()?;
        }
        validate_process_tags(self.processes.iter().map(|process| process.tag_name.as_str()))
    }

    /// Budget in effect: the configured value or the number of CPU cores
    pub fn fork_budget(&self) -> usize {
        self.fork_budget.unwrap_or_else(num_cpus::get)
    }
}

impl ProcessConfig {
    pub fn validate(&self) -> Result<()> {
        validate_tag(&self.tag_name, "processes.tag_name")?;
        for unit in &self.units {
            if unit.file_path.trim().is_empty() {
                return Err(ClusterError::configuration_field(
                    format!("unit in process '{}' has no file_path", self.tag_name),
                    "units.file_path",
                ));
            }
            if unit.replicas == 0 {
                return Err(ClusterError::configuration_field(
                    format!("unit '{}' must have at least one replica", unit.file_path),
                    "units.replicas",
                ));
            }
        }
        Ok(())
    }
}

/// Process tags double as addresses and as the worker's boot tag: each must
/// be non-empty, free of `/` and unique within the cluster.
pub fn validate_process_tags<'a>(tags: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for tag in tags {
        validate_tag(tag, "processes.tag_name")?;
        if !seen.insert(tag) {
            return Err(ClusterError::configuration_field(
                format!("duplicate process tag '{}'", tag),
                "processes.tag_name",
            ));
        }
    }
    Ok(())
}

fn validate_tag(tag: &str, field: &str) -> Result<()> {
    if tag.trim().is_empty() {
        return Err(ClusterError::configuration_field("tag_name cannot be empty", field));
    }
    if tag.contains('/') {
        return Err(ClusterError::configuration_field(
            format!("tag_name '{}' cannot contain '/'", tag),
            field,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const DECLARATION: &str = r#"
fork_budget: 4
store:
  region: eu
processes:
  - tag_name: api
    units:
      - file_path: ./worker-entry
        replicas: 2
        store:
          model: small
  - tag_name: worker
"#;

    #[test]
    fn test_parse_yaml() {
        let config = ClusterConfig::from_yaml_str(DECLARATION).unwrap();
        assert_eq!(config.fork_budget(), 4);
        assert_eq!(config.store.get("region"), Some(&json!("eu")));
        assert_eq!(config.processes.len(), 2);

        let unit = &config.processes[0].units[0];
        assert_eq!(unit.file_path, "./worker-entry");
        assert_eq!(unit.replicas, 2);
        assert_eq!(unit.tag_name, None);
        assert!(config.processes[1].units.is_empty());
    }

    #[test]
    fn test_default_budget_is_cpu_count() {
        let config = ClusterConfig::default();
        assert_eq!(config.fork_budget(), num_cpus::get());
    }

    #[test]
    fn test_rejects_duplicate_tags() {
        let err = ClusterConfig::from_json_str(
            r#"{"processes": [{"tag_name": "api"}, {"tag_name": "api"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ClusterError::Configuration { .. }));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ClusterConfig::from_yaml_str("fork_budget: 0").is_err());
        assert!(ClusterConfig::from_yaml_str("processes: [{tag_name: 'a/b'}]").is_err());
        assert!(ClusterConfig::from_yaml_str(
            "processes: [{tag_name: api, units: [{file_path: x, replicas: 0}]}]"
        )
        .is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("cluster.yaml");
        std::fs::write(&yaml, DECLARATION).unwrap();
        assert_eq!(ClusterConfig::from_file(&yaml).unwrap().processes.len(), 2);

        let json_path = dir.path().join("cluster.json");
        std::fs::write(&json_path, r#"{"processes": [{"tag_name": "solo"}]}"#).unwrap();
        assert_eq!(ClusterConfig::from_file(&json_path).unwrap().processes[0].tag_name, "solo");

        let missing = ClusterConfig::from_file(dir.path().join("missing.yaml")).unwrap_err();
        assert_eq!(missing.category(), "io");
    }
}
