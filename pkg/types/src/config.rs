use serde::{Deserialize, Serialize};

use crate::orderedset::OrderedSet;

/// Controller configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// data-dir: /var/lib/ordset/data
/// resync-interval-secs: 10
/// stall-threshold-secs: 300
/// backoff-base-ms: 1000
/// backoff-max-secs: 300
/// ready-delay-ms: 500
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default, alias = "resync-interval-secs")]
    pub resync_interval_secs: Option<u64>,
    #[serde(default, alias = "stall-threshold-secs")]
    pub stall_threshold_secs: Option<u64>,
    #[serde(default, alias = "backoff-base-ms")]
    pub backoff_base_ms: Option<u64>,
    #[serde(default, alias = "backoff-max-secs")]
    pub backoff_max_secs: Option<u64>,
    /// Delay before the in-memory runtime reports a new instance Ready.
    #[serde(default, alias = "ready-delay-ms")]
    pub ready_delay_ms: Option<u64>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Load a manifest holding a YAML list of OrderedSets.
pub fn load_manifest(path: &str) -> anyhow::Result<Vec<OrderedSet>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read manifest {}: {}", path, e))?;
    parse_manifest(&content)
}

/// Parse a manifest body: either a single OrderedSet or a list of them.
pub fn parse_manifest(content: &str) -> anyhow::Result<Vec<OrderedSet>> {
    let value: serde_yaml::Value = serde_yaml::from_str(content)?;
    let sets = if value.is_sequence() {
        serde_yaml::from_value(value)?
    } else {
        vec![serde_yaml::from_value(value)?]
    };
    Ok(sets)
}
