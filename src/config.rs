use anyhow::Result;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::data_store::DataStoreConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Upper bound on live snapshots per volume.
    pub max_snapshot_limit: usize,
    /// Worker pool size, and the bound on outstanding chunk uploads per task.
    pub core_pool_size: usize,
    /// Upload granularity inside one chunk; must divide the volume chunk size.
    pub chunk_split_size: u64,
    /// Polling period while waiting for the upstream snapshot to be released.
    pub check_snapshot_status_interval_ms: u64,
    /// Upstream session baseline; creation waits twice this before reading
    /// segments so the new sequence reaches every volume client.
    pub mds_session_time_us: u64,
    /// How often finished task records are retired from the registry.
    pub task_retire_interval_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            max_snapshot_limit: 64,
            core_pool_size: 8,
            chunk_split_size: 1024 * 1024,
            check_snapshot_status_interval_ms: 1000,
            mds_session_time_us: 5_000_000,
            task_retire_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SnapshotServerConfig {
    pub data_store: DataStoreConfig,
    pub snapshot: SnapshotConfig,
}

impl SnapshotServerConfig {
    pub fn from_path(path: &str) -> Result<SnapshotServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: SnapshotServerConfig =
            Figment::from(Serialized::defaults(SnapshotServerConfig::default()))
                .merge(Yaml::string(&config_str))
                .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot.max_snapshot_limit == 0 {
            return Err(anyhow::anyhow!("max_snapshot_limit must be positive"));
        }
        if self.snapshot.core_pool_size == 0 {
            return Err(anyhow::anyhow!("core_pool_size must be positive"));
        }
        if self.snapshot.chunk_split_size == 0 {
            return Err(anyhow::anyhow!("chunk_split_size must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_overrides_defaults() {
        let yaml = r#"
snapshot:
  max_snapshot_limit: 3
  chunk_split_size: 4096
"#;
        let config: SnapshotServerConfig =
            Figment::from(Serialized::defaults(SnapshotServerConfig::default()))
                .merge(Yaml::string(yaml))
                .extract()
                .unwrap();
        assert_eq!(config.snapshot.max_snapshot_limit, 3);
        assert_eq!(config.snapshot.chunk_split_size, 4096);
        // untouched keys keep their defaults
        assert_eq!(config.snapshot.core_pool_size, 8);
    }

    #[test]
    fn test_validate_rejects_zero_split_size() {
        let mut config = SnapshotServerConfig::default();
        config.snapshot.chunk_split_size = 0;
        assert!(config.validate().is_err());
    }
}
