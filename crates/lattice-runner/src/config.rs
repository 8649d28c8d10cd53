//! Runner configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use lattice_traits::EngineConfig;

/// What the runner does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// A live process cycling on an interval while a feed ticks
    #[default]
    Live,
    /// One batch run against a sealed snapshot
    Batch,
}

/// Runner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Run mode
    #[serde(default)]
    pub mode: RunMode,

    /// Number of demo positions
    #[serde(default = "default_positions")]
    pub positions: usize,

    /// Live cycles to run before exiting
    #[serde(default = "default_cycles")]
    pub cycles: u64,

    /// Live cycle interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// User the demo client acts for
    #[serde(default = "default_user")]
    pub user: String,
}

fn default_positions() -> usize {
    4
}

fn default_cycles() -> u64 {
    3
}

fn default_interval_ms() -> u64 {
    250
}

fn default_user() -> String {
    "demo".to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            mode: RunMode::default(),
            positions: default_positions(),
            cycles: default_cycles(),
            interval_ms: default_interval_ms(),
            user: default_user(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, std::io::Error> {
        toml::from_str(content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Live cycle interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_traits::{ExecutorStrategy, PermissionPolicy};

    #[test]
    fn test_empty_file_gives_defaults() {
        assert_eq!(RunnerConfig::from_toml("").unwrap(), RunnerConfig::default());
    }

    #[test]
    fn test_parse_batch_config() {
        let config = RunnerConfig::from_toml(
            r#"
            mode = "batch"
            positions = 10

            [engine]
            name = "eod"
            cycle_retention = 2
            permission = "permissive"

            [engine.executor]
            strategy = "job_dispatch"
            calc_nodes = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, RunMode::Batch);
        assert_eq!(config.positions, 10);
        assert_eq!(config.cycles, 3);
        assert_eq!(config.engine.name, "eod");
        assert_eq!(config.engine.cycle_retention, 2);
        assert_eq!(config.engine.permission, PermissionPolicy::Permissive);
        assert_eq!(
            config.engine.executor,
            ExecutorStrategy::JobDispatch { calc_nodes: 8 }
        );
    }

    #[test]
    fn test_invalid_toml_is_invalid_data() {
        let err = RunnerConfig::from_toml("mode = 7").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
