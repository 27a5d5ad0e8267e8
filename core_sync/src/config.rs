//! Configuration for the turn pipeline.
//!
//! Loaded from `pipeline_config.json` with support for an environment variable override.

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use engine_runtime::ExecutorConfig;
use serde::Deserialize;
use thiserror::Error;

pub const BUILTIN_PIPELINE_CONFIG: &str = include_str!("data/pipeline_config.json");
pub const PIPELINE_CONFIG_ENV: &str = "TURN_PIPELINE_CONFIG_PATH";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub executor: ExecutorConfig,
    pub sync: SyncConfig,
}

impl PipelineConfig {
    pub fn builtin() -> Arc<Self> {
        Arc::new(
            serde_json::from_str(BUILTIN_PIPELINE_CONFIG)
                .expect("builtin pipeline config should parse"),
        )
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, PipelineConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| PipelineConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = PipelineConfig::from_json_str(&contents)?;
        Ok(config)
    }
}

/// Knobs for the report synchronization engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Turns an unobserved ship stays in the pending table before it is dropped.
    pub pending_ship_grace_turns: u32,
    /// Merge the reports of mutually allied factions into each other's view.
    pub share_allied_views: bool,
    pub parallel_observers: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pending_ship_grace_turns: 2,
            share_allied_views: false,
            parallel_observers: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineConfigError {
    #[error("failed to parse pipeline config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read pipeline config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Load the pipeline configuration from `TURN_PIPELINE_CONFIG_PATH`, falling
/// back to the builtin defaults.
pub fn load_pipeline_config_from_env() -> (Arc<PipelineConfig>, Option<PathBuf>) {
    if let Some(path) = env::var_os(PIPELINE_CONFIG_ENV).map(PathBuf::from) {
        match PipelineConfig::from_file(&path) {
            Ok(config) => {
                tracing::info!(
                    target: "turn_runner::config",
                    path = %path.display(),
                    "pipeline_config.loaded=file"
                );
                return (Arc::new(config), Some(path));
            }
            Err(err) => {
                tracing::warn!(
                    target: "turn_runner::config",
                    path = %path.display(),
                    error = %err,
                    "pipeline_config.load_failed"
                );
            }
        }
    }

    let config = PipelineConfig::builtin();
    tracing::info!(target: "turn_runner::config", "pipeline_config.loaded=builtin");
    (config, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_config_matches_defaults() {
        let config = PipelineConfig::builtin();
        let defaults = PipelineConfig::default();
        assert_eq!(
            config.executor.engine_timeout_ms,
            defaults.executor.engine_timeout_ms
        );
        assert_eq!(
            config.sync.pending_ship_grace_turns,
            defaults.sync.pending_ship_grace_turns
        );
        assert!(config.executor.sandbox_root.is_none());
        assert!(!config.sync.share_allied_views);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            PipelineConfig::from_json_str(r#"{"sync":{"share_allied_views":true}}"#).unwrap();
        assert!(config.sync.share_allied_views);
        assert_eq!(config.sync.pending_ship_grace_turns, 2);
        assert_eq!(config.executor.sandbox_attempts, 3);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = PipelineConfig::from_file(Path::new("/nonexistent/pipeline.json")).unwrap_err();
        assert!(matches!(err, PipelineConfigError::Read { .. }));
    }
}
