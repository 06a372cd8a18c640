// src/config.rs - Engine, scheduler and processing definition configuration

use crate::definition::ProcessingDefinition;
use crate::error::{ProcessingError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

// ============================================================================
// MAIN CONFIGURATION
// ============================================================================

/// Main TMTC configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Dispatcher and worker pool
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// JSON-lines archive file; data is kept in memory when absent
    #[serde(default)]
    pub archive: Option<PathBuf>,

    /// Inline processing definition
    #[serde(default)]
    pub definition: ProcessingDefinition,

    /// Additional definition files, merged into `definition`. Relative
    /// paths are resolved against the configuration file's directory.
    #[serde(default)]
    pub definition_files: Vec<PathBuf>,
}

impl Config {
    /// Parse a configuration document. `definition_files` are not loaded.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file together with its definition files
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProcessingError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_yaml(&content)?;

        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        for file in &config.definition_files {
            let resolved = if file.is_relative() { base.join(file) } else { file.clone() };
            info!("Loading processing definition {}", resolved.display());
            config.definition.merge(ProcessingDefinition::from_file(&resolved)?);
        }
        config.definition.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.queue_capacity == 0 {
            return Err(ProcessingError::Config("engine.queue_capacity must be positive".into()));
        }
        if self.engine.worker_threads == 0 {
            return Err(ProcessingError::Config("engine.worker_threads must be positive".into()));
        }
        if self.engine.timer_resolution_ms == 0 {
            return Err(ProcessingError::Config("engine.timer_resolution_ms must be positive".into()));
        }
        self.definition.validate()
    }
}

// ============================================================================
// ENGINE CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the admission queue; producers wait while it is full
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Batches executing at the same time
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Polling period of the activity timeout timers
    #[serde(default = "default_timer_resolution")]
    pub timer_resolution_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            worker_threads: default_worker_threads(),
            timer_resolution_ms: default_timer_resolution(),
        }
    }
}

// ============================================================================
// SCHEDULER CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// A disabled scheduler moves firing tasks to DISABLED
    #[serde(default = "default_true")]
    pub enabled_at_startup: bool,

    /// When restoring the schedule from the archive, keep absolute-time
    /// tasks whose release time passed while the scheduler was down
    #[serde(default)]
    pub run_past_scheduled_activities: bool,

    /// Polling period of the scheduler timers
    #[serde(default = "default_timer_resolution")]
    pub timer_resolution_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled_at_startup: true,
            run_past_scheduled_activities: false,
            timer_resolution_ms: default_timer_resolution(),
        }
    }
}

// ============================================================================
// DEFAULT VALUE FUNCTIONS
// ============================================================================

fn default_queue_capacity() -> usize { 1000 }
fn default_worker_threads() -> usize { num_cpus::get().max(2) }
fn default_timer_resolution() -> u64 { 100 }
fn default_true() -> bool { true }
