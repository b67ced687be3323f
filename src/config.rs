//! Runner configuration.

use crate::error::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

/// Reference wall-clock deadline for one execution.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Executions allowed in flight at once.
    pub max_concurrent: usize,
    /// Requests admitted but not yet completed, in flight or waiting.
    pub max_backlog: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_backlog: 200,
        }
    }
}

/// Caps applied to every container. Network is always disabled and the
/// workspace always mounted read-only; those are not configurable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    /// Fraction of one CPU core.
    pub cpus: f64,
    pub pids_limit: i64,
    /// Output kept per execution; the remainder is drained and dropped.
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024,
            cpus: 0.5,
            pids_limit: 64,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub scheduler: SchedulerConfig,
    pub limits: ResourceLimits,
    pub timeout: Duration,
    pub workspace_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            scheduler: SchedulerConfig::default(),
            limits: ResourceLimits::default(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            workspace_root: default_workspace_root(),
        }
    }
}

pub fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("code-runner")
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrent == 0 {
            return Err(ConfigError::Invalid("max_concurrent must be at least 1".into()));
        }
        if self.scheduler.max_backlog == 0 {
            return Err(ConfigError::Invalid("max_backlog must be at least 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be positive".into()));
        }
        if self.limits.memory_bytes <= 0 {
            return Err(ConfigError::Invalid("memory limit must be positive".into()));
        }
        if !(self.limits.cpus > 0.0) || !self.limits.cpus.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "cpus must be a positive number, got {}",
                self.limits.cpus
            )));
        }
        if self.limits.pids_limit <= 0 {
            return Err(ConfigError::Invalid("pids limit must be positive".into()));
        }
        Ok(())
    }
}
