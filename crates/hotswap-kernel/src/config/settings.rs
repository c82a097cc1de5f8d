use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::{ConfigError, ConfigResult};
use crate::types::LoaderId;

/// Upper bound for the debounce window.
pub const MAX_RELOAD_DELAY_MILLIS: u64 = 30_000;

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HotSwapConfig {
    pub scheduler: SchedulerConfig,
    pub coordinator: CoordinatorConfig,
    pub watch: WatchConfig,
    pub interests: Vec<InterestConfig>,
    pub logging: LoggingConfig,
}

impl HotSwapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamp values that have a hard ceiling.
    pub fn normalized(mut self) -> Self {
        self.scheduler.reload_delay_millis = self
            .scheduler
            .reload_delay_millis
            .min(MAX_RELOAD_DELAY_MILLIS);
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.scheduler.max_pending_reload_requests == 0 {
            return Err(invalid(
                "scheduler.max_pending_reload_requests",
                "must be >= 1",
            ));
        }
        if self.coordinator.max_passes == 0 {
            return Err(invalid("coordinator.max_passes", "must be >= 1"));
        }
        if self.coordinator.max_lock_attempts == 0 {
            return Err(invalid("coordinator.max_lock_attempts", "must be >= 1"));
        }
        for (i, interest) in self.interests.iter().enumerate() {
            Regex::new(&interest.pattern)
                .map_err(|e| invalid(&format!("interests[{i}].pattern"), &e.to_string()))?;
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Debounce and backpressure knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Quiet period after the last merged event before a unit executes
    pub reload_delay_millis: u64,
    /// Outstanding (executing + pending) reload requests per container
    pub max_pending_reload_requests: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reload_delay_millis: 100,
            max_pending_reload_requests: 2,
        }
    }
}

impl SchedulerConfig {
    pub fn with_reload_delay(mut self, delay: Duration) -> Self {
        self.reload_delay_millis = delay.as_millis() as u64;
        self
    }

    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending_reload_requests = max;
        self
    }

    /// Debounce window, clamped to [`MAX_RELOAD_DELAY_MILLIS`].
    pub fn reload_delay(&self) -> Duration {
        Duration::from_millis(self.reload_delay_millis.min(MAX_RELOAD_DELAY_MILLIS))
    }
}

/// Which structural resources a configuration change re-parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReparsePolicy {
    /// Only resources that declare an object referencing a changed key
    #[default]
    Affected,
    /// Every structural resource the container was built from
    All,
}

/// Reload coordinator knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub lock_timeout_millis: u64,
    pub lock_retry_millis: u64,
    pub max_lock_attempts: u32,
    /// Safety bound on fixed-point passes within one run
    pub max_passes: u32,
    pub reparse_policy: ReparsePolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_timeout_millis: 1_000,
            lock_retry_millis: 50,
            max_lock_attempts: 20,
            max_passes: 16,
            reparse_policy: ReparsePolicy::Affected,
        }
    }
}

impl CoordinatorConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_millis)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_millis)
    }

    pub fn with_reparse_policy(mut self, policy: ReparsePolicy) -> Self {
        self.reparse_policy = policy;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration, attempts: u32) -> Self {
        self.lock_timeout_millis = timeout.as_millis() as u64;
        self.max_lock_attempts = attempts;
        self
    }
}

/// One watched classpath root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRootConfig {
    pub path: PathBuf,
    pub loader: LoaderId,
}

/// Filesystem watch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub roots: Vec<WatchRootConfig>,
    pub class_extension: String,
    pub config_extensions: Vec<String>,
    /// Matched against the end of the file name, so compound suffixes
    /// like `beans.toml` work
    pub structural_extensions: Vec<String>,
    pub ignore_patterns: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            class_extension: "class".to_string(),
            config_extensions: vec![
                "properties".to_string(),
                "yaml".to_string(),
                "yml".to_string(),
                "toml".to_string(),
                "json".to_string(),
            ],
            structural_extensions: vec!["xml".to_string(), "beans.toml".to_string()],
            ignore_patterns: vec!["*.tmp".to_string(), "*.swp".to_string(), "*~".to_string()],
        }
    }
}

impl WatchConfig {
    pub fn with_root(mut self, path: impl Into<PathBuf>, loader: LoaderId) -> Self {
        self.roots.push(WatchRootConfig {
            path: path.into(),
            loader,
        });
        self
    }
}

/// Interest predicate for redefinition events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterestConfig {
    /// Regular expression matched against the binary type name
    pub pattern: String,
    /// Restrict to one class-loader context
    #[serde(default)]
    pub loader: Option<LoaderId>,
}

/// Logging subscriber settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
