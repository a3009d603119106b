use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const ENV_MAX_PARALLEL_BOOT_TASKS: &str = "TRELLIS_MAX_PARALLEL_BOOT_TASKS";
pub const ENV_LOCK_TIMEOUT_MS: &str = "TRELLIS_LOCK_TIMEOUT_MS";
pub const ENV_STABILITY_TIMEOUT_MS: &str = "TRELLIS_STABILITY_TIMEOUT_MS";

const DEFAULT_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_BOOT_STACK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Upper bound on parallel boot workers, not counting the logging
    /// subsystem's dedicated worker.
    pub max_parallel_boot_tasks: usize,
    pub parallel_boot: bool,
    pub lock_timeout_ms: u64,
    pub stability_timeout_ms: u64,
    /// Stack size of the boot thread and of each parallel boot worker.
    pub boot_stack_size: usize,
    /// Defer requirements on domain-level capabilities a host-only
    /// configuration cannot see.
    pub host_xml_only: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_parallel_boot_tasks: default_parallelism(),
            parallel_boot: true,
            lock_timeout_ms: DEFAULT_TIMEOUT_MS,
            stability_timeout_ms: DEFAULT_TIMEOUT_MS,
            boot_stack_size: DEFAULT_BOOT_STACK_SIZE,
            host_xml_only: false,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

impl ControllerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()
    }

    fn validate(mut self) -> Result<Self, ConfigError> {
        if self.max_parallel_boot_tasks == 0 {
            self.max_parallel_boot_tasks = 1;
        }
        if self.boot_stack_size < 64 * 1024 {
            return Err(ConfigError::InvalidValue {
                name: "boot_stack_size".to_owned(),
                value: self.boot_stack_size.to_string(),
            });
        }
        Ok(self)
    }

    /// Apply `TRELLIS_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_MAX_PARALLEL_BOOT_TASKS) {
            self.max_parallel_boot_tasks = parse_env(ENV_MAX_PARALLEL_BOOT_TASKS, &value)?;
        }
        if let Some(value) = lookup(ENV_LOCK_TIMEOUT_MS) {
            self.lock_timeout_ms = parse_env(ENV_LOCK_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_STABILITY_TIMEOUT_MS) {
            self.stability_timeout_ms = parse_env(ENV_STABILITY_TIMEOUT_MS, &value)?;
        }
        debug!("controller config: {self:?}");
        self.validate()
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn stability_timeout(&self) -> Duration {
        Duration::from_millis(self.stability_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_owned(),
        value: value.to_owned(),
    })
}
