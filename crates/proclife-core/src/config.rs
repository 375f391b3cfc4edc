use crate::error::{ProcessError, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a process manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(setter(into))]
pub struct ManagerConfig {
    /// Maximum number of processes tracked at once
    #[serde(default = "default_max_processes")]
    #[builder(default = "default_max_processes()")]
    pub max_processes: usize,

    /// How long `terminate_process` waits for the OS to confirm exit (in milliseconds)
    #[serde(default = "default_termination_grace_ms")]
    #[builder(default = "default_termination_grace_ms()")]
    pub termination_grace_ms: u64,

    /// Poll step used while waiting for a signalled process to be reaped (in milliseconds)
    #[serde(default = "default_reap_poll_interval_ms")]
    #[builder(default = "default_reap_poll_interval_ms()")]
    pub reap_poll_interval_ms: u64,

    /// Number of reaped records whose output stays queryable
    #[serde(default = "default_retained_outputs")]
    #[builder(default = "default_retained_outputs()")]
    pub retained_outputs: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_processes: default_max_processes(),
            termination_grace_ms: default_termination_grace_ms(),
            reap_poll_interval_ms: default_reap_poll_interval_ms(),
            retained_outputs: default_retained_outputs(),
        }
    }
}

impl ManagerConfig {
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }

    /// Config with the given capacity and defaults for everything else
    pub fn with_capacity(max_processes: usize) -> Self {
        Self {
            max_processes,
            ..Default::default()
        }
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<()> {
        if self.max_processes == 0 {
            return Err(ProcessError::ConfigurationError(
                "max_processes must be at least 1".to_string(),
            ));
        }

        if self.termination_grace_ms > 60_000 {
            return Err(ProcessError::ConfigurationError(
                "termination_grace_ms should not exceed 60 seconds".to_string(),
            ));
        }

        if self.reap_poll_interval_ms == 0 {
            return Err(ProcessError::ConfigurationError(
                "reap_poll_interval_ms must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn reap_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reap_poll_interval_ms)
    }
}

/// Configuration for a pid watcher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(setter(into))]
pub struct WatcherConfig {
    /// Interval between monitor callback invocations (in milliseconds)
    #[serde(default = "default_monitor_interval_ms")]
    #[builder(default = "default_monitor_interval_ms()")]
    pub monitor_interval_ms: u64,

    /// Interval between liveness checks of the watched pid (in milliseconds)
    #[serde(default = "default_exit_poll_interval_ms")]
    #[builder(default = "default_exit_poll_interval_ms()")]
    pub exit_poll_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval_ms(),
            exit_poll_interval_ms: default_exit_poll_interval_ms(),
        }
    }
}

impl WatcherConfig {
    pub fn builder() -> WatcherConfigBuilder {
        WatcherConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor_interval_ms == 0 || self.exit_poll_interval_ms == 0 {
            return Err(ProcessError::ConfigurationError(
                "watcher intervals must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn exit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exit_poll_interval_ms)
    }
}

// Default value functions for serde
fn default_max_processes() -> usize {
    16
}
fn default_termination_grace_ms() -> u64 {
    2_000
}
fn default_reap_poll_interval_ms() -> u64 {
    25
}
fn default_retained_outputs() -> usize {
    64
}
fn default_monitor_interval_ms() -> u64 {
    1_000
}
fn default_exit_poll_interval_ms() -> u64 {
    250
}
