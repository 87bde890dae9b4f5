//! Simulation configuration with optional TOML file

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// What to do when the simulation catches the protocol misbehaving
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Log and abort the process
    #[default]
    Abort,
    /// Log at error level and keep running
    Report,
}

/// Starvation watchdog settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// Multiplier applied to `max_lock_hold_time_ms × peers`
    pub factor: u32,
    /// Lower bound on the watchdog delay
    pub floor_ms: u64,
    pub policy: FaultPolicy,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            factor: 10,
            floor_ms: 1000,
            policy: FaultPolicy::Abort,
        }
    }
}

/// Peerlock simulation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Upper bound of the random pause between a release and the next attempt
    pub max_acquire_delay_ms: u32,
    /// Upper bound of the random time a peer keeps the lock
    pub max_lock_hold_time_ms: u32,
    /// Pause between a peer starting and its first attempt
    pub initial_acquire_delay_ms: u32,
    /// Seed for the per-peer random generators (entropy when unset)
    pub seed: Option<u64>,
    pub watchdog: WatchdogConfig,
    pub exclusion_violation_policy: FaultPolicy,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_acquire_delay_ms: 0,
            max_lock_hold_time_ms: 0,
            initial_acquire_delay_ms: 100,
            seed: None,
            watchdog: WatchdogConfig::default(),
            exclusion_violation_policy: FaultPolicy::Abort,
        }
    }
}

impl SimulationConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            Error::ConfigError(msg) => {
                Error::ConfigError(format!("{} ({})", msg, path.display()))
            }
            other => other,
        })
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: SimulationConfig = toml::from_str(contents)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        check_bound("max_acquire_delay_ms", self.max_acquire_delay_ms)?;
        check_bound("max_lock_hold_time_ms", self.max_lock_hold_time_ms)?;
        check_bound("initial_acquire_delay_ms", self.initial_acquire_delay_ms)?;

        if self.watchdog.enabled && self.watchdog.factor == 0 {
            return Err(Error::InvalidConfig {
                field: "watchdog.factor",
                reason: "must be at least 1 while the watchdog is enabled".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_max_acquire_delay_ms(mut self, ms: u32) -> Self {
        self.max_acquire_delay_ms = ms;
        self
    }

    pub fn with_max_lock_hold_time_ms(mut self, ms: u32) -> Self {
        self.max_lock_hold_time_ms = ms;
        self
    }

    pub fn with_initial_acquire_delay_ms(mut self, ms: u32) -> Self {
        self.initial_acquire_delay_ms = ms;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Apply one policy to both the watchdog and the exclusion oracle
    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.watchdog.policy = policy;
        self.exclusion_violation_policy = policy;
        self
    }

    pub fn without_watchdog(mut self) -> Self {
        self.watchdog.enabled = false;
        self
    }

    pub fn initial_acquire_delay(&self) -> Duration {
        Duration::from_millis(self.initial_acquire_delay_ms.into())
    }

    /// How long a peer with `peers - 1` neighbours may wait for the lock
    /// before the watchdog calls it starvation
    pub fn starvation_bound(&self, peers: usize) -> Duration {
        let scaled = u64::from(self.max_lock_hold_time_ms)
            .saturating_mul(peers as u64)
            .saturating_mul(self.watchdog.factor.into());
        Duration::from_millis(scaled.max(self.watchdog.floor_ms))
    }
}

fn check_bound(field: &'static str, value: u32) -> Result<()> {
    if value == u32::MAX {
        return Err(Error::InvalidConfig {
            field,
            reason: format!("must be below {}", u32::MAX),
        });
    }
    Ok(())
}
