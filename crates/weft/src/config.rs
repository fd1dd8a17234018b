//! Runtime configuration
//!
//! A single [`RuntimeConfig`] is current for the whole process. Components read
//! it when they need a value, so replacing it affects fibers created and
//! connections attempted afterwards.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Smallest fiber stack accepted by [`RuntimeConfig::validate`]
pub const MIN_FIBER_STACK_SIZE: usize = 16 * 1024;

/// Tunables for fibers, the reactor, timers and hooks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Stack size for fibers created with `stack_size == 0`
    pub fiber_stack_size: usize,

    /// Timeout applied by the hooked `connect` (`u64::MAX` = wait forever)
    pub tcp_connect_timeout_ms: u64,

    /// Upper bound on a single `epoll_wait`
    pub reactor_max_wait_ms: u64,

    /// Number of epoll events read per wait
    pub reactor_max_events: usize,

    /// Backward clock jump that makes every pending timer expire
    pub clock_rollover_threshold_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            fiber_stack_size: 1024 * 1024, // 1 MB
            tcp_connect_timeout_ms: 5000,
            reactor_max_wait_ms: 3000,
            reactor_max_events: 64,
            clock_rollover_threshold_ms: 60 * 60 * 1000,
        }
    }
}

impl RuntimeConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.fiber_stack_size < MIN_FIBER_STACK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "fiber_stack_size {} is below the minimum of {}",
                self.fiber_stack_size, MIN_FIBER_STACK_SIZE
            )));
        }
        if self.reactor_max_events == 0 {
            return Err(Error::InvalidConfig("reactor_max_events must be positive".into()));
        }
        if self.reactor_max_wait_ms == 0 || self.reactor_max_wait_ms > i32::MAX as u64 {
            return Err(Error::InvalidConfig(format!(
                "reactor_max_wait_ms {} is out of range",
                self.reactor_max_wait_ms
            )));
        }
        Ok(())
    }
}

static CURRENT: Lazy<RwLock<Arc<RuntimeConfig>>> =
    Lazy::new(|| RwLock::new(Arc::new(RuntimeConfig::default())));

/// The process-wide configuration.
pub fn current() -> Arc<RuntimeConfig> {
    CURRENT.read().clone()
}

/// Install a new process-wide configuration.
pub fn replace(config: RuntimeConfig) -> Result<()> {
    config.validate()?;
    let old = std::mem::replace(&mut *CURRENT.write(), Arc::new(config));
    tracing::info!(target: crate::LOG_TARGET, ?old, new = ?*current(), "runtime config replaced");
    Ok(())
}
