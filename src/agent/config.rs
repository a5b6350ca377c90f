use crate::agent::error::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Engine behavior knobs. The host loads these once at startup, from a TOML
/// file or by filling the struct directly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Upper bound for the listener-readiness poll at startup, milliseconds.
    /// After the ceiling, callers fall back to same-thread listener duty
    /// rather than fail.
    pub listener_ready_ceiling_ms: u64,
    /// Poll step while waiting for the listener, milliseconds.
    pub listener_ready_poll_ms: u64,
    /// Launch a debugger on an unhandled exception when none is attached.
    pub attach_on_unhandled: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listener_ready_ceiling_ms: 5000,
            listener_ready_poll_ms: 10,
            attach_on_unhandled: false,
        }
    }
}

impl AgentConfig {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn listener_ready_ceiling(&self) -> Duration {
        Duration::from_millis(self.listener_ready_ceiling_ms)
    }

    pub fn listener_ready_poll(&self) -> Duration {
        Duration::from_millis(self.listener_ready_poll_ms)
    }
}
