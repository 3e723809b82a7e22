//! Configuration
//!
//! [`SessionConfig`] governs one session's limits; [`ServerConfig`] adds the
//! listener and housekeeping settings. Both load from JSON, fill missing
//! fields with defaults, and are checked with `validate()` before use.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetConfig;
use crate::error::ConfigError;
use crate::protocol::{DEFAULT_MAX_FRAME_LEN, PROTOCOL_VERSION};

/// What to do when one address already holds its maximum of sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddrLimitPolicy {
    /// Refuse the new connection.
    #[default]
    Reject,
    /// Expire the address's oldest session to make room.
    EvictOldest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Protocol version the server speaks.
    pub protocol_version: u16,
    /// How long a detached session can be resumed.
    pub resume_window_secs: u64,
    /// Detached sessions kept in memory; the least recently detached are
    /// expired beyond this.
    pub max_detached: usize,
    /// Live sessions per source address. `0` disables the limit.
    pub max_sessions_per_addr: usize,
    pub addr_limit_policy: AddrLimitPolicy,
    /// Re-render cycles per window.
    pub render_budget: BudgetConfig,
    /// Asynchronous trigger fan-outs per window.
    pub trigger_budget: BudgetConfig,
    pub max_frame_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            resume_window_secs: 30,
            max_detached: 1024,
            max_sessions_per_addr: 16,
            addr_limit_policy: AddrLimitPolicy::Reject,
            render_budget: BudgetConfig {
                max_triggers: 60,
                window_ms: 1_000,
            },
            trigger_budget: BudgetConfig::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl SessionConfig {
    pub fn resume_window(&self) -> Duration {
        Duration::from_secs(self.resume_window_secs)
    }

    #[must_use]
    pub fn with_resume_window(mut self, window: Duration) -> Self {
        self.resume_window_secs = window.as_secs();
        self
    }

    #[must_use]
    pub fn with_max_detached(mut self, max: usize) -> Self {
        self.max_detached = max;
        self
    }

    #[must_use]
    pub fn with_addr_limit(mut self, max: usize, policy: AddrLimitPolicy) -> Self {
        self.max_sessions_per_addr = max;
        self.addr_limit_policy = policy;
        self
    }

    #[must_use]
    pub fn with_render_budget(mut self, budget: BudgetConfig) -> Self {
        self.render_budget = budget;
        self
    }

    #[must_use]
    pub fn with_trigger_budget(mut self, budget: BudgetConfig) -> Self {
        self.trigger_budget = budget;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol_version == 0 {
            return Err(ConfigError::Invalid("protocol_version must be at least 1".into()));
        }
        for (name, budget) in [("render_budget", &self.render_budget), ("trigger_budget", &self.trigger_budget)] {
            if budget.max_triggers == 0 || budget.window_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} needs a non-zero limit and window"
                )));
            }
        }
        if self.max_frame_len < crate::protocol::HEADER_LEN {
            return Err(ConfigError::Invalid(format!(
                "max_frame_len {} is smaller than a frame header",
                self.max_frame_len
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// How often expired detached sessions are swept.
    pub sweep_interval_ms: u64,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 4040)),
            sweep_interval_ms: 5_000,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    #[must_use]
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("sweep_interval_ms must be non-zero".into()));
        }
        self.session.validate()
    }
}
