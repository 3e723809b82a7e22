//! Storm Budget
//!
//! A sliding-window counter that caps how often a session may re-render or
//! fan out asynchronous triggers. A rejected acquisition does not consume a
//! slot, and the caller must not run the work.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::BudgetError;

/// Limit of `max_triggers` acquisitions per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_triggers: u32,
    pub window_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_triggers: 10,
            window_ms: 1_000,
        }
    }
}

impl BudgetConfig {
    #[inline]
    #[must_use]
    pub fn new(max_triggers: u32, window: Duration) -> Self {
        Self {
            max_triggers,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone)]
pub struct StormBudget {
    config: BudgetConfig,
    hits: VecDeque<Instant>,
    rejected: u64,
}

impl StormBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            hits: VecDeque::with_capacity(config.max_triggers as usize),
            rejected: 0,
        }
    }

    pub fn config(&self) -> BudgetConfig {
        self.config
    }

    /// Take one slot now.
    pub fn try_acquire(&mut self) -> Result<(), BudgetError> {
        self.try_acquire_at(Instant::now())
    }

    /// Take one slot at `now`.
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), BudgetError> {
        let window = self.config.window();
        while let Some(oldest) = self.hits.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }

        if self.hits.len() >= self.config.max_triggers as usize {
            self.rejected += 1;
            tracing::warn!(
                limit = self.config.max_triggers,
                window_ms = self.config.window_ms,
                "storm budget exceeded"
            );
            return Err(BudgetError::Exceeded {
                limit: self.config.max_triggers,
                window,
            });
        }

        self.hits.push_back(now);
        Ok(())
    }

    /// Run `f` if a slot is available at `now`.
    pub fn run<R>(&mut self, now: Instant, f: impl FnOnce() -> R) -> Result<R, BudgetError> {
        self.try_acquire_at(now)?;
        Ok(f())
    }

    /// Slots taken inside the current window as of the last acquisition.
    pub fn in_window(&self) -> usize {
        self.hits.len()
    }

    /// Total rejected acquisitions.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}
