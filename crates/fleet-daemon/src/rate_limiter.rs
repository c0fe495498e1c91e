//! Per-transport send budget for outbound notifications.
//!
//! A token bucket refilled continuously at `per_minute / 60` tokens per
//! second, capped at `per_minute`. A fresh transport may spend its whole
//! minute at once; after that sends trickle out at the refill rate.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("{transport}: {per_minute}/min budget spent; next send in {retry_after:?}")]
    Exhausted {
        transport: String,
        per_minute: u64,
        retry_after: Duration,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub per_minute: u64,
}

impl RateLimitConfig {
    pub fn per_minute(per_minute: u64) -> Self {
        Self { per_minute }
    }

    fn refill_per_sec(&self) -> f64 {
        self.per_minute as f64 / 60.0
    }

    fn capacity(&self) -> f64 {
        self.per_minute as f64
    }
}

#[derive(Debug)]
struct Budget {
    available: f64,
    checked_at: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    budgets: DashMap<String, Budget>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            budgets: DashMap::new(),
        }
    }

    /// Spend one send from `transport`'s budget.
    pub fn check(&self, transport: &str) -> Result<(), RateLimitError> {
        let cfg = self.config;
        let mut budget = self.budgets.entry(transport.to_string()).or_insert_with(|| Budget {
            available: cfg.capacity(),
            checked_at: Instant::now(),
        });

        let now = Instant::now();
        let elapsed = now.duration_since(budget.checked_at).as_secs_f64();
        budget.available = (budget.available + elapsed * cfg.refill_per_sec()).min(cfg.capacity());
        budget.checked_at = now;

        if budget.available >= 1.0 {
            budget.available -= 1.0;
            return Ok(());
        }

        let retry_after = if cfg.per_minute == 0 {
            Duration::MAX
        } else {
            Duration::from_secs_f64((1.0 - budget.available) / cfg.refill_per_sec())
        };
        warn!(transport, ?retry_after, "notification rate limit hit");
        Err(RateLimitError::Exhausted {
            transport: transport.to_string(),
            per_minute: cfg.per_minute,
            retry_after,
        })
    }
}
