//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `RAMIFY_COUNTER_RETRY_LIMIT`: Max optimistic-lock retries per counter write (default: 8)
//! - `RAMIFY_LEAVE_POLL_INTERVAL_MS`: Leave worker poll interval (default: 50)
//! - `RAMIFY_LEAVE_BATCH_SIZE`: Completion records drained per leave job (default: 256)
//! - `RAMIFY_LEAVE_MAX_ATTEMPTS`: Leave job attempts before dead-lettering (default: 5)
//! - `RAMIFY_LEAVE_BACKOFF`: Requeue backoff kind: none | linear | exponential (default: exponential)
//! - `RAMIFY_LEAVE_BACKOFF_BASE_MS`: Requeue backoff base delay (default: 100)
//! - `RAMIFY_LEAVE_BACKOFF_MULTIPLIER`: Exponential multiplier (default: 2.0)
//! - `RAMIFY_LEAVE_JITTER_MS`: Max random jitter added per requeue (default: 25)
//!
//! The retry bound and the backoff shape are operational tunables, not
//! algorithmic constants.

use std::{env, time::Duration};

use anyhow::{Context, Result, bail};

use crate::backoff::BackoffConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded retries for the optimistic counter read-modify-write loop.
    pub counter_retry_limit: u32,
    pub leave: LeaveConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            counter_retry_limit: 8,
            leave: LeaveConfig::default(),
        }
    }
}

/// Settings for the async no-wait-state leave worker.
#[derive(Debug, Clone)]
pub struct LeaveConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    pub jitter_ms: u64,
}

impl Default for LeaveConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            batch_size: 256,
            max_attempts: 5,
            backoff: BackoffConfig::Exponential {
                base_delay_ms: 100,
                multiplier: 2.0,
            },
            jitter_ms: 25,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` if present, then reads from the environment; every
    /// variable falls back to its default.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let counter_retry_limit =
            parse_var("RAMIFY_COUNTER_RETRY_LIMIT", defaults.counter_retry_limit)?;

        let poll_interval_ms = parse_var(
            "RAMIFY_LEAVE_POLL_INTERVAL_MS",
            defaults.leave.poll_interval.as_millis() as u64,
        )?;
        let batch_size = parse_var("RAMIFY_LEAVE_BATCH_SIZE", defaults.leave.batch_size)?;
        let max_attempts = parse_var("RAMIFY_LEAVE_MAX_ATTEMPTS", defaults.leave.max_attempts)?;
        let jitter_ms = parse_var("RAMIFY_LEAVE_JITTER_MS", defaults.leave.jitter_ms)?;

        let backoff_kind =
            env::var("RAMIFY_LEAVE_BACKOFF").unwrap_or_else(|_| "exponential".to_string());
        let backoff_base_ms = parse_var("RAMIFY_LEAVE_BACKOFF_BASE_MS", 100u64)?;
        let backoff_multiplier: f64 = parse_var("RAMIFY_LEAVE_BACKOFF_MULTIPLIER", 2.0f64)?;
        let Some(backoff) =
            BackoffConfig::parse(&backoff_kind, backoff_base_ms, Some(backoff_multiplier))
        else {
            bail!("invalid RAMIFY_LEAVE_BACKOFF kind: {backoff_kind}");
        };

        Ok(Self {
            counter_retry_limit,
            leave: LeaveConfig {
                poll_interval: Duration::from_millis(poll_interval_ms),
                batch_size,
                max_attempts,
                backoff,
                jitter_ms,
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw.parse().context(format!("invalid {name}")),
        Err(_) => Ok(default),
    }
}
