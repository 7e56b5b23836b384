//! Retry backoff for requeued leave jobs.

use std::time::Duration;

/// Default exponential multiplier when not specified
pub const DEFAULT_EXPONENTIAL_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BackoffConfig {
    /// No delay between retries (immediate retry)
    #[default]
    None,
    /// Linear backoff: delay = base_delay_ms * attempt_number
    Linear { base_delay_ms: u64 },
    /// Exponential backoff: delay = base_delay_ms * multiplier^(attempt_number - 1)
    Exponential { base_delay_ms: u64, multiplier: f64 },
}

impl BackoffConfig {
    pub fn parse(kind: &str, base_delay_ms: u64, multiplier: Option<f64>) -> Option<Self> {
        match kind {
            "none" => Some(Self::None),
            "linear" => Some(Self::Linear { base_delay_ms }),
            "exponential" => Some(Self::Exponential {
                base_delay_ms,
                multiplier: match multiplier {
                    Some(m) if m > 0.0 => m,
                    _ => DEFAULT_EXPONENTIAL_MULTIPLIER,
                },
            }),
            _ => None,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            BackoffConfig::None => "none",
            BackoffConfig::Linear { .. } => "linear",
            BackoffConfig::Exponential { .. } => "exponential",
        }
    }

    pub fn delay_ms(&self, attempt_number: u32) -> u64 {
        if attempt_number == 0 {
            return 0;
        }
        match self {
            BackoffConfig::None => 0,
            BackoffConfig::Linear { base_delay_ms } => {
                base_delay_ms.saturating_mul(attempt_number as u64)
            }
            BackoffConfig::Exponential {
                base_delay_ms,
                multiplier,
            } => {
                // delay = base_delay * multiplier^(attempt - 1)
                let factor = multiplier.powf((attempt_number - 1) as f64);
                ((*base_delay_ms as f64) * factor) as u64
            }
        }
    }

    pub fn delay_for_attempt(&self, attempt_number: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt_number))
    }
}
