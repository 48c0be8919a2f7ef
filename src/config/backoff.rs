// ABOUTME: Poll pacing policies for health checks.
// ABOUTME: Fixed or exponential delays with a deterministic total budget.

use serde::Deserialize;
use std::time::Duration;

/// How long to wait between health-check attempts.
///
/// The total budget for a phase is fully determined by the policy and the
/// attempt count, so phase timeouts are explicit arithmetic rather than loop
/// bounds buried in retry code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum BackoffPolicy {
    /// Constant delay between attempts.
    Fixed {
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },

    /// Delay doubles each attempt, capped.
    Exponential {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        cap: Duration,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed {
            interval: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the given attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { interval } => interval,
            BackoffPolicy::Exponential { initial, cap } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(cap)
            }
        }
    }

    /// Total sleep time across `max_attempts` attempts. The last attempt is
    /// not followed by a delay, so this is the sum of `max_attempts - 1`
    /// delays. A phase's health wait is bounded by this plus probe time.
    pub fn budget(&self, max_attempts: u32) -> Duration {
        (1..max_attempts).map(|attempt| self.delay(attempt)).sum()
    }
}
