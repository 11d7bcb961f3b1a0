use core::time::Duration;

use log::{info, warn};

use crate::config::OtaConfig;

/// Re-flashing identical firmware is never attempted; any byte difference
/// in the version identifier is enough to update.
pub fn should_attempt(candidate_version: &str, running_version: &str) -> bool {
    candidate_version.as_bytes() != running_version.as_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u8,
    pub retry_interval: Duration,
    pub cooldown: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OtaConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the short interval.
    RetryAfter(Duration),
    /// Retries exhausted; the counter is reset and the next check waits for
    /// the cooldown.
    Cooldown(Duration),
}

impl RetryDecision {
    pub fn delay(self) -> Duration {
        match self {
            Self::RetryAfter(delay) | Self::Cooldown(delay) => delay,
        }
    }
}

/// Consecutive failed fetch/apply attempts in the current cycle. Lives only
/// in memory.
#[derive(Debug, Clone)]
pub struct RetryCounter {
    policy: RetryPolicy,
    failures: u8,
}

impl RetryCounter {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn count(&self) -> u8 {
        self.failures
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);

        if self.failures < self.policy.max_retries {
            warn!(
                "update attempt {} of {} failed; retrying in {}s",
                self.failures,
                self.policy.max_retries,
                self.policy.retry_interval.as_secs()
            );
            return RetryDecision::RetryAfter(self.policy.retry_interval);
        }

        warn!(
            "update failed {} times; next check in {} minutes",
            self.failures,
            self.policy.cooldown.as_secs() / 60
        );
        self.failures = 0;
        RetryDecision::Cooldown(self.policy.cooldown)
    }
}

pub fn log_version_decision(candidate_version: &str, running_version: &str) -> bool {
    let attempt = should_attempt(candidate_version, running_version);
    if attempt {
        info!("running firmware version: {running_version}");
        info!("new firmware version: {candidate_version}");
    } else {
        warn!(
            "current running version is the same as the new one; not updating ({running_version})"
        );
    }
    attempt
}
