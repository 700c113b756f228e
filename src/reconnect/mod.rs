//! Reconnect supervisor
//!
//! Decides, after every failed connection, whether and when to try again.
//! Everything here is pure; the client event loop owns the timers.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub base_delay_ms: u64,
    pub multiplier: f64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Fraction of each delay that may be randomly shaved off, 0.0..=1.0
    pub jitter: f64,
    /// Consecutive failed attempts before giving up (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect `attempt` (1-based), without jitter
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            delay as u64
        }
    }

    /// Applies the configured jitter to `delay_ms`.
    pub fn apply_jitter(&self, delay_ms: u64) -> u64 {
        if self.jitter <= 0.0 || delay_ms == 0 {
            return delay_ms;
        }
        let jitter = self.jitter.min(1.0);
        let factor = 1.0 - rand::thread_rng().gen_range(0.0..=jitter);
        (delay_ms as f64 * factor) as u64
    }

    /// Sum of all delays when the number of attempts is bounded
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .fold(0u64, u64::saturating_add)
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(format!("reconnect multiplier must be >= 1.0, got {}", self.multiplier));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(format!(
                "reconnect base delay {} ms exceeds the cap of {} ms",
                self.base_delay_ms, self.max_delay_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("reconnect jitter must be within 0.0..=1.0, got {}", self.jitter));
        }
        if self.max_attempts == Some(0) {
            return Err("reconnect max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Whether to retry after `current_attempts` consecutive failed reconnects.
pub fn should_attempt_reconnection(
    current_attempts: u32,
    config: &ReconnectConfig,
    shutdown_requested: bool,
) -> ReconnectDecision {
    if shutdown_requested {
        return ReconnectDecision::AbortShutdownRequested;
    }
    if let Some(max_attempts) = config.max_attempts {
        if current_attempts >= max_attempts {
            return ReconnectDecision::AbortMaxAttemptsExceeded;
        }
    }
    let attempt = current_attempts + 1;
    ReconnectDecision::Proceed {
        attempt,
        delay_ms: config.apply_jitter(config.calculate_backoff_delay(attempt)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Connected,
    Backoff { attempt: u32, delay_ms: u64 },
    GivenUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    config: ReconnectConfig,
    state: SupervisorState,
    attempts: u32,
}

impl Supervisor {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: SupervisorState::Idle,
            attempts: 0,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: ReconnectConfig) {
        self.config = config;
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Consecutive reconnect attempts since the last successful CONNACK
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Explicit connect: leaves GIVEN_UP and starts counting afresh.
    pub fn start(&mut self) {
        self.attempts = 0;
        self.state = SupervisorState::Idle;
    }

    pub fn on_connected(&mut self) {
        if self.attempts > 0 {
            info!(attempts = self.attempts, "Reconnected to broker");
        }
        self.attempts = 0;
        self.state = SupervisorState::Connected;
    }

    /// Records a failed connection and decides what happens next.
    pub fn on_failure(&mut self, shutdown_requested: bool) -> ReconnectDecision {
        let decision = should_attempt_reconnection(self.attempts, &self.config, shutdown_requested);
        match &decision {
            ReconnectDecision::Proceed { attempt, delay_ms } => {
                info!(attempt, delay_ms, "Scheduling reconnect");
                self.attempts = *attempt;
                self.state = SupervisorState::Backoff {
                    attempt: *attempt,
                    delay_ms: *delay_ms,
                };
            }
            ReconnectDecision::AbortShutdownRequested => {
                self.state = SupervisorState::Idle;
            }
            ReconnectDecision::AbortMaxAttemptsExceeded => {
                error!(attempts = self.attempts, "Giving up on reconnecting");
                self.state = SupervisorState::GivenUp {
                    attempts: self.attempts,
                };
            }
        }
        decision
    }

    /// Explicit disconnect; suppresses any scheduled retry.
    pub fn stop(&mut self) {
        self.state = SupervisorState::Idle;
    }

    pub fn backoff_delay(&self) -> Option<Duration> {
        match self.state {
            SupervisorState::Backoff { delay_ms, .. } => Some(Duration::from_millis(delay_ms)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_with_cap() {
        let config = ReconnectConfig::default();
        let delays: Vec<u64> = (1..=7).map(|a| config.calculate_backoff_delay(a)).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(config.calculate_backoff_delay(u32::MAX), 30000);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = ReconnectConfig {
            jitter: 0.5,
            ..ReconnectConfig::default()
        };
        for _ in 0..200 {
            let delay = config.apply_jitter(1000);
            assert!((500..=1000).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig {
            max_attempts: Some(2),
            ..ReconnectConfig::default()
        };
        assert_eq!(
            should_attempt_reconnection(0, &config, false),
            ReconnectDecision::Proceed {
                attempt: 1,
                delay_ms: 1000
            }
        );
        assert_eq!(
            should_attempt_reconnection(0, &config, true),
            ReconnectDecision::AbortShutdownRequested
        );
        assert_eq!(
            should_attempt_reconnection(2, &config, false),
            ReconnectDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_supervisor_gives_up_after_max_attempts() {
        let mut supervisor = Supervisor::new(ReconnectConfig {
            max_attempts: Some(2),
            ..ReconnectConfig::default()
        });
        assert!(matches!(supervisor.on_failure(false), ReconnectDecision::Proceed { attempt: 1, .. }));
        assert!(matches!(supervisor.on_failure(false), ReconnectDecision::Proceed { attempt: 2, .. }));
        assert_eq!(supervisor.on_failure(false), ReconnectDecision::AbortMaxAttemptsExceeded);
        assert_eq!(supervisor.state(), SupervisorState::GivenUp { attempts: 2 });

        supervisor.start();
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert_eq!(supervisor.attempts(), 0);
    }

    #[test]
    fn test_connack_resets_backoff() {
        let mut supervisor = Supervisor::new(ReconnectConfig::default());
        supervisor.on_failure(false);
        supervisor.on_failure(false);
        assert_eq!(supervisor.backoff_delay(), Some(Duration::from_millis(2000)));

        supervisor.on_connected();
        assert_eq!(supervisor.state(), SupervisorState::Connected);
        assert_eq!(
            supervisor.on_failure(false),
            ReconnectDecision::Proceed {
                attempt: 1,
                delay_ms: 1000
            }
        );
    }

    #[test]
    fn test_stop_suppresses_retry() {
        let mut supervisor = Supervisor::new(ReconnectConfig::default());
        supervisor.on_failure(false);
        supervisor.stop();
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert_eq!(supervisor.backoff_delay(), None);
    }

    #[test]
    fn test_validate() {
        assert!(ReconnectConfig::default().validate().is_ok());
        for bad in [
            ReconnectConfig { multiplier: 0.5, ..Default::default() },
            ReconnectConfig { base_delay_ms: 60_000, ..Default::default() },
            ReconnectConfig { jitter: 1.5, ..Default::default() },
            ReconnectConfig { max_attempts: Some(0), ..Default::default() },
        ] {
            assert!(bad.validate().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_max_total_time() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            ..ReconnectConfig::default()
        };
        assert_eq!(config.calculate_max_total_time(), Some(7000));
        assert_eq!(ReconnectConfig::default().calculate_max_total_time(), None);
    }
}
