//! Reconnect backoff for the agent control channel

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Reconnect configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Ceiling for the exponential growth
    pub max_delay: Duration,
    /// Growth factor applied after every attempt
    pub multiplier: f64,
    /// Give up after this many attempts (None = retry forever)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Reconnect errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Gave up after {0} reconnect attempts")]
    AttemptsExhausted(usize),
}

/// Bounded exponential backoff state machine
///
/// `wait` sleeps for the current delay and advances it; `reset` is called
/// after the session reaches its registered state again so the next outage
/// starts from the initial delay.
pub struct ReconnectManager {
    config: ReconnectConfig,
    next_delay: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            next_delay: config.initial_delay,
            config,
            attempt: 0,
        }
    }

    /// Sleep until the next attempt is due
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max) = self.config.max_attempts {
            if self.attempt > max {
                return Err(ReconnectError::AttemptsExhausted(max));
            }
        }

        debug!(
            attempt = self.attempt,
            delay_ms = self.next_delay.as_millis() as u64,
            "Waiting before reconnect"
        );
        sleep(self.next_delay).await;

        let grown = self.next_delay.as_secs_f64() * self.config.multiplier;
        self.next_delay = Duration::from_secs_f64(grown).min(self.config.max_delay);

        Ok(())
    }

    /// Reset after a successful reconnect
    pub fn reset(&mut self) {
        self.next_delay = self.config.initial_delay;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    #[tokio::test]
    async fn test_delay_doubles_until_cap() {
        let mut manager = ReconnectManager::new(fast_config());

        assert_eq!(manager.next_delay(), Duration::from_millis(10));

        manager.wait().await.unwrap();
        assert_eq!(manager.next_delay(), Duration::from_millis(20));

        manager.wait().await.unwrap();
        assert_eq!(manager.next_delay(), Duration::from_millis(40));

        manager.wait().await.unwrap();
        assert_eq!(manager.next_delay(), Duration::from_millis(80));

        manager.wait().await.unwrap();
        assert_eq!(manager.next_delay(), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_reset_restores_initial_delay() {
        let mut manager = ReconnectManager::new(fast_config());

        manager.wait().await.unwrap();
        manager.wait().await.unwrap();
        assert_eq!(manager.attempt(), 2);

        manager.reset();
        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.next_delay(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let mut manager = ReconnectManager::new(ReconnectConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            max_attempts: Some(2),
        });

        assert!(manager.wait().await.is_ok());
        assert!(manager.wait().await.is_ok());
        assert!(matches!(
            manager.wait().await,
            Err(ReconnectError::AttemptsExhausted(2))
        ));
    }
}
