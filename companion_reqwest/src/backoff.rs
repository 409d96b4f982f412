//! Error backoff handling for outbound requests

use std::time::Duration;

/// Configuration for how to back off and retry when a request fails in transit
#[derive(Clone, Debug)]
pub struct ErrorBackoffConfig {
    max_attempts: u32,
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u32,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Makes at most 3 attempts, waiting 500 ms after the first failure with a
    /// multiplier of 2. Delays are capped at 15 seconds.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_error_delay: Duration::from_millis(500),
            max_error_delay: Duration::from_secs(15),
            multiplier: 2,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// A request is attempted at most `max_attempts` times. After the first
    /// failure the delay is `initial_error_delay`; each further failure
    /// multiplies it by `multiplier`, capped at `max_error_delay`.
    pub fn new(
        max_attempts: u32,
        initial_error_delay: Duration,
        max_error_delay: Duration,
        multiplier: u32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_error_delay,
            max_error_delay,
            multiplier,
        }
    }

    /// A configuration that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// The maximum number of attempts made for a single request
    #[inline]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// A stateful handler that manages error backoff state
#[derive(Debug)]
pub struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    attempts: u32,
    last_delay: Option<Duration>,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`].
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
            last_delay: None,
        }
    }

    /// Reports a success
    ///
    /// This resets the internal delay state.
    pub fn success(&mut self) {
        self.attempts = 0;
        self.last_delay = None;
    }

    /// Reports a failure and returns the delay before the next attempt
    ///
    /// Returns `None` once the configured number of attempts is used up.
    pub fn error(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.config.max_attempts {
            return None;
        }

        let new_delay = self
            .last_delay
            .map(|d| (d * self.config.multiplier).min(self.config.max_error_delay))
            .unwrap_or(self.config.initial_error_delay);
        self.last_delay = Some(new_delay);
        Some(new_delay)
    }

    /// The number of failures reported since the last success
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoffHandler {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_allows_two_retries_with_doubling_delay() {
        let mut handler = ErrorBackoffHandler::new(ErrorBackoffConfig::default());

        assert_eq!(handler.error(), Some(Duration::from_millis(500)));
        assert_eq!(handler.error(), Some(Duration::from_millis(1000)));
        assert_eq!(handler.error(), None);
    }

    #[test]
    fn delay_is_capped() {
        let config =
            ErrorBackoffConfig::new(10, Duration::from_secs(4), Duration::from_secs(10), 3);
        let mut handler = ErrorBackoffHandler::new(config);

        assert_eq!(handler.error(), Some(Duration::from_secs(4)));
        assert_eq!(handler.error(), Some(Duration::from_secs(10)));
        assert_eq!(handler.error(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn success_resets_state() {
        let mut handler = ErrorBackoffHandler::new(ErrorBackoffConfig::default());
        handler.error();
        handler.error();
        handler.success();

        assert_eq!(handler.attempts(), 0);
        assert_eq!(handler.error(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn no_retry_gives_up_immediately() {
        let mut handler = ErrorBackoffHandler::new(ErrorBackoffConfig::no_retry());
        assert_eq!(handler.error(), None);
    }
}
