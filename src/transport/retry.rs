use std::cmp::min;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// number of retries after the initial attempt
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// growth factor of the delay between retries, in eighths (i.e. 16 doubles the delay)
    pub delay_factor_eighths: u32,
}
impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            delay_factor_eighths: 16,
        }
    }
}

/// The delay schedule for retrying a single send operation: exponentially increasing, capped,
///  and bounded in the number of retries so a caller is never blocked indefinitely.
pub struct RetryBackoff {
    retries: usize,
    next_delay: Duration,

    config_max_retries: usize,
    config_max_delay: Duration,
    config_delay_factor_eighths: u32,
}

impl RetryBackoff {
    pub fn new(config: &RetryConfig) -> Self {
        let result = RetryBackoff {
            retries: 0,
            next_delay: config.initial_delay,
            config_max_retries: config.max_retries,
            config_max_delay: config.max_delay,
            config_delay_factor_eighths: config.delay_factor_eighths,
        };

        assert!(result.config_delay_factor_eighths >= 8);

        result
    }

    /// the number of attempts so far, including the initial one
    pub fn attempts(&self) -> usize {
        self.retries + 1
    }

    /// Returns the delay to wait before the next retry, or `None` if the retry budget is used up
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.config_max_retries {
            return None;
        }

        self.retries += 1;
        let result = self.next_delay;
        self.next_delay = min((self.next_delay * self.config_delay_factor_eighths) / 8, self.config_max_delay);
        Some(result)
    }
}
