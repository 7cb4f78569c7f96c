use std::time::Duration;

/// Overlay tuning knobs.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Live peers a bin needs before it counts as saturated.
    pub min_bin_size: usize,
    /// Nearest peers forming the neighbourhood for depth purposes.
    pub neighbourhood_size: usize,
    /// Base wait between dial attempts for the same address.
    pub retry_interval: Duration,
    /// Backoff multiplier applied per failed attempt.
    pub retry_exponent: u32,
    /// Attempts after which an address is no longer suggested.
    pub max_retries: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            min_bin_size: 2,
            neighbourhood_size: 2,
            retry_interval: Duration::from_secs(1),
            retry_exponent: 2,
            max_retries: 42,
        }
    }
}

impl OverlayConfig {
    pub fn with_min_bin_size(mut self, min_bin_size: usize) -> Self {
        self.min_bin_size = min_bin_size;
        self
    }

    pub fn with_neighbourhood_size(mut self, neighbourhood_size: usize) -> Self {
        self.neighbourhood_size = neighbourhood_size;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_retry_exponent(mut self, retry_exponent: u32) -> Self {
        self.retry_exponent = retry_exponent;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Wait required before attempt number `retries + 1`.
    pub(crate) fn backoff(&self, retries: u32) -> Duration {
        let factor = self.retry_exponent.saturating_pow(retries);
        self.retry_interval.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let config = OverlayConfig::default().with_retry_interval(Duration::from_secs(1));
        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(5), Duration::from_secs(32));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let config = OverlayConfig::default();
        let huge = config.backoff(10_000);
        assert!(huge >= config.backoff(41));
    }
}
