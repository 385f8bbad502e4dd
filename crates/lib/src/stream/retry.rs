//! Reconnect policy for the socket transport, independent of any socket.

use std::time::Duration;

/// At most `max_attempts` connections per stream. The delay before the next one grows
/// linearly (`base × attempts`) and never exceeds `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl ReconnectPolicy {
    pub fn linear(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
        }
    }

    /// Delay before the next connection after `attempts` connections have been made,
    /// or None when the ceiling is reached.
    pub fn delay_after(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            return None;
        }
        Some(self.base.saturating_mul(attempts).min(self.cap))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_millis(800), Duration::from_millis(2500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_allows_three_connections() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.delay_after(1), Some(Duration::from_millis(800)));
        assert_eq!(p.delay_after(2), Some(Duration::from_millis(1600)));
        assert_eq!(p.delay_after(3), None);
    }

    #[test]
    fn linear_backoff_is_capped() {
        let p = ReconnectPolicy::linear(10, Duration::from_millis(800), Duration::from_millis(2500));
        assert_eq!(p.delay_after(4), Some(Duration::from_millis(2500)));
        assert_eq!(p.delay_after(9), Some(Duration::from_millis(2500)));
        assert_eq!(p.delay_after(10), None);
    }

    #[test]
    fn single_attempt_never_reconnects() {
        let p = ReconnectPolicy::linear(1, Duration::ZERO, Duration::ZERO);
        assert_eq!(p.delay_after(1), None);
    }
}
