//! Reconnect delay computation.
//!
//! Delays grow multiplicatively from a randomized initial value toward a
//! cap, with jitter on every step so a fleet of gateways does not hammer a
//! recovering broker in lockstep. After a sustained period of connectivity
//! the sequence starts over from the initial delay.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Per-connection backoff state.
///
/// Owned by a single connection actor; never shared.
#[derive(Debug)]
pub(crate) struct BackoffPolicy {
    config: BackoffConfig,
    current: Option<Duration>,
}

impl BackoffPolicy {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    /// Compute the delay before the next connection attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let mut rng = rand::thread_rng();
        let base = match self.current {
            None => {
                let min = self.config.initial_min.min(self.config.initial_max);
                let max = self.config.initial_max.max(self.config.initial_min);
                if min == max {
                    min
                } else {
                    Duration::from_secs_f64(rng.gen_range(min.as_secs_f64()..max.as_secs_f64()))
                }
            }
            Some(previous) => previous.mul_f64(self.config.factor.max(1.0)).min(self.config.max),
        };
        self.current = Some(base);
        let jitter = if self.config.jitter > 0.0 {
            base.mul_f64(rng.gen_range(0.0..self.config.jitter))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.config.max)
    }

    /// Forget accumulated growth after a stable connection.
    pub(crate) fn reset(&mut self) { self.current = None; }

    /// How long a connection must stay up before [`reset`](Self::reset)
    /// applies.
    pub(crate) fn stability_reset(&self) -> Duration { self.config.stability_reset }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_config() -> BackoffConfig {
        BackoffConfig {
            initial_min: Duration::from_millis(100),
            initial_max: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.0,
            max: Duration::from_secs(1),
            stability_reset: Duration::from_secs(60),
        }
    }

    #[test]
    fn delays_grow_multiplicatively_to_the_cap() {
        let mut backoff = BackoffPolicy::new(fixed_config());
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn reset_returns_to_the_initial_delay() {
        let mut backoff = BackoffPolicy::new(fixed_config());
        let first = backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), first);
    }

    #[test]
    fn jitter_stays_within_the_configured_fraction() {
        let config = BackoffConfig {
            jitter: 0.25,
            ..fixed_config()
        };
        let mut backoff = BackoffPolicy::new(config);
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(1));
        }
    }

    #[test]
    fn randomized_initial_delay_is_within_bounds() {
        let config = BackoffConfig {
            initial_min: Duration::from_millis(500),
            initial_max: Duration::from_secs(2),
            jitter: 0.0,
            ..BackoffConfig::default()
        };
        for _ in 0..20 {
            let mut backoff = BackoffPolicy::new(config.clone());
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_secs(2));
        }
    }
}
