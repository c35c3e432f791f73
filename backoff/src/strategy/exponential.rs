use std::time::Duration;

use rand::Rng;

const DEFAULT_FACTOR: f64 = 2.0;

/// Exponential backoff: the n-th delay is `base * factor^(n - 1)`, capped at `max_delay` and
/// spread by `jitter` (0.0 disables randomization). The iterator is unbounded; the caller bounds
/// the number of retries with `take`.
///
/// ```
/// use std::time::Duration;
/// use backoff::strategy::exponential::Exponential;
///
/// let delays: Vec<_> = Exponential::new(Duration::from_secs(1))
///     .max_delay(Duration::from_secs(3))
///     .take(4)
///     .collect();
/// assert_eq!(
///     delays,
///     vec![
///         Duration::from_secs(1),
///         Duration::from_secs(2),
///         Duration::from_secs(3),
///         Duration::from_secs(3)
///     ]
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base: Duration,
    factor: f64,
    max_delay: Duration,
    jitter: f64,
    attempt: u32,
}

impl Exponential {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            factor: DEFAULT_FACTOR,
            max_delay: Duration::MAX,
            jitter: 0.0,
            attempt: 0,
        }
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Jitter in `[0.0, 1.0]`; a delay `d` becomes a random value in `[d * (1 - j), d * (1 + j)]`.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut millis = self.base.as_millis() as f64 * self.factor.powi(exponent);
        if self.jitter > 0.0 {
            millis *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }
        let max_millis = self.max_delay.as_millis().min(u64::MAX as u128) as f64;
        Duration::from_millis(millis.min(max_millis) as u64)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay_for(self.attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_factor() {
        let delays: Vec<_> = Exponential::new(Duration::from_millis(100))
            .take(4)
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn custom_factor_and_cap() {
        let mut backoff = Exponential::new(Duration::from_millis(100))
            .factor(3.0)
            .max_delay(Duration::from_millis(500));
        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(500)));
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn factor_below_one_is_flat() {
        let mut backoff = Exponential::new(Duration::from_millis(50)).factor(0.5);
        assert_eq!(backoff.next(), Some(Duration::from_millis(50)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let mut backoff = Exponential::new(Duration::from_millis(100)).jitter(0.5);
        let delay = backoff.next().unwrap();
        assert!(delay >= Duration::from_millis(50));
        assert!(delay <= Duration::from_millis(150));
    }

    #[test]
    fn huge_attempt_saturates_at_cap() {
        let backoff = Exponential::new(Duration::from_secs(1)).max_delay(Duration::from_secs(60));
        assert_eq!(backoff.delay_for(10_000), Duration::from_secs(60));
    }
}
