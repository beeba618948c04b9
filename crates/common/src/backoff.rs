use std::{
    cmp,
    ops::Div,
    time::Duration,
};

use rand::Rng;

/// Full-jitter exponential backoff. Background loops construct one of these,
/// call `fail` on each error to get the next delay, and `reset` after a
/// successful pass.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    /// Ensures that `fail` will return the max_backoff value the next time it
    /// is called.
    pub fn max_backoff(&mut self) {
        self.num_failures = u32::MAX.div(2);
    }

    pub fn fail(&mut self, rng: &mut impl Rng) -> Duration {
        // See https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/
        let p = 2u32.checked_pow(self.num_failures).unwrap_or(u32::MAX);
        self.num_failures += 1;
        let jitter = rng.random::<f32>();
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        cmp::min(backoff, self.max_backoff).mul_f32(jitter)
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }

    pub fn set_failures(&mut self, failures: u32) {
        self.num_failures = failures;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    use super::Backoff;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        let mut rng = ChaCha12Rng::seed_from_u64(0);
        for expected_cap_secs in [1, 2, 4, 8, 8, 8] {
            let delay = backoff.fail(&mut rng);
            assert!(delay <= Duration::from_secs(expected_cap_secs));
        }
        assert_eq!(backoff.failures(), 6);
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        let delay = backoff.fail(&mut rng);
        assert!(delay <= Duration::from_secs(1));
    }

    #[test]
    fn test_max_backoff_jumps_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(60));
        backoff.max_backoff();
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let delay = backoff.fail(&mut rng);
        assert!(delay <= Duration::from_secs(60));
    }
}
