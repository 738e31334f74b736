use rand::Rng;
use std::time::Duration;

/// Delay before retrying an account after consecutive failed passes.
///
/// Doubles per failure up to `max`; with jitter the delay is drawn from the
/// upper half of that range so retries never collapse to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn after_failures(&self, failures: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.after_failures_with_rng(failures, &mut rng)
    }

    pub fn after_failures_with_rng<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = (failures - 1).min(24);
        let ceiling = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(ceiling / 2..=ceiling)
        } else {
            ceiling
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn no_failures_means_no_delay() {
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(3600), true);
        assert_eq!(backoff.after_failures(0), Duration::ZERO);
    }

    #[test]
    fn doubles_per_failure_up_to_cap() {
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(300), false);
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (1..=5)
            .map(|n| backoff.after_failures_with_rng(n, &mut rng).as_secs())
            .collect();
        assert_eq!(delays, vec![60, 120, 240, 300, 300]);
    }

    #[test]
    fn jitter_stays_in_upper_half() {
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(3600), true);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let delay = backoff.after_failures_with_rng(3, &mut rng);
            assert!(delay >= Duration::from_secs(120));
            assert!(delay <= Duration::from_secs(240));
        }
    }

    #[test]
    fn huge_failure_counts_do_not_overflow() {
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(3600), false);
        assert_eq!(backoff.after_failures(u32::MAX), Duration::from_secs(3600));
    }
}
