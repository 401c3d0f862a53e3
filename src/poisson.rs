use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::time::Duration;

/// Arrival process of critical-section attempts.
pub struct Poisson<R: Rng + ?Sized> {
    pub rng: Box<R>,
    pub rate: f64,
}

impl Poisson<SmallRng> {
    pub fn new(rate: f64, seed: u64) -> Self {
        Self {
            rng: Box::new(SmallRng::seed_from_u64(seed)),
            rate,
        }
    }
}

impl<R: Rng + ?Sized> Poisson<R> {
    /// Exponentially distributed wait, in seconds, before the next attempt.
    pub fn time_for_next_event(&mut self) -> f64 {
        -(1.0f64 - self.rng.random::<f64>()).ln() / self.rate
    }

    /// `Duration::MAX` when the rate admits no next event.
    pub fn next_delay(&mut self) -> Duration {
        Duration::try_from_secs_f64(self.time_for_next_event()).unwrap_or(Duration::MAX)
    }
}
