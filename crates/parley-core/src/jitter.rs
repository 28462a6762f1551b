use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of randomness for pacing jitter.
///
/// Injected into the scheduler so tests can pin batch sizes and pauses.
pub trait Jitter: Send {
    /// A value in `[0, 1)`
    fn unit(&mut self) -> f64;

    /// A value in `[-1, 1)`
    fn signed(&mut self) -> f64 {
        self.unit() * 2.0 - 1.0
    }
}

pub struct RandomJitter {
    rng: StdRng,
}

impl RandomJitter {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomJitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Jitter for RandomJitter {
    fn unit(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}

/// Always returns the same value. `FixedJitter(0.5)` means "no jitter".
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl Jitter for FixedJitter {
    fn unit(&mut self) -> f64 {
        self.0.clamp(0.0, 1.0 - f64::EPSILON)
    }
}

/// Replays a fixed sequence, then repeats the last value.
#[derive(Debug, Clone)]
pub struct SequenceJitter {
    values: Vec<f64>,
    next: usize,
}

impl SequenceJitter {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values, next: 0 }
    }
}

impl Jitter for SequenceJitter {
    fn unit(&mut self) -> f64 {
        let value = self
            .values
            .get(self.next)
            .or_else(|| self.values.last())
            .copied()
            .unwrap_or(0.5);
        self.next += 1;
        value.clamp(0.0, 1.0 - f64::EPSILON)
    }
}
