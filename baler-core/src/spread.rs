//! Clamped exponential delay drawing.
//!
//! Age flushes and sweep runs across a fleet of sidecars must not
//! synchronize: a fixed-period timer started on deploy would have every host
//! flushing at the same instant forever. Drawing each delay from an
//! exponential distribution makes the event stream memoryless, and clamping
//! keeps a single draw from being pathologically short or long.

use std::time::Duration;

use rand::Rng;

use crate::error::{BalerError, Result};

#[derive(Debug, Clone, Copy)]
pub struct Spread {
    min: Duration,
    expected: Duration,
    max: Duration,
}

impl Spread {
    pub fn new(min: Duration, expected: Duration, max: Duration) -> Result<Self> {
        if expected.is_zero() {
            return Err(BalerError::Config(
                "expected delay must be positive".to_string(),
            ));
        }
        if min > expected || expected > max {
            return Err(BalerError::Config(format!(
                "delay bounds must satisfy min <= expected <= max, got {min:?} <= {expected:?} <= {max:?}"
            )));
        }
        Ok(Self { min, expected, max })
    }

    /// A degenerate distribution that always draws `d`. Handy in tests.
    pub fn fixed(d: Duration) -> Self {
        Self {
            min: d,
            expected: d.max(Duration::from_nanos(1)),
            max: d,
        }
    }

    /// One sample of `Exp(1/expected)`, clamped into `[min, max]`.
    pub fn draw(&self) -> Duration {
        let uniform: f64 = 1.0 - rand::thread_rng().gen::<f64>(); // (0, 1]
        let sample = self.expected.as_secs_f64() * -uniform.ln();
        Duration::from_secs_f64(sample.clamp(self.min.as_secs_f64(), self.max.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_disordered_bounds() {
        let s = Duration::from_secs;
        assert!(Spread::new(s(10), s(5), s(20)).is_err());
        assert!(Spread::new(s(1), s(5), s(2)).is_err());
        assert!(Spread::new(s(0), s(0), s(0)).is_err());
        assert!(Spread::new(s(1), s(2), s(3)).is_ok());
    }

    #[test]
    fn draws_stay_clamped() {
        let spread =
            Spread::new(Duration::from_millis(10), Duration::from_millis(20), Duration::from_millis(40))
                .unwrap();
        for _ in 0..1000 {
            let d = spread.draw();
            assert!(d >= Duration::from_millis(10), "{d:?} below min");
            assert!(d <= Duration::from_millis(40), "{d:?} above max");
        }
    }

    #[test]
    fn fixed_always_draws_the_same_value() {
        let spread = Spread::fixed(Duration::from_millis(7));
        for _ in 0..10 {
            assert_eq!(spread.draw(), Duration::from_millis(7));
        }
    }
}
