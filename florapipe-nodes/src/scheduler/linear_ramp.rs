//! Linear ramp schedule, stepped per batch
//!
//! Primarily a learning-rate finder: ramps each group's rate linearly
//! from its base toward `final_lr` over `cycle_len` steps, then restarts
//! the cycle with the base scaled by `cycle_scale`.

use super::Schedule;

/// Per-batch linear ramp toward a target rate
pub struct BatchLinearRamp {
    final_lr: f64,
    cycle_len: i64,
    cycle_scale: f64,
}

impl BatchLinearRamp {
    /// Ramp toward `final_lr` over `cycle_len` steps per cycle
    pub fn new(final_lr: f64, cycle_len: usize, cycle_scale: f64) -> Self {
        Self {
            final_lr,
            cycle_len: cycle_len.max(1) as i64,
            cycle_scale,
        }
    }
}

impl Schedule for BatchLinearRamp {
    const NAME: &'static str = "BatchLinearRamp";

    fn rates(&self, step: i64, base: &[f64]) -> Vec<f64> {
        let cycle = step / self.cycle_len;
        let cur = step % self.cycle_len;
        let max_step = self.cycle_len - 1;
        let step_scale = if max_step > 0 {
            cur as f64 / max_step as f64
        } else {
            1.0
        };

        base.iter()
            .map(|&b| {
                let start = b * self.cycle_scale.powi(cycle as i32);
                (start + step_scale * (self.final_lr - start)).min(self.final_lr)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramps_linearly_to_final() {
        let ramp = BatchLinearRamp::new(0.01, 10, 1.0);
        let base = [0.001];

        assert_eq!(ramp.rates(0, &base), vec![0.001]);
        assert_eq!(ramp.rates(9, &base), vec![0.01]);

        let mid = ramp.rates(5, &base)[0];
        let expected = 0.001 + (5.0 / 9.0) * 0.009;
        assert!((mid - expected).abs() < 1e-12);

        // monotonic within the cycle
        let mut prev = 0.0;
        for step in 0..10 {
            let lr = ramp.rates(step, &base)[0];
            assert!(lr >= prev);
            prev = lr;
        }
    }

    #[test]
    fn test_cycle_restarts_scaled() {
        let ramp = BatchLinearRamp::new(0.01, 10, 0.5);
        let base = [0.001];

        assert!((ramp.rates(10, &base)[0] - 0.0005).abs() < 1e-12);
        assert!((ramp.rates(20, &base)[0] - 0.00025).abs() < 1e-12);
    }

    #[test]
    fn test_never_exceeds_final() {
        let ramp = BatchLinearRamp::new(0.01, 4, 1.0);
        for step in 0..20 {
            assert!(ramp.rates(step, &[0.002])[0] <= 0.01);
        }
    }
}
