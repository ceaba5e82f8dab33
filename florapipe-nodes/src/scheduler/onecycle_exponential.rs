//! Piecewise exponential schedule

use florapipe_core::error::{Error, Result};

use super::Schedule;

/// Exponential rise then decay between three stage boundaries
///
/// The rate multiplies by a constant factor per step: up from the base to
/// `base * scale1` across `[stage0, stage1)`, then down to `base * scale2`
/// across `[stage1, stage2]`, then holds. The per-stage factors are
/// derived from the scales at construction, so the rate at any step is a
/// closed-form function of the step index.
pub struct OneCycleExponential {
    stage0: i64,
    stage1: i64,
    stage2: i64,
    gamma0: f64,
    gamma1: f64,
}

impl OneCycleExponential {
    /// Build the shape from the stage boundaries and scales
    pub fn new(stage0: usize, stage1: usize, stage2: usize, scale1: f64, scale2: f64) -> Result<Self> {
        if !(stage0 < stage1 && stage1 < stage2) {
            return Err(Error::config(
                "stage boundaries must satisfy stage0 < stage1 < stage2",
            ));
        }
        if scale1 <= 0.0 || scale2 <= 0.0 {
            return Err(Error::config("scales must be positive"));
        }

        let rise = (stage1 - stage0) as f64;
        let fall = (stage2 - stage1) as f64;
        Ok(Self {
            stage0: stage0 as i64,
            stage1: stage1 as i64,
            stage2: stage2 as i64,
            gamma0: scale1.powf(1.0 / rise),
            gamma1: (scale2 / scale1).powf(1.0 / fall),
        })
    }
}

impl Schedule for OneCycleExponential {
    const NAME: &'static str = "OneCycleExponential";

    fn rates(&self, step: i64, base: &[f64]) -> Vec<f64> {
        // number of rise and fall factors accumulated through this step
        let rises = (step + 1).clamp(self.stage0, self.stage1) - self.stage0;
        let falls = (step + 1).clamp(self.stage1, self.stage2 + 1) - self.stage1;
        let factor = self.gamma0.powi(rises as i32) * self.gamma1.powi(falls as i32);

        base.iter().map(|&b| b * factor).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rise_fall_and_hold() {
        // x10 per step up to step 1, then x0.1 per step through step 4
        let shape = OneCycleExponential::new(0, 2, 4, 100.0, 1.0).unwrap();
        let base = [0.001];

        let lr = |step| shape.rates(step, &base)[0];
        assert!((lr(0) - 0.01).abs() < 1e-12);
        assert!((lr(1) - 0.1).abs() < 1e-12);
        assert!((lr(2) - 0.01).abs() < 1e-12);
        assert!((lr(3) - 0.001).abs() < 1e-12);
        assert!((lr(4) - 0.0001).abs() < 1e-12);
        // holds after stage2
        assert!((lr(10) - 0.0001).abs() < 1e-12);
    }

    #[test]
    fn test_flat_before_stage0() {
        let shape = OneCycleExponential::new(3, 5, 8, 100.0, 1.0).unwrap();
        let base = [0.01];

        assert!((shape.rates(0, &base)[0] - 0.01).abs() < 1e-12);
        assert!((shape.rates(2, &base)[0] - 0.01).abs() < 1e-12);
        assert!(shape.rates(3, &base)[0] > 0.01);
    }

    #[test]
    fn test_invalid_boundaries() {
        assert!(OneCycleExponential::new(5, 5, 10, 10.0, 0.1).is_err());
        assert!(OneCycleExponential::new(0, 10, 5, 10.0, 0.1).is_err());
    }
}
