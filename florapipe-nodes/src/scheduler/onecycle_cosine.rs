//! One-cycle cosine schedule

use std::f64::consts::PI;

use florapipe_core::error::{Error, Result};

use super::Schedule;

/// Cosine ramp up to a peak rate, cosine decay to a final rate, then flat
///
/// The rate rises from the base to `base * peak_scale` over `peak_steps`,
/// decays to `base * final_scale` by `final_steps`, and holds there. With
/// `warmup_step` set, parameter groups unfreeze one at a time: group `g`
/// trains at `warmup_scale` of its rate until step `g * warmup_step`.
pub struct OneCycleCosine {
    peak_steps: i64,
    final_steps: i64,
    peak_scale: f64,
    final_ratio: f64,
    warmup_step: i64,
    warmup_scale: f64,
}

impl OneCycleCosine {
    /// Build the shape; in batch mode the epochs are given in passes and
    /// scaled by `steps_per_epoch` to step granularity
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peak_epoch: usize,
        final_epoch: usize,
        peak_scale: f64,
        final_scale: f64,
        warmup_step: usize,
        warmup_scale: f64,
        steps_per_epoch: usize,
    ) -> Result<Self> {
        if final_epoch < peak_epoch {
            return Err(Error::config(
                "final_epoch must not precede peak_epoch",
            ));
        }
        if peak_scale == 0.0 {
            return Err(Error::config("peak_scale must be non-zero"));
        }
        let scale = steps_per_epoch.max(1) as i64;
        Ok(Self {
            peak_steps: peak_epoch as i64 * scale,
            final_steps: final_epoch as i64 * scale,
            peak_scale,
            final_ratio: final_scale / peak_scale,
            warmup_step: warmup_step as i64,
            warmup_scale,
        })
    }
}

impl Schedule for OneCycleCosine {
    const NAME: &'static str = "OneCycleCosine";

    fn rates(&self, step: i64, base: &[f64]) -> Vec<f64> {
        let mut rates: Vec<f64> = base
            .iter()
            .map(|&b| {
                let peak_lr = b * self.peak_scale;
                if self.peak_steps > 0 && step <= self.peak_steps {
                    let scale = 0.5 * (1.0 - (step as f64 / self.peak_steps as f64 * PI).cos());
                    b + scale * b * (self.peak_scale - 1.0)
                } else if step <= self.final_steps {
                    let span = (self.final_steps - self.peak_steps).max(1);
                    let pos = step - self.peak_steps;
                    let scale = 0.5 * (1.0 - (pos as f64 / span as f64 * PI).cos());
                    peak_lr - scale * peak_lr * (1.0 - self.final_ratio)
                } else {
                    peak_lr * self.final_ratio
                }
            })
            .collect();

        if self.warmup_step > 0 && self.warmup_scale != 1.0 {
            let unlocked = (step / self.warmup_step + 1) as usize;
            for (idx, rate) in rates.iter_mut().enumerate() {
                if idx >= unlocked {
                    *rate *= self.warmup_scale;
                }
            }
        }
        rates
    }
}
