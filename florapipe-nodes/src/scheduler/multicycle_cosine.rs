//! Repeating two-stage cosine schedule

use std::f64::consts::PI;

use florapipe_core::error::{Error, Result};

use super::Schedule;

/// Cosine rise over `stage0` steps, cosine fall over `stage1` steps,
/// repeating with the peak scaled by `cycle_scale` each cycle
pub struct MultiCycleCosine {
    stage0: i64,
    stage1: i64,
    peak_scale: f64,
    cycle_scale: f64,
}

impl MultiCycleCosine {
    /// Build the shape from the two stage lengths
    pub fn new(stage0: usize, stage1: usize, peak_scale: f64, cycle_scale: f64) -> Result<Self> {
        if stage0 == 0 || stage1 == 0 {
            return Err(Error::config("stage lengths must be at least 1"));
        }
        Ok(Self {
            stage0: stage0 as i64,
            stage1: stage1 as i64,
            peak_scale,
            cycle_scale,
        })
    }
}

impl Schedule for MultiCycleCosine {
    const NAME: &'static str = "MultiCycleCosine";

    fn rates(&self, step: i64, base: &[f64]) -> Vec<f64> {
        let cycle_steps = self.stage0 + self.stage1;
        let cycle = step / cycle_steps;
        let cycle_step = step % cycle_steps;

        let peak = self.cycle_scale.powi(cycle as i32) * self.peak_scale;
        let scale = if cycle_step < self.stage0 {
            let pos = cycle_step as f64 / self.stage0 as f64;
            (peak - 1.0) * 0.5 * (1.0 - (pos * PI).cos()) + 1.0
        } else {
            let pos = (cycle_step - self.stage0) as f64 / self.stage1 as f64;
            (peak - 1.0) * 0.5 * (1.0 + (pos * PI).cos()) + 1.0
        };

        base.iter().map(|&b| b * scale).collect()
    }
}
