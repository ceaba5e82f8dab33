//! Learning-rate scheduler stages
//!
//! Each scheduler is a pure rate shape (a [`Schedule`]) wrapped by the
//! [`Scheduled`] stage, which owns the step counter and pushes computed
//! rates into the shared optimizer's parameter groups. Batch-mode
//! schedulers step once per yielded record; epoch-mode schedulers step
//! once when the pass drains. The rate for any step is a function of the
//! step index and the captured base rates alone, so a run can be replayed
//! deterministically.

mod linear_ramp;
mod multicycle_cosine;
mod onecycle_cosine;
mod onecycle_exponential;

pub use linear_ramp::BatchLinearRamp;
pub use multicycle_cosine::MultiCycleCosine;
pub use onecycle_cosine::OneCycleCosine;
pub use onecycle_exponential::OneCycleExponential;

use std::any::Any;

use florapipe_core::error::Result;
use florapipe_core::node::{Node, Upstream};
use florapipe_core::optim::{Optimizer, SharedOptimizer};
use florapipe_core::record::Record;

/// A pure learning-rate shape
///
/// `rates(step, base)` maps a step index and the base rate of every
/// parameter group to the rates that apply at that step, with no state of
/// its own.
pub trait Schedule {
    /// Diagnostic name of the schedule
    const NAME: &'static str;

    /// The per-group rates that apply at `step`
    fn rates(&self, step: i64, base: &[f64]) -> Vec<f64>;
}

/// Stepping behavior of a [`Scheduled`] stage
pub struct StepOptions {
    /// Step per record instead of per pass
    pub batch_mode: bool,

    /// Copy the running `lr` metric into `batch_lr` on each record
    pub annotate_lr: bool,

    /// Copy the running `loss` metric into `batch_loss` on each record
    pub annotate_loss: bool,

    /// First pass (zero-based) on which stepping is active
    pub start_epoch: i64,

    /// Pass on which stepping deactivates again
    pub end_epoch: i64,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            batch_mode: false,
            annotate_lr: false,
            annotate_loss: false,
            start_epoch: 0,
            end_epoch: i64::MAX,
        }
    }
}

/// Drives a [`Schedule`] against a shared optimizer
///
/// Records stream through unchanged apart from optional batch-metric
/// annotations. The rate for step zero is applied at construction, so the
/// first batch already trains at the schedule's starting rate.
pub struct Scheduled<S: Schedule> {
    input: Upstream,
    optimizer: SharedOptimizer,
    schedule: S,
    options: StepOptions,
    base_rates: Vec<f64>,
    step: i64,
    epoch: i64,
    epoch_stepped: bool,
}

impl<S: Schedule> Scheduled<S> {
    /// Wrap `input`, scheduling `optimizer` with `schedule`
    ///
    /// Base rates default to each group's `initial_lr`; `base_override`
    /// replaces them all with one explicit rate.
    pub fn new(
        input: Box<dyn Node>,
        optimizer: SharedOptimizer,
        schedule: S,
        options: StepOptions,
        base_override: Option<f64>,
    ) -> Self {
        let base_rates: Vec<f64> = {
            let opt = optimizer.borrow();
            opt.param_groups()
                .iter()
                .map(|g| base_override.unwrap_or(g.initial_lr))
                .collect()
        };

        let mut scheduled = Self {
            input: Upstream::new(input),
            optimizer,
            schedule,
            options,
            base_rates,
            step: 0,
            epoch: -1,
            epoch_stepped: false,
        };
        scheduled.apply();
        scheduled
    }

    fn apply(&mut self) {
        let rates = self.schedule.rates(self.step, &self.base_rates);
        let mut opt = self.optimizer.borrow_mut();
        for (group, rate) in opt.param_groups_mut().iter_mut().zip(rates) {
            group.lr = rate;
        }
    }

    fn advance(&mut self) {
        if self.epoch >= self.options.start_epoch && self.epoch < self.options.end_epoch {
            self.step += 1;
            self.apply();
        }
    }

    fn annotate(&self, rec: &mut Record) {
        let metrics = rec.metrics_mut();
        if self.options.annotate_lr {
            if let Some(lr) = metrics.get("lr").cloned() {
                metrics.insert("batch_lr".to_string(), lr);
            }
        }
        if self.options.annotate_loss {
            if let Some(loss) = metrics.get("loss").cloned() {
                metrics.insert("batch_loss".to_string(), loss);
            }
        }
    }
}

impl<S: Schedule + 'static> Node for Scheduled<S> {
    fn fullname(&self) -> &'static str {
        S::NAME
    }

    fn len(&self) -> usize {
        self.input.len()
    }

    fn sample_count(&self) -> usize {
        self.input.sample_count()
    }

    fn start(&mut self) -> Result<()> {
        self.input.start()?;
        self.epoch += 1;
        self.epoch_stepped = false;
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        let Some(mut rec) = self.input.next_record()? else {
            if !self.options.batch_mode && !self.epoch_stepped {
                self.advance();
                self.epoch_stepped = true;
            }
            return Ok(None);
        };

        if self.options.annotate_lr || self.options.annotate_loss {
            self.annotate(&mut rec);
        }
        if self.options.batch_mode {
            self.advance();
        }
        Ok(Some(rec))
    }

    fn upstream(&self) -> Option<&dyn Node> {
        self.input.get()
    }

    fn upstream_mut(&mut self) -> Option<&mut dyn Node> {
        self.input.get_mut()
    }

    fn take_upstream(&mut self) -> Option<Box<dyn Node>> {
        self.input.take()
    }

    fn set_upstream(&mut self, upstream: Box<dyn Node>) -> Result<()> {
        self.input.set(upstream);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testlib::{shared_optimizer, VecSource};
    use florapipe_core::node::drain;
    use florapipe_core::record::Record;
    use florapipe_core::value::Value;
    use std::collections::BTreeMap;

    /// Doubles the base rate on every step
    struct Doubling;

    impl Schedule for Doubling {
        const NAME: &'static str = "Doubling";

        fn rates(&self, step: i64, base: &[f64]) -> Vec<f64> {
            base.iter().map(|&b| b * f64::powi(2.0, step as i32)).collect()
        }
    }

    fn metric_records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|_| {
                let mut metrics = BTreeMap::new();
                metrics.insert("loss".to_string(), Value::Float(0.5));
                metrics.insert("lr".to_string(), Value::Float(0.01));
                let mut rec = Record::new();
                rec.set("metrics", Value::Map(metrics));
                rec
            })
            .collect()
    }

    #[test]
    fn test_batch_mode_steps_per_record() {
        let source = Box::new(VecSource::new(metric_records(3)));
        let optimizer = shared_optimizer(&[0.1]);
        let mut node = Scheduled::new(
            source,
            optimizer.clone(),
            Doubling,
            StepOptions {
                batch_mode: true,
                ..StepOptions::default()
            },
            None,
        );

        // step zero applied at construction
        assert_eq!(optimizer.borrow().lr(), 0.1);

        drain(&mut node).unwrap();
        assert_eq!(optimizer.borrow().lr(), 0.8);
    }

    #[test]
    fn test_epoch_mode_steps_once_per_pass() {
        let source = Box::new(VecSource::new(metric_records(3)));
        let optimizer = shared_optimizer(&[0.1]);
        let mut node = Scheduled::new(
            source,
            optimizer.clone(),
            Doubling,
            StepOptions::default(),
            None,
        );

        drain(&mut node).unwrap();
        assert_eq!(optimizer.borrow().lr(), 0.2);
        drain(&mut node).unwrap();
        assert_eq!(optimizer.borrow().lr(), 0.4);
    }

    #[test]
    fn test_epoch_gating() {
        let optimizer = shared_optimizer(&[0.1]);
        let source = Box::new(VecSource::new(metric_records(2)));
        let mut node = Scheduled::new(
            source,
            optimizer.clone(),
            Doubling,
            StepOptions {
                batch_mode: true,
                start_epoch: 1,
                end_epoch: 2,
                ..StepOptions::default()
            },
            None,
        );

        drain(&mut node).unwrap(); // epoch 0: inactive
        assert_eq!(optimizer.borrow().lr(), 0.1);
        drain(&mut node).unwrap(); // epoch 1: two steps
        assert_eq!(optimizer.borrow().lr(), 0.4);
        drain(&mut node).unwrap(); // epoch 2: inactive again
        assert_eq!(optimizer.borrow().lr(), 0.4);
    }

    #[test]
    fn test_batch_metric_annotation() {
        let source = Box::new(VecSource::new(metric_records(2)));
        let optimizer = shared_optimizer(&[0.1]);
        let mut node = Scheduled::new(
            source,
            optimizer,
            Doubling,
            StepOptions {
                batch_mode: true,
                annotate_lr: true,
                annotate_loss: true,
                ..StepOptions::default()
            },
            None,
        );

        let records = drain(&mut node).unwrap();
        for rec in &records {
            let metrics = rec.metrics().unwrap();
            assert_eq!(metrics["batch_lr"].as_float().unwrap(), 0.01);
            assert_eq!(metrics["batch_loss"].as_float().unwrap(), 0.5);
        }
    }

    #[test]
    fn test_base_override() {
        let source = Box::new(VecSource::new(metric_records(1)));
        let optimizer = shared_optimizer(&[0.1, 0.2]);
        let node = Scheduled::new(
            source,
            optimizer.clone(),
            Doubling,
            StepOptions::default(),
            Some(0.5),
        );
        let _ = node;

        let opt = optimizer.borrow();
        assert_eq!(opt.param_groups()[0].lr, 0.5);
        assert_eq!(opt.param_groups()[1].lr, 0.5);
    }
}
