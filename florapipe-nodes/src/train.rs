//! Training stage

use std::any::Any;
use std::collections::BTreeMap;

use florapipe_core::error::Result;
use florapipe_core::model::{Criterion, Model, SharedCriterion, SharedModel};
use florapipe_core::node::{Node, Upstream};
use florapipe_core::optim::{Optimizer, SharedOptimizer};
use florapipe_core::record::Record;
use florapipe_core::value::Value;

/// Runs one optimization step per batched record
///
/// Pulls a batch, zeroes gradients, runs the forward pass, computes the
/// loss and its gradient, backpropagates, and steps the optimizer. Each
/// yielded record carries the model `output` and a fresh `metrics` mapping
/// with the batch `loss` and current `lr`.
pub struct Trainer {
    input: Upstream,
    model: SharedModel,
    criterion: SharedCriterion,
    optimizer: SharedOptimizer,
}

impl Trainer {
    /// Wrap `input`, training `model` against `criterion` with `optimizer`
    pub fn new(
        input: Box<dyn Node>,
        model: SharedModel,
        criterion: SharedCriterion,
        optimizer: SharedOptimizer,
    ) -> Self {
        Self {
            input: Upstream::new(input),
            model,
            criterion,
            optimizer,
        }
    }
}

impl Node for Trainer {
    fn fullname(&self) -> &'static str {
        "Trainer"
    }

    fn len(&self) -> usize {
        self.input.len()
    }

    fn sample_count(&self) -> usize {
        self.input.sample_count()
    }

    fn start(&mut self) -> Result<()> {
        self.input.start()?;
        self.model.borrow_mut().set_training(true);
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        let Some(mut rec) = self.input.next_record()? else {
            return Ok(None);
        };

        let image = rec.require("Trainer", "image")?.as_tensor()?.clone();
        let targets = rec.require("Trainer", "target")?.as_int_list()?.to_vec();

        let (output, loss) = {
            let mut model = self.model.borrow_mut();
            let criterion = self.criterion.borrow();
            let mut optimizer = self.optimizer.borrow_mut();

            optimizer.zero_grad();
            let output = model.forward(&image)?;
            let loss = criterion.loss(&output, &targets)?;
            let grad = criterion.grad(&output, &targets)?;
            model.backward(&grad)?;
            optimizer.step()?;
            (output, loss)
        };

        let mut metrics = BTreeMap::new();
        metrics.insert("loss".to_string(), Value::Float(loss));
        metrics.insert("lr".to_string(), Value::Float(self.optimizer.borrow().lr()));

        rec.set("output", output);
        rec.set("metrics", Value::Map(metrics));
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
