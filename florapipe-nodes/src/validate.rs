//! Validation stage

use std::any::Any;
use std::collections::BTreeMap;

use florapipe_core::error::Result;
use florapipe_core::model::{Criterion, Model, SharedCriterion, SharedModel};
use florapipe_core::node::{Node, Upstream};
use florapipe_core::record::Record;
use florapipe_core::value::Value;

/// Runs the model in evaluation mode and scores each batch
///
/// No gradients and no optimizer: the forward pass and the loss only.
/// Each yielded record carries the `output` and a `metrics` mapping with
/// the batch `loss`.
pub struct Validator {
    input: Upstream,
    model: SharedModel,
    criterion: SharedCriterion,
}

impl Validator {
    /// Wrap `input`, evaluating `model` against `criterion`
    pub fn new(input: Box<dyn Node>, model: SharedModel, criterion: SharedCriterion) -> Self {
        Self {
            input: Upstream::new(input),
            model,
            criterion,
        }
    }
}

impl Node for Validator {
    fn fullname(&self) -> &'static str {
        "Validator"
    }

    fn len(&self) -> usize {
        self.input.len()
    }

    fn sample_count(&self) -> usize {
        self.input.sample_count()
    }

    fn start(&mut self) -> Result<()> {
        self.input.start()?;
        self.model.borrow_mut().set_training(false);
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        let Some(mut rec) = self.input.next_record()? else {
            return Ok(None);
        };

        let image = rec.require("Validator", "image")?.as_tensor()?.clone();
        let targets = rec.require("Validator", "target")?.as_int_list()?.to_vec();

        let output = self.model.borrow_mut().forward(&image)?;
        let loss = self.criterion.borrow().loss(&output, &targets)?;

        let mut metrics = BTreeMap::new();
        metrics.insert("loss".to_string(), Value::Float(loss));

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BatchLoader;
    use crate::testlib::{sample_source, shared_criterion, shared_model};
    use florapipe_core::node::drain;

    #[test]
    fn test_eval_mode_and_loss_metric() {
        let source = Box::new(sample_source(6, 2, 2, 2));
        let batches = Box::new(BatchLoader::new(source, 3, false).unwrap());

        let model = shared_model(2);
        let mut validator = Validator::new(batches, model.clone(), shared_criterion(0.5));

        let records = drain(&mut validator).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(model.borrow().training, Some(false));
        assert_eq!(model.borrow().backward_calls, 0);

        for rec in &records {
            let metrics = rec.metrics().unwrap();
            assert_eq!(metrics["loss"].as_float().unwrap(), 0.5);
            assert!(!metrics.contains_key("lr"));
        }
    }
}
