//! Prediction stage

use std::any::Any;

use florapipe_core::error::Result;
use florapipe_core::model::{Model, SharedModel};
use florapipe_core::node::{Node, Upstream};
use florapipe_core::record::Record;
use florapipe_core::tensor::argmax_rows;
use florapipe_core::value::Value;

/// Runs the model in evaluation mode over unlabeled batches
///
/// Each yielded record carries the model `output` and the argmax
/// `prediction`, one per sample.
pub struct Predictor {
    input: Upstream,
    model: SharedModel,
}

impl Predictor {
    /// Wrap `input`, predicting with `model`
    pub fn new(input: Box<dyn Node>, model: SharedModel) -> Self {
        Self {
            input: Upstream::new(input),
            model,
        }
    }
}

impl Node for Predictor {
    fn fullname(&self) -> &'static str {
        "Predictor"
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

        let image = rec.require("Predictor", "image")?.as_tensor()?.clone();
        let output = self.model.borrow_mut().forward(&image)?;
        let predictions = argmax_rows(&output);

        rec.set("output", output);
        rec.set("prediction", Value::IntList(predictions));
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
    use crate::testlib::{sample_source, shared_model};
    use florapipe_core::node::drain;

    #[test]
    fn test_predictions_per_sample() {
        let source = Box::new(sample_source(5, 3, 2, 2));
        let batches = Box::new(BatchLoader::new(source, 2, false).unwrap());

        let model = shared_model(3);
        let mut predictor = Predictor::new(batches, model.clone());

        let records = drain(&mut predictor).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(model.borrow().training, Some(false));

        let total: usize = records
            .iter()
            .map(|r| r.get("prediction").unwrap().as_int_list().unwrap().len())
            .sum();
        assert_eq!(total, 5);
    }
}
