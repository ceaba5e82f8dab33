//! Evaluation metric accumulators
//!
//! Both stages stream batched records through unchanged while accumulating
//! across the pass, then inject their finalized metric into the last
//! record's `metrics` mapping. They buffer one record of lookahead so the
//! final record is recognized before it is yielded.

use std::any::Any;

use ndarray::{ArrayD, IxDyn};

use florapipe_core::error::{Error, Result};
use florapipe_core::node::{Node, Upstream};
use florapipe_core::record::Record;
use florapipe_core::tensor::argmax_rows;
use florapipe_core::value::Value;

fn batch_targets_and_predictions(stage: &str, rec: &Record) -> Result<(Vec<i64>, Vec<i64>)> {
    let targets = rec.require(stage, "target")?.as_int_list()?.to_vec();
    let outputs = rec.require(stage, "output")?.as_tensor()?;
    let predictions = argmax_rows(outputs);
    if targets.len() != predictions.len() {
        return Err(Error::contract(format!(
            "{stage}: {} targets but {} outputs in batch",
            targets.len(),
            predictions.len()
        )));
    }
    Ok((targets, predictions))
}

fn check_category(stage: &str, id: i64, num_categories: usize) -> Result<usize> {
    if id < 0 || id as usize >= num_categories {
        return Err(Error::contract(format!(
            "{stage}: category {id} outside [0, {num_categories})"
        )));
    }
    Ok(id as usize)
}

/// Accumulates a `K x K` confusion matrix over one pass
///
/// Rows index the true category, columns the predicted one. The matrix of
/// raw counts lands in the final record's metrics under
/// `confusion_matrix`.
pub struct ConfusionMatrix {
    input: Upstream,
    num_categories: usize,
    counts: ArrayD<f32>,
    pending: Option<Record>,
}

impl ConfusionMatrix {
    /// Wrap `input`, accumulating over `num_categories` categories
    pub fn new(input: Box<dyn Node>, num_categories: usize) -> Result<Self> {
        if num_categories == 0 {
            return Err(Error::config("num_categories must be at least 1"));
        }
        Ok(Self {
            input: Upstream::new(input),
            num_categories,
            counts: ArrayD::zeros(IxDyn(&[num_categories, num_categories])),
            pending: None,
        })
    }

    fn accumulate(&mut self, rec: &Record) -> Result<()> {
        let (targets, predictions) = batch_targets_and_predictions("ConfusionMatrix", rec)?;
        for (&target, &predicted) in targets.iter().zip(&predictions) {
            let t = check_category("ConfusionMatrix", target, self.num_categories)?;
            let p = check_category("ConfusionMatrix", predicted, self.num_categories)?;
            self.counts[[t, p]] += 1.0;
        }
        Ok(())
    }

    fn finalize(&self, rec: &mut Record) {
        rec.metrics_mut()
            .insert("confusion_matrix".to_string(), Value::Tensor(self.counts.clone()));
    }
}

impl Node for ConfusionMatrix {
    fn fullname(&self) -> &'static str {
        "ConfusionMatrix"
    }

    fn len(&self) -> usize {
        self.input.len()
    }

    fn sample_count(&self) -> usize {
        self.input.sample_count()
    }

    fn start(&mut self) -> Result<()> {
        self.input.start()?;
        self.counts.fill(0.0);
        self.pending = None;
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.pending.is_none() {
            match self.input.next_record()? {
                Some(rec) => {
                    self.accumulate(&rec)?;
                    self.pending = Some(rec);
                }
                None => return Ok(None),
            }
        }

        match self.input.next_record()? {
            Some(next) => {
                self.accumulate(&next)?;
                Ok(self.pending.replace(next))
            }
            None => {
                let mut last = self.pending.take();
                if let Some(rec) = last.as_mut() {
                    self.finalize(rec);
                }
                Ok(last)
            }
        }
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

/// Accumulates per-category F1 statistics over one pass
///
/// Tracks true positives and the combined false positive/negative count
/// per category. The final record's metrics receive `f1_data` (the raw
/// `[2, K]` counts), `f1_scores` (per-category F1), and `f1_score` (their
/// mean).
pub struct F1Score {
    input: Upstream,
    num_categories: usize,
    true_positives: Vec<f64>,
    false_counts: Vec<f64>,
    pending: Option<Record>,
}

impl F1Score {
    /// Wrap `input`, accumulating over `num_categories` categories
    pub fn new(input: Box<dyn Node>, num_categories: usize) -> Result<Self> {
        if num_categories == 0 {
            return Err(Error::config("num_categories must be at least 1"));
        }
        Ok(Self {
            input: Upstream::new(input),
            num_categories,
            true_positives: vec![0.0; num_categories],
            false_counts: vec![0.0; num_categories],
            pending: None,
        })
    }

    fn accumulate(&mut self, rec: &Record) -> Result<()> {
        let (targets, predictions) = batch_targets_and_predictions("F1Score", rec)?;
        for (&target, &predicted) in targets.iter().zip(&predictions) {
            let t = check_category("F1Score", target, self.num_categories)?;
            let p = check_category("F1Score", predicted, self.num_categories)?;
            if t == p {
                self.true_positives[t] += 1.0;
            } else {
                self.false_counts[t] += 1.0;
                self.false_counts[p] += 1.0;
            }
        }
        Ok(())
    }

    fn finalize(&self, rec: &mut Record) {
        let scores: Vec<f64> = self
            .true_positives
            .iter()
            .zip(&self.false_counts)
            .map(|(&tp, &fc)| 2.0 * tp / (2.0 * tp + fc + 1e-9))
            .collect();
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;

        let mut data = ArrayD::zeros(IxDyn(&[2, self.num_categories]));
        for idx in 0..self.num_categories {
            data[[0, idx]] = self.true_positives[idx] as f32;
            data[[1, idx]] = self.false_counts[idx] as f32;
        }

        let metrics = rec.metrics_mut();
        metrics.insert("f1_data".to_string(), Value::Tensor(data));
        metrics.insert("f1_scores".to_string(), Value::FloatList(scores));
        metrics.insert("f1_score".to_string(), Value::Float(mean));
    }
}

impl Node for F1Score {
    fn fullname(&self) -> &'static str {
        "F1Score"
    }

    fn len(&self) -> usize {
        self.input.len()
    }

    fn sample_count(&self) -> usize {
        self.input.sample_count()
    }

    fn start(&mut self) -> Result<()> {
        self.input.start()?;
        self.true_positives.fill(0.0);
        self.false_counts.fill(0.0);
        self.pending = None;
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.pending.is_none() {
            match self.input.next_record()? {
                Some(rec) => {
                    self.accumulate(&rec)?;
                    self.pending = Some(rec);
                }
                None => return Ok(None),
            }
        }

        match self.input.next_record()? {
            Some(next) => {
                self.accumulate(&next)?;
                Ok(self.pending.replace(next))
            }
            None => {
                let mut last = self.pending.take();
                if let Some(rec) = last.as_mut() {
                    self.finalize(rec);
                }
                Ok(last)
            }
        }
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
