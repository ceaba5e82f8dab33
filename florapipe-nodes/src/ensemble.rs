//! Ensemble assembly across per-id sample multiplicity

use std::any::Any;
use std::collections::{HashMap, VecDeque};

use ndarray::Axis;

use florapipe_core::error::{Error, Result};
use florapipe_core::node::{Node, Upstream};
use florapipe_core::record::Record;
use florapipe_core::tensor::{argmax_rows, reduce_max, reduce_mean, reduce_sum, Tensor};
use florapipe_core::value::Value;

/// How a stack of per-id outputs is combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reducer {
    Mean,
    Sum,
    Max,
    /// Keep the stack; one prediction per member
    None,
}

impl Reducer {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "mean" => Ok(Reducer::Mean),
            "sum" => Ok(Reducer::Sum),
            "max" => Ok(Reducer::Max),
            "none" => Ok(Reducer::None),
            other => Err(Error::config(format!(
                "reducer must be one of [mean, sum, max, none], not '{other}'"
            ))),
        }
    }
}

/// Regroups batched model outputs by image id and reduces them
///
/// Stages like five-crop multiply each source sample into a fixed number
/// of variants; after prediction, this stage collects the outputs of all
/// variants of an id, reduces them into one output, and yields one
/// single-sample batch per id with a fresh argmax `prediction`. Outputs
/// are cached per id, so batch boundaries need not align with id
/// boundaries.
pub struct Assembler {
    input: Upstream,
    samples_per_id: usize,
    reducer: Reducer,
    cache: HashMap<i64, Vec<Tensor>>,
    ready: VecDeque<Record>,
}

impl Assembler {
    /// Wrap `input`, expecting `samples_per_id` outputs per image id
    pub fn new(input: Box<dyn Node>, samples_per_id: usize, reducer: &str) -> Result<Self> {
        if samples_per_id == 0 {
            return Err(Error::config("samples_per_id must be at least 1"));
        }
        Ok(Self {
            input: Upstream::new(input),
            samples_per_id,
            reducer: Reducer::parse(reducer)?,
            cache: HashMap::new(),
            ready: VecDeque::new(),
        })
    }

    fn absorb(&mut self, batch: &Record) -> Result<()> {
        let ids: Vec<i64> = batch.require("Assembler", "image_id")?.as_int_list()?.to_vec();
        let outputs = batch.require("Assembler", "output")?.as_tensor()?.clone();
        if outputs.ndim() < 2 || outputs.shape()[0] != ids.len() {
            return Err(Error::contract(format!(
                "output shape {:?} does not match {} image ids",
                outputs.shape(),
                ids.len()
            )));
        }

        for (idx, &image_id) in ids.iter().enumerate() {
            let row = outputs.index_axis(Axis(0), idx).to_owned();
            let rows = self.cache.entry(image_id).or_default();
            rows.push(row);

            if rows.len() == self.samples_per_id {
                let rows = self.cache.remove(&image_id).unwrap_or_default();
                let assembled = self.assemble(batch, idx, &rows)?;
                self.ready.push_back(assembled);
            }
        }
        Ok(())
    }

    fn assemble(&self, batch: &Record, idx: usize, rows: &[Tensor]) -> Result<Record> {
        let stacked = florapipe_core::tensor::stack(rows)?;
        let reduced = match self.reducer {
            Reducer::Mean => reduce_mean(&stacked).insert_axis(Axis(0)),
            Reducer::Sum => reduce_sum(&stacked).insert_axis(Axis(0)),
            Reducer::Max => reduce_max(&stacked).insert_axis(Axis(0)),
            Reducer::None => stacked,
        };
        let predictions = argmax_rows(&reduced);

        let mut out = Record::new();
        for (name, value) in batch.fields() {
            out.set(name, element_of(value, idx)?);
        }
        out.set("output", reduced);
        out.set("prediction", Value::IntList(predictions));
        Ok(out)
    }
}

/// A single-sample slice of a batched field value, keeping the batch shape
fn element_of(value: &Value, idx: usize) -> Result<Value> {
    let out_of_range = || Error::contract(format!("sample index {idx} out of range in batch"));
    Ok(match value {
        Value::IntList(v) => Value::IntList(vec![*v.get(idx).ok_or_else(out_of_range)?]),
        Value::FloatList(v) => Value::FloatList(vec![*v.get(idx).ok_or_else(out_of_range)?]),
        Value::StrList(v) => Value::StrList(vec![v.get(idx).ok_or_else(out_of_range)?.clone()]),
        Value::Tensor(t) if t.ndim() > 1 => {
            if idx >= t.shape()[0] {
                return Err(out_of_range());
            }
            Value::Tensor(t.index_axis(Axis(0), idx).to_owned().insert_axis(Axis(0)))
        }
        other => other.clone(),
    })
}

impl Node for Assembler {
    fn fullname(&self) -> &'static str {
        "Assembler"
    }

    fn len(&self) -> usize {
        if self.samples_per_id == 1 {
            self.input.len()
        } else {
            self.input.sample_count() / self.samples_per_id
        }
    }

    fn sample_count(&self) -> usize {
        self.len()
    }

    fn start(&mut self) -> Result<()> {
        self.input.start()?;
        self.cache.clear();
        self.ready.clear();
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.samples_per_id == 1 {
            return self.input.next_record();
        }

        loop {
            if let Some(rec) = self.ready.pop_front() {
                return Ok(Some(rec));
            }
            match self.input.next_record()? {
                Some(batch) => self.absorb(&batch)?,
                None => {
                    if !self.cache.is_empty() {
                        tracing::warn!(
                            incomplete = self.cache.len(),
                            "ids with fewer than samples_per_id outputs were dropped"
                        );
                        self.cache.clear();
                    }
                    return Ok(None);
                }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BatchLoader, FiveCrop};
    use crate::testlib::{sample_source, OneHotOutput};
    use florapipe_core::node::drain;

    #[test]
    fn test_unknown_reducer_is_construction_error() {
        let source = Box::new(sample_source(1, 2, 4, 4));
        assert!(Assembler::new(source, 5, "median").is_err());
    }

    #[test]
    fn test_passthrough_when_one_sample_per_id() {
        let source = Box::new(sample_source(4, 2, 4, 4));
        let outputs = Box::new(OneHotOutput::new(
            Box::new(BatchLoader::new(source, 2, false).unwrap()),
            2,
            0,
        ));
        let mut assembler = Assembler::new(outputs, 1, "sum").unwrap();

        assert_eq!(assembler.len(), 2);
        assert_eq!(drain(&mut assembler).unwrap().len(), 2);
    }

    #[test]
    fn test_five_crop_round_trip_preserves_cardinality() {
        // 100 samples expand to 500 crops and assemble back to 100
        let source = Box::new(sample_source(100, 7, 4, 4));
        let crops = Box::new(FiveCrop::new(source, 2, 2).unwrap());
        let batches = Box::new(BatchLoader::new(crops, 10, false).unwrap());
        let outputs = Box::new(OneHotOutput::new(batches, 7, 0));
        let mut assembler = Assembler::new(outputs, 5, "mean").unwrap();

        assert_eq!(assembler.len(), 100);
        let records = drain(&mut assembler).unwrap();
        assert_eq!(records.len(), 100);

        let mut seen = std::collections::HashSet::new();
        for rec in &records {
            let ids = rec.get("image_id").unwrap().as_int_list().unwrap();
            assert_eq!(ids.len(), 1);
            assert!(seen.insert(ids[0]));

            // mean of five identical one-hot outputs keeps the prediction
            let target = rec.get("target").unwrap().as_int_list().unwrap()[0];
            let prediction = rec.get("prediction").unwrap().as_int_list().unwrap()[0];
            assert_eq!(prediction, target);

            let output = rec.get("output").unwrap().as_tensor().unwrap();
            assert_eq!(output.shape(), &[1, 7]);
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn test_none_reducer_keeps_stack() {
        let source = Box::new(sample_source(2, 3, 4, 4));
        let crops = Box::new(FiveCrop::new(source, 2, 2).unwrap());
        let batches = Box::new(BatchLoader::new(crops, 5, false).unwrap());
        let outputs = Box::new(OneHotOutput::new(batches, 3, 0));
        let mut assembler = Assembler::new(outputs, 5, "none").unwrap();

        let records = drain(&mut assembler).unwrap();
        assert_eq!(records.len(), 2);
        let output = records[0].get("output").unwrap().as_tensor().unwrap();
        assert_eq!(output.shape(), &[5, 3]);
        assert_eq!(
            records[0].get("prediction").unwrap().as_int_list().unwrap().len(),
            5
        );
    }
}
