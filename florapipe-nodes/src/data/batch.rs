//! Batching stages
//!
//! `BatchLoader` collates consecutive per-sample records into batched
//! records; `BatchLimiter` caps how many records flow through a pass, with
//! worker-aware allocation so parallel shards respect the same cap.

use std::any::Any;
use std::collections::BTreeMap;

use florapipe_core::error::{Error, Result};
use florapipe_core::node::{Node, Upstream};
use florapipe_core::partition::{limited_batches_for_worker, WorkerInfo};
use florapipe_core::record::Record;
use florapipe_core::tensor;
use florapipe_core::value::Value;

/// Collates upstream per-sample records into batched records
///
/// Field collation is by kind: tensors are stacked along a new leading
/// axis, integers become an integer list, floats a float list, strings a
/// string list. Every sample in a batch must carry the same fields. With
/// `drop_last` a trailing partial batch is discarded.
pub struct BatchLoader {
    input: Upstream,
    batch_size: usize,
    drop_last: bool,
}

impl BatchLoader {
    /// Wrap `input`, collating `batch_size` samples per record
    pub fn new(input: Box<dyn Node>, batch_size: usize, drop_last: bool) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        Ok(Self {
            input: Upstream::new(input),
            batch_size,
            drop_last,
        })
    }

    fn collate(&self, samples: Vec<Record>) -> Result<Record> {
        let mut columns: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (position, sample) in samples.iter().enumerate() {
            for (name, value) in sample.fields() {
                let column = columns.entry(name.to_string()).or_default();
                if column.len() != position {
                    return Err(Error::contract(format!(
                        "field '{name}' is not present in every sample of the batch"
                    )));
                }
                column.push(value.clone());
            }
        }

        let count = samples.len();
        let mut batched = Record::new();
        for (name, column) in columns {
            if column.len() != count {
                return Err(Error::contract(format!(
                    "field '{name}' is not present in every sample of the batch"
                )));
            }
            batched.set(name, collate_column(column)?);
        }
        Ok(batched)
    }
}

fn collate_column(column: Vec<Value>) -> Result<Value> {
    match &column[0] {
        Value::Tensor(_) => {
            let rows: Vec<_> = column
                .iter()
                .map(|v| v.as_tensor().cloned())
                .collect::<Result<_>>()?;
            Ok(Value::Tensor(tensor::stack(&rows)?))
        }
        Value::Int(_) => {
            let ints: Vec<i64> = column.iter().map(|v| v.as_int()).collect::<Result<_>>()?;
            Ok(Value::IntList(ints))
        }
        Value::Float(_) => {
            let floats: Vec<f64> = column.iter().map(|v| v.as_float()).collect::<Result<_>>()?;
            Ok(Value::FloatList(floats))
        }
        Value::Str(_) => {
            let strs: Vec<String> = column
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Result<_>>()?;
            Ok(Value::StrList(strs))
        }
        other => Err(Error::contract(format!(
            "cannot collate {} values into a batch; decode or drop the field first",
            other.kind()
        ))),
    }
}

impl Node for BatchLoader {
    fn fullname(&self) -> &'static str {
        "BatchLoader"
    }

    /// Number of batches one pass yields
    fn len(&self) -> usize {
        let samples = self.input.len();
        if self.drop_last {
            samples / self.batch_size
        } else {
            samples.div_ceil(self.batch_size)
        }
    }

    fn sample_count(&self) -> usize {
        self.input.sample_count()
    }

    fn start(&mut self) -> Result<()> {
        self.input.start()
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        let mut samples = Vec::with_capacity(self.batch_size);
        while samples.len() < self.batch_size {
            match self.input.next_record()? {
                Some(rec) => samples.push(rec),
                None => break,
            }
        }

        if samples.is_empty() || (samples.len() < self.batch_size && self.drop_last) {
            return Ok(None);
        }
        Ok(Some(self.collate(samples)?))
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

/// Caps the number of per-sample records a pass yields
///
/// A limit of zero disables the cap. Under parallel workers the limit is
/// divided round-robin across the shard; a worker whose share rounds to
/// zero still receives one batch worth of samples.
pub struct BatchLimiter {
    input: Upstream,
    batch_limit: usize,
    batch_size: usize,
    worker: WorkerInfo,
    remaining: usize,
}

impl BatchLimiter {
    /// Wrap `input`, yielding at most `batch_limit` batches of
    /// `batch_size` samples per pass
    pub fn new(input: Box<dyn Node>, batch_limit: usize, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        Ok(Self {
            input: Upstream::new(input),
            batch_limit,
            batch_size,
            worker: WorkerInfo::solo(),
            remaining: 0,
        })
    }
}

impl Node for BatchLimiter {
    fn fullname(&self) -> &'static str {
        "BatchLimiter"
    }

    fn len(&self) -> usize {
        let samples = self.input.len();
        if self.batch_limit == 0 {
            samples
        } else {
            (self.batch_limit * self.batch_size).min(samples)
        }
    }

    fn start(&mut self) -> Result<()> {
        self.input.start()?;
        self.remaining = if self.batch_limit > 0 && self.worker.count > 1 {
            limited_batches_for_worker(self.batch_limit, self.worker) * self.batch_size
        } else {
            self.len()
        };
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        match self.input.next_record()? {
            Some(rec) => {
                self.remaining -= 1;
                Ok(Some(rec))
            }
            None => {
                self.remaining = 0;
                Ok(None)
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

    fn set_worker(&mut self, worker: WorkerInfo) {
        self.worker = worker;
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
    use crate::testlib::sample_source;
    use florapipe_core::node::drain;
    use proptest::prelude::*;

    #[test]
    fn test_batch_loader_collates_fields() {
        let source = Box::new(sample_source(7, 3, 4, 4));
        let mut loader = BatchLoader::new(source, 3, false).unwrap();

        assert_eq!(loader.len(), 3);
        assert_eq!(loader.sample_count(), 7);

        let batches = drain(&mut loader).unwrap();
        assert_eq!(batches.len(), 3);

        let first = &batches[0];
        assert_eq!(first.get("image_id").unwrap().as_int_list().unwrap(), &[0, 1, 2]);
        assert_eq!(
            first.get("image").unwrap().as_tensor().unwrap().shape(),
            &[3, 3, 4, 4]
        );

        // trailing partial batch of one sample
        let last = &batches[2];
        assert_eq!(last.get("image_id").unwrap().as_int_list().unwrap(), &[6]);
    }

    #[test]
    fn test_batch_loader_drop_last() {
        let source = Box::new(sample_source(7, 3, 2, 2));
        let mut loader = BatchLoader::new(source, 3, true).unwrap();

        assert_eq!(loader.len(), 2);
        let batches = drain(&mut loader).unwrap();
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_batch_loader_restartable() {
        let source = Box::new(sample_source(6, 3, 2, 2));
        let mut loader = BatchLoader::new(source, 2, false).unwrap();

        assert_eq!(drain(&mut loader).unwrap().len(), 3);
        assert_eq!(drain(&mut loader).unwrap().len(), 3);
    }

    #[test]
    fn test_batch_limiter_caps_samples() {
        let source = Box::new(sample_source(20, 3, 2, 2));
        let mut limiter = BatchLimiter::new(source, 2, 4).unwrap();

        assert_eq!(limiter.len(), 8);
        let records = drain(&mut limiter).unwrap();
        assert_eq!(records.len(), 8);
    }

    #[test]
    fn test_batch_limiter_zero_means_unlimited() {
        let source = Box::new(sample_source(5, 3, 2, 2));
        let mut limiter = BatchLimiter::new(source, 0, 4).unwrap();

        assert_eq!(limiter.len(), 5);
        assert_eq!(drain(&mut limiter).unwrap().len(), 5);
    }

    #[test]
    fn test_batch_limiter_worker_share() {
        // limit of 2 batches across 3 workers: each takes one batch
        let source = Box::new(sample_source(30, 3, 2, 2));
        let mut limiter = BatchLimiter::new(source, 2, 4).unwrap();
        limiter.set_worker(WorkerInfo { id: 2, count: 3 });

        limiter.start().unwrap();
        let mut seen = 0;
        while limiter.next_record().unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 4);
    }

    proptest! {
        #[test]
        fn prop_batch_loader_preserves_order_and_count(
            count in 0usize..120,
            batch_size in 1usize..16,
            drop_last in any::<bool>(),
        ) {
            let source = Box::new(sample_source(count, 3, 1, 1));
            let mut loader = BatchLoader::new(source, batch_size, drop_last).unwrap();

            let batches = drain(&mut loader).unwrap();
            prop_assert_eq!(batches.len(), loader.len());

            let mut ids: Vec<i64> = Vec::new();
            for (idx, batch) in batches.iter().enumerate() {
                let batch_ids = batch.get("image_id").unwrap().as_int_list().unwrap();
                if drop_last || idx + 1 < batches.len() {
                    prop_assert_eq!(batch_ids.len(), batch_size);
                }
                ids.extend_from_slice(batch_ids);
            }

            let yielded = if drop_last { count - count % batch_size } else { count };
            let want: Vec<i64> = (0..yielded as i64).collect();
            prop_assert_eq!(ids, want);
        }
    }
}
