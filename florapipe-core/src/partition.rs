//! Deterministic dataset partitioning
//!
//! Two independent disciplines live here: fold-based train/validation
//! splitting of category-grouped samples, and round-robin sharding of a
//! finite index range across parallel workers. Both are pure functions of
//! their inputs; correctness under parallel workers is guaranteed by the
//! formulas alone, with no cross-worker coordination.

use std::ops::Range;

use crate::error::{Error, Result};

/// Which side of a fold split a dataset serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// Training partition: every fold except the validation fold
    Train,

    /// Validation partition: exactly the validation fold
    Val,
}

impl Split {
    /// Parse a split name from configuration
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            other => Err(Error::config(format!(
                "split must be one of [train, val], not '{other}'"
            ))),
        }
    }
}

/// Partition one category's (already shuffled) samples into a fold split
///
/// Samples are assigned to `nfolds` groups round-robin (`sample i` goes to
/// group `i mod nfolds`). The validation partition for fold `vfold` is
/// exactly that group; the training partition is every other group, in fold
/// order. Train and validation are disjoint and together cover the input,
/// for any valid `nfolds`/`vfold`.
pub fn fold_split<T: Clone>(items: &[T], nfolds: usize, vfold: usize, split: Split) -> Result<Vec<T>> {
    if nfolds < 2 {
        return Err(Error::config(format!("nfolds must be at least 2, not {nfolds}")));
    }
    if vfold >= nfolds {
        return Err(Error::config(format!(
            "vfold must be in [0, {nfolds}), not {vfold}"
        )));
    }

    let group = |x: usize| -> Vec<T> {
        items.iter().skip(x).step_by(nfolds).cloned().collect()
    };

    match split {
        Split::Val => Ok(group(vfold)),
        Split::Train => {
            let mut out = Vec::with_capacity(items.len() - group(vfold).len());
            for x in (0..nfolds).filter(|&x| x != vfold) {
                out.extend(group(x));
            }
            Ok(out)
        }
    }
}

/// Identity of one worker among a fixed set of parallel workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    /// This worker's index, in `[0, count)`
    pub id: usize,

    /// Total number of workers
    pub count: usize,
}

impl WorkerInfo {
    /// The single-worker identity used when no parallel loading is active
    pub fn solo() -> Self {
        Self { id: 0, count: 1 }
    }
}

impl Default for WorkerInfo {
    fn default() -> Self {
        Self::solo()
    }
}

/// Number of batches each worker owns under round-robin assignment
///
/// Batch index `b` belongs to worker `b mod num_workers`; the returned
/// vector holds each worker's batch count and always sums to `num_batches`.
pub fn batches_per_worker(num_batches: usize, num_workers: usize) -> Vec<usize> {
    (0..num_workers)
        .map(|x| (x..num_batches).step_by(num_workers.max(1)).count())
        .collect()
}

/// The contiguous sample-index range a worker iterates
///
/// Derived purely from `(worker, total_length, batch_size)`: the worker's
/// round-robin batch allocation is converted into a contiguous run of sample
/// indices, clamped to `total_length`. The union of all workers' ranges
/// covers `0..total_length` exactly once. Preconditions: `batch_size >= 1`,
/// `worker.count >= 1`, `worker.id < worker.count`.
pub fn worker_sample_range(worker: WorkerInfo, total_length: usize, batch_size: usize) -> Range<usize> {
    if batch_size == 0 || worker.id >= worker.count {
        return 0..0;
    }

    let num_batches = total_length.div_ceil(batch_size);
    let counts = batches_per_worker(num_batches, worker.count);

    let start_batch: usize = counts[..worker.id].iter().sum();
    let end_batch = start_batch + counts[worker.id];

    let start = (start_batch * batch_size).min(total_length);
    let end = (end_batch * batch_size).min(total_length);

    start..end
}

/// A worker's batch allocation under an explicit batch limit
///
/// Follows the round-robin formula, except a worker whose allocation rounds
/// to zero is assigned exactly one batch so no worker sits silently empty.
/// The floor means such a worker re-covers samples another worker already
/// owns; the behavior is kept as the reference pipeline computes it.
pub fn limited_batches_for_worker(batch_limit: usize, worker: WorkerInfo) -> usize {
    if worker.count <= 1 {
        return batch_limit;
    }

    let counts = batches_per_worker(batch_limit, worker.count);
    let allocated = counts.get(worker.id).copied().unwrap_or(0);
    if allocated == 0 {
        1
    } else {
        allocated
    }
}
