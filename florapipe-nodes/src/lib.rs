//! Pipeline node implementations for florapipe
//!
//! Every stage a training, validation, or prediction pipeline is assembled
//! from lives here: dataset roots, batching and cropping stages, the
//! model-driving stages, learning-rate schedulers, metric accumulators,
//! the ensemble assembler, and the metric logger. The `factories` module
//! registers each of them under its dotted configuration target.

#![warn(missing_docs)]

pub mod data;
pub mod ensemble;
pub mod evaluate;
pub mod factories;
pub mod logger;
pub mod predict;
pub mod scheduler;
pub mod train;
pub mod validate;

pub use data::{
    BatchLimiter, BatchLoader, CenterCrop, FiveCrop, GlobDataset, Normalize, SpecimenConfig,
    SpecimenDataset, Transformer,
};
pub use ensemble::Assembler;
pub use evaluate::{ConfusionMatrix, F1Score};
pub use factories::default_constructors;
pub use logger::{AverageMeter, JsonlWriter, Logger, MemoryWriter, NullWriter};
pub use predict::Predictor;
pub use train::Trainer;
pub use validate::Validator;
