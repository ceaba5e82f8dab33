//! Core traits, data structures, and abstractions for florapipe pipelines
//!
//! This crate provides the foundational components for building lazily
//! composed training/inference pipelines: the `Node` chain contract, the
//! record model that flows between stages, the declarative instantiation
//! engine, and the deterministic dataset partitioning math that every root
//! data source relies on.

#![warn(missing_docs)]

pub mod error;
pub mod instantiate;
pub mod model;
pub mod node;
pub mod optim;
pub mod partition;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod source;
pub mod tensor;
pub mod transform;
pub mod value;

// Re-export key types for convenience
pub use error::{Error, Result};
pub use instantiate::{Args, Constructors, Registry, Resolved, SharedInstance};
pub use model::{Criterion, Model, SharedCriterion, SharedModel};
pub use node::{drain, find_node, iter_fwd, iter_rev, root, root_mut, Node, Upstream};
pub use optim::{Optimizer, ParamGroup, SharedOptimizer};
pub use partition::{Split, WorkerInfo};
pub use pipeline::build_pipeline;
pub use record::Record;
pub use sink::{MetricWriter, SharedWriter};
pub use source::DataSource;
pub use tensor::Tensor;
pub use transform::{SharedTransform, Transform};
pub use value::Value;
