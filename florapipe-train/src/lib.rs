//! Configuration-driven training driver
//!
//! Loads a declarative run configuration, instantiates its shared
//! collaborators and pipelines through the florapipe engine, and drives
//! the epoch loop. The binary is a thin wrapper over [`run`].

#![warn(missing_docs)]

pub mod config;
pub mod driver;

pub use config::{load_config, save_rendered, Runtime};
pub use driver::{assemble, check_data, run, Assembly, PIPELINE_SUFFIX};
