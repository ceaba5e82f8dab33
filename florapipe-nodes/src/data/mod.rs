//! Dataset roots and record-shaping stages

mod batch;
mod five_crop;
mod glob;
mod specimen;
mod transformer;

pub use batch::{BatchLimiter, BatchLoader};
pub use five_crop::FiveCrop;
pub use glob::GlobDataset;
pub use specimen::{SpecimenConfig, SpecimenDataset};
pub use transformer::{CenterCrop, Normalize, Transformer};
