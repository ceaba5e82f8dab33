//! Per-image transform interface

use std::rc::Rc;

use crate::error::Result;
use crate::tensor::Tensor;

/// A deterministic transformation of a single image tensor
///
/// Augmentation internals are external collaborators; the pipeline only
/// relies on this seam so a transformer stage can apply an ordered list of
/// transforms from configuration.
pub trait Transform {
    /// Apply the transform, producing a new image tensor
    fn apply(&self, image: &Tensor) -> Result<Tensor>;

    /// Diagnostic name of the transform
    fn name(&self) -> &'static str;
}

/// Shared handle to a transform, as stored in the instance registry
pub type SharedTransform = Rc<dyn Transform>;
