//! Model and criterion interfaces
//!
//! Concrete network architectures, their pretrained weights, and loss math
//! are external collaborators. The pipeline drives them through these seams
//! only.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::tensor::Tensor;

/// A trainable classification model
pub trait Model {
    /// Forward pass: batched input `[N, C, H, W]` to logits `[N, K]`
    fn forward(&mut self, input: &Tensor) -> Result<Tensor>;

    /// Backward pass: accumulate gradients from `dL/d(output)`
    fn backward(&mut self, grad_output: &Tensor) -> Result<()>;

    /// Switch between training and evaluation behavior
    fn set_training(&mut self, training: bool);

    /// Diagnostic name of the model
    fn fullname(&self) -> &'static str;
}

/// A loss function over model outputs and integer targets
pub trait Criterion {
    /// Scalar loss for a batch
    fn loss(&self, output: &Tensor, targets: &[i64]) -> Result<f64>;

    /// Gradient of the loss with respect to the output
    fn grad(&self, output: &Tensor, targets: &[i64]) -> Result<Tensor>;
}

/// Shared handle to a model instance
pub type SharedModel = Rc<RefCell<dyn Model>>;

/// Shared handle to a criterion instance
pub type SharedCriterion = Rc<RefCell<dyn Criterion>>;
