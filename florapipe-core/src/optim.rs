//! Optimizer interface with named parameter groups

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;

/// One parameter group with its own learning rate
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    /// Group name, e.g. "backbone" or "head"
    pub name: String,

    /// Current learning rate
    pub lr: f64,

    /// Learning rate the group was constructed with
    ///
    /// Schedulers compute their shapes relative to this base rate.
    pub initial_lr: f64,
}

impl ParamGroup {
    /// Create a group whose initial rate equals its current rate
    pub fn new(name: impl Into<String>, lr: f64) -> Self {
        Self {
            name: name.into(),
            lr,
            initial_lr: lr,
        }
    }
}

/// A gradient-descent optimizer driven by the trainer stage
///
/// The update math is an external collaborator; the pipeline only zeroes
/// gradients, steps, and adjusts per-group learning rates.
pub trait Optimizer {
    /// Clear accumulated gradients before a forward/backward pass
    fn zero_grad(&mut self);

    /// Apply one update step from accumulated gradients
    fn step(&mut self) -> Result<()>;

    /// The parameter groups, in declaration order
    fn param_groups(&self) -> &[ParamGroup];

    /// Mutable parameter groups, for learning-rate scheduling
    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Current learning rate of the first group, for metric reporting
    fn lr(&self) -> f64 {
        self.param_groups().first().map_or(0.0, |g| g.lr)
    }
}

/// Shared handle to an optimizer instance
///
/// Ownership is shared across every node that references the instance; a
/// trainer and a scheduler both hold the same optimizer.
pub type SharedOptimizer = Rc<RefCell<dyn Optimizer>>;
