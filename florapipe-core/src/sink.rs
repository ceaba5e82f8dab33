//! Metric sink contract

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;

/// Opaque writer capability for scalar time series
///
/// Any stage that reports metrics receives one of these and assumes nothing
/// beyond "record scalar under label at step".
pub trait MetricWriter {
    /// Record `value` under `label` at the given step
    fn add_scalar(&mut self, label: &str, value: f64, step: i64) -> Result<()>;

    /// Flush buffered scalars to the underlying sink
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Shared handle to a metric writer
///
/// The pipeline is pulled by a single consumer thread, so shared instances
/// use `Rc<RefCell<…>>` rather than synchronized handles.
pub type SharedWriter = Rc<RefCell<dyn MetricWriter>>;
