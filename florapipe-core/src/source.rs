//! Root data-source capability

use std::collections::BTreeMap;

use crate::error::Result;
use crate::partition::WorkerInfo;

/// Category metadata exposed by a labeled data source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    /// Numeric category identifier, dense from zero
    pub id: i64,

    /// Human-readable label, e.g. "genus species"
    pub label: String,

    /// Genus component of the label
    pub genus: String,

    /// Species component of the label
    pub species: String,
}

/// Extra surface owed by every root (no-upstream) data-source node
///
/// The external driver uses this to enumerate samples, look up category
/// metadata, and reshuffle the sample order once per epoch boundary.
pub trait DataSource {
    /// The identifiers of every sample this source will yield, in order
    fn sample_ids(&self) -> Vec<i64>;

    /// Number of categories, sized to the largest category id plus one
    fn num_categories(&self) -> usize;

    /// All known categories keyed by id
    fn categories(&self) -> &BTreeMap<i64, Category>;

    /// Metadata for one category
    fn category(&self, id: i64) -> Option<&Category> {
        self.categories().get(&id)
    }

    /// Reshuffle the sample order; called once per external epoch boundary
    fn reshuffle(&mut self);

    /// The worker identity this source iterates for
    fn worker(&self) -> WorkerInfo;

    /// Sanity-check the source before the first pass
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}
