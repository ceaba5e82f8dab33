//! The `Node` chain contract and traversal utilities
//!
//! A pipeline is a single-parent linked chain of nodes. Every node is a
//! unary function from a stream of records to a stream of records; a node
//! with no upstream is a root data source. Chains are built tail-appending
//! and never cyclic.

use std::any::Any;

use crate::error::{Error, Result};
use crate::partition::WorkerInfo;
use crate::record::Record;
use crate::source::DataSource;

/// One stage of a lazy pipeline chain
///
/// Iteration is pull-based and restartable: [`Node::start`] begins a fresh
/// pass (implementations cascade the call to their upstream, then reset any
/// pass-local state), and [`Node::next_record`] lazily yields records until
/// it returns `None`. No node buffers its own output across passes, and no
/// node supports two concurrent passes.
pub trait Node {
    /// Stable identity string derived from the node's type, for diagnostics
    fn fullname(&self) -> &'static str;

    /// Exact number of records (or batches) one full pass will yield
    fn len(&self) -> usize;

    /// Whether a full pass yields nothing
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-sample cardinality flowing through this stage
    ///
    /// Equal to [`Node::len`] for unbatched stages. A batching stage reports
    /// the batch count from `len` and the underlying sample count here, so
    /// stages that aggregate across samples can still size themselves.
    fn sample_count(&self) -> usize {
        self.len()
    }

    /// Begin a fresh pass, resetting pass-local state down the whole chain
    fn start(&mut self) -> Result<()>;

    /// Pull the next record of the current pass, `None` once exhausted
    fn next_record(&mut self) -> Result<Option<Record>>;

    /// Borrow the upstream node, absent for roots
    fn upstream(&self) -> Option<&dyn Node> {
        None
    }

    /// Mutably borrow the upstream node, absent for roots
    fn upstream_mut(&mut self) -> Option<&mut dyn Node> {
        None
    }

    /// Detach and return the upstream node, absent for roots
    fn take_upstream(&mut self) -> Option<Box<dyn Node>> {
        None
    }

    /// Attach an upstream node
    ///
    /// Only used while rebuilding a chain (see [`insert_above`]); root nodes
    /// have no upstream slot and refuse.
    fn set_upstream(&mut self, upstream: Box<dyn Node>) -> Result<()> {
        let _ = upstream;
        Err(Error::contract(format!(
            "{} has no upstream slot",
            self.fullname()
        )))
    }

    /// The node as `Any`, enabling type-directed chain searches
    fn as_any(&self) -> &dyn Any;

    /// The node as mutable `Any`
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Root data-source capability, if this node is one
    fn as_source(&self) -> Option<&dyn DataSource> {
        None
    }

    /// Mutable root data-source capability, if this node is one
    fn as_source_mut(&mut self) -> Option<&mut dyn DataSource> {
        None
    }

    /// Assign the worker identity for sharded iteration
    ///
    /// Most stages ignore this; roots and batch limiters use it to compute
    /// their disjoint index ranges. See [`set_worker_info`] to assign it
    /// across a whole chain.
    fn set_worker(&mut self, worker: WorkerInfo) {
        let _ = worker;
    }
}

impl std::fmt::Debug for dyn Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("fullname", &self.fullname())
            .finish()
    }
}

/// Owned upstream slot used by non-root stages
///
/// Wraps the boxed upstream node behind the accessors the [`Node`] trait
/// needs, keeping the detached state (mid-splice) in one place. A stage
/// whose upstream has been taken reports itself empty and refuses to pull.
pub struct Upstream(Option<Box<dyn Node>>);

impl Upstream {
    /// Wrap an upstream node
    pub fn new(input: Box<dyn Node>) -> Self {
        Self(Some(input))
    }

    /// Length of the upstream, zero while detached
    pub fn len(&self) -> usize {
        self.0.as_ref().map_or(0, |n| n.len())
    }

    /// Whether the upstream is absent or empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-sample cardinality of the upstream, zero while detached
    pub fn sample_count(&self) -> usize {
        self.0.as_ref().map_or(0, |n| n.sample_count())
    }

    /// Cascade a pass start to the upstream
    pub fn start(&mut self) -> Result<()> {
        self.require_mut()?.start()
    }

    /// Pull the upstream's next record
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        self.require_mut()?.next_record()
    }

    /// Borrow the upstream node, if attached
    pub fn get(&self) -> Option<&dyn Node> {
        self.0.as_deref()
    }

    /// Mutably borrow the upstream node, if attached
    pub fn get_mut(&mut self) -> Option<&mut dyn Node> {
        match self.0.as_mut() {
            Some(node) => Some(node.as_mut()),
            None => None,
        }
    }

    /// Detach and return the upstream node
    pub fn take(&mut self) -> Option<Box<dyn Node>> {
        self.0.take()
    }

    /// Attach an upstream node
    pub fn set(&mut self, node: Box<dyn Node>) {
        self.0 = Some(node);
    }

    fn require_mut(&mut self) -> Result<&mut dyn Node> {
        match self.0.as_mut() {
            Some(node) => Ok(node.as_mut()),
            None => Err(Error::contract("stage has no upstream attached")),
        }
    }
}

/// Walk the upstream chain to its terminus, the root data source
pub fn root(node: &dyn Node) -> &dyn Node {
    let mut cur = node;
    while let Some(up) = cur.upstream() {
        cur = up;
    }
    cur
}

/// Mutable variant of [`root`]
pub fn root_mut(node: &mut dyn Node) -> &mut dyn Node {
    if node.upstream().is_none() {
        node
    } else {
        match node.upstream_mut() {
            Some(up) => root_mut(up),
            None => unreachable!(),
        }
    }
}

/// The chain from the given node back to the root, descendants first
pub fn iter_rev(node: &dyn Node) -> Vec<&dyn Node> {
    let mut out = Vec::new();
    let mut cur = Some(node);
    while let Some(n) = cur {
        out.push(n);
        cur = n.upstream();
    }
    out
}

/// The chain from the root to the given node, ancestors first
pub fn iter_fwd(node: &dyn Node) -> Vec<&dyn Node> {
    let mut out = iter_rev(node);
    out.reverse();
    out
}

/// Locate a node of a concrete type within the chain ending at `tail`
pub fn find_node<'a, T: 'static>(tail: &'a dyn Node) -> Option<&'a T> {
    iter_rev(tail)
        .into_iter()
        .find_map(|n| n.as_any().downcast_ref::<T>())
}

/// Assign worker identity to every node in the chain ending at `tail`
pub fn set_worker_info(tail: &mut dyn Node, worker: WorkerInfo) {
    tail.set_worker(worker);
    if let Some(up) = tail.upstream_mut() {
        set_worker_info(up, worker);
    }
}

/// Run one full pass and collect every record it yields
pub fn drain(node: &mut dyn Node) -> Result<Vec<Record>> {
    node.start()?;
    let mut out = Vec::new();
    while let Some(rec) = node.next_record()? {
        out.push(rec);
    }
    Ok(out)
}

/// Rebuild a chain with an extra stage spliced in above a matched node
///
/// Walks from `tail` toward the root until `pred` matches, hands the matched
/// node (with its upstream chain intact) to `wrap`, then reattaches the
/// nodes that were walked past. Returns the new tail. Chains are otherwise
/// treated as immutable once built.
pub fn insert_above<P, F>(tail: Box<dyn Node>, pred: P, wrap: F) -> Result<Box<dyn Node>>
where
    P: Fn(&dyn Node) -> bool,
    F: FnOnce(Box<dyn Node>) -> Result<Box<dyn Node>>,
{
    let mut popped: Vec<Box<dyn Node>> = Vec::new();
    let mut cur = tail;

    while !pred(cur.as_ref()) {
        let up = cur.take_upstream().ok_or_else(|| {
            Error::contract("no node in the chain matched the insertion point")
        })?;
        popped.push(cur);
        cur = up;
    }

    let mut chain = wrap(cur)?;
    while let Some(mut node) = popped.pop() {
        node.set_upstream(chain)?;
        chain = node;
    }

    Ok(chain)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Minimal nodes used by unit tests across the crate

    use super::*;

    /// Root yielding `count` records with an `index` field
    pub struct CountSource {
        pub count: usize,
        cursor: usize,
    }

    impl CountSource {
        pub fn new(count: usize) -> Self {
            Self { count, cursor: 0 }
        }
    }

    impl Node for CountSource {
        fn fullname(&self) -> &'static str {
            "CountSource"
        }

        fn len(&self) -> usize {
            self.count
        }

        fn start(&mut self) -> Result<()> {
            self.cursor = 0;
            Ok(())
        }

        fn next_record(&mut self) -> Result<Option<Record>> {
            if self.cursor >= self.count {
                return Ok(None);
            }
            let mut rec = Record::new();
            rec.set("index", self.cursor as i64);
            self.cursor += 1;
            Ok(Some(rec))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Stage that appends its marker to a comma-joined `tags` field
    pub struct TagStage {
        input: Option<Box<dyn Node>>,
        pub tag: String,
    }

    impl TagStage {
        pub fn new(input: Box<dyn Node>, tag: impl Into<String>) -> Self {
            Self {
                input: Some(input),
                tag: tag.into(),
            }
        }
    }

    impl Node for TagStage {
        fn fullname(&self) -> &'static str {
            "TagStage"
        }

        fn len(&self) -> usize {
            self.input.as_ref().map_or(0, |n| n.len())
        }

        fn start(&mut self) -> Result<()> {
            match self.input.as_mut() {
                Some(input) => input.start(),
                None => Err(Error::contract("stage has no upstream")),
            }
        }

        fn next_record(&mut self) -> Result<Option<Record>> {
            let input = self
                .input
                .as_mut()
                .ok_or_else(|| Error::contract("stage has no upstream"))?;
            match input.next_record()? {
                Some(mut rec) => {
                    let tags = match rec.get("tags").and_then(|v| v.as_str().ok()) {
                        Some(prev) => format!("{prev},{}", self.tag),
                        None => self.tag.clone(),
                    };
                    rec.set("tags", tags);
                    Ok(Some(rec))
                }
                None => Ok(None),
            }
        }

        fn upstream(&self) -> Option<&dyn Node> {
            self.input.as_deref()
        }

        fn upstream_mut(&mut self) -> Option<&mut dyn Node> {
            match self.input.as_mut() {
                Some(b) => Some(b.as_mut()),
                None => None,
            }
        }

        fn take_upstream(&mut self) -> Option<Box<dyn Node>> {
            self.input.take()
        }

        fn set_upstream(&mut self, upstream: Box<dyn Node>) -> Result<()> {
            self.input = Some(upstream);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }
}
