//! Pipeline assembly from configuration
//!
//! A pipeline is declared as an ordered list of node configurations. Each
//! entry after the first receives the previously built node as its `input`
//! argument, so the list reads top-to-bottom as source-to-tail.

use serde_json::Value as ConfigValue;

use crate::error::{Error, Result};
use crate::instantiate::{instantiate, instantiate_with, Constructors, Registry, Resolved};
use crate::node::Node;

/// Configuration key under which the upstream node is injected
pub const INPUT_KEY: &str = "input";

/// Build a chain of nodes from an ordered list of entries
///
/// The first entry must be self-sufficient (a dataset); every later entry
/// is handed the node built so far under [`INPUT_KEY`], overriding any
/// value it declared for that key. Returns the tail node, which owns the
/// whole chain, or `None` for an empty list.
pub fn build_pipeline(
    constructors: &Constructors,
    registry: &Registry,
    entries: &ConfigValue,
) -> Result<Option<Box<dyn Node>>> {
    let entries = entries.as_array().ok_or_else(|| {
        Error::config("a pipeline must be a list of node configurations")
    })?;

    let mut tail: Option<Box<dyn Node>> = None;
    for (position, entry) in entries.iter().enumerate() {
        let resolved = match tail.take() {
            None => instantiate(constructors, registry, entry)?,
            Some(node) => instantiate_with(
                constructors,
                registry,
                entry,
                INPUT_KEY,
                Resolved::Node(node),
            )?,
        };

        match resolved {
            Resolved::Node(node) => {
                tracing::debug!(position, name = node.fullname(), "pipeline node built");
                tail = Some(node);
            }
            other => {
                return Err(Error::config(format!(
                    "pipeline entry {position} must construct a node, got {}",
                    other.kind()
                )))
            }
        }
    }

    Ok(tail)
}
