//! Object-graph instantiation engine
//!
//! Turns a declarative configuration tree into live objects. Two sentinel
//! keys are honored at every mapping level: `target` names a registered
//! constructor to run with the mapping's remaining (already resolved) keys
//! as keyword arguments, and `instance` references a previously constructed
//! shared object by name. Resolution is depth-first, children before
//! parents, and the input tree is never mutated. Every failure is fatal:
//! configuration errors stop the run before any data processing begins.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde_json::Value as ConfigValue;

use crate::error::{Error, Result};
use crate::model::{SharedCriterion, SharedModel};
use crate::node::Node;
use crate::optim::SharedOptimizer;
use crate::sink::SharedWriter;
use crate::transform::SharedTransform;

/// Sentinel key naming a constructible target
pub const TARGET_KEY: &str = "target";

/// Sentinel key referencing a registered instance
pub const INSTANCE_KEY: &str = "instance";

/// A constructed shared object, as stored in the instance registry
///
/// The set of collaborator kinds is explicit and enumerable; there is no
/// dynamic module scanning anywhere in the engine.
#[derive(Clone)]
pub enum SharedInstance {
    /// A model
    Model(SharedModel),

    /// A loss criterion
    Criterion(SharedCriterion),

    /// An optimizer
    Optimizer(SharedOptimizer),

    /// A metric writer
    Writer(SharedWriter),

    /// An image transform
    Transform(SharedTransform),

    /// Any other shared object
    Other(Rc<dyn Any>),
}

impl std::fmt::Debug for SharedInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedInstance").field(&self.kind()).finish()
    }
}

impl SharedInstance {
    /// Short name of the instance kind, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            SharedInstance::Model(_) => "Model",
            SharedInstance::Criterion(_) => "Criterion",
            SharedInstance::Optimizer(_) => "Optimizer",
            SharedInstance::Writer(_) => "Writer",
            SharedInstance::Transform(_) => "Transform",
            SharedInstance::Other(_) => "Other",
        }
    }

    /// Whether two handles refer to the same underlying object
    pub fn same(&self, other: &SharedInstance) -> bool {
        match (self, other) {
            (SharedInstance::Model(a), SharedInstance::Model(b)) => Rc::ptr_eq(a, b),
            (SharedInstance::Criterion(a), SharedInstance::Criterion(b)) => Rc::ptr_eq(a, b),
            (SharedInstance::Optimizer(a), SharedInstance::Optimizer(b)) => Rc::ptr_eq(a, b),
            (SharedInstance::Writer(a), SharedInstance::Writer(b)) => Rc::ptr_eq(a, b),
            (SharedInstance::Transform(a), SharedInstance::Transform(b)) => Rc::ptr_eq(a, b),
            (SharedInstance::Other(a), SharedInstance::Other(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// The result of resolving one configuration subtree
#[derive(Debug)]
pub enum Resolved {
    /// Plain configuration data, not an instantiable object
    Data(ConfigValue),

    /// A sequence with at least one constructed element
    List(Vec<Resolved>),

    /// A mapping with at least one constructed value
    Map(BTreeMap<String, Resolved>),

    /// A constructed (or referenced) shared object
    Shared(SharedInstance),

    /// A constructed pipeline node
    Node(Box<dyn Node>),
}

impl Resolved {
    /// Short name of the variant, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Resolved::Data(_) => "Data",
            Resolved::List(_) => "List",
            Resolved::Map(_) => "Map",
            Resolved::Shared(_) => "Shared",
            Resolved::Node(_) => "Node",
        }
    }
}

/// Constructor callback for one target identifier
pub type ConstructorFn = Box<dyn Fn(&mut Args) -> Result<Resolved>>;

/// Registry of constructible targets, keyed by dotted identifier
///
/// Populated explicitly at startup; a `target` directive whose identifier
/// is absent fails resolution.
#[derive(Default)]
pub struct Constructors {
    map: HashMap<String, ConstructorFn>,
}

impl Constructors {
    /// Create an empty constructor registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under a dotted target identifier
    pub fn register<F>(&mut self, target: &str, f: F)
    where
        F: Fn(&mut Args) -> Result<Resolved> + 'static,
    {
        self.map.insert(target.to_string(), Box::new(f));
    }

    /// Whether the identifier is registered
    pub fn contains(&self, target: &str) -> bool {
        self.map.contains_key(target)
    }

    fn get(&self, target: &str) -> Result<&ConstructorFn> {
        self.map
            .get(target)
            .ok_or_else(|| Error::UnknownTarget(target.to_string()))
    }
}

/// Run-scoped registry of named shared instances
///
/// Populated sequentially before any pipeline runs, then read-only.
/// Referenced names must already exist; forward references are not
/// supported.
#[derive(Default)]
pub struct Registry {
    map: HashMap<String, SharedInstance>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared instance under a name
    pub fn insert(&mut self, name: impl Into<String>, instance: SharedInstance) {
        self.map.insert(name.into(), instance);
    }

    /// Look up an instance, failing if the name is unregistered
    pub fn get(&self, name: &str) -> Result<SharedInstance> {
        self.map
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownInstance(name.to_string()))
    }

    /// Whether the name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }
}

/// Instantiate a configuration subtree
///
/// The input tree is deep-copied before resolution, so the caller's
/// configuration stays inspectable and re-saveable.
pub fn instantiate(
    constructors: &Constructors,
    registry: &Registry,
    config: &ConfigValue,
) -> Result<Resolved> {
    resolve(constructors, registry, config.clone(), None)
}

/// Instantiate a mapping with one argument forced to an injected value
///
/// Used by the pipeline builder to hand each entry its upstream node; the
/// injected value overrides any value the entry declared for that key. The
/// injection applies to the outermost mapping only and is ignored by
/// `instance` references, which resolve verbatim.
pub fn instantiate_with(
    constructors: &Constructors,
    registry: &Registry,
    config: &ConfigValue,
    inject_key: &str,
    inject: Resolved,
) -> Result<Resolved> {
    resolve(constructors, registry, config.clone(), Some((inject_key, inject)))
}

fn resolve(
    constructors: &Constructors,
    registry: &Registry,
    config: ConfigValue,
    inject: Option<(&str, Resolved)>,
) -> Result<Resolved> {
    match config {
        ConfigValue::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve(constructors, registry, item, None)?);
            }
            Ok(collapse_list(resolved))
        }
        ConfigValue::Object(map) => resolve_mapping(constructors, registry, map, inject),
        other => Ok(Resolved::Data(other)),
    }
}

fn resolve_mapping(
    constructors: &Constructors,
    registry: &Registry,
    map: serde_json::Map<String, ConfigValue>,
    inject: Option<(&str, Resolved)>,
) -> Result<Resolved> {
    // children first: the parent's constructor receives resolved arguments
    let mut resolved: BTreeMap<String, Resolved> = BTreeMap::new();
    for (key, value) in map {
        resolved.insert(key, resolve(constructors, registry, value, None)?);
    }

    // an instance reference never constructs; it short-circuits any target
    if let Some(value) = resolved.get(INSTANCE_KEY) {
        let name = data_str(value).ok_or_else(|| {
            Error::config("the 'instance' directive requires a string name")
        })?;
        return Ok(Resolved::Shared(registry.get(&name)?));
    }

    if let Some(value) = resolved.remove(TARGET_KEY) {
        let target = data_str(&value).ok_or_else(|| {
            Error::config("the 'target' directive requires a string identifier")
        })?;

        if let Some((key, injected)) = inject {
            resolved.insert(key.to_string(), injected);
        }

        tracing::debug!(target = %target, "constructing");
        let constructor = constructors.get(&target)?;
        let mut args = Args::new(target.clone(), resolved);
        return constructor(&mut args);
    }

    // plain configuration data, returned unchanged
    Ok(collapse_map(resolved))
}

fn data_str(value: &Resolved) -> Option<String> {
    match value {
        Resolved::Data(ConfigValue::String(s)) => Some(s.clone()),
        _ => None,
    }
}

fn collapse_list(items: Vec<Resolved>) -> Resolved {
    if items.iter().all(|r| matches!(r, Resolved::Data(_))) {
        let data = items
            .into_iter()
            .map(|r| match r {
                Resolved::Data(v) => v,
                _ => unreachable!(),
            })
            .collect();
        Resolved::Data(ConfigValue::Array(data))
    } else {
        Resolved::List(items)
    }
}

fn collapse_map(map: BTreeMap<String, Resolved>) -> Resolved {
    if map.values().all(|r| matches!(r, Resolved::Data(_))) {
        let mut data = serde_json::Map::new();
        for (key, value) in map {
            match value {
                Resolved::Data(v) => {
                    data.insert(key, v);
                }
                _ => unreachable!(),
            }
        }
        Resolved::Data(ConfigValue::Object(data))
    } else {
        Resolved::Map(map)
    }
}

/// Keyword arguments handed to a constructor
///
/// Values have already been recursively resolved. Constructors take the
/// arguments they know; [`Args::finish`] rejects anything left over so
/// misspelled keys fail fast.
pub struct Args {
    target: String,
    values: BTreeMap<String, Resolved>,
}

impl Args {
    fn new(target: String, values: BTreeMap<String, Resolved>) -> Self {
        Self { target, values }
    }

    /// The dotted identifier being constructed
    pub fn target(&self) -> &str {
        &self.target
    }

    fn construction(&self, reason: impl Into<String>) -> Error {
        Error::Construction {
            target: self.target.clone(),
            reason: reason.into(),
        }
    }

    fn missing(&self, name: &str) -> Error {
        self.construction(format!("missing required argument '{name}'"))
    }

    fn mismatch(&self, name: &str, expected: &str, got: &Resolved) -> Error {
        self.construction(format!(
            "argument '{name}' must be {expected}, got {}",
            got.kind()
        ))
    }

    /// Remove and return an argument, if declared
    pub fn take(&mut self, name: &str) -> Option<Resolved> {
        self.values.remove(name)
    }

    /// A required string argument
    pub fn require_str(&mut self, name: &str) -> Result<String> {
        match self.take(name) {
            Some(Resolved::Data(ConfigValue::String(s))) => Ok(s),
            Some(other) => Err(self.mismatch(name, "a string", &other)),
            None => Err(self.missing(name)),
        }
    }

    /// An optional string argument with a default
    pub fn take_str_or(&mut self, name: &str, default: &str) -> Result<String> {
        match self.take(name) {
            Some(Resolved::Data(ConfigValue::String(s))) => Ok(s),
            Some(other) => Err(self.mismatch(name, "a string", &other)),
            None => Ok(default.to_string()),
        }
    }

    /// A required non-negative integer argument
    pub fn require_usize(&mut self, name: &str) -> Result<usize> {
        match self.take(name) {
            Some(resolved) => self.as_usize(name, resolved),
            None => Err(self.missing(name)),
        }
    }

    /// An optional non-negative integer argument with a default
    pub fn take_usize_or(&mut self, name: &str, default: usize) -> Result<usize> {
        match self.take(name) {
            Some(resolved) => self.as_usize(name, resolved),
            None => Ok(default),
        }
    }

    fn as_usize(&self, name: &str, resolved: Resolved) -> Result<usize> {
        match resolved {
            Resolved::Data(ConfigValue::Number(n)) if n.as_u64().is_some() => {
                Ok(n.as_u64().map(|v| v as usize).unwrap_or_default())
            }
            other => Err(self.mismatch(name, "a non-negative integer", &other)),
        }
    }

    /// An optional unsigned 64-bit argument with a default (seeds)
    pub fn take_u64_or(&mut self, name: &str, default: u64) -> Result<u64> {
        match self.take(name) {
            Some(Resolved::Data(ConfigValue::Number(n))) if n.as_u64().is_some() => {
                Ok(n.as_u64().unwrap_or_default())
            }
            Some(other) => Err(self.mismatch(name, "a non-negative integer", &other)),
            None => Ok(default),
        }
    }

    /// A required float argument
    pub fn require_f64(&mut self, name: &str) -> Result<f64> {
        match self.take(name) {
            Some(Resolved::Data(ConfigValue::Number(n))) if n.as_f64().is_some() => {
                Ok(n.as_f64().unwrap_or_default())
            }
            Some(other) => Err(self.mismatch(name, "a number", &other)),
            None => Err(self.missing(name)),
        }
    }

    /// An optional float argument with a default
    pub fn take_f64_or(&mut self, name: &str, default: f64) -> Result<f64> {
        match self.take(name) {
            Some(Resolved::Data(ConfigValue::Number(n))) if n.as_f64().is_some() => {
                Ok(n.as_f64().unwrap_or_default())
            }
            Some(other) => Err(self.mismatch(name, "a number", &other)),
            None => Ok(default),
        }
    }

    /// An optional boolean argument with a default
    pub fn take_bool_or(&mut self, name: &str, default: bool) -> Result<bool> {
        match self.take(name) {
            Some(Resolved::Data(ConfigValue::Bool(b))) => Ok(b),
            Some(other) => Err(self.mismatch(name, "a boolean", &other)),
            None => Ok(default),
        }
    }

    /// An optional list-of-floats argument; a single number becomes a
    /// one-element list
    pub fn take_f64s(&mut self, name: &str) -> Result<Option<Vec<f64>>> {
        match self.take(name) {
            Some(Resolved::Data(ConfigValue::Number(n))) if n.as_f64().is_some() => {
                Ok(Some(vec![n.as_f64().unwrap_or_default()]))
            }
            Some(Resolved::Data(ConfigValue::Array(items))) => {
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    match item.as_f64() {
                        Some(v) => out.push(v),
                        None => {
                            return Err(self.construction(format!(
                                "argument '{name}' must contain only numbers"
                            )))
                        }
                    }
                }
                Ok(Some(out))
            }
            Some(other) => Err(self.mismatch(name, "a number or list of numbers", &other)),
            None => Ok(None),
        }
    }

    /// A required pipeline-node argument (usually the injected upstream)
    pub fn require_node(&mut self, name: &str) -> Result<Box<dyn Node>> {
        match self.take(name) {
            Some(Resolved::Node(node)) => Ok(node),
            Some(other) => Err(self.mismatch(name, "a pipeline node", &other)),
            None => Err(self.missing(name)),
        }
    }

    /// A required shared-instance argument of any kind
    pub fn require_shared(&mut self, name: &str) -> Result<SharedInstance> {
        match self.take(name) {
            Some(Resolved::Shared(shared)) => Ok(shared),
            Some(other) => Err(self.mismatch(name, "a shared instance", &other)),
            None => Err(self.missing(name)),
        }
    }

    /// A required model argument
    pub fn require_model(&mut self, name: &str) -> Result<SharedModel> {
        match self.require_shared(name)? {
            SharedInstance::Model(m) => Ok(m),
            other => Err(self.construction(format!(
                "argument '{name}' must be a Model instance, got {}",
                other.kind()
            ))),
        }
    }

    /// A required criterion argument
    pub fn require_criterion(&mut self, name: &str) -> Result<SharedCriterion> {
        match self.require_shared(name)? {
            SharedInstance::Criterion(c) => Ok(c),
            other => Err(self.construction(format!(
                "argument '{name}' must be a Criterion instance, got {}",
                other.kind()
            ))),
        }
    }

    /// A required optimizer argument
    pub fn require_optimizer(&mut self, name: &str) -> Result<SharedOptimizer> {
        match self.require_shared(name)? {
            SharedInstance::Optimizer(o) => Ok(o),
            other => Err(self.construction(format!(
                "argument '{name}' must be an Optimizer instance, got {}",
                other.kind()
            ))),
        }
    }

    /// A required metric-writer argument
    pub fn require_writer(&mut self, name: &str) -> Result<SharedWriter> {
        match self.require_shared(name)? {
            SharedInstance::Writer(w) => Ok(w),
            other => Err(self.construction(format!(
                "argument '{name}' must be a Writer instance, got {}",
                other.kind()
            ))),
        }
    }

    /// A required list of transform instances
    pub fn require_transforms(&mut self, name: &str) -> Result<Vec<SharedTransform>> {
        let items = match self.take(name) {
            Some(Resolved::List(items)) => items,
            Some(single @ Resolved::Shared(_)) => vec![single],
            Some(other) => return Err(self.mismatch(name, "a list of transforms", &other)),
            None => return Err(self.missing(name)),
        };

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Resolved::Shared(SharedInstance::Transform(t)) => out.push(t),
                other => {
                    return Err(self.construction(format!(
                        "argument '{name}' must contain Transform instances, got {}",
                        other.kind()
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Reject any arguments nothing consumed
    pub fn finish(&mut self) -> Result<()> {
        if self.values.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = self.values.keys().map(String::as_str).collect();
        Err(Error::Construction {
            target: self.target.clone(),
            reason: format!("unexpected arguments: {}", names.join(", ")),
        })
    }
}
