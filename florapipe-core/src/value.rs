//! Dynamically typed field values carried by pipeline records

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// A single field value inside a [`Record`](crate::record::Record)
///
/// Per-sample records hold scalar variants (`Int`, `Str`, `Tensor`); batched
/// records hold the list variants with one element per sample. The `Map`
/// variant backs the `metrics` sub-mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean flag
    Bool(bool),

    /// Signed integer (identifiers, targets, dimensions)
    Int(i64),

    /// Floating point scalar (losses, learning rates)
    Float(f64),

    /// UTF-8 string (file names, labels)
    Str(String),

    /// Raw bytes (undecoded image file contents)
    Bytes(Vec<u8>),

    /// One integer per sample in a batch
    IntList(Vec<i64>),

    /// One float per sample or per category
    FloatList(Vec<f64>),

    /// One string per sample in a batch
    StrList(Vec<String>),

    /// Dense tensor (image, model output)
    Tensor(Tensor),

    /// Nested mapping, used for the `metrics` field
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// View as an integer
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(type_error("Int", other)),
        }
    }

    /// View as a float, accepting integer values as well
    pub fn as_float(&self) -> Result<f64> {
        match self {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            other => Err(type_error("Float", other)),
        }
    }

    /// View as a string slice
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(v) => Ok(v),
            other => Err(type_error("Str", other)),
        }
    }

    /// View as a tensor
    pub fn as_tensor(&self) -> Result<&Tensor> {
        match self {
            Value::Tensor(v) => Ok(v),
            other => Err(type_error("Tensor", other)),
        }
    }

    /// View as a list of integers
    pub fn as_int_list(&self) -> Result<&[i64]> {
        match self {
            Value::IntList(v) => Ok(v),
            other => Err(type_error("IntList", other)),
        }
    }

    /// View as a nested map
    pub fn as_map(&self) -> Result<&BTreeMap<String, Value>> {
        match self {
            Value::Map(v) => Ok(v),
            other => Err(type_error("Map", other)),
        }
    }

    /// View as a mutable nested map
    pub fn as_map_mut(&mut self) -> Result<&mut BTreeMap<String, Value>> {
        match self {
            Value::Map(v) => Ok(v),
            other => {
                let kind = other.kind();
                Err(Error::contract(format!("expected Map value, got {kind}")))
            }
        }
    }

    /// Short name of the variant, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Str(_) => "Str",
            Value::Bytes(_) => "Bytes",
            Value::IntList(_) => "IntList",
            Value::FloatList(_) => "FloatList",
            Value::StrList(_) => "StrList",
            Value::Tensor(_) => "Tensor",
            Value::Map(_) => "Map",
        }
    }

    /// Number of per-sample elements this value represents
    ///
    /// Scalars count as one; lists count their elements; a tensor counts the
    /// extent of its leading axis.
    pub fn batch_len(&self) -> usize {
        match self {
            Value::IntList(v) => v.len(),
            Value::FloatList(v) => v.len(),
            Value::StrList(v) => v.len(),
            Value::Tensor(t) if t.ndim() > 1 => t.shape()[0],
            _ => 1,
        }
    }
}

fn type_error(expected: &str, got: &Value) -> Error {
    Error::contract(format!("expected {expected} value, got {}", got.kind()))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::IntList(v) => write!(f, "{v:?}"),
            Value::FloatList(v) => write!(f, "{v:?}"),
            Value::StrList(v) => write!(f, "{v:?}"),
            Value::Tensor(t) => write!(f, "<tensor {:?}>", t.shape()),
            Value::Map(m) => write!(f, "<map of {}>", m.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Tensor> for Value {
    fn from(v: Tensor) -> Self {
        Value::Tensor(v)
    }
}
