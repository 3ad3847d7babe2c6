//! Typed attribute values.
//!
//! A [`Value`] is what a resource input or output holds: a literal, a typed
//! reference to another node's output, or a sensitive literal. Secrets are
//! redacted in `Debug`, `Display` and [`Value::redacted`]; only
//! [`Value::expose_json`] hands out the plaintext, for the external call that
//! needs it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// Placeholder rendered in place of sensitive values.
pub const REDACTED: &str = "***";

/// Named outputs of an applied node.
pub type Outputs = BTreeMap<String, Value>;

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Bool(b) => serde_json::Value::Bool(*b),
            Scalar::Int(i) => serde_json::Value::from(*i),
            Scalar::Float(f) => serde_json::Value::from(*f),
            Scalar::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Convert a JSON value produced by an external command into a scalar.
    /// Arrays and objects are kept as their compact JSON text.
    pub fn from_json(value: &serde_json::Value) -> Scalar {
        match value {
            serde_json::Value::Bool(b) => Scalar::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Scalar::Int(i),
                None => Scalar::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Scalar::String(s.clone()),
            serde_json::Value::Null => Scalar::String(String::new()),
            other => Scalar::String(other.to_string()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::String(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::String(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// A typed reference to `node.output`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub node: String,
    pub output: String,
}

impl OutputRef {
    pub fn new(node: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            output: output.into(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.output)
    }
}

impl std::str::FromStr for OutputRef {
    type Err = Error;

    /// Parse `node.output`. The node id ends at the first dot.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((node, output)) if !node.is_empty() && !output.is_empty() => {
                Ok(OutputRef::new(node, output))
            }
            _ => Err(Error::InvalidInput(format!(
                "reference '{s}' must have the form node.output"
            ))),
        }
    }
}

/// An input or output value.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Literal(Scalar),
    Reference(OutputRef),
    Secret(Scalar),
}

impl Value {
    pub fn literal(value: impl Into<Scalar>) -> Self {
        Value::Literal(value.into())
    }

    pub fn reference(node: impl Into<String>, output: impl Into<String>) -> Self {
        Value::Reference(OutputRef::new(node, output))
    }

    pub fn secret(value: impl Into<Scalar>) -> Self {
        Value::Secret(value.into())
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, Value::Secret(_))
    }

    pub fn as_reference(&self) -> Option<&OutputRef> {
        match self {
            Value::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// The scalar of a resolved value. References have none.
    pub fn scalar(&self) -> Option<&Scalar> {
        match self {
            Value::Literal(s) | Value::Secret(s) => Some(s),
            Value::Reference(_) => None,
        }
    }

    /// JSON rendering safe for reports and logs.
    pub fn redacted(&self) -> serde_json::Value {
        match self {
            Value::Literal(s) => s.to_json(),
            Value::Reference(r) => serde_json::Value::String(format!("${{{r}}}")),
            Value::Secret(_) => serde_json::Value::String(REDACTED.to_string()),
        }
    }

    /// Plaintext JSON rendering, including secrets. Only for handing
    /// resolved inputs to an external call.
    pub fn expose_json(&self) -> serde_json::Value {
        match self {
            Value::Literal(s) | Value::Secret(s) => s.to_json(),
            Value::Reference(r) => serde_json::Value::String(format!("${{{r}}}")),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Literal(s) => f.debug_tuple("Literal").field(s).finish(),
            Value::Reference(r) => f.debug_tuple("Reference").field(r).finish(),
            Value::Secret(_) => f.debug_tuple("Secret").field(&REDACTED).finish(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Literal(s) => write!(f, "{s}"),
            Value::Reference(r) => write!(f, "${{{r}}}"),
            Value::Secret(_) => f.write_str(REDACTED),
        }
    }
}

/// Redacted JSON object for a set of outputs.
pub fn redact_outputs(outputs: &Outputs) -> BTreeMap<String, serde_json::Value> {
    outputs
        .iter()
        .map(|(k, v)| (k.clone(), v.redacted()))
        .collect()
}
