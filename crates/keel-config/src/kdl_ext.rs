// Helper functions for extracting values from KDL nodes

use kdl::{KdlNode, KdlValue};

use crate::{ConfigError, ConfigResult};

pub(crate) fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Collect a property that may be repeated (`depends-on="a" depends-on="b"`)
/// or given as a child node (`depends-on "a" "b"`).
pub(crate) fn string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result: Vec<String> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                result.extend(all_string_args(child));
            }
        }
    }

    result
}

/// A non-negative integer argument, e.g. `concurrency 4`.
pub(crate) fn u64_arg(node: &KdlNode) -> ConfigResult<u64> {
    let field = node.name().value().to_string();
    let value = first_arg(node).ok_or_else(|| ConfigError::MissingField(field.clone()))?;

    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| ConfigError::InvalidValue {
            field,
            message: format!("expected a non-negative integer, got {value}"),
        })
}

/// A flag node: present with no argument means true, otherwise the
/// argument must be a boolean or "true"/"false".
pub(crate) fn flag(node: &KdlNode) -> ConfigResult<bool> {
    match first_arg(node) {
        None => Ok(true),
        Some(v) => {
            if let Some(b) = v.as_bool() {
                return Ok(b);
            }
            match v.as_string() {
                Some("true") => Ok(true),
                Some("false") => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    field: node.name().value().to_string(),
                    message: format!("expected a boolean, got {v}"),
                }),
            }
        }
    }
}
