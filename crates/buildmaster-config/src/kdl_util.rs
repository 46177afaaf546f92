//! Helpers for extracting values from KDL nodes.

use kdl::KdlNode;
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// Read a non-negative integer property, rejecting values that do not fit.
pub(crate) fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    let int = value
        .as_integer()
        .ok_or_else(|| ConfigError::invalid(name, "expected an integer"))?;
    u64::try_from(int)
        .map(Some)
        .map_err(|_| ConfigError::invalid(name, format!("{} is out of range", int)))
}

pub(crate) fn get_u32_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
    match get_u64_prop(node, name)? {
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| ConfigError::invalid(name, format!("{} is out of range", v))),
        None => Ok(None),
    }
}

/// Integer seconds to a `Duration`.
pub(crate) fn get_secs_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    Ok(get_u64_prop(node, name)?.map(Duration::from_secs))
}

/// String arguments of the first child named `name`.
pub(crate) fn get_child_args(node: &KdlNode, name: &str) -> Option<Vec<String>> {
    node.children()?
        .nodes()
        .iter()
        .find(|child| child.name().value() == name)
        .map(get_all_string_args)
}
