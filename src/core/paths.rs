//! Artifact path construction.
//!
//! The default layout is `backups/<device_name>.<run_timestamp>.<kind>-config`.
//! Operators may instead configure a template per artifact kind whose
//! `{placeholder}` tokens are resolved against the device's inventory
//! attributes, e.g. `configs/{location.name}/{name}.cfg`.

use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use super::models::{ArtifactKind, RunTimestamp};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)\}").expect("placeholder regex is valid")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("unresolved placeholder {{{0}}} in path template")]
    UnresolvedPlaceholder(String),

    #[error("path {0:?} escapes the repository working copy")]
    OutsideWorkingCopy(String),

    #[error("path template rendered an empty path")]
    Empty,
}

/// Default artifact path relative to the working copy root.
pub fn default_artifact_path(
    device_name: &str,
    run_timestamp: &RunTimestamp,
    kind: ArtifactKind,
) -> String {
    format!("backups/{}.{}.{}-config", device_name, run_timestamp, kind)
}

/// Substitute `{dotted.path}` placeholders with values from `attributes`.
pub fn render_template(template: &str, attributes: &Value) -> Result<String, PathError> {
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = lookup(attributes, name.as_str())
            .ok_or_else(|| PathError::UnresolvedPlaceholder(name.as_str().to_string()))?;

        rendered.push_str(&template[last..whole.start()]);
        rendered.push_str(&value);
        last = whole.end();
    }
    rendered.push_str(&template[last..]);

    Ok(rendered)
}

fn lookup(attributes: &Value, dotted: &str) -> Option<String> {
    let mut current = attributes;
    for segment in dotted.split('.') {
        current = current.get(segment)?;
    }

    match current {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Check a rendered relative path and normalise it to `/` separators.
///
/// Leading slashes are stripped; `..` and other non-normal components are rejected.
pub fn sanitize_relative(path: &str) -> Result<String, PathError> {
    let trimmed = path.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }

    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(PathError::OutsideWorkingCopy(path.to_string())),
        }
    }

    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// Resolve the relative path for one artifact of one device.
pub fn artifact_path(
    template: Option<&str>,
    device_name: &str,
    attributes: &Value,
    run_timestamp: &RunTimestamp,
    kind: ArtifactKind,
) -> Result<String, PathError> {
    match template {
        Some(template) => sanitize_relative(&render_template(template, attributes)?),
        None => sanitize_relative(&default_artifact_path(device_name, run_timestamp, kind)),
    }
}
