use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{RegistryError, Result};
use crate::state::kinds::SourceType;
use crate::state::models::{Blueprint, NewBlueprint, NewEnvironment};

/// Uploaded content plus the caller's description of its structure.
#[derive(Debug, Clone)]
pub struct Content {
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// `{"columns": [...], "tabs": [...]}` as read by the caller.
    pub structure: Option<Value>,
}

impl Content {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
            structure: None,
        }
    }

    pub fn with_structure(mut self, structure: Value) -> Self {
        self.structure = Some(structure);
        self
    }
}

fn slug_pattern() -> &'static Regex {
    static SLUG: OnceLock<Regex> = OnceLock::new();
    SLUG.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_\-]{0,63}$").expect("valid slug regex"))
}

/// Ids double as folder and file-name prefixes, so keep them path-safe.
pub fn validate_slug(kind: &str, id: &str) -> Result<()> {
    if slug_pattern().is_match(id) {
        Ok(())
    } else {
        Err(RegistryError::validation(format!(
            "{} id '{}' must be lowercase letters, digits, '_' or '-' (max 64)",
            kind, id
        )))
    }
}

pub fn validate_new_environment(env: &NewEnvironment) -> Result<()> {
    validate_slug("environment", &env.id)?;
    if env.name.trim().is_empty() {
        return Err(RegistryError::validation("environment name is required"));
    }
    Ok(())
}

pub fn validate_new_blueprint(bp: &NewBlueprint) -> Result<()> {
    validate_slug("blueprint", &bp.id)?;
    if bp.name.trim().is_empty() {
        return Err(RegistryError::validation("blueprint name is required"));
    }
    if !bp.expected_extension.starts_with('.') || bp.expected_extension.len() < 2 {
        return Err(RegistryError::validation(format!(
            "expected extension '{}' must look like '.csv'",
            bp.expected_extension
        )));
    }
    for (label, size) in [("min", bp.min_size_kb), ("max", bp.max_size_kb)] {
        if size.is_some_and(|kb| kb < 0.0 || !kb.is_finite()) {
            return Err(RegistryError::validation(format!(
                "{} size must be a non-negative number of KB",
                label
            )));
        }
    }
    if let (Some(min), Some(max)) = (bp.min_size_kb, bp.max_size_kb) {
        if min > max {
            return Err(RegistryError::validation(format!(
                "min size {} KB exceeds max size {} KB",
                min, max
            )));
        }
    }
    if let Some(structure) = &bp.expected_structure {
        let obj = structure.as_object().ok_or_else(|| {
            RegistryError::validation("expected structure must be a JSON object")
        })?;
        for key in ["columns", "tabs"] {
            if let Some(v) = obj.get(key) {
                string_list(v).ok_or_else(|| {
                    RegistryError::validation(format!(
                        "expected structure '{}' must be an array of strings",
                        key
                    ))
                })?;
            }
        }
    }
    if bp.primary_key_column.is_some() {
        let declares_columns = bp
            .expected_structure
            .as_ref()
            .and_then(|s| s.get("columns"))
            .is_some();
        if !declares_columns {
            return Err(RegistryError::validation(
                "primary key column requires expected structure columns",
            ));
        }
    }
    if bp.source_type == Some(SourceType::ExternalConnection) {
        let named = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        if !named(&bp.source_name) || !named(&bp.source_specifier) {
            return Err(RegistryError::validation(
                "external connections need a domain key and a specifier",
            ));
        }
    }
    Ok(())
}

/// Checks uploaded content against its blueprint and returns a one-line
/// summary of what passed.
pub fn validate_content(bp: &Blueprint, content: &Content) -> Result<String> {
    let name = content.file_name.trim();
    if name.is_empty() {
        return Err(RegistryError::validation("file name is required"));
    }
    if !name
        .to_ascii_lowercase()
        .ends_with(&bp.expected_extension.to_ascii_lowercase())
    {
        return Err(RegistryError::validation(format!(
            "'{}' does not have the expected extension {}",
            name, bp.expected_extension
        )));
    }
    if content.bytes.is_empty() {
        return Err(RegistryError::validation(format!("'{}' is empty", name)));
    }

    let size_kb = content.bytes.len() as f64 / 1024.0;
    if let Some(min) = bp.min_size_kb {
        if size_kb < min {
            return Err(RegistryError::validation(format!(
                "'{}' is {:.1} KB, below the minimum of {} KB",
                name, size_kb, min
            )));
        }
    }
    if let Some(max) = bp.max_size_kb {
        if size_kb > max {
            return Err(RegistryError::validation(format!(
                "'{}' is {:.1} KB, above the maximum of {} KB",
                name, size_kb, max
            )));
        }
    }

    let mut checks = vec![
        format!("extension {}", bp.expected_extension),
        format!("size {:.1} KB", size_kb),
    ];
    if let Some(expected) = &bp.expected_structure {
        let actual = content.structure.as_ref();
        for key in ["columns", "tabs"] {
            let Some(required) = expected.get(key).and_then(string_list) else {
                continue;
            };
            let present = actual
                .and_then(|s| s.get(key))
                .and_then(string_list)
                .ok_or_else(|| {
                    RegistryError::validation(format!("'{}' does not describe its {}", name, key))
                })?;
            let missing: Vec<&str> = required
                .iter()
                .filter(|r| !present.contains(*r))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(RegistryError::validation(format!(
                    "'{}' is missing {}: {}",
                    name,
                    key,
                    missing.join(", ")
                )));
            }
            checks.push(format!("{} {}", required.len(), key));
        }
        if let Some(pk) = &bp.primary_key_column {
            let columns = actual
                .and_then(|s| s.get("columns"))
                .and_then(string_list)
                .unwrap_or_default();
            if !columns.contains(&pk.as_str()) {
                return Err(RegistryError::validation(format!(
                    "'{}' has no primary key column '{}'",
                    name, pk
                )));
            }
            checks.push(format!("primary key {}", pk));
        }
    }

    Ok(format!("passed: {}", checks.join("; ")))
}

fn string_list(value: &Value) -> Option<Vec<&str>> {
    value
        .as_array()?
        .iter()
        .map(Value::as_str)
        .collect::<Option<Vec<_>>>()
}
