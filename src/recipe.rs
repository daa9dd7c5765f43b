//! Recipe loading and key-path lookup.
//!
//! A recipe is a TOML document describing one deployment: which devices to
//! target, what to run, and how to post-process the results. Consumers read
//! it through dotted key-path lookups (`"deployment.local.device_ids"`)
//! with explicit fallbacks, so newer recipes with extra keys remain
//! loadable by older binaries.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use toml::Value;

/// A loaded deployment recipe.
///
/// Wraps the parsed TOML document and exposes dotted key-path lookups.
/// Lookups never fail: a missing or mistyped key yields `None` (or the
/// caller's fallback), matching how recipes have always been consumed.
#[derive(Debug, Clone)]
pub struct Recipe {
    root: Value,
    path: Option<PathBuf>,
}

impl Recipe {
    /// Loads a recipe from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains invalid TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;

        let root: Value = toml::from_str(&content)
            .with_context(|| format!("Failed to parse recipe file: {}", path.display()))?;

        Ok(Self {
            root,
            path: Some(path.to_path_buf()),
        })
    }

    /// Parses a recipe from a TOML string.
    ///
    /// Useful for testing and for embedding recipes programmatically.
    pub fn from_str(content: &str) -> Result<Self> {
        let root: Value = toml::from_str(content).context("Failed to parse recipe")?;
        Ok(Self { root, path: None })
    }

    /// The file this recipe was loaded from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Looks up a value by dotted key path, e.g. `"systrace.enabled"`.
    pub fn lookup(&self, key_path: &str) -> Option<&Value> {
        let mut current = &self.root;
        for key in key_path.split('.') {
            current = current.as_table()?.get(key)?;
        }
        Some(current)
    }

    /// Boolean lookup with a fallback for missing or mistyped keys.
    pub fn lookup_bool(&self, key_path: &str, fallback: bool) -> bool {
        self.lookup(key_path)
            .and_then(Value::as_bool)
            .unwrap_or(fallback)
    }

    /// String lookup; `None` when missing or not a string.
    pub fn lookup_str(&self, key_path: &str) -> Option<&str> {
        self.lookup(key_path).and_then(Value::as_str)
    }

    /// String-array lookup; empty when missing. Non-string elements are
    /// skipped.
    pub fn lookup_str_list(&self, key_path: &str) -> Vec<String> {
        self.lookup(key_path)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Array lookup; `None` when missing or not an array.
    pub fn lookup_array(&self, key_path: &str) -> Option<&Vec<Value>> {
        self.lookup(key_path).and_then(Value::as_array)
    }

    /// Table lookup; `None` when missing or not a table.
    pub fn lookup_table(&self, key_path: &str) -> Option<&toml::map::Map<String, Value>> {
        self.lookup(key_path).and_then(Value::as_table)
    }
}
