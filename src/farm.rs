//! Remote device-farm dispatch.
//!
//! Translates the recipe's farm configuration into a [`FarmJobSpec`],
//! submits it to an opaque [`FarmBackend`], waits for the downloaded
//! report/trace artifacts, and hands them to the collector exactly like
//! locally extracted ones.
//!
//! A `build.type` of `"none"` (no installable package produced) is
//! categorically unsupported on the farm and fails before any submission
//! call is made.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::info;

use crate::recipe::Recipe;

/// Errors from building or dispatching a farm job.
#[derive(Debug, thiserror::Error)]
pub enum FarmError {
    /// Farm execution needs an installable package; `build.type = "none"`
    /// produces none.
    #[error("farm execution is not supported when build.type is \"none\"")]
    UnsupportedConfiguration,

    /// The recipe declares no tests under `deployment.farm.args`.
    #[error("recipe declares no farm tests under deployment.farm.args")]
    NoTests,

    /// The backend failed to run the job or retrieve artifacts.
    #[error("farm backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Farm job specification, constructed once per dispatch and never
/// mutated after submission.
#[derive(Debug, Clone, Serialize)]
pub struct FarmJobSpec {
    /// Declared tests keyed by name, each with the resolved package path
    /// injected as its `app` argument.
    pub tests: serde_json::Map<String, JsonValue>,
    /// Farm-level flags, passed through untouched.
    pub flags: serde_json::Map<String, JsonValue>,
    /// Target device matrix.
    pub devices: Vec<String>,
    /// Exclusion matrix.
    pub excluding: Vec<String>,
    /// The test to run; defaults to the first declared test.
    pub active_test: String,
    /// Whether the farm should capture a system trace per device.
    pub systrace_enabled: bool,
    /// Whether the farm should record video per device.
    pub record_video: bool,
}

/// Report and trace artifacts retrieved from the farm into local storage.
#[derive(Debug, Default)]
pub struct FarmArtifacts {
    /// One raw report file per device.
    pub reports: Vec<PathBuf>,
    /// Paired trace captures; empty when systrace was disabled.
    pub traces: Vec<PathBuf>,
}

/// Opaque farm submission/collection API.
///
/// Implementations submit the job, block until results are available,
/// and download the raw artifacts into local storage under `out_dir`.
#[async_trait]
pub trait FarmBackend: Send + Sync {
    async fn run_and_collect(
        &self,
        spec: &FarmJobSpec,
        out_dir: &Path,
    ) -> anyhow::Result<FarmArtifacts>;
}

/// Builds the job spec from the recipe, injecting the package path into
/// every declared test's argument block.
///
/// Fails fast, before any backend call, when `build.type` is `"none"`.
pub fn build_job_spec(recipe: &Recipe, apk: &Path) -> Result<FarmJobSpec, FarmError> {
    if recipe.lookup_str("build.type") == Some("none") {
        return Err(FarmError::UnsupportedConfiguration);
    }

    let declared = recipe
        .lookup_table("deployment.farm.args")
        .ok_or(FarmError::NoTests)?;
    if declared.is_empty() {
        return Err(FarmError::NoTests);
    }

    let mut tests = serde_json::Map::new();
    for (name, args) in declared {
        let mut args = toml_to_json(args);
        if let Some(obj) = args.as_object_mut() {
            obj.insert(
                "app".to_string(),
                JsonValue::String(apk.to_string_lossy().into_owned()),
            );
        }
        tests.insert(name.clone(), args);
    }

    // The fallback comes from the TOML table, which keeps declaration
    // order; the JSON map does not.
    let active_test = match recipe.lookup_str("deployment.farm.test") {
        Some(test) => test.to_string(),
        None => declared.keys().next().cloned().ok_or(FarmError::NoTests)?,
    };

    let flags = recipe
        .lookup_table("deployment.farm.flags")
        .map(|t| {
            t.iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect()
        })
        .unwrap_or_default();

    Ok(FarmJobSpec {
        tests,
        flags,
        devices: recipe.lookup_str_list("deployment.farm.devices"),
        excluding: recipe.lookup_str_list("deployment.farm.excluding"),
        active_test,
        systrace_enabled: recipe.lookup_bool("systrace.enabled", false),
        record_video: recipe.lookup_bool("deployment.farm.record_video", false),
    })
}

fn toml_to_json(value: &toml::Value) -> JsonValue {
    match value {
        toml::Value::String(s) => JsonValue::String(s.clone()),
        toml::Value::Integer(i) => JsonValue::from(*i),
        toml::Value::Float(f) => {
            serde_json::Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number)
        }
        toml::Value::Boolean(b) => JsonValue::Bool(*b),
        toml::Value::Datetime(dt) => JsonValue::String(dt.to_string()),
        toml::Value::Array(items) => JsonValue::Array(items.iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => JsonValue::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Farm backend that delegates to a user-configured shell command.
///
/// The command receives the serialized job spec path via a `{spec}`
/// placeholder and the local artifact directory via `{out_dir}`; it must
/// print one `report <path>` or `trace <path>` line per retrieved
/// artifact, in device order.
pub struct CommandBackend {
    command: String,
}

impl CommandBackend {
    /// Creates a backend from the recipe's `deployment.farm.command`.
    pub fn from_recipe(recipe: &Recipe) -> Option<Self> {
        recipe.lookup_str("deployment.farm.command").map(|c| Self {
            command: c.to_string(),
        })
    }

    /// Creates a backend around an explicit command template.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl FarmBackend for CommandBackend {
    async fn run_and_collect(
        &self,
        spec: &FarmJobSpec,
        out_dir: &Path,
    ) -> anyhow::Result<FarmArtifacts> {
        use anyhow::Context;

        let spec_file = out_dir.join("farm_job.json");
        let spec_json = serde_json::to_string_pretty(spec).context("serializing farm job spec")?;
        tokio::fs::write(&spec_file, spec_json)
            .await
            .with_context(|| format!("writing {}", spec_file.display()))?;

        let command = self
            .command
            .replace("{spec}", &spec_file.to_string_lossy())
            .replace("{out_dir}", &out_dir.to_string_lossy());
        info!(command = %command, "submitting farm job");

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .await
            .with_context(|| format!("spawning farm command `{}`", command))?;

        if !output.status.success() {
            anyhow::bail!(
                "farm command exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let mut artifacts = FarmArtifacts::default();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            match line.trim().split_once(' ') {
                Some(("report", path)) => artifacts.reports.push(PathBuf::from(path.trim())),
                Some(("trace", path)) => artifacts.traces.push(PathBuf::from(path.trim())),
                _ => {}
            }
        }
        Ok(artifacts)
    }
}
