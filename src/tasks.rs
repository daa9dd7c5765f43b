//! Provisioning tasks and the ordered task runner.
//!
//! Flights (preflight/postflight) are ordered lists of polymorphic tasks
//! keyed by an `action` string in the recipe. A registry maps action names
//! to constructors; specs with an unknown action are silently dropped so
//! older binaries keep loading newer recipes. Today the only action is
//! `copy`.
//!
//! Destination paths use symbolic device-location tokens, each bound to a
//! fixed command sequence:
//!
//! | Token | Physical location | Sequence |
//! |-------|-------------------|----------|
//! | `${APP_FILES_DIR}` | app's protected `files/` dir | push to `/sdcard` staging, `run-as mkdir -p`, `run-as mv` |
//! | `${APP_OOB_DATA_DIR}` | `/storage/emulated/0/Android/obb/<pkg>` | `mkdir -p` + push |
//! | `${DEVICE_ROOT}` | device filesystem root | `mkdir -p` + push |

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use toml::Value;
use tracing::{debug, info};

use crate::adb::{DeviceShell, ShellError};
use crate::plan::Environment;
use crate::recipe::Recipe;

/// Token resolved against [`Environment::workspace_dir`] in source paths.
pub const WORKSPACE_DIR: &str = "${WORKSPACE_DIR}";
/// Destination token for the app's protected files directory.
pub const APP_FILES_DIR: &str = "${APP_FILES_DIR}";
/// Destination token for the app's out-of-band (obb) data directory.
pub const APP_OOB_DATA_DIR: &str = "${APP_OOB_DATA_DIR}";
/// Destination token for the device filesystem root.
pub const DEVICE_ROOT: &str = "${DEVICE_ROOT}";

/// Unprotected staging location used for protected-storage copies.
const STAGING_DIR: &str = "/sdcard";

/// Errors from constructing or running a single task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The resolved source file does not exist locally.
    #[error("missing src file {0}")]
    MissingSource(PathBuf),

    /// The destination does not start with a recognized device-location
    /// token. This is a configuration error, not a runtime one.
    #[error("unsupported destination `{0}`: expected ${{APP_FILES_DIR}}, ${{APP_OOB_DATA_DIR}} or ${{DEVICE_ROOT}}")]
    UnsupportedDestination(String),

    /// A required parameter was absent from the task spec.
    #[error("`{action}` task is missing required parameter `{param}`")]
    MissingParam {
        action: String,
        param: String,
    },

    /// A device command issued by the task failed.
    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// A task failed against one device. Aborts the remaining tasks for that
/// device; sibling devices are unaffected.
#[derive(Debug, thiserror::Error)]
#[error("task `{task}` failed on device {device}: {source}")]
pub struct TaskFailure {
    pub task: String,
    pub device: String,
    #[source]
    pub source: TaskError,
}

/// Raw task description as it appears in the recipe: an `action` name plus
/// action-specific parameters.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub action: String,
    pub params: toml::map::Map<String, Value>,
}

impl TaskSpec {
    /// Reads an ordered list of task specs from a recipe key path.
    /// Entries without an `action` string are dropped.
    pub fn from_recipe(recipe: &Recipe, key_path: &str) -> Vec<TaskSpec> {
        recipe
            .lookup_array(key_path)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let table = entry.as_table()?;
                        let action = table.get("action")?.as_str()?.to_string();
                        Some(TaskSpec {
                            action,
                            params: table.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn str_param(&self, param: &str) -> Result<&str, TaskError> {
        self.params
            .get(param)
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::MissingParam {
                action: self.action.clone(),
                param: param.to_string(),
            })
    }
}

/// A single provisioning action run against one device.
#[async_trait]
pub trait Task: Send + Sync {
    /// Short name used in logs and failure messages.
    fn name(&self) -> &str;

    /// Runs the task against the device, using the shared environment to
    /// resolve local paths.
    async fn run(
        &self,
        device: &str,
        env: &Environment,
        shell: &dyn DeviceShell,
    ) -> Result<(), TaskError>;
}

type TaskCtor = fn(&TaskSpec, &str) -> Result<Box<dyn Task>, TaskError>;

fn copy_ctor(spec: &TaskSpec, package_id: &str) -> Result<Box<dyn Task>, TaskError> {
    Ok(Box::new(CopyTask::from_spec(spec, package_id)?))
}

/// Action-name to constructor registry. New task variants register here.
fn registry() -> &'static [(&'static str, TaskCtor)] {
    &[("copy", copy_ctor)]
}

/// Instantiates tasks from specs, in order. Specs whose action has no
/// registered constructor are skipped, not errors: newer recipes may
/// declare actions this binary does not know yet.
pub fn load_tasks(specs: &[TaskSpec], package_id: &str) -> Result<Vec<Box<dyn Task>>, TaskError> {
    let mut tasks = Vec::with_capacity(specs.len());
    for spec in specs {
        match registry().iter().find(|(name, _)| *name == spec.action) {
            Some((_, ctor)) => tasks.push(ctor(spec, package_id)?),
            None => debug!(action = %spec.action, "skipping unknown task action"),
        }
    }
    Ok(tasks)
}

/// Runs tasks strictly in order against one device. The first failure
/// aborts the remainder for that device and surfaces a [`TaskFailure`]
/// naming the task and device. Provisioning is not best-effort.
pub async fn run_tasks(
    tasks: &[Box<dyn Task>],
    device: &str,
    env: &Environment,
    shell: &dyn DeviceShell,
) -> Result<(), TaskFailure> {
    for task in tasks {
        info!(device, task = task.name(), "running task");
        task.run(device, env, shell)
            .await
            .map_err(|source| TaskFailure {
                task: task.name().to_string(),
                device: device.to_string(),
                source,
            })?;
    }
    Ok(())
}

/// Copies a file from the local filesystem to a device location named by
/// a destination token.
#[derive(Debug)]
pub struct CopyTask {
    src: String,
    dst: String,
    package_id: String,
}

impl CopyTask {
    /// Builds a copy task from its spec. Requires `src` and `dst`
    /// parameters.
    pub fn from_spec(spec: &TaskSpec, package_id: &str) -> Result<Self, TaskError> {
        Ok(Self {
            src: spec.str_param("src")?.to_string(),
            dst: spec.str_param("dst")?.to_string(),
            package_id: package_id.to_string(),
        })
    }

    /// Resolves the source path: `${WORKSPACE_DIR}` against the
    /// environment, then tilde expansion.
    fn resolve_src(&self, env: &Environment) -> PathBuf {
        let src = self
            .src
            .replace(WORKSPACE_DIR, &env.workspace_dir.to_string_lossy());
        PathBuf::from(shellexpand::tilde(&src).into_owned())
    }

    /// Stage-then-privileged-move into the app's protected files dir:
    /// push to `/sdcard`, `run-as "mkdir -p"` the final parent, `run-as
    /// "mv"` from staging to final path.
    async fn copy_to_app_files_dir(
        &self,
        src: &Path,
        subpath: &str,
        device: &str,
        shell: &dyn DeviceShell,
    ) -> Result<(), TaskError> {
        let file_name = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.src.clone());
        let staged = format!("{}/{}", STAGING_DIR, file_name);
        let dst_file = format!("files/{}", subpath);
        let dst_parent = parent_of(&dst_file);

        shell.push(device, src, &staged).await?;
        shell
            .run_as(device, &self.package_id, &format!("mkdir -p {}", dst_parent))
            .await?;
        shell
            .run_as(
                device,
                &self.package_id,
                &format!("mv {} {}", staged, dst_file),
            )
            .await?;
        Ok(())
    }

    /// Plain `mkdir -p` + push into the app's obb data dir.
    async fn copy_to_oob_data_dir(
        &self,
        src: &Path,
        subpath: &str,
        device: &str,
        shell: &dyn DeviceShell,
    ) -> Result<(), TaskError> {
        let dst_file = format!(
            "/storage/emulated/0/Android/obb/{}/{}",
            self.package_id, subpath
        );
        shell
            .shell(device, &format!("mkdir -p {}", parent_of(&dst_file)))
            .await?;
        shell.push(device, src, &dst_file).await?;
        Ok(())
    }

    /// Plain `mkdir -p` + push to a literal device path.
    async fn copy_to_device_dir(
        &self,
        src: &Path,
        subpath: &str,
        device: &str,
        shell: &dyn DeviceShell,
    ) -> Result<(), TaskError> {
        let dst_file = format!("/{}", subpath);
        shell
            .shell(device, &format!("mkdir -p {}", parent_of(&dst_file)))
            .await?;
        shell.push(device, src, &dst_file).await?;
        Ok(())
    }
}

#[async_trait]
impl Task for CopyTask {
    fn name(&self) -> &str {
        "copy"
    }

    async fn run(
        &self,
        device: &str,
        env: &Environment,
        shell: &dyn DeviceShell,
    ) -> Result<(), TaskError> {
        let src = self.resolve_src(env);
        if !src.exists() {
            return Err(TaskError::MissingSource(src));
        }

        if let Some(sub) = strip_token(&self.dst, APP_FILES_DIR) {
            self.copy_to_app_files_dir(&src, sub, device, shell).await
        } else if let Some(sub) = strip_token(&self.dst, APP_OOB_DATA_DIR) {
            self.copy_to_oob_data_dir(&src, sub, device, shell).await
        } else if let Some(sub) = strip_token(&self.dst, DEVICE_ROOT) {
            self.copy_to_device_dir(&src, sub, device, shell).await
        } else {
            Err(TaskError::UnsupportedDestination(self.dst.clone()))
        }
    }
}

fn strip_token<'a>(dst: &'a str, token: &str) -> Option<&'a str> {
    dst.strip_prefix(token)
        .map(|rest| rest.trim_start_matches('/'))
}

fn parent_of(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string())
}
