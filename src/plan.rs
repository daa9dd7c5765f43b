//! Deployment plan and task environment.
//!
//! A [`DeploymentPlan`] is the immutable per-run configuration built once
//! from recipe lookups: the ordered device set, systrace settings, the
//! pre/postflight task specs, and whether a package install is required.
//! Nothing mutates it after construction, which is what makes it safe to
//! share across per-device execution units.

use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use crate::adb::{DeviceShell, ShellResult};
use crate::recipe::Recipe;
use crate::tasks::TaskSpec;

/// Package id the certification workload ships under, used when the
/// recipe does not name one.
pub const DEFAULT_PACKAGE_ID: &str = "com.google.gamesdk.gamecert.operationrunner";

/// Systrace settings extracted from the recipe.
#[derive(Debug, Clone, Default)]
pub struct SystraceSpec {
    /// Whether to bracket each device's run with a trace capture.
    pub enabled: bool,
    /// Keywords used to filter trace events during report merge.
    pub keywords: Vec<String>,
    /// Trace categories passed to the capture tooling.
    pub categories: Vec<String>,
}

/// Immutable per-run deployment configuration.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    /// Package id of the app under test.
    pub package_id: String,
    /// Device serials named by the recipe, in recipe order.
    pub device_ids: Vec<String>,
    /// Target every attached device instead of `device_ids`.
    pub all_attached_devices: bool,
    /// Systrace capture settings.
    pub systrace: SystraceSpec,
    /// Provisioning tasks run per device before execution, in order.
    pub preflight: Vec<TaskSpec>,
    /// Provisioning tasks run per device after execution, in order.
    pub postflight: Vec<TaskSpec>,
    /// Whether the APK is (re)installed on each device before execution.
    pub install_apk: bool,
}

impl DeploymentPlan {
    /// Builds the plan from recipe lookups. Read-only thereafter.
    pub fn from_recipe(recipe: &Recipe) -> Result<Self> {
        let package_id = recipe
            .lookup_str("app.package")
            .unwrap_or(DEFAULT_PACKAGE_ID)
            .to_string();

        // Categories historically arrive as one space-separated string.
        let categories = match recipe.lookup_str("systrace.categories") {
            Some(s) => s.split_whitespace().map(str::to_string).collect(),
            None => recipe.lookup_str_list("systrace.categories"),
        };

        let systrace = SystraceSpec {
            enabled: recipe.lookup_bool("systrace.enabled", false),
            keywords: recipe.lookup_str_list("systrace.keywords"),
            categories,
        };

        Ok(Self {
            package_id,
            device_ids: recipe.lookup_str_list("deployment.local.device_ids"),
            all_attached_devices: recipe
                .lookup_bool("deployment.local.all_attached_devices", false),
            systrace,
            preflight: TaskSpec::from_recipe(recipe, "deployment.local.preflight"),
            postflight: TaskSpec::from_recipe(recipe, "deployment.local.postflight"),
            install_apk: recipe.lookup_bool("deployment.local.install_apk", true),
        })
    }

    /// Resolves the target device set against what is actually attached.
    ///
    /// Either every attached device, or the recipe's `device_ids` filtered
    /// to the attached set, preserving recipe order.
    pub async fn resolve_devices(&self, shell: &dyn DeviceShell) -> ShellResult<Vec<String>> {
        let attached = shell.list_devices().await?;

        let devices = if self.all_attached_devices {
            attached
        } else {
            self.device_ids
                .iter()
                .filter(|id| attached.contains(*id))
                .cloned()
                .collect()
        };

        info!("Will run deployment on device ids: {}", devices.join(" "));
        Ok(devices)
    }
}

/// Context shared by every task run against a flight.
///
/// Holds the workspace root used to resolve `${WORKSPACE_DIR}` tokens in
/// task source paths. Read-only after construction and therefore safe to
/// share by reference across devices.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Local workspace root directory.
    pub workspace_dir: PathBuf,
}

impl Environment {
    /// Creates an environment rooted at the given workspace directory.
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self { workspace_dir }
    }
}
