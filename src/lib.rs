//! certdeploy: deploys a packaged benchmark app to Android devices.
//!
//! This crate drives a benchmark APK through its full lifecycle on one or
//! more devices (locally attached over adb, or provisioned on a remote
//! device farm) and reconciles the resulting artifacts into normalized
//! per-device reports.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Device shell** ([`adb`]): issues device-control commands (install,
//!   push, launch, dumpsys) behind the [`adb::DeviceShell`] trait
//! - **Tasks** ([`tasks`]): ordered provisioning actions run before and
//!   after the test flight
//! - **Trace** ([`trace`]): brackets a device's run with a system trace
//! - **Monitor** ([`monitor`]): launches the test activity and polls the
//!   activity stack until the workload finishes
//! - **Scheduler** ([`scheduler`]): fans per-device execution out in
//!   parallel when the deployment allows it
//! - **Collector** ([`collect`]): normalizes raw report/trace files into
//!   canonical per-device reports
//! - **Orchestrator** ([`orchestrator`]): sequences install, preflight,
//!   execution, and postflight across the device set
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use certdeploy::adb::AdbShell;
//! use certdeploy::orchestrator::Deployer;
//! use certdeploy::plan::{DeploymentPlan, Environment};
//! use certdeploy::recipe::Recipe;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let recipe = Recipe::load(std::path::Path::new("recipe.toml"))?;
//!     let plan = DeploymentPlan::from_recipe(&recipe)?;
//!     let env = Environment::new(std::env::current_dir()?);
//!     let shell = Arc::new(AdbShell::new());
//!
//!     let deployer = Deployer::new(plan, env, shell, "out".into());
//!     let result = deployer.run_local(std::path::Path::new("app.apk")).await?;
//!     println!("{} of {} devices produced reports", result.succeeded, result.devices);
//!     Ok(())
//! }
//! ```

pub mod adb;
pub mod collect;
pub mod farm;
pub mod monitor;
pub mod orchestrator;
pub mod plan;
pub mod recipe;
pub mod scheduler;
pub mod tasks;
pub mod trace;

// Re-export commonly used types
pub use adb::{AdbShell, DeviceShell, ShellError};
pub use orchestrator::{DeployError, DeployResult, Deployer};
pub use plan::{DeploymentPlan, Environment};
pub use recipe::Recipe;
