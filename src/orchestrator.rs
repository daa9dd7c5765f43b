//! Deployment orchestration.
//!
//! The [`Deployer`] is the root component: it resolves the target device
//! set, then sequences the deployment phases in a fixed order regardless
//! of any parallelism inside a phase:
//!
//! 1. package install (serial, per device, only when the plan requires it)
//! 2. preflight tasks (serial, per device)
//! 3. test execution (parallel or serial per the scheduler's rule)
//! 4. postflight tasks (serial, per device)
//!
//! Install and the flights are always serial because they can have
//! ordering side effects that parallel execution would race. Failures are
//! isolated to the device that produced them: the run always yields the
//! best-effort set of normalized reports plus a visible count of what
//! succeeded.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adb::{DeviceShell, ShellError};
use crate::collect::{CollectError, Collector};
use crate::farm::{self, FarmBackend, FarmError};
use crate::monitor::{MonitorError, TestMonitor};
use crate::plan::{DeploymentPlan, Environment};
use crate::recipe::Recipe;
use crate::scheduler::{DeviceOutcome, Scheduler};
use crate::tasks::{self, TaskError, TaskFailure};
use crate::trace::{TraceError, TraceSession};

/// Errors from a single device's deployment, or from run-level setup.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error(transparent)]
    Task(#[from] TaskFailure),

    #[error(transparent)]
    TaskSetup(#[from] TaskError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error(transparent)]
    Farm(#[from] FarmError),

    /// None of the recipe's devices are attached (or none are attached at
    /// all).
    #[error("no target devices attached")]
    NoDevices,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw artifacts produced by one device's execution unit, before
/// normalization.
#[derive(Debug, Clone)]
pub struct DeviceArtifacts {
    /// Raw report file extracted from the device.
    pub report: PathBuf,
    /// Trace capture, when systrace was enabled.
    pub trace: Option<PathBuf>,
}

/// Aggregated result of one deployment.
#[derive(Debug)]
pub struct DeployResult {
    /// Number of devices targeted.
    pub devices: usize,
    /// Number of devices that produced a normalized report.
    pub succeeded: usize,
    /// Number of devices that failed at any phase.
    pub failed: usize,
    /// Canonical report paths, one per successful device.
    pub reports: Vec<PathBuf>,
    /// Device-scoped failure messages, as they occurred.
    pub failures: Vec<(String, String)>,
    /// Wall-clock duration of the deployment.
    pub duration: Duration,
}

impl DeployResult {
    /// `true` when every targeted device produced a report.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.devices > 0
    }

    /// Conventional process exit code: 0 when at least one report was
    /// produced and nothing failed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    /// Prints the device-scoped summary to the terminal.
    pub fn print_summary(&self) {
        println!();
        println!("Deployment results:");
        println!("  Devices:   {}", self.devices);
        println!("  Succeeded: {}", console::style(self.succeeded).green());
        println!("  Failed:    {}", console::style(self.failed).red());
        println!("  Duration:  {:?}", self.duration);

        if !self.reports.is_empty() {
            println!();
            println!("Reports:");
            for report in &self.reports {
                println!("  {}", report.display());
            }
        }

        if !self.failures.is_empty() {
            println!();
            println!("Failures:");
            for (device, message) in &self.failures {
                println!("  - {}: {}", device, console::style(message).dim());
            }
        }
    }
}

/// On-device path the workload writes its report to, relative to the
/// app's protected storage.
const DEVICE_REPORT_FILE: &str = "files/report.json";

/// The root deployment orchestrator.
pub struct Deployer {
    plan: DeploymentPlan,
    env: Environment,
    shell: Arc<dyn DeviceShell>,
    out_dir: PathBuf,
    cancel: CancellationToken,
    deadline: Option<Duration>,
}

impl Deployer {
    /// Creates a deployer for one run. `out_dir` receives every artifact
    /// the run produces; each device writes only uniquely named files, so
    /// the directory needs no further synchronization.
    pub fn new(
        plan: DeploymentPlan,
        env: Environment,
        shell: Arc<dyn DeviceShell>,
        out_dir: PathBuf,
    ) -> Self {
        Self {
            plan,
            env,
            shell,
            out_dir,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Deployment-scoped cancellation. Raising it stops new device units
    /// from being issued; in-flight units finish their settle and extract
    /// phases.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Bounds each device's launch-to-completion wait.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Executes a local deployment (devices attached over USB).
    pub async fn run_local(&self, apk: &Path) -> Result<DeployResult, DeployError> {
        let start = std::time::Instant::now();

        let devices = self.plan.resolve_devices(self.shell.as_ref()).await?;
        if devices.is_empty() {
            return Err(DeployError::NoDevices);
        }

        info!(systrace = self.plan.systrace.enabled, "starting local deployment");
        if self.plan.systrace.enabled {
            info!(keywords = ?self.plan.systrace.keywords, "systrace keywords");
        }

        let preflight = tasks::load_tasks(&self.plan.preflight, &self.plan.package_id)?;
        let postflight = tasks::load_tasks(&self.plan.postflight, &self.plan.package_id)?;

        let mut failures: Vec<(String, String)> = Vec::new();
        let mut ready: Vec<String> = Vec::new();

        // Phase 1 + 2: install and preflight, serial per device. A
        // provisioning failure drops that device from execution but never
        // touches its siblings.
        for device in &devices {
            let provisioned: Result<(), DeployError> = async {
                if self.plan.install_apk {
                    info!(device = %device, "installing APK");
                    self.install_package(device, apk).await?;
                }
                if !preflight.is_empty() {
                    info!(device = %device, "running preflight tasks");
                    tasks::run_tasks(&preflight, device, &self.env, self.shell.as_ref()).await?;
                }
                Ok(())
            }
            .await;

            match provisioned {
                Ok(()) => ready.push(device.clone()),
                Err(e) => {
                    warn!(device = %device, "provisioning failed: {}", e);
                    failures.push((device.clone(), e.to_string()));
                }
            }
        }

        // Phase 3: execution, fanned out by the scheduler.
        let scheduler = Scheduler::new(self.plan.systrace.enabled)
            .with_cancellation(self.cancel.clone());
        let outcomes = scheduler
            .execute(&ready, |device, serial| async move {
                self.run_device(&device, serial).await
            })
            .await;

        let mut reports = Vec::new();
        let mut traces = Vec::new();
        for DeviceOutcome { device, result } in outcomes {
            match result {
                Ok(artifacts) => {
                    reports.push(artifacts.report);
                    if let Some(trace) = artifacts.trace {
                        traces.push(trace);
                    }
                }
                Err(e) => failures.push((device, e.to_string())),
            }
        }

        let collector = Collector::new(self.out_dir.clone(), self.plan.systrace.keywords.clone());
        let canonical = collector.process(&reports, &traces);

        // Phase 4: postflight, serial per device, best-effort.
        if !postflight.is_empty() {
            for device in &ready {
                info!(device = %device, "running postflight tasks");
                if let Err(e) =
                    tasks::run_tasks(&postflight, device, &self.env, self.shell.as_ref()).await
                {
                    warn!(device = %device, "postflight failed: {}", e);
                    failures.push((device.clone(), e.to_string()));
                }
            }
        }

        let succeeded = canonical.len();
        // A device counts as failed when it produced no canonical report
        // or when any of its phases (postflight included) failed.
        let failed_devices: std::collections::HashSet<&str> =
            failures.iter().map(|(d, _)| d.as_str()).collect();
        let failed = (devices.len() - succeeded).max(failed_devices.len());

        Ok(DeployResult {
            devices: devices.len(),
            succeeded,
            failed,
            reports: canonical,
            failures,
            duration: start.elapsed(),
        })
    }

    /// Executes a farm deployment: build the job spec, submit, retrieve
    /// artifacts, and normalize them exactly like local ones.
    pub async fn run_farm(
        &self,
        recipe: &Recipe,
        apk: &Path,
        backend: &dyn FarmBackend,
    ) -> Result<DeployResult, DeployError> {
        let start = std::time::Instant::now();

        // Fails fast on unsupported configurations, before any
        // submission call.
        let spec = farm::build_job_spec(recipe, apk)?;
        info!(active_test = %spec.active_test, devices = spec.devices.len(), "dispatching farm job");

        let artifacts = backend
            .run_and_collect(&spec, &self.out_dir)
            .await
            .map_err(FarmError::Backend)?;

        let collector = Collector::new(self.out_dir.clone(), self.plan.systrace.keywords.clone());
        let canonical = collector.process(&artifacts.reports, &artifacts.traces);

        let devices = artifacts.reports.len();
        let succeeded = canonical.len();
        Ok(DeployResult {
            devices,
            succeeded,
            failed: devices - succeeded,
            reports: canonical,
            failures: Vec::new(),
            duration: start.elapsed(),
        })
    }

    /// Uninstall-then-install. Uninstall is expected to fail when the
    /// package is not present; that is logged and never raised.
    async fn install_package(&self, device: &str, apk: &Path) -> Result<(), DeployError> {
        match self.shell.uninstall(device, &self.plan.package_id).await {
            Ok(_) => {}
            Err(e @ ShellError::UninstallFailed { .. }) => {
                warn!(device, "{}", e);
            }
            Err(e) => return Err(e.into()),
        }

        self.shell.install(device, apk).await?;
        Ok(())
    }

    /// One device's full execution unit: trace bracket, launch, poll,
    /// settle, extract.
    async fn run_device(
        &self,
        device: &str,
        show_waiting: bool,
    ) -> Result<DeviceArtifacts, DeployError> {
        // Trace-start always precedes launch. A requested trace that
        // cannot start aborts this device's run.
        let session = if self.plan.systrace.enabled {
            let dst = self.out_dir.join(format!("{}_trace.html", device));
            Some(
                TraceSession::start(
                    device,
                    dst,
                    &self.plan.systrace.categories,
                    self.shell.as_ref(),
                )
                .await?,
            )
        } else {
            None
        };

        let progress = if show_waiting {
            let pb = indicatif::ProgressBar::new_spinner();
            pb.set_message("Waiting on app to finish tests");
            Some(pb)
        } else {
            None
        };

        let monitor = TestMonitor::new(self.shell.as_ref(), self.plan.package_id.as_str())
            .with_deadline(self.deadline);
        let monitored = monitor.run(device, progress.as_ref()).await;
        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        monitored?;

        // finish() only after the poll loop has exited.
        let trace = match session {
            Some(session) => Some(session.finish(self.shell.as_ref()).await?),
            None => None,
        };

        let report = self.extract_report(device).await?;
        Ok(DeviceArtifacts { report, trace })
    }

    /// Pulls the report out of the app's protected storage: privileged
    /// copy to an unprotected staging path, pull, clean up the staging
    /// copy.
    async fn extract_report(&self, device: &str) -> Result<PathBuf, DeployError> {
        let staged = format!("/sdcard/report_{}.json", device);
        let local = self.out_dir.join(format!("report_{}.json", device));

        self.shell
            .run_as(
                device,
                &self.plan.package_id,
                &format!("cp {} {}", DEVICE_REPORT_FILE, staged),
            )
            .await?;
        self.shell.pull(device, &staged, &local).await?;
        self.shell
            .shell(device, &format!("rm {}", staged))
            .await?;

        info!(device, report = %local.display(), "report extracted");
        Ok(local)
    }
}

/// Creates the timestamped output directory for one run under `base`.
pub fn create_run_dir(base: &Path) -> std::io::Result<PathBuf> {
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let dir = base.join(stamp.to_string());
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
