//! Scripted device-shell and farm doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use certdeploy::adb::{DeviceShell, ShellError, ShellResult};
use certdeploy::farm::{FarmArtifacts, FarmBackend, FarmJobSpec};

/// A trace dump as `atrace --async_stop` returns it.
pub const TRACE_DUMP: &str = "TRACE:\n\
# tracer: nop\n\
 surfaceflinger-1 [000] ...1 10.0: tracing_mark_write: B|1|frame\n\
 kworker-2 [001] ...1 10.1: sched_wakeup: comm=audio\n\
 app-3 [002] ...1 10.2: tracing_mark_write: E|3|frame\n";

/// Scripted in-memory device shell.
///
/// Records every issued command in order and serves canned dumpsys
/// output: each device reports the app active for a configured number of
/// polls, then finished.
pub struct FakeShell {
    pub attached: Vec<String>,
    pub package: String,
    /// Commands issued, formatted as `"<device> <op> <args>"`.
    pub log: Mutex<Vec<String>>,
    active_polls: Mutex<HashMap<String, u32>>,
    fail_install: HashSet<String>,
    fail_uninstall: HashSet<String>,
    fail_push: HashSet<String>,
}

impl FakeShell {
    pub fn new(attached: &[&str], package: &str) -> Self {
        Self {
            attached: attached.iter().map(|s| s.to_string()).collect(),
            package: package.to_string(),
            log: Mutex::new(Vec::new()),
            active_polls: Mutex::new(HashMap::new()),
            fail_install: HashSet::new(),
            fail_uninstall: HashSet::new(),
            fail_push: HashSet::new(),
        }
    }

    /// Number of polls each device reports the app as still running.
    pub fn with_active_polls(self, polls: u32) -> Self {
        {
            let mut map = self.active_polls.lock().unwrap();
            for device in &self.attached {
                map.insert(device.clone(), polls);
            }
        }
        self
    }

    pub fn fail_install_on(mut self, device: &str) -> Self {
        self.fail_install.insert(device.to_string());
        self
    }

    pub fn fail_uninstall_on(mut self, device: &str) -> Self {
        self.fail_uninstall.insert(device.to_string());
        self
    }

    pub fn fail_push_on(mut self, device: &str) -> Self {
        self.fail_push.insert(device.to_string());
        self
    }

    pub fn log_snapshot(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, device: &str, entry: String) {
        self.log.lock().unwrap().push(format!("{} {}", device, entry));
    }

    fn command_failed(&self, device: &str, command: &str) -> ShellError {
        ShellError::CommandFailed {
            device: device.to_string(),
            command: command.to_string(),
            code: 1,
            stderr: "scripted failure".to_string(),
        }
    }
}

#[async_trait]
impl DeviceShell for FakeShell {
    async fn install(&self, device: &str, apk: &Path) -> ShellResult<String> {
        self.record(device, format!("install {}", apk.display()));
        if self.fail_install.contains(device) {
            return Err(self.command_failed(device, "install"));
        }
        Ok("Success".to_string())
    }

    async fn uninstall(&self, device: &str, package: &str) -> ShellResult<String> {
        self.record(device, format!("uninstall {}", package));
        if self.fail_uninstall.contains(device) {
            return Err(ShellError::UninstallFailed {
                device: device.to_string(),
                package: package.to_string(),
                stderr: "not installed".to_string(),
            });
        }
        Ok("Success".to_string())
    }

    async fn push(&self, device: &str, local: &Path, remote: &str) -> ShellResult<String> {
        self.record(device, format!("push {} {}", local.display(), remote));
        if self.fail_push.contains(device) {
            return Err(self.command_failed(device, "push"));
        }
        Ok(String::new())
    }

    async fn pull(&self, device: &str, remote: &str, local: &Path) -> ShellResult<String> {
        self.record(device, format!("pull {} {}", remote, local.display()));
        // The workload's report: build metadata line, then data lines.
        let report = format!(
            "{{\"build\": {{\"MANUFACTURER\": \"Fake\", \"MODEL\": \"{}\", \"SDK_INT\": 30}}}}\n\
             {{\"suite\": \"synthetic\", \"frames\": 100}}\n",
            device
        );
        std::fs::write(local, report).map_err(ShellError::Spawn)?;
        Ok(String::new())
    }

    async fn shell(&self, device: &str, command: &str) -> ShellResult<String> {
        self.record(device, format!("shell {}", command));

        if command.contains("dumpsys activity") {
            let mut polls = self.active_polls.lock().unwrap();
            let remaining = polls.entry(device.to_string()).or_insert(0);
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(format!(
                    "Display #0\n  * TaskRecord{{abc #1 A={} U=0 sz=1}}\n",
                    self.package
                ));
            }
            return Ok(
                "Display #0\n  * TaskRecord{def #2 I=com.android.launcher/.Launcher U=0 sz=1}\n"
                    .to_string(),
            );
        }
        if command.contains("atrace --async_stop") {
            return Ok(TRACE_DUMP.to_string());
        }
        Ok(String::new())
    }

    async fn run_as(&self, device: &str, package: &str, command: &str) -> ShellResult<String> {
        self.record(device, format!("run-as {} {}", package, command));
        Ok(String::new())
    }

    async fn list_devices(&self) -> ShellResult<Vec<String>> {
        Ok(self.attached.clone())
    }
}

/// Farm backend double that records submissions and serves pre-staged
/// artifacts.
pub struct FakeFarm {
    pub submissions: Mutex<Vec<FarmJobSpec>>,
    pub artifacts: Mutex<Option<FarmArtifacts>>,
}

impl FakeFarm {
    pub fn new() -> Self {
        Self {
            submissions: Mutex::new(Vec::new()),
            artifacts: Mutex::new(None),
        }
    }

    pub fn with_artifacts(self, reports: Vec<PathBuf>, traces: Vec<PathBuf>) -> Self {
        *self.artifacts.lock().unwrap() = Some(FarmArtifacts { reports, traces });
        self
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }
}

#[async_trait]
impl FarmBackend for FakeFarm {
    async fn run_and_collect(
        &self,
        spec: &FarmJobSpec,
        _out_dir: &Path,
    ) -> anyhow::Result<FarmArtifacts> {
        self.submissions.lock().unwrap().push(spec.clone());
        Ok(self
            .artifacts
            .lock()
            .unwrap()
            .take()
            .unwrap_or_default())
    }
}
