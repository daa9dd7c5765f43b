//! End-to-end local deployment tests against a scripted device shell.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use certdeploy::orchestrator::Deployer;
use certdeploy::plan::{DeploymentPlan, Environment};
use certdeploy::recipe::Recipe;

use common::FakeShell;

const PACKAGE: &str = "com.example.bench";

fn recipe(systrace: bool, devices: &[&str]) -> Recipe {
    let ids = devices
        .iter()
        .map(|d| format!("\"{}\"", d))
        .collect::<Vec<_>>()
        .join(", ");
    Recipe::from_str(&format!(
        r#"
        [app]
        package = "{}"

        [systrace]
        enabled = {}
        keywords = ["frame"]
        categories = "gfx sched"

        [deployment.local]
        device_ids = [{}]
    "#,
        PACKAGE, systrace, ids
    ))
    .unwrap()
}

fn deployer(recipe: &Recipe, shell: Arc<FakeShell>, out_dir: PathBuf) -> Deployer {
    let plan = DeploymentPlan::from_recipe(recipe).unwrap();
    let env = Environment::new(PathBuf::from("."));
    Deployer::new(plan, env, shell, out_dir)
}

/// Index of the first log entry for `device` containing `needle`.
fn log_position(log: &[String], device: &str, needle: &str) -> Option<usize> {
    log.iter()
        .position(|l| l.starts_with(device) && l.contains(needle))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_devices_without_systrace_run_in_parallel() {
    let out = tempfile::tempdir().unwrap();
    let shell = Arc::new(
        FakeShell::new(&["serial-a", "serial-b"], PACKAGE).with_active_polls(2),
    );

    let recipe = recipe(false, &["serial-a", "serial-b"]);
    let deployer = deployer(&recipe, shell.clone(), out.path().to_path_buf());

    let start = Instant::now();
    let result = deployer.run_local(Path::new("app.apk")).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(result.devices, 2);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.reports.len(), 2);
    assert!(result.success());

    // Each device waits ~0.5s polling plus the 2s settle delay. Parallel
    // execution finishes in roughly one device's time, not the sum.
    assert!(
        elapsed < Duration::from_millis(4500),
        "expected parallel wall time, got {:?}",
        elapsed
    );

    // No trace commands were issued.
    let log = shell.log_snapshot();
    assert!(log.iter().all(|l| !l.contains("atrace")));

    // Canonical names derive from report metadata, one per device.
    for report in &result.reports {
        let name = report.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("fake_serial_"), "unexpected name {}", name);
        assert!(name.ends_with("_report.json"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn systrace_run_brackets_execution_and_merges_events() {
    let out = tempfile::tempdir().unwrap();
    let shell = Arc::new(FakeShell::new(&["serial-a"], PACKAGE).with_active_polls(1));

    let recipe = recipe(true, &["serial-a"]);
    let deployer = deployer(&recipe, shell.clone(), out.path().to_path_buf());

    let result = deployer.run_local(Path::new("app.apk")).await.unwrap();
    assert_eq!(result.succeeded, 1);

    let log = shell.log_snapshot();
    let trace_start = log_position(&log, "serial-a", "atrace --async_start").unwrap();
    let launch = log_position(&log, "serial-a", "am start").unwrap();
    let last_poll = log
        .iter()
        .rposition(|l| l.contains("dumpsys activity"))
        .unwrap();
    let trace_stop = log_position(&log, "serial-a", "atrace --async_stop").unwrap();

    // Trace-start precedes launch; finish comes only after the poll loop
    // has exited.
    assert!(trace_start < launch);
    assert!(launch < trace_stop);
    assert!(last_poll < trace_stop);

    // Categories from the recipe reach the capture command.
    assert!(log[trace_start].contains("gfx sched"));

    // The canonical report carries the keyword-filtered trace events.
    let content = std::fs::read_to_string(&result.reports[0]).unwrap();
    let merged: serde_json::Value =
        serde_json::from_str(content.lines().last().unwrap()).unwrap();
    let events = merged["systrace"]["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.as_str().unwrap().contains("frame")));

    // The trace artifact sits alongside under the canonical stem.
    let stem = result.reports[0]
        .file_stem()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(out.path().join(format!("{}_trace.html", stem)).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uninstall_failure_is_informational() {
    let out = tempfile::tempdir().unwrap();
    let shell = Arc::new(
        FakeShell::new(&["serial-a"], PACKAGE)
            .with_active_polls(1)
            .fail_uninstall_on("serial-a"),
    );

    let recipe = recipe(false, &["serial-a"]);
    let deployer = deployer(&recipe, shell.clone(), out.path().to_path_buf());

    let result = deployer.run_local(Path::new("app.apk")).await.unwrap();

    // Install still went ahead and the run succeeded.
    assert_eq!(result.succeeded, 1);
    let log = shell.log_snapshot();
    assert!(log_position(&log, "serial-a", "install").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn install_failure_is_isolated_to_its_device() {
    let out = tempfile::tempdir().unwrap();
    let shell = Arc::new(
        FakeShell::new(&["serial-a", "serial-b"], PACKAGE)
            .with_active_polls(1)
            .fail_install_on("serial-a"),
    );

    let recipe = recipe(false, &["serial-a", "serial-b"]);
    let deployer = deployer(&recipe, shell.clone(), out.path().to_path_buf());

    let result = deployer.run_local(Path::new("app.apk")).await.unwrap();

    assert_eq!(result.devices, 2);
    assert_eq!(result.succeeded, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].0, "serial-a");

    // The failed device never reached execution.
    let log = shell.log_snapshot();
    assert!(log_position(&log, "serial-a", "am start").is_none());
    assert!(log_position(&log, "serial-b", "am start").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn preflight_failure_does_not_affect_sibling_provisioning() {
    let out = tempfile::tempdir().unwrap();
    let shell = Arc::new(
        FakeShell::new(&["serial-a", "serial-b"], PACKAGE)
            .with_active_polls(1)
            .fail_push_on("serial-a"),
    );

    let src = out.path().join("config.json");
    std::fs::write(&src, "{}").unwrap();

    let recipe = Recipe::from_str(&format!(
        r#"
        [app]
        package = "{}"

        [deployment.local]
        device_ids = ["serial-a", "serial-b"]

        [[deployment.local.preflight]]
        action = "copy"
        src = "{}"
        dst = "${{DEVICE_ROOT}}/data/local/tmp/config.json"
    "#,
        PACKAGE,
        src.display()
    ))
    .unwrap();

    let deployer = deployer(&recipe, shell.clone(), out.path().to_path_buf());
    let result = deployer.run_local(Path::new("app.apk")).await.unwrap();

    assert_eq!(result.succeeded, 1);
    assert_eq!(result.failures.len(), 1);
    assert!(result.failures[0].1.contains("copy"));

    // serial-b's provisioning and execution were untouched.
    let log = shell.log_snapshot();
    assert!(log_position(&log, "serial-b", "push").is_some());
    assert!(log_position(&log, "serial-b", "am start").is_some());
    assert!(log_position(&log, "serial-a", "am start").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn postflight_failure_fails_the_run() {
    let out = tempfile::tempdir().unwrap();
    let shell = Arc::new(
        FakeShell::new(&["serial-a"], PACKAGE)
            .with_active_polls(1)
            .fail_push_on("serial-a"),
    );

    let src = out.path().join("cleanup.json");
    std::fs::write(&src, "{}").unwrap();

    let recipe = Recipe::from_str(&format!(
        r#"
        [app]
        package = "{}"

        [deployment.local]
        device_ids = ["serial-a"]

        [[deployment.local.postflight]]
        action = "copy"
        src = "{}"
        dst = "${{DEVICE_ROOT}}/data/local/tmp/cleanup.json"
    "#,
        PACKAGE,
        src.display()
    ))
    .unwrap();

    let deployer = deployer(&recipe, shell.clone(), out.path().to_path_buf());
    let result = deployer.run_local(Path::new("app.apk")).await.unwrap();

    // The report was still produced, but the run is not a success.
    assert_eq!(result.succeeded, 1);
    assert_eq!(result.failed, 1);
    assert!(!result.success());
    assert_eq!(result.exit_code(), 1);
    assert!(result.failures[0].1.contains("copy"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn devices_not_attached_are_filtered_out() {
    let out = tempfile::tempdir().unwrap();
    // Recipe names two devices; only one is attached.
    let shell = Arc::new(FakeShell::new(&["serial-b"], PACKAGE).with_active_polls(1));

    let recipe = recipe(false, &["serial-a", "serial-b"]);
    let deployer = deployer(&recipe, shell.clone(), out.path().to_path_buf());

    let result = deployer.run_local(Path::new("app.apk")).await.unwrap();
    assert_eq!(result.devices, 1);
    assert_eq!(result.succeeded, 1);

    let log = shell.log_snapshot();
    assert!(log_position(&log, "serial-a", "install").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn report_extraction_uses_privileged_staging() {
    let out = tempfile::tempdir().unwrap();
    let shell = Arc::new(FakeShell::new(&["serial-a"], PACKAGE).with_active_polls(1));

    let recipe = recipe(false, &["serial-a"]);
    let deployer = deployer(&recipe, shell.clone(), out.path().to_path_buf());
    deployer.run_local(Path::new("app.apk")).await.unwrap();

    let log = shell.log_snapshot();
    let run_as_cp = log_position(&log, "serial-a", "cp files/report.json").unwrap();
    let pull = log_position(&log, "serial-a", "pull /sdcard/report_serial-a.json").unwrap();
    assert!(run_as_cp < pull);
    assert!(log[run_as_cp].contains(&format!("run-as {}", PACKAGE)));
}
