//! Test launch and completion monitoring.
//!
//! Drives one device through launch -> poll -> settle: start the test
//! activity in loop mode, poll the activity stack until the app's task
//! record is gone or no longer topmost, then wait a fixed settle delay so
//! the workload can flush files to storage before extraction.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adb::{DeviceShell, ShellError};

/// Interval between activity-stack polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Pause after completion, before artifact extraction, allowing on-device
/// file flushes.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Intent action the test activity is launched with.
pub const TEST_LOOP_ACTION: &str = "com.google.intent.action.TEST_LOOP";

/// Activity-stack line marking a task record in dumpsys output.
const TASK_RECORD_MARKER: &str = "* TaskRecord";

/// Errors from launching or monitoring the test.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The activity-manager start command failed. Fatal for the device.
    #[error("failed to launch test activity on device {device}: {source}")]
    Launch {
        device: String,
        #[source]
        source: ShellError,
    },

    /// An activity-stack query failed mid-poll.
    #[error("activity poll failed on device {device}: {source}")]
    Poll {
        device: String,
        #[source]
        source: ShellError,
    },

    /// The workload did not finish before the deadline.
    #[error("device {device} did not finish within {deadline:?}")]
    DeadlineExceeded {
        device: String,
        deadline: Duration,
    },

    /// The wait was cancelled.
    #[error("cancelled while waiting on device {device}")]
    Cancelled { device: String },
}

/// Launches the test activity and blocks until the device reports
/// completion.
///
/// By default the poll loop reproduces the legacy exit condition: a
/// single poll where the app's task record is absent or not topmost ends
/// the wait. A transient foreground switch can therefore be misread as
/// completion; callers wanting stricter semantics raise
/// [`required_negative_polls`](Self::with_required_negative_polls).
pub struct TestMonitor<'a> {
    shell: &'a dyn DeviceShell,
    package_id: String,
    deadline: Option<Duration>,
    required_negative_polls: u32,
    cancel: CancellationToken,
}

impl<'a> TestMonitor<'a> {
    /// Creates a monitor for the given package with legacy poll semantics
    /// and no deadline.
    pub fn new(shell: &'a dyn DeviceShell, package_id: impl Into<String>) -> Self {
        Self {
            shell,
            package_id: package_id.into(),
            deadline: None,
            required_negative_polls: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// Bounds the whole launch-to-completion wait. Exceeding it is a
    /// per-device timeout error, isolated like any other device failure.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Number of consecutive "not active" polls required before the loop
    /// exits. 1 reproduces the legacy behavior.
    pub fn with_required_negative_polls(mut self, polls: u32) -> Self {
        self.required_negative_polls = polls.max(1);
        self
    }

    /// Cancellation hook so a caller can abort a hung device without
    /// blocking the whole batch.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Launches the test activity, polls to completion, then applies the
    /// settle delay.
    ///
    /// `progress`, when provided, is ticked once per poll. It is allowed
    /// only as a notification and never alters the loop's semantics.
    pub async fn run(
        &self,
        device: &str,
        progress: Option<&indicatif::ProgressBar>,
    ) -> Result<(), MonitorError> {
        // Launching
        let launch = format!(
            "am start -n \"{}/.MainActivity\" -a \"{}\"",
            self.package_id, TEST_LOOP_ACTION
        );
        self.shell
            .shell(device, &launch)
            .await
            .map_err(|source| MonitorError::Launch {
                device: device.to_string(),
                source,
            })?;
        info!(device, "test activity launched");

        // Polling
        let started = Instant::now();
        let mut negative_polls = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(MonitorError::Cancelled {
                    device: device.to_string(),
                });
            }
            if let Some(deadline) = self.deadline {
                if started.elapsed() > deadline {
                    return Err(MonitorError::DeadlineExceeded {
                        device: device.to_string(),
                        deadline,
                    });
                }
            }

            let stack = self
                .shell
                .shell(device, "dumpsys activity activities")
                .await
                .map_err(|source| MonitorError::Poll {
                    device: device.to_string(),
                    source,
                })?;

            if app_active(&stack, &self.package_id) {
                negative_polls = 0;
            } else {
                negative_polls += 1;
                if negative_polls >= self.required_negative_polls {
                    break;
                }
            }

            if let Some(pb) = progress {
                pb.tick();
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        debug!(device, elapsed = ?started.elapsed(), "test completed");

        // Settling
        tokio::time::sleep(SETTLE_DELAY).await;
        Ok(())
    }
}

/// Whether the app is running and frontmost on the activity stack.
///
/// The first `* TaskRecord` line decides: if it names the package the app
/// is frontmost; if it names something else, or there is no task record
/// line at all, the app has finished.
pub fn app_active(dumpsys_output: &str, package_id: &str) -> bool {
    for line in dumpsys_output.lines() {
        let line = line.trim();
        if line.starts_with(TASK_RECORD_MARKER) {
            return line.contains(package_id);
        }
    }
    false
}
