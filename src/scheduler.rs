//! Per-device execution fan-out.
//!
//! Decides, for one deployment, whether device execution units run in
//! parallel or strictly serially, and drives them accordingly. Parallel
//! fan-out is permitted only when more than one device is targeted AND
//! systrace is disabled: the trace tooling is not safe to run
//! concurrently from one host session, so any systrace requirement
//! forces serialization regardless of device count.
//!
//! A failure in one unit never cancels its siblings; each unit's outcome
//! is collected as a per-device `Result`.

use std::future::Future;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of one device's execution unit.
#[derive(Debug)]
pub struct DeviceOutcome<T, E> {
    /// Device serial id.
    pub device: String,
    /// The unit's artifacts, or the isolated failure.
    pub result: Result<T, E>,
}

/// Decision rule for parallel fan-out.
pub fn parallel_allowed(device_count: usize, systrace_enabled: bool) -> bool {
    device_count > 1 && !systrace_enabled
}

/// Fans per-device execution units out across the device set.
pub struct Scheduler {
    systrace_enabled: bool,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Creates a scheduler for a deployment with the given systrace
    /// setting.
    pub fn new(systrace_enabled: bool) -> Self {
        Self {
            systrace_enabled,
            cancel: CancellationToken::new(),
        }
    }

    /// Deployment-scoped cancellation: once raised, no new device units
    /// are issued. In-flight units are left to finish their settle and
    /// extract phases rather than leaving partial state on-device.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs one unit per device and collects all outcomes.
    ///
    /// The unit receives the device id and whether it runs on the serial
    /// path (the only path allowed an interactive waiting indicator).
    /// When parallel, each unit is an independent spawned task and all
    /// are awaited; when serial, units run one at a time in the order
    /// given.
    pub async fn execute<T, E, F, Fut>(
        &self,
        devices: &[String],
        unit: F,
    ) -> Vec<DeviceOutcome<T, E>>
    where
        T: Send,
        E: Send + std::fmt::Display,
        F: Fn(String, bool) -> Fut + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let mut outcomes = Vec::with_capacity(devices.len());

        if parallel_allowed(devices.len(), self.systrace_enabled) {
            info!("waiting for test to run on {} devices in parallel", devices.len());

            let results: Mutex<Vec<DeviceOutcome<T, E>>> = Mutex::new(Vec::new());
            tokio_scoped::scope(|scope| {
                for device in devices {
                    if self.cancel.is_cancelled() {
                        warn!(device = %device, "cancelled before start; skipping device");
                        continue;
                    }
                    let results = &results;
                    let unit = &unit;
                    scope.spawn(async move {
                        let result = unit(device.clone(), false).await;
                        if let Err(e) = &result {
                            warn!(device = %device, "device unit failed: {}", e);
                        }
                        results.lock().await.push(DeviceOutcome {
                            device: device.clone(),
                            result,
                        });
                    });
                }
            });

            let mut collected = results.into_inner();
            // Spawn completion order is arbitrary; report in device order.
            collected.sort_by_key(|o| devices.iter().position(|d| d == &o.device));
            outcomes = collected;
        } else {
            for device in devices {
                if self.cancel.is_cancelled() {
                    warn!(device = %device, "cancelled before start; skipping device");
                    continue;
                }
                let result = unit(device.clone(), true).await;
                if let Err(e) = &result {
                    warn!(device = %device, "device unit failed: {}", e);
                }
                outcomes.push(DeviceOutcome {
                    device: device.clone(),
                    result,
                });
            }
        }

        outcomes
    }
}
