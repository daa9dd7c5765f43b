//! System trace capture bracketing a device's test run.
//!
//! A [`TraceSession`] owns one capture scoped to one device. Construction
//! performs the tooling handshake synchronously: when
//! [`TraceSession::start`] returns, the device is actively recording, so
//! callers must not launch the workload before that. [`finish`]
//! (consuming the session) stops capture and yields the artifact path.
//! When the deployment does not request a trace there simply is no
//! session (`Option<TraceSession>` at the call site).

use std::path::PathBuf;

use tracing::info;

use crate::adb::{DeviceShell, ShellError};

/// Errors from trace capture.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// Capture could not start. A requested trace that cannot start
    /// aborts the device's run rather than proceeding untraced.
    #[error("trace capture failed to start on device {device}: {source}")]
    CaptureStart {
        device: String,
        #[source]
        source: ShellError,
    },

    /// Capture could not be stopped or dumped.
    #[error("trace capture failed to stop on device {device}: {source}")]
    CaptureStop {
        device: String,
        #[source]
        source: ShellError,
    },

    /// The captured trace could not be written locally.
    #[error("failed to write trace artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An in-flight system trace capture on one device.
///
/// The type itself is the state machine: a value only exists in the
/// started state, and [`finish`](Self::finish) consumes it.
pub struct TraceSession {
    device: String,
    dst_file: PathBuf,
}

impl TraceSession {
    /// Starts asynchronous trace capture on the device and blocks until
    /// the tooling confirms it is recording.
    pub async fn start(
        device: &str,
        dst_file: PathBuf,
        categories: &[String],
        shell: &dyn DeviceShell,
    ) -> Result<Self, TraceError> {
        let command = if categories.is_empty() {
            "atrace --async_start".to_string()
        } else {
            format!("atrace --async_start {}", categories.join(" "))
        };

        // atrace returns only once the buffers are armed; that return is
        // the handshake.
        shell
            .shell(device, &command)
            .await
            .map_err(|source| TraceError::CaptureStart {
                device: device.to_string(),
                source,
            })?;

        info!(device, "trace capture started");
        Ok(Self {
            device: device.to_string(),
            dst_file,
        })
    }

    /// The path the trace artifact will be written to.
    pub fn dst_file(&self) -> &PathBuf {
        &self.dst_file
    }

    /// Stops capture, writes the dumped trace to the destination file,
    /// and returns its path. Consumes the session.
    pub async fn finish(self, shell: &dyn DeviceShell) -> Result<PathBuf, TraceError> {
        let dump = shell
            .shell(&self.device, "atrace --async_stop")
            .await
            .map_err(|source| TraceError::CaptureStop {
                device: self.device.clone(),
                source,
            })?;

        tokio::fs::write(&self.dst_file, dump)
            .await
            .map_err(|source| TraceError::Write {
                path: self.dst_file.clone(),
                source,
            })?;

        info!(device = %self.device, path = %self.dst_file.display(), "trace capture finished");
        Ok(self.dst_file)
    }
}
