//! Device shell adapter over the adb CLI.
//!
//! All device control goes through the [`DeviceShell`] trait: install,
//! uninstall, file push/pull, plain shell commands, and privileged
//! (`run-as`) commands. The concrete [`AdbShell`] implementation shells
//! out to `adb`; tests substitute scripted fakes.
//!
//! # Error Handling
//!
//! Every operation executes synchronously (from the caller's point of
//! view) and either returns captured stdout or fails with a typed
//! [`ShellError`]. A non-zero exit is [`ShellError::CommandFailed`] with
//! the exit code and captured stderr, except for uninstall, which is
//! expected to fail when the package is not installed and is classified
//! separately as [`ShellError::UninstallFailed`] so callers can treat it
//! as informational.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

/// Result type for device shell operations.
pub type ShellResult<T> = Result<T, ShellError>;

/// Errors produced by device shell commands.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// A device command exited non-zero. Fatal for every operation except
    /// uninstall.
    #[error("`{command}` on device {device} exited with code {code}: {stderr}")]
    CommandFailed {
        device: String,
        command: String,
        code: i32,
        stderr: String,
    },

    /// Uninstall exited non-zero, typically because the package was not
    /// installed. Callers log this and continue.
    #[error("unable to uninstall {package} from device {device}: {stderr}")]
    UninstallFailed {
        device: String,
        package: String,
        stderr: String,
    },

    /// The command did not finish within the adapter's timeout.
    #[error("`{command}` on device {device} timed out after {timeout:?}")]
    Timeout {
        device: String,
        command: String,
        timeout: Duration,
    },

    /// The adb binary could not be spawned or its output read.
    #[error("failed to run adb: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Device-control operations issued against one device by serial id.
///
/// Implementations must be safe to share across per-device tasks; the
/// adapter itself holds no per-device state.
#[async_trait]
pub trait DeviceShell: Send + Sync {
    /// Installs (replacing any existing install) the package on the device.
    /// A non-zero exit is fatal.
    async fn install(&self, device: &str, apk: &Path) -> ShellResult<String>;

    /// Uninstalls the package from the device. A non-zero exit surfaces as
    /// [`ShellError::UninstallFailed`], which callers treat as
    /// informational.
    async fn uninstall(&self, device: &str, package: &str) -> ShellResult<String>;

    /// Pushes a local file to a path on the device.
    async fn push(&self, device: &str, local: &Path, remote: &str) -> ShellResult<String>;

    /// Pulls a file from the device to a local path.
    async fn pull(&self, device: &str, remote: &str, local: &Path) -> ShellResult<String>;

    /// Runs a shell command on the device and returns captured stdout.
    async fn shell(&self, device: &str, command: &str) -> ShellResult<String>;

    /// Runs a shell command under the package's identity (`run-as`).
    /// Required for touching the app's protected storage.
    async fn run_as(&self, device: &str, package: &str, command: &str) -> ShellResult<String>;

    /// Lists the serial ids of attached devices in `adb devices` order.
    async fn list_devices(&self) -> ShellResult<Vec<String>>;
}

/// Device shell implementation backed by the `adb` binary.
pub struct AdbShell {
    adb: String,
    command_timeout: Duration,
}

impl AdbShell {
    /// Creates an adapter using `adb` from `PATH` and the default
    /// per-command timeout.
    pub fn new() -> Self {
        Self {
            adb: "adb".to_string(),
            command_timeout: Duration::from_secs(600),
        }
    }

    /// Overrides the adb binary path.
    pub fn with_binary(mut self, adb: impl Into<String>) -> Self {
        self.adb = adb.into();
        self
    }

    /// Overrides the per-command timeout. Device commands are the only
    /// operations allowed to block for long; every one of them still gets
    /// a bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    async fn exec(&self, device: Option<&str>, args: &[&str]) -> ShellResult<String> {
        let mut full_args: Vec<&str> = Vec::with_capacity(args.len() + 2);
        if let Some(device) = device {
            full_args.push("-s");
            full_args.push(device);
        }
        full_args.extend_from_slice(args);

        let command_line = format!("{} {}", self.adb, full_args.join(" "));
        debug!(command = %command_line, "exec");

        let mut process = tokio::process::Command::new(&self.adb);
        process.args(&full_args);
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());

        let output = tokio::time::timeout(self.command_timeout, process.output())
            .await
            .map_err(|_| ShellError::Timeout {
                device: device.unwrap_or("-").to_string(),
                command: command_line.clone(),
                timeout: self.command_timeout,
            })??;

        if !output.status.success() {
            return Err(ShellError::CommandFailed {
                device: device.unwrap_or("-").to_string(),
                command: command_line,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for AdbShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceShell for AdbShell {
    async fn install(&self, device: &str, apk: &Path) -> ShellResult<String> {
        let apk = apk.to_string_lossy();
        self.exec(Some(device), &["install", "-r", &apk]).await
    }

    async fn uninstall(&self, device: &str, package: &str) -> ShellResult<String> {
        match self.exec(Some(device), &["uninstall", package]).await {
            Err(ShellError::CommandFailed { device, stderr, .. }) => {
                Err(ShellError::UninstallFailed {
                    device,
                    package: package.to_string(),
                    stderr,
                })
            }
            other => other,
        }
    }

    async fn push(&self, device: &str, local: &Path, remote: &str) -> ShellResult<String> {
        let local = local.to_string_lossy();
        self.exec(Some(device), &["push", &local, remote]).await
    }

    async fn pull(&self, device: &str, remote: &str, local: &Path) -> ShellResult<String> {
        let local = local.to_string_lossy();
        self.exec(Some(device), &["pull", remote, &local]).await
    }

    async fn shell(&self, device: &str, command: &str) -> ShellResult<String> {
        self.exec(Some(device), &["shell", command]).await
    }

    async fn run_as(&self, device: &str, package: &str, command: &str) -> ShellResult<String> {
        let quoted = format!("run-as {} \"{}\"", package, command);
        self.exec(Some(device), &["shell", &quoted]).await
    }

    async fn list_devices(&self) -> ShellResult<Vec<String>> {
        let output = self.exec(None, &["devices"]).await?;
        Ok(parse_devices(&output))
    }
}

/// Parses `adb devices` output into the list of attached serial ids.
///
/// Devices in states other than `device` (offline, unauthorized) are
/// not usable targets and are skipped.
pub fn parse_devices(output: &str) -> Vec<String> {
    let line = Regex::new(r"^(\S+)\s+device$").unwrap();
    output
        .lines()
        .skip(1) // "List of devices attached" header
        .filter_map(|l| {
            line.captures(l.trim_end())
                .map(|caps| caps[1].to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_devices_skips_header_and_bad_states() {
        let output = "List of devices attached\n\
                      9A051FFAZ00123\tdevice\n\
                      emulator-5554\tdevice\n\
                      0B061GGBZ00456\toffline\n\
                      1C071HHCZ00789\tunauthorized\n\n";
        assert_eq!(
            parse_devices(output),
            vec!["9A051FFAZ00123".to_string(), "emulator-5554".to_string()]
        );
    }

    #[test]
    fn parse_devices_handles_empty_list() {
        assert!(parse_devices("List of devices attached\n\n").is_empty());
    }

    #[tokio::test]
    async fn uninstall_failure_is_classified_distinctly() {
        // `true` exits zero for any args, `false` exits non-zero; the
        // adapter only looks at the exit status.
        let ok_shell = AdbShell::new().with_binary("true");
        assert!(ok_shell.uninstall("serial", "com.example").await.is_ok());

        let failing_shell = AdbShell::new().with_binary("false");
        let err = failing_shell
            .uninstall("serial", "com.example")
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::UninstallFailed { .. }));

        // Every other command keeps the generic classification.
        let err = failing_shell
            .install("serial", Path::new("app.apk"))
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::CommandFailed { .. }));
    }
}
