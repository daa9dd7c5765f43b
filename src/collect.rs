//! Artifact collection and normalization.
//!
//! Takes raw per-device report files (and optionally the paired trace
//! captures) and produces canonically named reports in the run's output
//! directory: copy in, rename from embedded build metadata, merge
//! keyword-filtered trace events in place. Processing is best-effort per
//! device: a failure is logged and that device skipped, never aborting
//! the batch. The renderer downstream only ever sees canonical,
//! already-merged reports.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

/// Errors from processing one device's artifacts.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// The trace artifact could not be parsed. The device's report is
    /// kept, unmerged.
    #[error("unable to parse systrace data: {0}")]
    TraceParse(String),

    /// The report does not open with the build metadata line the
    /// canonical name is derived from.
    #[error("report {path} has no build metadata line: {detail}")]
    MissingMetadata { path: PathBuf, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build/device metadata embedded as the report's first JSON line.
#[derive(Debug, Deserialize)]
struct BuildInfo {
    #[serde(rename = "MANUFACTURER")]
    manufacturer: String,
    #[serde(rename = "MODEL")]
    model: String,
    #[serde(rename = "SDK_INT")]
    sdk_int: i64,
}

#[derive(Debug, Deserialize)]
struct ReportHeader {
    build: BuildInfo,
}

/// Copies, renames, and merges per-device artifacts into the output
/// directory.
pub struct Collector {
    out_dir: PathBuf,
    keywords: Vec<String>,
}

impl Collector {
    /// Creates a collector writing into `out_dir`, filtering merged trace
    /// events by `keywords`.
    pub fn new(out_dir: PathBuf, keywords: Vec<String>) -> Self {
        Self { out_dir, keywords }
    }

    /// Processes one raw report per device, paired positionally with the
    /// trace captures when systrace was enabled (`traces` is empty
    /// otherwise).
    ///
    /// Per-device failures are logged and skipped; a trace-parse failure
    /// specifically still emits that device's report, unmerged. Returns
    /// the canonical report paths that were produced, which may be a
    /// strict subset of the input.
    pub fn process(&self, reports: &[PathBuf], traces: &[PathBuf]) -> Vec<PathBuf> {
        let mut out_files = Vec::with_capacity(reports.len());

        for (i, report) in reports.iter().enumerate() {
            let trace = traces.get(i).map(PathBuf::as_path);
            match self.process_one(report, trace) {
                Ok(path) => out_files.push(path),
                Err(e) => error!(report = %report.display(), "unable to process report: {}", e),
            }
        }

        out_files
    }

    fn process_one(&self, report: &Path, trace: Option<&Path>) -> Result<PathBuf, CollectError> {
        // Copy the raw report into the output dir under its original name
        // (no-op when it was extracted straight into the output dir).
        let file_name = report
            .file_name()
            .ok_or_else(|| CollectError::MissingMetadata {
                path: report.to_path_buf(),
                detail: "not a file".to_string(),
            })?;
        let local = self.out_dir.join(file_name);
        if local != report {
            std::fs::copy(report, &local)?;
        }

        let canonical = self.normalize_report_name(&local)?;

        if let Some(trace) = trace {
            let trace_ext = trace
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_else(|| "html".to_string());
            let stem = canonical
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let local_trace = self.out_dir.join(format!("{}_trace.{}", stem, trace_ext));
            std::fs::copy(trace, &local_trace)?;

            match merge_systrace(&canonical, &local_trace, &self.keywords) {
                Ok(count) => info!(
                    report = %canonical.display(),
                    events = count,
                    "merged systrace data"
                ),
                // Keep the report unmerged; other devices are unaffected.
                Err(CollectError::TraceParse(detail)) => {
                    warn!(report = %canonical.display(), "unable to parse systrace data: {}", detail)
                }
                Err(e) => return Err(e),
            }
        }

        Ok(canonical)
    }

    /// Renames a report in place to the canonical scheme derived from its
    /// embedded build metadata, not its original file name.
    ///
    /// The canonical stem is `<manufacturer>_<model>_sdk<sdk>_report`,
    /// sanitized to `[a-z0-9_]`. Names are unique within the output
    /// directory: collisions get a numeric suffix.
    pub fn normalize_report_name(&self, report: &Path) -> Result<PathBuf, CollectError> {
        let header = read_report_header(report)?;
        let stem = sanitize(&format!(
            "{}_{}_sdk{}_report",
            header.build.manufacturer, header.build.model, header.build.sdk_int
        ));

        let ext = report
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "json".to_string());

        let mut canonical = self.out_dir.join(format!("{}.{}", stem, ext));
        let mut suffix = 2;
        while canonical.exists() && canonical != report {
            canonical = self.out_dir.join(format!("{}_{}.{}", stem, suffix, ext));
            suffix += 1;
        }

        if canonical != report {
            std::fs::rename(report, &canonical)?;
        }
        Ok(canonical)
    }
}

fn read_report_header(report: &Path) -> Result<ReportHeader, CollectError> {
    let content = std::fs::read_to_string(report)?;
    let first_line = content
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| CollectError::MissingMetadata {
            path: report.to_path_buf(),
            detail: "empty report".to_string(),
        })?;

    serde_json::from_str(first_line).map_err(|e| CollectError::MissingMetadata {
        path: report.to_path_buf(),
        detail: e.to_string(),
    })
}

fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Merges keyword-filtered trace events into the report, rewriting the
/// report file in place. Returns the number of merged events.
pub fn merge_systrace(
    report: &Path,
    trace: &Path,
    keywords: &[String],
) -> Result<usize, CollectError> {
    let trace_text = std::fs::read_to_string(trace)?;
    let events = filter_trace_events(&trace_text, keywords)?;

    let merged_line = json!({
        "systrace": {
            "keywords": keywords,
            "events": events,
        }
    });

    let mut content = std::fs::read_to_string(report)?;
    if !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&merged_line.to_string());
    content.push('\n');
    std::fs::write(report, content)?;

    Ok(events.len())
}

/// Extracts the trace's event lines matching any of the keywords.
///
/// The capture dump opens with a `TRACE:` header followed by event lines;
/// `#` lines are tracer commentary. A dump without the header is not a
/// trace and fails with [`CollectError::TraceParse`].
pub fn filter_trace_events(
    trace_text: &str,
    keywords: &[String],
) -> Result<Vec<String>, CollectError> {
    let mut lines = trace_text.lines();
    lines
        .by_ref()
        .find(|l| l.trim() == "TRACE:")
        .ok_or_else(|| CollectError::TraceParse("missing TRACE: header".to_string()))?;

    Ok(lines
        .filter(|l| {
            let l = l.trim();
            !l.is_empty() && !l.starts_with('#')
        })
        .filter(|l| keywords.iter().any(|k| l.contains(k.as_str())))
        .map(str::to_string)
        .collect())
}
