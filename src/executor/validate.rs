//! Output-contract validation for investigator runs.
//!
//! Three ordered signals decide whether a run counts as a failure: the
//! execution error, the exit code, and finally the report file on disk.
//! The ordering matters operationally: a crashed run is classified without
//! ever touching the filesystem. The `> 100` byte boundary is part of the
//! contract; a report of exactly 100 bytes fails.

use std::path::Path;

use crate::error::ExecutorError;

/// Report path relative to the incident workspace.
pub const REPORT_RELATIVE_PATH: &str = "output/investigation.md";

/// A report must be strictly larger than this to count as real output.
pub const MIN_REPORT_BYTES: u64 = 100;

/// Classify an investigator run. Returns `Some(reason)` when the run counts
/// as a failure, `None` on success. First matching signal wins.
pub fn detect_agent_failure(
    workspace: &Path,
    exit_code: i32,
    exec_error: Option<&ExecutorError>,
) -> Option<String> {
    if let Some(e) = exec_error {
        return Some(format!("agent execution error: {e}"));
    }

    if exit_code != 0 {
        return Some(format!("agent exited with non-zero code: {exit_code}"));
    }

    let report = workspace.join(REPORT_RELATIVE_PATH);
    match std::fs::metadata(&report) {
        Err(_) => Some("investigation.md file not found".to_string()),
        Ok(meta) if meta.len() <= MIN_REPORT_BYTES => Some(format!(
            "investigation.md too small: {} bytes (expected > {})",
            meta.len(),
            MIN_REPORT_BYTES
        )),
        Ok(_) => None,
    }
}
