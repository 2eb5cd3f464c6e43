//! Core-file capture via gcore(1).

use std::path::PathBuf;

use tokio::process::Command;

use crate::error::{HarnessError, Result};

/// Prefix passed to `gcore -o`; the tool appends `.<pid>`.
const CORE_PREFIX: &str = "/var/tmp/mdb-harness";

/// Saves a core file of the process identified by `pid` and returns its
/// path. The capture tool's stderr is forwarded to the log.
///
/// # Errors
///
/// Returns [`HarnessError::Capture`] when gcore is missing or exits
/// non-zero.
pub async fn gcore(pid: u32) -> Result<PathBuf> {
    let gcore = which::which("gcore").map_err(|_| HarnessError::Capture {
        pid,
        message: "gcore not found on PATH".to_string(),
    })?;

    let output = Command::new(gcore)
        .arg("-o")
        .arg(CORE_PREFIX)
        .arg(pid.to_string())
        .output()
        .await
        .map_err(|e| HarnessError::Capture {
            pid,
            message: format!("failed to run gcore: {e}"),
        })?;

    for line in String::from_utf8_lossy(&output.stderr).lines() {
        tracing::warn!(target: "gcore", "stderr: {line}");
    }

    if !output.status.success() {
        return Err(HarnessError::Capture {
            pid,
            message: format!("gcore exited with status {}", output.status),
        });
    }

    let corefile = PathBuf::from(format!("{CORE_PREFIX}.{pid}"));
    tracing::info!(target: "gcore", corefile = %corefile.display(), "captured core file");
    Ok(corefile)
}
