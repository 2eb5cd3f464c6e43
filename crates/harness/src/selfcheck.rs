//! Self-attach leak check: a nested session against the debugger's own
//! process.
//!
//! The sub-session attaches by pid with extension loading disabled (it
//! inspects mdb itself, not a JavaScript target) and no artifact to
//! dispose of. Its lifetime is strictly nested inside this call: it is
//! finalized before control returns, whatever the diagnostic command
//! did.

use mdb_runtime::{Session, SessionConfig, Target};

use crate::error::{HarnessError, Result};

/// Runs a leak check against `parent`'s debugger process and returns
/// the diagnostic transcript.
///
/// # Errors
///
/// [`HarnessError::Attach`] when the sub-session cannot be opened, its
/// command fails, or a second check is requested while one is live. The
/// parent session remains usable in all cases.
pub async fn check_for_leaks(parent: &Session) -> Result<String> {
    let _slot = parent
        .begin_self_attach()
        .map_err(|source| HarnessError::Attach { source })?;

    tracing::info!(
        target: "harness",
        pid = parent.pid(),
        "attaching to debugger process for leak check"
    );

    let sub = Session::open(Target::Pid(parent.pid()), SessionConfig::attach())
        .await
        .map_err(|source| HarnessError::Attach { source })?;

    // Finalize the sub-session unconditionally; only then surface the
    // command's outcome.
    let transcript = sub.run_cmd("::findleaks\n").await;
    let finished = sub.finish().await;

    let transcript = transcript.map_err(|source| HarnessError::Attach { source })?;
    finished.map_err(|source| HarnessError::Attach { source })?;

    tracing::info!(target: "harness", "leak check transcript:\n{transcript}");
    Ok(transcript)
}
