//! Process-exit guards for unfinalized sessions.
//!
//! A test that opens a session and never finalizes it would otherwise
//! let the host process exit cleanly, masking the leak. Each open run
//! arms a guard in an explicit registry; a process-exit hook aborts the
//! host if any guard is still armed when the process exits with status
//! 0. Deregistration happens exactly once, at finalize - the guard is
//! consumed by value.
//!
//! atexit cannot observe the exit status, so "clean exit" is tracked
//! the other way around: a panic hook and [`mark_failure`] record that
//! a failure already surfaced, and the hook then reports the armed
//! guards without escalating. A run that is already failing must not be
//! converted into an abort that hides its real error.

use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

static REGISTRY: Mutex<Vec<(u64, String)>> = Mutex::new(Vec::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static FAILURE_SURFACED: AtomicBool = AtomicBool::new(false);
static INSTALL_HOOKS: Once = Once::new();

fn should_abort_on_exit(armed: usize) -> bool {
    armed > 0 && !FAILURE_SURFACED.load(Ordering::SeqCst)
}

extern "C" fn exit_check() {
    let armed = REGISTRY.lock();
    if armed.is_empty() {
        return;
    }
    for (_, description) in armed.iter() {
        eprintln!("mdb-harness: session never finalized: {description}");
    }
    if !should_abort_on_exit(armed.len()) {
        eprintln!("mdb-harness: exit already reflects a failure; not aborting");
        return;
    }
    eprintln!("mdb-harness: clean exit with unfinalized sessions; aborting");
    std::process::abort();
}

/// Records that this process already surfaced a failure. Armed guards
/// at exit are then reported but no longer escalated to an abort.
pub fn mark_failure() {
    FAILURE_SURFACED.store(true, Ordering::SeqCst);
}

/// An armed guard for one open lifecycle run.
#[must_use = "an undisarmed guard aborts the process at exit"]
pub struct ExitGuard {
    id: u64,
}

impl ExitGuard {
    /// Arms a guard described by `description` (typically the artifact
    /// the run owns). The exit and panic hooks are installed on first
    /// use.
    pub fn register(description: &str) -> ExitGuard {
        INSTALL_HOOKS.call_once(|| {
            let previous = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                mark_failure();
                previous(info);
            }));
            // SAFETY: exit_check only touches static registry state.
            unsafe {
                libc::atexit(exit_check);
            }
        });

        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        REGISTRY.lock().push((id, description.to_string()));
        tracing::debug!(target: "harness", id, description, "armed exit guard");
        ExitGuard { id }
    }

    /// Disarms the guard. Consuming by value makes a second disarm
    /// unrepresentable.
    pub fn disarm(self) {
        let mut registry = REGISTRY.lock();
        registry.retain(|(id, _)| *id != self.id);
        tracing::debug!(target: "harness", id = self.id, "disarmed exit guard");
    }
}

/// Descriptions of currently armed guards.
pub fn armed_sessions() -> Vec<String> {
    REGISTRY
        .lock()
        .iter()
        .map(|(_, description)| description.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disarm_removes_exactly_this_guard() {
        let a = ExitGuard::register("guard-test-a");
        let b = ExitGuard::register("guard-test-b");

        a.disarm();
        let armed = armed_sessions();
        assert!(!armed.iter().any(|d| d == "guard-test-a"));
        assert!(armed.iter().any(|d| d == "guard-test-b"));

        b.disarm();
        let armed = armed_sessions();
        assert!(!armed.iter().any(|d| d == "guard-test-b"));
    }

    #[test]
    fn armed_guards_abort_clean_exits_only() {
        assert!(should_abort_on_exit(1));
        assert!(!should_abort_on_exit(0));

        // Once a failure surfaced, an armed guard no longer escalates:
        // the process is already exiting non-zero for the real error.
        mark_failure();
        assert!(!should_abort_on_exit(1));
    }
}
