//! Lifecycle controller: capture a core file, open a session against
//! it, run caller steps strictly in order, then finalize.
//!
//! Finalization happens exactly once per run - the session and its exit
//! guard are consumed by value, so a double finalize does not compile.
//! On success the core file is deleted (unless the run opted out); on
//! failure it is preserved as evidence and named in the surfaced error.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use mdb_runtime::{Session, SessionConfig, Status, Target};

use crate::capture;
use crate::error::{HarnessError, Result};
use crate::guard::ExitGuard;

/// One unit of caller-supplied test logic, run against the shared
/// session. Generic over the session type so step sequencing can be
/// tested without a debugger.
#[async_trait]
pub trait Step<S: Sync = Session>: Send + Sync {
    /// Human-readable step name, used in logs and failure context.
    fn name(&self) -> &str;

    /// Runs the step. Any error aborts the run; later steps are skipped.
    async fn run(&self, session: &S) -> anyhow::Result<()>;
}

struct FnStep<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: for<'a> Fn(&'a Session) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, session: &Session) -> anyhow::Result<()> {
        (self.f)(session).await
    }
}

/// Builds a boxed [`Step`] from a closure returning a boxed future.
pub fn step<F>(name: impl Into<String>, f: F) -> Box<dyn Step>
where
    F: for<'a> Fn(&'a Session) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync + 'static,
{
    Box::new(FnStep {
        name: name.into(),
        f,
    })
}

/// Runs `steps` strictly in order against `session`, aborting at the
/// first failure.
pub async fn run_steps<S: Sync>(session: &S, steps: &[Box<dyn Step<S>>]) -> Result<()> {
    for step in steps {
        tracing::info!(target: "harness", step = step.name(), "running step");
        step.run(session)
            .await
            .map_err(|source| HarnessError::Step {
                name: step.name().to_string(),
                source,
            })?;
    }
    Ok(())
}

/// One end-to-end run: capture a core file of a process (by default the
/// current one), drive steps against it, finalize.
pub struct TestRun {
    pid: u32,
    keep_artifact: bool,
}

impl TestRun {
    /// A run that captures the current process.
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            keep_artifact: false,
        }
    }

    /// Keeps the core file on disk even when the run succeeds.
    pub fn keep_artifact(mut self, keep: bool) -> Self {
        self.keep_artifact = keep;
        self
    }

    /// Captures a core file, opens a session against it with the dmod
    /// loaded, runs `steps` in order, and finalizes.
    pub async fn execute(self, steps: &[Box<dyn Step>]) -> Result<()> {
        let corefile = capture::gcore(self.pid).await?;

        let mut config = SessionConfig::core_file();
        config.remove_on_success = !self.keep_artifact;

        let session = match Session::open(Target::Core(corefile.clone()), config).await {
            Ok(session) => session,
            Err(source) => {
                // Session never opened; the core file stays for
                // inspection.
                return Err(HarnessError::Failed {
                    corefile,
                    source: Box::new(HarnessError::Session(source)),
                });
            }
        };

        let guard = ExitGuard::register(&format!("core file {}", corefile.display()));
        let outcome = run_steps(&session, steps).await;
        finalize(session, guard, corefile, outcome).await
    }
}

impl Default for TestRun {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumes the run's resources exactly once. Success deletes the core
/// file when policy asks for it; failure preserves it and names it in
/// the wrapped error.
async fn finalize(
    session: Session,
    guard: ExitGuard,
    corefile: PathBuf,
    outcome: Result<()>,
) -> Result<()> {
    guard.disarm();

    match outcome {
        Ok(()) => {
            let remove = session.config().remove_on_success;
            session
                .finish()
                .await
                .map_err(|source| preserve(corefile.clone(), source.into()))?;
            dispose_artifact(&corefile, remove).await
        }
        Err(source) => {
            crate::guard::mark_failure();
            tracing::error!(
                target: "harness",
                corefile = %corefile.display(),
                "run failed; keeping core file"
            );
            if matches!(session.status(), Status::Open) {
                if let Err(e) = session.finish().await {
                    tracing::warn!(target: "harness", "closing session after failed run: {e}");
                }
            }
            Err(preserve(corefile, source))
        }
    }
}

/// Wraps any failure of the run so the preserved core file's path is
/// part of the surfaced error.
fn preserve(corefile: PathBuf, source: HarnessError) -> HarnessError {
    HarnessError::Failed {
        corefile,
        source: Box::new(source),
    }
}

/// Deletes the core file when disposal policy asks for it. A failed
/// removal leaves the file on disk, so it too is reported with the
/// artifact's path.
async fn dispose_artifact(corefile: &Path, remove: bool) -> Result<()> {
    if remove {
        tokio::fs::remove_file(corefile)
            .await
            .map_err(|e| preserve(corefile.to_path_buf(), HarnessError::Io(e)))?;
        tracing::info!(
            target: "harness",
            corefile = %corefile.display(),
            "run succeeded; removed core file"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    struct Recorded {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Step<()> for Recorded {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _session: &()) -> anyhow::Result<()> {
            self.log.lock().push(self.name);
            if self.fail {
                anyhow::bail!("{} failed", self.name);
            }
            Ok(())
        }
    }

    fn recorded(
        name: &'static str,
        fail: bool,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Box<dyn Step<()>> {
        Box::new(Recorded {
            name,
            fail,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn steps_run_in_order_and_stop_at_first_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = vec![
            recorded("a", false, &log),
            recorded("b", true, &log),
            recorded("c", false, &log),
        ];

        let err = run_steps(&(), &steps).await.unwrap_err();
        match err {
            HarnessError::Step { name, .. } => assert_eq!(name, "b"),
            other => panic!("expected step failure, got {other:?}"),
        }
        assert_eq!(*log.lock(), ["a", "b"]);
    }

    #[tokio::test]
    async fn all_steps_run_on_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = vec![
            recorded("a", false, &log),
            recorded("b", false, &log),
            recorded("c", false, &log),
        ];

        run_steps(&(), &steps).await.unwrap();
        assert_eq!(*log.lock(), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn empty_step_list_succeeds() {
        let steps: Vec<Box<dyn Step<()>>> = Vec::new();
        run_steps(&(), &steps).await.unwrap();
    }

    #[tokio::test]
    async fn artifact_removed_only_when_policy_says_so() {
        let dir = tempfile::tempdir().unwrap();
        let corefile = dir.path().join("core.1");
        std::fs::write(&corefile, b"core").unwrap();

        dispose_artifact(&corefile, false).await.unwrap();
        assert!(corefile.exists());

        dispose_artifact(&corefile, true).await.unwrap();
        assert!(!corefile.exists());
    }

    #[tokio::test]
    async fn failed_removal_names_the_preserved_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let corefile = dir.path().join("core.2");
        // Never created, so removal fails and the file's path must be
        // part of the surfaced error.
        let err = dispose_artifact(&corefile, true).await.unwrap_err();
        assert_eq!(err.preserved_corefile(), Some(&corefile));
        assert!(err.to_string().contains("core.2"));
    }
}
