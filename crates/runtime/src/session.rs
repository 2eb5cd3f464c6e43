//! Debugger session: one mdb child process plus its framing and
//! single-slot command queue.
//!
//! # Command protocol
//!
//! A session accepts exactly one command at a time. `run_cmd` parks the
//! caller on a oneshot channel; the dispatch task completes it when the
//! sentinel transport frames the matching response body. Submitting a
//! second command while one is pending is a caller programming error and
//! fails loudly rather than queueing silently; the orchestration above
//! the session is responsible for sequencing.
//!
//! # Terminal states
//!
//! `Open -> Exited(0) | Errored`. A non-zero exit, stderr output before
//! setup completes, or loss of the output stream is fatal: the terminal
//! state is recorded, any in-flight waiter receives
//! [`Error::SessionTerminated`] instead of hanging, and listeners on the
//! status channel are notified.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, watch};

use crate::debugger;
use crate::error::{Error, Result};
use crate::target::Target;
use crate::transport::SentinelTransport;

/// Per-session policy, fixed at open time.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Load the mdb_v8 dmod during setup. Only meaningful for sessions
    /// inspecting a JavaScript-engine target.
    pub load_extension: bool,
    /// Delete the session's core file when the run it belongs to
    /// succeeds. Consulted by the lifecycle layer at finalize.
    pub remove_on_success: bool,
}

impl SessionConfig {
    /// Policy for a session against a captured core file.
    pub fn core_file() -> Self {
        Self {
            load_extension: true,
            remove_on_success: true,
        }
    }

    /// Policy for a session attached to a live process. No extension, and
    /// there is no artifact to delete.
    pub fn attach() -> Self {
        Self {
            load_extension: false,
            remove_on_success: false,
        }
    }
}

/// Observable session state, published on the status channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Session accepts commands.
    Open,
    /// Debugger exited cleanly with the given code.
    Exited(i32),
    /// Fatal condition; no further commands will be accepted.
    Errored(String),
}

/// Recorded terminal condition.
enum Terminal {
    Exited(i32),
    Errored(String),
}

/// The single in-flight command.
struct Pending {
    command: String,
    tx: oneshot::Sender<Result<String>>,
}

struct State {
    pending: Option<Pending>,
    terminal: Option<Terminal>,
}

struct Shared {
    state: Mutex<State>,
    status_tx: watch::Sender<Status>,
    setup_done: AtomicBool,
    self_attach: AtomicBool,
    /// Whether an exit watcher owns a real child process. With one, exit
    /// status is authoritative; sessions wired to in-memory pipes in
    /// tests have none, so for them EOF is.
    child_attached: bool,
}

impl Shared {
    /// Completes the pending command with `err`, if one is in flight.
    fn fail_pending(&self, state: &mut State, err: Error) {
        if let Some(pending) = state.pending.take() {
            tracing::debug!(
                target: "mdb",
                command = %pending.command.trim_end(),
                "failing in-flight command: {err}"
            );
            let _ = pending.tx.send(Err(err));
        }
    }

    /// Records the terminal state and notifies status listeners. First
    /// transition wins.
    fn set_terminal(&self, state: &mut State, terminal: Terminal) {
        if state.terminal.is_some() {
            return;
        }
        let status = match &terminal {
            Terminal::Exited(code) => Status::Exited(*code),
            Terminal::Errored(message) => Status::Errored(message.clone()),
        };
        state.terminal = Some(terminal);
        self.status_tx.send_replace(status);
    }
}

fn closed_error(terminal: &Terminal) -> Error {
    match terminal {
        Terminal::Exited(code) => Error::SessionClosed(format!("mdb exited with code {code}")),
        Terminal::Errored(message) => Error::SessionClosed(message.clone()),
    }
}

/// Guard marking a live self-attach sub-session. Dropping it releases the
/// parent's attach slot.
pub struct SelfAttachGuard {
    shared: Arc<Shared>,
}

impl fmt::Debug for SelfAttachGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfAttachGuard").finish_non_exhaustive()
    }
}

impl Drop for SelfAttachGuard {
    fn drop(&mut self) {
        self.shared.self_attach.store(false, Ordering::SeqCst);
    }
}

/// One live connection to an mdb process.
pub struct Session {
    shared: Arc<Shared>,
    outbound_tx: mpsc::UnboundedSender<String>,
    pid: u32,
    target: Target,
    config: SessionConfig,
}

impl Session {
    /// Opens a session against `target`.
    ///
    /// Spawns `mdb -S [-L <path>] <target>` with piped stdio and
    /// `TZ=utc`, wires the sentinel transport, then runs setup: `::load`
    /// of the dmod (when `config.load_extension`) followed by `1000$w` to
    /// keep mdb from wrapping output at the default 80 columns.
    ///
    /// Any stderr output observed before setup completes fails the open:
    /// it indicates the debugger could not initialize.
    pub async fn open(target: Target, config: SessionConfig) -> Result<Session> {
        let mdb = debugger::find_debugger()?;

        let mut cmd = Command::new(&mdb);
        // -S avoids interference from a user's .mdbrc file.
        cmd.arg("-S");
        if let Some(path) = debugger::library_path() {
            cmd.arg("-L").arg(path);
        }
        target.push_args(&mut cmd);
        cmd.env("TZ", "utc")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(target: "mdb", debugger = %mdb.display(), session_target = %target, "launching mdb");

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::LaunchFailed(format!("failed to spawn mdb: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::LaunchFailed("mdb exited during startup".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::LaunchFailed("mdb stdin was not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::LaunchFailed("mdb stdout was not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::LaunchFailed("mdb stderr was not piped".to_string()))?;

        let (transport, body_rx) = SentinelTransport::new(stdin, stdout);
        let session = Self::connect(transport, body_rx, pid, target, config, Some(child));
        tokio::spawn(watch_stderr(Arc::clone(&session.shared), stderr));

        session.setup().await?;
        Ok(session)
    }

    /// Wires a session over an already-established transport and spawns
    /// its worker tasks. No setup commands are issued.
    fn connect<W, R>(
        transport: SentinelTransport<W, R>,
        body_rx: mpsc::UnboundedReceiver<String>,
        pid: u32,
        target: Target,
        config: SessionConfig,
        child: Option<Child>,
    ) -> Session
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (status_tx, _) = watch::channel(Status::Open);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                pending: None,
                terminal: None,
            }),
            status_tx,
            setup_done: AtomicBool::new(false),
            self_attach: AtomicBool::new(false),
            child_attached: child.is_some(),
        });

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (mut sender, receiver) = transport.into_parts();

        // Writer: forwards queued commands; closing the channel closes
        // the debugger's stdin.
        tokio::spawn(async move {
            while let Some(command) = outbound_rx.recv().await {
                if let Err(e) = sender.send(&command).await {
                    tracing::error!(target: "mdb", "transport write error: {e}");
                    break;
                }
            }
            let _ = sender.shutdown().await;
        });

        // Reader: drives the framing loop until EOF.
        tokio::spawn(async move {
            if let Err(e) = receiver.run().await {
                tracing::error!(target: "mdb", "transport read error: {e}");
            }
        });

        tokio::spawn(dispatch(Arc::clone(&shared), body_rx));

        if let Some(child) = child {
            tokio::spawn(watch_exit(Arc::clone(&shared), child));
        }

        Session {
            shared,
            outbound_tx,
            pid,
            target,
            config,
        }
    }

    async fn setup(&self) -> Result<()> {
        if self.config.load_extension {
            let dmod = debugger::extension_path()?;
            self.run_cmd(&format!("::load {}\n", dmod.display()))
                .await
                .map_err(|e| Error::SetupFailed(format!("::load of dmod failed: {e}")))?;
        }
        self.run_cmd("1000$w\n")
            .await
            .map_err(|e| Error::SetupFailed(format!("terminal width setup failed: {e}")))?;
        self.shared.setup_done.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Submits one command and awaits its framed response body.
    ///
    /// # Errors
    ///
    /// [`Error::ProtocolViolation`] if a command is already pending;
    /// [`Error::SessionClosed`] if the session reached a terminal state;
    /// [`Error::SessionTerminated`] if the debugger goes away while this
    /// command is in flight.
    pub async fn run_cmd(&self, command: &str) -> Result<String> {
        let rx = {
            let mut st = self.shared.state.lock();
            if let Some(terminal) = &st.terminal {
                return Err(closed_error(terminal));
            }
            if let Some(pending) = &st.pending {
                return Err(Error::ProtocolViolation(format!(
                    "command submitted while '{}' is pending",
                    pending.command.trim_end()
                )));
            }
            let (tx, rx) = oneshot::channel();
            st.pending = Some(Pending {
                command: command.to_string(),
                tx,
            });
            rx
        };

        tracing::debug!(target: "mdb", "> {}", command.trim_end());

        if self.outbound_tx.send(command.to_string()).is_err() {
            self.shared.state.lock().pending.take();
            return Err(Error::ChannelClosed);
        }

        let body = match rx.await {
            Ok(result) => result?,
            Err(_) => return Err(Error::ChannelClosed),
        };
        tracing::trace!(target: "mdb", "{body}");
        Ok(body)
    }

    /// Finishes the session: closes the debugger's stdin and waits for it
    /// to exit.
    ///
    /// # Errors
    ///
    /// [`Error::ProtocolViolation`] when called after a fatal error was
    /// recorded or while a command is pending; both indicate a bug in the
    /// caller's orchestration.
    pub async fn finish(self) -> Result<()> {
        {
            let st = self.shared.state.lock();
            if let Some(Terminal::Errored(message)) = &st.terminal {
                return Err(Error::ProtocolViolation(format!(
                    "finish after fatal session error: {message}"
                )));
            }
            if let Some(pending) = &st.pending {
                return Err(Error::ProtocolViolation(format!(
                    "finish while '{}' is pending",
                    pending.command.trim_end()
                )));
            }
        }

        let Session {
            shared, outbound_tx, ..
        } = self;

        let mut status_rx = shared.status_tx.subscribe();
        // Writer task shuts the child's stdin down once the queue closes.
        drop(outbound_tx);

        let wait = status_rx.wait_for(|status| !matches!(status, Status::Open));
        match tokio::time::timeout(Duration::from_secs(10), wait).await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::TransportError(
                "timeout waiting for mdb to exit".to_string(),
            )),
        }
    }

    /// Claims the session's single self-attach slot. A second claim while
    /// one guard is live is a caller programming error.
    pub fn begin_self_attach(&self) -> Result<SelfAttachGuard> {
        if self.shared.self_attach.swap(true, Ordering::SeqCst) {
            return Err(Error::ProtocolViolation(
                "self-attach sub-session already open for this session".to_string(),
            ));
        }
        Ok(SelfAttachGuard {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Pid of the debugger process itself, the target of self-attach.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The target this session was opened against.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Policy fixed at open time.
    pub fn config(&self) -> SessionConfig {
        self.config
    }

    /// Current session status.
    pub fn status(&self) -> Status {
        self.shared.status_tx.borrow().clone()
    }

    /// Subscribes to terminal-state transitions, so an enclosing
    /// orchestration can abort waits instead of hanging.
    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.shared.status_tx.subscribe()
    }
}

/// Completes pending commands as the transport frames response bodies.
async fn dispatch(shared: Arc<Shared>, mut body_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(body) = body_rx.recv().await {
        let mut st = shared.state.lock();
        match st.pending.take() {
            Some(pending) => {
                let _ = pending.tx.send(Ok(body));
            }
            None => {
                tracing::error!(target: "mdb", "framed response arrived with no command pending");
            }
        }
    }

    // Output stream closed. With a real child attached the exit watcher
    // owns both the pending command and the terminal transition, so the
    // waiter learns the actual exit code rather than a bare EOF. Without
    // one (in-memory transports) EOF is itself the end of the session.
    if shared.child_attached {
        return;
    }
    let mut st = shared.state.lock();
    shared.fail_pending(&mut st, Error::SessionTerminated { code: None });
    shared.set_terminal(
        &mut st,
        Terminal::Errored("debugger output stream closed".to_string()),
    );
}

/// Waits for the child to exit and records the terminal transition.
async fn watch_exit(shared: Arc<Shared>, mut child: Child) {
    match child.wait().await {
        Ok(status) => {
            let code = status.code();
            let mut st = shared.state.lock();
            shared.fail_pending(&mut st, Error::SessionTerminated { code });
            match code {
                Some(0) => shared.set_terminal(&mut st, Terminal::Exited(0)),
                Some(c) => shared.set_terminal(
                    &mut st,
                    Terminal::Errored(format!("mdb exited unexpectedly with code {c}")),
                ),
                None => shared.set_terminal(
                    &mut st,
                    Terminal::Errored("mdb was killed by a signal".to_string()),
                ),
            }
        }
        Err(e) => {
            let message = format!("failed to wait for mdb: {e}");
            let mut st = shared.state.lock();
            shared.fail_pending(&mut st, Error::Io(e));
            shared.set_terminal(&mut st, Terminal::Errored(message));
        }
    }
}

/// Logs the debugger's stderr. Output before setup completes means the
/// debugger failed to initialize and is escalated to a fatal condition;
/// later output is diagnostic only.
async fn watch_stderr(shared: Arc<Shared>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if shared.setup_done.load(Ordering::SeqCst) {
            tracing::warn!(target: "mdb", "stderr: {line}");
        } else {
            let message = format!("stderr output before setup completed: {line}");
            tracing::error!(target: "mdb", "{message}");
            let mut st = shared.state.lock();
            shared.fail_pending(&mut st, Error::SetupFailed(message.clone()));
            shared.set_terminal(&mut st, Terminal::Errored(message));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    use super::*;
    use crate::transport::SENTINEL;

    /// Session wired to in-memory pipes, plus the fake debugger's ends.
    fn fake_session() -> (Session, DuplexStream, DuplexStream) {
        let (their_stdin, stdin_write) = duplex(4096);
        let (stdout_read, their_stdout) = duplex(4096);
        let (transport, body_rx) = SentinelTransport::new(stdin_write, stdout_read);
        let session = Session::connect(
            transport,
            body_rx,
            0,
            Target::Core(PathBuf::from("/nonexistent/core")),
            SessionConfig::attach(),
            None,
        );
        (session, their_stdin, their_stdout)
    }

    async fn read_frame(stdin: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 1024];
        let n = stdin.read(&mut buf).await.unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn command_round_trip() {
        let (session, mut their_stdin, mut their_stdout) = fake_session();

        let fake = tokio::spawn(async move {
            let frame = read_frame(&mut their_stdin).await;
            assert!(frame.starts_with("1+1=\n"));
            their_stdout.write_all(b"2\n").await.unwrap();
            their_stdout.write_all(SENTINEL.as_bytes()).await.unwrap();
            (their_stdin, their_stdout)
        });

        let body = session.run_cmd("1+1=\n").await.unwrap();
        assert_eq!(body, "2\n");
        let _ = fake.await.unwrap();
    }

    #[tokio::test]
    async fn responses_are_delivered_in_submission_order() {
        let (session, mut their_stdin, mut their_stdout) = fake_session();

        let fake = tokio::spawn(async move {
            for reply in ["one\n", "two\n", "three\n"] {
                let _ = read_frame(&mut their_stdin).await;
                their_stdout.write_all(reply.as_bytes()).await.unwrap();
                their_stdout.write_all(SENTINEL.as_bytes()).await.unwrap();
            }
            (their_stdin, their_stdout)
        });

        assert_eq!(session.run_cmd("::a\n").await.unwrap(), "one\n");
        assert_eq!(session.run_cmd("::b\n").await.unwrap(), "two\n");
        assert_eq!(session.run_cmd("::c\n").await.unwrap(), "three\n");
        let _ = fake.await.unwrap();
    }

    #[tokio::test]
    async fn second_command_while_pending_is_a_violation() {
        let (session, mut their_stdin, mut their_stdout) = fake_session();
        let session = Arc::new(session);

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run_cmd("::first\n").await })
        };

        // Let the first command register its pending slot.
        let frame = read_frame(&mut their_stdin).await;
        assert!(frame.starts_with("::first\n"));

        let err = session.run_cmd("::second\n").await.unwrap_err();
        assert!(err.is_protocol_violation(), "got {err:?}");

        // The violation must not disturb the in-flight command.
        their_stdout.write_all(b"done\n").await.unwrap();
        their_stdout.write_all(SENTINEL.as_bytes()).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "done\n");
    }

    #[tokio::test]
    async fn waiter_gets_terminated_when_output_stream_closes() {
        let (session, mut their_stdin, their_stdout) = fake_session();
        let session = Arc::new(session);

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run_cmd("::hang\n").await })
        };
        let _ = read_frame(&mut their_stdin).await;

        drop(their_stdout);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(
            matches!(err, Error::SessionTerminated { .. }),
            "got {err:?}"
        );

        // The session is terminal now; later commands fail fast.
        let err = session.run_cmd("::after\n").await.unwrap_err();
        assert!(matches!(err, Error::SessionClosed(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn waiter_gets_exit_code_when_child_dies_mid_command() {
        // A stand-in debugger that consumes one command line, then dies
        // with a distinctive code instead of answering.
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("read _line; exit 3")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        let (transport, body_rx) = SentinelTransport::new(stdin, stdout);
        let session = Session::connect(
            transport,
            body_rx,
            pid,
            Target::Pid(pid),
            SessionConfig::attach(),
            Some(child),
        );
        let mut status_rx = session.subscribe_status();

        let err = session.run_cmd("::status\n").await.unwrap_err();
        assert!(
            matches!(err, Error::SessionTerminated { code: Some(3) }),
            "got {err:?}"
        );

        let status = status_rx
            .wait_for(|status| !matches!(status, Status::Open))
            .await
            .unwrap()
            .clone();
        assert!(matches!(status, Status::Errored(_)), "got {status:?}");
    }

    #[tokio::test]
    async fn finish_after_fatal_error_is_a_violation() {
        let (session, mut their_stdin, their_stdout) = fake_session();
        let session = Arc::new(session);

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run_cmd("::hang\n").await })
        };
        let _ = read_frame(&mut their_stdin).await;
        drop(their_stdout);
        let _ = waiter.await.unwrap();

        let session = Arc::into_inner(session).unwrap();
        let err = session.finish().await.unwrap_err();
        assert!(err.is_protocol_violation(), "got {err:?}");
    }

    #[tokio::test]
    async fn self_attach_slot_is_exclusive() {
        let (session, _their_stdin, _their_stdout) = fake_session();

        let guard = session.begin_self_attach().unwrap();
        assert!(format!("{guard:?}").contains("SelfAttachGuard"));
        let err = session.begin_self_attach().unwrap_err();
        assert!(err.is_protocol_violation(), "got {err:?}");

        drop(guard);
        let _guard = session.begin_self_attach().unwrap();
    }

    #[tokio::test]
    async fn status_listener_sees_fatal_transition() {
        let (session, mut their_stdin, their_stdout) = fake_session();
        let session = Arc::new(session);
        let mut status_rx = session.subscribe_status();
        assert_eq!(*status_rx.borrow(), Status::Open);

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run_cmd("::hang\n").await })
        };
        let _ = read_frame(&mut their_stdin).await;
        drop(their_stdout);
        let _ = waiter.await.unwrap();

        let status = status_rx
            .wait_for(|status| !matches!(status, Status::Open))
            .await
            .unwrap()
            .clone();
        assert!(matches!(status, Status::Errored(_)), "got {status:?}");
    }
}
