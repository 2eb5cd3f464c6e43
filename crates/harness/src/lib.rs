//! Core-file test harness for mdb_v8.
//!
//! Standalone tests follow one shape: build interesting structures in
//! memory, capture a core file of the current process with gcore(1),
//! open an mdb session against the core with the mdb_v8 dmod loaded,
//! pull those structures back out through debugger commands, and verify
//! the debugger interpreted them correctly.
//!
//! This crate owns that lifecycle:
//!
//! - [`TestRun`] captures the core, opens the session, runs the caller's
//!   [`Step`]s strictly in order, and finalizes: a successful run
//!   deletes the core file, a failed run preserves it and names it in
//!   the error.
//! - An exit guard aborts the host process if it exits cleanly with a
//!   run still unfinalized - the signature of a test that forgot to
//!   complete its session. A run that already surfaced a failure exits
//!   with its own error instead.
//! - [`check_for_leaks`] opens a nested session against the debugger's
//!   own pid to run a leak check without disturbing the parent session.
//!
//! Session mechanics (sentinel framing, the single-slot command gate,
//! terminal-state tracking) live in the `mdb-runtime` crate and are
//! re-exported here.

pub mod capture;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod logging;
pub mod selfcheck;

pub use error::{HarnessError, Result};
pub use guard::{ExitGuard, armed_sessions, mark_failure};
pub use lifecycle::{Step, TestRun, run_steps, step};
pub use logging::init_logging;
pub use selfcheck::check_for_leaks;

pub use mdb_runtime::{Error as RuntimeError, Session, SessionConfig, Status, Target};
