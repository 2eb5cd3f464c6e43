//! MDB runtime - debugger lifecycle, sentinel transport, and session
//! protocol.
//!
//! This crate provides the low-level machinery for driving an
//! interactive mdb process from test code:
//!
//! - **Debugger resolution**: locating the mdb binary and the mdb_v8
//!   dmod to load into it
//! - **Transport**: sentinel-framed command/response over stdio pipes
//! - **Session**: single-slot command queue, setup protocol, and
//!   terminal-state tracking for one debugger process
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ mdb-harness  │  Lifecycle: capture, steps, finalize
//! └──────┬───────┘
//!        │ run_cmd / finish
//! ┌──────▼───────┐
//! │ mdb-runtime  │  This crate
//! │  ┌─────────┐ │
//! │  │ Session │ │  Single-slot command gate
//! │  └─────────┘ │
//! │  ┌─────────┐ │
//! │  │ Trans   │ │  Sentinel framing over pipes
//! │  └─────────┘ │
//! │  ┌─────────┐ │
//! │  │ Debugger│ │  Process and dmod resolution
//! │  └─────────┘ │
//! └──────────────┘
//! ```
//!
//! mdb prints free-form text with no framing of its own; every command
//! the session sends is followed by a shell-escape echo of a fixed
//! sentinel, and the transport cuts response bodies at each sentinel
//! occurrence. Responses therefore come back strictly in submission
//! order - there is no request correlation, only the invariant that at
//! most one command is ever outstanding.

pub mod debugger;
pub mod error;
pub mod session;
pub mod target;
pub mod transport;

pub use debugger::{extension_path, find_debugger, library_path};
pub use error::{Error, Result};
pub use session::{SelfAttachGuard, Session, SessionConfig, Status};
pub use target::Target;
pub use transport::{SENTINEL, SENTINEL_ECHO, SentinelReceiver, SentinelSender, SentinelTransport};
