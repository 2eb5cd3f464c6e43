//! Sentinel transport over the debugger's stdio pipes.
//!
//! MDB has no native framing: it writes free-form text to stdout with
//! nothing to mark the end of a command's output. The transport imposes
//! framing by appending a shell-escape echo of a fixed sentinel string
//! after every command it sends. Everything that arrives on stdout before
//! the sentinel is the completed response body for the oldest command;
//! everything after it belongs to the next one.
//!
//! The receiver must re-scan after every append: two fast commands can
//! complete in a single read, and a sentinel can arrive split across
//! reads.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Marker echoed by the debugger after every command. The value must be
/// vanishingly unlikely to appear in real debugger output; if it ever
/// does, framing breaks. Accepted risk of text-based framing.
pub const SENTINEL: &str = "MDB_SENTINEL\n";

/// Shell-escape command that makes mdb emit [`SENTINEL`] on stdout.
pub const SENTINEL_ECHO: &str = "!echo MDB_SENTINEL\n";

/// Sentinel-framed transport over a pair of byte streams.
///
/// Generic over the stream types so tests can substitute
/// `tokio::io::duplex` pipes for a real child process.
pub struct SentinelTransport<W, R> {
    sender: SentinelSender<W>,
    receiver: SentinelReceiver<R>,
}

impl<W, R> SentinelTransport<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    /// Creates a transport writing commands to `stdin` and framing
    /// responses out of `stdout`. Completed response bodies arrive on the
    /// returned channel once [`SentinelReceiver::run`] is driving.
    pub fn new(stdin: W, stdout: R) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let transport = Self {
            sender: SentinelSender { stdin },
            receiver: SentinelReceiver {
                stdout,
                body_tx,
                buffer: Vec::new(),
            },
        };
        (transport, body_rx)
    }

    /// Splits the transport into its sender and receiver halves.
    pub fn into_parts(self) -> (SentinelSender<W>, SentinelReceiver<R>) {
        (self.sender, self.receiver)
    }
}

/// Write half: sends commands with the sentinel echo appended.
pub struct SentinelSender<W> {
    stdin: W,
}

impl<W: AsyncWrite + Unpin + Send> SentinelSender<W> {
    /// Sends one command followed by the sentinel echo in a single write.
    ///
    /// Every command must reach the debugger newline-terminated; a
    /// missing terminator is appended rather than rejected.
    pub async fn send(&mut self, command: &str) -> Result<()> {
        let mut frame = String::with_capacity(command.len() + 1 + SENTINEL_ECHO.len());
        frame.push_str(command);
        if !frame.ends_with('\n') {
            frame.push('\n');
        }
        frame.push_str(SENTINEL_ECHO);

        self.stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| Error::TransportError(format!("failed to write command: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| Error::TransportError(format!("failed to flush command: {e}")))?;
        Ok(())
    }

    /// Closes the debugger's stdin, signalling it to exit.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stdin
            .shutdown()
            .await
            .map_err(|e| Error::TransportError(format!("failed to close stdin: {e}")))?;
        Ok(())
    }
}

/// Read half: accumulates stdout chunks and extracts framed bodies.
pub struct SentinelReceiver<R> {
    stdout: R,
    body_tx: mpsc::UnboundedSender<String>,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> SentinelReceiver<R> {
    /// Reads stdout until EOF, emitting each completed response body on
    /// the body channel. Returns `Ok(())` on EOF; the session layer
    /// decides whether EOF was expected.
    pub async fn run(mut self) -> Result<()> {
        let mut chunk = [0u8; 8192];
        loop {
            let n = self
                .stdout
                .read(&mut chunk)
                .await
                .map_err(|e| Error::TransportError(format!("failed to read stdout: {e}")))?;
            if n == 0 {
                return Ok(());
            }
            self.buffer.extend_from_slice(&chunk[..n]);
            if !self.drain_bodies() {
                // Nobody is listening for bodies any more.
                return Ok(());
            }
        }
    }

    /// Extracts every complete body currently in the buffer. Returns
    /// false once the body channel is closed.
    fn drain_bodies(&mut self) -> bool {
        while let Some(at) = find(&self.buffer, SENTINEL.as_bytes()) {
            let body = String::from_utf8_lossy(&self.buffer[..at]).into_owned();
            self.buffer.drain(..at + SENTINEL.len());
            tracing::trace!(target: "mdb", bytes = body.len(), "framed response body");
            if self.body_tx.send(body).is_err() {
                return false;
            }
        }
        true
    }
}

/// First position of `needle` in `haystack`, if any.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
