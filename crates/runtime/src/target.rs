//! Target descriptors for debugger sessions.

use std::fmt;
use std::path::PathBuf;

use tokio::process::Command;

/// What a session inspects: a saved core file or a running process.
///
/// Immutable once a session is opened against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A core file captured from a process.
    Core(PathBuf),
    /// A live process, attached by pid.
    Pid(u32),
}

impl Target {
    /// Appends this target's trailing mdb arguments to `cmd`.
    pub(crate) fn push_args(&self, cmd: &mut Command) {
        match self {
            Target::Core(path) => {
                cmd.arg(path);
            }
            Target::Pid(pid) => {
                cmd.arg("-p").arg(pid.to_string());
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Core(path) => write!(f, "core file {}", path.display()),
            Target::Pid(pid) => write!(f, "process {pid}"),
        }
    }
}
