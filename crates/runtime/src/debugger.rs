//! Debugger executable and extension-module resolution.
//!
//! Locates the mdb binary and the mdb_v8 dmod to load into it. Runtime
//! environment variables take precedence so CI and development trees can
//! point at freshly built artifacts.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Locate the mdb executable.
///
/// Search order:
/// 1. `MDB_EXE` environment variable (runtime override)
/// 2. `mdb` on `PATH`
///
/// # Errors
///
/// Returns [`Error::DebuggerNotFound`] when neither resolves to an
/// existing binary.
pub fn find_debugger() -> Result<PathBuf> {
    if let Ok(exe) = std::env::var("MDB_EXE") {
        let path = PathBuf::from(exe);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            target: "mdb",
            path = %path.display(),
            "MDB_EXE is set but does not exist; falling back to PATH"
        );
    }

    which::which("mdb").map_err(|_| Error::DebuggerNotFound)
}

/// Resolve the path of the mdb_v8 dmod to `::load` into the debugger.
///
/// Search order:
/// 1. `MDB_V8_DMOD` environment variable (runtime override)
/// 2. `build/<arch>/mdb_v8.so` relative to the working directory, where
///    `<arch>` is `amd64` on x86_64 and `ia32` on 32-bit x86
///
/// # Errors
///
/// Returns [`Error::ExtensionNotFound`] when the resolved path does not
/// exist.
pub fn extension_path() -> Result<PathBuf> {
    let path = match std::env::var("MDB_V8_DMOD") {
        Ok(dmod) if !dmod.is_empty() => PathBuf::from(dmod),
        _ => PathBuf::from("build").join(host_arch()).join("mdb_v8.so"),
    };

    if path.exists() {
        Ok(path)
    } else {
        Err(Error::ExtensionNotFound(path))
    }
}

/// Optional module search-path override for the debugger.
///
/// When `MDB_LIBRARY_PATH` is set and non-empty it is passed to mdb as
/// `-L <path>`; otherwise no override is passed.
pub fn library_path() -> Option<String> {
    match std::env::var("MDB_LIBRARY_PATH") {
        Ok(path) if !path.is_empty() => Some(path),
        _ => None,
    }
}

fn host_arch() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "amd64"
    } else {
        "ia32"
    }
}
