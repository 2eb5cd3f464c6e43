use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Capturing a core file of the target process failed. Fatal to the
    /// run; never retried.
    #[error("core capture failed for pid {pid}: {message}")]
    Capture { pid: u32, message: String },

    /// Opening or driving the debugger session failed.
    #[error(transparent)]
    Session(#[from] mdb_runtime::Error),

    /// A caller-supplied step failed; later steps were skipped.
    #[error("step '{name}' failed")]
    Step {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The self-attach diagnostic sub-session failed to open or its
    /// command failed. The parent session is unaffected.
    #[error("self-attach diagnostic session failed")]
    Attach {
        #[source]
        source: mdb_runtime::Error,
    },

    /// Final wrap for a failed run: the core file is preserved for
    /// post-mortem inspection and its location named here.
    #[error("test run failed (keeping core file {})", .corefile.display())]
    Failed {
        corefile: PathBuf,
        #[source]
        source: Box<HarnessError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Path of the preserved core file, when this is a wrapped failure.
    pub fn preserved_corefile(&self) -> Option<&PathBuf> {
        match self {
            HarnessError::Failed { corefile, .. } => Some(corefile),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_wrap_names_the_core_file() {
        let err = HarnessError::Failed {
            corefile: PathBuf::from("/var/tmp/mdb-harness.1234"),
            source: Box::new(HarnessError::Capture {
                pid: 1234,
                message: "gcore exited with code 1".to_string(),
            }),
        };
        assert!(err.to_string().contains("/var/tmp/mdb-harness.1234"));
        assert_eq!(
            err.preserved_corefile(),
            Some(&PathBuf::from("/var/tmp/mdb-harness.1234"))
        );
    }
}
