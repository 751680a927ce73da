//! Error types shared by the delta codec and the apply engine.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::checksum::Checksum;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// open/read/write/rename/mkdir/stat failure
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Structurally invalid or truncated delta archive.
    #[error("corrupt or truncated delta {}: {reason}", .path.display())]
    CorruptDelta { path: PathBuf, reason: String },

    #[error("bad magic number in {}: not a valid delta", .0.display())]
    BadMagic(PathBuf),

    /// Recognized magic of a retired format revision.
    #[error("delta format of {} is unsupported (too old)", .0.display())]
    UnsupportedVersion(PathBuf),

    #[error("checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: Checksum,
        actual: Checksum,
    },

    /// The current file matches none of a patch-file's delta options.
    #[error("no matching delta for {} (current checksum {checksum})", .path.display())]
    NoMatchingDelta { path: PathBuf, checksum: Checksum },

    /// Decoding would overwrite the file it reads from.
    #[error("output {} is the from file; choose another output path", .0.display())]
    OutputIsInput(PathBuf),

    #[error("can't find {}", .0.display())]
    MissingFile(PathBuf),

    #[error("path exists and isn't a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("unable to write to {}", .0.display())]
    NotWritable(PathBuf),

    #[error("not enough disk space: {needed_kib} KiB needed, {available_kib} KiB free")]
    InsufficientSpace { needed_kib: u64, available_kib: u64 },

    #[error("script `{command}` failed: {detail}")]
    ScriptFailure { command: String, detail: String },

    /// Malformed textual patch description.
    #[error("{}:{line}: {reason}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Two builder operations claim the same destination.
    #[error("path {path} is already in patch: {reason}")]
    Conflict { path: String, reason: String },

    /// Every resident page is referenced and the ceiling is reached.
    #[error("page budget of {max_pages} pages exhausted with all pages in use")]
    PageBudget { max_pages: usize },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptDelta {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn parse(path: &Path, line: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            path: path.to_path_buf(),
            line,
            reason: reason.into(),
        }
    }

    pub fn conflict(path: &str, reason: impl Into<String>) -> Self {
        Error::Conflict {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Attach the offending path to a bare `io::Result`.
pub trait ResultExt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> ResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_names_path() {
        let err: Result<()> = Err(io::Error::new(io::ErrorKind::NotFound, "gone")).at(Path::new("a/b.txt"));
        let msg = err.unwrap_err().to_string();
        assert!(msg.contains("a/b.txt"), "{msg}");
        assert!(msg.contains("gone"), "{msg}");
    }

    #[test]
    fn test_space_error_message() {
        let err = Error::InsufficientSpace {
            needed_kib: 10,
            available_kib: 3,
        };
        assert_eq!(
            err.to_string(),
            "not enough disk space: 10 KiB needed, 3 KiB free"
        );
    }
}
