//! Error types for `zarf` operations.

use std::path::PathBuf;

/// Main error type for `zarf` operations.
///
/// The library performs no internal retries; every failure surfaces to
/// the caller through one of these variants. The single lenient path is
/// [`Cipher::try_decrypt`](crate::cipher::Cipher::try_decrypt), which
/// swallows [`Error::DecryptionFailed`] and returns `None`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid configuration fields
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O, permission, or persistence failure for a wrapped DEK
    #[error("keystore error: {0}")]
    Keystore(String),

    /// The KEK cannot decrypt the wrapped DEK
    #[error("key unwrap failed: {0}")]
    KeyUnwrapFailed(String),

    /// Referenced cipher version is not present in the registry
    #[error("unknown cipher version: {0}")]
    UnknownCipherVersion(u8),

    /// Magic mismatch, truncation, or flag/length inconsistency
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Padding, authentication tag, or cipher error during decryption
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// The underlying cipher rejected its input
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Operation on a closed reader or writer
    #[error("stream is closed")]
    StreamClosed,

    /// Key file is readable by group or world
    #[error("insecure permissions on {}: mode {mode:03o} (expected owner-only)", .path.display())]
    InsecurePermissions {
        /// Offending key file
        path: PathBuf,
        /// Permission bits found on the file
        mode: u32,
    },

    /// I/O failure on an underlying source or sink
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Converts this error into an [`std::io::Error`] for use inside
    /// `Read`/`Write` implementations.
    #[must_use]
    pub fn into_io(self) -> std::io::Error {
        match self {
            Self::Io(err) => err,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
