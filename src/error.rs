//! Centralized error handling for Pickler.
//!
//! The library never panics on hostile input: every failure condition is
//! represented as an [`InspectError`] and propagated through [`Result`].
//!
//! ## Error Categories
//!
//! - **I/O Errors** ([`InspectError::Io`]): the file is missing or unreadable. Always fatal.
//! - **Malformed Streams** ([`InspectError::MalformedStream`]): the opcode decoder hit a
//!   truncated or corrupt instruction. Safe mode absorbs this into a partial report.
//! - **Reconstruction Errors** ([`InspectError::Reconstruction`]): the loader could not
//!   materialize the object graph in full mode. Fatal; safe mode exists to avoid this path.
//!
//! ## Usage Patterns
//!
//! ```rust
//! use pickler::{InspectError, PickleInspector};
//!
//! match PickleInspector::safe_view("does-not-exist.pkl") {
//!     Ok(outcome) => println!("{}", outcome.report),
//!     Err(InspectError::Io(e)) => eprintln!("I/O error: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;

/// A specialized `Result` type for Pickler operations.
pub type Result<T> = std::result::Result<T, InspectError>;

/// The master error enum covering all failure domains in Pickler.
///
/// This type is `Clone` so that a fault recorded by a partial scan can be kept
/// alongside the partial result. I/O errors are wrapped in `Arc` for that reason.
#[derive(Debug, Clone)]
pub enum InspectError {
    /// Low-level I/O failure (file not found, permission denied, etc.).
    Io(Arc<io::Error>),

    /// The byte stream is truncated or corrupt at `position`.
    ///
    /// ## Common Causes
    ///
    /// - File cut short in the middle of an instruction or argument
    /// - Unknown opcode byte
    /// - Argument that does not decode (bad integer literal, invalid UTF-8)
    /// - Stream exhausted before the `STOP` instruction
    MalformedStream {
        /// Byte offset of the instruction that failed to decode.
        position: usize,
        /// Human readable description of the fault.
        reason: String,
    },

    /// The loader could not rebuild the object graph.
    ///
    /// Wraps stack underflows, missing marks, memo misses and unsupported
    /// instructions, as well as any [`InspectError::MalformedStream`] hit while loading.
    Reconstruction(String),
}

impl InspectError {
    pub(crate) fn malformed(position: usize, reason: impl Into<String>) -> Self {
        Self::MalformedStream {
            position,
            reason: reason.into(),
        }
    }

    /// Returns true when safe mode may recover from this error with a partial result.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MalformedStream { .. })
    }
}

impl fmt::Display for InspectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O Error: {e}"),
            Self::MalformedStream { position, reason } => {
                write!(f, "Malformed Stream at byte {position}: {reason}")
            }
            Self::Reconstruction(s) => write!(f, "Reconstruction Error: {s}"),
        }
    }
}

impl std::error::Error for InspectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for InspectError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn io_errors_keep_their_source() {
        let err: InspectError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(err.source().is_some());
        assert!(!err.is_recoverable());
        assert!(err.to_string().starts_with("I/O Error"));
    }

    #[test]
    fn malformed_stream_is_recoverable() {
        let err = InspectError::malformed(12, "truncated argument");
        assert!(err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "Malformed Stream at byte 12: truncated argument"
        );
    }
}
