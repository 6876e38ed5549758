//! # Pickler
//!
//! An inspector for Python pickle streams that can look at untrusted data
//! without running it.
//!
//! ## Overview
//!
//! A pickle is a program for a small stack machine: opcodes push literals,
//! build containers, import callables and call them. Loading a pickle the
//! usual way executes that program, which is why opening a pickle from an
//! unknown source is dangerous. Pickler offers two ways to look inside:
//!
//! *   **Safe mode** decodes the opcode stream lexically and reports the
//!     protocol version, the size and coarse container hints (`dict`, `list`,
//!     `tuple`). Nothing is constructed and damaged files still yield a
//!     partial report.
//! *   **Full mode** replays the stream on a symbolic virtual machine that
//!     never imports or calls anything, then condenses the resulting object
//!     graph into a depth- and width-bounded tree that is always safe to
//!     render as JSON.
//!
//! ## Architecture
//!
//! ```text
//! bytes ──► OpcodeDecoder ──► scan_hints ──► StructureReport      (safe)
//! bytes ──► Unpickler ──► Value graph ──► summarize ──► BoundedNode (full)
//! ```
//!
//! ### Decoder
//!
//! [`decoder::OpcodeDecoder`] is a lazy iterator over every instruction of
//! protocols 0 to 5, yielding its opcode, literal argument and offset. The
//! opcode table lives in [`format`].
//!
//! ### Loader
//!
//! [`loader::Unpickler`] materializes the graph as [`value::Value`] nodes.
//! Containers are reference counted, so memoized and self-referencing
//! structures keep their sharing. Classes are symbolic [`value::GlobalRef`]s
//! and constructed objects are generic [`value::Instance`] records.
//!
//! ### Summarizer
//!
//! [`summarizer::summarize`] classifies each value with a fixed, ordered list
//! of checks and enforces [`Limits`] at every level. Depth is the only cycle
//! guard, which is enough because every step descends one level.
//!
//! With the `numpy` and `pandas` features (both on by default), reconstructed
//! numpy arrays and pandas DataFrames get compact previews instead of an
//! opaque repr.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pickler::{Limits, PickleInspector};
//!
//! # fn main() -> pickler::Result<()> {
//! let outcome = PickleInspector::safe_view("model.pkl")?;
//! println!("{}", outcome.report);
//!
//! // Only for trusted files.
//! let summary = PickleInspector::full_view("model.pkl", &Limits::default())?;
//! println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
//! # Ok(())
//! # }
//! ```
//!
//! ### Safety and Error Handling
//!
//! * **Encapsulated Unsafe:** the only `unsafe` block maps input files in [`reader`].
//! * **No Panics:** no `unwrap()` or `panic!()` in the library (enforced by clippy lints).
//! * **Comprehensive Errors:** all failures are an [`InspectError`].

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![warn(missing_docs)]

// --- PUBLIC API MODULES ---
pub mod decoder;
pub mod disasm;
pub mod error;
pub mod format;
pub mod hints;
pub mod inspector;
pub mod loader;
pub mod reader;
pub mod summarizer;
pub mod value;

// --- OPTIONAL RECOGNIZERS ---
#[cfg(feature = "pandas")]
pub mod frame;
#[cfg(feature = "numpy")]
pub mod numeric;

// --- RE-EXPORTS ---

pub use disasm::{disassemble, Disassembly};
pub use error::{InspectError, Result};
pub use hints::{scan_hints, Protocol, ScanOutcome, ScanStatus, StructureHint, StructureReport};
pub use inspector::PickleInspector;
pub use reader::PickleSource;
pub use summarizer::{summarize, BoundedNode, Limits, Scalar};

/// Constants used throughout the library.
pub mod constants {
    pub use crate::format::{HIGHEST_PROTOCOL, PROTO_MARKER};
    pub use crate::hints::SAFE_MODE_NOTE;
    pub use crate::summarizer::{DEPTH_SENTINEL, OPAQUE_REPR_CHARS};
}
