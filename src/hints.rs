//! Safe-mode structure scanning.
//!
//! [`scan_hints`] makes one forward pass over the opcode stream and records
//! which container kinds the pickle builds, without building any of them.
//! Damaged input never fails the scan: decoding stops at the first fault and
//! the hints gathered so far are returned together with a
//! [`ScanStatus::Stopped`] marker.

use crate::decoder::OpcodeDecoder;
use crate::error::InspectError;
use crate::format::{Opcode, PROTO_MARKER};
use log::{debug, warn};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

/// Advisory attached to every safe-mode report.
pub const SAFE_MODE_NOTE: &str = "Safe mode: no deserialization performed.";

/// A coarse container kind observed in the stream.
///
/// Variants are declared in label order so that the derived `Ord` sorts
/// hints lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StructureHint {
    /// `DICT`, `EMPTY_DICT`, `SETITEM`, `SETITEMS`.
    Dict,
    /// `LIST`, `EMPTY_LIST`, `APPEND`, `APPENDS`.
    List,
    /// `EMPTY_TUPLE`.
    Tuple,
}

impl StructureHint {
    /// Classifies a single opcode. Opcodes outside the three groups give `None`.
    pub fn classify(opcode: Opcode) -> Option<Self> {
        match opcode {
            Opcode::Dict | Opcode::EmptyDict | Opcode::SetItem | Opcode::SetItems => {
                Some(Self::Dict)
            }
            Opcode::List | Opcode::EmptyList | Opcode::Append | Opcode::Appends => {
                Some(Self::List)
            }
            Opcode::EmptyTuple => Some(Self::Tuple),
            _ => None,
        }
    }

    /// Rendered label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Dict => "dict",
            Self::List => "list",
            Self::Tuple => "tuple",
        }
    }
}

impl fmt::Display for StructureHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for StructureHint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// Declared protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// The stream opens with `PROTO n`.
    Known(u8),
    /// No protocol marker (protocol 0 or 1 streams, or not a pickle at all).
    Unknown,
}

impl Protocol {
    /// Reads the marker from the first two bytes. Absence is not an error.
    pub fn detect(bytes: &[u8]) -> Self {
        match bytes {
            [PROTO_MARKER, version, ..] => Self::Known(*version),
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(v) => write!(f, "{v}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

impl Serialize for Protocol {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Known(v) => serializer.serialize_u8(*v),
            Self::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

/// Safe-mode metadata for one pickle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructureReport {
    /// Base name of the inspected file.
    #[serde(rename = "file")]
    pub file_name: String,
    /// Length of the stream in bytes.
    pub size_bytes: u64,
    /// Declared protocol version.
    pub protocol: Protocol,
    /// Container kinds seen before the scan ended, sorted.
    pub structure_hints: BTreeSet<StructureHint>,
    /// Always [`SAFE_MODE_NOTE`].
    pub note: String,
}

/// How a scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStatus {
    /// The decoder reached `STOP`.
    Complete,
    /// Decoding faulted; hints cover only the bytes before `position`.
    Stopped {
        /// Offset of the instruction that failed to decode.
        position: usize,
        /// Decoder diagnostic.
        reason: String,
    },
}

impl ScanStatus {
    /// True when the whole stream was scanned.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// A report plus the way the scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Everything gathered, complete or not.
    pub report: StructureReport,
    /// Whether the scan reached the end of the stream.
    pub status: ScanStatus,
}

/// Scans `bytes` for structure hints. Never fails.
pub fn scan_hints(file_name: &str, bytes: &[u8]) -> ScanOutcome {
    let protocol = Protocol::detect(bytes);
    let mut structure_hints = BTreeSet::new();
    let mut status = ScanStatus::Complete;
    let mut instructions = 0usize;

    for record in OpcodeDecoder::new(bytes) {
        match record {
            Ok(record) => {
                instructions += 1;
                if let Some(hint) = StructureHint::classify(record.opcode) {
                    structure_hints.insert(hint);
                }
            }
            Err(InspectError::MalformedStream { position, reason }) => {
                warn!("{file_name}: scan stopped at byte {position}: {reason}");
                status = ScanStatus::Stopped { position, reason };
                break;
            }
            Err(other) => {
                // The decoder only reports malformed input; keep the contract total anyway.
                warn!("{file_name}: scan stopped: {other}");
                status = ScanStatus::Stopped {
                    position: 0,
                    reason: other.to_string(),
                };
                break;
            }
        }
    }
    debug!(
        "{file_name}: scanned {instructions} instructions, protocol {protocol}, {} hint(s)",
        structure_hints.len()
    );

    ScanOutcome {
        report: StructureReport {
            file_name: file_name.to_string(),
            size_bytes: bytes.len() as u64,
            protocol,
            structure_hints,
            note: SAFE_MODE_NOTE.to_string(),
        },
        status,
    }
}

impl fmt::Display for StructureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== PICKLE STRUCTURE REPORT ===")?;
        writeln!(f, "File:     {}", self.file_name)?;
        writeln!(f, "Size:     {} bytes", self.size_bytes)?;
        writeln!(f, "Protocol: {}", self.protocol)?;
        let hints: Vec<&str> = self.structure_hints.iter().map(|h| h.label()).collect();
        writeln!(f, "Hints:    [{}]", hints.join(", "))?;
        write!(f, "\n{}", self.note)
    }
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.report)?;
        if let ScanStatus::Stopped { position, reason } = &self.status {
            write!(f, "\n(partial: stopped at byte {position}: {reason})")?;
        }
        Ok(())
    }
}
