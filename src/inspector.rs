// src/inspector.rs

//! Entry points for inspecting pickle files.
//!
//! [`PickleInspector::safe_view`] only decodes opcodes. [`PickleInspector::full_view`]
//! rebuilds the object graph first; reconstruction follows whatever the
//! stream says, so it belongs to trusted input only.

use crate::disasm::{self, Disassembly};
use crate::error::Result;
use crate::hints::{self, ScanOutcome};
use crate::loader;
use crate::reader::PickleSource;
use crate::summarizer::{self, BoundedNode, Limits, Scalar};
use log::{debug, info};
use std::fmt;
use std::path::Path;

/// The pickle inspector.
#[derive(Debug)]
pub struct PickleInspector;

impl PickleInspector {
    /// Scans a file for structure hints without reconstructing anything.
    ///
    /// Only I/O failures are errors. A damaged stream yields a partial
    /// report with [`ScanStatus::Stopped`](crate::ScanStatus::Stopped).
    pub fn safe_view<P: AsRef<Path>>(path: P) -> Result<ScanOutcome> {
        let source = PickleSource::open(path)?;
        Ok(Self::safe_view_source(&source))
    }

    /// [`safe_view`](Self::safe_view) over an already loaded source.
    pub fn safe_view_source(source: &PickleSource) -> ScanOutcome {
        hints::scan_hints(source.file_name(), source.bytes())
    }

    /// Reconstructs a file's object graph and summarizes it within `limits`.
    pub fn full_view<P: AsRef<Path>>(path: P, limits: &Limits) -> Result<BoundedNode> {
        let source = PickleSource::open(path)?;
        Self::full_view_bytes(source.bytes(), limits)
    }

    /// [`full_view`](Self::full_view) over an in-memory stream.
    pub fn full_view_bytes(bytes: &[u8], limits: &Limits) -> Result<BoundedNode> {
        let root = loader::load(bytes)?;
        debug!("reconstructed root of type {}", root.type_name());
        let node = summarizer::summarize(&root, 0, limits);
        info!(
            "summary depth {} (limit {}), widest level {} (limit {})",
            node.depth(),
            limits.max_depth,
            node.max_width(),
            limits.max_items
        );
        Ok(node)
    }

    /// Disassembles a file into a symbolic listing.
    pub fn disassemble<P: AsRef<Path>>(path: P) -> Result<Disassembly> {
        let source = PickleSource::open(path)?;
        Ok(disasm::disassemble(source.bytes()))
    }
}

fn scalar_text(scalar: &Scalar) -> String {
    match scalar {
        Scalar::Str(s) => format!("{s:?}"),
        other => other.to_key_text(),
    }
}

impl fmt::Display for BoundedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== PICKLE SUMMARY ===")?;
        self.fmt_recursive(f, "", "<root>", true)
    }
}

impl BoundedNode {
    fn fmt_recursive(
        &self,
        f: &mut fmt::Formatter<'_>,
        prefix: &str,
        label: &str,
        is_last: bool,
    ) -> fmt::Result {
        let connector = if is_last { "└── " } else { "├── " };
        let child_prefix = format!("{prefix}{}", if is_last { "    " } else { "│   " });
        let more = |truncated: bool| if truncated { " (truncated)" } else { "" };

        match self {
            Self::Scalar(s) => writeln!(f, "{prefix}{connector}{label}: {}", scalar_text(s)),
            Self::DepthTruncated => writeln!(f, "{prefix}{connector}{label}: …"),
            Self::Opaque {
                type_name,
                repr,
                truncated,
            } => writeln!(
                f,
                "{prefix}{connector}{label}: <{type_name}> {repr}{}",
                if *truncated { "…" } else { "" }
            ),
            Self::ArrayPreview {
                shape,
                element_type,
                sample,
            } => {
                let sample: Vec<String> = sample.iter().map(scalar_text).collect();
                writeln!(
                    f,
                    "{prefix}{connector}{label}: [ndarray {element_type} {shape:?}] {}",
                    sample.join(", ")
                )
            }
            Self::TablePreview {
                shape, sample_rows, ..
            } => {
                writeln!(
                    f,
                    "{prefix}{connector}{label}: [DataFrame {} x {}]",
                    shape.0, shape.1
                )?;
                for (i, (column, rows)) in sample_rows.iter().enumerate() {
                    let cells: Vec<String> = rows.iter().map(|(_, v)| scalar_text(v)).collect();
                    let last = i + 1 == sample_rows.len();
                    let c = if last { "└── " } else { "├── " };
                    writeln!(f, "{child_prefix}{c}{column}: {}", cells.join(", "))?;
                }
                Ok(())
            }
            Self::Sequence { items, truncated } => {
                writeln!(
                    f,
                    "{prefix}{connector}{label}: [{} items{}]",
                    items.len(),
                    more(*truncated)
                )?;
                for (i, item) in items.iter().enumerate() {
                    item.fmt_recursive(f, &child_prefix, &format!("[{i}]"), i + 1 == items.len())?;
                }
                Ok(())
            }
            Self::Mapping { entries, truncated } => {
                writeln!(
                    f,
                    "{prefix}{connector}{label}: {{{} entries{}}}",
                    entries.len(),
                    more(*truncated)
                )?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    value.fmt_recursive(f, &child_prefix, key, i + 1 == entries.len())?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InspectError;

    // {"a": 1, "b": [1, 2, 3]} at protocol 2.
    const NESTED: &[u8] = b"\x80\x02}q\x00(X\x01\x00\x00\x00aq\x01K\x01X\x01\x00\x00\x00bq\x02]q\x03(K\x01K\x02K\x03eu.";

    #[test]
    fn full_view_summarizes_nested_containers() -> Result<()> {
        let node = PickleInspector::full_view_bytes(NESTED, &Limits::default())?;
        let BoundedNode::Mapping { entries, truncated } = &node else {
            panic!("expected mapping, got {node:?}");
        };
        assert!(!truncated);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("a".to_string(), BoundedNode::Scalar(Scalar::Int(1))));
        assert_eq!(
            entries[1].1,
            BoundedNode::Sequence {
                items: (1..=3).map(|v| BoundedNode::Scalar(Scalar::Int(v))).collect(),
                truncated: false,
            }
        );
        Ok(())
    }

    #[test]
    fn full_view_rejects_broken_streams() {
        let err = PickleInspector::full_view_bytes(&NESTED[..10], &Limits::default()).unwrap_err();
        assert!(matches!(err, InspectError::Reconstruction(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn tree_rendering_lists_every_entry() -> Result<()> {
        let node = PickleInspector::full_view_bytes(NESTED, &Limits::default())?;
        let text = node.to_string();
        assert!(text.starts_with("=== PICKLE SUMMARY ==="));
        assert!(text.contains("└── <root>: {2 entries}"));
        assert!(text.contains("    ├── a: 1"));
        assert!(text.contains("    └── b: [3 items]"));
        assert!(text.contains("        └── [2]: 3"));
        Ok(())
    }

    #[test]
    fn safe_view_accepts_in_memory_sources() {
        let source = PickleSource::from_bytes("buffer.pkl", NESTED.to_vec());
        let outcome = PickleInspector::safe_view_source(&source);
        assert_eq!(outcome.report.file_name, "buffer.pkl");
        assert_eq!(outcome.report.size_bytes, source.size());
    }

    #[test]
    fn safe_view_reads_from_disk() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut file, NESTED)?;
        let outcome = PickleInspector::safe_view(file.path())?;
        assert!(outcome.status.is_complete());
        assert_eq!(outcome.report.size_bytes, NESTED.len() as u64);
        Ok(())
    }
}
