//! Symbolic disassembly listing, in the spirit of `pickletools.dis`.
//!
//! Like the hint scan this is purely lexical. Lines are indented one level per
//! open `MARK`; instructions that consume a mark close a level before they are
//! printed.

use crate::decoder::OpcodeDecoder;
use crate::error::InspectError;
use crate::format::Opcode;
use std::fmt;

const INDENT: &str = "    ";

/// One rendered instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct DisLine {
    /// Byte offset of the opcode.
    pub position: usize,
    /// Number of marks open when the instruction runs.
    pub depth: usize,
    /// The instruction.
    pub opcode: Opcode,
    /// Rendered argument.
    pub argument: Option<String>,
}

impl fmt::Display for DisLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>6}: {}{}",
            self.position,
            INDENT.repeat(self.depth),
            self.opcode.name()
        )?;
        if let Some(arg) = &self.argument {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A disassembled stream.
#[derive(Debug, Clone)]
pub struct Disassembly {
    /// Decoded instructions, up to `STOP` or the first fault.
    pub lines: Vec<DisLine>,
    /// Highest protocol any decoded opcode belongs to.
    pub highest_protocol: u8,
    /// The fault that ended decoding early, if any.
    pub fault: Option<InspectError>,
}

fn pops_mark(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::PopMark
            | Opcode::Tuple
            | Opcode::List
            | Opcode::Dict
            | Opcode::Appends
            | Opcode::SetItems
            | Opcode::AddItems
            | Opcode::FrozenSet
            | Opcode::Inst
            | Opcode::Obj
    )
}

/// Disassembles `bytes`. Decoding stops at the first fault, which is kept in
/// [`Disassembly::fault`] rather than returned as an error.
pub fn disassemble(bytes: &[u8]) -> Disassembly {
    let mut lines = Vec::new();
    let mut depth = 0usize;
    let mut highest_protocol = 0u8;
    let mut fault = None;

    for record in OpcodeDecoder::new(bytes) {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                fault = Some(e);
                break;
            }
        };
        if pops_mark(record.opcode) {
            depth = depth.saturating_sub(1);
        }
        highest_protocol = highest_protocol.max(record.opcode.protocol());
        lines.push(DisLine {
            position: record.position,
            depth,
            opcode: record.opcode,
            argument: record.argument.as_ref().map(ToString::to_string),
        });
        if record.opcode == Opcode::Mark {
            depth += 1;
        }
    }

    Disassembly {
        lines,
        highest_protocol,
        fault,
    }
}

impl fmt::Display for Disassembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        match &self.fault {
            Some(fault) => write!(f, "!! {fault}"),
            None => write!(f, "highest protocol among opcodes = {}", self.highest_protocol),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_indent_until_consumed() {
        // [1, 2] at protocol 2: PROTO, EMPTY_LIST, MARK, BININT1 x2, APPENDS, STOP.
        let dis = disassemble(b"\x80\x02](K\x01K\x02e.");
        let rendered: Vec<String> = dis.lines.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "     0: PROTO 2",
                "     2: EMPTY_LIST",
                "     3: MARK",
                "     4:     BININT1 1",
                "     6:     BININT1 2",
                "     8: APPENDS",
                "     9: STOP",
            ]
        );
        assert_eq!(dis.highest_protocol, 2);
        assert!(dis.fault.is_none());
    }

    #[test]
    fn faults_end_the_listing() {
        let dis = disassemble(b"\x80\x02X\x05\x00\x00\x00ab");
        assert_eq!(dis.lines.len(), 1);
        assert!(matches!(
            dis.fault,
            Some(InspectError::MalformedStream { position: 2, .. })
        ));
        assert!(dis.to_string().contains("!! Malformed Stream at byte 2"));
    }

    #[test]
    fn text_arguments_render_as_literals() {
        let dis = disassemble(b"X\x02\x00\x00\x00hi.");
        assert_eq!(dis.lines[0].to_string(), "     0: BINUNICODE 'hi'");
    }
}
