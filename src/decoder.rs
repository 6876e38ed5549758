//! The opcode decoder.
//!
//! [`OpcodeDecoder`] walks a pickle byte buffer and yields one [`OpRecord`] per
//! instruction, in stream order. The decode is purely lexical: it reads opcode
//! bytes and their literal arguments and never builds an application object.
//! Arguments borrow from the input buffer wherever the encoding allows it.

use std::borrow::Cow;
use std::fmt;

use crate::error::{InspectError, Result};
use crate::format::{ArgKind, Opcode};
use crate::value::{float_repr, quote_bytes, quote_str};

/// The decoded literal argument of an instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum OpArg<'a> {
    /// An integer that fits in 64 bits.
    Int(i64),
    /// An integer too wide for 64 bits, as decimal digits with an optional sign.
    BigInt(String),
    /// The `INT` spellings `01` and `00`.
    Bool(bool),
    /// A float literal.
    Float(f64),
    /// Decoded text.
    Text(Cow<'a, str>),
    /// Raw bytes.
    Bytes(Cow<'a, [u8]>),
    /// A `module name` pair, as carried by `GLOBAL` and `INST`.
    Global {
        /// Module path.
        module: Cow<'a, str>,
        /// Qualified name inside the module.
        name: Cow<'a, str>,
    },
}

impl OpArg<'_> {
    /// Returns the argument as an unsigned index or length, when it is one.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Self::Int(v) => usize::try_from(*v).ok(),
            Self::Bool(b) => Some(usize::from(*b)),
            _ => None,
        }
    }
}

impl fmt::Display for OpArg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::BigInt(digits) => f.write_str(digits),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Float(v) => f.write_str(&float_repr(*v)),
            Self::Text(s) => f.write_str(&quote_str(s)),
            Self::Bytes(b) => f.write_str(&quote_bytes(b)),
            Self::Global { module, name } => write!(f, "'{module} {name}'"),
        }
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct OpRecord<'a> {
    /// The instruction.
    pub opcode: Opcode,
    /// Its literal argument, if the opcode takes one.
    pub argument: Option<OpArg<'a>>,
    /// Byte offset of the opcode byte.
    pub position: usize,
}

/// Lazy decoder over a pickle byte buffer.
///
/// Iteration ends after `STOP`. Any fault is yielded once as
/// [`InspectError::MalformedStream`] and the iterator is fused afterwards.
#[derive(Debug, Clone)]
pub struct OpcodeDecoder<'a> {
    data: &'a [u8],
    cursor: usize,
    finished: bool,
}

impl<'a> OpcodeDecoder<'a> {
    /// Creates a decoder positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            cursor: 0,
            finished: false,
        }
    }

    /// Current byte offset.
    pub fn position(&self) -> usize {
        self.cursor
    }

    fn take(&mut self, start: usize, len: usize) -> Result<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                InspectError::malformed(
                    start,
                    format!(
                        "truncated argument: needed {len} bytes, {} remain",
                        self.data.len() - self.cursor
                    ),
                )
            })?;
        let slice = &self.data[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self, start: usize) -> Result<[u8; N]> {
        let bytes = self.take(start, N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(bytes);
        Ok(buf)
    }

    fn take_line(&mut self, start: usize) -> Result<&'a [u8]> {
        let rest = &self.data[self.cursor..];
        let newline = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| InspectError::malformed(start, "no newline found for text argument"))?;
        let line = &rest[..newline];
        self.cursor += newline + 1;
        Ok(line)
    }

    fn take_len(&mut self, start: usize, len: u64) -> Result<&'a [u8]> {
        let len = usize::try_from(len)
            .map_err(|_| InspectError::malformed(start, "length prefix exceeds address space"))?;
        self.take(start, len)
    }

    fn utf8(start: usize, bytes: &'a [u8]) -> Result<Cow<'a, str>> {
        match std::str::from_utf8(bytes) {
            Ok(text) => Ok(Cow::Borrowed(text)),
            Err(_) => surrogate_lenient(start, bytes).map(Cow::Owned),
        }
    }

    fn read_arg(&mut self, kind: ArgKind, start: usize) -> Result<Option<OpArg<'a>>> {
        let arg = match kind {
            ArgKind::None => return Ok(None),
            ArgKind::Uint1 => OpArg::Int(i64::from(self.take_array::<1>(start)?[0])),
            ArgKind::Uint2 => OpArg::Int(i64::from(u16::from_le_bytes(self.take_array(start)?))),
            ArgKind::Uint4 => OpArg::Int(i64::from(u32::from_le_bytes(self.take_array(start)?))),
            ArgKind::Uint8 => {
                let v = u64::from_le_bytes(self.take_array(start)?);
                i64::try_from(v).map_or_else(|_| OpArg::BigInt(v.to_string()), OpArg::Int)
            }
            ArgKind::Int4 => OpArg::Int(i64::from(i32::from_le_bytes(self.take_array(start)?))),
            ArgKind::Long1 => {
                let len = self.take_array::<1>(start)?[0];
                decode_long(self.take(start, usize::from(len))?)
            }
            ArgKind::Long4 => {
                let len = self.signed_len(start)?;
                decode_long(self.take_len(start, len)?)
            }
            ArgKind::Float8 => OpArg::Float(f64::from_be_bytes(self.take_array(start)?)),
            ArgKind::DecimalNlShort => {
                let line = self.take_line(start)?;
                match line {
                    b"00" => OpArg::Bool(false),
                    b"01" => OpArg::Bool(true),
                    _ => parse_decimal(start, line)?,
                }
            }
            ArgKind::DecimalNlLong => {
                let line = self.take_line(start)?;
                let digits = line.strip_suffix(b"L").unwrap_or(line);
                parse_decimal(start, digits)?
            }
            ArgKind::FloatNl => {
                let line = self.take_line(start)?;
                let text = Self::utf8(start, line)?;
                let value = text.trim().parse::<f64>().map_err(|_| {
                    InspectError::malformed(start, format!("invalid float literal {text:?}"))
                })?;
                OpArg::Float(value)
            }
            ArgKind::StringNl => {
                let line = self.take_line(start)?;
                OpArg::Bytes(Cow::Owned(unquote_string(start, line)?))
            }
            ArgKind::StringNlNoEscape => OpArg::Text(Self::utf8(start, self.take_line(start)?)?),
            ArgKind::StringNlNoEscapePair => {
                let module = Self::utf8(start, self.take_line(start)?)?;
                let name = Self::utf8(start, self.take_line(start)?)?;
                OpArg::Global { module, name }
            }
            ArgKind::UnicodeStringNl => {
                OpArg::Text(Cow::Owned(raw_unicode_unescape(start, self.take_line(start)?)?))
            }
            ArgKind::String1 | ArgKind::Bytes1 => {
                let len = self.take_array::<1>(start)?[0];
                OpArg::Bytes(Cow::Borrowed(self.take(start, usize::from(len))?))
            }
            ArgKind::String4 => {
                let len = self.signed_len(start)?;
                OpArg::Bytes(Cow::Borrowed(self.take_len(start, len)?))
            }
            ArgKind::Bytes4 => {
                let len = u32::from_le_bytes(self.take_array(start)?);
                OpArg::Bytes(Cow::Borrowed(self.take_len(start, u64::from(len))?))
            }
            ArgKind::Bytes8 | ArgKind::ByteArray8 => {
                let len = u64::from_le_bytes(self.take_array(start)?);
                OpArg::Bytes(Cow::Borrowed(self.take_len(start, len)?))
            }
            ArgKind::UnicodeString1 => {
                let len = self.take_array::<1>(start)?[0];
                let bytes = self.take(start, usize::from(len))?;
                OpArg::Text(Self::utf8(start, bytes)?)
            }
            ArgKind::UnicodeString4 => {
                let len = u32::from_le_bytes(self.take_array(start)?);
                let bytes = self.take_len(start, u64::from(len))?;
                OpArg::Text(Self::utf8(start, bytes)?)
            }
            ArgKind::UnicodeString8 => {
                let len = u64::from_le_bytes(self.take_array(start)?);
                let bytes = self.take_len(start, len)?;
                OpArg::Text(Self::utf8(start, bytes)?)
            }
        };
        Ok(Some(arg))
    }

    fn signed_len(&mut self, start: usize) -> Result<u64> {
        let len = i32::from_le_bytes(self.take_array(start)?);
        u64::try_from(len)
            .map_err(|_| InspectError::malformed(start, format!("negative length prefix {len}")))
    }

    fn decode_next(&mut self) -> Result<OpRecord<'a>> {
        let position = self.cursor;
        let byte = *self.data.get(position).ok_or_else(|| {
            InspectError::malformed(position, "pickle exhausted before seeing STOP")
        })?;
        let opcode = Opcode::from_byte(byte).ok_or_else(|| {
            InspectError::malformed(position, format!("unknown opcode byte 0x{byte:02x}"))
        })?;
        self.cursor += 1;
        let argument = self.read_arg(opcode.arg_kind(), position)?;
        Ok(OpRecord {
            opcode,
            argument,
            position,
        })
    }
}

impl<'a> Iterator for OpcodeDecoder<'a> {
    type Item = Result<OpRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let item = self.decode_next();
        match &item {
            Ok(record) if record.opcode == Opcode::Stop => self.finished = true,
            Ok(_) => {}
            Err(_) => self.finished = true,
        }
        Some(item)
    }
}

impl std::iter::FusedIterator for OpcodeDecoder<'_> {}

fn parse_decimal<'a>(start: usize, digits: &[u8]) -> Result<OpArg<'a>> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| InspectError::malformed(start, "non-ASCII integer literal"))?;
    let text = text.trim();
    if let Ok(v) = text.parse::<i64>() {
        return Ok(OpArg::Int(v));
    }
    let unsigned = text.strip_prefix(['-', '+']).unwrap_or(text);
    if !unsigned.is_empty() && unsigned.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(OpArg::BigInt(text.trim_start_matches('+').to_string()));
    }
    Err(InspectError::malformed(
        start,
        format!("invalid integer literal {text:?}"),
    ))
}

/// Decodes a little-endian two's complement integer of any width.
pub(crate) fn decode_long<'a>(bytes: &[u8]) -> OpArg<'a> {
    if bytes.is_empty() {
        return OpArg::Int(0);
    }
    let negative = bytes[bytes.len() - 1] & 0x80 != 0;
    if bytes.len() <= 8 {
        let fill = if negative { 0xff } else { 0x00 };
        let mut buf = [fill; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        return OpArg::Int(i64::from_le_bytes(buf));
    }

    // Magnitude as little-endian base-256 digits.
    let mut magnitude: Vec<u8> = bytes.to_vec();
    if negative {
        let mut carry = true;
        for byte in magnitude.iter_mut() {
            *byte = !*byte;
            if carry {
                let (sum, overflow) = byte.overflowing_add(1);
                *byte = sum;
                carry = overflow;
            }
        }
    }
    while magnitude.len() > 1 && magnitude[magnitude.len() - 1] == 0 {
        magnitude.pop();
    }

    // Repeated division by 10^9, most significant digit first.
    let mut chunks = Vec::new();
    let mut digits: Vec<u8> = magnitude.into_iter().rev().collect();
    while !(digits.is_empty() || digits.iter().all(|d| *d == 0)) {
        let mut remainder: u64 = 0;
        let mut quotient = Vec::with_capacity(digits.len());
        for d in &digits {
            let acc = (remainder << 8) | u64::from(*d);
            let q = acc / 1_000_000_000;
            remainder = acc % 1_000_000_000;
            if !(quotient.is_empty() && q == 0) {
                quotient.push(q as u8);
            }
        }
        chunks.push(remainder);
        digits = quotient;
    }

    let mut text = String::new();
    if negative {
        text.push('-');
    }
    match chunks.split_last() {
        Some((head, rest)) => {
            text.push_str(&head.to_string());
            for chunk in rest.iter().rev() {
                text.push_str(&format!("{chunk:09}"));
            }
        }
        None => text.push('0'),
    }
    OpArg::BigInt(text)
}

/// Strips the quotes of a protocol 0 `STRING` literal and resolves its escapes.
fn unquote_string(start: usize, line: &[u8]) -> Result<Vec<u8>> {
    let inner = match line {
        [q, inner @ .., last] if (*q == b'\'' || *q == b'"') && q == last => inner,
        _ => {
            return Err(InspectError::malformed(
                start,
                "STRING argument is not a quoted literal",
            ))
        }
    };

    let mut out = Vec::with_capacity(inner.len());
    let mut iter = inner.iter().copied().peekable();
    while let Some(b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b't') => out.push(b'\t'),
            Some(b'r') => out.push(b'\r'),
            Some(b'a') => out.push(0x07),
            Some(b'b') => out.push(0x08),
            Some(b'f') => out.push(0x0c),
            Some(b'v') => out.push(0x0b),
            Some(b'x') => {
                let hi = iter.next();
                let lo = iter.next();
                let value = hi
                    .zip(lo)
                    .and_then(|(h, l)| Some(hex_val(h)? << 4 | hex_val(l)?))
                    .ok_or_else(|| InspectError::malformed(start, "invalid \\x escape"))?;
                out.push(value);
            }
            Some(d @ b'0'..=b'7') => {
                let mut value = u32::from(d - b'0');
                for _ in 0..2 {
                    match iter.peek() {
                        Some(n @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(n - b'0');
                            iter.next();
                        }
                        _ => break,
                    }
                }
                out.push((value & 0xff) as u8);
            }
            Some(other) => {
                if !matches!(other, b'\\' | b'\'' | b'"') {
                    out.push(b'\\');
                }
                out.push(other);
            }
            None => out.push(b'\\'),
        }
    }
    Ok(out)
}

/// Decodes UTF-8 that may carry lone surrogates (CPython writes them with
/// `surrogatepass`). Each encoded surrogate becomes U+FFFD; any other invalid
/// sequence is an error.
fn surrogate_lenient(start: usize, mut bytes: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(bytes.len());
    loop {
        match std::str::from_utf8(bytes) {
            Ok(text) => {
                out.push_str(text);
                return Ok(out);
            }
            Err(e) => {
                let (valid, rest) = bytes.split_at(e.valid_up_to());
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                match rest {
                    [0xED, 0xA0..=0xBF, 0x80..=0xBF, ..] => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        bytes = &rest[3..];
                    }
                    _ => {
                        return Err(InspectError::malformed(
                            start,
                            format!("invalid UTF-8 text: {e}"),
                        ))
                    }
                }
            }
        }
    }
}

/// Decodes protocol 0 `UNICODE` text: latin-1 bytes plus `\uXXXX` and `\UXXXXXXXX` escapes.
fn raw_unicode_unescape(start: usize, line: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        if b == b'\\' && i + 1 < line.len() && matches!(line[i + 1], b'u' | b'U') {
            let width = if line[i + 1] == b'u' { 4 } else { 8 };
            let digits = line
                .get(i + 2..i + 2 + width)
                .ok_or_else(|| InspectError::malformed(start, "truncated \\u escape"))?;
            let code = digits.iter().try_fold(0u32, |acc, d| {
                hex_val(*d).map(|v| (acc << 4) | u32::from(v))
            });
            let ch = code
                .and_then(|c| match c {
                    0xD800..=0xDFFF => Some(char::REPLACEMENT_CHARACTER),
                    c => char::from_u32(c),
                })
                .ok_or_else(|| InspectError::malformed(start, "invalid \\u escape"))?;
            out.push(ch);
            i += 2 + width;
        } else {
            out.push(char::from(b));
            i += 1;
        }
    }
    Ok(out)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(data: &[u8]) -> Vec<Opcode> {
        OpcodeDecoder::new(data)
            .map(|r| r.map(|rec| rec.opcode))
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn decodes_protocol_two_stream() {
        // pickle.dumps([1, 'a'], protocol=2)
        let data = b"\x80\x02]q\x00(K\x01X\x01\x00\x00\x00aq\x01e.";
        assert_eq!(
            ops(data),
            vec![
                Opcode::Proto,
                Opcode::EmptyList,
                Opcode::BinPut,
                Opcode::Mark,
                Opcode::BinInt1,
                Opcode::BinUnicode,
                Opcode::BinPut,
                Opcode::Appends,
                Opcode::Stop,
            ]
        );

        let records: Vec<_> = OpcodeDecoder::new(data).collect::<Result<_>>().unwrap();
        assert_eq!(records[0].argument, Some(OpArg::Int(2)));
        assert_eq!(records[5].argument, Some(OpArg::Text(Cow::Borrowed("a"))));
        assert_eq!(records[5].position, 8);
    }

    #[test]
    fn decodes_protocol_zero_text_arguments() {
        let data = b"(lp0\nI01\naS'it\\'s'\np1\naF1.5\naL12345678901234567890123L\na.";
        let args: Vec<_> = OpcodeDecoder::new(data)
            .filter_map(|r| r.unwrap().argument)
            .collect();
        assert_eq!(args[0], OpArg::Int(0));
        assert_eq!(args[1], OpArg::Bool(true));
        assert_eq!(args[2], OpArg::Bytes(Cow::Owned(b"it's".to_vec())));
        assert_eq!(args[4], OpArg::Float(1.5));
        assert_eq!(args[5], OpArg::BigInt("12345678901234567890123".into()));
    }

    #[test]
    fn long1_handles_sign_and_width() {
        assert_eq!(decode_long(&[0xff]), OpArg::Int(-1));
        assert_eq!(decode_long(&[0x00, 0x01]), OpArg::Int(256));
        // 2**64
        assert_eq!(
            decode_long(&[0, 0, 0, 0, 0, 0, 0, 0, 1]),
            OpArg::BigInt("18446744073709551616".into())
        );
        // -(2**64)
        assert_eq!(
            decode_long(&[0, 0, 0, 0, 0, 0, 0, 0, 0xff]),
            OpArg::BigInt("-18446744073709551616".into())
        );
    }

    #[test]
    fn truncated_argument_is_malformed_and_fuses() {
        let data = b"\x80\x04X\x10\x00\x00\x00abc";
        let mut decoder = OpcodeDecoder::new(data);
        assert!(decoder.next().unwrap().is_ok());
        match decoder.next() {
            Some(Err(InspectError::MalformedStream { position, .. })) => assert_eq!(position, 2),
            other => panic!("expected malformed stream, got {other:?}"),
        }
        assert!(decoder.next().is_none());
    }

    #[test]
    fn missing_stop_is_malformed() {
        let results: Vec<_> = OpcodeDecoder::new(b"]").collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[1],
            Err(InspectError::MalformedStream { position: 1, .. })
        ));
    }

    #[test]
    fn unknown_opcode_is_malformed() {
        let results: Vec<_> = OpcodeDecoder::new(b"\xff.").collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn decoding_stops_after_stop() {
        assert_eq!(ops(b"N.garbage"), vec![Opcode::None, Opcode::Stop]);
    }

    #[test]
    fn raw_unicode_escapes_are_resolved() {
        let data = b"V\\u00e9t\\u00e9\n.";
        let first = OpcodeDecoder::new(data).next().unwrap().unwrap();
        assert_eq!(first.argument, Some(OpArg::Text(Cow::Owned("été".into()))));
    }

    #[test]
    fn encoded_surrogates_decode_to_replacement_characters() {
        // pickle.dumps(["ok", "\ud800"], 2)
        let data = b"\x80\x02]q\x00(X\x02\x00\x00\x00okq\x01X\x03\x00\x00\x00\xed\xa0\x80q\x02e.";
        let texts: Vec<_> = OpcodeDecoder::new(data)
            .filter_map(|r| match r.unwrap().argument {
                Some(OpArg::Text(t)) => Some(t.into_owned()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["ok".to_string(), "\u{FFFD}".to_string()]);

        let escaped = OpcodeDecoder::new(b"Va\\ud800\n.").next().unwrap().unwrap();
        assert_eq!(escaped.argument, Some(OpArg::Text(Cow::Owned("a\u{FFFD}".into()))));
    }

    #[test]
    fn other_invalid_utf8_is_still_malformed() {
        let results: Vec<_> = OpcodeDecoder::new(b"X\x02\x00\x00\x00\xff\xfe.").collect();
        assert!(matches!(
            results[0],
            Err(InspectError::MalformedStream { position: 0, .. })
        ));
    }
}
