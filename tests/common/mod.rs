#![allow(dead_code)]

use std::path::{Path, PathBuf};

/// Writes protocol 2 pickles opcode by opcode.
#[derive(Debug, Default)]
pub struct PickleBuilder {
    bytes: Vec<u8>,
    memo: u32,
}

impl PickleBuilder {
    pub fn new() -> Self {
        let mut builder = Self::default();
        builder.bytes.extend_from_slice(&[0x80, 0x02]);
        builder
    }

    /// A stream without a `PROTO` marker (protocol 0/1 style).
    pub fn unversioned() -> Self {
        Self::default()
    }

    fn op(mut self, code: u8) -> Self {
        self.bytes.push(code);
        self
    }

    pub fn mark(self) -> Self {
        self.op(b'(')
    }

    pub fn empty_dict(self) -> Self {
        self.op(b'}')
    }

    pub fn empty_list(self) -> Self {
        self.op(b']')
    }

    pub fn empty_tuple(self) -> Self {
        self.op(b')')
    }

    pub fn set_item(self) -> Self {
        self.op(b's')
    }

    pub fn set_items(self) -> Self {
        self.op(b'u')
    }

    pub fn append(self) -> Self {
        self.op(b'a')
    }

    pub fn appends(self) -> Self {
        self.op(b'e')
    }

    pub fn tuple2(self) -> Self {
        self.op(0x86)
    }

    pub fn none(self) -> Self {
        self.op(b'N')
    }

    pub fn int(mut self, value: i32) -> Self {
        match value {
            0..=0xff => {
                self.bytes.push(b'K');
                self.bytes.push(value as u8);
            }
            0x100..=0xffff => {
                self.bytes.push(b'M');
                self.bytes.extend_from_slice(&(value as u16).to_le_bytes());
            }
            _ => {
                self.bytes.push(b'J');
                self.bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        self
    }

    pub fn text(mut self, value: &str) -> Self {
        self.bytes.push(b'X');
        self.bytes
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(value.as_bytes());
        self
    }

    pub fn global(mut self, module: &str, name: &str) -> Self {
        self.bytes.push(b'c');
        self.bytes.extend_from_slice(module.as_bytes());
        self.bytes.push(b'\n');
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(b'\n');
        self
    }

    pub fn new_obj(self) -> Self {
        self.op(0x81)
    }

    pub fn build(self) -> Self {
        self.op(b'b')
    }

    /// `BINPUT` into the next memo slot; returns the slot used.
    pub fn put(mut self) -> (Self, u8) {
        let slot = self.memo as u8;
        self.memo += 1;
        self.bytes.push(b'q');
        self.bytes.push(slot);
        (self, slot)
    }

    pub fn get(mut self, slot: u8) -> Self {
        self.bytes.push(b'h');
        self.bytes.push(slot);
        self
    }

    pub fn stop(self) -> Vec<u8> {
        self.op(b'.').bytes
    }
}

/// `{"a": 1, "b": [1, 2, 3]}`
pub fn nested_mapping() -> Vec<u8> {
    PickleBuilder::new()
        .empty_dict()
        .mark()
        .text("a")
        .int(1)
        .text("b")
        .empty_list()
        .mark()
        .int(1)
        .int(2)
        .int(3)
        .appends()
        .set_items()
        .stop()
}

/// `list(range(len))`
pub fn int_list(len: i32) -> Vec<u8> {
    let mut builder = PickleBuilder::new().empty_list().mark();
    for i in 0..len {
        builder = builder.int(i);
    }
    builder.appends().stop()
}

/// `levels` dicts nested under the key `"next"`, ending in `"leaf"`.
pub fn nested_dicts(levels: usize) -> Vec<u8> {
    let mut builder = PickleBuilder::new();
    for _ in 0..levels {
        builder = builder.empty_dict().text("next");
    }
    builder = builder.text("leaf");
    for _ in 0..levels {
        builder = builder.set_item();
    }
    builder.stop()
}

/// `x = [0]; x.append(x)`
pub fn self_referencing_list() -> Vec<u8> {
    let (builder, slot) = PickleBuilder::new().empty_list().put();
    builder.int(0).append().get(slot).append().stop()
}

/// A stream cut inside the list of [`nested_mapping`].
pub fn truncated_mapping() -> Vec<u8> {
    let mut bytes = nested_mapping();
    bytes.truncate(bytes.len() - 6);
    bytes
}

/// `class D(dict): pass; pickle.dumps(D(a=1, b=2), 2)` as CPython writes it.
pub const DICT_SUBCLASS: &[u8] = b"\x80\x02c__main__\nD\nq\x00)\x81q\x01(X\x01\x00\x00\x00aq\x02K\x01X\x01\x00\x00\x00bq\x03K\x02u}q\x04b.";

/// `class L(list): pass; pickle.dumps(L([1, 2, 3]), 2)` as CPython writes it.
pub const LIST_SUBCLASS: &[u8] = b"\x80\x02c__main__\nL\nq\x00)\x81q\x01(K\x01K\x02K\x03e}q\x02b.";

/// `pickle.dumps(numpy.arange(3, dtype="<i8"), 2)` as CPython writes it.
pub fn numpy_arange() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"\x80\x02cnumpy.core.multiarray\n_reconstruct\nq\x00cnumpy\nndarray\nq\x01");
    out.extend_from_slice(b"K\x00\x85q\x02c_codecs\nencode\nq\x03X\x01\x00\x00\x00bq\x04");
    out.extend_from_slice(b"X\x06\x00\x00\x00latin1q\x05\x86q\x06Rq\x07\x87q\x08Rq\x09");
    out.extend_from_slice(b"(K\x01K\x03\x85q\ncnumpy\ndtype\nq\x0bX\x02\x00\x00\x00i8q\x0c\x89\x88\x87q\rRq\x0e");
    out.extend_from_slice(b"(K\x03X\x01\x00\x00\x00<q\x0fNNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tq\x10b");
    out.extend_from_slice(b"\x89h\x03X\x18\x00\x00\x00");
    for i in 0..3u64 {
        out.extend_from_slice(&i.to_le_bytes());
    }
    out.extend_from_slice(b"q\x11h\x05\x86q\x12Rq\x13tq\x14b.");
    out
}

pub fn write_fixture(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, bytes)?;
    Ok(path)
}
