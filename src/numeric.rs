//! Recognizes reconstructed numpy arrays.
//!
//! numpy pickles an array in one of two shapes:
//!
//! * `_reconstruct(ndarray, (0,), b'b')` followed by `BUILD` with the state
//!   `(version, shape, dtype, is_fortran, rawdata)`;
//! * protocol 5: `_frombuffer(buffer, dtype, shape, order)`.
//!
//! The dtype itself is `dtype(descr, align, copy)` plus a `BUILD` state whose
//! second element is the byte order. Object arrays carry a list of Python
//! objects instead of raw bytes.

use std::rc::Rc;

use crate::summarizer::Scalar;
use crate::value::{float_repr, GlobalRef, Instance, Value};

const FROMBUFFER: &[(&str, &str)] = &[
    ("numpy.core.numeric", "_frombuffer"),
    ("numpy._core.numeric", "_frombuffer"),
];

fn is_numpy(g: &GlobalRef) -> bool {
    g.module == "numpy" || g.module.starts_with("numpy.")
}

/// Byte order of multi-byte elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// `<`, `=` and `|`.
    Little,
    /// `>`.
    Big,
}

/// An element type, parsed from numpy's type descriptor (`f8`, `<i4`, `U5`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DType {
    kind: char,
    itemsize: usize,
    order: ByteOrder,
}

impl DType {
    /// Parses a descriptor such as `f8` and applies the byte order character.
    pub fn parse(descr: &str, order: Option<&str>) -> Option<Self> {
        let descr = descr.trim_start_matches(['<', '>', '|', '=']);
        let kind = descr.chars().next()?;
        let count: usize = descr[kind.len_utf8()..].parse().ok()?;
        let itemsize = match kind {
            'U' => count.checked_mul(4)?,
            'b' | 'i' | 'u' | 'f' | 'c' | 'O' | 'S' | 'V' | 'M' | 'm' => count,
            _ => return None,
        };
        let order = match order {
            Some(">") => ByteOrder::Big,
            _ => ByteOrder::Little,
        };
        Some(Self {
            kind,
            itemsize,
            order,
        })
    }

    fn from_value(value: &Value) -> Option<Self> {
        let Value::Object(obj) = value else {
            return None;
        };
        let obj = obj.borrow();
        if !obj.class_ref().is_some_and(|g| is_numpy(g) && g.name == "dtype") {
            return None;
        }
        let descr = obj.args.first()?.as_str()?.to_string();
        let order = match &obj.state {
            Some(Value::Tuple(state)) => state.get(1).and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        Self::parse(&descr, order.as_deref())
    }

    /// Size of one element in bytes.
    pub fn itemsize(&self) -> usize {
        self.itemsize
    }

    /// numpy's `str(dtype)`.
    pub fn name(&self) -> String {
        let bits = self.itemsize * 8;
        match self.kind {
            'b' => "bool".into(),
            'i' => format!("int{bits}"),
            'u' => format!("uint{bits}"),
            'f' => format!("float{bits}"),
            'c' => format!("complex{bits}"),
            'O' => "object".into(),
            'U' => format!("<U{}", self.itemsize / 4),
            'S' => format!("|S{}", self.itemsize),
            'V' => format!("|V{}", self.itemsize),
            'M' => "datetime64".into(),
            'm' => "timedelta64".into(),
            other => other.to_string(),
        }
    }

    fn bytes<const N: usize>(&self, raw: &[u8]) -> Option<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(raw.get(..N)?);
        if self.order == ByteOrder::Big {
            buf.reverse();
        }
        Some(buf)
    }

    fn decode(&self, raw: &[u8]) -> Option<Scalar> {
        let int = |v: i64| Some(Scalar::Int(v));
        match (self.kind, self.itemsize) {
            ('b', 1) => Some(Scalar::Bool(raw.first()? != &0)),
            ('i', 1) => int(i64::from(i8::from_le_bytes(self.bytes(raw)?))),
            ('i', 2) => int(i64::from(i16::from_le_bytes(self.bytes(raw)?))),
            ('i', 4) => int(i64::from(i32::from_le_bytes(self.bytes(raw)?))),
            ('i', 8) | ('M', 8) | ('m', 8) => int(i64::from_le_bytes(self.bytes(raw)?)),
            ('u', 1) => int(i64::from(*raw.first()?)),
            ('u', 2) => int(i64::from(u16::from_le_bytes(self.bytes(raw)?))),
            ('u', 4) => int(i64::from(u32::from_le_bytes(self.bytes(raw)?))),
            ('u', 8) => {
                let v = u64::from_le_bytes(self.bytes(raw)?);
                Some(i64::try_from(v).map_or_else(|_| Scalar::BigInt(v.to_string()), Scalar::Int))
            }
            ('f', 2) => Some(Scalar::Float(f16_to_f64(u16::from_le_bytes(self.bytes(raw)?)))),
            ('f', 4) => Some(Scalar::Float(f64::from(f32::from_le_bytes(self.bytes(raw)?)))),
            ('f', 8) => Some(Scalar::Float(f64::from_le_bytes(self.bytes(raw)?))),
            ('c', 8) => {
                let re = f64::from(f32::from_le_bytes(self.bytes(raw)?));
                let im = f64::from(f32::from_le_bytes(self.bytes(raw.get(4..)?)?));
                Some(Scalar::Str(complex_repr(re, im)))
            }
            ('c', 16) => {
                let re = f64::from_le_bytes(self.bytes(raw)?);
                let im = f64::from_le_bytes(self.bytes(raw.get(8..)?)?);
                Some(Scalar::Str(complex_repr(re, im)))
            }
            ('U', _) => {
                let text: String = raw
                    .chunks_exact(4)
                    .filter_map(|c| {
                        let code = match self.order {
                            ByteOrder::Big => u32::from_be_bytes([c[0], c[1], c[2], c[3]]),
                            ByteOrder::Little => u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                        };
                        char::from_u32(code)
                    })
                    .collect();
                Some(Scalar::Str(text.trim_end_matches('\0').to_string()))
            }
            ('S', _) => {
                let end = raw.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
                Some(Scalar::Str(crate::value::quote_bytes(&raw[..end])))
            }
            _ => None,
        }
    }
}

fn complex_repr(re: f64, im: f64) -> String {
    let sign = if im.is_sign_negative() { '-' } else { '+' };
    format!("({}{}{}j)", float_repr(re), sign, float_repr(im.abs()))
}

/// IEEE 754 half precision to double.
fn f16_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exp = i32::from((bits >> 10) & 0x1f);
    let frac = f64::from(bits & 0x03ff);
    match exp {
        0 => sign * frac * 2f64.powi(-24),
        0x1f if frac == 0.0 => sign * f64::INFINITY,
        0x1f => f64::NAN,
        _ => sign * (1.0 + frac / 1024.0) * 2f64.powi(exp - 15),
    }
}

#[derive(Debug, Clone)]
enum Storage {
    Raw(Rc<[u8]>),
    Objects(Vec<Value>),
}

/// A decoded numpy array.
#[derive(Debug, Clone)]
pub struct NdArray {
    shape: Vec<usize>,
    dtype: DType,
    fortran: bool,
    storage: Storage,
}

fn shape_of(value: &Value) -> Option<Vec<usize>> {
    match value {
        Value::Tuple(dims) => dims
            .iter()
            .map(|d| d.as_i64().and_then(|v| usize::try_from(v).ok()))
            .collect(),
        Value::Int(n) => usize::try_from(*n).ok().map(|n| vec![n]),
        _ => None,
    }
}

fn storage_of(value: &Value) -> Option<Storage> {
    match value {
        Value::Bytes(b) => Some(Storage::Raw(b.clone())),
        Value::ByteArray(b) => Some(Storage::Raw(Rc::from(b.borrow().as_slice()))),
        // Protocol 2 carries raw data as latin-1 text.
        Value::Str(s) => Some(Storage::Raw(
            s.chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(0))
                .collect(),
        )),
        Value::List(items) => Some(Storage::Objects(items.borrow().clone())),
        _ => None,
    }
}

impl NdArray {
    /// Recognizes `value` as a numpy array. Returns `None` for anything else,
    /// including arrays whose state does not decode.
    pub fn from_value(value: &Value) -> Option<Self> {
        let Value::Object(obj) = value else {
            return None;
        };
        let obj = obj.borrow();
        let class = obj.class_ref()?;
        if is_numpy(class) && class.name == "ndarray" {
            Self::from_state(&obj)
        } else if FROMBUFFER.iter().any(|(m, n)| class.is(m, n)) {
            Self::from_buffer_args(&obj.args)
        } else {
            None
        }
    }

    fn from_state(obj: &Instance) -> Option<Self> {
        let Some(Value::Tuple(state)) = &obj.state else {
            return None;
        };
        // Older pickles omit the leading version number.
        let fields = match state.len() {
            5 => &state[1..],
            4 => &state[..],
            _ => return None,
        };
        let shape = shape_of(&fields[0])?;
        let dtype = DType::from_value(&fields[1])?;
        let fortran = matches!(fields[2], Value::Bool(true) | Value::Int(1));
        let storage = storage_of(&fields[3])?;
        Self::checked(shape, dtype, fortran, storage)
    }

    fn from_buffer_args(args: &[Value]) -> Option<Self> {
        let [buffer, dtype, shape, order, ..] = args else {
            return None;
        };
        let storage = storage_of(buffer)?;
        let dtype = DType::from_value(dtype)?;
        let shape = shape_of(shape)?;
        let fortran = order.as_str() == Some("F");
        Self::checked(shape, dtype, fortran, storage)
    }

    fn checked(shape: Vec<usize>, dtype: DType, fortran: bool, storage: Storage) -> Option<Self> {
        let total = shape
            .iter()
            .try_fold(1usize, |acc, d| acc.checked_mul(*d))?;
        let available = match &storage {
            Storage::Raw(bytes) => bytes.len() / dtype.itemsize.max(1),
            Storage::Objects(items) => items.len(),
        };
        if available < total {
            return None;
        }
        Some(Self {
            shape,
            dtype,
            fortran,
            storage,
        })
    }

    /// Dimensions.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type.
    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// True for arrays with a zero dimension.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at storage position `offset`.
    fn element(&self, offset: usize) -> Option<Scalar> {
        match &self.storage {
            Storage::Objects(items) => items.get(offset).map(Scalar::literal),
            Storage::Raw(bytes) => {
                let start = offset.checked_mul(self.dtype.itemsize)?;
                let raw = bytes.get(start..start + self.dtype.itemsize)?;
                self.dtype.decode(raw)
            }
        }
    }

    /// Storage position of a multi-index.
    fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.shape.len() || index.iter().zip(&self.shape).any(|(i, d)| i >= d) {
            return None;
        }
        let mut offset = 0;
        if self.fortran {
            let mut stride = 1;
            for (i, d) in index.iter().zip(&self.shape) {
                offset += i * stride;
                stride *= d;
            }
        } else {
            for (i, d) in index.iter().zip(&self.shape) {
                offset = offset * d + i;
            }
        }
        Some(offset)
    }

    /// Element at a multi-index.
    pub fn get(&self, index: &[usize]) -> Option<Scalar> {
        self.element(self.offset(index)?)
    }

    /// The first `count` elements of `flatten()`, in C order.
    pub fn flat_prefix(&self, count: usize) -> Vec<Scalar> {
        let count = count.min(self.len());
        let mut index = vec![0usize; self.shape.len()];
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            match self.get(&index) {
                Some(v) => out.push(v),
                None => break,
            }
            // Advance the multi-index in C order.
            for axis in (0..index.len()).rev() {
                index[axis] += 1;
                if index[axis] < self.shape[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        out
    }
}
