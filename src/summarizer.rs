//! The bounded summarizer.
//!
//! [`summarize`] turns a reconstructed object graph into a [`BoundedNode`]
//! tree that is safe to render as JSON. Two bounds are enforced at every
//! level, independently of each other and of the total node count:
//!
//! * nesting depth never exceeds [`Limits::max_depth`];
//! * no container level keeps more than [`Limits::max_items`] children.
//!
//! The depth bound is also the only cycle guard. A container that holds
//! itself is walked again on every level until the bound cuts it off, which
//! terminates because every recursion step increases `depth`.
//!
//! ## Classification
//!
//! Values are classified by an ordered list of capability checks, first
//! match wins:
//!
//! 1. depth exhausted → [`BoundedNode::DepthTruncated`]
//! 2. scalar → [`BoundedNode::Scalar`]
//! 3. list, tuple or list subclass → [`BoundedNode::Sequence`]
//! 4. dict or dict subclass → [`BoundedNode::Mapping`]
//! 5. numpy array (feature `numpy`) → [`BoundedNode::ArrayPreview`]
//! 6. pandas DataFrame (feature `pandas`) → [`BoundedNode::TablePreview`]
//! 7. anything else → [`BoundedNode::Opaque`]
//!
//! The last rule always matches, so summarization cannot fail.

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};

use crate::value::{Dict, Value};

/// Maximum number of characters kept from an opaque value's repr.
pub const OPAQUE_REPR_CHARS: usize = 200;

/// Rendering of [`BoundedNode::DepthTruncated`].
pub const DEPTH_SENTINEL: &str = "<max depth reached>";

/// Bounds applied while summarizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Deepest container level that is expanded.
    pub max_depth: usize,
    /// Children kept per list, tuple or dict.
    pub max_items: usize,
    /// Flattened elements kept from an array.
    pub array_preview_count: usize,
    /// Leading rows kept from a table.
    pub table_preview_rows: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_items: 100,
            array_preview_count: 20,
            table_preview_rows: 10,
        }
    }
}

/// A JSON-representable leaf value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    /// `None`.
    None,
    /// A bool.
    Bool(bool),
    /// An integer that fits in 64 bits.
    Int(i64),
    /// A wider integer, held as its decimal digits and written as a JSON number.
    BigInt(#[serde(serialize_with = "big_int_number")] String),
    /// A float. NaN and infinities render as `null`.
    Float(f64),
    /// Text.
    Str(String),
}

fn big_int_number<S: Serializer>(
    digits: &str,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match digits.parse::<serde_json::Number>() {
        Ok(number) => number.serialize(serializer),
        Err(_) => serializer.serialize_str(digits),
    }
}

impl Scalar {
    /// The scalar view of `value`, if it is one.
    pub fn from_value(value: &Value) -> Option<Self> {
        Some(match value {
            Value::None => Self::None,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::Int(*i),
            Value::BigInt(s) => Self::BigInt(s.to_string()),
            Value::Float(f) => Self::Float(*f),
            Value::Str(s) => Self::Str(s.to_string()),
            _ => return None,
        })
    }

    /// Like [`Scalar::from_value`], but renders non-scalars as a capped repr string.
    pub fn literal(value: &Value) -> Self {
        Self::from_value(value).unwrap_or_else(|| Self::Str(value.repr(OPAQUE_REPR_CHARS).0))
    }

    /// Python's `str()` of the scalar, used for mapping keys.
    pub fn to_key_text(&self) -> String {
        match self {
            Self::None => "None".into(),
            Self::Bool(true) => "True".into(),
            Self::Bool(false) => "False".into(),
            Self::Int(i) => i.to_string(),
            Self::BigInt(s) | Self::Str(s) => s.clone(),
            Self::Float(f) => crate::value::float_repr(*f),
        }
    }
}

/// One node of the bounded summary tree.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundedNode {
    /// A scalar, kept unchanged.
    Scalar(Scalar),
    /// A list or tuple prefix.
    Sequence {
        /// Summaries of the kept elements, in order.
        items: Vec<BoundedNode>,
        /// True when the source had more than `max_items` elements.
        truncated: bool,
    },
    /// A dict prefix, keys coerced to text.
    Mapping {
        /// Summaries of the kept entries, in iteration order.
        entries: Vec<(String, BoundedNode)>,
        /// True when the source had more than `max_items` entries.
        truncated: bool,
    },
    /// A numeric array.
    ArrayPreview {
        /// Dimensions.
        shape: Vec<usize>,
        /// Element type name, e.g. `float64`.
        element_type: String,
        /// Flattened prefix of the elements.
        sample: Vec<Scalar>,
    },
    /// A table of named columns.
    TablePreview {
        /// `(rows, columns)`.
        shape: (usize, usize),
        /// Column names, in order.
        columns: Vec<String>,
        /// Leading rows, per column: column name → (row label → value).
        sample_rows: Vec<(String, Vec<(String, Scalar)>)>,
    },
    /// Any other value, described by its type and a capped repr.
    Opaque {
        /// Python `__name__` of the value's type.
        type_name: String,
        /// Python-style repr, at most [`OPAQUE_REPR_CHARS`] characters.
        repr: String,
        /// True when the repr was cut.
        truncated: bool,
    },
    /// The depth bound was reached.
    DepthTruncated,
}

impl BoundedNode {
    /// Number of nested container levels, counting this one.
    ///
    /// Leaves (scalars, previews, opaque values, truncation markers) count as 0.
    pub fn depth(&self) -> usize {
        match self {
            Self::Sequence { items, .. } => 1 + items.iter().map(Self::depth).max().unwrap_or(0),
            Self::Mapping { entries, .. } => {
                1 + entries.iter().map(|(_, v)| v.depth()).max().unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Largest child count of any container in the tree.
    pub fn max_width(&self) -> usize {
        match self {
            Self::Sequence { items, .. } => items
                .iter()
                .map(Self::max_width)
                .fold(items.len(), usize::max),
            Self::Mapping { entries, .. } => entries
                .iter()
                .map(|(_, v)| v.max_width())
                .fold(entries.len(), usize::max),
            _ => 0,
        }
    }

    /// True for [`BoundedNode::DepthTruncated`].
    pub fn is_depth_truncated(&self) -> bool {
        matches!(self, Self::DepthTruncated)
    }

    fn opaque(value: &Value) -> Self {
        let (repr, truncated) = value.repr(OPAQUE_REPR_CHARS);
        Self::Opaque {
            type_name: value.type_name(),
            repr,
            truncated,
        }
    }
}

/// Summarizes `value`, which sits `depth` container levels below the root.
pub fn summarize(value: &Value, depth: usize, limits: &Limits) -> BoundedNode {
    if depth >= limits.max_depth {
        return BoundedNode::DepthTruncated;
    }

    if let Some(scalar) = Scalar::from_value(value) {
        return BoundedNode::Scalar(scalar);
    }

    match value {
        Value::List(items) => return summarize_sequence(&items.borrow(), depth, limits),
        Value::Tuple(items) => return summarize_sequence(items, depth, limits),
        Value::Dict(dict) => return summarize_mapping(&dict.borrow(), depth, limits),
        // List and dict subclasses carry their contents next to the class path.
        Value::Object(obj) => {
            let obj = obj.borrow();
            if !obj.items.is_empty() {
                return summarize_sequence(&obj.items, depth, limits);
            }
            if !obj.entries.is_empty() {
                return summarize_mapping(&obj.entries, depth, limits);
            }
        }
        _ => {}
    }

    if let Some(node) = array_preview(value, limits) {
        return node;
    }
    if let Some(node) = table_preview(value, limits) {
        return node;
    }

    BoundedNode::opaque(value)
}

fn summarize_sequence(items: &[Value], depth: usize, limits: &Limits) -> BoundedNode {
    BoundedNode::Sequence {
        items: items
            .iter()
            .take(limits.max_items)
            .map(|item| summarize(item, depth + 1, limits))
            .collect(),
        truncated: items.len() > limits.max_items,
    }
}

fn summarize_mapping(dict: &Dict, depth: usize, limits: &Limits) -> BoundedNode {
    let mut entries: Vec<(String, BoundedNode)> = Vec::new();
    for (k, v) in dict.iter().take(limits.max_items) {
        let key = k.to_key_text();
        let node = summarize(v, depth + 1, limits);
        // Keys that coerce to the same text collapse; the last value wins.
        match entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = node,
            None => entries.push((key, node)),
        }
    }
    BoundedNode::Mapping {
        entries,
        truncated: dict.len() > limits.max_items,
    }
}

#[cfg(feature = "numpy")]
fn array_preview(value: &Value, limits: &Limits) -> Option<BoundedNode> {
    let array = crate::numeric::NdArray::from_value(value)?;
    Some(BoundedNode::ArrayPreview {
        shape: array.shape().to_vec(),
        element_type: array.dtype().name(),
        sample: array.flat_prefix(limits.array_preview_count),
    })
}

#[cfg(not(feature = "numpy"))]
fn array_preview(_value: &Value, _limits: &Limits) -> Option<BoundedNode> {
    None
}

#[cfg(feature = "pandas")]
fn table_preview(value: &Value, limits: &Limits) -> Option<BoundedNode> {
    let frame = crate::frame::DataFrame::from_value(value)?;
    Some(BoundedNode::TablePreview {
        shape: frame.shape(),
        columns: frame.column_names(),
        sample_rows: frame.head(limits.table_preview_rows),
    })
}

#[cfg(not(feature = "pandas"))]
fn table_preview(_value: &Value, _limits: &Limits) -> Option<BoundedNode> {
    None
}

/// Serializes `(key, value)` pairs as a JSON object, keeping their order.
struct OrderedMap<'a, V>(&'a [(String, V)]);

impl<V: Serialize> Serialize for OrderedMap<'_, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(k, v)| (k, v)))
    }
}

impl Serialize for BoundedNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Scalar(scalar) => scalar.serialize(serializer),
            Self::Sequence { items, .. } => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Mapping { entries, .. } => OrderedMap(entries).serialize(serializer),
            Self::ArrayPreview {
                shape,
                element_type,
                sample,
            } => {
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("__type__", "ndarray")?;
                map.serialize_entry("shape", shape)?;
                map.serialize_entry("dtype", element_type)?;
                map.serialize_entry("preview", sample)?;
                map.end()
            }
            Self::TablePreview {
                shape,
                columns,
                sample_rows,
            } => {
                let head: Vec<(String, OrderedMap<'_, Scalar>)> = sample_rows
                    .iter()
                    .map(|(column, rows)| (column.clone(), OrderedMap(rows)))
                    .collect();
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("__type__", "DataFrame")?;
                map.serialize_entry("shape", &[shape.0, shape.1])?;
                map.serialize_entry("columns", columns)?;
                map.serialize_entry("head", &OrderedMap(&head))?;
                map.end()
            }
            Self::Opaque {
                type_name, repr, ..
            } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("__type__", type_name)?;
                map.serialize_entry("__repr__", repr)?;
                map.end()
            }
            Self::DepthTruncated => serializer.serialize_str(DEPTH_SENTINEL),
        }
    }
}
