//! Recognizes reconstructed pandas DataFrames.
//!
//! A DataFrame pickles as an object whose `BUILD` state holds its block
//! manager under `_mgr` (`_data` before pandas 1.1). The manager's own state
//! ends with a `{"0.14.1": {"axes": [...], "blocks": [...]}}` dict:
//!
//! * `axes[0]` is the column index, `axes[1]` the row index;
//! * each block is `{"values": ndarray (columns x rows), "mgr_locs": positions}`.
//!
//! Indexes are rebuilt by `_new_Index(cls, {"data": ndarray, ...})`, or carry
//! `start`/`stop`/`step` for a `RangeIndex`.

use crate::numeric::NdArray;
use crate::summarizer::Scalar;
use crate::value::{Instance, Value};

const BLOCK_STATE_KEY: &str = "0.14.1";

fn pandas_object(value: &Value, class_name: &str) -> Option<Instance> {
    let Value::Object(obj) = value else {
        return None;
    };
    let obj = obj.borrow();
    let class = obj.class_ref()?;
    if !class.module.starts_with("pandas") || class.short_name() != class_name {
        return None;
    }
    Some(obj.clone())
}

fn dict_get(value: &Value, key: &str) -> Option<Value> {
    match value {
        Value::Dict(d) => d.borrow().get_str(key),
        _ => None,
    }
}

fn list_items(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::List(items) => Some(items.borrow().clone()),
        Value::Tuple(items) => Some(items.to_vec()),
        _ => None,
    }
}

/// Row or column labels.
#[derive(Debug, Clone)]
enum Labels {
    Range { start: i64, step: i64, len: usize },
    Values(NdArray),
}

impl Labels {
    fn from_value(value: &Value) -> Option<Self> {
        let Value::Object(obj) = value else {
            return None;
        };
        let obj = obj.borrow();
        let attrs = obj.args.first()?;
        if let Some(data) = dict_get(attrs, "data") {
            let array = NdArray::from_value(&data)?;
            return (array.shape().len() == 1).then_some(Self::Values(array));
        }
        let start = dict_get(attrs, "start").and_then(|v| v.as_i64()).unwrap_or(0);
        let stop = dict_get(attrs, "stop")?.as_i64()?;
        let step = dict_get(attrs, "step").and_then(|v| v.as_i64()).unwrap_or(1);
        if step == 0 {
            return None;
        }
        let span = if step > 0 {
            stop.checked_sub(start)?
        } else {
            start.checked_sub(stop)?
        };
        let len = if span <= 0 {
            0
        } else {
            usize::try_from((span - 1) / step.checked_abs()? + 1).ok()?
        };
        Some(Self::Range { start, step, len })
    }

    fn len(&self) -> usize {
        match self {
            Self::Range { len, .. } => *len,
            Self::Values(array) => array.len(),
        }
    }

    fn label(&self, i: usize) -> Option<Scalar> {
        match self {
            Self::Range { start, step, len } => {
                let i = i64::try_from(i).ok().filter(|_| i < *len)?;
                Some(Scalar::Int(start.checked_add(step.checked_mul(i)?)?))
            }
            Self::Values(array) => array.get(&[i]),
        }
    }
}

/// Block positions: `slice(start, stop, step)` or an integer array. Anything
/// other than exactly `count` positions is rejected.
fn positions(value: &Value, count: usize) -> Option<Vec<usize>> {
    if let Some(array) = NdArray::from_value(value) {
        if array.len() != count {
            return None;
        }
        return array
            .flat_prefix(array.len())
            .into_iter()
            .map(|s| match s {
                Scalar::Int(i) => usize::try_from(i).ok(),
                _ => None,
            })
            .collect();
    }
    let slice = match value {
        Value::Object(obj) => obj.borrow().clone(),
        _ => return None,
    };
    if !slice.class_ref().is_some_and(|g| g.is("builtins", "slice")) {
        return None;
    }
    let arg = |i: usize| slice.args.get(i).and_then(Value::as_i64);
    let start = usize::try_from(arg(0).unwrap_or(0)).ok()?;
    let stop = usize::try_from(arg(1)?).ok()?;
    let step = usize::try_from(arg(2).unwrap_or(1)).ok().filter(|s| *s > 0)?;
    let len = if stop > start { (stop - start - 1) / step + 1 } else { 0 };
    (len == count).then(|| (start..stop).step_by(step).collect())
}

#[derive(Debug, Clone)]
struct Block {
    values: NdArray,
    positions: Vec<usize>,
}

impl Block {
    /// Number of columns the values hold.
    fn width(values: &NdArray) -> Option<usize> {
        match values.shape() {
            [columns, _] => Some(*columns),
            [_] => Some(1),
            _ => None,
        }
    }

    fn cell(&self, slot: usize, row: usize) -> Option<Scalar> {
        match self.values.shape().len() {
            2 => self.values.get(&[slot, row]),
            1 if self.positions.len() == 1 => self.values.get(&[row]),
            _ => None,
        }
    }
}

/// A decoded DataFrame.
#[derive(Debug, Clone)]
pub struct DataFrame {
    columns: Labels,
    rows: Labels,
    blocks: Vec<Block>,
    /// Column position → (block, slot within block).
    layout: Vec<Option<(usize, usize)>>,
}

impl DataFrame {
    /// Recognizes `value` as a DataFrame. Frames whose blocks do not decode
    /// (extension arrays, unknown manager layouts) are not recognized.
    pub fn from_value(value: &Value) -> Option<Self> {
        let frame = pandas_object(value, "DataFrame")?;
        let manager = frame
            .state_attr("_mgr")
            .or_else(|| frame.state_attr("_data"))?;
        let manager = pandas_object(&manager, "BlockManager")?;
        let Some(Value::Tuple(state)) = &manager.state else {
            return None;
        };
        let extra = state.iter().rev().find_map(|v| dict_get(v, BLOCK_STATE_KEY))?;

        let axes = list_items(&dict_get(&extra, "axes")?)?;
        let [columns, rows] = axes.as_slice() else {
            return None;
        };
        let columns = Labels::from_value(columns)?;
        let rows = Labels::from_value(rows)?;

        let mut blocks = Vec::new();
        for block in list_items(&dict_get(&extra, "blocks")?)? {
            let values = NdArray::from_value(&dict_get(&block, "values")?)?;
            let width = Block::width(&values)?;
            let positions = positions(&dict_get(&block, "mgr_locs")?, width)?;
            blocks.push(Block { values, positions });
        }

        // Every column belongs to exactly one block slot.
        let placed = blocks
            .iter()
            .try_fold(0usize, |acc, b| acc.checked_add(b.positions.len()))?;
        if placed != columns.len() {
            return None;
        }
        let mut layout = vec![None; columns.len()];
        for (b, block) in blocks.iter().enumerate() {
            for (slot, pos) in block.positions.iter().enumerate() {
                let cell = layout.get_mut(*pos)?;
                if cell.is_some() {
                    return None;
                }
                *cell = Some((b, slot));
            }
        }

        Some(Self {
            columns,
            rows,
            blocks,
            layout,
        })
    }

    /// `(rows, columns)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.columns.len())
    }

    /// Column names coerced to text.
    pub fn column_names(&self) -> Vec<String> {
        (0..self.columns.len())
            .map(|c| self.column_name(c))
            .collect()
    }

    fn column_name(&self, c: usize) -> String {
        self.columns
            .label(c)
            .map(|s| s.to_key_text())
            .unwrap_or_default()
    }

    /// `head(rows).to_dict()`: column name → (row label → value).
    pub fn head(&self, rows: usize) -> Vec<(String, Vec<(String, Scalar)>)> {
        let rows = rows.min(self.rows.len());
        (0..self.columns.len())
            .map(|c| {
                let cells = (0..rows)
                    .map(|r| {
                        let label = self.rows.label(r).map(|s| s.to_key_text()).unwrap_or_default();
                        let value = self.layout[c]
                            .and_then(|(b, slot)| self.blocks[b].cell(slot, r))
                            .unwrap_or(Scalar::None);
                        (label, value)
                    })
                    .collect();
                (self.column_name(c), cells)
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::numeric::tests::ndarray;
    use crate::value::shared;
    use std::rc::Rc;

    fn object(module: &str, name: &str, args: Vec<Value>, state: Option<Value>) -> Value {
        let mut obj = Instance::new(Value::global(module, name), args);
        obj.state = state;
        Value::Object(shared(obj))
    }

    fn i64_bytes(values: &[i64]) -> Value {
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Value::Bytes(Rc::from(raw))
    }

    fn range_index(start: i64, stop: i64) -> Value {
        object(
            "pandas.core.indexes.range",
            "RangeIndex",
            vec![Value::dict(vec![
                (Value::str("name"), Value::None),
                (Value::str("start"), Value::Int(start)),
                (Value::str("stop"), Value::Int(stop)),
                (Value::str("step"), Value::Int(1)),
            ])],
            None,
        )
    }

    fn slice(start: i64, stop: i64) -> Value {
        object(
            "builtins",
            "slice",
            vec![Value::Int(start), Value::Int(stop), Value::Int(1)],
            None,
        )
    }

    /// `pd.DataFrame({"a": [1, 2, 3], "b": [10, 20, 30]})`, as the loader rebuilds it.
    pub(crate) fn sample_frame() -> Value {
        let columns = object(
            "pandas.core.indexes.base",
            "Index",
            vec![Value::dict(vec![
                (
                    Value::str("data"),
                    ndarray(
                        &[2],
                        "O8",
                        false,
                        Value::list(vec![Value::str("a"), Value::str("b")]),
                    ),
                ),
                (Value::str("name"), Value::None),
            ])],
            None,
        );
        frame_of(columns, slice(0, 2))
    }

    /// A 3 x 2 integer frame with the given column index and block positions.
    fn frame_of(columns: Value, locs: Value) -> Value {
        let rows = range_index(0, 3);
        let values = ndarray(&[2, 3], "i8", false, i64_bytes(&[1, 2, 3, 10, 20, 30]));
        let block = Value::dict(vec![
            (Value::str("values"), values.clone()),
            (Value::str("mgr_locs"), locs),
        ]);
        let extra = Value::dict(vec![(
            Value::str(BLOCK_STATE_KEY),
            Value::dict(vec![
                (
                    Value::str("axes"),
                    Value::list(vec![columns.clone(), rows.clone()]),
                ),
                (Value::str("blocks"), Value::list(vec![block])),
            ]),
        )]);
        let manager = object(
            "pandas.core.internals.managers",
            "BlockManager",
            Vec::new(),
            Some(Value::tuple(vec![
                Value::list(vec![columns, rows]),
                Value::list(vec![values]),
                Value::list(Vec::new()),
                extra,
            ])),
        );
        object(
            "pandas.core.frame",
            "DataFrame",
            Vec::new(),
            Some(Value::dict(vec![
                (Value::str("_mgr"), manager),
                (Value::str("_typ"), Value::str("dataframe")),
            ])),
        )
    }

    #[test]
    fn decodes_shape_columns_and_head() {
        let frame = DataFrame::from_value(&sample_frame()).unwrap();
        assert_eq!(frame.shape(), (3, 2));
        assert_eq!(frame.column_names(), vec!["a", "b"]);
        let head = frame.head(2);
        assert_eq!(
            head[1],
            (
                "b".to_string(),
                vec![
                    ("0".to_string(), Scalar::Int(10)),
                    ("1".to_string(), Scalar::Int(20))
                ]
            )
        );
    }

    #[test]
    fn other_pandas_objects_are_not_frames() {
        let series = object("pandas.core.series", "Series", Vec::new(), None);
        assert!(DataFrame::from_value(&series).is_none());
    }

    #[test]
    fn oversized_range_columns_are_rejected() {
        let frame = frame_of(range_index(0, i64::MAX), slice(0, i64::MAX));
        assert!(DataFrame::from_value(&frame).is_none());
        match crate::summarize(&frame, 0, &crate::Limits::default()) {
            crate::BoundedNode::Opaque { type_name, .. } => assert_eq!(type_name, "DataFrame"),
            other => panic!("expected opaque, got {other:?}"),
        }
    }

    #[test]
    fn overflowing_range_arithmetic_is_rejected() {
        let frame = frame_of(range_index(i64::MIN, i64::MAX), slice(0, 2));
        assert!(DataFrame::from_value(&frame).is_none());
        let labels = Labels::Range {
            start: i64::MAX,
            step: 1,
            len: 2,
        };
        assert_eq!(labels.label(0), Some(Scalar::Int(i64::MAX)));
        assert_eq!(labels.label(1), None);
    }

    #[test]
    fn block_positions_must_cover_each_column_once() {
        let frame = frame_of(range_index(0, 2), slice(0, 3));
        assert!(DataFrame::from_value(&frame).is_none());

        let repeated = ndarray(&[2], "i8", false, i64_bytes(&[0, 0]));
        let frame = frame_of(range_index(0, 2), repeated);
        assert!(DataFrame::from_value(&frame).is_none());

        let frame = frame_of(range_index(0, 2), slice(0, 2));
        assert_eq!(DataFrame::from_value(&frame).map(|f| f.shape()), Some((3, 2)));
    }
}
