//! The reconstructed object graph.
//!
//! [`Value`] mirrors the Python object model closely enough to summarize it:
//! containers are reference-counted and interior-mutable because a pickle may
//! share one container between several parents, or make it contain itself.
//! Objects of classes the loader cannot interpret become [`Instance`] records
//! that keep the symbolic class path, the constructor arguments and the
//! `BUILD` state. Nothing here is ever imported or executed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Write};
use std::rc::Rc;

/// Shared, mutable graph node.
pub type Shared<T> = Rc<RefCell<T>>;

/// Wraps a value in a fresh [`Shared`] cell.
pub fn shared<T>(value: T) -> Shared<T> {
    Rc::new(RefCell::new(value))
}

/// One node of a reconstructed pickle object graph.
#[derive(Debug, Clone)]
pub enum Value {
    /// `None`.
    None,
    /// `True` / `False`.
    Bool(bool),
    /// An integer that fits in 64 bits.
    Int(i64),
    /// A wider integer, as decimal digits.
    BigInt(Rc<str>),
    /// A float.
    Float(f64),
    /// Text.
    Str(Rc<str>),
    /// Immutable bytes.
    Bytes(Rc<[u8]>),
    /// Mutable bytes.
    ByteArray(Shared<Vec<u8>>),
    /// A list.
    List(Shared<Vec<Value>>),
    /// A tuple.
    Tuple(Rc<[Value]>),
    /// A dict (or a dict subclass such as `OrderedDict`).
    Dict(Shared<Dict>),
    /// A set.
    Set(Shared<Vec<Value>>),
    /// A frozenset.
    FrozenSet(Rc<[Value]>),
    /// A reference to a class or function, by module path and name.
    Global(Rc<GlobalRef>),
    /// An object of a class the loader keeps symbolic.
    Object(Shared<Instance>),
    /// An out-of-band reference (`PERSID`, `EXT*`, protocol 5 buffers).
    External(Rc<str>),
}

/// A symbolic `module.name` reference produced by `GLOBAL` / `STACK_GLOBAL`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalRef {
    /// Module path, with Python 2 names mapped to their Python 3 spelling.
    pub module: String,
    /// Qualified name inside the module.
    pub name: String,
}

impl GlobalRef {
    /// Builds a reference, normalizing Python 2 module names.
    pub fn new(module: &str, name: &str) -> Self {
        let module = match module {
            "__builtin__" => "builtins",
            "copy_reg" => "copyreg",
            other => other,
        };
        Self {
            module: module.to_string(),
            name: name.to_string(),
        }
    }

    /// True when this reference names `module.name` exactly.
    pub fn is(&self, module: &str, name: &str) -> bool {
        self.module == module && self.name == name
    }

    /// The last component of the qualified name, i.e. Python's `__name__`.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }
}

impl fmt::Display for GlobalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// An object whose class is only known by name.
#[derive(Debug, Clone)]
pub struct Instance {
    /// The object's class, usually a [`Value::Global`].
    pub class: Value,
    /// Positional constructor arguments.
    pub args: Vec<Value>,
    /// Keyword constructor arguments (`NEWOBJ_EX`).
    pub kwargs: Option<Value>,
    /// State applied by `BUILD`.
    pub state: Option<Value>,
    /// Items appended by `APPEND`/`APPENDS` on a list subclass.
    pub items: Vec<Value>,
    /// Entries set by `SETITEM`/`SETITEMS` on a dict subclass.
    pub entries: Dict,
}

impl Instance {
    /// A fresh instance of `class` built from `args`.
    pub fn new(class: Value, args: Vec<Value>) -> Self {
        Self {
            class,
            args,
            kwargs: None,
            state: None,
            items: Vec::new(),
            entries: Dict::new(),
        }
    }

    /// The class reference, when the class is a plain global.
    pub fn class_ref(&self) -> Option<&GlobalRef> {
        match &self.class {
            Value::Global(g) => Some(g),
            _ => None,
        }
    }

    /// The class's `__name__`.
    pub fn class_name(&self) -> String {
        match self.class_ref() {
            Some(g) => g.short_name().to_string(),
            None => "object".to_string(),
        }
    }

    /// Looks up `key` in a dict-shaped `BUILD` state.
    ///
    /// A `(dict, slots)` tuple state is searched in both halves.
    pub fn state_attr(&self, key: &str) -> Option<Value> {
        let state = self.state.as_ref()?;
        let lookup = |v: &Value| match v {
            Value::Dict(d) => d.borrow().get_str(key),
            _ => None,
        };
        match state {
            Value::Tuple(parts) if parts.len() == 2 => {
                lookup(&parts[0]).or_else(|| lookup(&parts[1]))
            }
            other => lookup(other),
        }
    }
}

/// An insertion-ordered dict with Python key semantics.
///
/// Hashable keys are indexed so that repeated assignment replaces the earlier
/// value. Keys without a hash (lists, dicts, objects) are appended as-is.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
    index: HashMap<Key, usize>,
}

impl Dict {
    /// Creates an empty dict.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `key`.
    pub fn insert(&mut self, key: Value, value: Value) {
        match Key::of(&key) {
            Some(k) => match self.index.get(&k) {
                Some(&slot) => self.entries[slot].1 = value,
                None => {
                    self.index.insert(k, self.entries.len());
                    self.entries.push((key, value));
                }
            },
            None => self.entries.push((key, value)),
        }
    }

    /// Looks up a text key.
    pub fn get_str(&self, key: &str) -> Option<Value> {
        let slot = self.index.get(&Key::Str(Rc::from(key)))?;
        self.entries.get(*slot).map(|(_, v)| v.clone())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

/// Hashable projection of a [`Value`] following Python's equality rules
/// (`True == 1 == 1.0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    None,
    Int(i64),
    Float(u64),
    BigInt(Rc<str>),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Tuple(Vec<Key>),
    Global(Rc<GlobalRef>),
}

impl Key {
    fn of(value: &Value) -> Option<Self> {
        Some(match value {
            Value::None => Self::None,
            Value::Bool(b) => Self::Int(i64::from(*b)),
            Value::Int(i) => Self::Int(*i),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    Self::Int(*f as i64)
                } else {
                    Self::Float(f.to_bits())
                }
            }
            Value::BigInt(s) => Self::BigInt(s.clone()),
            Value::Str(s) => Self::Str(s.clone()),
            Value::Bytes(b) => Self::Bytes(b.clone()),
            Value::Tuple(items) => Self::Tuple(items.iter().map(Self::of).collect::<Option<_>>()?),
            Value::FrozenSet(items) => {
                Self::Tuple(items.iter().map(Self::of).collect::<Option<_>>()?)
            }
            Value::Global(g) => Self::Global(g.clone()),
            _ => return None,
        })
    }
}

impl Value {
    /// Builds a text value.
    pub fn str(text: &str) -> Self {
        Self::Str(Rc::from(text))
    }

    /// Builds a list value.
    pub fn list(items: Vec<Value>) -> Self {
        Self::List(shared(items))
    }

    /// Builds a tuple value.
    pub fn tuple(items: Vec<Value>) -> Self {
        Self::Tuple(Rc::from(items))
    }

    /// Builds a dict value from pairs, applying Python key replacement.
    pub fn dict(pairs: Vec<(Value, Value)>) -> Self {
        let mut dict = Dict::new();
        for (k, v) in pairs {
            dict.insert(k, v);
        }
        Self::Dict(shared(dict))
    }

    /// Builds a global reference.
    pub fn global(module: &str, name: &str) -> Self {
        Self::Global(Rc::new(GlobalRef::new(module, name)))
    }

    /// Python's `type(value).__name__`.
    pub fn type_name(&self) -> String {
        match self {
            Self::None => "NoneType".into(),
            Self::Bool(_) => "bool".into(),
            Self::Int(_) | Self::BigInt(_) => "int".into(),
            Self::Float(_) => "float".into(),
            Self::Str(_) => "str".into(),
            Self::Bytes(_) => "bytes".into(),
            Self::ByteArray(_) => "bytearray".into(),
            Self::List(_) => "list".into(),
            Self::Tuple(_) => "tuple".into(),
            Self::Dict(_) => "dict".into(),
            Self::Set(_) => "set".into(),
            Self::FrozenSet(_) => "frozenset".into(),
            Self::Global(_) => "type".into(),
            Self::Object(obj) => obj.borrow().class_name(),
            Self::External(_) => "persistent_id".into(),
        }
    }

    /// The integer value, when this is an integer or a bool.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// The text, when this is a `str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Python's `str(value)`: text as-is, everything else as its repr.
    pub fn to_key_text(&self) -> String {
        match self {
            Self::Str(s) => s.to_string(),
            other => other.repr(usize::MAX).0,
        }
    }

    /// Python-style `repr`, cut after `cap` characters.
    ///
    /// Returns the text and whether it was cut. Recursive references render as
    /// `[...]` / `{...}` the way Python does.
    pub fn repr(&self, cap: usize) -> (String, bool) {
        let mut out = CappedWriter::new(cap);
        let mut active = Vec::new();
        // An Err here only signals that the cap was hit.
        let _ = write_repr(self, &mut out, &mut active);
        (out.buf, out.overflowed)
    }
}

/// A `fmt::Write` sink that refuses input past `cap` characters.
struct CappedWriter {
    buf: String,
    remaining: usize,
    overflowed: bool,
}

impl CappedWriter {
    fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            remaining: cap,
            overflowed: false,
        }
    }
}

impl Write for CappedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for ch in s.chars() {
            if self.remaining == 0 {
                self.overflowed = true;
                return Err(fmt::Error);
            }
            self.buf.push(ch);
            self.remaining -= 1;
        }
        Ok(())
    }
}

fn node_id(value: &Value) -> Option<*const ()> {
    match value {
        Value::List(l) => Some(Rc::as_ptr(l).cast()),
        Value::Dict(d) => Some(Rc::as_ptr(d).cast()),
        Value::Set(s) => Some(Rc::as_ptr(s).cast()),
        Value::Object(o) => Some(Rc::as_ptr(o).cast()),
        _ => None,
    }
}

fn write_seq(
    items: &[Value],
    out: &mut CappedWriter,
    active: &mut Vec<*const ()>,
) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.write_str(", ")?;
        }
        write_repr(item, out, active)?;
    }
    Ok(())
}

fn write_repr(value: &Value, out: &mut CappedWriter, active: &mut Vec<*const ()>) -> fmt::Result {
    if let Some(id) = node_id(value) {
        if active.contains(&id) {
            return out.write_str(match value {
                Value::Dict(_) => "{...}",
                Value::List(_) => "[...]",
                _ => "...",
            });
        }
        active.push(id);
        let result = write_container(value, out, active);
        active.pop();
        return result;
    }

    match value {
        Value::None => out.write_str("None"),
        Value::Bool(true) => out.write_str("True"),
        Value::Bool(false) => out.write_str("False"),
        Value::Int(i) => write!(out, "{i}"),
        Value::BigInt(s) => out.write_str(s),
        Value::Float(f) => out.write_str(&float_repr(*f)),
        Value::Str(s) => out.write_str(&quote_str(s)),
        Value::Bytes(b) => out.write_str(&quote_bytes(b)),
        Value::Tuple(items) => {
            out.write_str("(")?;
            write_seq(items, out, active)?;
            if items.len() == 1 {
                out.write_str(",")?;
            }
            out.write_str(")")
        }
        Value::FrozenSet(items) => {
            out.write_str("frozenset({")?;
            write_seq(items, out, active)?;
            out.write_str("})")
        }
        Value::Global(g) => write!(out, "<class '{g}'>"),
        Value::External(desc) => write!(out, "<{desc}>"),
        Value::ByteArray(b) => {
            out.write_str("bytearray(")?;
            out.write_str(&quote_bytes(&b.borrow()))?;
            out.write_str(")")
        }
        Value::List(_) | Value::Dict(_) | Value::Set(_) | Value::Object(_) => {
            write_container(value, out, active)
        }
    }
}

fn write_container(
    value: &Value,
    out: &mut CappedWriter,
    active: &mut Vec<*const ()>,
) -> fmt::Result {
    match value {
        Value::List(items) => {
            out.write_str("[")?;
            write_seq(&items.borrow(), out, active)?;
            out.write_str("]")
        }
        Value::Set(items) => {
            let items = items.borrow();
            if items.is_empty() {
                return out.write_str("set()");
            }
            out.write_str("{")?;
            write_seq(&items, out, active)?;
            out.write_str("}")
        }
        Value::Dict(dict) => write_entries(&dict.borrow(), out, active),
        Value::Object(obj) => {
            let obj = obj.borrow();
            match obj.class_ref() {
                Some(g) => write!(out, "{g}(")?,
                None => out.write_str("object(")?,
            }
            let mut first = true;
            let mut sep = |out: &mut CappedWriter| -> fmt::Result {
                if !std::mem::take(&mut first) {
                    out.write_str(", ")?;
                }
                Ok(())
            };
            for arg in &obj.args {
                sep(out)?;
                write_repr(arg, out, active)?;
            }
            if let Some(Value::Dict(kwargs)) = &obj.kwargs {
                for (k, v) in kwargs.borrow().iter() {
                    sep(out)?;
                    write!(out, "{}=", k.as_str().unwrap_or("?"))?;
                    write_repr(v, out, active)?;
                }
            }
            if !obj.items.is_empty() {
                sep(out)?;
                out.write_str("[")?;
                write_seq(&obj.items, out, active)?;
                out.write_str("]")?;
            }
            if !obj.entries.is_empty() {
                sep(out)?;
                write_entries(&obj.entries, out, active)?;
            }
            match &obj.state {
                Some(Value::Dict(attrs)) => {
                    for (k, v) in attrs.borrow().iter() {
                        sep(out)?;
                        write!(out, "{}=", k.as_str().unwrap_or("?"))?;
                        write_repr(v, out, active)?;
                    }
                }
                Some(other) => {
                    sep(out)?;
                    out.write_str("state=")?;
                    write_repr(other, out, active)?;
                }
                None => {}
            }
            out.write_str(")")
        }
        other => write_repr(other, out, active),
    }
}

fn write_entries(dict: &Dict, out: &mut CappedWriter, active: &mut Vec<*const ()>) -> fmt::Result {
    out.write_str("{")?;
    for (i, (k, v)) in dict.iter().enumerate() {
        if i > 0 {
            out.write_str(", ")?;
        }
        write_repr(k, out, active)?;
        out.write_str(": ")?;
        write_repr(v, out, active)?;
    }
    out.write_str("}")
}

/// Python's `repr` of a float.
pub fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".into();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let text = format!("{value:?}");
    match text.split_once('e') {
        // Python spells the exponent with a sign and at least two digits.
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exp),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => text,
    }
}

fn pick_quote(has_single: bool, has_double: bool) -> char {
    if has_single && !has_double {
        '"'
    } else {
        '\''
    }
}

/// Python's `repr` of a `str`.
pub fn quote_str(text: &str) -> String {
    let quote = pick_quote(text.contains('\''), text.contains('"'));
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Python's `repr` of a `bytes` object.
pub fn quote_bytes(bytes: &[u8]) -> String {
    let quote = pick_quote(bytes.contains(&b'\''), bytes.contains(&b'"'));
    let mut out = String::with_capacity(bytes.len() + 3);
    out.push('b');
    out.push(quote);
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b if char::from(b) == quote => {
                out.push('\\');
                out.push(char::from(b));
            }
            0x20..=0x7e => out.push(char::from(b)),
            b => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push(quote);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_replaces_equal_keys() {
        let mut d = Dict::new();
        d.insert(Value::Int(1), Value::str("a"));
        d.insert(Value::Bool(true), Value::str("b"));
        d.insert(Value::Float(1.0), Value::str("c"));
        d.insert(Value::str("k"), Value::None);
        assert_eq!(d.len(), 2);
        let (first_key, first_val) = d.iter().next().unwrap();
        assert_eq!(first_key.as_i64(), Some(1));
        assert_eq!(first_val.as_str(), Some("c"));
        assert!(d.get_str("k").is_some());
    }

    #[test]
    fn repr_matches_python_spelling() {
        let value = Value::dict(vec![
            (Value::str("a"), Value::tuple(vec![Value::Int(1)])),
            (Value::str("b"), Value::Bytes(Rc::from(&b"x\x00'"[..]))),
            (Value::str("c"), Value::Float(2.5)),
            (Value::str("d"), Value::None),
        ]);
        let (text, truncated) = value.repr(200);
        assert_eq!(text, r#"{'a': (1,), 'b': b"x\x00'", 'c': 2.5, 'd': None}"#);
        assert!(!truncated);
    }

    #[test]
    fn repr_is_capped_by_characters() {
        let value = Value::str(&"é".repeat(300));
        let (text, truncated) = value.repr(200);
        assert_eq!(text.chars().count(), 200);
        assert!(truncated);
    }

    #[test]
    fn repr_of_self_referencing_list_terminates() {
        let list = shared(Vec::new());
        list.borrow_mut().push(Value::Int(1));
        list.borrow_mut().push(Value::List(list.clone()));
        let (text, truncated) = Value::List(list).repr(200);
        assert_eq!(text, "[1, [...]]");
        assert!(!truncated);
    }

    #[test]
    fn float_repr_follows_python() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(1e100), "1e+100");
        assert_eq!(float_repr(1e-5), "1e-05");
        assert_eq!(float_repr(1.5e16), "1.5e+16");
        assert_eq!(float_repr(2.5e-300), "2.5e-300");
        assert_eq!(float_repr(0.0001), "0.0001");
        assert_eq!(float_repr(f64::NAN), "nan");
        assert_eq!(float_repr(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn key_text_uses_str_semantics() {
        assert_eq!(Value::str("name").to_key_text(), "name");
        assert_eq!(Value::Int(7).to_key_text(), "7");
        assert_eq!(
            Value::tuple(vec![Value::Int(1), Value::Int(2)]).to_key_text(),
            "(1, 2)"
        );
    }

    #[test]
    fn repr_shows_subclass_contents_and_keywords() {
        let mut dict_like = Instance::new(Value::global("__main__", "D"), Vec::new());
        dict_like.entries.insert(Value::str("a"), Value::Int(1));
        dict_like.state = Some(Value::dict(Vec::new()));
        let (text, _) = Value::Object(shared(dict_like)).repr(200);
        assert_eq!(text, "__main__.D({'a': 1})");

        let mut list_like = Instance::new(Value::global("__main__", "L"), Vec::new());
        list_like.items = vec![Value::Int(1), Value::Int(2)];
        let (text, _) = Value::Object(shared(list_like)).repr(200);
        assert_eq!(text, "__main__.L([1, 2])");

        let mut made = Instance::new(Value::global("shop", "Order"), vec![Value::Int(7)]);
        made.kwargs = Some(Value::dict(vec![(Value::str("paid"), Value::Bool(true))]));
        let (text, _) = Value::Object(shared(made)).repr(200);
        assert_eq!(text, "shop.Order(7, paid=True)");
    }

    #[test]
    fn global_ref_normalizes_python2_modules() {
        let g = GlobalRef::new("__builtin__", "set");
        assert!(g.is("builtins", "set"));
        assert_eq!(GlobalRef::new("a.b", "Outer.Inner").short_name(), "Inner");
    }
}
