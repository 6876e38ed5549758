//! The object loader used by full mode.
//!
//! [`Unpickler`] runs the pickle stack machine over the decoded opcode stream
//! and materializes the object graph as [`Value`]s. It deliberately stops short
//! of Python's semantics in one place: globals are never imported and callables
//! are never invoked. A handful of builtin constructors (`set`, `bytearray`,
//! `OrderedDict`, ...) are interpreted natively; every other call becomes an
//! [`Instance`] that records the class and its arguments.
//!
//! Reconstruction is still the unsafe path of this tool: a hostile stream can
//! request very large allocations. Callers should prefer the safe scan.

use std::collections::HashMap;
use std::mem;
use std::rc::Rc;

use log::{debug, warn};

use crate::decoder::{OpArg, OpRecord, OpcodeDecoder};
use crate::error::{InspectError, Result};
use crate::format::Opcode;
use crate::value::{shared, Dict, GlobalRef, Instance, Value};

/// Callables whose first argument is the class of the object they rebuild.
const RECONSTRUCTORS: &[(&str, &str)] = &[
    ("copyreg", "_reconstructor"),
    ("copyreg", "__newobj__"),
    ("copyreg", "__newobj_ex__"),
    ("numpy.core.multiarray", "_reconstruct"),
    ("numpy._core.multiarray", "_reconstruct"),
    ("pandas.core.indexes.base", "_new_Index"),
];

/// Dict subclasses that are rebuilt as plain dicts.
const DICT_TYPES: &[(&str, &str)] = &[
    ("builtins", "dict"),
    ("collections", "OrderedDict"),
    ("collections", "defaultdict"),
    ("collections", "Counter"),
];

/// Loads the first pickle in `data` and returns its root object.
pub fn load(data: &[u8]) -> Result<Value> {
    Unpickler::new(data).load()
}

/// The pickle virtual machine.
#[derive(Debug)]
pub struct Unpickler<'a> {
    decoder: OpcodeDecoder<'a>,
    stack: Vec<Value>,
    metastack: Vec<Vec<Value>>,
    memo: HashMap<usize, Value>,
    protocol: Option<u8>,
}

fn fail(msg: impl Into<String>) -> InspectError {
    InspectError::Reconstruction(msg.into())
}

impl<'a> Unpickler<'a> {
    /// Creates a machine over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            decoder: OpcodeDecoder::new(data),
            stack: Vec::new(),
            metastack: Vec::new(),
            memo: HashMap::new(),
            protocol: None,
        }
    }

    /// The protocol announced by `PROTO`, once seen.
    pub fn protocol(&self) -> Option<u8> {
        self.protocol
    }

    /// Runs the machine until `STOP` and returns the root object.
    pub fn load(mut self) -> Result<Value> {
        while let Some(record) = self.decoder.next() {
            let record = record.map_err(|e| fail(e.to_string()))?;
            let position = record.position;
            let opcode = record.opcode;
            if opcode == Opcode::Stop {
                let root = self.pop()?;
                debug!(
                    "reconstructed object graph: protocol {:?}, {} memo entries",
                    self.protocol,
                    self.memo.len()
                );
                return Ok(root);
            }
            self.step(record).map_err(|e| match e {
                InspectError::Reconstruction(msg) => fail(format!("{opcode} at byte {position}: {msg}")),
                other => other,
            })?;
        }
        Err(fail("pickle exhausted before seeing STOP"))
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| fail("stack underflow"))
    }

    fn top(&self) -> Result<&Value> {
        self.stack.last().ok_or_else(|| fail("stack underflow"))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let outer = self.metastack.pop().ok_or_else(|| fail("could not find MARK"))?;
        Ok(mem::replace(&mut self.stack, outer))
    }

    fn memo_get(&self, index: usize) -> Result<Value> {
        self.memo
            .get(&index)
            .cloned()
            .ok_or_else(|| fail(format!("memo value not found at index {index}")))
    }

    fn memo_put(&mut self, index: usize) -> Result<()> {
        let top = self.top()?.clone();
        self.memo.insert(index, top);
        Ok(())
    }

    fn step(&mut self, record: OpRecord<'_>) -> Result<()> {
        let OpRecord {
            opcode, argument, ..
        } = record;
        let index = || {
            argument
                .as_ref()
                .and_then(OpArg::as_index)
                .ok_or_else(|| fail("missing or negative memo index"))
        };

        match opcode {
            Opcode::Proto => {
                let version = index()?;
                self.protocol = u8::try_from(version).ok();
            }
            Opcode::Frame => {}
            Opcode::Mark => {
                let current = mem::take(&mut self.stack);
                self.metastack.push(current);
            }
            Opcode::Stop => {}
            Opcode::Pop => {
                if self.stack.is_empty() {
                    self.pop_mark()?;
                } else {
                    self.pop()?;
                }
            }
            Opcode::PopMark => {
                self.pop_mark()?;
            }
            Opcode::Dup => {
                let top = self.top()?.clone();
                self.stack.push(top);
            }

            Opcode::Int
            | Opcode::BinInt
            | Opcode::BinInt1
            | Opcode::BinInt2
            | Opcode::Long
            | Opcode::Long1
            | Opcode::Long4
            | Opcode::Float
            | Opcode::BinFloat
            | Opcode::String
            | Opcode::BinString
            | Opcode::ShortBinString
            | Opcode::Unicode
            | Opcode::BinUnicode
            | Opcode::ShortBinUnicode
            | Opcode::BinUnicode8 => {
                let arg = argument.ok_or_else(|| fail("missing literal argument"))?;
                self.stack.push(literal(arg));
            }
            Opcode::BinBytes | Opcode::ShortBinBytes | Opcode::BinBytes8 => match argument {
                Some(OpArg::Bytes(b)) => self.stack.push(Value::Bytes(Rc::from(&*b))),
                _ => return Err(fail("missing bytes argument")),
            },
            Opcode::ByteArray8 => match argument {
                Some(OpArg::Bytes(b)) => self.stack.push(Value::ByteArray(shared(b.into_owned()))),
                _ => return Err(fail("missing bytes argument")),
            },
            Opcode::None => self.stack.push(Value::None),
            Opcode::NewTrue => self.stack.push(Value::Bool(true)),
            Opcode::NewFalse => self.stack.push(Value::Bool(false)),

            Opcode::PersId => {
                let id = argument.map(|a| a.to_string()).unwrap_or_default();
                self.stack
                    .push(Value::External(Rc::from(format!("persistent_id {id}"))));
            }
            Opcode::BinPersId => {
                let id = self.pop()?;
                let (text, _) = id.repr(80);
                self.stack
                    .push(Value::External(Rc::from(format!("persistent_id {text}"))));
            }
            Opcode::Ext1 | Opcode::Ext2 | Opcode::Ext4 => {
                let code = argument.map(|a| a.to_string()).unwrap_or_default();
                self.stack
                    .push(Value::External(Rc::from(format!("extension code {code}"))));
            }
            Opcode::NextBuffer => {
                warn!("stream refers to out-of-band buffers");
                return Err(fail(
                    "pickle stream refers to out-of-band data but no buffers were given",
                ));
            }
            Opcode::ReadonlyBuffer => {
                self.top()?;
            }

            Opcode::EmptyList => self.stack.push(Value::list(Vec::new())),
            Opcode::List => {
                let items = self.pop_mark()?;
                self.stack.push(Value::list(items));
            }
            Opcode::Append => {
                let item = self.pop()?;
                append_items(self.top()?, vec![item])?;
            }
            Opcode::Appends => {
                let items = self.pop_mark()?;
                append_items(self.top()?, items)?;
            }

            Opcode::EmptyTuple => self.stack.push(Value::tuple(Vec::new())),
            Opcode::Tuple => {
                let items = self.pop_mark()?;
                self.stack.push(Value::tuple(items));
            }
            Opcode::Tuple1 | Opcode::Tuple2 | Opcode::Tuple3 => {
                let n = match opcode {
                    Opcode::Tuple1 => 1,
                    Opcode::Tuple2 => 2,
                    _ => 3,
                };
                if self.stack.len() < n {
                    return Err(fail("stack underflow"));
                }
                let items = self.stack.split_off(self.stack.len() - n);
                self.stack.push(Value::tuple(items));
            }

            Opcode::EmptyDict => self.stack.push(Value::Dict(shared(Dict::new()))),
            Opcode::Dict => {
                let items = self.pop_mark()?;
                let pairs = pairs(items)?;
                self.stack.push(Value::dict(pairs));
            }
            Opcode::SetItem => {
                let value = self.pop()?;
                let key = self.pop()?;
                set_items(self.top()?, vec![(key, value)])?;
            }
            Opcode::SetItems => {
                let items = self.pop_mark()?;
                let pairs = pairs(items)?;
                set_items(self.top()?, pairs)?;
            }

            Opcode::EmptySet => self.stack.push(Value::Set(shared(Vec::new()))),
            Opcode::AddItems => {
                let items = self.pop_mark()?;
                match self.top()? {
                    Value::Set(set) => set.borrow_mut().extend(items),
                    other => return Err(fail(format!("ADDITEMS on {}", other.type_name()))),
                }
            }
            Opcode::FrozenSet => {
                let items = self.pop_mark()?;
                self.stack.push(Value::FrozenSet(Rc::from(items)));
            }

            Opcode::Get | Opcode::BinGet | Opcode::LongBinGet => {
                let value = self.memo_get(index()?)?;
                self.stack.push(value);
            }
            Opcode::Put | Opcode::BinPut | Opcode::LongBinPut => self.memo_put(index()?)?,
            Opcode::Memoize => self.memo_put(self.memo.len())?,

            Opcode::Global => match argument {
                Some(OpArg::Global { module, name }) => {
                    self.stack.push(Value::global(&module, &name));
                }
                _ => return Err(fail("missing GLOBAL argument")),
            },
            Opcode::StackGlobal => {
                let name = self.pop()?;
                let module = self.pop()?;
                match (module.as_str(), name.as_str()) {
                    (Some(m), Some(n)) => self.stack.push(Value::global(m, n)),
                    _ => return Err(fail("STACK_GLOBAL requires str")),
                }
            }
            Opcode::Reduce => {
                let args = self.pop()?;
                let callable = self.pop()?;
                let args = match args {
                    Value::Tuple(items) => items.to_vec(),
                    other => {
                        return Err(fail(format!(
                            "REDUCE arguments must be a tuple, got {}",
                            other.type_name()
                        )))
                    }
                };
                let value = reduce(callable, args);
                self.stack.push(value);
            }
            Opcode::NewObj => {
                let args = self.pop()?;
                let class = self.pop()?;
                self.stack.push(new_object(class, tuple_items(args)?, None));
            }
            Opcode::NewObjEx => {
                let kwargs = self.pop()?;
                let args = self.pop()?;
                let class = self.pop()?;
                self.stack
                    .push(new_object(class, tuple_items(args)?, Some(kwargs)));
            }
            Opcode::Inst => {
                let args = self.pop_mark()?;
                match argument {
                    Some(OpArg::Global { module, name }) => {
                        let class = Value::global(&module, &name);
                        self.stack.push(new_object(class, args, None));
                    }
                    _ => return Err(fail("missing INST argument")),
                }
            }
            Opcode::Obj => {
                let mut args = self.pop_mark()?;
                if args.is_empty() {
                    return Err(fail("OBJ without a class"));
                }
                let class = args.remove(0);
                self.stack.push(new_object(class, args, None));
            }
            Opcode::Build => {
                let state = self.pop()?;
                match self.top()? {
                    Value::Object(obj) => {
                        obj.borrow_mut().state = Some(state);
                    }
                    other => return Err(fail(format!("BUILD on {}", other.type_name()))),
                }
            }
        }
        Ok(())
    }
}

fn literal(arg: OpArg<'_>) -> Value {
    match arg {
        OpArg::Int(i) => Value::Int(i),
        OpArg::BigInt(digits) => Value::BigInt(Rc::from(digits)),
        OpArg::Bool(b) => Value::Bool(b),
        OpArg::Float(f) => Value::Float(f),
        OpArg::Text(s) => Value::Str(Rc::from(&*s)),
        // Protocol 0-2 `str` payloads; latin-1 keeps every byte recoverable.
        OpArg::Bytes(b) => Value::Str(Rc::from(b.iter().map(|&c| char::from(c)).collect::<String>())),
        OpArg::Global { module, name } => Value::global(&module, &name),
    }
}

fn tuple_items(args: Value) -> Result<Vec<Value>> {
    match args {
        Value::Tuple(items) => Ok(items.to_vec()),
        other => Err(fail(format!(
            "constructor arguments must be a tuple, got {}",
            other.type_name()
        ))),
    }
}

fn pairs(items: Vec<Value>) -> Result<Vec<(Value, Value)>> {
    if items.len() % 2 != 0 {
        return Err(fail("odd number of items for a mapping"));
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        out.push((k, v));
    }
    Ok(out)
}

fn append_items(target: &Value, items: Vec<Value>) -> Result<()> {
    match target {
        Value::List(list) => list.borrow_mut().extend(items),
        Value::Set(set) => set.borrow_mut().extend(items),
        Value::Object(obj) => obj.borrow_mut().items.extend(items),
        other => return Err(fail(format!("APPEND on {}", other.type_name()))),
    }
    Ok(())
}

fn set_items(target: &Value, pairs: Vec<(Value, Value)>) -> Result<()> {
    match target {
        Value::Dict(dict) => {
            let mut dict = dict.borrow_mut();
            for (k, v) in pairs {
                dict.insert(k, v);
            }
        }
        Value::Object(obj) => {
            let entries = &mut obj.borrow_mut().entries;
            for (k, v) in pairs {
                entries.insert(k, v);
            }
        }
        other => return Err(fail(format!("SETITEM on {}", other.type_name()))),
    }
    Ok(())
}

fn global_of(value: &Value) -> Option<&GlobalRef> {
    match value {
        Value::Global(g) => Some(g),
        _ => None,
    }
}

fn is_one_of(g: &GlobalRef, table: &[(&str, &str)]) -> bool {
    table.iter().any(|(m, n)| g.is(m, n))
}

/// Iterable argument of a builtin constructor, flattened.
fn iterable_items(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::List(l)) => l.borrow().clone(),
        Some(Value::Set(s)) => s.borrow().clone(),
        Some(Value::Tuple(t)) | Some(Value::FrozenSet(t)) => t.to_vec(),
        Some(Value::Dict(d)) => d.borrow().iter().map(|(k, _)| k.clone()).collect(),
        _ => Vec::new(),
    }
}

/// Latin-1 encoding of a `str`, as `_codecs.encode(text, 'latin1')` does for protocol 2 bytes.
fn latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

fn bytes_from_args(args: &[Value]) -> Vec<u8> {
    match args.first() {
        Some(Value::Bytes(b)) => b.to_vec(),
        Some(Value::Str(s)) => latin1(s),
        Some(Value::List(l)) => l
            .borrow()
            .iter()
            .filter_map(|v| v.as_i64().and_then(|i| u8::try_from(i).ok()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Interprets `callable(*args)` without calling anything.
fn reduce(callable: Value, mut args: Vec<Value>) -> Value {
    let Some(g) = global_of(&callable).cloned() else {
        return Value::Object(shared(Instance::new(callable, args)));
    };

    if g.is("builtins", "set") {
        return Value::Set(shared(iterable_items(args.first())));
    }
    if g.is("builtins", "frozenset") {
        return Value::FrozenSet(Rc::from(iterable_items(args.first())));
    }
    if g.is("builtins", "list") {
        return Value::list(iterable_items(args.first()));
    }
    if g.is("builtins", "tuple") {
        return Value::tuple(iterable_items(args.first()));
    }
    if g.is("builtins", "bytearray") {
        return Value::ByteArray(shared(bytes_from_args(&args)));
    }
    if g.is("builtins", "bytes") || g.is("_codecs", "encode") {
        return Value::Bytes(Rc::from(bytes_from_args(&args)));
    }
    if is_one_of(&g, DICT_TYPES) {
        let mut dict = Dict::new();
        match args.first() {
            Some(Value::Dict(src)) => {
                for (k, v) in src.borrow().iter() {
                    dict.insert(k.clone(), v.clone());
                }
            }
            // Python 2 OrderedDict: a list of [key, value] pairs.
            Some(Value::List(items)) => {
                for item in items.borrow().iter() {
                    let pair = iterable_items(Some(item));
                    if let [k, v] = pair.as_slice() {
                        dict.insert(k.clone(), v.clone());
                    }
                }
            }
            _ => {}
        }
        return Value::Dict(shared(dict));
    }
    if is_one_of(&g, RECONSTRUCTORS) && !args.is_empty() {
        let class = args.remove(0);
        if let Some(builtin) = global_of(&class).and_then(|c| builtin_empty(c)) {
            return builtin;
        }
        // copyreg._reconstructor(cls, base, state) carries no constructor arguments.
        if g.is("copyreg", "_reconstructor") {
            args.clear();
        }
        return Value::Object(shared(Instance::new(class, args)));
    }

    Value::Object(shared(Instance::new(callable, args)))
}

/// `cls.__new__(cls, *args)`.
fn new_object(class: Value, args: Vec<Value>, kwargs: Option<Value>) -> Value {
    if let Some(builtin) = global_of(&class).and_then(builtin_empty) {
        return builtin;
    }
    let mut instance = Instance::new(class, args);
    instance.kwargs = kwargs;
    Value::Object(shared(instance))
}

/// An empty instance of a builtin container class, filled later by the stream.
fn builtin_empty(class: &GlobalRef) -> Option<Value> {
    if is_one_of(class, DICT_TYPES) {
        return Some(Value::Dict(shared(Dict::new())));
    }
    match (class.module.as_str(), class.name.as_str()) {
        ("builtins", "list") => Some(Value::list(Vec::new())),
        ("builtins", "set") => Some(Value::Set(shared(Vec::new()))),
        _ => None,
    }
}
