//! # Value Module
//!
//! Runtime value representation for the Vesper interpreter.
//! Uses `Arc` for heap-allocated payloads — **no garbage collector**.
//! Memory is freed when the last reference drops; long-lived cycles
//! (symbol ↔ binding ↔ closure) live for the process lifetime, which
//! is the intended lifetime of a global environment.
//!
//! ## Key Design
//! - `Null`, `Boolean`, `Character`, `Number` are inline (no heap).
//! - Every payload is `Send + Sync`: mutable slots (list car/cdr,
//!   array elements, struct bindings, symbol global bindings) are
//!   lock-protected so `go` can run tasks on real threads.
//! - Symbols, keywords, and type names are interned — equality is
//!   pointer identity on the shared name object.
//! - The empty list is a distinguished sentinel cell; its identity
//!   terminates every proper list.

use crate::builtin::Primitive;
use crate::opcode::Code;
use crate::vm::{Continuation, Frame};
use crate::writer;

use rustc_hash::FxHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock};

/// Numbers compare equal within this tolerance.
pub const EPSILON: f64 = 1.0e-9;

// -----------------------------------------------------------------------------
// INTERNED NAMES — Symbols, Keywords, Types
// -----------------------------------------------------------------------------

/// An interned name. Symbols additionally carry their global binding
/// in-band; undefining a global clears the slot.
pub struct NameObj {
    pub text: String,
    binding: RwLock<Option<Value>>,
}

impl NameObj {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            binding: RwLock::new(None),
        }
    }

    pub fn global(&self) -> Option<Value> {
        self.binding.read().unwrap().clone()
    }

    pub fn set_global(&self, val: Value) {
        *self.binding.write().unwrap() = Some(val);
    }

    pub fn unset_global(&self) {
        *self.binding.write().unwrap() = None;
    }
}

// -----------------------------------------------------------------------------
// COMPOUND PAYLOADS
// -----------------------------------------------------------------------------

/// A list cell. The empty list is a sentinel cell whose car and cdr
/// are never read; every other cell holds real values.
pub struct Cell {
    pub car: Mutex<Value>,
    pub cdr: Mutex<Value>,
    sealed: AtomicBool,
}

/// A mutable array of values.
pub struct ArrayObj {
    pub elements: Mutex<Vec<Value>>,
    sealed: AtomicBool,
}

impl ArrayObj {
    pub fn new(elements: Vec<Value>) -> Self {
        Self {
            elements: Mutex::new(elements),
            sealed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.lock().unwrap().len()
    }
}

/// A struct: a mutable bag of key/value bindings. Valid keys are
/// strings, symbols, keywords, and types.
pub struct StructObj {
    pub bindings: Mutex<FxHashMap<StructKey, Value>>,
    sealed: AtomicBool,
}

impl StructObj {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bindings: Mutex::new(FxHashMap::with_capacity_and_hasher(
                capacity,
                Default::default(),
            )),
            sealed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().unwrap().len()
    }

    pub fn get(&self, key: &Value) -> Value {
        if !is_valid_struct_key(key) {
            return Value::Null;
        }
        self.bindings
            .lock()
            .unwrap()
            .get(&StructKey(key.clone()))
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn put(&self, key: Value, val: Value) {
        self.bindings.lock().unwrap().insert(StructKey(key), val);
    }

    pub fn unput(&self, key: &Value) {
        self.bindings.lock().unwrap().remove(&StructKey(key.clone()));
    }

    /// Snapshot of the bindings as key/value pairs.
    pub fn pairs(&self) -> Vec<(Value, Value)> {
        self.bindings
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.0.clone(), v.clone()))
            .collect()
    }
}

/// Hash-map key wrapper: interned names hash and compare by pointer
/// identity, strings by text.
#[derive(Clone)]
pub struct StructKey(pub Value);

impl PartialEq for StructKey {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b))
            | (Value::Keyword(a), Value::Keyword(b))
            | (Value::Type(a), Value::Type(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for StructKey {}

impl Hash for StructKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::String(s) => s.hash(state),
            Value::Symbol(n) | Value::Keyword(n) | Value::Type(n) => {
                (Arc::as_ptr(n) as usize).hash(state)
            }
            _ => 0usize.hash(state),
        }
    }
}

/// A user-typed instance: an arbitrary value wrapped with a type tag.
pub struct Instance {
    pub tag: Value,
    pub data: Value,
}

/// An error value: type `<error>`, carrying an array of descriptive
/// parts whose first element is the keyword tag.
pub struct ErrObj {
    pub data: Value,
}

// -----------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------

/// Every callable variant the VM can dispatch on.
#[derive(Clone)]
pub enum Function {
    /// A code object bound to the lexical frame captured at creation.
    Closure {
        code: Arc<Code>,
        frame: Option<Arc<Frame>>,
    },
    /// A host function with a declared signature.
    Primitive(Arc<Primitive>),
    /// A reified call context; invoking it replays the saved stack.
    Continuation(Arc<Continuation>),
    /// Flattens its final list argument into positional arguments.
    Apply,
    /// Captures the current continuation and passes it to its argument.
    CallCC,
    /// Spawns a new task running its argument concurrently.
    Go,
}

// -----------------------------------------------------------------------------
// VALUE — Core Runtime Type
// -----------------------------------------------------------------------------

/// The universal tagged value. Clone is cheap: inline variants are
/// `Copy`-like, heap variants bump a refcount.
#[derive(Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Character(char),
    Number(f64),
    String(Arc<String>),
    Blob(Arc<Vec<u8>>),
    List(Arc<Cell>),
    Array(Arc<ArrayObj>),
    Struct(Arc<StructObj>),
    Symbol(Arc<NameObj>),
    Keyword(Arc<NameObj>),
    Type(Arc<NameObj>),
    Function(Function),
    Code(Arc<Code>),
    Error(Arc<ErrObj>),
    Channel(Arc<crate::channel::ChannelObj>),
    Instance(Arc<Instance>),
}

static EMPTY_LIST: LazyLock<Arc<Cell>> = LazyLock::new(|| {
    Arc::new(Cell {
        car: Mutex::new(Value::Null),
        cdr: Mutex::new(Value::Null),
        sealed: AtomicBool::new(false),
    })
});

impl Value {
    /// The distinguished empty list sentinel.
    pub fn empty_list() -> Value {
        Value::List(EMPTY_LIST.clone())
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::String(Arc::new(s.into()))
    }

    pub fn array(elements: Vec<Value>) -> Value {
        Value::Array(Arc::new(ArrayObj::new(elements)))
    }

    pub fn instance(tag: Value, data: Value) -> Value {
        Value::Instance(Arc::new(Instance { tag, data }))
    }

    pub fn is_empty_list(&self) -> bool {
        matches!(self, Value::List(c) if Arc::ptr_eq(c, &EMPTY_LIST))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(_))
    }

    pub fn is_symbol(&self) -> bool {
        matches!(self, Value::Symbol(_))
    }

    /// Only the boolean false is false; everything else (including
    /// null) is truthy.
    #[inline]
    pub fn is_false(&self) -> bool {
        matches!(self, Value::Boolean(false))
    }

    /// The type name tag for this value as text, e.g. `<number>`.
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "<null>".into(),
            Value::Boolean(_) => "<boolean>".into(),
            Value::Character(_) => "<character>".into(),
            Value::Number(_) => "<number>".into(),
            Value::String(_) => "<string>".into(),
            Value::Blob(_) => "<blob>".into(),
            Value::List(_) => "<list>".into(),
            Value::Array(_) => "<array>".into(),
            Value::Struct(_) => "<struct>".into(),
            Value::Symbol(_) => "<symbol>".into(),
            Value::Keyword(_) => "<keyword>".into(),
            Value::Type(_) => "<type>".into(),
            Value::Function(_) => "<function>".into(),
            Value::Code(_) => "<code>".into(),
            Value::Error(_) => "<error>".into(),
            Value::Channel(_) => "<channel>".into(),
            Value::Instance(inst) => match &inst.tag {
                Value::Type(n) => n.text.clone(),
                _ => "<instance>".into(),
            },
        }
    }

    /// The text of an interned name (symbol, keyword, or type).
    pub fn name_text(&self) -> Option<&str> {
        match self {
            Value::Symbol(n) | Value::Keyword(n) | Value::Type(n) => Some(&n.text),
            _ => None,
        }
    }

    /// Marks a compound value immutable. Returns false when the value
    /// kind has no seal slot.
    pub fn seal(&self) -> bool {
        match self {
            Value::List(c) => c.sealed.store(true, Ordering::Release),
            Value::Array(a) => a.sealed.store(true, Ordering::Release),
            Value::Struct(s) => s.sealed.store(true, Ordering::Release),
            _ => return false,
        }
        true
    }

    pub fn is_sealed(&self) -> bool {
        match self {
            Value::List(c) => c.sealed.load(Ordering::Acquire),
            Value::Array(a) => a.sealed.load(Ordering::Acquire),
            Value::Struct(s) => s.sealed.load(Ordering::Acquire),
            _ => false,
        }
    }
}

// -----------------------------------------------------------------------------
// LIST OPERATIONS
// -----------------------------------------------------------------------------

/// Creates a new list cell.
pub fn cons(car: Value, cdr: Value) -> Value {
    Value::List(Arc::new(Cell {
        car: Mutex::new(car),
        cdr: Mutex::new(cdr),
        sealed: AtomicBool::new(false),
    }))
}

/// First element, or null for the empty list.
pub fn car(lst: &Value) -> Value {
    match lst {
        Value::List(c) if !lst.is_empty_list() => c.car.lock().unwrap().clone(),
        _ => Value::Null,
    }
}

/// Rest of the list; the empty list is its own cdr.
pub fn cdr(lst: &Value) -> Value {
    match lst {
        Value::List(c) if !lst.is_empty_list() => c.cdr.lock().unwrap().clone(),
        _ => Value::empty_list(),
    }
}

pub fn cadr(lst: &Value) -> Value {
    car(&cdr(lst))
}

pub fn caddr(lst: &Value) -> Value {
    car(&cdr(&cdr(lst)))
}

pub fn cddr(lst: &Value) -> Value {
    cdr(&cdr(lst))
}

pub fn cdddr(lst: &Value) -> Value {
    cdr(&cdr(&cdr(lst)))
}

pub fn set_car(lst: &Value, val: Value) -> bool {
    match lst {
        Value::List(c) if !lst.is_empty_list() => {
            *c.car.lock().unwrap() = val;
            true
        }
        _ => false,
    }
}

pub fn set_cdr(lst: &Value, val: Value) -> bool {
    match lst {
        Value::List(c) if !lst.is_empty_list() => {
            *c.cdr.lock().unwrap() = val;
            true
        }
        _ => false,
    }
}

/// Builds a proper list from a slice of values.
pub fn list_from_values(items: &[Value]) -> Value {
    let mut lst = Value::empty_list();
    for item in items.iter().rev() {
        lst = cons(item.clone(), lst);
    }
    lst
}

/// Builds a list of `count` copies of `init`.
pub fn make_list(count: usize, init: Value) -> Value {
    let mut lst = Value::empty_list();
    for _ in 0..count {
        lst = cons(init.clone(), lst);
    }
    lst
}

/// Element count of a proper list; None for improper or non-lists.
pub fn list_length(lst: &Value) -> Option<usize> {
    let mut count = 0;
    let mut cur = lst.clone();
    loop {
        if cur.is_empty_list() {
            return Some(count);
        }
        match cur {
            Value::List(_) => {
                count += 1;
                cur = cdr(&cur);
            }
            _ => return None,
        }
    }
}

/// Collects the elements of a proper list into a vector.
pub fn list_to_vec(lst: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    let mut cur = lst.clone();
    while cur.is_list() && !cur.is_empty_list() {
        out.push(car(&cur));
        cur = cdr(&cur);
    }
    out
}

pub fn reverse(lst: &Value) -> Value {
    let mut out = Value::empty_list();
    let mut cur = lst.clone();
    while cur.is_list() && !cur.is_empty_list() {
        out = cons(car(&cur), out);
        cur = cdr(&cur);
    }
    out
}

/// Recursively flattens nested lists into one list.
pub fn flatten(lst: &Value) -> Value {
    let mut out = Vec::new();
    flatten_into(lst, &mut out);
    list_from_values(&out)
}

fn flatten_into(lst: &Value, out: &mut Vec<Value>) {
    let mut cur = lst.clone();
    while cur.is_list() && !cur.is_empty_list() {
        let item = car(&cur);
        if item.is_list() && !item.is_empty_list() {
            flatten_into(&item, out);
        } else if !item.is_empty_list() {
            out.push(item);
        }
        cur = cdr(&cur);
    }
}

/// Appends any number of lists into a fresh list.
pub fn concat(lists: &[Value]) -> Value {
    let mut out = Vec::new();
    for lst in lists {
        out.extend(list_to_vec(lst));
    }
    list_from_values(&out)
}

pub fn array_to_list(a: &Value) -> Value {
    match a {
        Value::Array(arr) => list_from_values(&arr.elements.lock().unwrap()),
        _ => Value::empty_list(),
    }
}

// -----------------------------------------------------------------------------
// STRUCT CONSTRUCTION
// -----------------------------------------------------------------------------

pub fn is_valid_struct_key(v: &Value) -> bool {
    matches!(
        v,
        Value::String(_) | Value::Symbol(_) | Value::Keyword(_) | Value::Type(_)
    )
}

/// Builds a struct from alternating key/value arguments. A struct
/// argument in key position merges its bindings instead.
pub fn struct_from_flat(fieldvals: &[Value]) -> Result<Value, String> {
    let strct = StructObj::with_capacity(fieldvals.len() / 2);
    let mut i = 0;
    while i < fieldvals.len() {
        let k = deref_value(&fieldvals[i]);
        i += 1;
        match &k {
            Value::Struct(other) => {
                for (key, val) in other.pairs() {
                    strct.put(key, val);
                }
            }
            _ if is_valid_struct_key(&k) => {
                if i == fieldvals.len() {
                    return Err(format!("Mismatched keyword/value in arglist: {}", k));
                }
                strct.put(k, fieldvals[i].clone());
                i += 1;
            }
            _ => return Err(format!("Bad struct key: {}", k)),
        }
    }
    Ok(Value::Struct(Arc::new(strct)))
}

/// Unwraps an instance to its underlying data; other values pass
/// through unchanged.
pub fn deref_value(v: &Value) -> Value {
    match v {
        Value::Instance(inst) => inst.data.clone(),
        _ => v.clone(),
    }
}

// -----------------------------------------------------------------------------
// ERROR VALUES
// -----------------------------------------------------------------------------

/// Builds an `<error>` value whose data array holds the given parts.
pub fn make_error(parts: Vec<Value>) -> Value {
    Value::Error(Arc::new(ErrObj {
        data: Value::array(parts),
    }))
}

// -----------------------------------------------------------------------------
// EQUALITY
// -----------------------------------------------------------------------------

#[inline]
pub fn number_equal(a: f64, b: f64) -> bool {
    a == b || (a - b).abs() < EPSILON
}

/// Identity: pointer equality for heap values, value equality for
/// inline ones.
pub fn identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        (Value::Character(x), Value::Character(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => Arc::ptr_eq(x, y),
        (Value::Blob(x), Value::Blob(y)) => Arc::ptr_eq(x, y),
        (Value::List(x), Value::List(y)) => Arc::ptr_eq(x, y),
        (Value::Array(x), Value::Array(y)) => Arc::ptr_eq(x, y),
        (Value::Struct(x), Value::Struct(y)) => Arc::ptr_eq(x, y),
        (Value::Symbol(x), Value::Symbol(y))
        | (Value::Keyword(x), Value::Keyword(y))
        | (Value::Type(x), Value::Type(y)) => Arc::ptr_eq(x, y),
        (Value::Code(x), Value::Code(y)) => Arc::ptr_eq(x, y),
        (Value::Error(x), Value::Error(y)) => Arc::ptr_eq(x, y),
        (Value::Channel(x), Value::Channel(y)) => Arc::ptr_eq(x, y),
        (Value::Instance(x), Value::Instance(y)) => Arc::ptr_eq(x, y),
        (Value::Function(x), Value::Function(y)) => match (x, y) {
            (Function::Closure { code: ca, .. }, Function::Closure { code: cb, .. }) => {
                Arc::ptr_eq(ca, cb)
            }
            (Function::Primitive(pa), Function::Primitive(pb)) => Arc::ptr_eq(pa, pb),
            (Function::Continuation(ka), Function::Continuation(kb)) => Arc::ptr_eq(ka, kb),
            (Function::Apply, Function::Apply) => true,
            (Function::CallCC, Function::CallCC) => true,
            (Function::Go, Function::Go) => true,
            _ => false,
        },
        _ => false,
    }
}

/// Structural equality: interned names by identity, numbers within
/// epsilon, strings by text, lists/arrays elementwise, structs by
/// key/value bag; everything else falls back to identity.
pub fn equal(a: &Value, b: &Value) -> bool {
    if identical(a, b) {
        return true;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => number_equal(*x, *y),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Blob(x), Value::Blob(y)) => x == y,
        (Value::List(_), Value::List(_)) => {
            let mut x = a.clone();
            let mut y = b.clone();
            loop {
                match (x.is_empty_list(), y.is_empty_list()) {
                    (true, true) => return true,
                    (false, false) => {}
                    _ => return false,
                }
                if !x.is_list() || !y.is_list() {
                    return equal(&x, &y);
                }
                if !equal(&car(&x), &car(&y)) {
                    return false;
                }
                x = cdr(&x);
                y = cdr(&y);
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            let xs = x.elements.lock().unwrap().clone();
            let ys = y.elements.lock().unwrap().clone();
            xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(u, v)| equal(u, v))
        }
        (Value::Struct(x), Value::Struct(y)) => {
            let xs = x.pairs();
            if xs.len() != y.len() {
                return false;
            }
            xs.iter().all(|(k, v)| equal(&y.get(k), v))
        }
        (Value::Instance(x), Value::Instance(y)) => {
            identical(&x.tag, &y.tag) && equal(&x.data, &y.data)
        }
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        equal(self, other)
    }
}

// -----------------------------------------------------------------------------
// DISPLAY
// -----------------------------------------------------------------------------

/// Formats a number the way the reader accepts it back: integral
/// values without a decimal point.
pub fn number_to_string(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Strings and characters display raw; everything else uses
        // its written (readable) form.
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Character(c) => write!(f, "{}", c),
            _ => write!(f, "{}", writer::write(self)),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", writer::write(self))
    }
}
