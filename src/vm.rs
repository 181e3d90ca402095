//! # VM Module
//!
//! Stack-based virtual machine for executing Vesper bytecode, plus the
//! process-wide environment it owns: the symbol intern table, the
//! macro map, and the deduplicated constants pool.
//!
//! ## Key Design
//! - Downward-growing value stack, pre-allocated at `stack_size`.
//! - Frames are linked records; `previous` is the caller, `locals` is
//!   the enclosing lexical frame a closure captured — distinct chains.
//! - Self tail calls reuse the current frame's element array; general
//!   tail calls splice the new frame onto the caller's caller.
//! - Continuations copy the stack tail eagerly at capture; invoking
//!   one restores the segment and resumes at the saved pc.
//! - Shared maps are mutex-guarded so `go` tasks can run on real
//!   threads against one VM.

use crate::builtin::{self, Primitive};
use crate::error::{ErrorKind, VesperError, VesperResult};
use crate::loader;
use crate::opcode::{self, Code};
use crate::value::{self, Function, NameObj, Value};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::trace;

/// Default value-stack depth; configurable per VM.
pub const DEFAULT_STACK_SIZE: usize = 1000;

/// Checks a candidate type name: `<` name `>`.
pub fn is_valid_type_name(s: &str) -> bool {
    s.len() > 2 && s.starts_with('<') && s.ends_with('>')
}

// -----------------------------------------------------------------------------
// FRAMES
// -----------------------------------------------------------------------------

/// A runtime activation record. `ret_code`/`ret_pc` name the caller's
/// resume point; `locals` is the lexical chain for closure variables.
/// Argument arrays of five or fewer elements stay inline.
pub struct Frame {
    pub previous: Option<Arc<Frame>>,
    pub locals: Option<Arc<Frame>>,
    pub code: Option<Arc<Code>>,
    pub ret_code: Option<Arc<Code>>,
    pub ret_pc: usize,
    pub elements: Mutex<SmallVec<[Value; 5]>>,
}

impl Frame {
    fn root() -> Self {
        Self {
            previous: None,
            locals: None,
            code: None,
            ret_code: None,
            ret_pc: 0,
            elements: Mutex::new(SmallVec::new()),
        }
    }
}

/// A reified call context: the caller's ops and pc, the stack tail
/// above the capture point, and the lexical frame. `code == None`
/// marks a capture at the top of an `exec` — invoking it returns the
/// passed value from that `exec`.
pub struct Continuation {
    pub code: Option<Arc<Code>>,
    pub pc: usize,
    pub stack: Vec<Value>,
    pub frame: Option<Arc<Frame>>,
}

// -----------------------------------------------------------------------------
// CONSTANTS POOL
// -----------------------------------------------------------------------------

/// Dedup key for the constants pool: interned and compound values key
/// by pointer identity, inline values by content.
#[derive(PartialEq, Eq, Hash)]
enum ConstKey {
    Null,
    Boolean(bool),
    Character(char),
    Number(u64),
    String(String),
    Ptr(usize),
    // A closure is identified by its code AND its captured frame.
    Pair(usize, usize),
}

fn const_key(val: &Value) -> ConstKey {
    match val {
        Value::Null => ConstKey::Null,
        Value::Boolean(b) => ConstKey::Boolean(*b),
        Value::Character(c) => ConstKey::Character(*c),
        Value::Number(n) => ConstKey::Number(n.to_bits()),
        Value::String(s) => ConstKey::String(s.as_ref().clone()),
        Value::Symbol(n) | Value::Keyword(n) | Value::Type(n) => {
            ConstKey::Ptr(Arc::as_ptr(n) as usize)
        }
        Value::List(p) => ConstKey::Ptr(Arc::as_ptr(p) as usize),
        Value::Array(p) => ConstKey::Ptr(Arc::as_ptr(p) as usize),
        Value::Struct(p) => ConstKey::Ptr(Arc::as_ptr(p) as usize),
        Value::Code(p) => ConstKey::Ptr(Arc::as_ptr(p) as usize),
        Value::Blob(p) => ConstKey::Ptr(Arc::as_ptr(p) as usize),
        Value::Error(p) => ConstKey::Ptr(Arc::as_ptr(p) as usize),
        Value::Channel(p) => ConstKey::Ptr(Arc::as_ptr(p) as usize),
        Value::Instance(p) => ConstKey::Ptr(Arc::as_ptr(p) as usize),
        Value::Function(f) => match f {
            Function::Primitive(p) => ConstKey::Ptr(Arc::as_ptr(p) as usize),
            Function::Continuation(p) => ConstKey::Ptr(Arc::as_ptr(p) as usize),
            Function::Closure { code, frame } => ConstKey::Pair(
                Arc::as_ptr(code) as usize,
                frame.as_ref().map_or(0, |f| Arc::as_ptr(f) as usize),
            ),
            Function::Apply => ConstKey::Ptr(1),
            Function::CallCC => ConstKey::Ptr(2),
            Function::Go => ConstKey::Ptr(3),
        },
    }
}

#[derive(Default)]
struct ConstantPool {
    map: FxHashMap<ConstKey, usize>,
    vec: Vec<Value>,
}

// -----------------------------------------------------------------------------
// VM STATE
// -----------------------------------------------------------------------------

/// The process-scoped interpreter state. Shared across tasks via
/// `Arc`; all mutation goes through the interior locks.
pub struct Vm {
    symbols: Mutex<FxHashMap<String, Value>>,
    macros: RwLock<FxHashMap<String, Value>>,
    constants: Mutex<ConstantPool>,
    pub stack_size: usize,
    verbose: AtomicBool,
    debug: AtomicBool,
    silenced: AtomicUsize,
    interrupted: AtomicBool,
}

impl Vm {
    pub fn new() -> Arc<Self> {
        Self::with_stack_size(DEFAULT_STACK_SIZE)
    }

    pub fn with_stack_size(stack_size: usize) -> Arc<Self> {
        Arc::new(Self {
            symbols: Mutex::new(FxHashMap::default()),
            macros: RwLock::new(FxHashMap::default()),
            constants: Mutex::new(ConstantPool::default()),
            stack_size,
            verbose: AtomicBool::new(false),
            debug: AtomicBool::new(false),
            silenced: AtomicUsize::new(0),
            interrupted: AtomicBool::new(false),
        })
    }

    /// Registers the primitive surface and loads the prelude. Returns
    /// the VM for chaining.
    pub fn init(self: &Arc<Self>) -> VesperResult<Arc<Self>> {
        builtin::init_primitives(self);
        loader::load_prelude(self)?;
        Ok(self.clone())
    }

    pub fn set_flags(&self, verbose: bool, debug: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
        self.debug.store(debug, Ordering::Relaxed);
    }

    pub fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed) && self.silenced.load(Ordering::Relaxed) == 0
    }

    pub fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed) && self.silenced.load(Ordering::Relaxed) == 0
    }

    /// Raises the process-wide interrupt flag; the active task aborts
    /// with `interrupt:` at its next closure entry.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::Release);
    }

    fn check_interrupt(&self) -> VesperResult<()> {
        if self.interrupted.swap(false, Ordering::AcqRel) {
            Err(VesperError::interrupt())
        } else {
            Ok(())
        }
    }

    // -- interning ------------------------------------------------------------

    /// Canonicalizes a name to its unique value for this VM. The name
    /// shape picks the kind: a trailing colon makes a keyword, angle
    /// brackets a type, anything else a symbol.
    pub fn intern(&self, name: &str) -> Value {
        let mut table = self.symbols.lock().unwrap();
        if let Some(v) = table.get(name) {
            return v.clone();
        }
        let obj = Arc::new(NameObj::new(name));
        let val = if name.ends_with(':') {
            Value::Keyword(obj)
        } else if is_valid_type_name(name) {
            Value::Type(obj)
        } else {
            Value::Symbol(obj)
        };
        table.insert(name.to_string(), val.clone());
        val
    }

    /// The interned type tag for a value.
    pub fn type_of(&self, val: &Value) -> Value {
        match val {
            Value::Instance(inst) => inst.tag.clone(),
            _ => self.intern(&val.type_name()),
        }
    }

    /// Keyword → symbol of the same base name; symbols pass through.
    pub fn to_symbol(&self, val: &Value) -> VesperResult<Value> {
        match val {
            Value::Symbol(_) => Ok(val.clone()),
            Value::Keyword(n) => Ok(self.intern(n.text.trim_end_matches(':'))),
            Value::Type(n) => Ok(self.intern(n.text.trim_matches(['<', '>']))),
            Value::String(s) => Ok(self.intern(s)),
            _ => Err(VesperError::argument(format!(
                "cannot convert to <symbol>: {}",
                val
            ))),
        }
    }

    /// Symbol/string → keyword with a trailing colon.
    pub fn to_keyword(&self, val: &Value) -> VesperResult<Value> {
        match val {
            Value::Keyword(_) => Ok(val.clone()),
            Value::Symbol(n) => Ok(self.intern(&format!("{}:", n.text))),
            Value::Type(n) => Ok(self.intern(&format!("{}:", n.text.trim_matches(['<', '>'])))),
            Value::String(s) => {
                if s.ends_with(':') {
                    Ok(self.intern(s))
                } else {
                    Ok(self.intern(&format!("{}:", s)))
                }
            }
            _ => Err(VesperError::argument(format!(
                "cannot convert to <keyword>: {}",
                val
            ))),
        }
    }

    /// Every symbol that currently carries a global binding.
    pub fn globals(&self) -> Vec<Value> {
        let table = self.symbols.lock().unwrap();
        let mut out: Vec<Value> = table
            .values()
            .filter(|v| match v {
                Value::Symbol(n) => n.global().is_some(),
                _ => false,
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name_text().cmp(&b.name_text()));
        out
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        match self.intern(name) {
            Value::Symbol(n) => n.global(),
            _ => None,
        }
    }

    pub fn define_global(&self, name: &str, val: Value) {
        if let Value::Symbol(n) = self.intern(name) {
            n.set_global(val);
        }
    }

    // -- macros ---------------------------------------------------------------

    pub fn define_macro(&self, name: &str, expander: Value) {
        self.macros.write().unwrap().insert(name.to_string(), expander);
    }

    pub fn get_macro(&self, sym: &Value) -> Option<Value> {
        let name = sym.name_text()?;
        self.macros.read().unwrap().get(name).cloned()
    }

    // -- constants ------------------------------------------------------------

    /// Adds a literal to the pool (deduplicated), returning its index.
    pub fn put_constant(&self, val: &Value) -> usize {
        let mut pool = self.constants.lock().unwrap();
        let key = const_key(val);
        if let Some(&idx) = pool.map.get(&key) {
            return idx;
        }
        let idx = pool.vec.len();
        pool.vec.push(val.clone());
        pool.map.insert(key, idx);
        idx
    }

    pub fn get_constant(&self, idx: usize) -> Value {
        self.constants.lock().unwrap().vec[idx].clone()
    }

    // -- forking --------------------------------------------------------------

    /// Deep-copies the environment maps into a fresh VM: new symbol
    /// objects with copied bindings, snapshots of the macro map and
    /// constants pool. Used for REPL isolation.
    pub fn fork(&self) -> Arc<Vm> {
        let vm = Vm::with_stack_size(self.stack_size);
        {
            let src = self.symbols.lock().unwrap();
            for (name, val) in src.iter() {
                let copy = vm.intern(name);
                if let (Value::Symbol(old), Value::Symbol(new)) = (val, &copy) {
                    if let Some(binding) = old.global() {
                        new.set_global(binding);
                    }
                }
            }
        }
        *vm.macros.write().unwrap() = self.macros.read().unwrap().clone();
        {
            let src = self.constants.lock().unwrap();
            let mut dst = vm.constants.lock().unwrap();
            let vec = src.vec.clone();
            for (i, v) in vec.iter().enumerate() {
                dst.map.insert(const_key(v), i);
            }
            dst.vec = vec;
        }
        vm
    }

    // -- evaluation entry points ----------------------------------------------

    /// Expands, compiles, and executes one top-level form.
    pub fn eval(self: &Arc<Self>, expr: &Value) -> VesperResult<Value> {
        let expanded = crate::expander::macroexpand(self, expr)?;
        if self.debug() {
            trace!(expanded = %expanded, "macroexpand");
        }
        let code = crate::compiler::compile(self, &expanded)?;
        self.execute(Arc::new(code))
    }

    /// Reads and evaluates every form in the source text, returning
    /// the value of the last one.
    pub fn eval_source(self: &Arc<Self>, source: &str) -> VesperResult<Value> {
        let forms = crate::reader::read_all(self, source, &Value::Null)?;
        let mut result = Value::Null;
        let mut cur = forms;
        while !cur.is_empty_list() {
            result = self.eval(&value::car(&cur))?;
            cur = value::cdr(&cur);
        }
        Ok(result)
    }

    /// Runs a zero-argument code object to completion, consulting the
    /// global `*top-handler*` on error.
    pub fn execute(self: &Arc<Self>, code: Arc<Code>) -> VesperResult<Value> {
        if code.argc != 0 {
            return Err(VesperError::argument(
                "cannot execute code that expects arguments",
            ));
        }
        match self.exec(code) {
            Ok(v) => Ok(v),
            Err(err) => self.catch_error(err),
        }
    }

    fn catch_error(self: &Arc<Self>, err: VesperError) -> VesperResult<Value> {
        if err.kind == ErrorKind::Interrupt {
            return Err(err);
        }
        if let Some(handler) = self.global("*top-handler*") {
            if matches!(handler, Value::Function(_)) {
                let errval = builtin::error_to_value(self, &err);
                return self.exec_call(&handler, &[errval]);
            }
        }
        Err(err)
    }

    /// Calls an arbitrary callable with the given arguments by running
    /// a synthesized thunk.
    pub fn exec_call(self: &Arc<Self>, fun: &Value, args: &[Value]) -> VesperResult<Value> {
        let mut code = Code::new(0, None, None, "");
        for arg in args.iter().rev() {
            code.emit_literal(self.put_constant(arg));
        }
        code.emit_literal(self.put_constant(fun));
        code.emit_call(args.len());
        code.emit_return();
        self.exec(Arc::new(code))
    }

    /// Runs a macro expander at compile time with verbose tracing
    /// silenced.
    pub fn exec_compile_time(self: &Arc<Self>, fun: &Value, expr: &Value) -> VesperResult<Value> {
        self.silenced.fetch_add(1, Ordering::Relaxed);
        let result = self.exec_call(fun, &[expr.clone()]);
        self.silenced.fetch_sub(1, Ordering::Relaxed);
        result
    }

    fn exec(self: &Arc<Self>, code: Arc<Code>) -> VesperResult<Value> {
        let mut machine = Machine {
            stack: vec![Value::Null; self.stack_size],
            sp: self.stack_size,
            env: Arc::new(Frame::root()),
            code,
            pc: 0,
        };
        match machine.run(self) {
            Ok(v) => Ok(v),
            Err(mut e) => {
                if let Some(code) = &machine.env.code {
                    e.annotate(&code.name);
                } else {
                    e.annotate(&machine.code.name);
                }
                Err(e)
            }
        }
    }
}

// -----------------------------------------------------------------------------
// FRAME CONSTRUCTION
// -----------------------------------------------------------------------------

/// Binds call arguments into a new frame per the callee's declared
/// pattern: fixed, rest, optional positional, or keyword.
fn build_frame(
    vm: &Vm,
    previous: Option<Arc<Frame>>,
    ret_code: Option<Arc<Code>>,
    ret_pc: usize,
    fcode: &Arc<Code>,
    fframe: &Option<Arc<Frame>>,
    args: &[Value],
) -> VesperResult<Frame> {
    let argc = args.len();
    let expected = fcode.argc;
    let mut elements: SmallVec<[Value; 5]> = SmallVec::new();
    match &fcode.defaults {
        None => {
            if argc != expected {
                return Err(VesperError::argument(format!(
                    "wrong number of args to {} (expected {}, got {})",
                    display_name(fcode),
                    expected,
                    argc
                )));
            }
            elements.extend(args.iter().cloned());
        }
        Some(defaults) => {
            if argc < expected {
                return Err(VesperError::argument(format!(
                    "wrong number of args to {} (expected at least {}, got {})",
                    display_name(fcode),
                    expected,
                    argc
                )));
            }
            let rest = defaults.is_empty();
            let extra = if rest { 1 } else { defaults.len() };
            let total = expected + extra;
            if rest {
                elements.extend(args[..expected].iter().cloned());
                elements.push(value::list_from_values(&args[expected..]));
            } else if let Some(keys) = &fcode.keys {
                let bindings = &args[expected..];
                if bindings.len() % 2 != 0 {
                    return Err(VesperError::argument(format!(
                        "bad keyword argument(s): {}",
                        value::list_from_values(bindings)
                    )));
                }
                elements.extend(args[..expected].iter().cloned());
                elements.extend(defaults.iter().cloned());
                let mut i = 0;
                while i < bindings.len() {
                    let key = vm.to_symbol(&bindings[i]).map_err(|_| {
                        VesperError::argument(format!("bad keyword argument: {}", bindings[i]))
                    })?;
                    let mut matched = false;
                    for (j, k) in keys.iter().enumerate() {
                        if value::identical(k, &key) {
                            elements[expected + j] = bindings[i + 1].clone();
                            matched = true;
                            break;
                        }
                    }
                    if !matched {
                        return Err(VesperError::argument(format!(
                            "undefined keyword argument: {}",
                            key
                        )));
                    }
                    i += 2;
                }
            } else {
                if argc > total {
                    return Err(VesperError::argument(format!(
                        "wrong number of args to {} (expected at most {}, got {})",
                        display_name(fcode),
                        total,
                        argc
                    )));
                }
                elements.extend(args.iter().cloned());
                for i in argc..total {
                    elements.push(defaults[i - expected].clone());
                }
            }
        }
    }
    Ok(Frame {
        previous,
        locals: fframe.clone(),
        code: Some(fcode.clone()),
        ret_code,
        ret_pc,
        elements: Mutex::new(elements),
    })
}

fn display_name(code: &Code) -> String {
    if code.name.is_empty() {
        "#[function]".to_string()
    } else {
        format!("#[function {}]", code.name)
    }
}

// -----------------------------------------------------------------------------
// EXECUTION
// -----------------------------------------------------------------------------

struct Machine {
    stack: Vec<Value>,
    sp: usize,
    env: Arc<Frame>,
    code: Arc<Code>,
    pc: usize,
}

/// Outcome of a call dispatch: keep running, or unwind out of `exec`
/// with a final value (top-level return).
enum Flow {
    Continue,
    Finish(Value),
}

impl Machine {
    #[inline]
    fn push(&mut self, val: Value) -> VesperResult<()> {
        if self.sp == 0 {
            return Err(VesperError::internal("value stack overflow"));
        }
        self.sp -= 1;
        self.stack[self.sp] = val;
        Ok(())
    }

    /// Resolves `LOCAL i j`: frame `i` steps out the lexical chain,
    /// slot `j` within it.
    fn local_frame(&self, depth: usize) -> VesperResult<Arc<Frame>> {
        let mut frame = self.env.clone();
        for _ in 0..depth {
            frame = frame
                .locals
                .clone()
                .ok_or_else(|| VesperError::internal("bad local frame depth"))?;
        }
        Ok(frame)
    }

    fn run(&mut self, vm: &Arc<Vm>) -> VesperResult<Value> {
        loop {
            let op = self.code.ops[self.pc];
            if vm.debug() {
                trace!(pc = self.pc, op = opcode::op_name(op), sp = self.sp, "step");
            }
            match op {
                opcode::OP_NONE => {
                    self.pc += 1;
                }
                opcode::OP_LITERAL => {
                    let val = vm.get_constant(self.code.ops[self.pc + 1]);
                    self.push(val)?;
                    self.pc += 2;
                }
                opcode::OP_GLOBAL => {
                    let sym = vm.get_constant(self.code.ops[self.pc + 1]);
                    let val = match &sym {
                        Value::Symbol(n) => n.global().unwrap_or(Value::Null),
                        _ => sym.clone(),
                    };
                    self.push(val)?;
                    self.pc += 2;
                }
                opcode::OP_DEF_GLOBAL => {
                    let sym = vm.get_constant(self.code.ops[self.pc + 1]);
                    if let Value::Symbol(n) = &sym {
                        n.set_global(self.stack[self.sp].clone());
                    }
                    self.pc += 2;
                }
                opcode::OP_UNDEF_GLOBAL => {
                    let sym = vm.get_constant(self.code.ops[self.pc + 1]);
                    if let Value::Symbol(n) = &sym {
                        n.unset_global();
                    }
                    self.pc += 2;
                }
                opcode::OP_DEF_MACRO => {
                    let sym = vm.get_constant(self.code.ops[self.pc + 1]);
                    let expander = self.stack[self.sp].clone();
                    if !matches!(expander, Value::Function(_)) {
                        return Err(VesperError::macro_error(format!(
                            "bad macro expander function: {}",
                            expander
                        )));
                    }
                    if let Some(name) = sym.name_text() {
                        vm.define_macro(name, expander);
                    }
                    self.stack[self.sp] = sym;
                    self.pc += 2;
                }
                opcode::OP_LOCAL => {
                    let i = self.code.ops[self.pc + 1];
                    let j = self.code.ops[self.pc + 2];
                    let frame = self.local_frame(i)?;
                    let val = frame.elements.lock().unwrap()[j].clone();
                    self.push(val)?;
                    self.pc += 3;
                }
                opcode::OP_SET_LOCAL => {
                    let i = self.code.ops[self.pc + 1];
                    let j = self.code.ops[self.pc + 2];
                    let frame = self.local_frame(i)?;
                    frame.elements.lock().unwrap()[j] = self.stack[self.sp].clone();
                    self.pc += 3;
                }
                opcode::OP_POP => {
                    self.sp += 1;
                    self.pc += 1;
                }
                opcode::OP_JUMP => {
                    self.pc += self.code.ops[self.pc + 1];
                }
                opcode::OP_JUMP_FALSE => {
                    let val = self.stack[self.sp].clone();
                    self.sp += 1;
                    if val.is_false() {
                        self.pc += self.code.ops[self.pc + 1];
                    } else {
                        self.pc += 2;
                    }
                }
                opcode::OP_CLOSURE => {
                    let inner = vm.get_constant(self.code.ops[self.pc + 1]);
                    let code = match inner {
                        Value::Code(c) => c,
                        other => {
                            return Err(VesperError::internal(format!(
                                "closure over a non-code constant: {}",
                                other
                            )))
                        }
                    };
                    self.push(Value::Function(Function::Closure {
                        code,
                        frame: Some(self.env.clone()),
                    }))?;
                    self.pc += 2;
                }
                opcode::OP_ARRAY => {
                    let n = self.code.ops[self.pc + 1];
                    let elements = self.stack[self.sp..self.sp + n].to_vec();
                    self.sp += n;
                    self.push(Value::array(elements))?;
                    self.pc += 2;
                }
                opcode::OP_STRUCT => {
                    let n = self.code.ops[self.pc + 1];
                    let fields = self.stack[self.sp..self.sp + n].to_vec();
                    self.sp += n;
                    let strct =
                        value::struct_from_flat(&fields).map_err(VesperError::argument)?;
                    self.push(strct)?;
                    self.pc += 2;
                }
                opcode::OP_USE => {
                    let sym = vm.get_constant(self.code.ops[self.pc + 1]);
                    let name = sym
                        .name_text()
                        .ok_or_else(|| VesperError::syntax("use expects a symbol"))?
                        .to_string();
                    loader::load_module(vm, &name)?;
                    self.push(sym)?;
                    self.pc += 2;
                }
                opcode::OP_CALL => {
                    let argc = self.code.ops[self.pc + 1];
                    let saved_pc = self.pc + 2;
                    let fun = self.stack[self.sp].clone();
                    self.sp += 1;
                    match self.dispatch(vm, fun, argc, saved_pc, false)? {
                        Flow::Continue => {}
                        Flow::Finish(v) => return Ok(v),
                    }
                }
                opcode::OP_TAIL_CALL => {
                    let argc = self.code.ops[self.pc + 1];
                    let fun = self.stack[self.sp].clone();
                    self.sp += 1;
                    match self.dispatch(vm, fun, argc, 0, true)? {
                        Flow::Continue => {}
                        Flow::Finish(v) => return Ok(v),
                    }
                }
                opcode::OP_RETURN => match &self.env.previous {
                    None => return Ok(self.stack[self.sp].clone()),
                    Some(prev) => {
                        let prev = prev.clone();
                        self.pc = self.env.ret_pc;
                        self.code = self
                            .env
                            .ret_code
                            .clone()
                            .ok_or_else(|| VesperError::internal("return without caller ops"))?;
                        self.env = prev;
                    }
                },
                other => {
                    return Err(VesperError::internal(format!(
                        "unknown opcode {} at pc {}",
                        other, self.pc
                    )))
                }
            }
        }
    }

    /// Applies the callable at the top of the stack. `is_tail` makes
    /// the callee resume directly at this frame's caller.
    fn dispatch(
        &mut self,
        vm: &Arc<Vm>,
        fun: Value,
        argc: usize,
        saved_pc: usize,
        is_tail: bool,
    ) -> VesperResult<Flow> {
        let mut fun = fun;
        let mut argc = argc;
        loop {
            match fun {
                Value::Function(Function::Closure { code: fcode, frame }) => {
                    vm.check_interrupt()?;
                    // Self tail call with a fixed arity: overwrite the
                    // current frame's elements and restart its ops.
                    if is_tail
                        && Arc::ptr_eq(&fcode, &self.code)
                        && fcode.defaults.is_none()
                        && argc == fcode.argc
                        && self
                            .env
                            .code
                            .as_ref()
                            .is_some_and(|c| Arc::ptr_eq(c, &fcode))
                    {
                        let args = self.stack[self.sp..self.sp + argc].to_vec();
                        let mut elements = self.env.elements.lock().unwrap();
                        elements.clear();
                        elements.extend(args);
                        drop(elements);
                        self.sp += argc;
                        self.pc = 0;
                        return Ok(Flow::Continue);
                    }
                    let (previous, ret_code, ret_pc) = if is_tail {
                        (
                            self.env.previous.clone(),
                            self.env.ret_code.clone(),
                            self.env.ret_pc,
                        )
                    } else {
                        (Some(self.env.clone()), Some(self.code.clone()), saved_pc)
                    };
                    let frame = build_frame(
                        vm,
                        previous,
                        ret_code,
                        ret_pc,
                        &fcode,
                        &frame,
                        &self.stack[self.sp..self.sp + argc],
                    )?;
                    self.sp += argc;
                    self.env = Arc::new(frame);
                    self.code = fcode;
                    self.pc = 0;
                    return Ok(Flow::Continue);
                }
                Value::Function(Function::Primitive(prim)) => {
                    let result = self.call_primitive(vm, &prim, argc)?;
                    self.sp += argc;
                    return self.deliver(result, saved_pc, is_tail);
                }
                Value::Keyword(_) => {
                    // A keyword applied to one argument reads that key
                    // from a struct.
                    if argc != 1 {
                        return Err(VesperError::argument(format!(
                            "keyword {} expected 1 argument, got {}",
                            fun, argc
                        )));
                    }
                    let target = value::deref_value(&self.stack[self.sp]);
                    let result = match &target {
                        Value::Struct(s) => s.get(&fun),
                        _ => {
                            return Err(VesperError::argument(format!(
                                "cannot apply keyword {} to {}",
                                fun,
                                target.type_name()
                            )))
                        }
                    };
                    self.sp += argc;
                    return self.deliver(result, saved_pc, is_tail);
                }
                Value::Function(Function::Apply) => {
                    if argc < 2 {
                        return Err(VesperError::argument(
                            "apply expected at least 2 arguments",
                        ));
                    }
                    fun = self.stack[self.sp].clone();
                    let last = self.stack[self.sp + argc - 1].clone();
                    if !last.is_list() {
                        return Err(VesperError::argument(
                            "apply expected a <list> as its final argument",
                        ));
                    }
                    let mut arglist = last;
                    for i in (1..argc - 1).rev() {
                        arglist = value::cons(self.stack[self.sp + i].clone(), arglist);
                    }
                    self.sp += argc;
                    let flat = value::list_to_vec(&arglist);
                    argc = flat.len();
                    if self.sp < argc {
                        return Err(VesperError::internal("value stack overflow"));
                    }
                    self.sp -= argc;
                    for (i, v) in flat.into_iter().enumerate() {
                        self.stack[self.sp + i] = v;
                    }
                }
                Value::Function(Function::CallCC) => {
                    if argc != 1 {
                        return Err(VesperError::argument("callcc expected 1 argument"));
                    }
                    let receiver = self.stack[self.sp].clone();
                    let (code, pc, frame) = if is_tail {
                        (
                            self.env.ret_code.clone(),
                            self.env.ret_pc,
                            self.env.previous.clone(),
                        )
                    } else {
                        (Some(self.code.clone()), saved_pc, Some(self.env.clone()))
                    };
                    let cont = Continuation {
                        code,
                        pc,
                        stack: self.stack[self.sp + 1..].to_vec(),
                        frame,
                    };
                    self.stack[self.sp] = Value::Function(Function::Continuation(Arc::new(cont)));
                    fun = receiver;
                }
                Value::Function(Function::Continuation(cont)) => {
                    if argc != 1 {
                        return Err(VesperError::argument(
                            "continuation expected 1 argument",
                        ));
                    }
                    let arg = self.stack[self.sp].clone();
                    self.sp = self.stack.len() - cont.stack.len();
                    self.stack[self.sp..].clone_from_slice(&cont.stack);
                    self.sp -= 1;
                    self.stack[self.sp] = arg;
                    match &cont.code {
                        None => return Ok(Flow::Finish(self.stack[self.sp].clone())),
                        Some(code) => {
                            self.code = code.clone();
                            self.pc = cont.pc;
                            self.env = cont
                                .frame
                                .clone()
                                .ok_or_else(|| VesperError::internal("continuation without frame"))?;
                        }
                    }
                    return Ok(Flow::Continue);
                }
                Value::Function(Function::Go) => {
                    if argc < 1 {
                        return Err(VesperError::argument("go expected at least 1 argument"));
                    }
                    let task = self.stack[self.sp].clone();
                    let args = self.stack[self.sp + 1..self.sp + argc].to_vec();
                    crate::channel::spawn_task(vm, task, args);
                    self.sp += argc;
                    return self.deliver(Value::Null, saved_pc, is_tail);
                }
                other => {
                    return Err(VesperError::argument(format!(
                        "cannot call a {}: {}",
                        other.type_name(),
                        other
                    )))
                }
            }
        }
    }

    /// Type-checks arguments against the primitive's declared
    /// signature, fills optional/keyword defaults, then invokes it.
    fn call_primitive(
        &mut self,
        vm: &Arc<Vm>,
        prim: &Arc<Primitive>,
        argc: usize,
    ) -> VesperResult<Value> {
        let args = &self.stack[self.sp..self.sp + argc];
        builtin::check_and_call(vm, prim, args)
    }

    /// Places a computed result where the calling convention expects
    /// it, then either resumes the caller (non-tail) or performs the
    /// frame return a tail call owes.
    fn deliver(&mut self, result: Value, saved_pc: usize, is_tail: bool) -> VesperResult<Flow> {
        self.push(result)?;
        if !is_tail {
            self.pc = saved_pc;
            return Ok(Flow::Continue);
        }
        match &self.env.previous {
            None => Ok(Flow::Finish(self.stack[self.sp].clone())),
            Some(prev) => {
                let prev = prev.clone();
                self.pc = self.env.ret_pc;
                self.code = self
                    .env
                    .ret_code
                    .clone()
                    .ok_or_else(|| VesperError::internal("return without caller ops"))?;
                self.env = prev;
                Ok(Flow::Continue)
            }
        }
    }
}
