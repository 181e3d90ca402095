//! # Opcode Module
//!
//! Linear instruction set for the Vesper virtual machine. Bytecode is
//! a flat `Vec<usize>` of opcodes with inline operands; jump operands
//! are relative deltas from the jump opcode's position, patched after
//! the branch target is known.
//!
//! ## Design Notes
//! - Code objects are immutable once `emit_return` has sealed them;
//!   closures and the constants table share them via `Arc`.
//! - Code objects round-trip to the textual form
//!   `(func (name argc defaults keys) (op operand…) …)`, which the
//!   compiler's `code` special form reads back.

use crate::error::{VesperError, VesperResult};
use crate::value::{self, Value};
use crate::vm::Vm;

// -----------------------------------------------------------------------------
// INSTRUCTION SET
// -----------------------------------------------------------------------------

pub const OP_NONE: usize = 0;
pub const OP_LITERAL: usize = 1;
pub const OP_LOCAL: usize = 2;
pub const OP_JUMP_FALSE: usize = 3;
pub const OP_JUMP: usize = 4;
pub const OP_TAIL_CALL: usize = 5;
pub const OP_CALL: usize = 6;
pub const OP_RETURN: usize = 7;
pub const OP_CLOSURE: usize = 8;
pub const OP_POP: usize = 9;
pub const OP_GLOBAL: usize = 10;
pub const OP_DEF_GLOBAL: usize = 11;
pub const OP_SET_LOCAL: usize = 12;
pub const OP_USE: usize = 13;
pub const OP_DEF_MACRO: usize = 14;
pub const OP_ARRAY: usize = 15;
pub const OP_STRUCT: usize = 16;
pub const OP_UNDEF_GLOBAL: usize = 17;

/// The symbolic name an opcode carries in decompiled form.
pub fn op_name(op: usize) -> &'static str {
    match op {
        OP_NONE => "none",
        OP_LITERAL => "literal",
        OP_LOCAL => "local",
        OP_JUMP_FALSE => "jumpfalse",
        OP_JUMP => "jump",
        OP_TAIL_CALL => "tailcall",
        OP_CALL => "call",
        OP_RETURN => "return",
        OP_CLOSURE => "closure",
        OP_POP => "pop",
        OP_GLOBAL => "global",
        OP_DEF_GLOBAL => "defglobal",
        OP_SET_LOCAL => "setlocal",
        OP_USE => "use",
        OP_DEF_MACRO => "defmacro",
        OP_ARRAY => "array",
        OP_STRUCT => "struct",
        OP_UNDEF_GLOBAL => "undefglobal",
        _ => "unknown",
    }
}

fn op_from_name(name: &str) -> Option<usize> {
    Some(match name {
        "none" => OP_NONE,
        "literal" => OP_LITERAL,
        "local" => OP_LOCAL,
        "jumpfalse" => OP_JUMP_FALSE,
        "jump" => OP_JUMP,
        "tailcall" => OP_TAIL_CALL,
        "call" => OP_CALL,
        "return" => OP_RETURN,
        "closure" => OP_CLOSURE,
        "pop" => OP_POP,
        "global" => OP_GLOBAL,
        "defglobal" => OP_DEF_GLOBAL,
        "setlocal" => OP_SET_LOCAL,
        "use" => OP_USE,
        "defmacro" => OP_DEF_MACRO,
        "array" => OP_ARRAY,
        "struct" => OP_STRUCT,
        "undefglobal" => OP_UNDEF_GLOBAL,
        _ => return None,
    })
}

// -----------------------------------------------------------------------------
// CODE OBJECT
// -----------------------------------------------------------------------------

/// Compiled bytecode plus its calling-convention metadata.
///
/// `defaults` selects the calling convention: `None` means fixed
/// arity; an empty vector means a rest parameter; a non-empty vector
/// means optional positional (or, with `keys` set, keyword) args.
pub struct Code {
    pub name: String,
    pub ops: Vec<usize>,
    pub argc: usize,
    pub defaults: Option<Vec<Value>>,
    pub keys: Option<Vec<Value>>,
}

impl Code {
    pub fn new(
        argc: usize,
        defaults: Option<Vec<Value>>,
        keys: Option<Vec<Value>>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            ops: Vec::new(),
            argc,
            defaults,
            keys,
        }
    }

    // -- emitters -------------------------------------------------------------

    pub fn emit_literal(&mut self, k: usize) {
        self.ops.push(OP_LITERAL);
        self.ops.push(k);
    }

    pub fn emit_global(&mut self, k: usize) {
        self.ops.push(OP_GLOBAL);
        self.ops.push(k);
    }

    pub fn emit_def_global(&mut self, k: usize) {
        self.ops.push(OP_DEF_GLOBAL);
        self.ops.push(k);
    }

    pub fn emit_undef_global(&mut self, k: usize) {
        self.ops.push(OP_UNDEF_GLOBAL);
        self.ops.push(k);
    }

    pub fn emit_def_macro(&mut self, k: usize) {
        self.ops.push(OP_DEF_MACRO);
        self.ops.push(k);
    }

    pub fn emit_use(&mut self, k: usize) {
        self.ops.push(OP_USE);
        self.ops.push(k);
    }

    pub fn emit_local(&mut self, i: usize, j: usize) {
        self.ops.push(OP_LOCAL);
        self.ops.push(i);
        self.ops.push(j);
    }

    pub fn emit_set_local(&mut self, i: usize, j: usize) {
        self.ops.push(OP_SET_LOCAL);
        self.ops.push(i);
        self.ops.push(j);
    }

    pub fn emit_call(&mut self, argc: usize) {
        self.ops.push(OP_CALL);
        self.ops.push(argc);
    }

    pub fn emit_tail_call(&mut self, argc: usize) {
        self.ops.push(OP_TAIL_CALL);
        self.ops.push(argc);
    }

    pub fn emit_return(&mut self) {
        self.ops.push(OP_RETURN);
    }

    pub fn emit_pop(&mut self) {
        self.ops.push(OP_POP);
    }

    pub fn emit_closure(&mut self, k: usize) {
        self.ops.push(OP_CLOSURE);
        self.ops.push(k);
    }

    pub fn emit_array(&mut self, n: usize) {
        self.ops.push(OP_ARRAY);
        self.ops.push(n);
    }

    pub fn emit_struct(&mut self, n: usize) {
        self.ops.push(OP_STRUCT);
        self.ops.push(n);
    }

    /// Emits a conditional jump with a zero placeholder, returning the
    /// operand location for `set_jump_location`.
    pub fn emit_jump_false(&mut self) -> usize {
        self.ops.push(OP_JUMP_FALSE);
        self.ops.push(0);
        self.ops.len() - 1
    }

    /// Emits an unconditional jump placeholder, returning the operand
    /// location for `set_jump_location`.
    pub fn emit_jump(&mut self) -> usize {
        self.ops.push(OP_JUMP);
        self.ops.push(0);
        self.ops.len() - 1
    }

    /// Patches a jump operand so the jump lands at the current end of
    /// the op stream. The stored offset is relative to the jump
    /// opcode's own position.
    pub fn set_jump_location(&mut self, loc: usize) {
        self.ops[loc] = self.ops.len() - loc + 1;
    }
}

// -----------------------------------------------------------------------------
// DECOMPILATION
// -----------------------------------------------------------------------------

/// Renders a code object to the nested S-expression form
/// `(func (name argc defaults keys) (op operand…) …)`.
pub fn decompile(vm: &Vm, code: &Code) -> Value {
    let defaults = match &code.defaults {
        None => Value::Null,
        Some(d) => Value::array(d.clone()),
    };
    let keys = match &code.keys {
        None => Value::Null,
        Some(k) => Value::array(k.clone()),
    };
    let header = value::list_from_values(&[
        Value::string(code.name.clone()),
        Value::Number(code.argc as f64),
        defaults,
        keys,
    ]);
    let mut forms = vec![vm.intern("func"), header];
    let ops = &code.ops;
    let mut pc = 0;
    while pc < ops.len() {
        let op = ops[pc];
        let form = match op {
            OP_LITERAL | OP_GLOBAL | OP_DEF_GLOBAL | OP_UNDEF_GLOBAL | OP_DEF_MACRO | OP_USE => {
                let operand = vm.get_constant(ops[pc + 1]);
                pc += 2;
                value::list_from_values(&[vm.intern(op_name(op)), operand])
            }
            OP_CLOSURE => {
                let inner = vm.get_constant(ops[pc + 1]);
                pc += 2;
                let nested = match &inner {
                    Value::Code(c) => decompile(vm, c),
                    _ => inner,
                };
                value::list_from_values(&[vm.intern("closure"), nested])
            }
            OP_LOCAL | OP_SET_LOCAL => {
                let (i, j) = (ops[pc + 1], ops[pc + 2]);
                pc += 3;
                value::list_from_values(&[
                    vm.intern(op_name(op)),
                    Value::Number(i as f64),
                    Value::Number(j as f64),
                ])
            }
            OP_JUMP | OP_JUMP_FALSE | OP_CALL | OP_TAIL_CALL | OP_ARRAY | OP_STRUCT => {
                let n = ops[pc + 1];
                pc += 2;
                value::list_from_values(&[vm.intern(op_name(op)), Value::Number(n as f64)])
            }
            _ => {
                pc += 1;
                value::list_from_values(&[vm.intern(op_name(op))])
            }
        };
        forms.push(form);
    }
    value::list_from_values(&forms)
}

// -----------------------------------------------------------------------------
// READ-BACK — the `code` special form
// -----------------------------------------------------------------------------

fn operand_int(form: &Value, idx: usize) -> VesperResult<usize> {
    let mut cur = form.clone();
    for _ in 0..idx {
        cur = value::cdr(&cur);
    }
    match value::car(&cur) {
        Value::Number(n) if n >= 0.0 => Ok(n as usize),
        other => Err(VesperError::syntax(format!(
            "bad bytecode operand: {}",
            other
        ))),
    }
}

/// Parses a `(func (name argc defaults keys) op …)` form into a fresh
/// code object, resolving literal operands through the constants pool.
pub fn load_code_form(vm: &Vm, form: &Value) -> VesperResult<Code> {
    if value::car(form).name_text() != Some("func") {
        return Err(VesperError::syntax(format!("bad code form: {}", form)));
    }
    let header = value::cadr(form);
    let name = match value::car(&header) {
        Value::String(s) => s.as_ref().clone(),
        Value::Symbol(n) => n.text.clone(),
        _ => String::new(),
    };
    let argc = operand_int(&header, 1)?;
    let defaults = match value::caddr(&header) {
        Value::Null => None,
        Value::Array(a) => Some(a.elements.lock().unwrap().clone()),
        other => {
            return Err(VesperError::syntax(format!(
                "bad code defaults: {}",
                other
            )))
        }
    };
    let keys = match value::car(&value::cdddr(&header)) {
        Value::Null => None,
        Value::Array(a) => Some(a.elements.lock().unwrap().clone()),
        other => return Err(VesperError::syntax(format!("bad code keys: {}", other))),
    };
    let mut code = Code::new(argc, defaults, keys, name);
    load_ops(vm, &mut code, &value::cddr(form))?;
    Ok(code)
}

/// Appends the op forms in `items` to `target`. Also accepts a whole
/// `(func …)` form as an item, adopting its metadata — this is how
/// the `code` special form loads a decompiled top-level thunk.
pub fn load_ops(vm: &Vm, target: &mut Code, items: &Value) -> VesperResult<()> {
    let mut cur = items.clone();
    while !cur.is_empty_list() {
        let form = value::car(&cur);
        cur = value::cdr(&cur);
        let head = value::car(&form);
        let name = head
            .name_text()
            .ok_or_else(|| VesperError::syntax(format!("bad bytecode op: {}", form)))?;
        if name == "func" {
            let loaded = load_code_form(vm, &form)?;
            target.name = loaded.name;
            target.argc = loaded.argc;
            target.defaults = loaded.defaults;
            target.keys = loaded.keys;
            target.ops.extend(loaded.ops);
            continue;
        }
        let op = op_from_name(name)
            .ok_or_else(|| VesperError::syntax(format!("unknown bytecode op: {}", form)))?;
        match op {
            OP_LITERAL | OP_GLOBAL | OP_DEF_GLOBAL | OP_UNDEF_GLOBAL | OP_DEF_MACRO | OP_USE => {
                let k = vm.put_constant(&value::cadr(&form));
                target.ops.push(op);
                target.ops.push(k);
            }
            OP_CLOSURE => {
                let inner = load_code_form(vm, &value::cadr(&form))?;
                let k = vm.put_constant(&Value::Code(std::sync::Arc::new(inner)));
                target.ops.push(op);
                target.ops.push(k);
            }
            OP_LOCAL | OP_SET_LOCAL => {
                let i = operand_int(&form, 1)?;
                let j = operand_int(&form, 2)?;
                target.ops.push(op);
                target.ops.push(i);
                target.ops.push(j);
            }
            OP_JUMP | OP_JUMP_FALSE | OP_CALL | OP_TAIL_CALL | OP_ARRAY | OP_STRUCT => {
                let n = operand_int(&form, 1)?;
                target.ops.push(op);
                target.ops.push(n);
            }
            _ => target.ops.push(op),
        }
    }
    Ok(())
}
