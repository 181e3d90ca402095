//! # Builtin Module
//!
//! The primitive surface: every built-in function carries a declared
//! signature (result type, required argument types, optional rest
//! type, optional defaults, optional keyword names), and the VM
//! checks argument counts and tags before calling through.

use crate::channel::{self, ChannelObj};
use crate::compiler;
use crate::error::{ErrorKind, VesperError, VesperResult};
use crate::expander;
use crate::loader;
use crate::opcode;
use crate::reader;
use crate::value::{self, Function, Value};
use crate::vm::Vm;
use crate::writer;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Native function signature for all primitives.
pub type PrimitiveFn = fn(&Arc<Vm>, &[Value]) -> VesperResult<Value>;

// -----------------------------------------------------------------------------
// PRIMITIVE DESCRIPTOR
// -----------------------------------------------------------------------------

/// A host function callable by the VM.
pub struct Primitive {
    pub name: &'static str,
    pub fun: PrimitiveFn,
    pub signature: String,
    /// Required argument count; `args` may declare more (optional or
    /// keyword parameters, with matching `defaults`).
    pub argc: usize,
    pub args: Vec<Value>,
    /// Any number of this type may follow the required args.
    /// Incompatible with `defaults`/`keys`.
    pub rest: Option<Value>,
    pub defaults: Option<Vec<Value>>,
    pub keys: Option<Vec<Value>>,
}

fn signature_text(result: &Value, args: &[Value], rest: &Option<Value>) -> String {
    let mut parts: Vec<String> = args.iter().map(|a| format!("{}", a)).collect();
    if let Some(r) = rest {
        parts.push(format!("{}*", r));
    }
    format!("({}) {}", parts.join(" "), result)
}

fn type_ok(declared: &Value, arg: &Value) -> bool {
    match declared.name_text() {
        Some("<any>") | None => true,
        Some(t) => arg.type_name() == t,
    }
}

/// Validates `args` against the primitive's declared signature,
/// fills optional/keyword defaults, and invokes the function.
pub fn check_and_call(vm: &Arc<Vm>, prim: &Primitive, args: &[Value]) -> VesperResult<Value> {
    let argc = args.len();
    if let Some(defaults) = &prim.defaults {
        let required = prim.argc;
        let total = prim.args.len();
        if argc < required {
            return Err(arity_error(prim, "at least", required, argc));
        }
        let mut argv: Vec<Value> = Vec::with_capacity(total);
        if let Some(keys) = &prim.keys {
            argv.extend_from_slice(&args[..required]);
            argv.extend(defaults.iter().cloned());
            let bindings = &args[required..];
            if bindings.len() % 2 != 0 {
                return Err(VesperError::argument(format!(
                    "{}: bad keyword argument(s): {}",
                    prim.name,
                    value::list_from_values(bindings)
                )));
            }
            let mut i = 0;
            while i < bindings.len() {
                let key = vm.to_keyword(&bindings[i]).map_err(|_| {
                    VesperError::argument(format!(
                        "{}: bad keyword argument: {}",
                        prim.name, bindings[i]
                    ))
                })?;
                let mut matched = false;
                for (j, k) in keys.iter().enumerate() {
                    if value::identical(k, &key) {
                        argv[required + j] = bindings[i + 1].clone();
                        matched = true;
                        break;
                    }
                }
                if !matched {
                    return Err(VesperError::argument(format!(
                        "{}: undefined keyword argument: {}",
                        prim.name, key
                    )));
                }
                i += 2;
            }
        } else {
            if argc > total {
                return Err(arity_error(prim, "at most", total, argc));
            }
            argv.extend_from_slice(args);
            for i in argc..total {
                argv.push(defaults[i - required].clone());
            }
        }
        check_types(prim, &argv)?;
        (prim.fun)(vm, &argv)
    } else if let Some(rest_type) = &prim.rest {
        if argc < prim.argc {
            return Err(arity_error(prim, "at least", prim.argc, argc));
        }
        check_types(prim, &args[..prim.argc])?;
        for arg in &args[prim.argc..] {
            if !type_ok(rest_type, arg) {
                return Err(type_error(prim, rest_type, arg));
            }
        }
        (prim.fun)(vm, args)
    } else {
        if argc != prim.argc {
            return Err(arity_error(prim, "exactly", prim.argc, argc));
        }
        check_types(prim, args)?;
        (prim.fun)(vm, args)
    }
}

fn check_types(prim: &Primitive, args: &[Value]) -> VesperResult<()> {
    for (declared, arg) in prim.args.iter().zip(args.iter()) {
        if !type_ok(declared, arg) {
            return Err(type_error(prim, declared, arg));
        }
    }
    Ok(())
}

fn arity_error(prim: &Primitive, qual: &str, expected: usize, got: usize) -> VesperError {
    VesperError::argument(format!(
        "{} expected {} {} argument{}, got {}",
        prim.name,
        qual,
        expected,
        if expected == 1 { "" } else { "s" },
        got
    ))
}

fn type_error(prim: &Primitive, declared: &Value, arg: &Value) -> VesperError {
    VesperError::argument(format!(
        "{} expected a {}, got a {}: {}",
        prim.name,
        declared,
        arg.type_name(),
        arg
    ))
}

// -----------------------------------------------------------------------------
// REGISTRATION HELPERS
// -----------------------------------------------------------------------------

fn primitive_value(
    vm: &Arc<Vm>,
    name: &'static str,
    fun: PrimitiveFn,
    result: &str,
    args: &[&str],
    rest: Option<&str>,
    defaults: Option<Vec<Value>>,
    keys: Option<&[&str]>,
) -> Value {
    let result = vm.intern(result);
    let args: Vec<Value> = args.iter().map(|t| vm.intern(t)).collect();
    let rest = rest.map(|t| vm.intern(t));
    let argc = args.len() - defaults.as_ref().map_or(0, |d| d.len());
    let keys = keys.map(|ks| ks.iter().map(|k| vm.intern(k)).collect());
    let signature = signature_text(&result, &args, &rest);
    Value::Function(Function::Primitive(Arc::new(Primitive {
        name,
        fun,
        signature,
        argc,
        args,
        rest,
        defaults,
        keys,
    })))
}

fn define_function(vm: &Arc<Vm>, name: &'static str, fun: PrimitiveFn, result: &str, args: &[&str]) {
    let val = primitive_value(vm, name, fun, result, args, None, None, None);
    vm.define_global(name, val);
}

fn define_function_rest_args(
    vm: &Arc<Vm>,
    name: &'static str,
    fun: PrimitiveFn,
    result: &str,
    args: &[&str],
    rest: &str,
) {
    let val = primitive_value(vm, name, fun, result, args, Some(rest), None, None);
    vm.define_global(name, val);
}

fn define_function_optional_args(
    vm: &Arc<Vm>,
    name: &'static str,
    fun: PrimitiveFn,
    result: &str,
    args: &[&str],
    defaults: Vec<Value>,
) {
    let val = primitive_value(vm, name, fun, result, args, None, Some(defaults), None);
    vm.define_global(name, val);
}

fn define_function_key_args(
    vm: &Arc<Vm>,
    name: &'static str,
    fun: PrimitiveFn,
    result: &str,
    args: &[&str],
    defaults: Vec<Value>,
    keys: &[&str],
) {
    let val = primitive_value(vm, name, fun, result, args, None, Some(defaults), Some(keys));
    vm.define_global(name, val);
}

/// Registers a reserved macro whose expander is a host function over
/// the whole form.
fn define_macro_primitive(vm: &Arc<Vm>, name: &'static str, fun: PrimitiveFn) {
    let val = primitive_value(vm, name, fun, "<any>", &["<any>"], None, None, None);
    vm.define_macro(name, val);
}

// -----------------------------------------------------------------------------
// INITIALIZATION
// -----------------------------------------------------------------------------

/// Defines the global functions, variables, and macros of the top
/// level environment.
pub fn init_primitives(vm: &Arc<Vm>) {
    define_macro_primitive(vm, "let", |vm, argv| expander::expand_let(vm, &argv[0]));
    define_macro_primitive(vm, "letrec", |vm, argv| expander::expand_letrec(vm, &argv[0]));
    define_macro_primitive(vm, "cond", |vm, argv| expander::expand_cond(vm, &argv[0]));
    define_macro_primitive(vm, "quasiquote", |vm, argv| {
        expander::expand_quasiquote(vm, &argv[0])
    });

    vm.define_global("null", Value::Null);
    vm.define_global("true", Value::Boolean(true));
    vm.define_global("false", Value::Boolean(false));

    vm.define_global("apply", Value::Function(Function::Apply));
    vm.define_global("callcc", Value::Function(Function::CallCC));
    vm.define_global("go", Value::Function(Function::Go));

    define_function(vm, "globals", prim_globals, "<array>", &[]);
    define_function(vm, "version", prim_version, "<string>", &[]);
    define_function(vm, "boolean?", prim_boolean_p, "<boolean>", &["<any>"]);
    define_function(vm, "not", prim_not, "<boolean>", &["<any>"]);
    define_function(vm, "equal?", prim_equal_p, "<boolean>", &["<any>", "<any>"]);
    define_function(vm, "identical?", prim_identical_p, "<boolean>", &["<any>", "<any>"]);
    define_function(vm, "null?", prim_null_p, "<boolean>", &["<any>"]);
    define_function(vm, "def?", prim_defined_p, "<boolean>", &["<symbol>"]);

    define_function(vm, "type", prim_type, "<type>", &["<any>"]);
    define_function(vm, "value", prim_value, "<any>", &["<any>"]);
    define_function(vm, "instance", prim_instance, "<any>", &["<type>", "<any>"]);

    define_function(vm, "type?", prim_type_p, "<boolean>", &["<any>"]);
    define_function(vm, "type-name", prim_type_name, "<symbol>", &["<type>"]);
    define_function(vm, "keyword?", prim_keyword_p, "<boolean>", &["<any>"]);
    define_function(vm, "keyword-name", prim_keyword_name, "<symbol>", &["<keyword>"]);
    define_function(vm, "to-keyword", prim_to_keyword, "<keyword>", &["<any>"]);
    define_function(vm, "symbol?", prim_symbol_p, "<boolean>", &["<any>"]);
    define_function_rest_args(vm, "symbol", prim_symbol, "<symbol>", &["<any>"], "<any>");

    define_function(vm, "string?", prim_string_p, "<boolean>", &["<any>"]);
    define_function_rest_args(vm, "string", prim_string, "<string>", &[], "<any>");
    define_function(vm, "to-string", prim_to_string, "<string>", &["<any>"]);
    define_function(vm, "string-length", prim_string_length, "<number>", &["<string>"]);
    define_function(vm, "split", prim_split, "<list>", &["<string>", "<string>"]);
    define_function(vm, "join", prim_join, "<string>", &["<list>", "<string>"]);
    define_function(vm, "character?", prim_character_p, "<boolean>", &["<any>"]);
    define_function(vm, "to-character", prim_to_character, "<character>", &["<any>"]);
    define_function(
        vm,
        "substring",
        prim_substring,
        "<string>",
        &["<string>", "<number>", "<number>"],
    );

    define_function(vm, "blob?", prim_blob_p, "<boolean>", &["<any>"]);
    define_function(vm, "to-blob", prim_to_blob, "<blob>", &["<any>"]);
    define_function(vm, "make-blob", prim_make_blob, "<blob>", &["<number>"]);
    define_function(vm, "blob-length", prim_blob_length, "<number>", &["<blob>"]);
    define_function(vm, "blob-ref", prim_blob_ref, "<number>", &["<blob>", "<number>"]);

    define_function(vm, "number?", prim_number_p, "<boolean>", &["<any>"]);
    define_function(vm, "int?", prim_int_p, "<boolean>", &["<any>"]);
    define_function(vm, "float?", prim_float_p, "<boolean>", &["<any>"]);
    define_function(vm, "to-number", prim_to_number, "<number>", &["<any>"]);
    define_function(vm, "int", prim_int, "<number>", &["<any>"]);
    define_function(vm, "floor", prim_floor, "<number>", &["<number>"]);
    define_function(vm, "ceiling", prim_ceiling, "<number>", &["<number>"]);
    define_function(vm, "inc", prim_inc, "<number>", &["<number>"]);
    define_function(vm, "dec", prim_dec, "<number>", &["<number>"]);
    define_function(vm, "+", prim_add, "<number>", &["<number>", "<number>"]);
    define_function(vm, "-", prim_sub, "<number>", &["<number>", "<number>"]);
    define_function(vm, "*", prim_mul, "<number>", &["<number>", "<number>"]);
    define_function(vm, "/", prim_div, "<number>", &["<number>", "<number>"]);
    define_function(vm, "quotient", prim_quotient, "<number>", &["<number>", "<number>"]);
    define_function(vm, "remainder", prim_remainder, "<number>", &["<number>", "<number>"]);
    define_function(vm, "modulo", prim_remainder, "<number>", &["<number>", "<number>"]);
    define_function(vm, "=", prim_num_equal, "<boolean>", &["<number>", "<number>"]);
    define_function(vm, "<=", prim_num_le, "<boolean>", &["<number>", "<number>"]);
    define_function(vm, ">=", prim_num_ge, "<boolean>", &["<number>", "<number>"]);
    define_function(vm, ">", prim_num_gt, "<boolean>", &["<number>", "<number>"]);
    define_function(vm, "<", prim_num_lt, "<boolean>", &["<number>", "<number>"]);
    define_function(vm, "zero?", prim_zero_p, "<boolean>", &["<number>"]);
    define_function(vm, "abs", prim_abs, "<number>", &["<number>"]);
    define_function(vm, "exp", prim_exp, "<number>", &["<number>"]);
    define_function(vm, "log", prim_log, "<number>", &["<number>"]);
    define_function(vm, "sin", prim_sin, "<number>", &["<number>"]);
    define_function(vm, "cos", prim_cos, "<number>", &["<number>"]);
    define_function(vm, "tan", prim_tan, "<number>", &["<number>"]);
    define_function(vm, "asin", prim_asin, "<number>", &["<number>"]);
    define_function(vm, "acos", prim_acos, "<number>", &["<number>"]);
    define_function(vm, "atan", prim_atan, "<number>", &["<number>"]);
    define_function(vm, "atan2", prim_atan2, "<number>", &["<number>", "<number>"]);

    define_function(vm, "seal!", prim_seal, "<any>", &["<any>"]);

    define_function(vm, "list?", prim_list_p, "<boolean>", &["<any>"]);
    define_function(vm, "empty?", prim_empty_p, "<boolean>", &["<list>"]);
    define_function(vm, "to-list", prim_to_list, "<list>", &["<any>"]);
    define_function(vm, "cons", prim_cons, "<list>", &["<any>", "<list>"]);
    define_function(vm, "car", prim_car, "<any>", &["<list>"]);
    define_function(vm, "cdr", prim_cdr, "<list>", &["<list>"]);
    define_function(vm, "set-car!", prim_set_car, "<null>", &["<list>", "<any>"]);
    define_function(vm, "set-cdr!", prim_set_cdr, "<null>", &["<list>", "<list>"]);
    define_function(vm, "list-length", prim_list_length, "<number>", &["<list>"]);
    define_function(vm, "reverse", prim_reverse, "<list>", &["<list>"]);
    define_function_rest_args(vm, "list", prim_list, "<list>", &[], "<any>");
    define_function_rest_args(vm, "concat", prim_concat, "<list>", &[], "<list>");
    define_function(vm, "flatten", prim_flatten, "<list>", &["<list>"]);

    define_function(vm, "array?", prim_array_p, "<boolean>", &["<any>"]);
    define_function(vm, "to-array", prim_to_array, "<array>", &["<any>"]);
    define_function_rest_args(vm, "array", prim_array, "<array>", &[], "<any>");
    define_function_optional_args(
        vm,
        "make-array",
        prim_make_array,
        "<array>",
        &["<number>", "<any>"],
        vec![Value::Null],
    );
    define_function(vm, "array-length", prim_array_length, "<number>", &["<array>"]);
    define_function(vm, "array-ref", prim_array_ref, "<any>", &["<array>", "<number>"]);
    define_function(
        vm,
        "array-set!",
        prim_array_set,
        "<null>",
        &["<array>", "<number>", "<any>"],
    );

    define_function(vm, "struct?", prim_struct_p, "<boolean>", &["<any>"]);
    define_function(vm, "to-struct", prim_to_struct, "<struct>", &["<any>"]);
    define_function_rest_args(vm, "struct", prim_struct, "<struct>", &[], "<any>");
    define_function(vm, "make-struct", prim_make_struct, "<struct>", &["<number>"]);
    define_function(vm, "struct-length", prim_struct_length, "<number>", &["<struct>"]);
    define_function(vm, "has?", prim_has_p, "<boolean>", &["<any>", "<any>"]);
    define_function(vm, "get", prim_get, "<any>", &["<any>", "<any>"]);
    define_function(vm, "put!", prim_put, "<null>", &["<struct>", "<any>", "<any>"]);
    define_function(vm, "unput!", prim_unput, "<null>", &["<struct>", "<any>"]);
    define_function(vm, "keys", prim_keys, "<list>", &["<any>"]);
    define_function(vm, "values", prim_values, "<list>", &["<any>"]);

    define_function(vm, "function?", prim_function_p, "<boolean>", &["<any>"]);
    define_function(
        vm,
        "function-signature",
        prim_function_signature,
        "<string>",
        &["<function>"],
    );

    define_function(vm, "slurp", prim_slurp, "<string>", &["<string>"]);
    define_function(vm, "spit", prim_spit, "<null>", &["<string>", "<string>"]);
    define_function_key_args(
        vm,
        "read",
        prim_read,
        "<any>",
        &["<string>", "<type>"],
        vec![vm.intern("<any>")],
        &["keys:"],
    );
    define_function_key_args(
        vm,
        "read-all",
        prim_read_all,
        "<any>",
        &["<string>", "<type>"],
        vec![vm.intern("<any>")],
        &["keys:"],
    );
    define_function_key_args(
        vm,
        "write",
        prim_write,
        "<string>",
        &["<any>", "<string>"],
        vec![Value::string("")],
        &["indent:"],
    );
    define_function_key_args(
        vm,
        "write-all",
        prim_write_all,
        "<string>",
        &["<any>", "<string>"],
        vec![Value::string("")],
        &["indent:"],
    );
    define_function_rest_args(vm, "print", prim_print, "<null>", &[], "<any>");
    define_function_rest_args(vm, "println", prim_println, "<null>", &[], "<any>");
    define_function_key_args(
        vm,
        "json",
        prim_json,
        "<string>",
        &["<any>", "<string>"],
        vec![Value::string("")],
        &["indent:"],
    );

    define_function(vm, "macroexpand", prim_macroexpand, "<any>", &["<any>"]);
    define_function(vm, "compile", prim_compile, "<code>", &["<any>"]);
    define_function(vm, "decompile", prim_decompile, "<list>", &["<code>"]);

    define_function_rest_args(vm, "make-error", prim_make_error, "<error>", &[], "<any>");
    define_function(vm, "error?", prim_error_p, "<boolean>", &["<any>"]);
    define_function(vm, "error-data", prim_error_data, "<any>", &["<error>"]);
    define_function(vm, "uncaught-error", prim_uncaught_error, "<null>", &["<error>"]);

    define_function(vm, "now", prim_now, "<number>", &[]);
    define_function(vm, "since", prim_since, "<number>", &["<number>"]);
    define_function(vm, "sleep", prim_sleep, "<number>", &["<number>"]);
    define_function(vm, "timestamp", prim_timestamp, "<string>", &[]);

    define_function_key_args(
        vm,
        "channel",
        prim_channel,
        "<channel>",
        &["<string>", "<number>"],
        vec![Value::string(""), Value::Number(0.0)],
        &["name:", "bufsize:"],
    );
    define_function_optional_args(
        vm,
        "send",
        prim_send,
        "<boolean>",
        &["<channel>", "<any>", "<number>"],
        vec![Value::Number(-1.0)],
    );
    define_function_optional_args(
        vm,
        "recv",
        prim_recv,
        "<any>",
        &["<channel>", "<number>"],
        vec![Value::Number(-1.0)],
    );
    define_function(vm, "close", prim_close, "<null>", &["<any>"]);

    define_function(
        vm,
        "set-random-seed!",
        prim_set_random_seed,
        "<null>",
        &["<number>"],
    );
    define_function_rest_args(vm, "random", prim_random, "<number>", &[], "<number>");

    define_function(vm, "getenv", prim_getenv, "<string>", &["<string>"]);
    define_function(vm, "load", prim_load, "<string>", &["<string>"]);
}

// -----------------------------------------------------------------------------
// SHARED HELPERS
// -----------------------------------------------------------------------------

fn num(v: &Value) -> f64 {
    match v {
        Value::Number(n) => *n,
        _ => 0.0,
    }
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.as_ref().clone(),
        other => format!("{}", other),
    }
}

fn bool_value(b: bool) -> VesperResult<Value> {
    Ok(Value::Boolean(b))
}

/// Converts a host error into the `<error>` value handed to
/// `*top-handler*`.
pub fn error_to_value(vm: &Arc<Vm>, err: &VesperError) -> Value {
    if let Some(v) = &err.value {
        return v.clone();
    }
    value::make_error(vec![
        vm.intern(err.kind.keyword()),
        Value::string(err.message.clone()),
    ])
}

/// Wraps a value with a type tag; a tag matching the value's natural
/// type is the identity.
pub fn make_instance(_vm: &Arc<Vm>, tag: &Value, data: &Value) -> VesperResult<Value> {
    match tag {
        Value::Type(n) => {
            if data.type_name() == n.text {
                Ok(data.clone())
            } else {
                Ok(Value::instance(tag.clone(), data.clone()))
            }
        }
        _ => Err(VesperError::argument(format!(
            "instance expected a <type>, got {}",
            tag
        ))),
    }
}

// -----------------------------------------------------------------------------
// PRIMITIVE BODIES
// -----------------------------------------------------------------------------

fn prim_globals(vm: &Arc<Vm>, _argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::array(vm.globals()))
}

fn prim_version(_vm: &Arc<Vm>, _argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::string(crate::VERSION))
}

fn prim_boolean_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::Boolean(_)))
}

fn prim_not(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(argv[0].is_false())
}

fn prim_equal_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(value::equal(&argv[0], &argv[1]))
}

fn prim_identical_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(value::identical(&argv[0], &argv[1]))
}

fn prim_null_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::Null))
}

fn prim_defined_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Symbol(n) => bool_value(n.global().is_some()),
        _ => bool_value(false),
    }
}

fn prim_type(vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(vm.type_of(&argv[0]))
}

fn prim_value(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(value::deref_value(&argv[0]))
}

fn prim_instance(vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    make_instance(vm, &argv[0], &argv[1])
}

fn prim_type_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::Type(_)))
}

fn prim_type_name(vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    vm.to_symbol(&argv[0])
}

fn prim_keyword_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::Keyword(_)))
}

fn prim_keyword_name(vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    vm.to_symbol(&argv[0])
}

fn prim_to_keyword(vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    vm.to_keyword(&argv[0])
}

fn prim_symbol_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(argv[0].is_symbol())
}

fn prim_symbol(vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let mut name = String::new();
    for part in argv {
        name.push_str(&text(part));
    }
    if name.is_empty() {
        return Err(VesperError::argument("symbol requires a non-empty name"));
    }
    Ok(vm.intern(&name))
}

fn prim_string_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::String(_)))
}

fn prim_string(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let mut s = String::new();
    for part in argv {
        s.push_str(&text(part));
    }
    Ok(Value::string(s))
}

fn prim_to_string(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::string(format!("{}", argv[0])))
}

fn prim_string_length(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(text(&argv[0]).chars().count() as f64))
}

fn prim_split(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let s = text(&argv[0]);
    let sep = text(&argv[1]);
    let parts: Vec<Value> = if sep.is_empty() {
        s.chars().map(|c| Value::string(c.to_string())).collect()
    } else {
        s.split(&sep).map(Value::string).collect()
    };
    Ok(value::list_from_values(&parts))
}

fn prim_join(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let sep = text(&argv[1]);
    let parts: Vec<String> = value::list_to_vec(&argv[0])
        .iter()
        .map(|v| format!("{}", v))
        .collect();
    Ok(Value::string(parts.join(&sep)))
}

fn prim_character_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::Character(_)))
}

fn prim_to_character(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Character(_) => Ok(argv[0].clone()),
        Value::String(s) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Character(c)),
                _ => Err(VesperError::argument(
                    "to-character expected a single-character <string>",
                )),
            }
        }
        Value::Number(n) => char::from_u32(*n as u32)
            .map(Value::Character)
            .ok_or_else(|| VesperError::argument(format!("bad character code: {}", n))),
        other => Err(VesperError::argument(format!(
            "cannot convert to <character>: {}",
            other
        ))),
    }
}

fn prim_substring(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let chars: Vec<char> = text(&argv[0]).chars().collect();
    let mut start = num(&argv[1]) as i64;
    let mut end = num(&argv[2]) as i64;
    if start < 0 {
        start = 0;
    } else if start > chars.len() as i64 {
        return Ok(Value::string(""));
    }
    if end < start {
        return Ok(Value::string(""));
    } else if end > chars.len() as i64 {
        end = chars.len() as i64;
    }
    Ok(Value::string(
        chars[start as usize..end as usize].iter().collect::<String>(),
    ))
}

fn prim_blob_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::Blob(_)))
}

fn prim_to_blob(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Blob(_) => Ok(argv[0].clone()),
        Value::String(s) => Ok(Value::Blob(Arc::new(s.as_bytes().to_vec()))),
        other => Err(VesperError::argument(format!(
            "cannot convert to <blob>: {}",
            other
        ))),
    }
}

fn prim_make_blob(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let size = num(&argv[0]) as usize;
    Ok(Value::Blob(Arc::new(vec![0u8; size])))
}

fn prim_blob_length(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Blob(b) => Ok(Value::Number(b.len() as f64)),
        _ => Err(VesperError::argument("blob-length expected a <blob>")),
    }
}

fn prim_blob_ref(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Blob(b) => {
            let idx = num(&argv[1]) as i64;
            if idx < 0 || idx >= b.len() as i64 {
                return Err(VesperError::argument("blob index out of range"));
            }
            Ok(Value::Number(b[idx as usize] as f64))
        }
        _ => Err(VesperError::argument("blob-ref expected a <blob>")),
    }
}

fn prim_number_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::Number(_)))
}

fn prim_int_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::Number(n) if n.fract() == 0.0))
}

fn prim_float_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::Number(n) if n.fract() != 0.0))
}

fn prim_to_number(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Number(_) => Ok(argv[0].clone()),
        Value::String(s) => s
            .parse::<f64>()
            .map(Value::Number)
            .map_err(|_| VesperError::argument(format!("cannot convert to <number>: {:?}", s))),
        Value::Character(c) => Ok(Value::Number(*c as u32 as f64)),
        Value::Boolean(b) => Ok(Value::Number(if *b { 1.0 } else { 0.0 })),
        other => Err(VesperError::argument(format!(
            "cannot convert to <number>: {}",
            other
        ))),
    }
}

fn prim_int(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Number(n) => Ok(Value::Number(n.trunc())),
        Value::Character(c) => Ok(Value::Number(*c as u32 as f64)),
        Value::String(s) => s
            .parse::<f64>()
            .map(|n| Value::Number(n.trunc()))
            .map_err(|_| VesperError::argument(format!("cannot convert to int: {:?}", s))),
        other => Err(VesperError::argument(format!(
            "cannot convert to int: {}",
            other
        ))),
    }
}

fn prim_floor(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]).floor()))
}

fn prim_ceiling(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]).ceil()))
}

fn prim_inc(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]) + 1.0))
}

fn prim_dec(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]) - 1.0))
}

fn prim_add(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]) + num(&argv[1])))
}

fn prim_sub(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]) - num(&argv[1])))
}

fn prim_mul(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]) * num(&argv[1])))
}

fn prim_div(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]) / num(&argv[1])))
}

fn prim_quotient(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let denom = num(&argv[1]) as i64;
    if denom == 0 {
        return Err(VesperError::argument("quotient: divide by zero"));
    }
    Ok(Value::Number((num(&argv[0]) as i64 / denom) as f64))
}

fn prim_remainder(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let denom = num(&argv[1]) as i64;
    if denom == 0 {
        return Err(VesperError::argument("remainder: divide by zero"));
    }
    Ok(Value::Number((num(&argv[0]) as i64 % denom) as f64))
}

fn prim_num_equal(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(value::number_equal(num(&argv[0]), num(&argv[1])))
}

fn prim_num_le(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(num(&argv[0]) <= num(&argv[1]))
}

fn prim_num_ge(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(num(&argv[0]) >= num(&argv[1]))
}

fn prim_num_gt(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(num(&argv[0]) > num(&argv[1]))
}

fn prim_num_lt(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(num(&argv[0]) < num(&argv[1]))
}

fn prim_zero_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(value::number_equal(num(&argv[0]), 0.0))
}

fn prim_abs(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]).abs()))
}

fn prim_exp(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]).exp()))
}

fn prim_log(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]).ln()))
}

fn prim_sin(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]).sin()))
}

fn prim_cos(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]).cos()))
}

fn prim_tan(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]).tan()))
}

fn prim_asin(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]).asin()))
}

fn prim_acos(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]).acos()))
}

fn prim_atan(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]).atan()))
}

fn prim_atan2(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(num(&argv[0]).atan2(num(&argv[1]))))
}

fn prim_seal(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    if argv[0].seal() {
        Ok(argv[0].clone())
    } else {
        Err(VesperError::argument(format!("cannot seal! {}", argv[0])))
    }
}

fn prim_list_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(argv[0].is_list())
}

fn prim_empty_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(argv[0].is_empty_list())
}

fn prim_to_list(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let val = value::deref_value(&argv[0]);
    match &val {
        Value::List(_) => Ok(val),
        Value::Array(_) => Ok(value::array_to_list(&val)),
        Value::Struct(s) => {
            let pairs: Vec<Value> = s
                .pairs()
                .into_iter()
                .map(|(k, v)| value::list_from_values(&[k, v]))
                .collect();
            Ok(value::list_from_values(&pairs))
        }
        Value::String(s) => {
            let chars: Vec<Value> = s.chars().map(Value::Character).collect();
            Ok(value::list_from_values(&chars))
        }
        other => Err(VesperError::argument(format!(
            "cannot convert to <list>: {}",
            other
        ))),
    }
}

fn prim_cons(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(value::cons(argv[0].clone(), argv[1].clone()))
}

fn prim_car(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(value::car(&argv[0]))
}

fn prim_cdr(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(value::cdr(&argv[0]))
}

fn prim_set_car(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    if argv[0].is_empty_list() {
        return Err(VesperError::argument("set-car! expected a non-empty <list>"));
    }
    if argv[0].is_sealed() {
        return Err(VesperError::argument("set-car! on sealed list"));
    }
    value::set_car(&argv[0], argv[1].clone());
    Ok(Value::Null)
}

fn prim_set_cdr(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    if argv[0].is_empty_list() {
        return Err(VesperError::argument("set-cdr! expected a non-empty <list>"));
    }
    if argv[0].is_sealed() {
        return Err(VesperError::argument("set-cdr! on sealed list"));
    }
    value::set_cdr(&argv[0], argv[1].clone());
    Ok(Value::Null)
}

fn prim_list_length(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match value::list_length(&argv[0]) {
        Some(n) => Ok(Value::Number(n as f64)),
        None => Ok(Value::Number(-1.0)),
    }
}

fn prim_reverse(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(value::reverse(&argv[0]))
}

fn prim_list(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(value::list_from_values(argv))
}

fn prim_concat(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(value::concat(argv))
}

fn prim_flatten(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(value::flatten(&argv[0]))
}

fn prim_array_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::Array(_)))
}

fn prim_to_array(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let val = value::deref_value(&argv[0]);
    match &val {
        Value::Array(_) => Ok(val),
        Value::List(_) => Ok(Value::array(value::list_to_vec(&val))),
        Value::String(s) => Ok(Value::array(s.chars().map(Value::Character).collect())),
        Value::Struct(s) => {
            let pairs: Vec<Value> = s
                .pairs()
                .into_iter()
                .map(|(k, v)| Value::array(vec![k, v]))
                .collect();
            Ok(Value::array(pairs))
        }
        other => Err(VesperError::argument(format!(
            "cannot convert to <array>: {}",
            other
        ))),
    }
}

fn prim_array(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::array(argv.to_vec()))
}

fn prim_make_array(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let size = num(&argv[0]) as usize;
    Ok(Value::array(vec![argv[1].clone(); size]))
}

fn prim_array_length(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Array(a) => Ok(Value::Number(a.len() as f64)),
        _ => Err(VesperError::argument("array-length expected an <array>")),
    }
}

fn prim_array_ref(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Array(a) => {
            let elements = a.elements.lock().unwrap();
            let idx = num(&argv[1]) as i64;
            if idx < 0 || idx >= elements.len() as i64 {
                return Err(VesperError::argument("array index out of range"));
            }
            Ok(elements[idx as usize].clone())
        }
        _ => Err(VesperError::argument("array-ref expected an <array>")),
    }
}

fn prim_array_set(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    if argv[0].is_sealed() {
        return Err(VesperError::argument("array-set! on sealed array"));
    }
    match &argv[0] {
        Value::Array(a) => {
            let mut elements = a.elements.lock().unwrap();
            let idx = num(&argv[1]) as i64;
            if idx < 0 || idx >= elements.len() as i64 {
                return Err(VesperError::argument("array index out of range"));
            }
            elements[idx as usize] = argv[2].clone();
            Ok(Value::Null)
        }
        _ => Err(VesperError::argument("array-set! expected an <array>")),
    }
}

fn prim_struct_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::Struct(_)))
}

fn prim_to_struct(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let val = value::deref_value(&argv[0]);
    match &val {
        Value::Struct(_) => Ok(val),
        Value::List(_) => {
            let items = value::list_to_vec(&val);
            struct_from_bindings(&items)
        }
        Value::Array(a) => {
            let items = a.elements.lock().unwrap().clone();
            struct_from_bindings(&items)
        }
        other => Err(VesperError::argument(format!(
            "to-struct cannot accept argument of type {}",
            other.type_name()
        ))),
    }
}

/// Accepts flat key/value items, `(k v)` pairs, or `[k v]` pairs.
fn struct_from_bindings(items: &[Value]) -> VesperResult<Value> {
    let mut flat = Vec::with_capacity(items.len());
    let mut i = 0;
    while i < items.len() {
        let item = &items[i];
        match item {
            Value::List(_) if !item.is_empty_list() => {
                if value::list_length(item) != Some(2) {
                    return Err(VesperError::argument(format!("bad struct binding: {}", item)));
                }
                flat.push(value::car(item));
                flat.push(value::cadr(item));
                i += 1;
            }
            Value::Array(a) => {
                let elements = a.elements.lock().unwrap();
                if elements.len() != 2 {
                    return Err(VesperError::argument(format!("bad struct binding: {}", item)));
                }
                flat.push(elements[0].clone());
                flat.push(elements[1].clone());
                i += 1;
            }
            _ => {
                if i + 1 == items.len() {
                    return Err(VesperError::argument(format!(
                        "mismatched keyword/value in list: {}",
                        item
                    )));
                }
                flat.push(item.clone());
                flat.push(items[i + 1].clone());
                i += 2;
            }
        }
    }
    value::struct_from_flat(&flat).map_err(VesperError::argument)
}

fn prim_struct(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    value::struct_from_flat(argv).map_err(VesperError::argument)
}

fn prim_make_struct(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let capacity = num(&argv[0]) as usize;
    Ok(Value::Struct(Arc::new(value::StructObj::with_capacity(
        capacity,
    ))))
}

fn prim_struct_length(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Struct(s) => Ok(Value::Number(s.len() as f64)),
        _ => Err(VesperError::argument("struct-length expected a <struct>")),
    }
}

fn struct_of(name: &str, val: &Value) -> VesperResult<Arc<value::StructObj>> {
    match value::deref_value(val) {
        Value::Struct(s) => Ok(s),
        other => Err(VesperError::argument(format!(
            "{} expected a <struct> argument, got a {}",
            name,
            other.type_name()
        ))),
    }
}

fn prim_has_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let s = struct_of("has?", &argv[0])?;
    bool_value(!matches!(s.get(&argv[1]), Value::Null))
}

fn prim_get(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let s = struct_of("get", &argv[0])?;
    Ok(s.get(&argv[1]))
}

fn prim_put(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    if !value::is_valid_struct_key(&argv[1]) {
        return Err(VesperError::argument(format!("bad struct key: {}", argv[1])));
    }
    if argv[0].is_sealed() {
        return Err(VesperError::argument("put! on sealed struct"));
    }
    let s = struct_of("put!", &argv[0])?;
    s.put(argv[1].clone(), argv[2].clone());
    Ok(Value::Null)
}

fn prim_unput(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    if !value::is_valid_struct_key(&argv[1]) {
        return Err(VesperError::argument(format!("bad struct key: {}", argv[1])));
    }
    if argv[0].is_sealed() {
        return Err(VesperError::argument("unput! on sealed struct"));
    }
    let s = struct_of("unput!", &argv[0])?;
    s.unput(&argv[1]);
    Ok(Value::Null)
}

fn prim_keys(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let s = struct_of("keys", &argv[0])?;
    let keys: Vec<Value> = s.pairs().into_iter().map(|(k, _)| k).collect();
    Ok(value::list_from_values(&keys))
}

fn prim_values(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let s = struct_of("values", &argv[0])?;
    let vals: Vec<Value> = s.pairs().into_iter().map(|(_, v)| v).collect();
    Ok(value::list_from_values(&vals))
}

fn prim_function_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::Function(_)))
}

fn prim_function_signature(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Function(Function::Primitive(p)) => Ok(Value::string(p.signature.clone())),
        Value::Function(Function::Closure { code, .. }) => {
            let params: Vec<String> = (0..code.argc).map(|_| "<any>".to_string()).collect();
            Ok(Value::string(format!("({}) <any>", params.join(" "))))
        }
        _ => Ok(Value::string("(<any>*) <any>")),
    }
}

fn prim_slurp(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    loader::slurp_file(&text(&argv[0])).map(Value::string)
}

fn prim_spit(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    loader::spit_file(&text(&argv[0]), &text(&argv[1]))?;
    Ok(Value::Null)
}

fn prim_read(vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    reader::read(vm, &text(&argv[0]), &argv[1])
}

fn prim_read_all(vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    reader::read_all(vm, &text(&argv[0]), &argv[1])
}

fn prim_write(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::string(writer::write_indent(&argv[0], &text(&argv[1]))))
}

fn prim_write_all(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::string(writer::write_all_indent(
        &argv[0],
        &text(&argv[1]),
    )))
}

fn prim_print(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    for v in argv {
        print!("{}", v);
    }
    use std::io::Write;
    let _ = std::io::stdout().flush();
    Ok(Value::Null)
}

fn prim_println(vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    prim_print(vm, argv)?;
    println!();
    Ok(Value::Null)
}

fn prim_json(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    writer::write_to_string(&argv[0], true, &text(&argv[1])).map(Value::string)
}

fn prim_macroexpand(vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    expander::macroexpand(vm, &argv[0])
}

fn prim_compile(vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let expanded = expander::macroexpand(vm, &argv[0])?;
    let code = compiler::compile(vm, &expanded)?;
    Ok(Value::Code(Arc::new(code)))
}

fn prim_decompile(vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Code(code) => Ok(opcode::decompile(vm, code)),
        _ => Err(VesperError::argument("decompile expected a <code>")),
    }
}

fn prim_make_error(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(value::make_error(argv.to_vec()))
}

fn prim_error_p(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    bool_value(matches!(argv[0], Value::Error(_)))
}

fn prim_error_data(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Error(e) => Ok(e.data.clone()),
        _ => Err(VesperError::argument("error-data expected an <error>")),
    }
}

fn prim_uncaught_error(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let kind = match &argv[0] {
        Value::Error(e) => match &e.data {
            Value::Array(a) => a
                .elements
                .lock()
                .unwrap()
                .first()
                .and_then(|tag| tag.name_text().map(ErrorKind::from_keyword))
                .unwrap_or(ErrorKind::Error),
            _ => ErrorKind::Error,
        },
        _ => ErrorKind::Error,
    };
    Err(VesperError::from_value(
        kind,
        format!("{}", argv[0]),
        argv[0].clone(),
    ))
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn prim_now(_vm: &Arc<Vm>, _argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(now_seconds()))
}

fn prim_since(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    Ok(Value::Number(now_seconds() - num(&argv[0])))
}

fn prim_sleep(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let secs = num(&argv[0]);
    if secs > 0.0 {
        std::thread::sleep(Duration::from_secs_f64(secs));
    }
    Ok(Value::Number(now_seconds()))
}

/// Days-to-civil conversion (proleptic Gregorian), avoiding a
/// calendar dependency for one formatting primitive.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn prim_timestamp(_vm: &Arc<Vm>, _argv: &[Value]) -> VesperResult<Value> {
    let total = now_seconds();
    let secs = total as i64;
    let millis = ((total - secs as f64) * 1000.0) as u32;
    let days = secs.div_euclid(86400);
    let rem = secs.rem_euclid(86400);
    let (year, month, day) = civil_from_days(days);
    let (hour, minute, second) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    Ok(Value::string(format!(
        "{}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        year, month, day, hour, minute, second, millis
    )))
}

fn prim_channel(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let name = text(&argv[0]);
    let bufsize = num(&argv[1]) as usize;
    Ok(Value::Channel(Arc::new(ChannelObj::new(name, bufsize))))
}

fn prim_send(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Channel(ch) => bool_value(channel::send(ch, argv[1].clone(), num(&argv[2]))),
        _ => Err(VesperError::argument("send expected a <channel>")),
    }
}

fn prim_recv(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Channel(ch) => Ok(channel::recv(ch, num(&argv[1]))),
        _ => Err(VesperError::argument("recv expected a <channel>")),
    }
}

fn prim_close(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match &argv[0] {
        Value::Channel(ch) => {
            ch.close();
            Ok(Value::Null)
        }
        _ => Err(VesperError::argument("close expected a channel")),
    }
}

static RNG: LazyLock<Mutex<StdRng>> = LazyLock::new(|| Mutex::new(StdRng::from_entropy()));

fn prim_set_random_seed(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    *RNG.lock().unwrap() = StdRng::seed_from_u64(num(&argv[0]) as u64);
    Ok(Value::Null)
}

fn prim_random(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    let (min, max) = match argv.len() {
        0 => (0.0, 1.0),
        1 => (0.0, num(&argv[0])),
        2 => (num(&argv[0]), num(&argv[1])),
        n => {
            return Err(VesperError::argument(format!(
                "random expected 0 to 2 arguments, got {}",
                n
            )))
        }
    };
    let r: f64 = RNG.lock().unwrap().r#gen();
    Ok(Value::Number(min + r * (max - min)))
}

fn prim_getenv(_vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    match std::env::var(text(&argv[0])) {
        Ok(s) if !s.is_empty() => Ok(Value::string(s)),
        _ => Ok(Value::Null),
    }
}

fn prim_load(vm: &Arc<Vm>, argv: &[Value]) -> VesperResult<Value> {
    loader::load_module(vm, &text(&argv[0]))?;
    Ok(argv[0].clone())
}
