//! # Compiler Module
//!
//! Lowers a macro-expanded expression to a code object in a single
//! pass — no intermediate tree. The compile-time environment is a
//! list of argument-symbol frames, innermost first; resolving a
//! symbol scans outward and emits `LOCAL i j` on a hit, `GLOBAL k`
//! otherwise.
//!
//! ## Key Design
//! - `is_tail` marks expressions whose value is the function's value;
//!   terminal instructions in tail position emit `RETURN` (calls
//!   lower to `TAIL_CALL`).
//! - `ignore_result` marks intermediate `do` expressions; producing
//!   instructions are balanced with a trailing `POP`.
//! - Call arguments compile in reverse so runtime evaluation pushes
//!   them left to right on the downward stack; the callee compiles
//!   after its arguments.

use crate::error::{VesperError, VesperResult};
use crate::opcode::{self, Code};
use crate::value::{self, Value};
use crate::vm::Vm;

use std::sync::Arc;

/// Compiles one expanded expression into a zero-argument code object
/// that computes its value and returns it.
pub fn compile(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Code> {
    let mut target = Code::new(0, None, None, "");
    compile_expr(vm, &mut target, &Value::empty_list(), expr, false, false, "")?;
    target.emit_return();
    Ok(target)
}

/// Finds a symbol in the compile-time environment, returning its
/// frame depth and slot.
fn calculate_location(sym: &Value, env: &Value) -> Option<(usize, usize)> {
    let mut i = 0;
    let mut env = env.clone();
    while !env.is_empty_list() {
        let mut j = 0;
        let mut frame = value::car(&env);
        while !frame.is_empty_list() {
            if value::identical(&value::car(&frame), sym) {
                return Some((i, j));
            }
            j += 1;
            frame = value::cdr(&frame);
        }
        i += 1;
        env = value::cdr(&env);
    }
    None
}

fn compile_expr(
    vm: &Arc<Vm>,
    target: &mut Code,
    env: &Value,
    expr: &Value,
    is_tail: bool,
    ignore_result: bool,
    context: &str,
) -> VesperResult<()> {
    match expr {
        Value::Keyword(_) | Value::Type(_) => {
            compile_self_eval_literal(vm, target, expr, is_tail, ignore_result)
        }
        Value::Symbol(_) => compile_symbol(vm, target, env, expr, is_tail, ignore_result),
        Value::List(_) => compile_list(vm, target, env, expr, is_tail, ignore_result, context),
        Value::Array(_) => compile_array(vm, target, env, expr, is_tail, ignore_result, context),
        Value::Struct(_) => compile_struct(vm, target, env, expr, is_tail, ignore_result, context),
        _ => compile_self_eval_literal(vm, target, expr, is_tail, ignore_result),
    }
}

fn compile_self_eval_literal(
    vm: &Arc<Vm>,
    target: &mut Code,
    expr: &Value,
    is_tail: bool,
    ignore_result: bool,
) -> VesperResult<()> {
    if !ignore_result {
        target.emit_literal(vm.put_constant(expr));
        if is_tail {
            target.emit_return();
        }
    }
    Ok(())
}

fn compile_symbol(
    vm: &Arc<Vm>,
    target: &mut Code,
    env: &Value,
    expr: &Value,
    is_tail: bool,
    ignore_result: bool,
) -> VesperResult<()> {
    if vm.get_macro(expr).is_some() {
        return Err(VesperError::macro_error(format!(
            "cannot use a macro as a value: {}",
            expr
        )));
    }
    if let Some((i, j)) = calculate_location(expr, env) {
        target.emit_local(i, j);
    } else {
        target.emit_global(vm.put_constant(expr));
    }
    if ignore_result {
        target.emit_pop();
    } else if is_tail {
        target.emit_return();
    }
    Ok(())
}

fn compile_list(
    vm: &Arc<Vm>,
    target: &mut Code,
    env: &Value,
    expr: &Value,
    is_tail: bool,
    ignore_result: bool,
    context: &str,
) -> VesperResult<()> {
    if expr.is_empty_list() {
        return compile_self_eval_literal(vm, target, expr, is_tail, ignore_result);
    }
    let lstlen = value::list_length(expr)
        .ok_or_else(|| VesperError::syntax(format!("improper list in expression: {}", expr)))?;
    if lstlen == 0 {
        return Err(VesperError::syntax(format!("bad expression: {}", expr)));
    }
    let head = value::car(expr);
    match head.name_text() {
        Some("quote") => {
            // (quote <datum>)
            if lstlen != 2 {
                return Err(syntax_in(expr));
            }
            if !ignore_result {
                target.emit_literal(vm.put_constant(&value::cadr(expr)));
                if is_tail {
                    target.emit_return();
                }
            }
            Ok(())
        }
        Some("do") => {
            // (do <expr> ...)
            compile_sequence(vm, target, env, &value::cdr(expr), is_tail, ignore_result, context)
        }
        Some("if") => {
            // (if <pred> <consequent>)
            // (if <pred> <consequent> <antecedent>)
            if lstlen == 3 || lstlen == 4 {
                compile_if_else(
                    vm,
                    target,
                    env,
                    &value::cadr(expr),
                    &value::caddr(expr),
                    &value::cdddr(expr),
                    is_tail,
                    ignore_result,
                    context,
                )
            } else {
                Err(syntax_in(expr))
            }
        }
        Some("def") => {
            // (def <name> <val>)
            if lstlen < 3 {
                return Err(syntax_in(expr));
            }
            let sym = value::cadr(expr);
            let val = value::caddr(expr);
            let name = sym.name_text().unwrap_or_default().to_string();
            compile_expr(vm, target, env, &val, false, false, &name)?;
            target.emit_def_global(vm.put_constant(&sym));
            if ignore_result {
                target.emit_pop();
            } else if is_tail {
                target.emit_return();
            }
            Ok(())
        }
        Some("undef") => {
            // (undef <name>)
            if lstlen != 2 {
                return Err(syntax_in(expr));
            }
            let sym = value::cadr(expr);
            if !sym.is_symbol() {
                return Err(syntax_in(expr));
            }
            target.emit_undef_global(vm.put_constant(&sym));
            if !ignore_result {
                target.emit_literal(vm.put_constant(&sym));
                if is_tail {
                    target.emit_return();
                }
            }
            Ok(())
        }
        Some("defmacro") => {
            // (defmacro <name> <expander-fn>)
            if lstlen != 3 {
                return Err(syntax_in(expr));
            }
            let sym = value::cadr(expr);
            if !sym.is_symbol() {
                return Err(syntax_in(expr));
            }
            let name = sym.name_text().unwrap_or_default().to_string();
            compile_expr(vm, target, env, &value::caddr(expr), false, false, &name)?;
            target.emit_def_macro(vm.put_constant(&sym));
            if ignore_result {
                target.emit_pop();
            } else if is_tail {
                target.emit_return();
            }
            Ok(())
        }
        Some("fn") => {
            // (fn <params> <expr> ...) — see compile_fn for the
            // permitted parameter shapes.
            if lstlen < 3 {
                return Err(syntax_in(expr));
            }
            let args = value::cadr(expr);
            let body = value::cddr(expr);
            compile_fn(vm, target, env, &args, &body, is_tail, ignore_result, context)
        }
        Some("set!") => {
            // (set! <name> <val>)
            if lstlen != 3 {
                return Err(syntax_in(expr));
            }
            let sym = value::cadr(expr);
            if !sym.is_symbol() {
                return Err(syntax_in(expr));
            }
            compile_expr(vm, target, env, &value::caddr(expr), false, false, context)?;
            if let Some((i, j)) = calculate_location(&sym, env) {
                target.emit_set_local(i, j);
            } else {
                // No lexical binding: degenerates to a global
                // definition, matching the original semantics.
                target.emit_def_global(vm.put_constant(&sym));
            }
            if ignore_result {
                target.emit_pop();
            } else if is_tail {
                target.emit_return();
            }
            Ok(())
        }
        Some("code") => opcode::load_ops(vm, target, &value::cdr(expr)),
        Some("use") => compile_use(vm, target, &value::cdr(expr)),
        _ => {
            let (fun, args) = optimize_funcall(vm, &head, &value::cdr(expr));
            compile_funcall(vm, target, env, &fun, &args, is_tail, ignore_result, context)
        }
    }
}

fn syntax_in(expr: &Value) -> VesperError {
    VesperError::syntax(format!("{}", expr))
}

fn compile_sequence(
    vm: &Arc<Vm>,
    target: &mut Code,
    env: &Value,
    exprs: &Value,
    is_tail: bool,
    ignore_result: bool,
    context: &str,
) -> VesperResult<()> {
    if exprs.is_empty_list() {
        return Err(VesperError::syntax("(do) requires at least one expression"));
    }
    let mut exprs = exprs.clone();
    while !value::cdr(&exprs).is_empty_list() {
        compile_expr(vm, target, env, &value::car(&exprs), false, true, context)?;
        exprs = value::cdr(&exprs);
    }
    // The last expression inherits the surrounding tail position.
    compile_expr(vm, target, env, &value::car(&exprs), is_tail, ignore_result, context)
}

/// Rewrites `(+ 1 x)`/`(+ x 1)` to `(inc x)` and `(- x 1)` to
/// `(dec x)`. The only peephole the compiler performs.
fn optimize_funcall(vm: &Arc<Vm>, fun: &Value, args: &Value) -> (Value, Value) {
    if value::list_length(args) == Some(2) {
        let one = Value::Number(1.0);
        match fun.name_text() {
            Some("+") => {
                if value::equal(&one, &value::car(args)) {
                    return (vm.intern("inc"), value::cdr(args));
                }
                if value::equal(&one, &value::cadr(args)) {
                    return (vm.intern("inc"), value::list_from_values(&[value::car(args)]));
                }
            }
            Some("-") => {
                if value::equal(&one, &value::cadr(args)) {
                    return (vm.intern("dec"), value::list_from_values(&[value::car(args)]));
                }
            }
            _ => {}
        }
    }
    (fun.clone(), args.clone())
}

fn compile_funcall(
    vm: &Arc<Vm>,
    target: &mut Code,
    env: &Value,
    fun: &Value,
    args: &Value,
    is_tail: bool,
    ignore_result: bool,
    context: &str,
) -> VesperResult<()> {
    let argc = value::list_length(args)
        .ok_or_else(|| VesperError::syntax(format!("bad function call: {}", value::cons(fun.clone(), args.clone()))))?;
    compile_args(vm, target, env, args, context)?;
    compile_expr(vm, target, env, fun, false, false, context)?;
    if is_tail {
        target.emit_tail_call(argc);
    } else {
        target.emit_call(argc);
        if ignore_result {
            target.emit_pop();
        }
    }
    Ok(())
}

/// Arguments compile in reverse source order.
fn compile_args(
    vm: &Arc<Vm>,
    target: &mut Code,
    env: &Value,
    args: &Value,
    context: &str,
) -> VesperResult<()> {
    if !args.is_empty_list() {
        compile_args(vm, target, env, &value::cdr(args), context)?;
        compile_expr(vm, target, env, &value::car(args), false, false, context)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn compile_if_else(
    vm: &Arc<Vm>,
    target: &mut Code,
    env: &Value,
    predicate: &Value,
    consequent: &Value,
    antecedent_opt: &Value,
    is_tail: bool,
    ignore_result: bool,
    context: &str,
) -> VesperResult<()> {
    let antecedent = if antecedent_opt.is_empty_list() {
        Value::Null
    } else {
        value::car(antecedent_opt)
    };
    compile_expr(vm, target, env, predicate, false, false, context)?;
    let loc1 = target.emit_jump_false();
    compile_expr(vm, target, env, consequent, is_tail, ignore_result, context)?;
    let mut loc2 = 0;
    if !is_tail {
        loc2 = target.emit_jump();
    }
    target.set_jump_location(loc1);
    compile_expr(vm, target, env, &antecedent, is_tail, ignore_result, context)?;
    if !is_tail {
        target.set_jump_location(loc2);
    }
    Ok(())
}

fn compile_array(
    vm: &Arc<Vm>,
    target: &mut Code,
    env: &Value,
    expr: &Value,
    is_tail: bool,
    ignore_result: bool,
    context: &str,
) -> VesperResult<()> {
    // Array literal: the elements are evaluated.
    let elements = match expr {
        Value::Array(a) => a.elements.lock().unwrap().clone(),
        _ => return Err(syntax_in(expr)),
    };
    for obj in elements.iter().rev() {
        compile_expr(vm, target, env, obj, false, false, context)?;
    }
    if !ignore_result {
        target.emit_array(elements.len());
        if is_tail {
            target.emit_return();
        }
    }
    Ok(())
}

fn compile_struct(
    vm: &Arc<Vm>,
    target: &mut Code,
    env: &Value,
    expr: &Value,
    is_tail: bool,
    ignore_result: bool,
    context: &str,
) -> VesperResult<()> {
    // Struct literal: keys and values are evaluated alternately.
    let pairs = match expr {
        Value::Struct(s) => s.pairs(),
        _ => return Err(syntax_in(expr)),
    };
    let mut vals = Vec::with_capacity(pairs.len() * 2);
    for (k, v) in pairs {
        vals.push(k);
        vals.push(v);
    }
    for obj in vals.iter().rev() {
        compile_expr(vm, target, env, obj, false, false, context)?;
    }
    if !ignore_result {
        target.emit_struct(vals.len());
        if is_tail {
            target.emit_return();
        }
    }
    Ok(())
}

fn compile_use(vm: &Arc<Vm>, target: &mut Code, rest: &Value) -> VesperResult<()> {
    if value::list_length(rest) != Some(1) {
        return Err(VesperError::syntax(format!("(use ...): {}", rest)));
    }
    let sym = value::car(rest);
    if !sym.is_symbol() {
        return Err(syntax_in(rest));
    }
    target.emit_use(vm.put_constant(&sym));
    Ok(())
}

// -----------------------------------------------------------------------------
// FUNCTION COMPILATION
// -----------------------------------------------------------------------------

/// Compiles `(fn <params> <body>…)`. Permitted parameter shapes:
///
/// - `sym` — all args as a list bound to `sym`
/// - `()` / `(a b …)` — fixed arity
/// - `(a b & rest)` — required plus rest
/// - `(a b [c (d 2)])` — required plus optional positional
/// - `(a b {k1: v1 k2: v2})` — required plus keyword parameters
///
/// Rest cannot be combined with optional or keyword parameters.
#[allow(clippy::too_many_arguments)]
fn compile_fn(
    vm: &Arc<Vm>,
    target: &mut Code,
    env: &Value,
    args: &Value,
    body: &Value,
    is_tail: bool,
    ignore_result: bool,
    context: &str,
) -> VesperResult<()> {
    let mut argc = 0usize;
    let mut syms: Vec<Value> = Vec::new();
    let mut defaults: Option<Vec<Value>> = None;
    let mut keys: Option<Vec<Value>> = None;
    let mut rest = false;

    let mut tmp = args.clone();
    if !tmp.is_symbol() {
        if matches!(tmp, Value::Array(_)) {
            // Allow clojure-style parameter lists for convenience.
            tmp = value::array_to_list(&tmp);
        }
        while tmp.is_list() && !tmp.is_empty_list() {
            let a = value::car(&tmp);
            match &a {
                Value::Array(optional) => {
                    // Optional positional parameters, each `sym` or
                    // `(sym default)`.
                    if !value::cdr(&tmp).is_empty_list() {
                        return Err(syntax_in(&tmp));
                    }
                    let mut defs = Vec::new();
                    for entry in optional.elements.lock().unwrap().iter() {
                        let (sym, def) = if entry.is_list() {
                            (value::car(entry), value::cadr(entry))
                        } else {
                            (entry.clone(), Value::Null)
                        };
                        if !sym.is_symbol() {
                            return Err(syntax_in(&tmp));
                        }
                        syms.push(sym);
                        defs.push(def);
                    }
                    defaults = Some(defs);
                    tmp = Value::empty_list();
                    break;
                }
                Value::Struct(keyword_params) => {
                    // Keyword parameters with declared defaults.
                    if !value::cdr(&tmp).is_empty_list() {
                        return Err(syntax_in(&tmp));
                    }
                    let mut defs = Vec::new();
                    let mut key_syms = Vec::new();
                    for (key, def) in keyword_params.pairs() {
                        let sym = if key.is_list()
                            && value::car(&key).name_text() == Some("quote")
                            && !value::cdr(&key).is_empty_list()
                        {
                            value::cadr(&key)
                        } else {
                            vm.to_symbol(&key).map_err(|_| syntax_in(&tmp))?
                        };
                        if !sym.is_symbol() {
                            return Err(syntax_in(&tmp));
                        }
                        syms.push(sym.clone());
                        key_syms.push(sym);
                        defs.push(def);
                    }
                    defaults = Some(defs);
                    keys = Some(key_syms);
                    tmp = Value::empty_list();
                    break;
                }
                _ => {
                    if !a.is_symbol() {
                        return Err(syntax_in(&tmp));
                    }
                    if a.name_text() == Some("&") {
                        rest = true;
                    } else if rest {
                        syms.push(a.clone());
                        defaults = Some(Vec::new());
                        tmp = Value::empty_list();
                        break;
                    } else {
                        argc += 1;
                        syms.push(a.clone());
                    }
                    tmp = value::cdr(&tmp);
                }
            }
        }
    }
    if !tmp.is_empty_list() {
        if tmp.is_symbol() {
            // (fn sym ...) — everything lands in one rest list.
            syms.push(tmp);
            defaults = Some(Vec::new());
        } else {
            return Err(syntax_in(&tmp));
        }
    }

    let params = value::list_from_values(&syms);
    let new_env = value::cons(params, env.clone());
    let mut fn_code = Code::new(argc, defaults, keys, context);
    compile_sequence(vm, &mut fn_code, &new_env, body, true, false, context)?;
    if !ignore_result {
        target.emit_closure(vm.put_constant(&Value::Code(Arc::new(fn_code))));
        if is_tail {
            target.emit_return();
        }
    }
    Ok(())
}
