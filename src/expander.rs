//! # Expander Module
//!
//! Outside-in macro expansion. Reserved forms are handled directly;
//! user macros are compiled functions the expander runs through the
//! VM's compile-time path. `let`, `letrec`, `cond`, and `quasiquote`
//! are registered as macros over the expansion functions here.

use crate::error::{VesperError, VesperResult};
use crate::value::{self, Function, Value};
use crate::vm::Vm;

use std::sync::Arc;

/// Returns the expansion of all macros in the expression.
pub fn macroexpand(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    if expr.is_list() && !expr.is_empty_list() {
        return macroexpand_list(vm, expr);
    }
    Ok(expr.clone())
}

fn macroexpand_list(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    if expr.is_empty_list() {
        return Ok(expr.clone());
    }
    let head = value::car(expr);
    let expanded_head = if head.is_symbol() {
        if let Some(result) = expand_primitive(vm, &head, expr)? {
            return Ok(result);
        }
        head
    } else if head.is_list() && !head.is_empty_list() {
        macroexpand_list(vm, &head)?
    } else {
        head
    };
    let tail = expand_sequence(vm, &value::cdr(expr))?;
    Ok(value::cons(expanded_head, tail))
}

/// Expands each list item of a sequence; atoms pass through.
fn expand_sequence(vm: &Arc<Vm>, seq: &Value) -> VesperResult<Value> {
    let mut result = Vec::new();
    let mut seq = seq.clone();
    while !seq.is_empty_list() {
        let item = value::car(&seq);
        if item.is_list() && !item.is_empty_list() {
            result.push(macroexpand_list(vm, &item)?);
        } else {
            result.push(item);
        }
        seq = value::cdr(&seq);
    }
    Ok(value::list_from_values(&result))
}

/// Handles the reserved forms; returns None when the head is neither
/// reserved nor a macro, leaving the caller to walk children.
fn expand_primitive(vm: &Arc<Vm>, head: &Value, expr: &Value) -> VesperResult<Option<Value>> {
    match head.name_text() {
        Some("quote") => Ok(Some(expr.clone())),
        Some("do") => Ok(Some(expand_sequence(vm, expr)?)),
        Some("if") => Ok(Some(expand_if(vm, expr)?)),
        Some("def") => Ok(Some(expand_def(vm, expr)?)),
        Some("undef") => Ok(Some(expand_undef(expr)?)),
        Some("defn") => Ok(Some(expand_defn(vm, expr)?)),
        Some("defmacro") => Ok(Some(expand_defmacro(vm, expr)?)),
        Some("fn") => Ok(Some(expand_fn(vm, expr)?)),
        Some("set!") => Ok(Some(expand_set_bang(vm, expr)?)),
        Some("code") => Ok(Some(expr.clone())),
        Some("use") => Ok(Some(expr.clone())),
        _ => match vm.get_macro(head) {
            Some(expander) => Ok(Some(expand(vm, &expander, expr)?)),
            None => Ok(None),
        },
    }
}

/// Invokes a macro's expander function on the whole form and
/// re-expands the result.
fn expand(vm: &Arc<Vm>, expander: &Value, expr: &Value) -> VesperResult<Value> {
    match expander {
        Value::Function(Function::Closure { code, .. }) => {
            if code.argc != 1 {
                return Err(bad_expander(expander));
            }
            let expanded = vm.exec_compile_time(expander, expr)?;
            if expanded.is_list() {
                macroexpand(vm, &expanded)
            } else {
                Ok(expanded)
            }
        }
        Value::Function(Function::Primitive(prim)) => {
            let expanded = (prim.fun)(vm, &[expr.clone()])?;
            macroexpand(vm, &expanded)
        }
        _ => Err(bad_expander(expander)),
    }
}

fn bad_expander(expander: &Value) -> VesperError {
    VesperError::macro_error(format!("bad macro expander function: {}", expander))
}

fn expand_if(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    match value::list_length(expr) {
        Some(4) => {
            let tail = expand_sequence(vm, &value::cdr(expr))?;
            Ok(value::cons(value::car(expr), tail))
        }
        Some(3) => {
            // (if p c) → (if p c null)
            let tail = expand_sequence(
                vm,
                &value::list_from_values(&[value::cadr(expr), value::caddr(expr), Value::Null]),
            )?;
            Ok(value::cons(value::car(expr), tail))
        }
        _ => Err(syntax_in(expr)),
    }
}

fn expand_undef(expr: &Value) -> VesperResult<Value> {
    if value::list_length(expr) != Some(2) || !value::cadr(expr).is_symbol() {
        return Err(syntax_in(expr));
    }
    Ok(expr.clone())
}

// (defn f (x) (+ 1 x))
//  ->
// (def f (fn (x) (+ 1 x)))
fn expand_defn(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    if value::list_length(expr).unwrap_or(0) >= 4 {
        let name = value::cadr(expr);
        if name.is_symbol() {
            let args = value::caddr(expr);
            let body = expand_sequence(vm, &value::cdddr(expr))?;
            let lambda = expand_fn(
                vm,
                &value::cons(vm.intern("fn"), value::cons(args, body)),
            )?;
            return Ok(value::list_from_values(&[vm.intern("def"), name, lambda]));
        }
    }
    Err(syntax_in(expr))
}

// (defmacro name (expr) body…) builds a one-argument expander that
// receives the whole form. With more than one parameter the expander
// instead applies the user function to the form's arguments:
// (defmacro name (a b) body…) →
//   (defmacro name (fn (expr) (apply (fn (a b) body…) (cdr expr))))
fn expand_defmacro(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    if value::list_length(expr).unwrap_or(0) >= 4 {
        let name = value::cadr(expr);
        if name.is_symbol() {
            let args = value::caddr(expr);
            let body = expand_sequence(vm, &value::cdddr(expr))?;
            let user_fn = value::cons(vm.intern("fn"), value::cons(args.clone(), body));
            let single_param =
                value::list_length(&args) == Some(1) && value::car(&args).is_symbol();
            let lambda = if single_param {
                expand_fn(vm, &user_fn)?
            } else {
                let user_fn = expand_fn(vm, &user_fn)?;
                let sym = vm.intern("expr");
                expand_fn(
                    vm,
                    &value::list_from_values(&[
                        vm.intern("fn"),
                        value::list_from_values(&[sym.clone()]),
                        value::list_from_values(&[
                            vm.intern("apply"),
                            user_fn,
                            value::list_from_values(&[vm.intern("cdr"), sym]),
                        ]),
                    ]),
                )?
            };
            return Ok(value::list_from_values(&[
                vm.intern("defmacro"),
                name,
                lambda,
            ]));
        }
    }
    Err(syntax_in(expr))
}

fn expand_def(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    if value::list_length(expr) != Some(3) {
        return Err(syntax_in(expr));
    }
    let name = value::cadr(expr);
    if !name.is_symbol() {
        return Err(syntax_in(expr));
    }
    let body = value::caddr(expr);
    if !body.is_list() {
        return Ok(expr.clone());
    }
    let val = macroexpand_list(vm, &body)?;
    Ok(value::list_from_values(&[value::car(expr), name, val]))
}

fn expand_fn(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    if value::list_length(expr).unwrap_or(0) < 3 {
        return Err(syntax_in(expr));
    }
    let body = expand_sequence(vm, &value::cddr(expr))?;
    // A body whose leading forms are defs is rewritten to a letrec.
    if !body.is_empty_list() {
        let first_head = value::car(&value::car(&body));
        if first_head.name_text() == Some("def") || first_head.name_text() == Some("defmacro") {
            let mut bindings = Value::empty_list();
            let mut tmp = body.clone();
            loop {
                let head = value::car(&value::car(&tmp));
                match head.name_text() {
                    Some("defmacro") => {
                        return Err(VesperError::macro_error(
                            "macros can only be defined at top level",
                        ))
                    }
                    Some("def") => {
                        let def = expand_def(vm, &value::car(&tmp))?;
                        bindings = value::cons(value::cdr(&def), bindings);
                        tmp = value::cdr(&tmp);
                    }
                    _ => break,
                }
            }
            let bindings = value::reverse(&bindings);
            let letrec = value::cons(vm.intern("letrec"), value::cons(bindings, tmp));
            let expanded = macroexpand_list(vm, &letrec)?;
            return Ok(value::list_from_values(&[
                value::car(expr),
                value::cadr(expr),
                expanded,
            ]));
        }
    }
    let args = value::cadr(expr);
    Ok(value::cons(value::car(expr), value::cons(args, body)))
}

fn expand_set_bang(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    if value::list_length(expr) != Some(3) {
        return Err(syntax_in(expr));
    }
    let mut val = value::caddr(expr);
    if val.is_list() && !val.is_empty_list() {
        val = macroexpand_list(vm, &val)?;
    }
    Ok(value::list_from_values(&[
        value::car(expr),
        value::cadr(expr),
        val,
    ]))
}

fn syntax_in(expr: &Value) -> VesperError {
    VesperError::syntax(format!("{}", expr))
}

// -----------------------------------------------------------------------------
// LET / LETREC
// -----------------------------------------------------------------------------

fn crack_let_bindings(vm: &Arc<Vm>, bindings: &Value) -> Option<(Value, Value)> {
    let mut names = Vec::new();
    let mut values = Vec::new();
    let mut bindings = bindings.clone();
    while !bindings.is_empty_list() {
        let mut binding = value::car(&bindings);
        if matches!(binding, Value::Array(_)) {
            binding = value::array_to_list(&binding);
        }
        if !binding.is_list() {
            return None;
        }
        let name = value::car(&binding);
        if !name.is_symbol() {
            return None;
        }
        let init = value::cdr(&binding);
        if init.is_empty_list() {
            return None;
        }
        names.push(name);
        values.push(macroexpand(vm, &value::car(&init)).ok()?);
        bindings = value::cdr(&bindings);
    }
    Some((
        value::list_from_values(&names),
        value::list_from_values(&values),
    ))
}

/// `(let ((x 1) (y 2)) body…)` → `((fn (x y) body…) 1 2)`.
/// A named let lowers through letrec.
pub fn expand_let(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    if value::cadr(expr).is_symbol() {
        return expand_named_let(vm, expr);
    }
    let mut bindings = value::cadr(expr);
    if matches!(bindings, Value::Array(_)) {
        bindings = value::array_to_list(&bindings);
    }
    if !bindings.is_list() {
        return Err(syntax_in(expr));
    }
    let (names, values) =
        crack_let_bindings(vm, &bindings).ok_or_else(|| syntax_in(expr))?;
    let body = value::cddr(expr);
    if body.is_empty_list() {
        return Err(syntax_in(expr));
    }
    let lambda = macroexpand_list(vm, &value::cons(vm.intern("fn"), value::cons(names, body)))?;
    Ok(value::cons(lambda, values))
}

fn expand_named_let(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    let name = value::cadr(expr);
    let mut bindings = value::caddr(expr);
    if matches!(bindings, Value::Array(_)) {
        bindings = value::array_to_list(&bindings);
    }
    if !bindings.is_list() {
        return Err(syntax_in(expr));
    }
    let (names, values) =
        crack_let_bindings(vm, &bindings).ok_or_else(|| syntax_in(expr))?;
    let body = value::cdddr(expr);
    // (letrec ((name (fn (names…) body…))) (name values…))
    let lambda = value::cons(vm.intern("fn"), value::cons(names, body));
    let binding = value::list_from_values(&[value::list_from_values(&[name.clone(), lambda])]);
    let call = value::cons(name, values);
    let letrec = value::list_from_values(&[vm.intern("letrec"), binding, call]);
    macroexpand_list(vm, &letrec)
}

/// `letrec` binds every name to null, then initializes each by
/// `set!` before the body runs.
pub fn expand_letrec(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    let body = value::cddr(expr);
    if body.is_empty_list() {
        return Err(syntax_in(expr));
    }
    let mut bindings = value::cadr(expr);
    if matches!(bindings, Value::Array(_)) {
        bindings = value::array_to_list(&bindings);
    }
    if !bindings.is_list() {
        return Err(syntax_in(expr));
    }
    let mut names = Vec::new();
    let mut inits = Vec::new();
    let mut cur = bindings;
    while !cur.is_empty_list() {
        let mut binding = value::car(&cur);
        if matches!(binding, Value::Array(_)) {
            binding = value::array_to_list(&binding);
        }
        if !binding.is_list() {
            return Err(syntax_in(expr));
        }
        let name = value::car(&binding);
        if !name.is_symbol() || !value::cdr(&binding).is_list() {
            return Err(syntax_in(expr));
        }
        names.push(name);
        inits.push(value::cons(vm.intern("set!"), binding));
        cur = value::cdr(&cur);
    }
    let mut full_body = body;
    for init in inits.into_iter().rev() {
        full_body = value::cons(init, full_body);
    }
    let params = value::list_from_values(&names);
    let lambda = macroexpand_list(
        vm,
        &value::cons(vm.intern("fn"), value::cons(params, full_body)),
    )?;
    let nulls = value::make_list(names_len(&lambda, expr)?, Value::Null);
    Ok(value::cons(lambda, nulls))
}

fn names_len(lambda: &Value, expr: &Value) -> VesperResult<usize> {
    value::list_length(&value::cadr(lambda)).ok_or_else(|| syntax_in(expr))
}

// -----------------------------------------------------------------------------
// COND
// -----------------------------------------------------------------------------

/// Lowers cond clauses to an `if` chain. Supports `else` and the
/// arrow form `(test => fn)`, which binds the test value once.
pub fn expand_cond(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    let len = value::list_length(expr).ok_or_else(|| syntax_in(expr))?;
    if len < 2 {
        return Err(syntax_in(expr));
    }
    if len == 2 {
        let clause = value::cadr(expr);
        let lowered = if value::car(&clause).name_text() == Some("else") {
            value::cons(vm.intern("do"), value::cdr(&clause))
        } else {
            let consequent = value::cons(vm.intern("do"), value::cdr(&clause));
            value::list_from_values(&[vm.intern("if"), value::car(&clause), consequent])
        };
        return macroexpand(vm, &lowered);
    }
    next_cond_clause(vm, expr, &value::cdr(expr), len - 1)
}

fn arrow_clause(vm: &Arc<Vm>, clause: &Value, else_branch: Value) -> Value {
    // (test => fn) → (let ((tmp test)) (if tmp (fn tmp) else))
    let tmpsym = vm.intern("__tmp__");
    value::list_from_values(&[
        vm.intern("let"),
        value::list_from_values(&[value::list_from_values(&[
            tmpsym.clone(),
            value::car(clause),
        ])]),
        value::list_from_values(&[
            vm.intern("if"),
            tmpsym.clone(),
            value::list_from_values(&[value::caddr(clause), tmpsym]),
            else_branch,
        ]),
    ])
}

fn is_arrow(clause: &Value) -> bool {
    value::cadr(clause).name_text() == Some("=>")
}

fn next_cond_clause(vm: &Arc<Vm>, expr: &Value, clauses: &Value, count: usize) -> VesperResult<Value> {
    let clause0 = value::car(clauses);
    let rest = value::cdr(clauses);
    let clause1 = value::car(&rest);

    let result = if count == 2 {
        if !clause1.is_list() {
            return Err(syntax_in(expr));
        }
        if value::car(&clause1).name_text() == Some("else") {
            let else_branch = value::cons(vm.intern("do"), value::cdr(&clause1));
            if is_arrow(&clause0) {
                if value::list_length(&clause0) != Some(3) {
                    return Err(syntax_in(expr));
                }
                arrow_clause(vm, &clause0, else_branch)
            } else {
                value::list_from_values(&[
                    vm.intern("if"),
                    value::car(&clause0),
                    value::cons(vm.intern("do"), value::cdr(&clause0)),
                    else_branch,
                ])
            }
        } else {
            let last = if is_arrow(&clause1) {
                if value::list_length(&clause1) != Some(3) {
                    return Err(syntax_in(expr));
                }
                arrow_clause(vm, &clause1, Value::Null)
            } else {
                value::list_from_values(&[
                    vm.intern("if"),
                    value::car(&clause1),
                    value::cons(vm.intern("do"), value::cdr(&clause1)),
                ])
            };
            if is_arrow(&clause0) {
                if value::list_length(&clause0) != Some(3) {
                    return Err(syntax_in(expr));
                }
                arrow_clause(vm, &clause0, last)
            } else {
                value::list_from_values(&[
                    vm.intern("if"),
                    value::car(&clause0),
                    value::cons(vm.intern("do"), value::cdr(&clause0)),
                    last,
                ])
            }
        }
    } else {
        let rest_lowered = next_cond_clause(vm, expr, &rest, count - 1)?;
        if is_arrow(&clause0) {
            if value::list_length(&clause0) != Some(3) {
                return Err(syntax_in(expr));
            }
            arrow_clause(vm, &clause0, rest_lowered)
        } else {
            value::list_from_values(&[
                vm.intern("if"),
                value::car(&clause0),
                value::cons(vm.intern("do"), value::cdr(&clause0)),
                rest_lowered,
            ])
        }
    };
    macroexpand(vm, &result)
}

// -----------------------------------------------------------------------------
// QUASIQUOTE
// -----------------------------------------------------------------------------

/// Walks a quasiquote template, splicing unquoted forms. The emitted
/// program rebuilds the template with `list` and `concat` calls.
pub fn expand_quasiquote(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    if value::list_length(expr) != Some(2) {
        return Err(syntax_in(expr));
    }
    expand_qq(vm, &value::cadr(expr))
}

fn expand_qq(vm: &Arc<Vm>, expr: &Value) -> VesperResult<Value> {
    match expr {
        Value::List(_) => {
            if expr.is_empty_list() {
                return Ok(expr.clone());
            }
            if !value::cdr(expr).is_empty_list() {
                match value::car(expr).name_text() {
                    Some("unquote") => {
                        if !value::cddr(expr).is_empty_list() {
                            return Err(syntax_in(expr));
                        }
                        return macroexpand(vm, &value::cadr(expr));
                    }
                    Some("unquote-splicing") => {
                        return Err(VesperError::macro_error(
                            "unquote-splicing can only occur in the context of a list",
                        ));
                    }
                    _ => {}
                }
            }
            let rebuilt = expand_qq_list(vm, expr)?;
            macroexpand(vm, &rebuilt)
        }
        Value::Symbol(_) => Ok(value::list_from_values(&[vm.intern("quote"), expr.clone()])),
        // All other objects evaluate to themselves.
        _ => Ok(expr.clone()),
    }
}

fn expand_qq_list(vm: &Arc<Vm>, lst: &Value) -> VesperResult<Value> {
    let mut segments = vec![vm.intern("concat")];
    let mut lst = lst.clone();
    while !lst.is_empty_list() {
        let item = value::car(&lst);
        if item.is_list() && !item.is_empty_list() {
            match value::car(&item).name_text() {
                Some("quasiquote") => {
                    return Err(VesperError::macro_error("nested quasiquote not supported"));
                }
                Some("unquote") if value::list_length(&item) == Some(2) => {
                    let unquoted = macroexpand(vm, &value::cadr(&item))?;
                    segments.push(value::list_from_values(&[vm.intern("list"), unquoted]));
                }
                Some("unquote-splicing") if value::list_length(&item) == Some(2) => {
                    let unquoted = macroexpand(vm, &value::cadr(&item))?;
                    segments.push(unquoted);
                }
                _ => {
                    let nested = expand_qq_list(vm, &item)?;
                    segments.push(value::list_from_values(&[vm.intern("list"), nested]));
                }
            }
        } else {
            segments.push(value::list_from_values(&[
                vm.intern("quote"),
                value::list_from_values(&[item]),
            ]));
        }
        lst = value::cdr(&lst);
    }
    Ok(value::list_from_values(&segments))
}
