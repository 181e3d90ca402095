//! # Tests Module
//!
//! Unit and integration tests for the whole pipeline: reader, writer,
//! expander, compiler, VM semantics (tail calls, continuations,
//! closures, calling conventions), the primitive surface, channels,
//! and error handling.

#[cfg(test)]
mod tests {
    use crate::compiler;
    use crate::error::{ErrorKind, VesperError};
    use crate::expander;
    use crate::opcode::{self, Code};
    use crate::reader;
    use crate::value::{self, Value};
    use crate::vm::Vm;
    use crate::writer;

    use std::sync::Arc;

    // =========================================================================
    // HELPERS — Run Vesper source through the full pipeline
    // =========================================================================

    fn new_vm() -> Arc<Vm> {
        Vm::new().init().expect("prelude bootstrap failed")
    }

    /// Reads and evaluates every form, returning the last value.
    fn run(source: &str) -> Result<Value, VesperError> {
        new_vm().eval_source(source)
    }

    /// Runs source and returns the written form of the result.
    fn run_text(source: &str) -> String {
        writer::write(&run(source).expect(source))
    }

    fn run_number(source: &str) -> f64 {
        match run(source).expect(source) {
            Value::Number(n) => n,
            other => panic!("expected a number from {}, got {}", source, other),
        }
    }

    fn run_bool(source: &str) -> bool {
        match run(source).expect(source) {
            Value::Boolean(b) => b,
            other => panic!("expected a boolean from {}, got {}", source, other),
        }
    }

    /// Runs source and expects a specific error kind.
    fn expect_error(source: &str, kind: ErrorKind) {
        match run(source) {
            Ok(v) => panic!(
                "expected {:?} error from {}, got {}",
                kind,
                source,
                writer::write(&v)
            ),
            Err(e) => assert_eq!(e.kind, kind, "expected {:?} error, got: {}", kind, e),
        }
    }

    /// Reads a single datum with a fresh VM.
    fn read_one(source: &str) -> Value {
        reader::read(&new_vm(), source, &Value::Null).expect(source)
    }

    // =========================================================================
    // READER TESTS
    // =========================================================================

    #[test]
    fn reader_numbers() {
        assert!(matches!(read_one("42"), Value::Number(n) if n == 42.0));
        assert!(matches!(read_one("-3.25"), Value::Number(n) if n == -3.25));
        assert!(matches!(read_one("1e3"), Value::Number(n) if n == 1000.0));
    }

    #[test]
    fn reader_reserved_atoms() {
        assert!(matches!(read_one("null"), Value::Null));
        assert!(matches!(read_one("true"), Value::Boolean(true)));
        assert!(matches!(read_one("false"), Value::Boolean(false)));
    }

    #[test]
    fn reader_atom_kinds() {
        assert!(matches!(read_one("foo"), Value::Symbol(_)));
        assert!(matches!(read_one("foo:"), Value::Keyword(_)));
        assert!(matches!(read_one("<foo>"), Value::Type(_)));
    }

    #[test]
    fn reader_numeric_keyword_is_an_error() {
        let vm = new_vm();
        let err = reader::read(&vm, "42:", &Value::Null).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
    }

    #[test]
    fn reader_quote_family() {
        assert_eq!(writer::write(&read_one("'x")), "'x");
        assert_eq!(writer::write(&read_one("`x")), "`x");
        assert_eq!(writer::write(&read_one("~x")), "~x");
        assert_eq!(writer::write(&read_one("^x")), "~x");
        assert_eq!(writer::write(&read_one("~@x")), "~@x");
    }

    #[test]
    fn reader_commas_are_whitespace() {
        assert_eq!(writer::write(&read_one("(1, 2, 3)")), "(1 2 3)");
    }

    #[test]
    fn reader_comments() {
        let vm = new_vm();
        let forms = reader::read_all(&vm, "; line\n1 ; trailing\n2", &Value::Null).unwrap();
        assert_eq!(writer::write(&forms), "(1 2)");
    }

    #[test]
    fn reader_string_escapes() {
        assert_eq!(
            read_one(r#""a\n\t\"b\"A""#),
            Value::string("a\n\t\"b\"A")
        );
        assert_eq!(read_one(r#""\x41""#), Value::string("A"));
    }

    #[test]
    fn reader_unterminated_string() {
        let vm = new_vm();
        let err = reader::read(&vm, "\"abc", &Value::Null).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
    }

    #[test]
    fn reader_character_literals() {
        assert!(matches!(read_one("#\\a"), Value::Character('a')));
        assert!(matches!(read_one("#\\space"), Value::Character(' ')));
        assert!(matches!(read_one("#\\newline"), Value::Character('\n')));
        assert!(matches!(read_one("#\\x41"), Value::Character('A')));
    }

    #[test]
    fn reader_mismatched_delimiters() {
        let vm = new_vm();
        assert_eq!(
            reader::read(&vm, ")", &Value::Null).unwrap_err().kind,
            ErrorKind::Syntax
        );
        assert_eq!(
            reader::read(&vm, "(1 2", &Value::Null).unwrap_err().kind,
            ErrorKind::Syntax
        );
    }

    #[test]
    fn reader_struct_colons() {
        assert_eq!(writer::write(&read_one("{x: 1}")), "{x: 1}");
        // The colon between key and value is ignored.
        assert_eq!(writer::write(&read_one("{\"a\": 1}")), "{\"a\" 1}");
    }

    #[test]
    fn reader_struct_key_coercion() {
        let vm = new_vm();
        let keys = vm.intern("<keyword>");
        let strct = reader::read(&vm, "{a 1}", &keys).unwrap();
        match &strct {
            Value::Struct(s) => {
                assert!(matches!(s.get(&vm.intern("a:")), Value::Number(n) if n == 1.0))
            }
            other => panic!("expected struct, got {}", other),
        }
    }

    #[test]
    fn reader_instances() {
        let vm = new_vm();
        let inst = reader::read(&vm, "#<point> {x: 1}", &Value::Null).unwrap();
        assert_eq!(inst.type_name(), "<point>");
        assert_eq!(writer::write(&inst), "#<point> {x: 1}");
    }

    #[test]
    fn reader_eof_is_null() {
        let vm = new_vm();
        assert!(matches!(
            reader::read(&vm, "  ; nothing\n", &Value::Null).unwrap(),
            Value::Null
        ));
    }

    // =========================================================================
    // WRITER TESTS
    // =========================================================================

    #[test]
    fn writer_round_trips() {
        let vm = new_vm();
        for text in [
            "null",
            "true",
            "false",
            "42",
            "-1.5",
            "\"hi\\nthere\"",
            "#\\a",
            "(1 2 (3))",
            "[1 [2] \"x\"]",
            "{x: 1}",
            "foo",
            "bar:",
            "<blob>",
            "'(1 2)",
        ] {
            let v = reader::read(&vm, text, &Value::Null).unwrap();
            let written = writer::write(&v);
            let back = reader::read(&vm, &written, &Value::Null).unwrap();
            assert!(value::equal(&v, &back), "round trip failed for {}", text);
        }
    }

    #[test]
    fn writer_json_mode() {
        let vm = new_vm();
        let v = reader::read(&vm, "{a: [1 2]}", &Value::Null).unwrap();
        assert_eq!(
            writer::write_to_string(&v, true, "").unwrap(),
            "{\"a\": [1, 2]}"
        );
    }

    #[test]
    fn writer_json_rejects_non_json_values() {
        let err = writer::write_to_string(&Value::Character('a'), true, "").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Argument);
    }

    #[test]
    fn writer_pretty_indents() {
        let vm = new_vm();
        let v = reader::read(&vm, "(1 2)", &Value::Null).unwrap();
        assert_eq!(writer::pretty(&v), "(\n    1\n    2\n)\n");
    }

    #[test]
    fn writer_display_strings_are_raw() {
        assert_eq!(format!("{}", Value::string("hi")), "hi");
        assert_eq!(writer::write(&Value::string("hi")), "\"hi\"");
    }

    // =========================================================================
    // VALUE TESTS
    // =========================================================================

    #[test]
    fn interning_is_identity() {
        let vm = new_vm();
        assert!(value::identical(&vm.intern("abc"), &vm.intern("abc")));
        assert!(value::identical(&vm.intern("k:"), &vm.intern("k:")));
        assert!(!value::identical(&vm.intern("abc"), &vm.intern("abd")));
    }

    #[test]
    fn numbers_compare_within_epsilon() {
        assert!(value::equal(
            &Value::Number(1.0),
            &Value::Number(1.0 + 1e-12)
        ));
        assert!(!value::equal(&Value::Number(1.0), &Value::Number(1.1)));
    }

    #[test]
    fn structs_compare_as_bags() {
        let vm = new_vm();
        let a = reader::read(&vm, "{x: 1 y: 2}", &Value::Null).unwrap();
        let b = reader::read(&vm, "{y: 2 x: 1}", &Value::Null).unwrap();
        assert!(value::equal(&a, &b));
    }

    #[test]
    fn empty_list_is_a_singleton() {
        assert!(value::identical(&Value::empty_list(), &Value::empty_list()));
        assert!(run("'()").unwrap().is_empty_list());
    }

    // =========================================================================
    // EXPANDER TESTS
    // =========================================================================

    #[test]
    fn let_lowers_to_applied_fn() {
        let vm = new_vm();
        let expr = reader::read(&vm, "(let ((x 1)) x)", &Value::Null).unwrap();
        let expanded = expander::macroexpand(&vm, &expr).unwrap();
        assert_eq!(writer::write(&expanded), "((fn (x) x) 1)");
    }

    #[test]
    fn named_let_loops() {
        assert_eq!(
            run_number(
                "(let loop ((n 5) (acc 1)) (if (= n 0) acc (loop (- n 1) (* acc n))))"
            ),
            120.0
        );
    }

    #[test]
    fn letrec_supports_mutual_recursion() {
        assert!(run_bool(
            "(letrec ((even? (fn (n) (if (= n 0) true (odd? (- n 1)))))
                      (odd? (fn (n) (if (= n 0) false (even? (- n 1))))))
               (even? 10))"
        ));
    }

    #[test]
    fn fn_body_defs_lift_to_letrec() {
        assert_eq!(
            run_number("((fn () (def a 1) (def b 2) (+ a b)))"),
            3.0
        );
    }

    #[test]
    fn cond_with_else_and_arrow() {
        assert_eq!(run_number("(cond (false 1) (else 2))"), 2.0);
        assert_eq!(
            run_number("(cond ((+ 1 2) => (fn (x) (* x 2))) (else 0))"),
            6.0
        );
        assert_eq!(run_number("(cond (false 1) (true 2) (else 3))"), 2.0);
    }

    #[test]
    fn quasiquote_splices() {
        assert_eq!(run_text("`(a ~(+ 1 2) ~@(list 3 4) b)"), "(a 3 3 4 b)");
        assert_eq!(run_text("`(x)"), "(x)");
        assert_eq!(run_text("`a"), "a");
    }

    #[test]
    fn quasiquote_rejects_nesting_and_stray_splices() {
        expect_error("`(a `(b))", ErrorKind::Macro);
        expect_error("`~@(list 1)", ErrorKind::Macro);
    }

    #[test]
    fn defn_defines_a_named_function() {
        assert_eq!(run_number("(defn add2 (x) (+ x 2)) (add2 40)"), 42.0);
    }

    #[test]
    fn user_macros_expand_through_the_vm() {
        assert_eq!(
            run_number(
                "(defmacro when2 (expr)
                   (list 'if (cadr expr) (cons 'do (cddr expr)) 'null))
                 (when2 true 1 2 3)"
            ),
            3.0
        );
    }

    #[test]
    fn multi_parameter_macros_bind_the_form_arguments() {
        assert_eq!(
            run_number("(defmacro swap (a b) (list '- b a)) (swap 2 10)"),
            8.0
        );
    }

    #[test]
    fn macros_cannot_be_used_as_values() {
        expect_error("(def x when)", ErrorKind::Macro);
    }

    #[test]
    fn macroexpand_is_available_at_runtime() {
        assert_eq!(
            run_text("(macroexpand '(let ((x 1)) x))"),
            "((fn (x) x) 1)"
        );
    }

    // =========================================================================
    // COMPILER TESTS
    // =========================================================================

    #[test]
    fn peephole_rewrites_inc_and_dec() {
        let vm = new_vm();
        let expr = reader::read(&vm, "(fn (x) (+ 1 x))", &Value::Null).unwrap();
        let expanded = expander::macroexpand(&vm, &expr).unwrap();
        let code = compiler::compile(&vm, &expanded).unwrap();
        let text = writer::write(&opcode::decompile(&vm, &code));
        assert!(text.contains("(global inc)"), "no inc in {}", text);

        let expr = reader::read(&vm, "(fn (x) (- x 1))", &Value::Null).unwrap();
        let expanded = expander::macroexpand(&vm, &expr).unwrap();
        let code = compiler::compile(&vm, &expanded).unwrap();
        let text = writer::write(&opcode::decompile(&vm, &code));
        assert!(text.contains("(global dec)"), "no dec in {}", text);
    }

    #[test]
    fn tail_calls_compile_to_tailcall() {
        let vm = new_vm();
        let expr = reader::read(&vm, "(fn (x) (f x))", &Value::Null).unwrap();
        let expanded = expander::macroexpand(&vm, &expr).unwrap();
        let code = compiler::compile(&vm, &expanded).unwrap();
        let text = writer::write(&opcode::decompile(&vm, &code));
        assert!(text.contains("(tailcall 1)"), "no tailcall in {}", text);
    }

    #[test]
    fn decompiled_code_round_trips() {
        let vm = new_vm();
        let expr = reader::read(&vm, "(defn add1 (x) (+ 1 x))", &Value::Null).unwrap();
        let expanded = expander::macroexpand(&vm, &expr).unwrap();
        let code = compiler::compile(&vm, &expanded).unwrap();
        let text = writer::write(&opcode::decompile(&vm, &code));

        let form = reader::read(&vm, &text, &Value::Null).unwrap();
        let mut target = Code::new(0, None, None, "");
        opcode::load_ops(&vm, &mut target, &value::list_from_values(&[form])).unwrap();
        vm.execute(Arc::new(target)).unwrap();
        match vm.eval_source("(add1 41)").unwrap() {
            Value::Number(n) => assert_eq!(n, 42.0),
            other => panic!("expected 42, got {}", other),
        }
    }

    #[test]
    fn code_special_form_loads_bytecode() {
        assert_eq!(run_number("(code (literal 7) (return))"), 7.0);
    }

    #[test]
    fn malformed_special_forms_are_syntax_errors() {
        expect_error("(if true)", ErrorKind::Syntax);
        expect_error("(quote)", ErrorKind::Syntax);
        expect_error("(fn (x))", ErrorKind::Syntax);
        expect_error("(set! 5 1)", ErrorKind::Syntax);
        expect_error("(do)", ErrorKind::Syntax);
    }

    // =========================================================================
    // VM TESTS — evaluation semantics
    // =========================================================================

    #[test]
    fn arithmetic() {
        assert_eq!(run_number("(+ 1 2)"), 3.0);
        assert_eq!(run_number("(* 6 7)"), 42.0);
        assert_eq!(run_number("(quotient 7 2)"), 3.0);
        assert_eq!(run_number("(remainder 7 2)"), 1.0);
    }

    #[test]
    fn let_binds_locals() {
        assert_eq!(run_number("(let ((x 10) (y 32)) (+ x y))"), 42.0);
    }

    #[test]
    fn recursion() {
        assert_eq!(
            run_number("(defn fact (n) (if (<= n 1) 1 (* n (fact (- n 1))))) (fact 5)"),
            120.0
        );
    }

    #[test]
    fn do_returns_the_last_value() {
        assert_eq!(run_number("(do 1 2 (do 3 4) 5)"), 5.0);
    }

    #[test]
    fn if_without_alternative_yields_null() {
        assert!(matches!(run("(if false 1)").unwrap(), Value::Null));
    }

    #[test]
    fn null_is_truthy_only_false_is_false() {
        assert_eq!(run_number("(if null 1 2)"), 1.0);
        assert_eq!(run_number("(if 0 1 2)"), 1.0);
        assert_eq!(run_number("(if false 1 2)"), 2.0);
    }

    #[test]
    fn closures_capture_their_frame() {
        assert_eq!(
            run_number("(defn adder (n) (fn (x) (+ x n))) ((adder 40) 2)"),
            42.0
        );
    }

    #[test]
    fn set_bang_mutates_locals() {
        assert_eq!(run_number("(let ((x 1)) (set! x 41) (+ x 1))"), 42.0);
    }

    #[test]
    fn set_bang_on_unbound_symbol_defines_a_global() {
        assert_eq!(run_number("(set! gx 5) gx"), 5.0);
    }

    #[test]
    fn def_and_undef() {
        assert!(run_bool("(def q 1) (def? 'q)"));
        assert!(!run_bool("(def q 1) (undef q) (def? 'q)"));
    }

    #[test]
    fn global_reads_of_unbound_symbols_yield_null() {
        assert!(matches!(run("no-such-global").unwrap(), Value::Null));
    }

    #[test]
    fn tail_calls_do_not_grow_the_frame_chain() {
        assert_eq!(
            run_text(
                "(defn loop (n) (if (= n 0) 'done (loop (- n 1))))
                 (loop 1000000)"
            ),
            "done"
        );
    }

    #[test]
    fn mutual_tail_calls_are_proper() {
        assert!(run_bool(
            "(defn even2? (n) (if (= n 0) true (odd2? (- n 1))))
             (defn odd2? (n) (if (= n 0) false (even2? (- n 1))))
             (even2? 100000)"
        ));
    }

    #[test]
    fn callcc_round_trip() {
        assert_eq!(run_number("(+ 1 (callcc (fn (k) (k 41))))"), 42.0);
        assert_eq!(run_number("(+ 1 (callcc (fn (k) (+ 100 (k 41)))))"), 42.0);
        assert_eq!(run_number("(+ 1 (callcc (fn (k) 41)))"), 42.0);
    }

    #[test]
    fn apply_flattens_the_final_list() {
        assert_eq!(run_number("(apply + 1 '(2))"), 3.0);
        assert_eq!(run_number("(apply + '(20 22))"), 42.0);
    }

    #[test]
    fn keywords_are_struct_accessors() {
        assert_eq!(run_number("(name: {name: 42})"), 42.0);
        expect_error("(name: 5)", ErrorKind::Argument);
    }

    #[test]
    fn rest_parameters_collect_a_list() {
        assert_eq!(run_text("((fn (a & rest) (list a rest)) 1 2 3)"), "(1 (2 3))");
        assert_eq!(run_text("((fn args args) 1 2)"), "(1 2)");
        assert_eq!(run_text("((fn args args))"), "()");
    }

    #[test]
    fn optional_parameters_fill_defaults() {
        assert_eq!(run_number("((fn (a [b (c 5)]) (+ a (+ b c))) 1 2)"), 8.0);
        assert_eq!(run_number("((fn (a [b (c 5)]) (+ a (+ b c))) 1 2 3)"), 6.0);
        assert_eq!(run_number("((fn (a [(b 10)]) (+ a b)) 1)"), 11.0);
    }

    #[test]
    fn keyword_parameters_match_by_name() {
        assert_eq!(
            run_text("((fn (a {b: 2 c: 3}) (list a b c)) 1 c: 30)"),
            "(1 2 30)"
        );
        expect_error("((fn (a {b: 2}) b) 1 nope: 9)", ErrorKind::Argument);
    }

    #[test]
    fn arity_mismatches_are_argument_errors() {
        expect_error("((fn (a b) a) 1)", ErrorKind::Argument);
        expect_error("((fn (a b) a) 1 2 3)", ErrorKind::Argument);
        expect_error("(car 1 2)", ErrorKind::Argument);
    }

    #[test]
    fn primitive_type_checks() {
        expect_error("(car 5)", ErrorKind::Argument);
        expect_error("(+ 1 \"2\")", ErrorKind::Argument);
    }

    #[test]
    fn clojure_style_parameter_arrays() {
        assert_eq!(run_number("((fn [x y] (+ x y)) 20 22)"), 42.0);
        assert_eq!(run_number("(let [[x 40] [y 2]] (+ x y))"), 42.0);
    }

    // =========================================================================
    // PRIMITIVE SURFACE TESTS
    // =========================================================================

    #[test]
    fn list_operations() {
        assert_eq!(run_text("(cons 1 '(2 3))"), "(1 2 3)");
        assert_eq!(run_number("(car '(1 2))"), 1.0);
        assert_eq!(run_text("(cdr '(1 2))"), "(2)");
        assert_eq!(run_number("(list-length '(1 2 3))"), 3.0);
        assert_eq!(run_text("(reverse '(1 2 3))"), "(3 2 1)");
        assert_eq!(run_text("(concat '(1) '(2 3))"), "(1 2 3)");
        assert_eq!(run_text("(flatten '(1 (2 (3 4))))"), "(1 2 3 4)");
        assert!(run_bool("(empty? '())"));
    }

    #[test]
    fn array_operations() {
        assert_eq!(run_text("(array 1 2 3)"), "[1 2 3]");
        assert_eq!(run_text("(make-array 2)"), "[null null]");
        assert_eq!(run_text("(make-array 2 7)"), "[7 7]");
        assert_eq!(run_number("(array-ref [4 5 6] 1)"), 5.0);
        assert_eq!(run_number("(let ((a [1 2])) (array-set! a 0 9) (array-ref a 0))"), 9.0);
        assert_eq!(run_number("(array-length [1 2 3])"), 3.0);
        expect_error("(array-ref [1] 5)", ErrorKind::Argument);
    }

    #[test]
    fn struct_operations() {
        assert_eq!(run_number("(get {x: 1} x:)"), 1.0);
        assert!(run_bool("(has? {x: 1} x:)"));
        assert!(!run_bool("(has? {x: 1} y:)"));
        assert_eq!(
            run_number("(let ((s {x: 1})) (put! s y: 2) (get s y:))"),
            2.0
        );
        assert!(!run_bool("(let ((s {x: 1})) (unput! s x:) (has? s x:))"));
        assert_eq!(run_number("(struct-length {x: 1 y: 2})"), 2.0);
        assert_eq!(run_number("(struct-length (struct a: 1))"), 1.0);
        assert_eq!(run_number("(get (to-struct '((a: 1))) a:)"), 1.0);
    }

    #[test]
    fn sealed_values_reject_mutation() {
        expect_error("(let ((l (list 1 2))) (seal! l) (set-car! l 9))", ErrorKind::Argument);
        expect_error("(let ((l (list 1 2))) (seal! l) (set-cdr! l '()))", ErrorKind::Argument);
        expect_error("(let ((a [1])) (seal! a) (array-set! a 0 2))", ErrorKind::Argument);
        expect_error("(let ((s {x: 1})) (seal! s) (put! s y: 2))", ErrorKind::Argument);
        expect_error("(let ((s {x: 1})) (seal! s) (unput! s x:))", ErrorKind::Argument);
        expect_error("(seal! 5)", ErrorKind::Argument);
    }

    #[test]
    fn mutation_works_before_sealing() {
        assert_eq!(
            run_number("(let ((l (list 1 2))) (set-car! l 9) (car l))"),
            9.0
        );
    }

    #[test]
    fn predicates() {
        assert!(run_bool("(number? 1)"));
        assert!(run_bool("(list? '(1))"));
        assert!(run_bool("(array? [1])"));
        assert!(run_bool("(struct? {x: 1})"));
        assert!(run_bool("(string? \"s\")"));
        assert!(run_bool("(symbol? 'a)"));
        assert!(run_bool("(keyword? a:)"));
        assert!(run_bool("(type? <list>)"));
        assert!(run_bool("(function? car)"));
        assert!(run_bool("(function? (fn (x) x))"));
        assert!(run_bool("(null? null)"));
        assert!(run_bool("(equal? '(1 2) '(1 2))"));
        assert!(!run_bool("(identical? (list 1) (list 1))"));
        assert!(run_bool("(let ((l (list 1))) (identical? l l))"));
        assert!(run_bool("(int? 3)"));
        assert!(run_bool("(float? 3.5)"));
        assert!(run_bool("(zero? 0)"));
    }

    #[test]
    fn type_reflection() {
        assert_eq!(run_text("(type 1)"), "<number>");
        assert_eq!(run_text("(type '(1))"), "<list>");
        assert_eq!(run_text("(type-name <point>)"), "point");
        assert_eq!(run_text("(keyword-name foo:)"), "foo");
        assert_eq!(run_text("(to-keyword 'foo)"), "foo:");
        assert_eq!(run_text("(symbol \"ab\" 'cd)"), "abcd");
    }

    #[test]
    fn instances_wrap_and_unwrap() {
        assert_eq!(run_text("(type (instance <point> {x: 1}))"), "<point>");
        assert_eq!(run_text("(value (instance <point> {x: 1}))"), "{x: 1}");
        // Tagging with the natural type is the identity.
        assert_eq!(run_text("(type (instance <struct> {x: 1}))"), "<struct>");
        assert_eq!(run_number("(get (instance <point> {x: 7}) x:)"), 7.0);
    }

    #[test]
    fn string_operations() {
        assert_eq!(run_text("(string \"a\" 1 'b)"), "\"a1b\"");
        assert_eq!(run_number("(string-length \"abc\")"), 3.0);
        assert_eq!(run_text("(split \"a,b\" \",\")"), "(\"a\" \"b\")");
        assert_eq!(run_text("(join '(\"a\" \"b\") \"-\")"), "\"a-b\"");
        assert_eq!(run_text("(substring \"hello\" 1 3)"), "\"el\"");
        assert_eq!(run_text("(to-string 42)"), "\"42\"");
        assert_eq!(run_text("(to-character \"A\")"), "#\\A");
        assert_eq!(run_number("(to-number \"3.5\")"), 3.5);
    }

    #[test]
    fn blob_operations() {
        assert_eq!(run_number("(blob-length (make-blob 4))"), 4.0);
        assert_eq!(run_number("(blob-ref (to-blob \"A\") 0)"), 65.0);
        assert!(run_bool("(blob? (make-blob 1))"));
        expect_error("(blob-ref (make-blob 1) 5)", ErrorKind::Argument);
    }

    #[test]
    fn conversions() {
        assert_eq!(run_text("(to-list [1 2])"), "(1 2)");
        assert_eq!(run_text("(to-array '(1 2))"), "[1 2]");
        assert_eq!(run_text("(to-list \"ab\")"), "(#\\a #\\b)");
        assert_eq!(run_number("(int 3.7)"), 3.0);
        assert_eq!(run_number("(floor 3.7)"), 3.0);
        assert_eq!(run_number("(ceiling 3.2)"), 4.0);
    }

    #[test]
    fn prelude_macros() {
        assert_eq!(run_number("(and 1 2 3)"), 3.0);
        assert!(!run_bool("(and true false)"));
        assert_eq!(run_number("(or false 7)"), 7.0);
        assert!(!run_bool("(or false false)"));
        assert_eq!(run_number("(when true 1 2 3)"), 3.0);
        assert!(matches!(run("(when false 1)").unwrap(), Value::Null));
        assert_eq!(run_number("(unless false 9)"), 9.0);
        assert_eq!(run_number("(cadr '(1 2 3))"), 2.0);
        assert_eq!(run_number("(caddr '(1 2 3))"), 3.0);
    }

    #[test]
    fn write_and_read_primitives() {
        assert_eq!(run_text("(write '(1 2))"), "\"(1 2)\"");
        // read yields the datum, not its evaluation.
        assert_eq!(run_text("(read \"(+ 1 2)\")"), "(+ 1 2)");
        assert_eq!(run_text("(read \"x\")"), "x");
        assert_eq!(run_text("(read-all \"1 2\")"), "(1 2)");
        assert_eq!(
            run_number("(get (read \"{a 1}\" keys: <keyword>) a:)"),
            1.0
        );
    }

    #[test]
    fn json_primitive() {
        assert_eq!(run_text("(json {a: [1 2]})"), "\"{\\\"a\\\": [1, 2]}\"");
        expect_error("(json #\\a)", ErrorKind::Argument);
    }

    #[test]
    fn error_values() {
        assert!(run_bool("(error? (make-error oops: \"bad\"))"));
        assert_eq!(
            run_text("(error-data (make-error oops: 1))"),
            "[oops: 1]"
        );
        expect_error("(uncaught-error (make-error argument-error: \"x\"))", ErrorKind::Argument);
    }

    #[test]
    fn top_handler_catches_runtime_errors() {
        assert_eq!(
            run_number("(def *top-handler* (fn (e) 99)) (car 5)"),
            99.0
        );
        assert!(run_bool(
            "(def *top-handler* (fn (e) (error? e))) (car 5)"
        ));
    }

    #[test]
    fn interrupt_aborts_execution() {
        let vm = new_vm();
        vm.interrupt();
        let err = vm.eval_source("((fn () 1))").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Interrupt);
        // The flag clears once observed.
        assert_eq!(vm.eval_source("((fn () 1))").unwrap(), Value::Number(1.0));
    }

    // =========================================================================
    // CONCURRENCY TESTS
    // =========================================================================

    #[test]
    fn go_and_channel_rendezvous() {
        assert_eq!(
            run_number("(let ((c (channel))) (go (fn () (send c 7))) (recv c))"),
            7.0
        );
    }

    #[test]
    fn channels_are_fifo() {
        assert_eq!(
            run_text(
                "(let ((c (channel bufsize: 3)))
                   (send c 1) (send c 2) (send c 3)
                   (list (recv c) (recv c) (recv c)))"
            ),
            "(1 2 3)"
        );
    }

    #[test]
    fn channel_timeouts() {
        // Zero timeout: non-blocking try on an empty channel.
        assert!(matches!(
            run("(recv (channel) 0)").unwrap(),
            Value::Null
        ));
        // Send to a full (rendezvous) channel fails immediately.
        assert!(!run_bool("(send (channel) 1 0)"));
        // Positive timeout expires.
        assert!(matches!(
            run("(recv (channel) 0.01)").unwrap(),
            Value::Null
        ));
    }

    #[test]
    fn closed_channels_drain_then_yield_null() {
        assert_eq!(
            run_text(
                "(let ((c (channel bufsize: 2)))
                   (send c 1) (send c 2) (close c)
                   (list (send c 3) (recv c) (recv c) (recv c)))"
            ),
            "(false 1 2 null)"
        );
    }

    #[test]
    fn go_tasks_share_globals() {
        assert_eq!(
            run_number(
                "(def result (channel bufsize: 1))
                 (defn worker () (send result (+ 20 22)))
                 (go worker)
                 (recv result)"
            ),
            42.0
        );
    }

    // =========================================================================
    // MODULE LOADING TESTS
    // =========================================================================

    #[test]
    fn load_path_is_bound() {
        assert!(run_bool("(list? *load-path*)"));
    }

    #[test]
    fn missing_modules_are_io_errors() {
        expect_error("(use no-such-module-xyzzy)", ErrorKind::Io);
    }

    #[test]
    fn load_runs_a_source_file() {
        let dir = std::env::temp_dir().join("vesper-load-test");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("mod42.vsp");
        std::fs::write(&file, "(def loaded-answer 42)\n").unwrap();

        let vm = new_vm();
        crate::loader::add_path(&vm, &dir.to_string_lossy());
        vm.eval_source("(use mod42)").unwrap();
        assert_eq!(
            vm.eval_source("loaded-answer").unwrap(),
            Value::Number(42.0)
        );
    }

    // =========================================================================
    // VM STATE TESTS
    // =========================================================================

    #[test]
    fn forked_vms_have_isolated_globals() {
        let vm = new_vm();
        vm.eval_source("(def shared 1)").unwrap();
        let fork = vm.fork();
        fork.eval_source("(def shared 2)").unwrap();
        assert_eq!(vm.eval_source("shared").unwrap(), Value::Number(1.0));
        assert_eq!(fork.eval_source("shared").unwrap(), Value::Number(2.0));
    }

    #[test]
    fn configurable_stack_size() {
        let vm = Vm::with_stack_size(64).init().unwrap();
        assert_eq!(vm.eval_source("(+ 1 2)").unwrap(), Value::Number(3.0));
    }

    #[test]
    fn globals_listing_contains_definitions() {
        let vm = new_vm();
        vm.eval_source("(def my-very-own-global 1)").unwrap();
        let globals = vm.globals();
        assert!(globals
            .iter()
            .any(|g| g.name_text() == Some("my-very-own-global")));
    }
}
