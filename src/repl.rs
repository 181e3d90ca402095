//! # REPL Module
//!
//! Interactive read-eval-print loop over rustyline. Input continues
//! across lines until brackets balance; the prompt strings come from
//! the `*prompt*` and `*prompt-cont*` globals when bound.

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::value::Value;
use crate::vm::Vm;
use crate::writer;

use std::sync::Arc;

const RED: &str = "\x1b[0;31m";
const GREEN: &str = "\x1b[0;32m";
const BLACK: &str = "\x1b[0;0m";

pub fn start(vm: &Arc<Vm>) {
    let mut editor = match DefaultEditor::new() {
        Ok(ed) => ed,
        Err(e) => {
            eprintln!("failed to initialize REPL: {}", e);
            std::process::exit(1);
        }
    };

    loop {
        let input = match read_input(vm, &mut editor) {
            Some(line) => line,
            None => break,
        };

        if input.trim().is_empty() {
            continue;
        }

        vm.clear_interrupt();
        match vm.eval_source(&input) {
            Ok(val) => {
                if !matches!(val, Value::Null) {
                    println!("{}-> {}{}", GREEN, writer::write(&val), BLACK);
                }
            }
            Err(e) => {
                eprintln!("{} *** {}{}", RED, e, BLACK);
            }
        }
    }
}

fn prompt(vm: &Arc<Vm>, more: bool) -> String {
    let name = if more { "*prompt-cont*" } else { "*prompt*" };
    match vm.global(name) {
        Some(p) => format!("{}", p),
        None if more => ":| ".to_string(),
        None => ":> ".to_string(),
    }
}

fn read_input(vm: &Arc<Vm>, editor: &mut DefaultEditor) -> Option<String> {
    let first_line = match editor.readline(&prompt(vm, false)) {
        Ok(line) => line,
        Err(ReadlineError::Eof) => return None,
        Err(ReadlineError::Interrupted) => {
            vm.interrupt();
            return Some(String::new());
        }
        Err(e) => {
            eprintln!("readline error: {}", e);
            return None;
        }
    };

    let mut buffer = first_line;

    while needs_continuation(&buffer) {
        match editor.readline(&prompt(vm, true)) {
            Ok(line) => {
                buffer.push('\n');
                buffer.push_str(&line);
            }
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => break,
            Err(e) => {
                eprintln!("readline error: {}", e);
                break;
            }
        }
    }

    let _ = editor.add_history_entry(&buffer);
    Some(buffer)
}

/// True while brackets are unbalanced outside strings and comments.
fn needs_continuation(input: &str) -> bool {
    let mut parens: i32 = 0;
    let mut brackets: i32 = 0;
    let mut braces: i32 = 0;
    let mut in_string = false;
    let mut in_comment = false;
    let mut prev: char = '\0';

    for c in input.chars() {
        if in_string {
            if c == '"' && prev != '\\' {
                in_string = false;
            }
            prev = c;
            continue;
        }
        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            prev = c;
            continue;
        }
        match c {
            '"' => in_string = true,
            ';' => in_comment = true,
            '(' => parens += 1,
            ')' => parens -= 1,
            '[' => brackets += 1,
            ']' => brackets -= 1,
            '{' => braces += 1,
            '}' => braces -= 1,
            _ => {}
        }
        prev = c;
    }

    parens > 0 || brackets > 0 || braces > 0 || in_string
}
