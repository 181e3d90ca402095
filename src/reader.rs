//! # Reader Module
//!
//! Turns S-expression source text into value trees. The reader holds
//! a reference to the VM so the names it produces are interned and so
//! `#<type>` instance syntax resolves through the intern table.

use crate::builtin::make_instance;
use crate::error::{VesperError, VesperResult};
use crate::value::{self, Value};
use crate::vm::{is_valid_type_name, Vm};

use std::sync::Arc;

/// Reads the first datum in the input; null on end of input.
pub fn read(vm: &Arc<Vm>, input: &str, keys: &Value) -> VesperResult<Value> {
    let mut reader = Reader::new(vm, input);
    match reader.read_data(keys)? {
        Some(obj) => Ok(obj),
        None => Ok(Value::Null),
    }
}

/// Reads every datum in the input, returning them as a list.
pub fn read_all(vm: &Arc<Vm>, input: &str, keys: &Value) -> VesperResult<Value> {
    let mut reader = Reader::new(vm, input);
    let mut items = Vec::new();
    while let Some(obj) = reader.read_data(keys)? {
        items.push(obj);
    }
    Ok(value::list_from_values(&items))
}

fn is_whitespace(c: char) -> bool {
    c == ' ' || c == '\n' || c == '\t' || c == '\r' || c == ','
}

fn is_delimiter(c: char) -> bool {
    matches!(c, '(' | ')' | '[' | ']' | '{' | '}' | '"' | '\'' | ';' | ':')
}

struct Reader<'a> {
    vm: &'a Arc<Vm>,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(vm: &'a Arc<Vm>, input: &str) -> Self {
        Self {
            vm,
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn get_char(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn unget_char(&mut self) {
        if self.pos > 0 {
            self.pos -= 1;
        }
    }

    /// Reads one datum. None means clean end of input.
    fn read_data(&mut self, keys: &Value) -> VesperResult<Option<Value>> {
        while let Some(c) = self.get_char() {
            if is_whitespace(c) {
                continue;
            }
            match c {
                ';' => {
                    self.skip_comment();
                }
                '\'' => {
                    let quoted = self.require_data(keys, "'")?;
                    return Ok(Some(value::list_from_values(&[
                        self.vm.intern("quote"),
                        quoted,
                    ])));
                }
                '`' => {
                    let quoted = self.require_data(keys, "`")?;
                    return Ok(Some(value::list_from_values(&[
                        self.vm.intern("quasiquote"),
                        quoted,
                    ])));
                }
                '~' | '^' => {
                    let sym = match self.get_char() {
                        Some('@') => self.vm.intern("unquote-splicing"),
                        Some(_) => {
                            self.unget_char();
                            self.vm.intern("unquote")
                        }
                        None => return Err(VesperError::syntax("unexpected end of input after ~")),
                    };
                    let form = self.require_data(keys, "~")?;
                    return Ok(Some(value::list_from_values(&[sym, form])));
                }
                '#' => return self.decode_reader_macro(keys).map(Some),
                '(' => return self.decode_list(keys).map(Some),
                '[' => return self.decode_array(keys).map(Some),
                '{' => return self.decode_struct(keys).map(Some),
                '"' => return self.decode_string().map(Some),
                ')' | ']' | '}' => {
                    return Err(VesperError::syntax(format!("unexpected '{}'", c)))
                }
                _ => return self.decode_atom(c).map(Some),
            }
        }
        Ok(None)
    }

    fn require_data(&mut self, keys: &Value, after: &str) -> VesperResult<Value> {
        match self.read_data(keys)? {
            Some(v) => Ok(v),
            None => Err(VesperError::syntax(format!(
                "unexpected end of input after {}",
                after
            ))),
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.get_char() {
            if c == '\n' {
                return;
            }
        }
    }

    fn decode_string(&mut self) -> VesperResult<Value> {
        let mut buf = String::new();
        let mut escape = false;
        while let Some(c) = self.get_char() {
            if escape {
                escape = false;
                match c {
                    'n' => buf.push('\n'),
                    't' => buf.push('\t'),
                    'f' => buf.push('\u{000C}'),
                    'b' => buf.push('\u{0008}'),
                    'r' => buf.push('\r'),
                    'x' => buf.push(self.decode_unicode(2)?),
                    'u' => buf.push(self.decode_unicode(4)?),
                    'U' => buf.push(self.decode_unicode(8)?),
                    other => buf.push(other),
                }
            } else if c == '"' {
                return Ok(Value::string(buf));
            } else if c == '\\' {
                escape = true;
            } else {
                buf.push(c);
            }
        }
        Err(VesperError::syntax("unterminated string"))
    }

    fn decode_unicode(&mut self, size: usize) -> VesperResult<char> {
        let mut buf = String::new();
        for _ in 0..size {
            match self.get_char() {
                Some(c) => buf.push(c),
                None => return Err(VesperError::syntax("unterminated escape sequence")),
            }
        }
        let code = u32::from_str_radix(&buf, 16)
            .map_err(|_| VesperError::syntax(format!("bad escape sequence: \\{}", buf)))?;
        char::from_u32(code)
            .ok_or_else(|| VesperError::syntax(format!("bad character code: {:x}", code)))
    }

    fn decode_list(&mut self, keys: &Value) -> VesperResult<Value> {
        let items = self.decode_sequence(')', keys)?;
        Ok(value::list_from_values(&items))
    }

    fn decode_array(&mut self, keys: &Value) -> VesperResult<Value> {
        let items = self.decode_sequence(']', keys)?;
        Ok(Value::array(items))
    }

    fn decode_sequence(&mut self, end_char: char, keys: &Value) -> VesperResult<Vec<Value>> {
        let mut items = Vec::new();
        loop {
            match self.get_char() {
                None => {
                    return Err(VesperError::syntax(format!(
                        "unterminated sequence, expected '{}'",
                        end_char
                    )))
                }
                Some(c) if is_whitespace(c) => {}
                Some(';') => self.skip_comment(),
                Some(c) if c == end_char => return Ok(items),
                Some(_) => {
                    self.unget_char();
                    let element = self.require_data(keys, "sequence element")?;
                    items.push(element);
                }
            }
        }
    }

    /// Skips whitespace and comments up to the next datum, optionally
    /// also skipping colons (between struct keys and values).
    fn skip_to_data(&mut self, skip_colon: bool) -> VesperResult<char> {
        loop {
            match self.get_char() {
                None => return Err(VesperError::syntax("unterminated struct")),
                Some(c) if is_whitespace(c) || (skip_colon && c == ':') => {}
                Some(';') => self.skip_comment(),
                Some(c) => return Ok(c),
            }
        }
    }

    fn decode_struct(&mut self, keys: &Value) -> VesperResult<Value> {
        let mut items = Vec::new();
        loop {
            let c = self.skip_to_data(false)?;
            if c == ':' {
                return Err(VesperError::syntax("unexpected ':' in struct"));
            }
            if c == '}' {
                return value::struct_from_flat(&items).map_err(VesperError::argument);
            }
            self.unget_char();
            let mut key = self.require_data(&Value::Null, "struct key")?;
            key = self.coerce_key(key, keys)?;
            items.push(key);
            let c = self.skip_to_data(true)?;
            if c == '}' {
                return Err(VesperError::syntax("mismatched key/value in struct"));
            }
            self.unget_char();
            let val = self.require_data(keys, "struct value")?;
            items.push(val);
        }
    }

    /// Applies the `keys:` hint: coerce every struct key to the hinted
    /// kind as it is parsed; `<any>` (or no hint) leaves keys as read.
    fn coerce_key(&self, key: Value, keys: &Value) -> VesperResult<Value> {
        match keys.name_text() {
            Some("<keyword>") => self.vm.to_keyword(&key),
            Some("<symbol>") => self.vm.to_symbol(&key),
            Some("<string>") => Ok(match key {
                Value::String(_) => key,
                other => Value::string(format!("{}", other)),
            }),
            _ => Ok(key),
        }
    }

    fn decode_atom(&mut self, first_char: char) -> VesperResult<Value> {
        let s = self.decode_atom_string(first_char)?;
        let (name, keyword) = match s.strip_suffix(':') {
            Some(base) => (base.to_string(), true),
            None => {
                match s.as_str() {
                    "null" => return Ok(Value::Null),
                    "true" => return Ok(Value::Boolean(true)),
                    "false" => return Ok(Value::Boolean(false)),
                    _ => {}
                }
                (s.clone(), false)
            }
        };
        if let Ok(f) = name.parse::<f64>() {
            if keyword {
                return Err(VesperError::syntax(format!(
                    "keyword cannot have a name that looks like a number: {}:",
                    name
                )));
            }
            return Ok(Value::Number(f));
        }
        Ok(self.vm.intern(&s))
    }

    fn decode_atom_string(&mut self, first_char: char) -> VesperResult<String> {
        let mut buf = String::new();
        if first_char != '\0' {
            if first_char == ':' {
                return Err(VesperError::syntax(
                    "invalid keyword: colons only valid at the end of symbols",
                ));
            }
            buf.push(first_char);
        }
        while let Some(c) = self.get_char() {
            if is_whitespace(c) {
                break;
            }
            if c == ':' {
                buf.push(c);
                break;
            }
            if is_delimiter(c) {
                self.unget_char();
                break;
            }
            buf.push(c);
        }
        Ok(buf)
    }

    fn decode_type_name(&mut self, first_char: char) -> VesperResult<String> {
        let mut buf = String::new();
        if first_char != '<' {
            return Err(VesperError::syntax("invalid type name"));
        }
        buf.push(first_char);
        while let Some(c) = self.get_char() {
            if is_whitespace(c) {
                break;
            }
            if c == '>' {
                buf.push(c);
                break;
            }
            if is_delimiter(c) {
                self.unget_char();
                break;
            }
            buf.push(c);
        }
        Ok(buf)
    }

    fn decode_reader_macro(&mut self, keys: &Value) -> VesperResult<Value> {
        let c = self
            .get_char()
            .ok_or_else(|| VesperError::syntax("unexpected end of input after #"))?;
        match c {
            // Character literals.
            '\\' => {
                let c = self
                    .get_char()
                    .ok_or_else(|| VesperError::syntax("unterminated character literal"))?;
                if is_whitespace(c) || is_delimiter(c) {
                    return Ok(Value::Character(c));
                }
                let c2 = match self.get_char() {
                    Some(ch) => ch,
                    None => return Ok(Value::Character(c)),
                };
                if is_whitespace(c2) || is_delimiter(c2) {
                    self.unget_char();
                    return Ok(Value::Character(c));
                }
                let mut name = String::new();
                name.push(c);
                name.push(c2);
                while let Some(ch) = self.get_char() {
                    if is_whitespace(ch) || is_delimiter(ch) {
                        self.unget_char();
                        break;
                    }
                    name.push(ch);
                }
                named_char(&name).map(Value::Character)
            }
            '!' => {
                // #! runs to end of line and reads as null.
                self.skip_comment();
                Ok(Value::Null)
            }
            '[' => {
                let s = self.decode_atom_string('\0')?;
                Err(VesperError::syntax(format!("unreadable object: #[{}]", s)))
            }
            _ => {
                // #<type> value — a user-typed instance.
                let name = self.decode_type_name(c)?;
                if !is_valid_type_name(&name) {
                    return Err(VesperError::syntax(format!("bad reader macro: #{} ...", name)));
                }
                let val = self
                    .read_data(keys)?
                    .ok_or_else(|| VesperError::syntax(format!("bad reader macro: #{} ...", name)))?;
                make_instance(self.vm, &self.vm.intern(&name), &val)
            }
        }
    }
}

/// The nine named character forms, plus hexadecimal `xHH`.
fn named_char(name: &str) -> VesperResult<char> {
    match name {
        "null" => Ok('\0'),
        "alarm" => Ok('\u{0007}'),
        "backspace" => Ok('\u{0008}'),
        "tab" => Ok('\t'),
        "newline" => Ok('\n'),
        "return" => Ok('\r'),
        "escape" => Ok('\u{001B}'),
        "space" => Ok(' '),
        "delete" => Ok('\u{007F}'),
        _ => {
            if let Some(hex) = name.strip_prefix('x') {
                let code = u32::from_str_radix(hex, 16)
                    .map_err(|_| VesperError::syntax(format!("bad named character: #\\{}", name)))?;
                return char::from_u32(code)
                    .ok_or_else(|| VesperError::syntax(format!("bad named character: #\\{}", name)));
            }
            Err(VesperError::syntax(format!("bad named character: #\\{}", name)))
        }
    }
}
