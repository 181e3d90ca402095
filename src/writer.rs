//! # Writer Module
//!
//! Renders values back to text. Generic mode produces a form the
//! reader reconstructs; JSON mode maps lists and arrays to JSON
//! arrays, structs to objects, and keywords to strings with the colon
//! stripped — values with no JSON equivalent are an argument error.

use crate::error::{VesperError, VesperResult};
use crate::value::{self, Function, Value};

const DEFAULT_INDENT_SIZE: &str = "    ";

/// Writes a value in readable form on a single line.
pub fn write(obj: &Value) -> String {
    write_indent(obj, "")
}

/// Pretty-prints a value with the default indent width.
pub fn pretty(obj: &Value) -> String {
    write_indent(obj, DEFAULT_INDENT_SIZE)
}

pub fn write_indent(obj: &Value, indent_size: &str) -> String {
    write_to_string(obj, false, indent_size).unwrap_or_default()
}

/// Writes all the values of a list, one per line.
pub fn write_all_indent(obj: &Value, indent_size: &str) -> String {
    if obj.is_list() {
        let mut buf = String::new();
        let mut cur = obj.clone();
        while !cur.is_empty_list() {
            buf.push_str(&write_indent(&value::car(&cur), indent_size));
            buf.push('\n');
            cur = value::cdr(&cur);
        }
        return buf;
    }
    let s = write_indent(obj, indent_size);
    if indent_size.is_empty() {
        return s + "\n";
    }
    s
}

pub fn write_to_string(obj: &Value, json: bool, indent_size: &str) -> VesperResult<String> {
    let s = write_data(obj, json, "", indent_size)?;
    if !indent_size.is_empty() {
        return Ok(s + "\n");
    }
    Ok(s)
}

fn write_data(obj: &Value, json: bool, indent: &str, indent_size: &str) -> VesperResult<String> {
    match obj {
        Value::Null => Ok("null".to_string()),
        Value::Boolean(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(value::number_to_string(*n)),
        Value::List(_) => {
            if json {
                let elements = value::list_to_vec(obj);
                write_elements(&elements, json, indent, indent_size)
            } else {
                Ok(write_list(obj, indent, indent_size))
            }
        }
        Value::Keyword(n) => {
            if json {
                Ok(encode_string(n.text.trim_end_matches(':')))
            } else {
                Ok(n.text.clone())
            }
        }
        Value::Symbol(n) | Value::Type(n) => {
            if json {
                Err(not_json(obj))
            } else {
                Ok(n.text.clone())
            }
        }
        Value::String(s) => Ok(encode_string(s)),
        Value::Array(a) => {
            let elements = a.elements.lock().unwrap().clone();
            write_elements(&elements, json, indent, indent_size)
        }
        Value::Struct(_) => write_struct(obj, json, indent, indent_size),
        Value::Character(c) => {
            if json {
                return Err(not_json(obj));
            }
            Ok(write_character(*c))
        }
        Value::Instance(inst) => {
            if json {
                return Err(not_json(obj));
            }
            let tag = inst.tag.name_text().unwrap_or("<instance>");
            Ok(format!(
                "#{} {}",
                tag,
                write_data(&inst.data, false, indent, indent_size)?
            ))
        }
        Value::Blob(b) => {
            if json {
                return Err(not_json(obj));
            }
            Ok(format!("#[blob {} bytes]", b.len()))
        }
        Value::Function(f) => {
            if json {
                return Err(not_json(obj));
            }
            Ok(write_function(f))
        }
        Value::Code(c) => {
            if json {
                return Err(not_json(obj));
            }
            if c.name.is_empty() {
                Ok("#[code]".to_string())
            } else {
                Ok(format!("#[code {}]", c.name))
            }
        }
        Value::Error(e) => {
            if json {
                return Err(not_json(obj));
            }
            Ok(format!("#[error {}]", write(&e.data)))
        }
        Value::Channel(ch) => {
            if json {
                return Err(not_json(obj));
            }
            Ok(ch.describe())
        }
    }
}

fn not_json(obj: &Value) -> VesperError {
    VesperError::argument(format!("data cannot be described in JSON: {}", write(obj)))
}

fn write_function(f: &Function) -> String {
    match f {
        Function::Closure { code, .. } => {
            if code.name.is_empty() {
                "#[function]".to_string()
            } else {
                format!("#[function {}]", code.name)
            }
        }
        Function::Primitive(p) => format!("#[function {}]", p.name),
        Function::Continuation(_) => "#[continuation]".to_string(),
        Function::Apply => "#[function apply]".to_string(),
        Function::CallCC => "#[function callcc]".to_string(),
        Function::Go => "#[function go]".to_string(),
    }
}

fn write_character(c: char) -> String {
    match c {
        '\0' => "#\\null".to_string(),
        '\u{0007}' => "#\\alarm".to_string(),
        '\u{0008}' => "#\\backspace".to_string(),
        '\t' => "#\\tab".to_string(),
        '\n' => "#\\newline".to_string(),
        '\r' => "#\\return".to_string(),
        '\u{001B}' => "#\\escape".to_string(),
        ' ' => "#\\space".to_string(),
        '\u{007F}' => "#\\delete".to_string(),
        c if c > ' ' && c < '\u{007F}' => format!("#\\{}", c),
        c => format!("#\\x{:04X}", c as u32),
    }
}

fn write_list(lst: &Value, indent: &str, indent_size: &str) -> String {
    if lst.is_empty_list() {
        return "()".to_string();
    }
    // Render the reader abbreviations for the quote family.
    if !value::cdr(lst).is_empty_list() && value::cddr(lst).is_empty_list() {
        let datum = value::cadr(lst);
        match value::car(lst).name_text() {
            Some("quote") => return format!("'{}", write(&datum)),
            Some("quasiquote") => return format!("`{}", write(&datum)),
            Some("unquote") => return format!("~{}", write(&datum)),
            Some("unquote-splicing") => return format!("~@{}", write(&datum)),
            _ => {}
        }
    }
    let mut buf = String::from("(");
    let mut delim = " ".to_string();
    let mut next_indent = String::new();
    if !indent_size.is_empty() {
        next_indent = format!("{}{}", indent, indent_size);
        delim = format!("\n{}", next_indent);
        buf.push_str(&delim);
    }
    let mut first = true;
    let mut cur = lst.clone();
    while !cur.is_empty_list() {
        if !first {
            buf.push_str(&delim);
        }
        first = false;
        buf.push_str(
            &write_data(&value::car(&cur), false, &next_indent, indent_size).unwrap_or_default(),
        );
        cur = value::cdr(&cur);
    }
    if !indent_size.is_empty() {
        buf.push('\n');
        buf.push_str(indent);
    }
    buf.push(')');
    buf
}

fn write_elements(
    elements: &[Value],
    json: bool,
    indent: &str,
    indent_size: &str,
) -> VesperResult<String> {
    let mut buf = String::from("[");
    if !elements.is_empty() {
        let mut delim = if json { "," } else { "" }.to_string();
        let mut next_indent = String::new();
        if !indent_size.is_empty() {
            next_indent = format!("{}{}", indent, indent_size);
            delim = format!("{}\n{}", delim, next_indent);
            buf.push('\n');
            buf.push_str(&next_indent);
        } else {
            delim.push(' ');
        }
        for (i, element) in elements.iter().enumerate() {
            if i > 0 {
                buf.push_str(&delim);
            }
            buf.push_str(&write_data(element, json, &next_indent, indent_size)?);
        }
    }
    if !indent_size.is_empty() {
        buf.push('\n');
        buf.push_str(indent);
    }
    buf.push(']');
    Ok(buf)
}

fn write_struct(strct: &Value, json: bool, indent: &str, indent_size: &str) -> VesperResult<String> {
    let pairs = match strct {
        Value::Struct(s) => s.pairs(),
        _ => Vec::new(),
    };
    let mut buf = String::from("{");
    let mut delim = if json { "," } else { "" }.to_string();
    let sep = if json { ": " } else { " " };
    let mut next_indent = String::new();
    if !pairs.is_empty() {
        if !indent_size.is_empty() {
            next_indent = format!("{}{}", indent, indent_size);
            delim = format!("{}\n{}", delim, next_indent);
            buf.push('\n');
            buf.push_str(&next_indent);
        } else {
            delim.push(' ');
        }
    }
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            buf.push_str(&delim);
        }
        buf.push_str(&write_data(k, json, &next_indent, indent_size)?);
        buf.push_str(sep);
        buf.push_str(&write_data(v, json, &next_indent, indent_size)?);
    }
    if !indent_size.is_empty() {
        buf.push('\n');
        buf.push_str(indent);
    }
    buf.push('}');
    Ok(buf)
}

/// Quotes and escapes a string the way the reader (and JSON) accept.
pub fn encode_string(s: &str) -> String {
    let mut buf = String::with_capacity(s.len() + 2);
    buf.push('"');
    for c in s.chars() {
        match c {
            '"' => buf.push_str("\\\""),
            '\\' => buf.push_str("\\\\"),
            '\n' => buf.push_str("\\n"),
            '\t' => buf.push_str("\\t"),
            '\r' => buf.push_str("\\r"),
            '\u{0008}' => buf.push_str("\\b"),
            '\u{000C}' => buf.push_str("\\f"),
            c if (c as u32) < 0x20 => buf.push_str(&format!("\\u{:04X}", c as u32)),
            c => buf.push(c),
        }
    }
    buf.push('"');
    buf
}
