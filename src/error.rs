//! # Error Module
//!
//! Unified error type for every stage of the Vesper pipeline.
//! Errors carry a keyword-tagged kind (the same tags surface to the
//! language as the head of an `<error>` value's data array) and an
//! accumulated backtrace of code-object names.

use crate::value::Value;

use std::fmt;

// -----------------------------------------------------------------------------
// ERROR KIND — Keyword Taxonomy
// -----------------------------------------------------------------------------

/// Classifies an error with the language-level keyword tag it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Generic error (`error:`).
    Error,
    /// Bad argument type, arity, or value (`argument-error:`).
    Argument,
    /// Reader or compiler syntax violation (`syntax-error:`).
    Syntax,
    /// Macro transformer misuse (`macro-error:`).
    Macro,
    /// Filesystem or module-loading failure (`io-error:`).
    Io,
    /// The interrupt flag was observed (`interrupt:`).
    Interrupt,
    /// Invariant violation (`internal-error:`).
    Internal,
}

impl ErrorKind {
    /// The keyword tag for this kind, exactly as it appears in the language.
    pub fn keyword(&self) -> &'static str {
        match self {
            ErrorKind::Error => "error:",
            ErrorKind::Argument => "argument-error:",
            ErrorKind::Syntax => "syntax-error:",
            ErrorKind::Macro => "macro-error:",
            ErrorKind::Io => "io-error:",
            ErrorKind::Interrupt => "interrupt:",
            ErrorKind::Internal => "internal-error:",
        }
    }

    /// Maps a keyword tag text back to a kind, defaulting to `Error`.
    pub fn from_keyword(text: &str) -> ErrorKind {
        match text {
            "argument-error:" => ErrorKind::Argument,
            "syntax-error:" => ErrorKind::Syntax,
            "macro-error:" => ErrorKind::Macro,
            "io-error:" => ErrorKind::Io,
            "interrupt:" => ErrorKind::Interrupt,
            "internal-error:" => ErrorKind::Internal,
            _ => ErrorKind::Error,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keyword())
    }
}

// -----------------------------------------------------------------------------
// VESPER ERROR — Unified Error Type
// -----------------------------------------------------------------------------

/// The unified error type for the whole interpreter.
///
/// `value` is set when the error originated as (or was converted to) a
/// language-level `<error>` value, e.g. via `uncaught-error`. `trace`
/// collects the names of code objects the error propagated through.
#[derive(Debug, Clone)]
pub struct VesperError {
    pub kind: ErrorKind,
    pub message: String,
    pub value: Option<Value>,
    pub trace: Vec<String>,
}

impl VesperError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            value: None,
            trace: Vec::new(),
        }
    }

    #[inline]
    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Error, message)
    }

    #[inline]
    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Argument, message)
    }

    #[inline]
    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }

    #[inline]
    pub fn macro_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Macro, message)
    }

    #[inline]
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    #[inline]
    pub fn interrupt() -> Self {
        Self::new(ErrorKind::Interrupt, "execution interrupted")
    }

    #[inline]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Wraps a language-level error value so it can propagate through
    /// host Results and be handed to `*top-handler*` unchanged.
    pub fn from_value(kind: ErrorKind, message: String, value: Value) -> Self {
        Self {
            kind,
            message,
            value: Some(value),
            trace: Vec::new(),
        }
    }

    /// Records the name of a code object the error passed through.
    /// The VM calls this as the error unwinds, newest frame first.
    pub fn annotate(&mut self, code_name: &str) {
        if !code_name.is_empty() {
            self.trace.push(code_name.to_string());
        }
    }
}

impl fmt::Display for VesperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.keyword(), self.message)?;
        if !self.trace.is_empty() {
            write!(f, " [in {}]", self.trace.join(" < "))?;
        }
        Ok(())
    }
}

impl std::error::Error for VesperError {}

/// Convenience alias used throughout the interpreter.
pub type VesperResult<T> = std::result::Result<T, VesperError>;
