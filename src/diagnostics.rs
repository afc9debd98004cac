// Error taxonomy and diagnostic formatting.
//
// Lex/parse problems accumulate into `Vec<Diagnostic>` so a run can report
// every syntax problem before bailing. Programmer errors raised during
// execution (unbound name, type-illegal operand, bounds, immutable
// rebinding, dispatch failure, import failure, stack overflow) are
// represented the same way and abort the run; "expected" errors
// (`Result::Error`, division by zero) are never represented here at all —
// they are ordinary `Value`s (see `value::Value::ResultError`).

use crate::token::Span;
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Lex,
    Parse,
    Resolve,
    Type,
    Bounds,
    Assign,
    Dispatch,
    Import,
    StackOverflow,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Lex => "LexError",
            ErrorKind::Parse => "ParseError",
            ErrorKind::Resolve => "ResolveError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Bounds => "BoundsError",
            ErrorKind::Assign => "AssignError",
            ErrorKind::Dispatch => "DispatchError",
            ErrorKind::Import => "ImportError",
            ErrorKind::StackOverflow => "StackOverflow",
        }
    }
}

// A `Warning` is recorded but never aborts a run; `Error` does (see the
// module doc comment). `eval_match`/`compile_match`'s no-matching-arm case
// is the one place today that produces a warning rather than an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub line: u32,
    pub column: u32,
    pub snippet: Option<String>,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn new(kind: ErrorKind, message: impl Into<String>, span: Span) -> Diagnostic {
        Diagnostic {
            kind,
            severity: Severity::Error,
            message: message.into(),
            line: span.line,
            column: span.column,
            snippet: None,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Diagnostic {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Diagnostic {
        self.snippet = Some(snippet.into());
        self
    }

    pub fn as_warning(mut self) -> Diagnostic {
        self.severity = Severity::Warning;
        self
    }

    // `Error at <file>:<line>:<col>: <message>. <optional hint>`
    pub fn render(&self, file: &str) -> String {
        let label = match self.severity {
            Severity::Warning => "Warning",
            Severity::Error => "Error",
        };
        let mut out = format!("{} at {}:{}:{}: {}.", label, file, self.line, self.column, self.message);
        if let Some(hint) = &self.hint {
            out.push(' ');
            out.push_str(hint);
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.render("<source>"))
    }
}

pub type Diagnostics = Vec<Diagnostic>;

pub fn resolve_error(message: impl Into<String>, span: Span) -> Diagnostic {
    Diagnostic::new(ErrorKind::Resolve, message, span)
}

pub fn type_error(message: impl Into<String>, span: Span) -> Diagnostic {
    Diagnostic::new(ErrorKind::Type, message, span)
}

pub fn bounds_error(message: impl Into<String>, span: Span) -> Diagnostic {
    Diagnostic::new(ErrorKind::Bounds, message, span)
}

pub fn assign_error(message: impl Into<String>, span: Span) -> Diagnostic {
    Diagnostic::new(ErrorKind::Assign, message, span)
}

pub fn dispatch_error(message: impl Into<String>, span: Span, candidates: &[String]) -> Diagnostic {
    let hint = if candidates.is_empty() {
        None
    } else {
        Some(format!("available signatures: {}", candidates.join(", ")))
    };
    let mut d = Diagnostic::new(ErrorKind::Dispatch, message, span);
    d.hint = hint;
    d
}

pub fn import_error(message: impl Into<String>, span: Span) -> Diagnostic {
    Diagnostic::new(ErrorKind::Import, message, span)
}

pub fn stack_overflow(span: Span) -> Diagnostic {
    Diagnostic::new(ErrorKind::StackOverflow, "call depth exceeded", span)
}

// A `match` whose scrutinee satisfies no arm evaluates to `null` rather than
// aborting; this records that as a warning instead of silently dropping it.
pub fn match_fallthrough_warning(span: Span) -> Diagnostic {
    Diagnostic::new(ErrorKind::Dispatch, "match expression had no matching arm; evaluated to null", span).as_warning()
}
