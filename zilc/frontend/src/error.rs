//! Front-end error types and source locations.

use core::fmt;
use thiserror::Error;

/// A position in one of the original source files, 1-based.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Location { file: file.into(), line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Errors raised before code generation. Each carries the location of
/// the offending text.
#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("{loc}: unterminated string literal")]
    UnterminatedString { loc: Location },

    #[error("{loc}: malformed token `{text}`")]
    MalformedToken { loc: Location, text: String },

    #[error("{loc}: unexpected `{found}`{}", expected.as_ref().map(|e| format!(", expected {e}")).unwrap_or_default())]
    Unexpected { loc: Location, found: String, expected: Option<String> },

    #[error("{loc}: unbalanced brackets: missing `{close}`")]
    Unbalanced { loc: Location, close: char },

    #[error("{loc}: cannot open include file \"{name}\": {reason}")]
    UnknownInclude { loc: Location, name: String, reason: String },

    #[error("{loc}: include cycle: {cycle}")]
    IncludeCycle { loc: Location, cycle: String },

    #[error("{loc}: compilation flag {name} must be an atom, T or <>")]
    BadFlagValue { loc: Location, name: String },

    #[error("{loc}: macro {name} called with {got} arguments, expected {want}")]
    MacroArity { loc: Location, name: String, want: String, got: usize },

    #[error("{loc}: reference to unbound macro parameter .{name}")]
    UnboundParameter { loc: Location, name: String },

    #[error("{loc}: macro expansion did not terminate (depth {depth})")]
    MacroDivergence { loc: Location, depth: usize },

    #[error("{loc}: {message}")]
    Other { loc: Location, message: String },
}

impl FrontendError {
    /// Location of the error, for diagnostics sorting.
    pub fn location(&self) -> &Location {
        match self {
            FrontendError::UnterminatedString { loc }
            | FrontendError::MalformedToken { loc, .. }
            | FrontendError::Unexpected { loc, .. }
            | FrontendError::Unbalanced { loc, .. }
            | FrontendError::UnknownInclude { loc, .. }
            | FrontendError::IncludeCycle { loc, .. }
            | FrontendError::BadFlagValue { loc, .. }
            | FrontendError::MacroArity { loc, .. }
            | FrontendError::UnboundParameter { loc, .. }
            | FrontendError::MacroDivergence { loc, .. }
            | FrontendError::Other { loc, .. } => loc,
        }
    }
}
