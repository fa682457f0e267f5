//! Result and error types for compilation, and the warning sink.

use thiserror::Error;
use zilc_frontend::error::{FrontendError, Location};
use zilc_zmachine::text::TextError;

/// A compilation error. The kinds mirror the phases: what the front end
/// did not catch is semantic, code generation or layout.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Frontend(#[from] FrontendError),

    #[error("{loc}: {message}")]
    Semantic { loc: Location, message: String },

    #[error("{loc}: {message}")]
    Codegen { loc: Location, message: String },

    #[error("{loc}: {source}")]
    Encoding {
        loc: Location,
        #[source]
        source: TextError,
    },

    #[error("layout: {message}")]
    Layout { message: String },

    #[error("too many warnings (limit {limit})")]
    TooManyWarnings { limit: usize },
}

pub type CompileResult<T> = Result<T, CompileError>;

/// A non-fatal diagnostic.
#[derive(Clone, Debug)]
pub struct Warning {
    pub loc: Option<Location>,
    pub message: String,
}

impl core::fmt::Display for Warning {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match &self.loc {
            Some(loc) => write!(f, "{loc}: warning: {}", self.message),
            None => write!(f, "warning: {}", self.message),
        }
    }
}

/// Accumulates warnings up to a limit; past the limit, compilation is
/// aborted rather than drowning the user.
pub struct Diagnostics {
    warnings: Vec<Warning>,
    limit: usize,
}

impl Diagnostics {
    pub fn new(limit: usize) -> Self {
        Diagnostics { warnings: Vec::new(), limit }
    }

    pub fn warn(&mut self, loc: Option<Location>, message: impl Into<String>) -> CompileResult<()> {
        let message = message.into();
        log::warn!("{message}");
        self.warnings.push(Warning { loc, message });
        if self.warnings.len() > self.limit {
            return Err(CompileError::TooManyWarnings { limit: self.limit });
        }
        Ok(())
    }

    pub fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }

    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_limit_aborts() {
        let mut d = Diagnostics::new(2);
        assert!(d.warn(None, "one").is_ok());
        assert!(d.warn(None, "two").is_ok());
        assert!(matches!(
            d.warn(None, "three"),
            Err(CompileError::TooManyWarnings { limit: 2 })
        ));
    }
}
