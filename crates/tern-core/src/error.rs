//! Error types for TernQL
//!
//! One error enum covers the whole pipeline. Lexer and parser problems are
//! *not* errors: they are collected as plain diagnostic strings and returned
//! next to a possibly-absent compiled query, so callers decide whether to
//! surface them.

use thiserror::Error;

/// The main error type for TernQL operations
#[derive(Error, Debug)]
pub enum Error {
    // ========== Compile Errors ==========
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("compile error: {0}")]
    Compile(String),

    #[error("reference to unknown label: {0}")]
    UnresolvedLabel(String),

    #[error("query function not defined: {0}")]
    UnknownFunction(String),

    // ========== Evaluation Errors ==========
    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("bind variable not found: {0}")]
    UnknownBindVariable(String),

    // ========== Store Errors ==========
    #[error("store error: {0}")]
    Store(String),

    // ========== Serialization Errors ==========
    #[error("serialization error: {0}")]
    Serialization(String),

    // ========== IO Errors ==========
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for TernQL operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error was raised while compiling a query
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            Error::Syntax(_)
                | Error::Compile(_)
                | Error::UnresolvedLabel(_)
                | Error::UnknownFunction(_)
        )
    }

    /// Returns true if this error was raised while evaluating a query
    pub fn is_evaluation_error(&self) -> bool {
        matches!(
            self,
            Error::Evaluation(_) | Error::UnknownBindVariable(_) | Error::Store(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnresolvedLabel("foo".to_string());
        assert_eq!(err.to_string(), "reference to unknown label: foo");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::Compile("bad ast".to_string()).is_compile_error());
        assert!(Error::UnknownFunction("frob".to_string()).is_compile_error());
        assert!(!Error::Compile("bad ast".to_string()).is_evaluation_error());
        assert!(Error::Evaluation("division by zero".to_string()).is_evaluation_error());
        assert!(Error::Store("backend gone".to_string()).is_evaluation_error());
    }
}
