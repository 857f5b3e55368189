//! Front end for the guest language, a Python-syntax subset.
//!
//! The same syntax tree feeds the static analyzer and the in-process
//! interpreter, so both see exactly the same program structure.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use parser::{parse_expression, parse_module, MAX_CHAIN, MAX_NESTING};
pub use token::Span;

use thiserror::Error;

/// Program text that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (line {line}, column {column})")]
pub struct SyntaxError {
    pub message: String,
    /// 1-based
    pub line: usize,
    /// 0-based
    pub column: usize,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            line: span.line,
            column: span.column,
        }
    }

    pub fn span(&self) -> Span {
        Span::new(self.line, self.column)
    }
}
