//! Token definitions for the guest language

use serde::{Deserialize, Serialize};

/// Position of a token or node: 1-based line, 0-based column (in chars)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// String literal as it appeared in source
#[derive(Debug, Clone, PartialEq)]
pub struct StrLiteral {
    /// Escape-processed text; for f-strings the raw body (braces intact)
    pub value: String,
    pub bytes: bool,
    pub formatted: bool,
    pub raw: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Keyword(&'static str),
    Int(i64),
    /// Integer literal that does not fit in 64 bits
    BigInt(String),
    Float(f64),
    Imaginary(f64),
    Str(StrLiteral),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    EndOfFile,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Name(name) => format!("name '{}'", name),
            TokenKind::Keyword(kw) => format!("keyword '{}'", kw),
            TokenKind::Int(_) | TokenKind::BigInt(_) => "integer literal".to_string(),
            TokenKind::Float(_) => "float literal".to_string(),
            TokenKind::Imaginary(_) => "imaginary literal".to_string(),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Op(op) => format!("'{}'", op),
            TokenKind::Newline => "newline".to_string(),
            TokenKind::Indent => "indent".to_string(),
            TokenKind::Dedent => "dedent".to_string(),
            TokenKind::EndOfFile => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

pub const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

/// Operators and delimiters, longest first so the lexer can match greedily
pub const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "->", ":=", "**", "//", "<<", ">>", "<=", ">=", "==",
    "!=", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "@=", "+", "-", "*", "/", "%", "@",
    "&", "|", "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "=",
];

pub fn keyword(word: &str) -> Option<&'static str> {
    KEYWORDS.iter().copied().find(|kw| *kw == word)
}
