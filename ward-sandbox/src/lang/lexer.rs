//! Tokenizer with indentation tracking

use super::token::{keyword, Span, StrLiteral, Token, TokenKind, OPERATORS};
use super::SyntaxError;

/// Tokenize a whole program, producing NEWLINE/INDENT/DEDENT tokens the way
/// the parser expects them. Always ends with `EndOfFile`.
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let normalized = source.replace("\r\n", "\n").replace('\r', "\n");
    Lexer::new(&normalized, Span::new(1, 0)).run()
}

/// Tokenize an expression fragment (f-string field), positioned at `origin`.
pub(crate) fn tokenize_fragment(source: &str, origin: Span) -> Result<Vec<Token>, SyntaxError> {
    let mut lexer = Lexer::new(source, origin);
    // Fragments behave as if wrapped in brackets: newlines are insignificant.
    lexer.floor = 1;
    lexer.depth = 1;
    lexer.at_line_start = false;
    let mut tokens = lexer.run()?;
    tokens.retain(|token| {
        !matches!(
            token.kind,
            TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent
        )
    });
    Ok(tokens)
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    indents: Vec<usize>,
    depth: usize,
    /// Bracket depth the input starts at; only fragments raise it.
    floor: usize,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str, origin: Span) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: origin.line,
            column: origin.column,
            indents: vec![0],
            depth: 0,
            floor: 0,
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    fn span(&self) -> Span {
        Span::new(self.line, self.column)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, span: Span) {
        self.tokens.push(Token { kind, span });
    }

    fn last_is_newline(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.kind),
            None | Some(TokenKind::Newline) | Some(TokenKind::Indent) | Some(TokenKind::Dedent)
        )
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        loop {
            if self.at_line_start && self.depth == 0 {
                if !self.start_line()? {
                    if self.peek().is_none() {
                        break;
                    }
                    continue;
                }
                self.at_line_start = false;
            }

            let Some(c) = self.peek() else { break };
            match c {
                ' ' | '\t' | '\x0c' => {
                    self.advance();
                }
                '#' => self.skip_comment(),
                '\n' => {
                    let span = self.span();
                    self.advance();
                    if self.depth == 0 {
                        if !self.last_is_newline() {
                            self.push(TokenKind::Newline, span);
                        }
                        self.at_line_start = true;
                    }
                }
                '\\' => {
                    let span = self.span();
                    self.advance();
                    if self.peek() == Some('\n') {
                        self.advance();
                    } else {
                        return Err(SyntaxError::new(
                            "unexpected character after line continuation character",
                            span,
                        ));
                    }
                }
                c if c.is_ascii_digit() => self.lex_number()?,
                '.' if self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) => self.lex_number()?,
                '"' | '\'' => self.lex_string(String::new(), self.span())?,
                c if c == '_' || c.is_alphabetic() => self.lex_name()?,
                _ => self.lex_operator()?,
            }
        }

        if self.depth > self.floor {
            return Err(SyntaxError::new(
                "unexpected end of input: bracket was never closed",
                self.span(),
            ));
        }

        let end = self.span();
        if !self.last_is_newline() {
            self.push(TokenKind::Newline, end);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent, end);
        }
        self.push(TokenKind::EndOfFile, end);
        Ok(self.tokens)
    }

    /// Handle indentation at the start of a logical line. Returns false for
    /// blank and comment-only lines, which produce no tokens.
    fn start_line(&mut self) -> Result<bool, SyntaxError> {
        let mut width = 0usize;
        while let Some(c) = self.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\x0c' => width = 0,
                _ => break,
            }
            self.advance();
        }

        match self.peek() {
            None => return Ok(false),
            Some('#') => {
                self.skip_comment();
                if self.peek() == Some('\n') {
                    self.advance();
                }
                return Ok(false);
            }
            Some('\n') => {
                self.advance();
                return Ok(false);
            }
            _ => {}
        }

        let span = self.span();
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent, span);
        } else if width < current {
            while self.indents.last().is_some_and(|top| *top > width) {
                self.indents.pop();
                self.push(TokenKind::Dedent, span);
            }
            if self.indents.last().copied() != Some(width) {
                return Err(SyntaxError::new(
                    "unindent does not match any outer indentation level",
                    span,
                ));
            }
        }
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn lex_name(&mut self) -> Result<(), SyntaxError> {
        let span = self.span();
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c == '_' || c.is_alphanumeric() {
                word.push(c);
                self.advance();
            } else {
                break;
            }
        }

        if matches!(self.peek(), Some('"') | Some('\'')) && is_string_prefix(&word) {
            return self.lex_string(word, span);
        }

        match keyword(&word) {
            Some(kw) => self.push(TokenKind::Keyword(kw), span),
            None => self.push(TokenKind::Name(word), span),
        }
        Ok(())
    }

    fn lex_number(&mut self) -> Result<(), SyntaxError> {
        let span = self.span();
        let mut text = String::new();

        if self.peek() == Some('0') {
            if let Some(radix) = match self.peek_at(1) {
                Some('x') | Some('X') => Some(16),
                Some('o') | Some('O') => Some(8),
                Some('b') | Some('B') => Some(2),
                _ => None,
            } {
                self.advance();
                self.advance();
                while let Some(c) = self.peek() {
                    if c == '_' {
                        self.advance();
                    } else if c.is_digit(radix) {
                        text.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
                if text.is_empty() {
                    return Err(SyntaxError::new("invalid integer literal", span));
                }
                let kind = match i64::from_str_radix(&text, radix) {
                    Ok(value) => TokenKind::Int(value),
                    Err(_) => TokenKind::BigInt(text),
                };
                self.push(kind, span);
                return Ok(());
            }
        }

        let mut is_float = false;
        self.take_digits(&mut text);
        if self.peek() == Some('.') {
            is_float = true;
            text.push('.');
            self.advance();
            self.take_digits(&mut text);
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign_offset = usize::from(matches!(self.peek_at(1), Some('+') | Some('-')));
            if self
                .peek_at(1 + sign_offset)
                .is_some_and(|c| c.is_ascii_digit())
            {
                is_float = true;
                text.push('e');
                self.advance();
                if sign_offset == 1 {
                    if let Some(sign) = self.advance() {
                        text.push(sign);
                    }
                }
                self.take_digits(&mut text);
            }
        }

        if matches!(self.peek(), Some('j') | Some('J')) {
            self.advance();
            let value = text
                .parse::<f64>()
                .map_err(|_| SyntaxError::new("invalid imaginary literal", span))?;
            self.push(TokenKind::Imaginary(value), span);
            return Ok(());
        }

        let kind = if is_float {
            TokenKind::Float(
                text.parse::<f64>()
                    .map_err(|_| SyntaxError::new("invalid float literal", span))?,
            )
        } else {
            match text.parse::<i64>() {
                Ok(value) => TokenKind::Int(value),
                Err(_) => TokenKind::BigInt(text),
            }
        };
        self.push(kind, span);
        Ok(())
    }

    fn take_digits(&mut self, text: &mut String) {
        while let Some(c) = self.peek() {
            if c == '_' {
                self.advance();
            } else if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
    }

    fn lex_string(&mut self, prefix: String, span: Span) -> Result<(), SyntaxError> {
        let prefix = prefix.to_ascii_lowercase();
        let raw = prefix.contains('r');
        let bytes = prefix.contains('b');
        let formatted = prefix.contains('f');

        let Some(quote) = self.advance() else {
            return Err(SyntaxError::new("unterminated string literal", span));
        };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.advance();
            self.advance();
        }

        let mut body = String::new();
        loop {
            let Some(c) = self.peek() else {
                let message = if triple {
                    "unterminated triple-quoted string literal"
                } else {
                    "unterminated string literal"
                };
                return Err(SyntaxError::new(message, span));
            };

            if c == '\\' {
                body.push(c);
                self.advance();
                if let Some(next) = self.advance() {
                    body.push(next);
                }
                continue;
            }

            if c == quote {
                if !triple {
                    self.advance();
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.advance();
                    self.advance();
                    self.advance();
                    break;
                }
            }

            if c == '\n' && !triple {
                return Err(SyntaxError::new("unterminated string literal", span));
            }

            body.push(c);
            self.advance();
        }

        let value = if raw || formatted {
            body
        } else {
            unescape(&body).map_err(|message| SyntaxError::new(message, span))?
        };

        self.push(
            TokenKind::Str(StrLiteral {
                value,
                bytes,
                formatted,
                raw,
            }),
            span,
        );
        Ok(())
    }

    fn lex_operator(&mut self) -> Result<(), SyntaxError> {
        let span = self.span();
        let op = OPERATORS.iter().copied().find(|op| {
            op.chars()
                .enumerate()
                .all(|(i, c)| self.peek_at(i) == Some(c))
        });

        let Some(op) = op else {
            let c = self.peek().unwrap_or('?');
            return Err(SyntaxError::new(
                format!("invalid character '{}' (U+{:04X})", c, c as u32),
                span,
            ));
        };

        match op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => {
                if self.depth == self.floor {
                    return Err(SyntaxError::new(format!("unmatched '{}'", op), span));
                }
                self.depth -= 1;
            }
            _ => {}
        }

        for _ in 0..op.chars().count() {
            self.advance();
        }
        self.push(TokenKind::Op(op), span);
        Ok(())
    }
}

fn is_string_prefix(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "r" | "u" | "b" | "f" | "br" | "rb" | "fr" | "rf"
    )
}

/// Process backslash escapes of a non-raw string body.
pub(crate) fn unescape(body: &str) -> Result<String, String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(next) = chars.next() else {
            out.push('\\');
            break;
        };
        match next {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\x0b'),
            '0'..='7' => {
                let mut value = next.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(digit) => {
                            value = value * 8 + digit;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(value).unwrap_or('\u{fffd}'));
            }
            'x' | 'u' | 'U' => {
                let width = match next {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let mut digits = String::new();
                for _ in 0..width {
                    match chars.next() {
                        Some(c) if c.is_ascii_hexdigit() => digits.push(c),
                        _ => return Err(format!("truncated \\{} escape", next)),
                    }
                }
                let code = u32::from_str_radix(&digits, 16)
                    .map_err(|_| format!("invalid \\{} escape", next))?;
                let ch = char::from_u32(code)
                    .ok_or_else(|| format!("illegal Unicode character in \\{} escape", next))?;
                out.push(ch);
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn test_indentation_tokens() {
        let kinds = kinds("if x:\n    y = 1\n\n    # note\nz\n");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Keyword("if"),
                TokenKind::Name("x".into()),
                TokenKind::Op(":"),
                TokenKind::Newline,
                TokenKind::Indent,
                TokenKind::Name("y".into()),
                TokenKind::Op("="),
                TokenKind::Int(1),
                TokenKind::Newline,
                TokenKind::Dedent,
                TokenKind::Name("z".into()),
                TokenKind::Newline,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn test_brackets_join_lines() {
        let kinds = kinds("f(1,\n  2)\n");
        assert!(!kinds[..kinds.len() - 2].contains(&TokenKind::Newline));
        assert!(!kinds.contains(&TokenKind::Indent));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("0x_ff")[0], TokenKind::Int(255));
        assert_eq!(kinds("1_000")[0], TokenKind::Int(1000));
        assert_eq!(kinds("1.5e3")[0], TokenKind::Float(1500.0));
        assert_eq!(kinds(".25")[0], TokenKind::Float(0.25));
        assert_eq!(
            kinds("99999999999999999999")[0],
            TokenKind::BigInt("99999999999999999999".into())
        );
    }

    #[test]
    fn test_string_prefixes_and_escapes() {
        match &kinds(r#"b'a\n'"#)[0] {
            TokenKind::Str(lit) => {
                assert!(lit.bytes);
                assert_eq!(lit.value, "a\n");
            }
            other => panic!("unexpected {:?}", other),
        }
        match &kinds(r#"r'a\n'"#)[0] {
            TokenKind::Str(lit) => assert_eq!(lit.value, "a\\n"),
            other => panic!("unexpected {:?}", other),
        }
        match &kinds("f'{x}'")[0] {
            TokenKind::Str(lit) => {
                assert!(lit.formatted);
                assert_eq!(lit.value, "{x}");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_triple_quoted_spans_lines() {
        let tokens = tokenize("s = '''a\nb'''\nt = 1\n").unwrap();
        let t = tokens
            .iter()
            .find(|token| token.kind == TokenKind::Name("t".into()))
            .unwrap();
        assert_eq!(t.span.line, 3);
    }

    #[test]
    fn test_fragments_are_bracketed() {
        let tokens = tokenize_fragment("x +\n  y", Span::new(4, 7)).unwrap();
        let kinds: Vec<_> = tokens.iter().map(|token| token.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Name("x".into()),
                TokenKind::Op("+"),
                TokenKind::Name("y".into()),
                TokenKind::EndOfFile,
            ]
        );
        assert_eq!(tokens[0].span, Span::new(4, 7));
        assert!(tokenize_fragment("f(a)[0]", Span::new(1, 0)).is_ok());
        assert!(tokenize_fragment("f(a", Span::new(1, 0)).is_err());
        assert!(tokenize_fragment("a)", Span::new(1, 0)).is_err());
    }

    #[test]
    fn test_errors() {
        assert!(tokenize("x = 'abc\n").is_err());
        assert!(tokenize("f(1, 2\n").is_err());
        assert!(tokenize("x = 1)\n").is_err());
        assert!(tokenize("x = $\n").is_err());
        let err = tokenize("if x:\n        a\n    b\n").unwrap_err();
        assert!(err.message.contains("unindent"));
        assert_eq!(err.line, 3);
    }
}
