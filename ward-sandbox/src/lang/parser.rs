//! Recursive-descent parser

use super::ast::*;
use super::lexer::{tokenize, tokenize_fragment, unescape};
use super::token::{Span, StrLiteral, Token, TokenKind};
use super::SyntaxError;
use std::sync::Arc;

/// Maximum nesting of blocks and bracketed/unary expressions
pub const MAX_NESTING: usize = 50;

/// Maximum length of an operator, trailer or `elif` chain
pub const MAX_CHAIN: usize = 500;

/// Parse a complete program
pub fn parse_module(source: &str) -> Result<Module, SyntaxError> {
    let tokens = tokenize(source)?;
    Parser::new(tokens, 0).parse_module()
}

/// Parse a single expression (or bare tuple) such as `a + b`
pub fn parse_expression(source: &str) -> Result<Expr, SyntaxError> {
    let tokens = tokenize_fragment(source, Span::new(1, 0))?;
    Parser::new(tokens, 0).parse_fragment()
}

#[derive(Default)]
struct Scope {
    in_function: bool,
    loops: usize,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    scope: Scope,
}

fn boxed(expr: Expr) -> Box<Expr> {
    Box::new(expr)
}

impl Parser {
    fn new(tokens: Vec<Token>, depth: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth,
            scope: Scope::default(),
        }
    }

    // ----- token helpers -------------------------------------------------

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_nth(&self, n: usize) -> &TokenKind {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + n).min(last)].kind
    }

    fn kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn span(&self) -> Span {
        self.peek().span
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len().saturating_sub(1) {
            self.pos += 1;
        }
        token
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(self.kind(), TokenKind::Op(o) if *o == op)
    }

    fn check_kw(&self, kw: &str) -> bool {
        matches!(self.kind(), TokenKind::Keyword(k) if *k == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.check_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Soft keywords (`match`, `case`) arrive as plain names
    fn check_soft(&self, word: &str) -> bool {
        matches!(self.kind(), TokenKind::Name(name) if name == word)
    }

    fn expect_op(&mut self, op: &str) -> Result<Span, SyntaxError> {
        if self.check_op(op) {
            Ok(self.advance().span)
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<Span, SyntaxError> {
        if self.check_kw(kw) {
            Ok(self.advance().span)
        } else {
            Err(self.error(format!("expected '{}'", kw)))
        }
    }

    fn expect_name(&mut self) -> Result<(String, Span), SyntaxError> {
        match self.kind().clone() {
            TokenKind::Name(name) => {
                let span = self.advance().span;
                Ok((name, span))
            }
            _ => Err(self.error("expected a name")),
        }
    }

    fn at_end_of_statement(&self) -> bool {
        matches!(
            self.kind(),
            TokenKind::Newline | TokenKind::EndOfFile | TokenKind::Dedent
        ) || self.check_op(";")
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        let token = self.peek();
        SyntaxError::new(
            format!("{} (found {})", message.into(), token.kind.describe()),
            token.span,
        )
    }

    fn enter(&mut self) -> Result<(), SyntaxError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(SyntaxError::new("too many nested parentheses or blocks", self.span()));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Whether the current token can begin an expression
    fn starts_expression(&self) -> bool {
        match self.kind() {
            TokenKind::Name(_)
            | TokenKind::Int(_)
            | TokenKind::BigInt(_)
            | TokenKind::Float(_)
            | TokenKind::Imaginary(_)
            | TokenKind::Str(_) => true,
            TokenKind::Keyword(kw) => matches!(
                *kw,
                "None" | "True" | "False" | "not" | "lambda" | "await" | "yield"
            ),
            TokenKind::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~" | "*" | "..."),
            _ => false,
        }
    }

    // ----- statements ----------------------------------------------------

    fn parse_module(mut self) -> Result<Module, SyntaxError> {
        let mut body = Vec::new();
        loop {
            match self.kind() {
                TokenKind::EndOfFile => break,
                TokenKind::Newline => {
                    self.advance();
                }
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(Module { body })
    }

    fn parse_fragment(mut self) -> Result<Expr, SyntaxError> {
        if matches!(self.kind(), TokenKind::EndOfFile) {
            return Err(self.error("empty expression"));
        }
        let expr = if self.check_kw("yield") {
            self.parse_yield()?
        } else {
            self.parse_testlist_star()?
        };
        if !matches!(self.kind(), TokenKind::EndOfFile) {
            return Err(self.error("invalid syntax"));
        }
        Ok(expr)
    }

    fn parse_statement(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        match self.kind() {
            TokenKind::Indent => Err(SyntaxError::new("unexpected indent", self.span())),
            TokenKind::Keyword("if") => Ok(vec![self.parse_if()?]),
            TokenKind::Keyword("while") => Ok(vec![self.parse_while()?]),
            TokenKind::Keyword("for") => Ok(vec![self.parse_for(false, None)?]),
            TokenKind::Keyword("try") => Ok(vec![self.parse_try()?]),
            TokenKind::Keyword("with") => Ok(vec![self.parse_with(false, None)?]),
            TokenKind::Keyword("def") => Ok(vec![self.parse_def(Vec::new(), false, None)?]),
            TokenKind::Keyword("class") => Ok(vec![self.parse_class(Vec::new())?]),
            TokenKind::Keyword("async") => Ok(vec![self.parse_async(Vec::new())?]),
            TokenKind::Op("@") => Ok(vec![self.parse_decorated()?]),
            _ if self.check_soft("match") && self.starts_match_statement() => {
                Ok(vec![self.parse_match()?])
            }
            _ => self.parse_simple_line(),
        }
    }

    fn parse_simple_line(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        let mut stmts = vec![self.parse_small_statement()?];
        while self.eat_op(";") {
            if matches!(self.kind(), TokenKind::Newline | TokenKind::EndOfFile) {
                break;
            }
            stmts.push(self.parse_small_statement()?);
        }
        match self.kind() {
            TokenKind::Newline => {
                self.advance();
            }
            TokenKind::EndOfFile | TokenKind::Dedent => {}
            _ => return Err(self.error("invalid syntax")),
        }
        Ok(stmts)
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.expect_op(":")?;
        if !matches!(self.kind(), TokenKind::Newline) {
            return self.parse_simple_line();
        }
        self.advance();
        if !matches!(self.kind(), TokenKind::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.advance();
        self.enter()?;
        let mut body = Vec::new();
        loop {
            match self.kind() {
                TokenKind::Dedent => {
                    self.advance();
                    break;
                }
                TokenKind::EndOfFile => break,
                TokenKind::Newline => {
                    self.advance();
                }
                _ => body.extend(self.parse_statement()?),
            }
        }
        self.leave();
        Ok(body)
    }

    fn parse_small_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let span = self.span();
        let kind = match self.kind().clone() {
            TokenKind::Keyword("pass") => {
                self.advance();
                StmtKind::Pass
            }
            TokenKind::Keyword("break") => {
                if self.scope.loops == 0 {
                    return Err(SyntaxError::new("'break' outside loop", span));
                }
                self.advance();
                StmtKind::Break
            }
            TokenKind::Keyword("continue") => {
                if self.scope.loops == 0 {
                    return Err(SyntaxError::new("'continue' not properly in loop", span));
                }
                self.advance();
                StmtKind::Continue
            }
            TokenKind::Keyword("return") => {
                if !self.scope.in_function {
                    return Err(SyntaxError::new("'return' outside function", span));
                }
                self.advance();
                if self.at_end_of_statement() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_testlist_star()?))
                }
            }
            TokenKind::Keyword("raise") => {
                self.advance();
                if self.at_end_of_statement() {
                    StmtKind::Raise {
                        exc: None,
                        cause: None,
                    }
                } else {
                    let exc = self.parse_test()?;
                    let cause = if self.eat_kw("from") {
                        Some(self.parse_test()?)
                    } else {
                        None
                    };
                    StmtKind::Raise {
                        exc: Some(exc),
                        cause,
                    }
                }
            }
            TokenKind::Keyword("global") | TokenKind::Keyword("nonlocal") => {
                let is_global = self.check_kw("global");
                self.advance();
                let mut names = vec![self.expect_name()?.0];
                while self.eat_op(",") {
                    names.push(self.expect_name()?.0);
                }
                if is_global {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                }
            }
            TokenKind::Keyword("del") => {
                self.advance();
                let targets = self.parse_target_list()?;
                let targets = match targets.kind {
                    ExprKind::Tuple(items) => items,
                    _ => vec![targets],
                };
                for target in &targets {
                    check_target(target, "delete")?;
                }
                StmtKind::Delete(targets)
            }
            TokenKind::Keyword("assert") => {
                self.advance();
                let test = self.parse_test()?;
                let msg = if self.eat_op(",") {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            TokenKind::Keyword("import") => self.parse_import()?,
            TokenKind::Keyword("from") => self.parse_from_import()?,
            _ => return self.parse_expression_statement(),
        };
        Ok(Stmt { kind, span })
    }

    fn parse_expression_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let span = self.span();
        let first = if self.check_kw("yield") {
            self.parse_yield()?
        } else {
            self.parse_testlist_star()?
        };

        if self.check_op("=") {
            let mut exprs = vec![first];
            while self.eat_op("=") {
                let next = if self.check_kw("yield") {
                    self.parse_yield()?
                } else {
                    self.parse_testlist_star()?
                };
                exprs.push(next);
            }
            let value = exprs.pop().ok_or_else(|| self.error("invalid assignment"))?;
            for target in &exprs {
                check_target(target, "assign to")?;
            }
            return Ok(Stmt {
                kind: StmtKind::Assign {
                    targets: exprs,
                    value,
                },
                span,
            });
        }

        if let TokenKind::Op(op) = self.kind() {
            if let Some(bin) = BinOpKind::from_augmented(op) {
                if !matches!(
                    first.kind,
                    ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. }
                ) {
                    return Err(SyntaxError::new(
                        format!(
                            "'{}' is an illegal expression for augmented assignment",
                            first.kind.describe()
                        ),
                        first.span,
                    ));
                }
                self.advance();
                let value = if self.check_kw("yield") {
                    self.parse_yield()?
                } else {
                    self.parse_testlist_star()?
                };
                return Ok(Stmt {
                    kind: StmtKind::AugAssign {
                        target: first,
                        op: bin,
                        value,
                    },
                    span,
                });
            }
        }

        if self.check_op(":") {
            if !matches!(
                first.kind,
                ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. }
            ) {
                return Err(SyntaxError::new(
                    "only single target (not tuple) can be annotated",
                    first.span,
                ));
            }
            self.advance();
            let annotation = self.parse_test()?;
            let value = if self.eat_op("=") {
                Some(self.parse_testlist_star()?)
            } else {
                None
            };
            return Ok(Stmt {
                kind: StmtKind::AnnAssign {
                    target: first,
                    annotation,
                    value,
                },
                span,
            });
        }

        Ok(Stmt {
            kind: StmtKind::Expr(first),
            span,
        })
    }

    fn parse_dotted_name(&mut self) -> Result<(String, Span), SyntaxError> {
        let (mut name, span) = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?.0);
        }
        Ok((name, span))
    }

    fn parse_import(&mut self) -> Result<StmtKind, SyntaxError> {
        self.expect_kw("import")?;
        let mut names = Vec::new();
        loop {
            let (name, span) = self.parse_dotted_name()?;
            let asname = if self.eat_kw("as") {
                Some(self.expect_name()?.0)
            } else {
                None
            };
            names.push(Alias { name, asname, span });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(StmtKind::Import(names))
    }

    fn parse_from_import(&mut self) -> Result<StmtKind, SyntaxError> {
        self.expect_kw("from")?;
        let mut level = 0;
        loop {
            if self.eat_op(".") {
                level += 1;
            } else if self.eat_op("...") {
                level += 3;
            } else {
                break;
            }
        }
        let module = if self.check_kw("import") {
            if level == 0 {
                return Err(self.error("expected a module name"));
            }
            None
        } else {
            Some(self.parse_dotted_name()?.0)
        };
        self.expect_kw("import")?;

        let mut names = Vec::new();
        if self.check_op("*") {
            let span = self.advance().span;
            names.push(Alias {
                name: "*".to_string(),
                asname: None,
                span,
            });
            return Ok(StmtKind::ImportFrom {
                module,
                names,
                level,
            });
        }

        let parenthesized = self.eat_op("(");
        loop {
            if parenthesized && self.check_op(")") {
                break;
            }
            let (name, span) = self.expect_name()?;
            let asname = if self.eat_kw("as") {
                Some(self.expect_name()?.0)
            } else {
                None
            };
            names.push(Alias { name, asname, span });
            if !self.eat_op(",") {
                break;
            }
            if !parenthesized && self.at_end_of_statement() {
                return Err(self.error("trailing comma not allowed without surrounding parentheses"));
            }
        }
        if parenthesized {
            self.expect_op(")")?;
        }
        if names.is_empty() {
            return Err(self.error("expected a name to import"));
        }
        Ok(StmtKind::ImportFrom {
            module,
            names,
            level,
        })
    }

    fn parse_if(&mut self) -> Result<Stmt, SyntaxError> {
        let mut branches = Vec::new();
        loop {
            let span = self.advance().span;
            let test = self.parse_named_test()?;
            let body = self.parse_block()?;
            branches.push((span, test, body));
            if !self.check_kw("elif") {
                break;
            }
            if branches.len() >= MAX_CHAIN {
                return Err(SyntaxError::new("too many 'elif' branches", self.span()));
            }
        }
        let mut orelse = if self.eat_kw("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };

        // Fold `elif` branches into nested `If` statements, innermost first
        while let Some((span, test, body)) = branches.pop() {
            let stmt = Stmt {
                kind: StmtKind::If { test, body, orelse },
                span,
            };
            if branches.is_empty() {
                return Ok(stmt);
            }
            orelse = vec![stmt];
        }
        Err(self.error("invalid syntax"))
    }

    fn parse_loop_body(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.scope.loops += 1;
        let body = self.parse_block();
        self.scope.loops -= 1;
        body
    }

    fn parse_while(&mut self) -> Result<Stmt, SyntaxError> {
        let span = self.advance().span;
        let test = self.parse_named_test()?;
        let body = self.parse_loop_body()?;
        let orelse = if self.eat_kw("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::While { test, body, orelse },
            span,
        })
    }

    fn parse_for(&mut self, is_async: bool, start: Option<Span>) -> Result<Stmt, SyntaxError> {
        let span = self.expect_kw("for")?;
        let target = self.parse_target_list()?;
        check_target(&target, "assign to")?;
        self.expect_kw("in")?;
        let iter = self.parse_testlist_star()?;
        let body = self.parse_loop_body()?;
        let orelse = if self.eat_kw("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::For {
                target,
                iter,
                body,
                orelse,
                is_async,
            },
            span: start.unwrap_or(span),
        })
    }

    fn parse_try(&mut self) -> Result<Stmt, SyntaxError> {
        let span = self.advance().span;
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        while self.check_kw("except") {
            let handler_span = self.advance().span;
            let (kind, name) = if self.check_op(":") {
                (None, None)
            } else {
                let kind = self.parse_test()?;
                let name = if self.eat_kw("as") {
                    Some(self.expect_name()?.0)
                } else {
                    None
                };
                (Some(kind), name)
            };
            let handler_body = self.parse_block()?;
            handlers.push(ExceptHandler {
                kind,
                name,
                body: handler_body,
                span: handler_span,
            });
        }
        let orelse = if !handlers.is_empty() && self.eat_kw("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_kw("finally") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }
        Ok(Stmt {
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
            span,
        })
    }

    fn parse_with(&mut self, is_async: bool, start: Option<Span>) -> Result<Stmt, SyntaxError> {
        let span = self.expect_kw("with")?;
        let mut items = Vec::new();
        loop {
            let context = self.parse_test()?;
            let target = if self.eat_kw("as") {
                let target = self.parse_target()?;
                check_target(&target, "assign to")?;
                Some(target)
            } else {
                None
            };
            items.push(WithItem { context, target });
            if !self.eat_op(",") {
                break;
            }
        }
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::With {
                items,
                body,
                is_async,
            },
            span: start.unwrap_or(span),
        })
    }

    /// `match` opens a statement only when a subject follows and the
    /// logical line ends in `:`; otherwise it is an ordinary name.
    fn starts_match_statement(&self) -> bool {
        let opens_subject = match self.peek_nth(1) {
            TokenKind::Name(_)
            | TokenKind::Int(_)
            | TokenKind::BigInt(_)
            | TokenKind::Float(_)
            | TokenKind::Imaginary(_)
            | TokenKind::Str(_) => true,
            TokenKind::Keyword(kw) => matches!(*kw, "None" | "True" | "False" | "not" | "lambda"),
            TokenKind::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~" | "*"),
            _ => false,
        };
        if !opens_subject {
            return false;
        }
        let mut n = 2;
        while !matches!(self.peek_nth(n), TokenKind::Newline | TokenKind::EndOfFile) {
            n += 1;
        }
        matches!(self.peek_nth(n - 1), TokenKind::Op(":"))
    }

    fn parse_match(&mut self) -> Result<Stmt, SyntaxError> {
        let span = self.advance().span;
        let subject = self.parse_testlist_star()?;
        self.expect_op(":")?;
        if !matches!(self.kind(), TokenKind::Newline) {
            return Err(self.error("expected a newline after 'match'"));
        }
        self.advance();
        if !matches!(self.kind(), TokenKind::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.advance();
        self.enter()?;
        let cases = self.parse_cases();
        self.leave();
        Ok(Stmt {
            kind: StmtKind::Match {
                subject,
                cases: cases?,
            },
            span,
        })
    }

    fn parse_cases(&mut self) -> Result<Vec<MatchCase>, SyntaxError> {
        let mut cases = Vec::new();
        loop {
            match self.kind() {
                TokenKind::Dedent => {
                    self.advance();
                    break;
                }
                TokenKind::EndOfFile => break,
                TokenKind::Newline => {
                    self.advance();
                }
                _ if self.check_soft("case") => {
                    self.advance();
                    let pattern = self.parse_open_pattern()?;
                    let guard = if self.eat_kw("if") {
                        Some(self.parse_named_test()?)
                    } else {
                        None
                    };
                    let body = self.parse_block()?;
                    cases.push(MatchCase {
                        pattern,
                        guard,
                        body,
                    });
                }
                _ => return Err(self.error("expected 'case'")),
            }
        }
        Ok(cases)
    }

    /// Pattern after `case`; a bare comma list is a sequence pattern
    fn parse_open_pattern(&mut self) -> Result<Pattern, SyntaxError> {
        let span = self.span();
        let first = self.parse_pattern_item()?;
        if !self.check_op(",") {
            if matches!(first.kind, PatternKind::Star(_)) {
                return Ok(Pattern::new(PatternKind::Sequence(vec![first]), span));
            }
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op(":") || self.check_kw("if") {
                break;
            }
            items.push(self.parse_pattern_item()?);
        }
        check_stars(&items, span)?;
        Ok(Pattern::new(PatternKind::Sequence(items), span))
    }

    fn parse_pattern_item(&mut self) -> Result<Pattern, SyntaxError> {
        if self.check_op("*") {
            let span = self.advance().span;
            let (name, _) = self.expect_name()?;
            let name = (name != "_").then_some(name);
            return Ok(Pattern::new(PatternKind::Star(name), span));
        }
        self.parse_as_pattern()
    }

    fn parse_as_pattern(&mut self) -> Result<Pattern, SyntaxError> {
        let pattern = self.parse_or_pattern()?;
        if !self.eat_kw("as") {
            return Ok(pattern);
        }
        let (name, name_span) = self.expect_name()?;
        if name == "_" {
            return Err(SyntaxError::new("cannot use '_' as a target", name_span));
        }
        let span = pattern.span;
        Ok(Pattern::new(
            PatternKind::As {
                pattern: Box::new(pattern),
                name,
            },
            span,
        ))
    }

    fn parse_or_pattern(&mut self) -> Result<Pattern, SyntaxError> {
        let first = self.parse_closed_pattern()?;
        if !self.check_op("|") {
            return Ok(first);
        }
        let span = first.span;
        let mut alternatives = vec![first];
        while self.eat_op("|") {
            if alternatives.len() >= MAX_CHAIN {
                return Err(SyntaxError::new("too many pattern alternatives", self.span()));
            }
            alternatives.push(self.parse_closed_pattern()?);
        }
        Ok(Pattern::new(PatternKind::Or(alternatives), span))
    }

    fn parse_closed_pattern(&mut self) -> Result<Pattern, SyntaxError> {
        self.enter()?;
        let pattern = self.parse_closed_pattern_inner();
        self.leave();
        pattern
    }

    fn parse_closed_pattern_inner(&mut self) -> Result<Pattern, SyntaxError> {
        let span = self.span();
        match self.kind().clone() {
            TokenKind::Name(name) => {
                self.advance();
                if !self.check_op(".") && !self.check_op("(") {
                    let kind = if name == "_" {
                        PatternKind::Wildcard
                    } else {
                        PatternKind::Capture(name)
                    };
                    return Ok(Pattern::new(kind, span));
                }
                let mut value = Expr::new(ExprKind::Name(name), span);
                while self.eat_op(".") {
                    let (attr, attr_span) = self.expect_name()?;
                    value = Expr::new(
                        ExprKind::Attribute {
                            value: boxed(value),
                            attr,
                            attr_span,
                        },
                        span,
                    );
                }
                if self.eat_op("(") {
                    return self.parse_class_pattern(value, span);
                }
                Ok(Pattern::new(PatternKind::Value(value), span))
            }
            TokenKind::Op("(") => {
                self.advance();
                if self.eat_op(")") {
                    return Ok(Pattern::new(PatternKind::Sequence(Vec::new()), span));
                }
                let first = self.parse_pattern_item()?;
                if self.eat_op(")") {
                    if matches!(first.kind, PatternKind::Star(_)) {
                        return Err(SyntaxError::new("cannot use starred pattern here", first.span));
                    }
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.check_op(")") {
                        break;
                    }
                    items.push(self.parse_pattern_item()?);
                }
                self.expect_op(")")?;
                check_stars(&items, span)?;
                Ok(Pattern::new(PatternKind::Sequence(items), span))
            }
            TokenKind::Op("[") => {
                self.advance();
                let mut items = Vec::new();
                while !self.check_op("]") {
                    items.push(self.parse_pattern_item()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("]")?;
                check_stars(&items, span)?;
                Ok(Pattern::new(PatternKind::Sequence(items), span))
            }
            TokenKind::Op("{") => {
                self.advance();
                self.parse_mapping_pattern(span)
            }
            TokenKind::Int(_)
            | TokenKind::BigInt(_)
            | TokenKind::Float(_)
            | TokenKind::Imaginary(_)
            | TokenKind::Str(_)
            | TokenKind::Keyword("None" | "True" | "False")
            | TokenKind::Op("-") => {
                let value = self.parse_arith()?;
                Ok(Pattern::new(PatternKind::Value(value), span))
            }
            _ => Err(self.error("invalid pattern")),
        }
    }

    fn parse_mapping_pattern(&mut self, span: Span) -> Result<Pattern, SyntaxError> {
        let mut keys = Vec::new();
        let mut patterns = Vec::new();
        let mut rest = None;
        while !self.check_op("}") {
            if self.eat_op("**") {
                rest = Some(self.expect_name()?.0);
                self.eat_op(",");
                break;
            }
            keys.push(self.parse_arith()?);
            self.expect_op(":")?;
            patterns.push(self.parse_as_pattern()?);
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op("}")?;
        Ok(Pattern::new(
            PatternKind::Mapping {
                keys,
                patterns,
                rest,
            },
            span,
        ))
    }

    /// Arguments of `Cls(...)`, after the opening parenthesis
    fn parse_class_pattern(&mut self, cls: Expr, span: Span) -> Result<Pattern, SyntaxError> {
        let mut patterns = Vec::new();
        let mut keywords = Vec::new();
        while !self.check_op(")") {
            let keyword = match (self.kind(), self.peek_nth(1)) {
                (TokenKind::Name(name), TokenKind::Op("=")) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = keyword {
                let name_span = self.advance().span;
                self.advance();
                keywords.push(PatternKeyword {
                    name,
                    span: name_span,
                    pattern: self.parse_as_pattern()?,
                });
            } else if !keywords.is_empty() {
                return Err(self.error("positional patterns follow keyword patterns"));
            } else {
                patterns.push(self.parse_as_pattern()?);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok(Pattern::new(
            PatternKind::Class {
                cls,
                patterns,
                keywords,
            },
            span,
        ))
    }

    fn parse_decorated(&mut self) -> Result<Stmt, SyntaxError> {
        let mut decorators = Vec::new();
        while self.eat_op("@") {
            decorators.push(self.parse_named_test()?);
            if !matches!(self.kind(), TokenKind::Newline) {
                return Err(self.error("expected newline after decorator"));
            }
            self.advance();
        }
        match self.kind() {
            TokenKind::Keyword("def") => self.parse_def(decorators, false, None),
            TokenKind::Keyword("class") => self.parse_class(decorators),
            TokenKind::Keyword("async") => self.parse_async(decorators),
            _ => Err(self.error("expected 'def' or 'class' after decorator")),
        }
    }

    fn parse_async(&mut self, decorators: Vec<Expr>) -> Result<Stmt, SyntaxError> {
        let span = self.expect_kw("async")?;
        match self.kind() {
            TokenKind::Keyword("def") => self.parse_def(decorators, true, Some(span)),
            TokenKind::Keyword("for") if decorators.is_empty() => self.parse_for(true, Some(span)),
            TokenKind::Keyword("with") if decorators.is_empty() => {
                self.parse_with(true, Some(span))
            }
            _ => Err(self.error("expected 'def', 'for' or 'with' after 'async'")),
        }
    }

    fn parse_def(
        &mut self,
        decorators: Vec<Expr>,
        is_async: bool,
        start: Option<Span>,
    ) -> Result<Stmt, SyntaxError> {
        let def_span = self.expect_kw("def")?;
        let span = start.unwrap_or(def_span);
        let (name, _) = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.parse_parameters(")", true)?;
        self.expect_op(")")?;
        let returns = if self.eat_op("->") {
            Some(self.parse_test()?)
        } else {
            None
        };

        let outer = std::mem::replace(
            &mut self.scope,
            Scope {
                in_function: true,
                loops: 0,
            },
        );
        let body = self.parse_block();
        self.scope = outer;

        Ok(Stmt {
            kind: StmtKind::FunctionDef(Arc::new(FunctionDef {
                name,
                params,
                body: body?,
                decorators,
                returns,
                is_async,
                span,
            })),
            span,
        })
    }

    fn parse_class(&mut self, decorators: Vec<Expr>) -> Result<Stmt, SyntaxError> {
        let span = self.expect_kw("class")?;
        let (name, _) = self.expect_name()?;
        let (bases, keywords) = if self.eat_op("(") {
            let (args, keywords) = self.parse_call_arguments()?;
            (args, keywords)
        } else {
            (Vec::new(), Vec::new())
        };

        let outer = std::mem::take(&mut self.scope);
        let body = self.parse_block();
        self.scope = outer;

        Ok(Stmt {
            kind: StmtKind::ClassDef(ClassDef {
                name,
                bases,
                keywords,
                body: body?,
                decorators,
            }),
            span,
        })
    }

    fn parse_parameters(
        &mut self,
        closer: &str,
        annotations: bool,
    ) -> Result<Parameters, SyntaxError> {
        let mut params = Parameters::default();
        let mut seen_star = false;
        let mut seen_default = false;
        let mut names: Vec<String> = Vec::new();

        while !self.check_op(closer) {
            let span = self.span();
            if self.eat_op("/") {
                if seen_star || params.positional.is_empty() {
                    return Err(SyntaxError::new("invalid position of '/'", span));
                }
            } else if self.eat_op("**") {
                let param = self.parse_param(annotations, false)?;
                names.push(param.name.clone());
                params.kwarg = Some(param);
                self.eat_op(",");
                if !self.check_op(closer) {
                    return Err(self.error("arguments cannot follow var-keyword argument"));
                }
                break;
            } else if self.eat_op("*") {
                if seen_star {
                    return Err(SyntaxError::new("* argument may appear only once", span));
                }
                seen_star = true;
                if !self.check_op(",") && !self.check_op(closer) {
                    let param = self.parse_param(annotations, false)?;
                    names.push(param.name.clone());
                    params.vararg = Some(param);
                }
            } else {
                let param = self.parse_param(annotations, true)?;
                names.push(param.name.clone());
                if seen_star {
                    params.kwonly.push(param);
                } else {
                    if param.default.is_some() {
                        seen_default = true;
                    } else if seen_default {
                        return Err(SyntaxError::new(
                            "non-default argument follows default argument",
                            param.span,
                        ));
                    }
                    params.positional.push(param);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }

        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(SyntaxError::new(
                    format!("duplicate argument '{}' in function definition", name),
                    self.span(),
                ));
            }
        }
        Ok(params)
    }

    fn parse_param(&mut self, annotations: bool, defaults: bool) -> Result<Param, SyntaxError> {
        let (name, span) = self.expect_name()?;
        let annotation = if annotations && self.eat_op(":") {
            Some(self.parse_test()?)
        } else {
            None
        };
        let default = if defaults && self.eat_op("=") {
            Some(self.parse_test()?)
        } else {
            None
        };
        Ok(Param {
            name,
            annotation,
            default,
            span,
        })
    }

    // ----- expressions ---------------------------------------------------

    /// Comma-separated `test` or `*expr` items; a tuple when a comma is present
    fn parse_testlist_star(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let first = self.parse_star_or_test()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_star_or_test()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), span))
    }

    fn parse_star_or_test(&mut self) -> Result<Expr, SyntaxError> {
        if self.check_op("*") {
            let span = self.advance().span;
            let value = self.parse_bitor()?;
            Ok(Expr::new(ExprKind::Starred(boxed(value)), span))
        } else {
            self.parse_test()
        }
    }

    fn parse_star_or_named(&mut self) -> Result<Expr, SyntaxError> {
        if self.check_op("*") {
            let span = self.advance().span;
            let value = self.parse_bitor()?;
            Ok(Expr::new(ExprKind::Starred(boxed(value)), span))
        } else {
            self.parse_named_test()
        }
    }

    /// Assignment targets for `for`/`del`: bitwise-or level items
    fn parse_target_list(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let first = self.parse_target()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_target()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), span))
    }

    fn parse_target(&mut self) -> Result<Expr, SyntaxError> {
        if self.check_op("*") {
            let span = self.advance().span;
            let value = self.parse_bitor()?;
            Ok(Expr::new(ExprKind::Starred(boxed(value)), span))
        } else {
            self.parse_bitor()
        }
    }

    fn parse_named_test(&mut self) -> Result<Expr, SyntaxError> {
        if let TokenKind::Name(name) = self.kind().clone() {
            if matches!(self.peek_nth(1), TokenKind::Op(":=")) {
                let span = self.advance().span;
                self.advance();
                let value = self.parse_test()?;
                return Ok(Expr::new(
                    ExprKind::NamedExpr {
                        target: name,
                        value: boxed(value),
                    },
                    span,
                ));
            }
        }
        self.parse_test()
    }

    fn parse_test(&mut self) -> Result<Expr, SyntaxError> {
        if self.check_kw("lambda") {
            return self.parse_lambda(true);
        }
        let span = self.span();
        let body = self.parse_or()?;
        if self.eat_kw("if") {
            let test = self.parse_or()?;
            self.expect_kw("else")?;
            self.enter()?;
            let orelse = self.parse_test();
            self.leave();
            let orelse = orelse?;
            return Ok(Expr::new(
                ExprKind::IfExp {
                    test: boxed(test),
                    body: boxed(body),
                    orelse: boxed(orelse),
                },
                span,
            ));
        }
        Ok(body)
    }

    fn parse_test_no_cond(&mut self) -> Result<Expr, SyntaxError> {
        if self.check_kw("lambda") {
            self.parse_lambda(false)
        } else {
            self.parse_or()
        }
    }

    fn parse_lambda(&mut self, allow_cond: bool) -> Result<Expr, SyntaxError> {
        let span = self.expect_kw("lambda")?;
        self.enter()?;
        let lambda = self.parse_lambda_rest(span, allow_cond);
        self.leave();
        lambda
    }

    fn parse_lambda_rest(&mut self, span: Span, allow_cond: bool) -> Result<Expr, SyntaxError> {
        let params = self.parse_parameters(":", false)?;
        self.expect_op(":")?;
        let outer = std::mem::replace(
            &mut self.scope,
            Scope {
                in_function: true,
                loops: 0,
            },
        );
        let body = if allow_cond {
            self.parse_test()
        } else {
            self.parse_test_no_cond()
        };
        self.scope = outer;
        Ok(Expr::new(
            ExprKind::Lambda(Arc::new(LambdaDef { params, body: body? })),
            span,
        ))
    }

    fn parse_or(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let first = self.parse_and()?;
        if !self.check_kw("or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw("or") {
            values.push(self.parse_and()?);
        }
        Ok(Expr::new(
            ExprKind::BoolOp {
                op: BoolOpKind::Or,
                values,
            },
            span,
        ))
    }

    fn parse_and(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let first = self.parse_not()?;
        if !self.check_kw("and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw("and") {
            values.push(self.parse_not()?);
        }
        Ok(Expr::new(
            ExprKind::BoolOp {
                op: BoolOpKind::And,
                values,
            },
            span,
        ))
    }

    fn parse_not(&mut self) -> Result<Expr, SyntaxError> {
        if self.check_kw("not") {
            let span = self.advance().span;
            self.enter()?;
            let operand = self.parse_not();
            self.leave();
            return Ok(Expr::new(
                ExprKind::UnaryOp {
                    op: UnaryOpKind::Not,
                    operand: boxed(operand?),
                },
                span,
            ));
        }
        self.parse_comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOpKind> {
        let op = match self.kind() {
            TokenKind::Op("==") => CmpOpKind::Eq,
            TokenKind::Op("!=") => CmpOpKind::NotEq,
            TokenKind::Op("<") => CmpOpKind::Lt,
            TokenKind::Op("<=") => CmpOpKind::LtE,
            TokenKind::Op(">") => CmpOpKind::Gt,
            TokenKind::Op(">=") => CmpOpKind::GtE,
            TokenKind::Keyword("in") => CmpOpKind::In,
            TokenKind::Keyword("not") if matches!(self.peek_nth(1), TokenKind::Keyword("in")) => {
                self.advance();
                CmpOpKind::NotIn
            }
            TokenKind::Keyword("is") => {
                if matches!(self.peek_nth(1), TokenKind::Keyword("not")) {
                    self.advance();
                    CmpOpKind::IsNot
                } else {
                    CmpOpKind::Is
                }
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_comparison(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let left = self.parse_bitor()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        while let Some(op) = self.comparison_op() {
            ops.push(op);
            comparators.push(self.parse_bitor()?);
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::new(
            ExprKind::Compare {
                left: boxed(left),
                ops,
                comparators,
            },
            span,
        ))
    }

    fn parse_binary_level(
        &mut self,
        ops: &[&str],
        next: fn(&mut Self) -> Result<Expr, SyntaxError>,
    ) -> Result<Expr, SyntaxError> {
        let mut left = next(self)?;
        let mut links = 0usize;
        loop {
            let op = match self.kind() {
                TokenKind::Op(op) if ops.contains(op) => BinOpKind::from_op(op),
                _ => None,
            };
            let Some(op) = op else { break };
            links += 1;
            if links > MAX_CHAIN {
                return Err(SyntaxError::new("expression is too long", self.span()));
            }
            self.advance();
            let right = next(self)?;
            let span = left.span;
            left = Expr::new(
                ExprKind::BinOp {
                    left: boxed(left),
                    op,
                    right: boxed(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_bitor(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary_level(&["|"], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary_level(&["^"], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary_level(&["&"], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary_level(&["<<", ">>"], Self::parse_arith)
    }

    fn parse_arith(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary_level(&["+", "-"], Self::parse_term)
    }

    fn parse_term(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary_level(&["*", "/", "//", "%", "@"], Self::parse_factor)
    }

    fn parse_factor(&mut self) -> Result<Expr, SyntaxError> {
        let op = match self.kind() {
            TokenKind::Op("-") => Some(UnaryOpKind::Neg),
            TokenKind::Op("+") => Some(UnaryOpKind::Pos),
            TokenKind::Op("~") => Some(UnaryOpKind::Invert),
            _ => None,
        };
        let Some(op) = op else {
            return self.parse_power();
        };
        let span = self.advance().span;
        self.enter()?;
        let operand = self.parse_factor();
        self.leave();
        let operand = operand?;

        // Fold negative numeric literals so `-9223372036854775808` stays an int
        if op == UnaryOpKind::Neg {
            if let ExprKind::Constant(Constant::BigInt(digits)) = &operand.kind {
                if let Ok(value) = format!("-{}", digits).parse::<i64>() {
                    return Ok(Expr::new(ExprKind::Constant(Constant::Int(value)), span));
                }
            }
        }
        Ok(Expr::new(
            ExprKind::UnaryOp {
                op,
                operand: boxed(operand),
            },
            span,
        ))
    }

    fn parse_power(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let base = if self.check_kw("await") {
            let await_span = self.advance().span;
            let value = self.parse_primary()?;
            Expr::new(ExprKind::Await(boxed(value)), await_span)
        } else {
            self.parse_primary()?
        };
        if self.eat_op("**") {
            self.enter()?;
            let exponent = self.parse_factor();
            self.leave();
            let exponent = exponent?;
            return Ok(Expr::new(
                ExprKind::BinOp {
                    left: boxed(base),
                    op: BinOpKind::Pow,
                    right: boxed(exponent),
                },
                span,
            ));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.parse_atom()?;
        let mut trailers = 0usize;
        loop {
            if matches!(self.kind(), TokenKind::Op("(" | "[" | ".")) {
                trailers += 1;
                if trailers > MAX_CHAIN {
                    return Err(SyntaxError::new("expression is too long", self.span()));
                }
            }
            if self.eat_op("(") {
                let span = expr.span;
                let (args, keywords) = self.parse_call_arguments()?;
                expr = Expr::new(
                    ExprKind::Call {
                        func: boxed(expr),
                        args,
                        keywords,
                    },
                    span,
                );
            } else if self.eat_op("[") {
                let span = expr.span;
                self.enter()?;
                let index = self.parse_subscript_list();
                self.leave();
                let index = index?;
                self.expect_op("]")?;
                expr = Expr::new(
                    ExprKind::Subscript {
                        value: boxed(expr),
                        index: boxed(index),
                    },
                    span,
                );
            } else if self.eat_op(".") {
                let span = expr.span;
                let (attr, attr_span) = self.expect_name()?;
                expr = Expr::new(
                    ExprKind::Attribute {
                        value: boxed(expr),
                        attr,
                        attr_span,
                    },
                    span,
                );
            } else {
                break;
            }
        }
        Ok(expr)
    }

    /// Arguments after an opening `(`, consuming the closing `)`
    fn parse_call_arguments(&mut self) -> Result<(Vec<Expr>, Vec<Keyword>), SyntaxError> {
        self.enter()?;
        let parsed = self.parse_call_arguments_inner();
        self.leave();
        parsed
    }

    fn parse_call_arguments_inner(&mut self) -> Result<(Vec<Expr>, Vec<Keyword>), SyntaxError> {
        let mut args = Vec::new();
        let mut keywords: Vec<Keyword> = Vec::new();

        while !self.check_op(")") {
            let span = self.span();
            if self.eat_op("**") {
                let value = self.parse_test()?;
                keywords.push(Keyword {
                    arg: None,
                    value,
                    span,
                });
            } else if self.eat_op("*") {
                let value = self.parse_test()?;
                args.push(Expr::new(ExprKind::Starred(boxed(value)), span));
            } else if matches!(self.kind(), TokenKind::Name(_))
                && matches!(self.peek_nth(1), TokenKind::Op("="))
            {
                let (name, _) = self.expect_name()?;
                self.advance();
                let value = self.parse_test()?;
                if keywords.iter().any(|k| k.arg.as_deref() == Some(name.as_str())) {
                    return Err(SyntaxError::new(
                        format!("keyword argument repeated: {}", name),
                        span,
                    ));
                }
                keywords.push(Keyword {
                    arg: Some(name),
                    value,
                    span,
                });
            } else {
                let value = self.parse_named_test()?;
                if self.check_kw("for") || self.check_kw("async") {
                    let generators = self.parse_comp_for()?;
                    args.push(Expr::new(
                        ExprKind::Comprehension {
                            kind: ComprehensionKind::Generator,
                            element: boxed(value),
                            value: None,
                            generators,
                        },
                        span,
                    ));
                } else {
                    if !keywords.is_empty() {
                        return Err(SyntaxError::new(
                            if keywords.iter().any(|k| k.arg.is_none()) {
                                "positional argument follows keyword argument unpacking"
                            } else {
                                "positional argument follows keyword argument"
                            },
                            span,
                        ));
                    }
                    args.push(value);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, keywords))
    }

    fn parse_subscript_list(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let first = self.parse_subscript_item()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("]") {
                break;
            }
            items.push(self.parse_subscript_item()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), span))
    }

    fn parse_subscript_item(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let lower = if self.check_op(":") {
            None
        } else {
            let expr = self.parse_star_or_named()?;
            if !self.check_op(":") {
                return Ok(expr);
            }
            Some(boxed(expr))
        };
        self.expect_op(":")?;
        let upper = if self.check_op(":") || self.check_op("]") || self.check_op(",") {
            None
        } else {
            Some(boxed(self.parse_test()?))
        };
        let step = if self.eat_op(":") {
            if self.check_op("]") || self.check_op(",") {
                None
            } else {
                Some(boxed(self.parse_test()?))
            }
        } else {
            None
        };
        Ok(Expr::new(ExprKind::Slice { lower, upper, step }, span))
    }

    fn parse_comp_for(&mut self) -> Result<Vec<CompFor>, SyntaxError> {
        let mut generators = Vec::new();
        loop {
            let is_async = self.eat_kw("async");
            if !self.eat_kw("for") {
                if is_async {
                    return Err(self.error("expected 'for'"));
                }
                break;
            }
            let target = self.parse_target_list()?;
            check_target(&target, "assign to")?;
            self.expect_kw("in")?;
            let iter = self.parse_or()?;
            let mut ifs = Vec::new();
            while self.eat_kw("if") {
                ifs.push(self.parse_test_no_cond()?);
            }
            generators.push(CompFor {
                target,
                iter,
                ifs,
                is_async,
            });
        }
        Ok(generators)
    }

    fn parse_yield(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.expect_kw("yield")?;
        if !self.scope.in_function {
            return Err(SyntaxError::new("'yield' outside function", span));
        }
        if self.eat_kw("from") {
            let value = self.parse_test()?;
            return Ok(Expr::new(ExprKind::YieldFrom(boxed(value)), span));
        }
        if self.at_end_of_statement() || self.check_op(")") || self.check_op("=") {
            return Ok(Expr::new(ExprKind::Yield(None), span));
        }
        let value = self.parse_testlist_star()?;
        Ok(Expr::new(ExprKind::Yield(Some(boxed(value))), span))
    }

    fn parse_atom(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.peek().clone();
        let span = token.span;
        match token.kind {
            TokenKind::Name(name) => {
                self.advance();
                Ok(Expr::new(ExprKind::Name(name), span))
            }
            TokenKind::Int(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::Constant(Constant::Int(value)), span))
            }
            TokenKind::BigInt(digits) => {
                self.advance();
                Ok(Expr::new(ExprKind::Constant(Constant::BigInt(digits)), span))
            }
            TokenKind::Float(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::Constant(Constant::Float(value)), span))
            }
            TokenKind::Imaginary(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::Constant(Constant::Imaginary(value)), span))
            }
            TokenKind::Str(_) => self.parse_strings(),
            TokenKind::Keyword("None") => {
                self.advance();
                Ok(Expr::new(ExprKind::Constant(Constant::None), span))
            }
            TokenKind::Keyword("True") => {
                self.advance();
                Ok(Expr::new(ExprKind::Constant(Constant::Bool(true)), span))
            }
            TokenKind::Keyword("False") => {
                self.advance();
                Ok(Expr::new(ExprKind::Constant(Constant::Bool(false)), span))
            }
            TokenKind::Op("...") => {
                self.advance();
                Ok(Expr::new(ExprKind::Constant(Constant::Ellipsis), span))
            }
            TokenKind::Op("(") => {
                self.advance();
                self.enter()?;
                let expr = self.parse_paren(span);
                self.leave();
                expr
            }
            TokenKind::Op("[") => {
                self.advance();
                self.enter()?;
                let expr = self.parse_list(span);
                self.leave();
                expr
            }
            TokenKind::Op("{") => {
                self.advance();
                self.enter()?;
                let expr = self.parse_brace(span);
                self.leave();
                expr
            }
            _ => Err(self.error("invalid syntax")),
        }
    }

    fn parse_paren(&mut self, span: Span) -> Result<Expr, SyntaxError> {
        if self.eat_op(")") {
            return Ok(Expr::new(ExprKind::Tuple(Vec::new()), span));
        }
        if self.check_kw("yield") {
            let expr = self.parse_yield()?;
            self.expect_op(")")?;
            return Ok(expr);
        }
        let first = self.parse_star_or_named()?;
        if self.check_kw("for") || self.check_kw("async") {
            let generators = self.parse_comp_for()?;
            self.expect_op(")")?;
            return Ok(Expr::new(
                ExprKind::Comprehension {
                    kind: ComprehensionKind::Generator,
                    element: boxed(first),
                    value: None,
                    generators,
                },
                span,
            ));
        }
        if self.eat_op(")") {
            if matches!(first.kind, ExprKind::Starred(_)) {
                return Err(SyntaxError::new(
                    "cannot use starred expression here",
                    first.span,
                ));
            }
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op(")") {
                break;
            }
            items.push(self.parse_star_or_named()?);
        }
        self.expect_op(")")?;
        Ok(Expr::new(ExprKind::Tuple(items), span))
    }

    fn parse_list(&mut self, span: Span) -> Result<Expr, SyntaxError> {
        if self.eat_op("]") {
            return Ok(Expr::new(ExprKind::List(Vec::new()), span));
        }
        let first = self.parse_star_or_named()?;
        if self.check_kw("for") || self.check_kw("async") {
            let generators = self.parse_comp_for()?;
            self.expect_op("]")?;
            return Ok(Expr::new(
                ExprKind::Comprehension {
                    kind: ComprehensionKind::List,
                    element: boxed(first),
                    value: None,
                    generators,
                },
                span,
            ));
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("]") {
                break;
            }
            items.push(self.parse_star_or_named()?);
        }
        self.expect_op("]")?;
        Ok(Expr::new(ExprKind::List(items), span))
    }

    fn parse_brace(&mut self, span: Span) -> Result<Expr, SyntaxError> {
        if self.eat_op("}") {
            return Ok(Expr::new(
                ExprKind::Dict {
                    keys: Vec::new(),
                    values: Vec::new(),
                },
                span,
            ));
        }

        // Dict display starting with `**mapping`
        if self.eat_op("**") {
            let value = self.parse_bitor()?;
            return self.parse_dict_rest(span, None, value);
        }

        let first = self.parse_star_or_named()?;
        if self.eat_op(":") {
            let value = self.parse_test()?;
            if self.check_kw("for") || self.check_kw("async") {
                let generators = self.parse_comp_for()?;
                self.expect_op("}")?;
                return Ok(Expr::new(
                    ExprKind::Comprehension {
                        kind: ComprehensionKind::Dict,
                        element: boxed(first),
                        value: Some(boxed(value)),
                        generators,
                    },
                    span,
                ));
            }
            return self.parse_dict_rest(span, Some(first), value);
        }

        if self.check_kw("for") || self.check_kw("async") {
            let generators = self.parse_comp_for()?;
            self.expect_op("}")?;
            return Ok(Expr::new(
                ExprKind::Comprehension {
                    kind: ComprehensionKind::Set,
                    element: boxed(first),
                    value: None,
                    generators,
                },
                span,
            ));
        }

        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("}") {
                break;
            }
            items.push(self.parse_star_or_named()?);
        }
        self.expect_op("}")?;
        Ok(Expr::new(ExprKind::Set(items), span))
    }

    fn parse_dict_rest(
        &mut self,
        span: Span,
        first_key: Option<Expr>,
        first_value: Expr,
    ) -> Result<Expr, SyntaxError> {
        let mut keys = vec![first_key];
        let mut values = vec![first_value];
        while self.eat_op(",") {
            if self.check_op("}") {
                break;
            }
            if self.eat_op("**") {
                keys.push(None);
                values.push(self.parse_bitor()?);
            } else {
                keys.push(Some(self.parse_test()?));
                self.expect_op(":")?;
                values.push(self.parse_test()?);
            }
        }
        self.expect_op("}")?;
        Ok(Expr::new(ExprKind::Dict { keys, values }, span))
    }

    /// Adjacent string literals concatenate; any f-string makes the result a `JoinedStr`
    fn parse_strings(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let mut literals: Vec<(StrLiteral, Span)> = Vec::new();
        while let TokenKind::Str(literal) = self.kind().clone() {
            let token_span = self.advance().span;
            literals.push((literal, token_span));
        }

        let bytes = literals.iter().filter(|(lit, _)| lit.bytes).count();
        if bytes != 0 && bytes != literals.len() {
            return Err(SyntaxError::new("cannot mix bytes and nonbytes literals", span));
        }

        if bytes != 0 {
            let mut out = Vec::new();
            for (literal, literal_span) in &literals {
                for c in literal.value.chars() {
                    let code = c as u32;
                    if code > 0xff {
                        return Err(SyntaxError::new(
                            "bytes can only contain ASCII literal characters",
                            *literal_span,
                        ));
                    }
                    out.push(code as u8);
                }
            }
            return Ok(Expr::new(ExprKind::Constant(Constant::Bytes(out)), span));
        }

        if literals.iter().any(|(lit, _)| lit.formatted) {
            let mut parts: Vec<FStringPart> = Vec::new();
            for (literal, literal_span) in literals {
                let pieces = if literal.formatted {
                    self.parse_fstring(&literal.value, literal.raw, literal_span)?
                } else {
                    vec![FStringPart::Literal(literal.value)]
                };
                for piece in pieces {
                    match (parts.last_mut(), piece) {
                        (Some(FStringPart::Literal(prev)), FStringPart::Literal(next)) => {
                            prev.push_str(&next)
                        }
                        (_, piece) => parts.push(piece),
                    }
                }
            }
            return Ok(Expr::new(ExprKind::JoinedStr(parts), span));
        }

        let value: String = literals.into_iter().map(|(lit, _)| lit.value).collect();
        Ok(Expr::new(ExprKind::Constant(Constant::Str(value)), span))
    }

    fn parse_fstring(
        &mut self,
        body: &str,
        raw: bool,
        span: Span,
    ) -> Result<Vec<FStringPart>, SyntaxError> {
        self.enter()?;
        let parts = self.parse_fstring_inner(body, raw, span);
        self.leave();
        parts
    }

    fn parse_fstring_inner(
        &mut self,
        body: &str,
        raw: bool,
        span: Span,
    ) -> Result<Vec<FStringPart>, SyntaxError> {
        let chars: Vec<char> = body.chars().collect();
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut i = 0;

        let flush = |literal: &mut String, parts: &mut Vec<FStringPart>| -> Result<(), SyntaxError> {
            if literal.is_empty() {
                return Ok(());
            }
            let text = if raw {
                std::mem::take(literal)
            } else {
                unescape(&std::mem::take(literal)).map_err(|message| SyntaxError::new(message, span))?
            };
            parts.push(FStringPart::Literal(text));
            Ok(())
        };

        while i < chars.len() {
            let c = chars[i];
            if c == '{' {
                if chars.get(i + 1) == Some(&'{') {
                    literal.push('{');
                    i += 2;
                    continue;
                }
                flush(&mut literal, &mut parts)?;
                let (field, next) = self.parse_fstring_field(&chars, i + 1, raw, span)?;
                parts.push(field);
                i = next;
            } else if c == '}' {
                if chars.get(i + 1) == Some(&'}') {
                    literal.push('}');
                    i += 2;
                    continue;
                }
                return Err(SyntaxError::new("f-string: single '}' is not allowed", span));
            } else {
                literal.push(c);
                i += 1;
            }
        }
        flush(&mut literal, &mut parts)?;
        Ok(parts)
    }

    /// Parse one replacement field starting just after `{`. Returns the field
    /// and the index just past its closing `}`.
    fn parse_fstring_field(
        &mut self,
        chars: &[char],
        start: usize,
        raw: bool,
        span: Span,
    ) -> Result<(FStringPart, usize), SyntaxError> {
        let mut i = start;
        let mut nesting = 0usize;
        let mut quote: Option<char> = None;

        while i < chars.len() {
            let c = chars[i];
            if let Some(q) = quote {
                if c == q {
                    quote = None;
                }
                i += 1;
                continue;
            }
            match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => nesting += 1,
                ')' | ']' => nesting = nesting.saturating_sub(1),
                '}' if nesting > 0 => nesting -= 1,
                '}' => break,
                '!' if nesting == 0 && chars.get(i + 1) != Some(&'=') => break,
                ':' if nesting == 0 => break,
                _ => {}
            }
            i += 1;
        }
        if i >= chars.len() {
            return Err(SyntaxError::new("f-string: expecting '}'", span));
        }

        let mut expr_text: String = chars[start..i].iter().collect();
        let mut debug_text = None;
        let trimmed = expr_text.trim_end();
        if trimmed.ends_with('=')
            && !["==", "!=", "<=", ">="]
                .iter()
                .any(|op| trimmed.ends_with(op))
        {
            debug_text = Some(expr_text.clone());
            expr_text = trimmed[..trimmed.len() - 1].to_string();
        }
        if expr_text.trim().is_empty() {
            return Err(SyntaxError::new("f-string: empty expression not allowed", span));
        }

        let tokens = tokenize_fragment(&expr_text, span)?;
        let mut inner = Parser::new(tokens, self.depth);
        inner.scope.in_function = self.scope.in_function;
        let value = inner.parse_fragment()?;

        let mut conversion = None;
        if chars[i] == '!' {
            match chars.get(i + 1) {
                Some(c @ ('s' | 'r' | 'a')) => conversion = Some(*c),
                _ => {
                    return Err(SyntaxError::new(
                        "f-string: invalid conversion character: expected 's', 'r', or 'a'",
                        span,
                    ))
                }
            }
            i += 2;
            if !matches!(chars.get(i), Some(':') | Some('}')) {
                return Err(SyntaxError::new("f-string: expecting '}'", span));
            }
        }

        let mut format_spec = None;
        if chars[i] == ':' {
            let spec_start = i + 1;
            let mut depth = 0usize;
            i = spec_start;
            while i < chars.len() {
                match chars[i] {
                    '{' => depth += 1,
                    '}' if depth == 0 => break,
                    '}' => depth -= 1,
                    _ => {}
                }
                i += 1;
            }
            if i >= chars.len() {
                return Err(SyntaxError::new("f-string: expecting '}'", span));
            }
            let spec: String = chars[spec_start..i].iter().collect();
            format_spec = Some(self.parse_fstring(&spec, raw, span)?);
        }

        // chars[i] is the closing brace
        Ok((
            FStringPart::Field {
                value: boxed(value),
                conversion,
                format_spec,
                debug_text,
            },
            i + 1,
        ))
    }
}

/// A sequence pattern may hold at most one starred item
fn check_stars(items: &[Pattern], span: Span) -> Result<(), SyntaxError> {
    let stars = items
        .iter()
        .filter(|item| matches!(item.kind, PatternKind::Star(_)))
        .count();
    if stars > 1 {
        return Err(SyntaxError::new(
            "multiple starred names in sequence pattern",
            span,
        ));
    }
    Ok(())
}

/// Reject expressions that cannot be assigned to or deleted
fn check_target(expr: &Expr, action: &str) -> Result<(), SyntaxError> {
    match &expr.kind {
        ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. } => Ok(()),
        ExprKind::Tuple(items) | ExprKind::List(items) => {
            let mut starred = 0;
            for item in items {
                if matches!(item.kind, ExprKind::Starred(_)) {
                    starred += 1;
                }
                check_target(item, action)?;
            }
            if starred > 1 {
                return Err(SyntaxError::new(
                    "multiple starred expressions in assignment",
                    expr.span,
                ));
            }
            Ok(())
        }
        ExprKind::Starred(inner) if action != "delete" => check_target(inner, action),
        other => Err(SyntaxError::new(
            format!("cannot {} {}", action, other.describe()),
            expr.span,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(source: &str) -> Expr {
        parse_expression(source).unwrap()
    }

    fn stmts(source: &str) -> Vec<Stmt> {
        parse_module(source).unwrap().body
    }

    #[test]
    fn test_precedence() {
        let e = expr("1 + 2 * 3 ** 2");
        match e.kind {
            ExprKind::BinOp { op, right, .. } => {
                assert_eq!(op, BinOpKind::Add);
                match right.kind {
                    ExprKind::BinOp { op, right, .. } => {
                        assert_eq!(op, BinOpKind::Mult);
                        assert!(matches!(
                            right.kind,
                            ExprKind::BinOp {
                                op: BinOpKind::Pow,
                                ..
                            }
                        ));
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_chained_comparison_and_not_in() {
        match expr("a < b <= c not in d").kind {
            ExprKind::Compare { ops, .. } => {
                assert_eq!(ops, vec![CmpOpKind::Lt, CmpOpKind::LtE, CmpOpKind::NotIn]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_imports_keep_original_names() {
        let body = stmts("import os.path as p, sys\nfrom ..pkg import (a as b, c)\n");
        match &body[0].kind {
            StmtKind::Import(names) => {
                assert_eq!(names[0].name, "os.path");
                assert_eq!(names[0].asname.as_deref(), Some("p"));
                assert_eq!(names[1].name, "sys");
            }
            other => panic!("unexpected {:?}", other),
        }
        match &body[1].kind {
            StmtKind::ImportFrom {
                module,
                names,
                level,
            } => {
                assert_eq!(module.as_deref(), Some("pkg"));
                assert_eq!(*level, 2);
                assert_eq!(names.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(body[1].span.line, 2);
    }

    #[test]
    fn test_function_and_control_flow() {
        let source = "\
@decorator
def f(a, b=2, *args, key=None, **kw) -> int:
    for i in range(3):
        if i:
            continue
        else:
            break
    while a:
        a -= 1
    try:
        pass
    except ValueError as e:
        raise RuntimeError('x') from e
    finally:
        pass
    return a
";
        let body = stmts(source);
        assert_eq!(body.len(), 1);
        match &body[0].kind {
            StmtKind::FunctionDef(def) => {
                assert_eq!(def.name, "f");
                assert_eq!(def.decorators.len(), 1);
                assert_eq!(def.params.positional.len(), 2);
                assert!(def.params.vararg.is_some());
                assert_eq!(def.params.kwonly.len(), 1);
                assert!(def.params.kwarg.is_some());
                assert_eq!(def.body.len(), 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_comprehensions_and_displays() {
        assert!(matches!(
            expr("[x * 2 for x in xs if x]").kind,
            ExprKind::Comprehension {
                kind: ComprehensionKind::List,
                ..
            }
        ));
        assert!(matches!(
            expr("{k: v for k, v in items}").kind,
            ExprKind::Comprehension {
                kind: ComprehensionKind::Dict,
                ..
            }
        ));
        assert!(matches!(expr("{1, 2}").kind, ExprKind::Set(_)));
        assert!(matches!(expr("{}").kind, ExprKind::Dict { .. }));
        assert!(matches!(expr("(1,)").kind, ExprKind::Tuple(ref items) if items.len() == 1));
        assert!(matches!(
            expr("sum(x for x in y)").kind,
            ExprKind::Call { ref args, .. } if matches!(args[0].kind, ExprKind::Comprehension { kind: ComprehensionKind::Generator, .. })
        ));
    }

    #[test]
    fn test_fstring_fields() {
        match expr("f'a{x!r:>{width}}b{y=}{{c}}'").kind {
            ExprKind::JoinedStr(parts) => {
                assert_eq!(parts[0], FStringPart::Literal("a".into()));
                match &parts[1] {
                    FStringPart::Field {
                        conversion,
                        format_spec,
                        ..
                    } => {
                        assert_eq!(*conversion, Some('r'));
                        assert_eq!(format_spec.as_ref().map(|s| s.len()), Some(2));
                    }
                    other => panic!("unexpected {:?}", other),
                }
                match &parts[3] {
                    FStringPart::Field { debug_text, .. } => {
                        assert_eq!(debug_text.as_deref(), Some("y="));
                    }
                    other => panic!("unexpected {:?}", other),
                }
                assert_eq!(parts[4], FStringPart::Literal("{c}".into()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_assignment_forms() {
        let body = stmts("a = b = 1\nx, *y = z\nn: int = 3\nc[0] += 1\n");
        assert!(matches!(&body[0].kind, StmtKind::Assign { targets, .. } if targets.len() == 2));
        assert!(matches!(&body[1].kind, StmtKind::Assign { .. }));
        assert!(matches!(&body[2].kind, StmtKind::AnnAssign { .. }));
        assert!(matches!(
            &body[3].kind,
            StmtKind::AugAssign {
                op: BinOpKind::Add,
                ..
            }
        ));
    }

    #[test]
    fn test_syntax_errors_carry_location() {
        let err = parse_module("x = 1\ny = (2 +\n").unwrap_err();
        assert!(err.line >= 2);

        let err = parse_module("def f(x y):\n    pass\n").unwrap_err();
        assert_eq!(err.line, 1);

        assert!(parse_module("1 = x\n").is_err());
        assert!(parse_module("return 5\n").is_err());
        assert!(parse_module("break\n").is_err());
        assert!(parse_module("f(a=1, 2)\n").is_err());
        assert!(parse_module("  x = 1\n").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}1{}", "(".repeat(MAX_NESTING + 5), ")".repeat(MAX_NESTING + 5));
        let err = parse_module(&deep).unwrap_err();
        assert!(err.message.contains("nested"));

        let shallow = format!("{}1{}", "(".repeat(10), ")".repeat(10));
        assert!(parse_module(&shallow).is_ok());
    }

    #[test]
    fn test_long_chains_are_bounded() {
        let ok = vec!["1"; 100].join(" + ");
        assert!(parse_expression(&ok).is_ok());
        let too_long = vec!["1"; MAX_CHAIN + 10].join(" + ");
        assert!(parse_expression(&too_long).is_err());

        let mut source = String::from("if x == 0:\n    pass\n");
        for i in 1..20 {
            source.push_str(&format!("elif x == {}:\n    pass\n", i));
        }
        source.push_str("else:\n    pass\n");
        let body = parse_module(&source).unwrap().body;
        assert_eq!(body.len(), 1);
        let mut depth = 0;
        let mut current = &body[0];
        while let StmtKind::If { orelse, .. } = &current.kind {
            depth += 1;
            match orelse.first() {
                Some(next) if matches!(next.kind, StmtKind::If { .. }) => current = next,
                _ => break,
            }
        }
        assert_eq!(depth, 20);
    }

    #[test]
    fn test_match_statement() {
        let body = stmts(
            "match point:\n    case (0, 0):\n        pass\n    case [x, *rest] if x:\n        pass\n    case {'k': Color.RED | None, **others}:\n        pass\n    case Point(x=0) as p:\n        pass\n",
        );
        let StmtKind::Match { subject, cases } = &body[0].kind else {
            panic!("expected a match statement, got {:?}", body[0].kind);
        };
        assert_eq!(subject.kind, ExprKind::Name("point".into()));
        assert_eq!(cases.len(), 4);
        assert!(matches!(&cases[0].pattern.kind, PatternKind::Sequence(items) if items.len() == 2));
        assert!(cases[1].guard.is_some());
        assert!(matches!(
            &cases[1].pattern.kind,
            PatternKind::Sequence(items) if items[1].kind == PatternKind::Star(Some("rest".into()))
        ));
        assert!(matches!(
            &cases[2].pattern.kind,
            PatternKind::Mapping { rest: Some(rest), .. } if rest == "others"
        ));
        match &cases[3].pattern.kind {
            PatternKind::As { pattern, name } => {
                assert_eq!(name, "p");
                assert!(matches!(
                    &pattern.kind,
                    PatternKind::Class { keywords, .. } if keywords[0].name == "x"
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_match_is_a_soft_keyword() {
        let body = stmts("match = re.match(p, s)\nmatch.group(1)\nmatch(x)\nmatch[0] = 1\n");
        assert_eq!(body.len(), 4);
        assert!(body
            .iter()
            .all(|stmt| !matches!(stmt.kind, StmtKind::Match { .. })));
        assert!(parse_module("match x:\n    pass\n").is_err());
        assert!(parse_module("match x:\n    case *a, *b:\n        pass\n").is_err());
    }

    #[test]
    fn test_negative_int_min_folds() {
        assert_eq!(
            expr("-9223372036854775808").kind,
            ExprKind::Constant(Constant::Int(i64::MIN))
        );
    }
}
