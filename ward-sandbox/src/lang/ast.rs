//! Syntax tree for the guest language

use super::token::Span;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    /// `a = b = value`; every target receives the value
    Assign {
        targets: Vec<Expr>,
        value: Expr,
    },
    AugAssign {
        target: Expr,
        op: BinOpKind,
        value: Expr,
    },
    AnnAssign {
        target: Expr,
        annotation: Expr,
        value: Option<Expr>,
    },
    Import(Vec<Alias>),
    ImportFrom {
        module: Option<String>,
        names: Vec<Alias>,
        /// Number of leading dots of a relative import
        level: usize,
    },
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
        is_async: bool,
    },
    FunctionDef(Arc<FunctionDef>),
    ClassDef(ClassDef),
    Return(Option<Expr>),
    Pass,
    Break,
    Continue,
    Raise {
        exc: Option<Expr>,
        cause: Option<Expr>,
    },
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<Stmt>,
        finalbody: Vec<Stmt>,
    },
    With {
        items: Vec<WithItem>,
        body: Vec<Stmt>,
        is_async: bool,
    },
    Global(Vec<String>),
    Nonlocal(Vec<String>),
    Delete(Vec<Expr>),
    Assert {
        test: Expr,
        msg: Option<Expr>,
    },
    Match {
        subject: Expr,
        cases: Vec<MatchCase>,
    },
}

impl StmtKind {
    pub fn describe(&self) -> &'static str {
        match self {
            StmtKind::Expr(_) => "expression",
            StmtKind::Assign { .. } => "assignment",
            StmtKind::AugAssign { .. } => "augmented assignment",
            StmtKind::AnnAssign { .. } => "annotated assignment",
            StmtKind::Import(_) | StmtKind::ImportFrom { .. } => "import",
            StmtKind::If { .. } => "if",
            StmtKind::While { .. } => "while",
            StmtKind::For { .. } => "for",
            StmtKind::FunctionDef(_) => "def",
            StmtKind::ClassDef(_) => "class",
            StmtKind::Return(_) => "return",
            StmtKind::Pass => "pass",
            StmtKind::Break => "break",
            StmtKind::Continue => "continue",
            StmtKind::Raise { .. } => "raise",
            StmtKind::Try { .. } => "try",
            StmtKind::With { .. } => "with",
            StmtKind::Global(_) => "global",
            StmtKind::Nonlocal(_) => "nonlocal",
            StmtKind::Delete(_) => "del",
            StmtKind::Assert { .. } => "assert",
            StmtKind::Match { .. } => "match",
        }
    }
}

/// `name as asname` in an import
#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    pub name: String,
    pub asname: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Parameters,
    pub body: Vec<Stmt>,
    pub decorators: Vec<Expr>,
    pub returns: Option<Expr>,
    pub is_async: bool,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LambdaDef {
    pub params: Parameters,
    pub body: Expr,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    pub positional: Vec<Param>,
    pub vararg: Option<Param>,
    pub kwonly: Vec<Param>,
    pub kwarg: Option<Param>,
}

impl Parameters {
    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.positional
            .iter()
            .chain(self.vararg.iter())
            .chain(self.kwonly.iter())
            .chain(self.kwarg.iter())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub annotation: Option<Expr>,
    pub default: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub name: String,
    pub bases: Vec<Expr>,
    pub keywords: Vec<Keyword>,
    pub body: Vec<Stmt>,
    pub decorators: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptHandler {
    pub kind: Option<Expr>,
    pub name: Option<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// One `case` arm of a `match` statement
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub kind: PatternKind,
    pub span: Span,
}

impl Pattern {
    pub fn new(kind: PatternKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatternKind {
    /// `_`
    Wildcard,
    Capture(String),
    /// Literal or dotted name, compared by equality (identity for
    /// `None`, `True` and `False`)
    Value(Expr),
    /// `[a, *rest]`, `(a, b)` or a bare `a, b`
    Sequence(Vec<Pattern>),
    /// `*name` inside a sequence; `*_` binds nothing
    Star(Option<String>),
    Mapping {
        keys: Vec<Expr>,
        patterns: Vec<Pattern>,
        rest: Option<String>,
    },
    Class {
        cls: Expr,
        patterns: Vec<Pattern>,
        keywords: Vec<PatternKeyword>,
    },
    Or(Vec<Pattern>),
    As {
        pattern: Box<Pattern>,
        name: String,
    },
}

/// `attr=pattern` inside a class pattern
#[derive(Debug, Clone, PartialEq)]
pub struct PatternKeyword {
    pub name: String,
    pub span: Span,
    pub pattern: Pattern,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithItem {
    pub context: Expr,
    pub target: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Constant(Constant),
    Name(String),
    Attribute {
        value: Box<Expr>,
        attr: String,
        /// Position of the attribute name itself
        attr_span: Span,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Call {
        func: Box<Expr>,
        /// Positional arguments; `*xs` appears as `Starred`
        args: Vec<Expr>,
        keywords: Vec<Keyword>,
    },
    Starred(Box<Expr>),
    BinOp {
        left: Box<Expr>,
        op: BinOpKind,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOpKind,
        operand: Box<Expr>,
    },
    BoolOp {
        op: BoolOpKind,
        values: Vec<Expr>,
    },
    Compare {
        left: Box<Expr>,
        ops: Vec<CmpOpKind>,
        comparators: Vec<Expr>,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Lambda(Arc<LambdaDef>),
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Set(Vec<Expr>),
    /// A `None` key marks a `**mapping` entry
    Dict {
        keys: Vec<Option<Expr>>,
        values: Vec<Expr>,
    },
    Comprehension {
        kind: ComprehensionKind,
        element: Box<Expr>,
        /// Value expression of a dict comprehension
        value: Option<Box<Expr>>,
        generators: Vec<CompFor>,
    },
    Yield(Option<Box<Expr>>),
    YieldFrom(Box<Expr>),
    Await(Box<Expr>),
    JoinedStr(Vec<FStringPart>),
    NamedExpr {
        target: String,
        value: Box<Expr>,
    },
}

impl ExprKind {
    pub fn describe(&self) -> &'static str {
        match self {
            ExprKind::Constant(Constant::None) => "None",
            ExprKind::Constant(Constant::Bool(true)) => "True",
            ExprKind::Constant(Constant::Bool(false)) => "False",
            ExprKind::Constant(Constant::Ellipsis) => "ellipsis",
            ExprKind::Constant(_) => "literal",
            ExprKind::Name(_) => "name",
            ExprKind::Attribute { .. } => "attribute",
            ExprKind::Subscript { .. } => "subscript",
            ExprKind::Slice { .. } => "slice",
            ExprKind::Call { .. } => "function call",
            ExprKind::Starred(_) => "starred",
            ExprKind::BinOp { .. } | ExprKind::UnaryOp { .. } => "expression",
            ExprKind::BoolOp { .. } => "expression",
            ExprKind::Compare { .. } => "comparison",
            ExprKind::IfExp { .. } => "conditional expression",
            ExprKind::Lambda(_) => "lambda",
            ExprKind::Tuple(_) => "tuple",
            ExprKind::List(_) => "list",
            ExprKind::Set(_) => "set display",
            ExprKind::Dict { .. } => "dict literal",
            ExprKind::Comprehension { .. } => "comprehension",
            ExprKind::Yield(_) | ExprKind::YieldFrom(_) => "yield expression",
            ExprKind::Await(_) => "await expression",
            ExprKind::JoinedStr(_) => "f-string expression",
            ExprKind::NamedExpr { .. } => "named expression",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    BigInt(String),
    Float(f64),
    Imaginary(f64),
    Str(String),
    Bytes(Vec<u8>),
    Ellipsis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComprehensionKind {
    List,
    Set,
    Dict,
    Generator,
}

/// One `for target in iter if cond...` clause
#[derive(Debug, Clone, PartialEq)]
pub struct CompFor {
    pub target: Expr,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
    pub is_async: bool,
}

/// `name=value`, or `**value` when `arg` is `None`
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub arg: Option<String>,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FStringPart {
    Literal(String),
    Field {
        value: Box<Expr>,
        conversion: Option<char>,
        format_spec: Option<Vec<FStringPart>>,
        /// Source text echoed by the `{expr=}` form
        debug_text: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpKind {
    Add,
    Sub,
    Mult,
    MatMult,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
}

impl BinOpKind {
    pub fn from_op(op: &str) -> Option<Self> {
        Some(match op {
            "+" => BinOpKind::Add,
            "-" => BinOpKind::Sub,
            "*" => BinOpKind::Mult,
            "@" => BinOpKind::MatMult,
            "/" => BinOpKind::Div,
            "//" => BinOpKind::FloorDiv,
            "%" => BinOpKind::Mod,
            "**" => BinOpKind::Pow,
            "<<" => BinOpKind::LShift,
            ">>" => BinOpKind::RShift,
            "|" => BinOpKind::BitOr,
            "^" => BinOpKind::BitXor,
            "&" => BinOpKind::BitAnd,
            _ => return None,
        })
    }

    /// Maps `+=` and friends to their operator
    pub fn from_augmented(op: &str) -> Option<Self> {
        op.strip_suffix('=')
            .filter(|base| !base.is_empty() && !matches!(*base, "=" | "!" | "<" | ">" | ":"))
            .and_then(Self::from_op)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOpKind::Add => "+",
            BinOpKind::Sub => "-",
            BinOpKind::Mult => "*",
            BinOpKind::MatMult => "@",
            BinOpKind::Div => "/",
            BinOpKind::FloorDiv => "//",
            BinOpKind::Mod => "%",
            BinOpKind::Pow => "**",
            BinOpKind::LShift => "<<",
            BinOpKind::RShift => ">>",
            BinOpKind::BitOr => "|",
            BinOpKind::BitXor => "^",
            BinOpKind::BitAnd => "&",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOpKind {
    Not,
    Neg,
    Pos,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOpKind {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOpKind {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

impl CmpOpKind {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOpKind::Eq => "==",
            CmpOpKind::NotEq => "!=",
            CmpOpKind::Lt => "<",
            CmpOpKind::LtE => "<=",
            CmpOpKind::Gt => ">",
            CmpOpKind::GtE => ">=",
            CmpOpKind::Is => "is",
            CmpOpKind::IsNot => "is not",
            CmpOpKind::In => "in",
            CmpOpKind::NotIn => "not in",
        }
    }
}

/// Read-only traversal in document order.
///
/// Override `visit_stmt`/`visit_expr` and call the matching `walk_*`
/// function to continue into children.
pub trait Visitor {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        walk_expr(self, expr);
    }

    fn visit_pattern(&mut self, pattern: &Pattern) {
        walk_pattern(self, pattern);
    }
}

fn walk_body<V: Visitor + ?Sized>(visitor: &mut V, body: &[Stmt]) {
    for stmt in body {
        visitor.visit_stmt(stmt);
    }
}

fn walk_params<V: Visitor + ?Sized>(visitor: &mut V, params: &Parameters) {
    for param in params.iter() {
        if let Some(annotation) = &param.annotation {
            visitor.visit_expr(annotation);
        }
        if let Some(default) = &param.default {
            visitor.visit_expr(default);
        }
    }
}

pub fn walk_stmt<V: Visitor + ?Sized>(visitor: &mut V, stmt: &Stmt) {
    match &stmt.kind {
        StmtKind::Expr(expr) => visitor.visit_expr(expr),
        StmtKind::Assign { targets, value } => {
            for target in targets {
                visitor.visit_expr(target);
            }
            visitor.visit_expr(value);
        }
        StmtKind::AugAssign { target, value, .. } => {
            visitor.visit_expr(target);
            visitor.visit_expr(value);
        }
        StmtKind::AnnAssign {
            target,
            annotation,
            value,
        } => {
            visitor.visit_expr(target);
            visitor.visit_expr(annotation);
            if let Some(value) = value {
                visitor.visit_expr(value);
            }
        }
        StmtKind::Import(_)
        | StmtKind::ImportFrom { .. }
        | StmtKind::Pass
        | StmtKind::Break
        | StmtKind::Continue
        | StmtKind::Global(_)
        | StmtKind::Nonlocal(_) => {}
        StmtKind::If { test, body, orelse } | StmtKind::While { test, body, orelse } => {
            visitor.visit_expr(test);
            walk_body(visitor, body);
            walk_body(visitor, orelse);
        }
        StmtKind::For {
            target,
            iter,
            body,
            orelse,
            ..
        } => {
            visitor.visit_expr(target);
            visitor.visit_expr(iter);
            walk_body(visitor, body);
            walk_body(visitor, orelse);
        }
        StmtKind::FunctionDef(def) => {
            for decorator in &def.decorators {
                visitor.visit_expr(decorator);
            }
            walk_params(visitor, &def.params);
            if let Some(returns) = &def.returns {
                visitor.visit_expr(returns);
            }
            walk_body(visitor, &def.body);
        }
        StmtKind::ClassDef(class) => {
            for decorator in &class.decorators {
                visitor.visit_expr(decorator);
            }
            for base in &class.bases {
                visitor.visit_expr(base);
            }
            for keyword in &class.keywords {
                visitor.visit_expr(&keyword.value);
            }
            walk_body(visitor, &class.body);
        }
        StmtKind::Return(value) => {
            if let Some(value) = value {
                visitor.visit_expr(value);
            }
        }
        StmtKind::Raise { exc, cause } => {
            if let Some(exc) = exc {
                visitor.visit_expr(exc);
            }
            if let Some(cause) = cause {
                visitor.visit_expr(cause);
            }
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => {
            walk_body(visitor, body);
            for handler in handlers {
                if let Some(kind) = &handler.kind {
                    visitor.visit_expr(kind);
                }
                walk_body(visitor, &handler.body);
            }
            walk_body(visitor, orelse);
            walk_body(visitor, finalbody);
        }
        StmtKind::With { items, body, .. } => {
            for item in items {
                visitor.visit_expr(&item.context);
                if let Some(target) = &item.target {
                    visitor.visit_expr(target);
                }
            }
            walk_body(visitor, body);
        }
        StmtKind::Delete(targets) => {
            for target in targets {
                visitor.visit_expr(target);
            }
        }
        StmtKind::Assert { test, msg } => {
            visitor.visit_expr(test);
            if let Some(msg) = msg {
                visitor.visit_expr(msg);
            }
        }
        StmtKind::Match { subject, cases } => {
            visitor.visit_expr(subject);
            for case in cases {
                visitor.visit_pattern(&case.pattern);
                if let Some(guard) = &case.guard {
                    visitor.visit_expr(guard);
                }
                walk_body(visitor, &case.body);
            }
        }
    }
}

pub fn walk_pattern<V: Visitor + ?Sized>(visitor: &mut V, pattern: &Pattern) {
    match &pattern.kind {
        PatternKind::Wildcard | PatternKind::Capture(_) | PatternKind::Star(_) => {}
        PatternKind::Value(value) => visitor.visit_expr(value),
        PatternKind::Sequence(items) | PatternKind::Or(items) => {
            for item in items {
                visitor.visit_pattern(item);
            }
        }
        PatternKind::Mapping { keys, patterns, .. } => {
            for (key, value) in keys.iter().zip(patterns) {
                visitor.visit_expr(key);
                visitor.visit_pattern(value);
            }
        }
        PatternKind::Class {
            cls,
            patterns,
            keywords,
        } => {
            visitor.visit_expr(cls);
            for item in patterns {
                visitor.visit_pattern(item);
            }
            for keyword in keywords {
                visitor.visit_pattern(&keyword.pattern);
            }
        }
        PatternKind::As { pattern, .. } => visitor.visit_pattern(pattern),
    }
}

fn walk_fstring<V: Visitor + ?Sized>(visitor: &mut V, parts: &[FStringPart]) {
    for part in parts {
        if let FStringPart::Field {
            value, format_spec, ..
        } = part
        {
            visitor.visit_expr(value);
            if let Some(spec) = format_spec {
                walk_fstring(visitor, spec);
            }
        }
    }
}

pub fn walk_expr<V: Visitor + ?Sized>(visitor: &mut V, expr: &Expr) {
    match &expr.kind {
        ExprKind::Constant(_) | ExprKind::Name(_) => {}
        ExprKind::Attribute { value, .. } => visitor.visit_expr(value),
        ExprKind::Subscript { value, index } => {
            visitor.visit_expr(value);
            visitor.visit_expr(index);
        }
        ExprKind::Slice { lower, upper, step } => {
            for part in [lower, upper, step].into_iter().flatten() {
                visitor.visit_expr(part);
            }
        }
        ExprKind::Call {
            func,
            args,
            keywords,
        } => {
            visitor.visit_expr(func);
            for arg in args {
                visitor.visit_expr(arg);
            }
            for keyword in keywords {
                visitor.visit_expr(&keyword.value);
            }
        }
        ExprKind::Starred(value)
        | ExprKind::YieldFrom(value)
        | ExprKind::Await(value)
        | ExprKind::UnaryOp { operand: value, .. } => visitor.visit_expr(value),
        ExprKind::BinOp { left, right, .. } => {
            visitor.visit_expr(left);
            visitor.visit_expr(right);
        }
        ExprKind::BoolOp { values, .. }
        | ExprKind::Tuple(values)
        | ExprKind::List(values)
        | ExprKind::Set(values) => {
            for value in values {
                visitor.visit_expr(value);
            }
        }
        ExprKind::Compare {
            left, comparators, ..
        } => {
            visitor.visit_expr(left);
            for comparator in comparators {
                visitor.visit_expr(comparator);
            }
        }
        ExprKind::IfExp { test, body, orelse } => {
            visitor.visit_expr(body);
            visitor.visit_expr(test);
            visitor.visit_expr(orelse);
        }
        ExprKind::Lambda(lambda) => {
            walk_params(visitor, &lambda.params);
            visitor.visit_expr(&lambda.body);
        }
        ExprKind::Dict { keys, values } => {
            for (key, value) in keys.iter().zip(values) {
                if let Some(key) = key {
                    visitor.visit_expr(key);
                }
                visitor.visit_expr(value);
            }
        }
        ExprKind::Comprehension {
            element,
            value,
            generators,
            ..
        } => {
            visitor.visit_expr(element);
            if let Some(value) = value {
                visitor.visit_expr(value);
            }
            for generator in generators {
                visitor.visit_expr(&generator.target);
                visitor.visit_expr(&generator.iter);
                for cond in &generator.ifs {
                    visitor.visit_expr(cond);
                }
            }
        }
        ExprKind::Yield(value) => {
            if let Some(value) = value {
                visitor.visit_expr(value);
            }
        }
        ExprKind::JoinedStr(parts) => walk_fstring(visitor, parts),
        ExprKind::NamedExpr { value, .. } => visitor.visit_expr(value),
    }
}
