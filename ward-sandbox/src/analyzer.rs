//! Static pre-execution scan for forbidden constructs
//!
//! The analyzer never executes its input. It parses the program with the
//! same front end the in-process interpreter uses and walks the tree,
//! reporting every forbidden import, escape-hatch call and reflective
//! attribute access it finds. Reachability is not considered: a forbidden
//! call inside a branch that never runs is still reported.

use crate::config::SandboxConfiguration;
use crate::lang::ast::{
    walk_expr, walk_pattern, walk_stmt, Alias, Expr, ExprKind, Keyword, Module, Pattern,
    PatternKind, Stmt, StmtKind, Visitor,
};
use crate::lang::parse_module;
use crate::types::SecurityViolation;
use std::collections::BTreeSet;
use tracing::debug;

/// Dunder names the environment defines itself; reading them is harmless
const SENTINEL_NAMES: &[&str] = &["__name__", "__file__", "__doc__"];

/// Pre-execution gate shared by every executor.
///
/// Holds only immutable lists, so one instance can be shared across
/// concurrent executions without locking.
#[derive(Debug, Clone)]
pub struct CodeAnalyzer {
    forbidden_imports: BTreeSet<String>,
    allowed_imports: BTreeSet<String>,
    forbidden_builtins: BTreeSet<String>,
    forbidden_attributes: BTreeSet<String>,
    allowed_attributes: BTreeSet<String>,
}

impl CodeAnalyzer {
    pub fn new(config: &SandboxConfiguration) -> Self {
        Self {
            forbidden_imports: config.forbidden_imports.clone(),
            allowed_imports: config.allowed_imports.clone(),
            forbidden_builtins: config.forbidden_builtins.clone(),
            forbidden_attributes: config.forbidden_attributes.clone(),
            allowed_attributes: config.allowed_attributes.clone(),
        }
    }

    /// Scan program text. Unparsable input yields a single syntax-error
    /// violation.
    pub fn analyze(&self, source: &str) -> Vec<SecurityViolation> {
        match parse_module(source) {
            Ok(module) => self.analyze_module(&module),
            Err(error) => {
                debug!(
                    line = error.line,
                    column = error.column,
                    "Program failed to parse: {}",
                    error.message
                );
                vec![SecurityViolation::syntax_error(&error)]
            }
        }
    }

    /// Scan an already parsed program; violations come back in source order
    pub fn analyze_module(&self, module: &Module) -> Vec<SecurityViolation> {
        let mut scan = Scan {
            analyzer: self,
            violations: Vec::new(),
        };
        for stmt in &module.body {
            scan.visit_stmt(stmt);
        }

        let mut violations = scan.violations;
        // Stable, so constructs sharing a position keep walk order
        violations.sort_by_key(|violation| violation.location);
        violations
    }

    /// Whether importing `module` (a dotted name) is forbidden
    pub fn is_import_forbidden(&self, module: &str) -> bool {
        let prefixes = dotted_prefixes(module);
        if prefixes.iter().any(|prefix| self.forbidden_imports.contains(*prefix)) {
            return true;
        }
        !self.allowed_imports.is_empty()
            && !prefixes.iter().any(|prefix| self.allowed_imports.contains(*prefix))
    }

    pub fn is_builtin_forbidden(&self, name: &str) -> bool {
        self.forbidden_builtins.contains(name)
    }

    /// Reflection naming convention, plus the explicit deny-list
    pub fn is_attribute_forbidden(&self, attribute: &str) -> bool {
        if self.allowed_attributes.contains(attribute) {
            return false;
        }
        attribute.starts_with("__") || self.forbidden_attributes.contains(attribute)
    }
}

/// `a.b.c` -> `["a", "a.b", "a.b.c"]`
fn dotted_prefixes(module: &str) -> Vec<&str> {
    module
        .match_indices('.')
        .map(|(index, _)| &module[..index])
        .chain(std::iter::once(module))
        .collect()
}

struct Scan<'a> {
    analyzer: &'a CodeAnalyzer,
    violations: Vec<SecurityViolation>,
}

impl Scan<'_> {
    fn check_from_import(
        &mut self,
        stmt: &Stmt,
        module: Option<&str>,
        names: &[Alias],
        level: usize,
    ) {
        if level > 0 {
            let relative = format!("{}{}", ".".repeat(level), module.unwrap_or(""));
            self.violations
                .push(SecurityViolation::forbidden_import(&relative, None, stmt.span));
            return;
        }
        let Some(module) = module else { return };
        if self.analyzer.is_import_forbidden(module) {
            self.violations
                .push(SecurityViolation::forbidden_import(module, None, stmt.span));
            return;
        }
        // `from concurrent import futures` names a submodule
        for alias in names {
            if alias.name == "*" {
                continue;
            }
            let qualified = format!("{}.{}", module, alias.name);
            if self.analyzer.forbidden_imports.contains(&qualified) {
                self.violations.push(SecurityViolation::forbidden_import(
                    &qualified,
                    alias.asname.as_deref(),
                    alias.span,
                ));
            }
        }
    }

    /// Report a forbidden callee once, at the call, without re-reporting
    /// the callee expression itself.
    fn check_call(&mut self, func: &Expr, args: &[Expr], keywords: &[Keyword]) -> bool {
        let flagged = match &func.kind {
            ExprKind::Name(name) if self.analyzer.is_builtin_forbidden(name) => {
                self.violations
                    .push(SecurityViolation::forbidden_builtin(name, func.span));
                true
            }
            ExprKind::Attribute {
                value,
                attr,
                attr_span,
            } if self.analyzer.is_builtin_forbidden(attr) => {
                self.violations
                    .push(SecurityViolation::forbidden_builtin(attr, *attr_span));
                self.visit_expr(value);
                true
            }
            _ => false,
        };
        if flagged {
            for arg in args {
                self.visit_expr(arg);
            }
            for keyword in keywords {
                self.visit_expr(&keyword.value);
            }
        }
        flagged
    }
}

impl Visitor for Scan<'_> {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    if self.analyzer.is_import_forbidden(&alias.name) {
                        self.violations.push(SecurityViolation::forbidden_import(
                            &alias.name,
                            alias.asname.as_deref(),
                            alias.span,
                        ));
                    }
                }
            }
            StmtKind::ImportFrom {
                module,
                names,
                level,
            } => self.check_from_import(stmt, module.as_deref(), names, *level),
            _ => {}
        }
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                if self.check_call(func, args, keywords) {
                    return;
                }
            }
            ExprKind::Name(name) => {
                if self.analyzer.is_builtin_forbidden(name) {
                    // `f = eval` smuggles the primitive out through an alias
                    self.violations
                        .push(SecurityViolation::forbidden_builtin(name, expr.span));
                } else if !SENTINEL_NAMES.contains(&name.as_str())
                    && self.analyzer.is_attribute_forbidden(name)
                {
                    self.violations
                        .push(SecurityViolation::forbidden_attribute(name, expr.span));
                }
            }
            ExprKind::Attribute {
                attr, attr_span, ..
            } => {
                if self.analyzer.is_attribute_forbidden(attr) {
                    self.violations
                        .push(SecurityViolation::forbidden_attribute(attr, *attr_span));
                }
            }
            _ => {}
        }
        walk_expr(self, expr);
    }

    fn visit_pattern(&mut self, pattern: &Pattern) {
        // `case Cls(attr=...)` reads `attr` from the subject
        if let PatternKind::Class { keywords, .. } = &pattern.kind {
            for keyword in keywords {
                if self.analyzer.is_attribute_forbidden(&keyword.name) {
                    self.violations
                        .push(SecurityViolation::forbidden_attribute(&keyword.name, keyword.span));
                }
            }
        }
        walk_pattern(self, pattern);
    }
}
