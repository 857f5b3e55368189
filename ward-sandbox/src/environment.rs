//! Restricted namespace for in-process evaluation
//!
//! The environment owns a fixed catalog of pure primitives. Building a
//! namespace selects from that catalog only; a requested name the catalog
//! does not know is skipped and reported, never bound. Filesystem,
//! process, import, reflection and dynamic-evaluation primitives are not
//! in the catalog, so no configuration can expose them.

use crate::lang::ast::Constant;
use std::collections::BTreeMap;
use tracing::warn;

/// Names of every primitive the catalog provides
pub const SAFE_PRIMITIVES: &[&str] = &[
    "abs", "all", "any", "bool", "chr", "dict", "divmod", "enumerate", "float", "format", "hex",
    "int", "len", "list", "max", "min", "oct", "ord", "pow", "print", "range", "repr",
    "reversed", "round", "set", "sorted", "str", "sum", "tuple", "zip",
];

/// Exception types bound in every namespace, each with its base type
pub const EXCEPTION_TYPES: &[(&str, Option<&str>)] = &[
    ("BaseException", None),
    ("Exception", Some("BaseException")),
    ("ArithmeticError", Some("Exception")),
    ("ZeroDivisionError", Some("ArithmeticError")),
    ("OverflowError", Some("ArithmeticError")),
    ("LookupError", Some("Exception")),
    ("KeyError", Some("LookupError")),
    ("IndexError", Some("LookupError")),
    ("ValueError", Some("Exception")),
    ("TypeError", Some("Exception")),
    ("NameError", Some("Exception")),
    ("UnboundLocalError", Some("NameError")),
    ("AttributeError", Some("Exception")),
    ("AssertionError", Some("Exception")),
    ("ImportError", Some("Exception")),
    ("ModuleNotFoundError", Some("ImportError")),
    ("RuntimeError", Some("Exception")),
    ("RecursionError", Some("RuntimeError")),
    ("NotImplementedError", Some("RuntimeError")),
    ("MemoryError", Some("Exception")),
    ("StopIteration", Some("Exception")),
    ("KeyboardInterrupt", Some("BaseException")),
];

/// Fixed stand-ins for the host's self-identifying names
pub const SENTINEL_MODULE_NAME: &str = "__sandbox__";
pub const SENTINEL_FILE_NAME: &str = "<sandbox>";

/// A safe primitive from the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Primitive {
    Abs,
    All,
    Any,
    Bool,
    Chr,
    Dict,
    Divmod,
    Enumerate,
    Float,
    Format,
    Hex,
    Int,
    Len,
    List,
    Max,
    Min,
    Oct,
    Ord,
    Pow,
    Print,
    Range,
    Repr,
    Reversed,
    Round,
    Set,
    Sorted,
    Str,
    Sum,
    Tuple,
    Zip,
}

impl Primitive {
    pub fn from_name(name: &str) -> Option<Self> {
        let primitive = match name {
            "abs" => Primitive::Abs,
            "all" => Primitive::All,
            "any" => Primitive::Any,
            "bool" => Primitive::Bool,
            "chr" => Primitive::Chr,
            "dict" => Primitive::Dict,
            "divmod" => Primitive::Divmod,
            "enumerate" => Primitive::Enumerate,
            "float" => Primitive::Float,
            "format" => Primitive::Format,
            "hex" => Primitive::Hex,
            "int" => Primitive::Int,
            "len" => Primitive::Len,
            "list" => Primitive::List,
            "max" => Primitive::Max,
            "min" => Primitive::Min,
            "oct" => Primitive::Oct,
            "ord" => Primitive::Ord,
            "pow" => Primitive::Pow,
            "print" => Primitive::Print,
            "range" => Primitive::Range,
            "repr" => Primitive::Repr,
            "reversed" => Primitive::Reversed,
            "round" => Primitive::Round,
            "set" => Primitive::Set,
            "sorted" => Primitive::Sorted,
            "str" => Primitive::Str,
            "sum" => Primitive::Sum,
            "tuple" => Primitive::Tuple,
            "zip" => Primitive::Zip,
            _ => return None,
        };
        Some(primitive)
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Abs => "abs",
            Primitive::All => "all",
            Primitive::Any => "any",
            Primitive::Bool => "bool",
            Primitive::Chr => "chr",
            Primitive::Dict => "dict",
            Primitive::Divmod => "divmod",
            Primitive::Enumerate => "enumerate",
            Primitive::Float => "float",
            Primitive::Format => "format",
            Primitive::Hex => "hex",
            Primitive::Int => "int",
            Primitive::Len => "len",
            Primitive::List => "list",
            Primitive::Max => "max",
            Primitive::Min => "min",
            Primitive::Oct => "oct",
            Primitive::Ord => "ord",
            Primitive::Pow => "pow",
            Primitive::Print => "print",
            Primitive::Range => "range",
            Primitive::Repr => "repr",
            Primitive::Reversed => "reversed",
            Primitive::Round => "round",
            Primitive::Set => "set",
            Primitive::Sorted => "sorted",
            Primitive::Str => "str",
            Primitive::Sum => "sum",
            Primitive::Tuple => "tuple",
            Primitive::Zip => "zip",
        }
    }
}

/// What a namespace name is bound to
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Primitive(Primitive),
    ExceptionType(&'static str),
    Constant(Constant),
}

/// Restricted global namespace for one evaluation.
///
/// Plain data, so it can be built on the async side and moved to the
/// interpreter thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Namespace {
    bindings: BTreeMap<String, Binding>,
    skipped: Vec<String>,
}

impl Namespace {
    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Binding)> {
        self.bindings.iter().map(|(name, binding)| (name.as_str(), binding))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Requested names that were not bound
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn warnings(&self) -> Vec<String> {
        self.skipped
            .iter()
            .map(|name| format!("primitive '{}' is not available in the sandbox", name))
            .collect()
    }
}

/// Stateless namespace builder, reusable across executions
#[derive(Debug, Clone, Copy, Default)]
pub struct SecureExecutionEnvironment;

impl SecureExecutionEnvironment {
    pub fn new() -> Self {
        Self
    }

    pub fn build<I, S>(&self, allowed: I) -> Namespace
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut namespace = Namespace::default();
        for name in allowed {
            let name = name.as_ref();
            match Primitive::from_name(name) {
                Some(primitive) => {
                    namespace
                        .bindings
                        .insert(name.to_string(), Binding::Primitive(primitive));
                }
                None => {
                    warn!(primitive = name, "Requested primitive is not in the safe catalog");
                    namespace.skipped.push(name.to_string());
                }
            }
        }

        for &(name, _) in EXCEPTION_TYPES {
            namespace
                .bindings
                .insert(name.to_string(), Binding::ExceptionType(name));
        }

        let fixed = [
            ("True", Constant::Bool(true)),
            ("False", Constant::Bool(false)),
            ("None", Constant::None),
            ("__name__", Constant::Str(SENTINEL_MODULE_NAME.to_string())),
            ("__file__", Constant::Str(SENTINEL_FILE_NAME.to_string())),
            ("__doc__", Constant::None),
        ];
        for (name, value) in fixed {
            namespace
                .bindings
                .insert(name.to_string(), Binding::Constant(value));
        }
        namespace
    }
}

/// Base type of a bound exception type
pub fn exception_base(name: &str) -> Option<&'static str> {
    EXCEPTION_TYPES
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .and_then(|(_, base)| *base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::default_forbidden_builtins;

    #[test]
    fn test_catalog_names_round_trip() {
        for name in SAFE_PRIMITIVES {
            let primitive = Primitive::from_name(name).unwrap();
            assert_eq!(primitive.name(), *name);
        }
    }

    #[test]
    fn test_build_binds_only_requested_primitives() {
        let namespace = SecureExecutionEnvironment::new().build(["len", "print"]);
        assert_eq!(namespace.get("len"), Some(&Binding::Primitive(Primitive::Len)));
        assert!(namespace.contains("print"));
        assert!(!namespace.contains("sum"));
        assert!(namespace.skipped().is_empty());
    }

    #[test]
    fn test_escape_hatches_never_bound() {
        let mut requested: Vec<String> = SAFE_PRIMITIVES.iter().map(|s| s.to_string()).collect();
        requested.extend(default_forbidden_builtins());
        let namespace = SecureExecutionEnvironment::new().build(&requested);
        for name in default_forbidden_builtins() {
            assert!(!namespace.contains(&name), "{} must not be bound", name);
        }
        assert_eq!(namespace.skipped().len(), default_forbidden_builtins().len());
        assert_eq!(namespace.warnings().len(), namespace.skipped().len());
    }

    #[test]
    fn test_constants_and_sentinels() {
        let namespace = SecureExecutionEnvironment::new().build(Vec::<String>::new());
        assert_eq!(namespace.get("True"), Some(&Binding::Constant(Constant::Bool(true))));
        assert_eq!(namespace.get("None"), Some(&Binding::Constant(Constant::None)));
        assert_eq!(
            namespace.get("__name__"),
            Some(&Binding::Constant(Constant::Str("__sandbox__".into())))
        );
        assert_eq!(
            namespace.get("__file__"),
            Some(&Binding::Constant(Constant::Str("<sandbox>".into())))
        );
        assert!(namespace.contains("ValueError"));
    }

    #[test]
    fn test_exception_hierarchy() {
        assert_eq!(exception_base("KeyError"), Some("LookupError"));
        assert_eq!(exception_base("BaseException"), None);
        for (name, base) in EXCEPTION_TYPES {
            if let Some(base) = base {
                assert!(
                    EXCEPTION_TYPES.iter().any(|(candidate, _)| candidate == base),
                    "{} has unknown base {}",
                    name,
                    base
                );
            }
        }
    }
}
