//! Security modes, isolation strategies and the default name lists

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Overall security posture of a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    Strict,
    Restricted,
    Permissive,
    Development,
}

impl SandboxMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxMode::Strict => "strict",
            SandboxMode::Restricted => "restricted",
            SandboxMode::Permissive => "permissive",
            SandboxMode::Development => "development",
        }
    }

    /// Modes meant for untrusted input
    pub fn is_untrusted(self) -> bool {
        matches!(self, SandboxMode::Strict | SandboxMode::Restricted)
    }

    pub fn default_strategy(self) -> ExecutionStrategy {
        if self.is_untrusted() {
            ExecutionStrategy::IsolatedProcess
        } else {
            ExecutionStrategy::InProcess
        }
    }

    /// What to do when the permission collaborator cannot be reached
    pub fn permission_failure_policy(self) -> PermissionFailurePolicy {
        if self.is_untrusted() {
            PermissionFailurePolicy::Deny
        } else {
            PermissionFailurePolicy::AllowWithWarning
        }
    }
}

impl std::fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Isolation mechanism used for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStrategy {
    /// Tree-walking evaluation inside the host process
    InProcess,
    /// Short-lived interpreter process with OS resource limits
    IsolatedProcess,
    /// Disposable container instance
    Container,
}

impl ExecutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStrategy::InProcess => "in-process",
            ExecutionStrategy::IsolatedProcess => "isolated-process",
            ExecutionStrategy::Container => "container",
        }
    }

    /// Isolation ranking (lower is stronger)
    pub fn isolation_rank(self) -> u8 {
        match self {
            ExecutionStrategy::Container => 0,
            ExecutionStrategy::IsolatedProcess => 1,
            ExecutionStrategy::InProcess => 2,
        }
    }

    /// Whether memory and CPU ceilings are enforced by the OS rather than advisory
    pub fn enforces_limits(self) -> bool {
        !matches!(self, ExecutionStrategy::InProcess)
    }
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behavior when the permission collaborator is unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionFailurePolicy {
    Deny,
    AllowWithWarning,
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// Modules that give access to the host: filesystem, processes, network,
/// interpreter internals and native code
pub fn default_forbidden_imports() -> BTreeSet<String> {
    set(&[
        "os",
        "sys",
        "subprocess",
        "socket",
        "shutil",
        "ctypes",
        "builtins",
        "importlib",
        "inspect",
        "gc",
        "signal",
        "multiprocessing",
        "threading",
        "_thread",
        "pty",
        "pathlib",
        "io",
        "tempfile",
        "glob",
        "fcntl",
        "resource",
        "mmap",
        "marshal",
        "pickle",
        "shelve",
        "code",
        "codeop",
        "runpy",
        "pdb",
        "urllib",
        "http",
        "ftplib",
        "smtplib",
        "asyncio",
        "ssl",
        "select",
        "selectors",
        "posix",
        "nt",
        "platform",
        "sysconfig",
        "webbrowser",
    ])
}

/// Pure-computation modules permitted under the strict import allow-list
pub fn strict_allowed_imports() -> BTreeSet<String> {
    set(&[
        "math",
        "cmath",
        "json",
        "re",
        "string",
        "collections",
        "itertools",
        "functools",
        "operator",
        "statistics",
        "decimal",
        "fractions",
        "random",
        "datetime",
        "heapq",
        "bisect",
        "textwrap",
        "typing",
        "dataclasses",
        "enum",
    ])
}

/// Escape-hatch primitives: dynamic evaluation and compilation, raw
/// import, filesystem and namespace reflection
pub fn default_forbidden_builtins() -> BTreeSet<String> {
    set(&[
        "eval",
        "exec",
        "compile",
        "__import__",
        "open",
        "input",
        "globals",
        "locals",
        "vars",
        "getattr",
        "setattr",
        "delattr",
        "breakpoint",
        "help",
        "memoryview",
        "exit",
        "quit",
    ])
}

/// Every safe primitive the in-process environment knows about
pub fn default_allowed_builtins() -> BTreeSet<String> {
    set(crate::environment::SAFE_PRIMITIVES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_defaults() {
        assert_eq!(
            SandboxMode::Strict.default_strategy(),
            ExecutionStrategy::IsolatedProcess
        );
        assert_eq!(
            SandboxMode::Development.default_strategy(),
            ExecutionStrategy::InProcess
        );
        assert_eq!(
            SandboxMode::Restricted.permission_failure_policy(),
            PermissionFailurePolicy::Deny
        );
        assert_eq!(
            SandboxMode::Permissive.permission_failure_policy(),
            PermissionFailurePolicy::AllowWithWarning
        );
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&ExecutionStrategy::IsolatedProcess).unwrap();
        assert_eq!(json, "\"isolated-process\"");
        let mode: SandboxMode = serde_json::from_str("\"permissive\"").unwrap();
        assert_eq!(mode, SandboxMode::Permissive);
    }

    #[test]
    fn test_isolation_ranking() {
        assert!(
            ExecutionStrategy::Container.isolation_rank()
                < ExecutionStrategy::IsolatedProcess.isolation_rank()
        );
        assert!(!ExecutionStrategy::InProcess.enforces_limits());
    }

    #[test]
    fn test_default_lists_are_disjoint() {
        let forbidden = default_forbidden_imports();
        for module in strict_allowed_imports() {
            assert!(!forbidden.contains(&module), "{} is in both lists", module);
        }
        let builtins = default_allowed_builtins();
        for name in default_forbidden_builtins() {
            assert!(!builtins.contains(&name), "{} is both safe and forbidden", name);
        }
    }
}
