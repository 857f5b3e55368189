//! Ward sandbox - secure execution of untrusted programs
//!
//! Runs caller-supplied Python-syntax programs under resource ceilings and
//! capability restrictions, and returns a structured, auditable
//! [`ExecutionResult`]. Every program passes the [`CodeAnalyzer`] gate before
//! it runs, then executes under one of three isolation strategies:
//!
//! - in-process, on a restricted tree-walking evaluator
//! - an isolated interpreter process with OS resource limits
//! - a disposable container
//!
//! [`SandboxManager`] is the entry point.

pub mod analyzer;
pub mod config;
pub mod environment;
mod error;
pub mod execution;
pub mod executor;
pub mod global;
mod interpreter;
pub mod lang;
mod limits;
mod manager;
pub mod monitor;
mod policy;
mod selector;
mod types;

pub use analyzer::CodeAnalyzer;
pub use config::{ConfigError, ContainerSettings, IsolatedProcessSettings, SandboxConfiguration};
pub use environment::{Namespace, SecureExecutionEnvironment};
pub use error::{Result, SandboxError};
pub use execution::{ActiveExecution, ExecutionContext, ExecutionId};
pub use executor::{
    Collaborators, ContainerExecutor, InProcessExecutor, IsolatedProcessExecutor, SandboxExecutor,
};
pub use limits::ResourceLimits;
pub use manager::{SandboxManager, SandboxManagerBuilder};
pub use monitor::{MonitorError, MonitorState, ResourceMonitor};
pub use policy::{ExecutionStrategy, PermissionFailurePolicy, SandboxMode};
pub use selector::{SelectionError, StrategyDecision, StrategySelector};
pub use types::{
    CapturedOutput, ErrorKind, ExecutionError, ExecutionResult, ResourceBreach, ResourceKind,
    ResourceUsage, SecurityViolation, SourceLocation, UsageStats, ViolationKind,
};

/// Re-export of the collaborator contracts
pub use ward_common;
