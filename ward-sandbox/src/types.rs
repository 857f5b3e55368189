//! Result and violation types

use crate::execution::ExecutionId;
use crate::lang::{Span, SyntaxError};
use crate::policy::ExecutionStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use ward_common::Severity;

/// Source position of a statically derived violation
pub type SourceLocation = Span;

/// Why an execution failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    PermissionDenied,
    StaticAnalysisFailed,
    ResourceExceeded,
    Timeout,
    /// Uncaught failure raised by the executed program
    RuntimeError,
    /// Isolation runtime unavailable or spawn failure
    InfrastructureError,
    /// Cancelled through the manager
    Terminated,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::StaticAnalysisFailed => "static-analysis-failed",
            ErrorKind::ResourceExceeded => "resource-exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RuntimeError => "runtime-error",
            ErrorKind::InfrastructureError => "infrastructure-error",
            ErrorKind::Terminated => "terminated",
        }
    }

    /// Audit severity of a failure of this kind
    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::RuntimeError | ErrorKind::Timeout | ErrorKind::Terminated => {
                Severity::Warning
            }
            ErrorKind::PermissionDenied
            | ErrorKind::StaticAnalysisFailed
            | ErrorKind::ResourceExceeded
            | ErrorKind::InfrastructureError => Severity::Critical,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-kind of `resource-exceeded`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    CpuTime,
    Memory,
    FileDescriptors,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::CpuTime => "cpu-time",
            ResourceKind::Memory => "memory",
            ResourceKind::FileDescriptors => "file-descriptors",
        }
    }

    /// Unit of `limit`/`observed` values for this kind
    pub fn unit(self) -> &'static str {
        match self {
            ResourceKind::CpuTime => "ms",
            ResourceKind::Memory => "bytes",
            ResourceKind::FileDescriptors => "descriptors",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ceiling crossed during execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBreach {
    pub resource: ResourceKind,
    pub limit: u64,
    pub observed: u64,
}

impl ResourceBreach {
    pub fn new(resource: ResourceKind, limit: u64, observed: u64) -> Self {
        Self {
            resource,
            limit,
            observed,
        }
    }

    pub fn detail(&self) -> Value {
        json!({
            "resource": self.resource,
            "limit": self.limit,
            "observed": self.observed,
            "unit": self.resource.unit(),
        })
    }

    pub fn message(&self) -> String {
        format!(
            "{} limit exceeded: observed {} {} (limit {})",
            self.resource,
            self.observed,
            self.resource.unit(),
            self.limit
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    ForbiddenImport,
    ForbiddenBuiltin,
    ForbiddenAttribute,
    ResourceExceeded,
    Timeout,
    FileAccessDenied,
    NetworkAccessDenied,
    SyscallDenied,
    SyntaxError,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::ForbiddenImport => "forbidden-import",
            ViolationKind::ForbiddenBuiltin => "forbidden-builtin",
            ViolationKind::ForbiddenAttribute => "forbidden-attribute",
            ViolationKind::ResourceExceeded => "resource-exceeded",
            ViolationKind::Timeout => "timeout",
            ViolationKind::FileAccessDenied => "file-access-denied",
            ViolationKind::NetworkAccessDenied => "network-access-denied",
            ViolationKind::SyscallDenied => "syscall-denied",
            ViolationKind::SyntaxError => "syntax-error",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One security-relevant finding, static or runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityViolation {
    pub kind: ViolationKind,
    pub message: String,
    #[serde(default)]
    pub detail: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl SecurityViolation {
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: Value::Null,
            location: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Import of a forbidden module, reported under its original name
    pub fn forbidden_import(module: &str, alias: Option<&str>, location: SourceLocation) -> Self {
        Self::new(
            ViolationKind::ForbiddenImport,
            format!("import of module '{}' is not allowed", module),
        )
        .with_detail(json!({
            "module": module,
            "alias": alias,
            "line": location.line,
            "column": location.column,
        }))
        .at(location)
    }

    pub fn forbidden_builtin(name: &str, location: SourceLocation) -> Self {
        Self::new(
            ViolationKind::ForbiddenBuiltin,
            format!("use of '{}' is not allowed", name),
        )
        .with_detail(json!({
            "name": name,
            "line": location.line,
            "column": location.column,
        }))
        .at(location)
    }

    pub fn forbidden_attribute(attribute: &str, location: SourceLocation) -> Self {
        Self::new(
            ViolationKind::ForbiddenAttribute,
            format!("access to attribute '{}' is not allowed", attribute),
        )
        .with_detail(json!({
            "attribute": attribute,
            "line": location.line,
            "column": location.column,
        }))
        .at(location)
    }

    pub fn syntax_error(error: &SyntaxError) -> Self {
        Self::new(
            ViolationKind::SyntaxError,
            format!("syntax error: {}", error.message),
        )
        .with_detail(json!({
            "line": error.line,
            "column": error.column,
        }))
        .at(error.span())
    }

    pub fn resource_exceeded(breach: &ResourceBreach) -> Self {
        Self::new(ViolationKind::ResourceExceeded, breach.message()).with_detail(breach.detail())
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            ViolationKind::Timeout,
            format!("execution exceeded the {:?} time limit", limit),
        )
        .with_detail(json!({ "limit_ms": duration_ms(limit) }))
    }

    pub fn network_access_denied(message: impl Into<String>) -> Self {
        Self::new(ViolationKind::NetworkAccessDenied, message)
    }
}

/// Peak and average of a sampled quantity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub peak: u64,
    pub average: u64,
}

/// Resource usage summary produced by the monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Total CPU time consumed, milliseconds
    pub cpu_time_ms: u64,
    /// Resident memory, bytes
    pub memory: UsageStats,
    /// Open descriptors
    pub open_files: UsageStats,
    pub sample_count: u64,
}

/// Structured failure of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<Value>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn resource_exceeded(breach: &ResourceBreach) -> Self {
        Self::new(ErrorKind::ResourceExceeded, breach.message()).with_detail(breach.detail())
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("execution exceeded the {:?} time limit", limit),
        )
        .with_detail(json!({ "limit_ms": duration_ms(limit) }))
    }

    pub fn terminated() -> Self {
        Self::new(ErrorKind::Terminated, "execution was terminated")
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InfrastructureError, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeError, message)
    }
}

/// Everything a strategy captured, independent of the verdict
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub return_value: Option<Value>,
    pub exit_code: Option<i32>,
    pub resource_usage: ResourceUsage,
    pub violations: Vec<SecurityViolation>,
    pub warnings: Vec<String>,
}

/// Final, immutable outcome of one execution.
///
/// Built only through [`ExecutionResult::success`] and
/// [`ExecutionResult::failure`]; a successful result never carries error
/// fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    execution_id: ExecutionId,
    strategy: ExecutionStrategy,
    success: bool,
    stdout: String,
    stderr: String,
    return_value: Option<Value>,
    exit_code: Option<i32>,
    execution_time_ms: u64,
    cpu_time_ms: u64,
    peak_memory_bytes: u64,
    resource_usage: ResourceUsage,
    violations: Vec<SecurityViolation>,
    warnings: Vec<String>,
    error_kind: Option<ErrorKind>,
    error_message: Option<String>,
    error_detail: Option<Value>,
    completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    fn from_parts(
        execution_id: ExecutionId,
        strategy: ExecutionStrategy,
        output: CapturedOutput,
        error: Option<ExecutionError>,
    ) -> Self {
        let usage = output.resource_usage;
        let (error_kind, error_message, error_detail) = match error {
            Some(error) => (Some(error.kind), Some(error.message), error.detail),
            None => (None, None, None),
        };
        Self {
            execution_id,
            strategy,
            success: error_kind.is_none(),
            stdout: output.stdout,
            stderr: output.stderr,
            return_value: output.return_value,
            exit_code: output.exit_code,
            execution_time_ms: 0,
            cpu_time_ms: usage.cpu_time_ms,
            peak_memory_bytes: usage.memory.peak,
            resource_usage: usage,
            violations: output.violations,
            warnings: output.warnings,
            error_kind,
            error_message,
            error_detail,
            completed_at: Utc::now(),
        }
    }

    pub fn success(
        execution_id: ExecutionId,
        strategy: ExecutionStrategy,
        output: CapturedOutput,
    ) -> Self {
        Self::from_parts(execution_id, strategy, output, None)
    }

    pub fn failure(
        execution_id: ExecutionId,
        strategy: ExecutionStrategy,
        error: ExecutionError,
        output: CapturedOutput,
    ) -> Self {
        Self::from_parts(execution_id, strategy, output, Some(error))
    }

    pub(crate) fn with_execution_time(mut self, elapsed: Duration) -> Self {
        self.execution_time_ms = duration_ms(elapsed);
        self.completed_at = Utc::now();
        self
    }

    pub(crate) fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.return_value.as_ref()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn execution_time(&self) -> Duration {
        Duration::from_millis(self.execution_time_ms)
    }

    pub fn cpu_time(&self) -> Duration {
        Duration::from_millis(self.cpu_time_ms)
    }

    pub fn peak_memory_bytes(&self) -> u64 {
        self.peak_memory_bytes
    }

    pub fn resource_usage(&self) -> &ResourceUsage {
        &self.resource_usage
    }

    pub fn violations(&self) -> &[SecurityViolation] {
        &self.violations
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn error_detail(&self) -> Option<&Value> {
        self.error_detail.as_ref()
    }

    /// Resource sub-kind of a `resource-exceeded` failure
    pub fn resource_kind(&self) -> Option<ResourceKind> {
        if self.error_kind != Some(ErrorKind::ResourceExceeded) {
            return None;
        }
        self.error_detail
            .as_ref()
            .and_then(|detail| detail.get("resource"))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    /// Audit severity derived from the outcome
    pub fn severity(&self) -> Severity {
        self.error_kind
            .map(ErrorKind::severity)
            .unwrap_or(Severity::Info)
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_has_no_error_fields() {
        let output = CapturedOutput {
            stdout: "hi\n".into(),
            return_value: Some(json!(3)),
            ..Default::default()
        };
        let result = ExecutionResult::success(
            ExecutionId::new(),
            ExecutionStrategy::InProcess,
            output,
        )
        .with_execution_time(Duration::from_millis(12));

        assert!(result.is_success());
        assert!(result.error_kind().is_none());
        assert!(result.error_message().is_none());
        assert!(result.error_detail().is_none());
        assert_eq!(result.return_value(), Some(&json!(3)));
        assert_eq!(result.execution_time(), Duration::from_millis(12));
        assert_eq!(result.severity(), Severity::Info);
    }

    #[test]
    fn test_failure_carries_resource_kind() {
        let breach = ResourceBreach::new(ResourceKind::Memory, 1024, 4096);
        let result = ExecutionResult::failure(
            ExecutionId::new(),
            ExecutionStrategy::IsolatedProcess,
            ExecutionError::resource_exceeded(&breach),
            CapturedOutput::default(),
        );
        assert!(!result.is_success());
        assert_eq!(result.error_kind(), Some(ErrorKind::ResourceExceeded));
        assert_eq!(result.resource_kind(), Some(ResourceKind::Memory));
        assert_eq!(result.severity(), Severity::Critical);
    }

    #[test]
    fn test_violation_serialization() {
        let violation = SecurityViolation::forbidden_import("socket", Some("s"), Span::new(3, 0));
        let json = serde_json::to_value(&violation).unwrap();
        assert_eq!(json["kind"], "forbidden-import");
        assert_eq!(json["detail"]["module"], "socket");
        assert_eq!(json["location"]["line"], 3);
    }

    #[test]
    fn test_result_serializes_kebab_case_error_kind() {
        let result = ExecutionResult::failure(
            ExecutionId::new(),
            ExecutionStrategy::Container,
            ExecutionError::infrastructure("docker is not available"),
            CapturedOutput::default(),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error_kind"], "infrastructure-error");
        assert_eq!(json["strategy"], "container");
        assert_eq!(json["success"], false);
    }
}
