//! Isolation strategies
//!
//! Every strategy runs the same pipeline, provided by [`SandboxExecutor`]:
//!
//! 1. ask the permission collaborator whether the principal may execute
//! 2. run the [`CodeAnalyzer`] unless static analysis is disabled
//! 3. dispatch to the strategy, bounded by `max_execution_time`
//! 4. emit the completion audit event and stamp the execution time
//!
//! Only step 3 differs between strategies. The trait is sealed: the set of
//! strategies is closed and matches [`ExecutionStrategy`].

mod container;
mod in_process;
mod process;
mod runner;
mod workspace;

pub use container::ContainerExecutor;
pub use in_process::InProcessExecutor;
pub use process::IsolatedProcessExecutor;

pub(crate) use container::runtime_available;

use crate::analyzer::CodeAnalyzer;
use crate::config::SandboxConfiguration;
use crate::execution::ExecutionContext;
use crate::policy::{ExecutionStrategy, PermissionFailurePolicy};
use crate::types::{
    duration_ms, CapturedOutput, ErrorKind, ExecutionError, ExecutionResult, SecurityViolation,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ward_common::{
    AllowAll, AuditEvent, AuditEventKind, AuditSink, Capability, PermissionChecker,
    PermissionRequest, Severity, TracingAuditSink,
};

/// Extra time allowed past the deadline for a strategy to clean up
const CLEANUP_GRACE: Duration = Duration::from_secs(2);

/// The external permission and audit services an executor talks to
#[derive(Clone)]
pub struct Collaborators {
    pub permissions: Arc<dyn PermissionChecker>,
    pub audit: Arc<dyn AuditSink>,
}

impl Collaborators {
    pub fn new(permissions: Arc<dyn PermissionChecker>, audit: Arc<dyn AuditSink>) -> Self {
        Self { permissions, audit }
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            permissions: Arc::new(AllowAll),
            audit: Arc::new(TracingAuditSink),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

mod sealed {
    use super::{CapturedOutput, Collaborators, ExecutionError, ExecutionStrategy};
    use crate::config::SandboxConfiguration;
    use crate::execution::ExecutionContext;
    use async_trait::async_trait;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    /// Inputs of the strategy-specific step
    pub struct Dispatch<'a> {
        pub source: &'a str,
        pub context: &'a ExecutionContext,
        pub config: &'a SandboxConfiguration,
        pub deadline: Instant,
        pub cancel: CancellationToken,
    }

    /// What the strategy observed; `error` is `None` on success
    #[derive(Debug, Default)]
    pub struct Outcome {
        pub output: CapturedOutput,
        pub error: Option<ExecutionError>,
    }

    impl Outcome {
        pub fn success(output: CapturedOutput) -> Self {
            Self {
                output,
                error: None,
            }
        }

        pub fn failure(error: ExecutionError, output: CapturedOutput) -> Self {
            Self {
                output,
                error: Some(error),
            }
        }
    }

    #[async_trait]
    pub trait Strategy {
        fn collaborators(&self) -> &Collaborators;

        fn kind(&self) -> ExecutionStrategy;

        async fn dispatch(&self, run: Dispatch<'_>) -> Outcome;
    }
}

pub(crate) use sealed::{Dispatch, Outcome};

/// A concrete isolation strategy.
///
/// `execute` never fails for problems of the executed program; every
/// failure mode is encoded in the returned [`ExecutionResult`].
#[async_trait]
pub trait SandboxExecutor: sealed::Strategy + Send + Sync {
    fn strategy(&self) -> ExecutionStrategy {
        self.kind()
    }

    async fn execute(
        &self,
        source: &str,
        context: &ExecutionContext,
        config: &SandboxConfiguration,
    ) -> ExecutionResult {
        self.execute_with_cancel(source, context, config, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute); cancelling `cancel` terminates the run
    async fn execute_with_cancel(
        &self,
        source: &str,
        context: &ExecutionContext,
        config: &SandboxConfiguration,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let deadline = started + config.limits.max_execution_time;
        let strategy = self.kind();
        let id = context.execution_id;
        let collaborators = self.collaborators();

        info!(
            execution_id = %id,
            strategy = %strategy,
            principal = %context.principal_id,
            code_len = source.len(),
            "Executing code"
        );

        let mut warnings = Vec::new();
        match authorize(collaborators, context, config, deadline).await {
            Ok(Some(warning)) => warnings.push(warning),
            Ok(None) => {}
            Err(error) => {
                warn!(execution_id = %id, reason = %error.message, "Execution denied");
                let output = CapturedOutput {
                    warnings,
                    ..Default::default()
                };
                let result = ExecutionResult::failure(id, strategy, error, output)
                    .with_execution_time(started.elapsed());
                audit_completion(collaborators, context, config, &result).await;
                return result;
            }
        }

        emit(
            collaborators,
            context,
            config,
            AuditEventKind::ExecutionStarted,
            Severity::Info,
            json!({ "strategy": strategy }),
        )
        .await;

        if config.enable_static_analysis {
            let violations = CodeAnalyzer::new(config).analyze(source);
            if !violations.is_empty() {
                info!(
                    execution_id = %id,
                    violations = violations.len(),
                    "Static analysis rejected the program"
                );
                report_violations(collaborators, context, config, &violations).await;
                let error = ExecutionError::new(
                    ErrorKind::StaticAnalysisFailed,
                    summarize(&violations),
                )
                .with_detail(json!({ "sub_kind": violations[0].kind }));
                let output = CapturedOutput {
                    violations,
                    warnings,
                    ..Default::default()
                };
                let result = ExecutionResult::failure(id, strategy, error, output)
                    .with_execution_time(started.elapsed());
                audit_completion(collaborators, context, config, &result).await;
                return result;
            }
        } else {
            debug!(execution_id = %id, "Static analysis disabled");
        }

        let run = Dispatch {
            source,
            context,
            config,
            deadline,
            cancel,
        };
        let outcome =
            match tokio::time::timeout_at(deadline + CLEANUP_GRACE, self.dispatch(run)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(execution_id = %id, "Strategy overran its deadline");
                    let limit = config.limits.max_execution_time;
                    Outcome::failure(
                        ExecutionError::timeout(limit),
                        CapturedOutput {
                            violations: vec![SecurityViolation::timeout(limit)],
                            ..Default::default()
                        },
                    )
                }
            };

        let Outcome { mut output, error } = outcome;
        report_violations(collaborators, context, config, &output.violations).await;
        warnings.append(&mut output.warnings);
        output.warnings = warnings;

        let result = match error {
            None => ExecutionResult::success(id, strategy, output),
            Some(error) => ExecutionResult::failure(id, strategy, error, output),
        }
        .with_execution_time(started.elapsed());

        info!(
            execution_id = %id,
            success = result.is_success(),
            error_kind = ?result.error_kind(),
            elapsed_ms = duration_ms(result.execution_time()),
            "Execution finished"
        );
        audit_completion(collaborators, context, config, &result).await;
        result
    }
}

impl<T: sealed::Strategy + Send + Sync> SandboxExecutor for T {}

/// Build the executor for `strategy`
pub fn executor_for(
    strategy: ExecutionStrategy,
    collaborators: Collaborators,
) -> Arc<dyn SandboxExecutor> {
    match strategy {
        ExecutionStrategy::InProcess => Arc::new(InProcessExecutor::new(collaborators)),
        ExecutionStrategy::IsolatedProcess => {
            Arc::new(IsolatedProcessExecutor::new(collaborators))
        }
        ExecutionStrategy::Container => Arc::new(ContainerExecutor::new(collaborators)),
    }
}

/// Time left for a collaborator call
fn collaborator_budget(config: &SandboxConfiguration, deadline: Instant) -> Duration {
    config
        .collaborator_timeout
        .min(deadline.saturating_duration_since(Instant::now()))
}

/// `Ok(Some(warning))` when allowed only because the checker was unreachable
async fn authorize(
    collaborators: &Collaborators,
    context: &ExecutionContext,
    config: &SandboxConfiguration,
    deadline: Instant,
) -> Result<Option<String>, ExecutionError> {
    if !context.has_capability(Capability::SandboxExecution) {
        return Err(ExecutionError::new(
            ErrorKind::PermissionDenied,
            "execution context lacks the sandbox-execution capability",
        ));
    }

    let request = PermissionRequest::execute(context.principal_id.clone());
    let budget = collaborator_budget(config, deadline);
    let unreachable = match tokio::time::timeout(
        budget,
        collaborators.permissions.check_permission(&request),
    )
    .await
    {
        Ok(Ok(decision)) if decision.granted => return Ok(None),
        Ok(Ok(decision)) => {
            let reason = decision
                .reason
                .unwrap_or_else(|| "permission denied".to_string());
            return Err(ExecutionError::new(ErrorKind::PermissionDenied, reason)
                .with_detail(json!({ "resource": request.resource, "action": request.action })));
        }
        Ok(Err(err)) if err.is_unreachable() => err.to_string(),
        Ok(Err(err)) => {
            return Err(ExecutionError::new(
                ErrorKind::PermissionDenied,
                format!("permission check failed: {}", err),
            ))
        }
        Err(_) => format!("permission check timed out after {:?}", budget),
    };

    match config.effective_permission_failure_policy() {
        PermissionFailurePolicy::Deny => Err(ExecutionError::new(
            ErrorKind::PermissionDenied,
            format!("permission checker unreachable: {}", unreachable),
        )
        .with_detail(json!({ "unreachable": true }))),
        PermissionFailurePolicy::AllowWithWarning => {
            warn!(
                execution_id = %context.execution_id,
                reason = %unreachable,
                "Permission checker unreachable, allowing under {} mode",
                config.mode
            );
            Ok(Some(format!(
                "permission checker unreachable ({}); allowed under {} mode",
                unreachable, config.mode
            )))
        }
    }
}

/// Best-effort audit emission; failures are logged, never propagated
async fn emit(
    collaborators: &Collaborators,
    context: &ExecutionContext,
    config: &SandboxConfiguration,
    kind: AuditEventKind,
    severity: Severity,
    detail: serde_json::Value,
) {
    emit_event(
        collaborators,
        config,
        AuditEvent::new(
            kind,
            context.execution_id.to_string(),
            context.principal_id.clone(),
            context.session_id.clone(),
            severity,
        )
        .with_detail(detail),
    )
    .await;
}

async fn emit_event(collaborators: &Collaborators, config: &SandboxConfiguration, event: AuditEvent) {
    if !config.enable_audit_logging {
        return;
    }
    let kind = event.event_kind;
    match tokio::time::timeout(config.collaborator_timeout, collaborators.audit.emit(event)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(event = kind.as_str(), "Audit emission failed: {}", err),
        Err(_) => warn!(event = kind.as_str(), "Audit emission timed out"),
    }
}

async fn report_violations(
    collaborators: &Collaborators,
    context: &ExecutionContext,
    config: &SandboxConfiguration,
    violations: &[SecurityViolation],
) {
    for violation in violations {
        let detail = serde_json::to_value(violation).unwrap_or_default();
        emit(
            collaborators,
            context,
            config,
            AuditEventKind::SecurityViolation,
            Severity::Critical,
            detail,
        )
        .await;
    }
}

pub(crate) async fn audit_completion(
    collaborators: &Collaborators,
    context: &ExecutionContext,
    config: &SandboxConfiguration,
    result: &ExecutionResult,
) {
    let event = AuditEvent::new(
        AuditEventKind::ExecutionCompleted,
        context.execution_id.to_string(),
        context.principal_id.clone(),
        context.session_id.clone(),
        result.severity(),
    )
    .with_duration_ms(duration_ms(result.execution_time()))
    .with_detail(json!({
        "strategy": result.strategy(),
        "success": result.is_success(),
        "error_kind": result.error_kind(),
        "violations": result.violations().len(),
    }));
    emit_event(collaborators, config, event).await;
}

fn summarize(violations: &[SecurityViolation]) -> String {
    match violations {
        [only] => only.message.clone(),
        [first, rest @ ..] => format!("{} (and {} more)", first.message, rest.len()),
        [] => "static analysis failed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SandboxMode;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use ward_common::{
        CollaboratorError, CollaboratorResult, DenyAll, MemoryAuditSink, PermissionDecision,
    };

    struct Unreachable;

    #[async_trait]
    impl PermissionChecker for Unreachable {
        async fn check_permission(
            &self,
            _request: &PermissionRequest,
        ) -> CollaboratorResult<PermissionDecision> {
            Err(CollaboratorError::Unavailable("connection refused".into()))
        }
    }

    struct Hanging;

    #[async_trait]
    impl PermissionChecker for Hanging {
        async fn check_permission(
            &self,
            _request: &PermissionRequest,
        ) -> CollaboratorResult<PermissionDecision> {
            std::future::pending().await
        }
    }

    fn collaborators(permissions: Arc<dyn PermissionChecker>) -> (Collaborators, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        (Collaborators::new(permissions, sink.clone()), sink)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[tokio::test]
    async fn test_denied_by_checker() {
        let (collaborators, _) = collaborators(Arc::new(DenyAll));
        let config = SandboxConfiguration::permissive();
        let err = authorize(&collaborators, &ExecutionContext::new(), &config, deadline())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_unreachable_checker_follows_mode_policy() {
        let (collaborators, _) = collaborators(Arc::new(Unreachable));
        let context = ExecutionContext::new();

        let strict = SandboxConfiguration::strict();
        let err = authorize(&collaborators, &context, &strict, deadline())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
        assert_eq!(err.detail, Some(json!({ "unreachable": true })));

        let permissive = SandboxConfiguration::permissive();
        let warning = authorize(&collaborators, &context, &permissive, deadline())
            .await
            .unwrap();
        assert_matches!(warning, Some(text) if text.contains("unreachable"));

        let overridden = SandboxConfiguration::for_mode(SandboxMode::Development)
            .with_permission_failure_policy(PermissionFailurePolicy::Deny);
        assert!(authorize(&collaborators, &context, &overridden, deadline())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_hanging_checker_is_bounded() {
        let (collaborators, _) = collaborators(Arc::new(Hanging));
        let config = SandboxConfiguration::strict()
            .with_collaborator_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = authorize(&collaborators, &ExecutionContext::new(), &config, deadline())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_capability_is_denied_without_asking() {
        let (collaborators, _) = collaborators(Arc::new(AllowAll));
        let mut context = ExecutionContext::new();
        context.capabilities.clear();
        let err = authorize(
            &collaborators,
            &context,
            &SandboxConfiguration::permissive(),
            deadline(),
        )
        .await
        .unwrap_err();
        assert!(err.message.contains("sandbox-execution"));
    }

    #[tokio::test]
    async fn test_audit_disabled_emits_nothing() {
        let (collaborators, sink) = collaborators(Arc::new(AllowAll));
        let config = SandboxConfiguration::permissive().with_audit_logging(false);
        emit(
            &collaborators,
            &ExecutionContext::new(),
            &config,
            AuditEventKind::ExecutionStarted,
            Severity::Info,
            json!({}),
        )
        .await;
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_summarize() {
        let one = SecurityViolation::new(crate::types::ViolationKind::ForbiddenImport, "a");
        let two = SecurityViolation::new(crate::types::ViolationKind::ForbiddenBuiltin, "b");
        assert_eq!(summarize(&[one.clone()]), "a");
        assert_eq!(summarize(&[one, two]), "a (and 1 more)");
    }
}
