//! Integration tests for the manager pipeline on the in-process strategy

use anyhow::Result;
use assert_matches::assert_matches;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use ward_common::{
    AuditEventKind, CollaboratorError, CollaboratorResult, DenyAll, PermissionChecker,
    PermissionDecision, PermissionRequest, Severity,
};
use ward_sandbox::{
    CodeAnalyzer, ErrorKind, ExecutionContext, SandboxConfiguration, SandboxError, SandboxManager,
    SandboxMode, ViolationKind,
};
use ward_tests::common::{setup_test_logging, test_manager, wait_for_active, SPIN};

#[tokio::test]
async fn forbidden_import_is_rejected_before_running() -> Result<()> {
    setup_test_logging();
    let config = SandboxConfiguration::permissive().with_forbidden_imports(["socket"]);
    let (manager, audit) = test_manager(config);

    let context = ExecutionContext::new();
    let id = context.execution_id.to_string();
    let result = manager.execute("import socket", Some(context), None).await?;

    assert!(!result.is_success());
    assert_eq!(result.error_kind(), Some(ErrorKind::StaticAnalysisFailed));
    assert_eq!(result.violations().len(), 1);
    let violation = &result.violations()[0];
    assert_eq!(violation.kind, ViolationKind::ForbiddenImport);
    assert_eq!(violation.detail["module"], "socket");
    assert_eq!(violation.location.map(|location| location.line), Some(1));

    assert_eq!(
        audit
            .events_for(&id, AuditEventKind::SecurityViolation)
            .len(),
        1
    );
    let completed = audit.events_for(&id, AuditEventKind::ExecutionCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].severity, Severity::Critical);
    Ok(())
}

#[tokio::test]
async fn simple_expression_succeeds() -> Result<()> {
    let (manager, audit) = test_manager(SandboxConfiguration::permissive());

    let context = ExecutionContext::new();
    let id = context.execution_id.to_string();
    let result = manager.execute("1 + 2", Some(context), None).await?;

    assert!(result.is_success());
    assert_eq!(result.return_value(), Some(&json!(3)));
    assert!(result.violations().is_empty());
    assert_eq!(result.error_kind(), None);
    assert_eq!(result.error_message(), None);

    let kinds: Vec<AuditEventKind> = audit
        .events()
        .into_iter()
        .filter(|event| event.execution_id == id)
        .map(|event| event.event_kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            AuditEventKind::ExecutionStarted,
            AuditEventKind::ExecutionCompleted
        ]
    );
    Ok(())
}

#[tokio::test]
async fn formatted_strings_run_cleanly() -> Result<()> {
    let (manager, _) = test_manager(SandboxConfiguration::permissive());
    let result = manager
        .execute("x = 2.5\nprint(f'{x:.2f}')\nf'{x!r}|{x:>5}'\n", None, None)
        .await?;

    assert!(result.is_success(), "{:?}", result.violations());
    assert!(result.violations().is_empty());
    assert_eq!(result.stdout(), "2.50\n");
    assert_eq!(result.return_value(), Some(&json!("2.5|  2.5")));
    Ok(())
}

#[tokio::test]
async fn dunder_attribute_is_flagged_without_import() -> Result<()> {
    let (manager, _) = test_manager(SandboxConfiguration::permissive());
    let result = manager
        .execute("x = ().__class__", None, None)
        .await?;

    assert_eq!(result.error_kind(), Some(ErrorKind::StaticAnalysisFailed));
    assert!(result
        .violations()
        .iter()
        .all(|violation| violation.kind == ViolationKind::ForbiddenAttribute));
    assert_eq!(result.violations()[0].detail["attribute"], "__class__");
    Ok(())
}

#[tokio::test]
async fn concurrent_executions_are_registered_independently() -> Result<()> {
    let (manager, _) = test_manager(SandboxConfiguration::permissive());
    let slow = ExecutionContext::new();
    let fast = ExecutionContext::new();
    let (slow_id, fast_id) = (slow.execution_id, fast.execution_id);

    let slow_task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute(SPIN, Some(slow), None).await })
    };
    let fast_task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute(SPIN, Some(fast), None).await })
    };

    wait_for_active(&manager, 2).await;
    let active: Vec<_> = manager
        .get_active_executions()
        .into_iter()
        .map(|execution| execution.execution_id())
        .collect();
    assert!(active.contains(&slow_id) && active.contains(&fast_id));

    // the second one started finishes first
    assert!(manager.terminate_execution(fast_id));
    fast_task.await??;
    wait_for_active(&manager, 1).await;
    assert_eq!(manager.get_active_executions()[0].execution_id(), slow_id);

    assert!(manager.terminate_execution(slow_id));
    let result = slow_task.await??;
    assert_eq!(result.error_kind(), Some(ErrorKind::Terminated));
    assert!(manager.get_active_executions().is_empty());
    Ok(())
}

#[tokio::test]
async fn analysis_is_deterministic() {
    let analyzer = CodeAnalyzer::new(&SandboxConfiguration::strict());
    let source = "\
import json
def helper(value):
    if value:
        import subprocess
    return getattr(value, 'x')
";
    let first = analyzer.analyze(source);
    let second = analyzer.analyze(source);
    assert_eq!(first, second);
    assert!(first.iter().any(|violation| {
        violation.kind == ViolationKind::ForbiddenImport
            && violation.detail["module"] == "subprocess"
            && violation.location.map(|location| location.line) == Some(4)
    }));
    assert!(first
        .iter()
        .any(|violation| violation.kind == ViolationKind::ForbiddenBuiltin));

    assert!(analyzer.analyze("total = sum([1, 2, 3])\n").is_empty());
}

#[tokio::test]
async fn permission_denial_short_circuits() -> Result<()> {
    let audit = Arc::new(ward_common::MemoryAuditSink::new());
    let manager = SandboxManager::builder()
        .config(SandboxConfiguration::permissive())
        .permission_checker(Arc::new(DenyAll))
        .audit_sink(audit.clone())
        .build()?;

    let context = ExecutionContext::new().with_principal("mallory");
    let id = context.execution_id.to_string();
    let result = manager.execute("print('hi')", Some(context), None).await?;

    assert_eq!(result.error_kind(), Some(ErrorKind::PermissionDenied));
    assert_eq!(result.stdout(), "");
    assert!(audit
        .events_for(&id, AuditEventKind::ExecutionStarted)
        .is_empty());
    assert_eq!(
        audit
            .events_for(&id, AuditEventKind::ExecutionCompleted)
            .len(),
        1
    );
    Ok(())
}

struct Offline;

#[async_trait::async_trait]
impl PermissionChecker for Offline {
    async fn check_permission(
        &self,
        _request: &PermissionRequest,
    ) -> CollaboratorResult<PermissionDecision> {
        Err(CollaboratorError::Unavailable("authorization service offline".into()))
    }
}

#[tokio::test]
async fn unreachable_permission_service_depends_on_mode() -> Result<()> {
    let manager = SandboxManager::builder()
        .permission_checker(Arc::new(Offline))
        .build()?;

    let permissive = SandboxConfiguration::permissive();
    let result = manager.execute("1", None, Some(permissive)).await?;
    assert!(result.is_success());
    assert!(result
        .warnings()
        .iter()
        .any(|warning| warning.contains("unreachable")));

    let strict = SandboxConfiguration::for_mode(SandboxMode::Strict);
    let result = manager.execute("1", None, Some(strict)).await?;
    assert_eq!(result.error_kind(), Some(ErrorKind::PermissionDenied));
    Ok(())
}

#[tokio::test]
async fn timeout_is_reported_within_budget() -> Result<()> {
    let (manager, _) = test_manager(SandboxConfiguration::permissive());
    let config = SandboxConfiguration::permissive()
        .with_max_execution_time(Duration::from_millis(300));

    let result = manager.execute(SPIN, None, Some(config)).await?;
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(result.execution_time() >= Duration::from_millis(300));
    assert!(result.execution_time() < Duration::from_millis(300 + 1500));
    assert!(manager.get_active_executions().is_empty());
    Ok(())
}

#[tokio::test]
async fn configuration_loads_from_toml_file() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(
        file,
        r#"
mode = "permissive"
max_execution_time = "2s"
max_memory = 67108864
forbidden_imports = ["socket", "os"]
"#
    )?;
    let config = SandboxConfiguration::load(file.path())?;
    assert_eq!(config.mode, SandboxMode::Permissive);
    assert_eq!(config.limits.max_execution_time, Duration::from_secs(2));
    assert_eq!(config.limits.max_memory, 64 * 1024 * 1024);

    let (manager, _) = test_manager(config);
    let result = manager.execute("import os", None, None).await?;
    assert_eq!(result.error_kind(), Some(ErrorKind::StaticAnalysisFailed));
    Ok(())
}

#[tokio::test]
async fn invalid_configuration_is_a_contract_error() {
    let (manager, _) = test_manager(SandboxConfiguration::permissive());
    let config = SandboxConfiguration::permissive().with_max_execution_time(Duration::ZERO);
    let err = manager.execute("1", None, Some(config)).await.unwrap_err();
    assert_matches!(err, SandboxError::InvalidConfiguration(_));
}
