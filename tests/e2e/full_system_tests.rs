//! End-to-end runs through every layer: configuration file, manager,
//! selector, executor and collaborators

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;
use ward_common::{AuditEventKind, MemoryAuditSink, Severity, StaticPermissions, EXECUTE_RESOURCE};
use ward_sandbox::{
    ContainerSettings, ErrorKind, ExecutionContext, ExecutionStrategy, SandboxConfiguration,
    SandboxManager, SandboxMode, ViolationKind,
};
use ward_tests::common::{docker_available, python_available, test_manager};

#[tokio::test]
#[traced_test]
async fn pipeline_logs_and_audits_a_successful_run() -> Result<()> {
    let (manager, audit) = test_manager(SandboxConfiguration::development());

    let context = ExecutionContext::new().with_principal("e2e");
    let id = context.execution_id.to_string();
    let source = "\
def fib(n):
    a, b = 0, 1
    for _ in range(n):
        a, b = b, a + b
    return a

values = [fib(n) for n in range(10)]
print(values[-1])
{'count': len(values), 'last': values[-1]}
";
    let result = manager.execute(source, Some(context), None).await?;

    assert!(result.is_success(), "{:?}", result.error_message());
    assert_eq!(result.strategy(), ExecutionStrategy::InProcess);
    assert_eq!(result.stdout(), "34\n");
    assert_eq!(result.return_value(), Some(&json!({"count": 10, "last": 34})));
    assert!(result.warnings().is_empty());

    assert!(logs_contain("Executing code"));
    assert!(logs_contain("Execution finished"));

    let events = audit.events();
    let completed = audit.events_for(&id, AuditEventKind::ExecutionCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].severity, Severity::Info);
    assert_eq!(completed[0].principal_id.as_str(), "e2e");
    assert!(completed[0].duration_ms.is_some());
    assert!(events
        .iter()
        .all(|event| event.event_kind != AuditEventKind::SecurityViolation));
    Ok(())
}

#[tokio::test]
async fn configuration_file_drives_the_manager() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("sandbox.toml");
    std::fs::write(
        &path,
        r#"
mode = "permissive"
execution_strategy = "in-process"
max_execution_time = "750ms"
forbidden_attributes = ["secret"]
"#,
    )?;

    let config = SandboxConfiguration::load(&path)?;
    assert_eq!(config.mode, SandboxMode::Permissive);
    assert_eq!(config.limits.max_execution_time, Duration::from_millis(750));
    assert!(config.enable_static_analysis);

    let manager = SandboxManager::builder().config(config.clone()).build()?;

    let result = manager.execute("value = config.secret", None, None).await?;
    assert_eq!(result.error_kind(), Some(ErrorKind::StaticAnalysisFailed));
    assert_eq!(result.violations()[0].kind, ViolationKind::ForbiddenAttribute);

    let result = manager
        .execute("while True:\n    pass\n", None, None)
        .await?;
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(result.execution_time() < Duration::from_millis(750 + 1500));

    let saved = dir.path().join("saved.toml");
    std::fs::write(&saved, config.to_toml_string()?)?;
    assert_eq!(SandboxConfiguration::load(&saved)?, config);
    Ok(())
}

#[tokio::test]
async fn permissions_gate_each_principal() -> Result<()> {
    let audit = Arc::new(MemoryAuditSink::new());
    let manager = SandboxManager::builder()
        .config(SandboxConfiguration::permissive())
        .permission_checker(Arc::new(
            StaticPermissions::new().grant("analyst", EXECUTE_RESOURCE),
        ))
        .audit_sink(audit.clone())
        .build()?;

    let allowed = manager
        .execute(
            "6 * 7",
            Some(ExecutionContext::new().with_principal("analyst")),
            None,
        )
        .await?;
    assert_eq!(allowed.return_value(), Some(&json!(42)));

    let denied_context = ExecutionContext::new().with_principal("guest");
    let denied_id = denied_context.execution_id.to_string();
    let denied = manager.execute("6 * 7", Some(denied_context), None).await?;
    assert_eq!(denied.error_kind(), Some(ErrorKind::PermissionDenied));
    assert_eq!(denied.return_value(), None);

    let completed = audit.events_for(&denied_id, AuditEventKind::ExecutionCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].severity, Severity::Critical);
    Ok(())
}

#[tokio::test]
async fn strict_mode_runs_out_of_process() -> Result<()> {
    if !python_available() {
        return Ok(());
    }
    let (manager, _) = test_manager(SandboxConfiguration::strict());

    let result = manager.execute("sum(range(101))", None, None).await?;
    assert!(result.is_success(), "{:?}", result.error_message());
    assert_eq!(result.strategy(), ExecutionStrategy::IsolatedProcess);
    assert_eq!(result.return_value(), Some(&json!(5050)));

    // strict mode only allows a short list of modules
    let result = manager.execute("import pathlib", None, None).await?;
    assert_eq!(result.error_kind(), Some(ErrorKind::StaticAnalysisFailed));
    Ok(())
}

#[tokio::test]
async fn missing_container_runtime_is_refused() -> Result<()> {
    let (manager, audit) = test_manager(SandboxConfiguration::strict());
    let config = SandboxConfiguration::strict()
        .with_strategy(ExecutionStrategy::Container)
        .with_container(ContainerSettings {
            runtime: "ward-missing-runtime".to_string(),
            ..ContainerSettings::default()
        });

    let context = ExecutionContext::new();
    let id = context.execution_id.to_string();
    let result = manager.execute("1", Some(context), Some(config)).await?;

    assert_eq!(result.error_kind(), Some(ErrorKind::InfrastructureError));
    assert_eq!(result.strategy(), ExecutionStrategy::Container);
    assert!(result
        .error_message()
        .is_some_and(|message| message.contains("ward-missing-runtime")));
    assert_eq!(
        audit
            .events_for(&id, AuditEventKind::ExecutionCompleted)
            .len(),
        1
    );
    assert!(manager.get_active_executions().is_empty());
    Ok(())
}

#[tokio::test]
async fn container_strategy_runs_when_runtime_is_present() -> Result<()> {
    if !docker_available() {
        return Ok(());
    }
    let (manager, _) = test_manager(SandboxConfiguration::strict());
    let config = SandboxConfiguration::strict()
        .with_strategy(ExecutionStrategy::Container)
        .with_max_execution_time(Duration::from_secs(60));

    let result = manager.execute("print('inside')\n1 + 2\n", None, Some(config)).await?;
    assert_eq!(result.strategy(), ExecutionStrategy::Container);
    // an unpulled image surfaces as an infrastructure failure, never a downgrade
    match result.error_kind() {
        None => {
            assert_eq!(result.stdout(), "inside\n");
            assert_eq!(result.return_value(), Some(&json!(3)));
        }
        Some(kind) => assert_eq!(kind, ErrorKind::InfrastructureError),
    }
    Ok(())
}
