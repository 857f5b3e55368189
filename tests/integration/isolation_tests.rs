//! Isolated-process strategy driven through the manager

use anyhow::Result;
use serde_json::json;
use std::time::Duration;
use ward_common::AuditEventKind;
use ward_sandbox::{
    ErrorKind, ExecutionContext, ExecutionStrategy, ResourceKind, SandboxConfiguration,
};
use ward_tests::common::{python_available, setup_test_logging, test_manager, wait_for_active, SPIN};

fn isolated() -> SandboxConfiguration {
    SandboxConfiguration::restricted()
}

#[tokio::test]
async fn isolated_process_returns_output_and_value() -> Result<()> {
    if !python_available() {
        return Ok(());
    }
    setup_test_logging();
    let (manager, _) = test_manager(isolated());

    let source = "words = ['ward', 'sandbox']\nprint(len(words))\n' '.join(words)\n";
    let result = manager.execute(source, None, None).await?;

    assert!(result.is_success(), "{:?}", result.error_message());
    assert_eq!(result.strategy(), ExecutionStrategy::IsolatedProcess);
    assert_eq!(result.stdout(), "2\n");
    assert_eq!(result.return_value(), Some(&json!("ward sandbox")));
    assert_eq!(result.exit_code(), Some(0));
    Ok(())
}

#[tokio::test]
async fn isolated_process_reports_uncaught_error() -> Result<()> {
    if !python_available() {
        return Ok(());
    }
    let (manager, _) = test_manager(isolated());

    let result = manager
        .execute("print('before')\n{}['missing']\n", None, None)
        .await?;

    assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError));
    assert_eq!(result.stdout(), "before\n");
    assert!(result
        .error_message()
        .is_some_and(|message| message.contains("KeyError")));
    assert_ne!(result.exit_code(), Some(0));
    Ok(())
}

#[tokio::test]
async fn isolated_process_is_killed_at_deadline() -> Result<()> {
    if !python_available() {
        return Ok(());
    }
    let (manager, _) = test_manager(isolated());
    let config = isolated().with_max_execution_time(Duration::from_millis(500));

    let result = manager.execute(SPIN, None, Some(config)).await?;

    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(result.execution_time() >= Duration::from_millis(500));
    assert!(result.execution_time() < Duration::from_millis(500 + 2500));
    assert!(manager.get_active_executions().is_empty());
    Ok(())
}

#[tokio::test]
async fn isolated_process_memory_ceiling() -> Result<()> {
    if !python_available() {
        return Ok(());
    }
    let (manager, audit) = test_manager(isolated());
    let config = isolated().with_max_memory(128 * 1024 * 1024);

    let context = ExecutionContext::new();
    let id = context.execution_id.to_string();
    let result = manager
        .execute(
            "blocks = [bytearray(16 * 1024 * 1024) for _ in range(64)]\n",
            Some(context),
            Some(config),
        )
        .await?;

    assert_eq!(result.error_kind(), Some(ErrorKind::ResourceExceeded));
    assert_eq!(result.resource_kind(), Some(ResourceKind::Memory));
    assert_eq!(
        audit
            .events_for(&id, AuditEventKind::ExecutionCompleted)
            .len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn terminate_execution_kills_the_process() -> Result<()> {
    if !python_available() {
        return Ok(());
    }
    let (manager, _) = test_manager(isolated());
    let context = ExecutionContext::new();
    let id = context.execution_id;

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute(SPIN, Some(context), None).await })
    };

    wait_for_active(&manager, 1).await;
    let active = manager.get_active_executions();
    assert_eq!(active[0].execution_id(), id);
    assert_eq!(active[0].strategy, ExecutionStrategy::IsolatedProcess);

    assert!(manager.terminate_execution(id));
    let result = tokio::time::timeout(Duration::from_secs(5), task).await???;

    assert_eq!(result.error_kind(), Some(ErrorKind::Terminated));
    assert!(manager.get_active_executions().is_empty());
    assert!(!manager.terminate_execution(id));
    Ok(())
}

#[tokio::test]
async fn environment_is_replaced_by_context() -> Result<()> {
    if !python_available() {
        return Ok(());
    }
    let (manager, _) = test_manager(isolated());
    let config = isolated().with_forbidden_imports(Vec::<String>::new());
    let context = ExecutionContext::new().with_env("WARD_GREETING", "hello");

    let source = "import os\n(os.environ.get('WARD_GREETING'), os.environ.get('HOME'))\n";
    let result = manager.execute(source, Some(context), Some(config)).await?;

    assert!(result.is_success(), "{:?}", result.error_message());
    assert_eq!(result.return_value(), Some(&json!(["hello", null])));
    Ok(())
}
