//! Process-wide manager lifecycle.
//!
//! Lives in its own test binary: the global slot is shared by every test in
//! a process and shutdown is permanent.

use anyhow::Result;
use assert_matches::assert_matches;
use std::sync::Arc;
use ward_sandbox::{global, ErrorKind, SandboxConfiguration, SandboxError, SandboxManager};
use ward_tests::common::{setup_test_logging, wait_for_active, SPIN};

#[tokio::test]
async fn install_use_and_shut_down() -> Result<()> {
    setup_test_logging();
    let manager = SandboxManager::builder()
        .config(SandboxConfiguration::permissive())
        .build()?;
    let installed = global::install(manager)?;
    let current = global::global()?;
    assert!(Arc::ptr_eq(&installed, &current));

    let second = SandboxManager::builder().build()?;
    assert_matches!(global::install(second), Err(SandboxError::AlreadyInstalled));

    let result = current.execute("2 ** 10", None, None).await?;
    assert_eq!(result.return_value(), Some(&serde_json::json!(1024)));

    let running = tokio::spawn(async move { installed.execute(SPIN, None, None).await });
    wait_for_active(&current, 1).await;

    assert_eq!(global::shutdown(), 1);
    let result = running.await??;
    assert_eq!(result.error_kind(), Some(ErrorKind::Terminated));

    assert_matches!(global::global(), Err(SandboxError::ShutDown));
    assert_eq!(global::shutdown(), 0);
    let late = SandboxManager::builder().build()?;
    assert_matches!(global::install(late), Err(SandboxError::ShutDown));
    Ok(())
}
