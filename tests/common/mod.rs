//! Common test utilities shared across integration and E2E tests

use std::path::PathBuf;
use std::sync::Arc;
use ward_common::MemoryAuditSink;
use ward_sandbox::{SandboxConfiguration, SandboxManager};

/// Program that never finishes on its own
pub const SPIN: &str = "while True:\n    pass\n";

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ward_sandbox=debug,ward=info")
        .with_test_writer()
        .try_init();
}

fn find_program(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Whether the isolated-process strategy can run here
pub fn python_available() -> bool {
    find_program("python3").is_some()
}

/// Whether a container runtime answers `docker info`
pub fn docker_available() -> bool {
    find_program("docker").is_some()
        && std::process::Command::new("docker")
            .arg("info")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
}

/// Manager with `config` as default and an in-memory audit trail
pub fn test_manager(config: SandboxConfiguration) -> (Arc<SandboxManager>, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let manager = SandboxManager::builder()
        .config(config)
        .audit_sink(audit.clone())
        .build()
        .expect("test configuration is valid");
    (Arc::new(manager), audit)
}

/// Poll until `manager` reports `count` active executions
pub async fn wait_for_active(manager: &SandboxManager, count: usize) {
    for _ in 0..300 {
        if manager.active_count() == count {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} active executions, found {}",
        count,
        manager.active_count()
    );
}
