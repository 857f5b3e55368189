//! Security policy demonstration
//!
//! Shows how modes, static analysis and the permission collaborator gate
//! what a program may do

use std::sync::Arc;
use ward_sandbox::ward_common::{MemoryAuditSink, StaticPermissions, EXECUTE_RESOURCE};
use ward_sandbox::{
    CodeAnalyzer, ExecutionContext, ExecutionStrategy, SandboxConfiguration, SandboxManager,
    SandboxMode,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== Security Policy Demonstration ===\n");

    // Test 1: Static analysis of hostile programs
    println!("1. Static Analysis (strict mode):");
    let analyzer = CodeAnalyzer::new(&SandboxConfiguration::strict());
    let programs = [
        "import socket",
        "import os.path as p",
        "eval('1 + 1')",
        "().__class__.__bases__[0].__subclasses__()",
        "f\"{__import__('os').getcwd()}\"",
        "total = sum(range(10))",
    ];
    for program in programs {
        let violations = analyzer.analyze(program);
        if violations.is_empty() {
            println!("   ✓ {:<45} clean", program);
        }
        for violation in violations {
            println!("   ✗ {:<45} {}: {}", program, violation.kind, violation.message);
        }
    }

    // Test 2: Permission collaborator
    println!("\n2. Permission Collaborator:");
    let audit = Arc::new(MemoryAuditSink::new());
    let permissions = StaticPermissions::new().grant("analyst", EXECUTE_RESOURCE);
    let manager = SandboxManager::builder()
        .config(SandboxConfiguration::permissive())
        .permission_checker(Arc::new(permissions))
        .audit_sink(audit.clone())
        .build()?;

    for principal in ["analyst", "guest"] {
        let context = ExecutionContext::new().with_principal(principal);
        let result = manager.execute("6 * 7", Some(context), None).await?;
        match result.error_message() {
            None => println!(
                "   ✓ {:<8} allowed, value = {}",
                principal,
                result.return_value().cloned().unwrap_or_default()
            ),
            Some(message) => println!("   ✗ {:<8} denied: {}", principal, message),
        }
    }
    println!("   Audit events recorded: {}", audit.events().len());

    // Test 3: Mode presets
    println!("\n3. Mode Presets:");
    println!("   ┌─────────────┬──────────────────┬─────────┬──────────┬──────────┐");
    println!("   │ Mode        │ Strategy         │ Time    │ CPU      │ Memory   │");
    println!("   ├─────────────┼──────────────────┼─────────┼──────────┼──────────┤");
    for mode in [
        SandboxMode::Strict,
        SandboxMode::Restricted,
        SandboxMode::Permissive,
        SandboxMode::Development,
    ] {
        let config = SandboxConfiguration::for_mode(mode);
        println!(
            "   │ {:<11} │ {:<16} │ {:>5}s  │ {:>6}s  │ {:>5}MiB │",
            mode.to_string(),
            config.execution_strategy.to_string(),
            config.limits.max_execution_time.as_secs(),
            config.limits.max_cpu_time.as_secs(),
            config.limits.max_memory / (1024 * 1024)
        );
    }
    println!("   └─────────────┴──────────────────┴─────────┴──────────┴──────────┘");

    // Test 4: Container strategy without a runtime is refused, never downgraded
    println!("\n4. Container Strategy:");
    let config = SandboxConfiguration::strict().with_strategy(ExecutionStrategy::Container);
    let result = manager.execute("1", None, Some(config)).await?;
    match result.error_message() {
        None => println!("   ✓ Container runtime available, ran in {}", result.strategy()),
        Some(message) => println!("   ✗ Refused: {}", message),
    }

    Ok(())
}
