//! Simple sandbox example - run programs and print the results

use std::time::Duration;
use ward_sandbox::{ExecutionContext, ExecutionResult, SandboxConfiguration, SandboxManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let manager = SandboxManager::builder()
        .config(SandboxConfiguration::permissive())
        .build()?;

    println!("=== Sandbox Manager Example ===\n");
    println!(
        "Mode: {}, strategy: {}\n",
        manager.config().mode,
        manager.config().execution_strategy
    );

    // Example 1: Expression value
    println!("Example 1: Trailing expression");
    let result = manager.execute("1 + 2", None, None).await?;
    print_result(&result);

    // Example 2: Multi-line output
    println!("\nExample 2: Count to 5");
    let source = "for i in range(1, 6):\n    print(i)\n";
    let result = manager.execute(source, None, None).await?;
    print_result(&result);

    // Example 3: With timeout
    println!("\nExample 3: Endless loop with a 2s limit");
    let config = SandboxConfiguration::permissive().with_max_execution_time(Duration::from_secs(2));
    let result = manager
        .execute("while True:\n    pass\n", None, Some(config))
        .await?;
    print_result(&result);

    // Example 4: Uncaught error
    println!("\nExample 4: Uncaught error");
    let context = ExecutionContext::new().with_principal("example-user");
    let result = manager
        .execute("raise ValueError('bad input')", Some(context), None)
        .await?;
    print_result(&result);

    Ok(())
}

fn print_result(result: &ExecutionResult) {
    for line in result.stdout().lines() {
        println!("  stdout: {}", line);
    }
    for line in result.stderr().lines() {
        println!("  stderr: {}", line);
    }
    if let Some(value) = result.return_value() {
        println!("  value: {}", value);
    }

    println!(
        "  Result: success={} time={}ms cpu={}ms",
        result.is_success(),
        result.execution_time().as_millis(),
        result.cpu_time().as_millis()
    );
    if let (Some(kind), Some(message)) = (result.error_kind(), result.error_message()) {
        println!("  Error: {} ({})", message, kind);
    }
}
