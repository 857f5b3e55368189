//! Evaluation inside the host process

use super::sealed::Strategy;
use super::{Collaborators, Dispatch, Outcome};
use crate::environment::SecureExecutionEnvironment;
use crate::interpreter::{self, EvaluationLimits, Evaluation, InterpreterControl, InterruptReason};
use crate::lang::parse_module;
use crate::monitor::{breach_of, InterpreterTarget, MonitorLimits, ResourceMonitor};
use crate::policy::ExecutionStrategy;
use crate::types::{
    duration_ms, CapturedOutput, ExecutionError, ResourceBreach, ResourceKind, ResourceUsage,
    SecurityViolation,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const RECURSION_LIMIT: usize = 200;

/// How long an interrupted evaluation gets to reach its next checkpoint
const INTERRUPT_GRACE: Duration = Duration::from_secs(1);

/// Fastest strategy with the weakest isolation.
///
/// Memory and CPU ceilings are advisory: they are enforced by the
/// evaluator's own accounting and checkpoints, not by the OS.
#[derive(Debug, Clone, Default)]
pub struct InProcessExecutor {
    collaborators: Collaborators,
}

impl InProcessExecutor {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }
}

/// Stops an evaluation that outlives its executor future
struct InterruptOnDrop(Arc<InterpreterControl>);

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if !self.0.is_finished() {
            self.0.interrupt(InterruptReason::Terminated);
        }
    }
}

#[async_trait]
impl Strategy for InProcessExecutor {
    fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    fn kind(&self) -> ExecutionStrategy {
        ExecutionStrategy::InProcess
    }

    async fn dispatch(&self, run: Dispatch<'_>) -> Outcome {
        let config = run.config;
        let module = match parse_module(run.source) {
            Ok(module) => Arc::new(module),
            Err(err) => {
                let rendered = format!("SyntaxError: {}", err);
                let output = CapturedOutput {
                    stderr: rendered.clone(),
                    violations: vec![SecurityViolation::syntax_error(&err)],
                    ..Default::default()
                };
                return Outcome::failure(ExecutionError::runtime(rendered), output);
            }
        };

        let namespace = SecureExecutionEnvironment::new().build(&config.allowed_builtins);
        let mut warnings = namespace.warnings();
        let limits = EvaluationLimits {
            max_memory: config.limits.max_memory,
            max_output_bytes: config.max_output_bytes,
            recursion_limit: RECURSION_LIMIT,
        };

        let control = Arc::new(InterpreterControl::new());
        let mut receiver = match interpreter::spawn(module, namespace, limits, control.clone()) {
            Ok(receiver) => receiver,
            Err(err) => {
                return Outcome::failure(
                    ExecutionError::infrastructure(format!(
                        "failed to start interpreter thread: {}",
                        err
                    )),
                    CapturedOutput::default(),
                )
            }
        };
        let _guard = InterruptOnDrop(control.clone());

        let mut monitor = None;
        if config.enable_runtime_monitoring {
            let mut started = ResourceMonitor::new(MonitorLimits::from_config(config));
            match started.start_monitoring(Arc::new(InterpreterTarget::new(control.clone()))) {
                Ok(()) => monitor = Some(started),
                Err(err) => warn!("Failed to start resource monitor: {}", err),
            }
        }
        let mut breach_signal = monitor.as_ref().map(ResourceMonitor::breach_signal);

        let evaluation = tokio::select! {
            result = &mut receiver => result.ok(),
            _ = tokio::time::sleep_until(run.deadline) => {
                control.interrupt(InterruptReason::Timeout);
                None
            }
            _ = run.cancel.cancelled() => {
                control.interrupt(InterruptReason::Terminated);
                None
            }
            _ = breach_of(&mut breach_signal) => None,
        };
        let evaluation = match evaluation {
            Some(evaluation) => Some(evaluation),
            None => match tokio::time::timeout(INTERRUPT_GRACE, &mut receiver).await {
                Ok(result) => result.ok(),
                Err(_) => {
                    warn!("Evaluation did not reach a checkpoint after interrupt");
                    None
                }
            },
        };

        let mut usage = ResourceUsage::default();
        let mut breach = None;
        if let Some(mut monitor) = monitor {
            breach = monitor.breach();
            usage = monitor.stop_monitoring().await;
        }
        usage.cpu_time_ms = usage.cpu_time_ms.max(duration_ms(control.cpu_time()));
        usage.memory.peak = usage.memory.peak.max(control.peak_memory_bytes());

        let mut output = CapturedOutput {
            resource_usage: usage,
            ..Default::default()
        };
        let error = classify(evaluation, &control, breach, run.config, &mut output);
        if error.is_none() {
            debug!(execution_id = %run.context.execution_id, "Evaluation succeeded");
        }
        warnings.append(&mut output.warnings);
        output.warnings = warnings;
        Outcome { output, error }
    }
}

fn classify(
    evaluation: Option<Evaluation>,
    control: &InterpreterControl,
    breach: Option<ResourceBreach>,
    config: &crate::config::SandboxConfiguration,
    output: &mut CapturedOutput,
) -> Option<ExecutionError> {
    if let Some(evaluation) = &evaluation {
        output.stdout = evaluation.stdout.clone();
        output.stderr = evaluation.stderr.clone();
        if evaluation.output_truncated {
            output.warnings.push(format!(
                "output truncated to {} bytes",
                config.max_output_bytes
            ));
        }
    }

    match control.reason() {
        Some(InterruptReason::Timeout) => {
            let limit = config.limits.max_execution_time;
            output.violations.push(SecurityViolation::timeout(limit));
            return Some(ExecutionError::timeout(limit));
        }
        Some(InterruptReason::Terminated) => return Some(ExecutionError::terminated()),
        Some(InterruptReason::ResourceExceeded) => {
            let breach = breach.unwrap_or_else(|| {
                ResourceBreach::new(
                    ResourceKind::CpuTime,
                    duration_ms(config.limits.max_cpu_time),
                    duration_ms(control.cpu_time()),
                )
            });
            output.violations.push(SecurityViolation::resource_exceeded(&breach));
            return Some(ExecutionError::resource_exceeded(&breach));
        }
        None => {}
    }

    let Some(evaluation) = evaluation else {
        return Some(ExecutionError::infrastructure(
            "interpreter thread exited without a result",
        ));
    };

    match evaluation.error {
        None => {
            output.return_value = evaluation.return_value;
            None
        }
        Some(error) if error.kind == "MemoryError" && error.fatal => {
            let breach = ResourceBreach::new(
                ResourceKind::Memory,
                config.limits.max_memory,
                control.peak_memory_bytes(),
            );
            output.violations.push(SecurityViolation::resource_exceeded(&breach));
            Some(ExecutionError::resource_exceeded(&breach))
        }
        Some(error) => Some(ExecutionError::runtime(error.render())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfiguration;
    use crate::execution::ExecutionContext;
    use crate::executor::SandboxExecutor;
    use crate::types::{ErrorKind, ViolationKind};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use ward_common::{AllowAll, MemoryAuditSink};

    fn executor() -> InProcessExecutor {
        InProcessExecutor::new(Collaborators::new(
            Arc::new(AllowAll),
            Arc::new(MemoryAuditSink::new()),
        ))
    }

    #[tokio::test]
    async fn test_trailing_expression_is_returned() {
        let result = executor()
            .execute("1 + 2", &ExecutionContext::new(), &SandboxConfiguration::permissive())
            .await;
        assert!(result.is_success());
        assert_eq!(result.return_value(), Some(&json!(3)));
        assert!(result.violations().is_empty());
        assert_eq!(result.strategy(), ExecutionStrategy::InProcess);
    }

    #[tokio::test]
    async fn test_stdout_is_captured() {
        let source = "for i in range(3):\n    print('line', i)\n";
        let result = executor()
            .execute(source, &ExecutionContext::new(), &SandboxConfiguration::permissive())
            .await;
        assert!(result.is_success());
        assert_eq!(result.stdout(), "line 0\nline 1\nline 2\n");
        assert_eq!(result.return_value(), None);
    }

    #[tokio::test]
    async fn test_uncaught_error_is_runtime_error() {
        let result = executor()
            .execute(
                "x = {}\nx['missing']\n",
                &ExecutionContext::new(),
                &SandboxConfiguration::permissive(),
            )
            .await;
        assert!(!result.is_success());
        assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError));
        assert!(result.stderr().contains("KeyError"));
    }

    #[tokio::test]
    async fn test_forbidden_import_never_runs() {
        let source = "print('side effect')\nimport socket\n";
        let result = executor()
            .execute(source, &ExecutionContext::new(), &SandboxConfiguration::permissive())
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::StaticAnalysisFailed));
        assert_eq!(result.stdout(), "");
        assert_eq!(result.violations()[0].kind, ViolationKind::ForbiddenImport);
    }

    #[tokio::test]
    async fn test_syntax_error_without_analysis() {
        let config = SandboxConfiguration::permissive().with_static_analysis(false);
        let result = executor()
            .execute("def broken(:\n", &ExecutionContext::new(), &config)
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError));
        assert!(result.error_message().unwrap().starts_with("SyntaxError"));
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let config = SandboxConfiguration::permissive()
            .with_runtime_monitoring(false)
            .with_max_execution_time(Duration::from_millis(200));
        let result = executor()
            .execute("while True:\n    pass\n", &ExecutionContext::new(), &config)
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(result.violations()[0].kind, ViolationKind::Timeout);
        assert!(result.execution_time() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cpu_ceiling_stops_evaluation() {
        let config = SandboxConfiguration::permissive()
            .with_max_cpu_time(Duration::from_millis(100))
            .with_monitor_interval(Duration::from_millis(20));
        let result = executor()
            .execute("while True:\n    pass\n", &ExecutionContext::new(), &config)
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::ResourceExceeded));
        assert_eq!(result.resource_kind(), Some(ResourceKind::CpuTime));
    }

    #[tokio::test]
    async fn test_memory_ceiling_is_resource_exceeded() {
        let config = SandboxConfiguration::permissive().with_max_memory(1024 * 1024);
        let source = "items = []\nwhile True:\n    items.append('x' * 1000)\n";
        let result = executor()
            .execute(source, &ExecutionContext::new(), &config)
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::ResourceExceeded));
        assert_eq!(result.resource_kind(), Some(ResourceKind::Memory));
    }

    #[tokio::test]
    async fn test_cancel_terminates() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = executor()
            .execute_with_cancel(
                "while True:\n    pass\n",
                &ExecutionContext::new(),
                &SandboxConfiguration::permissive(),
                cancel,
            )
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Terminated));
    }

    #[tokio::test]
    async fn test_unknown_builtin_becomes_warning() {
        let config = SandboxConfiguration::permissive().with_allowed_builtins(["len", "print", "open"]);
        let result = executor()
            .execute("len([1, 2])", &ExecutionContext::new(), &config)
            .await;
        assert!(result.is_success());
        assert!(result.warnings().iter().any(|warning| warning.contains("'open'")));
    }
}
