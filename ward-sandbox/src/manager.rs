//! Sandbox manager - main entry point

use crate::config::SandboxConfiguration;
use crate::error::{Result, SandboxError};
use crate::execution::{ActiveExecution, ExecutionContext, ExecutionId};
use crate::executor::{audit_completion, executor_for, Collaborators};
use crate::policy::ExecutionStrategy;
use crate::selector::StrategySelector;
use crate::types::{CapturedOutput, ExecutionError, ExecutionResult};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ward_common::{AuditSink, PermissionChecker};

struct RegistryEntry {
    active: ActiveExecution,
    cancel: CancellationToken,
}

type Registry = Arc<Mutex<HashMap<ExecutionId, RegistryEntry>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<ExecutionId, RegistryEntry>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a registry entry exactly once, on every exit path
struct Registration {
    registry: Registry,
    id: ExecutionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if lock(&self.registry).remove(&self.id).is_some() {
            debug!(execution_id = %self.id, "Execution unregistered");
        }
    }
}

/// Single entry point for running untrusted programs.
///
/// Owns strategy selection, the active-execution registry and
/// cancellation. Cheap to share behind an `Arc`.
pub struct SandboxManager {
    config: SandboxConfiguration,
    collaborators: Collaborators,
    selector: StrategySelector,
    registry: Registry,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("mode", &self.config.mode)
            .field("strategy", &self.config.execution_strategy)
            .field("active", &self.active_count())
            .finish()
    }
}

impl SandboxManager {
    pub fn builder() -> SandboxManagerBuilder {
        SandboxManagerBuilder::default()
    }

    /// Configuration used when `execute` is given none
    pub fn config(&self) -> &SandboxConfiguration {
        &self.config
    }

    /// Run `source` and report what happened.
    ///
    /// `Err` is reserved for misuse (invalid configuration, reused
    /// execution id); every failure of the program is an `Ok` result.
    pub async fn execute(
        &self,
        source: &str,
        context: Option<ExecutionContext>,
        config: Option<SandboxConfiguration>,
    ) -> Result<ExecutionResult> {
        let config = config.unwrap_or_else(|| self.config.clone());
        config.validate()?;
        let context = context.unwrap_or_default();
        let id = context.execution_id;

        let cancel = CancellationToken::new();
        let _registration = self.register(&context, config.execution_strategy, cancel.clone())?;
        let started = Instant::now();

        let decision = match self.selector.select(&config).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(execution_id = %id, "Strategy refused: {}", err);
                let result = ExecutionResult::failure(
                    id,
                    config.execution_strategy,
                    ExecutionError::infrastructure(err.to_string()),
                    CapturedOutput::default(),
                )
                .with_execution_time(started.elapsed());
                audit_completion(&self.collaborators, &context, &config, &result).await;
                return Ok(result);
            }
        };

        let executor = executor_for(decision.strategy, self.collaborators.clone());
        let mut result = executor
            .execute_with_cancel(source, &context, &config, cancel)
            .await;
        for warning in decision.warnings {
            result = result.with_warning(warning);
        }
        Ok(result)
    }

    fn register(
        &self,
        context: &ExecutionContext,
        strategy: ExecutionStrategy,
        cancel: CancellationToken,
    ) -> Result<Registration> {
        let id = context.execution_id;
        let mut registry = lock(&self.registry);
        if registry.contains_key(&id) {
            return Err(SandboxError::DuplicateExecution(id));
        }
        registry.insert(
            id,
            RegistryEntry {
                active: ActiveExecution {
                    context: context.clone(),
                    strategy,
                    started_at: Utc::now(),
                    terminating: false,
                },
                cancel,
            },
        );
        debug!(execution_id = %id, strategy = %strategy, "Execution registered");
        Ok(Registration {
            registry: self.registry.clone(),
            id,
        })
    }

    /// Snapshot of the registry, oldest first
    pub fn get_active_executions(&self) -> Vec<ActiveExecution> {
        let mut active: Vec<ActiveExecution> = lock(&self.registry)
            .values()
            .map(|entry| entry.active.clone())
            .collect();
        active.sort_by_key(|execution| execution.started_at);
        active
    }

    pub fn active_count(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Request termination of an active execution.
    ///
    /// Returns `false` when `id` is unknown. For in-process executions the
    /// request takes effect at the evaluator's next checkpoint.
    pub fn terminate_execution(&self, id: ExecutionId) -> bool {
        let mut registry = lock(&self.registry);
        let Some(entry) = registry.get_mut(&id) else {
            return false;
        };
        entry.active.terminating = true;
        entry.cancel.cancel();
        info!(execution_id = %id, strategy = %entry.active.strategy, "Termination requested");
        true
    }

    /// Request termination of every active execution; returns how many
    pub fn terminate_all(&self) -> usize {
        let mut registry = lock(&self.registry);
        for (id, entry) in registry.iter_mut() {
            entry.active.terminating = true;
            entry.cancel.cancel();
            debug!(execution_id = %id, "Termination requested");
        }
        if !registry.is_empty() {
            info!(count = registry.len(), "Terminating all active executions");
        }
        registry.len()
    }
}

/// Builder for [`SandboxManager`]
#[derive(Default)]
pub struct SandboxManagerBuilder {
    config: Option<SandboxConfiguration>,
    collaborators: Collaborators,
    selector: Option<StrategySelector>,
}

impl SandboxManagerBuilder {
    pub fn config(mut self, config: SandboxConfiguration) -> Self {
        self.config = Some(config);
        self
    }

    pub fn permission_checker(mut self, checker: Arc<dyn PermissionChecker>) -> Self {
        self.collaborators.permissions = checker;
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.collaborators.audit = sink;
        self
    }

    pub fn selector(mut self, selector: StrategySelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn build(self) -> Result<SandboxManager> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        info!(
            mode = %config.mode,
            strategy = %config.execution_strategy,
            "Sandbox manager ready"
        );
        Ok(SandboxManager {
            config,
            collaborators: self.collaborators,
            selector: self.selector.unwrap_or_default(),
            registry: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerSettings;
    use crate::types::ErrorKind;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Duration;
    use ward_common::{AuditEventKind, MemoryAuditSink};

    const SPIN: &str = "while True:\n    pass\n";

    fn manager() -> Arc<SandboxManager> {
        Arc::new(
            SandboxManager::builder()
                .config(SandboxConfiguration::permissive())
                .audit_sink(Arc::new(MemoryAuditSink::new()))
                .build()
                .unwrap(),
        )
    }

    async fn wait_for_active(manager: &SandboxManager, count: usize) {
        for _ in 0..200 {
            if manager.active_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} active executions", count);
    }

    #[tokio::test]
    async fn test_execute_with_defaults() {
        let manager = manager();
        let result = manager.execute("1 + 2", None, None).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.return_value(), Some(&json!(3)));
        assert!(manager.get_active_executions().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_an_error() {
        let manager = manager();
        let config = SandboxConfiguration::permissive().with_max_memory(0);
        let err = manager.execute("1", None, Some(config)).await.unwrap_err();
        assert_matches!(err, SandboxError::InvalidConfiguration(_));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_unknown_execution() {
        assert!(!manager().terminate_execution(ExecutionId::new()));
    }

    #[tokio::test]
    async fn test_concurrent_executions_are_tracked() {
        let manager = manager();
        let first = ExecutionContext::new();
        let second = ExecutionContext::new();
        let ids = [first.execution_id, second.execution_id];

        let handles: Vec<_> = [first, second]
            .into_iter()
            .map(|context| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.execute(SPIN, Some(context), None).await })
            })
            .collect();

        wait_for_active(&manager, 2).await;
        let active: Vec<ExecutionId> = manager
            .get_active_executions()
            .iter()
            .map(ActiveExecution::execution_id)
            .collect();
        assert!(ids.iter().all(|id| active.contains(id)));

        // finish in reverse order of start
        assert!(manager.terminate_execution(ids[1]));
        assert!(manager
            .get_active_executions()
            .iter()
            .any(|execution| execution.terminating));
        assert!(manager.terminate_execution(ids[0]));

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.error_kind(), Some(ErrorKind::Terminated));
        }
        assert!(manager.get_active_executions().is_empty());
        assert!(!manager.terminate_execution(ids[0]));
    }

    #[tokio::test]
    async fn test_dropped_future_unregisters() {
        let manager = manager();
        let outcome = tokio::time::timeout(
            Duration::from_millis(200),
            manager.execute(SPIN, None, None),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let manager = manager();
        let context = ExecutionContext::new();
        let id = context.execution_id;
        let running = {
            let manager = manager.clone();
            let context = context.clone();
            tokio::spawn(async move { manager.execute(SPIN, Some(context), None).await })
        };
        wait_for_active(&manager, 1).await;

        let err = manager.execute("1", Some(context), None).await.unwrap_err();
        assert_matches!(err, SandboxError::DuplicateExecution(dup) if dup == id);

        assert_eq!(manager.terminate_all(), 1);
        let result = running.await.unwrap().unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::Terminated));
    }

    #[tokio::test]
    async fn test_refused_container_is_infrastructure_error() {
        let sink = Arc::new(MemoryAuditSink::new());
        let manager = SandboxManager::builder()
            .audit_sink(sink.clone())
            .build()
            .unwrap();
        let config = SandboxConfiguration::strict()
            .with_strategy(ExecutionStrategy::Container)
            .with_container(ContainerSettings {
                runtime: "definitely-not-a-container-runtime".to_string(),
                ..ContainerSettings::default()
            });
        let context = ExecutionContext::new();
        let id = context.execution_id.to_string();
        let result = manager
            .execute("1 + 1", Some(context), Some(config))
            .await
            .unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::InfrastructureError));
        assert_eq!(result.strategy(), ExecutionStrategy::Container);
        assert_eq!(
            sink.events_for(&id, AuditEventKind::ExecutionCompleted).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_selector_warning_reaches_result() {
        let manager = manager();
        let config =
            SandboxConfiguration::restricted().with_strategy(ExecutionStrategy::InProcess);
        let result = manager.execute("2 * 21", None, Some(config)).await.unwrap();
        assert!(result.is_success());
        assert!(result
            .warnings()
            .iter()
            .any(|warning| warning.contains("advisory")));
    }
}
