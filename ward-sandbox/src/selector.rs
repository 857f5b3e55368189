//! Strategy selection with runtime availability checks

use crate::config::SandboxConfiguration;
use crate::executor::runtime_available;
use crate::policy::ExecutionStrategy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const PROBE_TTL: Duration = Duration::from_secs(30);

/// Strategy selection decision
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyDecision {
    pub strategy: ExecutionStrategy,

    /// Reason for the selection
    pub reason: String,

    /// Carried into the result
    pub warnings: Vec<String>,
}

/// Errors during strategy selection
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SelectionError {
    /// Never answered with a weaker strategy
    #[error("{strategy} strategy unavailable: container runtime '{runtime}' is not reachable")]
    RuntimeUnavailable {
        strategy: ExecutionStrategy,
        runtime: String,
    },
}

/// Picks the configured strategy and refuses ones that cannot run
#[derive(Debug)]
pub struct StrategySelector {
    probe_timeout: Duration,
    ttl: Duration,
    probes: Mutex<HashMap<String, (Instant, bool)>>,
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategySelector {
    pub fn new() -> Self {
        Self::with_probe(PROBE_TIMEOUT, PROBE_TTL)
    }

    /// Custom probe timeout and cache lifetime
    pub fn with_probe(probe_timeout: Duration, ttl: Duration) -> Self {
        Self {
            probe_timeout,
            ttl,
            probes: Mutex::new(HashMap::new()),
        }
    }

    pub async fn select(
        &self,
        config: &SandboxConfiguration,
    ) -> Result<StrategyDecision, SelectionError> {
        let strategy = config.execution_strategy;
        let mut warnings = Vec::new();

        let reason = match strategy {
            ExecutionStrategy::Container => {
                let runtime = &config.container.runtime;
                if !self.container_runtime_available(runtime).await {
                    warn!(runtime = %runtime, "Container runtime unavailable, refusing strategy");
                    return Err(SelectionError::RuntimeUnavailable {
                        strategy,
                        runtime: runtime.clone(),
                    });
                }
                format!("container runtime '{}' reachable", runtime)
            }
            ExecutionStrategy::InProcess if config.mode.is_untrusted() => {
                let warning = format!(
                    "in-process execution under {} mode: memory and CPU ceilings are advisory",
                    config.mode
                );
                warn!(mode = %config.mode, "{}", warning);
                warnings.push(warning);
                "configured strategy".to_string()
            }
            _ => "configured strategy".to_string(),
        };

        debug!(strategy = %strategy, reason = %reason, "Selected execution strategy");
        Ok(StrategyDecision {
            strategy,
            reason,
            warnings,
        })
    }

    async fn container_runtime_available(&self, runtime: &str) -> bool {
        if let Some(available) = self.cached(runtime) {
            return available;
        }
        let available = runtime_available(runtime, self.probe_timeout).await;
        debug!(runtime, available, "Probed container runtime");
        self.probes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(runtime.to_string(), (Instant::now(), available));
        available
    }

    fn cached(&self, runtime: &str) -> Option<bool> {
        let probes = self
            .probes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        probes
            .get(runtime)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, available)| *available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerSettings;
    use assert_matches::assert_matches;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_configured_strategy_is_used() {
        let selector = StrategySelector::new();
        let decision = selector.select(&SandboxConfiguration::strict()).await.unwrap();
        assert_eq!(decision.strategy, ExecutionStrategy::IsolatedProcess);
        assert!(decision.warnings.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_in_process_for_untrusted_mode_warns() {
        let selector = StrategySelector::new();
        let config =
            SandboxConfiguration::restricted().with_strategy(ExecutionStrategy::InProcess);
        let decision = selector.select(&config).await.unwrap();
        assert_eq!(decision.strategy, ExecutionStrategy::InProcess);
        assert_eq!(decision.warnings.len(), 1);
        assert!(logs_contain("advisory"));
    }

    #[tokio::test]
    async fn test_unavailable_container_is_refused() {
        let selector = StrategySelector::new();
        let config = SandboxConfiguration::strict()
            .with_strategy(ExecutionStrategy::Container)
            .with_container(ContainerSettings {
                runtime: "definitely-not-a-container-runtime".to_string(),
                ..ContainerSettings::default()
            });
        let err = selector.select(&config).await.unwrap_err();
        assert_matches!(
            err,
            SelectionError::RuntimeUnavailable { strategy: ExecutionStrategy::Container, .. }
        );
        assert_eq!(
            selector.cached("definitely-not-a-container-runtime"),
            Some(false)
        );
    }

    #[test]
    fn test_probe_cache_expires() {
        let selector = StrategySelector::with_probe(PROBE_TIMEOUT, Duration::ZERO);
        selector
            .probes
            .lock()
            .unwrap()
            .insert("docker".to_string(), (Instant::now(), true));
        assert_eq!(selector.cached("docker"), None);
    }
}
