//! Execution identity, per-request context and registry snapshots

use crate::policy::ExecutionStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use ward_common::{Capability, PrincipalId, SessionId};

/// Unique execution identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub uuid::Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything known about one request besides the program text.
///
/// Owned by the caller and passed by reference; the manager keeps a copy in
/// its registry while the execution is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub principal_id: PrincipalId,
    pub session_id: SessionId,
    /// Working directory for process strategies; a private workspace when unset
    pub working_directory: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    /// Text fed to the program's standard input
    pub stdin: Option<String>,
    pub capabilities: BTreeSet<Capability>,
    pub created_at: DateTime<Utc>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Anonymous context with a fresh id and session, allowed to execute
    pub fn new() -> Self {
        Self {
            execution_id: ExecutionId::new(),
            principal_id: PrincipalId::anonymous(),
            session_id: SessionId::generate(),
            working_directory: None,
            environment: BTreeMap::new(),
            stdin: None,
            capabilities: [Capability::SandboxExecution].into_iter().collect(),
            created_at: Utc::now(),
        }
    }

    pub fn with_execution_id(mut self, id: ExecutionId) -> Self {
        self.execution_id = id;
        self
    }

    pub fn with_principal(mut self, principal: impl Into<PrincipalId>) -> Self {
        self.principal_id = principal.into();
        self
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session_id = session;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Copy of a registry entry, as returned by `get_active_executions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveExecution {
    pub context: ExecutionContext,
    pub strategy: ExecutionStrategy,
    pub started_at: DateTime<Utc>,
    /// Whether termination has been requested
    pub terminating: bool,
}

impl ActiveExecution {
    pub fn execution_id(&self) -> ExecutionId {
        self.context.execution_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ExecutionId::new(), ExecutionId::new());
    }

    #[test]
    fn test_default_context() {
        let context = ExecutionContext::new();
        assert_eq!(context.principal_id, PrincipalId::anonymous());
        assert!(context.has_capability(Capability::SandboxExecution));
        assert!(!context.has_capability(Capability::Network));
        assert!(context.stdin.is_none());
    }

    #[test]
    fn test_context_builder() {
        let context = ExecutionContext::new()
            .with_principal("alice")
            .with_env("MODE", "test")
            .with_stdin("42\n")
            .with_capability(Capability::Network);
        assert_eq!(context.principal_id.as_str(), "alice");
        assert_eq!(context.environment.get("MODE").map(String::as_str), Some("test"));
        assert!(context.has_capability(Capability::Network));
    }

    #[test]
    fn test_execution_id_serializes_as_plain_uuid() {
        let id = ExecutionId::new();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }
}
