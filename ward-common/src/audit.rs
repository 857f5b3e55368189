//! Audit collaborator contract
//!
//! Lifecycle events are emitted best-effort. A sink that fails must never
//! fail the execution it is describing; callers log and move on.

use crate::error::CollaboratorResult;
use crate::types::{PrincipalId, SessionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventKind {
    ExecutionStarted,
    ExecutionCompleted,
    SecurityViolation,
}

impl AuditEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEventKind::ExecutionStarted => "execution-started",
            AuditEventKind::ExecutionCompleted => "execution-completed",
            AuditEventKind::SecurityViolation => "security-violation",
        }
    }
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Structured lifecycle record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_kind: AuditEventKind,
    pub execution_id: String,
    pub principal_id: PrincipalId,
    pub session_id: SessionId,
    pub severity: Severity,
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        event_kind: AuditEventKind,
        execution_id: impl Into<String>,
        principal_id: PrincipalId,
        session_id: SessionId,
        severity: Severity,
    ) -> Self {
        Self {
            event_kind,
            execution_id: execution_id.into(),
            principal_id,
            session_id,
            severity,
            duration_ms: None,
            detail: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: AuditEvent) -> CollaboratorResult<()>;
}

/// Writes audit events as structured `tracing` records on target `ward::audit`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: AuditEvent) -> CollaboratorResult<()> {
        let detail = event.detail.to_string();
        match event.severity {
            Severity::Info => tracing::info!(
                target: "ward::audit",
                event_kind = event.event_kind.as_str(),
                execution_id = %event.execution_id,
                principal_id = %event.principal_id,
                session_id = %event.session_id,
                duration_ms = ?event.duration_ms,
                detail = %detail,
                "audit"
            ),
            Severity::Warning => tracing::warn!(
                target: "ward::audit",
                event_kind = event.event_kind.as_str(),
                execution_id = %event.execution_id,
                principal_id = %event.principal_id,
                session_id = %event.session_id,
                duration_ms = ?event.duration_ms,
                detail = %detail,
                "audit"
            ),
            Severity::Critical => tracing::error!(
                target: "ward::audit",
                event_kind = event.event_kind.as_str(),
                execution_id = %event.execution_id,
                principal_id = %event.principal_id,
                session_id = %event.session_id,
                duration_ms = ?event.duration_ms,
                detail = %detail,
                "audit"
            ),
        }
        Ok(())
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn emit(&self, _event: AuditEvent) -> CollaboratorResult<()> {
        Ok(())
    }
}

/// Keeps events in memory, mostly for tests and embedding hosts that batch
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event recorded so far
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Events of one kind for one execution
    pub fn events_for(&self, execution_id: &str, kind: AuditEventKind) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.execution_id == execution_id && event.event_kind == kind)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, event: AuditEvent) -> CollaboratorResult<()> {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: AuditEventKind, id: &str) -> AuditEvent {
        AuditEvent::new(
            kind,
            id,
            PrincipalId::new("alice"),
            SessionId::new("s-1"),
            Severity::Info,
        )
    }

    #[tokio::test]
    async fn test_memory_sink_filters_by_execution() {
        let sink = MemoryAuditSink::new();
        sink.emit(event(AuditEventKind::ExecutionStarted, "a"))
            .await
            .unwrap();
        sink.emit(event(AuditEventKind::ExecutionCompleted, "a").with_duration_ms(12))
            .await
            .unwrap();
        sink.emit(event(AuditEventKind::ExecutionStarted, "b"))
            .await
            .unwrap();

        assert_eq!(sink.events().len(), 3);
        let completed = sink.events_for("a", AuditEventKind::ExecutionCompleted);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].duration_ms, Some(12));
    }

    #[test]
    fn test_event_serializes_kebab_case() {
        let json = serde_json::to_value(event(AuditEventKind::SecurityViolation, "x")).unwrap();
        assert_eq!(json["event_kind"], "security-violation");
        assert_eq!(json["severity"], "info");
        assert_eq!(json["principal_id"], "alice");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }
}
