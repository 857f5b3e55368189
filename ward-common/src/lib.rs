//! Contracts between the ward sandbox and the system hosting it.
//!
//! The sandbox never decides on its own whether a principal may run code, and
//! it never owns the audit trail. Both concerns are delegated to collaborators
//! described here.

pub mod audit;
pub mod error;
pub mod permission;
pub mod types;

pub use audit::{
    AuditEvent, AuditEventKind, AuditSink, MemoryAuditSink, NullAuditSink, Severity,
    TracingAuditSink,
};
pub use error::{CollaboratorError, CollaboratorResult};
pub use permission::{
    AllowAll, DenyAll, PermissionChecker, PermissionDecision, PermissionRequest,
    StaticPermissions, EXECUTE_ACTION, EXECUTE_RESOURCE,
};
pub use types::{Capability, PrincipalId, SessionId};
