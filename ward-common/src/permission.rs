//! Authorization collaborator contract
//!
//! The sandbox asks exactly one question before running anything: may this
//! principal perform `execute` on `sandbox/execute`? The answer comes from the
//! host's authorization engine through [`PermissionChecker`].

use crate::error::CollaboratorResult;
use crate::types::PrincipalId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resource name checked before every execution
pub const EXECUTE_RESOURCE: &str = "sandbox/execute";

/// Action name checked before every execution
pub const EXECUTE_ACTION: &str = "execute";

/// A single authorization question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub principal: PrincipalId,
    pub resource: String,
    pub action: String,
}

impl PermissionRequest {
    /// The request the sandbox issues before running code
    pub fn execute(principal: PrincipalId) -> Self {
        Self {
            principal,
            resource: EXECUTE_RESOURCE.to_string(),
            action: EXECUTE_ACTION.to_string(),
        }
    }
}

/// Authoritative answer from the authorization collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub granted: bool,
    pub reason: Option<String>,
}

impl PermissionDecision {
    pub fn granted() -> Self {
        Self {
            granted: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Authorization engine consulted before code runs.
///
/// An `Err` means the engine could not be consulted; the sandbox then applies
/// its unreachable-collaborator policy. A reachable engine that refuses must
/// return `Ok` with `granted == false`.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check_permission(
        &self,
        request: &PermissionRequest,
    ) -> CollaboratorResult<PermissionDecision>;
}

/// Grants every request (development hosts, tests)
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn check_permission(
        &self,
        _request: &PermissionRequest,
    ) -> CollaboratorResult<PermissionDecision> {
        Ok(PermissionDecision::granted())
    }
}

/// Refuses every request
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl PermissionChecker for DenyAll {
    async fn check_permission(
        &self,
        request: &PermissionRequest,
    ) -> CollaboratorResult<PermissionDecision> {
        Ok(PermissionDecision::denied(format!(
            "principal '{}' may not {} {}",
            request.principal, request.action, request.resource
        )))
    }
}

/// Fixed table of principal → resource patterns.
///
/// Patterns support exact match (`sandbox/execute`), trailing wildcard
/// (`sandbox/*`) and the catch-all `*`.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    grants: HashMap<PrincipalId, Vec<String>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a resource pattern to a principal
    pub fn grant(mut self, principal: impl Into<PrincipalId>, pattern: impl Into<String>) -> Self {
        self.grants
            .entry(principal.into())
            .or_default()
            .push(pattern.into());
        self
    }

    fn pattern_matches(pattern: &str, resource: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        match pattern.strip_suffix('*') {
            Some(prefix) => resource.starts_with(prefix),
            None => pattern == resource,
        }
    }

    /// Synchronous lookup, also used by the async trait impl
    pub fn is_granted(&self, principal: &PrincipalId, resource: &str) -> bool {
        self.grants
            .get(principal)
            .map(|patterns| {
                patterns
                    .iter()
                    .any(|pattern| Self::pattern_matches(pattern, resource))
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl PermissionChecker for StaticPermissions {
    async fn check_permission(
        &self,
        request: &PermissionRequest,
    ) -> CollaboratorResult<PermissionDecision> {
        if self.is_granted(&request.principal, &request.resource) {
            Ok(PermissionDecision::granted())
        } else {
            Ok(PermissionDecision::denied(format!(
                "no grant for '{}' on {}",
                request.principal, request.resource
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_permissions_patterns() {
        let table = StaticPermissions::new()
            .grant("alice", "sandbox/*")
            .grant("bob", "sandbox/inspect")
            .grant("root", "*");

        let alice = table
            .check_permission(&PermissionRequest::execute("alice".into()))
            .await
            .unwrap();
        assert!(alice.granted);

        let bob = table
            .check_permission(&PermissionRequest::execute("bob".into()))
            .await
            .unwrap();
        assert!(!bob.granted);
        assert!(bob.reason.unwrap().contains("bob"));

        assert!(table.is_granted(&"root".into(), EXECUTE_RESOURCE));
        assert!(!table.is_granted(&"mallory".into(), EXECUTE_RESOURCE));
    }

    #[tokio::test]
    async fn test_deny_all_gives_reason() {
        let decision = DenyAll
            .check_permission(&PermissionRequest::execute(PrincipalId::anonymous()))
            .await
            .unwrap();
        assert!(!decision.granted);
        assert!(decision.reason.is_some());
    }

    #[test]
    fn test_execute_request_targets_sandbox_resource() {
        let request = PermissionRequest::execute("carol".into());
        assert_eq!(request.resource, "sandbox/execute");
        assert_eq!(request.action, "execute");
    }
}
