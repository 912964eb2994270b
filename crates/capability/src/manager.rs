//! The capability manager: grant, delegate, check, revoke.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use aegis_audit::{AuditEntry, AuditLog, AuditOutcome};
use aegis_domain::{Error, Result};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::token::{CapabilityToken, Permission, TokenScope};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A request to issue a new capability token.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub agent_id: String,
    pub permissions: Vec<Permission>,
    /// Lifetime; `None` uses the manager default.
    pub duration_ms: Option<u64>,
    pub purpose: Option<String>,
    pub delegatable: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Issues, verifies, and revokes capability tokens.
///
/// A revoked token leaves no residue in the live maps; the audit log is
/// the only record it existed.
pub struct CapabilityManager {
    secret: Vec<u8>,
    default_ttl: Duration,
    tokens: RwLock<HashMap<String, CapabilityToken>>,
    by_agent: RwLock<HashMap<String, HashSet<String>>>,
    audit: Arc<AuditLog>,
}

impl CapabilityManager {
    pub fn new(secret: impl Into<Vec<u8>>, default_ttl_ms: u64, audit: Arc<AuditLog>) -> Self {
        Self {
            secret: secret.into(),
            default_ttl: Duration::milliseconds(default_ttl_ms as i64),
            tokens: RwLock::new(HashMap::new()),
            by_agent: RwLock::new(HashMap::new()),
            audit,
        }
    }

    // ── Grant ──────────────────────────────────────────────────────

    pub fn grant(&self, request: GrantRequest, issued_by: &str) -> Result<CapabilityToken> {
        if request.agent_id.is_empty() {
            return Err(Error::Validation("grant needs an agent id".into()));
        }
        if request.permissions.is_empty() {
            return Err(Error::Validation("grant needs at least one permission".into()));
        }

        let ttl = request
            .duration_ms
            .map(|ms| Duration::milliseconds(ms as i64))
            .unwrap_or(self.default_ttl);
        if ttl <= Duration::zero() {
            return Err(Error::Validation("grant duration must be positive".into()));
        }

        let now = Utc::now();
        let mut token = CapabilityToken {
            id: Uuid::new_v4().to_string(),
            agent_id: request.agent_id.clone(),
            scope: TokenScope::derive(&request.permissions),
            permissions: request.permissions,
            issued_at: now,
            expires_at: now + ttl,
            issued_by: issued_by.to_string(),
            purpose: request.purpose,
            delegatable: request.delegatable,
            parent_token_id: None,
            signature: String::new(),
        };
        token.signature = token.compute_signature(&self.secret)?;

        self.insert(token.clone());
        self.audit.append(
            AuditEntry::new("capability.grant", AuditOutcome::Success)
                .resource("capability", &token.id)
                .actor(&token.agent_id)
                .details(serde_json::json!({
                    "issued_by": issued_by,
                    "scope": token.scope,
                    "expires_at": token.expires_at,
                    "delegatable": token.delegatable,
                })),
        );
        Ok(token)
    }

    // ── Delegate ───────────────────────────────────────────────────

    /// Re-issue a subset of `parent_id`'s permissions to another agent.
    /// The child cannot outlive the parent and is never delegatable.
    pub fn delegate(
        &self,
        parent_id: &str,
        to_agent: &str,
        permissions: Option<Vec<Permission>>,
        duration_ms: Option<u64>,
    ) -> Result<CapabilityToken> {
        let parent = self
            .tokens
            .read()
            .get(parent_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("token {parent_id}")))?;

        if !parent.delegatable {
            return Err(Error::PermissionDenied("token is not delegatable".into()));
        }
        if parent.is_expired() {
            self.remove(parent_id);
            self.audit_expired(&parent);
            return Err(Error::PermissionDenied("parent token has expired".into()));
        }

        let permissions = permissions.unwrap_or_else(|| parent.permissions.clone());
        let subset = permissions
            .iter()
            .all(|c| parent.permissions.iter().any(|p| c.covered_by(p)));
        if !subset {
            return Err(Error::PermissionDenied(
                "delegated permissions exceed the parent token".into(),
            ));
        }

        let now = Utc::now();
        let requested_expiry = duration_ms
            .map(|ms| now + Duration::milliseconds(ms as i64))
            .unwrap_or(parent.expires_at);
        let expires_at = requested_expiry.min(parent.expires_at);

        let mut child = CapabilityToken {
            id: Uuid::new_v4().to_string(),
            agent_id: to_agent.to_string(),
            scope: TokenScope::derive(&permissions),
            permissions,
            issued_at: now,
            expires_at,
            issued_by: parent.agent_id.clone(),
            purpose: parent.purpose.clone(),
            delegatable: false,
            parent_token_id: Some(parent.id.clone()),
            signature: String::new(),
        };
        child.signature = child.compute_signature(&self.secret)?;

        self.insert(child.clone());
        self.audit.append(
            AuditEntry::new("capability.delegate", AuditOutcome::Success)
                .resource("capability", &child.id)
                .actor(&parent.agent_id)
                .details(serde_json::json!({
                    "parent": parent.id,
                    "to_agent": to_agent,
                    "expires_at": child.expires_at,
                })),
        );
        Ok(child)
    }

    // ── Check ──────────────────────────────────────────────────────

    /// Find the first active token granting `category`/`action` on
    /// `resource` for `agent`. Expired tokens are revoked lazily;
    /// tokens with a bad signature are skipped and audited.
    pub fn check(
        &self,
        agent: &str,
        category: &str,
        action: &str,
        resource: Option<&str>,
    ) -> Option<CapabilityToken> {
        let candidate_ids: Vec<String> = self
            .by_agent
            .read()
            .get(agent)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        for id in candidate_ids {
            let token = match self.tokens.read().get(&id) {
                Some(t) => t.clone(),
                None => continue,
            };

            if token.is_expired() {
                self.remove(&id);
                self.audit_expired(&token);
                continue;
            }
            if !token.verify(&self.secret) {
                tracing::warn!(token_id = %id, agent = %agent, "capability token failed signature check");
                self.audit.append(
                    AuditEntry::new("capability.bad_signature", AuditOutcome::Denied)
                        .resource("capability", &id)
                        .actor(agent),
                );
                continue;
            }
            if token.grants(category, action, resource) {
                return Some(token);
            }
        }
        None
    }

    // ── Revoke / cleanup ───────────────────────────────────────────

    pub fn revoke(&self, id: &str) -> bool {
        match self.remove(id) {
            Some(token) => {
                self.audit.append(
                    AuditEntry::new("capability.revoke", AuditOutcome::Success)
                        .resource("capability", id)
                        .actor(&token.agent_id),
                );
                true
            }
            None => false,
        }
    }

    /// Revoke every token held by an agent. Returns how many were revoked.
    pub fn revoke_all(&self, agent: &str) -> usize {
        let ids: Vec<String> = self
            .by_agent
            .write()
            .remove(agent)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        let mut tokens = self.tokens.write();
        let mut revoked = 0;
        for id in &ids {
            if tokens.remove(id).is_some() {
                revoked += 1;
            }
        }
        drop(tokens);
        if revoked > 0 {
            self.audit.append(
                AuditEntry::new("capability.revoke_all", AuditOutcome::Success)
                    .actor(agent)
                    .details(serde_json::json!({ "revoked": revoked })),
            );
        }
        revoked
    }

    /// Sweep expired tokens. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let expired: Vec<CapabilityToken> = self
            .tokens
            .read()
            .values()
            .filter(|t| t.is_expired())
            .cloned()
            .collect();
        for token in &expired {
            self.remove(&token.id);
            self.audit_expired(token);
        }
        expired.len()
    }

    pub fn active_count(&self) -> usize {
        self.tokens.read().len()
    }

    /// Tokens currently held by an agent (test/introspection seam).
    pub fn tokens_for(&self, agent: &str) -> Vec<CapabilityToken> {
        let ids = self.by_agent.read().get(agent).cloned().unwrap_or_default();
        let tokens = self.tokens.read();
        ids.iter().filter_map(|id| tokens.get(id).cloned()).collect()
    }

    // ── Private ────────────────────────────────────────────────────

    fn insert(&self, token: CapabilityToken) {
        self.by_agent
            .write()
            .entry(token.agent_id.clone())
            .or_default()
            .insert(token.id.clone());
        self.tokens.write().insert(token.id.clone(), token);
    }

    fn remove(&self, id: &str) -> Option<CapabilityToken> {
        let token = self.tokens.write().remove(id)?;
        let mut by_agent = self.by_agent.write();
        if let Some(set) = by_agent.get_mut(&token.agent_id) {
            set.remove(id);
            if set.is_empty() {
                by_agent.remove(&token.agent_id);
            }
        }
        Some(token)
    }

    fn audit_expired(&self, token: &CapabilityToken) {
        self.audit.append(
            AuditEntry::new("capability.expired", AuditOutcome::Denied)
                .resource("capability", &token.id)
                .actor(&token.agent_id),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_audit::{AuditQuery, MemoryAuditStore};
    use aegis_domain::config::AuditConfig;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn make_manager() -> (CapabilityManager, Arc<AuditLog>) {
        let audit = AuditLog::new(AuditConfig::default(), Arc::new(MemoryAuditStore::new()));
        (
            CapabilityManager::new(SECRET, 3_600_000, audit.clone()),
            audit,
        )
    }

    fn grant_req(agent: &str, delegatable: bool) -> GrantRequest {
        GrantRequest {
            agent_id: agent.into(),
            permissions: vec![
                Permission::new("filesystem", vec!["read".into(), "write".into()])
                    .with_resource("/tmp/*"),
                Permission::new("tools", vec!["execute".into()]),
            ],
            duration_ms: None,
            purpose: None,
            delegatable,
        }
    }

    #[test]
    fn grant_and_check() {
        let (mgr, _) = make_manager();
        let token = mgr.grant(grant_req("calc", false), "system").unwrap();
        assert!(token.expires_at > token.issued_at);
        assert_eq!(token.scope, TokenScope::Task);
        assert!(token.verify(SECRET));

        let found = mgr.check("calc", "tools", "execute", None);
        assert_eq!(found.map(|t| t.id), Some(token.id));
        assert!(mgr.check("calc", "shell", "execute", None).is_none());
        assert!(mgr.check("other", "tools", "execute", None).is_none());
    }

    #[test]
    fn check_with_resource_scoping() {
        let (mgr, _) = make_manager();
        mgr.grant(grant_req("calc", false), "system").unwrap();
        assert!(mgr
            .check("calc", "filesystem", "read", Some("/tmp/data"))
            .is_some());
        assert!(mgr
            .check("calc", "filesystem", "read", Some("/etc/passwd"))
            .is_none());
    }

    #[test]
    fn empty_grant_rejected() {
        let (mgr, _) = make_manager();
        let req = GrantRequest {
            agent_id: "a".into(),
            permissions: vec![],
            duration_ms: None,
            purpose: None,
            delegatable: false,
        };
        assert!(matches!(
            mgr.grant(req, "system").unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn delegation_rules() {
        let (mgr, _) = make_manager();
        let parent = mgr.grant(grant_req("parent", true), "system").unwrap();

        let child = mgr
            .delegate(
                &parent.id,
                "child",
                Some(vec![Permission::new("tools", vec!["execute".into()])]),
                Some(60_000),
            )
            .unwrap();
        assert!(!child.delegatable);
        assert_eq!(child.parent_token_id.as_deref(), Some(parent.id.as_str()));
        assert!(child.expires_at <= parent.expires_at);
        assert!(child.verify(SECRET));

        // Child cannot be delegated further.
        let err = mgr.delegate(&child.id, "grandchild", None, None).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        // Permissions outside the parent are refused.
        let err = mgr
            .delegate(
                &parent.id,
                "child2",
                Some(vec![Permission::new("shell", vec!["execute".into()])]),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn delegation_cannot_outlive_parent() {
        let (mgr, _) = make_manager();
        let parent = mgr.grant(grant_req("parent", true), "system").unwrap();
        // Ask for far longer than the parent's remaining lifetime.
        let child = mgr
            .delegate(&parent.id, "child", None, Some(1_000 * 60 * 60 * 24 * 30))
            .unwrap();
        assert_eq!(child.expires_at, parent.expires_at);
    }

    #[test]
    fn expired_token_lazily_revoked_and_audited() {
        let (mgr, audit) = make_manager();
        let token = mgr
            .grant(
                GrantRequest {
                    duration_ms: Some(1),
                    ..grant_req("calc", false)
                },
                "system",
            )
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));

        assert!(mgr.check("calc", "tools", "execute", None).is_none());
        assert_eq!(mgr.active_count(), 0);

        let entries = audit.query(&AuditQuery {
            action: Some("capability.expired".into()),
            ..Default::default()
        });
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].resource_id.as_deref(), Some(token.id.as_str()));
    }

    #[test]
    fn tampered_token_skipped_and_audited() {
        let (mgr, audit) = make_manager();
        let token = mgr.grant(grant_req("calc", false), "system").unwrap();

        // Forge extra permissions directly in the live map.
        {
            let mut tokens = mgr.tokens.write();
            let stored = tokens.get_mut(&token.id).unwrap();
            stored
                .permissions
                .push(Permission::new("shell", vec!["*".into()]));
        }

        assert!(mgr.check("calc", "shell", "execute", None).is_none());
        let entries = audit.query(&AuditQuery {
            action: Some("capability.bad_signature".into()),
            ..Default::default()
        });
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Denied);
    }

    #[test]
    fn revoke_leaves_no_residue() {
        let (mgr, _) = make_manager();
        let token = mgr.grant(grant_req("calc", false), "system").unwrap();
        assert!(mgr.revoke(&token.id));
        assert!(!mgr.revoke(&token.id));
        assert_eq!(mgr.active_count(), 0);
        assert!(mgr.tokens_for("calc").is_empty());
    }

    #[test]
    fn revoke_all_and_cleanup() {
        let (mgr, _) = make_manager();
        mgr.grant(grant_req("calc", false), "system").unwrap();
        mgr.grant(grant_req("calc", false), "system").unwrap();
        mgr.grant(grant_req("other", false), "system").unwrap();

        assert_eq!(mgr.revoke_all("calc"), 2);
        assert_eq!(mgr.active_count(), 1);

        mgr.grant(
            GrantRequest {
                duration_ms: Some(1),
                ..grant_req("short", false)
            },
            "system",
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(mgr.cleanup(), 1);
    }
}
