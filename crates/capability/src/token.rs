//! The capability token record and its canonical signing form.

use std::collections::HashMap;

use aegis_domain::{Error, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Version byte of the signing format. Bump when the layout changes.
const SIGNING_VERSION: u8 = 0x01;

/// Write a 4-byte little-endian length followed by the bytes. Token
/// fields are small, so the u32 cast cannot truncate in practice.
fn write_length_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permissions & scope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One permission inside a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub category: String,
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<HashMap<String, serde_json::Value>>,
}

impl Permission {
    pub fn new(category: impl Into<String>, actions: Vec<String>) -> Self {
        Self {
            category: category.into(),
            actions,
            resource: None,
            constraints: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Whether this permission grants `category`/`action` on `resource`.
    pub fn allows(&self, category: &str, action: &str, resource: Option<&str>) -> bool {
        if self.category != category {
            return false;
        }
        if !self.actions.iter().any(|a| a == action || a == "*") {
            return false;
        }
        match (&self.resource, resource) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(pattern), Some(resource)) => resource_pattern_matches(pattern, resource),
        }
    }

    /// Whether this permission is covered by `parent` (delegation rule:
    /// child permissions must be a subset of the parent's).
    pub fn covered_by(&self, parent: &Permission) -> bool {
        if self.category != parent.category {
            return false;
        }
        let actions_ok = parent.actions.iter().any(|a| a == "*")
            || self.actions.iter().all(|a| parent.actions.contains(a));
        if !actions_ok {
            return false;
        }
        match (&parent.resource, &self.resource) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(p), Some(c)) => p == c || resource_pattern_matches(p, c),
        }
    }
}

fn resource_pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern == value {
        return true;
    }
    globset::Glob::new(pattern)
        .map(|g| g.compile_matcher().is_match(value))
        .unwrap_or(false)
}

/// Token scope, derived from the permission categories it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenScope {
    System,
    User,
    Agent,
    Task,
}

impl TokenScope {
    /// admin/secrets/system/shell → System; agents → Agent; else Task.
    pub fn derive(permissions: &[Permission]) -> Self {
        let mut scope = TokenScope::Task;
        for perm in permissions {
            match perm.category.as_str() {
                "admin" | "secrets" | "system" | "shell" => return TokenScope::System,
                "agents" => scope = TokenScope::Agent,
                _ => {}
            }
        }
        scope
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A signed capability token. Treated as opaque by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub id: String,
    pub agent_id: String,
    pub permissions: Vec<Permission>,
    pub scope: TokenScope,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub issued_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    pub delegatable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_token_id: Option<String>,
    /// hex(HMAC-SHA-256(secret, canonical(id, agent_id, permissions, expires_at))).
    pub signature: String,
}

impl CapabilityToken {
    /// Canonical signing bytes: version, id, agent id, permissions
    /// (count, then category/actions/resource per permission), and the
    /// expiry timestamp.
    pub fn signing_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(256);
        data.push(SIGNING_VERSION);
        write_length_prefixed(&mut data, self.id.as_bytes());
        write_length_prefixed(&mut data, self.agent_id.as_bytes());
        data.extend_from_slice(&(self.permissions.len() as u32).to_le_bytes());
        for perm in &self.permissions {
            write_length_prefixed(&mut data, perm.category.as_bytes());
            data.extend_from_slice(&(perm.actions.len() as u32).to_le_bytes());
            for action in &perm.actions {
                write_length_prefixed(&mut data, action.as_bytes());
            }
            match &perm.resource {
                Some(resource) => {
                    data.push(0x01);
                    write_length_prefixed(&mut data, resource.as_bytes());
                }
                None => data.push(0x00),
            }
        }
        data.extend_from_slice(&self.expires_at.timestamp_millis().to_le_bytes());
        data
    }

    pub(crate) fn compute_signature(&self, secret: &[u8]) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| Error::Config("empty capability signing secret".into()))?;
        mac.update(&self.signing_data());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time signature verification.
    pub fn verify(&self, secret: &[u8]) -> bool {
        let Ok(expected) = self.compute_signature(secret) else {
            return false;
        };
        let Ok(provided) = hex::decode(&self.signature) else {
            return false;
        };
        let Ok(expected) = hex::decode(expected) else {
            return false;
        };
        provided.len() == expected.len() && bool::from(provided.ct_eq(&expected))
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// First-match permission test for an active token.
    pub fn grants(&self, category: &str, action: &str, resource: Option<&str>) -> bool {
        self.permissions
            .iter()
            .any(|p| p.allows(category, action, resource))
    }
}
