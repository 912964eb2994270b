//! Agent manifests — the declarative description of an agent.
//!
//! A manifest carries identity, permissions, limits, trust level, and tool
//! configuration. It may be signed: the signature is
//! `hex(HMAC-SHA-256(secret, canonical_json(manifest \ {signature, signedAt})))`
//! where canonical JSON has sorted keys (serde_json's default object
//! ordering).

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::agent::{AgentLimits, PermissionGrant, TrustLevel};
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool reference in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolRef {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// The agent manifest. Unknown fields are rejected at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentManifest {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub permission_grants: Vec<PermissionGrant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<TrustLevel>,
    #[serde(default)]
    pub limits: AgentLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_model: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolRef>,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub a2a_skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<chrono::DateTime<chrono::Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsing & validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl AgentManifest {
    /// Parse and validate a manifest from JSON.
    pub fn parse(json: &str) -> Result<Self> {
        let manifest: AgentManifest = serde_json::from_str(json)
            .map_err(|e| Error::Validation(format!("manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        // Agent ids are used in file paths, SQL rows, and wire frames.
        static ID_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
        let id_re = ID_RE.get_or_init(|| {
            regex::Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("static regex")
        });
        if !id_re.is_match(&self.id) {
            return Err(Error::Validation(format!(
                "manifest id '{}' must match [a-z0-9][a-z0-9_-]{{0,63}}",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(Error::Validation("manifest name must not be empty".into()));
        }
        if self.name.len() > 128 {
            return Err(Error::Validation("manifest name too long (max 128)".into()));
        }
        for grant in &self.permission_grants {
            if grant.category.trim().is_empty() || grant.actions.is_empty() {
                return Err(Error::Validation(
                    "permission grant needs a category and at least one action".into(),
                ));
            }
        }
        Ok(())
    }

    /// Serialize back to JSON (round-trips through [`AgentManifest::parse`]).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    // ── Signing ────────────────────────────────────────────────────

    /// Canonical JSON of the manifest with `signature`/`signedAt` removed.
    /// serde_json's default `Map` is ordered, so keys come out sorted.
    pub fn canonical_json(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("signature");
            obj.remove("signedAt");
        }
        Ok(serde_json::to_string(&value)?)
    }

    /// Compute the manifest signature with the given secret.
    pub fn compute_signature(&self, secret: &[u8]) -> Result<String> {
        let canonical = self.canonical_json()?;
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| Error::Config("empty manifest signing secret".into()))?;
        mac.update(canonical.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Sign in place, stamping `signed_at`.
    pub fn sign(&mut self, secret: &[u8]) -> Result<()> {
        self.signed_at = Some(chrono::Utc::now());
        self.signature = Some(self.compute_signature(secret)?);
        Ok(())
    }

    /// Verify the signature in constant time. A manifest without a
    /// signature fails verification.
    pub fn verify_signature(&self, secret: &[u8]) -> Result<()> {
        let provided = self
            .signature
            .as_deref()
            .ok_or_else(|| Error::PermissionDenied("manifest is not signed".into()))?;
        let expected = self.compute_signature(secret)?;
        let provided_raw = hex::decode(provided)
            .map_err(|_| Error::PermissionDenied("malformed manifest signature".into()))?;
        let expected_raw = hex::decode(&expected).expect("hex we just encoded");
        if provided_raw.len() != expected_raw.len()
            || !bool::from(provided_raw.ct_eq(&expected_raw))
        {
            return Err(Error::PermissionDenied("manifest signature mismatch".into()));
        }
        Ok(())
    }
}
