//! Policy file loading and built-in templates.
//!
//! File format (YAML): one section per surface, each with a `default`
//! decision and a `rules` list. Rule ids are optional; missing ids are
//! generated as `<surface>-<index>`.
//!
//! ```yaml
//! file:
//!   default: allow
//!   rules:
//!     - pattern: "**/.ssh/**"
//!       decision: block
//!       reason: credential theft
//! shell:
//!   default: approve
//!   rules:
//!     - command: "rm*"
//!       args: ["-rf"]
//!       decision: block
//! ```

use std::path::Path;
use std::sync::Arc;

use aegis_audit::AuditLog;
use aegis_domain::{Error, Result};
use serde::Deserialize;

use crate::engine::PolicyEngine;
use crate::rules::{Decision, FileOp, FileRule, NetworkRule, SecretRule, ShellRule};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PolicyDoc {
    #[serde(default)]
    file: Option<Section<FileRuleSpec>>,
    #[serde(default)]
    network: Option<Section<NetworkRuleSpec>>,
    #[serde(default)]
    shell: Option<Section<ShellRuleSpec>>,
    #[serde(default)]
    secret: Option<Section<SecretRuleSpec>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Section<R> {
    default: Decision,
    #[serde(default = "Vec::new")]
    rules: Vec<R>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRuleSpec {
    #[serde(default)]
    id: Option<String>,
    pattern: String,
    #[serde(default)]
    ops: Option<Vec<FileOp>>,
    decision: Decision,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NetworkRuleSpec {
    #[serde(default)]
    id: Option<String>,
    host: String,
    #[serde(default)]
    ports: Option<Vec<u16>>,
    #[serde(default)]
    protocols: Option<Vec<String>>,
    decision: Decision,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShellRuleSpec {
    #[serde(default)]
    id: Option<String>,
    command: String,
    #[serde(default)]
    args: Option<Vec<String>>,
    decision: Decision,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SecretRuleSpec {
    #[serde(default)]
    id: Option<String>,
    name: String,
    decision: Decision,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Load a policy engine from a YAML file. Sections left out keep the
/// engine's built-in defaults.
pub fn load_policy_file(path: &Path, audit: Arc<AuditLog>) -> Result<PolicyEngine> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("reading policy {}: {e}", path.display())))?;
    parse_policy(&raw, audit)
        .map_err(|e| Error::Config(format!("policy {}: {e}", path.display())))
}

fn parse_policy(raw: &str, audit: Arc<AuditLog>) -> Result<PolicyEngine> {
    let doc: PolicyDoc =
        serde_yaml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
    let engine = PolicyEngine::new(audit);

    if let Some(section) = doc.file {
        engine.set_default("file", section.default);
        for (i, spec) in section.rules.into_iter().enumerate() {
            engine.add_file_rule(FileRule {
                id: spec.id.unwrap_or_else(|| format!("file-{i}")),
                pattern: spec.pattern,
                ops: spec.ops,
                decision: spec.decision,
                priority: spec.priority,
                enabled: true,
                reason: spec.reason,
            })?;
        }
    }
    if let Some(section) = doc.network {
        engine.set_default("network", section.default);
        for (i, spec) in section.rules.into_iter().enumerate() {
            engine.add_network_rule(NetworkRule {
                id: spec.id.unwrap_or_else(|| format!("network-{i}")),
                host: spec.host,
                ports: spec.ports,
                protocols: spec.protocols,
                decision: spec.decision,
                priority: spec.priority,
                enabled: true,
                reason: spec.reason,
            })?;
        }
    }
    if let Some(section) = doc.shell {
        engine.set_default("shell", section.default);
        for (i, spec) in section.rules.into_iter().enumerate() {
            engine.add_shell_rule(ShellRule {
                id: spec.id.unwrap_or_else(|| format!("shell-{i}")),
                command: spec.command,
                args: spec.args,
                decision: spec.decision,
                priority: spec.priority,
                enabled: true,
                reason: spec.reason,
            })?;
        }
    }
    if let Some(section) = doc.secret {
        engine.set_default("secret", section.default);
        for (i, spec) in section.rules.into_iter().enumerate() {
            engine.add_secret_rule(SecretRule {
                id: spec.id.unwrap_or_else(|| format!("secret-{i}")),
                name: spec.name,
                decision: spec.decision,
                priority: spec.priority,
                enabled: true,
                reason: spec.reason,
            })?;
        }
    }

    Ok(engine)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Templates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const STRICT: &str = r#"
file:
  default: block
  rules:
    - id: tmp-rw
      pattern: "/tmp/**"
      decision: allow
network:
  default: block
  rules: []
shell:
  default: block
  rules: []
secret:
  default: block
  rules: []
"#;

const BALANCED: &str = r#"
file:
  default: allow
  rules:
    - id: ssh-keys
      pattern: "**/.ssh/**"
      decision: block
      priority: 100
      reason: credential theft
    - id: cloud-creds
      pattern: "**/.aws/**"
      decision: block
      priority: 100
      reason: credential theft
    - id: env-files
      pattern: "**/.env*"
      decision: approve
      priority: 90
    - id: system-secrets
      pattern: "/etc/shadow"
      decision: block
      priority: 100
network:
  default: approve
  rules:
    - id: localhost
      host: localhost
      decision: allow
      priority: 10
shell:
  default: approve
  rules:
    - id: recursive-rm
      command: "rm*"
      args: ["-rf*"]
      decision: block
      priority: 100
    - id: sudo
      command: "sudo*"
      decision: block
      priority: 100
    - id: read-only-basics
      command: "ls*"
      decision: allow
      priority: 10
secret:
  default: block
  rules:
    - id: public
      name: "PUBLIC_*"
      decision: allow
      priority: 10
"#;

const PERMISSIVE: &str = r#"
file:
  default: allow
  rules:
    - id: ssh-keys
      pattern: "**/.ssh/**"
      decision: block
      priority: 100
      reason: credential theft
network:
  default: allow
  rules: []
shell:
  default: allow
  rules:
    - id: recursive-rm
      command: "rm*"
      args: ["-rf*"]
      decision: approve
      priority: 100
secret:
  default: approve
  rules: []
"#;

/// Build one of the built-in template engines: `strict`, `balanced`,
/// `permissive`.
pub fn template(name: &str, audit: Arc<AuditLog>) -> Result<PolicyEngine> {
    let raw = match name {
        "strict" => STRICT,
        "balanced" => BALANCED,
        "permissive" => PERMISSIVE,
        other => {
            return Err(Error::Config(format!(
                "unknown policy template '{other}' (expected strict, balanced, permissive)"
            )))
        }
    };
    parse_policy(raw, audit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PolicyRequest;
    use aegis_audit::MemoryAuditStore;
    use aegis_domain::config::AuditConfig;

    fn audit() -> Arc<AuditLog> {
        AuditLog::new(AuditConfig::default(), Arc::new(MemoryAuditStore::new()))
    }

    #[test]
    fn templates_parse() {
        for name in ["strict", "balanced", "permissive"] {
            template(name, audit()).unwrap_or_else(|e| panic!("template {name}: {e}"));
        }
        assert!(template("bogus", audit()).is_err());
    }

    #[test]
    fn balanced_blocks_ssh_reads() {
        let engine = template("balanced", audit()).unwrap();
        let eval = engine.evaluate(
            &PolicyRequest::File {
                path: "/home/u/.ssh/id_rsa".into(),
                op: FileOp::Read,
            },
            None,
        );
        assert_eq!(eval.decision, Decision::Block);
        assert_eq!(eval.rule_id, "ssh-keys");
    }

    #[test]
    fn strict_defaults_block() {
        let engine = template("strict", audit()).unwrap();
        let eval = engine.evaluate(
            &PolicyRequest::Network {
                host: "example.com".into(),
                port: None,
                protocol: None,
            },
            None,
        );
        assert_eq!(eval.decision, Decision::Block);
        // But /tmp stays writable.
        let eval = engine.evaluate(
            &PolicyRequest::File {
                path: "/tmp/scratch".into(),
                op: FileOp::Write,
            },
            None,
        );
        assert_eq!(eval.decision, Decision::Allow);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(
            &path,
            r#"
file:
  default: allow
  rules:
    - pattern: "/var/secrets/**"
      decision: block
"#,
        )
        .unwrap();

        let engine = load_policy_file(&path, audit()).unwrap();
        let eval = engine.evaluate(
            &PolicyRequest::File {
                path: "/var/secrets/db".into(),
                op: FileOp::Read,
            },
            None,
        );
        assert_eq!(eval.decision, Decision::Block);
        assert_eq!(eval.rule_id, "file-0"); // generated id
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = parse_policy("file:\n  default: allow\n  bogus: 1\n", audit()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
