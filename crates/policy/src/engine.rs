//! The policy engine itself.

use std::sync::Arc;

use aegis_audit::{AuditEntry, AuditLog, AuditOutcome};
use aegis_domain::config::SecurityConfig;
use aegis_domain::Result;
use parking_lot::RwLock;

use crate::pattern::path_within;
use crate::rules::{
    CompiledRule, Decision, FileOp, FileRule, NetworkRule, SecretRule, ShellRule,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests & evaluations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A resource access to evaluate.
#[derive(Debug, Clone)]
pub enum PolicyRequest {
    File {
        path: String,
        op: FileOp,
    },
    Network {
        host: String,
        port: Option<u16>,
        protocol: Option<String>,
    },
    Shell {
        command: String,
        args: Option<Vec<String>>,
    },
    Secret {
        name: String,
    },
}

impl PolicyRequest {
    fn surface(&self) -> &'static str {
        match self {
            PolicyRequest::File { .. } => "file",
            PolicyRequest::Network { .. } => "network",
            PolicyRequest::Shell { .. } => "shell",
            PolicyRequest::Secret { .. } => "secret",
        }
    }

    fn resource(&self) -> String {
        match self {
            PolicyRequest::File { path, .. } => path.clone(),
            PolicyRequest::Network { host, port, .. } => match port {
                Some(p) => format!("{host}:{p}"),
                None => host.clone(),
            },
            PolicyRequest::Shell { command, .. } => command.clone(),
            PolicyRequest::Secret { name } => name.clone(),
        }
    }
}

/// The result of one evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub decision: Decision,
    /// Matched rule id, or `"default"` / `"allowlist"` / `"allow-all"`.
    pub rule_id: String,
    pub reason: Option<String>,
    pub surface: &'static str,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rule sets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RuleSet {
    /// Rules in insertion order.
    rules: Vec<CompiledRule>,
    /// Indices into `rules`, kept sorted priority-desc / insertion-asc.
    order: Vec<usize>,
    default_decision: Decision,
}

impl RuleSet {
    fn new(default_decision: Decision) -> Self {
        Self {
            rules: Vec::new(),
            order: Vec::new(),
            default_decision,
        }
    }

    fn insert(&mut self, rule: CompiledRule) {
        self.rules.push(rule);
        self.resort();
    }

    fn resort(&mut self) {
        self.order = (0..self.rules.len()).collect();
        self.order
            .sort_by_key(|&i| (std::cmp::Reverse(self.rules[i].priority()), i));
    }

    fn remove(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id() != id);
        let removed = self.rules.len() != before;
        if removed {
            self.resort();
        }
        removed
    }

    fn set_enabled(&mut self, id: &str, value: bool) -> bool {
        for rule in &mut self.rules {
            if rule.id() == id {
                rule.set_enabled(value);
                return true;
            }
        }
        false
    }

    /// First enabled match in priority order.
    fn first_match<F: Fn(&CompiledRule) -> bool>(&self, pred: F) -> Option<&CompiledRule> {
        self.order
            .iter()
            .map(|&i| &self.rules[i])
            .find(|r| r.enabled() && pred(r))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PolicyEngine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Inner {
    file: RuleSet,
    network: RuleSet,
    shell: RuleSet,
    secret: RuleSet,
}

/// Evaluates resource requests against the four rule lists, then the
/// coarse allowlists, then the per-surface default.
pub struct PolicyEngine {
    inner: RwLock<Inner>,
    allowed_paths: Vec<String>,
    allowed_domains: Vec<String>,
    allow_all_paths: bool,
    allow_all_domains: bool,
    audit: Arc<AuditLog>,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine").finish_non_exhaustive()
    }
}

impl PolicyEngine {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self::with_defaults(audit, Decision::Allow, Decision::Allow, Decision::Allow, Decision::Block)
    }

    /// Engine with explicit per-surface defaults
    /// (file, network, shell, secret).
    pub fn with_defaults(
        audit: Arc<AuditLog>,
        file: Decision,
        network: Decision,
        shell: Decision,
        secret: Decision,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                file: RuleSet::new(file),
                network: RuleSet::new(network),
                shell: RuleSet::new(shell),
                secret: RuleSet::new(secret),
            }),
            allowed_paths: Vec::new(),
            allowed_domains: Vec::new(),
            allow_all_paths: false,
            allow_all_domains: false,
            audit,
        }
    }

    /// Attach the coarse allowlists from the security config. These apply
    /// only when no explicit rule matched.
    pub fn with_allowlists(mut self, security: &SecurityConfig) -> Self {
        self.allowed_paths = security.allowed_paths.clone();
        self.allowed_domains = security.allowed_domains.clone();
        self.allow_all_paths = security.allow_all_paths;
        self.allow_all_domains = security.allow_all_domains;
        self
    }

    // ── Rule management ────────────────────────────────────────────

    pub fn add_file_rule(&self, rule: FileRule) -> Result<()> {
        let compiled = CompiledRule::file(rule)?;
        self.inner.write().file.insert(compiled);
        Ok(())
    }

    pub fn add_network_rule(&self, rule: NetworkRule) -> Result<()> {
        let compiled = CompiledRule::network(rule)?;
        self.inner.write().network.insert(compiled);
        Ok(())
    }

    pub fn add_shell_rule(&self, rule: ShellRule) -> Result<()> {
        let compiled = CompiledRule::shell(rule)?;
        self.inner.write().shell.insert(compiled);
        Ok(())
    }

    pub fn add_secret_rule(&self, rule: SecretRule) -> Result<()> {
        let compiled = CompiledRule::secret(rule)?;
        self.inner.write().secret.insert(compiled);
        Ok(())
    }

    /// Remove a rule by id from whichever surface holds it.
    pub fn remove_rule(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        inner.file.remove(id)
            || inner.network.remove(id)
            || inner.shell.remove(id)
            || inner.secret.remove(id)
    }

    pub fn set_rule_enabled(&self, id: &str, value: bool) -> bool {
        let mut inner = self.inner.write();
        inner.file.set_enabled(id, value)
            || inner.network.set_enabled(id, value)
            || inner.shell.set_enabled(id, value)
            || inner.secret.set_enabled(id, value)
    }

    pub fn set_default(&self, surface: &str, decision: Decision) {
        let mut inner = self.inner.write();
        match surface {
            "file" => inner.file.default_decision = decision,
            "network" => inner.network.default_decision = decision,
            "shell" => inner.shell.default_decision = decision,
            "secret" => inner.secret.default_decision = decision,
            other => tracing::warn!(surface = %other, "unknown policy surface"),
        }
    }

    // ── Evaluation ─────────────────────────────────────────────────

    /// Evaluate a request for an actor. Always audited.
    pub fn evaluate(&self, request: &PolicyRequest, actor: Option<&str>) -> Evaluation {
        let evaluation = self.evaluate_silent(request);

        let outcome = match evaluation.decision {
            Decision::Allow | Decision::Approve => AuditOutcome::Success,
            Decision::Block => AuditOutcome::Blocked,
        };
        let mut entry = AuditEntry::new(
            format!("policy.{}", evaluation.surface),
            outcome,
        )
        .resource(evaluation.surface, request.resource())
        .details(serde_json::json!({
            "decision": evaluation.decision.as_str(),
            "rule": evaluation.rule_id,
        }));
        if let Some(actor) = actor {
            entry = entry.actor(actor);
        }
        self.audit.append(entry);

        evaluation
    }

    fn evaluate_silent(&self, request: &PolicyRequest) -> Evaluation {
        let inner = self.inner.read();
        let surface = request.surface();

        let (set, matched): (&RuleSet, Option<&CompiledRule>) = match request {
            PolicyRequest::File { path, op } => (
                &inner.file,
                inner.file.first_match(|r| r.matches_file(path, *op)),
            ),
            PolicyRequest::Network {
                host,
                port,
                protocol,
            } => (
                &inner.network,
                inner
                    .network
                    .first_match(|r| r.matches_network(host, *port, protocol.as_deref())),
            ),
            PolicyRequest::Shell { command, args } => (
                &inner.shell,
                inner
                    .shell
                    .first_match(|r| r.matches_shell(command, args.as_deref())),
            ),
            PolicyRequest::Secret { name } => (
                &inner.secret,
                inner.secret.first_match(|r| r.matches_secret(name)),
            ),
        };

        if let Some(rule) = matched {
            return Evaluation {
                decision: rule.decision(),
                rule_id: rule.id().to_string(),
                reason: rule.reason().map(String::from),
                surface,
            };
        }

        // No explicit rule: the coarse allowlists refine the default for
        // file and network surfaces.
        match request {
            PolicyRequest::File { path, .. } => {
                if self.allow_all_paths {
                    return Evaluation {
                        decision: Decision::Allow,
                        rule_id: "allow-all".into(),
                        reason: None,
                        surface,
                    };
                }
                if !self.allowed_paths.is_empty() {
                    let within = self.allowed_paths.iter().any(|b| path_within(b, path));
                    return Evaluation {
                        decision: if within { Decision::Allow } else { Decision::Block },
                        rule_id: "allowlist".into(),
                        reason: (!within).then(|| "path outside allowed roots".into()),
                        surface,
                    };
                }
            }
            PolicyRequest::Network { host, .. } => {
                if self.allow_all_domains {
                    return Evaluation {
                        decision: Decision::Allow,
                        rule_id: "allow-all".into(),
                        reason: None,
                        surface,
                    };
                }
                if !self.allowed_domains.is_empty() {
                    let allowed = self
                        .allowed_domains
                        .iter()
                        .any(|d| crate::pattern::host_matches(d, host));
                    return Evaluation {
                        decision: if allowed { Decision::Allow } else { Decision::Block },
                        rule_id: "allowlist".into(),
                        reason: (!allowed).then(|| "host outside allowed domains".into()),
                        surface,
                    };
                }
            }
            _ => {}
        }

        Evaluation {
            decision: set.default_decision,
            rule_id: "default".into(),
            reason: None,
            surface,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_audit::{AuditQuery, MemoryAuditStore};
    use aegis_domain::config::AuditConfig;

    fn make_engine() -> (PolicyEngine, Arc<AuditLog>) {
        let audit = AuditLog::new(AuditConfig::default(), Arc::new(MemoryAuditStore::new()));
        (PolicyEngine::new(audit.clone()), audit)
    }

    fn file_req(path: &str, op: FileOp) -> PolicyRequest {
        PolicyRequest::File {
            path: path.into(),
            op,
        }
    }

    #[test]
    fn default_when_no_rules() {
        let (engine, _) = make_engine();
        let eval = engine.evaluate(&file_req("/tmp/x", FileOp::Read), None);
        assert_eq!(eval.decision, Decision::Allow);
        assert_eq!(eval.rule_id, "default");
    }

    #[test]
    fn priority_desc_then_insertion_order() {
        let (engine, _) = make_engine();
        engine
            .add_file_rule(FileRule {
                id: "low".into(),
                pattern: "/tmp/**".into(),
                ops: None,
                decision: Decision::Allow,
                priority: 1,
                enabled: true,
                reason: None,
            })
            .unwrap();
        engine
            .add_file_rule(FileRule {
                id: "high".into(),
                pattern: "/tmp/**".into(),
                ops: None,
                decision: Decision::Block,
                priority: 10,
                enabled: true,
                reason: None,
            })
            .unwrap();
        engine
            .add_file_rule(FileRule {
                id: "high-later".into(),
                pattern: "/tmp/**".into(),
                ops: None,
                decision: Decision::Approve,
                priority: 10,
                enabled: true,
                reason: None,
            })
            .unwrap();

        let eval = engine.evaluate(&file_req("/tmp/a", FileOp::Read), None);
        // Higher priority wins; ties resolved by insertion order.
        assert_eq!(eval.rule_id, "high");
        assert_eq!(eval.decision, Decision::Block);
    }

    #[test]
    fn disabled_rules_never_match() {
        let (engine, _) = make_engine();
        engine
            .add_file_rule(FileRule {
                id: "r".into(),
                pattern: "/tmp/**".into(),
                ops: None,
                decision: Decision::Block,
                priority: 0,
                enabled: true,
                reason: None,
            })
            .unwrap();
        assert_eq!(
            engine.evaluate(&file_req("/tmp/a", FileOp::Read), None).decision,
            Decision::Block
        );

        engine.set_rule_enabled("r", false);
        assert_eq!(
            engine.evaluate(&file_req("/tmp/a", FileOp::Read), None).rule_id,
            "default"
        );
    }

    #[test]
    fn ssh_block_is_audited_with_rule_id() {
        let (engine, audit) = make_engine();
        engine
            .add_file_rule(FileRule {
                id: "no-ssh".into(),
                pattern: "**/.ssh/**".into(),
                ops: None,
                decision: Decision::Block,
                priority: 100,
                enabled: true,
                reason: Some("credential theft".into()),
            })
            .unwrap();

        let eval = engine.evaluate(
            &file_req("/home/u/.ssh/id_rsa", FileOp::Read),
            Some("calc"),
        );
        assert_eq!(eval.decision, Decision::Block);
        assert_eq!(eval.rule_id, "no-ssh");

        let entries = audit.query(&AuditQuery {
            action: Some("policy.file".into()),
            ..Default::default()
        });
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, aegis_audit::AuditOutcome::Blocked);
        assert_eq!(entries[0].details["rule"], "no-ssh");
        assert_eq!(entries[0].actor_id.as_deref(), Some("calc"));
    }

    #[test]
    fn file_op_scoping() {
        let (engine, _) = make_engine();
        engine
            .add_file_rule(FileRule {
                id: "ro".into(),
                pattern: "/etc/**".into(),
                ops: Some(vec![FileOp::Write, FileOp::Delete]),
                decision: Decision::Block,
                priority: 0,
                enabled: true,
                reason: None,
            })
            .unwrap();

        assert_eq!(
            engine.evaluate(&file_req("/etc/hosts", FileOp::Read), None).rule_id,
            "default"
        );
        assert_eq!(
            engine
                .evaluate(&file_req("/etc/hosts", FileOp::Write), None)
                .decision,
            Decision::Block
        );
    }

    #[test]
    fn network_port_constraint_needs_port() {
        let (engine, _) = make_engine();
        engine
            .add_network_rule(NetworkRule {
                id: "https-only".into(),
                host: "*.example.com".into(),
                ports: Some(vec![443]),
                protocols: None,
                decision: Decision::Allow,
                priority: 5,
                enabled: true,
                reason: None,
            })
            .unwrap();

        let with_port = PolicyRequest::Network {
            host: "api.example.com".into(),
            port: Some(443),
            protocol: None,
        };
        assert_eq!(engine.evaluate(&with_port, None).rule_id, "https-only");

        // Absent port = rule does not match.
        let without_port = PolicyRequest::Network {
            host: "api.example.com".into(),
            port: None,
            protocol: None,
        };
        assert_eq!(engine.evaluate(&without_port, None).rule_id, "default");
    }

    #[test]
    fn shell_arg_patterns() {
        let (engine, _) = make_engine();
        engine
            .add_shell_rule(ShellRule {
                id: "rm-rf".into(),
                command: "rm*".into(),
                args: Some(vec!["-rf".into()]),
                decision: Decision::Block,
                priority: 0,
                enabled: true,
                reason: None,
            })
            .unwrap();

        let dangerous = PolicyRequest::Shell {
            command: "rm".into(),
            args: Some(vec!["-rf".into(), "/".into()]),
        };
        assert_eq!(engine.evaluate(&dangerous, None).decision, Decision::Block);

        let benign = PolicyRequest::Shell {
            command: "rm".into(),
            args: Some(vec!["file.txt".into()]),
        };
        assert_eq!(engine.evaluate(&benign, None).rule_id, "default");

        // Rule requires args; request without args never matches.
        let bare = PolicyRequest::Shell {
            command: "rm".into(),
            args: None,
        };
        assert_eq!(engine.evaluate(&bare, None).rule_id, "default");
    }

    #[test]
    fn secret_glob() {
        let (engine, _) = make_engine();
        engine
            .add_secret_rule(SecretRule {
                id: "aws".into(),
                name: "AWS_*".into(),
                decision: Decision::Block,
                priority: 0,
                enabled: true,
                reason: None,
            })
            .unwrap();

        let req = PolicyRequest::Secret {
            name: "AWS_SECRET_ACCESS_KEY".into(),
        };
        assert_eq!(engine.evaluate(&req, None).decision, Decision::Block);
        // Secret surface default is Block in `new`.
        let req = PolicyRequest::Secret {
            name: "HOME".into(),
        };
        assert_eq!(engine.evaluate(&req, None).decision, Decision::Block);
        assert_eq!(engine.evaluate(&req, None).rule_id, "default");
    }

    #[test]
    fn allowlist_applies_after_rules() {
        let audit = AuditLog::new(AuditConfig::default(), Arc::new(MemoryAuditStore::new()));
        let security = SecurityConfig {
            allowed_paths: vec!["/tmp".into()],
            ..Default::default()
        };
        let engine = PolicyEngine::new(audit).with_allowlists(&security);

        assert_eq!(
            engine.evaluate(&file_req("/tmp/ok", FileOp::Read), None).decision,
            Decision::Allow
        );
        let eval = engine.evaluate(&file_req("/tmp-other/x", FileOp::Read), None);
        assert_eq!(eval.decision, Decision::Block);
        assert_eq!(eval.rule_id, "allowlist");
    }

    #[test]
    fn remove_rule() {
        let (engine, _) = make_engine();
        engine
            .add_secret_rule(SecretRule {
                id: "s".into(),
                name: "X_*".into(),
                decision: Decision::Allow,
                priority: 0,
                enabled: true,
                reason: None,
            })
            .unwrap();
        assert!(engine.remove_rule("s"));
        assert!(!engine.remove_rule("s"));
    }
}
