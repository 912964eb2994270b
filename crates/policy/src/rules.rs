//! Rule types for the four policy surfaces.

use aegis_domain::Result;
use globset::GlobMatcher;
use serde::{Deserialize, Serialize};

use crate::pattern::{compile_glob, compile_path_glob, host_matches};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decisions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block,
    Approve,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Block => "block",
            Decision::Approve => "approve",
        }
    }
}

/// File operations a rule can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    Read,
    Write,
    Delete,
    List,
}

impl FileOp {
    pub fn as_str(self) -> &'static str {
        match self {
            FileOp::Read => "read",
            FileOp::Write => "write",
            FileOp::Delete => "delete",
            FileOp::List => "list",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rule definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRule {
    pub id: String,
    /// Path glob (`**` segments, `*` one segment, `?` one char).
    pub pattern: String,
    /// When set, only these operations match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ops: Option<Vec<FileOp>>,
    pub decision: Decision,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRule {
    pub id: String,
    /// Exact host or leading `*.` wildcard.
    pub host: String,
    /// When set, the request must carry a matching port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
    /// When set, the request must carry a matching protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Vec<String>>,
    pub decision: Decision,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRule {
    pub id: String,
    /// Glob over the full command string.
    pub command: String,
    /// When set, every pattern must match at least one argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    pub decision: Decision,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRule {
    pub id: String,
    /// Glob over the secret/variable name.
    pub name: String,
    pub decision: Decision,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn d_true() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compiled rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A rule with its patterns compiled once at insertion.
pub(crate) enum CompiledRule {
    File {
        rule: FileRule,
        glob: GlobMatcher,
    },
    Network {
        rule: NetworkRule,
    },
    Shell {
        rule: ShellRule,
        command: GlobMatcher,
        args: Option<Vec<GlobMatcher>>,
    },
    Secret {
        rule: SecretRule,
        name: GlobMatcher,
    },
}

impl CompiledRule {
    pub(crate) fn file(rule: FileRule) -> Result<Self> {
        let glob = compile_path_glob(&rule.pattern)?;
        Ok(CompiledRule::File { rule, glob })
    }

    pub(crate) fn network(rule: NetworkRule) -> Result<Self> {
        Ok(CompiledRule::Network { rule })
    }

    pub(crate) fn shell(rule: ShellRule) -> Result<Self> {
        let command = compile_glob(&rule.command)?;
        let args = match &rule.args {
            Some(patterns) => Some(
                patterns
                    .iter()
                    .map(|p| compile_glob(p))
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => None,
        };
        Ok(CompiledRule::Shell {
            rule,
            command,
            args,
        })
    }

    pub(crate) fn secret(rule: SecretRule) -> Result<Self> {
        let name = compile_glob(&rule.name)?;
        Ok(CompiledRule::Secret { rule, name })
    }

    pub(crate) fn id(&self) -> &str {
        match self {
            CompiledRule::File { rule, .. } => &rule.id,
            CompiledRule::Network { rule } => &rule.id,
            CompiledRule::Shell { rule, .. } => &rule.id,
            CompiledRule::Secret { rule, .. } => &rule.id,
        }
    }

    pub(crate) fn priority(&self) -> i32 {
        match self {
            CompiledRule::File { rule, .. } => rule.priority,
            CompiledRule::Network { rule } => rule.priority,
            CompiledRule::Shell { rule, .. } => rule.priority,
            CompiledRule::Secret { rule, .. } => rule.priority,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        match self {
            CompiledRule::File { rule, .. } => rule.enabled,
            CompiledRule::Network { rule } => rule.enabled,
            CompiledRule::Shell { rule, .. } => rule.enabled,
            CompiledRule::Secret { rule, .. } => rule.enabled,
        }
    }

    pub(crate) fn set_enabled(&mut self, value: bool) {
        match self {
            CompiledRule::File { rule, .. } => rule.enabled = value,
            CompiledRule::Network { rule } => rule.enabled = value,
            CompiledRule::Shell { rule, .. } => rule.enabled = value,
            CompiledRule::Secret { rule, .. } => rule.enabled = value,
        }
    }

    pub(crate) fn decision(&self) -> Decision {
        match self {
            CompiledRule::File { rule, .. } => rule.decision,
            CompiledRule::Network { rule } => rule.decision,
            CompiledRule::Shell { rule, .. } => rule.decision,
            CompiledRule::Secret { rule, .. } => rule.decision,
        }
    }

    pub(crate) fn reason(&self) -> Option<&str> {
        match self {
            CompiledRule::File { rule, .. } => rule.reason.as_deref(),
            CompiledRule::Network { rule } => rule.reason.as_deref(),
            CompiledRule::Shell { rule, .. } => rule.reason.as_deref(),
            CompiledRule::Secret { rule, .. } => rule.reason.as_deref(),
        }
    }

    /// Whether the rule matches a file request.
    pub(crate) fn matches_file(&self, path: &str, op: FileOp) -> bool {
        let CompiledRule::File { rule, glob } = self else {
            return false;
        };
        if let Some(ops) = &rule.ops {
            if !ops.contains(&op) {
                return false;
            }
        }
        glob.is_match(path)
    }

    /// Whether the rule matches a network request. Port/protocol
    /// constraints only match when the request carries that field.
    pub(crate) fn matches_network(
        &self,
        host: &str,
        port: Option<u16>,
        protocol: Option<&str>,
    ) -> bool {
        let CompiledRule::Network { rule } = self else {
            return false;
        };
        if !host_matches(&rule.host, host) {
            return false;
        }
        if let Some(ports) = &rule.ports {
            match port {
                Some(p) if ports.contains(&p) => {}
                _ => return false,
            }
        }
        if let Some(protocols) = &rule.protocols {
            match protocol {
                Some(p) if protocols.iter().any(|rp| rp.eq_ignore_ascii_case(p)) => {}
                _ => return false,
            }
        }
        true
    }

    pub(crate) fn matches_shell(&self, command: &str, args: Option<&[String]>) -> bool {
        let CompiledRule::Shell {
            command: cmd_glob,
            args: arg_globs,
            ..
        } = self
        else {
            return false;
        };
        if !cmd_glob.is_match(command) {
            return false;
        }
        if let Some(arg_globs) = arg_globs {
            let Some(args) = args else { return false };
            return arg_globs
                .iter()
                .all(|g| args.iter().any(|a| g.is_match(a)));
        }
        true
    }

    pub(crate) fn matches_secret(&self, secret: &str) -> bool {
        let CompiledRule::Secret { name, .. } = self else {
            return false;
        };
        name.is_match(secret)
    }
}
