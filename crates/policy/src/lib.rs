//! Policy engine: prioritized rule evaluation for file, network, shell,
//! and secret requests.
//!
//! Evaluation is deterministic: enabled rules are tried in priority-desc
//! order (ties broken by insertion order) and the first match wins; when
//! nothing matches, the surface's default decision applies. Every
//! evaluation is audited with the matched rule id.

mod engine;
mod loader;
mod pattern;
mod rules;

pub use engine::{Evaluation, PolicyEngine, PolicyRequest};
pub use loader::{load_policy_file, template};
pub use pattern::{host_matches, path_within};
pub use rules::{Decision, FileOp, FileRule, NetworkRule, SecretRule, ShellRule};
