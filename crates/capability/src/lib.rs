//! Capability tokens: unforgeable, time-bounded grants of permission sets
//! to agents.
//!
//! Tokens are HMAC-SHA-256 signed over a canonical byte serialization and
//! verified in constant time. Delegation re-issues a subset of a parent
//! token's permissions with a bounded lifetime; delegated tokens can never
//! be delegated again.

mod manager;
mod token;

pub use manager::{CapabilityManager, GrantRequest};
pub use token::{CapabilityToken, Permission, TokenScope};
