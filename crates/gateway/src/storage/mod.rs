//! Persistence: the Postgres pool, the migration runner, agent records,
//! and the cluster-wide job lock.

mod agents;
mod locks;
mod migrate;

pub use agents::{AgentRecord, AgentStore, MemoryAgentStore, PgAgentStore};
pub use locks::PgJobLock;
pub use migrate::{migrate, MigrationReport};

use aegis_domain::config::DatabaseConfig;
use aegis_domain::{Error, Result};

/// Open the shared pool from config. `None` when no database is
/// configured (dev mode runs on in-memory stores).
pub async fn connect(config: &DatabaseConfig) -> Result<Option<sqlx::PgPool>> {
    let Some(url) = &config.url else {
        return Ok(None);
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await
        .map_err(|e| Error::Storage(format!("connecting to database: {e}")))?;
    Ok(Some(pool))
}

/// Derive the two 32-bit advisory-lock keys from a lock name: the first
/// 8 bytes of SHA-256 split in half.
pub fn advisory_keys(name: &str) -> (i32, i32) {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(name.as_bytes());
    let k1 = i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let k2 = i32::from_be_bytes([digest[4], digest[5], digest[6], digest[7]]);
    (k1, k2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_keys_are_stable_and_distinct() {
        let a = advisory_keys("aegis-gateway-leader");
        let b = advisory_keys("aegis-gateway-leader");
        assert_eq!(a, b);

        let c = advisory_keys("job:heartbeat");
        assert_ne!(a, c);
    }
}
