//! Checksummed, idempotent schema migrations.
//!
//! Migration files are embedded at compile time. Each is applied at most
//! once inside a transaction; a checksum mismatch against an applied
//! migration aborts startup rather than silently diverging.

use aegis_domain::{Error, Result};
use sha2::{Digest, Sha256};

const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_init",
    include_str!("../../migrations/0001_init.sql"),
)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: usize,
    pub skipped: usize,
}

fn checksum(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}

/// Apply pending migrations. Running twice on the same files applies
/// nothing the second time and reports `applied = 0`.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<MigrationReport> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
             name       TEXT PRIMARY KEY,
             checksum   TEXT NOT NULL,
             applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
         )",
    )
    .execute(pool)
    .await
    .map_err(|e| Error::Storage(format!("creating _migrations: {e}")))?;

    let mut report = MigrationReport {
        applied: 0,
        skipped: 0,
    };

    for (name, sql) in MIGRATIONS {
        let sum = checksum(sql);
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT checksum FROM _migrations WHERE name = $1")
                .bind(name)
                .fetch_optional(pool)
                .await
                .map_err(|e| Error::Storage(format!("reading _migrations: {e}")))?;

        match existing {
            Some((applied_sum,)) if applied_sum == sum => {
                report.skipped += 1;
                continue;
            }
            Some(_) => {
                return Err(Error::Storage(format!(
                    "migration '{name}' was applied with different content"
                )));
            }
            None => {}
        }

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| Error::Storage(format!("begin migration tx: {e}")))?;
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Storage(format!("applying '{name}': {e}")))?;
        sqlx::query("INSERT INTO _migrations (name, checksum) VALUES ($1, $2)")
            .bind(name)
            .bind(&sum)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Storage(format!("recording '{name}': {e}")))?;
        tx.commit()
            .await
            .map_err(|e| Error::Storage(format!("committing '{name}': {e}")))?;

        tracing::info!(migration = %name, "migration applied");
        report.applied += 1;
    }

    Ok(report)
}
