//! Versioned schema migrations for the relational backend.
//!
//! The stream is embedded and append-only: numeric identifiers increase
//! monotonically and already-shipped entries are never edited. The runner
//! serializes instances with a session advisory lock so exactly one server
//! migrates at a time; `manual` deployments only verify the version.

use tokio_postgres::error::SqlState;
use tokio_postgres::Client;

use crate::error::{StoreError, StoreResult};

use super::pool::map_pg_error;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Session advisory-lock key guarding the migration stream.
const MIGRATION_LOCK_KEY: i64 = 0x0064_6974_746f_6673;

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial namespace schema",
        sql: r#"
CREATE TABLE files (
    id UUID PRIMARY KEY,
    share_name TEXT NOT NULL,
    path TEXT NOT NULL,
    file_type SMALLINT NOT NULL,
    mode BIGINT NOT NULL CHECK (mode >= 0 AND mode <= 4095),
    uid BIGINT NOT NULL,
    gid BIGINT NOT NULL,
    size BIGINT NOT NULL DEFAULT 0 CHECK (size >= 0),
    atime BIGINT NOT NULL,
    mtime BIGINT NOT NULL,
    ctime BIGINT NOT NULL,
    creation_time BIGINT NOT NULL,
    link_target TEXT NOT NULL DEFAULT '',
    content_id TEXT NOT NULL DEFAULT '',
    device_major BIGINT,
    device_minor BIGINT,
    CHECK (file_type <> 2 OR link_target <> ''),
    CHECK (file_type IN (3, 4) OR (device_major IS NULL AND device_minor IS NULL))
);

CREATE INDEX files_share_path_idx ON files (share_name, path);

CREATE TABLE parent_child_map (
    parent_id UUID NOT NULL REFERENCES files (id) ON DELETE CASCADE,
    child_id UUID NOT NULL REFERENCES files (id) ON DELETE CASCADE,
    child_name TEXT NOT NULL,
    PRIMARY KEY (parent_id, child_name)
);

CREATE TABLE link_counts (
    file_id UUID PRIMARY KEY REFERENCES files (id) ON DELETE CASCADE,
    link_count BIGINT NOT NULL CHECK (link_count >= 0)
);

CREATE TABLE shares (
    share_name TEXT PRIMARY KEY,
    root_file_id UUID NOT NULL REFERENCES files (id),
    read_only BOOLEAN NOT NULL DEFAULT FALSE,
    require_auth BOOLEAN NOT NULL DEFAULT FALSE,
    allowed_auth_methods TEXT[] NOT NULL DEFAULT '{}',
    denied_clients TEXT[] NOT NULL DEFAULT '{}',
    allowed_clients TEXT[] NOT NULL DEFAULT '{}',
    squash SMALLINT,
    map_uid BIGINT,
    map_gid BIGINT
);

CREATE TABLE server_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#,
    },
    Migration {
        version: 2,
        name: "reverse edge lookups for hard links",
        sql: "CREATE INDEX parent_child_map_child_idx ON parent_child_map (child_id);",
    },
];

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Apply every pending migration under the advisory lock.
pub async fn run(client: &mut Client) -> StoreResult<()> {
    client
        .query("SELECT pg_advisory_lock($1)", &[&MIGRATION_LOCK_KEY])
        .await
        .map_err(map_pg_error)?;
    let outcome = apply_pending(client).await;
    let unlocked = client.query("SELECT pg_advisory_unlock($1)", &[&MIGRATION_LOCK_KEY]).await;
    outcome?;
    unlocked.map_err(map_pg_error)?;
    Ok(())
}

async fn apply_pending(client: &mut Client) -> StoreResult<()> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .await
        .map_err(map_pg_error)?;

    let row = client
        .query_one("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", &[])
        .await
        .map_err(map_pg_error)?;
    let current: i64 = row.get(0);

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let txn = client.transaction().await.map_err(map_pg_error)?;
        txn.batch_execute(migration.sql).await.map_err(map_pg_error)?;
        txn.execute(
            "INSERT INTO schema_migrations (version, name) VALUES ($1, $2)",
            &[&migration.version, &migration.name],
        )
        .await
        .map_err(map_pg_error)?;
        txn.commit().await.map_err(map_pg_error)?;
        tracing::info!(version = migration.version, name = migration.name, "applied migration");
    }
    Ok(())
}

/// Manual mode: refuse to serve against a missing or stale schema.
pub async fn verify(client: &Client) -> StoreResult<()> {
    let row = client
        .query_one("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", &[])
        .await
        .map_err(|err| match err.code() {
            Some(state) if *state == SqlState::UNDEFINED_TABLE => {
                StoreError::io("schema is not initialized; apply migrations first")
            }
            _ => map_pg_error(err),
        })?;
    let current: i64 = row.get(0);
    let latest = latest_version();
    if current < latest {
        return Err(StoreError::io(format!(
            "schema version {current} is behind {latest}; apply migrations first"
        )));
    }
    Ok(())
}
