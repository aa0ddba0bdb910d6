//! Connection pooling and error mapping for the relational backend.

use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use tokio_postgres::config::SslMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tracing::warn;

use crate::config::{SqlConfig, SslModeOption};
use crate::error::{StoreError, StoreResult};

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

/// Driver-level connection parameters from the store configuration.
pub fn pg_config(config: &SqlConfig) -> tokio_postgres::Config {
    let mut pg = tokio_postgres::Config::new();
    pg.host(&config.host)
        .port(config.port)
        .dbname(&config.database)
        .user(&config.user)
        .password(&config.password)
        .ssl_mode(map_ssl_mode(config.ssl_mode))
        .connect_timeout(config.connect_timeout());
    if let Some(ms) = config.statement_timeout_ms {
        pg.options(&format!("-c statement_timeout={ms}"));
    }
    pg
}

/// The driver only distinguishes whether TLS is mandatory; certificate
/// verification depth is the TLS connector's concern.
fn map_ssl_mode(mode: SslModeOption) -> SslMode {
    match mode {
        SslModeOption::Disable => SslMode::Disable,
        SslModeOption::Prefer => SslMode::Prefer,
        SslModeOption::Require | SslModeOption::VerifyCa | SslModeOption::VerifyFull => {
            SslMode::Require
        }
    }
}

pub async fn build_pool(config: &SqlConfig) -> StoreResult<PgPool> {
    let manager = PostgresConnectionManager::new(pg_config(config), NoTls);
    Pool::builder()
        .max_size(config.max_connections)
        .min_idle(Some(config.min_connections))
        .max_lifetime(config.max_connection_lifetime())
        .idle_timeout(config.max_connection_idle())
        .connection_timeout(config.connect_timeout())
        .reaper_rate(config.health_check_period())
        .build(manager)
        .await
        .map_err(map_pg_error)
}

/// Map a driver error onto the store taxonomy. Constraint violations turn
/// into their namespace meanings; serialization failures and deadlocks are
/// transient and marked retryable.
pub fn map_pg_error(err: tokio_postgres::Error) -> StoreError {
    if let Some(state) = err.code() {
        if *state == SqlState::UNIQUE_VIOLATION {
            return StoreError::AlreadyExists { path: err.to_string() };
        }
        if *state == SqlState::FOREIGN_KEY_VIOLATION {
            return StoreError::not_found(err.to_string());
        }
        if *state == SqlState::T_R_SERIALIZATION_FAILURE
            || *state == SqlState::T_R_DEADLOCK_DETECTED
        {
            warn!(code = state.code(), "transient database conflict");
            return StoreError::retryable_io(format!("database conflict: {err}"));
        }
        if *state == SqlState::DISK_FULL || *state == SqlState::OUT_OF_MEMORY {
            return StoreError::NoSpace;
        }
        return StoreError::io(format!("database: {err}"));
    }
    // No SQLSTATE means the connection itself failed; safe to retry.
    StoreError::retryable_io(format!("database connection: {err}"))
}

pub fn map_run_error(err: bb8::RunError<tokio_postgres::Error>) -> StoreError {
    match err {
        bb8::RunError::User(inner) => map_pg_error(inner),
        bb8::RunError::TimedOut => StoreError::retryable_io("connection pool checkout timed out"),
    }
}
