//! Courier webhook dispatch service.
//!
//! Main entry point. Prepares the database, applies the schema, runs the
//! delivery engine until a shutdown signal arrives, then drains in-flight
//! work before exiting.

mod config;

use std::{borrow::Cow, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{
    migrate::{self, Migration},
    Migrator, RealClock,
};
use courier_delivery::DeliveryEngine;
use sqlx::{
    postgres::{PgConnection, PgPoolOptions},
    Connection, PgPool,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting Courier webhook dispatch service");

    let config = Config::load()?;
    info!(
        database = %config.connection_summary(),
        workers = config.worker_count,
        pool_size = config.db_pool_size,
        max_attempts = config.max_attempts,
        backoff = %config.backoff_strategy,
        "Configuration loaded"
    );

    ensure_database_exists(&config).await?;

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&config, &db_pool).await?;

    let delivery_config = config.to_delivery_config()?;
    let mut engine = DeliveryEngine::new(db_pool.clone(), delivery_config, Arc::new(RealClock::new()))
        .context("Failed to create delivery engine")?;
    engine.start().context("Failed to start delivery engine")?;

    info!(workers = config.worker_count, "Courier is dispatching webhooks");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");
    let deadline = Instant::now() + Duration::from_secs(config.shutdown_timeout_secs);

    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "Delivery engine did not shut down cleanly");
    }

    if close_pool(&db_pool, deadline).await {
        info!("Database connections closed");
    } else {
        warn!("Shutdown deadline passed with connections still in use, exiting without closing");
    }

    info!("Courier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,courier=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the target database through the maintenance database when it
/// does not exist yet.
async fn ensure_database_exists(config: &Config) -> Result<()> {
    let mut conn = PgConnection::connect_with(&config.connect_options_for("postgres"))
        .await
        .context("Failed to connect to maintenance database")?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&config.db_name)
            .fetch_one(&mut conn)
            .await
            .context("Failed to look up target database")?;

    if !exists {
        let statement = format!("CREATE DATABASE {}", quote_identifier(&config.db_name));
        match sqlx::query(&statement).execute(&mut conn).await {
            Ok(_) => info!(database = %config.db_name, "Created database"),
            Err(e) if is_duplicate_database(sqlstate(&e).as_deref()) => {
                debug!(database = %config.db_name, "Database created by a concurrent instance");
            },
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to create database {}", config.db_name));
            },
        }
    }

    conn.close().await.context("Failed to close maintenance connection")?;
    Ok(())
}

fn sqlstate(error: &sqlx::Error) -> Option<Cow<'_, str>> {
    error.as_database_error().and_then(|db| db.code())
}

/// `duplicate_database`, or the catalog unique violation raised when two
/// `CREATE DATABASE` statements race.
fn is_duplicate_database(sqlstate: Option<&str>) -> bool {
    matches!(sqlstate, Some("42P04" | "23505"))
}

/// Closes the pool unless `deadline` passes first. Returns false on timeout.
async fn close_pool(pool: &PgPool, deadline: Instant) -> bool {
    tokio::time::timeout_at(deadline, pool.close()).await.is_ok()
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.db_pool_size)
            .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect_with(config.connect_options())
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Applies pending schema migrations. Any failure aborts startup.
async fn run_migrations(config: &Config, pool: &PgPool) -> Result<()> {
    let migrations: Vec<Migration> = match &config.migrations_dir {
        Some(dir) => migrate::load_dir(dir)
            .with_context(|| format!("Failed to read migrations from {}", dir.display()))?,
        None => migrate::embedded(),
    };

    let applied = Migrator::new(pool.clone())
        .apply(&migrations)
        .await
        .context("Database migration failed")?;

    info!(applied, known = migrations.len(), "Database migrations completed");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_identifier("webhooks"), "\"webhooks\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn racing_database_creation_counts_as_existing() {
        assert!(is_duplicate_database(Some("42P04")));
        assert!(is_duplicate_database(Some("23505")));
        assert!(!is_duplicate_database(Some("42501")));
        assert!(!is_duplicate_database(None));
    }

    #[tokio::test]
    async fn idle_pool_closes_before_deadline() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://courier@localhost/courier").unwrap();
        assert!(close_pool(&pool, Instant::now() + Duration::from_secs(1)).await);
        assert!(pool.is_closed());
    }
}
