//! Isolated Postgres databases for integration tests.
//!
//! Each test gets a freshly created database migrated with the real
//! migrator, so tests exercise the exact schema production runs against.
//! Requires `DATABASE_URL` pointing at a server where the user may create
//! databases.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use courier_core::{migrate, Migrator};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

static ADMIN_POOL: tokio::sync::OnceCell<PgPool> = tokio::sync::OnceCell::const_new();

// Limits concurrent CREATE DATABASE calls across tests in one process.
static DB_CREATION_SEMAPHORE: Semaphore = Semaphore::const_new(3);

/// Returns true when `DATABASE_URL` is set.
pub fn database_url_available() -> bool {
    std::env::var("DATABASE_URL").is_ok_and(|url| !url.is_empty())
}

/// A dedicated database created for one test.
#[derive(Debug)]
pub struct IsolatedTestDatabase {
    pool: PgPool,
    database_name: String,
}

impl IsolatedTestDatabase {
    /// Creates and migrates a new database.
    pub async fn new() -> Result<Self> {
        Self::with_pool_size(8).await
    }

    /// Creates a new database whose pool holds up to `max_connections`.
    ///
    /// Worker pools hold one connection per unit, so engine tests need a
    /// pool larger than their worker count.
    pub async fn with_pool_size(max_connections: u32) -> Result<Self> {
        let admin_pool = create_admin_pool().await?;
        let database_name = format!("courier_test_{}", Uuid::new_v4().simple());

        create_database(&admin_pool, &database_name).await?;
        let pool = create_database_pool(&database_name, max_connections).await?;

        Migrator::new(pool.clone())
            .apply(&migrate::embedded())
            .await
            .with_context(|| format!("failed to migrate test database {database_name}"))?;

        info!("created isolated test database: {}", database_name);

        Ok(Self { pool, database_name })
    }

    /// Access to the database pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The generated database name.
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Closes the pool and drops the database.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;
        let admin_pool = create_admin_pool().await?;
        drop_database_immediate(&admin_pool, &self.database_name).await
    }
}

/// Creates an empty database.
pub async fn create_database(admin_pool: &PgPool, database_name: &str) -> Result<()> {
    let start_time = Instant::now();

    let _permit = DB_CREATION_SEMAPHORE
        .acquire()
        .await
        .context("database creation semaphore closed")?;

    sqlx::query(&format!("CREATE DATABASE \"{database_name}\""))
        .execute(admin_pool)
        .await
        .with_context(|| format!("failed to create database {database_name}"))?;

    let duration = start_time.elapsed();
    if duration > Duration::from_millis(500) {
        warn!("Database creation took {}ms for {}", duration.as_millis(), database_name);
    } else {
        debug!("created database {} in {}ms", database_name, duration.as_millis());
    }

    Ok(())
}

/// Drops a database, terminating any remaining connections first.
pub async fn drop_database_immediate(admin_pool: &PgPool, database_name: &str) -> Result<()> {
    let _ = sqlx::query(
        "SELECT pg_terminate_backend(pid)
         FROM pg_stat_activity
         WHERE datname = $1
         AND pid <> pg_backend_pid()",
    )
    .bind(database_name)
    .execute(admin_pool)
    .await;

    if sqlx::query(&format!("DROP DATABASE IF EXISTS \"{database_name}\" WITH (FORCE)"))
        .execute(admin_pool)
        .await
        .is_err()
    {
        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{database_name}\""))
            .execute(admin_pool)
            .await
            .with_context(|| format!("failed to drop database: {database_name}"))?;
    }

    Ok(())
}

/// Creates or reuses the maintenance-database pool used to create and drop
/// test databases.
pub async fn create_admin_pool() -> Result<PgPool> {
    if let Some(pool) = ADMIN_POOL.get() {
        if !pool.is_closed() {
            return Ok(pool.clone());
        }
    }

    let pool = ADMIN_POOL
        .get_or_try_init(|| async {
            let opts = connect_options()?.database("postgres");

            let pool = PgPoolOptions::new()
                .max_connections(2)
                .min_connections(0)
                .max_lifetime(Duration::from_secs(300))
                .acquire_timeout(Duration::from_secs(3))
                .connect_with(opts)
                .await
                .context("failed to connect to admin database")?;

            anyhow::Ok(pool)
        })
        .await?;

    Ok(pool.clone())
}

/// Creates a pool for a specific test database.
pub async fn create_database_pool(database_name: &str, max_connections: u32) -> Result<PgPool> {
    let opts = connect_options()?.database(database_name);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(0)
        .max_lifetime(Duration::from_secs(300))
        .idle_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(opts)
        .await
        .with_context(|| {
            format!("failed to create connection pool for database: {database_name}")
        })?;

    Ok(pool)
}

fn connect_options() -> Result<PgConnectOptions> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;

    database_url.parse::<PgConnectOptions>().context("failed to parse DATABASE_URL")
}
