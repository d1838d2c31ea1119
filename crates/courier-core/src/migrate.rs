//! Versioned schema migrations applied exactly once across instances.
//!
//! Every process runs the migrator at startup. Concurrent runs serialize on an
//! exclusive lock of the `_sql_migrations` table held for the whole migration
//! transaction, so each migration file is executed by exactly one instance and
//! recorded only once all of its statements succeeded.

use std::{collections::HashSet, path::Path};

use sqlx::{PgConnection, PgPool};
use tracing::{debug, error, info, warn};

use crate::{
    error::{CoreError, Result},
    models::MigrationRecord,
};

/// A single migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Numeric identifier; migrations apply in ascending order.
    pub id: i64,
    /// File name, kept for the migration record.
    pub name: String,
    /// One or more SQL statements.
    pub sql: String,
}

impl Migration {
    /// Creates a migration from its parts.
    pub fn new(id: i64, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self { id, name: name.into(), sql: sql.into() }
    }

    /// Creates a migration whose id is the leading number of `file_name`.
    ///
    /// `0001_create_webhooks.sql` and `1.sql` both have id 1.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the name has no numeric prefix.
    pub fn from_file(file_name: &str, sql: impl Into<String>) -> Result<Self> {
        let digits: String = file_name.chars().take_while(char::is_ascii_digit).collect();
        let id = digits.parse::<i64>().map_err(|_| {
            CoreError::InvalidInput(format!(
                "migration file name must start with a number: {file_name}"
            ))
        })?;

        Ok(Self::new(id, file_name, sql))
    }

    /// Returns the individual statements of this migration.
    pub fn statements(&self) -> Vec<String> {
        split_statements(&self.sql)
    }
}

/// Returns the schema shipped with this crate.
pub fn embedded() -> Vec<Migration> {
    vec![
        Migration::new(
            1,
            "0001_create_webhooks.sql",
            include_str!("../migrations/0001_create_webhooks.sql"),
        ),
        Migration::new(
            2,
            "0002_create_run_log.sql",
            include_str!("../migrations/0002_create_run_log.sql"),
        ),
        Migration::new(
            3,
            "0003_track_updates.sql",
            include_str!("../migrations/0003_track_updates.sql"),
        ),
    ]
}

/// Loads every `*.sql` file in `dir`, sorted by id.
///
/// Other files are ignored.
///
/// # Errors
///
/// Returns an error if the directory cannot be read, a file name has no
/// numeric prefix, or two files share an id.
pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<Migration>> {
    let dir = dir.as_ref();
    let read_err = |e: std::io::Error| {
        CoreError::InvalidInput(format!("cannot read migrations from {}: {e}", dir.display()))
    };

    let mut migrations = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let sql = std::fs::read_to_string(&path).map_err(read_err)?;
        migrations.push(Migration::from_file(file_name, sql)?);
    }

    migrations.sort_by_key(|m| m.id);
    ensure_unique(&migrations)?;
    debug!(count = migrations.len(), dir = %dir.display(), "loaded migration files");

    Ok(migrations)
}

fn ensure_unique(migrations: &[Migration]) -> Result<()> {
    let mut seen = HashSet::new();
    for migration in migrations {
        if !seen.insert(migration.id) {
            return Err(CoreError::InvalidInput(format!(
                "duplicate migration id {} ({})",
                migration.id, migration.name
            )));
        }
    }
    Ok(())
}

/// Applies pending migrations against a Postgres pool.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    /// Creates a migrator using `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every migration in `migrations` that has not been recorded yet.
    ///
    /// Returns the number of migrations applied by this call. A second call
    /// with the same set applies nothing.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Migration` if any statement fails. The whole run is
    /// rolled back in that case and no migration from it is recorded.
    pub async fn apply(&self, migrations: &[Migration]) -> Result<usize> {
        ensure_unique(migrations)?;
        self.ensure_record_table().await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("LOCK TABLE _sql_migrations IN ACCESS EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let applied: HashSet<i64> = sqlx::query_scalar("SELECT id FROM _sql_migrations")
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .collect();

        let mut pending: Vec<&Migration> =
            migrations.iter().filter(|m| !applied.contains(&m.id)).collect();
        pending.sort_by_key(|m| m.id);

        if pending.is_empty() {
            tx.commit().await?;
            debug!(applied = applied.len(), "schema up to date");
            return Ok(0);
        }

        for migration in &pending {
            info!(migration_id = migration.id, name = %migration.name, "applying migration");

            if let Err(e) = Self::apply_one(&mut *tx, migration).await {
                error!(migration_id = migration.id, error = %e, "migration failed, rolling back");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed migration also failed");
                }
                return Err(e);
            }
        }

        tx.commit().await?;
        info!(applied = pending.len(), "migrations complete");

        Ok(pending.len())
    }

    /// Lists applied migrations in id order.
    ///
    /// # Errors
    ///
    /// Returns error if the record table cannot be read.
    pub async fn applied(&self) -> Result<Vec<MigrationRecord>> {
        self.ensure_record_table().await?;

        let records = sqlx::query_as::<_, MigrationRecord>(
            "SELECT id, name, applied_at FROM _sql_migrations ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn ensure_record_table(&self) -> Result<()> {
        let created = sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _sql_migrations (
                id BIGINT PRIMARY KEY,
                name TEXT,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(CoreError::from);

        match created {
            Ok(_) => Ok(()),
            // Another instance created the table between our check and insert.
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn apply_one(conn: &mut PgConnection, migration: &Migration) -> Result<()> {
        let failed =
            |e: sqlx::Error| CoreError::Migration { id: migration.id, message: e.to_string() };

        for statement in migration.statements() {
            sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&statement)).await.map_err(failed)?;
        }

        sqlx::query("INSERT INTO _sql_migrations (id, name) VALUES ($1, $2)")
            .bind(migration.id)
            .bind(&migration.name)
            .execute(&mut *conn)
            .await
            .map_err(failed)?;

        Ok(())
    }
}

/// Splits a SQL script into individual statements.
///
/// Semicolons inside quoted strings, quoted identifiers and dollar-quoted
/// bodies do not terminate a statement. Comments are removed and empty
/// statements are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_code = false;
    let mut rest = sql;

    while let Some(c) = rest.chars().next() {
        if rest.starts_with("--") {
            let end = rest.find('\n').unwrap_or(rest.len());
            rest = &rest[end..];
            continue;
        }
        if rest.starts_with("/*") {
            rest = &rest[block_comment_end(rest)..];
            current.push(' ');
            continue;
        }

        match c {
            '\'' | '"' => {
                let end = quoted_end(rest, c as u8);
                current.push_str(&rest[..end]);
                rest = &rest[end..];
                has_code = true;
            },
            '$' => {
                let end = match dollar_tag(rest) {
                    Some(tag) => rest[tag.len()..]
                        .find(tag)
                        .map_or(rest.len(), |pos| tag.len() + pos + tag.len()),
                    None => 1,
                };
                current.push_str(&rest[..end]);
                rest = &rest[end..];
                has_code = true;
            },
            ';' => {
                if has_code {
                    statements.push(current.trim().to_string());
                }
                current.clear();
                has_code = false;
                rest = &rest[1..];
            },
            _ => {
                has_code |= !c.is_whitespace();
                current.push(c);
                rest = &rest[c.len_utf8()..];
            },
        }
    }

    if has_code {
        statements.push(current.trim().to_string());
    }

    statements
}

/// Byte offset just past the closing quote. Doubled quotes are escapes.
fn quoted_end(s: &str, quote: u8) -> usize {
    let bytes = s.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn block_comment_end(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            },
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            },
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Returns the opening `$tag$` at the start of `s`, if any. `$1` is not a tag.
fn dollar_tag(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    for (i, &b) in bytes.iter().enumerate().skip(1) {
        if b == b'$' {
            return Some(&s[..=i]);
        }
        let valid = b == b'_' || b.is_ascii_alphabetic() || (i > 1 && b.is_ascii_digit());
        if !valid {
            return None;
        }
    }
    None
}
