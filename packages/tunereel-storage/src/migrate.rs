//! Embedded schema migrations.
//!
//! Each migration is applied inside its own transaction and recorded by
//! filename in `schema_migrations`; files run in lexicographic order, so the
//! numeric prefix is the ordering key.

use sqlx::{PgPool, Row};
use tracing::info;

use crate::error::{Result, StorageError};

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_create_jobs.sql",
        include_str!("../migrations/0001_create_jobs.sql"),
    ),
    (
        "0002_create_users.sql",
        include_str!("../migrations/0002_create_users.sql"),
    ),
    (
        "0003_create_system_prompts.sql",
        include_str!("../migrations/0003_create_system_prompts.sql"),
    ),
];

/// Install the schema, applying any migration not yet recorded.
pub async fn run(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
             filename TEXT PRIMARY KEY, \
             applied_at TIMESTAMPTZ NOT NULL DEFAULT now()\
         )",
    )
    .execute(pool)
    .await?;

    let applied: Vec<String> = sqlx::query("SELECT filename FROM schema_migrations")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| row.get::<String, _>("filename"))
        .collect();

    for (filename, sql) in MIGRATIONS {
        if applied.iter().any(|a| a == filename) {
            continue;
        }
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Migration {
                filename: filename.to_string(),
                message: e.to_string(),
            })?;
        sqlx::query("INSERT INTO schema_migrations (filename) VALUES ($1)")
            .bind(filename)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(migration = filename, "applied schema migration");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_lexicographically_ordered() {
        let names: Vec<&str> = MIGRATIONS.iter().map(|(name, _)| *name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_migration_filenames_unique() {
        let mut names: Vec<&str> = MIGRATIONS.iter().map(|(name, _)| *name).collect();
        names.dedup();
        assert_eq!(names.len(), MIGRATIONS.len());
    }

    #[test]
    fn test_migrations_nonempty() {
        for (name, sql) in MIGRATIONS {
            assert!(!sql.trim().is_empty(), "empty migration: {name}");
        }
    }
}
