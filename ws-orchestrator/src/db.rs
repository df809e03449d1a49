use crate::error::Result;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Initialize database connection pool
#[instrument(fields(db_path = %db_path.display()))]
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(options).await?;

    Ok(pool)
}

/// Run database migrations
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}

/// Copy the database aside before migrating; returns the backup path.
pub fn backup_database(db_path: &Path) -> Result<PathBuf> {
    let timestamp = chrono::Utc::now().timestamp();
    let backup_path = db_path.with_extension(format!("db.backup.{}", timestamp));

    if db_path.exists() {
        std::fs::copy(db_path, &backup_path)?;
    }

    Ok(backup_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_creates_file_and_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("ws.db");

        let pool = create_pool(&db_path).await.unwrap();
        run_migrations(&pool).await.unwrap();
        // Second run is a no-op.
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workspaces")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(db_path.exists());
    }

    #[test]
    fn test_backup_copies_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("ws.db");
        std::fs::write(&db_path, b"sqlite bytes").unwrap();

        let backup = backup_database(&db_path).unwrap();
        assert_eq!(std::fs::read(&backup).unwrap(), b"sqlite bytes");
    }

    #[test]
    fn test_backup_of_missing_database_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let backup = backup_database(&dir.path().join("absent.db")).unwrap();
        assert!(!backup.exists());
    }
}
