use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// In-memory database with migrations applied.
///
/// Limited to one connection: every `sqlite::memory:` connection is its own
/// database.
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}
