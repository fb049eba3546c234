//! Database connection pool management.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Type alias for the database pool.
pub type Pool = SqlitePool;

/// Create a new database connection pool, creating the file if needed.
///
/// In-memory databases are per connection, so they get exactly one that is
/// never recycled.
pub async fn create_pool(database_url: &str) -> Result<Pool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new();
    let pool = if database_url.contains(":memory:") {
        // Closing the only connection would drop the database
        pool.max_connections(1).idle_timeout(None).max_lifetime(None)
    } else {
        pool.max_connections(5)
    };

    pool.connect_with(options).await
}

/// Run database migrations.
pub async fn run_migrations(pool: &Pool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
