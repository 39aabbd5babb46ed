use cube_castle_shared::config::DatabaseConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Open the write-side connection pool
pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(config.connect_timeout)
        .connect(&config.url)
        .await?;

    info!(
        pool_size = config.pool_size,
        "🐘 Connected to PostgreSQL"
    );
    Ok(pool)
}
