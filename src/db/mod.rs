pub mod follow_repo;
pub mod post_repo;
pub mod user_repo;

pub use follow_repo::FollowRepository;
pub use post_repo::PostRepository;
pub use user_repo::UserRepository;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Build the process-wide Postgres pool.
pub async fn new_pool(cfg: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .connect(&cfg.url)
        .await?;
    Ok(pool)
}

/// Connection liveness probe for health checks.
pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
