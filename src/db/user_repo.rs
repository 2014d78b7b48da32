use sqlx::PgPool;
use tracing::error;

use crate::error::{is_unique_violation, AppError, Result};
use crate::models::User;

const USER_COLUMNS: &str = "id, username, follower_count, following_count, created_at";

/// User repository. Owns no state beyond the shared pool; cheap to clone.
#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new user. A taken username is a `Conflict`.
    pub async fn create(&self, username: &str) -> Result<User> {
        sqlx::query_as::<_, User>(
            "INSERT INTO users (username)
             VALUES ($1)
             RETURNING id, username, follower_count, following_count, created_at",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return AppError::Conflict(format!("username {} is taken", username));
            }
            error!("Failed to create user: {}", e);
            AppError::Database(e)
        })
    }

    pub async fn get_by_id(&self, id: i64) -> Result<User> {
        let query = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        sqlx::query_as::<_, User>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {}", id)))
    }

    pub async fn get_by_username(&self, username: &str) -> Result<User> {
        let query = format!("SELECT {} FROM users WHERE username = $1", USER_COLUMNS);
        sqlx::query_as::<_, User>(&query)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {}", username)))
    }

    pub async fn get_all(&self, limit: i64, offset: i64) -> Result<Vec<User>> {
        let query = format!(
            "SELECT {} FROM users ORDER BY id LIMIT $1 OFFSET $2",
            USER_COLUMNS
        );
        let users = sqlx::query_as::<_, User>(&query)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    /// Users at or above the follower threshold, most-followed first.
    pub async fn get_celebrities(&self, threshold: i64) -> Result<Vec<User>> {
        let query = format!(
            "SELECT {} FROM users WHERE follower_count >= $1 ORDER BY follower_count DESC",
            USER_COLUMNS
        );
        let users = sqlx::query_as::<_, User>(&query)
            .bind(threshold)
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    pub async fn get_random(&self, count: i64) -> Result<Vec<User>> {
        let query = format!(
            "SELECT {} FROM users ORDER BY RANDOM() LIMIT $1",
            USER_COLUMNS
        );
        let users = sqlx::query_as::<_, User>(&query)
            .bind(count)
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_celebrities(&self, threshold: i64) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE follower_count >= $1")
                .bind(threshold)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Create many users in one transaction, skipping usernames that already
    /// exist.
    pub async fn bulk_create(&self, usernames: &[String]) -> Result<()> {
        if usernames.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO users (username)
             SELECT * FROM UNNEST($1::text[])
             ON CONFLICT (username) DO NOTHING",
        )
        .bind(usernames)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete a user. Posts and follow edges cascade at the schema level.
    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn truncate(&self) -> Result<()> {
        sqlx::query("TRUNCATE users CASCADE")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
