use sqlx::PgPool;
use tracing::warn;

use crate::error::{AppError, Result};
use crate::models::User;

const USER_COLUMNS: &str = "u.id, u.username, u.follower_count, u.following_count, u.created_at";

/// Follow-edge repository.
///
/// Every edge mutation runs as a single data-modifying-CTE statement so the
/// edge and the two cached counters on `users` move atomically, and counters
/// only move when the edge actually changed (idempotent create/delete).
#[derive(Clone)]
pub struct FollowRepository {
    pool: PgPool,
}

impl FollowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a follow edge. Idempotent: a duplicate edge is a no-op and
    /// leaves the counters untouched.
    pub async fn create(&self, follower_id: i64, followee_id: i64) -> Result<()> {
        if follower_id == followee_id {
            return Err(AppError::BadRequest("cannot follow yourself".to_string()));
        }

        let result = sqlx::query(
            "WITH ins AS (
                 INSERT INTO follows (follower_id, followee_id)
                 VALUES ($1, $2)
                 ON CONFLICT (follower_id, followee_id) DO NOTHING
                 RETURNING 1
             ), bump_followee AS (
                 UPDATE users SET follower_count = follower_count + 1
                 WHERE id = $2 AND EXISTS (SELECT 1 FROM ins)
             )
             UPDATE users SET following_count = following_count + 1
             WHERE id = $1 AND EXISTS (SELECT 1 FROM ins)",
        )
        .bind(follower_id)
        .bind(followee_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                "Follow edge already exists: {} -> {}",
                follower_id, followee_id
            );
        }
        Ok(())
    }

    /// Remove a follow edge. Counters only move when an edge was deleted.
    pub async fn delete(&self, follower_id: i64, followee_id: i64) -> Result<()> {
        sqlx::query(
            "WITH del AS (
                 DELETE FROM follows
                 WHERE follower_id = $1 AND followee_id = $2
                 RETURNING 1
             ), drop_followee AS (
                 UPDATE users SET follower_count = follower_count - 1
                 WHERE id = $2 AND EXISTS (SELECT 1 FROM del)
             )
             UPDATE users SET following_count = following_count - 1
             WHERE id = $1 AND EXISTS (SELECT 1 FROM del)",
        )
        .bind(follower_id)
        .bind(followee_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All follower ids of a user. This is the fan-out set for push writes.
    pub async fn get_followers(&self, user_id: i64) -> Result<Vec<i64>> {
        let followers = sqlx::query_scalar::<_, i64>(
            "SELECT follower_id FROM follows WHERE followee_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(followers)
    }

    pub async fn get_following(&self, user_id: i64) -> Result<Vec<i64>> {
        let following = sqlx::query_scalar::<_, i64>(
            "SELECT followee_id FROM follows WHERE follower_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(following)
    }

    pub async fn get_following_users(&self, user_id: i64) -> Result<Vec<User>> {
        let query = format!(
            "SELECT {} FROM users u
             JOIN follows f ON u.id = f.followee_id
             WHERE f.follower_id = $1",
            USER_COLUMNS
        );
        let users = sqlx::query_as::<_, User>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    /// Followed users at or above the celebrity threshold. Hybrid reads merge
    /// these authors' posts at read time.
    pub async fn get_following_celebrities(
        &self,
        user_id: i64,
        threshold: i64,
    ) -> Result<Vec<User>> {
        let query = format!(
            "SELECT {} FROM users u
             JOIN follows f ON u.id = f.followee_id
             WHERE f.follower_id = $1 AND u.follower_count >= $2",
            USER_COLUMNS
        );
        let users = sqlx::query_as::<_, User>(&query)
            .bind(user_id)
            .bind(threshold)
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    pub async fn get_following_non_celebrities(
        &self,
        user_id: i64,
        threshold: i64,
    ) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT u.id FROM users u
             JOIN follows f ON u.id = f.followee_id
             WHERE f.follower_id = $1 AND u.follower_count < $2",
        )
        .bind(user_id)
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn is_following(&self, follower_id: i64, followee_id: i64) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM follows WHERE follower_id = $1 AND followee_id = $2)",
        )
        .bind(follower_id)
        .bind(followee_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM follows")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Create many edges in one atomic statement, skipping duplicates and
    /// reconciling both counters from the edges actually inserted.
    pub async fn bulk_create(&self, edges: &[(i64, i64)]) -> Result<()> {
        if edges.is_empty() {
            return Ok(());
        }

        let follower_ids: Vec<i64> = edges.iter().map(|(f, _)| *f).collect();
        let followee_ids: Vec<i64> = edges.iter().map(|(_, f)| *f).collect();

        sqlx::query(
            "WITH ins AS (
                 INSERT INTO follows (follower_id, followee_id)
                 SELECT * FROM UNNEST($1::bigint[], $2::bigint[])
                 ON CONFLICT (follower_id, followee_id) DO NOTHING
                 RETURNING follower_id, followee_id
             ), bump_followees AS (
                 UPDATE users u SET follower_count = follower_count + s.cnt
                 FROM (SELECT followee_id, COUNT(*) AS cnt FROM ins GROUP BY followee_id) s
                 WHERE u.id = s.followee_id
             )
             UPDATE users u SET following_count = following_count + s.cnt
             FROM (SELECT follower_id, COUNT(*) AS cnt FROM ins GROUP BY follower_id) s
             WHERE u.id = s.follower_id",
        )
        .bind(&follower_ids)
        .bind(&followee_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn truncate(&self) -> Result<()> {
        sqlx::query("TRUNCATE follows CASCADE")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
