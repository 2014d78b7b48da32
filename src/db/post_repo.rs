use sqlx::PgPool;
use tracing::error;

use crate::error::{AppError, Result};
use crate::models::Post;

/// Post repository. Read queries join `users` so results carry the author
/// username for display.
#[derive(Clone)]
pub struct PostRepository {
    pool: PgPool,
}

impl PostRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a post. This is the durability point for every publish path:
    /// cache population only ever happens after this commits.
    pub async fn create(&self, user_id: i64, content: &str) -> Result<Post> {
        sqlx::query_as::<_, Post>(
            "INSERT INTO posts (user_id, content)
             VALUES ($1, $2)
             RETURNING id, user_id, content, created_at",
        )
        .bind(user_id)
        .bind(content)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create post for user {}: {}", user_id, e);
            AppError::Database(e)
        })
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Post> {
        sqlx::query_as::<_, Post>(
            "SELECT p.id, p.user_id, p.content, p.created_at, u.username
             FROM posts p
             JOIN users u ON p.user_id = u.id
             WHERE p.id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("post {}", id)))
    }

    /// Fetch posts by id, newest first. Missing ids are simply absent from
    /// the result.
    pub async fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<Post>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let posts = sqlx::query_as::<_, Post>(
            "SELECT p.id, p.user_id, p.content, p.created_at, u.username
             FROM posts p
             JOIN users u ON p.user_id = u.id
             WHERE p.id = ANY($1)
             ORDER BY p.created_at DESC",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    pub async fn get_by_user_id(&self, user_id: i64, limit: i64) -> Result<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(
            "SELECT p.id, p.user_id, p.content, p.created_at, u.username
             FROM posts p
             JOIN users u ON p.user_id = u.id
             WHERE p.user_id = $1
             ORDER BY p.created_at DESC
             LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    /// Recent posts across a set of authors, newest first.
    pub async fn get_by_user_ids(&self, user_ids: &[i64], limit: i64) -> Result<Vec<Post>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let posts = sqlx::query_as::<_, Post>(
            "SELECT p.id, p.user_id, p.content, p.created_at, u.username
             FROM posts p
             JOIN users u ON p.user_id = u.id
             WHERE p.user_id = ANY($1)
             ORDER BY p.created_at DESC
             LIMIT $2",
        )
        .bind(user_ids)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    /// Top `per_user_limit` most-recent posts per author, globally re-ordered
    /// and truncated to `total_limit`. One lateral query rather than a fetch
    /// per author, so pull-side merges stay a single round-trip.
    pub async fn get_recent_by_user_ids(
        &self,
        user_ids: &[i64],
        per_user_limit: i64,
        total_limit: i64,
    ) -> Result<Vec<Post>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let posts = sqlx::query_as::<_, Post>(
            "SELECT p.id, p.user_id, p.content, p.created_at, u.username
             FROM UNNEST($1::bigint[]) AS author(id)
             CROSS JOIN LATERAL (
                 SELECT id, user_id, content, created_at
                 FROM posts
                 WHERE user_id = author.id
                 ORDER BY created_at DESC
                 LIMIT $2
             ) p
             JOIN users u ON p.user_id = u.id
             ORDER BY p.created_at DESC
             LIMIT $3",
        )
        .bind(user_ids)
        .bind(per_user_limit)
        .bind(total_limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Insert many posts in one statement.
    pub async fn bulk_create(&self, posts: &[(i64, String)]) -> Result<()> {
        if posts.is_empty() {
            return Ok(());
        }

        let user_ids: Vec<i64> = posts.iter().map(|(uid, _)| *uid).collect();
        let contents: Vec<String> = posts.iter().map(|(_, c)| c.clone()).collect();

        sqlx::query(
            "INSERT INTO posts (user_id, content)
             SELECT * FROM UNNEST($1::bigint[], $2::text[])",
        )
        .bind(&user_ids)
        .bind(&contents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM posts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn truncate(&self) -> Result<()> {
        sqlx::query("TRUNCATE posts CASCADE")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
