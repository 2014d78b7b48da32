//! Redis-backed timeline cache.
//!
//! Three key namespaces, all advisory projections of the relational store:
//! - `timeline:{user_id}` → sorted set of post ids scored by created_at
//!   nanos, trimmed to the configured timeline size, TTL 7 days
//! - `post:{post_id}` → JSON post blob, TTL 24 hours
//! - `celebrity:posts:{user_id}` → sorted set of a celebrity's recent post
//!   ids, trimmed to the newest 100, TTL 7 days
//!
//! Fan-out writes are pipelined so one publish costs one Redis round-trip
//! regardless of follower count.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::EngineSettings;
use crate::error::{AppError, Result};
use crate::models::Post;

/// Seconds before an idle timeline or celebrity index expires.
const TIMELINE_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Seconds before a cached post blob expires.
const POST_TTL_SECS: u64 = 24 * 60 * 60;

/// Entries kept per celebrity recent-post index.
const CELEBRITY_INDEX_SIZE: isize = 100;

fn timeline_key(user_id: i64) -> String {
    format!("timeline:{}", user_id)
}

fn post_key(post_id: i64) -> String {
    format!("post:{}", post_id)
}

fn celebrity_posts_key(user_id: i64) -> String {
    format!("celebrity:posts:{}", user_id)
}

/// Sorted-set score for a post: creation time in nanoseconds. Equal-score
/// ties fall back to Redis member ordering, which for numeric ids tracks id
/// order closely enough for pagination.
fn post_score(post: &Post) -> f64 {
    post.created_at.timestamp_nanos_opt().unwrap_or(0) as f64
}

fn parse_ids(raw: Vec<String>) -> Vec<i64> {
    // Unparseable members are skipped rather than failing the read.
    raw.into_iter().filter_map(|r| r.parse().ok()).collect()
}

#[derive(Clone)]
pub struct TimelineCache {
    redis: ConnectionManager,
    settings: Arc<EngineSettings>,
}

impl TimelineCache {
    pub fn new(redis: ConnectionManager, settings: Arc<EngineSettings>) -> Self {
        Self { redis, settings }
    }

    /// Open a managed connection against the given Redis URL.
    pub async fn connect(redis_url: &str, settings: Arc<EngineSettings>) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::Configuration(format!("invalid Redis URL: {}", e)))?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::new(manager, settings))
    }

    /// Connection liveness probe for health checks.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }

    fn max_timeline_size(&self) -> isize {
        self.settings.timeline_cache_size() as isize
    }

    /// Insert a post into one user's timeline, trim to the configured size
    /// and refresh the TTL, all in a single pipelined round-trip.
    pub async fn add_to_timeline(&self, user_id: i64, post: &Post) -> Result<()> {
        let mut conn = self.redis.clone();
        let key = timeline_key(user_id);
        let trim_stop = -self.max_timeline_size() - 1;

        redis::pipe()
            .zadd(&key, post.id, post_score(post))
            .ignore()
            .zremrangebyrank(&key, 0, trim_stop)
            .ignore()
            .expire(&key, TIMELINE_TTL_SECS)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Fan a post out to many timelines in one pipelined batch. Ordering
    /// across targets is irrelevant; the relational store already holds the
    /// post, so callers treat failures here as soft.
    pub async fn add_to_timeline_batch(&self, user_ids: &[i64], post: &Post) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let score = post_score(post);
        let trim_stop = -self.max_timeline_size() - 1;

        let mut pipe = redis::pipe();
        for user_id in user_ids {
            let key = timeline_key(*user_id);
            pipe.zadd(&key, post.id, score)
                .ignore()
                .zremrangebyrank(&key, 0, trim_stop)
                .ignore()
                .expire(&key, TIMELINE_TTL_SECS)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!("Fanned post {} out to {} timelines", post.id, user_ids.len());
        Ok(())
    }

    /// Seed one user's timeline with a batch of posts (rebuild path). One
    /// pipeline: all inserts, one trim, one TTL refresh.
    pub async fn fill_timeline(&self, user_id: i64, posts: &[Post]) -> Result<()> {
        if posts.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let key = timeline_key(user_id);
        let trim_stop = -self.max_timeline_size() - 1;

        let mut pipe = redis::pipe();
        for post in posts {
            pipe.zadd(&key, post.id, post_score(post)).ignore();
        }
        pipe.zremrangebyrank(&key, 0, trim_stop)
            .ignore()
            .expire(&key, TIMELINE_TTL_SECS)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Post ids from a user's timeline, newest first. An absent key reads as
    /// an empty timeline, not an error.
    pub async fn get_timeline(&self, user_id: i64, limit: usize, offset: usize) -> Result<Vec<i64>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let start = offset as isize;
        let stop = (offset + limit) as isize - 1;
        let raw: Vec<String> = conn.zrevrange(timeline_key(user_id), start, stop).await?;
        Ok(parse_ids(raw))
    }

    pub async fn timeline_size(&self, user_id: i64) -> Result<i64> {
        let mut conn = self.redis.clone();
        let size: i64 = conn.zcard(timeline_key(user_id)).await?;
        Ok(size)
    }

    pub async fn timeline_exists(&self, user_id: i64) -> Result<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(timeline_key(user_id)).await?;
        Ok(exists)
    }

    pub async fn remove_from_timeline(&self, user_id: i64, post_id: i64) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: () = conn.zrem(timeline_key(user_id), post_id).await?;
        Ok(())
    }

    /// Remove a post from many timelines in one pipelined batch.
    pub async fn remove_from_timeline_batch(&self, user_ids: &[i64], post_id: i64) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for user_id in user_ids {
            pipe.zrem(timeline_key(*user_id), post_id).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    pub async fn clear_timeline(&self, user_id: i64) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: () = conn.del(timeline_key(user_id)).await?;
        Ok(())
    }

    /// Cache a post blob for hydration on reads.
    pub async fn cache_post(&self, post: &Post) -> Result<()> {
        let mut conn = self.redis.clone();
        let data = serde_json::to_string(post)?;
        conn.set_ex::<_, _, ()>(post_key(post.id), data, POST_TTL_SECS)
            .await?;
        Ok(())
    }

    /// Cache many post blobs in one pipeline. Posts that fail to serialize
    /// are skipped.
    pub async fn cache_posts(&self, posts: &[Post]) -> Result<()> {
        if posts.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for post in posts {
            match serde_json::to_string(post) {
                Ok(data) => {
                    pipe.set_ex(post_key(post.id), data, POST_TTL_SECS).ignore();
                }
                Err(e) => warn!("Failed to serialize post {} for cache: {}", post.id, e),
            }
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Fetch a single cached post. `Ok(None)` is a miss.
    pub async fn cached_post(&self, post_id: i64) -> Result<Option<Post>> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(post_key(post_id)).await?;
        match data {
            Some(json) => match serde_json::from_str(&json) {
                Ok(post) => Ok(Some(post)),
                Err(e) => {
                    warn!("Failed to deserialize cached post {}: {}", post_id, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Multi-get cached posts in one round-trip. Returns the hits plus the
    /// ids that missed (absent or undecodable) so callers can hydrate them
    /// from the relational store.
    pub async fn cached_posts(&self, post_ids: &[i64]) -> Result<(Vec<Post>, Vec<i64>)> {
        if post_ids.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut conn = self.redis.clone();
        let keys: Vec<String> = post_ids.iter().map(|id| post_key(*id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut hits = Vec::with_capacity(post_ids.len());
        let mut missing = Vec::new();
        for (id, value) in post_ids.iter().zip(values) {
            match value.as_deref().map(serde_json::from_str::<Post>) {
                Some(Ok(post)) => hits.push(post),
                Some(Err(e)) => {
                    warn!("Failed to deserialize cached post {}: {}", id, e);
                    missing.push(*id);
                }
                None => missing.push(*id),
            }
        }
        Ok((hits, missing))
    }

    /// Record a celebrity's post in their recent-post index instead of
    /// fanning it out; hybrid reads merge from here.
    pub async fn cache_celebrity_post(&self, user_id: i64, post: &Post) -> Result<()> {
        let mut conn = self.redis.clone();
        let key = celebrity_posts_key(user_id);

        redis::pipe()
            .zadd(&key, post.id, post_score(post))
            .ignore()
            .zremrangebyrank(&key, 0, -CELEBRITY_INDEX_SIZE - 1)
            .ignore()
            .expire(&key, TIMELINE_TTL_SECS)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn remove_celebrity_post(&self, user_id: i64, post_id: i64) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: () = conn.zrem(celebrity_posts_key(user_id), post_id).await?;
        Ok(())
    }

    /// Recent post ids from one celebrity, newest first.
    pub async fn celebrity_posts(&self, user_id: i64, limit: usize) -> Result<Vec<i64>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let raw: Vec<String> = conn
            .zrevrange(celebrity_posts_key(user_id), 0, limit as isize - 1)
            .await?;
        Ok(parse_ids(raw))
    }

    /// Recent post ids across many celebrities, one pipelined round-trip.
    /// The result is an unordered union; callers re-merge by timestamp.
    pub async fn celebrity_posts_batch(
        &self,
        user_ids: &[i64],
        per_user_limit: usize,
    ) -> Result<Vec<i64>> {
        if user_ids.is_empty() || per_user_limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for user_id in user_ids {
            pipe.zrevrange(celebrity_posts_key(*user_id), 0, per_user_limit as isize - 1);
        }
        let results: Vec<Vec<String>> = pipe.query_async(&mut conn).await?;

        Ok(results.into_iter().flat_map(parse_ids).collect())
    }
}
