use redis::aio::ConnectionManager;
use sqlx::PgPool;
use std::sync::Arc;

use crate::cache::TimelineCache;
use crate::config::EngineSettings;
use crate::db::{FollowRepository, PostRepository, UserRepository};
use crate::error::{AppError, Result};
use crate::metrics::MetricsStore;
use crate::models::Post;
use crate::strategies::{
    FanoutReadStrategy, FanoutWriteStrategy, HybridStrategy, OperationMetrics, StrategyKind,
    TimelineStrategy,
};

/// The engine context: settings, both stores, the metrics sink, and one
/// instance of each delivery strategy. There are no process-wide singletons;
/// tests and binaries construct their own.
pub struct TimelineEngine {
    settings: Arc<EngineSettings>,
    pool: PgPool,
    users: UserRepository,
    posts: PostRepository,
    follows: FollowRepository,
    cache: TimelineCache,
    metrics: Arc<MetricsStore>,
    fanout_write: FanoutWriteStrategy,
    fanout_read: FanoutReadStrategy,
    hybrid: HybridStrategy,
}

impl TimelineEngine {
    pub fn new(pool: PgPool, redis: ConnectionManager, settings: Arc<EngineSettings>) -> Self {
        let users = UserRepository::new(pool.clone());
        let posts = PostRepository::new(pool.clone());
        let follows = FollowRepository::new(pool.clone());
        let cache = TimelineCache::new(redis, settings.clone());
        let metrics = Arc::new(MetricsStore::new());

        let fanout_write = FanoutWriteStrategy::new(
            users.clone(),
            posts.clone(),
            follows.clone(),
            cache.clone(),
            metrics.clone(),
        );
        let fanout_read = FanoutReadStrategy::new(
            users.clone(),
            posts.clone(),
            follows.clone(),
            cache.clone(),
            metrics.clone(),
        );
        let hybrid = HybridStrategy::new(
            users.clone(),
            posts.clone(),
            follows.clone(),
            cache.clone(),
            metrics.clone(),
            settings.clone(),
        );

        Self {
            settings,
            pool,
            users,
            posts,
            follows,
            cache,
            metrics,
            fanout_write,
            fanout_read,
            hybrid,
        }
    }

    /// Probe both stores. Each flag is independent so a degraded report
    /// still names the healthy side.
    pub async fn health(&self) -> StoreHealth {
        StoreHealth {
            database: crate::db::ping(&self.pool).await.is_ok(),
            cache: self.cache.ping().await.is_ok(),
        }
    }

    /// Aggregate store counts for the dashboard surface.
    pub async fn stats(&self) -> Result<EngineStats> {
        let threshold = self.settings.celebrity_threshold();
        Ok(EngineStats {
            total_users: self.users.count().await?,
            total_posts: self.posts.count().await?,
            total_follows: self.follows.count().await?,
            celebrity_count: self.users.count_celebrities(threshold).await?,
            celebrity_threshold: threshold,
        })
    }

    pub fn strategy(&self, kind: StrategyKind) -> &dyn TimelineStrategy {
        match kind {
            StrategyKind::FanoutWrite => &self.fanout_write,
            StrategyKind::FanoutRead => &self.fanout_read,
            StrategyKind::Hybrid => &self.hybrid,
        }
    }

    /// Publish a post under the given strategy. Succeeds iff the post is
    /// durable; cache faults surface only through the returned metrics.
    pub async fn publish_post(
        &self,
        kind: StrategyKind,
        user_id: i64,
        content: &str,
    ) -> Result<(Post, OperationMetrics)> {
        validate_publish(user_id, content)?;
        self.strategy(kind).publish_post(user_id, content).await
    }

    /// Read a home timeline. A zero limit falls back to the configured page
    /// size.
    pub async fn get_timeline(
        &self,
        kind: StrategyKind,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Post>, OperationMetrics)> {
        if user_id <= 0 {
            return Err(AppError::BadRequest("user_id is required".to_string()));
        }

        let limit = if limit == 0 {
            self.settings.timeline_page_size()
        } else {
            limit
        };

        self.strategy(kind).get_timeline(user_id, limit, offset).await
    }

    pub async fn delete_post(
        &self,
        kind: StrategyKind,
        post_id: i64,
        user_id: i64,
    ) -> Result<()> {
        self.strategy(kind).delete_post(post_id, user_id).await
    }

    pub async fn rebuild_timeline(
        &self,
        kind: StrategyKind,
        user_id: i64,
        limit: usize,
    ) -> Result<()> {
        let limit = if limit == 0 {
            self.settings.timeline_cache_size()
        } else {
            limit
        };
        self.strategy(kind).rebuild_timeline(user_id, limit).await
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn users(&self) -> &UserRepository {
        &self.users
    }

    pub fn posts(&self) -> &PostRepository {
        &self.posts
    }

    pub fn follows(&self) -> &FollowRepository {
        &self.follows
    }

    pub fn cache(&self) -> &TimelineCache {
        &self.cache
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StoreHealth {
    pub database: bool,
    pub cache: bool,
}

impl StoreHealth {
    pub fn is_healthy(&self) -> bool {
        self.database && self.cache
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub total_users: i64,
    pub total_posts: i64,
    pub total_follows: i64,
    pub celebrity_count: i64,
    pub celebrity_threshold: i64,
}

fn validate_publish(user_id: i64, content: &str) -> Result<()> {
    if user_id <= 0 {
        return Err(AppError::BadRequest("user_id is required".to_string()));
    }
    if content.trim().is_empty() {
        return Err(AppError::BadRequest(
            "content must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_publish() {
        assert!(validate_publish(1, "hello").is_ok());
        assert!(matches!(
            validate_publish(0, "hello"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            validate_publish(-3, "hello"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            validate_publish(1, "   "),
            Err(AppError::BadRequest(_))
        ));
    }
}
