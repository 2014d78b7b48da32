use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::TimelineCache;
use crate::db::{FollowRepository, PostRepository, UserRepository};
use crate::error::Result;
use crate::metrics::MetricsStore;
use crate::models::Post;
use crate::strategies::{
    paginate, sort_posts_desc, OpTimer, OperationMetrics, TimelineStrategy, OP_PUBLISH,
    OP_TIMELINE,
};

/// Posts fetched per followed author when merging at read time.
const PER_AUTHOR_LIMIT: i64 = 10;

/// Fan-out-on-read: writes are a single durable insert; the timeline is
/// assembled from followed authors' posts at read time.
pub struct FanoutReadStrategy {
    users: UserRepository,
    posts: PostRepository,
    follows: FollowRepository,
    cache: TimelineCache,
    metrics: Arc<MetricsStore>,
}

impl FanoutReadStrategy {
    pub fn new(
        users: UserRepository,
        posts: PostRepository,
        follows: FollowRepository,
        cache: TimelineCache,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        Self {
            users,
            posts,
            follows,
            cache,
            metrics,
        }
    }
}

#[async_trait]
impl TimelineStrategy for FanoutReadStrategy {
    fn name(&self) -> &'static str {
        "fanout_read"
    }

    async fn publish_post(
        &self,
        user_id: i64,
        content: &str,
    ) -> Result<(Post, OperationMetrics)> {
        let op = OpTimer::new(self.name(), OP_PUBLISH);

        let mut post = match self.posts.create(user_id, content).await {
            Ok(post) => post,
            Err(e) => {
                self.metrics.record_write(op.fail(&e));
                return Err(e);
            }
        };

        if let Ok(author) = self.users.get_by_id(user_id).await {
            post.username = Some(author.username);
        }

        // Optional warm-up for later hydration; no fan-out in this strategy.
        if let Err(e) = self.cache.cache_post(&post).await {
            warn!("Failed to cache post {}: {}", post.id, e);
        }

        let metrics = op.finish();
        self.metrics.record_write(metrics.clone());
        Ok((post, metrics))
    }

    async fn get_timeline(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Post>, OperationMetrics)> {
        let mut op = OpTimer::new(self.name(), OP_TIMELINE);

        let mut authors = match self.follows.get_following(user_id).await {
            Ok(following) => following,
            Err(e) => {
                self.metrics.record_read(op.fail(&e));
                return Err(e);
            }
        };
        authors.push(user_id);

        // Here fan_out_count is the read-side merge width.
        op.fan_out_count = authors.len();

        let window = (limit + offset) as i64;
        let mut posts = match self
            .posts
            .get_recent_by_user_ids(&authors, PER_AUTHOR_LIMIT, window)
            .await
        {
            Ok(posts) => posts,
            Err(e) => {
                debug!("Lateral recent-posts query failed, falling back: {}", e);
                match self.posts.get_by_user_ids(&authors, window).await {
                    Ok(posts) => posts,
                    Err(e) => {
                        self.metrics.record_read(op.fail(&e));
                        return Err(e);
                    }
                }
            }
        };

        // The store returns newest-first already; sort defensively anyway.
        sort_posts_desc(&mut posts);
        let posts = paginate(posts, limit, offset);

        if let Err(e) = self.cache.cache_posts(&posts).await {
            warn!("Failed to warm post cache for user {}: {}", user_id, e);
        }

        let metrics = op.finish();
        self.metrics.record_read(metrics.clone());
        Ok((posts, metrics))
    }

    async fn delete_post(&self, post_id: i64, _user_id: i64) -> Result<()> {
        // No per-follower cache state to invalidate in pull mode.
        self.posts.delete(post_id).await
    }

    async fn rebuild_timeline(&self, _user_id: i64, _limit: usize) -> Result<()> {
        // Pull mode keeps no per-user timeline cache to rebuild.
        Ok(())
    }
}
