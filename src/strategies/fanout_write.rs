use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::cache::TimelineCache;
use crate::db::{FollowRepository, PostRepository, UserRepository};
use crate::error::Result;
use crate::metrics::MetricsStore;
use crate::models::Post;
use crate::strategies::{
    sort_posts_desc, OpTimer, OperationMetrics, TimelineStrategy, OP_PUBLISH, OP_TIMELINE,
};

/// Fan-out-on-write: a publish is pushed into every follower's cached
/// timeline immediately, so reads are a single cache range.
pub struct FanoutWriteStrategy {
    users: UserRepository,
    posts: PostRepository,
    follows: FollowRepository,
    cache: TimelineCache,
    metrics: Arc<MetricsStore>,
}

impl FanoutWriteStrategy {
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
impl TimelineStrategy for FanoutWriteStrategy {
    fn name(&self) -> &'static str {
        "fanout_write"
    }

    async fn publish_post(
        &self,
        user_id: i64,
        content: &str,
    ) -> Result<(Post, OperationMetrics)> {
        let mut op = OpTimer::new(self.name(), OP_PUBLISH);

        // Durable insert first. Nothing touches the cache until this commits.
        let mut post = match self.posts.create(user_id, content).await {
            Ok(post) => post,
            Err(e) => {
                self.metrics.record_write(op.fail(&e));
                return Err(e);
            }
        };

        // Username is display-only; leave it blank if the lookup fails.
        if let Ok(author) = self.users.get_by_id(user_id).await {
            post.username = Some(author.username);
        }

        if let Err(e) = self.cache.cache_post(&post).await {
            warn!("Failed to cache post {}: {}", post.id, e);
        }

        // The post is durable even when the fan-out set cannot be resolved;
        // it stays visible through the pull path. Surface the fault through
        // metrics only and keep going.
        let mut follower_fault = None;
        let followers = match self.follows.get_followers(user_id).await {
            Ok(followers) => followers,
            Err(e) => {
                warn!("Failed to resolve followers of {}: {}", user_id, e);
                follower_fault = Some(e);
                Vec::new()
            }
        };

        op.fan_out_count = followers.len();
        if !followers.is_empty() {
            let fan_out_start = Instant::now();
            if let Err(e) = self.cache.add_to_timeline_batch(&followers, &post).await {
                warn!("Failed to fan post {} out to followers: {}", post.id, e);
            }
            op.fan_out_duration = fan_out_start.elapsed();
        }

        // The author sees their own post too, fan-out fault or not.
        if let Err(e) = self.cache.add_to_timeline(user_id, &post).await {
            warn!("Failed to add post {} to author timeline: {}", post.id, e);
        }

        let metrics = match follower_fault {
            Some(e) => op.finish_with_error(&e),
            None => op.finish(),
        };
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

        let post_ids = match self.cache.get_timeline(user_id, limit, offset).await {
            Ok(ids) => ids,
            Err(e) => {
                // The cache is this strategy's only timeline source; with it
                // unreachable the read is unsatisfiable.
                self.metrics.record_read(op.fail(&e));
                return Err(e);
            }
        };

        if post_ids.is_empty() {
            let metrics = op.finish();
            self.metrics.record_read(metrics.clone());
            return Ok((Vec::new(), metrics));
        }
        op.cache_hit = true;

        let (mut posts, missing) = match self.cache.cached_posts(&post_ids).await {
            Ok(hydrated) => hydrated,
            Err(e) => {
                warn!("Post multi-get failed for user {}: {}", user_id, e);
                (Vec::new(), post_ids.clone())
            }
        };

        if !missing.is_empty() {
            let db_posts = match self.posts.get_by_ids(&missing).await {
                Ok(db_posts) => db_posts,
                Err(e) => {
                    if posts.is_empty() {
                        self.metrics.record_read(op.fail(&e));
                        return Err(e);
                    }
                    // Keep the cache hits; the misses stay absent.
                    warn!("Failed to hydrate {} posts from DB: {}", missing.len(), e);
                    Vec::new()
                }
            };

            if !db_posts.is_empty() {
                if let Err(e) = self.cache.cache_posts(&db_posts).await {
                    warn!("Failed to backfill post cache: {}", e);
                }
                posts.extend(db_posts);
            }
        }

        sort_posts_desc(&mut posts);
        posts.truncate(limit);

        let metrics = op.finish();
        self.metrics.record_read(metrics.clone());
        Ok((posts, metrics))
    }

    async fn delete_post(&self, post_id: i64, user_id: i64) -> Result<()> {
        let followers = self.follows.get_followers(user_id).await?;
        if !followers.is_empty() {
            if let Err(e) = self
                .cache
                .remove_from_timeline_batch(&followers, post_id)
                .await
            {
                warn!("Failed to remove post {} from follower timelines: {}", post_id, e);
            }
        }
        if let Err(e) = self.cache.remove_from_timeline(user_id, post_id).await {
            warn!("Failed to remove post {} from author timeline: {}", post_id, e);
        }

        self.posts.delete(post_id).await
    }

    async fn rebuild_timeline(&self, user_id: i64, limit: usize) -> Result<()> {
        let mut sources = self.follows.get_following(user_id).await?;
        sources.push(user_id);

        let posts = self.posts.get_by_user_ids(&sources, limit as i64).await?;

        self.cache.clear_timeline(user_id).await?;
        self.cache.fill_timeline(user_id, &posts).await?;
        if let Err(e) = self.cache.cache_posts(&posts).await {
            warn!("Failed to cache rebuilt posts for user {}: {}", user_id, e);
        }
        Ok(())
    }
}
