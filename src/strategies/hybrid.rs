use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::cache::TimelineCache;
use crate::config::EngineSettings;
use crate::db::{FollowRepository, PostRepository, UserRepository};
use crate::error::Result;
use crate::metrics::MetricsStore;
use crate::models::Post;
use crate::strategies::{
    dedup_posts, merge_posts, paginate, sort_posts_desc, OpTimer, OperationMetrics,
    TimelineStrategy, OP_PUBLISH, OP_TIMELINE,
};

/// Post ids pulled per celebrity from the recent-post index on a read.
const CELEBRITY_FETCH_PER_USER: usize = 20;

/// Per-author limit when augmenting celebrity posts from the store.
const CELEBRITY_DB_PER_USER: i64 = 10;

/// Per-author limit when backfilling a thin pushed timeline from the store.
const PUSH_BACKFILL_PER_USER: i64 = 10;

/// Minimum hydrated posts expected per followed celebrity before the read
/// falls back to the store for augmentation.
const MIN_POSTS_PER_CELEBRITY: usize = 5;

/// The split path: regular authors fan out on write, celebrities are merged
/// on read from their recent-post index. The follower-count threshold is
/// read live from [`EngineSettings`] on every call.
pub struct HybridStrategy {
    users: UserRepository,
    posts: PostRepository,
    follows: FollowRepository,
    cache: TimelineCache,
    metrics: Arc<MetricsStore>,
    settings: Arc<EngineSettings>,
}

impl HybridStrategy {
    pub fn new(
        users: UserRepository,
        posts: PostRepository,
        follows: FollowRepository,
        cache: TimelineCache,
        metrics: Arc<MetricsStore>,
        settings: Arc<EngineSettings>,
    ) -> Self {
        Self {
            users,
            posts,
            follows,
            cache,
            metrics,
            settings,
        }
    }

    fn threshold(&self) -> i64 {
        self.settings.celebrity_threshold()
    }
}

#[async_trait]
impl TimelineStrategy for HybridStrategy {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    async fn publish_post(
        &self,
        user_id: i64,
        content: &str,
    ) -> Result<(Post, OperationMetrics)> {
        let mut op = OpTimer::new(self.name(), OP_PUBLISH);

        let mut post = match self.posts.create(user_id, content).await {
            Ok(post) => post,
            Err(e) => {
                self.metrics.record_write(op.fail(&e));
                return Err(e);
            }
        };

        // The author record decides which side of the split this post takes;
        // without it the operation cannot proceed.
        let author = match self.users.get_by_id(user_id).await {
            Ok(author) => author,
            Err(e) => {
                self.metrics.record_write(op.fail(&e));
                return Err(e);
            }
        };
        post.username = Some(author.username.clone());

        if let Err(e) = self.cache.cache_post(&post).await {
            warn!("Failed to cache post {}: {}", post.id, e);
        }

        let mut follower_fault = None;
        if author.is_celebrity(self.threshold()) {
            // Celebrity: record in the recent-post index, skip the fan-out
            // entirely. Followers pick it up at read time.
            if let Err(e) = self.cache.cache_celebrity_post(user_id, &post).await {
                warn!("Failed to index celebrity post {}: {}", post.id, e);
            }
        } else {
            // The post is durable even when the fan-out set cannot be
            // resolved; surface the fault through metrics only and keep
            // going.
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
        }

        // The author's own view always receives the post, whichever side of
        // the split was taken and fan-out fault or not.
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
        let threshold = self.threshold();

        // 1. Push-side timeline (non-celebrity posts). Over-fetch 2x so the
        //    merge with celebrity posts does not starve this stream.
        let cached_ids = match self.cache.get_timeline(user_id, limit * 2, 0).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Failed to read cached timeline for {}: {}", user_id, e);
                Vec::new()
            }
        };

        let mut pushed_posts = Vec::new();
        if !cached_ids.is_empty() {
            op.cache_hit = true;
            pushed_posts = self.hydrate(&cached_ids).await;
        }

        // A thin pushed stream (cold cache, expired timeline, or posts
        // published under an earlier classification) is backfilled from the
        // store so the read does not silently lose history.
        if pushed_posts.len() < limit {
            match self
                .follows
                .get_following_non_celebrities(user_id, threshold)
                .await
            {
                Ok(mut sources) => {
                    sources.push(user_id);
                    match self
                        .posts
                        .get_recent_by_user_ids(&sources, PUSH_BACKFILL_PER_USER, limit as i64)
                        .await
                    {
                        Ok(db_posts) => {
                            pushed_posts.extend(db_posts);
                            pushed_posts = dedup_posts(pushed_posts);
                        }
                        Err(e) => {
                            debug!("Pushed-timeline backfill query failed: {}", e);
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to resolve followed regulars of {}: {}", user_id, e);
                }
            }
        }

        // 2. Celebrity stream, merged at read time.
        let celebrities = match self
            .follows
            .get_following_celebrities(user_id, threshold)
            .await
        {
            Ok(celebrities) => celebrities,
            Err(e) => {
                warn!("Failed to resolve followed celebrities of {}: {}", user_id, e);
                Vec::new()
            }
        };

        let mut celebrity_posts = Vec::new();
        if !celebrities.is_empty() {
            let celebrity_ids: Vec<i64> = celebrities.iter().map(|c| c.id).collect();

            match self
                .cache
                .celebrity_posts_batch(&celebrity_ids, CELEBRITY_FETCH_PER_USER)
                .await
            {
                Ok(ids) if !ids.is_empty() => {
                    celebrity_posts = self.hydrate(&ids).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Celebrity index read failed for {}: {}", user_id, e);
                }
            }

            // Thin index (expired, trimmed, or cold): augment from the store.
            if celebrity_posts.len() < celebrities.len() * MIN_POSTS_PER_CELEBRITY {
                match self
                    .posts
                    .get_recent_by_user_ids(&celebrity_ids, CELEBRITY_DB_PER_USER, limit as i64)
                    .await
                {
                    Ok(db_posts) => {
                        celebrity_posts.extend(db_posts);
                        celebrity_posts = dedup_posts(celebrity_posts);
                    }
                    Err(e) => {
                        debug!("Celebrity augmentation query failed: {}", e);
                    }
                }
            }

            // Read-side merge width.
            op.fan_out_count = celebrities.len();
        }

        // 3. Merge both streams, dedup (a threshold change mid-stream can
        //    land the same post on both sides), order, page.
        let mut posts = merge_posts(pushed_posts, celebrity_posts, limit * 2);
        posts = dedup_posts(posts);
        sort_posts_desc(&mut posts);
        let posts = paginate(posts, limit, offset);

        if let Err(e) = self.cache.cache_posts(&posts).await {
            warn!("Failed to warm post cache for user {}: {}", user_id, e);
        }

        let metrics = op.finish();
        self.metrics.record_read(metrics.clone());
        Ok((posts, metrics))
    }

    async fn delete_post(&self, post_id: i64, user_id: i64) -> Result<()> {
        let author = self.users.get_by_id(user_id).await?;

        if author.is_celebrity(self.threshold()) {
            // No follower back-fill: a copy may linger in a reader's view
            // until the next merge, which drops it once the store row and
            // index entry are gone.
            if let Err(e) = self.cache.remove_celebrity_post(user_id, post_id).await {
                warn!("Failed to remove post {} from celebrity index: {}", post_id, e);
            }
        } else {
            let followers = self.follows.get_followers(user_id).await?;
            if !followers.is_empty() {
                if let Err(e) = self
                    .cache
                    .remove_from_timeline_batch(&followers, post_id)
                    .await
                {
                    warn!(
                        "Failed to remove post {} from follower timelines: {}",
                        post_id, e
                    );
                }
            }
        }

        if let Err(e) = self.cache.remove_from_timeline(user_id, post_id).await {
            warn!("Failed to remove post {} from author timeline: {}", post_id, e);
        }

        self.posts.delete(post_id).await
    }

    /// Rebuild only the push side of the cache; celebrity content stays
    /// merge-on-read.
    async fn rebuild_timeline(&self, user_id: i64, limit: usize) -> Result<()> {
        let threshold = self.threshold();

        let mut sources = self
            .follows
            .get_following_non_celebrities(user_id, threshold)
            .await?;

        if let Ok(user) = self.users.get_by_id(user_id).await {
            if !user.is_celebrity(threshold) {
                sources.push(user_id);
            }
        }

        if sources.is_empty() {
            return Ok(());
        }

        let posts = self.posts.get_by_user_ids(&sources, limit as i64).await?;

        self.cache.clear_timeline(user_id).await?;
        self.cache.fill_timeline(user_id, &posts).await?;
        if let Err(e) = self.cache.cache_posts(&posts).await {
            warn!("Failed to cache rebuilt posts for user {}: {}", user_id, e);
        }
        Ok(())
    }
}

impl HybridStrategy {
    /// Hydrate post ids from the object cache, filling misses from the
    /// relational store. Ids that exist nowhere are silently dropped.
    async fn hydrate(&self, post_ids: &[i64]) -> Vec<Post> {
        let (mut posts, missing) = match self.cache.cached_posts(post_ids).await {
            Ok(hydrated) => hydrated,
            Err(e) => {
                warn!("Post multi-get failed: {}", e);
                (Vec::new(), post_ids.to_vec())
            }
        };

        if !missing.is_empty() {
            match self.posts.get_by_ids(&missing).await {
                Ok(db_posts) => {
                    if !db_posts.is_empty() {
                        if let Err(e) = self.cache.cache_posts(&db_posts).await {
                            warn!("Failed to backfill post cache: {}", e);
                        }
                        posts.extend(db_posts);
                    }
                }
                Err(e) => {
                    warn!("Failed to hydrate {} posts from DB: {}", missing.len(), e);
                }
            }
        }

        posts
    }
}
