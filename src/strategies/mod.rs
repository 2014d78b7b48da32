//! Timeline delivery strategies.
//!
//! Three interchangeable implementations of [`TimelineStrategy`]:
//! fan-out-on-write (push), fan-out-on-read (pull), and the hybrid split that
//! pushes for regular authors and merges celebrities at read time.

pub mod fanout_read;
pub mod fanout_write;
pub mod hybrid;

pub use fanout_read::FanoutReadStrategy;
pub use fanout_write::FanoutWriteStrategy;
pub use hybrid::HybridStrategy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::{AppError, Result};
use crate::models::Post;

pub const OP_PUBLISH: &str = "publish_post";
pub const OP_TIMELINE: &str = "get_timeline";

/// A timeline delivery strategy. One post enters, many timelines observe it;
/// the strategy decides whether that work happens at write or read time.
#[async_trait]
pub trait TimelineStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Publish a post. Succeeds iff the post is durable in the relational
    /// store; cache population is best-effort and reported through metrics.
    async fn publish_post(&self, user_id: i64, content: &str)
        -> Result<(Post, OperationMetrics)>;

    /// Assemble a user's home timeline, newest first.
    async fn get_timeline(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Post>, OperationMetrics)>;

    /// Delete a post and perform this strategy's cache invalidation.
    async fn delete_post(&self, post_id: i64, user_id: i64) -> Result<()>;

    /// Rebuild the user's cached timeline from the relational store.
    async fn rebuild_timeline(&self, user_id: i64, limit: usize) -> Result<()>;
}

/// Strategy selector used on the wire. `push` and `pull` are accepted as
/// aliases for the fan-out names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[serde(alias = "push")]
    FanoutWrite,
    #[serde(alias = "pull")]
    FanoutRead,
    Hybrid,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::FanoutWrite,
        StrategyKind::FanoutRead,
        StrategyKind::Hybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::FanoutWrite => "fanout_write",
            StrategyKind::FanoutRead => "fanout_read",
            StrategyKind::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fanout_write" | "push" => Ok(StrategyKind::FanoutWrite),
            "fanout_read" | "pull" => Ok(StrategyKind::FanoutRead),
            "hybrid" => Ok(StrategyKind::Hybrid),
            other => Err(AppError::BadRequest(format!(
                "unknown strategy: {}",
                other
            ))),
        }
    }
}

/// Per-operation measurements, recorded for every publish and timeline read,
/// including failed ones.
#[derive(Debug, Clone, Serialize)]
pub struct OperationMetrics {
    pub strategy: &'static str,
    pub operation: &'static str,
    pub started_at: DateTime<Utc>,

    #[serde(rename = "duration_ms", serialize_with = "ser_duration_ms")]
    pub duration: Duration,

    /// Write side: followers fanned out to. Read side: authors merged.
    pub fan_out_count: usize,

    #[serde(rename = "fan_out_duration_ms", serialize_with = "ser_duration_ms")]
    pub fan_out_duration: Duration,

    pub cache_hit: bool,
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn ser_duration_ms<S>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// In-flight measurement for one operation. Strategies fill the fan-out and
/// cache-hit fields as the operation progresses, then seal it with
/// [`OpTimer::finish`] or [`OpTimer::fail`].
pub(crate) struct OpTimer {
    strategy: &'static str,
    operation: &'static str,
    started_at: DateTime<Utc>,
    started: Instant,
    pub fan_out_count: usize,
    pub fan_out_duration: Duration,
    pub cache_hit: bool,
}

impl OpTimer {
    pub fn new(strategy: &'static str, operation: &'static str) -> Self {
        Self {
            strategy,
            operation,
            started_at: Utc::now(),
            started: Instant::now(),
            fan_out_count: 0,
            fan_out_duration: Duration::ZERO,
            cache_hit: false,
        }
    }

    fn seal(self, success: bool, error: Option<String>) -> OperationMetrics {
        OperationMetrics {
            strategy: self.strategy,
            operation: self.operation,
            started_at: self.started_at,
            duration: self.started.elapsed(),
            fan_out_count: self.fan_out_count,
            fan_out_duration: self.fan_out_duration,
            cache_hit: self.cache_hit,
            success,
            error,
        }
    }

    pub fn finish(self) -> OperationMetrics {
        self.seal(true, None)
    }

    /// Seal as a completed operation that hit a soft fault (the result
    /// stands, the error is only surfaced through metrics).
    pub fn finish_with_error(self, err: &AppError) -> OperationMetrics {
        self.seal(true, Some(err.to_string()))
    }

    pub fn fail(self, err: &AppError) -> OperationMetrics {
        self.seal(false, Some(err.to_string()))
    }
}

/// Sort newest-first; equal timestamps fall back to descending id so
/// pagination is stable.
pub(crate) fn sort_posts_desc(posts: &mut [Post]) {
    posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

/// Merge two post streams, newest first, truncated to `limit`.
pub(crate) fn merge_posts(a: Vec<Post>, b: Vec<Post>, limit: usize) -> Vec<Post> {
    let mut merged = a;
    merged.extend(b);
    sort_posts_desc(&mut merged);
    merged.truncate(limit);
    merged
}

/// Drop duplicate posts by id, keeping the first occurrence.
pub(crate) fn dedup_posts(posts: Vec<Post>) -> Vec<Post> {
    let mut seen = HashSet::with_capacity(posts.len());
    posts.into_iter().filter(|p| seen.insert(p.id)).collect()
}

/// Apply offset/limit to an already-sorted stream.
pub(crate) fn paginate(mut posts: Vec<Post>, limit: usize, offset: usize) -> Vec<Post> {
    if offset > 0 {
        if offset >= posts.len() {
            return Vec::new();
        }
        posts.drain(..offset);
    }
    posts.truncate(limit);
    posts
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use chrono::TimeZone;

    /// A post whose timestamp increases with `seq`, so ordering assertions
    /// read naturally.
    pub fn post_at(id: i64, user_id: i64, seq: i64) -> Post {
        Post {
            id,
            user_id,
            content: format!("post-{}", id),
            created_at: Utc.timestamp_opt(1_700_000_000 + seq, 0).unwrap(),
            username: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::post_at;
    use super::*;

    #[test]
    fn test_strategy_kind_parsing_and_aliases() {
        assert_eq!(
            "fanout_write".parse::<StrategyKind>().unwrap(),
            StrategyKind::FanoutWrite
        );
        assert_eq!(
            "push".parse::<StrategyKind>().unwrap(),
            StrategyKind::FanoutWrite
        );
        assert_eq!(
            "pull".parse::<StrategyKind>().unwrap(),
            StrategyKind::FanoutRead
        );
        assert_eq!(
            "hybrid".parse::<StrategyKind>().unwrap(),
            StrategyKind::Hybrid
        );
        assert!("ranked".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_strategy_kind_roundtrip() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.as_str().parse::<StrategyKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_sort_posts_desc_breaks_ties_by_id() {
        let mut posts = vec![post_at(1, 1, 5), post_at(3, 1, 5), post_at(2, 1, 9)];
        sort_posts_desc(&mut posts);
        let ids: Vec<i64> = posts.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_merge_posts_truncates_to_limit() {
        let a = vec![post_at(1, 1, 1), post_at(2, 1, 3)];
        let b = vec![post_at(3, 2, 2), post_at(4, 2, 4)];
        let merged = merge_posts(a, b, 3);
        let ids: Vec<i64> = merged.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![4, 2, 3]);
    }

    #[test]
    fn test_dedup_posts_keeps_first_occurrence() {
        let posts = vec![post_at(1, 1, 3), post_at(2, 1, 2), post_at(1, 1, 3)];
        let deduped = dedup_posts(posts);
        let ids: Vec<i64> = deduped.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_paginate_offset_past_end() {
        let posts = vec![post_at(1, 1, 1), post_at(2, 1, 2)];
        assert!(paginate(posts, 10, 5).is_empty());
    }

    #[test]
    fn test_paginate_window() {
        let posts: Vec<Post> = (0..5).map(|i| post_at(i, 1, 10 - i)).collect();
        let page = paginate(posts, 2, 1);
        let ids: Vec<i64> = page.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_op_timer_seals_failure() {
        let timer = OpTimer::new("hybrid", OP_PUBLISH);
        let metrics = timer.fail(&AppError::Internal("boom".to_string()));
        assert_eq!(metrics.strategy, "hybrid");
        assert_eq!(metrics.operation, OP_PUBLISH);
        assert!(!metrics.success);
        assert!(metrics.error.as_deref().unwrap().contains("boom"));
    }

    #[test]
    fn test_op_timer_soft_error_keeps_success() {
        let timer = OpTimer::new("fanout_write", OP_PUBLISH);
        let metrics = timer.finish_with_error(&AppError::Internal("followers".to_string()));
        assert!(metrics.success);
        assert!(metrics.error.is_some());
    }
}
