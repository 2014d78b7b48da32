use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered account. `follower_count` / `following_count` are cached
/// denormalizations of the follows table, moved atomically with edge writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub follower_count: i64,
    pub following_count: i64,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Whether this user is fanned out on read rather than on write.
    pub fn is_celebrity(&self, threshold: i64) -> bool {
        self.follower_count >= threshold
    }
}

/// An immutable authored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub user_id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,

    /// Author username, present when the row was joined against users.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[sqlx(default)]
    pub username: Option<String>,
}

/// A directed follow edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follow {
    pub follower_id: i64,
    pub followee_id: i64,
    pub created_at: DateTime<Utc>,
}
