//! HTTP surface over the timeline engine.
//!
//! Handlers stay thin: parse, delegate to [`TimelineEngine`], serialize.
//! All storage access lives behind the engine.

use actix_web::{delete, get, post, put, web, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::engine::TimelineEngine;
use crate::error::{AppError, Result};
use crate::models::Post;
use crate::strategies::{OperationMetrics, StrategyKind};

pub fn configure(cfg: &mut web::ServiceConfig) {
    // `users/sample` is registered ahead of `users/{id}` so the literal
    // segment wins the route match.
    cfg.service(health)
        .service(create_user)
        .service(get_sample_users)
        .service(get_user)
        .service(get_user_followers)
        .service(get_user_following)
        .service(create_follow)
        .service(delete_follow)
        .service(publish_post)
        .service(delete_post)
        .service(get_timeline)
        .service(rebuild_timeline)
        .service(get_config)
        .service(update_config)
        .service(get_stats)
        .service(get_metrics)
        .service(get_recent_metrics)
        .service(clear_metrics);
}

#[derive(Debug, Deserialize)]
pub struct PublishPostRequest {
    pub user_id: i64,
    pub content: String,
    pub strategy: StrategyKind,
}

#[derive(Debug, Serialize)]
pub struct PublishPostResponse {
    pub post: Post,
    pub metrics: OperationMetrics,
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub user_id: i64,
    pub strategy: StrategyKind,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub posts: Vec<Post>,
    pub count: usize,
    pub metrics: OperationMetrics,
}

#[derive(Debug, Deserialize)]
pub struct DeletePostQuery {
    pub user_id: i64,
    pub strategy: StrategyKind,
}

#[derive(Debug, Deserialize)]
pub struct RebuildRequest {
    pub user_id: i64,
    pub strategy: StrategyKind,
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct FollowRequest {
    pub follower_id: i64,
    pub followee_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ConfigUpdateRequest {
    pub key: String,
    pub value: i64,
}

#[derive(Debug, Deserialize)]
pub struct RecentMetricsQuery {
    #[serde(default = "default_recent_limit")]
    pub limit: usize,
}

fn default_recent_limit() -> usize {
    100
}

#[get("/health")]
async fn health(engine: web::Data<TimelineEngine>) -> HttpResponse {
    let health = engine.health().await;
    let status = if health.is_healthy() { "ok" } else { "degraded" };
    HttpResponse::Ok().json(json!({
        "status": status,
        "database": health.database,
        "cache": health.cache,
    }))
}

#[get("/api/v1/stats")]
async fn get_stats(engine: web::Data<TimelineEngine>) -> Result<HttpResponse> {
    let stats = engine.stats().await?;
    Ok(HttpResponse::Ok().json(stats))
}

#[post("/api/v1/users")]
async fn create_user(
    engine: web::Data<TimelineEngine>,
    body: web::Json<CreateUserRequest>,
) -> Result<HttpResponse> {
    let username = body.username.trim();
    if username.is_empty() {
        return Err(AppError::BadRequest("username must not be empty".to_string()));
    }

    let user = engine.users().create(username).await?;
    Ok(HttpResponse::Created().json(user))
}

#[get("/api/v1/users/{id}")]
async fn get_user(
    engine: web::Data<TimelineEngine>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let user = engine.users().get_by_id(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(user))
}

/// A few regular users plus the top celebrity, for poking at the API by
/// hand.
#[get("/api/v1/users/sample")]
async fn get_sample_users(engine: web::Data<TimelineEngine>) -> Result<HttpResponse> {
    let threshold = engine.settings().celebrity_threshold();

    let mut users = engine.users().get_random(3).await?;
    let celebrities = engine.users().get_celebrities(threshold).await?;
    if let Some(top) = celebrities.into_iter().next() {
        users.push(top);
    }

    let users: Vec<serde_json::Value> = users
        .iter()
        .map(|u| {
            json!({
                "id": u.id,
                "username": u.username,
                "follower_count": u.follower_count,
                "is_celebrity": u.is_celebrity(threshold),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({ "users": users })))
}

#[get("/api/v1/users/{id}/followers")]
async fn get_user_followers(
    engine: web::Data<TimelineEngine>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let user_id = path.into_inner();
    engine.users().get_by_id(user_id).await?;

    let followers = engine.follows().get_followers(user_id).await?;
    let sample: Vec<i64> = followers.iter().take(3).copied().collect();

    Ok(HttpResponse::Ok().json(json!({
        "user_id": user_id,
        "follower_count": followers.len(),
        "sample_followers": sample,
    })))
}

#[get("/api/v1/users/{id}/following")]
async fn get_user_following(
    engine: web::Data<TimelineEngine>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let user_id = path.into_inner();
    engine.users().get_by_id(user_id).await?;

    let following = engine.follows().get_following(user_id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "user_id": user_id,
        "following_count": following.len(),
        "following": following,
    })))
}

#[post("/api/v1/follows")]
async fn create_follow(
    engine: web::Data<TimelineEngine>,
    body: web::Json<FollowRequest>,
) -> Result<HttpResponse> {
    engine
        .follows()
        .create(body.follower_id, body.followee_id)
        .await?;
    Ok(HttpResponse::Created().json(json!({ "status": "followed" })))
}

#[delete("/api/v1/follows")]
async fn delete_follow(
    engine: web::Data<TimelineEngine>,
    body: web::Json<FollowRequest>,
) -> Result<HttpResponse> {
    engine
        .follows()
        .delete(body.follower_id, body.followee_id)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "status": "unfollowed" })))
}

#[post("/api/v1/posts")]
async fn publish_post(
    engine: web::Data<TimelineEngine>,
    body: web::Json<PublishPostRequest>,
) -> Result<HttpResponse> {
    let (post, metrics) = engine
        .publish_post(body.strategy, body.user_id, &body.content)
        .await?;
    Ok(HttpResponse::Created().json(PublishPostResponse { post, metrics }))
}

#[delete("/api/v1/posts/{id}")]
async fn delete_post(
    engine: web::Data<TimelineEngine>,
    path: web::Path<i64>,
    query: web::Query<DeletePostQuery>,
) -> Result<HttpResponse> {
    engine
        .delete_post(query.strategy, path.into_inner(), query.user_id)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "status": "deleted" })))
}

#[get("/api/v1/timeline")]
async fn get_timeline(
    engine: web::Data<TimelineEngine>,
    query: web::Query<TimelineQuery>,
) -> Result<HttpResponse> {
    let (posts, metrics) = engine
        .get_timeline(query.strategy, query.user_id, query.limit, query.offset)
        .await?;
    Ok(HttpResponse::Ok().json(TimelineResponse {
        count: posts.len(),
        posts,
        metrics,
    }))
}

#[post("/api/v1/timeline/rebuild")]
async fn rebuild_timeline(
    engine: web::Data<TimelineEngine>,
    body: web::Json<RebuildRequest>,
) -> Result<HttpResponse> {
    engine
        .rebuild_timeline(body.strategy, body.user_id, body.limit)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "status": "rebuilt" })))
}

#[get("/api/v1/config")]
async fn get_config(engine: web::Data<TimelineEngine>) -> HttpResponse {
    let settings = engine.settings();
    HttpResponse::Ok().json(json!({
        "celebrity_threshold": settings.celebrity_threshold(),
        "timeline_cache_size": settings.timeline_cache_size(),
        "timeline_page_size": settings.timeline_page_size(),
    }))
}

#[put("/api/v1/config")]
async fn update_config(
    engine: web::Data<TimelineEngine>,
    body: web::Json<ConfigUpdateRequest>,
) -> Result<HttpResponse> {
    let settings = engine.settings();
    match body.key.as_str() {
        "celebrity_threshold" | "celebrity-threshold" => {
            settings.set_celebrity_threshold(body.value);
        }
        "timeline_cache_size" | "timeline-cache-size" => {
            if body.value <= 0 {
                return Err(AppError::BadRequest(
                    "timeline_cache_size must be positive".to_string(),
                ));
            }
            settings.set_timeline_cache_size(body.value as usize);
        }
        "timeline_page_size" | "timeline-page-size" => {
            if body.value <= 0 {
                return Err(AppError::BadRequest(
                    "timeline_page_size must be positive".to_string(),
                ));
            }
            settings.set_timeline_page_size(body.value as usize);
        }
        other => {
            return Err(AppError::BadRequest(format!("unknown config key: {}", other)));
        }
    }

    info!("Config updated: {} = {}", body.key, body.value);
    Ok(HttpResponse::Ok().json(json!({ "status": "updated" })))
}

#[get("/api/v1/metrics")]
async fn get_metrics(engine: web::Data<TimelineEngine>) -> HttpResponse {
    HttpResponse::Ok().json(engine.metrics().summary())
}

#[get("/api/v1/metrics/recent")]
async fn get_recent_metrics(
    engine: web::Data<TimelineEngine>,
    query: web::Query<RecentMetricsQuery>,
) -> HttpResponse {
    HttpResponse::Ok().json(engine.metrics().recent(query.limit))
}

#[delete("/api/v1/metrics")]
async fn clear_metrics(engine: web::Data<TimelineEngine>) -> HttpResponse {
    engine.metrics().clear();
    HttpResponse::Ok().json(json!({ "status": "cleared" }))
}
