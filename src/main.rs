use actix_web::{web, App, HttpServer};
use redis::aio::ConnectionManager;
use std::io;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use timeline_service::config::{Config, EngineSettings};
use timeline_service::engine::TimelineEngine;
use timeline_service::{db, handlers};

#[actix_web::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().expect("Failed to load configuration");

    info!(
        "Starting timeline-service v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!("Environment: {}", config.app.env);

    let pool = db::new_pool(&config.database)
        .await
        .expect("Failed to create database pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    let redis_client =
        redis::Client::open(config.redis.url.as_str()).expect("Invalid Redis URL");
    let redis = ConnectionManager::new(redis_client)
        .await
        .expect("Failed to create Redis connection");

    let settings = Arc::new(EngineSettings::new(&config.timeline));
    let engine = web::Data::new(TimelineEngine::new(pool, redis, settings));

    info!(
        "Timeline engine ready (celebrity_threshold={}, cache_size={}, page_size={})",
        engine.settings().celebrity_threshold(),
        engine.settings().timeline_cache_size(),
        engine.settings().timeline_page_size(),
    );

    let bind_addr = (config.app.host.clone(), config.app.port);
    HttpServer::new(move || {
        App::new()
            .app_data(engine.clone())
            .configure(handlers::configure)
    })
    .bind(bind_addr)?
    .run()
    .await
}
