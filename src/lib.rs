pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod strategies;

pub use cache::TimelineCache;
pub use config::{Config, EngineSettings};
pub use engine::TimelineEngine;
pub use error::{AppError, Result};
pub use metrics::MetricsStore;
pub use strategies::{OperationMetrics, StrategyKind, TimelineStrategy};
