//! `attendance-http` is an async HTTP client for the attendance portal
//! upstream REST API.
//!
//! One [`ApiClient`] handles every data-fetching call:
//! - [`ApiClient::get`], [`ApiClient::get_cached`], [`ApiClient::post`],
//!   [`ApiClient::put`], [`ApiClient::patch`], [`ApiClient::delete`]
//! - [`ApiClient::send`] for per-request TTL, timeout, retries and cancellation
//! - [`ApiClient::invalidate`] to evict a resource family after a write
//! - [`ApiClient::metrics`] and [`ApiClient::health_status`] for per-attempt
//!   timings and an error-rate based health view
//!
//! Transient failures (transport errors, 5xx, and optionally timeouts) are
//! retried with exponential backoff. A 401 triggers one single-flight token
//! refresh when a [`TokenRefresher`] is installed.

mod auth;
mod cache;
mod client;
mod error;
mod fallback;
mod metrics;
mod options;
mod query;
mod refresh;
mod request;
mod wire;

pub use auth::{
    EndpointRefresher, MemoryTokenStore, TokenRefresher, TokenStore, DEFAULT_REFRESH_TIMEOUT_MS,
};
pub use cache::{CacheKey, ResponseCache};
pub use client::{ApiClient, HealthReport};
pub use error::{ApiError, ErrorKind};
pub use fallback::{with_fallback, with_fallback_else};
pub use metrics::{
    ApiHealth, EndpointSummary, HealthStatus, PerformanceSummary, RequestMetrics, RequestRecord,
    DEFAULT_HISTORY_LIMIT,
};
pub use options::{ClientOptions, Environment};
pub use query::Query;
pub use request::ApiRequest;

pub use async_trait::async_trait;
pub use reqwest::Method;
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, ApiError>;
