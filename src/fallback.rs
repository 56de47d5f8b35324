//! Explicit fallback values for calls whose failure the caller chooses to mask.
//!
//! The client itself never substitutes a value for a failure. Call sites that
//! prefer showing placeholder data over an error opt in here, and every
//! substitution is logged so outages stay visible.

use std::future::Future;

use crate::{ApiError, Result};

/// Awaits `operation`, returning `fallback` if it fails.
///
/// # Example
///
/// ```no_run
/// use attendance_http::{with_fallback, ApiClient};
///
/// # async fn run(client: ApiClient) {
/// let locations: Vec<serde_json::Value> =
///     with_fallback(client.get_cached("/locations", ()), Vec::new()).await;
/// # }
/// ```
pub async fn with_fallback<T, F>(operation: F, fallback: T) -> T
where
    F: Future<Output = Result<T>>,
{
    with_fallback_else(operation, |_| fallback).await
}

/// Awaits `operation`, building a replacement from the error if it fails.
pub async fn with_fallback_else<T, F, G>(operation: F, fallback: G) -> T
where
    F: Future<Output = Result<T>>,
    G: FnOnce(&ApiError) -> T,
{
    match operation.await {
        Ok(value) => value,
        Err(err) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %err, kind = ?err.kind(), "request failed; using fallback value");

            fallback(&err)
        }
    }
}
