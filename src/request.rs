use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::Query;

/// One logical request, built by the caller and handed to
/// [`ApiClient::send`](crate::ApiClient::send).
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use attendance_http::{ApiClient, ApiRequest};
///
/// # async fn run(client: ApiClient) -> attendance_http::Result<()> {
/// let stats: serde_json::Value = client
///     .send(
///         ApiRequest::get("/attendance/stats")
///             .query([("dateFrom", "2024-01-01")])
///             .cache_for(Duration::from_secs(60)),
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: Query,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Option<Vec<u8>>,
    pub(crate) body_error: Option<String>,
    pub(crate) cache: Option<CacheMode>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_retries: Option<usize>,
    pub(crate) cancel: Option<CancellationToken>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CacheMode {
    DefaultTtl,
    Ttl(Duration),
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Query::default(),
            headers: Vec::new(),
            body: None,
            body_error: None,
            cache: None,
            timeout: None,
            max_retries: None,
            cancel: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, query: impl Into<Query>) -> Self {
        self.query = query.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Serializes `body` as the JSON request body.
    ///
    /// A serialization failure is reported by `send` as
    /// [`ApiError::Validation`](crate::ApiError::Validation), before any
    /// network activity.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Self {
        match serde_json::to_vec(body) {
            Ok(bytes) => {
                self.body = Some(bytes);
                self.body_error = None;
            }
            Err(err) => {
                self.body = None;
                self.body_error = Some(err.to_string());
            }
        }
        self
    }

    /// Caches a successful GET with the client's default TTL.
    pub fn cached(mut self) -> Self {
        self.cache = Some(CacheMode::DefaultTtl);
        self
    }

    /// Caches a successful GET for `ttl`.
    pub fn cache_for(mut self, ttl: Duration) -> Self {
        self.cache = Some(CacheMode::Ttl(ttl));
        self
    }

    /// Overrides the client's per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the client's retry count.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Aborts the call when `token` is cancelled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use reqwest::Method;
    use serde::{Serialize, Serializer};
    use serde_json::json;

    use super::{ApiRequest, CacheMode};

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("cannot serialize"))
        }
    }

    #[test]
    fn json_body_is_serialized_eagerly() {
        let request = ApiRequest::post("/locations").json(&json!({"name": "HQ", "radius": 100}));
        let body: serde_json::Value =
            serde_json::from_slice(request.body.as_deref().expect("body must be set"))
                .expect("body must be json");
        assert_eq!(body, json!({"name": "HQ", "radius": 100}));
        assert!(request.body_error.is_none());
    }

    #[test]
    fn unserializable_body_is_recorded() {
        let request = ApiRequest::post("/locations").json(&Unserializable);
        assert!(request.body.is_none());
        assert!(request
            .body_error
            .as_deref()
            .is_some_and(|message| message.contains("cannot serialize")));

        let mut map = HashMap::new();
        map.insert("ok", 1);
        let request = ApiRequest::post("/locations")
            .json(&Unserializable)
            .json(&map);
        assert!(request.body_error.is_none(), "a later valid body replaces the error");
    }

    #[test]
    fn builder_records_overrides() {
        let request = ApiRequest::get("/locations")
            .query([("status", "active")])
            .cache_for(Duration::from_secs(30))
            .timeout(Duration::from_secs(2))
            .max_retries(0);

        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.path(), "/locations");
        assert_eq!(request.query.encode(), "status=active");
        assert_eq!(request.cache, Some(CacheMode::Ttl(Duration::from_secs(30))));
        assert_eq!(request.timeout, Some(Duration::from_secs(2)));
        assert_eq!(request.max_retries, Some(0));
    }
}
