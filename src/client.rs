use std::{
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use reqwest::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode, Url,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::{authorization_header, usable_token, TokenRefresher, TokenStore},
    cache::{CacheKey, ResponseCache},
    metrics::{ApiHealth, RequestMetrics, RequestRecord},
    refresh::RefreshGate,
    request::CacheMode,
    wire, ApiError, ApiRequest, ClientOptions, Environment, Query, Result,
};

/// HTTP client for the attendance portal upstream API.
///
/// Cloning is cheap; clones share the response cache, the request metrics and
/// the refresh gate.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    options: ClientOptions,
    cache: Arc<ResponseCache>,
    metrics: Arc<RequestMetrics>,
    tokens: Option<Arc<dyn TokenStore>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    refresh_gate: Arc<RefreshGate>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("options", &self.options)
            .field("tokens", &self.tokens.as_ref().map(|_| "<redacted>"))
            .field("refresh_on_unauthorized", &self.refresher.is_some())
            .finish()
    }
}

/// Result of [`ApiClient::check_health`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthReport {
    pub success: bool,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// A request after validation, ready to be dispatched (possibly several times).
struct Prepared {
    method: Method,
    url: Url,
    cache_key: Option<CacheKey>,
    cache_ttl: Duration,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    timeout: Duration,
    max_retries: usize,
    cancel: Option<CancellationToken>,
}

impl ApiClient {
    /// Creates a client for `base_url` with default options and no auth.
    ///
    /// Relative request paths are appended to `base_url` verbatim.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            options: ClientOptions::default(),
            cache: Arc::new(ResponseCache::new()),
            metrics: Arc::new(RequestMetrics::new()),
            tokens: None,
            refresher: None,
            refresh_gate: Arc::new(RefreshGate::default()),
        }
    }

    /// Creates a client with an environment's preset base URL and options.
    pub fn for_environment(environment: Environment) -> Self {
        Self::new(environment.default_base_url()).with_options(environment.options())
    }

    /// Creates a client from environment variables.
    ///
    /// Reads `ATTENDANCE_API_ENV` for presets, `ATTENDANCE_API_BASE_URL` for
    /// the base address, and the option overrides listed on
    /// [`ClientOptions::from_env`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use attendance_http::ApiClient;
    ///
    /// let client = ApiClient::from_env().expect("invalid ATTENDANCE_API_* configuration");
    /// ```
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = Environment::from_lookup(&lookup)?;
        let options = ClientOptions::from_lookup(&lookup)?;
        let base_url = match lookup("ATTENDANCE_API_BASE_URL") {
            Some(url) if url.trim().is_empty() => {
                return Err(ApiError::Config(
                    "ATTENDANCE_API_BASE_URL is set but empty".to_owned(),
                ))
            }
            Some(url) => url.trim().to_owned(),
            None => environment.default_base_url().to_owned(),
        };
        Ok(Self::new(base_url).with_options(options))
    }

    /// Applies client options such as timeout, retry and cache behavior.
    pub fn with_options(mut self, opts: ClientOptions) -> Self {
        self.options = opts;
        self
    }

    /// Uses a preconfigured `reqwest` client (proxies, TLS roots, cookies).
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Records attempts into `metrics` instead of a client-private recorder.
    pub fn with_metrics(mut self, metrics: Arc<RequestMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attaches `Authorization: Bearer <token>` from `store` to every request.
    pub fn with_token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.tokens = Some(store);
        self
    }

    /// Enables refresh-and-retry on 401 responses.
    ///
    /// Without a refresher a 401 is returned to the caller unchanged.
    pub fn with_token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Every dispatched attempt, retries included.
    pub fn metrics(&self) -> &RequestMetrics {
        &self.metrics
    }

    /// Health derived from the error rate of recent attempts.
    pub fn health_status(&self) -> ApiHealth {
        self.metrics.health()
    }

    /// Sends a GET request without caching.
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: impl Into<Query>) -> Result<T> {
        self.send(ApiRequest::get(path).query(query)).await
    }

    /// Sends a GET request, serving it from the cache while the entry is fresh.
    pub async fn get_cached<T: DeserializeOwned>(
        &self,
        path: &str,
        query: impl Into<Query>,
    ) -> Result<T> {
        self.send(ApiRequest::get(path).query(query).cached()).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(ApiRequest::post(path).json(body)).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(ApiRequest::put(path).json(body)).await
    }

    pub async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(ApiRequest::patch(path).json(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(ApiRequest::delete(path)).await
    }

    /// Sends a fully specified request and decodes the response into `T`.
    ///
    /// JSON responses decode as usual; non-JSON bodies arrive as a string, so
    /// `T = String` receives raw text.
    pub async fn send<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let value = self.fetch(request).await?;
        serde_json::from_value(value)
            .map_err(|err| ApiError::Decode(format!("unexpected response shape: {err}")))
    }

    /// Evicts every cached response of a resource family.
    ///
    /// `invalidate("/locations")` drops `/locations`, `/locations?page=2` and
    /// `/locations/42`, but not `/locations-archive`.
    pub fn invalidate(&self, family: &str) -> usize {
        let evicted = self.cache.invalidate(self.relative(family));

        #[cfg(feature = "tracing")]
        tracing::debug!(family, evicted, "invalidated cached responses");

        evicted
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Issues one uncached GET to `path` and reports reachability.
    pub async fn check_health(&self, path: &str) -> HealthReport {
        let started = Instant::now();
        let outcome = self.fetch(ApiRequest::get(path)).await;
        HealthReport {
            success: outcome.is_ok(),
            elapsed: started.elapsed(),
            error: outcome.err().map(|err| err.to_string()),
        }
    }

    async fn fetch(&self, request: ApiRequest) -> Result<JsonValue> {
        let prepared = self.prepare(request)?;

        if let Some(key) = &prepared.cache_key {
            if let Some(value) = self.cache.get(key) {
                #[cfg(feature = "tracing")]
                tracing::debug!(key = %key, "serving response from cache");

                return Ok(value);
            }
        }

        let value = self.execute(&prepared).await?;

        if let Some(key) = prepared.cache_key {
            #[cfg(feature = "tracing")]
            tracing::debug!(key = %key, ttl_ms = prepared.cache_ttl.as_millis() as u64, "caching response");

            self.cache.insert(key, value.clone(), prepared.cache_ttl);
        }
        Ok(value)
    }

    fn prepare(&self, request: ApiRequest) -> Result<Prepared> {
        let ApiRequest {
            method,
            path,
            query,
            headers,
            body,
            body_error,
            cache,
            timeout,
            max_retries,
            cancel,
        } = request;

        if let Some(err) = body_error {
            return Err(ApiError::Validation(format!(
                "request body could not be serialized: {err}"
            )));
        }

        let target = append_query(&path, &query);
        let url_text = if is_absolute(&target) {
            target.clone()
        } else {
            format!("{}{}", self.base_url, target)
        };
        let url = Url::parse(&url_text)
            .map_err(|err| ApiError::Validation(format!("invalid URL '{url_text}': {err}")))?;

        let cache_key = match cache {
            Some(_) if method == Method::GET => Some(CacheKey::from_path(self.relative(&target))),
            _ => None,
        };
        let cache_ttl = match cache {
            Some(CacheMode::Ttl(ttl)) => ttl,
            _ => self.options.cache_ttl(),
        };

        Ok(Prepared {
            method,
            url,
            cache_key,
            cache_ttl,
            headers: build_headers(&headers)?,
            body,
            timeout: timeout.unwrap_or_else(|| self.options.timeout()),
            max_retries: max_retries.unwrap_or(self.options.max_retries),
            cancel,
        })
    }

    /// Runs the retry loop, then the single refresh-and-retry on a 401.
    async fn execute(&self, request: &Prepared) -> Result<JsonValue> {
        let token = self.current_token();
        let err = match self.dispatch_with_retry(request, token.as_deref()).await {
            Err(err) if err.is_unauthorized() => err,
            other => return other,
        };
        let Some(refresher) = self.refresher.as_ref() else {
            return Err(err);
        };

        let refresh = self
            .refresh_gate
            .refresh(token.as_deref(), self.tokens.as_ref(), refresher);
        let refreshed = with_cancel(request.cancel.as_ref(), async {
            tokio::time::timeout(request.timeout, refresh)
                .await
                .map_err(|_| ApiError::Timeout {
                    timeout_ms: request.timeout.as_millis() as u64,
                })?
        })
        .await?;
        self.dispatch_with_retry(request, Some(&refreshed)).await
    }

    async fn dispatch_with_retry(&self, request: &Prepared, token: Option<&str>) -> Result<JsonValue> {
        let mut attempt = 0usize;
        loop {
            match with_cancel(request.cancel.as_ref(), self.dispatch(request, token)).await {
                Ok(value) => return Ok(value),
                Err(err)
                    if attempt < request.max_retries
                        && err.is_transient(self.options.retry_on_timeout) =>
                {
                    self.wait_before_retry(request, attempt, &err).await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn dispatch(&self, request: &Prepared, token: Option<&str>) -> Result<JsonValue> {
        let started = Instant::now();
        let mut status = None;
        let outcome = self.exchange(request, token, &mut status).await;
        self.record_attempt(request, started.elapsed(), status, &outcome);
        outcome
    }

    async fn exchange(
        &self,
        request: &Prepared,
        token: Option<&str>,
        status_seen: &mut Option<StatusCode>,
    ) -> Result<JsonValue> {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(request.timeout);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, authorization_header(token)?);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| transport_error(err, request.timeout))?;
        let status = response.status();
        *status_seen = Some(status);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response
            .text()
            .await
            .map_err(|err| transport_error(err, request.timeout))?;

        if !status.is_success() {
            return Err(wire::http_error(status, body));
        }
        wire::decode_success(content_type.as_deref(), body)
    }

    fn record_attempt(
        &self,
        request: &Prepared,
        elapsed: Duration,
        status: Option<StatusCode>,
        outcome: &Result<JsonValue>,
    ) {
        let status = status.map(|status| status.as_u16());

        #[cfg(feature = "tracing")]
        tracing::debug!(
            method = %request.method,
            url = %request.url,
            status,
            elapsed_ms = elapsed.as_millis() as u64,
            success = outcome.is_ok(),
            "request completed"
        );

        self.metrics.record(RequestRecord {
            endpoint: request.url.path().to_owned(),
            method: request.method.clone(),
            duration: elapsed,
            status,
            success: outcome.is_ok(),
            recorded_at: SystemTime::now(),
            error: outcome.as_ref().err().map(ToString::to_string),
        });
    }

    /// Waits `retry_delay_ms * 2^attempt` before the next attempt.
    async fn wait_before_retry(&self, request: &Prepared, attempt: usize, err: &ApiError) -> Result<()> {
        let delay = self.options.retry_delay(attempt);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            method = %request.method,
            url = %request.url,
            retry = attempt + 1,
            max_retries = request.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying request"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = err;

        with_cancel(request.cancel.as_ref(), async {
            sleep(delay).await;
            Ok(())
        })
        .await
    }

    fn current_token(&self) -> Option<String> {
        self.tokens
            .as_ref()
            .and_then(|store| usable_token(store.token()))
    }

    /// Strips the base URL from absolute URLs that point below it, so cache
    /// families are the same whichever form the caller used.
    fn relative<'a>(&self, path: &'a str) -> &'a str {
        if self.base_url.is_empty() {
            return path;
        }
        match path.strip_prefix(self.base_url.as_str()) {
            Some(rest) if rest.starts_with('/') || rest.starts_with('?') => rest,
            _ => path,
        }
    }
}

async fn with_cancel<T, F>(cancel: Option<&CancellationToken>, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(ApiError::Cancelled),
            result = operation => result,
        },
        None => operation.await,
    }
}

pub(crate) fn transport_error(err: reqwest::Error, timeout: Duration) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if err.is_builder() {
        ApiError::Validation(err.to_string())
    } else {
        ApiError::Transport(err)
    }
}

fn is_absolute(path: &str) -> bool {
    let lower = path.get(..8).unwrap_or(path).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn append_query(path: &str, query: &Query) -> String {
    if query.is_empty() {
        return path.to_owned();
    }
    let separator = if path.contains('?') { '&' } else { '?' };
    format!("{path}{separator}{}", query.encode())
}

fn build_headers(extra: &[(String, String)]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
    for (name, value) in extra {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| ApiError::Validation(format!("invalid header name '{name}': {err}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|err| ApiError::Validation(format!("invalid value for header '{name}': {err}")))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}
