use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{client::transport_error, wire, ApiError, Result};

/// Deadline for one call to the refresh endpoint unless overridden.
pub const DEFAULT_REFRESH_TIMEOUT_MS: u64 = 10_000;

/// Source of the bearer token attached to outgoing requests.
///
/// The client only reads the store, except for [`TokenStore::clear`] after a
/// token refresh has failed for good.
pub trait TokenStore: Send + Sync {
    /// Current access token, if any.
    fn token(&self) -> Option<String>;
    /// Drops the stored token, forcing re-authentication.
    fn clear(&self);
}

/// Obtains a new access token after the upstream rejected the current one.
///
/// Implementations are expected to persist the new token to the store the
/// client reads from, and return it.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<String>;
}

/// Thread-safe in-memory [`TokenStore`].
///
/// A token stored with an expiry reads as absent once it has passed.
#[derive(Default)]
pub struct MemoryTokenStore {
    token: RwLock<Option<StoredToken>>,
}

struct StoredToken {
    value: String,
    expires_at: Option<Instant>,
}

impl fmt::Debug for MemoryTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let present = self.token().is_some();
        f.debug_struct("MemoryTokenStore")
            .field("token", &if present { "<redacted>" } else { "<none>" })
            .finish()
    }
}

#[derive(Deserialize)]
struct SessionCookie {
    token: Option<String>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::new();
        store.set(token);
        store
    }

    /// Builds a store from a JSON session cookie value such as `{"token":"…"}`.
    pub fn from_session_cookie(value: &str) -> Result<Self> {
        let session: SessionCookie = serde_json::from_str(value)
            .map_err(|err| ApiError::Validation(format!("invalid session cookie: {err}")))?;
        let token = usable_token(session.token)
            .ok_or_else(|| ApiError::Validation("session cookie has no token".to_owned()))?;
        Ok(Self::with_token(token))
    }

    pub fn set(&self, token: impl Into<String>) {
        self.store(token.into(), None);
    }

    /// Stores `token` until `ttl` has elapsed.
    pub fn set_with_expiry(&self, token: impl Into<String>, ttl: Duration) {
        self.store(token.into(), Some(Instant::now() + ttl));
    }

    fn store(&self, value: String, expires_at: Option<Instant>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) =
            Some(StoredToken { value, expires_at });
    }
}

impl TokenStore for MemoryTokenStore {
    fn token(&self) -> Option<String> {
        let guard = self.token.read().unwrap_or_else(PoisonError::into_inner);
        let stored = guard.as_ref()?;
        match stored.expires_at {
            Some(expires_at) if Instant::now() >= expires_at => None,
            _ => Some(stored.value.clone()),
        }
    }

    fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    /// Seconds until the access token expires.
    expires_in: Option<u64>,
}

/// [`TokenRefresher`] that exchanges a refresh token at an upstream endpoint.
///
/// Sends `POST <url>` with `{"refreshToken": …}` and expects
/// `{"accessToken": …, "refreshToken"?: …, "expiresIn"?: …}`. The access
/// token is written to `store`, with its expiry when `expiresIn` is given; a
/// rotated refresh token replaces the current one. Each exchange is bounded by
/// [`DEFAULT_REFRESH_TIMEOUT_MS`] unless [`EndpointRefresher::with_timeout`]
/// says otherwise.
pub struct EndpointRefresher {
    http: reqwest::Client,
    url: String,
    refresh_token: Mutex<String>,
    store: Arc<MemoryTokenStore>,
    timeout: Duration,
}

impl fmt::Debug for EndpointRefresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRefresher")
            .field("url", &self.url)
            .field("refresh_token", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl EndpointRefresher {
    pub fn new(
        url: impl Into<String>,
        refresh_token: impl Into<String>,
        store: Arc<MemoryTokenStore>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            refresh_token: Mutex::new(refresh_token.into()),
            store,
            timeout: Duration::from_millis(DEFAULT_REFRESH_TIMEOUT_MS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn current_refresh_token(&self) -> String {
        self.refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TokenRefresher for EndpointRefresher {
    async fn refresh(&self) -> Result<String> {
        let refresh_token = self.current_refresh_token();
        let response = self
            .http
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await
            .map_err(|err| transport_error(err, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| transport_error(err, self.timeout))?;
        if !status.is_success() {
            return Err(wire::http_error(status, body));
        }

        let parsed: RefreshResponse = serde_json::from_str(&body)
            .map_err(|err| ApiError::Decode(format!("invalid refresh response: {err}")))?;
        let access_token = usable_token(parsed.access_token)
            .ok_or_else(|| ApiError::Decode("refresh response has no accessToken".to_owned()))?;

        if let Some(rotated) = usable_token(parsed.refresh_token) {
            *self
                .refresh_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = rotated;
        }
        match parsed.expires_in {
            Some(seconds) if seconds > 0 => self
                .store
                .set_with_expiry(access_token.clone(), Duration::from_secs(seconds)),
            _ => self.store.set(access_token.clone()),
        }
        Ok(access_token)
    }
}

/// Normalizes a raw stored token; `undefined`/`null` literals and blanks are absent.
pub(crate) fn usable_token(raw: Option<String>) -> Option<String> {
    let raw = raw?;
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "undefined" || trimmed == "null" {
        return None;
    }
    Some(trimmed.to_owned())
}

/// Builds a sensitive `Authorization` header value.
///
/// Stores sometimes hold the full header rather than the bare token; a leading
/// `bearer ` in any case is folded into the canonical `Bearer ` scheme.
pub(crate) fn authorization_header(token: &str) -> Result<HeaderValue> {
    let trimmed = token.trim();
    let credentials = match (trimmed.get(..7), trimmed.get(7..)) {
        (Some(scheme), Some(rest)) if scheme.eq_ignore_ascii_case("bearer ") => rest.trim_start(),
        _ => trimmed,
    };
    let mut value = HeaderValue::from_str(&format!("Bearer {credentials}")).map_err(|_| {
        ApiError::Validation("access token contains characters not allowed in a header".to_owned())
    })?;
    value.set_sensitive(true);
    Ok(value)
}
