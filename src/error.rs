use std::sync::Arc;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// The attempt did not complete before its deadline.
    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    /// The caller's cancellation token fired.
    #[error("request cancelled")]
    Cancelled,
    /// Non-success HTTP status code returned by the upstream API.
    #[error("http error {status}: {message}")]
    Http {
        status: u16,
        /// Application error code from the body's `code` or `error_code` field.
        code: Option<String>,
        /// Human-readable message from `message`/`error`, or the status line.
        message: String,
        /// Raw response body, kept for diagnostics.
        body: String,
    },
    /// The request could not be built (bad URL, unserializable body, bad header).
    #[error("invalid request: {0}")]
    Validation(String),
    /// Response body did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
    /// Token refresh after a 401 failed; the token store has been cleared.
    #[error("token refresh failed: {0}")]
    RefreshFailed(#[source] Arc<ApiError>),
    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse classification of an [`ApiError`], for callers that branch on the
/// kind of failure rather than on the concrete variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    Cancelled,
    Authentication,
    Forbidden,
    NotFound,
    Validation,
    Client,
    Server,
    Decode,
    Config,
}

impl ApiError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|status| status.as_u16()),
            Self::RefreshFailed(source) => source.status(),
            _ => None,
        }
    }

    /// Application-supplied error code, if the upstream sent one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Http { code, .. } => code.as_deref(),
            Self::RefreshFailed(source) => source.code(),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Http { status, .. } => match *status {
                401 => ErrorKind::Authentication,
                403 => ErrorKind::Forbidden,
                404 => ErrorKind::NotFound,
                400 | 422 => ErrorKind::Validation,
                500..=599 => ErrorKind::Server,
                _ => ErrorKind::Client,
            },
            Self::Validation(_) => ErrorKind::Validation,
            Self::Decode(_) => ErrorKind::Decode,
            Self::RefreshFailed(_) => ErrorKind::Authentication,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the generic retry loop may attempt the request again.
    ///
    /// Transport failures and 5xx responses are transient. Timeouts are
    /// transient only when `retry_on_timeout` is set. Everything else,
    /// including every 4xx, is permanent.
    pub fn is_transient(&self, retry_on_timeout: bool) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Timeout { .. } => retry_on_timeout,
            Self::Http { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }

    pub(crate) fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Http { status: 401, .. })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ApiError, ErrorKind};

    fn http(status: u16) -> ApiError {
        ApiError::Http {
            status,
            code: None,
            message: format!("status {status}"),
            body: String::new(),
        }
    }

    #[test]
    fn classifies_http_statuses() {
        assert_eq!(http(401).kind(), ErrorKind::Authentication);
        assert_eq!(http(403).kind(), ErrorKind::Forbidden);
        assert_eq!(http(404).kind(), ErrorKind::NotFound);
        assert_eq!(http(422).kind(), ErrorKind::Validation);
        assert_eq!(http(409).kind(), ErrorKind::Client);
        assert_eq!(http(502).kind(), ErrorKind::Server);
    }

    #[test]
    fn only_server_errors_and_opted_in_timeouts_are_transient() {
        assert!(http(500).is_transient(false));
        assert!(http(503).is_transient(false));
        assert!(!http(400).is_transient(true));
        assert!(!http(401).is_transient(true));
        assert!(!http(429).is_transient(true));

        let timeout = ApiError::Timeout { timeout_ms: 10 };
        assert!(!timeout.is_transient(false));
        assert!(timeout.is_transient(true));

        assert!(!ApiError::Cancelled.is_transient(true));
        assert!(!ApiError::Validation("bad".to_owned()).is_transient(true));
        assert!(!ApiError::Decode("bad".to_owned()).is_transient(true));
    }

    #[test]
    fn refresh_failure_reports_source_status_and_code() {
        let source = ApiError::Http {
            status: 401,
            code: Some("TOKEN_EXPIRED".to_owned()),
            message: "expired".to_owned(),
            body: String::new(),
        };
        let err = ApiError::RefreshFailed(Arc::new(source));

        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.status(), Some(401));
        assert_eq!(err.code(), Some("TOKEN_EXPIRED"));
        assert!(err.to_string().contains("token refresh failed"));
    }
}
