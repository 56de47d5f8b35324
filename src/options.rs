use std::time::Duration;

use crate::{ApiError, Result};

/// Configures HTTP timeout, retry and caching behavior.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: usize,
    /// Base retry delay in milliseconds (exponential strategy).
    pub retry_delay_ms: u64,
    /// Whether a timed-out attempt counts as transient.
    pub retry_on_timeout: bool,
    /// Default time-to-live for cached GET responses, in milliseconds.
    pub cache_ttl_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            retry_on_timeout: false,
            cache_ttl_ms: 300_000,
        }
    }
}

impl ClientOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Delay before retry number `attempt + 1`: `retry_delay_ms * 2^attempt`.
    pub fn retry_delay(&self, attempt: usize) -> Duration {
        let exp = attempt.min(16) as u32;
        let multiplier = 1u64 << exp;
        Duration::from_millis(self.retry_delay_ms.saturating_mul(multiplier))
    }

    /// Reads options from the process environment.
    ///
    /// Starts from the preset for `ATTENDANCE_API_ENV` (development when
    /// unset) and applies these overrides when present:
    /// - `ATTENDANCE_API_TIMEOUT_MS`
    /// - `ATTENDANCE_API_MAX_RETRIES`
    /// - `ATTENDANCE_API_RETRY_DELAY_MS`
    /// - `ATTENDANCE_API_RETRY_ON_TIMEOUT` (`true`/`false`/`1`/`0`)
    /// - `ATTENDANCE_API_CACHE_TTL_MS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Environment::from_lookup(&lookup)?.options();

        if let Some(value) = parse_var(&lookup, "ATTENDANCE_API_TIMEOUT_MS")? {
            options.timeout_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "ATTENDANCE_API_MAX_RETRIES")? {
            options.max_retries = value;
        }
        if let Some(value) = parse_var(&lookup, "ATTENDANCE_API_RETRY_DELAY_MS")? {
            options.retry_delay_ms = value;
        }
        if let Some(value) = lookup("ATTENDANCE_API_RETRY_ON_TIMEOUT") {
            options.retry_on_timeout = parse_flag("ATTENDANCE_API_RETRY_ON_TIMEOUT", &value)?;
        }
        if let Some(value) = parse_var(&lookup, "ATTENDANCE_API_CACHE_TTL_MS")? {
            options.cache_ttl_ms = value;
        }

        Ok(options)
    }
}

/// Deployment environment presets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "staging" => Some(Self::Staging),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }

    /// Reads `ATTENDANCE_API_ENV`, defaulting to development when unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup("ATTENDANCE_API_ENV") {
            None => Ok(Self::default()),
            Some(name) if name.trim().is_empty() => Ok(Self::default()),
            Some(name) => Self::from_name(&name).ok_or_else(|| {
                ApiError::Config(format!("unknown ATTENDANCE_API_ENV value '{name}'"))
            }),
        }
    }

    pub fn options(self) -> ClientOptions {
        let (timeout_ms, max_retries) = match self {
            Self::Development => (10_000, 3),
            Self::Staging => (8_000, 2),
            Self::Production => (5_000, 2),
        };
        ClientOptions {
            timeout_ms,
            max_retries,
            ..ClientOptions::default()
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Development => "http://localhost:3001/api",
            Self::Staging => "https://api-staging.company.com",
            Self::Production => "https://api.company.com",
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|err| ApiError::Config(format!("{key} must be a non-negative integer: {err}")))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ApiError::Config(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use super::{ClientOptions, Environment};
    use crate::ApiError;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn retry_delay_doubles_per_attempt() {
        let options = ClientOptions {
            retry_delay_ms: 100,
            ..ClientOptions::default()
        };
        assert_eq!(options.retry_delay(0), Duration::from_millis(100));
        assert_eq!(options.retry_delay(1), Duration::from_millis(200));
        assert_eq!(options.retry_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn empty_environment_uses_development_preset() {
        let options = ClientOptions::from_lookup(lookup(&[])).expect("defaults must parse");
        assert_eq!(options, Environment::Development.options());
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.cache_ttl_ms, 300_000);
    }

    #[test]
    fn overrides_apply_on_top_of_environment_preset() {
        let options = ClientOptions::from_lookup(lookup(&[
            ("ATTENDANCE_API_ENV", "production"),
            ("ATTENDANCE_API_RETRY_DELAY_MS", "2000"),
            ("ATTENDANCE_API_RETRY_ON_TIMEOUT", "true"),
        ]))
        .expect("options must parse");

        assert_eq!(options.timeout_ms, 5_000);
        assert_eq!(options.max_retries, 2);
        assert_eq!(options.retry_delay_ms, 2_000);
        assert!(options.retry_on_timeout);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = ClientOptions::from_lookup(lookup(&[("ATTENDANCE_API_TIMEOUT_MS", "soon")]))
            .expect_err("non-numeric timeout must fail");
        assert!(matches!(err, ApiError::Config(message) if message.contains("ATTENDANCE_API_TIMEOUT_MS")));

        let err = ClientOptions::from_lookup(lookup(&[("ATTENDANCE_API_ENV", "qa")]))
            .expect_err("unknown environment must fail");
        assert!(matches!(err, ApiError::Config(_)));
    }
}
