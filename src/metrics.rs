//! Per-attempt request metrics and the health status derived from them.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant, SystemTime},
};

use reqwest::Method;

/// Number of attempts kept when no explicit limit is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 1_000;

/// Error rate (percent) below which the upstream counts as healthy.
const HEALTHY_BELOW: f64 = 5.0;
/// Error rate (percent) below which the upstream counts as degraded.
const DEGRADED_BELOW: f64 = 20.0;

/// One dispatched attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestRecord {
    /// URL path of the attempt, without query.
    pub endpoint: String,
    pub method: Method,
    pub duration: Duration,
    /// `None` when no response arrived (transport failure, timeout).
    pub status: Option<u16>,
    pub success: bool,
    pub recorded_at: SystemTime,
    pub error: Option<String>,
}

/// Aggregates over the retained history.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerformanceSummary {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub average_response_time: Duration,
    /// Percentage in `0.0..=100.0`.
    pub error_rate: f64,
    /// Percentage in `0.0..=100.0`.
    pub success_rate: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Healthy below 5 % errors, degraded below 20 %, otherwise unhealthy.
    pub fn from_error_rate(error_rate: f64) -> Self {
        if error_rate < HEALTHY_BELOW {
            Self::Healthy
        } else if error_rate < DEGRADED_BELOW {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApiHealth {
    pub status: HealthStatus,
    /// Time since the recorder was created or last cleared.
    pub uptime: Duration,
    pub last_error: Option<String>,
    /// Failures since the last clear, including ones evicted from history.
    pub error_count: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EndpointSummary {
    pub total_requests: usize,
    pub average_response_time: Duration,
    pub error_rate: f64,
    pub last_request: Option<RequestRecord>,
}

struct MetricsState {
    history: VecDeque<RequestRecord>,
    error_count: u64,
    last_error: Option<String>,
    started: Instant,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            error_count: 0,
            last_error: None,
            started: Instant::now(),
        }
    }
}

/// Bounded in-memory history of request attempts.
///
/// Every [`ApiClient`](crate::ApiClient) owns one (clones share it); pass a
/// shared recorder with [`ApiClient::with_metrics`](crate::ApiClient::with_metrics)
/// to aggregate several clients. Once `limit` records are held the oldest is
/// dropped for each new one.
pub struct RequestMetrics {
    state: Mutex<MetricsState>,
    limit: usize,
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::with_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl fmt::Debug for RequestMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMetrics")
            .field("limit", &self.limit)
            .field("recorded", &self.lock().history.len())
            .finish()
    }
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(MetricsState::new()),
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn record(&self, record: RequestRecord) {
        let mut state = self.lock();
        if !record.success {
            state.error_count += 1;
            state.last_error = Some(
                record
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_owned()),
            );
        }
        state.history.push_back(record);
        while state.history.len() > self.limit {
            state.history.pop_front();
        }
    }

    /// Retained records, oldest first.
    pub fn history(&self) -> Vec<RequestRecord> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn performance(&self) -> PerformanceSummary {
        let state = self.lock();
        let (total, failed, average) = aggregate(state.history.iter());
        PerformanceSummary {
            total_requests: total,
            failed_requests: failed,
            average_response_time: average,
            error_rate: percent(failed, total),
            success_rate: percent(total - failed, total),
        }
    }

    pub fn health(&self) -> ApiHealth {
        let state = self.lock();
        let (total, failed, _) = aggregate(state.history.iter());
        ApiHealth {
            status: HealthStatus::from_error_rate(percent(failed, total)),
            uptime: state.started.elapsed(),
            last_error: state.last_error.clone(),
            error_count: state.error_count,
        }
    }

    pub fn endpoint(&self, endpoint: &str) -> EndpointSummary {
        let state = self.lock();
        let matching: Vec<&RequestRecord> = state
            .history
            .iter()
            .filter(|record| record.endpoint == endpoint)
            .collect();
        let (total, failed, average) = aggregate(matching.iter().copied());
        EndpointSummary {
            total_requests: total,
            average_response_time: average,
            error_rate: percent(failed, total),
            last_request: matching.last().map(|record| (*record).clone()),
        }
    }

    /// Up to `limit` failed records, newest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<RequestRecord> {
        self.lock()
            .history
            .iter()
            .rev()
            .filter(|record| !record.success)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Up to `limit` records, longest duration first.
    pub fn slowest(&self, limit: usize) -> Vec<RequestRecord> {
        let mut records = self.history();
        records.sort_by(|a, b| b.duration.cmp(&a.duration));
        records.truncate(limit);
        records
    }

    pub fn with_status(&self, status: u16) -> Vec<RequestRecord> {
        self.lock()
            .history
            .iter()
            .filter(|record| record.status == Some(status))
            .cloned()
            .collect()
    }

    /// Drops the history and error counters and restarts uptime.
    pub fn clear(&self) {
        *self.lock() = MetricsState::new();
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn aggregate<'a>(records: impl Iterator<Item = &'a RequestRecord>) -> (usize, usize, Duration) {
    let (mut total, mut failed, mut elapsed) = (0usize, 0usize, Duration::ZERO);
    for record in records {
        total += 1;
        if !record.success {
            failed += 1;
        }
        elapsed += record.duration;
    }
    let average = if total == 0 {
        Duration::ZERO
    } else {
        elapsed / total as u32
    };
    (total, failed, average)
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}
