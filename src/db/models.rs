//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome of the most recent probe against a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Up,
    Down,
    Error,
}

/// Overall health derived from status, latency and certificate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Up => "up",
            SiteStatus::Down => "down",
            SiteStatus::Error => "error",
        }
    }
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(SiteStatus::Up),
            "down" => Ok(SiteStatus::Down),
            "error" => Ok(SiteStatus::Error),
            other => Err(format!("unknown site status: {}", other)),
        }
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(HealthStatus::Healthy),
            "warning" => Ok(HealthStatus::Warning),
            "critical" => Ok(HealthStatus::Critical),
            other => Err(format!("unknown health status: {}", other)),
        }
    }
}

/// A monitored website and its rolling health metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub url: String,
    /// Preferred check interval; 0 means the site is never due.
    pub check_interval_minutes: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub status: Option<SiteStatus>,
    pub health: Option<HealthStatus>,
    pub last_status_code: Option<u16>,
    pub response_time_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub uptime_percent: f64,
    pub stability_percent: f64,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub ssl_valid: Option<bool>,
    pub ssl_days_remaining: Option<i64>,
    /// Recent response times in milliseconds, oldest first.
    pub trend_history: Vec<f64>,
    pub created_at: DateTime<Utc>,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            url: String::new(),
            check_interval_minutes: 5,
            last_checked_at: None,
            status: None,
            health: None,
            last_status_code: None,
            response_time_ms: None,
            p50_ms: None,
            p95_ms: None,
            p99_ms: None,
            uptime_percent: 100.0,
            stability_percent: 100.0,
            total_checks: 0,
            successful_checks: 0,
            ssl_valid: None,
            ssl_days_remaining: None,
            trend_history: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

impl Site {
    /// Overwrite every probe-derived field with the values in `metrics`.
    ///
    /// Registration fields (name, url, interval) are left untouched. Applying
    /// the same metrics twice leaves the site unchanged after the first time.
    pub fn apply_metrics(&mut self, metrics: &SiteMetrics) {
        self.last_checked_at = Some(metrics.checked_at);
        self.status = Some(metrics.status);
        self.health = Some(metrics.health);
        self.last_status_code = metrics.status_code;
        self.response_time_ms = metrics.response_time_ms;
        self.p50_ms = metrics.p50_ms;
        self.p95_ms = metrics.p95_ms;
        self.p99_ms = metrics.p99_ms;
        self.uptime_percent = metrics.uptime_percent;
        self.stability_percent = metrics.stability_percent;
        self.total_checks = metrics.total_checks;
        self.successful_checks = metrics.successful_checks;
        self.ssl_valid = metrics.ssl_valid;
        self.ssl_days_remaining = metrics.ssl_days_remaining;
        self.trend_history = metrics.trend_history.clone();
    }
}

/// The next state of one site's rolling metrics, computed at probe time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteMetrics {
    pub site_id: i64,
    pub checked_at: DateTime<Utc>,
    pub status: SiteStatus,
    pub health: HealthStatus,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub uptime_percent: f64,
    pub stability_percent: f64,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub ssl_valid: Option<bool>,
    pub ssl_days_remaining: Option<i64>,
    pub trend_history: Vec<f64>,
}

/// One tick's worth of site metrics, staged until the flush job applies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsBatch {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub results: Vec<SiteMetrics>,
}

impl MetricsBatch {
    /// Create a batch with a fresh, unique key.
    pub fn new(created_at: DateTime<Utc>, results: Vec<SiteMetrics>) -> Self {
        let key = format!(
            "batch-{}-{}",
            created_at.format("%Y%m%dT%H%M%S"),
            uuid::Uuid::new_v4().simple()
        );
        Self {
            key,
            created_at,
            results,
        }
    }
}
