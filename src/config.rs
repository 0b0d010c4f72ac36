//! Configuration module for SitePulse.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which backend stages metrics batches between the runner and the flush job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferBackend {
    /// Batches live in process memory and are lost on restart.
    Memory,
    /// Batches live in the SQLite database next to the sites.
    Sqlite,
}

impl FromStr for BufferBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown buffer backend: {}", other)),
        }
    }
}

/// Settings for the health-check pipeline.
#[derive(Debug, Clone)]
pub struct CheckConfig {
    /// Period of the batch check runner in minutes (default: 5)
    pub tick_interval_minutes: u64,
    /// Extra delay of the flush job relative to the runner (default: 30s)
    pub flush_offset_secs: u64,
    /// Maximum number of probes in flight at once (default: 10)
    pub max_concurrent_checks: usize,
    /// Per-probe timeout in seconds (default: 10)
    pub probe_timeout_secs: u64,
    /// Number of response-time samples kept per site (default: 50)
    pub max_trend_history: usize,
    /// Latency above which a site is reported as Warning (default: 2000ms)
    pub slow_response_ms: f64,
    /// Certificates expiring within this many days are a Warning (default: 14)
    pub ssl_warning_days: i64,
    /// Probe every site on every tick instead of using the interval rule
    pub select_all_sites: bool,
    /// Where pending batches are staged (default: sqlite)
    pub buffer: BufferBackend,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            tick_interval_minutes: 5,
            flush_offset_secs: 30,
            max_concurrent_checks: 10,
            probe_timeout_secs: 10,
            max_trend_history: 50,
            slow_response_ms: 2000.0,
            ssl_warning_days: 14,
            select_all_sites: false,
            buffer: BufferBackend::Sqlite,
        }
    }
}

impl CheckConfig {
    /// Period P1 of the batch check runner.
    pub fn check_period(&self) -> Duration {
        Duration::from_secs(self.tick_interval_minutes.max(1) * 60)
    }

    /// Period P2 of the flush job, offset slightly after the runner.
    pub fn flush_period(&self) -> Duration {
        self.check_period() + self.flush_offset()
    }

    pub fn flush_offset(&self) -> Duration {
        Duration::from_secs(self.flush_offset_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "sitepulse.db")
    pub db_path: String,
    pub checks: CheckConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "sitepulse.db".to_string(),
            checks: CheckConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SITEPULSE_HTTP_PORT`: HTTP port (default: 8080)
    /// - `SITEPULSE_DB_PATH`: Database file path (default: "sitepulse.db")
    /// - `SITEPULSE_TICK_INTERVAL_MINUTES`: runner period (default: 5)
    /// - `SITEPULSE_FLUSH_OFFSET_SECS`: flush delay after the runner (default: 30)
    /// - `SITEPULSE_MAX_CONCURRENT_CHECKS`: probe concurrency cap (default: 10)
    /// - `SITEPULSE_PROBE_TIMEOUT_SECS`: per-probe timeout (default: 10)
    /// - `SITEPULSE_MAX_TREND_HISTORY`: trend samples per site (default: 50)
    /// - `SITEPULSE_SLOW_RESPONSE_MS`: warning latency threshold (default: 2000)
    /// - `SITEPULSE_SSL_WARNING_DAYS`: certificate warning window (default: 14)
    /// - `SITEPULSE_SELECT_ALL_SITES`: ignore check intervals (default: false)
    /// - `SITEPULSE_BUFFER`: `sqlite` or `memory` (default: sqlite)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        parse_into(&lookup, "SITEPULSE_HTTP_PORT", &mut cfg.http_port);
        if let Some(db_path) = lookup("SITEPULSE_DB_PATH") {
            cfg.db_path = db_path;
        }

        let checks = &mut cfg.checks;
        parse_into(&lookup, "SITEPULSE_TICK_INTERVAL_MINUTES", &mut checks.tick_interval_minutes);
        parse_into(&lookup, "SITEPULSE_FLUSH_OFFSET_SECS", &mut checks.flush_offset_secs);
        parse_into(&lookup, "SITEPULSE_MAX_CONCURRENT_CHECKS", &mut checks.max_concurrent_checks);
        parse_into(&lookup, "SITEPULSE_PROBE_TIMEOUT_SECS", &mut checks.probe_timeout_secs);
        parse_into(&lookup, "SITEPULSE_MAX_TREND_HISTORY", &mut checks.max_trend_history);
        parse_into(&lookup, "SITEPULSE_SLOW_RESPONSE_MS", &mut checks.slow_response_ms);
        parse_into(&lookup, "SITEPULSE_SSL_WARNING_DAYS", &mut checks.ssl_warning_days);
        parse_into(&lookup, "SITEPULSE_SELECT_ALL_SITES", &mut checks.select_all_sites);
        parse_into(&lookup, "SITEPULSE_BUFFER", &mut checks.buffer);

        if checks.tick_interval_minutes == 0 {
            checks.tick_interval_minutes = 1;
        }
        if checks.max_concurrent_checks == 0 {
            checks.max_concurrent_checks = 1;
        }
        if checks.probe_timeout_secs == 0 {
            checks.probe_timeout_secs = 1;
        }

        cfg
    }
}

/// Overwrite `slot` with the parsed variable, keeping the default on bad input.
fn parse_into<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else { return };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!("Ignoring invalid value {:?} for {}", raw, key),
    }
}
