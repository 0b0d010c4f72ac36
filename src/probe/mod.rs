//! Probe module for site health checks.
//!
//! A probe performs one HTTP request against a site and reports what
//! happened. Expected network failures are part of the outcome, never errors.

mod http;
mod tls;

pub use http::*;
pub use tls::*;

use crate::db::SiteStatus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ProbeError {
    /// How the failure is reported: unreachable sites are Down, everything
    /// else that went wrong is an Error.
    pub fn status(&self) -> SiteStatus {
        match self {
            ProbeError::Timeout(_) | ProbeError::Network(_) => SiteStatus::Down,
            ProbeError::Tls(_) | ProbeError::Request(_) | ProbeError::Config(_) => SiteStatus::Error,
        }
    }
}

/// Result of probing one site once.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub checked_at: DateTime<Utc>,
    pub status: SiteStatus,
    pub status_code: Option<u16>,
    /// Full response time in milliseconds; absent when no response arrived.
    pub latency_ms: Option<f64>,
    pub certificate: Option<CertificateInfo>,
    pub error: Option<String>,
}

impl ProbeOutcome {
    /// Outcome for a site that answered. 4xx/5xx answers are Errors.
    pub fn responded(
        checked_at: DateTime<Utc>,
        status_code: u16,
        latency_ms: f64,
        certificate: Option<CertificateInfo>,
    ) -> Self {
        let status = if status_code < 400 {
            SiteStatus::Up
        } else {
            SiteStatus::Error
        };
        Self {
            checked_at,
            status,
            status_code: Some(status_code),
            latency_ms: Some(latency_ms),
            certificate,
            error: None,
        }
    }

    /// Outcome for a probe that got no usable response.
    pub fn failed(checked_at: DateTime<Utc>, err: &ProbeError) -> Self {
        let certificate = match err {
            ProbeError::Tls(_) => Some(CertificateInfo::rejected()),
            _ => None,
        };
        Self {
            checked_at,
            status: err.status(),
            status_code: None,
            latency_ms: None,
            certificate,
            error: Some(err.to_string()),
        }
    }
}

/// Something that can check a single site.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `url`, finishing within roughly `timeout`.
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome;
}
