//! HTTP probe implementation.

use super::{inspect_certificate, CertificateInfo, ProbeError, ProbeOutcome, Prober};

use async_trait::async_trait;
use chrono::Utc;
use std::error::Error as StdError;
use std::time::{Duration, Instant};

/// What a site answered with.
struct HttpResponse {
    status_code: u16,
    latency_ms: f64,
    certificate: Option<CertificateInfo>,
}

/// Probes sites with a shared `reqwest` client.
pub struct HttpProber {
    client: reqwest::Client,
    max_jitter: Duration,
}

impl HttpProber {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .tls_info(true)
            .user_agent(concat!("sitepulse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;

        Ok(Self {
            client,
            max_jitter: Duration::from_millis(100),
        })
    }

    /// Upper bound of the random delay before each probe.
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<HttpResponse, ProbeError> {
        let start = Instant::now();

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_error(e, timeout))?;

        let status_code = response.status().as_u16();
        let certificate = response
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .and_then(|der| inspect_certificate(der, Utc::now()));

        // Read the full body to measure complete transfer time
        let _body = response
            .bytes()
            .await
            .map_err(|e| classify_error(e, timeout))?;

        Ok(HttpResponse {
            status_code,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            certificate,
        })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        // Add jitter to avoid thundering herd
        let max_jitter = self.max_jitter.as_millis() as u64;
        if max_jitter > 0 {
            let jitter = rand::random::<u64>() % max_jitter;
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let checked_at = Utc::now();
        let url = normalize_url(url);

        // Hard upper bound in case the body trickles in.
        let result = match tokio::time::timeout(timeout, self.fetch(&url, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(timeout)),
        };

        match result {
            Ok(resp) => ProbeOutcome::responded(
                checked_at,
                resp.status_code,
                resp.latency_ms,
                resp.certificate,
            ),
            Err(e) => {
                tracing::debug!("Probe failed for {}: {}", url, e);
                ProbeOutcome::failed(checked_at, &e)
            }
        }
    }
}

/// Prefix bare hosts with `http://`.
pub fn normalize_url(address: &str) -> String {
    let address = address.trim();
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

fn classify_error(err: reqwest::Error, timeout: Duration) -> ProbeError {
    if err.is_timeout() {
        ProbeError::Timeout(timeout)
    } else if err.is_builder() {
        ProbeError::Config(err.to_string())
    } else if err.is_connect() {
        let detail = error_chain(&err);
        if detail.to_ascii_lowercase().contains("certificate") {
            ProbeError::Tls(detail)
        } else {
            ProbeError::Network(detail)
        }
    } else {
        ProbeError::Request(error_chain(&err))
    }
}

/// Join an error with all of its sources; reqwest hides the useful part.
fn error_chain(err: &dyn StdError) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(e) = source {
        parts.push(e.to_string());
        source = e.source();
    }
    parts.join(": ")
}
