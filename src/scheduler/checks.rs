//! Batch check runner: probes the sites due this tick and stages one batch.

use super::SchedulerError;
use crate::config::CheckConfig;
use crate::db::{
    latency_percentiles, push_trend_sample, stability_percent, uptime_percent, HealthStatus,
    MetricsBatch, MetricsBuffer, Site, SiteMetrics, SiteRepository, SiteStatus,
};
use crate::probe::{ProbeError, ProbeOutcome, Prober};

use chrono::{DateTime, Timelike, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Whether a site with the given interval is due at `minute` of the hour.
///
/// A zero interval is never due.
pub fn is_due(interval_minutes: u32, minute: u32) -> bool {
    interval_minutes > 0 && minute % interval_minutes == 0
}

/// Pick the sites to probe at `minute`.
pub fn select_due_sites(sites: Vec<Site>, minute: u32, select_all: bool) -> Vec<Site> {
    sites
        .into_iter()
        .filter(|s| {
            if select_all {
                s.check_interval_minutes > 0
            } else {
                is_due(s.check_interval_minutes, minute)
            }
        })
        .collect()
}

/// Derive overall health from one probe outcome.
pub fn classify_health(
    status: SiteStatus,
    latency_ms: Option<f64>,
    ssl_valid: Option<bool>,
    ssl_days_remaining: Option<i64>,
    config: &CheckConfig,
) -> HealthStatus {
    if status != SiteStatus::Up {
        return HealthStatus::Critical;
    }

    let ssl_warning = ssl_valid == Some(false)
        || ssl_days_remaining.is_some_and(|days| days <= config.ssl_warning_days);
    let slow = latency_ms.is_some_and(|ms| ms > config.slow_response_ms);

    if ssl_warning || slow {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

/// Compute a site's next rolling metrics from its current state and a probe.
///
/// The result is a complete snapshot, so applying it is a plain overwrite.
pub fn compute_metrics(site: &Site, outcome: &ProbeOutcome, config: &CheckConfig) -> SiteMetrics {
    let total_checks = site.total_checks + 1;
    let successful_checks = site.successful_checks + i64::from(outcome.status == SiteStatus::Up);

    let mut trend_history = site.trend_history.clone();
    if let Some(latency) = outcome.latency_ms {
        push_trend_sample(&mut trend_history, latency, config.max_trend_history);
    } else if trend_history.len() > config.max_trend_history {
        let excess = trend_history.len() - config.max_trend_history;
        trend_history.drain(..excess);
    }

    // An unreachable site tells us nothing new about its certificate.
    let (ssl_valid, ssl_days_remaining) = match outcome.certificate {
        Some(cert) => (Some(cert.valid), cert.days_remaining),
        None if outcome.status != SiteStatus::Up => (site.ssl_valid, site.ssl_days_remaining),
        None => (None, None),
    };

    let percentiles = latency_percentiles(&trend_history);

    SiteMetrics {
        site_id: site.id,
        checked_at: outcome.checked_at,
        status: outcome.status,
        health: classify_health(
            outcome.status,
            outcome.latency_ms,
            ssl_valid,
            ssl_days_remaining,
            config,
        ),
        status_code: outcome.status_code,
        response_time_ms: outcome.latency_ms,
        p50_ms: percentiles.map(|p| p.p50),
        p95_ms: percentiles.map(|p| p.p95),
        p99_ms: percentiles.map(|p| p.p99),
        uptime_percent: uptime_percent(successful_checks, total_checks),
        stability_percent: stability_percent(&trend_history),
        total_checks,
        successful_checks,
        ssl_valid,
        ssl_days_remaining,
        trend_history,
    }
}

/// The newest staged metrics per site, taken from batches in FIFO order.
pub fn latest_pending_metrics(batches: Vec<MetricsBatch>) -> HashMap<i64, SiteMetrics> {
    let mut latest = HashMap::new();
    for batch in batches {
        for m in batch.results {
            latest.insert(m.site_id, m);
        }
    }
    latest
}

/// Probes due sites with bounded concurrency and stages the results.
pub struct BatchCheckRunner {
    sites: Arc<dyn SiteRepository>,
    buffer: Arc<dyn MetricsBuffer>,
    prober: Arc<dyn Prober>,
    config: CheckConfig,
    probe_timeout: Duration,
}

impl BatchCheckRunner {
    pub fn new(
        sites: Arc<dyn SiteRepository>,
        buffer: Arc<dyn MetricsBuffer>,
        prober: Arc<dyn Prober>,
        config: CheckConfig,
    ) -> Self {
        let probe_timeout = config.probe_timeout();
        Self {
            sites,
            buffer,
            prober,
            config,
            probe_timeout,
        }
    }

    /// Override the per-probe timeout from the configuration.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Run one tick at `now`.
    ///
    /// Returns the staged batch, or `None` when no site was due.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<Option<MetricsBatch>, SchedulerError> {
        // Read staged batches before the sites: a flush finishing in between
        // then only makes the site rows newer, never older.
        let staged = self.buffer.list_batches()?;
        let sites = self.sites.all_sites()?;
        let total = sites.len();
        let minute = now.minute();
        let mut due = select_due_sites(sites, minute, self.config.select_all_sites);

        if due.is_empty() {
            tracing::debug!("BatchCheckRunner: no sites due at minute {}", minute);
            return Ok(None);
        }

        let pending = latest_pending_metrics(staged);
        if !pending.is_empty() {
            tracing::debug!(
                "BatchCheckRunner: {} sites have unflushed metrics, building on those",
                pending.len()
            );
        }
        for site in due.iter_mut() {
            if let Some(m) = pending.get(&site.id) {
                site.apply_metrics(m);
            }
        }

        tracing::info!(
            "BatchCheckRunner: probing {} of {} sites at minute {}",
            due.len(),
            total,
            minute
        );

        let results = self.probe_all(due).await;
        let batch = MetricsBatch::new(now, results);
        self.buffer.put_batch(&batch)?;

        let up = batch
            .results
            .iter()
            .filter(|r| r.status == SiteStatus::Up)
            .count();
        tracing::info!(
            "BatchCheckRunner: staged batch {} ({} results, {} up)",
            batch.key,
            batch.results.len(),
            up
        );

        Ok(Some(batch))
    }

    /// Probe every site; each site yields exactly one result.
    async fn probe_all(&self, due: Vec<Site>) -> Vec<SiteMetrics> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_checks.max(1)));
        let timeout = self.probe_timeout;

        let handles: Vec<_> = due
            .into_iter()
            .map(|site| {
                let semaphore = semaphore.clone();
                let prober = self.prober.clone();
                let url = site.url.clone();

                let handle = tokio::spawn(async move {
                    // Hold permit until done
                    let _permit = semaphore.acquire_owned().await.ok();
                    match tokio::time::timeout(timeout, prober.probe(&url, timeout)).await {
                        Ok(outcome) => outcome,
                        Err(_) => ProbeOutcome::failed(Utc::now(), &ProbeError::Timeout(timeout)),
                    }
                });
                (site, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (site, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("BatchCheckRunner: probe task for {} failed: {}", site.url, e);
                    ProbeOutcome::failed(
                        Utc::now(),
                        &ProbeError::Request(format!("probe task failed: {}", e)),
                    )
                }
            };

            if outcome.status != SiteStatus::Up {
                tracing::warn!(
                    "BatchCheckRunner: {} is {} ({})",
                    site.url,
                    outcome.status,
                    outcome.error.as_deref().unwrap_or("unexpected status code")
                );
            }

            results.push(compute_metrics(&site, &outcome, &self.config));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryBuffer;
    use crate::probe::CertificateInfo;
    use crate::scheduler::testing::{CountingBuffer, CountingRepository, Script, ScriptedProber};
    use chrono::TimeZone;

    fn at_minute(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()
    }

    fn runner(
        repo: Arc<CountingRepository>,
        buffer: Arc<dyn MetricsBuffer>,
        prober: Arc<ScriptedProber>,
        config: CheckConfig,
    ) -> BatchCheckRunner {
        BatchCheckRunner::new(repo, buffer, prober, config)
    }

    #[test]
    fn test_zero_interval_never_due() {
        for minute in 0..60 {
            assert!(!is_due(0, minute));
        }
    }

    #[test]
    fn test_due_iff_minute_divisible() {
        for k in 1..=60 {
            for minute in 0..60 {
                assert_eq!(is_due(k, minute), minute % k == 0, "k={} minute={}", k, minute);
            }
        }
    }

    #[test]
    fn test_select_all_skips_disabled_sites() {
        let sites = vec![
            Site {
                id: 1,
                check_interval_minutes: 7,
                ..Default::default()
            },
            Site {
                id: 2,
                check_interval_minutes: 0,
                ..Default::default()
            },
        ];
        let due = select_due_sites(sites, 20, true);
        assert_eq!(due.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_classify_health() {
        let cfg = CheckConfig::default();
        assert_eq!(
            classify_health(SiteStatus::Down, None, None, None, &cfg),
            HealthStatus::Critical
        );
        assert_eq!(
            classify_health(SiteStatus::Up, Some(100.0), Some(true), Some(90), &cfg),
            HealthStatus::Healthy
        );
        assert_eq!(
            classify_health(SiteStatus::Up, Some(100.0), Some(true), Some(3), &cfg),
            HealthStatus::Warning
        );
        assert_eq!(
            classify_health(SiteStatus::Up, Some(5000.0), None, None, &cfg),
            HealthStatus::Warning
        );
    }

    #[test]
    fn test_compute_metrics_rolls_counters_and_trend() {
        let cfg = CheckConfig {
            max_trend_history: 3,
            ..Default::default()
        };
        let site = Site {
            id: 4,
            total_checks: 9,
            successful_checks: 9,
            trend_history: vec![100.0, 110.0, 120.0],
            ..Default::default()
        };

        let up = ProbeOutcome::responded(Utc::now(), 200, 130.0, None);
        let m = compute_metrics(&site, &up, &cfg);
        assert_eq!(m.total_checks, 10);
        assert_eq!(m.successful_checks, 10);
        assert_eq!(m.uptime_percent, 100.0);
        assert_eq!(m.trend_history, vec![110.0, 120.0, 130.0]);
        assert!(m.p50_ms.is_some());
        assert_eq!(m.health, HealthStatus::Healthy);

        let down = ProbeOutcome::failed(Utc::now(), &ProbeError::Timeout(Duration::from_secs(1)));
        let m = compute_metrics(&site, &down, &cfg);
        assert_eq!(m.total_checks, 10);
        assert_eq!(m.successful_checks, 9);
        assert_eq!(m.uptime_percent, 90.0);
        assert_eq!(m.trend_history, vec![100.0, 110.0, 120.0]);
        assert_eq!(m.response_time_ms, None);
        assert_eq!(m.health, HealthStatus::Critical);
    }

    #[test]
    fn test_compute_metrics_certificate_handling() {
        let cfg = CheckConfig::default();
        let site = Site {
            ssl_valid: Some(true),
            ssl_days_remaining: Some(40),
            ..Default::default()
        };

        // Unreachable: keep the last known certificate state.
        let down = ProbeOutcome::failed(Utc::now(), &ProbeError::Network("refused".into()));
        let m = compute_metrics(&site, &down, &cfg);
        assert_eq!((m.ssl_valid, m.ssl_days_remaining), (Some(true), Some(40)));

        // Fresh certificate replaces it.
        let cert = CertificateInfo {
            valid: true,
            days_remaining: Some(5),
        };
        let up = ProbeOutcome::responded(Utc::now(), 200, 80.0, Some(cert));
        let m = compute_metrics(&site, &up, &cfg);
        assert_eq!(m.ssl_days_remaining, Some(5));
        assert_eq!(m.health, HealthStatus::Warning);
    }

    #[tokio::test]
    async fn test_interval_scenario_at_minute_20() {
        let repo = Arc::new(CountingRepository::new());
        let a = repo.add("a", 5);
        let _b = repo.add("b", 7);
        let _c = repo.add("c", 0);
        let buffer = Arc::new(MemoryBuffer::new());
        let prober = Arc::new(ScriptedProber::new());

        let r = runner(repo, buffer.clone(), prober.clone(), CheckConfig::default());
        let batch = r.run_tick(at_minute(20)).await.unwrap().unwrap();

        let ids: Vec<i64> = batch.results.iter().map(|m| m.site_id).collect();
        assert_eq!(ids, vec![a.id]);
        assert_eq!(prober.calls(), 1);
        assert_eq!(buffer.pending_batches().unwrap(), 1);
        assert_eq!(buffer.peek_oldest_batch().unwrap().unwrap().key, batch.key);
    }

    #[tokio::test]
    async fn test_no_due_sites_writes_nothing() {
        let repo = Arc::new(CountingRepository::new());
        repo.add("b", 7);
        repo.add("never", 0);
        let buffer = Arc::new(CountingBuffer::new());
        let prober = Arc::new(ScriptedProber::new());

        let r = runner(repo, buffer.clone(), prober.clone(), CheckConfig::default());
        assert!(r.run_tick(at_minute(20)).await.unwrap().is_none());

        assert_eq!(buffer.puts(), 0);
        assert_eq!(prober.calls(), 0);
    }

    #[tokio::test]
    async fn test_failures_stay_in_batch() {
        let repo = Arc::new(CountingRepository::new());
        let ok = repo.add("ok", 1);
        let slow = repo.add("slow", 1);
        let refused = repo.add("refused", 1);
        let boom = repo.add("boom", 1);
        let broken = repo.add("broken", 1);

        let prober = Arc::new(
            ScriptedProber::new()
                .script(&slow.url, Script::Hang)
                .script(&refused.url, Script::Refuse)
                .script(&boom.url, Script::Panic)
                .script(&broken.url, Script::Respond { code: 500, latency_ms: 20.0 }),
        );
        let buffer = Arc::new(MemoryBuffer::new());

        let r = runner(repo, buffer.clone(), prober, CheckConfig::default())
            .with_probe_timeout(Duration::from_millis(100));
        let batch = r.run_tick(at_minute(0)).await.unwrap().unwrap();

        assert_eq!(batch.results.len(), 5);
        let status_of = |id: i64| batch.results.iter().find(|m| m.site_id == id).unwrap().status;
        assert_eq!(status_of(ok.id), SiteStatus::Up);
        assert_eq!(status_of(slow.id), SiteStatus::Down);
        assert_eq!(status_of(refused.id), SiteStatus::Down);
        assert_eq!(status_of(boom.id), SiteStatus::Error);
        assert_eq!(status_of(broken.id), SiteStatus::Error);
        assert_eq!(buffer.pending_batches().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_probe_concurrency_is_capped() {
        let repo = Arc::new(CountingRepository::new());
        for i in 0..8 {
            repo.add(&format!("site{}", i), 1);
        }
        let prober = Arc::new(ScriptedProber::new().with_delay(Duration::from_millis(30)));
        let cfg = CheckConfig {
            max_concurrent_checks: 2,
            ..Default::default()
        };

        let r = runner(repo, Arc::new(MemoryBuffer::new()), prober.clone(), cfg);
        let batch = r.run_tick(at_minute(13)).await.unwrap().unwrap();

        assert_eq!(batch.results.len(), 8);
        assert_eq!(prober.calls(), 8);
        assert!(prober.max_in_flight() <= 2, "max in flight {}", prober.max_in_flight());
    }
}
