//! Rolling statistics over a site's response-time history.
//!
//! Percentiles are estimated with a t-digest so the cost stays flat as the
//! trend history grows.

use tdigests::TDigest;

/// Percentile response times in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Estimate p50/p95/p99 over the samples, or `None` when there are none.
pub fn latency_percentiles(samples: &[f64]) -> Option<Percentiles> {
    let values: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }

    let mut td = TDigest::from_values(values);
    td.compress(100);

    Some(Percentiles {
        p50: td.estimate_quantile(0.50),
        p95: td.estimate_quantile(0.95),
        p99: td.estimate_quantile(0.99),
    })
}

/// Percentage of successful checks; 100 before the first check.
pub fn uptime_percent(successful: i64, total: i64) -> f64 {
    if total <= 0 {
        return 100.0;
    }
    (successful as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// How steady response times are: 100 minus the coefficient of variation.
///
/// Fewer than two samples count as perfectly stable.
pub fn stability_percent(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 100.0;
    }

    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 100.0;
    }

    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let cv = variance.sqrt() / mean;
    (100.0 * (1.0 - cv)).clamp(0.0, 100.0)
}

/// Append a sample and keep only the newest `max_len` entries.
pub fn push_trend_sample(history: &mut Vec<f64>, sample: f64, max_len: usize) {
    history.push(sample);
    if history.len() > max_len {
        let excess = history.len() - max_len;
        history.drain(..excess);
    }
}
