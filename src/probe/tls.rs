//! TLS certificate inspection for HTTPS probes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const SECS_PER_DAY: i64 = 86_400;

/// Validity of the certificate a site presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub valid: bool,
    /// Whole days until expiry; negative once expired. Unknown when the
    /// handshake was rejected.
    pub days_remaining: Option<i64>,
}

impl CertificateInfo {
    /// A certificate the TLS handshake refused.
    pub fn rejected() -> Self {
        Self {
            valid: false,
            days_remaining: None,
        }
    }
}

/// Parse a DER certificate and evaluate it at `now`.
pub fn inspect_certificate(der: &[u8], now: DateTime<Utc>) -> Option<CertificateInfo> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let validity = cert.validity();
    Some(validity_window(
        validity.not_before.timestamp(),
        validity.not_after.timestamp(),
        now,
    ))
}

/// Evaluate a `[not_before, not_after]` window (Unix seconds) at `now`.
pub fn validity_window(not_before: i64, not_after: i64, now: DateTime<Utc>) -> CertificateInfo {
    let ts = now.timestamp();
    CertificateInfo {
        valid: ts >= not_before && ts <= not_after,
        days_remaining: Some((not_after - ts).div_euclid(SECS_PER_DAY)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_validity_window() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let ts = now.timestamp();

        let fresh = validity_window(ts - SECS_PER_DAY, ts + 30 * SECS_PER_DAY + 3600, now);
        assert!(fresh.valid);
        assert_eq!(fresh.days_remaining, Some(30));

        let expired = validity_window(ts - 90 * SECS_PER_DAY, ts - 1, now);
        assert!(!expired.valid);
        assert_eq!(expired.days_remaining, Some(-1));

        let not_yet = validity_window(ts + 10, ts + 90 * SECS_PER_DAY, now);
        assert!(!not_yet.valid);
    }

    // Self-signed, valid 2024-01-01T00:00:00Z to 2024-12-31T00:00:00Z.
    const FIXTURE_DER: &[u8] = include_bytes!("testdata/sitepulse-2024.der");

    #[test]
    fn test_inspect_real_certificate() {
        let mid_year = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let info = inspect_certificate(FIXTURE_DER, mid_year).unwrap();
        assert!(info.valid);
        assert_eq!(info.days_remaining, Some(212));

        let expired = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        let info = inspect_certificate(FIXTURE_DER, expired).unwrap();
        assert!(!info.valid);
        assert_eq!(info.days_remaining, Some(-15));

        let early = Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap();
        let info = inspect_certificate(FIXTURE_DER, early).unwrap();
        assert!(!info.valid);
        assert_eq!(info.days_remaining, Some(366));
    }

    #[test]
    fn test_garbage_der_is_ignored() {
        assert!(inspect_certificate(b"not a certificate", Utc::now()).is_none());
    }
}
