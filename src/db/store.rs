//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Durable access to sites as needed by the health-check pipeline.
pub trait SiteRepository: Send + Sync {
    /// All registered sites.
    fn all_sites(&self) -> Result<Vec<Site>, DbError>;

    /// The sites with the given IDs; unknown IDs are silently absent.
    fn sites_by_ids(&self, ids: &[i64]) -> Result<Vec<Site>, DbError>;

    /// Write the probe-derived fields of every site in one transaction.
    ///
    /// Returns the number of rows updated.
    fn bulk_update_sites(&self, sites: &[Site]) -> Result<usize, DbError>;
}

const SITE_COLUMNS: &str = "id, name, url, check_interval_minutes, last_checked_at, status, health, \
     last_status_code, response_time_ms, p50_ms, p95_ms, p99_ms, uptime_percent, stability_percent, \
     total_checks, successful_checks, ssl_valid, ssl_days_remaining, trend_history, created_at";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create a store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        // Other processes may hold the write lock while taking the run lock.
        conn.busy_timeout(Duration::from_secs(5))?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Site CRUD ---

    /// Add a new site and return its ID.
    pub fn add_site(&self, site: &mut Site) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sites (name, url, check_interval_minutes, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                site.name,
                site.url,
                site.check_interval_minutes,
                format_db_time(&site.created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        site.id = id;
        Ok(id)
    }

    /// Update the registration fields of an existing site.
    pub fn update_site(&self, site: &Site) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sites SET name=?1, url=?2, check_interval_minutes=?3 WHERE id=?4",
            params![site.name, site.url, site.check_interval_minutes, site.id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get a site by ID.
    pub fn get_site(&self, id: i64) -> Result<Site, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM sites WHERE id = ?1", SITE_COLUMNS),
            params![id],
            site_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a site.
    pub fn delete_site(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sites WHERE id = ?1", params![id])?;
        Ok(())
    }
}

impl SiteRepository for Store {
    fn all_sites(&self) -> Result<Vec<Site>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM sites ORDER BY id", SITE_COLUMNS))?;
        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(sites)
    }

    fn sites_by_ids(&self, ids: &[i64]) -> Result<Vec<Site>, DbError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sites WHERE id IN ({}) ORDER BY id",
            SITE_COLUMNS, placeholders
        ))?;
        let sites = stmt
            .query_map(params_from_iter(ids.iter()), site_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(sites)
    }

    fn bulk_update_sites(&self, sites: &[Site]) -> Result<usize, DbError> {
        if sites.is_empty() {
            return Ok(0);
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let mut updated = 0;

        {
            let mut stmt = tx.prepare(
                "UPDATE sites SET last_checked_at=?1, status=?2, health=?3, last_status_code=?4,
                 response_time_ms=?5, p50_ms=?6, p95_ms=?7, p99_ms=?8, uptime_percent=?9,
                 stability_percent=?10, total_checks=?11, successful_checks=?12, ssl_valid=?13,
                 ssl_days_remaining=?14, trend_history=?15
                 WHERE id=?16",
            )?;

            for s in sites {
                updated += stmt.execute(params![
                    s.last_checked_at.as_ref().map(format_db_time),
                    s.status.map(|v| v.as_str()),
                    s.health.map(|v| v.as_str()),
                    s.last_status_code,
                    s.response_time_ms,
                    s.p50_ms,
                    s.p95_ms,
                    s.p99_ms,
                    s.uptime_percent,
                    s.stability_percent,
                    s.total_checks,
                    s.successful_checks,
                    s.ssl_valid,
                    s.ssl_days_remaining,
                    serde_json::to_string(&s.trend_history)?,
                    s.id,
                ])?;
            }
        }

        tx.commit()?;
        Ok(updated)
    }
}

fn site_from_row(row: &Row<'_>) -> SqlResult<Site> {
    let last_checked: Option<String> = row.get(4)?;
    let status: Option<String> = row.get(5)?;
    let health: Option<String> = row.get(6)?;
    let trend: String = row.get(18)?;
    let created: String = row.get(19)?;
    let id: i64 = row.get(0)?;

    let trend_history = serde_json::from_str(&trend).unwrap_or_else(|e| {
        tracing::warn!("Site {}: discarding unreadable trend history: {}", id, e);
        Vec::new()
    });
    let created_at = parse_db_time(&created).unwrap_or_else(|| {
        tracing::warn!("Site {}: unreadable created_at {:?}", id, created);
        Utc::now()
    });

    Ok(Site {
        id,
        name: row.get(1)?,
        url: row.get(2)?,
        check_interval_minutes: row.get(3)?,
        last_checked_at: last_checked.and_then(|s| parse_db_time(&s)),
        status: status.and_then(|s| s.parse().ok()),
        health: health.and_then(|s| s.parse().ok()),
        last_status_code: row.get(7)?,
        response_time_ms: row.get(8)?,
        p50_ms: row.get(9)?,
        p95_ms: row.get(10)?,
        p99_ms: row.get(11)?,
        uptime_percent: row.get(12)?,
        stability_percent: row.get(13)?,
        total_checks: row.get(14)?,
        successful_checks: row.get(15)?,
        ssl_valid: row.get(16)?,
        ssl_days_remaining: row.get(17)?,
        trend_history,
        created_at,
    })
}

/// Format a datetime for storage.
pub(crate) fn format_db_time(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
