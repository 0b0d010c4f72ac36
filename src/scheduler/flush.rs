//! Summary flush job: applies one staged batch to the durable site records.
//!
//! A cycle runs `Idle -> LockAcquired -> BatchRead -> Merged -> Persisted ->
//! BatchRemoved -> LockReleased`. The run lock lives in the shared cache with
//! a TTL, so a run that dies mid-cycle blocks others for at most one period.

use super::SchedulerError;
use crate::db::{Cache, DbError, MetricsBuffer, SiteMetrics, SiteRepository};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Cache key of the flush job's run lock.
pub const FLUSH_LOCK_KEY: &str = "sitepulse:summary-flush:lock";

/// Distributed mutual-exclusion flag backed by `Cache::set_if_absent`.
pub struct RunLock {
    cache: Arc<dyn Cache>,
    key: String,
    ttl: Duration,
}

impl RunLock {
    pub fn new(cache: Arc<dyn Cache>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            cache,
            key: key.into(),
            ttl,
        }
    }

    /// Take the lock, or `None` if another run holds it.
    pub fn try_acquire(&self) -> Result<Option<RunLockGuard>, DbError> {
        let token = uuid::Uuid::new_v4().to_string();
        if !self.cache.set_if_absent(&self.key, &token, self.ttl)? {
            return Ok(None);
        }
        Ok(Some(RunLockGuard {
            cache: self.cache.clone(),
            key: self.key.clone(),
            token,
            released: false,
        }))
    }

    /// Token of the current holder, if the lock is held.
    pub fn holder(&self) -> Result<Option<String>, DbError> {
        self.cache.get(&self.key)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Proof of holding the run lock. Dropping it releases the lock.
pub struct RunLockGuard {
    cache: Arc<dyn Cache>,
    key: String,
    token: String,
    released: bool,
}

impl RunLockGuard {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release the lock. Returns `false` if it had already expired.
    pub fn release(mut self) -> Result<bool, DbError> {
        self.released = true;
        self.cache.remove_if_value(&self.key, &self.token)
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.cache.remove_if_value(&self.key, &self.token) {
            tracing::warn!(
                "SummaryFlushJob: failed to release run lock {}, it will expire: {}",
                self.key,
                e
            );
        }
    }
}

/// What one flush cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another run holds the lock; nothing was read or written.
    LockHeld,
    /// The buffer had no batch.
    Empty,
    /// Batches applied in FIFO order, and the total number of site rows written.
    Applied {
        batch_keys: Vec<String>,
        sites_updated: usize,
    },
}

/// Drains the metrics buffer into the site table.
pub struct SummaryFlushJob {
    sites: Arc<dyn SiteRepository>,
    buffer: Arc<dyn MetricsBuffer>,
    lock: RunLock,
}

impl SummaryFlushJob {
    pub fn new(sites: Arc<dyn SiteRepository>, buffer: Arc<dyn MetricsBuffer>, lock: RunLock) -> Self {
        Self {
            sites,
            buffer,
            lock,
        }
    }

    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    /// Run one cycle, applying every pending batch oldest first.
    ///
    /// On error the failing batch and everything after it stay buffered for
    /// the next cycle.
    pub fn run_cycle(&self) -> Result<FlushOutcome, SchedulerError> {
        let Some(guard) = self.lock.try_acquire()? else {
            tracing::info!("SummaryFlushJob: run lock held elsewhere, skipping tick");
            return Ok(FlushOutcome::LockHeld);
        };
        tracing::debug!("SummaryFlushJob: acquired run lock as {}", guard.token());

        let mut batch_keys: Vec<String> = Vec::new();
        let mut sites_updated = 0;
        // On error the guard is dropped here, which releases the lock.
        while let Some((key, updated)) = self.apply_oldest_batch()? {
            if batch_keys.contains(&key) {
                tracing::error!("SummaryFlushJob: batch {} was not removed, stopping drain", key);
                break;
            }
            batch_keys.push(key);
            sites_updated += updated;
        }

        let outcome = if batch_keys.is_empty() {
            tracing::debug!("SummaryFlushJob: no pending batch");
            FlushOutcome::Empty
        } else {
            FlushOutcome::Applied {
                batch_keys,
                sites_updated,
            }
        };

        match guard.release() {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                "SummaryFlushJob: run lock expired before release (ttl {:?})",
                self.lock.ttl()
            ),
            Err(e) => tracing::warn!("SummaryFlushJob: failed to release run lock: {}", e),
        }

        Ok(outcome)
    }

    /// Apply and remove the oldest batch. Returns its key and rows written.
    fn apply_oldest_batch(&self) -> Result<Option<(String, usize)>, SchedulerError> {
        let Some(batch) = self.buffer.peek_oldest_batch()? else {
            return Ok(None);
        };

        // Later entries for the same site win.
        let metrics: HashMap<i64, &SiteMetrics> =
            batch.results.iter().map(|m| (m.site_id, m)).collect();
        let ids: Vec<i64> = metrics.keys().copied().collect();

        let mut sites = self.sites.sites_by_ids(&ids)?;
        for site in sites.iter_mut() {
            if let Some(m) = metrics.get(&site.id) {
                site.apply_metrics(m);
            }
        }

        let found: HashSet<i64> = sites.iter().map(|s| s.id).collect();
        let missing = ids.iter().filter(|id| !found.contains(id)).count();
        if missing > 0 {
            tracing::warn!(
                "SummaryFlushJob: {} sites in batch {} no longer exist",
                missing,
                batch.key
            );
        }

        let sites_updated = self.sites.bulk_update_sites(&sites)?;

        if !self.buffer.remove_batch(&batch.key)? {
            tracing::warn!("SummaryFlushJob: batch {} was already removed", batch.key);
        }

        tracing::info!(
            "SummaryFlushJob: applied batch {} to {} sites",
            batch.key,
            sites_updated
        );

        Ok(Some((batch.key, sites_updated)))
    }
}
