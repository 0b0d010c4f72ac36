//! Fakes shared by the scheduler tests.

use crate::db::{DbError, MemoryBuffer, MetricsBatch, MetricsBuffer, Site, SiteRepository, Store};
use crate::probe::{ProbeError, ProbeOutcome, Prober};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// What the scripted prober does for a URL.
#[derive(Debug, Clone)]
pub enum Script {
    Respond { code: u16, latency_ms: f64 },
    Refuse,
    Hang,
    Panic,
}

/// Prober answering from a per-URL script; unknown URLs answer 200 in 50ms.
#[derive(Default)]
pub struct ScriptedProber {
    scripts: HashMap<String, Script>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, url: &str, script: Script) -> Self {
        self.scripts.insert(url.to_string(), script);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, url: &str, _timeout: Duration) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let script = self.scripts.get(url).cloned().unwrap_or(Script::Respond {
            code: 200,
            latency_ms: 50.0,
        });
        match script {
            Script::Respond { code, latency_ms } => {
                ProbeOutcome::responded(Utc::now(), code, latency_ms, None)
            }
            Script::Refuse => ProbeOutcome::failed(
                Utc::now(),
                &ProbeError::Network("connection refused".to_string()),
            ),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                ProbeOutcome::responded(Utc::now(), 200, 1.0, None)
            }
            Script::Panic => panic!("probe exploded for {}", url),
        }
    }
}

/// Buffer that counts every call before delegating to a `MemoryBuffer`.
#[derive(Default)]
pub struct CountingBuffer {
    inner: MemoryBuffer,
    puts: AtomicUsize,
    reads: AtomicUsize,
    removes: AtomicUsize,
}

impl CountingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }
}

impl MetricsBuffer for CountingBuffer {
    fn put_batch(&self, batch: &MetricsBatch) -> Result<(), DbError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put_batch(batch)
    }

    fn peek_oldest_batch(&self) -> Result<Option<MetricsBatch>, DbError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.peek_oldest_batch()
    }

    fn list_batches(&self) -> Result<Vec<MetricsBatch>, DbError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.list_batches()
    }

    fn remove_batch(&self, key: &str) -> Result<bool, DbError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove_batch(key)
    }

    fn pending_batches(&self) -> Result<usize, DbError> {
        self.inner.pending_batches()
    }
}

/// Repository over an in-memory store that counts writes and can be told to fail them.
pub struct CountingRepository {
    pub store: Store,
    bulk_updates: AtomicUsize,
    pub fail_updates: AtomicBool,
}

impl CountingRepository {
    pub fn new() -> Self {
        Self {
            store: Store::open_in_memory().expect("in-memory store"),
            bulk_updates: AtomicUsize::new(0),
            fail_updates: AtomicBool::new(false),
        }
    }

    pub fn bulk_updates(&self) -> usize {
        self.bulk_updates.load(Ordering::SeqCst)
    }

    pub fn add(&self, name: &str, interval: u32) -> Site {
        let mut site = Site {
            name: name.to_string(),
            url: format!("https://{}.test", name),
            check_interval_minutes: interval,
            ..Default::default()
        };
        self.store.add_site(&mut site).expect("add site");
        site
    }
}

impl SiteRepository for CountingRepository {
    fn all_sites(&self) -> Result<Vec<Site>, DbError> {
        self.store.all_sites()
    }

    fn sites_by_ids(&self, ids: &[i64]) -> Result<Vec<Site>, DbError> {
        self.store.sites_by_ids(ids)
    }

    fn bulk_update_sites(&self, sites: &[Site]) -> Result<usize, DbError> {
        self.bulk_updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(DbError::Sqlite(rusqlite::Error::InvalidQuery));
        }
        self.store.bulk_update_sites(sites)
    }
}
