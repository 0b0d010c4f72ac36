//! Shared key/value cache with expiring entries.
//!
//! The SQLite implementation is shared by every process that opens the same
//! database file, so a key taken with `set_if_absent` acts as a cross-process
//! lock. `MemoryCache` offers the same semantics inside one process.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::store::{DbError, Store};

/// Key/value cache with optional per-entry time-to-live.
pub trait Cache: Send + Sync {
    /// The live value for `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>, DbError>;

    /// Store `value` unconditionally. `None` never expires.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), DbError>;

    /// Atomically store `value` only if no live entry exists.
    ///
    /// Returns `true` when this call created the entry.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, DbError>;

    fn remove(&self, key: &str) -> Result<(), DbError>;

    /// Atomically remove `key` only if it still holds `value`.
    fn remove_if_value(&self, key: &str, value: &str) -> Result<bool, DbError>;

    fn contains(&self, key: &str) -> Result<bool, DbError> {
        Ok(self.get(key)?.is_some())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    now_millis().saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)
}

impl Cache for Store {
    fn get(&self, key: &str) -> Result<Option<String>, DbError> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM cache_entries
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_millis()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, expires_at=excluded.expires_at",
            params![key, value, ttl.map(expiry_millis)],
        )?;
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let now = now_millis();
        // Single statement: either inserts, replaces an expired entry, or does nothing.
        let changed = conn.execute(
            "INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, expires_at=excluded.expires_at
             WHERE cache_entries.expires_at IS NOT NULL AND cache_entries.expires_at <= ?4",
            params![key, value, expiry_millis(ttl), now],
        )?;
        Ok(changed == 1)
    }

    fn remove(&self, key: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn remove_if_value(&self, key: &str, value: &str) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM cache_entries WHERE key = ?1 AND value = ?2",
            params![key, value],
        )?;
        Ok(changed == 1)
    }
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process cache; correct only while a single process runs the jobs.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>, DbError> {
        self.entries.lock().map_err(|_| DbError::Poisoned)
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, DbError> {
        let now = Instant::now();
        let entries = self.entries()?;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), DbError> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.entries()?.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, DbError> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    fn remove(&self, key: &str) -> Result<(), DbError> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn remove_if_value(&self, key: &str, value: &str) -> Result<bool, DbError> {
        let mut entries = self.entries()?;
        if entries.get(key).is_some_and(|e| e.value == value) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_set_if_absent(cache: &dyn Cache) {
        assert!(cache.set_if_absent("lock", "a", Duration::from_secs(60)).unwrap());
        assert!(!cache.set_if_absent("lock", "b", Duration::from_secs(60)).unwrap());
        assert_eq!(cache.get("lock").unwrap().as_deref(), Some("a"));

        // Only the holder's value releases it.
        assert!(!cache.remove_if_value("lock", "b").unwrap());
        assert!(cache.remove_if_value("lock", "a").unwrap());
        assert!(!cache.contains("lock").unwrap());
        assert!(cache.set_if_absent("lock", "b", Duration::from_secs(60)).unwrap());
    }

    fn exercise_expiry(cache: &dyn Cache) {
        assert!(cache.set_if_absent("ttl", "first", Duration::from_millis(50)).unwrap());
        assert!(!cache.set_if_absent("ttl", "second", Duration::from_millis(50)).unwrap());

        std::thread::sleep(Duration::from_millis(120));

        assert_eq!(cache.get("ttl").unwrap(), None);
        assert!(cache.set_if_absent("ttl", "second", Duration::from_secs(60)).unwrap());
        assert_eq!(cache.get("ttl").unwrap().as_deref(), Some("second"));
    }

    fn exercise_set_without_ttl(cache: &dyn Cache) {
        cache.set("plain", "v1", None).unwrap();
        cache.set("plain", "v2", None).unwrap();
        assert_eq!(cache.get("plain").unwrap().as_deref(), Some("v2"));
        // A non-expiring entry is never replaced by set_if_absent.
        assert!(!cache.set_if_absent("plain", "v3", Duration::from_secs(1)).unwrap());
        cache.remove("plain").unwrap();
        assert_eq!(cache.get("plain").unwrap(), None);
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryCache::new();
        exercise_set_if_absent(&cache);
        exercise_expiry(&cache);
        exercise_set_without_ttl(&cache);
    }

    #[test]
    fn test_sqlite_cache() {
        let store = Store::open_in_memory().unwrap();
        exercise_set_if_absent(&store);
        exercise_expiry(&store);
        exercise_set_without_ttl(&store);
    }

    #[test]
    fn test_sqlite_cache_shared_between_connections() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let first = Store::new(tmp.path()).unwrap();
        let second = Store::new(tmp.path()).unwrap();

        assert!(first.set_if_absent("job", "first", Duration::from_secs(60)).unwrap());
        assert!(!second.set_if_absent("job", "second", Duration::from_secs(60)).unwrap());
        assert_eq!(second.get("job").unwrap().as_deref(), Some("first"));
    }
}
