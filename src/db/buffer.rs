//! Staging area for metrics batches awaiting the flush job.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::VecDeque;
use std::sync::Mutex;

use super::models::MetricsBatch;
use super::store::{format_db_time, parse_db_time, DbError, Store};

/// FIFO buffer of metrics batches shared by the runner and the flush job.
///
/// Batches stay until removed explicitly by key.
pub trait MetricsBuffer: Send + Sync {
    /// Append a batch. Fails with `Conflict` if the key is already staged.
    fn put_batch(&self, batch: &MetricsBatch) -> Result<(), DbError>;

    /// The oldest staged batch, without removing it.
    fn peek_oldest_batch(&self) -> Result<Option<MetricsBatch>, DbError>;

    /// Every staged batch, oldest first, without removing any.
    fn list_batches(&self) -> Result<Vec<MetricsBatch>, DbError>;

    /// Remove a batch by key. Returns `false` if it was not present.
    fn remove_batch(&self, key: &str) -> Result<bool, DbError>;

    fn pending_batches(&self) -> Result<usize, DbError>;
}

impl Store {
    /// Number of batches moved aside because their payload could not be decoded.
    pub fn dead_batch_count(&self) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM dead_batches", [], |r| r.get(0))?;
        Ok(count as usize)
    }
}

/// The first decodable batch after `after_seq`, with its sequence number.
///
/// Undecodable rows met on the way are moved to `dead_batches` so they
/// neither block the queue nor vanish.
fn next_decodable(conn: &Connection, after_seq: i64) -> Result<Option<(i64, MetricsBatch)>, DbError> {
    loop {
        let row: Option<(i64, String, String, String)> = conn
            .query_row(
                "SELECT seq, batch_key, created_at, payload FROM metrics_batches
                 WHERE seq > ?1 ORDER BY seq ASC LIMIT 1",
                params![after_seq],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((seq, key, created_at, payload)) = row else {
            return Ok(None);
        };

        match serde_json::from_str(&payload) {
            Ok(results) => {
                let created_at = parse_db_time(&created_at).unwrap_or_else(|| {
                    tracing::warn!(
                        "MetricsBuffer: batch {} has unreadable created_at {:?}",
                        key,
                        created_at
                    );
                    Utc::now()
                });
                return Ok(Some((
                    seq,
                    MetricsBatch {
                        key,
                        created_at,
                        results,
                    },
                )));
            }
            Err(e) => {
                tracing::error!(
                    "MetricsBuffer: batch {} cannot be decoded, moving it to dead_batches: {}",
                    key,
                    e
                );
                dead_letter(conn, seq, &e.to_string())?;
            }
        }
    }
}

fn dead_letter(conn: &Connection, seq: i64, error: &str) -> Result<(), DbError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO dead_batches (batch_key, created_at, payload, error, failed_at)
         SELECT batch_key, created_at, payload, ?2, ?3 FROM metrics_batches WHERE seq = ?1",
        params![seq, error, format_db_time(&Utc::now())],
    )?;
    tx.execute("DELETE FROM metrics_batches WHERE seq = ?1", params![seq])?;
    tx.commit()?;
    Ok(())
}

impl MetricsBuffer for Store {
    fn put_batch(&self, batch: &MetricsBatch) -> Result<(), DbError> {
        let payload = serde_json::to_string(&batch.results)?;
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO metrics_batches (batch_key, created_at, payload) VALUES (?1, ?2, ?3)
             ON CONFLICT(batch_key) DO NOTHING",
            params![batch.key, format_db_time(&batch.created_at), payload],
        )?;
        if inserted == 0 {
            return Err(DbError::Conflict(batch.key.clone()));
        }
        Ok(())
    }

    fn peek_oldest_batch(&self) -> Result<Option<MetricsBatch>, DbError> {
        let conn = self.conn()?;
        Ok(next_decodable(&conn, 0)?.map(|(_, batch)| batch))
    }

    fn list_batches(&self) -> Result<Vec<MetricsBatch>, DbError> {
        let conn = self.conn()?;
        let mut batches = Vec::new();
        let mut after = 0;
        while let Some((seq, batch)) = next_decodable(&conn, after)? {
            batches.push(batch);
            after = seq;
        }
        Ok(batches)
    }

    fn remove_batch(&self, key: &str) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM metrics_batches WHERE batch_key = ?1", params![key])?;
        Ok(removed == 1)
    }

    fn pending_batches(&self) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM metrics_batches", [], |r| r.get(0))?;
        Ok(count as usize)
    }
}

/// In-process buffer; pending batches are lost on restart.
#[derive(Default)]
pub struct MemoryBuffer {
    batches: Mutex<VecDeque<MetricsBatch>>,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn batches(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<MetricsBatch>>, DbError> {
        self.batches.lock().map_err(|_| DbError::Poisoned)
    }
}

impl MetricsBuffer for MemoryBuffer {
    fn put_batch(&self, batch: &MetricsBatch) -> Result<(), DbError> {
        let mut batches = self.batches()?;
        if batches.iter().any(|b| b.key == batch.key) {
            return Err(DbError::Conflict(batch.key.clone()));
        }
        batches.push_back(batch.clone());
        Ok(())
    }

    fn peek_oldest_batch(&self) -> Result<Option<MetricsBatch>, DbError> {
        Ok(self.batches()?.front().cloned())
    }

    fn list_batches(&self) -> Result<Vec<MetricsBatch>, DbError> {
        Ok(self.batches()?.iter().cloned().collect())
    }

    fn remove_batch(&self, key: &str) -> Result<bool, DbError> {
        let mut batches = self.batches()?;
        match batches.iter().position(|b| b.key == key) {
            Some(idx) => {
                batches.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn pending_batches(&self) -> Result<usize, DbError> {
        Ok(self.batches()?.len())
    }
}
