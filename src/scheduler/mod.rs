//! Scheduler module for running health checks and flushing their results.
//!
//! Two independent periodic loops: the batch check runner every P1 and the
//! summary flush job every P2 = P1 + offset. Runner ticks are aligned to the
//! wall clock so interval-based site selection sees every multiple of P1.
//! Each loop finishes its own tick before waiting for the next one, so a job
//! never overlaps with itself.

mod checks;
mod flush;
#[cfg(test)]
pub(crate) mod testing;

pub use checks::*;
pub use flush::*;

use crate::config::CheckConfig;
use crate::db::DbError;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
}

/// Owns the two background loops and their stop signal.
pub struct Scheduler {
    runner: Arc<BatchCheckRunner>,
    flush: Arc<SummaryFlushJob>,
    config: CheckConfig,
    stop_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(runner: Arc<BatchCheckRunner>, flush: Arc<SummaryFlushJob>, config: CheckConfig) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            runner,
            flush,
            config,
            stop_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start both loops.
    ///
    /// The runner's first tick lands on the next wall-clock minute that is a
    /// multiple of the tick interval; the flush job follows one offset later.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return; // Already running
        }

        let check_period = self.config.check_period();
        let flush_period = self.config.flush_period();
        let flush_offset = self.config.flush_offset();

        let now = Utc::now();
        let first_tick = next_aligned_tick(now, check_period);
        let start = Instant::now() + (first_tick - now).to_std().unwrap_or_default();

        tracing::info!(
            "Scheduler: checks every {:?} from {}, flush every {:?} (offset {:?})",
            check_period,
            first_tick,
            flush_period,
            flush_offset
        );

        handles.push(tokio::spawn(run_check_loop(
            self.runner.clone(),
            TickClock {
                start,
                first_tick,
            },
            check_period,
            self.stop_tx.subscribe(),
        )));
        handles.push(tokio::spawn(run_flush_loop(
            self.flush.clone(),
            start + flush_offset,
            flush_period,
            self.stop_tx.subscribe(),
        )));
    }

    /// Signal both loops to stop and wait for in-flight ticks to finish.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(());

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler: loop ended abnormally: {}", e);
            }
        }
        tracing::info!("Scheduler: stopped");
    }
}

/// The first wall-clock instant at or after `now` whose Unix time is a
/// multiple of `period` (whole seconds).
pub fn next_aligned_tick(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let period_secs = period.as_secs().max(1) as i64;
    let secs = now.timestamp();
    let aligned = if secs.rem_euclid(period_secs) == 0 && now.timestamp_subsec_nanos() == 0 {
        secs
    } else {
        (secs.div_euclid(period_secs) + 1) * period_secs
    };
    DateTime::from_timestamp(aligned, 0).unwrap_or(now)
}

/// Maps monotonic tick instants back to the wall-clock times they were scheduled for.
#[derive(Debug, Clone, Copy)]
struct TickClock {
    start: Instant,
    first_tick: DateTime<Utc>,
}

impl TickClock {
    fn scheduled_at(&self, tick: Instant) -> DateTime<Utc> {
        let elapsed = tick.saturating_duration_since(self.start);
        self.first_tick + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

async fn run_check_loop(
    runner: Arc<BatchCheckRunner>,
    clock: TickClock,
    period: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval_at(clock.start, period);
    // Skipped ticks keep their phase, so scheduled times stay aligned.
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            tick = interval.tick() => {
                if let Err(e) = runner.run_tick(clock.scheduled_at(tick)).await {
                    tracing::error!("BatchCheckRunner: tick failed: {}", e);
                }
            }
        }
    }
}

async fn run_flush_loop(
    flush: Arc<SummaryFlushJob>,
    start: Instant,
    period: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                match flush.run_cycle() {
                    Ok(FlushOutcome::Applied { batch_keys, sites_updated }) => {
                        tracing::debug!(
                            "SummaryFlushJob: tick applied {} batches ({} site updates)",
                            batch_keys.len(),
                            sites_updated
                        );
                    }
                    Ok(FlushOutcome::Empty) => {}
                    Ok(FlushOutcome::LockHeld) => {
                        tracing::debug!("SummaryFlushJob: tick skipped");
                    }
                    Err(e) => tracing::error!("SummaryFlushJob: cycle failed: {}", e),
                }
            }
        }
    }
}
