//! Chunked pull of a staged snapshot.
//!
//! Record types are paged in parallel (up to `pull.concurrency` at once),
//! each with its own adaptive page size. Pages land in the session's
//! incoming staging on this node; nothing is applied here.

use crate::config::PullConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use outpost_core::{Database, SessionId, SnapshotDirection, Tick};
use outpost_sync_protocol::{PullPlan, PullRequest, TypePlan, WireRecord};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Page size that follows observed latency.
#[derive(Debug, Clone)]
pub struct AdaptiveLimit {
    current: u32,
    min: u32,
    max: u32,
    target: Duration,
    max_change: f64,
}

impl AdaptiveLimit {
    /// Starts at `initial_limit`.
    pub fn new(config: &PullConfig) -> Self {
        Self {
            current: config.initial_limit.max(config.min_limit).min(config.max_limit),
            min: config.min_limit,
            max: config.max_limit,
            target: config.target_page_duration,
            max_change: config.max_change_per_page,
        }
    }

    /// Size of the next page.
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Feeds back how long the last page took and returns the next size.
    pub fn observe(&mut self, elapsed: Duration) -> u32 {
        let current = self.current as f64;
        let ideal = if elapsed.is_zero() {
            f64::from(self.max)
        } else {
            (self.target.as_secs_f64() * current / elapsed.as_secs_f64()).floor()
        };
        let lower = (current * (1.0 - self.max_change)).floor();
        let upper = (current * (1.0 + self.max_change)).floor().max(current + 1.0);
        let next = ideal.max(lower).min(upper).max(f64::from(self.min)).min(f64::from(self.max));
        self.current = next as u32;
        self.current
    }
}

/// Everything one pull needs.
pub(crate) struct PullJob<'a, T: SyncTransport> {
    pub transport: &'a T,
    pub db: &'a Database,
    pub session: SessionId,
    pub since: Tick,
    pub config: &'a PullConfig,
    pub cancelled: &'a AtomicBool,
}

impl<T: SyncTransport> PullJob<'_, T> {
    /// Pages every planned type into incoming staging. Returns the number
    /// of entries staged.
    pub fn run(&self, plan: &PullPlan) -> SyncResult<u64> {
        let queue: Mutex<VecDeque<&TypePlan>> =
            Mutex::new(plan.types.iter().filter(|t| t.count > 0).collect());
        let workers = self.config.concurrency.min(queue.lock().len());
        if workers == 0 {
            return Ok(0);
        }

        let stop = AtomicBool::new(false);
        let failure: Mutex<Option<SyncError>> = Mutex::new(None);
        let total: Mutex<u64> = Mutex::new(0);
        thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let Some(type_plan) = queue.lock().pop_front() else {
                        break;
                    };
                    match self.pull_type(type_plan, &stop) {
                        Ok(count) => *total.lock() += count,
                        Err(err) => {
                            stop.store(true, Ordering::SeqCst);
                            failure.lock().get_or_insert(err);
                            break;
                        }
                    }
                });
            }
        });

        match failure.into_inner() {
            Some(err) => Err(err),
            None => Ok(total.into_inner()),
        }
    }

    fn pull_type(&self, plan: &TypePlan, stop: &AtomicBool) -> SyncResult<u64> {
        let snapshots = self.db.snapshots();
        let mut limit = AdaptiveLimit::new(self.config);
        let mut cursor = None;
        let mut pulled = 0u64;
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled);
            }
            if stop.load(Ordering::SeqCst) {
                return Ok(pulled);
            }
            let started = Instant::now();
            let page = self.transport.pull(PullRequest {
                session_id: self.session,
                since_tick: self.since,
                record_type: plan.record_type.clone(),
                cursor: cursor.take(),
                limit: limit.current(),
            })?;
            let elapsed = started.elapsed();
            let received = page.entries.len();
            pulled += snapshots.insert(
                self.session,
                SnapshotDirection::Incoming,
                page.entries.into_iter().map(WireRecord::into_entry),
            )? as u64;
            let next_limit = limit.observe(elapsed);
            debug!(
                session_id = %self.session,
                record_type = %plan.record_type,
                received,
                elapsed_ms = elapsed.as_millis() as u64,
                next_limit,
                "pulled page"
            );
            match page.next_cursor {
                Some(next) if !page.done => cursor = Some(next),
                _ => break,
            }
        }
        if pulled != plan.count {
            debug!(
                session_id = %self.session,
                record_type = %plan.record_type,
                planned = plan.count,
                pulled,
                "pulled count differs from plan"
            );
        }
        Ok(pulled)
    }
}


