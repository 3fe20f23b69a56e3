//! Scheduling of sync sessions on a tokio runtime.
//!
//! Sessions themselves are blocking (they page over the transport on worker
//! threads), so every run goes through `spawn_blocking`. The scheduler adds
//! the policy around them: a scheduled request made while a run is in flight
//! queues exactly one follow-up run, while a manual trigger reports that a
//! run is already going.

use crate::error::{SyncError, SyncResult};
use crate::state::{SyncEngine, SyncReport};
use crate::transport::SyncTransport;
use outpost_sync_protocol::{SyncStatus, TriggerOutcome};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct SchedulerState {
    running: bool,
    queued: bool,
}

/// Runs sessions of one engine, at most one at a time.
pub struct SyncScheduler<T: SyncTransport + 'static> {
    engine: Arc<SyncEngine<T>>,
    state: Arc<Mutex<SchedulerState>>,
}

impl<T: SyncTransport + 'static> SyncScheduler<T> {
    /// Creates a scheduler driving `engine`.
    pub fn new(engine: Arc<SyncEngine<T>>) -> Self {
        Self {
            engine,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    /// The driven engine.
    pub fn engine(&self) -> &Arc<SyncEngine<T>> {
        &self.engine
    }

    /// Returns true while a run (including a queued follow-up) is in flight.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Operator-facing status.
    pub fn status(&self) -> SyncStatus {
        self.engine.status()
    }

    /// Requests a sync with retries.
    ///
    /// Returns the handle of the started run, or `None` if a run was already
    /// in flight; in that case one follow-up run is queued behind it.
    pub fn request_sync(&self) -> Option<JoinHandle<SyncResult<SyncReport>>> {
        {
            let mut state = self.state.lock();
            if state.running {
                state.queued = true;
                debug!("sync already running, queued a follow-up");
                return None;
            }
            state.running = true;
        }
        Some(self.spawn_run(|engine| engine.sync_with_retry()))
    }

    /// Starts an urgent sync now and waits for it up to `manual_trigger_wait`.
    ///
    /// A failed session is returned as an error. A session still running
    /// when the wait ends keeps going in the background.
    pub async fn trigger_manual(&self) -> SyncResult<TriggerOutcome> {
        {
            let mut state = self.state.lock();
            if state.running {
                return Ok(TriggerOutcome::AlreadyRunning);
            }
            state.running = true;
        }
        info!("manual sync triggered");
        self.engine.request_urgent();
        let mut handle = self.spawn_run(|engine| engine.sync());
        let wait = self.engine.config().manual_trigger_wait;
        match tokio::time::timeout(wait, &mut handle).await {
            Ok(Ok(Ok(_))) => Ok(TriggerOutcome::Completed),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(join_err)) => Err(SyncError::Internal(join_err.to_string())),
            Err(_) => Ok(TriggerOutcome::ContinuingInBackground),
        }
    }

    /// Requests a sync every `sync_interval`, if one is configured.
    ///
    /// The task stops once the scheduler is dropped.
    pub fn spawn_periodic(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.engine.config().sync_interval?;
        let scheduler = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match scheduler.upgrade() {
                    Some(scheduler) => {
                        scheduler.request_sync();
                    }
                    None => break,
                }
            }
        }))
    }

    fn spawn_run<F>(&self, first: F) -> JoinHandle<SyncResult<SyncReport>>
    where
        F: FnOnce(&SyncEngine<T>) -> SyncResult<SyncReport> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || {
            let mut release = RunGuard { state: &state, released: false };
            let mut result = first(&engine);
            while release.take_queued() {
                if let Err(err) = &result {
                    warn!(error = %err, "sync failed, running the queued follow-up");
                }
                result = engine.sync_with_retry();
            }
            result
        })
    }
}

/// Owns the running flag of one run.
struct RunGuard<'a> {
    state: &'a Mutex<SchedulerState>,
    released: bool,
}

impl RunGuard<'_> {
    /// Consumes a queued request, or releases the run when none is queued.
    ///
    /// Both happen under one lock, so a request either lands in the queue of
    /// a run that will see it or finds the scheduler idle.
    fn take_queued(&mut self) -> bool {
        let mut state = self.state.lock();
        if state.queued {
            state.queued = false;
            return true;
        }
        state.running = false;
        self.released = true;
        false
    }
}

impl Drop for RunGuard<'_> {
    // A panicking run still frees the scheduler; queued requests stay queued.
    fn drop(&mut self) {
        if !self.released {
            self.state.lock().running = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::transport::MockTransport;
    use outpost_core::{CoreConfig, Database, TypeRegistry};
    use outpost_sync_protocol::{StartSessionResponse, StartStatus, SyncMessage};
    use std::time::Duration;

    fn scheduler(config: SyncConfig) -> SyncScheduler<MockTransport> {
        let db = Arc::new(Database::new(Arc::new(TypeRegistry::builder().build().unwrap())));
        let engine = SyncEngine::new(config, MockTransport::new(), db).unwrap();
        SyncScheduler::new(Arc::new(engine))
    }

    fn config() -> SyncConfig {
        SyncConfig::new("node-1", "mock://central").with_core(CoreConfig::new(10))
    }

    #[tokio::test]
    async fn manual_trigger_reports_already_running() {
        let scheduler = scheduler(config());
        scheduler.state.lock().running = true;
        assert_eq!(scheduler.trigger_manual().await.unwrap(), TriggerOutcome::AlreadyRunning);
    }

    #[tokio::test]
    async fn manual_trigger_surfaces_failures() {
        let scheduler = scheduler(config());
        scheduler
            .engine()
            .transport()
            .queue_reply(SyncMessage::SessionStarted(StartSessionResponse::refused(StartStatus::Busy, 0)));
        let err = scheduler.trigger_manual().await.unwrap_err();
        assert!(matches!(err, SyncError::SessionRefused(StartStatus::Busy)));
        assert!(!scheduler.is_running());
        let requests = scheduler.engine().transport().requests();
        assert!(matches!(&requests[0], SyncMessage::StartSession(start) if start.urgent));
    }

    #[tokio::test]
    async fn request_while_running_is_queued() {
        let scheduler = scheduler(config());
        scheduler.state.lock().running = true;
        assert!(scheduler.request_sync().is_none());
        assert!(scheduler.state.lock().queued);
    }

    #[tokio::test]
    async fn queued_follow_up_runs_after_the_first() {
        let scheduler = scheduler(config().with_retry(crate::config::RetryConfig::no_retry()));
        let transport = scheduler.engine().transport();
        for _ in 0..2 {
            transport.queue_reply(SyncMessage::SessionStarted(StartSessionResponse::refused(StartStatus::Busy, 0)));
        }
        // A request that arrived while the first run was in flight.
        scheduler.state.lock().queued = true;
        scheduler.state.lock().running = true;
        let handle = scheduler.spawn_run(|engine| engine.sync());
        assert!(handle.await.unwrap().is_err());
        assert_eq!(transport.requests().len(), 2);
        assert!(!scheduler.is_running());
    }

    #[test]
    fn request_racing_the_end_of_a_run_is_never_lost() {
        let state = Mutex::new(SchedulerState { running: true, queued: true });
        let mut guard = RunGuard { state: &state, released: false };
        assert!(guard.take_queued());
        assert!(state.lock().running);
        assert!(!guard.take_queued());
        assert!(!state.lock().running);

        // A request that now finds the scheduler idle starts its own run,
        // and the finished run's guard must leave that run alone.
        state.lock().running = true;
        state.lock().queued = true;
        drop(guard);
        let state = state.lock();
        assert!(state.running);
        assert!(state.queued);
    }

    #[test]
    fn panicking_run_frees_the_scheduler() {
        let state = Mutex::new(SchedulerState { running: true, queued: true });
        drop(RunGuard { state: &state, released: false });
        let state = state.lock();
        assert!(!state.running);
        assert!(state.queued);
    }

    #[tokio::test]
    async fn request_after_a_finished_run_starts_a_new_one() {
        let scheduler = scheduler(config().with_retry(crate::config::RetryConfig::no_retry()));
        let transport = scheduler.engine().transport();
        for _ in 0..2 {
            transport.queue_reply(SyncMessage::SessionStarted(StartSessionResponse::refused(StartStatus::Busy, 0)));
        }
        let first = scheduler.request_sync().unwrap();
        assert!(first.await.unwrap().is_err());
        assert!(!scheduler.is_running());
        let second = scheduler.request_sync().unwrap();
        assert!(second.await.unwrap().is_err());
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn no_interval_means_no_periodic_task() {
        let scheduler = Arc::new(scheduler(config()));
        assert!(scheduler.spawn_periodic().is_none());
        let scheduler = Arc::new(self::scheduler(config().with_sync_interval(Duration::from_secs(60))));
        let task = scheduler.spawn_periodic().unwrap();
        task.abort();
    }
}
