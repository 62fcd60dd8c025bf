use std::collections::VecDeque;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lock::{Holder, RecordLockManager};
use crate::record::{RecordId, Records};
use crate::store::Kv;

/// Timing and budget of one accrual job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccrualSettings {
    /// Delay between consecutive ticks (and before the first one).
    pub tick_interval: Duration,
    /// Number of ticks a job performs before completing.
    pub total_ticks: u32,
}

impl Default for AccrualSettings {
    fn default() -> Self {
        Self { tick_interval: Duration::from_secs(60), total_ticks: 30 }
    }
}

/// Source of per-tick point increments.
pub trait PointsSource: Send + Sync + 'static {
    /// Next increment to add.
    fn draw(&self) -> u32;
}

/// Uniform draws from an inclusive range using the thread RNG.
#[derive(Debug, Clone)]
pub struct UniformPoints {
    range: RangeInclusive<u32>,
}

impl UniformPoints {
    /// Draw uniformly from `low..=high`.
    pub fn new(low: u32, high: u32) -> Self {
        Self { range: low.min(high)..=high.max(low) }
    }
}

impl Default for UniformPoints {
    fn default() -> Self {
        Self::new(1, 9)
    }
}

impl PointsSource for UniformPoints {
    fn draw(&self) -> u32 {
        rand::rng().random_range(self.range.clone())
    }
}

/// Replays a fixed sequence of increments, then repeats its last value.
#[derive(Debug)]
pub struct SequencePoints {
    pending: Mutex<VecDeque<u32>>,
    last: Mutex<u32>,
}

impl SequencePoints {
    /// Serve `draws` in order.
    pub fn new(draws: impl IntoIterator<Item = u32>) -> Self {
        Self { pending: Mutex::new(draws.into_iter().collect()), last: Mutex::new(1) }
    }
}

impl PointsSource for SequencePoints {
    fn draw(&self) -> u32 {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = self.pending.lock().unwrap_or_else(PoisonError::into_inner).pop_front() {
            *last = next;
        }
        *last
    }
}

/// Everything a job needs to perform its ticks.
pub struct AccrualContext<K: Kv> {
    /// Record store adapter.
    pub records: Records<K>,
    /// Lock manager shared with the API handlers.
    pub locks: RecordLockManager,
    /// Increment generator.
    pub points: Arc<dyn PointsSource>,
    /// Tick timing and budget.
    pub settings: AccrualSettings,
}

/// Lifecycle of an accrual job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, waiting for the first tick.
    Scheduled,
    /// At least one tick has started.
    Running,
    /// Stopped early; no further ticks.
    Cancelled,
    /// All ticks done.
    Completed,
}

impl JobState {
    /// `Cancelled` or `Completed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Cancelled | JobState::Completed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Cancelled => "cancelled",
            JobState::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Observable progress of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Current lifecycle state.
    pub state: JobState,
    /// Ticks left before completion.
    pub ticks_remaining: u32,
    /// Ticks whose increment was persisted.
    pub ticks_applied: u32,
    /// Ticks whose write failed and were skipped.
    pub failed_writes: u32,
    /// Sum of persisted increments.
    pub points_accrued: u64,
}

/// What the timing loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Schedule the next tick.
    Continue,
    /// The job reached the given terminal state.
    Stopped(JobState),
}

enum TickWrite {
    Applied(u32),
    Failed,
    Missing,
}

/// Drives the timed point increments for a single record.
///
/// The job does not enforce its own uniqueness; the scheduler does.
pub struct AccrualJob {
    record_id: RecordId,
    created_at: Instant,
    progress: watch::Sender<JobProgress>,
    cancel: CancellationToken,
}

impl AccrualJob {
    /// New job in `Scheduled` state with `total_ticks` to go.
    pub fn new(record_id: RecordId, total_ticks: u32) -> Self {
        let (progress, _) = watch::channel(JobProgress {
            state: JobState::Scheduled,
            ticks_remaining: total_ticks,
            ticks_applied: 0,
            failed_writes: 0,
            points_accrued: 0,
        });
        Self { record_id, created_at: Instant::now(), progress, cancel: CancellationToken::new() }
    }

    /// Record this job targets.
    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    /// Snapshot of the current progress.
    pub fn progress(&self) -> JobProgress {
        self.progress.borrow().clone()
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.progress.borrow().state
    }

    /// Watch progress changes.
    pub fn subscribe(&self) -> watch::Receiver<JobProgress> {
        self.progress.subscribe()
    }

    /// Wait for `Cancelled` or `Completed` and return the final progress.
    pub async fn wait_until_terminal(&self) -> JobProgress {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let done = match rx.wait_for(|p| p.state.is_terminal()).await {
            Ok(p) => p.clone(),
            Err(_) => self.progress(),
        };
        done
    }

    /// Stop the job. Returns `false` if it had already terminated.
    ///
    /// No tick starts after this returns; a tick already holding the record
    /// lock finishes its write and then exits without rescheduling.
    pub fn cancel(&self) -> bool {
        let changed = self.progress.send_if_modified(|p| {
            if p.state.is_terminal() {
                false
            } else {
                p.state = JobState::Cancelled;
                true
            }
        });
        self.cancel.cancel();
        if changed {
            info!(record_id = self.record_id, "accrual job cancelled");
        }
        changed
    }

    /// Run the job to a terminal state: first tick one interval after
    /// creation, each following tick one interval after the previous tick
    /// actually ran, so time spent waiting for the record lock pushes the
    /// rest of the schedule back.
    pub async fn start<K: Kv>(self: Arc<Self>, ctx: Arc<AccrualContext<K>>) {
        let interval = ctx.settings.tick_interval;
        let mut next_fire = self.created_at + interval;
        debug!(record_id = self.record_id, ?interval, "accrual job scheduled");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(next_fire) => {}
            }
            match self.tick(&ctx).await {
                TickOutcome::Continue => next_fire = Instant::now() + interval,
                TickOutcome::Stopped(state) => {
                    debug!(record_id = self.record_id, %state, "accrual job stopped");
                    break;
                }
            }
        }
    }

    /// Perform one locked increment.
    pub async fn tick<K: Kv>(&self, ctx: &AccrualContext<K>) -> TickOutcome {
        let id = self.record_id;
        if self.state().is_terminal() {
            return TickOutcome::Stopped(self.state());
        }
        let guard = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return TickOutcome::Stopped(self.state()),
            guard = ctx.locks.acquire(id, Holder::Job) => guard,
        };

        // Cancellation may have landed while we queued for the lock.
        let mut admitted = false;
        self.progress.send_if_modified(|p| {
            admitted = !p.state.is_terminal();
            if p.state == JobState::Scheduled {
                p.state = JobState::Running;
                true
            } else {
                false
            }
        });
        if !admitted {
            return TickOutcome::Stopped(self.state());
        }

        let points = ctx.points.clone();
        let written = ctx
            .records
            .blocking_locked(guard, move |records, guard| {
                let step = match records.find(id) {
                    Ok(Some(mut record)) => {
                        let increment = points.draw();
                        record.points = record.points.saturating_add(u64::from(increment));
                        match records.put(guard, &record) {
                            Ok(()) => {
                                debug!(record_id = id, increment, points = record.points, "accrual tick applied");
                                TickWrite::Applied(increment)
                            }
                            Err(e) => {
                                warn!(record_id = id, error = %e, "accrual tick not persisted");
                                TickWrite::Failed
                            }
                        }
                    }
                    Ok(None) => TickWrite::Missing,
                    Err(e) => {
                        warn!(record_id = id, error = %e, "accrual tick could not read record");
                        TickWrite::Failed
                    }
                };
                Ok(step)
            })
            .await;
        let step = match written {
            Ok((guard, step)) => {
                drop(guard);
                step
            }
            Err(e) => {
                warn!(record_id = id, error = %e, "accrual tick aborted");
                TickWrite::Failed
            }
        };
        match step {
            TickWrite::Applied(n) => self.finish_tick(Some(n)),
            TickWrite::Failed => self.finish_tick(None),
            TickWrite::Missing => {
                debug!(record_id = id, "record vanished; stopping accrual");
                self.cancel();
                TickOutcome::Stopped(JobState::Cancelled)
            }
        }
    }

    fn finish_tick(&self, applied: Option<u32>) -> TickOutcome {
        let mut outcome = TickOutcome::Continue;
        self.progress.send_modify(|p| {
            p.ticks_remaining = p.ticks_remaining.saturating_sub(1);
            match applied {
                Some(n) => {
                    p.ticks_applied += 1;
                    p.points_accrued += u64::from(n);
                }
                None => p.failed_writes += 1,
            }
            if p.state == JobState::Cancelled {
                outcome = TickOutcome::Stopped(JobState::Cancelled);
            } else if p.ticks_remaining == 0 {
                p.state = JobState::Completed;
                outcome = TickOutcome::Stopped(JobState::Completed);
            }
        });
        if outcome == TickOutcome::Stopped(JobState::Completed) {
            let p = self.progress();
            info!(
                record_id = self.record_id,
                ticks_applied = p.ticks_applied,
                points_accrued = p.points_accrued,
                "accrual job completed"
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NewRecord;
    use crate::store::MemKv;
    use chrono::NaiveDate;

    fn context(points: impl PointsSource, total_ticks: u32) -> AccrualContext<MemKv> {
        AccrualContext {
            records: Records::new(MemKv::new()),
            locks: RecordLockManager::new(),
            points: Arc::new(points),
            settings: AccrualSettings { tick_interval: Duration::from_secs(60), total_ticks },
        }
    }

    fn seed(ctx: &AccrualContext<MemKv>, points: u64) -> RecordId {
        let id = ctx.records.next_id().unwrap();
        let guard = ctx.locks.try_acquire(id, Holder::Api).unwrap();
        let new = NewRecord {
            name: "A".into(),
            surname: "B".into(),
            birthday: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
            points: Some(points),
        };
        ctx.records.insert(&guard, &new.into_record(id)).unwrap();
        id
    }

    #[test]
    fn uniform_points_stay_in_range() {
        let points = UniformPoints::default();
        for _ in 0..1000 {
            let n = points.draw();
            assert!((1..=9).contains(&n), "{n}");
        }
    }

    #[test]
    fn sequence_points_repeat_the_last_draw() {
        let points = SequencePoints::new([4, 2]);
        assert_eq!([points.draw(), points.draw(), points.draw()], [4, 2, 2]);
    }

    #[tokio::test]
    async fn ticks_add_draws_and_complete() {
        let ctx = context(SequencePoints::new([3, 5]), 2);
        let id = seed(&ctx, 10);
        let job = AccrualJob::new(id, 2);

        assert_eq!(job.tick(&ctx).await, TickOutcome::Continue);
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(ctx.records.get(id).unwrap().points, 13);

        assert_eq!(job.tick(&ctx).await, TickOutcome::Stopped(JobState::Completed));
        let p = job.progress();
        assert_eq!(p.ticks_remaining, 0);
        assert_eq!(p.ticks_applied, 2);
        assert_eq!(p.points_accrued, 8);
        assert_eq!(ctx.records.get(id).unwrap().points, 18);

        // Completed jobs neither tick nor cancel.
        assert_eq!(job.tick(&ctx).await, TickOutcome::Stopped(JobState::Completed));
        assert!(!job.cancel());
        assert_eq!(ctx.records.get(id).unwrap().points, 18);
    }

    #[tokio::test]
    async fn missing_record_cancels_the_job() {
        let ctx = context(UniformPoints::default(), 30);
        let job = AccrualJob::new(42, 30);
        assert_eq!(job.tick(&ctx).await, TickOutcome::Stopped(JobState::Cancelled));
        let p = job.progress();
        assert_eq!(p.state, JobState::Cancelled);
        assert_eq!(p.ticks_remaining, 30);
        assert_eq!(ctx.locks.tracked(), 0);
    }

    #[tokio::test]
    async fn cancelled_while_waiting_for_the_lock() {
        let ctx = context(UniformPoints::default(), 30);
        let id = seed(&ctx, 0);
        let job = Arc::new(AccrualJob::new(id, 30));
        let held = ctx.locks.acquire(id, Holder::Api).await;

        let ctx = Arc::new(ctx);
        let tick = tokio::spawn({
            let job = job.clone();
            let ctx = ctx.clone();
            async move { job.tick(&ctx).await }
        });
        tokio::task::yield_now().await;
        assert!(job.cancel());
        drop(held);

        assert_eq!(tick.await.unwrap(), TickOutcome::Stopped(JobState::Cancelled));
        assert_eq!(ctx.records.get(id).unwrap().points, 0);
        assert_eq!(job.progress().ticks_remaining, 30);
    }

    /// Cancels the job from inside the locked section of its own tick.
    struct CancelOnDraw(Arc<std::sync::OnceLock<Arc<AccrualJob>>>);

    impl PointsSource for CancelOnDraw {
        fn draw(&self) -> u32 {
            if let Some(job) = self.0.get() {
                job.cancel();
            }
            5
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_the_last_tick_ends_cancelled() {
        let slot = Arc::new(std::sync::OnceLock::new());
        let ctx = Arc::new(context(CancelOnDraw(slot.clone()), 1));
        let id = seed(&ctx, 10);
        let job = Arc::new(AccrualJob::new(id, 1));
        assert!(slot.set(job.clone()).is_ok());

        tokio::spawn(job.clone().start(ctx.clone())).await.unwrap();

        let p = job.progress();
        assert_eq!(p.state, JobState::Cancelled);
        assert_eq!(p.ticks_remaining, 0);
        assert_eq!(p.ticks_applied, 1);
        // The write already under way still lands.
        assert_eq!(ctx.records.get(id).unwrap().points, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_tick_stops_the_schedule() {
        let slot = Arc::new(std::sync::OnceLock::new());
        let ctx = Arc::new(context(CancelOnDraw(slot.clone()), 3));
        let id = seed(&ctx, 0);
        let job = Arc::new(AccrualJob::new(id, 3));
        assert!(slot.set(job.clone()).is_ok());

        tokio::spawn(job.clone().start(ctx.clone())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;

        let p = job.progress();
        assert_eq!(p.state, JobState::Cancelled);
        assert_eq!(p.ticks_remaining, 2);
        assert_eq!(p.ticks_applied, 1);
        assert_eq!(ctx.records.get(id).unwrap().points, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_delay_pushes_the_next_tick_back() {
        let interval = Duration::from_secs(60);
        let ctx = Arc::new(context(SequencePoints::new([1]), 30));
        let id = seed(&ctx, 0);
        let t0 = Instant::now();
        let job = Arc::new(AccrualJob::new(id, 30));
        let mut progress = job.subscribe();
        let held = ctx.locks.try_acquire(id, Holder::Api).unwrap();
        tokio::spawn(job.clone().start(ctx.clone()));

        // First tick comes due and waits 30 s for the lock.
        tokio::time::advance(interval).await;
        tokio::task::yield_now().await;
        assert_eq!(job.progress().ticks_applied, 0);
        tokio::time::advance(Duration::from_secs(30)).await;
        drop(held);
        progress.wait_for(|p| p.ticks_applied == 1).await.unwrap();
        assert_eq!(Instant::now() - t0, Duration::from_secs(90));

        // Not at t0 + 120 ...
        tokio::time::advance(Duration::from_secs(59)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(job.progress().ticks_applied, 1);

        // ... but one interval after the first tick ran.
        tokio::time::advance(Duration::from_secs(1)).await;
        progress.wait_for(|p| p.ticks_applied == 2).await.unwrap();
        assert_eq!(Instant::now() - t0, Duration::from_secs(150));
    }
}
