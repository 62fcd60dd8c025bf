use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::job::{AccrualContext, AccrualJob};
use crate::record::RecordId;
use crate::store::Kv;

struct ActiveJob {
    job: Arc<AccrualJob>,
    task: JoinHandle<()>,
}

type JobTable = Arc<Mutex<HashMap<RecordId, ActiveJob>>>;

fn lock_jobs(jobs: &JobTable) -> MutexGuard<'_, HashMap<RecordId, ActiveJob>> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates, tracks and cancels accrual jobs; at most one live job per record.
///
/// Each job runs as its own Tokio task and drops out of the table when it
/// reaches a terminal state.
pub struct AccrualScheduler<K: Kv> {
    ctx: Arc<AccrualContext<K>>,
    jobs: JobTable,
}

impl<K: Kv> Clone for AccrualScheduler<K> {
    fn clone(&self) -> Self {
        Self { ctx: self.ctx.clone(), jobs: self.jobs.clone() }
    }
}

impl<K: Kv> AccrualScheduler<K> {
    /// Scheduler running jobs against `ctx`.
    pub fn new(ctx: Arc<AccrualContext<K>>) -> Self {
        Self { ctx, jobs: Arc::default() }
    }

    /// Shared job context.
    pub fn context(&self) -> &Arc<AccrualContext<K>> {
        &self.ctx
    }

    /// Start accrual for a new record. Returns `false` (and does nothing) if a
    /// job for `id` is still live.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_record_created(&self, id: RecordId) -> bool {
        let mut jobs = lock_jobs(&self.jobs);
        if let Some(active) = jobs.get(&id) {
            if !active.job.state().is_terminal() {
                warn!(record_id = id, "accrual job already active; ignoring duplicate start");
                return false;
            }
        }

        let job = Arc::new(AccrualJob::new(id, self.ctx.settings.total_ticks));
        let task = tokio::spawn({
            let job = job.clone();
            let ctx = self.ctx.clone();
            let table = self.jobs.clone();
            async move {
                job.clone().start(ctx).await;
                reap(&table, &job);
            }
        });
        jobs.insert(id, ActiveJob { job, task });
        info!(record_id = id, total_ticks = self.ctx.settings.total_ticks, "accrual job started");
        true
    }

    /// Cancel and forget the job for a deleted record. Returns `false` if
    /// there was none.
    pub fn on_record_deleted(&self, id: RecordId) -> bool {
        let removed = lock_jobs(&self.jobs).remove(&id);
        match removed {
            Some(active) => {
                active.job.cancel();
                true
            }
            None => false,
        }
    }

    /// The live job for `id`, if any.
    pub fn job(&self, id: RecordId) -> Option<Arc<AccrualJob>> {
        lock_jobs(&self.jobs).get(&id).map(|a| a.job.clone())
    }

    /// Number of jobs not yet terminated.
    pub fn active_jobs(&self) -> usize {
        lock_jobs(&self.jobs)
            .values()
            .filter(|a| !a.job.state().is_terminal())
            .count()
    }

    /// Cancel every job and wait for their tasks to exit.
    pub async fn shutdown(&self) {
        let drained: Vec<(RecordId, ActiveJob)> = lock_jobs(&self.jobs).drain().collect();
        if drained.is_empty() {
            return;
        }
        info!(jobs = drained.len(), "stopping accrual jobs");
        for (_, active) in &drained {
            active.job.cancel();
        }
        for (id, active) in drained {
            if let Err(e) = active.task.await {
                warn!(record_id = id, error = %e, "accrual task ended abnormally");
            }
        }
    }
}

// Only removes the entry if it still belongs to `job`; a newer job for the
// same id stays.
fn reap(table: &JobTable, job: &Arc<AccrualJob>) {
    let mut jobs = lock_jobs(table);
    let id = job.record_id();
    if jobs.get(&id).is_some_and(|a| Arc::ptr_eq(&a.job, job)) {
        jobs.remove(&id);
    }
}
