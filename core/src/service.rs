use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::cfg::Config;
use crate::error::Result;
use crate::job::{AccrualContext, AccrualSettings, PointsSource, UniformPoints};
use crate::lock::{Holder, RecordGuard, RecordLockManager};
use crate::record::{NewRecord, Record, RecordChanges, RecordId, Records};
use crate::scheduler::AccrualScheduler;
use crate::store::Kv;

/// Operations backing the people endpoints.
///
/// Every mutation runs under the record's lock; creation and deletion notify
/// the accrual scheduler after the store write succeeded.
pub struct PeopleService<K: Kv> {
    records: Records<K>,
    locks: RecordLockManager,
    scheduler: AccrualScheduler<K>,
    lock_timeout: Duration,
}

impl<K: Kv> Clone for PeopleService<K> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            locks: self.locks.clone(),
            scheduler: self.scheduler.clone(),
            lock_timeout: self.lock_timeout,
        }
    }
}

impl<K: Kv> PeopleService<K> {
    /// Wire a service over `kv`.
    pub fn new(kv: K, settings: AccrualSettings, points: Arc<dyn PointsSource>, lock_timeout: Duration) -> Self {
        let records = Records::new(kv);
        let locks = RecordLockManager::new();
        let scheduler = AccrualScheduler::new(Arc::new(AccrualContext {
            records: records.clone(),
            locks: locks.clone(),
            points,
            settings,
        }));
        Self { records, locks, scheduler, lock_timeout }
    }

    /// Service configured from `config.toml` values.
    pub fn from_config(kv: K, cfg: &Config) -> Self {
        let accrual = &cfg.accrual;
        Self::new(
            kv,
            accrual.settings(),
            Arc::new(UniformPoints::new(accrual.min_points, accrual.max_points)),
            cfg.lock_timeout(),
        )
    }

    /// Record store adapter.
    pub fn records(&self) -> &Records<K> {
        &self.records
    }

    /// Lock manager shared with the accrual jobs.
    pub fn locks(&self) -> &RecordLockManager {
        &self.locks
    }

    /// Accrual scheduler.
    pub fn scheduler(&self) -> &AccrualScheduler<K> {
        &self.scheduler
    }

    /// Wait at most `timeout` for the lock on `id`.
    pub async fn acquire_for_mutation(&self, id: RecordId, timeout: Duration) -> Result<RecordGuard> {
        self.locks.acquire_for_mutation(id, timeout).await
    }

    /// Store a new record and start its accrual. A failed write leaves no
    /// record and starts no job.
    pub async fn create(&self, new: NewRecord) -> Result<Record> {
        let id = self.records.blocking(|records| records.next_id()).await?;
        let record = new.into_record(id);
        let guard = self.locks.acquire(id, Holder::Api).await;
        let stored = record.clone();
        let (guard, ()) = self
            .records
            .blocking_locked(guard, move |records, guard| records.insert(guard, &stored))
            .await?;
        drop(guard);
        self.scheduler.on_record_created(id);
        info!(record_id = id, "record created");
        Ok(record)
    }

    /// Fetch one record.
    pub fn get(&self, id: RecordId) -> Result<Record> {
        self.records.get(id)
    }

    /// All records.
    pub fn list(&self) -> Result<Vec<Record>> {
        self.records.list()
    }

    /// Replace a record's fields.
    pub async fn update(&self, id: RecordId, changes: RecordChanges) -> Result<Record> {
        self.modify(id, move |record| changes.apply(record)).await
    }

    /// Locked read-modify-write of one record. Nothing is stored if the write
    /// fails.
    pub async fn modify<F>(&self, id: RecordId, f: F) -> Result<Record>
    where
        F: FnOnce(&mut Record) + Send + 'static,
    {
        let guard = self.acquire_for_mutation(id, self.lock_timeout).await?;
        let (_guard, record) = self
            .records
            .blocking_locked(guard, move |records, guard| {
                let mut record = records.get(id)?;
                f(&mut record);
                record.id = id;
                records.put(guard, &record)?;
                Ok(record)
            })
            .await?;
        debug!(record_id = id, points = record.points, "record updated");
        Ok(record)
    }

    /// Remove a record and cancel its accrual.
    pub async fn delete(&self, id: RecordId) -> Result<Record> {
        let guard = self.acquire_for_mutation(id, self.lock_timeout).await?;
        let (guard, record) = self
            .records
            .blocking_locked(guard, move |records, guard| {
                let record = records.get(id)?;
                records.delete(guard, id)?;
                Ok(record)
            })
            .await?;
        self.scheduler.on_record_deleted(id);
        drop(guard);
        info!(record_id = id, "record deleted");
        Ok(record)
    }

    /// Stop all accrual jobs.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
