use std::sync::{Arc, Mutex, PoisonError};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tracing::warn;

use crate::error::{invariant_violation, Error, Result};
use crate::lock::RecordGuard;
use crate::store::{ns, Kv, KvSerde};

/// Identifier assigned to a record at creation.
pub type RecordId = u64;

const NS: &str = "people";

/// A stored person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Unique id, assigned by the store.
    pub id: RecordId,
    /// Given name.
    pub name: String,
    /// Family name.
    pub surname: String,
    /// Date of birth.
    pub birthday: NaiveDate,
    /// Accrued points.
    pub points: u64,
}

/// Fields supplied when creating a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    /// Given name.
    pub name: String,
    /// Family name.
    pub surname: String,
    /// Date of birth.
    pub birthday: NaiveDate,
    /// Starting points; zero when absent.
    #[serde(default)]
    pub points: Option<u64>,
}

impl NewRecord {
    /// Attach the assigned id.
    pub fn into_record(self, id: RecordId) -> Record {
        Record {
            id,
            name: self.name,
            surname: self.surname,
            birthday: self.birthday,
            points: self.points.unwrap_or(0),
        }
    }
}

/// Full replacement of a record's mutable fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordChanges {
    /// Given name.
    pub name: String,
    /// Family name.
    pub surname: String,
    /// Date of birth.
    pub birthday: NaiveDate,
    /// New points value.
    pub points: u64,
}

impl RecordChanges {
    /// Overwrite `record` with these values; the id stays.
    pub fn apply(self, record: &mut Record) {
        record.name = self.name;
        record.surname = self.surname;
        record.birthday = self.birthday;
        record.points = self.points;
    }
}

/// Record store adapter over a [`Kv`].
///
/// Reads are lock-free. Every write takes a [`RecordGuard`] for the record it
/// touches; a guard for another id is a contract violation.
#[derive(Clone)]
pub struct Records<K: Kv> {
    kv: K,
    // Serializes the id counter and the index.
    catalog: Arc<Mutex<()>>,
}

fn record_key(id: RecordId) -> Vec<u8> {
    ns(NS, &id.to_string())
}

fn persistence(e: anyhow::Error) -> Error {
    Error::PersistenceFailure(e)
}

impl<K: Kv> Records<K> {
    /// Wrap a KV engine.
    pub fn new(kv: K) -> Self {
        Self { kv, catalog: Arc::new(Mutex::new(())) }
    }

    /// Underlying engine.
    pub fn kv(&self) -> &K {
        &self.kv
    }

    /// Reserve the next unused id.
    pub fn next_id(&self) -> Result<RecordId> {
        let _catalog = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        let key = ns(NS, "next_id");
        let id: RecordId = self.kv.get_t(&key).map_err(persistence)?.unwrap_or(1);
        self.kv.put_t(&key, &(id + 1)).map_err(persistence)?;
        Ok(id)
    }

    /// Fetch a record, `None` if absent.
    pub fn find(&self, id: RecordId) -> Result<Option<Record>> {
        self.kv.get_t(&record_key(id)).map_err(persistence)
    }

    /// Fetch a record or fail with [`Error::NotFound`].
    pub fn get(&self, id: RecordId) -> Result<Record> {
        self.find(id)?.ok_or(Error::NotFound(id))
    }

    /// All records in creation order.
    pub fn list(&self) -> Result<Vec<Record>> {
        let ids = self.ids()?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.find(id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Ids of all stored records.
    pub fn ids(&self) -> Result<Vec<RecordId>> {
        Ok(self.kv.get_t(&ns(NS, "index")).map_err(persistence)?.unwrap_or_default())
    }

    /// Store a freshly created record and register it in the index. If the
    /// index cannot be written the record is removed again.
    pub fn insert(&self, guard: &RecordGuard, record: &Record) -> Result<()> {
        self.put(guard, record)?;
        let _catalog = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        let indexed = self.ids().and_then(|mut ids| {
            if ids.contains(&record.id) {
                return Ok(());
            }
            ids.push(record.id);
            self.kv.put_t(&ns(NS, "index"), &ids).map_err(persistence)
        });
        if let Err(e) = indexed {
            if let Err(undo) = self.kv.delete(&record_key(record.id)) {
                warn!(record_id = record.id, error = %undo, "could not roll back unindexed record");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Overwrite a record. The caller must hold its lock.
    pub fn put(&self, guard: &RecordGuard, record: &Record) -> Result<()> {
        check_guard(guard, record.id)?;
        self.kv.put_t(&record_key(record.id), record).map_err(persistence)
    }

    /// Remove a record. Returns `false` if it was already gone.
    ///
    /// Only the record write can fail the call; a stale index entry is
    /// skipped by [`Records::list`] and is logged instead.
    pub fn delete(&self, guard: &RecordGuard, id: RecordId) -> Result<bool> {
        check_guard(guard, id)?;
        let existed = self.kv.delete(&record_key(id)).map_err(persistence)?;
        let _catalog = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        let unindexed = self.ids().and_then(|mut ids| {
            let before = ids.len();
            ids.retain(|i| *i != id);
            if ids.len() == before {
                return Ok(());
            }
            self.kv.put_t(&ns(NS, "index"), &ids).map_err(persistence)
        });
        if let Err(e) = unindexed {
            warn!(record_id = id, error = %e, "record removed but index not updated");
        }
        Ok(existed)
    }

    /// Run `f` against the store on the blocking pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Records<K>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let records = self.clone();
        join(tokio::task::spawn_blocking(move || f(&records)).await)
    }

    /// Run a locked store operation on the blocking pool. The guard travels
    /// with the closure and comes back with its result, so the caller still
    /// decides when the lock is released. On error the lock is released.
    pub async fn blocking_locked<T, F>(&self, guard: RecordGuard, f: F) -> Result<(RecordGuard, T)>
    where
        F: FnOnce(&Records<K>, &RecordGuard) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let records = self.clone();
        join(
            tokio::task::spawn_blocking(move || {
                let out = f(&records, &guard);
                out.map(|out| (guard, out))
            })
            .await,
        )
    }
}

fn join<T>(res: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    match res {
        Ok(out) => out,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(Error::PersistenceFailure(anyhow::Error::new(e).context("store task"))),
    }
}

fn check_guard(guard: &RecordGuard, id: RecordId) -> Result<()> {
    if guard.record_id() == id {
        Ok(())
    } else {
        Err(invariant_violation(format!(
            "write to record {id} while holding the lock for record {}",
            guard.record_id()
        )))
    }
}
