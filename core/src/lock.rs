use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::record::RecordId;

/// Who holds a record lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    /// A user-facing mutation (update, delete, create).
    Api,
    /// An accrual job tick.
    Job,
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Holder::Api => write!(f, "api"),
            Holder::Job => write!(f, "job"),
        }
    }
}

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    // Holders plus waiters; the slot is dropped when this reaches zero.
    users: usize,
}

type SlotTable = Arc<Mutex<HashMap<RecordId, Slot>>>;

fn lock_table(table: &SlotTable) -> MutexGuard<'_, HashMap<RecordId, Slot>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-record mutual exclusion.
///
/// Locks are created lazily per record id and forgotten once nobody holds or
/// waits for them. Waiters for the same id are served in FIFO order, so all
/// lock-holding operations on one record are totally ordered. Distinct ids
/// never contend. Not reentrant: acquiring an id you already hold deadlocks
/// (or reports busy with a timeout).
#[derive(Clone, Default)]
pub struct RecordLockManager {
    slots: SlotTable,
}

/// Registration of interest in one slot; keeps the slot alive until dropped.
struct Lease {
    id: RecordId,
    mutex: Arc<AsyncMutex<()>>,
    slots: SlotTable,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut slots = lock_table(&self.slots);
        if let Some(slot) = slots.get_mut(&self.id) {
            slot.users -= 1;
            if slot.users == 0 {
                slots.remove(&self.id);
            }
        }
    }
}

/// Scoped ownership of one record's lock; released on drop.
pub struct RecordGuard {
    id: RecordId,
    holder: Holder,
    _guard: OwnedMutexGuard<()>,
    _lease: Lease,
}

impl RecordGuard {
    /// Record this guard protects.
    pub fn record_id(&self) -> RecordId {
        self.id
    }

    /// Kind of caller holding the lock.
    pub fn holder(&self) -> Holder {
        self.holder
    }
}

impl fmt::Debug for RecordGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordGuard")
            .field("id", &self.id)
            .field("holder", &self.holder)
            .finish()
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        trace!(record_id = self.id, holder = %self.holder, "record lock released");
    }
}

impl RecordLockManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn lease(&self, id: RecordId) -> Lease {
        let mut slots = lock_table(&self.slots);
        let slot = slots.entry(id).or_insert_with(|| Slot {
            mutex: Arc::new(AsyncMutex::new(())),
            users: 0,
        });
        slot.users += 1;
        Lease { id, mutex: slot.mutex.clone(), slots: self.slots.clone() }
    }

    /// Wait until the lock for `id` is free and take it.
    ///
    /// Dropping the returned future gives up the place in the queue.
    pub async fn acquire(&self, id: RecordId, holder: Holder) -> RecordGuard {
        let lease = self.lease(id);
        let guard = lease.mutex.clone().lock_owned().await;
        trace!(record_id = id, %holder, "record lock acquired");
        RecordGuard { id, holder, _guard: guard, _lease: lease }
    }

    /// Take the lock for `id` only if it is free right now.
    pub fn try_acquire(&self, id: RecordId, holder: Holder) -> Result<RecordGuard> {
        let lease = self.lease(id);
        match lease.mutex.clone().try_lock_owned() {
            Ok(guard) => Ok(RecordGuard { id, holder, _guard: guard, _lease: lease }),
            Err(_) => Err(Error::Busy(id)),
        }
    }

    /// Bounded-wait acquisition for user-facing mutations.
    ///
    /// Returns [`Error::Busy`] if the lock is not obtained within `timeout`.
    pub async fn acquire_for_mutation(&self, id: RecordId, timeout: Duration) -> Result<RecordGuard> {
        match tokio::time::timeout(timeout, self.acquire(id, Holder::Api)).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                debug!(record_id = id, ?timeout, "record lock busy");
                Err(Error::Busy(id))
            }
        }
    }

    /// Whether someone currently holds the lock for `id`.
    pub fn is_locked(&self, id: RecordId) -> bool {
        let slots = lock_table(&self.slots);
        slots
            .get(&id)
            .map(|slot| slot.mutex.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of record ids with a live lock slot (held or awaited).
    pub fn tracked(&self) -> usize {
        lock_table(&self.slots).len()
    }
}
