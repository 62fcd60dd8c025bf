use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use points_core::store::{Kv, MemKv};
use points_core::{
    AccrualSettings, Error, JobState, NewRecord, PeopleService, PointsSource, RecordChanges, SequencePoints,
    UniformPoints,
};

const MINUTE: Duration = Duration::from_secs(60);
const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// MemKv whose writes (all of them, or only the index) can be switched to fail.
#[derive(Clone, Default)]
struct FlakyKv {
    inner: MemKv,
    fail_puts: Arc<AtomicBool>,
    fail_index: Arc<AtomicBool>,
}

impl Kv for FlakyKv {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn put(&self, key: &[u8], val: &[u8]) -> anyhow::Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        if key == b"people:index" && self.fail_index.load(Ordering::SeqCst) {
            anyhow::bail!("index write failed");
        }
        self.inner.put(key, val)
    }
    fn delete(&self, key: &[u8]) -> anyhow::Result<bool> {
        self.inner.delete(key)
    }
}

fn service_with<P: PointsSource>(points: P) -> PeopleService<MemKv> {
    PeopleService::new(MemKv::new(), AccrualSettings::default(), Arc::new(points), LOCK_TIMEOUT)
}

fn flaky_service() -> (FlakyKv, PeopleService<FlakyKv>) {
    let kv = FlakyKv::default();
    let service = PeopleService::new(
        kv.clone(),
        AccrualSettings::default(),
        Arc::new(SequencePoints::new([4])),
        LOCK_TIMEOUT,
    );
    (kv, service)
}

fn person(points: u64) -> NewRecord {
    NewRecord {
        name: "A".into(),
        surname: "B".into(),
        birthday: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
        points: Some(points),
    }
}

#[tokio::test(start_paused = true)]
async fn ten_minutes_apply_ten_draws() {
    let draws = [3, 7, 1, 9, 4, 4, 2, 8, 5, 6];
    let service = service_with(SequencePoints::new(draws));
    let record = service.create(person(0)).await.unwrap();
    let job = service.scheduler().job(record.id).unwrap();
    assert_eq!(job.state(), JobState::Scheduled);
    let mut progress = job.subscribe();

    for step in 1..=10u32 {
        tokio::time::advance(MINUTE).await;
        progress.wait_for(|p| p.ticks_remaining == 30 - step).await.unwrap();
    }

    let p = job.progress();
    assert_eq!(p.ticks_remaining, 20);
    assert_eq!(p.state, JobState::Running);
    let expected: u64 = draws.iter().map(|&n| u64::from(n)).sum();
    assert_eq!(service.get(record.id).unwrap().points, expected);
    assert_eq!(p.points_accrued, expected);
}

#[tokio::test(start_paused = true)]
async fn surviving_record_gets_exactly_thirty_ticks() {
    let service = service_with(UniformPoints::default());
    let record = service.create(person(0)).await.unwrap();
    let job = service.scheduler().job(record.id).unwrap();

    let done = job.wait_until_terminal().await;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.ticks_applied, 30);
    assert_eq!(done.ticks_remaining, 0);

    let points = service.get(record.id).unwrap().points;
    assert!((30..=270).contains(&points), "{points}");
    assert_eq!(points, done.points_accrued);

    // Nothing else happens afterwards.
    tokio::time::sleep(30 * MINUTE).await;
    assert_eq!(service.get(record.id).unwrap().points, points);
    assert_eq!(service.scheduler().active_jobs(), 0);
}

#[tokio::test(start_paused = true)]
async fn create_then_delete_never_ticks() {
    let service = service_with(UniformPoints::default());
    let record = service.create(person(5)).await.unwrap();
    let job = service.scheduler().job(record.id).unwrap();

    let deleted = service.delete(record.id).await.unwrap();
    assert_eq!(deleted.points, 5);

    let done = job.wait_until_terminal().await;
    assert_eq!(done.state, JobState::Cancelled);
    tokio::time::sleep(31 * MINUTE).await;
    let p = job.progress();
    assert_eq!(p.state, JobState::Cancelled);
    assert_eq!(p.ticks_applied, 0);
    assert_eq!(p.ticks_remaining, 30);
    assert!(service.scheduler().job(record.id).is_none());
    assert!(matches!(service.get(record.id), Err(Error::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn delete_mid_run_stops_further_ticks() {
    let service = service_with(SequencePoints::new([2]));
    let record = service.create(person(0)).await.unwrap();
    let job = service.scheduler().job(record.id).unwrap();
    let mut progress = job.subscribe();

    for step in 1..=5u32 {
        tokio::time::advance(MINUTE).await;
        progress.wait_for(|p| p.ticks_remaining == 30 - step).await.unwrap();
    }
    assert_eq!(service.delete(record.id).await.unwrap().points, 10);

    tokio::time::sleep(30 * MINUTE).await;
    let p = job.progress();
    assert_eq!(p.state, JobState::Cancelled);
    assert_eq!(p.ticks_applied, 5);
    assert_eq!(service.locks().tracked(), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_created_callback_does_not_double_accrue() {
    let service = service_with(SequencePoints::new([1]));
    let record = service.create(person(0)).await.unwrap();
    assert!(!service.scheduler().on_record_created(record.id));
    assert_eq!(service.scheduler().active_jobs(), 1);

    let job = service.scheduler().job(record.id).unwrap();
    job.wait_until_terminal().await;
    assert_eq!(service.get(record.id).unwrap().points, 30);
}

#[tokio::test(start_paused = true)]
async fn updates_and_tick_apply_in_lock_order() {
    let service = service_with(SequencePoints::new([5]));
    let record = service.create(person(0)).await.unwrap();
    let id = record.id;
    let job = service.scheduler().job(id).unwrap();

    // First update holds the lock while the tick comes due.
    let first = service.acquire_for_mutation(id, LOCK_TIMEOUT).await.unwrap();
    tokio::time::advance(MINUTE).await;
    tokio::task::yield_now().await;
    assert_eq!(job.progress().ticks_applied, 0);

    // Queued behind the tick; an absolute write, so running before the
    // tick would leave 205.
    let second = tokio::spawn({
        let service = service.clone();
        async move { service.modify(id, |r| r.points = 200).await }
    });
    tokio::task::yield_now().await;

    let mut current = service.records().get(id).unwrap();
    current.points += 10;
    service.records().put(&first, &current).unwrap();
    drop(first);

    let after_second = second.await.unwrap().unwrap();
    assert_eq!(after_second.points, 200);
    let p = job.subscribe().wait_for(|p| p.ticks_applied == 1).await.unwrap().clone();
    assert_eq!(p.points_accrued, 5);
    assert_eq!(p.ticks_remaining, 29);
    assert_eq!(service.get(id).unwrap().points, 200);
}

#[tokio::test(start_paused = true)]
async fn update_reports_busy_while_a_tick_holds_the_lock() {
    let service = service_with(UniformPoints::default());
    let record = service.create(person(0)).await.unwrap();
    let _tick = service.locks().acquire(record.id, points_core::Holder::Job).await;

    let err = service
        .update(
            record.id,
            RecordChanges {
                name: "C".into(),
                surname: "D".into(),
                birthday: NaiveDate::from_ymd_opt(1999, 12, 31).unwrap(),
                points: 1,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Busy(id) if id == record.id));
    assert_eq!(service.get(record.id).unwrap().name, "A");
}

#[tokio::test(start_paused = true)]
async fn failed_tick_write_still_counts_down() {
    let (kv, service) = flaky_service();
    let record = service.create(person(0)).await.unwrap();
    let job = service.scheduler().job(record.id).unwrap();
    let mut progress = job.subscribe();

    kv.fail_puts.store(true, Ordering::SeqCst);
    tokio::time::advance(MINUTE).await;
    progress.wait_for(|p| p.ticks_remaining == 29).await.unwrap();
    let p = job.progress();
    assert_eq!(p.failed_writes, 1);
    assert_eq!(p.ticks_applied, 0);
    assert_eq!(p.state, JobState::Running);

    // API writes surface the failure and change nothing.
    let err = service.modify(record.id, |r| r.points = 99).await.unwrap_err();
    assert!(matches!(err, Error::PersistenceFailure(_)));
    assert_eq!(service.get(record.id).unwrap().points, 0);

    kv.fail_puts.store(false, Ordering::SeqCst);
    tokio::time::advance(MINUTE).await;
    progress.wait_for(|p| p.ticks_remaining == 28).await.unwrap();
    assert_eq!(service.get(record.id).unwrap().points, 4);
}

#[tokio::test(start_paused = true)]
async fn missing_records_are_not_found() {
    let service = service_with(UniformPoints::default());
    assert!(matches!(service.get(404), Err(Error::NotFound(404))));
    assert!(matches!(service.modify(404, |_| ()).await, Err(Error::NotFound(404))));
    assert!(matches!(service.delete(404).await, Err(Error::NotFound(404))));
    assert_eq!(service.locks().tracked(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_create_leaves_no_record_and_no_job() {
    let (kv, service) = flaky_service();
    kv.fail_index.store(true, Ordering::SeqCst);

    let err = service.create(person(3)).await.unwrap_err();
    assert!(matches!(err, Error::PersistenceFailure(_)));
    assert!(matches!(service.get(1), Err(Error::NotFound(1))));
    assert!(service.list().unwrap().is_empty());
    assert!(service.scheduler().job(1).is_none());
    assert_eq!(service.locks().tracked(), 0);

    kv.fail_index.store(false, Ordering::SeqCst);
    let record = service.create(person(3)).await.unwrap();
    assert_eq!(service.list().unwrap(), vec![record]);
}

#[tokio::test(start_paused = true)]
async fn delete_cancels_the_job_even_if_the_index_write_fails() {
    let (kv, service) = flaky_service();
    let record = service.create(person(0)).await.unwrap();
    let job = service.scheduler().job(record.id).unwrap();

    kv.fail_index.store(true, Ordering::SeqCst);
    assert_eq!(service.delete(record.id).await.unwrap().id, record.id);
    assert_eq!(job.wait_until_terminal().await.state, JobState::Cancelled);
    assert!(matches!(service.get(record.id), Err(Error::NotFound(_))));
    assert!(service.list().unwrap().is_empty());
    assert_eq!(service.scheduler().active_jobs(), 0);
}
