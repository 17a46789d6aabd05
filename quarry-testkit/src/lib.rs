//! Test fixtures for quarry: an in-memory delegate, a recording signaler,
//! and a programmable clock.
//!
//! The in-memory delegate keeps the whole store in process memory and
//! applies every mutation immediately (transactions are not simulated), so
//! tests drive the store's state machine deterministically without a
//! database.

mod clock;
mod delegate;
mod signaler;

pub use clock::ManualClock;
pub use delegate::InMemoryDelegate;
pub use signaler::{RecordingSignaler, SignalEvent};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use quarry::{
    CancelToken, JobDetail, JobKey, JobStore, PermissiveTypeLoader, Schedule, SimpleSchedule,
    StoreConfig, Trigger, TriggerKey,
};

/// Everything a store test needs in one bundle.
pub struct TestHarness {
    pub store: Arc<JobStore<InMemoryDelegate>>,
    pub delegate: Arc<InMemoryDelegate>,
    pub signaler: Arc<RecordingSignaler>,
    pub clock: Arc<ManualClock>,
    pub cancel: CancelToken,
}

impl TestHarness {
    /// Build a store over a fresh in-memory delegate.
    pub async fn new(config: StoreConfig) -> Self {
        let delegate = Arc::new(InMemoryDelegate::new());
        Self::with_delegate(config, delegate).await
    }

    /// Build a store sharing an existing delegate, e.g. to simulate a second
    /// cluster instance over the same back-end.
    pub async fn with_delegate(config: StoreConfig, delegate: Arc<InMemoryDelegate>) -> Self {
        let signaler = Arc::new(RecordingSignaler::new());
        let clock = Arc::new(ManualClock::default());
        let store = JobStore::initialize(
            config,
            Arc::clone(&delegate),
            signaler.clone(),
            Arc::new(PermissiveTypeLoader),
            clock.clone(),
        )
        .await
        .expect("store initialization");
        Self {
            store: Arc::new(store),
            delegate,
            signaler,
            clock,
            cancel: CancelToken::new(),
        }
    }
}

/// A job in the default group with no flags set.
pub fn test_job(name: &str) -> JobDetail {
    JobDetail::new(JobKey::new(name), "testkit.NoopJob")
}

/// A one-shot trigger for `job` firing at `at`.
pub fn one_shot_trigger(name: &str, job: &JobKey, at: DateTime<Utc>) -> Trigger {
    let mut trigger = Trigger::new(
        TriggerKey::new(name),
        job.clone(),
        Schedule::Simple(SimpleSchedule::once()),
        at,
    );
    trigger.compute_first_fire_time(None);
    trigger
}

/// A repeating trigger for `job` starting at `at`.
pub fn repeating_trigger(
    name: &str,
    job: &JobKey,
    at: DateTime<Utc>,
    interval: chrono::Duration,
    count: Option<u32>,
) -> Trigger {
    let mut trigger = Trigger::new(
        TriggerKey::new(name),
        job.clone(),
        Schedule::Simple(SimpleSchedule::repeating(interval, count)),
        at,
    );
    trigger.compute_first_fire_time(None);
    trigger
}

/// Epoch-based instant helper for readable test times.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).expect("valid timestamp")
}
