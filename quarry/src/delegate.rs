use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::cancel::CancelToken;
use crate::cluster::SchedulerStateRecord;
use crate::config::IsolationLevel;
use crate::error::Result;
use crate::fired::{FireInstanceId, FiredTriggerRecord};
use crate::job::{JobDataMap, JobDetail};
use crate::key::{GroupMatcher, JobKey, TriggerKey};
use crate::lock::LockName;
use crate::trigger::{Trigger, TriggerState};

/// Lifecycle of the scheduler record, one per scheduler name.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SchedulerLifecycle {
    Initialized,
    Started,
    Paused,
    Resumed,
    Shutdown,
}

impl SchedulerLifecycle {
    /// Stable identifier used by back-end delegates.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Started => "STARTED",
            Self::Paused => "PAUSED",
            Self::Resumed => "RESUMED",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

/// Cheap trigger probe: state plus the fields the completion path
/// double-checks before honoring a delete instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct TriggerStatus {
    pub state: TriggerState,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub job_key: JobKey,
}

/// Back-end port: every persistent effect of the store goes through exactly
/// one of these calls.
///
/// Implementations scope every row by the configured scheduler name. The
/// cancellation token passed to [`begin`](Delegate::begin) travels inside
/// the transaction handle; honoring it aborts back-end I/O so the
/// surrounding transaction rolls back with a cancellation error. The
/// delegate executes lock-row primitives on request but never manages lock
/// ownership itself.
#[async_trait]
pub trait Delegate: Send + Sync + 'static {
    /// Open transaction handle. Dropped handles roll back.
    type Tx: Send;

    async fn begin(&self, isolation: IsolationLevel, cancel: CancelToken) -> Result<Self::Tx>;
    async fn commit(&self, tx: Self::Tx) -> Result<()>;
    async fn rollback(&self, tx: Self::Tx) -> Result<()>;

    /// Take the store-backed lock row for `lock` within this transaction.
    /// The row lock is released when the transaction commits or rolls back.
    async fn lock_row(&self, tx: &mut Self::Tx, lock: LockName) -> Result<()>;

    // ---- existence probes ----

    async fn job_exists(&self, tx: &mut Self::Tx, key: &JobKey) -> Result<bool>;
    async fn trigger_exists(&self, tx: &mut Self::Tx, key: &TriggerKey) -> Result<bool>;
    async fn calendar_exists(&self, tx: &mut Self::Tx, name: &str) -> Result<bool>;
    async fn calendar_is_referenced(&self, tx: &mut Self::Tx, name: &str) -> Result<bool>;

    // ---- single-record reads ----

    async fn select_job(&self, tx: &mut Self::Tx, key: &JobKey) -> Result<Option<JobDetail>>;
    async fn select_trigger(&self, tx: &mut Self::Tx, key: &TriggerKey) -> Result<Option<Trigger>>;
    async fn select_trigger_state(
        &self,
        tx: &mut Self::Tx,
        key: &TriggerKey,
    ) -> Result<Option<TriggerState>>;
    async fn select_trigger_status(
        &self,
        tx: &mut Self::Tx,
        key: &TriggerKey,
    ) -> Result<Option<TriggerStatus>>;
    async fn select_trigger_job_data(
        &self,
        tx: &mut Self::Tx,
        key: &TriggerKey,
    ) -> Result<Option<JobDataMap>>;
    async fn select_calendar(&self, tx: &mut Self::Tx, name: &str) -> Result<Option<Calendar>>;

    // ---- set reads ----

    async fn select_triggers_for_job(
        &self,
        tx: &mut Self::Tx,
        job: &JobKey,
    ) -> Result<Vec<Trigger>>;
    async fn select_trigger_keys_for_job(
        &self,
        tx: &mut Self::Tx,
        job: &JobKey,
    ) -> Result<Vec<TriggerKey>>;
    async fn count_triggers_for_job(&self, tx: &mut Self::Tx, job: &JobKey) -> Result<usize>;
    async fn select_triggers_for_calendar(
        &self,
        tx: &mut Self::Tx,
        name: &str,
    ) -> Result<Vec<TriggerKey>>;
    async fn select_triggers_in_state(
        &self,
        tx: &mut Self::Tx,
        state: TriggerState,
    ) -> Result<Vec<TriggerKey>>;

    /// Keys of Waiting triggers with `no_earlier_than < next_fire_time <=
    /// no_later_than`, ordered by `next_fire_time` ascending then priority
    /// descending, at most `max_count`.
    async fn select_triggers_to_acquire(
        &self,
        tx: &mut Self::Tx,
        no_later_than: DateTime<Utc>,
        no_earlier_than: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<TriggerKey>>;

    async fn select_job_keys(
        &self,
        tx: &mut Self::Tx,
        matcher: &GroupMatcher,
    ) -> Result<Vec<JobKey>>;
    async fn select_trigger_keys(
        &self,
        tx: &mut Self::Tx,
        matcher: &GroupMatcher,
    ) -> Result<Vec<TriggerKey>>;
    async fn select_job_groups(&self, tx: &mut Self::Tx) -> Result<Vec<String>>;
    async fn select_trigger_groups(
        &self,
        tx: &mut Self::Tx,
        matcher: Option<&GroupMatcher>,
    ) -> Result<Vec<String>>;
    async fn select_calendar_names(&self, tx: &mut Self::Tx) -> Result<Vec<String>>;

    async fn count_jobs(&self, tx: &mut Self::Tx) -> Result<usize>;
    async fn count_triggers(&self, tx: &mut Self::Tx) -> Result<usize>;
    async fn count_calendars(&self, tx: &mut Self::Tx) -> Result<usize>;

    /// Jobs flagged `requests_recovery`, scanned by startup recovery.
    async fn select_jobs_requesting_recovery(&self, tx: &mut Self::Tx) -> Result<Vec<JobKey>>;

    // ---- misfire scans ----

    async fn count_misfired_triggers_in_state(
        &self,
        tx: &mut Self::Tx,
        state: TriggerState,
        before: DateTime<Utc>,
    ) -> Result<usize>;

    /// Up to `limit` misfired trigger keys in `state` with
    /// `next_fire_time < before`, ordered like the acquire query. The bool
    /// reports whether more rows remained beyond the page.
    async fn select_misfired_triggers_in_state(
        &self,
        tx: &mut Self::Tx,
        state: TriggerState,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<(Vec<TriggerKey>, bool)>;

    // ---- fired-trigger ledger ----

    async fn insert_fired_trigger(
        &self,
        tx: &mut Self::Tx,
        record: &FiredTriggerRecord,
    ) -> Result<()>;
    async fn update_fired_trigger(
        &self,
        tx: &mut Self::Tx,
        record: &FiredTriggerRecord,
    ) -> Result<()>;
    async fn select_fired_trigger_records(
        &self,
        tx: &mut Self::Tx,
        key: &TriggerKey,
    ) -> Result<Vec<FiredTriggerRecord>>;
    async fn select_fired_trigger_records_for_job(
        &self,
        tx: &mut Self::Tx,
        job: &JobKey,
    ) -> Result<Vec<FiredTriggerRecord>>;
    async fn select_instance_fired_trigger_records(
        &self,
        tx: &mut Self::Tx,
        instance_id: &str,
    ) -> Result<Vec<FiredTriggerRecord>>;
    async fn select_fired_trigger_instance_ids(
        &self,
        tx: &mut Self::Tx,
    ) -> Result<HashSet<String>>;
    async fn delete_fired_trigger(
        &self,
        tx: &mut Self::Tx,
        fire_instance_id: &FireInstanceId,
    ) -> Result<bool>;
    /// Delete fired rows for one instance, or for every instance of this
    /// scheduler when `instance_id` is `None`.
    async fn delete_fired_triggers(
        &self,
        tx: &mut Self::Tx,
        instance_id: Option<&str>,
    ) -> Result<u64>;

    // ---- record mutations ----

    async fn insert_job(&self, tx: &mut Self::Tx, job: &JobDetail) -> Result<()>;
    async fn update_job(&self, tx: &mut Self::Tx, job: &JobDetail) -> Result<()>;
    async fn update_job_data(
        &self,
        tx: &mut Self::Tx,
        key: &JobKey,
        data: &JobDataMap,
    ) -> Result<()>;
    async fn delete_job(&self, tx: &mut Self::Tx, key: &JobKey) -> Result<bool>;

    async fn insert_trigger(
        &self,
        tx: &mut Self::Tx,
        trigger: &Trigger,
        state: TriggerState,
    ) -> Result<()>;
    async fn update_trigger(&self, tx: &mut Self::Tx, trigger: &Trigger) -> Result<()>;
    async fn delete_trigger(&self, tx: &mut Self::Tx, key: &TriggerKey) -> Result<bool>;

    async fn insert_calendar(&self, tx: &mut Self::Tx, name: &str, cal: &Calendar) -> Result<()>;
    async fn update_calendar(&self, tx: &mut Self::Tx, name: &str, cal: &Calendar) -> Result<()>;
    async fn delete_calendar(&self, tx: &mut Self::Tx, name: &str) -> Result<bool>;

    // ---- state transitions ----

    async fn update_trigger_state(
        &self,
        tx: &mut Self::Tx,
        key: &TriggerKey,
        new_state: TriggerState,
    ) -> Result<()>;

    /// Compare-and-set; returns rows affected (0 when the state moved on).
    async fn update_trigger_state_from_other_state(
        &self,
        tx: &mut Self::Tx,
        key: &TriggerKey,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<u64>;

    async fn update_trigger_states_from_other_states(
        &self,
        tx: &mut Self::Tx,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<u64>;

    async fn update_trigger_group_states_from_other_states(
        &self,
        tx: &mut Self::Tx,
        matcher: &GroupMatcher,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<u64>;

    async fn update_trigger_states_for_job(
        &self,
        tx: &mut Self::Tx,
        job: &JobKey,
        new_state: TriggerState,
    ) -> Result<u64>;

    async fn update_trigger_states_for_job_from_other_state(
        &self,
        tx: &mut Self::Tx,
        job: &JobKey,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<u64>;

    // ---- paused-group markers ----

    async fn insert_paused_trigger_group(&self, tx: &mut Self::Tx, group: &str) -> Result<()>;
    async fn delete_paused_trigger_group(&self, tx: &mut Self::Tx, group: &str) -> Result<bool>;
    async fn select_paused_trigger_groups(&self, tx: &mut Self::Tx) -> Result<HashSet<String>>;
    async fn is_trigger_group_paused(&self, tx: &mut Self::Tx, group: &str) -> Result<bool>;

    async fn insert_paused_job_group(&self, tx: &mut Self::Tx, group: &str) -> Result<()>;
    async fn delete_paused_job_group(&self, tx: &mut Self::Tx, group: &str) -> Result<bool>;
    async fn select_paused_job_groups(&self, tx: &mut Self::Tx) -> Result<HashSet<String>>;
    async fn is_job_group_paused(&self, tx: &mut Self::Tx, group: &str) -> Result<bool>;

    // ---- scheduler records ----

    /// Upsert the single scheduler record's lifecycle state.
    async fn set_scheduler_lifecycle(
        &self,
        tx: &mut Self::Tx,
        lifecycle: SchedulerLifecycle,
    ) -> Result<()>;

    async fn insert_scheduler_state(
        &self,
        tx: &mut Self::Tx,
        record: &SchedulerStateRecord,
    ) -> Result<()>;
    /// Refresh this instance's check-in timestamp; returns rows affected.
    async fn update_scheduler_state(
        &self,
        tx: &mut Self::Tx,
        instance_id: &str,
        last_checkin: DateTime<Utc>,
    ) -> Result<u64>;
    async fn delete_scheduler_state(&self, tx: &mut Self::Tx, instance_id: &str) -> Result<u64>;
    async fn select_scheduler_state_records(
        &self,
        tx: &mut Self::Tx,
        instance_id: Option<&str>,
    ) -> Result<Vec<SchedulerStateRecord>>;

    /// Bulk delete of all jobs, triggers, calendars, fired triggers, and
    /// paused-group markers for this scheduler name.
    async fn clear_data(&self, tx: &mut Self::Tx) -> Result<()>;
}
