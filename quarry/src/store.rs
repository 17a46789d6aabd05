use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::calendar::Calendar;
use crate::cancel::CancelToken;
use crate::config::StoreConfig;
use crate::delegate::{Delegate, SchedulerLifecycle};
use crate::error::{Result, StoreError};
use crate::fired::{FireInstanceId, FiredState};
use crate::job::JobDetail;
use crate::key::{
    validate_component, validate_job_key, validate_trigger_key, GroupMatcher, JobKey, TriggerKey,
    ALL_GROUPS_PAUSED,
};
use crate::lock::{LockManager, LockName, MonitorLockManager, RequestorId, SessionLockManager};
use crate::signaler::{Clock, Signaler, TypeLoader};
use crate::trigger::{ExternalTriggerState, Trigger, TriggerState};

/// Instruction reported by the scheduler runtime when an execution finishes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum CompletedExecutionInstruction {
    /// Leave the trigger in whatever state the fire left it.
    #[default]
    NoInstruction,
    /// Remove the trigger, unless a reschedule during execution gave it a
    /// future fire time.
    DeleteTrigger,
    /// Transition the trigger to Complete.
    SetTriggerComplete,
    /// Transition the trigger to Error.
    SetTriggerError,
    /// Transition every trigger of the job to Complete.
    SetAllJobTriggersComplete,
    /// Transition every trigger of the job to Error.
    SetAllJobTriggersError,
}

impl CompletedExecutionInstruction {
    /// Stable identifier used in logs and spans.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoInstruction => "no-instruction",
            Self::DeleteTrigger => "delete-trigger",
            Self::SetTriggerComplete => "set-trigger-complete",
            Self::SetTriggerError => "set-trigger-error",
            Self::SetAllJobTriggersComplete => "set-all-job-triggers-complete",
            Self::SetAllJobTriggersError => "set-all-job-triggers-error",
        }
    }
}

/// Per-transaction context handed to runner work closures.
///
/// Carries the open back-end transaction and accumulates the
/// scheduling-change signal requested during the transaction. When several
/// subroutines request a signal, the earliest non-null candidate wins; a
/// `None` candidate means "immediately" and beats every concrete time.
pub struct TxContext<D: Delegate> {
    tx: D::Tx,
    signal: Option<Option<DateTime<Utc>>>,
    cancel: CancelToken,
    locks: Arc<dyn LockManager<D::Tx>>,
    requestor: RequestorId,
    held: Vec<LockName>,
}

impl<D: Delegate> TxContext<D> {
    fn new(
        tx: D::Tx,
        cancel: CancelToken,
        locks: Arc<dyn LockManager<D::Tx>>,
        requestor: RequestorId,
    ) -> Self {
        Self {
            tx,
            signal: None,
            cancel,
            locks,
            requestor,
            held: Vec::new(),
        }
    }

    /// The open back-end transaction.
    pub fn tx(&mut self) -> &mut D::Tx {
        &mut self.tx
    }

    /// Cancellation token for this operation.
    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    /// Obtain an additional named lock within this transaction. Locks must
    /// be taken in declaration order (STATE_ACCESS before TRIGGER_ACCESS);
    /// the runner releases them in reverse order when the transaction ends.
    pub async fn obtain_lock(&mut self, lock: LockName) -> Result<()> {
        let cancel = self.cancel.clone();
        let newly = self
            .locks
            .obtain(&mut self.tx, lock, self.requestor, &cancel)
            .await?;
        if newly {
            self.held.push(lock);
        }
        Ok(())
    }

    /// Request a scheduling-change signal once this transaction commits.
    pub fn signal_on_commit(&mut self, candidate: Option<DateTime<Utc>>) {
        self.signal = Some(match self.signal.take() {
            None => candidate,
            Some(previous) => match (previous, candidate) {
                (None, _) | (_, None) => None,
                (Some(a), Some(b)) => Some(a.min(b)),
            },
        });
    }

    fn into_parts(self) -> (D::Tx, Option<Option<DateTime<Utc>>>, Vec<LockName>) {
        (self.tx, self.signal, self.held)
    }
}

/// Post-commit validator: re-queries the back-end after a failed commit to
/// detect the "commit actually succeeded before the error" scenario.
pub type TxValidator<'v, D, T> = Box<
    dyn for<'a> FnOnce(
            &'a JobStore<D>,
            &'a mut TxContext<D>,
            &'a T,
        ) -> BoxFuture<'a, Result<bool>>
        + Send
        + 'v,
>;

/// Clustered persistent trigger/job store.
///
/// The store owns the lifecycle of triggers and jobs, persists them through
/// a [`Delegate`], and coordinates scheduler instances sharing that back-end
/// so that each scheduled fire executes on exactly one instance, with
/// recovery when an instance dies mid-execution. All cross-call state other
/// than the shutdown flag, the first-check-in flag, and the unclustered
/// calendar cache is derived from the back-end inside a transaction.
pub struct JobStore<D: Delegate> {
    pub(crate) config: StoreConfig,
    pub(crate) delegate: Arc<D>,
    pub(crate) locks: Arc<dyn LockManager<D::Tx>>,
    pub(crate) signaler: Arc<dyn Signaler>,
    pub(crate) type_loader: Arc<dyn TypeLoader>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) shutdown: CancelToken,
    pub(crate) fire_counter: AtomicU64,
    pub(crate) first_check_in: AtomicBool,
    pub(crate) last_checkin: Mutex<DateTime<Utc>>,
    calendar_cache: Option<Mutex<HashMap<String, Calendar>>>,
}

impl<D: Delegate> JobStore<D> {
    /// Initialize the store: validate configuration, select the lock
    /// manager, and write the scheduler record.
    ///
    /// When clustering is enabled the store-backed lock manager is
    /// mandatory and the calendar cache is disabled.
    pub async fn initialize(
        config: StoreConfig,
        delegate: Arc<D>,
        signaler: Arc<dyn Signaler>,
        type_loader: Arc<dyn TypeLoader>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let locks: Arc<dyn LockManager<D::Tx>> = if config.requires_session_locks() {
            Arc::new(SessionLockManager::new(Arc::clone(&delegate)))
        } else {
            Arc::new(MonitorLockManager::new())
        };

        let calendar_cache = if config.clustered {
            None
        } else {
            Some(Mutex::new(HashMap::new()))
        };

        let now = clock.now();
        let store = Self {
            config,
            delegate,
            locks,
            signaler,
            type_loader,
            clock,
            shutdown: CancelToken::new(),
            fire_counter: AtomicU64::new(now.timestamp_millis().max(0) as u64),
            first_check_in: AtomicBool::new(true),
            last_checkin: Mutex::new(now),
            calendar_cache,
        };

        let cancel = CancelToken::new();
        store
            .execute_without_lock(&cancel, |store, ctx| {
                Box::pin(async move {
                    store
                        .delegate
                        .set_scheduler_lifecycle(ctx.tx(), SchedulerLifecycle::Initialized)
                        .await
                })
            })
            .await?;

        Ok(store)
    }

    /// The store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// A clone of the delegate handle.
    pub fn delegate(&self) -> Arc<D> {
        Arc::clone(&self.delegate)
    }

    /// A clone of the signaler handle.
    pub fn signaler(&self) -> Arc<dyn Signaler> {
        Arc::clone(&self.signaler)
    }

    /// Whether `shutdown` has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled by `shutdown`; housekeeping loops select on it.
    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn next_fire_instance_id(&self) -> FireInstanceId {
        let counter = self.fire_counter.fetch_add(1, Ordering::SeqCst);
        FireInstanceId::compose(&self.config.instance_id, counter)
    }

    // ---- transaction runner -------------------------------------------------

    /// Run `work` in a transaction without any named lock.
    pub async fn execute_without_lock<T, F>(&self, cancel: &CancelToken, work: F) -> Result<T>
    where
        T: Send,
        F: for<'a> FnOnce(&'a Self, &'a mut TxContext<D>) -> BoxFuture<'a, Result<T>> + Send,
    {
        self.execute_validated(None, cancel, work, None).await
    }

    /// Run `work` in a transaction under the named lock (or none).
    ///
    /// The lock is obtained after the transaction opens, released after it
    /// ends, and any accumulated scheduling-change signal is delivered only
    /// after a successful commit.
    pub async fn execute_in_lock<T, F>(
        &self,
        lock: Option<LockName>,
        cancel: &CancelToken,
        work: F,
    ) -> Result<T>
    where
        T: Send,
        F: for<'a> FnOnce(&'a Self, &'a mut TxContext<D>) -> BoxFuture<'a, Result<T>> + Send,
    {
        self.execute_validated(lock, cancel, work, None).await
    }

    pub(crate) async fn execute_validated<T, F>(
        &self,
        lock: Option<LockName>,
        cancel: &CancelToken,
        work: F,
        validator: Option<TxValidator<'_, D, T>>,
    ) -> Result<T>
    where
        T: Send,
        F: for<'a> FnOnce(&'a Self, &'a mut TxContext<D>) -> BoxFuture<'a, Result<T>> + Send,
    {
        cancel.check()?;
        let requestor = RequestorId::new();
        let tx = self
            .delegate
            .begin(self.config.isolation_level, cancel.clone())
            .await?;
        let mut ctx = TxContext::new(tx, cancel.clone(), Arc::clone(&self.locks), requestor);

        if let Some(name) = lock {
            if let Err(err) = ctx.obtain_lock(name).await {
                let (tx, _, held) = ctx.into_parts();
                if let Err(rb) = self.delegate.rollback(tx).await {
                    warn!(lock = %name, "rollback after failed lock obtain: {rb}");
                }
                self.release_locks(held, requestor).await;
                return Err(err);
            }
        }

        match work(self, &mut ctx).await {
            Ok(value) => {
                let (tx, signal, held) = ctx.into_parts();
                let committed = self.delegate.commit(tx).await;
                self.release_locks(held, requestor).await;

                match committed {
                    Ok(()) => {
                        if let Some(candidate) = signal {
                            self.signaler.signal_scheduling_change(candidate).await;
                        }
                        Ok(value)
                    }
                    Err(commit_err) => {
                        if let Some(validate) = validator {
                            if self.commit_landed(cancel, &value, validate).await {
                                debug!("commit error but state validated; treating as success");
                                if let Some(candidate) = signal {
                                    self.signaler.signal_scheduling_change(candidate).await;
                                }
                                return Ok(value);
                            }
                        }
                        Err(Self::as_persistence("commit failed", commit_err))
                    }
                }
            }
            Err(err) => {
                let (tx, _, held) = ctx.into_parts();
                if let Err(rb) = self.delegate.rollback(tx).await {
                    warn!("rollback failed: {rb}");
                }
                self.release_locks(held, requestor).await;

                if err.passes_through_runner() {
                    Err(err)
                } else {
                    Err(Self::as_persistence("store operation failed", err))
                }
            }
        }
    }

    /// Release held locks in reverse acquisition order.
    async fn release_locks(&self, held: Vec<LockName>, requestor: RequestorId) {
        for name in held.into_iter().rev() {
            if let Err(err) = self.locks.release(name, requestor).await {
                warn!(lock = %name, "lock release failed: {err}");
            }
        }
    }

    /// Run the post-commit validator in a fresh transaction; `true` means
    /// the failed commit had in fact landed.
    async fn commit_landed<T: Send>(
        &self,
        cancel: &CancelToken,
        value: &T,
        validate: TxValidator<'_, D, T>,
    ) -> bool {
        let tx = match self
            .delegate
            .begin(self.config.isolation_level, cancel.clone())
            .await
        {
            Ok(tx) => tx,
            Err(_) => return false,
        };
        let mut ctx = TxContext::new(
            tx,
            cancel.clone(),
            Arc::clone(&self.locks),
            RequestorId::new(),
        );
        let verdict = validate(self, &mut ctx, value).await;
        let (tx, _, _) = ctx.into_parts();
        let _ = self.delegate.rollback(tx).await;
        matches!(verdict, Ok(true))
    }

    fn as_persistence(message: &str, err: StoreError) -> StoreError {
        match err {
            already @ StoreError::Persistence { .. } => already,
            other => StoreError::persistence_caused(message, other),
        }
    }

    /// Record one failure of an indefinitely-retried action, logging only at
    /// multiples of the configured threshold to keep a flapping back-end
    /// from flooding the log.
    pub(crate) fn note_retry_failure(
        &self,
        op: &'static str,
        failures: &mut u32,
        err: &StoreError,
    ) {
        *failures = failures.saturating_add(1);
        if *failures % self.config.retryable_action_error_log_threshold.max(1) == 1 {
            warn!(op, failures = *failures, "retryable action failed: {err}");
        }
    }

    /// Sleep `db_retry_interval_ms` between retry attempts, aborting early
    /// on shutdown or cancellation.
    pub(crate) async fn retry_pause(&self, cancel: &CancelToken) -> Result<()> {
        let backoff = std::time::Duration::from_millis(self.config.db_retry_interval_ms);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => Ok(()),
            _ = self.shutdown.cancelled() => {
                Err(StoreError::persistence("store shut down during retry"))
            }
            _ = cancel.cancelled() => Err(StoreError::Cancelled),
        }
    }

    // ---- lifecycle ----------------------------------------------------------

    /// The scheduler runtime has started. Unclustered stores recover their
    /// own in-flight work immediately; clustered stores leave recovery to
    /// the first cluster check-in.
    pub async fn scheduler_started(&self, cancel: &CancelToken) -> Result<()> {
        if !self.config.clustered {
            self.recover_jobs(cancel).await?;
        }
        self.set_lifecycle(cancel, SchedulerLifecycle::Started).await
    }

    /// The scheduler runtime paused dispatching.
    pub async fn scheduler_paused(&self, cancel: &CancelToken) -> Result<()> {
        self.set_lifecycle(cancel, SchedulerLifecycle::Paused).await
    }

    /// The scheduler runtime resumed dispatching.
    pub async fn scheduler_resumed(&self, cancel: &CancelToken) -> Result<()> {
        self.set_lifecycle(cancel, SchedulerLifecycle::Resumed).await
    }

    /// Shut the store down: retry loops stop, housekeeping loops exit, and
    /// the scheduler record transitions to Shutdown.
    pub async fn shutdown(&self, cancel: &CancelToken) -> Result<()> {
        self.shutdown.cancel();
        self.set_lifecycle(cancel, SchedulerLifecycle::Shutdown).await
    }

    async fn set_lifecycle(
        &self,
        cancel: &CancelToken,
        lifecycle: SchedulerLifecycle,
    ) -> Result<()> {
        self.execute_without_lock(cancel, move |store, ctx| {
            Box::pin(async move {
                store
                    .delegate
                    .set_scheduler_lifecycle(ctx.tx(), lifecycle)
                    .await
            })
        })
        .await
    }

    // ---- job CRUD -----------------------------------------------------------

    /// Store a job, replacing any existing job with the same key when
    /// `replace_existing` is set.
    pub async fn store_job(
        &self,
        cancel: &CancelToken,
        job: &JobDetail,
        replace_existing: bool,
    ) -> Result<()> {
        validate_job_key(&job.key)?;
        let job = job.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move { store.store_job_in_tx(ctx, &job, replace_existing).await })
        })
        .await
    }

    pub(crate) async fn store_job_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        job: &JobDetail,
        replace_existing: bool,
    ) -> Result<()> {
        let exists = self.delegate.job_exists(ctx.tx(), &job.key).await?;
        if exists && !replace_existing {
            return Err(StoreError::already_exists("job", &job.key));
        }
        if exists {
            self.delegate.update_job(ctx.tx(), job).await
        } else {
            self.delegate.insert_job(ctx.tx(), job).await
        }
    }

    /// Store a job and its first trigger in one transaction.
    pub async fn store_job_and_trigger(
        &self,
        cancel: &CancelToken,
        job: &JobDetail,
        trigger: &Trigger,
    ) -> Result<()> {
        validate_job_key(&job.key)?;
        validate_trigger_key(&trigger.key)?;
        let job = job.clone();
        let trigger = trigger.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move {
                store.store_job_in_tx(ctx, &job, false).await?;
                store
                    .store_trigger_in_tx(
                        ctx,
                        trigger,
                        Some(&job),
                        false,
                        TriggerState::Waiting,
                        false,
                        false,
                    )
                    .await
            })
        })
        .await
    }

    /// Remove a job and all of its triggers. Returns whether the job
    /// existed.
    pub async fn remove_job(&self, cancel: &CancelToken, key: &JobKey) -> Result<bool> {
        let key = key.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move {
                let triggers = store
                    .delegate
                    .select_trigger_keys_for_job(ctx.tx(), &key)
                    .await?;
                for trigger_key in triggers {
                    store.delegate.delete_trigger(ctx.tx(), &trigger_key).await?;
                }
                store.delegate.delete_job(ctx.tx(), &key).await
            })
        })
        .await
    }

    /// Retrieve a job by key.
    pub async fn retrieve_job(
        &self,
        cancel: &CancelToken,
        key: &JobKey,
    ) -> Result<Option<JobDetail>> {
        let key = key.clone();
        self.execute_without_lock(cancel, move |store, ctx| {
            Box::pin(async move { store.delegate.select_job(ctx.tx(), &key).await })
        })
        .await
    }

    // ---- trigger CRUD -------------------------------------------------------

    /// Store a trigger. The requested `state` is subject to the paused-group
    /// and blocked checks unless `force_state` is set.
    pub async fn store_trigger(
        &self,
        cancel: &CancelToken,
        trigger: &Trigger,
        replace_existing: bool,
        state: TriggerState,
        force_state: bool,
        recovering: bool,
    ) -> Result<()> {
        validate_trigger_key(&trigger.key)?;
        validate_job_key(&trigger.job_key)?;
        let trigger = trigger.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move {
                store
                    .store_trigger_in_tx(
                        ctx,
                        trigger,
                        None,
                        replace_existing,
                        state,
                        force_state,
                        recovering,
                    )
                    .await
            })
        })
        .await
    }

    /// Transactional body of `store_trigger`; also invoked by the fire and
    /// recovery paths that already hold TRIGGER_ACCESS.
    pub(crate) async fn store_trigger_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        trigger: Trigger,
        job: Option<&JobDetail>,
        replace_existing: bool,
        state: TriggerState,
        force_state: bool,
        recovering: bool,
    ) -> Result<()> {
        let exists = self.delegate.trigger_exists(ctx.tx(), &trigger.key).await?;
        if exists && !replace_existing {
            return Err(StoreError::already_exists("trigger", &trigger.key));
        }

        let mut state = state;
        if !force_state {
            let mut should_be_paused = self
                .delegate
                .is_trigger_group_paused(ctx.tx(), &trigger.key.group)
                .await?;

            if !should_be_paused {
                should_be_paused = self
                    .delegate
                    .is_trigger_group_paused(ctx.tx(), ALL_GROUPS_PAUSED)
                    .await?;
                if should_be_paused {
                    // the all-groups sentinel pauses this group individually
                    self.delegate
                        .insert_paused_trigger_group(ctx.tx(), &trigger.key.group)
                        .await?;
                }
            }

            if !should_be_paused {
                should_be_paused = self
                    .delegate
                    .is_job_group_paused(ctx.tx(), &trigger.job_key.group)
                    .await?;
            }

            if should_be_paused && matches!(state, TriggerState::Waiting | TriggerState::Acquired)
            {
                state = TriggerState::Paused;
            }
        }

        let owned_job = match job {
            Some(job) => job.clone(),
            None => self
                .delegate
                .select_job(ctx.tx(), &trigger.job_key)
                .await?
                .ok_or_else(|| StoreError::no_such("job", &trigger.job_key))?,
        };

        if owned_job.concurrent_execution_disallowed && !recovering {
            state = self.check_blocked_state(ctx, &owned_job.key, state).await?;
        }

        if exists {
            self.delegate.update_trigger(ctx.tx(), &trigger).await?;
            self.delegate
                .update_trigger_state(ctx.tx(), &trigger.key, state)
                .await
        } else {
            self.delegate.insert_trigger(ctx.tx(), &trigger, state).await
        }
    }

    /// Upgrade a target state when the trigger's job forbids concurrent
    /// execution and a peer fire is already executing: Waiting becomes
    /// Blocked and Paused becomes PausedAndBlocked. Every other state passes
    /// through.
    pub(crate) async fn check_blocked_state(
        &self,
        ctx: &mut TxContext<D>,
        job_key: &JobKey,
        state: TriggerState,
    ) -> Result<TriggerState> {
        if !matches!(state, TriggerState::Waiting | TriggerState::Paused) {
            return Ok(state);
        }

        let fired = self
            .delegate
            .select_fired_trigger_records_for_job(ctx.tx(), job_key)
            .await?;
        let executing = fired.iter().any(|record| record.state != FiredState::Acquired);

        if !executing {
            return Ok(state);
        }

        Ok(match state {
            TriggerState::Waiting => TriggerState::Blocked,
            TriggerState::Paused => TriggerState::PausedAndBlocked,
            other => other,
        })
    }

    /// Remove a trigger; a non-durable job left without triggers is removed
    /// as a cascade, announced through the signaler.
    pub async fn remove_trigger(&self, cancel: &CancelToken, key: &TriggerKey) -> Result<bool> {
        let key = key.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move { store.remove_trigger_in_tx(ctx, &key).await })
        })
        .await
    }

    pub(crate) async fn remove_trigger_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        key: &TriggerKey,
    ) -> Result<bool> {
        let Some(trigger) = self.delegate.select_trigger(ctx.tx(), key).await? else {
            return Ok(false);
        };

        let removed = self.delegate.delete_trigger(ctx.tx(), key).await?;
        if !removed {
            return Ok(false);
        }

        if let Some(job) = self.delegate.select_job(ctx.tx(), &trigger.job_key).await? {
            let remaining = self
                .delegate
                .count_triggers_for_job(ctx.tx(), &job.key)
                .await?;
            if remaining == 0 && !job.durable {
                self.delegate.delete_job(ctx.tx(), &job.key).await?;
                self.signaler
                    .notify_scheduler_listeners_job_deleted(&job.key)
                    .await;
            }
        }

        Ok(true)
    }

    /// Replace a trigger with a new one bound to the same job. Returns
    /// whether the old trigger existed.
    pub async fn replace_trigger(
        &self,
        cancel: &CancelToken,
        key: &TriggerKey,
        new_trigger: &Trigger,
    ) -> Result<bool> {
        validate_trigger_key(&new_trigger.key)?;
        let key = key.clone();
        let new_trigger = new_trigger.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move {
                let Some(old) = store.delegate.select_trigger(ctx.tx(), &key).await? else {
                    return Ok(false);
                };
                if old.job_key != new_trigger.job_key {
                    return Err(StoreError::configuration(
                        "replacement trigger must relate to the same job",
                    ));
                }

                store.delegate.delete_trigger(ctx.tx(), &key).await?;
                store
                    .store_trigger_in_tx(
                        ctx,
                        new_trigger,
                        None,
                        false,
                        TriggerState::Waiting,
                        false,
                        false,
                    )
                    .await?;
                Ok(true)
            })
        })
        .await
    }

    /// Retrieve a trigger by key.
    pub async fn retrieve_trigger(
        &self,
        cancel: &CancelToken,
        key: &TriggerKey,
    ) -> Result<Option<Trigger>> {
        let key = key.clone();
        self.execute_without_lock(cancel, move |store, ctx| {
            Box::pin(async move { store.delegate.select_trigger(ctx.tx(), &key).await })
        })
        .await
    }

    /// Collapsed external view of a trigger's state.
    pub async fn get_trigger_state(
        &self,
        cancel: &CancelToken,
        key: &TriggerKey,
    ) -> Result<ExternalTriggerState> {
        let key = key.clone();
        let state = self
            .execute_without_lock(cancel, move |store, ctx| {
                Box::pin(async move { store.delegate.select_trigger_state(ctx.tx(), &key).await })
            })
            .await?;
        Ok(ExternalTriggerState::from(state))
    }

    // ---- calendars ----------------------------------------------------------

    /// Store a calendar. With `update_triggers`, every trigger referencing
    /// the calendar has its next fire time re-evaluated against the new
    /// exclusions.
    pub async fn store_calendar(
        &self,
        cancel: &CancelToken,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> Result<()> {
        validate_component("calendar name", name)?;
        let name_owned = name.to_string();
        let calendar_owned = calendar.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            let name = name_owned;
            let calendar = calendar_owned;
            Box::pin(async move {
                let exists = store.delegate.calendar_exists(ctx.tx(), &name).await?;
                if exists && !replace_existing {
                    return Err(StoreError::already_exists("calendar", &name));
                }

                if exists {
                    store
                        .delegate
                        .update_calendar(ctx.tx(), &name, &calendar)
                        .await?;
                } else {
                    store
                        .delegate
                        .insert_calendar(ctx.tx(), &name, &calendar)
                        .await?;
                }

                if exists && update_triggers {
                    let referencing = store
                        .delegate
                        .select_triggers_for_calendar(ctx.tx(), &name)
                        .await?;
                    for key in referencing {
                        let Some(mut trigger) =
                            store.delegate.select_trigger(ctx.tx(), &key).await?
                        else {
                            continue;
                        };
                        if let Some(next) = trigger.next_fire_time {
                            if !calendar.is_time_included(next) {
                                trigger.next_fire_time =
                                    trigger.fire_time_after(Some(next), Some(&calendar));
                                store.delegate.update_trigger(ctx.tx(), &trigger).await?;
                            }
                        }
                    }
                }
                Ok(())
            })
        })
        .await?;

        if let Some(cache) = &self.calendar_cache {
            cache
                .lock()
                .await
                .insert(name.to_string(), calendar.clone());
        }
        Ok(())
    }

    /// Remove a calendar. Fails while any trigger still references it.
    pub async fn remove_calendar(&self, cancel: &CancelToken, name: &str) -> Result<bool> {
        let name_owned = name.to_string();
        let removed = self
            .execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
                let name = name_owned;
                Box::pin(async move {
                    if store.delegate.calendar_is_referenced(ctx.tx(), &name).await? {
                        return Err(StoreError::persistence(format!(
                            "calendar '{name}' cannot be removed while triggers reference it"
                        )));
                    }
                    store.delegate.delete_calendar(ctx.tx(), &name).await
                })
            })
            .await?;

        if let Some(cache) = &self.calendar_cache {
            cache.lock().await.remove(name);
        }
        Ok(removed)
    }

    /// Retrieve a calendar, consulting the unclustered cache first.
    pub async fn retrieve_calendar(
        &self,
        cancel: &CancelToken,
        name: &str,
    ) -> Result<Option<Calendar>> {
        if let Some(cache) = &self.calendar_cache {
            if let Some(found) = cache.lock().await.get(name) {
                return Ok(Some(found.clone()));
            }
        }

        let name_owned = name.to_string();
        let loaded = self
            .execute_without_lock(cancel, move |store, ctx| {
                let name = name_owned;
                Box::pin(async move { store.delegate.select_calendar(ctx.tx(), &name).await })
            })
            .await?;

        if let (Some(cache), Some(calendar)) = (&self.calendar_cache, &loaded) {
            cache
                .lock()
                .await
                .insert(name.to_string(), calendar.clone());
        }
        Ok(loaded)
    }

    /// Calendar lookup inside an already-open transaction, still serving
    /// from the unclustered cache when possible.
    pub(crate) async fn retrieve_calendar_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        name: &str,
    ) -> Result<Option<Calendar>> {
        if let Some(cache) = &self.calendar_cache {
            if let Some(found) = cache.lock().await.get(name) {
                return Ok(Some(found.clone()));
            }
        }
        let loaded = self.delegate.select_calendar(ctx.tx(), name).await?;
        if let (Some(cache), Some(calendar)) = (&self.calendar_cache, &loaded) {
            cache
                .lock()
                .await
                .insert(name.to_string(), calendar.clone());
        }
        Ok(loaded)
    }

    // ---- listings and counts ------------------------------------------------

    /// Number of stored jobs.
    pub async fn get_number_of_jobs(&self, cancel: &CancelToken) -> Result<usize> {
        self.execute_without_lock(cancel, |store, ctx| {
            Box::pin(async move { store.delegate.count_jobs(ctx.tx()).await })
        })
        .await
    }

    /// Number of stored triggers.
    pub async fn get_number_of_triggers(&self, cancel: &CancelToken) -> Result<usize> {
        self.execute_without_lock(cancel, |store, ctx| {
            Box::pin(async move { store.delegate.count_triggers(ctx.tx()).await })
        })
        .await
    }

    /// Number of stored calendars.
    pub async fn get_number_of_calendars(&self, cancel: &CancelToken) -> Result<usize> {
        self.execute_without_lock(cancel, |store, ctx| {
            Box::pin(async move { store.delegate.count_calendars(ctx.tx()).await })
        })
        .await
    }

    /// Keys of jobs whose group satisfies the matcher.
    pub async fn get_job_keys(
        &self,
        cancel: &CancelToken,
        matcher: &GroupMatcher,
    ) -> Result<Vec<JobKey>> {
        let matcher = matcher.clone();
        self.execute_without_lock(cancel, move |store, ctx| {
            Box::pin(async move { store.delegate.select_job_keys(ctx.tx(), &matcher).await })
        })
        .await
    }

    /// Keys of triggers whose group satisfies the matcher.
    pub async fn get_trigger_keys(
        &self,
        cancel: &CancelToken,
        matcher: &GroupMatcher,
    ) -> Result<Vec<TriggerKey>> {
        let matcher = matcher.clone();
        self.execute_without_lock(cancel, move |store, ctx| {
            Box::pin(async move { store.delegate.select_trigger_keys(ctx.tx(), &matcher).await })
        })
        .await
    }

    /// All job group names.
    pub async fn get_job_group_names(&self, cancel: &CancelToken) -> Result<Vec<String>> {
        self.execute_without_lock(cancel, |store, ctx| {
            Box::pin(async move { store.delegate.select_job_groups(ctx.tx()).await })
        })
        .await
    }

    /// All trigger group names.
    pub async fn get_trigger_group_names(&self, cancel: &CancelToken) -> Result<Vec<String>> {
        self.execute_without_lock(cancel, |store, ctx| {
            Box::pin(async move { store.delegate.select_trigger_groups(ctx.tx(), None).await })
        })
        .await
    }

    /// All calendar names.
    pub async fn get_calendar_names(&self, cancel: &CancelToken) -> Result<Vec<String>> {
        self.execute_without_lock(cancel, |store, ctx| {
            Box::pin(async move { store.delegate.select_calendar_names(ctx.tx()).await })
        })
        .await
    }

    /// All triggers bound to the job.
    pub async fn get_triggers_for_job(
        &self,
        cancel: &CancelToken,
        key: &JobKey,
    ) -> Result<Vec<Trigger>> {
        let key = key.clone();
        self.execute_without_lock(cancel, move |store, ctx| {
            Box::pin(async move { store.delegate.select_triggers_for_job(ctx.tx(), &key).await })
        })
        .await
    }

    /// Groups currently carrying a paused marker.
    pub async fn get_paused_trigger_groups(
        &self,
        cancel: &CancelToken,
    ) -> Result<std::collections::HashSet<String>> {
        self.execute_without_lock(cancel, |store, ctx| {
            Box::pin(async move { store.delegate.select_paused_trigger_groups(ctx.tx()).await })
        })
        .await
    }

    /// Delete all jobs, triggers, calendars, fired triggers, and
    /// paused-group markers for this scheduler name.
    pub async fn clear_all_scheduling_data(&self, cancel: &CancelToken) -> Result<()> {
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, |store, ctx| {
            Box::pin(async move { store.delegate.clear_data(ctx.tx()).await })
        })
        .await
    }
}
