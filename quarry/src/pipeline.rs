//! The acquire / fire / complete hot path.
//!
//! Acquisition reserves Waiting triggers with a compare-and-set and writes
//! the execution ledger; firing promotes ledger rows to Executing and
//! advances the trigger; completion applies the runtime's instruction code
//! and clears the ledger. Every mutation here runs under TRIGGER_ACCESS
//! (acquisition may run lock-free in the single-trigger unclustered case).

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn, Instrument};

use crate::cancel::CancelToken;
use crate::delegate::Delegate;
use crate::error::{Result, StoreError};
use crate::fired::{FiredBundle, FiredState, FiredTriggerRecord};
use crate::job::JobDetail;
use crate::key::{JobKey, RECOVERY_GROUP};
use crate::lock::LockName;
use crate::store::{CompletedExecutionInstruction, JobStore, TxContext, TxValidator};
use crate::telemetry::{acquire_span, complete_span, fire_span};
use crate::trigger::{Trigger, TriggerState};

/// Restarts of the candidate scan before an empty acquisition is returned.
pub(crate) const MAX_DO_LOOP_RETRY: usize = 3;

impl<D: Delegate> JobStore<D> {
    /// Reserve up to `max_count` triggers due to fire no later than
    /// `no_later_than` (+ `time_window` slack), ordered by fire time then
    /// priority. Reserved triggers transition Waiting → Acquired and gain a
    /// fire instance id and an Acquired ledger row.
    ///
    /// For jobs that disallow concurrent execution at most one trigger per
    /// job is returned per call.
    pub async fn acquire_next_triggers(
        &self,
        cancel: &CancelToken,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let lock = if self.config.clustered
            || max_count > 1
            || self.config.acquire_triggers_within_lock
        {
            Some(LockName::TriggerAccess)
        } else {
            None
        };

        // A relational driver can report a commit failure after the commit
        // landed; the acquisition is real iff every trigger is Acquired with
        // its ledger row present.
        let validator: TxValidator<'_, D, Vec<Trigger>> = Box::new(|store, ctx, acquired| {
            Box::pin(async move {
                if acquired.is_empty() {
                    return Ok(false);
                }
                for trigger in acquired {
                    let state = store
                        .delegate
                        .select_trigger_state(ctx.tx(), &trigger.key)
                        .await?;
                    if state != Some(TriggerState::Acquired) {
                        return Ok(false);
                    }
                    let Some(fire_id) = &trigger.fire_instance_id else {
                        return Ok(false);
                    };
                    let ledger = store
                        .delegate
                        .select_fired_trigger_records(ctx.tx(), &trigger.key)
                        .await?;
                    if !ledger.iter().any(|r| &r.fire_instance_id == fire_id) {
                        return Ok(false);
                    }
                }
                Ok(true)
            })
        });

        self.execute_validated(
            lock,
            cancel,
            move |store, ctx| {
                Box::pin(async move {
                    store
                        .acquire_next_triggers_in_tx(ctx, no_later_than, max_count, time_window)
                        .await
                })
            },
            Some(validator),
        )
        .instrument(acquire_span(&self.config.instance_id, max_count))
        .await
    }

    async fn acquire_next_triggers_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>> {
        let now = self.now();
        let misfire_time = self.misfire_time(now);
        let deadline = no_later_than + time_window;

        let mut acquired: Vec<Trigger> = Vec::new();
        let mut claimed_jobs: HashSet<JobKey> = HashSet::new();

        for _restart in 0..MAX_DO_LOOP_RETRY {
            let keys = self
                .delegate
                .select_triggers_to_acquire(ctx.tx(), deadline, misfire_time, max_count)
                .await?;
            if keys.is_empty() {
                return Ok(acquired);
            }

            let mut batch_end = no_later_than;

            for key in keys {
                if acquired.len() >= max_count {
                    break;
                }

                let Some(mut trigger) = self.delegate.select_trigger(ctx.tx(), &key).await?
                else {
                    continue;
                };
                let Some(mut next) = trigger.next_fire_time else {
                    continue;
                };

                // the threshold may have been crossed between the candidate
                // query and this load; apply the policy here rather than
                // leaving the trigger to the background handler
                if next <= self.misfire_time(self.now()) {
                    match self
                        .misfire_trigger_in_tx(
                            ctx,
                            &mut trigger,
                            TriggerState::Waiting,
                            false,
                            false,
                        )
                        .await?
                    {
                        Some(updated) => next = updated,
                        None => continue,
                    }
                }

                if next > batch_end {
                    break;
                }

                let job = match self.delegate.select_job(ctx.tx(), &trigger.job_key).await {
                    Ok(Some(job)) => match self.type_loader.resolve_job_type(&job.job_type) {
                        Ok(()) => job,
                        Err(err) => {
                            warn!(trigger = %key, "job type unresolvable, marking trigger errored: {err}");
                            self.delegate
                                .update_trigger_state(ctx.tx(), &key, TriggerState::Error)
                                .await?;
                            continue;
                        }
                    },
                    Ok(None) => {
                        warn!(trigger = %key, job = %trigger.job_key, "job missing, marking trigger errored");
                        self.delegate
                            .update_trigger_state(ctx.tx(), &key, TriggerState::Error)
                            .await?;
                        continue;
                    }
                    Err(err) => {
                        warn!(trigger = %key, "job load failed, marking trigger errored: {err}");
                        self.delegate
                            .update_trigger_state(ctx.tx(), &key, TriggerState::Error)
                            .await?;
                        continue;
                    }
                };

                if job.concurrent_execution_disallowed {
                    if claimed_jobs.contains(&job.key) {
                        continue;
                    }
                    claimed_jobs.insert(job.key.clone());
                }

                let rows = self
                    .delegate
                    .update_trigger_state_from_other_state(
                        ctx.tx(),
                        &key,
                        TriggerState::Acquired,
                        TriggerState::Waiting,
                    )
                    .await?;
                if rows == 0 {
                    // lost the race against a peer holding no lock
                    continue;
                }

                let fire_id = self.next_fire_instance_id();
                trigger.fire_instance_id = Some(fire_id.clone());

                let record = FiredTriggerRecord {
                    fire_instance_id: fire_id,
                    instance_id: self.config.instance_id.clone(),
                    trigger_key: trigger.key.clone(),
                    job_key: job.key.clone(),
                    state: FiredState::Acquired,
                    priority: trigger.priority,
                    fired_at: now,
                    scheduled_at: trigger.next_fire_time,
                    is_non_concurrent: job.concurrent_execution_disallowed,
                    requests_recovery: job.requests_recovery,
                    job_data: None,
                };
                self.delegate.insert_fired_trigger(ctx.tx(), &record).await?;

                if acquired.is_empty() {
                    batch_end = now.max(next) + time_window;
                }
                acquired.push(trigger);
            }

            if !acquired.is_empty() {
                break;
            }
        }

        debug!(count = acquired.len(), "acquired triggers");
        Ok(acquired)
    }

    /// Report that acquired triggers are about to fire. For each trigger
    /// still in Acquired: the ledger row turns Executing with a job-data
    /// snapshot, the trigger advances per its schedule, and the post-fire
    /// state is stored. Triggers paused, deleted, or misfired since
    /// acquisition are skipped and yield no bundle.
    pub async fn triggers_fired(
        &self,
        cancel: &CancelToken,
        triggers: Vec<Trigger>,
    ) -> Result<Vec<FiredBundle>> {
        let validator: TxValidator<'_, D, Vec<FiredBundle>> = Box::new(|store, ctx, bundles| {
            Box::pin(async move {
                if bundles.is_empty() {
                    return Ok(false);
                }
                for bundle in bundles {
                    let Some(fire_id) = &bundle.trigger.fire_instance_id else {
                        return Ok(false);
                    };
                    let ledger = store
                        .delegate
                        .select_fired_trigger_records(ctx.tx(), &bundle.trigger.key)
                        .await?;
                    let promoted = ledger.iter().any(|r| {
                        &r.fire_instance_id == fire_id && r.state == FiredState::Executing
                    });
                    if !promoted {
                        return Ok(false);
                    }
                }
                Ok(true)
            })
        });

        self.execute_validated(
            Some(LockName::TriggerAccess),
            cancel,
            move |store, ctx| {
                Box::pin(async move {
                    let mut bundles = Vec::with_capacity(triggers.len());
                    for trigger in &triggers {
                        let span = fire_span(&trigger.key);
                        if let Some(bundle) = store
                            .trigger_fired_in_tx(ctx, trigger)
                            .instrument(span)
                            .await?
                        {
                            bundles.push(bundle);
                        }
                    }
                    Ok(bundles)
                })
            },
            Some(validator),
        )
        .await
    }

    async fn trigger_fired_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        trigger: &Trigger,
    ) -> Result<Option<FiredBundle>> {
        let state = self
            .delegate
            .select_trigger_state(ctx.tx(), &trigger.key)
            .await?;
        if state != Some(TriggerState::Acquired) {
            debug!(trigger = %trigger.key, ?state, "not acquired anymore, skipping fire");
            return Ok(None);
        }

        let Some(fire_id) = trigger.fire_instance_id.clone() else {
            debug!(trigger = %trigger.key, "no fire instance id, skipping fire");
            return Ok(None);
        };

        let calendar = match &trigger.calendar_name {
            Some(name) => match self.retrieve_calendar_in_tx(ctx, name).await? {
                Some(calendar) => Some(calendar),
                None => {
                    warn!(trigger = %trigger.key, calendar = %name, "calendar vanished, skipping fire");
                    return Ok(None);
                }
            },
            None => None,
        };

        let Some(job) = self.delegate.select_job(ctx.tx(), &trigger.job_key).await? else {
            debug!(trigger = %trigger.key, "job vanished, skipping fire");
            return Ok(None);
        };

        let now = self.now();
        let mut trigger = trigger.clone();
        let scheduled_fire_time = trigger.next_fire_time;
        let previous_fire_time = trigger.previous_fire_time;
        trigger.triggered(calendar.as_ref());

        let record = FiredTriggerRecord {
            fire_instance_id: fire_id,
            instance_id: self.config.instance_id.clone(),
            trigger_key: trigger.key.clone(),
            job_key: job.key.clone(),
            state: FiredState::Executing,
            priority: trigger.priority,
            fired_at: now,
            scheduled_at: scheduled_fire_time,
            is_non_concurrent: job.concurrent_execution_disallowed,
            requests_recovery: job.requests_recovery,
            job_data: Some(job.data.clone()),
        };
        self.delegate.update_fired_trigger(ctx.tx(), &record).await?;

        let (post_state, force) = if trigger.next_fire_time.is_none() {
            (TriggerState::Complete, true)
        } else if job.concurrent_execution_disallowed {
            (TriggerState::Blocked, false)
        } else {
            (TriggerState::Waiting, false)
        };

        self.store_trigger_in_tx(ctx, trigger.clone(), Some(&job), true, post_state, force, false)
            .await?;

        if job.concurrent_execution_disallowed {
            self.delegate
                .update_trigger_states_for_job_from_other_state(
                    ctx.tx(),
                    &job.key,
                    TriggerState::Blocked,
                    TriggerState::Waiting,
                )
                .await?;
            self.delegate
                .update_trigger_states_for_job_from_other_state(
                    ctx.tx(),
                    &job.key,
                    TriggerState::Blocked,
                    TriggerState::Acquired,
                )
                .await?;
            self.delegate
                .update_trigger_states_for_job_from_other_state(
                    ctx.tx(),
                    &job.key,
                    TriggerState::PausedAndBlocked,
                    TriggerState::Paused,
                )
                .await?;
        }

        let recovering = trigger.key.group == RECOVERY_GROUP;
        let next_fire_time = trigger.next_fire_time;
        Ok(Some(FiredBundle {
            job,
            trigger,
            calendar,
            recovering,
            fire_time: now,
            scheduled_fire_time,
            previous_fire_time,
            next_fire_time,
        }))
    }

    /// Record the completion of an execution. Retries until it succeeds or
    /// the store shuts down; the completion path must not lose state to a
    /// transient back-end fault.
    pub async fn triggered_job_complete(
        &self,
        cancel: &CancelToken,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        let mut failures = 0u32;
        loop {
            let span = complete_span(&trigger.key, instruction.as_str());
            let trigger = trigger.clone();
            let job = job.clone();
            let attempt = self
                .execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
                    Box::pin(async move {
                        store
                            .triggered_job_complete_in_tx(ctx, &trigger, &job, instruction)
                            .await
                    })
                })
                .instrument(span)
                .await;

            match attempt {
                Ok(()) => return Ok(()),
                Err(StoreError::Cancelled) => return Err(StoreError::Cancelled),
                Err(err) => {
                    self.note_retry_failure("triggered_job_complete", &mut failures, &err);
                    if self.is_shutdown() {
                        return Err(err);
                    }
                    self.retry_pause(cancel).await.map_err(|_| err)?;
                }
            }
        }
    }

    async fn triggered_job_complete_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        if job.concurrent_execution_disallowed {
            self.delegate
                .update_trigger_states_for_job_from_other_state(
                    ctx.tx(),
                    &job.key,
                    TriggerState::Waiting,
                    TriggerState::Blocked,
                )
                .await?;
            self.delegate
                .update_trigger_states_for_job_from_other_state(
                    ctx.tx(),
                    &job.key,
                    TriggerState::Paused,
                    TriggerState::PausedAndBlocked,
                )
                .await?;
            ctx.signal_on_commit(None);
        }

        match instruction {
            CompletedExecutionInstruction::NoInstruction => {}
            CompletedExecutionInstruction::DeleteTrigger => {
                if trigger.next_fire_time.is_none() {
                    // A reschedule during execution gives the stored copy a
                    // future fire time; that overrides the delete.
                    match self
                        .delegate
                        .select_trigger_status(ctx.tx(), &trigger.key)
                        .await?
                    {
                        Some(status) if status.next_fire_time.is_none() => {
                            self.remove_trigger_in_tx(ctx, &trigger.key).await?;
                        }
                        Some(_) => {
                            debug!(trigger = %trigger.key, "delete deferred to rescheduled trigger");
                        }
                        None => {}
                    }
                } else {
                    self.remove_trigger_in_tx(ctx, &trigger.key).await?;
                    ctx.signal_on_commit(None);
                }
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                self.delegate
                    .update_trigger_state(ctx.tx(), &trigger.key, TriggerState::Complete)
                    .await?;
                ctx.signal_on_commit(None);
            }
            CompletedExecutionInstruction::SetTriggerError => {
                warn!(trigger = %trigger.key, "execution reported trigger error");
                self.delegate
                    .update_trigger_state(ctx.tx(), &trigger.key, TriggerState::Error)
                    .await?;
                ctx.signal_on_commit(None);
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                self.delegate
                    .update_trigger_states_for_job(ctx.tx(), &job.key, TriggerState::Complete)
                    .await?;
                ctx.signal_on_commit(None);
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                warn!(job = %job.key, "execution reported error for all job triggers");
                self.delegate
                    .update_trigger_states_for_job(ctx.tx(), &job.key, TriggerState::Error)
                    .await?;
                ctx.signal_on_commit(None);
            }
        }

        if job.persist_data_after_execution {
            self.delegate
                .update_job_data(ctx.tx(), &job.key, &job.data)
                .await?;
        }

        if let Some(fire_id) = &trigger.fire_instance_id {
            // false means a peer already removed the row; that is fine
            self.delegate.delete_fired_trigger(ctx.tx(), fire_id).await?;
        }

        Ok(())
    }

    /// Hand back an acquired trigger without firing it: compare-and-set
    /// Acquired → Waiting and drop the ledger row. Retried until shutdown.
    pub async fn release_acquired_trigger(
        &self,
        cancel: &CancelToken,
        trigger: &Trigger,
    ) -> Result<()> {
        let mut failures = 0u32;
        loop {
            let trigger = trigger.clone();
            let attempt = self
                .execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
                    Box::pin(async move {
                        store
                            .delegate
                            .update_trigger_state_from_other_state(
                                ctx.tx(),
                                &trigger.key,
                                TriggerState::Waiting,
                                TriggerState::Acquired,
                            )
                            .await?;
                        if let Some(fire_id) = &trigger.fire_instance_id {
                            store.delegate.delete_fired_trigger(ctx.tx(), fire_id).await?;
                        }
                        Ok(())
                    })
                })
                .await;

            match attempt {
                Ok(()) => return Ok(()),
                Err(StoreError::Cancelled) => return Err(StoreError::Cancelled),
                Err(err) => {
                    self.note_retry_failure("release_acquired_trigger", &mut failures, &err);
                    if self.is_shutdown() {
                        return Err(err);
                    }
                    self.retry_pause(cancel).await.map_err(|_| err)?;
                }
            }
        }
    }
}
