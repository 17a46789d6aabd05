//! Misfire detection and recovery, plus the startup recovery pass.
//!
//! A misfire is a Waiting trigger whose fire time slipped more than the
//! configured threshold into the past. The handler pages through misfired
//! triggers under TRIGGER_ACCESS, applies each trigger's misfire policy,
//! and reports whether another page remains so the caller can re-run
//! immediately.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::delegate::Delegate;
use crate::error::Result;
use crate::lock::LockName;
use crate::store::{JobStore, TxContext};
use crate::trigger::{Trigger, TriggerState};

/// Outcome of one misfire recovery pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoverMisfiresResult {
    /// Triggers whose misfire policy was applied in this pass.
    pub handled: usize,
    /// More misfired triggers remained beyond this page; run again.
    pub has_more: bool,
    /// Earliest new fire time produced by the pass, for the
    /// scheduling-change signal.
    pub earliest_new_time: Option<DateTime<Utc>>,
}

impl<D: Delegate> JobStore<D> {
    /// Instant before which a Waiting trigger's fire time counts as
    /// misfired.
    pub(crate) fn misfire_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let threshold = chrono::Duration::milliseconds(self.config.misfire_threshold_ms as i64);
        let at = now - threshold;
        if at.timestamp_millis() < 0 {
            DateTime::<Utc>::UNIX_EPOCH
        } else {
            at
        }
    }

    /// One pass of the misfire handler.
    ///
    /// With `double_check_lock_misfire_handler` a cheap count outside any
    /// lock skips the pass entirely when nothing misfired. Otherwise the
    /// pass pages through up to `max_misfires_to_handle_at_a_time` Waiting
    /// triggers under TRIGGER_ACCESS and applies each misfire policy. The
    /// scheduling-change signal carries the earliest new fire time.
    pub async fn recover_misfires(&self, cancel: &CancelToken) -> Result<RecoverMisfiresResult> {
        if self.config.double_check_lock_misfire_handler {
            let misfire_time = self.misfire_time(self.now());
            let count = self
                .execute_without_lock(cancel, move |store, ctx| {
                    Box::pin(async move {
                        store
                            .delegate
                            .count_misfired_triggers_in_state(
                                ctx.tx(),
                                TriggerState::Waiting,
                                misfire_time,
                            )
                            .await
                    })
                })
                .await?;
            if count == 0 {
                debug!("no misfired triggers found, skipping recovery pass");
                return Ok(RecoverMisfiresResult::default());
            }
        }

        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, |store, ctx| {
            Box::pin(async move {
                let result = store.recover_misfired_jobs_in_tx(ctx, false).await?;
                if let Some(earliest) = result.earliest_new_time {
                    ctx.signal_on_commit(Some(earliest));
                }
                Ok(result)
            })
        })
        .await
    }

    /// Page through misfired Waiting triggers and apply their policies.
    /// `recovering` lifts the page limit (startup recovery handles every
    /// misfire at once) and marks the stored triggers as recovering.
    pub(crate) async fn recover_misfired_jobs_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        recovering: bool,
    ) -> Result<RecoverMisfiresResult> {
        let limit = if recovering {
            usize::MAX
        } else {
            self.config.max_misfires_to_handle_at_a_time
        };
        let misfire_time = self.misfire_time(self.now());

        let (keys, has_more) = self
            .delegate
            .select_misfired_triggers_in_state(ctx.tx(), TriggerState::Waiting, misfire_time, limit)
            .await?;

        let mut earliest_new_time: Option<DateTime<Utc>> = None;
        let mut handled = 0usize;

        for key in &keys {
            let Some(mut trigger) = self.delegate.select_trigger(ctx.tx(), key).await? else {
                continue;
            };

            let new_time = self
                .misfire_trigger_in_tx(ctx, &mut trigger, TriggerState::Waiting, false, recovering)
                .await?;
            handled += 1;

            if let Some(next) = new_time {
                earliest_new_time = Some(match earliest_new_time {
                    Some(current) => current.min(next),
                    None => next,
                });
            }
        }

        if handled > 0 {
            info!(handled, has_more, "applied misfire policies");
        }
        Ok(RecoverMisfiresResult {
            handled,
            has_more,
            earliest_new_time,
        })
    }

    /// Apply a trigger's misfire policy and store the outcome.
    ///
    /// An exhausted schedule goes to Complete (forced) and the finalized
    /// notification fires; otherwise the trigger is stored in
    /// `state_if_active`. Returns the new fire time, or `None` when the
    /// trigger completed.
    pub(crate) async fn misfire_trigger_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        trigger: &mut Trigger,
        state_if_active: TriggerState,
        force_state: bool,
        recovering: bool,
    ) -> Result<Option<DateTime<Utc>>> {
        let calendar = match &trigger.calendar_name {
            Some(name) => self.retrieve_calendar_in_tx(ctx, name).await?,
            None => None,
        };

        trigger.update_after_misfire(calendar.as_ref(), self.now());
        self.signaler.notify_trigger_listeners_misfired(trigger).await;

        if trigger.next_fire_time.is_none() {
            self.store_trigger_in_tx(
                ctx,
                trigger.clone(),
                None,
                true,
                TriggerState::Complete,
                true,
                recovering,
            )
            .await?;
            self.signaler
                .notify_scheduler_listeners_finalized(trigger)
                .await;
            Ok(None)
        } else {
            self.store_trigger_in_tx(
                ctx,
                trigger.clone(),
                None,
                true,
                state_if_active,
                force_state,
                recovering,
            )
            .await?;
            Ok(trigger.next_fire_time)
        }
    }

    /// Startup recovery: free triggers stranded by a crash, run a full
    /// misfire pass, re-arm recoverable jobs, drop lingering Complete
    /// triggers, and clear this scheduler's execution ledger.
    pub async fn recover_jobs(&self, cancel: &CancelToken) -> Result<()> {
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, |store, ctx| {
            Box::pin(async move { store.recover_jobs_in_tx(ctx).await })
        })
        .await
    }

    pub(crate) async fn recover_jobs_in_tx(&self, ctx: &mut TxContext<D>) -> Result<()> {
        let freed = self
            .delegate
            .update_trigger_states_from_other_states(
                ctx.tx(),
                TriggerState::Waiting,
                &[TriggerState::Acquired, TriggerState::Blocked],
            )
            .await?;
        let unblocked = self
            .delegate
            .update_trigger_states_from_other_states(
                ctx.tx(),
                TriggerState::Paused,
                &[TriggerState::PausedAndBlocked],
            )
            .await?;
        info!(
            freed,
            unblocked, "reset stranded trigger states after restart"
        );

        self.recover_misfired_jobs_in_tx(ctx, true).await?;

        // re-arm triggers of jobs that requested recovery
        let recoverable = self.delegate.select_jobs_requesting_recovery(ctx.tx()).await?;
        for job_key in recoverable {
            let triggers = self
                .delegate
                .select_triggers_for_job(ctx.tx(), &job_key)
                .await?;
            for mut trigger in triggers {
                let calendar = match &trigger.calendar_name {
                    Some(name) => self.retrieve_calendar_in_tx(ctx, name).await?,
                    None => None,
                };
                if trigger.compute_first_fire_time(calendar.as_ref()).is_some() {
                    self.store_trigger_in_tx(
                        ctx,
                        trigger,
                        None,
                        true,
                        TriggerState::Waiting,
                        false,
                        true,
                    )
                    .await?;
                }
            }
        }

        // Complete triggers may linger from a crash during completion
        let complete = self
            .delegate
            .select_triggers_in_state(ctx.tx(), TriggerState::Complete)
            .await?;
        let lingering = complete.len();
        for key in complete {
            self.remove_trigger_in_tx(ctx, &key).await?;
        }

        let cleared = self.delegate.delete_fired_triggers(ctx.tx(), None).await?;
        info!(lingering, cleared, "recovery cleanup finished");
        Ok(())
    }
}
