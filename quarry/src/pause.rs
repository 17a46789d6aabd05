//! Pausing and resuming triggers, trigger groups, jobs, and job groups.
//!
//! Group pauses insert a persistent marker so that triggers stored into the
//! group later also land paused; the `_$_ALL_GROUPS_PAUSED_$_` sentinel
//! extends that to every group. All mutating variants run under
//! TRIGGER_ACCESS.

use std::collections::HashSet;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::delegate::Delegate;
use crate::error::Result;
use crate::key::{GroupMatcher, JobKey, TriggerKey, ALL_GROUPS_PAUSED};
use crate::lock::LockName;
use crate::store::{JobStore, TxContext};
use crate::trigger::TriggerState;

impl<D: Delegate> JobStore<D> {
    /// Pause one trigger: Waiting or Acquired becomes Paused, Blocked
    /// becomes PausedAndBlocked; other states are untouched.
    pub async fn pause_trigger(&self, cancel: &CancelToken, key: &TriggerKey) -> Result<()> {
        let key = key.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move { store.pause_trigger_in_tx(ctx, &key).await })
        })
        .await
    }

    pub(crate) async fn pause_trigger_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        key: &TriggerKey,
    ) -> Result<()> {
        let Some(state) = self.delegate.select_trigger_state(ctx.tx(), key).await? else {
            return Ok(());
        };

        match state {
            TriggerState::Waiting | TriggerState::Acquired => {
                self.delegate
                    .update_trigger_state(ctx.tx(), key, TriggerState::Paused)
                    .await
            }
            TriggerState::Blocked => {
                self.delegate
                    .update_trigger_state(ctx.tx(), key, TriggerState::PausedAndBlocked)
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Pause every trigger group matched by the matcher and mark each group
    /// paused. An exact-match group is marked even when it holds no trigger
    /// yet, so future inserts land paused. Returns the affected group names.
    pub async fn pause_triggers(
        &self,
        cancel: &CancelToken,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>> {
        let matcher = matcher.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move { store.pause_trigger_groups_in_tx(ctx, &matcher).await })
        })
        .await
    }

    pub(crate) async fn pause_trigger_groups_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>> {
        let mut groups = self
            .delegate
            .select_trigger_groups(ctx.tx(), Some(matcher))
            .await?;
        if let Some(exact) = matcher.exact() {
            if !groups.iter().any(|g| g == exact) {
                groups.push(exact.to_string());
            }
        }

        for group in &groups {
            let scoped = GroupMatcher::Equals(group.clone());
            self.delegate
                .update_trigger_group_states_from_other_states(
                    ctx.tx(),
                    &scoped,
                    TriggerState::Paused,
                    &[TriggerState::Waiting, TriggerState::Acquired],
                )
                .await?;
            self.delegate
                .update_trigger_group_states_from_other_states(
                    ctx.tx(),
                    &scoped,
                    TriggerState::PausedAndBlocked,
                    &[TriggerState::Blocked],
                )
                .await?;
            if !self.delegate.is_trigger_group_paused(ctx.tx(), group).await? {
                self.delegate
                    .insert_paused_trigger_group(ctx.tx(), group)
                    .await?;
            }
        }

        debug!(?groups, "paused trigger groups");
        Ok(groups)
    }

    /// Resume one trigger. The target state honors the blocked check, and a
    /// fire time missed while paused goes through the misfire policy before
    /// the trigger re-enters rotation.
    pub async fn resume_trigger(&self, cancel: &CancelToken, key: &TriggerKey) -> Result<()> {
        let key = key.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move { store.resume_trigger_in_tx(ctx, &key).await })
        })
        .await
    }

    pub(crate) async fn resume_trigger_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        key: &TriggerKey,
    ) -> Result<()> {
        let Some(state) = self.delegate.select_trigger_state(ctx.tx(), key).await? else {
            return Ok(());
        };
        if !state.is_paused() {
            return Ok(());
        }
        let Some(mut trigger) = self.delegate.select_trigger(ctx.tx(), key).await? else {
            return Ok(());
        };

        let job_key = trigger.job_key.clone();
        let new_state = self
            .check_blocked_state(ctx, &job_key, TriggerState::Waiting)
            .await?;

        let misfired = trigger
            .next_fire_time
            .map(|next| next < self.now())
            .unwrap_or(false);

        if misfired {
            self.misfire_trigger_in_tx(ctx, &mut trigger, new_state, true, false)
                .await?;
        } else {
            self.delegate
                .update_trigger_state_from_other_state(
                    ctx.tx(),
                    key,
                    new_state,
                    TriggerState::Paused,
                )
                .await?;
            self.delegate
                .update_trigger_state_from_other_state(
                    ctx.tx(),
                    key,
                    new_state,
                    TriggerState::PausedAndBlocked,
                )
                .await?;
        }
        Ok(())
    }

    /// Resume every trigger group matched by the matcher, clearing the
    /// paused markers. Returns the affected group names.
    pub async fn resume_triggers(
        &self,
        cancel: &CancelToken,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>> {
        let matcher = matcher.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move { store.resume_trigger_groups_in_tx(ctx, &matcher).await })
        })
        .await
    }

    pub(crate) async fn resume_trigger_groups_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>> {
        let mut groups = self
            .delegate
            .select_trigger_groups(ctx.tx(), Some(matcher))
            .await?;
        if let Some(exact) = matcher.exact() {
            if !groups.iter().any(|g| g == exact) {
                groups.push(exact.to_string());
            }
        }

        for group in &groups {
            self.delegate
                .delete_paused_trigger_group(ctx.tx(), group)
                .await?;
        }

        let keys = self.delegate.select_trigger_keys(ctx.tx(), matcher).await?;
        for key in keys {
            self.resume_trigger_in_tx(ctx, &key).await?;
        }

        debug!(?groups, "resumed trigger groups");
        Ok(groups)
    }

    /// Pause every trigger of the job.
    pub async fn pause_job(&self, cancel: &CancelToken, key: &JobKey) -> Result<()> {
        let key = key.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move {
                let triggers = store
                    .delegate
                    .select_trigger_keys_for_job(ctx.tx(), &key)
                    .await?;
                for trigger_key in triggers {
                    store.pause_trigger_in_tx(ctx, &trigger_key).await?;
                }
                Ok(())
            })
        })
        .await
    }

    /// Pause the triggers of every job in the matched groups and mark those
    /// job groups paused, so jobs stored into them later start paused.
    /// Returns the affected group names.
    pub async fn pause_jobs(
        &self,
        cancel: &CancelToken,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>> {
        let matcher = matcher.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move {
                let mut groups = store.delegate.select_job_groups(ctx.tx()).await?;
                groups.retain(|group| matcher.matches(group));
                if let Some(exact) = matcher.exact() {
                    if !groups.iter().any(|g| g == exact) {
                        groups.push(exact.to_string());
                    }
                }

                for group in &groups {
                    if !store.delegate.is_job_group_paused(ctx.tx(), group).await? {
                        store
                            .delegate
                            .insert_paused_job_group(ctx.tx(), group)
                            .await?;
                    }
                }

                let jobs = store.delegate.select_job_keys(ctx.tx(), &matcher).await?;
                for job_key in jobs {
                    let triggers = store
                        .delegate
                        .select_trigger_keys_for_job(ctx.tx(), &job_key)
                        .await?;
                    for trigger_key in triggers {
                        store.pause_trigger_in_tx(ctx, &trigger_key).await?;
                    }
                }
                Ok(groups)
            })
        })
        .await
    }

    /// Resume every trigger of the job.
    pub async fn resume_job(&self, cancel: &CancelToken, key: &JobKey) -> Result<()> {
        let key = key.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move {
                let triggers = store
                    .delegate
                    .select_trigger_keys_for_job(ctx.tx(), &key)
                    .await?;
                for trigger_key in triggers {
                    store.resume_trigger_in_tx(ctx, &trigger_key).await?;
                }
                Ok(())
            })
        })
        .await
    }

    /// Resume the triggers of every job in the matched groups and clear the
    /// matched entries from the paused job groups. Returns the affected
    /// group names.
    pub async fn resume_jobs(
        &self,
        cancel: &CancelToken,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>> {
        let matcher = matcher.clone();
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, move |store, ctx| {
            Box::pin(async move {
                let paused: HashSet<String> =
                    store.delegate.select_paused_job_groups(ctx.tx()).await?;
                for group in paused {
                    if matcher.matches(&group) {
                        store
                            .delegate
                            .delete_paused_job_group(ctx.tx(), &group)
                            .await?;
                    }
                }

                let mut groups = store.delegate.select_job_groups(ctx.tx()).await?;
                groups.retain(|group| matcher.matches(group));

                let jobs = store.delegate.select_job_keys(ctx.tx(), &matcher).await?;
                for job_key in jobs {
                    let triggers = store
                        .delegate
                        .select_trigger_keys_for_job(ctx.tx(), &job_key)
                        .await?;
                    for trigger_key in triggers {
                        store.resume_trigger_in_tx(ctx, &trigger_key).await?;
                    }
                }
                Ok(groups)
            })
        })
        .await
    }

    /// Pause every trigger group and insert the all-groups sentinel, so
    /// groups created afterwards are born paused.
    pub async fn pause_all(&self, cancel: &CancelToken) -> Result<()> {
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, |store, ctx| {
            Box::pin(async move {
                let groups = store.delegate.select_trigger_groups(ctx.tx(), None).await?;
                for group in groups {
                    store
                        .pause_trigger_groups_in_tx(ctx, &GroupMatcher::Equals(group))
                        .await?;
                }
                if !store
                    .delegate
                    .is_trigger_group_paused(ctx.tx(), ALL_GROUPS_PAUSED)
                    .await?
                {
                    store
                        .delegate
                        .insert_paused_trigger_group(ctx.tx(), ALL_GROUPS_PAUSED)
                        .await?;
                }
                Ok(())
            })
        })
        .await
    }

    /// Remove the all-groups sentinel and resume every trigger group.
    pub async fn resume_all(&self, cancel: &CancelToken) -> Result<()> {
        self.execute_in_lock(Some(LockName::TriggerAccess), cancel, |store, ctx| {
            Box::pin(async move {
                store
                    .delegate
                    .delete_paused_trigger_group(ctx.tx(), ALL_GROUPS_PAUSED)
                    .await?;
                let groups = store.delegate.select_trigger_groups(ctx.tx(), None).await?;
                for group in groups {
                    store
                        .resume_trigger_groups_in_tx(ctx, &GroupMatcher::Equals(group))
                        .await?;
                }
                Ok(())
            })
        })
        .await
    }
}
