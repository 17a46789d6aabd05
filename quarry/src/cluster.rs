//! Cluster membership and failed-instance recovery.
//!
//! Every instance refreshes its SchedulerState row on a check-in interval.
//! A peer whose row goes stale past the detection window is declared failed;
//! its execution ledger is replayed under STATE_ACCESS + TRIGGER_ACCESS so
//! its in-flight fires either return to rotation or spawn one-shot recovery
//! triggers.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn, Instrument};

use crate::cancel::CancelToken;
use crate::delegate::Delegate;
use crate::error::Result;
use crate::fired::FiredState;
use crate::key::{TriggerKey, RECOVERY_GROUP};
use crate::lock::LockName;
use crate::store::{JobStore, TxContext};
use crate::telemetry::cluster_span;
use crate::trigger::{MisfireInstruction, Schedule, SimpleSchedule, Trigger, TriggerState};

/// Extra latency granted on top of a peer's check-in interval before it is
/// declared failed.
pub const CLUSTER_CHECKIN_LATENCY_MS: u64 = 7_500;

/// Data-map key recording the failed trigger's name on a recovery trigger.
pub const FAILED_TRIGGER_NAME_KEY: &str = "failed-trigger-name";
/// Data-map key recording the failed trigger's group on a recovery trigger.
pub const FAILED_TRIGGER_GROUP_KEY: &str = "failed-trigger-group";
/// Data-map key recording the failed fire's scheduled time (epoch millis).
pub const FAILED_TRIGGER_FIRE_TIME_KEY: &str = "failed-trigger-fire-time";

/// Cluster membership row: one per live scheduler instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStateRecord {
    pub instance_id: String,
    pub last_checkin: DateTime<Utc>,
    pub checkin_interval_ms: u64,
}

/// Instant after which the peer described by `record` counts as failed.
///
/// The window is the larger of the peer's own interval and the time since
/// our last check-in (so our own stalls do not condemn healthy peers), plus
/// a fixed latency allowance.
pub fn failed_if_after(
    record: &SchedulerStateRecord,
    now: DateTime<Utc>,
    our_last_checkin: DateTime<Utc>,
) -> DateTime<Utc> {
    let since_ours = (now - our_last_checkin).num_milliseconds().max(0) as u64;
    let window = record.checkin_interval_ms.max(since_ours) + CLUSTER_CHECKIN_LATENCY_MS;
    record.last_checkin + Duration::milliseconds(window as i64)
}

impl<D: Delegate> JobStore<D> {
    /// One cluster check-in pass. Refreshes our membership row, detects
    /// failed peers, and recovers their in-flight work when needed.
    /// Returns whether any recovery ran.
    pub async fn check_cluster(&self, cancel: &CancelToken) -> Result<bool> {
        let first = self.first_check_in.load(Ordering::SeqCst);

        // Cheap pass: check in and scan without STATE_ACCESS. The lock is
        // only worth taking when something looks failed.
        let mut failed = Vec::new();
        if !first {
            failed = self
                .execute_without_lock(cancel, |store, ctx| {
                    Box::pin(async move { store.checkin_and_scan(ctx, false).await })
                })
                .await?;
        }

        let mut recovered = false;
        if first || !failed.is_empty() {
            recovered = self
                .execute_in_lock(Some(LockName::StateAccess), cancel, move |store, ctx| {
                    Box::pin(async move {
                        // authoritative re-scan under the lock
                        let failed = store.checkin_and_scan(ctx, first).await?;
                        if failed.is_empty() {
                            return Ok(false);
                        }
                        ctx.obtain_lock(LockName::TriggerAccess).await?;
                        store.cluster_recover_in_tx(ctx, &failed).await?;
                        Ok(true)
                    })
                })
                .instrument(cluster_span(&self.config.instance_id))
                .await?;
        }

        self.first_check_in.store(false, Ordering::SeqCst);
        Ok(recovered)
    }

    /// Refresh our SchedulerState row and return the peers that look
    /// failed. On the first check-in, instance ids that appear in the
    /// execution ledger without a membership row are treated as failed
    /// peers too (orphans from an unclean shutdown).
    async fn checkin_and_scan(
        &self,
        ctx: &mut TxContext<D>,
        first: bool,
    ) -> Result<Vec<SchedulerStateRecord>> {
        let now = self.now();
        let our_last = *self.last_checkin.lock().await;

        let states = self
            .delegate
            .select_scheduler_state_records(ctx.tx(), None)
            .await?;

        let mut failed: Vec<SchedulerStateRecord> = Vec::new();
        for record in &states {
            if record.instance_id == self.config.instance_id {
                continue;
            }
            if failed_if_after(record, now, our_last) < now {
                failed.push(record.clone());
            }
        }

        if first {
            let ledger_instances = self
                .delegate
                .select_fired_trigger_instance_ids(ctx.tx())
                .await?;
            for instance_id in ledger_instances {
                let known = instance_id == self.config.instance_id
                    || states.iter().any(|r| r.instance_id == instance_id)
                    || failed.iter().any(|r| r.instance_id == instance_id);
                if !known {
                    warn!(instance = %instance_id, "found orphaned fired triggers without a membership row");
                    failed.push(SchedulerStateRecord {
                        instance_id,
                        last_checkin: DateTime::<Utc>::UNIX_EPOCH,
                        checkin_interval_ms: 0,
                    });
                }
            }
        }

        let rows = self
            .delegate
            .update_scheduler_state(ctx.tx(), &self.config.instance_id, now)
            .await?;
        if rows == 0 {
            self.delegate
                .insert_scheduler_state(
                    ctx.tx(),
                    &SchedulerStateRecord {
                        instance_id: self.config.instance_id.clone(),
                        last_checkin: now,
                        checkin_interval_ms: self.config.cluster_checkin_interval_ms,
                    },
                )
                .await?;
        }
        *self.last_checkin.lock().await = now;

        Ok(failed)
    }

    /// Replay the execution ledger of every failed peer.
    ///
    /// Acquired fires return to Waiting; executing fires of recoverable
    /// jobs spawn one-shot recovery triggers; non-concurrent jobs have
    /// their blocked peers released. Finally the peer's ledger rows and
    /// membership row are dropped, and triggers the crash left Complete
    /// with no remaining fires are removed.
    pub(crate) async fn cluster_recover_in_tx(
        &self,
        ctx: &mut TxContext<D>,
        failed: &[SchedulerStateRecord],
    ) -> Result<()> {
        let now = self.now();

        for peer in failed {
            info!(instance = %peer.instance_id, "recovering work of failed instance");

            let ledger = self
                .delegate
                .select_instance_fired_trigger_records(ctx.tx(), &peer.instance_id)
                .await?;

            let mut acquired_count = 0usize;
            let mut recovered_count = 0usize;
            let mut other_count = 0usize;
            let mut touched: HashSet<TriggerKey> = HashSet::new();

            for record in &ledger {
                touched.insert(record.trigger_key.clone());

                match record.state {
                    FiredState::Acquired => {
                        self.delegate
                            .update_trigger_state_from_other_state(
                                ctx.tx(),
                                &record.trigger_key,
                                TriggerState::Waiting,
                                TriggerState::Acquired,
                            )
                            .await?;
                        acquired_count += 1;
                    }
                    FiredState::Executing => {
                        let job_exists =
                            self.delegate.job_exists(ctx.tx(), &record.job_key).await?;
                        if record.requests_recovery && job_exists {
                            let mut recovery = Trigger::new(
                                TriggerKey::with_group(
                                    format!("recover-{}", record.fire_instance_id),
                                    RECOVERY_GROUP,
                                ),
                                record.job_key.clone(),
                                Schedule::Simple(SimpleSchedule::once()),
                                now,
                            )
                            .with_priority(record.priority)
                            .with_misfire_instruction(MisfireInstruction::IgnoreMisfires);

                            recovery.data.insert(
                                FAILED_TRIGGER_NAME_KEY.to_string(),
                                Value::String(record.trigger_key.name.clone()),
                            );
                            recovery.data.insert(
                                FAILED_TRIGGER_GROUP_KEY.to_string(),
                                Value::String(record.trigger_key.group.clone()),
                            );
                            if let Some(scheduled) = record.scheduled_at {
                                recovery.data.insert(
                                    FAILED_TRIGGER_FIRE_TIME_KEY.to_string(),
                                    Value::from(scheduled.timestamp_millis()),
                                );
                            }

                            recovery.compute_first_fire_time(None);
                            self.store_trigger_in_tx(
                                ctx,
                                recovery,
                                None,
                                false,
                                TriggerState::Waiting,
                                false,
                                true,
                            )
                            .await?;
                            recovered_count += 1;
                        } else {
                            other_count += 1;
                        }
                    }
                }

                if record.is_non_concurrent {
                    self.delegate
                        .update_trigger_states_for_job_from_other_state(
                            ctx.tx(),
                            &record.job_key,
                            TriggerState::Waiting,
                            TriggerState::Blocked,
                        )
                        .await?;
                    self.delegate
                        .update_trigger_states_for_job_from_other_state(
                            ctx.tx(),
                            &record.job_key,
                            TriggerState::Paused,
                            TriggerState::PausedAndBlocked,
                        )
                        .await?;
                }
            }

            self.delegate
                .delete_fired_triggers(ctx.tx(), Some(&peer.instance_id))
                .await?;

            // a crash during completion can leave Complete triggers whose
            // ledger rows are now gone
            for key in touched {
                let state = self.delegate.select_trigger_state(ctx.tx(), &key).await?;
                if state == Some(TriggerState::Complete) {
                    let remaining = self
                        .delegate
                        .select_fired_trigger_records(ctx.tx(), &key)
                        .await?;
                    if remaining.is_empty() {
                        self.remove_trigger_in_tx(ctx, &key).await?;
                    }
                }
            }

            if peer.instance_id != self.config.instance_id {
                self.delegate
                    .delete_scheduler_state(ctx.tx(), &peer.instance_id)
                    .await?;
            }

            info!(
                instance = %peer.instance_id,
                acquired = acquired_count,
                recovered = recovered_count,
                other = other_count,
                "failed instance recovery finished"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(last_checkin: DateTime<Utc>, interval_ms: u64) -> SchedulerStateRecord {
        SchedulerStateRecord {
            instance_id: "peer".to_string(),
            last_checkin,
            checkin_interval_ms: interval_ms,
        }
    }

    #[test]
    fn peer_within_window_is_alive() {
        let now = at(100);
        let peer = record(at(95), 10_000);
        // 95s + max(10s, 0) + 7.5s = 112.5s > now
        assert!(failed_if_after(&peer, now, now) > now);
    }

    #[test]
    fn peer_past_window_is_failed() {
        let now = at(120);
        let peer = record(at(100), 10_000);
        // 100s + 10s + 7.5s = 117.5s < 120s
        assert!(failed_if_after(&peer, now, now) < now);
    }

    #[test]
    fn our_own_stall_extends_the_window() {
        let now = at(120);
        let peer = record(at(100), 10_000);
        // we have not checked in for 30s ourselves; grant the peer the same
        let our_last = at(90);
        assert!(failed_if_after(&peer, now, our_last) > now);
    }
}
