//! Misfire handling, startup recovery, and cluster failover tests.

use std::sync::Arc;

use chrono::Duration;
use quarry::{
    Delegate, FireInstanceId, FiredState, FiredTriggerRecord, GroupMatcher, MisfireInstruction,
    SchedulerStateRecord, StoreConfig, TriggerState, RECOVERY_GROUP,
};
use quarry_testkit::{one_shot_trigger, repeating_trigger, test_job, TestHarness};

fn clustered(instance_id: &str) -> StoreConfig {
    StoreConfig {
        instance_id: instance_id.to_string(),
        clustered: true,
        cluster_checkin_interval_ms: 10_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn misfire_applies_policy_and_notifies() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("misfires");
    h.store.store_job(&h.cancel, &job, false).await.unwrap();

    // one-shot with the fire-now policy comes back with a fresh fire time
    let refire = one_shot_trigger("refire", &job.key, t0)
        .with_misfire_instruction(MisfireInstruction::FireNow);
    // a finite schedule whose last fire is long past completes instead
    let exhausted = repeating_trigger("exhausted", &job.key, t0, Duration::seconds(10), Some(1));
    for trigger in [&refire, &exhausted] {
        h.store
            .store_trigger(&h.cancel, trigger, false, TriggerState::Waiting, false, false)
            .await
            .unwrap();
    }

    // both fire times slip well past the 60s threshold
    h.clock.advance(Duration::seconds(120));
    let now = h.clock.now();

    let result = h.store.recover_misfires(&h.cancel).await.unwrap();
    assert_eq!(result.handled, 2);
    assert!(!result.has_more);
    assert_eq!(h.signaler.misfired_count(), 2);

    assert_eq!(
        h.delegate.trigger_state(&refire.key),
        Some(TriggerState::Waiting)
    );
    let stored = h
        .store
        .retrieve_trigger(&h.cancel, &refire.key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.next_fire_time, Some(now), "fire-now reschedules to now");

    assert_eq!(
        h.delegate.trigger_state(&exhausted.key),
        Some(TriggerState::Complete)
    );
    assert_eq!(h.signaler.finalized_count(), 1);
    assert!(h.signaler.scheduling_change_signalled());
}

#[tokio::test]
async fn misfire_handler_pages_and_reports_more() {
    let config = StoreConfig {
        max_misfires_to_handle_at_a_time: 1,
        ..Default::default()
    };
    let h = TestHarness::new(config).await;
    let t0 = h.clock.now();

    let job = test_job("pages");
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    for name in ["m1", "m2"] {
        let trigger = one_shot_trigger(name, &job.key, t0)
            .with_misfire_instruction(MisfireInstruction::FireNow);
        h.store
            .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
            .await
            .unwrap();
    }

    h.clock.advance(Duration::seconds(120));
    let result = h.store.recover_misfires(&h.cancel).await.unwrap();
    assert_eq!(result.handled, 1);
    assert!(result.has_more, "a second page remains");

    let result = h.store.recover_misfires(&h.cancel).await.unwrap();
    assert_eq!(result.handled, 1);
    assert!(!result.has_more);
}

#[tokio::test]
async fn misfire_peek_skips_quiet_stores() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("quiet");
    let trigger = one_shot_trigger("future", &job.key, t0 + Duration::seconds(600));
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    let result = h.store.recover_misfires(&h.cancel).await.unwrap();
    assert_eq!(result.handled, 0);
    assert_eq!(h.signaler.misfired_count(), 0);
}

#[tokio::test]
async fn recover_jobs_resets_stranded_states() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();
    let future = t0 + Duration::seconds(600);

    let job = test_job("stranded");
    h.store.store_job(&h.cancel, &job, false).await.unwrap();

    let acquired = one_shot_trigger("was-acquired", &job.key, future);
    let paused_blocked = one_shot_trigger("was-paused-blocked", &job.key, future);
    let complete = one_shot_trigger("was-complete", &job.key, future);
    for trigger in [&acquired, &paused_blocked, &complete] {
        h.store
            .store_trigger(&h.cancel, trigger, false, TriggerState::Waiting, false, false)
            .await
            .unwrap();
    }

    let mut tx = h.cancel.clone();
    h.delegate
        .update_trigger_state(&mut tx, &acquired.key, TriggerState::Acquired)
        .await
        .unwrap();
    h.delegate
        .update_trigger_state(&mut tx, &paused_blocked.key, TriggerState::PausedAndBlocked)
        .await
        .unwrap();
    h.delegate
        .update_trigger_state(&mut tx, &complete.key, TriggerState::Complete)
        .await
        .unwrap();
    h.delegate.seed_fired_record(FiredTriggerRecord {
        fire_instance_id: FireInstanceId::compose("node-main", 1),
        instance_id: "NON_CLUSTERED".to_string(),
        trigger_key: acquired.key.clone(),
        job_key: job.key.clone(),
        state: FiredState::Acquired,
        priority: 5,
        fired_at: t0,
        scheduled_at: Some(future),
        is_non_concurrent: false,
        requests_recovery: false,
        job_data: None,
    });

    h.store.recover_jobs(&h.cancel).await.unwrap();

    assert_eq!(
        h.delegate.trigger_state(&acquired.key),
        Some(TriggerState::Waiting)
    );
    assert_eq!(
        h.delegate.trigger_state(&paused_blocked.key),
        Some(TriggerState::Paused)
    );
    assert_eq!(
        h.delegate.trigger_state(&complete.key),
        None,
        "lingering Complete triggers are removed"
    );
    assert!(h.delegate.fired_records().is_empty());
}

#[tokio::test]
async fn recover_jobs_rearms_recoverable_jobs() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("phoenix").recoverable();
    let trigger = one_shot_trigger("phoenix-t", &job.key, t0 + Duration::seconds(600));
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    let mut tx = h.cancel.clone();
    h.delegate
        .update_trigger_state(&mut tx, &trigger.key, TriggerState::Error)
        .await
        .unwrap();

    h.store.recover_jobs(&h.cancel).await.unwrap();

    assert_eq!(
        h.delegate.trigger_state(&trigger.key),
        Some(TriggerState::Waiting),
        "triggers of recovery-requesting jobs are re-armed"
    );
}

#[tokio::test]
async fn cluster_recovers_failed_instance() {
    let shared = Arc::new(quarry_testkit::InMemoryDelegate::new());
    let a = TestHarness::with_delegate(clustered("node-a"), Arc::clone(&shared)).await;
    let b = TestHarness::with_delegate(clustered("node-b"), Arc::clone(&shared)).await;
    let t0 = b.clock.now();

    let job = test_job("shared-work");
    let trigger = one_shot_trigger("shared-t", &job.key, t0);
    b.store.store_job(&b.cancel, &job, false).await.unwrap();
    b.store
        .store_trigger(&b.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    // both instances check in once
    b.store.check_cluster(&b.cancel).await.unwrap();
    a.store.check_cluster(&a.cancel).await.unwrap();

    // B reserves the trigger, then dies
    let acquired = b
        .store
        .acquire_next_triggers(&b.cancel, t0, 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);
    assert_eq!(shared.fired_records()[0].instance_id, "node-b");

    // A keeps checking in; B's row goes stale past 10s + 7.5s
    a.clock.advance(Duration::seconds(10));
    let recovered = a.store.check_cluster(&a.cancel).await.unwrap();
    assert!(!recovered, "B is still within its detection window");

    a.clock.advance(Duration::seconds(10));
    let recovered = a.store.check_cluster(&a.cancel).await.unwrap();
    assert!(recovered, "B is now 20s stale and must be recovered");

    assert_eq!(
        shared.trigger_state(&trigger.key),
        Some(TriggerState::Waiting),
        "the acquired fire returns to rotation"
    );
    assert!(shared.fired_records().is_empty());
    let instances: Vec<String> = shared
        .scheduler_states()
        .into_iter()
        .map(|r| r.instance_id)
        .collect();
    assert_eq!(instances, vec!["node-a".to_string()]);
}

#[tokio::test]
async fn first_checkin_recovers_orphaned_ledger_rows() {
    let shared = Arc::new(quarry_testkit::InMemoryDelegate::new());
    let a = TestHarness::with_delegate(clustered("node-a"), Arc::clone(&shared)).await;
    let t0 = a.clock.now();

    let job = test_job("orphaned");
    let trigger = one_shot_trigger("orphan-t", &job.key, t0);
    a.store.store_job(&a.cancel, &job, false).await.unwrap();
    a.store
        .store_trigger(&a.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    // a ghost instance left an acquired fire behind with no membership row
    let mut tx = a.cancel.clone();
    a.delegate
        .update_trigger_state(&mut tx, &trigger.key, TriggerState::Acquired)
        .await
        .unwrap();
    shared.seed_fired_record(FiredTriggerRecord {
        fire_instance_id: FireInstanceId::compose("ghost", 1),
        instance_id: "ghost".to_string(),
        trigger_key: trigger.key.clone(),
        job_key: job.key.clone(),
        state: FiredState::Acquired,
        priority: 5,
        fired_at: t0,
        scheduled_at: Some(t0),
        is_non_concurrent: false,
        requests_recovery: false,
        job_data: None,
    });

    let recovered = a.store.check_cluster(&a.cancel).await.unwrap();
    assert!(recovered);
    assert_eq!(
        shared.trigger_state(&trigger.key),
        Some(TriggerState::Waiting)
    );
    assert!(shared.fired_records().is_empty());
}

#[tokio::test]
async fn cluster_recovery_spawns_recovery_trigger() {
    let shared = Arc::new(quarry_testkit::InMemoryDelegate::new());
    let a = TestHarness::with_delegate(clustered("node-a"), Arc::clone(&shared)).await;
    let t0 = a.clock.now();

    let job = test_job("resumable").recoverable();
    let trigger = one_shot_trigger("resumable-t", &job.key, t0);
    a.store.store_job(&a.cancel, &job, false).await.unwrap();
    a.store
        .store_trigger(&a.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    // the dead peer was executing when it died
    shared.seed_scheduler_state(SchedulerStateRecord {
        instance_id: "node-dead".to_string(),
        last_checkin: t0 - Duration::seconds(3_600),
        checkin_interval_ms: 10_000,
    });
    shared.seed_fired_record(FiredTriggerRecord {
        fire_instance_id: FireInstanceId::compose("node-dead", 42),
        instance_id: "node-dead".to_string(),
        trigger_key: trigger.key.clone(),
        job_key: job.key.clone(),
        state: FiredState::Executing,
        priority: 7,
        fired_at: t0 - Duration::seconds(3_600),
        scheduled_at: Some(t0 - Duration::seconds(3_600)),
        is_non_concurrent: false,
        requests_recovery: true,
        job_data: None,
    });

    let recovered = a.store.check_cluster(&a.cancel).await.unwrap();
    assert!(recovered);

    let recovery_keys = a
        .store
        .get_trigger_keys(&a.cancel, &GroupMatcher::Equals(RECOVERY_GROUP.into()))
        .await
        .unwrap();
    assert_eq!(recovery_keys.len(), 1, "one recovery fire per dead execution");

    let recovery = a
        .store
        .retrieve_trigger(&a.cancel, &recovery_keys[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recovery.job_key, job.key);
    assert_eq!(recovery.priority, 7);
    assert_eq!(
        recovery.data.get("failed-trigger-name"),
        Some(&serde_json::Value::String("resumable-t".into()))
    );
    assert_eq!(
        recovery.data.get("failed-trigger-group"),
        Some(&serde_json::Value::String("DEFAULT".into()))
    );
    assert!(recovery.data.contains_key("failed-trigger-fire-time"));
    assert_eq!(
        shared.trigger_state(&recovery.key),
        Some(TriggerState::Waiting)
    );
    assert!(
        shared
            .scheduler_states()
            .iter()
            .all(|r| r.instance_id != "node-dead"),
        "the dead peer's membership row is gone"
    );
}

#[tokio::test]
async fn cluster_recovery_releases_blocked_peers_of_nonconcurrent_jobs() {
    let shared = Arc::new(quarry_testkit::InMemoryDelegate::new());
    let a = TestHarness::with_delegate(clustered("node-a"), Arc::clone(&shared)).await;
    let t0 = a.clock.now();

    let job = test_job("exclusive").non_concurrent();
    let running = one_shot_trigger("running", &job.key, t0);
    let blocked = one_shot_trigger("blocked", &job.key, t0 + Duration::seconds(600));
    a.store.store_job(&a.cancel, &job, false).await.unwrap();
    for trigger in [&running, &blocked] {
        a.store
            .store_trigger(&a.cancel, trigger, false, TriggerState::Waiting, false, false)
            .await
            .unwrap();
    }

    // the dead peer fired `running` (one-shot, so its row went Complete)
    // while `blocked` was held back
    let mut tx = a.cancel.clone();
    a.delegate
        .update_trigger_state(&mut tx, &running.key, TriggerState::Complete)
        .await
        .unwrap();
    a.delegate
        .update_trigger_state(&mut tx, &blocked.key, TriggerState::Blocked)
        .await
        .unwrap();
    shared.seed_fired_record(FiredTriggerRecord {
        fire_instance_id: FireInstanceId::compose("node-dead", 7),
        instance_id: "node-dead".to_string(),
        trigger_key: running.key.clone(),
        job_key: job.key.clone(),
        state: FiredState::Executing,
        priority: 5,
        fired_at: t0,
        scheduled_at: Some(t0),
        is_non_concurrent: true,
        requests_recovery: false,
        job_data: None,
    });

    let recovered = a.store.check_cluster(&a.cancel).await.unwrap();
    assert!(recovered);
    assert_eq!(
        shared.trigger_state(&blocked.key),
        Some(TriggerState::Waiting),
        "blocked peers are released when the executing instance dies"
    );
    assert_eq!(
        shared.trigger_state(&running.key),
        None,
        "the completed trigger with no remaining fires is cleaned up"
    );
}
