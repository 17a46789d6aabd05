//! Acquire / fire / complete pipeline tests over the in-memory delegate.
//!
//! Covers single-fire lifecycle, acquisition ordering and windows,
//! per-job concurrency exclusion, pause interactions, and the
//! acquire/release round-trip.

use chrono::Duration;
use quarry::{
    CompletedExecutionInstruction, Delegate, ExternalTriggerState, FiredState, GroupMatcher,
    JobKey, StoreConfig, StoreError, TriggerKey, TriggerState,
};
use quarry_testkit::{one_shot_trigger, repeating_trigger, test_job, SignalEvent, TestHarness};

#[tokio::test]
async fn single_fire_lifecycle() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("ingest");
    let trigger = one_shot_trigger("ingest-once", &job.key, t0);
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    let acquired = h
        .store
        .acquire_next_triggers(&h.cancel, t0, 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);
    assert!(acquired[0].fire_instance_id.is_some());
    assert_eq!(
        h.delegate.trigger_state(&trigger.key),
        Some(TriggerState::Acquired)
    );
    let fired = h.delegate.fired_records();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].state, FiredState::Acquired);

    let bundles = h
        .store
        .triggers_fired(&h.cancel, acquired.clone())
        .await
        .unwrap();
    assert_eq!(bundles.len(), 1);
    let bundle = &bundles[0];
    assert_eq!(bundle.scheduled_fire_time, Some(t0));
    assert_eq!(bundle.next_fire_time, None, "one-shot schedule is exhausted");
    assert!(!bundle.recovering);
    // no further fire time: the stored trigger is Complete until the
    // completion instruction disposes of it
    assert_eq!(
        h.delegate.trigger_state(&trigger.key),
        Some(TriggerState::Complete)
    );
    assert_eq!(h.delegate.fired_records()[0].state, FiredState::Executing);

    h.store
        .triggered_job_complete(
            &h.cancel,
            &bundle.trigger,
            &bundle.job,
            CompletedExecutionInstruction::DeleteTrigger,
        )
        .await
        .unwrap();

    assert_eq!(h.delegate.trigger_state(&trigger.key), None);
    assert!(h.delegate.fired_records().is_empty());
    // the job was not durable and lost its last trigger
    assert_eq!(
        h.store.retrieve_job(&h.cancel, &job.key).await.unwrap(),
        None
    );
    assert_eq!(h.signaler.deleted_jobs(), vec![job.key.clone()]);
}

#[tokio::test]
async fn acquire_orders_by_fire_time_then_priority() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("batch");
    h.store.store_job(&h.cancel, &job, false).await.unwrap();

    let low = one_shot_trigger("low", &job.key, t0);
    let high = one_shot_trigger("high", &job.key, t0).with_priority(9);
    let late = one_shot_trigger("late", &job.key, t0 + Duration::milliseconds(1));
    for trigger in [&low, &high, &late] {
        h.store
            .store_trigger(&h.cancel, trigger, false, TriggerState::Waiting, false, false)
            .await
            .unwrap();
    }

    // window of zero: the trigger 1ms past no_later_than is not eligible
    let acquired = h
        .store
        .acquire_next_triggers(&h.cancel, t0, 10, Duration::zero())
        .await
        .unwrap();

    let names: Vec<&str> = acquired.iter().map(|t| t.key.name.as_str()).collect();
    assert_eq!(names, vec!["high", "low"], "priority breaks the tie");
    assert_eq!(
        h.delegate.trigger_state(&late.key),
        Some(TriggerState::Waiting)
    );
}

#[tokio::test]
async fn trigger_without_fire_time_is_never_acquired() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("idle");
    h.store.store_job(&h.cancel, &job, false).await.unwrap();

    let mut trigger = one_shot_trigger("unfired", &job.key, t0);
    trigger.next_fire_time = None;
    let mut tx = h.cancel.clone();
    h.delegate
        .insert_trigger(&mut tx, &trigger, TriggerState::Waiting)
        .await
        .unwrap();

    let acquired = h
        .store
        .acquire_next_triggers(&h.cancel, t0 + Duration::seconds(60), 10, Duration::zero())
        .await
        .unwrap();
    assert!(acquired.is_empty());
}

#[tokio::test]
async fn non_concurrent_job_acquires_one_trigger_and_blocks_peers() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("exclusive").non_concurrent();
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    let t1 = one_shot_trigger("first", &job.key, t0);
    let t2 = one_shot_trigger("second", &job.key, t0);
    for trigger in [&t1, &t2] {
        h.store
            .store_trigger(&h.cancel, trigger, false, TriggerState::Waiting, false, false)
            .await
            .unwrap();
    }

    let acquired = h
        .store
        .acquire_next_triggers(&h.cancel, t0, 10, Duration::zero())
        .await
        .unwrap();
    assert_eq!(
        acquired.len(),
        1,
        "a non-concurrent job yields one trigger per batch"
    );

    let fired_key = acquired[0].key.clone();
    let other_key = if fired_key == t1.key {
        t2.key.clone()
    } else {
        t1.key.clone()
    };

    let bundles = h.store.triggers_fired(&h.cancel, acquired).await.unwrap();
    assert_eq!(bundles.len(), 1);
    assert_eq!(
        h.delegate.trigger_state(&other_key),
        Some(TriggerState::Blocked),
        "the peer trigger is held back while the job executes"
    );

    h.store
        .triggered_job_complete(
            &h.cancel,
            &bundles[0].trigger,
            &bundles[0].job,
            CompletedExecutionInstruction::DeleteTrigger,
        )
        .await
        .unwrap();

    assert_eq!(h.delegate.trigger_state(&fired_key), None);
    assert_eq!(
        h.delegate.trigger_state(&other_key),
        Some(TriggerState::Waiting),
        "completion releases the blocked peer"
    );
    // the job keeps its remaining trigger
    assert!(h
        .store
        .retrieve_job(&h.cancel, &job.key)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn pausing_an_acquired_trigger_skips_its_fire() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("pausable");
    let trigger = one_shot_trigger("pause-me", &job.key, t0);
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    let acquired = h
        .store
        .acquire_next_triggers(&h.cancel, t0, 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);

    let groups = h
        .store
        .pause_triggers(&h.cancel, &GroupMatcher::Equals("DEFAULT".into()))
        .await
        .unwrap();
    assert_eq!(groups, vec!["DEFAULT".to_string()]);
    assert_eq!(
        h.delegate.trigger_state(&trigger.key),
        Some(TriggerState::Paused)
    );

    let bundles = h.store.triggers_fired(&h.cancel, acquired).await.unwrap();
    assert!(bundles.is_empty(), "a paused trigger must not fire");
}

#[tokio::test]
async fn acquire_then_release_restores_waiting() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("restorable");
    let trigger = repeating_trigger("tick", &job.key, t0, Duration::seconds(10), None);
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    let acquired = h
        .store
        .acquire_next_triggers(&h.cancel, t0, 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);

    h.store
        .release_acquired_trigger(&h.cancel, &acquired[0])
        .await
        .unwrap();

    assert_eq!(
        h.delegate.trigger_state(&trigger.key),
        Some(TriggerState::Waiting)
    );
    assert!(h.delegate.fired_records().is_empty());

    // the trigger is acquirable again
    let again = h
        .store
        .acquire_next_triggers(&h.cancel, t0, 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(again.len(), 1);
}

#[tokio::test]
async fn pause_and_resume_round_trip() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("round-trip");
    let trigger = one_shot_trigger("rt", &job.key, t0 + Duration::seconds(600));
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    h.store.pause_trigger(&h.cancel, &trigger.key).await.unwrap();
    assert_eq!(
        h.store.get_trigger_state(&h.cancel, &trigger.key).await.unwrap(),
        ExternalTriggerState::Paused
    );

    h.store.resume_trigger(&h.cancel, &trigger.key).await.unwrap();
    assert_eq!(
        h.delegate.trigger_state(&trigger.key),
        Some(TriggerState::Waiting)
    );
}

#[tokio::test]
async fn resume_upgrades_to_blocked_while_peer_executes() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("exclusive").non_concurrent();
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    let t1 = one_shot_trigger("running", &job.key, t0);
    let t2 = one_shot_trigger("parked", &job.key, t0 + Duration::seconds(600));
    for trigger in [&t1, &t2] {
        h.store
            .store_trigger(&h.cancel, trigger, false, TriggerState::Waiting, false, false)
            .await
            .unwrap();
    }

    h.store.pause_trigger(&h.cancel, &t2.key).await.unwrap();

    // fire t1 so an Executing ledger row exists for the job
    let acquired = h
        .store
        .acquire_next_triggers(&h.cancel, t0, 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired[0].key, t1.key);
    h.store.triggers_fired(&h.cancel, acquired).await.unwrap();

    h.store.resume_trigger(&h.cancel, &t2.key).await.unwrap();
    assert_eq!(
        h.delegate.trigger_state(&t2.key),
        Some(TriggerState::Blocked),
        "resume lands in Blocked while a non-concurrent peer executes"
    );
}

#[tokio::test]
async fn storing_into_paused_group_lands_paused() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    // pausing an exact-match empty group leaves a marker for future inserts
    let groups = h
        .store
        .pause_triggers(&h.cancel, &GroupMatcher::Equals("reports".into()))
        .await
        .unwrap();
    assert_eq!(groups, vec!["reports".to_string()]);

    let job = test_job("report-job");
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    let mut trigger = one_shot_trigger("nightly", &job.key, t0 + Duration::seconds(60));
    trigger.key = TriggerKey::with_group("nightly", "reports");
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    assert_eq!(
        h.delegate.trigger_state(&trigger.key),
        Some(TriggerState::Paused)
    );
}

#[tokio::test]
async fn all_groups_sentinel_pauses_future_groups() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    h.store.pause_all(&h.cancel).await.unwrap();

    let job = test_job("later-job");
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    let mut trigger = one_shot_trigger("later", &job.key, t0 + Duration::seconds(60));
    trigger.key = TriggerKey::with_group("later", "brand-new-group");
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    assert_eq!(
        h.delegate.trigger_state(&trigger.key),
        Some(TriggerState::Paused)
    );
    // the sentinel also marks the new group as individually paused
    let paused = h.store.get_paused_trigger_groups(&h.cancel).await.unwrap();
    assert!(paused.contains("brand-new-group"));

    h.store.resume_all(&h.cancel).await.unwrap();
    assert_eq!(
        h.delegate.trigger_state(&trigger.key),
        Some(TriggerState::Waiting)
    );
}

#[tokio::test]
async fn duplicate_and_missing_objects_are_rejected() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("dup");
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    let err = h.store.store_job(&h.cancel, &job, false).await.unwrap_err();
    assert!(matches!(err, StoreError::ObjectAlreadyExists { .. }));

    // replace_existing lifts the restriction
    h.store.store_job(&h.cancel, &job, true).await.unwrap();

    // a missing job reference fails inside the transaction and surfaces as
    // a persistence failure; only already-exists keeps its type
    let orphan = one_shot_trigger("orphan", &JobKey::new("missing"), t0);
    let err = h
        .store
        .store_trigger(&h.cancel, &orphan, false, TriggerState::Waiting, false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Persistence { .. }));

    let trigger = one_shot_trigger("dup-t", &job.key, t0);
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();
    let err = h
        .store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ObjectAlreadyExists { .. }));
}

#[tokio::test]
async fn path_separator_in_names_is_rejected() {
    let h = TestHarness::new(StoreConfig::default()).await;

    let job = test_job("bad/name");
    let err = h.store.store_job(&h.cancel, &job, false).await.unwrap_err();
    assert!(matches!(err, StoreError::Configuration(_)));
}

#[tokio::test]
async fn replace_trigger_requires_same_job() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job_a = test_job("job-a");
    let job_b = test_job("job-b");
    h.store.store_job(&h.cancel, &job_a, false).await.unwrap();
    h.store.store_job(&h.cancel, &job_b, false).await.unwrap();

    let trigger = one_shot_trigger("swap", &job_a.key, t0 + Duration::seconds(60));
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    let mut replacement = one_shot_trigger("swap2", &job_b.key, t0 + Duration::seconds(120));
    let err = h
        .store
        .replace_trigger(&h.cancel, &trigger.key, &replacement)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Persistence { .. }));

    replacement.job_key = job_a.key.clone();
    let replaced = h
        .store
        .replace_trigger(&h.cancel, &trigger.key, &replacement)
        .await
        .unwrap();
    assert!(replaced);
    assert_eq!(h.delegate.trigger_state(&trigger.key), None);
    assert_eq!(
        h.delegate.trigger_state(&replacement.key),
        Some(TriggerState::Waiting)
    );
}

#[tokio::test]
async fn clear_all_scheduling_data_empties_the_store() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("wipe");
    let trigger = one_shot_trigger("wipe-t", &job.key, t0);
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();
    h.store
        .store_calendar(&h.cancel, "hours", &quarry::Calendar::permissive(), false, false)
        .await
        .unwrap();
    h.store
        .pause_triggers(&h.cancel, &GroupMatcher::Equals("other".into()))
        .await
        .unwrap();
    h.store
        .acquire_next_triggers(&h.cancel, t0, 1, Duration::zero())
        .await
        .unwrap();

    h.store.clear_all_scheduling_data(&h.cancel).await.unwrap();

    assert_eq!(h.store.get_number_of_jobs(&h.cancel).await.unwrap(), 0);
    assert_eq!(h.store.get_number_of_triggers(&h.cancel).await.unwrap(), 0);
    assert_eq!(h.store.get_number_of_calendars(&h.cancel).await.unwrap(), 0);
    assert!(h.delegate.fired_records().is_empty());
    assert!(h
        .store
        .get_paused_trigger_groups(&h.cancel)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn completion_signals_scheduling_change_after_commit() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("signals");
    let trigger = one_shot_trigger("sig", &job.key, t0);
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    let acquired = h
        .store
        .acquire_next_triggers(&h.cancel, t0, 1, Duration::zero())
        .await
        .unwrap();
    let bundles = h.store.triggers_fired(&h.cancel, acquired).await.unwrap();
    h.signaler.clear();

    h.store
        .triggered_job_complete(
            &h.cancel,
            &bundles[0].trigger,
            &bundles[0].job,
            CompletedExecutionInstruction::SetTriggerComplete,
        )
        .await
        .unwrap();

    assert!(h.signaler.scheduling_change_signalled());
}

#[tokio::test]
async fn cancelled_token_aborts_operations() {
    let h = TestHarness::new(StoreConfig::default()).await;
    h.cancel.cancel();

    let err = h.store.get_number_of_jobs(&h.cancel).await.unwrap_err();
    assert!(matches!(err, StoreError::Cancelled));
}

#[tokio::test]
async fn external_state_view_collapses_internal_states() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("view");
    let trigger = one_shot_trigger("view-t", &job.key, t0);
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    assert_eq!(
        h.store.get_trigger_state(&h.cancel, &trigger.key).await.unwrap(),
        ExternalTriggerState::Normal
    );
    assert_eq!(
        h.store
            .get_trigger_state(&h.cancel, &TriggerKey::new("nope"))
            .await
            .unwrap(),
        ExternalTriggerState::None
    );

    h.store
        .acquire_next_triggers(&h.cancel, t0, 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(
        h.store.get_trigger_state(&h.cancel, &trigger.key).await.unwrap(),
        ExternalTriggerState::Normal,
        "acquired still reads as normal externally"
    );
}

#[tokio::test]
async fn fired_events_capture_job_data_snapshot() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let mut job = test_job("data");
    job.data
        .insert("path".into(), serde_json::Value::String("/tmp/x".into()));
    let trigger = one_shot_trigger("data-t", &job.key, t0);
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    let acquired = h
        .store
        .acquire_next_triggers(&h.cancel, t0, 1, Duration::zero())
        .await
        .unwrap();
    h.store.triggers_fired(&h.cancel, acquired).await.unwrap();

    let fired = h.delegate.fired_records();
    assert_eq!(fired.len(), 1);
    let snapshot = fired[0].job_data.as_ref().expect("snapshot present");
    assert_eq!(
        snapshot.get("path"),
        Some(&serde_json::Value::String("/tmp/x".into()))
    );
}

#[tokio::test]
async fn job_deleted_event_only_for_cascade() {
    let h = TestHarness::new(StoreConfig::default()).await;
    let t0 = h.clock.now();

    let job = test_job("cascade");
    let trigger = one_shot_trigger("cascade-t", &job.key, t0 + Duration::seconds(60));
    h.store.store_job(&h.cancel, &job, false).await.unwrap();
    h.store
        .store_trigger(&h.cancel, &trigger, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();

    let removed = h.store.remove_trigger(&h.cancel, &trigger.key).await.unwrap();
    assert!(removed);
    assert_eq!(h.signaler.deleted_jobs(), vec![job.key.clone()]);

    // a durable job survives the removal of its last trigger
    h.signaler.clear();
    let durable = test_job("durable").durably();
    let trigger2 = one_shot_trigger("durable-t", &durable.key, t0 + Duration::seconds(60));
    h.store.store_job(&h.cancel, &durable, false).await.unwrap();
    h.store
        .store_trigger(&h.cancel, &trigger2, false, TriggerState::Waiting, false, false)
        .await
        .unwrap();
    h.store.remove_trigger(&h.cancel, &trigger2.key).await.unwrap();
    assert!(h.signaler.deleted_jobs().is_empty());
    assert!(h
        .store
        .retrieve_job(&h.cancel, &durable.key)
        .await
        .unwrap()
        .is_some());
    assert!(!h
        .signaler
        .events()
        .iter()
        .any(|e| matches!(e, SignalEvent::JobDeleted(_))));
}
