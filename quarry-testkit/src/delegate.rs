use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quarry::delegate::{Delegate, SchedulerLifecycle, TriggerStatus};
use quarry::{
    Calendar, CancelToken, FireInstanceId, FiredTriggerRecord, GroupMatcher, IsolationLevel,
    JobDataMap, JobDetail, JobKey, LockName, Result, SchedulerStateRecord, StoreError, Trigger,
    TriggerKey, TriggerState,
};

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobKey, JobDetail>,
    triggers: HashMap<TriggerKey, (Trigger, TriggerState)>,
    calendars: HashMap<String, Calendar>,
    fired: HashMap<String, FiredTriggerRecord>,
    scheduler_states: HashMap<String, SchedulerStateRecord>,
    paused_trigger_groups: HashSet<String>,
    paused_job_groups: HashSet<String>,
    lifecycle: Option<SchedulerLifecycle>,
}

/// In-memory back-end for tests.
///
/// Mutations apply immediately; transaction boundaries are checkpoints
/// only (commit and rollback are no-ops). The cancellation token rides as
/// the transaction handle so every call honors cooperative cancellation.
#[derive(Debug, Default)]
pub struct InMemoryDelegate {
    inner: Mutex<Inner>,
}

impl InMemoryDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read of a trigger's persisted state, for assertions.
    pub fn trigger_state(&self, key: &TriggerKey) -> Option<TriggerState> {
        self.inner.lock().triggers.get(key).map(|(_, state)| *state)
    }

    /// Direct read of all fired-trigger rows, for assertions.
    pub fn fired_records(&self) -> Vec<FiredTriggerRecord> {
        self.inner.lock().fired.values().cloned().collect()
    }

    /// Direct read of the membership rows, for assertions.
    pub fn scheduler_states(&self) -> Vec<SchedulerStateRecord> {
        self.inner
            .lock()
            .scheduler_states
            .values()
            .cloned()
            .collect()
    }

    /// Direct read of the recorded lifecycle, for assertions.
    pub fn lifecycle(&self) -> Option<SchedulerLifecycle> {
        self.inner.lock().lifecycle
    }

    /// Seed a fired-trigger row, e.g. to fake a crashed peer's ledger.
    pub fn seed_fired_record(&self, record: FiredTriggerRecord) {
        self.inner
            .lock()
            .fired
            .insert(record.fire_instance_id.0.clone(), record);
    }

    /// Seed a membership row, e.g. to fake a stale peer.
    pub fn seed_scheduler_state(&self, record: SchedulerStateRecord) {
        self.inner
            .lock()
            .scheduler_states
            .insert(record.instance_id.clone(), record);
    }

    fn sorted_by_fire_order(mut keys: Vec<(TriggerKey, DateTime<Utc>, i32)>) -> Vec<TriggerKey> {
        keys.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)));
        keys.into_iter().map(|(key, _, _)| key).collect()
    }
}

#[async_trait]
impl Delegate for InMemoryDelegate {
    type Tx = CancelToken;

    async fn begin(&self, _isolation: IsolationLevel, cancel: CancelToken) -> Result<CancelToken> {
        cancel.check()?;
        Ok(cancel)
    }

    async fn commit(&self, tx: CancelToken) -> Result<()> {
        tx.check()
    }

    async fn rollback(&self, _tx: CancelToken) -> Result<()> {
        Ok(())
    }

    async fn lock_row(&self, tx: &mut CancelToken, _lock: LockName) -> Result<()> {
        // no row locks in memory; mutual exclusion comes from the monitor
        // lock manager in unclustered test setups
        tx.check()
    }

    async fn job_exists(&self, tx: &mut CancelToken, key: &JobKey) -> Result<bool> {
        tx.check()?;
        Ok(self.inner.lock().jobs.contains_key(key))
    }

    async fn trigger_exists(&self, tx: &mut CancelToken, key: &TriggerKey) -> Result<bool> {
        tx.check()?;
        Ok(self.inner.lock().triggers.contains_key(key))
    }

    async fn calendar_exists(&self, tx: &mut CancelToken, name: &str) -> Result<bool> {
        tx.check()?;
        Ok(self.inner.lock().calendars.contains_key(name))
    }

    async fn calendar_is_referenced(&self, tx: &mut CancelToken, name: &str) -> Result<bool> {
        tx.check()?;
        Ok(self
            .inner
            .lock()
            .triggers
            .values()
            .any(|(t, _)| t.calendar_name.as_deref() == Some(name)))
    }

    async fn select_job(&self, tx: &mut CancelToken, key: &JobKey) -> Result<Option<JobDetail>> {
        tx.check()?;
        Ok(self.inner.lock().jobs.get(key).cloned())
    }

    async fn select_trigger(
        &self,
        tx: &mut CancelToken,
        key: &TriggerKey,
    ) -> Result<Option<Trigger>> {
        tx.check()?;
        Ok(self.inner.lock().triggers.get(key).map(|(t, _)| t.clone()))
    }

    async fn select_trigger_state(
        &self,
        tx: &mut CancelToken,
        key: &TriggerKey,
    ) -> Result<Option<TriggerState>> {
        tx.check()?;
        Ok(self.inner.lock().triggers.get(key).map(|(_, s)| *s))
    }

    async fn select_trigger_status(
        &self,
        tx: &mut CancelToken,
        key: &TriggerKey,
    ) -> Result<Option<TriggerStatus>> {
        tx.check()?;
        Ok(self.inner.lock().triggers.get(key).map(|(t, s)| TriggerStatus {
            state: *s,
            next_fire_time: t.next_fire_time,
            job_key: t.job_key.clone(),
        }))
    }

    async fn select_trigger_job_data(
        &self,
        tx: &mut CancelToken,
        key: &TriggerKey,
    ) -> Result<Option<JobDataMap>> {
        tx.check()?;
        Ok(self.inner.lock().triggers.get(key).map(|(t, _)| t.data.clone()))
    }

    async fn select_calendar(&self, tx: &mut CancelToken, name: &str) -> Result<Option<Calendar>> {
        tx.check()?;
        Ok(self.inner.lock().calendars.get(name).cloned())
    }

    async fn select_triggers_for_job(
        &self,
        tx: &mut CancelToken,
        job: &JobKey,
    ) -> Result<Vec<Trigger>> {
        tx.check()?;
        let mut triggers: Vec<Trigger> = self
            .inner
            .lock()
            .triggers
            .values()
            .filter(|(t, _)| &t.job_key == job)
            .map(|(t, _)| t.clone())
            .collect();
        triggers.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(triggers)
    }

    async fn select_trigger_keys_for_job(
        &self,
        tx: &mut CancelToken,
        job: &JobKey,
    ) -> Result<Vec<TriggerKey>> {
        tx.check()?;
        let mut keys: Vec<TriggerKey> = self
            .inner
            .lock()
            .triggers
            .values()
            .filter(|(t, _)| &t.job_key == job)
            .map(|(t, _)| t.key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn count_triggers_for_job(&self, tx: &mut CancelToken, job: &JobKey) -> Result<usize> {
        tx.check()?;
        Ok(self
            .inner
            .lock()
            .triggers
            .values()
            .filter(|(t, _)| &t.job_key == job)
            .count())
    }

    async fn select_triggers_for_calendar(
        &self,
        tx: &mut CancelToken,
        name: &str,
    ) -> Result<Vec<TriggerKey>> {
        tx.check()?;
        Ok(self
            .inner
            .lock()
            .triggers
            .values()
            .filter(|(t, _)| t.calendar_name.as_deref() == Some(name))
            .map(|(t, _)| t.key.clone())
            .collect())
    }

    async fn select_triggers_in_state(
        &self,
        tx: &mut CancelToken,
        state: TriggerState,
    ) -> Result<Vec<TriggerKey>> {
        tx.check()?;
        let mut keys: Vec<TriggerKey> = self
            .inner
            .lock()
            .triggers
            .iter()
            .filter(|(_, (_, s))| *s == state)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn select_triggers_to_acquire(
        &self,
        tx: &mut CancelToken,
        no_later_than: DateTime<Utc>,
        no_earlier_than: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<TriggerKey>> {
        tx.check()?;
        let candidates: Vec<(TriggerKey, DateTime<Utc>, i32)> = self
            .inner
            .lock()
            .triggers
            .values()
            .filter_map(|(t, s)| match (s, t.next_fire_time) {
                (TriggerState::Waiting, Some(next))
                    if next <= no_later_than && next > no_earlier_than =>
                {
                    Some((t.key.clone(), next, t.priority))
                }
                _ => None,
            })
            .collect();
        let mut keys = Self::sorted_by_fire_order(candidates);
        keys.truncate(max_count);
        Ok(keys)
    }

    async fn select_job_keys(
        &self,
        tx: &mut CancelToken,
        matcher: &GroupMatcher,
    ) -> Result<Vec<JobKey>> {
        tx.check()?;
        let mut keys: Vec<JobKey> = self
            .inner
            .lock()
            .jobs
            .keys()
            .filter(|key| matcher.matches(&key.group))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn select_trigger_keys(
        &self,
        tx: &mut CancelToken,
        matcher: &GroupMatcher,
    ) -> Result<Vec<TriggerKey>> {
        tx.check()?;
        let mut keys: Vec<TriggerKey> = self
            .inner
            .lock()
            .triggers
            .keys()
            .filter(|key| matcher.matches(&key.group))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn select_job_groups(&self, tx: &mut CancelToken) -> Result<Vec<String>> {
        tx.check()?;
        let mut groups: Vec<String> = self
            .inner
            .lock()
            .jobs
            .keys()
            .map(|key| key.group.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        groups.sort();
        Ok(groups)
    }

    async fn select_trigger_groups(
        &self,
        tx: &mut CancelToken,
        matcher: Option<&GroupMatcher>,
    ) -> Result<Vec<String>> {
        tx.check()?;
        let mut groups: Vec<String> = self
            .inner
            .lock()
            .triggers
            .keys()
            .map(|key| key.group.clone())
            .filter(|group| matcher.map(|m| m.matches(group)).unwrap_or(true))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        groups.sort();
        Ok(groups)
    }

    async fn select_calendar_names(&self, tx: &mut CancelToken) -> Result<Vec<String>> {
        tx.check()?;
        let mut names: Vec<String> = self.inner.lock().calendars.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn count_jobs(&self, tx: &mut CancelToken) -> Result<usize> {
        tx.check()?;
        Ok(self.inner.lock().jobs.len())
    }

    async fn count_triggers(&self, tx: &mut CancelToken) -> Result<usize> {
        tx.check()?;
        Ok(self.inner.lock().triggers.len())
    }

    async fn count_calendars(&self, tx: &mut CancelToken) -> Result<usize> {
        tx.check()?;
        Ok(self.inner.lock().calendars.len())
    }

    async fn select_jobs_requesting_recovery(&self, tx: &mut CancelToken) -> Result<Vec<JobKey>> {
        tx.check()?;
        let mut keys: Vec<JobKey> = self
            .inner
            .lock()
            .jobs
            .values()
            .filter(|job| job.requests_recovery)
            .map(|job| job.key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn count_misfired_triggers_in_state(
        &self,
        tx: &mut CancelToken,
        state: TriggerState,
        before: DateTime<Utc>,
    ) -> Result<usize> {
        tx.check()?;
        Ok(self
            .inner
            .lock()
            .triggers
            .values()
            .filter(|(t, s)| *s == state && t.next_fire_time.map(|n| n < before).unwrap_or(false))
            .count())
    }

    async fn select_misfired_triggers_in_state(
        &self,
        tx: &mut CancelToken,
        state: TriggerState,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<(Vec<TriggerKey>, bool)> {
        tx.check()?;
        let candidates: Vec<(TriggerKey, DateTime<Utc>, i32)> = self
            .inner
            .lock()
            .triggers
            .values()
            .filter_map(|(t, s)| match (s, t.next_fire_time) {
                (s2, Some(next)) if *s2 == state && next < before => {
                    Some((t.key.clone(), next, t.priority))
                }
                _ => None,
            })
            .collect();
        let keys = Self::sorted_by_fire_order(candidates);
        let has_more = keys.len() > limit;
        Ok((keys.into_iter().take(limit).collect(), has_more))
    }

    async fn insert_fired_trigger(
        &self,
        tx: &mut CancelToken,
        record: &FiredTriggerRecord,
    ) -> Result<()> {
        tx.check()?;
        let mut inner = self.inner.lock();
        if inner.fired.contains_key(&record.fire_instance_id.0) {
            return Err(StoreError::persistence(format!(
                "duplicate fired trigger {}",
                record.fire_instance_id
            )));
        }
        inner
            .fired
            .insert(record.fire_instance_id.0.clone(), record.clone());
        Ok(())
    }

    async fn update_fired_trigger(
        &self,
        tx: &mut CancelToken,
        record: &FiredTriggerRecord,
    ) -> Result<()> {
        tx.check()?;
        self.inner
            .lock()
            .fired
            .insert(record.fire_instance_id.0.clone(), record.clone());
        Ok(())
    }

    async fn select_fired_trigger_records(
        &self,
        tx: &mut CancelToken,
        key: &TriggerKey,
    ) -> Result<Vec<FiredTriggerRecord>> {
        tx.check()?;
        Ok(self
            .inner
            .lock()
            .fired
            .values()
            .filter(|r| &r.trigger_key == key)
            .cloned()
            .collect())
    }

    async fn select_fired_trigger_records_for_job(
        &self,
        tx: &mut CancelToken,
        job: &JobKey,
    ) -> Result<Vec<FiredTriggerRecord>> {
        tx.check()?;
        Ok(self
            .inner
            .lock()
            .fired
            .values()
            .filter(|r| r.job_key.name == job.name && r.job_key.group == job.group)
            .cloned()
            .collect())
    }

    async fn select_instance_fired_trigger_records(
        &self,
        tx: &mut CancelToken,
        instance_id: &str,
    ) -> Result<Vec<FiredTriggerRecord>> {
        tx.check()?;
        Ok(self
            .inner
            .lock()
            .fired
            .values()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn select_fired_trigger_instance_ids(
        &self,
        tx: &mut CancelToken,
    ) -> Result<HashSet<String>> {
        tx.check()?;
        Ok(self
            .inner
            .lock()
            .fired
            .values()
            .map(|r| r.instance_id.clone())
            .collect())
    }

    async fn delete_fired_trigger(
        &self,
        tx: &mut CancelToken,
        fire_instance_id: &FireInstanceId,
    ) -> Result<bool> {
        tx.check()?;
        Ok(self
            .inner
            .lock()
            .fired
            .remove(&fire_instance_id.0)
            .is_some())
    }

    async fn delete_fired_triggers(
        &self,
        tx: &mut CancelToken,
        instance_id: Option<&str>,
    ) -> Result<u64> {
        tx.check()?;
        let mut inner = self.inner.lock();
        let before = inner.fired.len();
        match instance_id {
            Some(instance_id) => inner.fired.retain(|_, r| r.instance_id != instance_id),
            None => inner.fired.clear(),
        }
        Ok((before - inner.fired.len()) as u64)
    }

    async fn insert_job(&self, tx: &mut CancelToken, job: &JobDetail) -> Result<()> {
        tx.check()?;
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.key) {
            return Err(StoreError::persistence(format!(
                "duplicate job row {}",
                job.key
            )));
        }
        inner.jobs.insert(job.key.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, tx: &mut CancelToken, job: &JobDetail) -> Result<()> {
        tx.check()?;
        self.inner.lock().jobs.insert(job.key.clone(), job.clone());
        Ok(())
    }

    async fn update_job_data(
        &self,
        tx: &mut CancelToken,
        key: &JobKey,
        data: &JobDataMap,
    ) -> Result<()> {
        tx.check()?;
        if let Some(job) = self.inner.lock().jobs.get_mut(key) {
            job.data = data.clone();
        }
        Ok(())
    }

    async fn delete_job(&self, tx: &mut CancelToken, key: &JobKey) -> Result<bool> {
        tx.check()?;
        Ok(self.inner.lock().jobs.remove(key).is_some())
    }

    async fn insert_trigger(
        &self,
        tx: &mut CancelToken,
        trigger: &Trigger,
        state: TriggerState,
    ) -> Result<()> {
        tx.check()?;
        let mut inner = self.inner.lock();
        if inner.triggers.contains_key(&trigger.key) {
            return Err(StoreError::persistence(format!(
                "duplicate trigger row {}",
                trigger.key
            )));
        }
        inner
            .triggers
            .insert(trigger.key.clone(), (trigger.clone(), state));
        Ok(())
    }

    async fn update_trigger(&self, tx: &mut CancelToken, trigger: &Trigger) -> Result<()> {
        tx.check()?;
        let mut inner = self.inner.lock();
        match inner.triggers.get_mut(&trigger.key) {
            Some(entry) => {
                entry.0 = trigger.clone();
                Ok(())
            }
            None => Err(StoreError::persistence(format!(
                "update of missing trigger row {}",
                trigger.key
            ))),
        }
    }

    async fn delete_trigger(&self, tx: &mut CancelToken, key: &TriggerKey) -> Result<bool> {
        tx.check()?;
        Ok(self.inner.lock().triggers.remove(key).is_some())
    }

    async fn insert_calendar(
        &self,
        tx: &mut CancelToken,
        name: &str,
        cal: &Calendar,
    ) -> Result<()> {
        tx.check()?;
        self.inner
            .lock()
            .calendars
            .insert(name.to_string(), cal.clone());
        Ok(())
    }

    async fn update_calendar(
        &self,
        tx: &mut CancelToken,
        name: &str,
        cal: &Calendar,
    ) -> Result<()> {
        tx.check()?;
        self.inner
            .lock()
            .calendars
            .insert(name.to_string(), cal.clone());
        Ok(())
    }

    async fn delete_calendar(&self, tx: &mut CancelToken, name: &str) -> Result<bool> {
        tx.check()?;
        Ok(self.inner.lock().calendars.remove(name).is_some())
    }

    async fn update_trigger_state(
        &self,
        tx: &mut CancelToken,
        key: &TriggerKey,
        new_state: TriggerState,
    ) -> Result<()> {
        tx.check()?;
        if let Some(entry) = self.inner.lock().triggers.get_mut(key) {
            entry.1 = new_state;
        }
        Ok(())
    }

    async fn update_trigger_state_from_other_state(
        &self,
        tx: &mut CancelToken,
        key: &TriggerKey,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<u64> {
        tx.check()?;
        let mut inner = self.inner.lock();
        match inner.triggers.get_mut(key) {
            Some(entry) if entry.1 == old_state => {
                entry.1 = new_state;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn update_trigger_states_from_other_states(
        &self,
        tx: &mut CancelToken,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<u64> {
        tx.check()?;
        let mut affected = 0;
        for entry in self.inner.lock().triggers.values_mut() {
            if old_states.contains(&entry.1) {
                entry.1 = new_state;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn update_trigger_group_states_from_other_states(
        &self,
        tx: &mut CancelToken,
        matcher: &GroupMatcher,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<u64> {
        tx.check()?;
        let mut affected = 0;
        for (key, entry) in self.inner.lock().triggers.iter_mut() {
            if matcher.matches(&key.group) && old_states.contains(&entry.1) {
                entry.1 = new_state;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn update_trigger_states_for_job(
        &self,
        tx: &mut CancelToken,
        job: &JobKey,
        new_state: TriggerState,
    ) -> Result<u64> {
        tx.check()?;
        let mut affected = 0;
        for entry in self.inner.lock().triggers.values_mut() {
            if &entry.0.job_key == job {
                entry.1 = new_state;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn update_trigger_states_for_job_from_other_state(
        &self,
        tx: &mut CancelToken,
        job: &JobKey,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<u64> {
        tx.check()?;
        let mut affected = 0;
        for entry in self.inner.lock().triggers.values_mut() {
            if &entry.0.job_key == job && entry.1 == old_state {
                entry.1 = new_state;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn insert_paused_trigger_group(&self, tx: &mut CancelToken, group: &str) -> Result<()> {
        tx.check()?;
        self.inner
            .lock()
            .paused_trigger_groups
            .insert(group.to_string());
        Ok(())
    }

    async fn delete_paused_trigger_group(
        &self,
        tx: &mut CancelToken,
        group: &str,
    ) -> Result<bool> {
        tx.check()?;
        Ok(self.inner.lock().paused_trigger_groups.remove(group))
    }

    async fn select_paused_trigger_groups(&self, tx: &mut CancelToken) -> Result<HashSet<String>> {
        tx.check()?;
        Ok(self.inner.lock().paused_trigger_groups.clone())
    }

    async fn is_trigger_group_paused(&self, tx: &mut CancelToken, group: &str) -> Result<bool> {
        tx.check()?;
        Ok(self.inner.lock().paused_trigger_groups.contains(group))
    }

    async fn insert_paused_job_group(&self, tx: &mut CancelToken, group: &str) -> Result<()> {
        tx.check()?;
        self.inner
            .lock()
            .paused_job_groups
            .insert(group.to_string());
        Ok(())
    }

    async fn delete_paused_job_group(&self, tx: &mut CancelToken, group: &str) -> Result<bool> {
        tx.check()?;
        Ok(self.inner.lock().paused_job_groups.remove(group))
    }

    async fn select_paused_job_groups(&self, tx: &mut CancelToken) -> Result<HashSet<String>> {
        tx.check()?;
        Ok(self.inner.lock().paused_job_groups.clone())
    }

    async fn is_job_group_paused(&self, tx: &mut CancelToken, group: &str) -> Result<bool> {
        tx.check()?;
        Ok(self.inner.lock().paused_job_groups.contains(group))
    }

    async fn set_scheduler_lifecycle(
        &self,
        tx: &mut CancelToken,
        lifecycle: SchedulerLifecycle,
    ) -> Result<()> {
        tx.check()?;
        self.inner.lock().lifecycle = Some(lifecycle);
        Ok(())
    }

    async fn insert_scheduler_state(
        &self,
        tx: &mut CancelToken,
        record: &SchedulerStateRecord,
    ) -> Result<()> {
        tx.check()?;
        self.inner
            .lock()
            .scheduler_states
            .insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn update_scheduler_state(
        &self,
        tx: &mut CancelToken,
        instance_id: &str,
        last_checkin: DateTime<Utc>,
    ) -> Result<u64> {
        tx.check()?;
        match self.inner.lock().scheduler_states.get_mut(instance_id) {
            Some(record) => {
                record.last_checkin = last_checkin;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_scheduler_state(&self, tx: &mut CancelToken, instance_id: &str) -> Result<u64> {
        tx.check()?;
        Ok(self
            .inner
            .lock()
            .scheduler_states
            .remove(instance_id)
            .map(|_| 1)
            .unwrap_or(0))
    }

    async fn select_scheduler_state_records(
        &self,
        tx: &mut CancelToken,
        instance_id: Option<&str>,
    ) -> Result<Vec<SchedulerStateRecord>> {
        tx.check()?;
        let inner = self.inner.lock();
        let mut records: Vec<SchedulerStateRecord> = match instance_id {
            Some(instance_id) => inner
                .scheduler_states
                .get(instance_id)
                .cloned()
                .into_iter()
                .collect(),
            None => inner.scheduler_states.values().cloned().collect(),
        };
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(records)
    }

    async fn clear_data(&self, tx: &mut CancelToken) -> Result<()> {
        tx.check()?;
        let mut inner = self.inner.lock();
        inner.jobs.clear();
        inner.triggers.clear();
        inner.calendars.clear();
        inner.fired.clear();
        inner.paused_trigger_groups.clear();
        inner.paused_job_groups.clear();
        Ok(())
    }
}
