use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quarry::{JobKey, Signaler, StoreError, Trigger, TriggerKey};

/// One recorded signaler callback.
#[derive(Clone, Debug, PartialEq)]
pub enum SignalEvent {
    SchedulingChange(Option<DateTime<Utc>>),
    Error(String),
    JobDeleted(JobKey),
    Finalized(TriggerKey),
    Misfired(TriggerKey),
}

/// Signaler that records every callback for assertions.
#[derive(Debug, Default)]
pub struct RecordingSignaler {
    events: Mutex<Vec<SignalEvent>>,
}

impl RecordingSignaler {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, in order.
    pub fn events(&self) -> Vec<SignalEvent> {
        self.events.lock().clone()
    }

    /// Drop recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Count of misfire notifications.
    pub fn misfired_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, SignalEvent::Misfired(_)))
            .count()
    }

    /// Count of finalized notifications.
    pub fn finalized_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, SignalEvent::Finalized(_)))
            .count()
    }

    /// Keys of jobs announced as deleted.
    pub fn deleted_jobs(&self) -> Vec<JobKey> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SignalEvent::JobDeleted(key) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether any scheduling-change signal was delivered.
    pub fn scheduling_change_signalled(&self) -> bool {
        self.events
            .lock()
            .iter()
            .any(|e| matches!(e, SignalEvent::SchedulingChange(_)))
    }
}

#[async_trait]
impl Signaler for RecordingSignaler {
    async fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
        self.events
            .lock()
            .push(SignalEvent::SchedulingChange(candidate));
    }

    async fn notify_scheduler_listeners_error(&self, message: &str, _error: &StoreError) {
        self.events
            .lock()
            .push(SignalEvent::Error(message.to_string()));
    }

    async fn notify_scheduler_listeners_job_deleted(&self, job_key: &JobKey) {
        self.events
            .lock()
            .push(SignalEvent::JobDeleted(job_key.clone()));
    }

    async fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger) {
        self.events
            .lock()
            .push(SignalEvent::Finalized(trigger.key.clone()));
    }

    async fn notify_trigger_listeners_misfired(&self, trigger: &Trigger) {
        self.events
            .lock()
            .push(SignalEvent::Misfired(trigger.key.clone()));
    }
}
