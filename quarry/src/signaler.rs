use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::key::JobKey;
use crate::trigger::Trigger;

/// Callback surface through which the store announces listener events and
/// scheduling-change hints to the embedding scheduler.
///
/// `signal_scheduling_change` is only ever invoked after a transaction
/// commits. The listener notifications may be invoked with a transaction
/// open; the scheduler implementation must tolerate that.
#[async_trait]
pub trait Signaler: Send + Sync {
    /// The earliest next fire time may have moved; `candidate` is the new
    /// earliest time when known.
    async fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>);

    /// A background task hit an error it absorbed rather than propagated.
    async fn notify_scheduler_listeners_error(&self, message: &str, error: &StoreError);

    /// A job was deleted as a cascade of its last non-durable trigger.
    async fn notify_scheduler_listeners_job_deleted(&self, job_key: &JobKey);

    /// A trigger reached the end of its schedule and will not fire again.
    async fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger);

    /// A trigger misfired and its misfire policy was applied.
    async fn notify_trigger_listeners_misfired(&self, trigger: &Trigger);
}

/// Source of the current instant, injectable for deterministic tests.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used outside tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Resolves job implementation type identifiers for the embedding scheduler.
///
/// The store itself never executes jobs; it consults the loader only to
/// reject fires whose job type can no longer be resolved.
pub trait TypeLoader: Send + Sync {
    /// Resolve a job type identifier, erring when the type is unknown.
    fn resolve_job_type(&self, job_type: &str) -> anyhow::Result<()>;
}

/// Loader that accepts every type identifier. Suitable when the embedding
/// scheduler performs its own resolution at execution time.
#[derive(Clone, Copy, Debug, Default)]
pub struct PermissiveTypeLoader;

impl TypeLoader for PermissiveTypeLoader {
    fn resolve_job_type(&self, _job_type: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
