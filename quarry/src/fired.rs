use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::job::{JobDataMap, JobDetail};
use crate::key::{JobKey, TriggerKey};
use crate::trigger::Trigger;

/// Cluster-unique identifier of one attempted fire, assigned at acquire
/// time: the owning instance id plus a process-monotonic counter.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FireInstanceId(pub String);

impl FireInstanceId {
    /// Compose an id from the instance name and a monotonic counter value.
    pub fn compose(instance_id: &str, counter: u64) -> Self {
        Self(format!("{instance_id}-{counter}"))
    }
}

impl Display for FireInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of an in-flight fire in the execution ledger.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FiredState {
    /// Reserved at acquire time; execution has not begun.
    Acquired,
    /// Handed to the scheduler runtime for execution.
    Executing,
}

impl FiredState {
    /// Stable identifier used by back-end delegates.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquired => "ACQUIRED",
            Self::Executing => "EXECUTING",
        }
    }

    /// Parse the identifier produced by [`as_str`](Self::as_str).
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACQUIRED" => Some(Self::Acquired),
            "EXECUTING" => Some(Self::Executing),
            _ => None,
        }
    }
}

/// One row of the execution ledger: a fire reserved or running somewhere in
/// the cluster. Cluster recovery and the blocked-state check both read this.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
    pub fire_instance_id: FireInstanceId,
    /// Scheduler instance that owns this fire.
    pub instance_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    pub state: FiredState,
    pub priority: i32,
    /// When the row was written (acquire time) or promoted to Executing.
    pub fired_at: DateTime<Utc>,
    /// Scheduled fire time of the trigger at acquisition.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Snapshot of the owning job's concurrency flag.
    pub is_non_concurrent: bool,
    /// Snapshot of the owning job's recovery flag.
    pub requests_recovery: bool,
    /// Snapshot of the job data map, taken when the row turns Executing.
    pub job_data: Option<JobDataMap>,
}

/// Everything the scheduler runtime needs to execute one fire, returned by
/// `triggers_fired` after the store records the transition to Executing.
#[derive(Clone, Debug)]
pub struct FiredBundle {
    pub job: JobDetail,
    /// The trigger as updated by the fire (previous/next fire times advanced).
    pub trigger: Trigger,
    pub calendar: Option<Calendar>,
    /// True when the trigger lives in the reserved recovery group.
    pub recovering: bool,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_instance_id_is_scoped_to_instance() {
        let a = FireInstanceId::compose("node-a", 7);
        let b = FireInstanceId::compose("node-b", 7);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "node-a-7");
    }

    #[test]
    fn fired_state_round_trips() {
        for state in [FiredState::Acquired, FiredState::Executing] {
            assert_eq!(FiredState::parse(state.as_str()), Some(state));
        }
        assert_eq!(FiredState::parse("COMPLETE"), None);
    }
}
