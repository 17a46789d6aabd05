use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::JobKey;

/// Opaque bag of job parameters, persisted alongside the job record and
/// snapshotted into the fired-trigger ledger at fire time.
pub type JobDataMap = HashMap<String, Value>;

/// Persistent description of a job: the work bound to one or more triggers.
///
/// The store never executes jobs; `job_type` is an identifier the embedding
/// scheduler resolves through its [`TypeLoader`](crate::signaler::TypeLoader)
/// when a fire bundle is handed over.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    /// Identity of the job within its scheduler.
    pub key: JobKey,
    /// Free-form description, surfaced to operators only.
    pub description: Option<String>,
    /// Identifier of the job implementation type.
    pub job_type: String,
    /// Job parameters, serialized with the record.
    pub data: JobDataMap,
    /// Forbid parallel executions of this job across all of its triggers
    /// and across the cluster.
    pub concurrent_execution_disallowed: bool,
    /// Write the (possibly mutated) data map back after each execution.
    pub persist_data_after_execution: bool,
    /// Durable jobs survive the deletion of their last trigger.
    pub durable: bool,
    /// Re-fire this job if an instance dies while executing it.
    pub requests_recovery: bool,
}

impl JobDetail {
    /// Create a job detail with the given identity and implementation type,
    /// all flags off.
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            description: None,
            job_type: job_type.into(),
            data: JobDataMap::new(),
            concurrent_execution_disallowed: false,
            persist_data_after_execution: false,
            durable: false,
            requests_recovery: false,
        }
    }

    /// Builder-style toggle for `concurrent_execution_disallowed`.
    pub fn non_concurrent(mut self) -> Self {
        self.concurrent_execution_disallowed = true;
        self
    }

    /// Builder-style toggle for `durable`.
    pub fn durably(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Builder-style toggle for `requests_recovery`.
    pub fn recoverable(mut self) -> Self {
        self.requests_recovery = true;
        self
    }

    /// Builder-style toggle for `persist_data_after_execution`.
    pub fn persisting_data(mut self) -> Self {
        self.persist_data_after_execution = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_flags() {
        let job = JobDetail::new(JobKey::new("ingest"), "app.IngestJob")
            .non_concurrent()
            .durably()
            .recoverable();
        assert!(job.concurrent_execution_disallowed);
        assert!(job.durable);
        assert!(job.requests_recovery);
        assert!(!job.persist_data_after_execution);
    }

    #[test]
    fn data_map_round_trips() {
        let mut job = JobDetail::new(JobKey::new("ingest"), "app.IngestJob");
        job.data.insert("path".into(), Value::String("/tmp/in".into()));

        let json = serde_json::to_string(&job).unwrap();
        let back: JobDetail = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
