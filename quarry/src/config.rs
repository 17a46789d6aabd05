use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Transaction isolation level requested from the back-end.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    Serializable,
}

/// Configuration surface of the store.
///
/// `instance_name` scopes every persistent record; `instance_id` must be
/// unique per process within the cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Scheduler name; scopes every record. Must not contain '/'.
    pub instance_name: String,
    /// This process's unique id within the cluster.
    pub instance_id: String,
    /// Enables the cluster check-in protocol, forces store-backed locks,
    /// and disables the calendar cache.
    pub clustered: bool,
    /// Use store-backed locks even when unclustered.
    pub use_db_locks: bool,
    /// Isolation level for back-end transactions.
    pub isolation_level: IsolationLevel,
    /// Backoff between retried persistence operations, in milliseconds.
    pub db_retry_interval_ms: u64,
    /// How far past its fire time a Waiting trigger may slip before it
    /// counts as misfired, in milliseconds.
    pub misfire_threshold_ms: u64,
    /// Page size for the misfire handler.
    pub max_misfires_to_handle_at_a_time: usize,
    /// Force `acquire_next_triggers` to hold TRIGGER_ACCESS even for
    /// single-trigger unclustered acquisitions.
    pub acquire_triggers_within_lock: bool,
    /// Period of the cluster check-in task, in milliseconds.
    pub cluster_checkin_interval_ms: u64,
    /// Run the cheap misfire count peek before taking the lock.
    pub double_check_lock_misfire_handler: bool,
    /// Log a retried action's failure only every N attempts.
    pub retryable_action_error_log_threshold: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            instance_name: "QuarryScheduler".to_string(),
            instance_id: "NON_CLUSTERED".to_string(),
            clustered: false,
            use_db_locks: false,
            isolation_level: IsolationLevel::default(),
            db_retry_interval_ms: 15_000,
            misfire_threshold_ms: 60_000,
            max_misfires_to_handle_at_a_time: 20,
            acquire_triggers_within_lock: false,
            cluster_checkin_interval_ms: 7_500,
            double_check_lock_misfire_handler: true,
            retryable_action_error_log_threshold: 4,
        }
    }
}

impl StoreConfig {
    /// Validate the configuration at initialization.
    pub fn validate(&self) -> Result<()> {
        if self.instance_name.is_empty() {
            return Err(StoreError::configuration("instance_name must not be empty"));
        }
        if self.instance_name.contains('/') {
            return Err(StoreError::configuration(
                "instance_name must not contain '/'",
            ));
        }
        if self.instance_id.is_empty() {
            return Err(StoreError::configuration("instance_id must not be empty"));
        }
        if self.cluster_checkin_interval_ms == 0 {
            return Err(StoreError::configuration(
                "cluster_checkin_interval_ms must be positive",
            ));
        }
        if self.max_misfires_to_handle_at_a_time == 0 {
            return Err(StoreError::configuration(
                "max_misfires_to_handle_at_a_time must be positive",
            ));
        }
        Ok(())
    }

    /// Store-backed locks are mandatory when clustered.
    pub fn requires_session_locks(&self) -> bool {
        self.clustered || self.use_db_locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(StoreConfig::default().validate().is_ok());
    }

    #[test]
    fn instance_name_with_separator_rejected() {
        let config = StoreConfig {
            instance_name: "sched/a".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn clustering_forces_session_locks() {
        let config = StoreConfig {
            clustered: true,
            use_db_locks: false,
            ..Default::default()
        };
        assert!(config.requires_session_locks());
    }
}
