use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Group assigned to keys created without an explicit group.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Reserved trigger group for one-shot recovery fires scheduled on behalf of
/// jobs that requested recovery after an instance failure.
pub const RECOVERY_GROUP: &str = "RECOVERING_JOBS";

/// Sentinel paused-group marker meaning "every group".
pub const ALL_GROUPS_PAUSED: &str = "_$_ALL_GROUPS_PAUSED_$_";

/// Name/group identity of a job.
///
/// Back-end rows are keyed by `(scheduler_name, group, name)`; the scheduler
/// name is applied by the delegate, so in-process keys carry only the
/// name/group pair.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    pub group: String,
}

impl JobKey {
    /// Create a key in the default group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: DEFAULT_GROUP.to_string(),
        }
    }

    /// Create a key with an explicit group.
    pub fn with_group(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }
}

impl Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Name/group identity of a trigger.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub name: String,
    pub group: String,
}

impl TriggerKey {
    /// Create a key in the default group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: DEFAULT_GROUP.to_string(),
        }
    }

    /// Create a key with an explicit group.
    pub fn with_group(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }
}

impl Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Reject names and groups containing the back-end path separator.
///
/// Raised at the store boundary before any transaction is opened.
pub fn validate_component(what: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(StoreError::configuration(format!("{what} must not be empty")));
    }
    if value.contains('/') {
        return Err(StoreError::configuration(format!(
            "{what} must not contain '/': {value}"
        )));
    }
    Ok(())
}

/// Validate a job key at the store boundary.
pub fn validate_job_key(key: &JobKey) -> Result<()> {
    validate_component("job name", &key.name)?;
    validate_component("job group", &key.group)
}

/// Validate a trigger key at the store boundary.
pub fn validate_trigger_key(key: &TriggerKey) -> Result<()> {
    validate_component("trigger name", &key.name)?;
    validate_component("trigger group", &key.group)
}

/// Predicate over group names, used by the key-listing and the bulk
/// pause/resume operations.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum GroupMatcher {
    /// Match exactly one group.
    Equals(String),
    /// Match groups with the given prefix.
    StartsWith(String),
    /// Match groups with the given suffix.
    EndsWith(String),
    /// Match groups containing the given substring.
    Contains(String),
    /// Match every group. Always yields the unfiltered query.
    Anything,
}

impl GroupMatcher {
    /// Equality matcher for the default group.
    pub fn default_group() -> Self {
        Self::Equals(DEFAULT_GROUP.to_string())
    }

    /// Whether a group name satisfies this matcher.
    pub fn matches(&self, group: &str) -> bool {
        match self {
            Self::Equals(g) => group == g,
            Self::StartsWith(p) => group.starts_with(p.as_str()),
            Self::EndsWith(s) => group.ends_with(s.as_str()),
            Self::Contains(c) => group.contains(c.as_str()),
            Self::Anything => true,
        }
    }

    /// The exact group name, when this is an equality matcher.
    ///
    /// Pausing an equality matcher inserts a paused-group marker even when no
    /// trigger currently lives in the group.
    pub fn exact(&self) -> Option<&str> {
        match self {
            Self::Equals(g) => Some(g.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_default_to_default_group() {
        let key = JobKey::new("ingest");
        assert_eq!(key.group, DEFAULT_GROUP);
        assert_eq!(key.to_string(), "DEFAULT.ingest");

        let key = TriggerKey::with_group("nightly", "reports");
        assert_eq!(key.to_string(), "reports.nightly");
    }

    #[test]
    fn path_separator_rejected() {
        assert!(validate_job_key(&JobKey::new("a/b")).is_err());
        assert!(validate_trigger_key(&TriggerKey::with_group("t", "g/h")).is_err());
        assert!(validate_job_key(&JobKey::new("plain")).is_ok());
    }

    #[test]
    fn empty_component_rejected() {
        assert!(validate_job_key(&JobKey::with_group("", "g")).is_err());
    }

    #[test]
    fn matcher_semantics() {
        assert!(GroupMatcher::Equals("g".into()).matches("g"));
        assert!(!GroupMatcher::Equals("g".into()).matches("gh"));
        assert!(GroupMatcher::StartsWith("re".into()).matches("reports"));
        assert!(GroupMatcher::EndsWith("ts".into()).matches("reports"));
        assert!(GroupMatcher::Contains("por".into()).matches("reports"));
        assert!(GroupMatcher::Anything.matches("anything-at-all"));
    }

    #[test]
    fn exact_only_for_equals() {
        assert_eq!(GroupMatcher::Equals("g".into()).exact(), Some("g"));
        assert_eq!(GroupMatcher::Anything.exact(), None);
        assert_eq!(GroupMatcher::StartsWith("g".into()).exact(), None);
    }
}
