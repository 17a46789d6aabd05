use thiserror::Error;

/// Result type used across the store.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the store and its back-end delegates.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A job, trigger, or calendar was stored without `replace_existing`
    /// while an object with the same key already exists.
    #[error("{kind} already exists: {key}")]
    ObjectAlreadyExists {
        /// Kind of object ("job", "trigger", "calendar").
        kind: &'static str,
        /// Scoped key of the duplicate.
        key: String,
    },

    /// A referenced object is missing, e.g. a trigger stored against a job
    /// the back-end does not know.
    #[error("no such {kind}: {key}")]
    NoSuchObject {
        /// Kind of object ("job", "trigger", "calendar").
        kind: &'static str,
        /// Scoped key that failed to resolve.
        key: String,
    },

    /// The back-end refused to grant a named lock. Contention never produces
    /// this error; obtaining a contended lock blocks instead.
    #[error("lock '{lock}' unavailable")]
    LockUnavailable {
        /// Name of the lock that could not be obtained.
        lock: String,
        #[source]
        source: anyhow::Error,
    },

    /// Any back-end failure inside a transaction. The original cause is
    /// preserved.
    #[error("persistence failure: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Missing or invalid setup, including malformed names and ids.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Cooperative cancellation aborted the operation. The surrounding
    /// transaction rolls back.
    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Create a persistence error from a message.
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence {
            message: message.into(),
            source: None,
        }
    }

    /// Create a persistence error wrapping an underlying cause.
    pub fn persistence_caused<S, E>(message: S, cause: E) -> Self
    where
        S: Into<String>,
        E: Into<anyhow::Error>,
    {
        Self::Persistence {
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    /// Create a configuration error.
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    /// Create an already-exists error for a job key.
    pub fn already_exists(kind: &'static str, key: impl ToString) -> Self {
        Self::ObjectAlreadyExists {
            kind,
            key: key.to_string(),
        }
    }

    /// Create a no-such-object error.
    pub fn no_such(kind: &'static str, key: impl ToString) -> Self {
        Self::NoSuchObject {
            kind,
            key: key.to_string(),
        }
    }

    /// True for errors that pass through the transaction runner unwrapped.
    ///
    /// `ObjectAlreadyExists` is a caller mistake, not a back-end fault, and
    /// keeps its type across the runner. Cancellation rolls the transaction
    /// back with a cancellation error, never a persistence one. Everything
    /// else raised inside runner work is rewrapped as `Persistence`.
    pub fn passes_through_runner(&self) -> bool {
        matches!(self, Self::ObjectAlreadyExists { .. } | Self::Cancelled)
    }

    /// True when a retry loop may reasonably try the operation again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Persistence { .. } | Self::LockUnavailable { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::persistence_caused("serialization failure", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_exists_passes_through() {
        let err = StoreError::already_exists("job", "DEFAULT.ingest");
        assert!(err.passes_through_runner());
        assert!(!err.is_retriable());
    }

    #[test]
    fn persistence_is_retriable() {
        let err = StoreError::persistence("connection reset");
        assert!(err.is_retriable());
        assert!(!err.passes_through_runner());
    }

    #[test]
    fn cancelled_is_not_retriable() {
        assert!(!StoreError::Cancelled.is_retriable());
        assert!(StoreError::Cancelled.passes_through_runner());
    }
}
