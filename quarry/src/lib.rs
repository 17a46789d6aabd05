//! Quarry - clustered persistent trigger/job store for embedding schedulers.
//!
//! A foundational crate providing the transactional state machine behind a
//! distributed scheduler: triggers (time-based firing specifications), jobs
//! (the work bound to triggers), and the coordination that lets several
//! scheduler instances share one back-end store so each scheduled fire
//! executes on exactly one instance, with recovery when an instance dies
//! mid-execution.
//!
//! # Core Concepts
//!
//! - **Job**: persistent description of work, identified by name and group.
//!   Jobs carry flags controlling concurrency exclusion, durability, data
//!   persistence, and crash recovery. See [`JobDetail`].
//!
//! - **Trigger**: a firing specification bound to a job, with a priority, an
//!   optional calendar, and a misfire policy. The store drives each trigger
//!   through the Waiting / Acquired / Executing / Blocked / Paused /
//!   Complete / Error state machine. See [`Trigger`] and [`TriggerState`].
//!
//! - **Delegate**: the narrow back-end port. Every persistent effect goes
//!   through one [`Delegate`] call; adapters implement it per back-end (the
//!   `postgres` feature ships a relational adapter). See [`Delegate`].
//!
//! - **Locks**: two named locks (`TRIGGER_ACCESS`, `STATE_ACCESS`) make the
//!   state machine safe across processes, backed either by in-process
//!   monitors or by row locks in the shared store. See [`LockManager`].
//!
//! - **Pipeline**: the hot path `acquire_next_triggers` →
//!   `triggers_fired` → `triggered_job_complete`, with an execution ledger
//!   of [`FiredTriggerRecord`]s that survives crashes.
//!
//! - **Cluster**: periodic check-ins detect failed peers; their in-flight
//!   fires are returned to rotation or replayed through one-shot recovery
//!   triggers.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL delegate via sqlx (requires database setup)
//!
//! # Quick Start
//!
//! ```ignore
//! use quarry::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> quarry::Result<()> {
//!     let config = StoreConfig::default();
//!     // let delegate = Arc::new(PostgresDelegate::new(pool, &config.instance_name));
//!     // let store = JobStore::initialize(config, delegate, signaler, loader, clock).await?;
//!     //
//!     // store.store_job(&cancel, &job, false).await?;
//!     // store.store_trigger(&cancel, &trigger, false, TriggerState::Waiting, false, false).await?;
//!     // let due = store.acquire_next_triggers(&cancel, now, 10, Duration::zero()).await?;
//!     Ok(())
//! }
//! ```

/// Calendar values: excluded time ranges consulted when triggers advance.
pub mod calendar;

/// Cooperative cancellation token threaded through every operation.
pub mod cancel;

/// Cluster membership records, failure detection, and peer recovery.
pub mod cluster;

/// Configuration surface of the store.
pub mod config;

/// The back-end port: every persistent effect goes through this trait.
pub mod delegate;

/// Typed store errors and the crate-wide `Result` alias.
pub mod error;

/// The execution ledger: fire instance ids and fired-trigger records.
pub mod fired;

/// Background task spawners for misfire and cluster housekeeping.
pub mod housekeeping;

/// Persistent job records.
pub mod job;

/// Name/group identity and group matchers.
pub mod key;

/// Named mutual-exclusion primitives and their two implementations.
pub mod lock;

/// Misfire detection, misfire policies, and startup recovery.
pub mod misfire;

/// Pause/resume of triggers, trigger groups, jobs, and job groups.
pub mod pause;

/// The acquire / fire / complete hot path.
pub mod pipeline;

/// Consumed ports: the signaler, clock, and job type loader.
pub mod signaler;

/// The store itself and its transaction runner.
pub mod store;

/// Tracing span helpers for the hot paths.
pub mod telemetry;

/// Trigger records, schedules, states, and misfire instructions.
pub mod trigger;

#[cfg(feature = "postgres")]
/// PostgreSQL delegate implementation.
pub mod persistence;

pub use calendar::Calendar;
pub use cancel::CancelToken;
pub use cluster::{failed_if_after, SchedulerStateRecord, CLUSTER_CHECKIN_LATENCY_MS};
pub use config::{IsolationLevel, StoreConfig};
pub use delegate::{Delegate, SchedulerLifecycle, TriggerStatus};
pub use error::{Result, StoreError};
pub use fired::{FireInstanceId, FiredBundle, FiredState, FiredTriggerRecord};
pub use job::{JobDataMap, JobDetail};
pub use key::{
    GroupMatcher, JobKey, TriggerKey, ALL_GROUPS_PAUSED, DEFAULT_GROUP, RECOVERY_GROUP,
};
pub use lock::{LockManager, LockName, MonitorLockManager, RequestorId, SessionLockManager};
pub use misfire::RecoverMisfiresResult;
pub use signaler::{Clock, PermissiveTypeLoader, Signaler, SystemClock, TypeLoader};
pub use store::{CompletedExecutionInstruction, JobStore, TxContext};
pub use trigger::{
    ExternalTriggerState, MisfireInstruction, Schedule, SimpleSchedule, Trigger, TriggerState,
    DEFAULT_PRIORITY,
};

#[cfg(feature = "postgres")]
pub use persistence::PostgresDelegate;
