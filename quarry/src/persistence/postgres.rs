use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::calendar::Calendar;
use crate::cancel::CancelToken;
use crate::cluster::SchedulerStateRecord;
use crate::config::IsolationLevel;
use crate::delegate::{Delegate, SchedulerLifecycle, TriggerStatus};
use crate::error::{Result, StoreError};
use crate::fired::{FireInstanceId, FiredState, FiredTriggerRecord};
use crate::job::{JobDataMap, JobDetail};
use crate::key::{GroupMatcher, JobKey, TriggerKey};
use crate::lock::LockName;
use crate::trigger::{Trigger, TriggerState};

/// Schema used by the PostgreSQL delegate. Apply once per database, e.g.
/// through [`PostgresDelegate::ensure_schema`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS quarry_jobs (
    sched_name        TEXT        NOT NULL,
    job_name          TEXT        NOT NULL,
    job_group         TEXT        NOT NULL,
    requests_recovery BOOLEAN     NOT NULL DEFAULT FALSE,
    payload           JSONB       NOT NULL,
    PRIMARY KEY (sched_name, job_group, job_name)
);

CREATE TABLE IF NOT EXISTS quarry_triggers (
    sched_name     TEXT        NOT NULL,
    trigger_name   TEXT        NOT NULL,
    trigger_group  TEXT        NOT NULL,
    job_name       TEXT        NOT NULL,
    job_group      TEXT        NOT NULL,
    calendar_name  TEXT,
    priority       INTEGER     NOT NULL DEFAULT 5,
    state          TEXT        NOT NULL,
    next_fire_time TIMESTAMPTZ,
    payload        JSONB       NOT NULL,
    PRIMARY KEY (sched_name, trigger_group, trigger_name)
);

CREATE INDEX IF NOT EXISTS idx_quarry_triggers_acquire
    ON quarry_triggers (sched_name, state, next_fire_time, priority DESC);

CREATE TABLE IF NOT EXISTS quarry_calendars (
    sched_name    TEXT  NOT NULL,
    calendar_name TEXT  NOT NULL,
    payload       JSONB NOT NULL,
    PRIMARY KEY (sched_name, calendar_name)
);

CREATE TABLE IF NOT EXISTS quarry_fired_triggers (
    sched_name        TEXT        NOT NULL,
    fire_instance_id  TEXT        NOT NULL,
    instance_id       TEXT        NOT NULL,
    trigger_name      TEXT        NOT NULL,
    trigger_group     TEXT        NOT NULL,
    job_name          TEXT        NOT NULL,
    job_group         TEXT        NOT NULL,
    state             TEXT        NOT NULL,
    priority          INTEGER     NOT NULL,
    fired_at          TIMESTAMPTZ NOT NULL,
    scheduled_at      TIMESTAMPTZ,
    is_nonconcurrent  BOOLEAN     NOT NULL,
    requests_recovery BOOLEAN     NOT NULL,
    job_data          JSONB,
    PRIMARY KEY (sched_name, fire_instance_id)
);

CREATE INDEX IF NOT EXISTS idx_quarry_fired_instance
    ON quarry_fired_triggers (sched_name, instance_id);

CREATE TABLE IF NOT EXISTS quarry_scheduler_state (
    sched_name          TEXT        NOT NULL,
    instance_id         TEXT        NOT NULL,
    last_checkin        TIMESTAMPTZ NOT NULL,
    checkin_interval_ms BIGINT      NOT NULL,
    PRIMARY KEY (sched_name, instance_id)
);

CREATE TABLE IF NOT EXISTS quarry_paused_trigger_groups (
    sched_name    TEXT NOT NULL,
    trigger_group TEXT NOT NULL,
    PRIMARY KEY (sched_name, trigger_group)
);

CREATE TABLE IF NOT EXISTS quarry_paused_job_groups (
    sched_name TEXT NOT NULL,
    job_group  TEXT NOT NULL,
    PRIMARY KEY (sched_name, job_group)
);

CREATE TABLE IF NOT EXISTS quarry_locks (
    sched_name TEXT NOT NULL,
    lock_name  TEXT NOT NULL,
    PRIMARY KEY (sched_name, lock_name)
);

CREATE TABLE IF NOT EXISTS quarry_schedulers (
    sched_name TEXT NOT NULL,
    lifecycle  TEXT NOT NULL,
    PRIMARY KEY (sched_name)
);
"#;

/// Open transaction handle of the PostgreSQL delegate. The cancellation
/// token travels with the handle; every call checks it before touching the
/// connection.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
    cancel: CancelToken,
}

impl PostgresTx {
    fn checked(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.cancel.check()?;
        Ok(&mut self.tx)
    }
}

/// PostgreSQL-backed implementation of the store's back-end port.
///
/// Rows are scoped by scheduler name; record bodies are stored as JSONB
/// payloads beside the columns the hot-path queries filter on.
#[derive(Debug)]
pub struct PostgresDelegate {
    pool: PgPool,
    sched_name: String,
}

impl PostgresDelegate {
    /// Create a delegate scoped to the given scheduler name.
    pub fn new(pool: PgPool, sched_name: impl Into<String>) -> Self {
        Self {
            pool,
            sched_name: sched_name.into(),
        }
    }

    /// A reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the delegate's schema (idempotent).
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err("apply schema"))?;
        Ok(())
    }

    fn states_vec(states: &[TriggerState]) -> Vec<String> {
        states.iter().map(|s| s.as_str().to_string()).collect()
    }

    fn parse_state(value: &str) -> Result<TriggerState> {
        TriggerState::parse(value)
            .ok_or_else(|| StoreError::persistence(format!("unknown trigger state '{value}'")))
    }

    fn row_to_trigger(row: &sqlx::postgres::PgRow) -> Result<Trigger> {
        let payload: serde_json::Value = row.try_get("payload").map_err(db_err("read payload"))?;
        Ok(serde_json::from_value(payload)?)
    }

    fn row_to_fired(row: &sqlx::postgres::PgRow) -> Result<FiredTriggerRecord> {
        let state: String = row.try_get("state").map_err(db_err("read state"))?;
        let state = FiredState::parse(&state)
            .ok_or_else(|| StoreError::persistence(format!("unknown fired state '{state}'")))?;
        let job_data: Option<serde_json::Value> =
            row.try_get("job_data").map_err(db_err("read job_data"))?;
        let job_data: Option<JobDataMap> = match job_data {
            Some(value) => Some(serde_json::from_value(value)?),
            None => None,
        };
        Ok(FiredTriggerRecord {
            fire_instance_id: FireInstanceId(
                row.try_get("fire_instance_id").map_err(db_err("read id"))?,
            ),
            instance_id: row.try_get("instance_id").map_err(db_err("read instance"))?,
            trigger_key: TriggerKey::with_group(
                row.try_get::<String, _>("trigger_name")
                    .map_err(db_err("read trigger_name"))?,
                row.try_get::<String, _>("trigger_group")
                    .map_err(db_err("read trigger_group"))?,
            ),
            job_key: JobKey::with_group(
                row.try_get::<String, _>("job_name")
                    .map_err(db_err("read job_name"))?,
                row.try_get::<String, _>("job_group")
                    .map_err(db_err("read job_group"))?,
            ),
            state,
            priority: row.try_get("priority").map_err(db_err("read priority"))?,
            fired_at: row.try_get("fired_at").map_err(db_err("read fired_at"))?,
            scheduled_at: row
                .try_get("scheduled_at")
                .map_err(db_err("read scheduled_at"))?,
            is_non_concurrent: row
                .try_get("is_nonconcurrent")
                .map_err(db_err("read is_nonconcurrent"))?,
            requests_recovery: row
                .try_get("requests_recovery")
                .map_err(db_err("read requests_recovery"))?,
            job_data,
        })
    }
}

fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| StoreError::persistence_caused(context, err)
}

/// Escape LIKE wildcards in user-supplied group fragments.
fn like_escape(fragment: &str) -> String {
    fragment
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// WHERE fragment and bind value for a group matcher against `column`.
/// `None` means the matcher accepts every group (no filter).
fn matcher_filter(matcher: &GroupMatcher, column: &str) -> Option<(String, String)> {
    match matcher {
        GroupMatcher::Equals(group) => Some((format!("{column} = "), group.clone())),
        GroupMatcher::StartsWith(prefix) => {
            Some((format!("{column} LIKE "), format!("{}%", like_escape(prefix))))
        }
        GroupMatcher::EndsWith(suffix) => {
            Some((format!("{column} LIKE "), format!("%{}", like_escape(suffix))))
        }
        GroupMatcher::Contains(inner) => {
            Some((format!("{column} LIKE "), format!("%{}%", like_escape(inner))))
        }
        GroupMatcher::Anything => None,
    }
}

#[async_trait]
impl Delegate for PostgresDelegate {
    type Tx = PostgresTx;

    async fn begin(&self, isolation: IsolationLevel, cancel: CancelToken) -> Result<PostgresTx> {
        cancel.check()?;
        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        if isolation == IsolationLevel::Serializable {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await
                .map_err(db_err("set isolation"))?;
        }
        Ok(PostgresTx { tx, cancel })
    }

    async fn commit(&self, tx: PostgresTx) -> Result<()> {
        tx.cancel.check()?;
        tx.tx.commit().await.map_err(db_err("commit"))
    }

    async fn rollback(&self, tx: PostgresTx) -> Result<()> {
        tx.tx.rollback().await.map_err(db_err("rollback"))
    }

    async fn lock_row(&self, tx: &mut PostgresTx, lock: LockName) -> Result<()> {
        let conn = tx.checked()?;
        let held = sqlx::query(
            r#"
            SELECT lock_name FROM quarry_locks
            WHERE sched_name = $1 AND lock_name = $2
            FOR UPDATE
            "#,
        )
        .bind(&self.sched_name)
        .bind(lock.as_str())
        .fetch_optional(&mut **conn)
        .await
        .map_err(db_err("select lock row"))?;

        if held.is_some() {
            return Ok(());
        }

        // first use of this lock name: create the row, then take it
        sqlx::query(
            r#"
            INSERT INTO quarry_locks (sched_name, lock_name)
            VALUES ($1, $2)
            ON CONFLICT (sched_name, lock_name) DO NOTHING
            "#,
        )
        .bind(&self.sched_name)
        .bind(lock.as_str())
        .execute(&mut **conn)
        .await
        .map_err(db_err("insert lock row"))?;

        sqlx::query(
            r#"
            SELECT lock_name FROM quarry_locks
            WHERE sched_name = $1 AND lock_name = $2
            FOR UPDATE
            "#,
        )
        .bind(&self.sched_name)
        .bind(lock.as_str())
        .fetch_one(&mut **conn)
        .await
        .map_err(db_err("take lock row"))?;

        debug!(lock = %lock, "lock row taken");
        Ok(())
    }

    async fn job_exists(&self, tx: &mut PostgresTx, key: &JobKey) -> Result<bool> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT 1 AS one FROM quarry_jobs
            WHERE sched_name = $1 AND job_group = $2 AND job_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&mut **conn)
        .await
        .map_err(db_err("job exists"))?;
        Ok(row.is_some())
    }

    async fn trigger_exists(&self, tx: &mut PostgresTx, key: &TriggerKey) -> Result<bool> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT 1 AS one FROM quarry_triggers
            WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&mut **conn)
        .await
        .map_err(db_err("trigger exists"))?;
        Ok(row.is_some())
    }

    async fn calendar_exists(&self, tx: &mut PostgresTx, name: &str) -> Result<bool> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT 1 AS one FROM quarry_calendars
            WHERE sched_name = $1 AND calendar_name = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_optional(&mut **conn)
        .await
        .map_err(db_err("calendar exists"))?;
        Ok(row.is_some())
    }

    async fn calendar_is_referenced(&self, tx: &mut PostgresTx, name: &str) -> Result<bool> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT 1 AS one FROM quarry_triggers
            WHERE sched_name = $1 AND calendar_name = $2
            LIMIT 1
            "#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_optional(&mut **conn)
        .await
        .map_err(db_err("calendar referenced"))?;
        Ok(row.is_some())
    }

    async fn select_job(&self, tx: &mut PostgresTx, key: &JobKey) -> Result<Option<JobDetail>> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT payload FROM quarry_jobs
            WHERE sched_name = $1 AND job_group = $2 AND job_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&mut **conn)
        .await
        .map_err(db_err("select job"))?;

        match row {
            Some(row) => {
                let payload: serde_json::Value =
                    row.try_get("payload").map_err(db_err("read payload"))?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn select_trigger(&self, tx: &mut PostgresTx, key: &TriggerKey) -> Result<Option<Trigger>> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT payload FROM quarry_triggers
            WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&mut **conn)
        .await
        .map_err(db_err("select trigger"))?;

        row.as_ref().map(Self::row_to_trigger).transpose()
    }

    async fn select_trigger_state(
        &self,
        tx: &mut PostgresTx,
        key: &TriggerKey,
    ) -> Result<Option<TriggerState>> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT state FROM quarry_triggers
            WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&mut **conn)
        .await
        .map_err(db_err("select trigger state"))?;

        match row {
            Some(row) => {
                let state: String = row.try_get("state").map_err(db_err("read state"))?;
                Ok(Some(Self::parse_state(&state)?))
            }
            None => Ok(None),
        }
    }

    async fn select_trigger_status(
        &self,
        tx: &mut PostgresTx,
        key: &TriggerKey,
    ) -> Result<Option<TriggerStatus>> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT state, next_fire_time, job_name, job_group FROM quarry_triggers
            WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&mut **conn)
        .await
        .map_err(db_err("select trigger status"))?;

        match row {
            Some(row) => {
                let state: String = row.try_get("state").map_err(db_err("read state"))?;
                Ok(Some(TriggerStatus {
                    state: Self::parse_state(&state)?,
                    next_fire_time: row
                        .try_get("next_fire_time")
                        .map_err(db_err("read next_fire_time"))?,
                    job_key: JobKey::with_group(
                        row.try_get::<String, _>("job_name")
                            .map_err(db_err("read job_name"))?,
                        row.try_get::<String, _>("job_group")
                            .map_err(db_err("read job_group"))?,
                    ),
                }))
            }
            None => Ok(None),
        }
    }

    async fn select_trigger_job_data(
        &self,
        tx: &mut PostgresTx,
        key: &TriggerKey,
    ) -> Result<Option<JobDataMap>> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT payload -> 'data' AS data FROM quarry_triggers
            WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&mut **conn)
        .await
        .map_err(db_err("select trigger data"))?;

        match row {
            Some(row) => {
                let data: Option<serde_json::Value> =
                    row.try_get("data").map_err(db_err("read data"))?;
                match data {
                    Some(value) => Ok(Some(serde_json::from_value(value)?)),
                    None => Ok(None),
                }
            }
            None => Ok(None),
        }
    }

    async fn select_calendar(&self, tx: &mut PostgresTx, name: &str) -> Result<Option<Calendar>> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT payload FROM quarry_calendars
            WHERE sched_name = $1 AND calendar_name = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_optional(&mut **conn)
        .await
        .map_err(db_err("select calendar"))?;

        match row {
            Some(row) => {
                let payload: serde_json::Value =
                    row.try_get("payload").map_err(db_err("read payload"))?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn select_triggers_for_job(
        &self,
        tx: &mut PostgresTx,
        job: &JobKey,
    ) -> Result<Vec<Trigger>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT payload FROM quarry_triggers
            WHERE sched_name = $1 AND job_group = $2 AND job_name = $3
            ORDER BY trigger_group, trigger_name
            "#,
        )
        .bind(&self.sched_name)
        .bind(&job.group)
        .bind(&job.name)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select triggers for job"))?;

        rows.iter().map(Self::row_to_trigger).collect()
    }

    async fn select_trigger_keys_for_job(
        &self,
        tx: &mut PostgresTx,
        job: &JobKey,
    ) -> Result<Vec<TriggerKey>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT trigger_name, trigger_group FROM quarry_triggers
            WHERE sched_name = $1 AND job_group = $2 AND job_name = $3
            ORDER BY trigger_group, trigger_name
            "#,
        )
        .bind(&self.sched_name)
        .bind(&job.group)
        .bind(&job.name)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select trigger keys for job"))?;

        rows.iter()
            .map(|row| {
                Ok(TriggerKey::with_group(
                    row.try_get::<String, _>("trigger_name")
                        .map_err(db_err("read trigger_name"))?,
                    row.try_get::<String, _>("trigger_group")
                        .map_err(db_err("read trigger_group"))?,
                ))
            })
            .collect()
    }

    async fn count_triggers_for_job(&self, tx: &mut PostgresTx, job: &JobKey) -> Result<usize> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT COUNT(*)::bigint AS count FROM quarry_triggers
            WHERE sched_name = $1 AND job_group = $2 AND job_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&job.group)
        .bind(&job.name)
        .fetch_one(&mut **conn)
        .await
        .map_err(db_err("count triggers for job"))?;
        let count: i64 = row.try_get("count").map_err(db_err("read count"))?;
        Ok(count as usize)
    }

    async fn select_triggers_for_calendar(
        &self,
        tx: &mut PostgresTx,
        name: &str,
    ) -> Result<Vec<TriggerKey>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT trigger_name, trigger_group FROM quarry_triggers
            WHERE sched_name = $1 AND calendar_name = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select triggers for calendar"))?;

        rows.iter()
            .map(|row| {
                Ok(TriggerKey::with_group(
                    row.try_get::<String, _>("trigger_name")
                        .map_err(db_err("read trigger_name"))?,
                    row.try_get::<String, _>("trigger_group")
                        .map_err(db_err("read trigger_group"))?,
                ))
            })
            .collect()
    }

    async fn select_triggers_in_state(
        &self,
        tx: &mut PostgresTx,
        state: TriggerState,
    ) -> Result<Vec<TriggerKey>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT trigger_name, trigger_group FROM quarry_triggers
            WHERE sched_name = $1 AND state = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(state.as_str())
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select triggers in state"))?;

        rows.iter()
            .map(|row| {
                Ok(TriggerKey::with_group(
                    row.try_get::<String, _>("trigger_name")
                        .map_err(db_err("read trigger_name"))?,
                    row.try_get::<String, _>("trigger_group")
                        .map_err(db_err("read trigger_group"))?,
                ))
            })
            .collect()
    }

    async fn select_triggers_to_acquire(
        &self,
        tx: &mut PostgresTx,
        no_later_than: DateTime<Utc>,
        no_earlier_than: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<TriggerKey>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT trigger_name, trigger_group FROM quarry_triggers
            WHERE sched_name = $1
              AND state = $2
              AND next_fire_time IS NOT NULL
              AND next_fire_time <= $3
              AND next_fire_time > $4
            ORDER BY next_fire_time ASC, priority DESC
            LIMIT $5
            "#,
        )
        .bind(&self.sched_name)
        .bind(TriggerState::Waiting.as_str())
        .bind(no_later_than)
        .bind(no_earlier_than)
        .bind(max_count.min(i64::MAX as usize) as i64)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select triggers to acquire"))?;

        rows.iter()
            .map(|row| {
                Ok(TriggerKey::with_group(
                    row.try_get::<String, _>("trigger_name")
                        .map_err(db_err("read trigger_name"))?,
                    row.try_get::<String, _>("trigger_group")
                        .map_err(db_err("read trigger_group"))?,
                ))
            })
            .collect()
    }

    async fn select_job_keys(
        &self,
        tx: &mut PostgresTx,
        matcher: &GroupMatcher,
    ) -> Result<Vec<JobKey>> {
        let conn = tx.checked()?;
        let rows = match matcher_filter(matcher, "job_group") {
            Some((clause, value)) => {
                sqlx::query(&format!(
                    r#"
                    SELECT job_name, job_group FROM quarry_jobs
                    WHERE sched_name = $1 AND {clause}$2
                    ORDER BY job_group, job_name
                    "#
                ))
                .bind(&self.sched_name)
                .bind(value)
                .fetch_all(&mut **conn)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT job_name, job_group FROM quarry_jobs
                    WHERE sched_name = $1
                    ORDER BY job_group, job_name
                    "#,
                )
                .bind(&self.sched_name)
                .fetch_all(&mut **conn)
                .await
            }
        }
        .map_err(db_err("select job keys"))?;

        rows.iter()
            .map(|row| {
                Ok(JobKey::with_group(
                    row.try_get::<String, _>("job_name")
                        .map_err(db_err("read job_name"))?,
                    row.try_get::<String, _>("job_group")
                        .map_err(db_err("read job_group"))?,
                ))
            })
            .collect()
    }

    async fn select_trigger_keys(
        &self,
        tx: &mut PostgresTx,
        matcher: &GroupMatcher,
    ) -> Result<Vec<TriggerKey>> {
        let conn = tx.checked()?;
        let rows = match matcher_filter(matcher, "trigger_group") {
            Some((clause, value)) => {
                sqlx::query(&format!(
                    r#"
                    SELECT trigger_name, trigger_group FROM quarry_triggers
                    WHERE sched_name = $1 AND {clause}$2
                    ORDER BY trigger_group, trigger_name
                    "#
                ))
                .bind(&self.sched_name)
                .bind(value)
                .fetch_all(&mut **conn)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT trigger_name, trigger_group FROM quarry_triggers
                    WHERE sched_name = $1
                    ORDER BY trigger_group, trigger_name
                    "#,
                )
                .bind(&self.sched_name)
                .fetch_all(&mut **conn)
                .await
            }
        }
        .map_err(db_err("select trigger keys"))?;

        rows.iter()
            .map(|row| {
                Ok(TriggerKey::with_group(
                    row.try_get::<String, _>("trigger_name")
                        .map_err(db_err("read trigger_name"))?,
                    row.try_get::<String, _>("trigger_group")
                        .map_err(db_err("read trigger_group"))?,
                ))
            })
            .collect()
    }

    async fn select_job_groups(&self, tx: &mut PostgresTx) -> Result<Vec<String>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT job_group FROM quarry_jobs
            WHERE sched_name = $1
            ORDER BY job_group
            "#,
        )
        .bind(&self.sched_name)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select job groups"))?;

        rows.iter()
            .map(|row| row.try_get("job_group").map_err(db_err("read job_group")))
            .collect()
    }

    async fn select_trigger_groups(
        &self,
        tx: &mut PostgresTx,
        matcher: Option<&GroupMatcher>,
    ) -> Result<Vec<String>> {
        let conn = tx.checked()?;
        let filter = matcher.and_then(|m| matcher_filter(m, "trigger_group"));
        let rows = match filter {
            Some((clause, value)) => {
                sqlx::query(&format!(
                    r#"
                    SELECT DISTINCT trigger_group FROM quarry_triggers
                    WHERE sched_name = $1 AND {clause}$2
                    ORDER BY trigger_group
                    "#
                ))
                .bind(&self.sched_name)
                .bind(value)
                .fetch_all(&mut **conn)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT DISTINCT trigger_group FROM quarry_triggers
                    WHERE sched_name = $1
                    ORDER BY trigger_group
                    "#,
                )
                .bind(&self.sched_name)
                .fetch_all(&mut **conn)
                .await
            }
        }
        .map_err(db_err("select trigger groups"))?;

        rows.iter()
            .map(|row| {
                row.try_get("trigger_group")
                    .map_err(db_err("read trigger_group"))
            })
            .collect()
    }

    async fn select_calendar_names(&self, tx: &mut PostgresTx) -> Result<Vec<String>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT calendar_name FROM quarry_calendars
            WHERE sched_name = $1
            ORDER BY calendar_name
            "#,
        )
        .bind(&self.sched_name)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select calendar names"))?;

        rows.iter()
            .map(|row| {
                row.try_get("calendar_name")
                    .map_err(db_err("read calendar_name"))
            })
            .collect()
    }

    async fn count_jobs(&self, tx: &mut PostgresTx) -> Result<usize> {
        let conn = tx.checked()?;
        let row = sqlx::query("SELECT COUNT(*)::bigint AS count FROM quarry_jobs WHERE sched_name = $1")
            .bind(&self.sched_name)
            .fetch_one(&mut **conn)
            .await
            .map_err(db_err("count jobs"))?;
        let count: i64 = row.try_get("count").map_err(db_err("read count"))?;
        Ok(count as usize)
    }

    async fn count_triggers(&self, tx: &mut PostgresTx) -> Result<usize> {
        let conn = tx.checked()?;
        let row =
            sqlx::query("SELECT COUNT(*)::bigint AS count FROM quarry_triggers WHERE sched_name = $1")
                .bind(&self.sched_name)
                .fetch_one(&mut **conn)
                .await
                .map_err(db_err("count triggers"))?;
        let count: i64 = row.try_get("count").map_err(db_err("read count"))?;
        Ok(count as usize)
    }

    async fn count_calendars(&self, tx: &mut PostgresTx) -> Result<usize> {
        let conn = tx.checked()?;
        let row =
            sqlx::query("SELECT COUNT(*)::bigint AS count FROM quarry_calendars WHERE sched_name = $1")
                .bind(&self.sched_name)
                .fetch_one(&mut **conn)
                .await
                .map_err(db_err("count calendars"))?;
        let count: i64 = row.try_get("count").map_err(db_err("read count"))?;
        Ok(count as usize)
    }

    async fn select_jobs_requesting_recovery(&self, tx: &mut PostgresTx) -> Result<Vec<JobKey>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT job_name, job_group FROM quarry_jobs
            WHERE sched_name = $1 AND requests_recovery = TRUE
            ORDER BY job_group, job_name
            "#,
        )
        .bind(&self.sched_name)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select recoverable jobs"))?;

        rows.iter()
            .map(|row| {
                Ok(JobKey::with_group(
                    row.try_get::<String, _>("job_name")
                        .map_err(db_err("read job_name"))?,
                    row.try_get::<String, _>("job_group")
                        .map_err(db_err("read job_group"))?,
                ))
            })
            .collect()
    }

    async fn count_misfired_triggers_in_state(
        &self,
        tx: &mut PostgresTx,
        state: TriggerState,
        before: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT COUNT(*)::bigint AS count FROM quarry_triggers
            WHERE sched_name = $1 AND state = $2
              AND next_fire_time IS NOT NULL AND next_fire_time < $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(state.as_str())
        .bind(before)
        .fetch_one(&mut **conn)
        .await
        .map_err(db_err("count misfired"))?;
        let count: i64 = row.try_get("count").map_err(db_err("read count"))?;
        Ok(count as usize)
    }

    async fn select_misfired_triggers_in_state(
        &self,
        tx: &mut PostgresTx,
        state: TriggerState,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<(Vec<TriggerKey>, bool)> {
        let conn = tx.checked()?;
        let fetch = limit.saturating_add(1).min(i64::MAX as usize) as i64;
        let rows = sqlx::query(
            r#"
            SELECT trigger_name, trigger_group FROM quarry_triggers
            WHERE sched_name = $1 AND state = $2
              AND next_fire_time IS NOT NULL AND next_fire_time < $3
            ORDER BY next_fire_time ASC, priority DESC
            LIMIT $4
            "#,
        )
        .bind(&self.sched_name)
        .bind(state.as_str())
        .bind(before)
        .bind(fetch)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select misfired"))?;

        let has_more = rows.len() > limit;
        let mut keys = Vec::with_capacity(rows.len().min(limit));
        for row in rows.iter().take(limit) {
            keys.push(TriggerKey::with_group(
                row.try_get::<String, _>("trigger_name")
                    .map_err(db_err("read trigger_name"))?,
                row.try_get::<String, _>("trigger_group")
                    .map_err(db_err("read trigger_group"))?,
            ));
        }
        Ok((keys, has_more))
    }

    async fn insert_fired_trigger(
        &self,
        tx: &mut PostgresTx,
        record: &FiredTriggerRecord,
    ) -> Result<()> {
        let conn = tx.checked()?;
        let job_data = record
            .job_data
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO quarry_fired_triggers (
                sched_name, fire_instance_id, instance_id, trigger_name, trigger_group,
                job_name, job_group, state, priority, fired_at, scheduled_at,
                is_nonconcurrent, requests_recovery, job_data
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
            "#,
        )
        .bind(&self.sched_name)
        .bind(&record.fire_instance_id.0)
        .bind(&record.instance_id)
        .bind(&record.trigger_key.name)
        .bind(&record.trigger_key.group)
        .bind(&record.job_key.name)
        .bind(&record.job_key.group)
        .bind(record.state.as_str())
        .bind(record.priority)
        .bind(record.fired_at)
        .bind(record.scheduled_at)
        .bind(record.is_non_concurrent)
        .bind(record.requests_recovery)
        .bind(job_data)
        .execute(&mut **conn)
        .await
        .map_err(db_err("insert fired trigger"))?;
        Ok(())
    }

    async fn update_fired_trigger(
        &self,
        tx: &mut PostgresTx,
        record: &FiredTriggerRecord,
    ) -> Result<()> {
        let conn = tx.checked()?;
        let job_data = record
            .job_data
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(
            r#"
            UPDATE quarry_fired_triggers
            SET instance_id = $3, state = $4, priority = $5, fired_at = $6,
                scheduled_at = $7, is_nonconcurrent = $8, requests_recovery = $9,
                job_data = $10
            WHERE sched_name = $1 AND fire_instance_id = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(&record.fire_instance_id.0)
        .bind(&record.instance_id)
        .bind(record.state.as_str())
        .bind(record.priority)
        .bind(record.fired_at)
        .bind(record.scheduled_at)
        .bind(record.is_non_concurrent)
        .bind(record.requests_recovery)
        .bind(job_data)
        .execute(&mut **conn)
        .await
        .map_err(db_err("update fired trigger"))?;
        Ok(())
    }

    async fn select_fired_trigger_records(
        &self,
        tx: &mut PostgresTx,
        key: &TriggerKey,
    ) -> Result<Vec<FiredTriggerRecord>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM quarry_fired_triggers
            WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select fired triggers"))?;

        rows.iter().map(Self::row_to_fired).collect()
    }

    async fn select_fired_trigger_records_for_job(
        &self,
        tx: &mut PostgresTx,
        job: &JobKey,
    ) -> Result<Vec<FiredTriggerRecord>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM quarry_fired_triggers
            WHERE sched_name = $1 AND job_group = $2 AND job_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&job.group)
        .bind(&job.name)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select fired triggers for job"))?;

        rows.iter().map(Self::row_to_fired).collect()
    }

    async fn select_instance_fired_trigger_records(
        &self,
        tx: &mut PostgresTx,
        instance_id: &str,
    ) -> Result<Vec<FiredTriggerRecord>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM quarry_fired_triggers
            WHERE sched_name = $1 AND instance_id = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(instance_id)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select instance fired triggers"))?;

        rows.iter().map(Self::row_to_fired).collect()
    }

    async fn select_fired_trigger_instance_ids(
        &self,
        tx: &mut PostgresTx,
    ) -> Result<HashSet<String>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT instance_id FROM quarry_fired_triggers
            WHERE sched_name = $1
            "#,
        )
        .bind(&self.sched_name)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select fired instance ids"))?;

        rows.iter()
            .map(|row| {
                row.try_get("instance_id")
                    .map_err(db_err("read instance_id"))
            })
            .collect()
    }

    async fn delete_fired_trigger(
        &self,
        tx: &mut PostgresTx,
        fire_instance_id: &FireInstanceId,
    ) -> Result<bool> {
        let conn = tx.checked()?;
        let result = sqlx::query(
            r#"
            DELETE FROM quarry_fired_triggers
            WHERE sched_name = $1 AND fire_instance_id = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(&fire_instance_id.0)
        .execute(&mut **conn)
        .await
        .map_err(db_err("delete fired trigger"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_fired_triggers(
        &self,
        tx: &mut PostgresTx,
        instance_id: Option<&str>,
    ) -> Result<u64> {
        let conn = tx.checked()?;
        let result = match instance_id {
            Some(instance_id) => {
                sqlx::query(
                    r#"
                    DELETE FROM quarry_fired_triggers
                    WHERE sched_name = $1 AND instance_id = $2
                    "#,
                )
                .bind(&self.sched_name)
                .bind(instance_id)
                .execute(&mut **conn)
                .await
            }
            None => {
                sqlx::query("DELETE FROM quarry_fired_triggers WHERE sched_name = $1")
                    .bind(&self.sched_name)
                    .execute(&mut **conn)
                    .await
            }
        }
        .map_err(db_err("delete fired triggers"))?;
        Ok(result.rows_affected())
    }

    async fn insert_job(&self, tx: &mut PostgresTx, job: &JobDetail) -> Result<()> {
        let conn = tx.checked()?;
        let payload = serde_json::to_value(job)?;
        sqlx::query(
            r#"
            INSERT INTO quarry_jobs (sched_name, job_name, job_group, requests_recovery, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&self.sched_name)
        .bind(&job.key.name)
        .bind(&job.key.group)
        .bind(job.requests_recovery)
        .bind(payload)
        .execute(&mut **conn)
        .await
        .map_err(db_err("insert job"))?;
        Ok(())
    }

    async fn update_job(&self, tx: &mut PostgresTx, job: &JobDetail) -> Result<()> {
        let conn = tx.checked()?;
        let payload = serde_json::to_value(job)?;
        sqlx::query(
            r#"
            UPDATE quarry_jobs
            SET requests_recovery = $4, payload = $5
            WHERE sched_name = $1 AND job_group = $2 AND job_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&job.key.group)
        .bind(&job.key.name)
        .bind(job.requests_recovery)
        .bind(payload)
        .execute(&mut **conn)
        .await
        .map_err(db_err("update job"))?;
        Ok(())
    }

    async fn update_job_data(
        &self,
        tx: &mut PostgresTx,
        key: &JobKey,
        data: &JobDataMap,
    ) -> Result<()> {
        let conn = tx.checked()?;
        let data = serde_json::to_value(data)?;
        sqlx::query(
            r#"
            UPDATE quarry_jobs
            SET payload = jsonb_set(payload, '{data}', $4::jsonb)
            WHERE sched_name = $1 AND job_group = $2 AND job_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .bind(data)
        .execute(&mut **conn)
        .await
        .map_err(db_err("update job data"))?;
        Ok(())
    }

    async fn delete_job(&self, tx: &mut PostgresTx, key: &JobKey) -> Result<bool> {
        let conn = tx.checked()?;
        let result = sqlx::query(
            r#"
            DELETE FROM quarry_jobs
            WHERE sched_name = $1 AND job_group = $2 AND job_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .execute(&mut **conn)
        .await
        .map_err(db_err("delete job"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_trigger(
        &self,
        tx: &mut PostgresTx,
        trigger: &Trigger,
        state: TriggerState,
    ) -> Result<()> {
        let conn = tx.checked()?;
        let payload = serde_json::to_value(trigger)?;
        sqlx::query(
            r#"
            INSERT INTO quarry_triggers (
                sched_name, trigger_name, trigger_group, job_name, job_group,
                calendar_name, priority, state, next_fire_time, payload
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            "#,
        )
        .bind(&self.sched_name)
        .bind(&trigger.key.name)
        .bind(&trigger.key.group)
        .bind(&trigger.job_key.name)
        .bind(&trigger.job_key.group)
        .bind(&trigger.calendar_name)
        .bind(trigger.priority)
        .bind(state.as_str())
        .bind(trigger.next_fire_time)
        .bind(payload)
        .execute(&mut **conn)
        .await
        .map_err(db_err("insert trigger"))?;
        Ok(())
    }

    async fn update_trigger(&self, tx: &mut PostgresTx, trigger: &Trigger) -> Result<()> {
        let conn = tx.checked()?;
        let payload = serde_json::to_value(trigger)?;
        sqlx::query(
            r#"
            UPDATE quarry_triggers
            SET job_name = $4, job_group = $5, calendar_name = $6,
                priority = $7, next_fire_time = $8, payload = $9
            WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&trigger.key.group)
        .bind(&trigger.key.name)
        .bind(&trigger.job_key.name)
        .bind(&trigger.job_key.group)
        .bind(&trigger.calendar_name)
        .bind(trigger.priority)
        .bind(trigger.next_fire_time)
        .bind(payload)
        .execute(&mut **conn)
        .await
        .map_err(db_err("update trigger"))?;
        Ok(())
    }

    async fn delete_trigger(&self, tx: &mut PostgresTx, key: &TriggerKey) -> Result<bool> {
        let conn = tx.checked()?;
        let result = sqlx::query(
            r#"
            DELETE FROM quarry_triggers
            WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .execute(&mut **conn)
        .await
        .map_err(db_err("delete trigger"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_calendar(&self, tx: &mut PostgresTx, name: &str, cal: &Calendar) -> Result<()> {
        let conn = tx.checked()?;
        let payload = serde_json::to_value(cal)?;
        sqlx::query(
            r#"
            INSERT INTO quarry_calendars (sched_name, calendar_name, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .bind(payload)
        .execute(&mut **conn)
        .await
        .map_err(db_err("insert calendar"))?;
        Ok(())
    }

    async fn update_calendar(&self, tx: &mut PostgresTx, name: &str, cal: &Calendar) -> Result<()> {
        let conn = tx.checked()?;
        let payload = serde_json::to_value(cal)?;
        sqlx::query(
            r#"
            UPDATE quarry_calendars SET payload = $3
            WHERE sched_name = $1 AND calendar_name = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .bind(payload)
        .execute(&mut **conn)
        .await
        .map_err(db_err("update calendar"))?;
        Ok(())
    }

    async fn delete_calendar(&self, tx: &mut PostgresTx, name: &str) -> Result<bool> {
        let conn = tx.checked()?;
        let result = sqlx::query(
            r#"
            DELETE FROM quarry_calendars
            WHERE sched_name = $1 AND calendar_name = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .execute(&mut **conn)
        .await
        .map_err(db_err("delete calendar"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_trigger_state(
        &self,
        tx: &mut PostgresTx,
        key: &TriggerKey,
        new_state: TriggerState,
    ) -> Result<()> {
        let conn = tx.checked()?;
        sqlx::query(
            r#"
            UPDATE quarry_triggers SET state = $4
            WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .bind(new_state.as_str())
        .execute(&mut **conn)
        .await
        .map_err(db_err("update trigger state"))?;
        Ok(())
    }

    async fn update_trigger_state_from_other_state(
        &self,
        tx: &mut PostgresTx,
        key: &TriggerKey,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<u64> {
        let conn = tx.checked()?;
        let result = sqlx::query(
            r#"
            UPDATE quarry_triggers SET state = $4
            WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3
              AND state = $5
            "#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .bind(new_state.as_str())
        .bind(old_state.as_str())
        .execute(&mut **conn)
        .await
        .map_err(db_err("cas trigger state"))?;
        Ok(result.rows_affected())
    }

    async fn update_trigger_states_from_other_states(
        &self,
        tx: &mut PostgresTx,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<u64> {
        let conn = tx.checked()?;
        let result = sqlx::query(
            r#"
            UPDATE quarry_triggers SET state = $2
            WHERE sched_name = $1 AND state = ANY($3)
            "#,
        )
        .bind(&self.sched_name)
        .bind(new_state.as_str())
        .bind(Self::states_vec(old_states))
        .execute(&mut **conn)
        .await
        .map_err(db_err("bulk trigger state update"))?;
        Ok(result.rows_affected())
    }

    async fn update_trigger_group_states_from_other_states(
        &self,
        tx: &mut PostgresTx,
        matcher: &GroupMatcher,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<u64> {
        let conn = tx.checked()?;
        let result = match matcher_filter(matcher, "trigger_group") {
            Some((clause, value)) => {
                sqlx::query(&format!(
                    r#"
                    UPDATE quarry_triggers SET state = $2
                    WHERE sched_name = $1 AND state = ANY($3) AND {clause}$4
                    "#
                ))
                .bind(&self.sched_name)
                .bind(new_state.as_str())
                .bind(Self::states_vec(old_states))
                .bind(value)
                .execute(&mut **conn)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE quarry_triggers SET state = $2
                    WHERE sched_name = $1 AND state = ANY($3)
                    "#,
                )
                .bind(&self.sched_name)
                .bind(new_state.as_str())
                .bind(Self::states_vec(old_states))
                .execute(&mut **conn)
                .await
            }
        }
        .map_err(db_err("group trigger state update"))?;
        Ok(result.rows_affected())
    }

    async fn update_trigger_states_for_job(
        &self,
        tx: &mut PostgresTx,
        job: &JobKey,
        new_state: TriggerState,
    ) -> Result<u64> {
        let conn = tx.checked()?;
        let result = sqlx::query(
            r#"
            UPDATE quarry_triggers SET state = $4
            WHERE sched_name = $1 AND job_group = $2 AND job_name = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&job.group)
        .bind(&job.name)
        .bind(new_state.as_str())
        .execute(&mut **conn)
        .await
        .map_err(db_err("job trigger state update"))?;
        Ok(result.rows_affected())
    }

    async fn update_trigger_states_for_job_from_other_state(
        &self,
        tx: &mut PostgresTx,
        job: &JobKey,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<u64> {
        let conn = tx.checked()?;
        let result = sqlx::query(
            r#"
            UPDATE quarry_triggers SET state = $4
            WHERE sched_name = $1 AND job_group = $2 AND job_name = $3
              AND state = $5
            "#,
        )
        .bind(&self.sched_name)
        .bind(&job.group)
        .bind(&job.name)
        .bind(new_state.as_str())
        .bind(old_state.as_str())
        .execute(&mut **conn)
        .await
        .map_err(db_err("job trigger state cas"))?;
        Ok(result.rows_affected())
    }

    async fn insert_paused_trigger_group(&self, tx: &mut PostgresTx, group: &str) -> Result<()> {
        let conn = tx.checked()?;
        sqlx::query(
            r#"
            INSERT INTO quarry_paused_trigger_groups (sched_name, trigger_group)
            VALUES ($1, $2)
            ON CONFLICT (sched_name, trigger_group) DO NOTHING
            "#,
        )
        .bind(&self.sched_name)
        .bind(group)
        .execute(&mut **conn)
        .await
        .map_err(db_err("insert paused trigger group"))?;
        Ok(())
    }

    async fn delete_paused_trigger_group(&self, tx: &mut PostgresTx, group: &str) -> Result<bool> {
        let conn = tx.checked()?;
        let result = sqlx::query(
            r#"
            DELETE FROM quarry_paused_trigger_groups
            WHERE sched_name = $1 AND trigger_group = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(group)
        .execute(&mut **conn)
        .await
        .map_err(db_err("delete paused trigger group"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn select_paused_trigger_groups(&self, tx: &mut PostgresTx) -> Result<HashSet<String>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT trigger_group FROM quarry_paused_trigger_groups
            WHERE sched_name = $1
            "#,
        )
        .bind(&self.sched_name)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select paused trigger groups"))?;

        rows.iter()
            .map(|row| {
                row.try_get("trigger_group")
                    .map_err(db_err("read trigger_group"))
            })
            .collect()
    }

    async fn is_trigger_group_paused(&self, tx: &mut PostgresTx, group: &str) -> Result<bool> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT 1 AS one FROM quarry_paused_trigger_groups
            WHERE sched_name = $1 AND trigger_group = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(group)
        .fetch_optional(&mut **conn)
        .await
        .map_err(db_err("trigger group paused"))?;
        Ok(row.is_some())
    }

    async fn insert_paused_job_group(&self, tx: &mut PostgresTx, group: &str) -> Result<()> {
        let conn = tx.checked()?;
        sqlx::query(
            r#"
            INSERT INTO quarry_paused_job_groups (sched_name, job_group)
            VALUES ($1, $2)
            ON CONFLICT (sched_name, job_group) DO NOTHING
            "#,
        )
        .bind(&self.sched_name)
        .bind(group)
        .execute(&mut **conn)
        .await
        .map_err(db_err("insert paused job group"))?;
        Ok(())
    }

    async fn delete_paused_job_group(&self, tx: &mut PostgresTx, group: &str) -> Result<bool> {
        let conn = tx.checked()?;
        let result = sqlx::query(
            r#"
            DELETE FROM quarry_paused_job_groups
            WHERE sched_name = $1 AND job_group = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(group)
        .execute(&mut **conn)
        .await
        .map_err(db_err("delete paused job group"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn select_paused_job_groups(&self, tx: &mut PostgresTx) -> Result<HashSet<String>> {
        let conn = tx.checked()?;
        let rows = sqlx::query(
            r#"
            SELECT job_group FROM quarry_paused_job_groups
            WHERE sched_name = $1
            "#,
        )
        .bind(&self.sched_name)
        .fetch_all(&mut **conn)
        .await
        .map_err(db_err("select paused job groups"))?;

        rows.iter()
            .map(|row| row.try_get("job_group").map_err(db_err("read job_group")))
            .collect()
    }

    async fn is_job_group_paused(&self, tx: &mut PostgresTx, group: &str) -> Result<bool> {
        let conn = tx.checked()?;
        let row = sqlx::query(
            r#"
            SELECT 1 AS one FROM quarry_paused_job_groups
            WHERE sched_name = $1 AND job_group = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(group)
        .fetch_optional(&mut **conn)
        .await
        .map_err(db_err("job group paused"))?;
        Ok(row.is_some())
    }

    async fn set_scheduler_lifecycle(
        &self,
        tx: &mut PostgresTx,
        lifecycle: SchedulerLifecycle,
    ) -> Result<()> {
        let conn = tx.checked()?;
        sqlx::query(
            r#"
            INSERT INTO quarry_schedulers (sched_name, lifecycle)
            VALUES ($1, $2)
            ON CONFLICT (sched_name) DO UPDATE SET lifecycle = EXCLUDED.lifecycle
            "#,
        )
        .bind(&self.sched_name)
        .bind(lifecycle.as_str())
        .execute(&mut **conn)
        .await
        .map_err(db_err("set scheduler lifecycle"))?;
        Ok(())
    }

    async fn insert_scheduler_state(
        &self,
        tx: &mut PostgresTx,
        record: &SchedulerStateRecord,
    ) -> Result<()> {
        let conn = tx.checked()?;
        sqlx::query(
            r#"
            INSERT INTO quarry_scheduler_state
                (sched_name, instance_id, last_checkin, checkin_interval_ms)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&self.sched_name)
        .bind(&record.instance_id)
        .bind(record.last_checkin)
        .bind(record.checkin_interval_ms.min(i64::MAX as u64) as i64)
        .execute(&mut **conn)
        .await
        .map_err(db_err("insert scheduler state"))?;
        Ok(())
    }

    async fn update_scheduler_state(
        &self,
        tx: &mut PostgresTx,
        instance_id: &str,
        last_checkin: DateTime<Utc>,
    ) -> Result<u64> {
        let conn = tx.checked()?;
        let result = sqlx::query(
            r#"
            UPDATE quarry_scheduler_state SET last_checkin = $3
            WHERE sched_name = $1 AND instance_id = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(instance_id)
        .bind(last_checkin)
        .execute(&mut **conn)
        .await
        .map_err(db_err("update scheduler state"))?;
        Ok(result.rows_affected())
    }

    async fn delete_scheduler_state(&self, tx: &mut PostgresTx, instance_id: &str) -> Result<u64> {
        let conn = tx.checked()?;
        let result = sqlx::query(
            r#"
            DELETE FROM quarry_scheduler_state
            WHERE sched_name = $1 AND instance_id = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(instance_id)
        .execute(&mut **conn)
        .await
        .map_err(db_err("delete scheduler state"))?;
        Ok(result.rows_affected())
    }

    async fn select_scheduler_state_records(
        &self,
        tx: &mut PostgresTx,
        instance_id: Option<&str>,
    ) -> Result<Vec<SchedulerStateRecord>> {
        let conn = tx.checked()?;
        let rows = match instance_id {
            Some(instance_id) => {
                sqlx::query(
                    r#"
                    SELECT instance_id, last_checkin, checkin_interval_ms
                    FROM quarry_scheduler_state
                    WHERE sched_name = $1 AND instance_id = $2
                    "#,
                )
                .bind(&self.sched_name)
                .bind(instance_id)
                .fetch_all(&mut **conn)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT instance_id, last_checkin, checkin_interval_ms
                    FROM quarry_scheduler_state
                    WHERE sched_name = $1
                    "#,
                )
                .bind(&self.sched_name)
                .fetch_all(&mut **conn)
                .await
            }
        }
        .map_err(db_err("select scheduler state"))?;

        rows.iter()
            .map(|row| {
                let interval: i64 = row
                    .try_get("checkin_interval_ms")
                    .map_err(db_err("read checkin_interval_ms"))?;
                Ok(SchedulerStateRecord {
                    instance_id: row
                        .try_get("instance_id")
                        .map_err(db_err("read instance_id"))?,
                    last_checkin: row
                        .try_get("last_checkin")
                        .map_err(db_err("read last_checkin"))?,
                    checkin_interval_ms: interval.max(0) as u64,
                })
            })
            .collect()
    }

    async fn clear_data(&self, tx: &mut PostgresTx) -> Result<()> {
        let conn = tx.checked()?;
        for table in [
            "quarry_fired_triggers",
            "quarry_triggers",
            "quarry_jobs",
            "quarry_calendars",
            "quarry_paused_trigger_groups",
            "quarry_paused_job_groups",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE sched_name = $1"))
                .bind(&self.sched_name)
                .execute(&mut **conn)
                .await
                .map_err(db_err("clear data"))?;
        }
        Ok(())
    }
}
