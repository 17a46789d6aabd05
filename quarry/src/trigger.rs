use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::fired::FireInstanceId;
use crate::job::JobDataMap;
use crate::key::{JobKey, TriggerKey};

/// Priority assigned to triggers created without an explicit priority.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Internal state of a trigger as persisted by the back-end.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TriggerState {
    /// Eligible for acquisition once its fire time arrives.
    Waiting,
    /// Reserved by one instance; a fired-trigger row exists.
    Acquired,
    /// Handed to the scheduler runtime; the fired-trigger row is Executing.
    Executing,
    /// No further fire times; kept until cleanup removes it.
    Complete,
    /// Explicitly paused.
    Paused,
    /// Held back because a non-concurrent peer of its job is executing.
    Blocked,
    /// Paused while also blocked; resuming yields Blocked, not Waiting.
    PausedAndBlocked,
    /// The trigger's job could not be loaded or completion reported an error.
    Error,
}

impl TriggerState {
    /// Stable identifier used by back-end delegates.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Acquired => "ACQUIRED",
            Self::Executing => "EXECUTING",
            Self::Complete => "COMPLETE",
            Self::Paused => "PAUSED",
            Self::Blocked => "BLOCKED",
            Self::PausedAndBlocked => "PAUSED_BLOCKED",
            Self::Error => "ERROR",
        }
    }

    /// Parse the identifier produced by [`as_str`](Self::as_str).
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "WAITING" => Some(Self::Waiting),
            "ACQUIRED" => Some(Self::Acquired),
            "EXECUTING" => Some(Self::Executing),
            "COMPLETE" => Some(Self::Complete),
            "PAUSED" => Some(Self::Paused),
            "BLOCKED" => Some(Self::Blocked),
            "PAUSED_BLOCKED" => Some(Self::PausedAndBlocked),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether this state belongs to the paused family.
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused | Self::PausedAndBlocked)
    }
}

/// Collapsed trigger state reported to callers of `get_trigger_state`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ExternalTriggerState {
    /// The trigger does not exist.
    None,
    /// Waiting, acquired, or executing.
    Normal,
    Paused,
    Complete,
    Error,
    Blocked,
}

impl From<Option<TriggerState>> for ExternalTriggerState {
    fn from(state: Option<TriggerState>) -> Self {
        match state {
            None => Self::None,
            Some(TriggerState::Waiting)
            | Some(TriggerState::Acquired)
            | Some(TriggerState::Executing) => Self::Normal,
            Some(TriggerState::Paused) | Some(TriggerState::PausedAndBlocked) => Self::Paused,
            Some(TriggerState::Complete) => Self::Complete,
            Some(TriggerState::Error) => Self::Error,
            Some(TriggerState::Blocked) => Self::Blocked,
        }
    }
}

/// Per-trigger policy telling `update_after_misfire` how to recompute the
/// next fire time once a fire has slipped past the misfire threshold.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum MisfireInstruction {
    /// Pick a policy from the schedule shape: one-shot schedules fire
    /// immediately, repeating schedules skip to the next fire after now.
    #[default]
    Smart,
    /// Leave the stale fire time in place; it fires as soon as acquired.
    IgnoreMisfires,
    /// Reschedule to fire immediately.
    FireNow,
    /// Skip missed fires; advance to the next fire time after now.
    NextWithRemainingCount,
}

/// Type-specific scheduling data, serialized with the trigger record.
///
/// The store consults schedules only through [`Trigger::triggered`],
/// [`Trigger::update_after_misfire`] and
/// [`Trigger::compute_first_fire_time`]; additional schedule kinds extend
/// this enum without touching the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Simple(SimpleSchedule),
}

/// Fixed-interval schedule: fire at `start_time`, then every
/// `repeat_interval_ms`, `repeat_count` more times (`None` = indefinitely).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimpleSchedule {
    pub repeat_interval_ms: u64,
    /// Number of repeats after the first fire; `None` repeats forever.
    pub repeat_count: Option<u32>,
    /// Fires consumed so far; advanced by `triggered`.
    pub times_triggered: u32,
}

impl SimpleSchedule {
    /// One-shot schedule: a single fire at the trigger's start time.
    pub fn once() -> Self {
        Self {
            repeat_interval_ms: 0,
            repeat_count: Some(0),
            times_triggered: 0,
        }
    }

    /// Repeat `count` additional times at the given interval.
    pub fn repeating(interval: Duration, count: Option<u32>) -> Self {
        Self {
            repeat_interval_ms: interval.num_milliseconds().max(0) as u64,
            repeat_count: count,
            times_triggered: 0,
        }
    }
}

/// Persistent time-based firing specification bound to a job.
///
/// The `state` column lives beside the record in the back-end and is driven
/// by the store's state machine, never by the trigger itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    /// Job this trigger fires. Referential integrity is enforced by the
    /// store at insert time; job deletion does not cascade automatically.
    pub job_key: JobKey,
    pub description: Option<String>,
    pub calendar_name: Option<String>,
    pub priority: i32,
    pub misfire_instruction: MisfireInstruction,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub schedule: Schedule,
    /// Trigger-scoped parameters, merged over the job's data map by the
    /// embedding scheduler at execution time.
    pub data: JobDataMap,
    /// Assigned when the trigger is acquired; identifies one attempted fire
    /// in the execution ledger.
    pub fire_instance_id: Option<FireInstanceId>,
}

impl Trigger {
    /// Create a trigger with default priority and smart misfire policy.
    pub fn new(
        key: TriggerKey,
        job_key: JobKey,
        schedule: Schedule,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            job_key,
            description: None,
            calendar_name: None,
            priority: DEFAULT_PRIORITY,
            misfire_instruction: MisfireInstruction::default(),
            start_time,
            end_time: None,
            next_fire_time: None,
            previous_fire_time: None,
            schedule,
            data: JobDataMap::new(),
            fire_instance_id: None,
        }
    }

    /// Builder-style priority override.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder-style calendar reference.
    pub fn with_calendar(mut self, name: impl Into<String>) -> Self {
        self.calendar_name = Some(name.into());
        self
    }

    /// Builder-style misfire policy override.
    pub fn with_misfire_instruction(mut self, instruction: MisfireInstruction) -> Self {
        self.misfire_instruction = instruction;
        self
    }

    /// First fire time at or after the start time that the calendar admits.
    /// Sets and returns `next_fire_time`.
    pub fn compute_first_fire_time(&mut self, calendar: Option<&Calendar>) -> Option<DateTime<Utc>> {
        let mut candidate = Some(self.start_time);
        if let Some(cal) = calendar {
            candidate = candidate.map(|t| cal.next_included_time(t));
        }
        if let (Some(t), Some(end)) = (candidate, self.end_time) {
            if t >= end {
                candidate = None;
            }
        }
        self.next_fire_time = candidate;
        candidate
    }

    /// Consume the pending fire: `previous_fire_time` takes the old next
    /// time, `next_fire_time` advances per the schedule and calendar.
    pub fn triggered(&mut self, calendar: Option<&Calendar>) {
        self.previous_fire_time = self.next_fire_time;
        self.next_fire_time = self.fire_time_after(self.next_fire_time, calendar);
        let Schedule::Simple(ref mut simple) = self.schedule;
        simple.times_triggered = simple.times_triggered.saturating_add(1);
    }

    /// Apply the misfire policy as of `now`. Leaves `next_fire_time` as
    /// `None` when the schedule is exhausted; the caller transitions the
    /// trigger to Complete in that case.
    pub fn update_after_misfire(&mut self, calendar: Option<&Calendar>, now: DateTime<Utc>) {
        let instruction = match self.misfire_instruction {
            MisfireInstruction::Smart => match &self.schedule {
                Schedule::Simple(s) if s.repeat_count == Some(0) => MisfireInstruction::FireNow,
                Schedule::Simple(_) => MisfireInstruction::NextWithRemainingCount,
            },
            other => other,
        };

        match instruction {
            MisfireInstruction::IgnoreMisfires => {}
            MisfireInstruction::FireNow => {
                self.next_fire_time = Some(now);
            }
            MisfireInstruction::NextWithRemainingCount => {
                let mut next = self.fire_time_after(Some(now), calendar);
                if let (Some(t), Some(cal)) = (next, calendar) {
                    if !cal.is_time_included(t) {
                        next = self.fire_time_after(Some(cal.next_included_time(t)), calendar);
                    }
                }
                self.next_fire_time = next;
            }
            MisfireInstruction::Smart => unreachable!("smart policy resolved above"),
        }
    }

    /// Next fire time strictly after `after` per the schedule, skipping
    /// calendar-excluded instants and honoring the end time.
    pub fn fire_time_after(
        &self,
        after: Option<DateTime<Utc>>,
        calendar: Option<&Calendar>,
    ) -> Option<DateTime<Utc>> {
        let after = after.unwrap_or(self.start_time - Duration::milliseconds(1));
        let Schedule::Simple(ref simple) = self.schedule;

        let mut candidate = if after < self.start_time {
            Some(self.start_time)
        } else if simple.repeat_interval_ms == 0 {
            None
        } else {
            let interval = simple.repeat_interval_ms as i64;
            let elapsed = (after - self.start_time).num_milliseconds();
            let periods = elapsed / interval + 1;
            if let Some(count) = simple.repeat_count {
                if periods > count as i64 {
                    return None;
                }
            }
            Some(self.start_time + Duration::milliseconds(periods * interval))
        };

        if let Some(cal) = calendar {
            while let Some(t) = candidate {
                if cal.is_time_included(t) {
                    break;
                }
                candidate = self.fire_time_after_raw(t);
            }
        }

        match (candidate, self.end_time) {
            (Some(t), Some(end)) if t >= end => None,
            (c, _) => c,
        }
    }

    /// Schedule arithmetic without calendar filtering.
    fn fire_time_after_raw(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let Schedule::Simple(ref simple) = self.schedule;
        if simple.repeat_interval_ms == 0 {
            return None;
        }
        let interval = simple.repeat_interval_ms as i64;
        let elapsed = (after - self.start_time).num_milliseconds();
        let periods = elapsed / interval + 1;
        if let Some(count) = simple.repeat_count {
            if periods > count as i64 {
                return None;
            }
        }
        Some(self.start_time + Duration::milliseconds(periods * interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn one_shot(start: DateTime<Utc>) -> Trigger {
        Trigger::new(
            TriggerKey::new("t"),
            JobKey::new("j"),
            Schedule::Simple(SimpleSchedule::once()),
            start,
        )
    }

    fn repeating(start: DateTime<Utc>, interval_secs: i64, count: Option<u32>) -> Trigger {
        Trigger::new(
            TriggerKey::new("t"),
            JobKey::new("j"),
            Schedule::Simple(SimpleSchedule::repeating(
                Duration::seconds(interval_secs),
                count,
            )),
            start,
        )
    }

    #[test]
    fn one_shot_fires_once() {
        let mut t = one_shot(at(100));
        assert_eq!(t.compute_first_fire_time(None), Some(at(100)));

        t.triggered(None);
        assert_eq!(t.previous_fire_time, Some(at(100)));
        assert_eq!(t.next_fire_time, None);
    }

    #[test]
    fn repeating_advances_by_interval() {
        let mut t = repeating(at(100), 10, Some(2));
        t.compute_first_fire_time(None);

        t.triggered(None);
        assert_eq!(t.next_fire_time, Some(at(110)));
        t.triggered(None);
        assert_eq!(t.next_fire_time, Some(at(120)));
        t.triggered(None);
        assert_eq!(t.next_fire_time, None, "repeat count exhausted");
    }

    #[test]
    fn end_time_caps_fires() {
        let mut t = repeating(at(100), 10, None);
        t.end_time = Some(at(120));
        t.compute_first_fire_time(None);

        t.triggered(None);
        assert_eq!(t.next_fire_time, Some(at(110)));
        t.triggered(None);
        assert_eq!(t.next_fire_time, None, "end time reached");
    }

    #[test]
    fn calendar_excluded_fires_are_skipped() {
        let cal = Calendar::permissive().exclude(at(110), at(130));
        let mut t = repeating(at(100), 10, None);
        t.compute_first_fire_time(Some(&cal));
        assert_eq!(t.next_fire_time, Some(at(100)));

        t.triggered(Some(&cal));
        assert_eq!(t.next_fire_time, Some(at(130)), "110 and 120 excluded");
    }

    #[test]
    fn misfire_fire_now_for_one_shot_smart() {
        let mut t = one_shot(at(100));
        t.compute_first_fire_time(None);

        t.update_after_misfire(None, at(500));
        assert_eq!(t.next_fire_time, Some(at(500)));
    }

    #[test]
    fn misfire_skips_to_future_fire_for_repeating_smart() {
        let mut t = repeating(at(100), 10, None);
        t.compute_first_fire_time(None);

        t.update_after_misfire(None, at(173));
        assert_eq!(t.next_fire_time, Some(at(180)));
    }

    #[test]
    fn misfire_exhausts_finite_schedule() {
        let mut t = repeating(at(100), 10, Some(3));
        t.compute_first_fire_time(None);

        // last fire would have been at 130; now is far past it
        t.update_after_misfire(None, at(1_000));
        assert_eq!(t.next_fire_time, None);
    }

    #[test]
    fn misfire_ignore_leaves_stale_time() {
        let mut t = repeating(at(100), 10, None)
            .with_misfire_instruction(MisfireInstruction::IgnoreMisfires);
        t.compute_first_fire_time(None);

        t.update_after_misfire(None, at(400));
        assert_eq!(t.next_fire_time, Some(at(100)));
    }

    #[test]
    fn external_state_collapse() {
        assert_eq!(ExternalTriggerState::from(None), ExternalTriggerState::None);
        assert_eq!(
            ExternalTriggerState::from(Some(TriggerState::Acquired)),
            ExternalTriggerState::Normal
        );
        assert_eq!(
            ExternalTriggerState::from(Some(TriggerState::PausedAndBlocked)),
            ExternalTriggerState::Paused
        );
        assert_eq!(
            ExternalTriggerState::from(Some(TriggerState::Blocked)),
            ExternalTriggerState::Blocked
        );
    }

    #[test]
    fn state_round_trips_through_identifier() {
        for state in [
            TriggerState::Waiting,
            TriggerState::Acquired,
            TriggerState::Executing,
            TriggerState::Complete,
            TriggerState::Paused,
            TriggerState::Blocked,
            TriggerState::PausedAndBlocked,
            TriggerState::Error,
        ] {
            assert_eq!(TriggerState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TriggerState::parse("DELETED"), None);
    }
}
