use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A calendar value: a set of excluded time ranges a trigger's fire times
/// must avoid.
///
/// Calendars are opaque to the store except for the inclusion query; triggers
/// reference them by name and consult them when advancing fire times. When
/// clustering is disabled the store keeps a small name-to-value cache,
/// invalidated on store/remove.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    /// Half-open `[start, end)` ranges during which firing is excluded.
    pub excluded_ranges: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    /// Free-form description, surfaced to operators only.
    pub description: Option<String>,
}

impl Calendar {
    /// Calendar excluding nothing.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Add an excluded range.
    pub fn exclude(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.excluded_ranges.push((start, end));
        self
    }

    /// Whether the instant falls outside every excluded range.
    pub fn is_time_included(&self, at: DateTime<Utc>) -> bool {
        !self
            .excluded_ranges
            .iter()
            .any(|(start, end)| at >= *start && at < *end)
    }

    /// First included instant at or after `from`, walking past excluded
    /// ranges. Returns `None` if no included instant exists within the
    /// scanned ranges (unbounded calendars always yield a time).
    pub fn next_included_time(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let mut at = from;
        // ranges may overlap; loop until a pass makes no adjustment
        loop {
            let mut moved = false;
            for (start, end) in &self.excluded_ranges {
                if at >= *start && at < *end {
                    at = *end;
                    moved = true;
                }
            }
            if !moved {
                return at;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn permissive_includes_everything() {
        let cal = Calendar::permissive();
        assert!(cal.is_time_included(at(0)));
        assert!(cal.is_time_included(at(1_700_000_000)));
    }

    #[test]
    fn excluded_range_is_half_open() {
        let cal = Calendar::permissive().exclude(at(100), at(200));
        assert!(cal.is_time_included(at(99)));
        assert!(!cal.is_time_included(at(100)));
        assert!(!cal.is_time_included(at(199)));
        assert!(cal.is_time_included(at(200)));
    }

    #[test]
    fn next_included_time_walks_overlapping_ranges() {
        let cal = Calendar::permissive()
            .exclude(at(100), at(200))
            .exclude(at(150), at(300));
        assert_eq!(cal.next_included_time(at(120)), at(300));
        assert_eq!(cal.next_included_time(at(300)), at(300));
        assert_eq!(cal.next_included_time(at(50)), at(50));
    }
}
