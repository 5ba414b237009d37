//! Collapsing of timezone-shifted duplicate watch timestamps.
//!
//! Export runs made under different timezone settings render the same watch
//! event with a different hour (and sometimes day). A shift like that only
//! ever moves a timestamp by whole hours, so two timestamps that share year,
//! month, minute and second and lie less than [`DUPLICATE_WINDOW_HOURS`]
//! apart are treated as one event.

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};

/// Upper bound (exclusive) on the gap between two renderings of one event.
pub const DUPLICATE_WINDOW_HOURS: i64 = 26;

/// Whether `a` and `b` are two renderings of the same watch event.
pub fn is_duplicate(a: &NaiveDateTime, b: &NaiveDateTime) -> bool {
    if a.year() != b.year()
        || a.month() != b.month()
        || a.minute() != b.minute()
        || a.second() != b.second()
    {
        return false;
    }
    let gap = (*a - *b).abs();
    gap < Duration::hours(DUPLICATE_WINDOW_HOURS)
}

/// Accepted timestamps for one video id (or the unknown bucket).
///
/// Seeded with what the store already holds; every candidate offered is
/// checked against everything accepted so far, persisted or not.
#[derive(Debug, Default, Clone)]
pub struct Reconciler {
    accepted: Vec<NaiveDateTime>,
    persisted: usize,
}

impl Reconciler {
    pub fn new(existing: Vec<NaiveDateTime>) -> Self {
        let persisted = existing.len();
        Self {
            accepted: existing,
            persisted,
        }
    }

    /// Returns true and records `candidate` if it is a new event.
    pub fn offer(&mut self, candidate: NaiveDateTime) -> bool {
        if self.accepted.iter().any(|t| is_duplicate(t, &candidate)) {
            return false;
        }
        self.accepted.push(candidate);
        true
    }

    /// Timestamps accepted during this run, in the order they were offered.
    pub fn novel(&self) -> &[NaiveDateTime] {
        &self.accepted[self.persisted..]
    }

    pub fn into_novel(mut self) -> Vec<NaiveDateTime> {
        self.accepted.split_off(self.persisted)
    }
}

/// Splits `candidates` into the ones that are new relative to `existing`.
/// The first of several near-identical candidates wins.
pub fn novel_timestamps<I>(existing: Vec<NaiveDateTime>, candidates: I) -> Vec<NaiveDateTime>
where
    I: IntoIterator<Item = NaiveDateTime>,
{
    let mut reconciler = Reconciler::new(existing);
    for candidate in candidates {
        reconciler.offer(candidate);
    }
    reconciler.into_novel()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    #[test]
    fn hour_shift_is_duplicate() {
        assert!(is_duplicate(
            &ts("2021-06-01T14:30:15"),
            &ts("2021-06-01T18:30:15")
        ));
    }

    #[test]
    fn full_day_shift_is_still_duplicate() {
        assert!(is_duplicate(
            &ts("2021-06-01T14:30:15"),
            &ts("2021-06-02T14:30:15")
        ));
    }

    #[test]
    fn one_second_off_is_novel() {
        assert!(!is_duplicate(
            &ts("2021-06-01T14:30:15"),
            &ts("2021-06-03T14:30:16")
        ));
    }

    #[test]
    fn window_is_exclusive_at_26_hours() {
        let base = ts("2021-06-01T10:30:15");
        assert!(is_duplicate(&base, &ts("2021-06-02T11:30:15")));
        assert!(!is_duplicate(&base, &ts("2021-06-02T12:30:15")));
        assert!(!is_duplicate(&base, &ts("2021-06-03T10:30:15")));
    }

    #[test]
    fn month_boundary_never_matches() {
        // same minute/second, 3h apart, but the month differs
        assert!(!is_duplicate(
            &ts("2021-06-30T23:10:05"),
            &ts("2021-07-01T02:10:05")
        ));
    }

    #[test]
    fn predicate_is_symmetric() {
        let a = ts("2021-06-01T14:30:15");
        let b = ts("2021-06-01T02:30:15");
        assert_eq!(is_duplicate(&a, &b), is_duplicate(&b, &a));
    }

    #[test]
    fn candidates_are_checked_against_store_and_each_other() {
        let existing = vec![ts("2021-06-01T14:30:15")];
        let novel = novel_timestamps(
            existing,
            vec![
                ts("2021-06-01T18:30:15"),
                ts("2021-06-02T14:30:15"),
                ts("2021-06-03T14:30:16"),
                ts("2021-06-03T09:30:16"),
            ],
        );
        assert_eq!(novel, vec![ts("2021-06-03T14:30:16")]);
    }

    #[test]
    fn first_of_near_duplicates_is_kept() {
        let novel = novel_timestamps(
            Vec::new(),
            vec![ts("2021-06-01T20:00:00"), ts("2021-06-01T16:00:00")],
        );
        assert_eq!(novel, vec![ts("2021-06-01T20:00:00")]);
    }

    #[test]
    fn unknown_bucket_aggregation() {
        let ten_minutes_apart = novel_timestamps(
            Vec::new(),
            vec![ts("2021-06-01T12:00:00"), ts("2021-06-01T12:10:00")],
        );
        assert_eq!(ten_minutes_apart.len(), 2);

        let two_hours_apart = novel_timestamps(
            Vec::new(),
            vec![ts("2021-06-01T12:00:00"), ts("2021-06-01T14:00:00")],
        );
        assert_eq!(two_hours_apart.len(), 1);
    }

    #[test]
    fn reoffering_persisted_values_yields_nothing() {
        let existing = vec![ts("2021-06-01T12:00:00"), ts("2021-06-05T12:00:00")];
        let novel = novel_timestamps(existing.clone(), existing);
        assert!(novel.is_empty());
    }

    #[test]
    fn offer_reports_acceptance() {
        let mut r = Reconciler::default();
        assert!(r.offer(ts("2021-06-01T12:00:00")));
        assert!(!r.offer(ts("2021-06-01T13:00:00")));
        assert_eq!(r.novel(), &[ts("2021-06-01T12:00:00")]);
    }
}
