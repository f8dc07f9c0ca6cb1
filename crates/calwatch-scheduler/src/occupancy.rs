//! Point-in-time occupancy queries over an interval snapshot.
//!
//! Every component that decides "inside or outside" goes through
//! [`is_occupied`], so arming, firing and on-demand queries all agree on
//! half-open `[start, end)` boundaries.

use chrono::{DateTime, Utc};

use crate::{Edge, Interval, NextTransition};

/// True when some interval satisfies `start <= instant < end`.
///
/// Overlaps and duplicates do not stack: this is a boolean OR.
pub fn is_occupied(intervals: &[Interval], instant: DateTime<Utc>) -> bool {
    intervals.iter().any(|i| i.contains(instant))
}

/// Intervals covering `instant`.
pub fn covering(intervals: &[Interval], instant: DateTime<Utc>) -> impl Iterator<Item = &Interval> {
    intervals.iter().filter(move |i| i.contains(instant))
}

/// Earliest edge strictly after `instant`.
///
/// Starts of future intervals and ends of intervals covering `instant`
/// both count. Ties resolve Start before End. Not bounded by any horizon.
pub fn next_edge(intervals: &[Interval], instant: DateTime<Utc>) -> Option<NextTransition> {
    intervals
        .iter()
        .filter_map(|interval| {
            if interval.start() > instant {
                Some((interval.start(), Edge::Start, interval))
            } else if interval.end() > instant {
                Some((interval.end(), Edge::End, interval))
            } else {
                None
            }
        })
        .min_by_key(|(at, edge, _)| (*at, *edge))
        .map(|(at, edge, interval)| NextTransition {
            at,
            edge,
            interval_id: interval.id().clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn interval(id: &str, start: i64, end: i64) -> Interval {
        Interval::new(id, at(start), at(end)).unwrap()
    }

    #[test]
    fn test_empty_set_is_never_occupied() {
        assert!(!is_occupied(&[], at(0)));
        assert!(next_edge(&[], at(0)).is_none());
    }

    #[test]
    fn test_boundaries_are_half_open() {
        let set = [interval("a", 10, 20)];
        assert!(!is_occupied(&set, at(9)));
        assert!(is_occupied(&set, at(10)));
        assert!(is_occupied(&set, at(19)));
        assert!(!is_occupied(&set, at(20)));
    }

    #[test]
    fn test_back_to_back_intervals_have_no_gap() {
        let set = [interval("a", 0, 10), interval("b", 10, 20)];
        assert!(is_occupied(&set, at(10)));
        assert_eq!(covering(&set, at(10)).count(), 1);
    }

    #[test]
    fn test_overlap_reports_once() {
        let set = [interval("a", 5, 15), interval("b", 10, 20)];
        assert!(is_occupied(&set, at(12)));
        assert_eq!(covering(&set, at(12)).count(), 2);
        assert!(is_occupied(&set, at(15)));
    }

    #[test]
    fn test_next_edge_inside_points_at_end() {
        let set = [interval("a", -10, 10)];
        let next = next_edge(&set, at(0)).unwrap();
        assert_eq!(next.at, at(10));
        assert_eq!(next.edge, Edge::End);
        assert_eq!(next.interval_id.as_str(), "a");
    }

    #[test]
    fn test_next_edge_picks_earliest_across_set() {
        let set = [
            interval("later", 100, 200),
            interval("soon", 30, 40),
            interval("past", -50, -40),
        ];
        let next = next_edge(&set, at(0)).unwrap();
        assert_eq!(next.at, at(30));
        assert_eq!(next.edge, Edge::Start);
        assert_eq!(next.interval_id.as_str(), "soon");
    }

    #[test]
    fn test_next_edge_ignores_boundary_at_instant() {
        // An end exactly at `instant` is already behind us.
        let set = [interval("a", -10, 0)];
        assert!(next_edge(&set, at(0)).is_none());
    }

    #[test]
    fn test_next_edge_far_future_is_reported() {
        let far = at(0) + Duration::days(400);
        let set = [Interval::new("far", far, far + Duration::hours(1)).unwrap()];
        assert_eq!(next_edge(&set, at(0)).unwrap().at, far);
    }

    fn arb_interval() -> impl Strategy<Value = Interval> {
        (-500i64..500, 0i64..300).prop_map(|(start, len)| interval("p", start, start + len))
    }

    proptest! {
        // Duplicating the set must not change occupancy
        #[test]
        fn occupancy_ignores_duplicates(
            set in prop::collection::vec(arb_interval(), 0..8),
            probe in -600i64..900,
        ) {
            let mut doubled = set.clone();
            doubled.extend(set.iter().cloned());
            prop_assert_eq!(is_occupied(&set, at(probe)), is_occupied(&doubled, at(probe)));
        }

        // Occupancy only flips at an edge, and the next edge is where it can next flip
        #[test]
        fn occupancy_constant_until_next_edge(
            set in prop::collection::vec(arb_interval(), 1..8),
            probe in -600i64..900,
        ) {
            let now = at(probe);
            let inside = is_occupied(&set, now);
            match next_edge(&set, now) {
                Some(next) => {
                    prop_assert!(next.at > now);
                    let just_before = next.at - Duration::milliseconds(1);
                    if just_before >= now {
                        prop_assert_eq!(is_occupied(&set, just_before), inside);
                    }
                }
                None => {
                    prop_assert!(!inside, "no future edge means nothing covers now");
                }
            }
        }
    }
}
