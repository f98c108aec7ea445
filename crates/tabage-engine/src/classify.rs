//! Age classification
//!
//! Ages are counted in local calendar days: two instants twenty hours apart
//! that straddle local midnight are one day apart. The bucket with the largest
//! `min_days` not exceeding the age wins; no qualifying bucket means the
//! resource stays unbucketed.

use chrono::{DateTime, TimeZone, Utc};
use tabage_core::BucketDefinition;

/// Whole local days between the calendar day of `created` and the calendar day
/// of `now`, in `now`'s time zone. Timestamps from the future count as age 0.
pub fn calendar_days_between<Tz: TimeZone>(created: DateTime<Utc>, now: &DateTime<Tz>) -> u32 {
    let created_day = created.with_timezone(&now.timezone()).date_naive();
    let days = now
        .date_naive()
        .signed_duration_since(created_day)
        .num_days();
    u32::try_from(days.max(0)).unwrap_or(u32::MAX)
}

/// Raw elapsed 24-hour periods. Only used for reporting.
pub fn elapsed_days<Tz: TimeZone>(created: DateTime<Utc>, now: &DateTime<Tz>) -> i64 {
    now.with_timezone(&Utc)
        .signed_duration_since(created)
        .num_days()
}

pub fn bucket_for_age(age_days: u32, definitions: &[BucketDefinition]) -> Option<&BucketDefinition> {
    definitions
        .iter()
        .filter(|d| d.min_days <= age_days)
        .max_by_key(|d| d.min_days)
}

pub fn classify<'a, Tz: TimeZone>(
    created: DateTime<Utc>,
    now: &DateTime<Tz>,
    definitions: &'a [BucketDefinition],
) -> Option<&'a BucketDefinition> {
    bucket_for_age(calendar_days_between(created, now), definitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn zone() -> FixedOffset {
        FixedOffset::east_opt(2 * 3600).unwrap()
    }

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<FixedOffset> {
        zone().with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn week_buckets() -> Vec<BucketDefinition> {
        vec![
            BucketDefinition::new("Today", 0),
            BucketDefinition::new("Yesterday", 1),
            BucketDefinition::new("ThisWeek", 2),
            BucketDefinition::new("LastWeek", 7),
            BucketDefinition::new("Older", 14),
        ]
    }

    #[test]
    fn midnight_crossing_counts_as_a_day() {
        let created = local(2024, 3, 10, 10, 0).with_timezone(&Utc);
        let now = local(2024, 3, 11, 6, 0);
        assert_eq!(calendar_days_between(created, &now), 1);
        assert_eq!(elapsed_days(created, &now), 0);
    }

    #[test]
    fn same_local_day_is_zero() {
        let created = local(2024, 3, 10, 0, 1).with_timezone(&Utc);
        let now = local(2024, 3, 10, 23, 59);
        assert_eq!(calendar_days_between(created, &now), 0);
    }

    #[test]
    fn future_timestamps_clamp_to_zero() {
        let created = local(2024, 3, 12, 0, 0).with_timezone(&Utc);
        let now = local(2024, 3, 10, 12, 0);
        assert_eq!(calendar_days_between(created, &now), 0);
    }

    #[test]
    fn scenario_from_midnight_of_day_d() {
        let defs = week_buckets();
        let created = local(2024, 3, 10, 0, 0).with_timezone(&Utc);

        let name = |now: DateTime<FixedOffset>| classify(created, &now, &defs).map(|b| b.name.clone());

        assert_eq!(name(local(2024, 3, 10, 8, 0)).as_deref(), Some("Today"));
        assert_eq!(name(local(2024, 3, 11, 8, 0)).as_deref(), Some("Yesterday"));
        assert_eq!(name(local(2024, 3, 12, 8, 0)).as_deref(), Some("ThisWeek"));
        assert_eq!(name(local(2024, 3, 19, 8, 0)).as_deref(), Some("LastWeek"));
        assert_eq!(name(local(2024, 3, 30, 8, 0)).as_deref(), Some("Older"));
    }

    #[test]
    fn highest_qualifying_threshold_wins_regardless_of_order() {
        let defs = vec![
            BucketDefinition::new("Older", 14),
            BucketDefinition::new("Today", 0),
            BucketDefinition::new("LastWeek", 7),
        ];
        for age in 0..40u32 {
            let expected = [14u32, 7, 0].into_iter().find(|t| *t <= age).unwrap();
            assert_eq!(bucket_for_age(age, &defs).unwrap().min_days, expected, "age {}", age);
        }
    }

    #[test]
    fn no_bucket_below_smallest_threshold() {
        let defs = vec![BucketDefinition::new("Yesterday", 1), BucketDefinition::new("Older", 7)];
        assert!(bucket_for_age(0, &defs).is_none());
        assert_eq!(bucket_for_age(1, &defs).unwrap().name, "Yesterday");
        assert!(bucket_for_age(5, &[]).is_none());
    }

    #[test]
    fn classification_is_monotonic_in_age() {
        let defs = week_buckets();
        let mut previous: Option<u32> = None;
        for age in 0..60u32 {
            let current = bucket_for_age(age, &defs).map(|b| b.min_days);
            if let (Some(prev), Some(cur)) = (previous, current) {
                assert!(cur >= prev, "age {} moved from {} to {}", age, prev, cur);
            }
            previous = current;
        }
    }
}
