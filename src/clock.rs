use chrono::NaiveDate;

/// Whole days elapsed since the profile's start date, floored at 0 when the
/// start date is unset or in the future. Day 0 means tier 1 content.
pub fn elapsed_days(start_date: Option<NaiveDate>, today: NaiveDate) -> i64 {
    match start_date {
        Some(start) => (today - start).num_days().max(0),
        None => 0,
    }
}

/// The day number shown to the user (day 1 is the first day of practice).
pub fn day_number(start_date: Option<NaiveDate>, today: NaiveDate) -> i64 {
    elapsed_days(start_date, today) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_elapsed_days() {
        assert_eq!(elapsed_days(Some(d(2025, 1, 1)), d(2025, 1, 1)), 0);
        assert_eq!(elapsed_days(Some(d(2025, 1, 1)), d(2025, 1, 8)), 7);
        assert_eq!(elapsed_days(Some(d(2025, 1, 1)), d(2025, 3, 2)), 60);
    }

    #[test]
    fn test_future_start_floors_to_zero() {
        assert_eq!(elapsed_days(Some(d(2025, 6, 1)), d(2025, 1, 1)), 0);
    }

    #[test]
    fn test_unset_start_is_day_zero() {
        assert_eq!(elapsed_days(None, d(2025, 1, 1)), 0);
        assert_eq!(day_number(None, d(2025, 1, 1)), 1);
    }
}
