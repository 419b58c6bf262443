use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Timelike};

use crate::data::shared_booking::SlotId;

pub fn format_iso_date(iso_string: &str) -> String {
    if let Ok(datetime) = DateTime::parse_from_rfc3339(iso_string) {
        datetime.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        iso_string.to_string()
    }
}

/// `"2025-07-30 14:00:00"` -> `"7월30일, 14:00"`.
pub fn korean_slot_label(slot: &SlotId) -> Option<String> {
    let datetime = slot.parse().ok()?;
    Some(format!(
        "{}월{}일, {:02}:{:02}",
        datetime.month(),
        datetime.day(),
        datetime.hour(),
        datetime.minute()
    ))
}

/// Inclusive list of dates; empty when `end` precedes `start`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|day| *day <= end).collect()
}

pub fn format_runtime(elapsed: TimeDelta) -> String {
    let total_minutes = elapsed.num_minutes().max(0);
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours > 0 {
        format!("{}시간 {}분", hours, minutes)
    } else {
        format!("{}분", minutes)
    }
}

/// Time left until the next top of the hour.
pub fn until_next_hour<T: Timelike>(now: T) -> Duration {
    let into_hour = Duration::from_secs(u64::from(now.minute() * 60 + now.second()))
        + Duration::from_nanos(u64::from(now.nanosecond() % 1_000_000_000));
    Duration::from_secs(3600).saturating_sub(into_hour)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn korean_label_drops_padding_and_seconds() {
        let slot = SlotId::from("2025-07-03 09:05:00");
        assert_eq!(korean_slot_label(&slot).as_deref(), Some("7월3일, 09:05"));
        assert_eq!(korean_slot_label(&SlotId::from("garbage")), None);
    }

    #[test]
    fn date_range_is_inclusive() {
        let start = NaiveDate::from_ymd_opt(2025, 7, 30).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 8, 2).unwrap();
        let days = date_range(start, end);
        assert_eq!(days.len(), 4);
        assert_eq!(days[0], start);
        assert_eq!(days[3], end);
        assert!(date_range(end, start).is_empty());
    }

    #[test]
    fn runtime_formats_hours_and_minutes() {
        assert_eq!(format_runtime(TimeDelta::minutes(42)), "42분");
        assert_eq!(format_runtime(TimeDelta::minutes(125)), "2시간 5분");
    }

    #[test]
    fn next_hour_countdown() {
        let at = |h, m, s| chrono::NaiveTime::from_hms_opt(h, m, s).unwrap();
        assert_eq!(until_next_hour(at(10, 0, 0)), Duration::from_secs(3600));
        assert_eq!(until_next_hour(at(10, 59, 30)), Duration::from_secs(30));
        assert_eq!(until_next_hour(at(23, 15, 0)), Duration::from_secs(45 * 60));
    }

    #[test]
    fn iso_dates_are_reformatted() {
        assert_eq!(
            format_iso_date("2025-08-02T10:00:00+09:00"),
            "2025-08-02 10:00:00"
        );
        assert_eq!(format_iso_date("N/A"), "N/A");
    }
}
