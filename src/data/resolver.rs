use chrono::{FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use serde_json::Value;

use super::shared_booking::{marker_is_truthy, HiddenReservationMap, ResolvedStatus};
use crate::error::ParseError;

/// How a slot's timestamp is matched against the hidden reservation keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTolerance {
    Exact,
    /// Nearest key within this many seconds; ties go to the earlier key.
    Window(u32),
}

impl MatchTolerance {
    pub fn from_secs(secs: u32) -> Self {
        if secs == 0 {
            MatchTolerance::Exact
        } else {
            MatchTolerance::Window(secs)
        }
    }
}

/// Reconciles the public "reserved" flag with the hidden reservation map.
#[derive(Debug, Clone)]
pub struct SlotStatusResolver {
    offset: FixedOffset,
    tolerance: MatchTolerance,
}

impl SlotStatusResolver {
    pub fn new(offset: FixedOffset, tolerance: MatchTolerance) -> Self {
        Self { offset, tolerance }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Unix timestamp of a local slot start in the activity's timezone.
    pub fn slot_timestamp(&self, date: &str, time: &str) -> Result<i64, ParseError> {
        let naive = parse_slot_datetime(date, time)?;
        self.offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.timestamp())
            .ok_or_else(|| ParseError::NonexistentLocalTime(naive.to_string()))
    }

    /// Hidden entry wins over the reported flag in both directions; without
    /// an entry the reported flag decides.
    pub fn resolve(
        &self,
        theme_id: u64,
        time: &str,
        date: &str,
        hidden: &HiddenReservationMap,
        reported_reserved: bool,
    ) -> Result<ResolvedStatus, ParseError> {
        let timestamp = self.slot_timestamp(date, time)?;
        let status = match self.lookup(theme_id, timestamp, hidden) {
            Some(marker) if marker_is_truthy(marker) => ResolvedStatus::Reserved,
            Some(_) => ResolvedStatus::Available,
            None if reported_reserved => ResolvedStatus::Reserved,
            None => ResolvedStatus::Available,
        };
        log::debug!(
            "resolved {} {} (ts {}, reported_reserved {}) -> {}",
            date,
            time,
            timestamp,
            reported_reserved,
            status.label()
        );
        Ok(status)
    }

    /// Like [`resolve`](Self::resolve), but a slot that cannot be parsed is
    /// treated as reserved so bad data never produces a notification.
    pub fn resolve_or_reserved(
        &self,
        theme_id: u64,
        time: &str,
        date: &str,
        hidden: &HiddenReservationMap,
        reported_reserved: bool,
    ) -> ResolvedStatus {
        match self.resolve(theme_id, time, date, hidden, reported_reserved) {
            Ok(status) => status,
            Err(e) => {
                log::warn!("treating slot {} {} as reserved: {}", date, time, e);
                ResolvedStatus::Reserved
            }
        }
    }

    fn lookup<'a>(
        &self,
        theme_id: u64,
        timestamp: i64,
        hidden: &'a HiddenReservationMap,
    ) -> Option<&'a Value> {
        let entries = hidden.theme(theme_id)?;
        match self.tolerance {
            MatchTolerance::Exact => entries.get(&timestamp.to_string()),
            MatchTolerance::Window(window) => entries
                .iter()
                .filter_map(|(key, marker)| {
                    let key_ts = key.trim().parse::<i64>().ok()?;
                    let distance = key_ts.abs_diff(timestamp);
                    (distance <= u64::from(window)).then_some((distance, key_ts, marker))
                })
                .min_by_key(|(distance, key_ts, _)| (*distance, *key_ts))
                .map(|(_, _, marker)| marker),
        }
    }
}

pub fn parse_slot_date(date: &str) -> Result<NaiveDate, ParseError> {
    NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").map_err(|source| ParseError::Date {
        value: date.to_string(),
        source,
    })
}

pub fn parse_slot_time(time: &str) -> Result<NaiveTime, ParseError> {
    let trimmed = time.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map_err(|source| ParseError::Time {
            value: time.to_string(),
            source,
        })
}

pub fn parse_slot_datetime(date: &str, time: &str) -> Result<NaiveDateTime, ParseError> {
    Ok(NaiveDateTime::new(parse_slot_date(date)?, parse_slot_time(time)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const THEME: u64 = 61;
    // 2025-08-02 19:00:00 in Asia/Seoul
    const SEVEN_PM: i64 = 1_754_128_800;

    fn seoul(tolerance: MatchTolerance) -> SlotStatusResolver {
        SlotStatusResolver::new(FixedOffset::east_opt(9 * 3600).unwrap(), tolerance)
    }

    fn hidden_with(ts: i64, marker: Value) -> HiddenReservationMap {
        let mut hidden = HiddenReservationMap::new();
        hidden.insert(THEME, ts, marker);
        hidden
    }

    #[test]
    fn timestamp_uses_activity_offset() {
        let resolver = seoul(MatchTolerance::Exact);
        assert_eq!(
            resolver.slot_timestamp("2025-08-02", "19:00:00").unwrap(),
            SEVEN_PM
        );
        assert_eq!(resolver.slot_timestamp("2025-08-02", "19:00").unwrap(), SEVEN_PM);
    }

    #[test]
    fn truthy_hidden_entry_reserves_regardless_of_reported_flag() {
        let resolver = seoul(MatchTolerance::Exact);
        let hidden = hidden_with(SEVEN_PM, json!({"name": "booked"}));
        for reported in [true, false] {
            let status = resolver
                .resolve(THEME, "19:00:00", "2025-08-02", &hidden, reported)
                .unwrap();
            assert_eq!(status, ResolvedStatus::Reserved);
        }
    }

    #[test]
    fn falsy_hidden_entry_frees_slot_even_if_reported_reserved() {
        let resolver = seoul(MatchTolerance::Exact);
        let hidden = hidden_with(SEVEN_PM, json!(0));
        let status = resolver
            .resolve(THEME, "19:00:00", "2025-08-02", &hidden, true)
            .unwrap();
        assert_eq!(status, ResolvedStatus::Available);
    }

    #[test]
    fn falls_back_to_reported_flag_without_entry() {
        let resolver = seoul(MatchTolerance::Exact);
        let other_theme = {
            let mut hidden = HiddenReservationMap::new();
            hidden.insert(62, SEVEN_PM, json!(true));
            hidden
        };
        for hidden in [HiddenReservationMap::new(), other_theme, hidden_with(SEVEN_PM + 60, json!(true))] {
            let reserved = resolver
                .resolve(THEME, "19:00:00", "2025-08-02", &hidden, true)
                .unwrap();
            let free = resolver
                .resolve(THEME, "19:00:00", "2025-08-02", &hidden, false)
                .unwrap();
            assert_eq!(reserved, ResolvedStatus::Reserved);
            assert_eq!(free, ResolvedStatus::Available);
        }
    }

    #[test]
    fn one_second_skew_misses_exact_but_hits_window() {
        let hidden = hidden_with(SEVEN_PM + 1, json!(true));
        let exact = seoul(MatchTolerance::Exact)
            .resolve(THEME, "19:00:00", "2025-08-02", &hidden, false)
            .unwrap();
        assert_eq!(exact, ResolvedStatus::Available);

        let windowed = seoul(MatchTolerance::from_secs(5))
            .resolve(THEME, "19:00:00", "2025-08-02", &hidden, false)
            .unwrap();
        assert_eq!(windowed, ResolvedStatus::Reserved);
    }

    #[test]
    fn window_prefers_nearest_then_earlier_key() {
        let mut hidden = HiddenReservationMap::new();
        hidden.insert(THEME, SEVEN_PM - 3, json!(false));
        hidden.insert(THEME, SEVEN_PM + 3, json!(true));
        hidden.insert(THEME, SEVEN_PM + 10, json!(true));
        let status = seoul(MatchTolerance::Window(30))
            .resolve(THEME, "19:00:00", "2025-08-02", &hidden, true)
            .unwrap();
        assert_eq!(status, ResolvedStatus::Available);
    }

    #[test]
    fn window_ignores_extreme_keys() {
        let mut hidden = HiddenReservationMap::new();
        hidden.insert(THEME, i64::MIN, json!(true));
        hidden.insert(THEME, i64::MAX, json!(true));
        let status = seoul(MatchTolerance::Window(u32::MAX))
            .resolve(THEME, "19:00:00", "2025-08-02", &hidden, false)
            .unwrap();
        assert_eq!(status, ResolvedStatus::Available);
    }

    #[test]
    fn unparseable_time_is_reserved() {
        let resolver = seoul(MatchTolerance::Exact);
        let hidden = HiddenReservationMap::new();
        assert!(resolver
            .resolve(THEME, "7pm", "2025-08-02", &hidden, false)
            .is_err());
        assert_eq!(
            resolver.resolve_or_reserved(THEME, "7pm", "2025-08-02", &hidden, false),
            ResolvedStatus::Reserved
        );
        assert_eq!(
            resolver.resolve_or_reserved(THEME, "19:00:00", "2025-13-02", &hidden, false),
            ResolvedStatus::Reserved
        );
    }
}
