use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ParseError;

pub const SLOT_ID_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Canonical `"YYYY-MM-DD HH:MM:SS"` key of one bookable slot.
///
/// Equality and ordering are plain string comparisons. Because both fields
/// are zero-padded, string order is also chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(String);

impl SlotId {
    pub fn new(date: NaiveDate, time: NaiveTime) -> Self {
        Self(NaiveDateTime::new(date, time).format(SLOT_ID_FORMAT).to_string())
    }

    /// Joins the strings as the upstream listing reports them, without
    /// validating either part.
    pub fn from_raw(date: &str, time: &str) -> Self {
        Self(format!("{} {}", date, time))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(&self) -> Result<NaiveDateTime, ParseError> {
        NaiveDateTime::parse_from_str(&self.0, SLOT_ID_FORMAT)
            .map_err(|_| ParseError::SlotId(self.0.clone()))
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlotId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One entry of the public listing for the monitored theme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSlotRecord {
    pub time: String,
    #[serde(rename = "reservation", default)]
    pub reported_reserved: bool,
}

/// Secondary reservation table scraped from the booking page:
/// theme id -> unix timestamp (string encoded) -> reservation marker.
///
/// A theme whose table is not a JSON object (PHP renders an empty table
/// as `[]`) reads as a theme without entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HiddenReservationMap(HashMap<String, BTreeMap<String, Value>>);

impl<'de> Deserialize<'de> for HiddenReservationMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = HashMap::<String, Value>::deserialize(deserializer)?;
        let themes = raw
            .into_iter()
            .map(|(theme_id, table)| {
                let entries = match table {
                    Value::Object(entries) => entries.into_iter().collect(),
                    _ => BTreeMap::new(),
                };
                (theme_id, entries)
            })
            .collect();
        Ok(Self(themes))
    }
}

impl HiddenReservationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, theme_id: u64, timestamp: i64, marker: Value) {
        self.0
            .entry(theme_id.to_string())
            .or_default()
            .insert(timestamp.to_string(), marker);
    }

    pub fn theme(&self, theme_id: u64) -> Option<&BTreeMap<String, Value>> {
        self.0.get(&theme_id.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }

    pub fn theme_count(&self) -> usize {
        self.0.len()
    }
}

/// Truthiness of a reservation marker: null, false, 0, "" and empty
/// containers are falsy.
pub fn marker_is_truthy(marker: &Value) -> bool {
    match marker {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolvedStatus {
    Available,
    Reserved,
}

impl ResolvedStatus {
    pub fn is_available(self) -> bool {
        self == ResolvedStatus::Available
    }

    pub fn label(self) -> &'static str {
        match self {
            ResolvedStatus::Available => "AVAILABLE",
            ResolvedStatus::Reserved => "RESERVED",
        }
    }
}

/// Resolved status of every slot seen in one cycle. Replaced wholesale on
/// every successful cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub slots: BTreeMap<SlotId, ResolvedStatus>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl StatusSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: SlotId, status: ResolvedStatus) {
        self.slots.insert(id, status);
    }

    pub fn get(&self, id: &SlotId) -> Option<ResolvedStatus> {
        self.slots.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.slots.values().filter(|s| s.is_available()).count()
    }

    pub fn reserved_count(&self) -> usize {
        self.len() - self.available_count()
    }

    pub fn touch(&mut self) {
        self.last_updated = Some(chrono::Utc::now().to_rfc3339());
    }
}

impl FromIterator<(SlotId, ResolvedStatus)> for StatusSnapshot {
    fn from_iter<I: IntoIterator<Item = (SlotId, ResolvedStatus)>>(iter: I) -> Self {
        Self {
            slots: iter.into_iter().collect(),
            last_updated: None,
        }
    }
}

/// What the fetch collaborator returns for one date.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    /// Id of the monitored theme in the public listing, when it was found.
    pub theme_id: Option<u64>,
    pub records: Vec<RawSlotRecord>,
    pub hidden: HiddenReservationMap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn slot_id_orders_chronologically() {
        let date = NaiveDate::from_ymd_opt(2025, 8, 2).unwrap();
        let morning = SlotId::new(date, NaiveTime::from_hms_opt(9, 5, 0).unwrap());
        let evening = SlotId::new(date, NaiveTime::from_hms_opt(19, 0, 0).unwrap());
        assert_eq!(morning.as_str(), "2025-08-02 09:05:00");
        assert!(morning < evening);
        assert_eq!(evening, SlotId::from_raw("2025-08-02", "19:00:00"));
    }

    #[test]
    fn raw_record_reads_listing_fields() {
        let record: RawSlotRecord =
            serde_json::from_value(json!({"time": "14:20:00", "reservation": true})).unwrap();
        assert_eq!(record.time, "14:20:00");
        assert!(record.reported_reserved);

        let missing: RawSlotRecord = serde_json::from_value(json!({"time": "16:00:00"})).unwrap();
        assert!(!missing.reported_reserved);
    }

    #[test]
    fn marker_truthiness() {
        assert!(marker_is_truthy(&json!(true)));
        assert!(marker_is_truthy(&json!(1)));
        assert!(marker_is_truthy(&json!("Y")));
        assert!(marker_is_truthy(&json!({"name": "x"})));
        assert!(!marker_is_truthy(&json!(false)));
        assert!(!marker_is_truthy(&json!(0)));
        assert!(!marker_is_truthy(&json!("")));
        assert!(!marker_is_truthy(&json!(null)));
        assert!(!marker_is_truthy(&json!([])));
    }

    #[test]
    fn snapshot_serializes_status_labels() {
        let mut snapshot = StatusSnapshot::new();
        snapshot.insert(SlotId::from("2025-01-30 18:30:00"), ResolvedStatus::Reserved);
        snapshot.insert(SlotId::from("2025-01-30 20:00:00"), ResolvedStatus::Available);
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["slots"]["2025-01-30 18:30:00"], "RESERVED");
        assert_eq!(value["slots"]["2025-01-30 20:00:00"], "AVAILABLE");
        assert_eq!(snapshot.available_count(), 1);
        assert_eq!(snapshot.reserved_count(), 1);
    }

    #[test]
    fn hidden_map_reads_nested_json() {
        let hidden: HiddenReservationMap = serde_json::from_value(json!({
            "61": {"1754128800": {"name": "booked"}},
            "62": {}
        }))
        .unwrap();
        assert_eq!(hidden.theme_count(), 2);
        assert!(hidden.theme(61).unwrap().contains_key("1754128800"));
        assert!(hidden.theme(99).is_none());
        assert!(!hidden.is_empty());
    }

    #[test]
    fn hidden_map_tolerates_non_object_theme_tables() {
        let hidden: HiddenReservationMap = serde_json::from_value(json!({
            "61": {"1754128800": 1},
            "62": [],
            "63": null
        }))
        .unwrap();
        assert_eq!(hidden.theme_count(), 3);
        assert_eq!(hidden.theme(61).unwrap()["1754128800"], json!(1));
        assert!(hidden.theme(62).unwrap().is_empty());
        assert!(hidden.theme(63).unwrap().is_empty());
        assert!(!hidden.is_empty());

        let all_empty: HiddenReservationMap = serde_json::from_value(json!({"62": []})).unwrap();
        assert!(all_empty.is_empty());
    }
}
