//! Time-triggered records inside schemaless documents
//!
//! A record takes part in sweeps when it carries `active: true` and a due
//! timestamp. It moves `Pending -> Due -> Fired` and never back.

use crate::sweep::{SweepError, SweepResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Flag that is `true` until the record fires
pub const ACTIVE_FIELD: &str = "active";

/// Position of a record inside its collection
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum RecordLocator {
    #[display("[{_0}]")]
    Index(usize),
    #[display("{_0}")]
    Key(String),
}

/// Where a record stands relative to a sweep instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum RecordStatus {
    /// Not time-triggered, or already fired
    Inactive,
    /// Active, due in the future
    Pending,
    /// Active and due now or earlier
    Due,
    /// Active but the due field is missing or unparseable
    Unschedulable,
}

/// Parse a timestamp field: RFC 3339 text or Unix milliseconds
#[must_use]
pub fn timestamp_field(record: &Value, field: &str) -> Option<DateTime<Utc>> {
    match record.get(field)? {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(number) => number.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Classify a record for a sweep at `now`
#[must_use]
pub fn classify(record: &Value, due_field: &str, now: DateTime<Utc>) -> RecordStatus {
    if record.get(ACTIVE_FIELD).and_then(Value::as_bool) != Some(true) {
        return RecordStatus::Inactive;
    }
    match timestamp_field(record, due_field) {
        Some(due) if due <= now => RecordStatus::Due,
        Some(_) => RecordStatus::Pending,
        None => RecordStatus::Unschedulable,
    }
}

/// A due record as handed to a sweep handler
#[derive(Debug, Clone, PartialEq)]
pub struct DueRecord {
    pub document_key: String,
    pub collection: Option<String>,
    pub locator: RecordLocator,
    pub due_at: DateTime<Utc>,
    pub data: Value,
}

impl DueRecord {
    /// Identity that survives between sweeps: the key of a map record, the
    /// content of an array record (indexes shift when records are pruned)
    pub(crate) fn identity(&self) -> String {
        let collection = self.collection.as_deref().unwrap_or_default();
        match &self.locator {
            RecordLocator::Key(key) => format!("{}/{collection}/{key}", self.document_key),
            RecordLocator::Index(_) => {
                format!("{}/{collection}/{}", self.document_key, self.data)
            }
        }
    }

    #[must_use]
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    /// A Discord id stored as a string or a number
    ///
    /// # Errors
    /// `InvalidRecord` if the field is missing, malformed or zero.
    pub fn snowflake(&self, field: &str) -> SweepResult<u64> {
        self.optional_snowflake(field)?.ok_or_else(|| {
            SweepError::InvalidRecord(format!("{} is missing {field}", self.locator))
        })
    }

    /// Like `snowflake`, but absent or `null` is `Ok(None)`
    ///
    /// # Errors
    /// `InvalidRecord` if the field is present but malformed or zero.
    pub fn optional_snowflake(&self, field: &str) -> SweepResult<Option<u64>> {
        let id = match self.data.get(field) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::String(text)) => text.parse::<u64>().ok(),
            Some(Value::Number(number)) => number.as_u64(),
            Some(_) => None,
        };
        match id {
            Some(id) if id != 0 => Ok(Some(id)),
            _ => Err(SweepError::InvalidRecord(format!(
                "{} has a malformed {field}",
                self.locator
            ))),
        }
    }
}

/// Find the collection a registration points at; `None` means the root
pub(crate) fn collection<'a>(document: &'a Value, name: Option<&str>) -> Option<&'a Value> {
    match name {
        Some(name) => document.get(name),
        None => Some(document),
    }
}

pub(crate) fn collection_mut<'a>(
    document: &'a mut Value,
    name: Option<&str>,
) -> Option<&'a mut Value> {
    match name {
        Some(name) => document.get_mut(name),
        None => Some(document),
    }
}

/// Records of a collection in processing order: array order, or key order
/// for maps
pub(crate) fn entries(collection: &Value) -> Vec<(RecordLocator, &Value)> {
    match collection {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| (RecordLocator::Index(index), item))
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(key, item)| (RecordLocator::Key(key.clone()), item))
            .collect(),
        _ => Vec::new(),
    }
}

/// Find a previously snapshotted record in a fresh copy of its collection.
///
/// Array records are matched by content, since callers may have inserted or
/// removed entries in the meantime. Map records are matched by key as long as
/// they are still active.
pub(crate) fn locate_mut<'a>(
    collection: &'a mut Value,
    locator: &RecordLocator,
    snapshot: &Value,
) -> Option<&'a mut Value> {
    match (collection, locator) {
        (Value::Array(items), RecordLocator::Index(index)) => {
            let position = if items.get(*index) == Some(snapshot) {
                Some(*index)
            } else {
                items.iter().position(|item| item == snapshot)
            };
            position.and_then(move |position| items.get_mut(position))
        }
        (Value::Object(map), RecordLocator::Key(key)) => map
            .get_mut(key)
            .filter(|record| record.get(ACTIVE_FIELD).and_then(Value::as_bool) == Some(true)),
        _ => None,
    }
}

/// Flip a record to fired
pub(crate) fn mark_fired(record: &mut Value, completed_field: &str, now: DateTime<Utc>) {
    if let Some(fields) = record.as_object_mut() {
        fields.insert(ACTIVE_FIELD.to_string(), Value::Bool(false));
        fields.insert(
            completed_field.to_string(),
            Value::String(format_timestamp(now)),
        );
    }
}

fn is_expired(
    record: &Value,
    completed_field: &str,
    due_field: &str,
    cutoff: DateTime<Utc>,
) -> bool {
    if record.get(ACTIVE_FIELD).and_then(Value::as_bool) != Some(false) {
        return false;
    }
    timestamp_field(record, completed_field)
        .or_else(|| timestamp_field(record, due_field))
        .is_some_and(|at| at < cutoff)
}

/// Drop fired records that finished before `cutoff`. Returns how many went.
pub(crate) fn prune(
    collection: &mut Value,
    completed_field: &str,
    due_field: &str,
    cutoff: DateTime<Utc>,
) -> usize {
    match collection {
        Value::Array(items) => {
            let before = items.len();
            items.retain(|record| !is_expired(record, completed_field, due_field, cutoff));
            before - items.len()
        }
        Value::Object(map) => {
            let before = map.len();
            map.retain(|_, record| !is_expired(record, completed_field, due_field, cutoff));
            before - map.len()
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_classify() {
        let now = Utc::now();
        let past = format_timestamp(now - Duration::seconds(1));
        let future = format_timestamp(now + Duration::minutes(5));

        let due = json!({ "active": true, "remind_at": past });
        assert_eq!(classify(&due, "remind_at", now), RecordStatus::Due);

        let pending = json!({ "active": true, "remind_at": future });
        assert_eq!(classify(&pending, "remind_at", now), RecordStatus::Pending);

        let fired = json!({ "active": false, "remind_at": past });
        assert_eq!(classify(&fired, "remind_at", now), RecordStatus::Inactive);

        let untimed = json!({ "balance": 3 });
        assert_eq!(classify(&untimed, "remind_at", now), RecordStatus::Inactive);

        let broken = json!({ "active": true, "remind_at": "next tuesday" });
        assert_eq!(classify(&broken, "remind_at", now), RecordStatus::Unschedulable);
    }

    #[test]
    fn test_due_exactly_now() {
        let now = Utc::now();
        let record = json!({ "active": true, "expires_at": now.timestamp_millis() });
        let at = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap();
        assert_eq!(classify(&record, "expires_at", at), RecordStatus::Due);
        assert_eq!(
            classify(&record, "expires_at", at - Duration::milliseconds(1)),
            RecordStatus::Pending
        );
    }

    #[test]
    fn test_snowflakes() {
        let record = DueRecord {
            document_key: "punishments".to_string(),
            collection: Some("temp_bans".to_string()),
            locator: RecordLocator::Index(2),
            due_at: Utc::now(),
            data: json!({
                "user_id": "123456789012345678",
                "guild_id": 42,
                "channel_id": null,
                "bad": "abc",
                "zero": "0"
            }),
        };

        assert_eq!(record.snowflake("user_id").unwrap(), 123_456_789_012_345_678);
        assert_eq!(record.snowflake("guild_id").unwrap(), 42);
        assert_eq!(record.optional_snowflake("channel_id").unwrap(), None);
        assert!(matches!(
            record.snowflake("missing"),
            Err(SweepError::InvalidRecord(message)) if message == "[2] is missing missing"
        ));
        assert!(record.snowflake("bad").is_err());
        assert!(record.snowflake("zero").is_err());
    }

    #[test]
    fn test_locate_survives_inserted_records() {
        let snapshot = json!({ "user_id": "U1", "active": true });
        let mut collection = json!([
            { "user_id": "U0", "active": true },
            { "user_id": "U1", "active": true }
        ]);
        let original = collection.clone();

        // A caller removed the first entry before the mark phase
        collection.as_array_mut().unwrap().remove(0);
        let found = locate_mut(&mut collection, &RecordLocator::Index(1), &snapshot).unwrap();
        assert_eq!(found["user_id"], "U1");

        let mut untouched = original;
        let found = locate_mut(&mut untouched, &RecordLocator::Index(1), &snapshot).unwrap();
        mark_fired(found, "completed_at", Utc::now());
        assert_eq!(untouched[1]["active"], false);
        assert!(untouched[1]["completed_at"].is_string());
        assert_eq!(untouched[0]["active"], true);
    }

    #[test]
    fn test_locate_by_key_requires_active() {
        let snapshot = json!({ "active": true, "message": "old" });
        let mut collection = json!({
            "r1": { "active": true, "message": "edited" },
            "r2": { "active": false }
        });

        assert!(locate_mut(&mut collection, &RecordLocator::Key("r1".into()), &snapshot).is_some());
        assert!(locate_mut(&mut collection, &RecordLocator::Key("r2".into()), &snapshot).is_none());
        assert!(locate_mut(&mut collection, &RecordLocator::Key("r3".into()), &snapshot).is_none());
    }

    #[test]
    fn test_prune_only_removes_old_fired_records() {
        let now = Utc::now();
        let old = format_timestamp(now - Duration::days(10));
        let recent = format_timestamp(now - Duration::hours(1));
        let mut collection = json!([
            { "active": false, "completed_at": old },
            { "active": false, "completed_at": recent },
            { "active": true, "remind_at": old },
            { "active": false, "remind_at": old },
            { "note": "not time-triggered" }
        ]);

        let removed = prune(&mut collection, "completed_at", "remind_at", now - Duration::days(7));
        assert_eq!(removed, 2);
        assert_eq!(collection.as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_identity_ignores_array_position() {
        let data = json!({ "user_id": "1", "active": true });
        let at = |locator| DueRecord {
            document_key: "reminders".to_string(),
            collection: Some("reminders".to_string()),
            locator,
            due_at: Utc::now(),
            data: data.clone(),
        };
        assert_eq!(
            at(RecordLocator::Index(0)).identity(),
            at(RecordLocator::Index(3)).identity()
        );
        assert_ne!(
            at(RecordLocator::Key("a".into())).identity(),
            at(RecordLocator::Key("b".into())).identity()
        );
    }
}
