use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::date_util::parse_source_timestamp;
use crate::error::{Error, Result};
use crate::source::RawRecord;

/// Local lifecycle state of a cached company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Synced,
    Pending,
    Failed,
    /// Soft-deleted after the source reported removal.
    Deleted,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::Pending => "pending",
            SyncState::Failed => "failed",
            SyncState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(SyncState::Synced),
            "pending" => Some(SyncState::Pending),
            "failed" => Some(SyncState::Failed),
            "deleted" => Some(SyncState::Deleted),
            _ => None,
        }
    }
}

/// A normalized company, keyed by the source-assigned `natural_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanyRecord {
    pub natural_id: String,
    pub name: String,
    /// Business attributes as reported by the source (minus `id`).
    pub attributes: Map<String, Value>,
    pub source_updated_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub sync_state: SyncState,
}

impl CompanyRecord {
    /// Validate and normalize one raw source row.
    pub fn from_raw(raw: &RawRecord, fetched_at: DateTime<Utc>) -> Result<Self> {
        let obj = raw.as_object().ok_or_else(|| invalid("<missing>", "record is not an object"))?;

        let natural_id = natural_id_of(raw).ok_or_else(|| invalid("<missing>", "missing id"))?;

        let name = obj
            .get("companyName")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid(&natural_id, "missing companyName"))?
            .to_string();

        let source_updated_at = ["updateTime", "createTime"]
            .iter()
            .filter_map(|k| obj.get(*k).and_then(Value::as_str))
            .find_map(parse_source_timestamp)
            .ok_or_else(|| invalid(&natural_id, "no parseable updateTime or createTime"))?;

        let mut attributes = Map::new();
        for (key, value) in obj {
            match key.as_str() {
                "id" => {}
                // The source spells it "adress".
                "adress" => {
                    attributes.insert("address".to_string(), value.clone());
                }
                _ => {
                    attributes.insert(key.clone(), value.clone());
                }
            }
        }

        let sync_state = if is_removal(raw) {
            SyncState::Deleted
        } else {
            SyncState::Synced
        };

        Ok(Self {
            natural_id,
            name,
            attributes,
            source_updated_at,
            fetched_at,
            sync_state,
        })
    }

    /// String attribute, if present and non-null.
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn is_deleted(&self) -> bool {
        self.sync_state == SyncState::Deleted
    }
}

/// The source id of a raw row, numeric or string.
pub fn natural_id_of(raw: &RawRecord) -> Option<String> {
    match raw.get("id") {
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Whether the source marks this row as removed.
pub fn is_removal(raw: &RawRecord) -> bool {
    let del_flag = match raw.get("delFlag") {
        Some(Value::String(s)) => s == "2",
        Some(Value::Number(n)) => n.as_i64() == Some(2),
        _ => false,
    };
    del_flag || raw.get("deleted").and_then(Value::as_bool).unwrap_or(false)
}

fn invalid(natural_id: &str, message: &str) -> Error {
    Error::RecordValidation {
        natural_id: natural_id.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_from_raw_normalizes() {
        let raw = json!({
            "id": 42,
            "companyName": " Acme Software ",
            "owner": "Jane",
            "adress": "1 Main St",
            "createTime": "2024-01-01 08:00:00",
            "updateTime": "2024-05-01 09:30:00",
            "code": "AC-1"
        });
        let rec = CompanyRecord::from_raw(&raw, now()).unwrap();
        assert_eq!(rec.natural_id, "42");
        assert_eq!(rec.name, "Acme Software");
        assert_eq!(rec.attr_str("address"), Some("1 Main St"));
        assert!(rec.attributes.get("adress").is_none());
        assert!(rec.attributes.get("id").is_none());
        assert_eq!(
            rec.source_updated_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap()
        );
        assert_eq!(rec.fetched_at, now());
        assert_eq!(rec.sync_state, SyncState::Synced);
    }

    #[test]
    fn test_falls_back_to_create_time() {
        let raw = json!({"id": "abc", "companyName": "X", "createTime": "2024-01-01T00:00:00", "updateTime": null});
        let rec = CompanyRecord::from_raw(&raw, now()).unwrap();
        assert_eq!(rec.natural_id, "abc");
        assert_eq!(rec.source_updated_at, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_rejects_malformed() {
        let cases = [
            json!({"companyName": "No id", "createTime": "2024-01-01"}),
            json!({"id": 1, "createTime": "2024-01-01"}),
            json!({"id": 1, "companyName": "   ", "createTime": "2024-01-01"}),
            json!({"id": 1, "companyName": "No time"}),
            json!("just a string"),
        ];
        for raw in &cases {
            let err = CompanyRecord::from_raw(raw, now()).unwrap_err();
            assert!(matches!(err, Error::RecordValidation { .. }), "{raw}");
        }
    }

    #[test]
    fn test_removal_markers() {
        assert!(is_removal(&json!({"delFlag": "2"})));
        assert!(is_removal(&json!({"delFlag": 2})));
        assert!(is_removal(&json!({"deleted": true})));
        assert!(!is_removal(&json!({"delFlag": "0"})));
        assert!(!is_removal(&json!({})));

        let raw = json!({"id": 5, "companyName": "Gone", "updateTime": "2024-01-01", "delFlag": "2"});
        assert!(CompanyRecord::from_raw(&raw, now()).unwrap().is_deleted());
    }
}
