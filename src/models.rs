use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntityConfig {
    pub id: String,
    pub title: String,
    #[serde(rename = "locator")]
    pub source_locator: String,
    pub threshold: f64,
}

/// One member's gain on one reporting day, as delivered by a source.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawActivityRecord {
    #[serde(rename = "friend_viewer_id", default, deserialize_with = "lenient_text")]
    pub member_id: Option<String>,
    #[serde(rename = "friend_name", default, deserialize_with = "lenient_text")]
    pub member_name: Option<String>,
    #[serde(rename = "actual_date", default, deserialize_with = "lenient_text")]
    pub period_label: Option<String>,
    #[serde(
        rename = "adjusted_interpolated_fan_gain",
        default,
        deserialize_with = "lenient_number"
    )]
    pub gain: Option<f64>,
}

impl RawActivityRecord {
    pub fn new(member_id: &str, member_name: &str, day: i64, gain: f64) -> Self {
        Self {
            member_id: Some(member_id.to_string()),
            member_name: Some(member_name.to_string()),
            period_label: Some(day.to_string()),
            gain: Some(gain),
        }
    }
}

/// What a single successful acquisition yields for one club.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ActivityDocument {
    #[serde(rename = "club_friend_history", default)]
    pub records: Vec<RawActivityRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberRow {
    pub member_id: String,
    pub member_name: String,
    pub avg_per_day: f64,
    pub day_values: BTreeMap<i64, f64>,
}

impl MemberRow {
    pub fn value(&self, day: i64) -> Option<f64> {
        self.day_values.get(&day).copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateTable {
    pub days: Vec<i64>,
    pub rows: Vec<MemberRow>,
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(text)) => Some(text),
        Some(serde_json::Value::Number(number)) => Some(number.to_string()),
        Some(serde_json::Value::Bool(flag)) => Some(flag.to_string()),
        _ => None,
    })
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(number)) => number.as_f64(),
        Some(serde_json::Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|gain| gain.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_fields_degrade_instead_of_failing() {
        let raw = r#"{
            "club_friend_history": [
                {"friend_viewer_id": 1234, "friend_name": "Avery", "actual_date": 3, "adjusted_interpolated_fan_gain": "1500"},
                {"friend_name": null, "actual_date": "4", "adjusted_interpolated_fan_gain": "n/a"},
                {}
            ]
        }"#;

        let document: ActivityDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(document.records.len(), 3);
        assert_eq!(document.records[0].member_id.as_deref(), Some("1234"));
        assert_eq!(document.records[0].period_label.as_deref(), Some("3"));
        assert_eq!(document.records[0].gain, Some(1500.0));
        assert_eq!(document.records[1].member_name, None);
        assert_eq!(document.records[1].gain, None);
        assert_eq!(document.records[2], RawActivityRecord::default());
    }

    #[test]
    fn missing_history_is_an_empty_document() {
        let document: ActivityDocument = serde_json::from_str("{}").unwrap();
        assert!(document.records.is_empty());
    }
}
