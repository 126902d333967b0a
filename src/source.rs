//! Where club activity comes from.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::models::{ActivityDocument, RawActivityRecord};

const CIRCLES_API: &str = "https://uma.moe/api/v4/circles";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AcquireError {
    #[error("acquisition timed out")]
    Timeout,
    #[error("connection error: {0}")]
    Transient(String),
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for AcquireError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AcquireError::Timeout
        } else if err.is_connect() {
            AcquireError::Transient(err.to_string())
        } else {
            AcquireError::Other(err.to_string())
        }
    }
}

/// Obtains one club's activity document.
///
/// Any session an implementation opens must be released when the returned
/// future completes or is dropped.
#[async_trait]
pub trait Acquire: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<ActivityDocument, AcquireError>;
}

#[derive(Debug, Deserialize)]
struct CircleResponse {
    #[serde(default)]
    members: Vec<CircleMember>,
}

#[derive(Debug, Deserialize)]
struct CircleMember {
    #[serde(default)]
    viewer_id: Option<serde_json::Value>,
    #[serde(default)]
    trainer_name: Option<String>,
    #[serde(default)]
    daily_fans: Vec<Option<f64>>,
}

/// Reads the monthly circle endpoint of uma.moe.
#[derive(Debug, Clone)]
pub struct HttpSource {
    base_url: String,
    request_timeout: Duration,
}

impl HttpSource {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            base_url: CIRCLES_API.to_string(),
            request_timeout,
        }
    }
}

#[async_trait]
impl Acquire for HttpSource {
    async fn fetch(&self, locator: &str) -> Result<ActivityDocument, AcquireError> {
        let now = Utc::now();
        // One client per attempt; dropped with this future.
        let client = Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| AcquireError::Other(format!("failed to build http client: {e}")))?;

        let resp = client
            .get(&self.base_url)
            .query(&[
                ("circle_id", locator.to_string()),
                ("year", now.year().to_string()),
                ("month", now.month().to_string()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(AcquireError::Other(format!(
                "GET {} for circle {locator} returned {status}",
                self.base_url
            )));
        }

        let circle: CircleResponse = resp
            .json()
            .await
            .map_err(|e| AcquireError::Other(format!("failed to parse circle response: {e}")))?;
        Ok(ActivityDocument {
            records: records_from_circle(circle),
        })
    }
}

/// Converts cumulative daily fan counts into per-day gains. Day `i + 1`
/// gets `fans[i] - fans[i - 1]` when both counts are positive and the
/// count did not drop.
fn records_from_circle(circle: CircleResponse) -> Vec<RawActivityRecord> {
    let mut records = Vec::new();
    for member in circle.members {
        let member_id = match member.viewer_id {
            Some(serde_json::Value::String(id)) => id,
            Some(serde_json::Value::Number(id)) => id.to_string(),
            _ => String::new(),
        };
        let member_name = member.trainer_name.unwrap_or_default();

        for (i, pair) in member.daily_fans.windows(2).enumerate() {
            let (Some(prev), Some(curr)) = (pair[0], pair[1]) else {
                continue;
            };
            if prev > 0.0 && curr > 0.0 && curr >= prev {
                records.push(RawActivityRecord::new(
                    &member_id,
                    &member_name,
                    i as i64 + 2,
                    curr - prev,
                ));
            }
        }
    }
    records
}

/// Reads saved documents from `<dir>/<locator>.json`.
#[derive(Debug, Clone)]
pub struct DirSource {
    dir: PathBuf,
}

impl DirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Acquire for DirSource {
    async fn fetch(&self, locator: &str) -> Result<ActivityDocument, AcquireError> {
        let path = self.dir.join(format!("{locator}.json"));
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AcquireError::Other(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| AcquireError::Other(format!("failed to parse {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gains_come_from_consecutive_positive_counts() {
        let circle: CircleResponse = serde_json::from_str(
            r#"{"members": [
                {"viewer_id": 1456, "trainer_name": "Avery", "daily_fans": [100, 150, 0, 300, 250, 400]},
                {"viewer_id": "9710", "trainer_name": null, "daily_fans": [null, 10, 25]}
            ]}"#,
        )
        .unwrap();

        let records = records_from_circle(circle);
        let summary: Vec<(String, String, String, f64)> = records
            .into_iter()
            .map(|r| {
                (
                    r.member_id.unwrap(),
                    r.member_name.unwrap(),
                    r.period_label.unwrap(),
                    r.gain.unwrap(),
                )
            })
            .collect();

        assert_eq!(
            summary,
            vec![
                ("1456".into(), "Avery".into(), "2".into(), 50.0),
                ("1456".into(), "Avery".into(), "6".into(), 150.0),
                ("9710".into(), "".into(), "3".into(), 15.0),
            ]
        );
    }

    #[test]
    fn missing_members_give_no_records() {
        let circle: CircleResponse = serde_json::from_str("{}").unwrap();
        assert!(records_from_circle(circle).is_empty());
    }

    #[tokio::test]
    async fn dir_source_reads_saved_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("1456.json"),
            r#"{"club_friend_history": [{"friend_viewer_id": "1", "friend_name": "Avery", "actual_date": "2", "adjusted_interpolated_fan_gain": 10}]}"#,
        )
        .unwrap();

        let source = DirSource::new(dir.path());
        let document = source.fetch("1456").await.unwrap();
        assert_eq!(document.records, vec![RawActivityRecord::new("1", "Avery", 2, 10.0)]);

        let missing = source.fetch("9999").await;
        assert!(matches!(missing, Err(AcquireError::Other(_))));
    }
}
