//! Personal-data entities the assistant can create on the user's behalf.
//!
//! `*Draft` types are what the extractors produce; the storage collaborator turns a
//! draft into the persisted entity by assigning an id, the owner and a timestamp.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Forward-compatible attributes that do not have a dedicated field yet.
pub type ExtraAttributes = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReminderPriority {
    Low,
    Medium,
    High,
}

impl ReminderPriority {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ReminderPriority::Low => "low",
            ReminderPriority::Medium => "medium",
            ReminderPriority::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReminderDraft {
    pub title: String,
    pub description: String,
    pub remind_time: DateTime<Utc>,
    pub priority: ReminderPriority,
    pub is_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub draft: ReminderDraft,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanCategory {
    Work,
    Health,
    Study,
    Personal,
}

impl PlanCategory {
    pub fn as_db_str(self) -> &'static str {
        match self {
            PlanCategory::Work => "work",
            PlanCategory::Health => "health",
            PlanCategory::Study => "study",
            PlanCategory::Personal => "personal",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "work" => PlanCategory::Work,
            "health" => PlanCategory::Health,
            "study" => PlanCategory::Study,
            _ => PlanCategory::Personal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanDraft {
    pub title: String,
    pub description: String,
    pub category: PlanCategory,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub draft: PlanDraft,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Text,
    Voice,
    Image,
}

impl RecordType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            RecordType::Text => "text",
            RecordType::Voice => "voice",
            RecordType::Image => "image",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "voice" => RecordType::Voice,
            "image" => RecordType::Image,
            _ => RecordType::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordDraft {
    pub content: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub draft: RecordDraft,
    pub created_at: DateTime<Utc>,
}

/// Health payload keyed by `data_type`, with the values under `data_value`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "data_type", content = "data_value", rename_all = "snake_case")]
pub enum HealthData {
    Exercise {
        activity: String,
        duration_minutes: u32,
        calories: u32,
        notes: String,
        #[serde(flatten)]
        extra: ExtraAttributes,
    },
    Sleep {
        bedtime: String,
        wake_time: String,
        quality: String,
        #[serde(default)]
        hours: Option<f32>,
        notes: String,
        #[serde(flatten)]
        extra: ExtraAttributes,
    },
    Weight {
        weight_kg: f32,
        body_fat: f32,
        notes: String,
        #[serde(flatten)]
        extra: ExtraAttributes,
    },
    General {
        activity: String,
        notes: String,
        #[serde(flatten)]
        extra: ExtraAttributes,
    },
}

impl HealthData {
    pub fn data_type(&self) -> &'static str {
        match self {
            HealthData::Exercise { .. } => "exercise",
            HealthData::Sleep { .. } => "sleep",
            HealthData::Weight { .. } => "weight",
            HealthData::General { .. } => "general",
        }
    }

    /// The single number trend analysis looks at for this sub-type, if any.
    pub fn primary_value(&self) -> Option<f64> {
        match self {
            HealthData::Exercise {
                duration_minutes, ..
            } => Some(f64::from(*duration_minutes)),
            HealthData::Sleep { hours, .. } => hours.map(f64::from),
            HealthData::Weight { weight_kg, .. } => Some(f64::from(*weight_kg)),
            HealthData::General { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthDraft {
    #[serde(flatten)]
    pub data: HealthData,
    pub record_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEntry {
    pub id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub draft: HealthDraft,
    pub created_at: DateTime<Utc>,
}

/// Reminder as seen by insight generation (completion state only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderStatus {
    pub id: String,
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_data_serializes_with_type_tag_and_value() {
        let draft = HealthDraft {
            data: HealthData::Exercise {
                activity: "跑步".to_string(),
                duration_minutes: 45,
                calories: 300,
                notes: "晨跑".to_string(),
                extra: ExtraAttributes::new(),
            },
            record_date: NaiveDate::from_ymd_opt(2026, 10, 17).unwrap(),
        };

        let json = serde_json::to_value(&draft).unwrap();
        assert_eq!(json["data_type"], "exercise");
        assert_eq!(json["data_value"]["duration_minutes"], 45);
        assert_eq!(json["record_date"], "2026-10-17");
    }

    #[test]
    fn unknown_health_attributes_survive_in_extra() {
        let raw = serde_json::json!({
            "data_type": "weight",
            "data_value": { "weight_kg": 68.5, "body_fat": 18.0, "notes": "", "bmi": 22.1 }
        });
        let data: HealthData = serde_json::from_value(raw).unwrap();
        match data {
            HealthData::Weight { extra, .. } => assert_eq!(extra["bmi"], 22.1),
            other => panic!("unexpected variant {:?}", other),
        }
    }
}
