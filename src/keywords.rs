//! User-configurable keyword lists that drive intent classification.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::database::AssistantDatabase;
use crate::storage::DomainStore;

/// Priority given to configs created or imported without an explicit one.
pub const DEFAULT_PRIORITY: i32 = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeywordCategory {
    Record,
    Reminder,
    Plan,
    Health,
    Growth,
}

impl KeywordCategory {
    pub const ALL: [KeywordCategory; 5] = [
        KeywordCategory::Record,
        KeywordCategory::Reminder,
        KeywordCategory::Plan,
        KeywordCategory::Health,
        KeywordCategory::Growth,
    ];

    pub fn as_db_str(self) -> &'static str {
        match self {
            KeywordCategory::Record => "record",
            KeywordCategory::Reminder => "reminder",
            KeywordCategory::Plan => "plan",
            KeywordCategory::Health => "health",
            KeywordCategory::Growth => "growth",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "record" => Some(KeywordCategory::Record),
            "reminder" => Some(KeywordCategory::Reminder),
            "plan" => Some(KeywordCategory::Plan),
            "health" => Some(KeywordCategory::Health),
            "growth" => Some(KeywordCategory::Growth),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeywordConfig {
    pub id: String,
    pub category: KeywordCategory,
    pub keywords: Vec<String>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl KeywordConfig {
    /// First keyword found (case-insensitively) in any of `haystacks`.
    pub fn matching_keyword(&self, haystacks: &[&str]) -> Option<&str> {
        let lowered: Vec<String> = haystacks.iter().map(|h| h.to_lowercase()).collect();
        self.keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .find(|k| {
                let needle = k.to_lowercase();
                lowered.iter().any(|h| h.contains(&needle))
            })
            .map(String::as_str)
    }
}

/// Body of a create or import request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeywordConfigInput {
    pub category: KeywordCategory,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

/// The same keyword claimed by configs of different categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeywordConflict {
    pub keyword: String,
    pub categories: Vec<KeywordCategory>,
    pub config_ids: Vec<String>,
}

/// The compiled-in keyword set, used both as the classification fallback and by reset.
pub fn default_configs() -> Vec<KeywordConfigInput> {
    fn input(category: KeywordCategory, keywords: &[&str]) -> KeywordConfigInput {
        KeywordConfigInput {
            category,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            priority: Some(1),
        }
    }

    vec![
        input(KeywordCategory::Record, &["记录", "记下", "保存", "备忘"]),
        input(KeywordCategory::Reminder, &["提醒", "提醒我", "别忘了", "记得"]),
        input(KeywordCategory::Plan, &["计划", "安排", "规划", "打算"]),
        input(
            KeywordCategory::Health,
            &[
                "健康", "体重", "血压", "运动", "跑步", "健身", "游泳", "骑车", "睡眠", "卡路里",
            ],
        ),
        input(KeywordCategory::Growth, &["成长", "学习", "进步", "目标"]),
    ]
}

/// Defaults materialized as configs with stable synthetic ids and creation order.
pub fn default_keyword_configs() -> Vec<KeywordConfig> {
    default_configs()
        .into_iter()
        .enumerate()
        .map(|(index, input)| KeywordConfig {
            id: format!("default-{}", input.category.as_db_str()),
            category: input.category,
            keywords: input.keywords,
            priority: input.priority.unwrap_or(DEFAULT_PRIORITY),
            created_at: Utc
                .timestamp_opt(index as i64, 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
        .collect()
}

/// Every keyword shared (case-insensitively) by configs of two or more categories.
///
/// Sharing within one category is not a conflict. Output is sorted by keyword.
pub fn detect_conflicts(configs: &[KeywordConfig]) -> Vec<KeywordConflict> {
    let mut owners: BTreeMap<String, (String, Vec<&KeywordConfig>)> = BTreeMap::new();
    for config in configs {
        for keyword in &config.keywords {
            let normalized = keyword.trim().to_lowercase();
            if normalized.is_empty() {
                continue;
            }
            let entry = owners
                .entry(normalized)
                .or_insert_with(|| (keyword.trim().to_string(), Vec::new()));
            if !entry.1.iter().any(|c| c.id == config.id) {
                entry.1.push(config);
            }
        }
    }

    owners
        .into_values()
        .filter_map(|(keyword, holders)| {
            let mut categories: Vec<KeywordCategory> =
                holders.iter().map(|c| c.category).collect();
            categories.sort();
            categories.dedup();
            if categories.len() < 2 {
                return None;
            }
            Some(KeywordConflict {
                keyword,
                categories,
                config_ids: holders.iter().map(|c| c.id.clone()).collect(),
            })
        })
        .collect()
}

/// Read side used by the chat pipeline.
///
/// Never fails: a storage error or an empty active set yields the compiled-in defaults.
pub struct KeywordConfigStore {
    store: Arc<dyn DomainStore>,
}

impl KeywordConfigStore {
    pub fn new(store: Arc<dyn DomainStore>) -> Self {
        Self { store }
    }

    pub async fn active_configs(&self, user_id: &str) -> Vec<KeywordConfig> {
        match self.store.active_keyword_configs(user_id).await {
            Ok(configs) if !configs.is_empty() => configs,
            Ok(_) => {
                tracing::debug!("No keyword configs for {}, using defaults", user_id);
                default_keyword_configs()
            }
            Err(e) => {
                tracing::warn!("Keyword config read failed for {}: {:#}", user_id, e);
                default_keyword_configs()
            }
        }
    }
}

/// Active configs for the management API, seeding the defaults on first use.
pub fn list_or_seed(db: &AssistantDatabase, user_id: &str) -> Result<Vec<KeywordConfig>> {
    let configs = db.list_keyword_configs(user_id)?;
    if !configs.is_empty() {
        return Ok(configs);
    }
    tracing::info!("Seeding default keyword configs for {}", user_id);
    db.replace_keyword_configs(user_id, &default_configs())?;
    db.list_keyword_configs(user_id)
}
