//! Executes the single create-operation implied by a classified intent.

use serde::Serialize;
use std::sync::Arc;

use crate::domain::{HealthEntry, Plan, Record, Reminder};
use crate::intent::extract::ExtractedParameters;
use crate::intent::{intent_label, IntentMatch};
use crate::keywords::KeywordCategory;
use crate::storage::DomainStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ReminderCreated,
    ReminderFailed,
    PlanCreated,
    PlanFailed,
    RecordCreated,
    RecordFailed,
    HealthRecorded,
    HealthFailed,
    GrowthPlanCreated,
    GrowthPlanFailed,
}

impl OperationKind {
    pub fn for_category(category: KeywordCategory, success: bool) -> Self {
        match (category, success) {
            (KeywordCategory::Reminder, true) => OperationKind::ReminderCreated,
            (KeywordCategory::Reminder, false) => OperationKind::ReminderFailed,
            (KeywordCategory::Plan, true) => OperationKind::PlanCreated,
            (KeywordCategory::Plan, false) => OperationKind::PlanFailed,
            (KeywordCategory::Record, true) => OperationKind::RecordCreated,
            (KeywordCategory::Record, false) => OperationKind::RecordFailed,
            (KeywordCategory::Health, true) => OperationKind::HealthRecorded,
            (KeywordCategory::Health, false) => OperationKind::HealthFailed,
            (KeywordCategory::Growth, true) => OperationKind::GrowthPlanCreated,
            (KeywordCategory::Growth, false) => OperationKind::GrowthPlanFailed,
        }
    }
}

/// A stored entity as returned by the create-operation.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CreatedEntity {
    Reminder(Reminder),
    Plan(Plan),
    Record(Record),
    Health(HealthEntry),
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<CreatedEntity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What was done and with which parameters; only recorded for successful operations.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    #[serde(rename = "type")]
    pub action_type: &'static str,
    pub data: ExtractedParameters,
    pub result: CreatedEntity,
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub result: OperationResult,
    pub action: Option<ActionRecord>,
}

pub struct ActionExecutor {
    store: Arc<dyn DomainStore>,
}

impl ActionExecutor {
    pub fn new(store: Arc<dyn DomainStore>) -> Self {
        Self { store }
    }

    /// Run exactly one create-operation. Storage errors become a failed result, never an `Err`.
    pub async fn execute(&self, user_id: &str, intent: &IntentMatch) -> ActionOutcome {
        let store = self.store.as_ref();
        let (created, failure) = match &intent.parameters {
            ExtractedParameters::Reminder(draft) => (
                store
                    .create_reminder(user_id, draft)
                    .await
                    .map(CreatedEntity::Reminder),
                "创建提醒失败",
            ),
            ExtractedParameters::Plan(draft) => (
                store.create_plan(user_id, draft).await.map(CreatedEntity::Plan),
                "创建计划失败",
            ),
            ExtractedParameters::Record(draft) => (
                store
                    .create_record(user_id, draft)
                    .await
                    .map(CreatedEntity::Record),
                "创建记录失败",
            ),
            ExtractedParameters::Health(draft) => (
                store
                    .create_health_entry(user_id, draft)
                    .await
                    .map(CreatedEntity::Health),
                "记录健康数据失败",
            ),
        };

        match created {
            Ok(entity) => {
                tracing::info!(
                    "Executed {} for {}",
                    intent_label(Some(intent.category)),
                    user_id
                );
                ActionOutcome {
                    result: OperationResult {
                        kind: OperationKind::for_category(intent.category, true),
                        success: true,
                        data: Some(entity.clone()),
                        error: None,
                    },
                    action: Some(ActionRecord {
                        action_type: intent_label(Some(intent.category)),
                        data: intent.parameters.clone(),
                        result: entity,
                    }),
                }
            }
            Err(e) => {
                tracing::warn!(
                    "{} for {} failed: {:#}",
                    intent_label(Some(intent.category)),
                    user_id,
                    e
                );
                ActionOutcome {
                    result: OperationResult {
                        kind: OperationKind::for_category(intent.category, false),
                        success: false,
                        data: None,
                        error: Some(format!("{}: {}", failure, e)),
                    },
                    action: None,
                }
            }
        }
    }
}
