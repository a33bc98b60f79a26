//! Long-term user memories and the background queue that learns them from conversation.

use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::context::PriorTurn;
use crate::storage::DomainStore;

/// Memories below this confidence never feed personalization.
pub const PERSONALIZATION_MIN_CONFIDENCE: f32 = 0.7;

pub const CONVERSATION_SOURCE: &str = "conversation";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Preference,
    Habit,
    Goal,
}

impl MemoryKind {
    /// Fixed presentation order.
    pub const ALL: [MemoryKind; 3] = [MemoryKind::Preference, MemoryKind::Habit, MemoryKind::Goal];

    pub fn as_db_str(self) -> &'static str {
        match self {
            MemoryKind::Preference => "preference",
            MemoryKind::Habit => "habit",
            MemoryKind::Goal => "goal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "preference" => Some(MemoryKind::Preference),
            "habit" => Some(MemoryKind::Habit),
            "goal" => Some(MemoryKind::Goal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryDetail {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MemoryDetail {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            context: None,
            extracted_at: None,
            extra: BTreeMap::new(),
        }
    }
}

/// A memory payload tagged by its type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "memory_type", content = "value", rename_all = "snake_case")]
pub enum MemoryValue {
    Preference(MemoryDetail),
    Habit(MemoryDetail),
    Goal(MemoryDetail),
}

impl MemoryValue {
    pub fn new(kind: MemoryKind, detail: MemoryDetail) -> Self {
        match kind {
            MemoryKind::Preference => MemoryValue::Preference(detail),
            MemoryKind::Habit => MemoryValue::Habit(detail),
            MemoryKind::Goal => MemoryValue::Goal(detail),
        }
    }

    pub fn kind(&self) -> MemoryKind {
        match self {
            MemoryValue::Preference(_) => MemoryKind::Preference,
            MemoryValue::Habit(_) => MemoryKind::Habit,
            MemoryValue::Goal(_) => MemoryKind::Goal,
        }
    }

    pub fn detail(&self) -> &MemoryDetail {
        match self {
            MemoryValue::Preference(d) | MemoryValue::Habit(d) | MemoryValue::Goal(d) => d,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Memory {
    pub id: String,
    pub user_id: String,
    pub key: String,
    #[serde(flatten)]
    pub value: MemoryValue,
    pub confidence: f32,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryUpsert {
    pub key: String,
    #[serde(flatten)]
    pub value: MemoryValue,
    pub confidence: f32,
    #[serde(default = "default_memory_source")]
    pub source: String,
}

fn default_memory_source() -> String {
    "manual".to_string()
}

/// Preference/habit/goal memories implied by one exchange, at most one per type.
pub fn detect_signals(message: &str, response: &str, at: DateTime<Utc>) -> Vec<MemoryUpsert> {
    const SIGNALS: [(MemoryKind, &str, f32, &[&str]); 3] = [
        (
            MemoryKind::Preference,
            "conversation_preference",
            0.8,
            &["喜欢", "不喜欢", "偏好"],
        ),
        (
            MemoryKind::Habit,
            "behavioral_pattern",
            0.7,
            &["通常", "习惯", "经常"],
        ),
        (MemoryKind::Goal, "user_goal", 0.9, &["目标", "想要", "希望"]),
    ];

    let lowered = message.to_lowercase();
    SIGNALS
        .iter()
        .filter(|(_, _, _, cues)| cues.iter().any(|cue| lowered.contains(cue)))
        .map(|(kind, key, confidence, _)| MemoryUpsert {
            key: key.to_string(),
            value: MemoryValue::new(
                *kind,
                MemoryDetail {
                    summary: message.to_string(),
                    context: Some(response.to_string()),
                    extracted_at: Some(at),
                    extra: BTreeMap::new(),
                },
            ),
            confidence: *confidence,
            source: CONVERSATION_SOURCE.to_string(),
        })
        .collect()
}

/// One finished exchange handed to the background updater.
#[derive(Debug, Clone)]
pub struct CompletedTurn {
    pub user_id: String,
    pub message: String,
    pub response: String,
    pub intent: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Handle for enqueueing completed turns. Cloning shares the queue.
///
/// The worker exits once every handle has been dropped and the queue is drained.
#[derive(Clone)]
pub struct MemoryUpdater {
    tx: Sender<CompletedTurn>,
}

impl MemoryUpdater {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(store: Arc<dyn DomainStore>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = flume::unbounded();
        let handle = tokio::spawn(run_worker(store, rx));
        (Self { tx }, handle)
    }

    /// Never blocks and never fails the caller.
    pub fn submit(&self, turn: CompletedTurn) {
        if let Err(e) = self.tx.send(turn) {
            tracing::warn!(
                "Memory updater stopped; dropping turn for {}",
                e.into_inner().user_id
            );
        }
    }
}

async fn run_worker(store: Arc<dyn DomainStore>, rx: Receiver<CompletedTurn>) {
    tracing::debug!("Memory updater started");
    while let Ok(turn) = rx.recv_async().await {
        process_turn(store.as_ref(), &turn).await;
    }
    tracing::debug!("Memory updater stopped");
}

async fn process_turn(store: &dyn DomainStore, turn: &CompletedTurn) {
    let log = PriorTurn {
        message: turn.message.clone(),
        response: turn.response.clone(),
        intent: turn.intent.clone(),
        created_at: turn.completed_at,
    };
    if let Err(e) = store.save_conversation(&turn.user_id, &log).await {
        tracing::error!("Failed to save conversation for {}: {:#}", turn.user_id, e);
    }

    for upsert in detect_signals(&turn.message, &turn.response, turn.completed_at) {
        match store.upsert_memory(&turn.user_id, &upsert).await {
            Ok(memory) => tracing::debug!(
                "Updated {} memory '{}' for {}",
                memory.value.kind().as_db_str(),
                memory.key,
                turn.user_id
            ),
            Err(e) => tracing::error!(
                "Failed to update memory '{}' for {}: {:#}",
                upsert.key,
                turn.user_id,
                e
            ),
        }
    }
}
