//! Request-scoped personalization context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{HealthEntry, Plan, Record};
use crate::insights::Insight;
use crate::memory::Memory;
use crate::storage::DomainStore;

pub const MEMORY_LIMIT: usize = 20;
pub const TURN_LIMIT: usize = 5;
pub const INSIGHT_LIMIT: usize = 5;

/// A stored exchange from the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriorTurn {
    pub message: String,
    pub response: String,
    #[serde(default)]
    pub intent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_info: Option<Value>,
    #[serde(default)]
    pub preferences: BTreeMap<String, Value>,
    #[serde(default)]
    pub habits: BTreeMap<String, Value>,
    #[serde(default)]
    pub goals: BTreeMap<String, Value>,
    #[serde(default)]
    pub active_plans: Vec<Plan>,
    #[serde(default)]
    pub recent_records: Vec<Record>,
    #[serde(default)]
    pub health_data: Vec<HealthEntry>,
}

/// Everything known about the user for one request. Built once, never mutated.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextSnapshot {
    pub memories: Vec<Memory>,
    /// Newest first.
    pub conversation_history: Vec<PriorTurn>,
    pub profile: UserProfile,
    pub insights: Vec<Insight>,
}

pub struct ContextAggregator {
    store: Arc<dyn DomainStore>,
    read_timeout: Duration,
    min_confidence: f32,
}

impl ContextAggregator {
    pub fn new(store: Arc<dyn DomainStore>, read_timeout: Duration, min_confidence: f32) -> Self {
        Self {
            store,
            read_timeout,
            min_confidence,
        }
    }

    /// Issue the four reads concurrently; any read that fails or times out is left empty.
    pub async fn gather(&self, user_id: &str) -> ContextSnapshot {
        let store = self.store.as_ref();
        let (memories, conversation_history, profile, insights) = tokio::join!(
            self.bounded(
                "memories",
                user_id,
                store.recent_memories(user_id, self.min_confidence, MEMORY_LIMIT)
            ),
            self.bounded(
                "conversation history",
                user_id,
                store.recent_turns(user_id, TURN_LIMIT)
            ),
            self.bounded(
                "profile",
                user_id,
                store.user_profile(user_id, self.min_confidence)
            ),
            self.bounded(
                "insights",
                user_id,
                store.recent_insights(user_id, INSIGHT_LIMIT)
            ),
        );

        tracing::debug!(
            "Context for {}: {} memories, {} turns, {} insights",
            user_id,
            memories.len(),
            conversation_history.len(),
            insights.len()
        );

        ContextSnapshot {
            memories,
            conversation_history,
            profile,
            insights,
        }
    }

    async fn bounded<T, F>(&self, what: &str, user_id: &str, read: F) -> T
    where
        T: Default,
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.read_timeout, read).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                tracing::warn!("Context read '{}' failed for {}: {:#}", what, user_id, e);
                T::default()
            }
            Err(_) => {
                tracing::warn!(
                    "Context read '{}' timed out after {:?} for {}",
                    what,
                    self.read_timeout,
                    user_id
                );
                T::default()
            }
        }
    }
}
