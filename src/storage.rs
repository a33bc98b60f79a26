use anyhow::Result;
use async_trait::async_trait;

use crate::context::{PriorTurn, UserProfile};
use crate::domain::{
    HealthDraft, HealthEntry, Plan, PlanDraft, Record, RecordDraft, Reminder, ReminderDraft,
};
use crate::insights::Insight;
use crate::keywords::KeywordConfig;
use crate::memory::{Memory, MemoryUpsert};

/// Everything the chat pipeline reads from or writes to persistent storage.
///
/// The bundled implementation is [`crate::database::AssistantDatabase`]; tests swap in
/// in-memory fakes so each collaborator can be failed independently.
#[async_trait]
pub trait DomainStore: Send + Sync {
    /// Memories at or above `min_confidence`, most recently updated first.
    async fn recent_memories(
        &self,
        user_id: &str,
        min_confidence: f32,
        limit: usize,
    ) -> Result<Vec<Memory>>;

    /// Stored conversation turns, newest first.
    async fn recent_turns(&self, user_id: &str, limit: usize) -> Result<Vec<PriorTurn>>;

    /// Profile sections derived from stored data; memory maps only include entries at or
    /// above `min_confidence`.
    async fn user_profile(&self, user_id: &str, min_confidence: f32) -> Result<UserProfile>;

    /// Active, unexpired insights, newest first.
    async fn recent_insights(&self, user_id: &str, limit: usize) -> Result<Vec<Insight>>;

    /// The user's active keyword configs in storage order (no ranking applied).
    async fn active_keyword_configs(&self, user_id: &str) -> Result<Vec<KeywordConfig>>;

    async fn create_reminder(&self, user_id: &str, draft: &ReminderDraft) -> Result<Reminder>;
    async fn create_plan(&self, user_id: &str, draft: &PlanDraft) -> Result<Plan>;
    async fn create_record(&self, user_id: &str, draft: &RecordDraft) -> Result<Record>;
    async fn create_health_entry(&self, user_id: &str, draft: &HealthDraft)
        -> Result<HealthEntry>;

    async fn save_conversation(&self, user_id: &str, turn: &PriorTurn) -> Result<()>;

    /// Insert or replace the memory identified by `(user, type, key)`.
    async fn upsert_memory(&self, user_id: &str, memory: &MemoryUpsert) -> Result<Memory>;
}
