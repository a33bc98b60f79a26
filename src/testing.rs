//! In-memory doubles shared by the unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::context::{PriorTurn, UserProfile};
use crate::domain::{
    HealthDraft, HealthEntry, Plan, PlanDraft, Record, RecordDraft, Reminder, ReminderDraft,
};
use crate::insights::Insight;
use crate::keywords::KeywordConfig;
use crate::llm_client::{DeltaSink, ReplyRequest, ReplyStrategy};
use crate::memory::{Memory, MemoryUpsert};
use crate::storage::DomainStore;

#[derive(Default)]
struct FakeState {
    memories: Vec<Memory>,
    turns: Vec<PriorTurn>,
    keyword_configs: Vec<KeywordConfig>,
    saved_conversations: Vec<PriorTurn>,
    memory_upserts: Vec<MemoryUpsert>,
    reminders: Vec<Reminder>,
    plans: Vec<Plan>,
    records: Vec<Record>,
    health: Vec<HealthEntry>,
}

/// A [`DomainStore`] whose operations can be failed or slowed one by one.
///
/// Operations are addressed by their trait method name.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<FakeState>,
    fail_all: bool,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl FakeStore {
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    pub fn fail(&self, op: &str) {
        self.failing.lock().unwrap().insert(op.to_string());
    }

    pub fn delay(&self, op: &str, by: Duration) {
        self.delays.lock().unwrap().insert(op.to_string(), by);
    }

    pub fn set_memories(&self, memories: Vec<Memory>) {
        self.state.lock().unwrap().memories = memories;
    }

    pub fn set_turns(&self, turns: Vec<PriorTurn>) {
        self.state.lock().unwrap().turns = turns;
    }

    pub fn set_keyword_configs(&self, configs: Vec<KeywordConfig>) {
        self.state.lock().unwrap().keyword_configs = configs;
    }

    pub fn saved_conversations(&self) -> Vec<PriorTurn> {
        self.state.lock().unwrap().saved_conversations.clone()
    }

    pub fn memory_upserts(&self) -> Vec<MemoryUpsert> {
        self.state.lock().unwrap().memory_upserts.clone()
    }

    pub fn reminders(&self) -> Vec<Reminder> {
        self.state.lock().unwrap().reminders.clone()
    }

    pub fn plans(&self) -> Vec<Plan> {
        self.state.lock().unwrap().plans.clone()
    }

    pub fn records(&self) -> Vec<Record> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn health_entries(&self) -> Vec<HealthEntry> {
        self.state.lock().unwrap().health.clone()
    }

    async fn enter(&self, op: &str) -> Result<()> {
        let delay = self.delays.lock().unwrap().get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_all || self.failing.lock().unwrap().contains(op) {
            return Err(anyhow!("{} unavailable", op));
        }
        Ok(())
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[async_trait]
impl DomainStore for FakeStore {
    async fn recent_memories(
        &self,
        _user_id: &str,
        min_confidence: f32,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        self.enter("recent_memories").await?;
        let state = self.state.lock().unwrap();
        Ok(state
            .memories
            .iter()
            .filter(|m| m.confidence >= min_confidence)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn recent_turns(&self, _user_id: &str, limit: usize) -> Result<Vec<PriorTurn>> {
        self.enter("recent_turns").await?;
        let state = self.state.lock().unwrap();
        Ok(state.turns.iter().take(limit).cloned().collect())
    }

    async fn user_profile(&self, _user_id: &str, _min_confidence: f32) -> Result<UserProfile> {
        self.enter("user_profile").await?;
        Ok(UserProfile::default())
    }

    async fn recent_insights(&self, _user_id: &str, _limit: usize) -> Result<Vec<Insight>> {
        self.enter("recent_insights").await?;
        Ok(Vec::new())
    }

    async fn active_keyword_configs(&self, _user_id: &str) -> Result<Vec<KeywordConfig>> {
        self.enter("active_keyword_configs").await?;
        Ok(self.state.lock().unwrap().keyword_configs.clone())
    }

    async fn create_reminder(&self, user_id: &str, draft: &ReminderDraft) -> Result<Reminder> {
        self.enter("create_reminder").await?;
        let reminder = Reminder {
            id: new_id(),
            user_id: user_id.to_string(),
            draft: draft.clone(),
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().reminders.push(reminder.clone());
        Ok(reminder)
    }

    async fn create_plan(&self, user_id: &str, draft: &PlanDraft) -> Result<Plan> {
        self.enter("create_plan").await?;
        let plan = Plan {
            id: new_id(),
            user_id: user_id.to_string(),
            draft: draft.clone(),
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().plans.push(plan.clone());
        Ok(plan)
    }

    async fn create_record(&self, user_id: &str, draft: &RecordDraft) -> Result<Record> {
        self.enter("create_record").await?;
        let record = Record {
            id: new_id(),
            user_id: user_id.to_string(),
            draft: draft.clone(),
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().records.push(record.clone());
        Ok(record)
    }

    async fn create_health_entry(
        &self,
        user_id: &str,
        draft: &HealthDraft,
    ) -> Result<HealthEntry> {
        self.enter("create_health_entry").await?;
        let entry = HealthEntry {
            id: new_id(),
            user_id: user_id.to_string(),
            draft: draft.clone(),
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().health.push(entry.clone());
        Ok(entry)
    }

    async fn save_conversation(&self, _user_id: &str, turn: &PriorTurn) -> Result<()> {
        self.enter("save_conversation").await?;
        self.state
            .lock()
            .unwrap()
            .saved_conversations
            .push(turn.clone());
        Ok(())
    }

    async fn upsert_memory(&self, user_id: &str, memory: &MemoryUpsert) -> Result<Memory> {
        self.enter("upsert_memory").await?;
        self.state
            .lock()
            .unwrap()
            .memory_upserts
            .push(memory.clone());
        Ok(Memory {
            id: new_id(),
            user_id: user_id.to_string(),
            key: memory.key.clone(),
            value: memory.value.clone(),
            confidence: memory.confidence,
            source: memory.source.clone(),
            updated_at: Utc::now(),
        })
    }
}

/// A reply strategy that streams fixed chunks, or fails after emitting them.
pub struct ScriptedStrategy {
    pub name: &'static str,
    pub chunks: Vec<String>,
    pub fail: bool,
    pub delay: Option<Duration>,
    pub timeout: Option<Duration>,
    pub calls: Arc<Mutex<usize>>,
}

impl ScriptedStrategy {
    pub fn replying(name: &'static str, chunks: &[&str]) -> Self {
        Self {
            name,
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            fail: false,
            delay: None,
            timeout: None,
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn failing(name: &'static str, partial: &[&str]) -> Self {
        Self {
            fail: true,
            ..Self::replying(name, partial)
        }
    }
}

#[async_trait]
impl ReplyStrategy for ScriptedStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn generate(&self, _request: ReplyRequest<'_>, on_delta: &DeltaSink<'_>) -> Result<String> {
        *self.calls.lock().unwrap() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        for chunk in &self.chunks {
            on_delta(chunk);
        }
        if self.fail {
            return Err(anyhow!("{} failed", self.name));
        }
        Ok(self.chunks.concat())
    }
}
