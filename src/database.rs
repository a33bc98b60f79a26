use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::context::{PriorTurn, UserProfile};
use crate::domain::{
    HealthData, HealthDraft, HealthEntry, Plan, PlanCategory, PlanDraft, Record, RecordDraft,
    RecordType, Reminder, ReminderDraft, ReminderStatus,
};
use crate::insights::{Insight, InsightType};
use crate::keywords::{KeywordCategory, KeywordConfig, KeywordConfigInput, DEFAULT_PRIORITY};
use crate::memory::{Memory, MemoryDetail, MemoryKind, MemoryUpsert, MemoryValue};
use crate::storage::DomainStore;

const PROFILE_PLAN_LIMIT: usize = 5;
const PROFILE_RECORD_LIMIT: usize = 5;
const PROFILE_HEALTH_LIMIT: usize = 3;

/// Partial edit of a keyword config; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordConfigUpdate {
    #[serde(default)]
    pub category: Option<KeywordCategory>,
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryFilter {
    #[serde(default)]
    pub memory_type: Option<MemoryKind>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub min_confidence: Option<f32>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsightFilter {
    #[serde(default)]
    pub insight_type: Option<InsightType>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub active_only: bool,
}

/// Source rows for insight generation.
#[derive(Debug, Clone, Default)]
pub struct ActivityWindow {
    pub records: Vec<Record>,
    pub plans: Vec<Plan>,
    pub reminders: Vec<ReminderStatus>,
    pub health: Vec<HealthEntry>,
}

/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct AssistantDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl AssistantDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS user_profiles (
                user_id TEXT PRIMARY KEY,
                basic_info TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reminders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                remind_time TEXT NOT NULL,
                priority TEXT NOT NULL,
                is_completed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reminders_user ON reminders(user_id, created_at);

            CREATE TABLE IF NOT EXISTS plans (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                category TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_plans_user ON plans(user_id, created_at);

            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                content TEXT NOT NULL,
                record_type TEXT NOT NULL,
                tags TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_user ON records(user_id, created_at);

            CREATE TABLE IF NOT EXISTS health_data (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                data_type TEXT NOT NULL,
                data_value TEXT NOT NULL,
                record_date TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_health_user ON health_data(user_id, created_at);

            CREATE TABLE IF NOT EXISTS user_memories (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                memory_type TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                confidence REAL NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, memory_type, key)
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                message TEXT NOT NULL,
                response TEXT NOT NULL,
                intent TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id, created_at);

            CREATE TABLE IF NOT EXISTS keyword_configs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                category TEXT NOT NULL,
                keywords TEXT NOT NULL,
                priority INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_keyword_configs_user ON keyword_configs(user_id, is_active);

            CREATE TABLE IF NOT EXISTS data_insights (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                insight_type TEXT NOT NULL,
                category TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                data TEXT NOT NULL,
                generated_at TEXT NOT NULL,
                expires_at TEXT,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_insights_user ON data_insights(user_id, generated_at);
            "#,
        )
        .context("Failed to create schema")?;

        Ok(())
    }

    // ========================================================================
    // Profile
    // ========================================================================

    pub fn set_basic_info(&self, user_id: &str, basic_info: &Value) -> Result<()> {
        let json = serde_json::to_string(basic_info).context("Failed to serialize basic info")?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO user_profiles (user_id, basic_info, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                basic_info = excluded.basic_info,
                updated_at = excluded.updated_at",
            params![user_id, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_basic_info(&self, user_id: &str) -> Result<Option<Value>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT basic_info FROM user_profiles WHERE user_id = ?1",
            [user_id],
            |row| parse_json::<Value>(row.get(0)?, 0),
        );

        match result {
            Ok(info) => Ok(Some(info)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn build_user_profile(&self, user_id: &str, min_confidence: f32) -> Result<UserProfile> {
        let mut profile = UserProfile {
            basic_info: self.get_basic_info(user_id)?,
            ..UserProfile::default()
        };

        let memories = self.list_memories(
            user_id,
            &MemoryFilter {
                min_confidence: Some(min_confidence),
                ..MemoryFilter::default()
            },
        )?;
        for memory in memories {
            let value = serde_json::to_value(memory.value.detail())
                .context("Failed to serialize memory detail")?;
            let section = match memory.value.kind() {
                MemoryKind::Preference => &mut profile.preferences,
                MemoryKind::Habit => &mut profile.habits,
                MemoryKind::Goal => &mut profile.goals,
            };
            // Newest first, so the first write for a key wins.
            section.entry(memory.key).or_insert(value);
        }

        profile.active_plans = self.active_plans(user_id, PROFILE_PLAN_LIMIT)?;
        profile.recent_records = self.recent_records(user_id, PROFILE_RECORD_LIMIT)?;
        profile.health_data = self.recent_health_entries(user_id, PROFILE_HEALTH_LIMIT)?;
        Ok(profile)
    }

    // ========================================================================
    // Domain Entities
    // ========================================================================

    pub fn insert_reminder(&self, user_id: &str, draft: &ReminderDraft) -> Result<Reminder> {
        let reminder = Reminder {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            draft: draft.clone(),
            created_at: Utc::now(),
        };

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO reminders
             (id, user_id, title, description, remind_time, priority, is_completed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                reminder.id,
                reminder.user_id,
                draft.title,
                draft.description,
                draft.remind_time.to_rfc3339(),
                draft.priority.as_db_str(),
                draft.is_completed,
                reminder.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert reminder")?;
        Ok(reminder)
    }

    pub fn insert_plan(&self, user_id: &str, draft: &PlanDraft) -> Result<Plan> {
        let plan = Plan {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            draft: draft.clone(),
            created_at: Utc::now(),
        };

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO plans
             (id, user_id, title, description, category, start_date, end_date, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                plan.id,
                plan.user_id,
                draft.title,
                draft.description,
                draft.category.as_db_str(),
                draft.start_date.to_string(),
                draft.end_date.to_string(),
                draft.status,
                plan.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert plan")?;
        Ok(plan)
    }

    pub fn active_plans(&self, user_id: &str, limit: usize) -> Result<Vec<Plan>> {
        self.query_plans(
            "SELECT id, user_id, title, description, category, start_date, end_date, status, created_at
             FROM plans
             WHERE user_id = ?1 AND status = 'active'
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
            params![user_id, limit as i64],
        )
    }

    fn plans_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<Plan>> {
        self.query_plans(
            "SELECT id, user_id, title, description, category, start_date, end_date, status, created_at
             FROM plans
             WHERE user_id = ?1 AND created_at >= ?2
             ORDER BY created_at ASC, rowid ASC",
            params![user_id, since.to_rfc3339()],
        )
    }

    fn query_plans(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Plan>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let plans = stmt
            .query_map(args, |row| {
                Ok(Plan {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    draft: PlanDraft {
                        title: row.get(2)?,
                        description: row.get(3)?,
                        category: PlanCategory::from_db(&row.get::<_, String>(4)?),
                        start_date: parse_date(row.get(5)?, 5)?,
                        end_date: parse_date(row.get(6)?, 6)?,
                        status: row.get(7)?,
                    },
                    created_at: parse_rfc3339(row.get(8)?, 8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(plans)
    }

    pub fn insert_record(&self, user_id: &str, draft: &RecordDraft) -> Result<Record> {
        let record = Record {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            draft: draft.clone(),
            created_at: Utc::now(),
        };
        let tags_json = serde_json::to_string(&draft.tags).context("Failed to serialize tags")?;

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO records (id, user_id, content, record_type, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.user_id,
                draft.content,
                draft.record_type.as_db_str(),
                tags_json,
                record.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert record")?;
        Ok(record)
    }

    pub fn recent_records(&self, user_id: &str, limit: usize) -> Result<Vec<Record>> {
        self.query_records(
            "SELECT id, user_id, content, record_type, tags, created_at
             FROM records
             WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
            params![user_id, limit as i64],
        )
    }

    fn records_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<Record>> {
        self.query_records(
            "SELECT id, user_id, content, record_type, tags, created_at
             FROM records
             WHERE user_id = ?1 AND created_at >= ?2
             ORDER BY created_at ASC, rowid ASC",
            params![user_id, since.to_rfc3339()],
        )
    }

    fn query_records(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Record>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map(args, |row| {
                Ok(Record {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    draft: RecordDraft {
                        content: row.get(2)?,
                        record_type: RecordType::from_db(&row.get::<_, String>(3)?),
                        tags: parse_json(row.get(4)?, 4)?,
                    },
                    created_at: parse_rfc3339(row.get(5)?, 5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn insert_health_entry(&self, user_id: &str, draft: &HealthDraft) -> Result<HealthEntry> {
        let entry = HealthEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            draft: draft.clone(),
            created_at: Utc::now(),
        };
        let tagged = serde_json::to_value(&draft.data).context("Failed to serialize health data")?;
        let value_json = serde_json::to_string(&tagged["data_value"])
            .context("Failed to serialize health data value")?;

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO health_data (id, user_id, data_type, data_value, record_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.id,
                entry.user_id,
                draft.data.data_type(),
                value_json,
                draft.record_date.to_string(),
                entry.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert health entry")?;
        Ok(entry)
    }

    pub fn recent_health_entries(&self, user_id: &str, limit: usize) -> Result<Vec<HealthEntry>> {
        self.query_health(
            "SELECT id, user_id, data_type, data_value, record_date, created_at
             FROM health_data
             WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
            params![user_id, limit as i64],
        )
    }

    fn health_entries_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<HealthEntry>> {
        self.query_health(
            "SELECT id, user_id, data_type, data_value, record_date, created_at
             FROM health_data
             WHERE user_id = ?1 AND created_at >= ?2
             ORDER BY created_at ASC, rowid ASC",
            params![user_id, since.to_rfc3339()],
        )
    }

    fn query_health(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<HealthEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let entries = stmt
            .query_map(args, |row| {
                let data_type: String = row.get(2)?;
                let data_value: Value = parse_json(row.get(3)?, 3)?;
                let data: HealthData = serde_json::from_value(serde_json::json!({
                    "data_type": data_type,
                    "data_value": data_value,
                }))
                .map_err(|e| conversion_error(3, e))?;

                Ok(HealthEntry {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    draft: HealthDraft {
                        data,
                        record_date: parse_date(row.get(4)?, 4)?,
                    },
                    created_at: parse_rfc3339(row.get(5)?, 5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn reminder_statuses_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReminderStatus>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, is_completed, created_at
             FROM reminders
             WHERE user_id = ?1 AND created_at >= ?2
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let statuses = stmt
            .query_map(params![user_id, since.to_rfc3339()], |row| {
                Ok(ReminderStatus {
                    id: row.get(0)?,
                    is_completed: row.get(1)?,
                    created_at: parse_rfc3339(row.get(2)?, 2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(statuses)
    }

    /// Everything created at or after `since`, oldest first.
    pub fn activity_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<ActivityWindow> {
        Ok(ActivityWindow {
            records: self.records_since(user_id, since)?,
            plans: self.plans_since(user_id, since)?,
            reminders: self.reminder_statuses_since(user_id, since)?,
            health: self.health_entries_since(user_id, since)?,
        })
    }

    // ========================================================================
    // Memories
    // ========================================================================

    pub fn upsert_memory(&self, user_id: &str, memory: &MemoryUpsert) -> Result<Memory> {
        let kind = memory.value.kind();
        let value_json = serde_json::to_string(memory.value.detail())
            .context("Failed to serialize memory value")?;
        let now = Utc::now().to_rfc3339();

        {
            let conn = self.lock_conn()?;
            conn.execute(
                "INSERT INTO user_memories
                 (id, user_id, memory_type, key, value, confidence, source, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(user_id, memory_type, key) DO UPDATE SET
                    value = excluded.value,
                    confidence = excluded.confidence,
                    source = excluded.source,
                    updated_at = excluded.updated_at",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    user_id,
                    kind.as_db_str(),
                    memory.key,
                    value_json,
                    f64::from(memory.confidence.clamp(0.0, 1.0)),
                    memory.source,
                    now,
                ],
            )
            .context("Failed to upsert memory")?;
        }

        let stored = self.list_memories(
            user_id,
            &MemoryFilter {
                memory_type: Some(kind),
                key: Some(memory.key.clone()),
                ..MemoryFilter::default()
            },
        )?;
        stored
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Memory {} vanished after upsert", memory.key))
    }

    pub fn list_memories(&self, user_id: &str, filter: &MemoryFilter) -> Result<Vec<Memory>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, memory_type, key, value, confidence, source, updated_at
             FROM user_memories
             WHERE user_id = ?1
               AND (?2 IS NULL OR memory_type = ?2)
               AND (?3 IS NULL OR key = ?3)
               AND confidence >= ?4
             ORDER BY updated_at DESC, rowid DESC
             LIMIT ?5",
        )?;

        let memory_type = filter.memory_type.map(MemoryKind::as_db_str);
        let min_confidence = f64::from(filter.min_confidence.unwrap_or(0.0));
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);

        let memories = stmt
            .query_map(
                params![user_id, memory_type, filter.key, min_confidence, limit],
                row_to_memory,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    pub fn delete_memory(&self, user_id: &str, memory_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute(
            "DELETE FROM user_memories WHERE id = ?1 AND user_id = ?2",
            params![memory_id, user_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn clear_memories(&self, user_id: &str, kind: MemoryKind) -> Result<usize> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute(
            "DELETE FROM user_memories WHERE user_id = ?1 AND memory_type = ?2",
            params![user_id, kind.as_db_str()],
        )?;
        Ok(deleted)
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    pub fn insert_conversation(&self, user_id: &str, turn: &PriorTurn) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO conversations (id, user_id, message, response, intent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                uuid::Uuid::new_v4().to_string(),
                user_id,
                turn.message,
                turn.response,
                turn.intent,
                turn.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert conversation")?;
        Ok(())
    }

    /// Stored turns, newest first.
    pub fn list_conversations(&self, user_id: &str, limit: usize) -> Result<Vec<PriorTurn>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT message, response, intent, created_at
             FROM conversations
             WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let turns = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(PriorTurn {
                    message: row.get(0)?,
                    response: row.get(1)?,
                    intent: row.get(2)?,
                    created_at: parse_rfc3339(row.get(3)?, 3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(turns)
    }

    // ========================================================================
    // Keyword Configs
    // ========================================================================

    /// Active configs ranked by priority (desc), then creation order.
    pub fn list_keyword_configs(&self, user_id: &str) -> Result<Vec<KeywordConfig>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, category, keywords, priority, created_at
             FROM keyword_configs
             WHERE user_id = ?1 AND is_active = 1
             ORDER BY priority DESC, created_at ASC, rowid ASC",
        )?;
        let configs = stmt
            .query_map([user_id], row_to_keyword_config)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(configs)
    }

    pub fn get_keyword_config(&self, user_id: &str, id: &str) -> Result<Option<KeywordConfig>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, category, keywords, priority, created_at
             FROM keyword_configs
             WHERE id = ?1 AND user_id = ?2 AND is_active = 1",
            params![id, user_id],
            row_to_keyword_config,
        );

        match result {
            Ok(config) => Ok(Some(config)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn create_keyword_config(
        &self,
        user_id: &str,
        input: &KeywordConfigInput,
    ) -> Result<KeywordConfig> {
        let conn = self.lock_conn()?;
        insert_keyword_config(&conn, user_id, input)
    }

    pub fn update_keyword_config(
        &self,
        user_id: &str,
        id: &str,
        update: &KeywordConfigUpdate,
    ) -> Result<Option<KeywordConfig>> {
        let Some(mut config) = self.get_keyword_config(user_id, id)? else {
            return Ok(None);
        };
        if let Some(category) = update.category {
            config.category = category;
        }
        if let Some(keywords) = &update.keywords {
            config.keywords = keywords.clone();
        }
        if let Some(priority) = update.priority {
            config.priority = priority;
        }

        let keywords_json =
            serde_json::to_string(&config.keywords).context("Failed to serialize keywords")?;
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE keyword_configs
             SET category = ?1, keywords = ?2, priority = ?3, updated_at = ?4
             WHERE id = ?5 AND user_id = ?6",
            params![
                config.category.as_db_str(),
                keywords_json,
                config.priority,
                Utc::now().to_rfc3339(),
                id,
                user_id,
            ],
        )?;
        Ok(Some(config))
    }

    /// Soft delete: the row stays but drops out of the active set.
    pub fn deactivate_keyword_config(&self, user_id: &str, id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE keyword_configs SET is_active = 0, updated_at = ?1
             WHERE id = ?2 AND user_id = ?3 AND is_active = 1",
            params![Utc::now().to_rfc3339(), id, user_id],
        )?;
        Ok(changed > 0)
    }

    /// Deactivate every active config and insert `inputs` in their place, atomically.
    pub fn replace_keyword_configs(
        &self,
        user_id: &str,
        inputs: &[KeywordConfigInput],
    ) -> Result<Vec<KeywordConfig>> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE keyword_configs SET is_active = 0, updated_at = ?1
             WHERE user_id = ?2 AND is_active = 1",
            params![Utc::now().to_rfc3339(), user_id],
        )?;
        let mut created = Vec::with_capacity(inputs.len());
        for input in inputs {
            created.push(insert_keyword_config(&tx, user_id, input)?);
        }
        tx.commit().context("Failed to commit keyword config import")?;
        Ok(created)
    }

    // ========================================================================
    // Insights
    // ========================================================================

    pub fn insert_insights(&self, insights: &[Insight]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        for insight in insights {
            let data_json =
                serde_json::to_string(&insight.data).context("Failed to serialize insight data")?;
            tx.execute(
                "INSERT INTO data_insights
                 (id, user_id, insight_type, category, title, description, data, generated_at,
                  expires_at, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    insight.id,
                    insight.user_id,
                    insight.insight_type.as_db_str(),
                    insight.category,
                    insight.title,
                    insight.description,
                    data_json,
                    insight.generated_at.to_rfc3339(),
                    insight.expires_at.map(|t| t.to_rfc3339()),
                    insight.is_active,
                ],
            )?;
        }
        tx.commit().context("Failed to commit insights")?;
        Ok(())
    }

    pub fn list_insights(&self, user_id: &str, filter: &InsightFilter) -> Result<Vec<Insight>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, insight_type, category, title, description, data, generated_at,
                    expires_at, is_active
             FROM data_insights
             WHERE user_id = ?1
               AND (?2 IS NULL OR insight_type = ?2)
               AND (?3 IS NULL OR category = ?3)
               AND (?4 = 0 OR is_active = 1)
             ORDER BY generated_at DESC, rowid DESC",
        )?;
        let insights = stmt
            .query_map(
                params![
                    user_id,
                    filter.insight_type.map(InsightType::as_db_str),
                    filter.category,
                    filter.active_only,
                ],
                row_to_insight,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(insights)
    }

    /// Active insights that have not expired at `now`, newest first.
    pub fn current_insights(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Insight>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, insight_type, category, title, description, data, generated_at,
                    expires_at, is_active
             FROM data_insights
             WHERE user_id = ?1 AND is_active = 1 AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY generated_at DESC, rowid DESC
             LIMIT ?3",
        )?;
        let insights = stmt
            .query_map(params![user_id, now.to_rfc3339(), limit as i64], row_to_insight)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(insights)
    }
}

impl AssistantDatabase {
    /// Run a query on the blocking pool so async callers can time it out.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&AssistantDatabase) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .context("Database task failed")?
    }
}

#[async_trait]
impl DomainStore for AssistantDatabase {
    async fn recent_memories(
        &self,
        user_id: &str,
        min_confidence: f32,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let user_id = user_id.to_string();
        self.blocking(move |db| {
            db.list_memories(
                &user_id,
                &MemoryFilter {
                    min_confidence: Some(min_confidence),
                    limit: Some(limit),
                    ..MemoryFilter::default()
                },
            )
        })
        .await
    }

    async fn recent_turns(&self, user_id: &str, limit: usize) -> Result<Vec<PriorTurn>> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.list_conversations(&user_id, limit))
            .await
    }

    async fn user_profile(&self, user_id: &str, min_confidence: f32) -> Result<UserProfile> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.build_user_profile(&user_id, min_confidence))
            .await
    }

    async fn recent_insights(&self, user_id: &str, limit: usize) -> Result<Vec<Insight>> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.current_insights(&user_id, Utc::now(), limit))
            .await
    }

    async fn active_keyword_configs(&self, user_id: &str) -> Result<Vec<KeywordConfig>> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.list_keyword_configs(&user_id))
            .await
    }

    async fn create_reminder(&self, user_id: &str, draft: &ReminderDraft) -> Result<Reminder> {
        let (user_id, draft) = (user_id.to_string(), draft.clone());
        self.blocking(move |db| db.insert_reminder(&user_id, &draft))
            .await
    }

    async fn create_plan(&self, user_id: &str, draft: &PlanDraft) -> Result<Plan> {
        let (user_id, draft) = (user_id.to_string(), draft.clone());
        self.blocking(move |db| db.insert_plan(&user_id, &draft)).await
    }

    async fn create_record(&self, user_id: &str, draft: &RecordDraft) -> Result<Record> {
        let (user_id, draft) = (user_id.to_string(), draft.clone());
        self.blocking(move |db| db.insert_record(&user_id, &draft))
            .await
    }

    async fn create_health_entry(
        &self,
        user_id: &str,
        draft: &HealthDraft,
    ) -> Result<HealthEntry> {
        let (user_id, draft) = (user_id.to_string(), draft.clone());
        self.blocking(move |db| db.insert_health_entry(&user_id, &draft))
            .await
    }

    async fn save_conversation(&self, user_id: &str, turn: &PriorTurn) -> Result<()> {
        let (user_id, turn) = (user_id.to_string(), turn.clone());
        self.blocking(move |db| db.insert_conversation(&user_id, &turn))
            .await
    }

    async fn upsert_memory(&self, user_id: &str, memory: &MemoryUpsert) -> Result<Memory> {
        let (user_id, memory) = (user_id.to_string(), memory.clone());
        self.blocking(move |db| AssistantDatabase::upsert_memory(db, &user_id, &memory))
            .await
    }
}

fn insert_keyword_config(
    conn: &Connection,
    user_id: &str,
    input: &KeywordConfigInput,
) -> Result<KeywordConfig> {
    let config = KeywordConfig {
        id: uuid::Uuid::new_v4().to_string(),
        category: input.category,
        keywords: input.keywords.clone(),
        priority: input.priority.unwrap_or(DEFAULT_PRIORITY),
        created_at: Utc::now(),
    };
    let keywords_json =
        serde_json::to_string(&config.keywords).context("Failed to serialize keywords")?;
    let created_at = config.created_at.to_rfc3339();

    conn.execute(
        "INSERT INTO keyword_configs
         (id, user_id, category, keywords, priority, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
        params![
            config.id,
            user_id,
            config.category.as_db_str(),
            keywords_json,
            config.priority,
            created_at,
        ],
    )
    .context("Failed to insert keyword config")?;
    Ok(config)
}

fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let raw_type: String = row.get(2)?;
    let kind = MemoryKind::parse(&raw_type).ok_or_else(|| {
        conversion_error(2, anyhow::anyhow!("unknown memory type '{}'", raw_type))
    })?;
    let detail: MemoryDetail = parse_json(row.get(4)?, 4)?;

    Ok(Memory {
        id: row.get(0)?,
        user_id: row.get(1)?,
        key: row.get(3)?,
        value: MemoryValue::new(kind, detail),
        confidence: row.get::<_, f64>(5)? as f32,
        source: row.get(6)?,
        updated_at: parse_rfc3339(row.get(7)?, 7)?,
    })
}

fn row_to_keyword_config(row: &Row<'_>) -> rusqlite::Result<KeywordConfig> {
    let raw_category: String = row.get(1)?;
    let category = KeywordCategory::parse(&raw_category).ok_or_else(|| {
        conversion_error(1, anyhow::anyhow!("unknown keyword category '{}'", raw_category))
    })?;

    Ok(KeywordConfig {
        id: row.get(0)?,
        category,
        keywords: parse_json(row.get(2)?, 2)?,
        priority: row.get(3)?,
        created_at: parse_rfc3339(row.get(4)?, 4)?,
    })
}

fn row_to_insight(row: &Row<'_>) -> rusqlite::Result<Insight> {
    let expires_at = match row.get::<_, Option<String>>(8)? {
        Some(raw) => Some(parse_rfc3339(raw, 8)?),
        None => None,
    };

    Ok(Insight {
        id: row.get(0)?,
        user_id: row.get(1)?,
        insight_type: InsightType::from_db(&row.get::<_, String>(2)?),
        category: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        data: parse_json(row.get(6)?, 6)?,
        generated_at: parse_rfc3339(row.get(7)?, 7)?,
        expires_at,
        is_active: row.get(9)?,
    })
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, err.into())
}

fn parse_rfc3339(value: String, column: usize) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    value.parse().map_err(|e| conversion_error(column, e))
}

fn parse_date(value: String, column: usize) -> std::result::Result<NaiveDate, rusqlite::Error> {
    NaiveDate::parse_from_str(&value, "%Y-%m-%d").map_err(|e| conversion_error(column, e))
}

fn parse_json<T: DeserializeOwned>(
    value: String,
    column: usize,
) -> std::result::Result<T, rusqlite::Error> {
    serde_json::from_str(&value).map_err(|e| conversion_error(column, e))
}
