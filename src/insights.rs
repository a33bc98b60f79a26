//! Data insights derived from a user's recent activity.
//!
//! Generation is a pure function of an [`ActivityWindow`]; [`generate_and_store`] wires it
//! to the database. Generated insights later feed the personalization context.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::database::{ActivityWindow, AssistantDatabase};
use crate::domain::{HealthEntry, Plan, Record, ReminderStatus};

/// How far back generation looks.
pub const LOOKBACK_DAYS: i64 = 30;
/// How long a generated insight stays current.
pub const INSIGHT_TTL_DAYS: i64 = 7;

const HIGH_RECORD_RATE: f64 = 2.0;
const STRONG_COMPLETION_RATE: f64 = 0.8;
const WEAK_COMPLETION_RATE: f64 = 0.5;
const HEALTH_TREND_WINDOW: usize = 7;
const HEALTH_TREND_GAIN: f64 = 1.1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Trend,
    Pattern,
    Recommendation,
}

impl InsightType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            InsightType::Trend => "trend",
            InsightType::Pattern => "pattern",
            InsightType::Recommendation => "recommendation",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trend" => InsightType::Trend,
            "recommendation" => InsightType::Recommendation,
            _ => InsightType::Pattern,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Insight {
    pub id: String,
    pub user_id: String,
    pub insight_type: InsightType,
    pub category: String,
    pub title: String,
    pub description: String,
    pub data: Value,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InsightCategory {
    Records,
    Health,
    Plans,
    Reminders,
}

impl InsightCategory {
    pub const ALL: [InsightCategory; 4] = [
        InsightCategory::Records,
        InsightCategory::Health,
        InsightCategory::Plans,
        InsightCategory::Reminders,
    ];
}

struct InsightFactory<'a> {
    user_id: &'a str,
    now: DateTime<Utc>,
}

impl InsightFactory<'_> {
    fn make(
        &self,
        insight_type: InsightType,
        category: &str,
        title: String,
        description: String,
        data: Value,
    ) -> Insight {
        Insight {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user_id.to_string(),
            insight_type,
            category: category.to_string(),
            title,
            description,
            data,
            generated_at: self.now,
            expires_at: Some(self.now + Duration::days(INSIGHT_TTL_DAYS)),
            is_active: true,
        }
    }
}

/// Run the rules for the requested categories over `window`.
pub fn generate(
    user_id: &str,
    window: &ActivityWindow,
    categories: &[InsightCategory],
    now: DateTime<Utc>,
) -> Vec<Insight> {
    let factory = InsightFactory { user_id, now };
    let mut insights = Vec::new();
    for category in categories {
        match category {
            InsightCategory::Records => insights.extend(record_insights(&factory, &window.records)),
            InsightCategory::Health => insights.extend(health_insights(&factory, &window.health)),
            InsightCategory::Plans => insights.extend(plan_insights(&factory, &window.plans)),
            InsightCategory::Reminders => {
                insights.extend(reminder_insights(&factory, &window.reminders))
            }
        }
    }
    insights
}

/// Generate insights from the last [`LOOKBACK_DAYS`] and persist them.
pub fn generate_and_store(
    db: &AssistantDatabase,
    user_id: &str,
    categories: &[InsightCategory],
    now: DateTime<Utc>,
) -> Result<Vec<Insight>> {
    let window = db.activity_since(user_id, now - Duration::days(LOOKBACK_DAYS))?;
    let insights = generate(user_id, &window, categories, now);
    if !insights.is_empty() {
        db.insert_insights(&insights)?;
    }
    tracing::info!("Generated {} insight(s) for {}", insights.len(), user_id);
    Ok(insights)
}

fn record_insights(factory: &InsightFactory<'_>, records: &[Record]) -> Vec<Insight> {
    if records.is_empty() {
        return Vec::new();
    }
    let mut insights = Vec::new();

    let mut per_day: BTreeMap<chrono::NaiveDate, usize> = BTreeMap::new();
    for record in records {
        *per_day.entry(record.created_at.date_naive()).or_default() += 1;
    }
    let avg_per_day = records.len() as f64 / per_day.len() as f64;
    if avg_per_day > HIGH_RECORD_RATE {
        insights.push(factory.make(
            InsightType::Trend,
            "records",
            "记录活跃度很高".to_string(),
            format!(
                "您最近30天平均每天创建{:.1}条记录，保持了很好的记录习惯！",
                avg_per_day
            ),
            json!({ "avgRecordsPerDay": avg_per_day, "totalRecords": records.len() }),
        ));
    }

    let mut by_type: BTreeMap<&'static str, usize> = BTreeMap::new();
    for record in records {
        *by_type.entry(record.draft.record_type.as_db_str()).or_default() += 1;
    }
    // Ties resolve to the alphabetically first type.
    let most_used = by_type
        .iter()
        .fold(None::<(&str, usize)>, |best, (&kind, &count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((kind, count)),
        });
    if let Some((kind, count)) = most_used {
        insights.push(factory.make(
            InsightType::Pattern,
            "records",
            "记录类型偏好".to_string(),
            format!(
                "您最常使用{}类型记录，占总记录的{:.1}%",
                kind,
                count as f64 / records.len() as f64 * 100.0
            ),
            json!(by_type),
        ));
    }

    insights
}

fn health_insights(factory: &InsightFactory<'_>, entries: &[HealthEntry]) -> Vec<Insight> {
    let mut series: BTreeMap<&'static str, Vec<f64>> = BTreeMap::new();
    for entry in entries {
        if let Some(value) = entry.draft.data.primary_value() {
            series
                .entry(entry.draft.data.data_type())
                .or_default()
                .push(value);
        }
    }

    series
        .into_iter()
        .filter_map(|(data_type, values)| {
            // Needs an earlier baseline besides the recent window.
            if values.len() <= HEALTH_TREND_WINDOW {
                return None;
            }
            let (earlier, recent) = values.split_at(values.len() - HEALTH_TREND_WINDOW);
            let recent_avg = mean(recent);
            let earlier_avg = mean(earlier);
            if earlier_avg <= 0.0 || recent_avg <= earlier_avg * HEALTH_TREND_GAIN {
                return None;
            }
            let improvement = (recent_avg - earlier_avg) / earlier_avg;
            Some(factory.make(
                InsightType::Trend,
                "health",
                format!("{}数据呈上升趋势", data_type),
                format!(
                    "您的{}最近一周平均值比之前提高了{:.1}%",
                    data_type,
                    improvement * 100.0
                ),
                json!({
                    "type": data_type,
                    "recentAvg": recent_avg,
                    "earlierAvg": earlier_avg,
                    "improvement": improvement,
                }),
            ))
        })
        .collect()
}

fn plan_insights(factory: &InsightFactory<'_>, plans: &[Plan]) -> Vec<Insight> {
    if plans.is_empty() {
        return Vec::new();
    }
    let completed = plans
        .iter()
        .filter(|p| p.draft.status == "completed")
        .count();
    let rate = completed as f64 / plans.len() as f64;
    let data = json!({
        "completedPlans": completed,
        "totalPlans": plans.len(),
        "completionRate": rate,
    });

    if rate > STRONG_COMPLETION_RATE {
        vec![factory.make(
            InsightType::Pattern,
            "plans",
            "计划执行力强".to_string(),
            format!(
                "您已完成{}个计划，完成率达到{:.1}%，执行力很强！",
                completed,
                rate * 100.0
            ),
            data,
        )]
    } else if rate < WEAK_COMPLETION_RATE {
        vec![factory.make(
            InsightType::Recommendation,
            "plans",
            "建议优化计划管理".to_string(),
            format!(
                "您的计划完成率为{:.1}%，建议将大计划分解为小任务，提高执行效率。",
                rate * 100.0
            ),
            data,
        )]
    } else {
        Vec::new()
    }
}

fn reminder_insights(factory: &InsightFactory<'_>, reminders: &[ReminderStatus]) -> Vec<Insight> {
    if reminders.is_empty() {
        return Vec::new();
    }
    let completed = reminders.iter().filter(|r| r.is_completed).count();
    let rate = completed as f64 / reminders.len() as f64;
    if rate <= STRONG_COMPLETION_RATE {
        return Vec::new();
    }

    vec![factory.make(
        InsightType::Pattern,
        "reminders",
        "提醒完成率很高".to_string(),
        format!("您的提醒完成率达到{:.1}%，时间管理能力很强！", rate * 100.0),
        json!({
            "completedReminders": completed,
            "totalReminders": reminders.len(),
            "completionRate": rate,
        }),
    )]
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ExtraAttributes, HealthData, HealthDraft, PlanCategory, PlanDraft, RecordDraft,
        RecordType,
    };

    fn record(kind: RecordType, at: DateTime<Utc>) -> Record {
        Record {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: "u1".to_string(),
            draft: RecordDraft {
                content: "note".to_string(),
                record_type: kind,
                tags: vec!["日常".to_string()],
            },
            created_at: at,
        }
    }

    fn plan(status: &str) -> Plan {
        let today = Utc::now().date_naive();
        Plan {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: "u1".to_string(),
            draft: PlanDraft {
                title: "plan".to_string(),
                description: String::new(),
                category: PlanCategory::Personal,
                start_date: today,
                end_date: today,
                status: status.to_string(),
            },
            created_at: Utc::now(),
        }
    }

    fn exercise(minutes: u32) -> HealthEntry {
        HealthEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: "u1".to_string(),
            draft: HealthDraft {
                data: HealthData::Exercise {
                    activity: "跑步".to_string(),
                    duration_minutes: minutes,
                    calories: 200,
                    notes: String::new(),
                    extra: ExtraAttributes::new(),
                },
                record_date: Utc::now().date_naive(),
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn busy_recording_day_yields_trend_and_type_pattern() {
        let now = Utc::now();
        let window = ActivityWindow {
            records: vec![
                record(RecordType::Text, now),
                record(RecordType::Text, now),
                record(RecordType::Voice, now),
            ],
            ..ActivityWindow::default()
        };

        let insights = generate("u1", &window, &[InsightCategory::Records], now);
        assert_eq!(insights.len(), 2);
        assert_eq!(insights[0].insight_type, InsightType::Trend);
        assert_eq!(insights[1].title, "记录类型偏好");
        assert!(insights[1].description.contains("text"));
        assert!(insights[1].description.contains("66.7%"));
        assert_eq!(
            insights[0].expires_at,
            Some(now + Duration::days(INSIGHT_TTL_DAYS))
        );
    }

    #[test]
    fn plan_completion_rate_picks_pattern_or_recommendation() {
        let now = Utc::now();
        let strong = ActivityWindow {
            plans: (0..5).map(|_| plan("completed")).collect(),
            ..ActivityWindow::default()
        };
        let weak = ActivityWindow {
            plans: vec![plan("active"), plan("active"), plan("completed")],
            ..ActivityWindow::default()
        };
        let middling = ActivityWindow {
            plans: vec![plan("active"), plan("completed")],
            ..ActivityWindow::default()
        };

        let strong = generate("u1", &strong, &[InsightCategory::Plans], now);
        assert_eq!(strong[0].insight_type, InsightType::Pattern);
        let weak = generate("u1", &weak, &[InsightCategory::Plans], now);
        assert_eq!(weak[0].insight_type, InsightType::Recommendation);
        assert!(generate("u1", &middling, &[InsightCategory::Plans], now).is_empty());
    }

    #[test]
    fn rising_exercise_duration_is_a_health_trend() {
        let now = Utc::now();
        let mut health: Vec<_> = (0..3).map(|_| exercise(20)).collect();
        health.extend((0..7).map(|_| exercise(40)));
        let window = ActivityWindow {
            health,
            ..ActivityWindow::default()
        };

        let insights = generate("u1", &window, &InsightCategory::ALL, now);
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].category, "health");
        assert_eq!(insights[0].data["improvement"], 1.0);
    }

    #[test]
    fn reminder_completion_needs_more_than_eighty_percent() {
        let status = |done| ReminderStatus {
            id: uuid::Uuid::new_v4().to_string(),
            is_completed: done,
            created_at: Utc::now(),
        };
        let mostly = ActivityWindow {
            reminders: vec![status(true), status(true), status(true), status(true), status(false)],
            ..ActivityWindow::default()
        };
        assert!(generate("u1", &mostly, &[InsightCategory::Reminders], Utc::now()).is_empty());

        let all = ActivityWindow {
            reminders: vec![status(true), status(true)],
            ..ActivityWindow::default()
        };
        assert_eq!(
            generate("u1", &all, &[InsightCategory::Reminders], Utc::now()).len(),
            1
        );
    }
}
