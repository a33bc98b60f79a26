//! Parameter extraction for each intent category.
//!
//! Every extractor is total and deterministic for a given [`ExtractionContext`]: missing
//! information is filled with fixed defaults and nothing here can fail.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use regex_lite::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::domain::{
    ExtraAttributes, HealthData, HealthDraft, PlanCategory, PlanDraft, RecordDraft, RecordType,
    ReminderDraft, ReminderPriority,
};
use crate::keywords::KeywordCategory;
use crate::prompt::truncate_chars;

const TITLE_CHARS: usize = 50;
const PLAN_DAYS: i64 = 30;
const DEFAULT_TAG: &str = "日常";
const DEFAULT_HOUR: u32 = 9;

const DEFAULT_EXERCISE_MINUTES: u32 = 30;
const DEFAULT_EXERCISE_CALORIES: u32 = 200;
const DEFAULT_WEIGHT_KG: f32 = 70.0;
const DEFAULT_BODY_FAT: f32 = 15.0;

/// The clock and timezone extraction runs against.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionContext {
    pub now: DateTime<Utc>,
    pub utc_offset: FixedOffset,
}

impl ExtractionContext {
    pub fn new(now: DateTime<Utc>, utc_offset: FixedOffset) -> Self {
        Self { now, utc_offset }
    }

    fn local_now(&self) -> DateTime<FixedOffset> {
        self.now.with_timezone(&self.utc_offset)
    }

    pub fn local_today(&self) -> NaiveDate {
        self.local_now().date_naive()
    }

    fn at_local(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        self.utc_offset
            .from_local_datetime(&date.and_time(time))
            .single()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// The draft an intent would create. Serializes as the bare draft.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExtractedParameters {
    Reminder(ReminderDraft),
    Plan(PlanDraft),
    Record(RecordDraft),
    Health(HealthDraft),
}

pub fn extract(
    category: KeywordCategory,
    message: &str,
    ctx: &ExtractionContext,
) -> ExtractedParameters {
    match category {
        KeywordCategory::Reminder => ExtractedParameters::Reminder(extract_reminder(message, ctx)),
        KeywordCategory::Plan => ExtractedParameters::Plan(extract_plan(message, ctx)),
        KeywordCategory::Growth => ExtractedParameters::Plan(PlanDraft {
            category: PlanCategory::Personal,
            ..extract_plan(message, ctx)
        }),
        KeywordCategory::Record => ExtractedParameters::Record(extract_record(message)),
        KeywordCategory::Health => ExtractedParameters::Health(extract_health(message, ctx)),
    }
}

fn title_from(message: &str) -> String {
    let title = truncate_chars(message, TITLE_CHARS);
    if title.len() < message.len() {
        format!("{}...", title)
    } else {
        title.to_string()
    }
}

fn contains_any(lowered: &str, cues: &[&str]) -> bool {
    cues.iter().any(|cue| lowered.contains(*cue))
}

type CachedRegex = OnceLock<Option<Regex>>;

fn captures<'t>(
    cell: &'static CachedRegex,
    pattern: &str,
    text: &'t str,
) -> Option<regex_lite::Captures<'t>> {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()?
        .captures(text)
}

fn first_number<T: std::str::FromStr>(cell: &'static CachedRegex, pattern: &str, text: &str) -> Option<T> {
    captures(cell, pattern, text)?.get(1)?.as_str().parse().ok()
}

// ---------------------------------------------------------------------------
// Reminder
// ---------------------------------------------------------------------------

pub fn extract_reminder(message: &str, ctx: &ExtractionContext) -> ReminderDraft {
    let lowered = message.to_lowercase();

    ReminderDraft {
        title: title_from(message),
        description: message.to_string(),
        remind_time: resolve_remind_time(&lowered, ctx),
        priority: reminder_priority(&lowered),
        is_completed: false,
    }
}

/// Negated cues are checked first: "不紧急" also contains "紧急".
fn reminder_priority(lowered: &str) -> ReminderPriority {
    static LOW_WORD: CachedRegex = OnceLock::new();

    if contains_any(lowered, &["不紧急", "不急", "not urgent"]) {
        ReminderPriority::Low
    } else if contains_any(lowered, &["紧急", "urgent"]) {
        ReminderPriority::High
    } else if captures(&LOW_WORD, r"\blow\b", lowered).is_some() {
        ReminderPriority::Low
    } else {
        ReminderPriority::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DayPhrase {
    Tomorrow,
    DayAfterTomorrow,
    NextWeek,
    Date(u32, u32),
}

fn day_phrase(lowered: &str) -> Option<DayPhrase> {
    static DATE: CachedRegex = OnceLock::new();
    if let Some(caps) = captures(&DATE, r"(\d{1,2})月(\d{1,2})[日号]", lowered) {
        let month = caps[1].parse().unwrap_or(0);
        let day = caps[2].parse().unwrap_or(0);
        return Some(DayPhrase::Date(month, day));
    }
    if contains_any(lowered, &["后天", "day after tomorrow"]) {
        return Some(DayPhrase::DayAfterTomorrow);
    }
    if contains_any(lowered, &["下周", "next week"]) {
        return Some(DayPhrase::NextWeek);
    }
    if contains_any(lowered, &["明天", "tomorrow"]) {
        return Some(DayPhrase::Tomorrow);
    }
    None
}

fn clock_time(lowered: &str) -> Option<NaiveTime> {
    static COLON: CachedRegex = OnceLock::new();
    static CHINESE: CachedRegex = OnceLock::new();

    let (mut hour, minute): (u32, u32) =
        if let Some(caps) = captures(&COLON, r"(\d{1,2}):(\d{2})", lowered) {
            (caps[1].parse().ok()?, caps[2].parse().ok()?)
        } else if let Some(caps) = captures(&CHINESE, r"(\d{1,2})点(半|(\d{1,2})分?)?", lowered) {
            let minute = match (caps.get(2).map(|m| m.as_str()), caps.get(3)) {
                (Some("半"), _) => 30,
                (_, Some(m)) => m.as_str().parse().ok()?,
                _ => 0,
            };
            (caps[1].parse().ok()?, minute)
        } else {
            return None;
        };

    if hour < 12 && contains_any(lowered, &["下午", "晚上", "傍晚", "pm"]) {
        hour += 12;
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Resolve the due instant implied by the message.
///
/// A bare "tomorrow", or no time phrase at all, means 24 hours from now. Anything that
/// pins a day or a clock time is resolved in the context's timezone, with a clock time
/// alone meaning its next occurrence.
fn resolve_remind_time(lowered: &str, ctx: &ExtractionContext) -> DateTime<Utc> {
    let fallback = ctx.now + Duration::hours(24);
    let today = ctx.local_today();
    let clock = clock_time(lowered);
    let at_clock = clock.or_else(|| NaiveTime::from_hms_opt(DEFAULT_HOUR, 0, 0));
    let on_day = |days: i64| at_clock.and_then(|time| ctx.at_local(today + Duration::days(days), time));

    let resolved = match (day_phrase(lowered), clock) {
        (None, None) | (Some(DayPhrase::Tomorrow), None) => None,
        (None, Some(time)) => ctx.at_local(today, time).map(|candidate| {
            if candidate <= ctx.now {
                candidate + Duration::days(1)
            } else {
                candidate
            }
        }),
        (Some(DayPhrase::Tomorrow), Some(time)) => ctx.at_local(today + Duration::days(1), time),
        (Some(DayPhrase::DayAfterTomorrow), _) => on_day(2),
        (Some(DayPhrase::NextWeek), _) => on_day(7),
        (Some(DayPhrase::Date(month, day)), _) => {
            let this_year = NaiveDate::from_ymd_opt(today.year(), month, day);
            let date = match this_year {
                Some(date) if date < today => NaiveDate::from_ymd_opt(today.year() + 1, month, day),
                other => other,
            };
            date.zip(at_clock)
                .and_then(|(date, time)| ctx.at_local(date, time))
        }
    };

    resolved.unwrap_or(fallback)
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

pub fn extract_plan(message: &str, ctx: &ExtractionContext) -> PlanDraft {
    let lowered = message.to_lowercase();
    let category = if contains_any(&lowered, &["工作", "work"]) {
        PlanCategory::Work
    } else if contains_any(&lowered, &["健康", "health"]) {
        PlanCategory::Health
    } else if contains_any(&lowered, &["学习", "study", "编程", "programming"]) {
        PlanCategory::Study
    } else {
        PlanCategory::Personal
    };

    let start_date = ctx.local_today();
    PlanDraft {
        title: title_from(message),
        description: message.to_string(),
        category,
        start_date,
        end_date: start_date + Duration::days(PLAN_DAYS),
        status: "active".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

pub fn extract_record(message: &str) -> RecordDraft {
    let lowered = message.to_lowercase();
    let record_type = if contains_any(&lowered, &["语音", "voice"]) {
        RecordType::Voice
    } else if contains_any(&lowered, &["图片", "image"]) {
        RecordType::Image
    } else {
        RecordType::Text
    };

    let mut tags: Vec<String> = ["工作", "生活", "学习", "健康"]
        .iter()
        .filter(|tag| lowered.contains(**tag))
        .map(|tag| tag.to_string())
        .collect();
    if tags.is_empty() {
        tags.push(DEFAULT_TAG.to_string());
    }

    RecordDraft {
        content: message.to_string(),
        record_type,
        tags,
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub fn extract_health(message: &str, ctx: &ExtractionContext) -> HealthDraft {
    let lowered = message.to_lowercase();
    let notes = message.to_string();

    let data = if let Some(activity) = exercise_activity(&lowered) {
        static MINUTES: CachedRegex = OnceLock::new();
        static CALORIES: CachedRegex = OnceLock::new();
        HealthData::Exercise {
            activity: activity.to_string(),
            duration_minutes: first_number(&MINUTES, r"(\d+)\s*(?:分钟|min)", &lowered)
                .unwrap_or(DEFAULT_EXERCISE_MINUTES),
            calories: first_number(&CALORIES, r"(\d+)\s*(?:卡路里|千卡|大卡|kcal)", &lowered)
                .unwrap_or(DEFAULT_EXERCISE_CALORIES),
            notes,
            extra: ExtraAttributes::new(),
        }
    } else if contains_any(&lowered, &["睡眠", "睡觉", "sleep"]) {
        static HOURS: CachedRegex = OnceLock::new();
        let quality = if contains_any(&lowered, &["不好", "很差", "失眠", "poor", "bad"]) {
            "poor"
        } else {
            "good"
        };
        HealthData::Sleep {
            bedtime: "23:00".to_string(),
            wake_time: "07:00".to_string(),
            quality: quality.to_string(),
            hours: first_number(&HOURS, r"(\d+(?:\.\d+)?)\s*(?:个)?(?:小时|hours?)", &lowered),
            notes,
            extra: ExtraAttributes::new(),
        }
    } else if contains_any(&lowered, &["体重", "weight"]) {
        static KG: CachedRegex = OnceLock::new();
        static FAT: CachedRegex = OnceLock::new();
        HealthData::Weight {
            weight_kg: first_number(&KG, r"(\d+(?:\.\d+)?)\s*(?:kg|公斤)", &lowered)
                .unwrap_or(DEFAULT_WEIGHT_KG),
            body_fat: first_number(&FAT, r"(\d+(?:\.\d+)?)\s*%", &lowered)
                .unwrap_or(DEFAULT_BODY_FAT),
            notes,
            extra: ExtraAttributes::new(),
        }
    } else {
        HealthData::General {
            activity: "日常活动".to_string(),
            notes,
            extra: ExtraAttributes::new(),
        }
    };

    HealthDraft {
        data,
        record_date: ctx.local_today(),
    }
}

fn exercise_activity(lowered: &str) -> Option<&'static str> {
    const ACTIVITIES: [(&str, &str); 5] = [
        ("跑步", "跑步"),
        ("running", "跑步"),
        ("游泳", "游泳"),
        ("骑车", "骑车"),
        ("健身", "健身"),
    ];
    if let Some((_, name)) = ACTIVITIES.iter().find(|(cue, _)| lowered.contains(*cue)) {
        return Some(*name);
    }
    contains_any(lowered, &["运动", "exercise"]).then_some("其他运动")
}
