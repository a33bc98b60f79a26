use crate::actions::{CreatedEntity, OperationResult};
use crate::prompt::truncate_chars;

const RECORD_PREVIEW_CHARS: usize = 30;

/// The block appended to the reply for an operation result.
pub fn outcome_suffix(result: &OperationResult) -> String {
    if !result.success {
        let error = result.error.as_deref().unwrap_or_default();
        return format!("\n\n❌ 操作失败：\n- {}", error);
    }

    let confirmation = match &result.data {
        Some(CreatedEntity::Reminder(reminder)) => format!("已创建提醒：{}", reminder.draft.title),
        Some(CreatedEntity::Plan(plan)) => format!("已创建计划：{}", plan.draft.title),
        Some(CreatedEntity::Record(record)) => format!(
            "已保存记录：{}...",
            truncate_chars(&record.draft.content, RECORD_PREVIEW_CHARS)
        ),
        Some(CreatedEntity::Health(_)) => "已记录健康数据".to_string(),
        None => return "\n\n✅ 操作完成：".to_string(),
    };
    format!("\n\n✅ 操作完成：\n- {}", confirmation)
}

/// Reply text with the outcome block appended. With no result the reply is unchanged.
pub fn compose(reply: &str, result: Option<&OperationResult>) -> String {
    match result {
        Some(result) => format!("{}{}", reply, outcome_suffix(result)),
        None => reply.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::OperationKind;
    use crate::domain::{Record, RecordDraft, RecordType};
    use chrono::Utc;

    fn record_result(content: &str) -> OperationResult {
        OperationResult {
            kind: OperationKind::RecordCreated,
            success: true,
            data: Some(CreatedEntity::Record(Record {
                id: "r1".to_string(),
                user_id: "u1".to_string(),
                draft: RecordDraft {
                    content: content.to_string(),
                    record_type: RecordType::Text,
                    tags: vec!["日常".to_string()],
                },
                created_at: Utc::now(),
            })),
            error: None,
        }
    }

    #[test]
    fn no_result_leaves_reply_untouched() {
        assert_eq!(compose("你好！", None), "你好！");
        assert_eq!(compose("", None), "");
    }

    #[test]
    fn success_appends_confirmation() {
        let composed = compose("好的", Some(&record_result(&"日".repeat(40))));
        assert_eq!(
            composed,
            format!("好的\n\n✅ 操作完成：\n- 已保存记录：{}...", "日".repeat(30))
        );
    }

    #[test]
    fn failure_appends_error() {
        let result = OperationResult {
            kind: OperationKind::ReminderFailed,
            success: false,
            data: None,
            error: Some("创建提醒失败: disk full".to_string()),
        };
        assert_eq!(
            compose("好的", Some(&result)),
            "好的\n\n❌ 操作失败：\n- 创建提醒失败: disk full"
        );
    }
}
