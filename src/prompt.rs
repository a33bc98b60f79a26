use serde_json::Value;

use crate::context::{ContextSnapshot, UserProfile};
use crate::llm_client::Message;
use crate::memory::MemoryKind;

pub const ROLE_PREAMBLE: &str =
    "你是一个智能的个人生活助手，专门帮助用户管理日常生活、健康、学习和工作。";
pub const CLOSING_INSTRUCTION: &str =
    "请基于这些信息提供个性化和有针对性的回答，记住用户的偏好和历史对话内容。";

const PROMPT_TURN_LIMIT: usize = 3;
const PROMPT_INSIGHT_LIMIT: usize = 5;
const MEMORIES_PER_TYPE: usize = 2;
const MEMORY_VALUE_CHARS: usize = 100;

/// Render the system prompt for a snapshot. Sections with nothing to say are left out.
pub fn build_system_prompt(snapshot: &ContextSnapshot) -> String {
    let mut prompt = ROLE_PREAMBLE.to_string();

    if !snapshot.conversation_history.is_empty() {
        prompt.push_str("\n\n最近的对话历史：");
        for turn in snapshot.conversation_history.iter().take(PROMPT_TURN_LIMIT) {
            prompt.push_str(&format!(
                "\n- 用户: {}\n- 助手: {}",
                turn.message, turn.response
            ));
        }
    }

    let profile_lines = profile_lines(&snapshot.profile);
    if !profile_lines.is_empty() {
        prompt.push_str("\n\n用户档案信息：");
        for line in profile_lines {
            prompt.push_str("\n- ");
            prompt.push_str(&line);
        }
    }

    if !snapshot.insights.is_empty() {
        prompt.push_str("\n\n最近的数据洞察：");
        for insight in snapshot.insights.iter().take(PROMPT_INSIGHT_LIMIT) {
            prompt.push_str(&format!("\n- {}: {}", insight.title, insight.description));
        }
    }

    if !snapshot.memories.is_empty() {
        prompt.push_str("\n\n用户记忆：");
        for kind in MemoryKind::ALL {
            let of_kind: Vec<_> = snapshot
                .memories
                .iter()
                .filter(|m| m.value.kind() == kind)
                .take(MEMORIES_PER_TYPE)
                .collect();
            if of_kind.is_empty() {
                continue;
            }
            prompt.push_str(&format!("\n- {}:", kind.as_db_str()));
            for memory in of_kind {
                let rendered = serde_json::to_string(memory.value.detail())
                    .unwrap_or_else(|_| memory.value.detail().summary.clone());
                prompt.push_str(&format!(
                    "\n  * {}: {}",
                    memory.key,
                    truncate_chars(&rendered, MEMORY_VALUE_CHARS)
                ));
            }
        }
    }

    prompt.push_str("\n\n");
    prompt.push_str(CLOSING_INSTRUCTION);
    prompt
}

/// The full message list: system prompt, stored turns oldest first, caller history,
/// then the current message.
pub fn build_messages(
    snapshot: &ContextSnapshot,
    history: &[Message],
    current_message: &str,
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(2 + snapshot.conversation_history.len() * 2 + history.len());
    messages.push(Message::system(build_system_prompt(snapshot)));

    for turn in snapshot.conversation_history.iter().rev() {
        messages.push(Message::user(turn.message.clone()));
        messages.push(Message::assistant(turn.response.clone()));
    }

    messages.extend(history.iter().cloned());
    messages.push(Message::user(current_message));
    messages
}

/// `key: json` for each non-empty profile section, in declaration order.
fn profile_lines(profile: &UserProfile) -> Vec<String> {
    let Ok(Value::Object(sections)) = serde_json::to_value(profile) else {
        return Vec::new();
    };

    const ORDER: [&str; 7] = [
        "basic_info",
        "preferences",
        "habits",
        "goals",
        "active_plans",
        "recent_records",
        "health_data",
    ];

    ORDER
        .iter()
        .filter_map(|key| {
            let value = sections.get(*key)?;
            let empty = match value {
                Value::Null => true,
                Value::Object(map) => map.is_empty(),
                Value::Array(items) => items.is_empty(),
                _ => false,
            };
            if empty {
                return None;
            }
            Some(format!("{}: {}", key, value))
        })
        .collect()
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PriorTurn;
    use crate::insights::{Insight, InsightType};
    use crate::memory::{Memory, MemoryDetail, MemoryValue};
    use chrono::Utc;

    fn memory(key: &str, value: MemoryValue) -> Memory {
        Memory {
            id: key.to_string(),
            user_id: "u1".to_string(),
            key: key.to_string(),
            value,
            confidence: 0.9,
            source: "conversation".to_string(),
            updated_at: Utc::now(),
        }
    }

    fn turn(message: &str, response: &str) -> PriorTurn {
        PriorTurn {
            message: message.to_string(),
            response: response.to_string(),
            intent: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn empty_snapshot_renders_preamble_and_closing_only() {
        let prompt = build_system_prompt(&ContextSnapshot::default());
        assert_eq!(prompt, format!("{}\n\n{}", ROLE_PREAMBLE, CLOSING_INSTRUCTION));
    }

    #[test]
    fn renders_sections_in_fixed_order_with_limits() {
        let mut snapshot = ContextSnapshot::default();
        snapshot.conversation_history = (0..5).map(|i| turn(&format!("m{}", i), "r")).collect();
        snapshot.profile.goals.insert("user_goal".to_string(), serde_json::json!("减重"));
        snapshot.insights = vec![Insight {
            id: "i1".to_string(),
            user_id: "u1".to_string(),
            insight_type: InsightType::Trend,
            category: "records".to_string(),
            title: "记录活跃度很高".to_string(),
            description: "保持".to_string(),
            data: serde_json::json!({}),
            generated_at: Utc::now(),
            expires_at: None,
            is_active: true,
        }];
        snapshot.memories = vec![
            memory("g1", MemoryValue::Goal(MemoryDetail::new("a"))),
            memory("p1", MemoryValue::Preference(MemoryDetail::new("b"))),
            memory("p2", MemoryValue::Preference(MemoryDetail::new("c"))),
            memory("p3", MemoryValue::Preference(MemoryDetail::new("d"))),
        ];

        let prompt = build_system_prompt(&snapshot);
        assert!(prompt.contains("- 用户: m2"));
        assert!(!prompt.contains("- 用户: m3"));
        assert!(prompt.contains("\n- goals: {\"user_goal\":\"减重\"}"));
        assert!(!prompt.contains("preferences:"));
        assert!(prompt.contains("- 记录活跃度很高: 保持"));

        let history = prompt.find("最近的对话历史").unwrap();
        let profile = prompt.find("用户档案信息").unwrap();
        let insights = prompt.find("最近的数据洞察").unwrap();
        let memories = prompt.find("用户记忆").unwrap();
        assert!(history < profile && profile < insights && insights < memories);

        let preference = prompt.find("- preference:").unwrap();
        let goal = prompt.find("- goal:").unwrap();
        assert!(preference < goal);
        assert!(prompt.contains("* p2"));
        assert!(!prompt.contains("* p3"));
        assert!(prompt.ends_with(CLOSING_INSTRUCTION));
    }

    #[test]
    fn long_memory_values_are_cut_by_characters() {
        let mut snapshot = ContextSnapshot::default();
        snapshot.memories = vec![memory(
            "habit",
            MemoryValue::Habit(MemoryDetail::new("跑".repeat(300))),
        )];
        let prompt = build_system_prompt(&snapshot);
        let line = prompt
            .lines()
            .find(|l| l.starts_with("  * habit: "))
            .unwrap();
        assert_eq!(line.trim_start_matches("  * habit: ").chars().count(), 100);
    }

    #[test]
    fn messages_put_stored_turns_oldest_first_before_caller_history() {
        let mut snapshot = ContextSnapshot::default();
        snapshot.conversation_history = vec![turn("newer", "r2"), turn("older", "r1")];
        let history = vec![Message::user("from client")];

        let messages = build_messages(&snapshot, &history, "now");
        let contents: Vec<_> = messages.iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["older", "r1", "newer", "r2", "from client", "now"]
        );
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages.last().unwrap().role, "user");
    }
}
