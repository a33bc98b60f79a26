//! Keyword-driven intent classification.
//!
//! Classification sees the ranked keyword configs, the user's message and the full reply
//! text. The winning category is then handed to [`extract`] for parameter extraction.

pub mod extract;

use serde::Serialize;

use crate::keywords::{KeywordCategory, KeywordConfig};
use extract::ExtractedParameters;

/// Intent label reported when nothing matched.
pub const GENERAL_CHAT: &str = "general_chat";

/// Order configs by priority (highest first), then by creation time.
///
/// The sort is stable, so configs that tie on both keep their storage order.
pub fn rank_configs(mut configs: Vec<KeywordConfig>) -> Vec<KeywordConfig> {
    configs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    configs
}

/// How a category is chosen from the ranked configs.
pub trait ClassificationPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick at most one config from `ranked`, which is already in priority order.
    fn select<'a>(
        &self,
        ranked: &'a [KeywordConfig],
        message: &str,
        reply: &str,
    ) -> Option<&'a KeywordConfig>;
}

/// The earliest config in rank order with any keyword in the message or the reply.
///
/// Later configs are never consulted even if they also match.
pub struct FirstMatchPolicy;

impl ClassificationPolicy for FirstMatchPolicy {
    fn name(&self) -> &'static str {
        "first_match"
    }

    fn select<'a>(
        &self,
        ranked: &'a [KeywordConfig],
        message: &str,
        reply: &str,
    ) -> Option<&'a KeywordConfig> {
        ranked
            .iter()
            .find(|config| config.matching_keyword(&[message, reply]).is_some())
    }
}

pub struct IntentClassifier {
    policy: Box<dyn ClassificationPolicy>,
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new(Box::new(FirstMatchPolicy))
    }
}

impl IntentClassifier {
    pub fn new(policy: Box<dyn ClassificationPolicy>) -> Self {
        Self { policy }
    }

    /// `None` means general chat: no action is taken.
    pub fn classify(
        &self,
        configs: &[KeywordConfig],
        message: &str,
        reply: &str,
    ) -> Option<KeywordCategory> {
        let ranked = rank_configs(configs.to_vec());
        let selected = self.policy.select(&ranked, message, reply)?;
        tracing::debug!(
            "Intent '{}' via {} (config {}, priority {})",
            selected.category.as_db_str(),
            self.policy.name(),
            selected.id,
            selected.priority
        );
        Some(selected.category)
    }
}

/// The action label a category maps to; growth intents become plans.
pub fn intent_label(category: Option<KeywordCategory>) -> &'static str {
    match category {
        Some(KeywordCategory::Reminder) => "create_reminder",
        Some(KeywordCategory::Plan) | Some(KeywordCategory::Growth) => "create_plan",
        Some(KeywordCategory::Record) => "create_record",
        Some(KeywordCategory::Health) => "record_health",
        None => GENERAL_CHAT,
    }
}

/// A classified request with its extracted parameters. Lives for one request only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentMatch {
    pub category: KeywordCategory,
    pub parameters: ExtractedParameters,
}
