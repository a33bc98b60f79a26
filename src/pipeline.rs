//! Per-request chat orchestration.
//!
//! One call to [`ChatPipeline::run`] gathers context, streams the reply, classifies and
//! executes at most one action, and emits the ordered [`StreamEvent`] sequence: zero or
//! more `message` events followed by exactly one terminal `done` or `error`.

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use flume::Sender;
use serde::Serialize;
use std::sync::Arc;

use crate::actions::{ActionExecutor, ActionRecord, OperationResult};
use crate::compose::{compose, outcome_suffix};
use crate::config::AssistantConfig;
use crate::context::ContextAggregator;
use crate::intent::extract::{extract, ExtractionContext};
use crate::intent::{intent_label, IntentClassifier, IntentMatch};
use crate::keywords::KeywordConfigStore;
use crate::llm_client::{canned_category, FallbackChain, Message, ReplyRequest};
use crate::memory::{CompletedTurn, MemoryUpdater};
use crate::prompt::build_messages;
use crate::storage::DomainStore;

/// Error text sent to the caller when no reply could be produced at all.
pub const UNAVAILABLE_MESSAGE: &str = "AI服务暂时不可用";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entities {
    pub intent: String,
    pub content: String,
}

/// An action listed with a canned reply: reported to the caller but never executed.
#[derive(Debug, Clone, Serialize)]
pub struct SuggestedAction {
    #[serde(rename = "type")]
    pub action_type: &'static str,
    pub data: SuggestedData,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuggestedData {
    pub extracted_content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReportedAction {
    Executed(ActionRecord),
    Suggested(SuggestedAction),
}

#[derive(Debug, Clone, Serialize)]
pub struct DonePayload {
    pub actions: Vec<ReportedAction>,
    pub entities: Entities,
    #[serde(rename = "operationResults")]
    pub operation_results: Vec<OperationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Set when `message` events from a failed attempt precede the reply; their
    /// concatenation then no longer equals the final response.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub discarded_partial: bool,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Message { content: String },
    Done(DonePayload),
    Error { message: String },
}

impl StreamEvent {
    /// SSE `event:` name.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Message { .. } => "message",
            StreamEvent::Done(_) => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// SSE `data:` payload.
    pub fn data(&self) -> serde_json::Value {
        match self {
            StreamEvent::Message { content } => serde_json::json!({ "content": content }),
            StreamEvent::Done(payload) => {
                serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
            }
            StreamEvent::Error { message } => serde_json::json!({ "error": message }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Message { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    pub history: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// The composed reply: model text plus any outcome block.
    pub response: String,
    pub done: DonePayload,
}

pub struct ChatPipeline {
    aggregator: ContextAggregator,
    replies: FallbackChain,
    keywords: KeywordConfigStore,
    classifier: IntentClassifier,
    executor: ActionExecutor,
    memory: MemoryUpdater,
    utc_offset: FixedOffset,
    clock: fn() -> DateTime<Utc>,
}

impl ChatPipeline {
    pub fn new(
        store: Arc<dyn DomainStore>,
        replies: FallbackChain,
        memory: MemoryUpdater,
        config: &AssistantConfig,
    ) -> Self {
        Self {
            aggregator: ContextAggregator::new(
                store.clone(),
                config.context_timeout(),
                config.memory_min_confidence,
            ),
            replies,
            keywords: KeywordConfigStore::new(store.clone()),
            classifier: IntentClassifier::default(),
            executor: ActionExecutor::new(store),
            memory,
            utc_offset: config.utc_offset(),
            clock: Utc::now,
        }
    }

    pub fn with_classifier(mut self, classifier: IntentClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Run one chat turn, forwarding events to `events` as they happen.
    ///
    /// Send failures are ignored: a caller that hung up still gets its action executed
    /// and its turn archived. `Err` is returned only when every reply strategy failed,
    /// after the `error` event has been sent.
    pub async fn run(&self, request: &ChatRequest, events: &Sender<StreamEvent>) -> Result<ChatOutcome> {
        let user_id = request.user_id.as_str();
        tracing::debug!("Chat turn for {} ({} chars)", user_id, request.message.chars().count());

        let snapshot = self.aggregator.gather(user_id).await;
        let messages = build_messages(&snapshot, &request.history, &request.message);

        let forward = |delta: &str| {
            let _ = events.send(StreamEvent::Message {
                content: delta.to_string(),
            });
        };
        let reply = match self
            .replies
            .run(
                ReplyRequest {
                    messages: &messages,
                    user_message: &request.message,
                },
                &forward,
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("No reply for {}: {:#}", user_id, e);
                let _ = events.send(StreamEvent::Error {
                    message: UNAVAILABLE_MESSAGE.to_string(),
                });
                return Err(e);
            }
        };

        let now = (self.clock)();
        let mut actions = Vec::new();
        let mut operation_results = Vec::new();

        let category = if reply.canned {
            let category = canned_category(&request.message);
            if let Some(category) = category {
                actions.push(ReportedAction::Suggested(SuggestedAction {
                    action_type: intent_label(Some(category)),
                    data: SuggestedData {
                        extracted_content: request.message.clone(),
                    },
                }));
            }
            category
        } else {
            let configs = self.keywords.active_configs(user_id).await;
            let category = self
                .classifier
                .classify(&configs, &request.message, &reply.text);
            if let Some(category) = category {
                let ctx = ExtractionContext::new(now, self.utc_offset);
                let intent = IntentMatch {
                    category,
                    parameters: extract(category, &request.message, &ctx),
                };
                let outcome = self.executor.execute(user_id, &intent).await;
                actions.extend(outcome.action.map(ReportedAction::Executed));
                operation_results.push(outcome.result);
            }
            category
        };

        let response = compose(&reply.text, operation_results.first());
        if let Some(result) = operation_results.first() {
            let _ = events.send(StreamEvent::Message {
                content: outcome_suffix(result),
            });
        }

        let entities = Entities {
            intent: intent_label(category).to_string(),
            content: request.message.clone(),
        };
        let done = DonePayload {
            actions,
            entities: entities.clone(),
            operation_results,
            warning: reply.warning,
            discarded_partial: reply.discarded_partial,
        };
        let _ = events.send(StreamEvent::Done(done.clone()));

        if reply.canned {
            tracing::debug!("Canned reply for {}; turn not archived", user_id);
        } else {
            self.memory.submit(CompletedTurn {
                user_id: user_id.to_string(),
                message: request.message.clone(),
                response: response.clone(),
                intent: Some(entities.intent),
                completed_at: now,
            });
        }

        Ok(ChatOutcome { response, done })
    }
}
