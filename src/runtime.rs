use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::config::AssistantConfig;
use crate::database::AssistantDatabase;
use crate::intent::IntentClassifier;
use crate::llm_client::{FallbackChain, LlmClient};
use crate::memory::MemoryUpdater;
use crate::pipeline::ChatPipeline;
use crate::storage::DomainStore;

pub struct BackendRuntime {
    pub config: AssistantConfig,
    pub db: Arc<AssistantDatabase>,
    pub pipeline: Arc<ChatPipeline>,
    pub memory_worker: JoinHandle<()>,
}

pub struct BackendRuntimeBuilder {
    config: AssistantConfig,
    store: Option<Arc<dyn DomainStore>>,
    classifier: Option<IntentClassifier>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: AssistantConfig) -> Self {
        Self {
            config,
            store: None,
            classifier: None,
        }
    }

    /// Serve the chat pipeline from another store; management routes still use the database.
    pub fn with_store(mut self, store: Arc<dyn DomainStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_classifier(mut self, classifier: IntentClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Must be called inside a tokio runtime: the memory worker is spawned here.
    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;
        let db = Arc::new(
            AssistantDatabase::new(&config.database_path).with_context(|| {
                format!("Failed to open database at {}", config.database_path)
            })?,
        );
        let store: Arc<dyn DomainStore> = match self.store {
            Some(store) => store,
            None => db.clone(),
        };

        let client = Arc::new(LlmClient::from_config(&config));
        if client.has_credential() {
            tracing::info!("Model endpoint: {} ({})", config.llm_api_url, config.llm_model);
        } else {
            tracing::warn!("No LLM API key configured; replies will use canned fallbacks");
        }
        let replies = FallbackChain::standard(client, &config);
        tracing::info!("Reply strategies: {:?}", replies.strategy_names());

        let (memory, memory_worker) = MemoryUpdater::spawn(store.clone());
        let mut pipeline = ChatPipeline::new(store, replies, memory, &config);
        if let Some(classifier) = self.classifier {
            pipeline = pipeline.with_classifier(classifier);
        }

        Ok(BackendRuntime {
            config,
            db,
            pipeline: Arc::new(pipeline),
            memory_worker,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: AssistantConfig) -> Result<Self> {
        BackendRuntimeBuilder::new(config).build()
    }
}
