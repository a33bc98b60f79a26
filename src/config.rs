use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    // LLM configuration (OpenAI-compatible chat completions endpoint)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub llm_temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub llm_max_tokens: u32,

    // Per-strategy budgets for the reply fallback chain
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,

    // Budget for each of the four personalization reads
    #[serde(default = "default_context_timeout_millis")]
    pub context_timeout_millis: u64,
    #[serde(default = "default_memory_min_confidence")]
    pub memory_min_confidence: f32,

    // Offset used to interpret clock times and dates in user messages
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,

    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_llm_url() -> String {
    "https://api.deepseek.com".to_string()
}

fn default_llm_model() -> String {
    "deepseek-chat".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_stream_timeout_secs() -> u64 {
    30
}

fn default_completion_timeout_secs() -> u64 {
    30
}

fn default_context_timeout_millis() -> u64 {
    3000
}

fn default_memory_min_confidence() -> f32 {
    0.7
}

fn default_utc_offset_hours() -> i32 {
    8
}

fn default_database_path() -> String {
    "steward.db".to_string()
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_temperature: default_temperature(),
            llm_max_tokens: default_max_tokens(),
            stream_timeout_secs: default_stream_timeout_secs(),
            completion_timeout_secs: default_completion_timeout_secs(),
            context_timeout_millis: default_context_timeout_millis(),
            memory_min_confidence: default_memory_min_confidence(),
            utc_offset_hours: default_utc_offset_hours(),
            database_path: default_database_path(),
        }
    }
}

impl AssistantConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("steward_config.toml")
    }

    /// Load config from steward_config.toml (next to executable), falling back to env vars.
    ///
    /// Environment variables are applied on top of the file so a credential can be
    /// supplied without writing it to disk.
    pub fn load() -> Self {
        let path = Self::config_path();

        let base = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<AssistantConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    Some(config)
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    None
                }
            },
            Err(_) => None,
        };

        match base {
            Some(config) => config.apply_env(),
            None => {
                tracing::warn!("No config file found, using defaults + env vars");
                Self::from_env()
            }
        }
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    fn apply_env(mut self) -> Self {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        let key = env::var("LLM_API_KEY").or_else(|_| env::var("DEEPSEEK_API_KEY"));
        if let Ok(key) = key {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key.trim().to_string());
            }
        }

        if let Ok(secs) = env::var("STEWARD_STREAM_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.stream_timeout_secs = secs;
            }
        }

        if let Ok(secs) = env::var("STEWARD_COMPLETION_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.completion_timeout_secs = secs;
            }
        }

        if let Ok(millis) = env::var("STEWARD_CONTEXT_TIMEOUT_MILLIS") {
            if let Ok(millis) = millis.parse() {
                self.context_timeout_millis = millis;
            }
        }

        if let Ok(hours) = env::var("STEWARD_UTC_OFFSET_HOURS") {
            if let Ok(hours) = hours.parse() {
                self.utc_offset_hours = hours;
            }
        }

        if let Ok(path) = env::var("STEWARD_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        self
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs.max(1))
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs.max(1))
    }

    pub fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_millis.max(1))
    }

    /// Offset for interpreting wall-clock phrases; out-of-range values fall back to UTC.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours.clamp(-23, 23) * 3600)
            .unwrap_or_else(|| Utc.fix())
    }
}
