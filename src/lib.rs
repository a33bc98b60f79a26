pub mod actions;
pub mod compose;
pub mod config;
pub mod context;
pub mod database;
pub mod domain;
pub mod insights;
pub mod intent;
pub mod keywords;
pub mod llm_client;
pub mod memory;
pub mod pipeline;
pub mod prompt;
pub mod runtime;
pub mod server;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;
