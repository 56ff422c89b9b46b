//! PetPal Common Library
//!
//! Shared code for the PetPal gateway and ingestion tool including:
//! - Configuration management
//! - Error types and handling
//! - Logging and metrics setup
//! - Chat-completion client for the hosted LLM
//! - Local emotion classifier
//! - Embedding client abstraction
//! - Database models and repository

pub mod chat;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod emotion;
pub mod errors;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use chat::{ChatClient, ChatMessage};
pub use config::AppConfig;
pub use db::{ChunkMatch, DbPool, Repository};
pub use embeddings::Embedder;
pub use emotion::{EmotionService, UNKNOWN_EMOTION};
pub use errors::{AppError, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default chat model served through OpenRouter
pub const DEFAULT_CHAT_MODEL: &str = "mistralai/mistral-small-3.1-24b-instruct:free";

/// Default embedding model served by the local Ollama instance
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

/// Default embedding dimension (nomic-embed-text)
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 768;
