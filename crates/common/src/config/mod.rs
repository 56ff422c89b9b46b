//! Configuration management for PetPal services
//!
//! Supports loading configuration from:
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Environment variables (prefixed with APP__)
//! - Plain unprefixed variables (OPENROUTER_API_KEY, DATABASE_URL, ...)
//! - Default values

use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Plain environment variables mapped onto configuration keys.
///
/// These win over every other source so an existing `.env` keeps working.
pub const LEGACY_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("OPENROUTER_API_KEY", "chat.api_key"),
    ("OPENROUTER_MODEL", "chat.model"),
    ("OLLAMA_BASE", "embedding.base_url"),
    ("OLLAMA_EMBED_MODEL", "embedding.model"),
    ("DATABASE_URL", "database.url"),
    ("EMOTION_MODEL_DIR", "emotion.model_dir"),
];

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream chat-completion API
    #[serde(default)]
    pub chat: ChatConfig,

    /// Local emotion classifier
    #[serde(default)]
    pub emotion: EmotionConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Document ingestion and chunking
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Retrieval for chat requests
    #[serde(default)]
    pub rag: RagConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Message screening
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Maximum concurrent requests
    pub max_concurrent_requests: usize,

    /// Maximum accepted request body
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Bearer token for the upstream API
    pub api_key: Option<String>,

    /// API base URL (OpenAI-compatible)
    pub api_base: String,

    /// Model identifier
    pub model: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Persona sent as the system message; blank disables it
    pub system_prompt: Option<String>,

    /// Sampling temperature, upstream default when unset
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmotionConfig {
    /// Annotate chat requests with a detected emotion
    pub enabled: bool,

    /// Directory holding config.json, tokenizer.json and the weights
    pub model_dir: PathBuf,

    /// Maximum tokens fed to the classifier
    pub max_length: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding provider: ollama, mock
    pub provider: String,

    /// Embedding server base URL
    pub base_url: String,

    /// Model to use
    pub model: String,

    /// Embedding dimension
    pub dimension: usize,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum retries
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection URL
    pub url: Option<String>,

    /// Maximum number of connections
    pub max_connections: u32,

    /// Minimum number of connections
    pub min_connections: u32,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Directory scanned for source documents
    pub documents_dir: PathBuf,

    /// Window size in characters
    pub chunk_size: usize,

    /// Characters shared between consecutive windows
    pub chunk_overlap: usize,

    /// Shorter chunks are dropped
    pub min_chunk_len: usize,

    /// Extracted text shorter than this is treated as unusable
    pub min_text_len: usize,

    /// Minimum share of readable characters in extracted PDF text
    pub min_readable_ratio: f64,

    /// Log progress every N chunks
    pub progress_every: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RagConfig {
    /// Retrieve document context for chat requests
    pub enabled: bool,

    /// Number of chunks to retrieve
    pub top_k: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Sustained requests per minute for each client address
    pub requests_per_minute: u32,

    /// Burst capacity
    pub burst: u32,

    /// Take the client address from the last `X-Forwarded-For` hop
    /// (one reverse proxy in front of the server)
    pub trust_proxy: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Screen chat messages before they reach the model
    pub enabled: bool,

    /// Lower-case phrases that trigger the supportive refusal
    pub blocked_phrases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    pub log_level: String,

    /// Enable JSON logging
    pub json_logging: bool,

    /// Expose Prometheus metrics at /metrics
    pub metrics_enabled: bool,

    /// Service name used in logs
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8000 }
fn default_request_timeout() -> u64 { 60 }
fn default_max_concurrent() -> usize { 100 }
fn default_max_body_bytes() -> usize { 1024 * 1024 }
fn default_chat_api_base() -> String { "https://openrouter.ai/api/v1".to_string() }
fn default_chat_model() -> String { crate::DEFAULT_CHAT_MODEL.to_string() }
fn default_chat_timeout() -> u64 { 60 }
fn default_system_prompt() -> Option<String> {
    Some(
        "You are PetPal, a warm and supportive companion for pet owners. \
         You are not a therapist or a veterinarian; encourage professional help when appropriate. \
         Keep answers kind, practical and concise."
            .to_string(),
    )
}
fn default_emotion_model_dir() -> PathBuf { PathBuf::from("emotion_classifier/emotion_model") }
fn default_emotion_max_length() -> usize { 128 }
fn default_embedding_provider() -> String { "ollama".to_string() }
fn default_embedding_base_url() -> String { "http://localhost:11434".to_string() }
fn default_embedding_model() -> String { crate::DEFAULT_EMBEDDING_MODEL.to_string() }
fn default_embedding_dimension() -> usize { crate::DEFAULT_EMBEDDING_DIMENSION }
fn default_embedding_timeout() -> u64 { 120 }
fn default_embedding_retries() -> u32 { 3 }
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_documents_dir() -> PathBuf { PathBuf::from("documents") }
fn default_chunk_size() -> usize { 800 }
fn default_chunk_overlap() -> usize { 150 }
fn default_min_chunk_len() -> usize { 150 }
fn default_min_text_len() -> usize { 100 }
fn default_min_readable_ratio() -> f64 { 0.3 }
fn default_progress_every() -> usize { 10 }
fn default_top_k() -> usize { 3 }
fn default_requests_per_minute() -> u32 { 20 }
fn default_burst() -> u32 { 20 }
fn default_log_level() -> String { "info".to_string() }
fn default_service_name() -> String { "petpal".to_string() }

fn default_blocked_phrases() -> Vec<String> {
    [
        "how to kill myself",
        "kill myself",
        "suicide method",
        "how to commit suicide",
        "commit suicide",
        "harm myself",
        "self harm",
        "cut myself",
        "overdose",
        "ways to die",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            max_concurrent_requests: default_max_concurrent(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: default_chat_api_base(),
            model: default_chat_model(),
            timeout_secs: default_chat_timeout(),
            system_prompt: default_system_prompt(),
            temperature: None,
        }
    }
}

impl ChatConfig {
    /// The API key, treating a blank value as unset
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

impl Default for EmotionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_dir: default_emotion_model_dir(),
            max_length: default_emotion_max_length(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl DatabaseConfig {
    /// The connection URL, treating a blank value as unset
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|url| !url.is_empty())
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            documents_dir: default_documents_dir(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_len: default_min_chunk_len(),
            min_text_len: default_min_text_len(),
            min_readable_ratio: default_min_readable_ratio(),
            progress_every: default_progress_every(),
        }
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            top_k: default_top_k(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
            trust_proxy: false,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blocked_phrases: default_blocked_phrases(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: false,
            metrics_enabled: true,
            service_name: default_service_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false));

        with_environment(builder)?.build()?.try_deserialize()
    }

    /// Load from a specific file, still honouring the environment
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder().add_source(File::with_name(path));

        with_environment(builder)?.build()?.try_deserialize()
    }

    /// `--config <path>` when given, the default file lookup otherwise
    pub fn load_with(path: Option<&str>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::load(),
        }
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}

/// Layer `APP__*` variables and then the plain legacy variables on top
fn with_environment(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    // e.g., APP__SERVER__PORT=8001
    let mut builder = builder.add_source(
        Environment::with_prefix("APP")
            .separator("__")
            .try_parsing(true),
    );

    for (var, key) in LEGACY_ENV_OVERRIDES {
        let value = std::env::var(var).ok().filter(|v| !v.trim().is_empty());
        builder = builder.set_override_option(*key, value)?;
    }

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.chat.model, "mistralai/mistral-small-3.1-24b-instruct:free");
        assert_eq!(config.embedding.model, "nomic-embed-text");
        assert_eq!(config.ingestion.chunk_size, 800);
        assert_eq!(config.ingestion.chunk_overlap, 150);
        assert_eq!(config.ingestion.min_chunk_len, 150);
        assert!(!config.rag.enabled);
        assert!(config.database.url().is_none());
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert!(!config.rate_limit.trust_proxy);
    }

    #[test]
    fn test_default_persona() {
        let prompt = ChatConfig::default().system_prompt.unwrap();
        assert!(prompt.starts_with("You are PetPal"));
        assert!(prompt.contains("not a therapist"));
    }

    #[test]
    fn test_blank_api_key_is_unset() {
        let mut chat = ChatConfig::default();
        assert!(chat.api_key().is_none());

        chat.api_key = Some("   ".into());
        assert!(chat.api_key().is_none());

        chat.api_key = Some("sk-or-test".into());
        assert_eq!(chat.api_key(), Some("sk-or-test"));
    }

    #[test]
    fn test_default_blocked_phrases() {
        let safety = SafetyConfig::default();
        assert!(safety.enabled);
        assert!(safety.blocked_phrases.iter().any(|p| p == "kill myself"));
        assert!(safety.blocked_phrases.iter().all(|p| p == &p.to_lowercase()));
    }

    #[test]
    fn test_from_file_fills_missing_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[server]\nport = 9100\n\n[rag]\nenabled = true\ntop_k = 5").unwrap();

        let path = file.path().with_extension("");
        let stem = path.to_str().unwrap();
        let config = AppConfig::load_with(Some(stem)).unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.rag.enabled);
        assert_eq!(config.rag.top_k, 5);
        assert_eq!(config.emotion.max_length, 128);
    }
}
