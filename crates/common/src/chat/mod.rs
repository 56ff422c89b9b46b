//! Chat-completion client for the hosted LLM (OpenRouter / OpenAI-compatible)
//!
//! Provides:
//! - Single-shot chat completions
//! - Model catalogue listing with free-tier detection

use crate::config::ChatConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Upstream error bodies are logged up to this many characters
const LOGGED_BODY_CHARS: usize = 500;

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Model catalogue entry
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub pricing: Pricing,

    #[serde(default)]
    pub context_length: Option<u64>,
}

/// Per-token prices; the catalogue sends them as strings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Pricing {
    #[serde(default, deserialize_with = "price")]
    pub prompt: f64,

    #[serde(default, deserialize_with = "price")]
    pub completion: f64,
}

impl ModelInfo {
    /// Free when both prices are zero or the id carries the `:free` tag
    pub fn is_free(&self) -> bool {
        (self.pricing.prompt == 0.0 && self.pricing.completion == 0.0) || self.id.contains(":free")
    }
}

fn price<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
        Null(Option<()>),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n,
        Raw::Text(s) => s.trim().parse().unwrap_or(0.0),
        Raw::Null(_) => 0.0,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ModelsResponse {
    Wrapped { data: Vec<ModelInfo> },
    Bare(Vec<ModelInfo>),
}

/// Client for the chat-completion API
#[derive(Clone)]
pub struct ChatClient {
    client: reqwest::Client,
    api_key: Option<String>,
    api_base: String,
    model: String,
    temperature: Option<f32>,
}

impl ChatClient {
    /// Create a new chat client
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key: config.api_key().map(str::to_string),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    /// Get the model name
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether a credential is configured
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Fail fast when the credential is absent
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            tracing::error!("OPENROUTER_API_KEY is not set");
            AppError::Configuration {
                message: "OpenRouter API key not configured. Set OPENROUTER_API_KEY in .env"
                    .to_string(),
            }
        })
    }

    /// Send the messages and return the first choice's content
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let api_key = self.require_api_key()?;
        let url = format!("{}/chat/completions", self.api_base);

        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                body = %body.chars().take(LOGGED_BODY_CHARS).collect::<String>(),
                "Chat API error"
            );
            metrics::record_upstream_error(status.as_u16());
            return Err(AppError::Upstream {
                status: status.as_u16(),
                message: body,
            });
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| AppError::Upstream {
            status: StatusCode::BAD_GATEWAY.as_u16(),
            message: format!("Failed to parse chat response: {}", e),
        })?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::Upstream {
                status: StatusCode::BAD_GATEWAY.as_u16(),
                message: "Chat response contained no message".to_string(),
            })
    }

    /// Fetch the upstream model catalogue
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let api_key = self.require_api_key()?;
        let url = format!("{}/models", self.api_base);

        let response = self.client.get(&url).bearer_auth(api_key).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream {
                status: status.as_u16(),
                message: body,
            });
        }

        let models = match response.json::<ModelsResponse>().await? {
            ModelsResponse::Wrapped { data } => data,
            ModelsResponse::Bare(models) => models,
        };

        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer, api_key: Option<&str>) -> ChatConfig {
        ChatConfig {
            api_key: api_key.map(str::to_string),
            api_base: format!("{}/api/v1", server.uri()),
            ..ChatConfig::default()
        }
    }

    #[tokio::test]
    async fn test_complete_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(bearer_token("sk-test"))
            .and(body_partial_json(json!({
                "model": crate::DEFAULT_CHAT_MODEL,
                "messages": [{"role": "user", "content": "hi"}],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Hello there!"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatClient::new(&config_for(&server, Some("sk-test"))).unwrap();
        let reply = client.complete(&[ChatMessage::user("hi")]).await.unwrap();

        assert_eq!(reply, "Hello there!");
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_calling_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = ChatClient::new(&config_for(&server, None)).unwrap();
        let err = client.complete(&[ChatMessage::user("hi")]).await.unwrap_err();

        assert!(matches!(err, AppError::Configuration { .. }));
        assert_eq!(err.status_code().as_u16(), 500);
    }

    #[tokio::test]
    async fn test_upstream_error_propagates_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Rate limit exceeded: free-models-per-day"))
            .mount(&server)
            .await;

        let client = ChatClient::new(&config_for(&server, Some("sk-test"))).unwrap();
        let err = client.complete(&[ChatMessage::user("hi")]).await.unwrap_err();

        match err {
            AppError::Upstream { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "Rate limit exceeded: free-models-per-day");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_choices_is_bad_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let client = ChatClient::new(&config_for(&server, Some("sk-test"))).unwrap();
        let err = client.complete(&[ChatMessage::user("hi")]).await.unwrap_err();

        assert_eq!(err.status_code().as_u16(), 502);
    }

    #[tokio::test]
    async fn test_list_models_parses_string_prices() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "mistralai/mistral-small-3.1-24b-instruct:free",
                     "pricing": {"prompt": "0", "completion": "0"}, "context_length": 96000},
                    {"id": "openai/gpt-4o",
                     "pricing": {"prompt": "0.0000025", "completion": "0.00001"}, "context_length": 128000},
                    {"id": "meta/llama-tagged:free",
                     "pricing": {"prompt": "0.1", "completion": "0.1"}}
                ]
            })))
            .mount(&server)
            .await;

        let client = ChatClient::new(&config_for(&server, Some("sk-test"))).unwrap();
        let models = client.list_models().await.unwrap();

        assert_eq!(models.len(), 3);
        assert!(models[0].is_free());
        assert!(!models[1].is_free());
        assert!(models[2].is_free());
        assert_eq!(models[1].context_length, Some(128000));
        assert!(models[2].context_length.is_none());
    }

    #[test]
    fn test_message_constructors() {
        assert_eq!(ChatMessage::system("x").role, "system");
        assert_eq!(ChatMessage::user("y").role, "user");
    }
}
