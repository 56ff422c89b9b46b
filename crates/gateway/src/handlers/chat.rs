//! Chat handler

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::rag::{self, Source};
use crate::safety::SUPPORTIVE_REPLY;
use crate::AppState;
use petpal_common::{
    chat::ChatMessage,
    db::ChunkMatch,
    errors::{AppError, Result},
    metrics::{self, ChatMetrics},
    UNKNOWN_EMOTION,
};

/// Chat request
#[derive(Debug, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(length(min = 1))]
    pub message: String,
}

/// Chat response
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_emotion: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blocked: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
}

/// Handle `POST /chat`
pub async fn chat(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>> {
    let timer = ChatMetrics::start();
    let result = respond(&state, payload).await;

    timer.finish(match &result {
        Ok(r) if r.blocked => "blocked",
        Ok(_) => "ok",
        Err(_) => "error",
    });

    result.map(Json)
}

async fn respond(
    state: &AppState,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Result<ChatResponse> {
    let Json(request) =
        payload.map_err(|rejection| rejection_error(rejection, state.config.server.max_body_bytes))?;

    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("message".to_string()),
    })?;

    let message = request.message.as_str();
    if message.trim().is_empty() {
        return Err(AppError::Validation {
            message: "message must not be blank".to_string(),
            field: Some("message".to_string()),
        });
    }

    state.chat.require_api_key()?;

    tracing::info!(len = message.len(), "Chat request");

    if state.safety.is_blocked(message) {
        tracing::warn!("Safety gate blocked message");
        return Ok(ChatResponse {
            response: SUPPORTIVE_REPLY.to_string(),
            detected_emotion: None,
            blocked: true,
            sources: Vec::new(),
        });
    }

    let detected_emotion = detect_emotion(state, message).await;
    let chunks = retrieve_context(state, message).await;

    let messages = build_messages(
        state.config.chat.system_prompt.as_deref(),
        detected_emotion.as_deref(),
        &chunks,
        message,
    );

    let response = state.chat.complete(&messages).await?;

    Ok(ChatResponse {
        response,
        detected_emotion,
        blocked: false,
        sources: chunks.iter().map(Source::from).collect(),
    })
}

/// Classifier failures degrade to a missing label
async fn detect_emotion(state: &AppState, message: &str) -> Option<String> {
    if !state.config.emotion.enabled {
        return None;
    }

    match state.emotion.detect(message).await {
        Ok(label) => {
            metrics::record_emotion(&label);
            Some(label)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Emotion detection failed");
            None
        }
    }
}

/// Retrieval failures degrade to no context
async fn retrieve_context(state: &AppState, message: &str) -> Vec<ChunkMatch> {
    let Some(retriever) = &state.retriever else {
        return Vec::new();
    };

    match retriever.retrieve(message).await {
        Ok(chunks) => chunks,
        Err(e) => {
            tracing::warn!(error = %e, "Context retrieval failed, answering without it");
            Vec::new()
        }
    }
}

/// Compose the upstream conversation. The system message is sent only when
/// there is a configured prompt, a known emotion, or retrieved context.
fn build_messages(
    system_prompt: Option<&str>,
    emotion: Option<&str>,
    chunks: &[ChunkMatch],
    message: &str,
) -> Vec<ChatMessage> {
    let mut system_parts = Vec::new();

    if let Some(prompt) = system_prompt.map(str::trim).filter(|p| !p.is_empty()) {
        system_parts.push(prompt.to_string());
    }

    if let Some(label) = emotion.filter(|l| *l != UNKNOWN_EMOTION) {
        system_parts.push(format!(
            "The user appears to be feeling {}. Respond with that in mind.",
            label
        ));
    }

    if !chunks.is_empty() {
        system_parts.push(rag::context_block(chunks));
    }

    let mut messages = Vec::with_capacity(2);
    if !system_parts.is_empty() {
        messages.push(ChatMessage::system(system_parts.join("\n\n")));
    }
    messages.push(ChatMessage::user(message));
    messages
}

fn rejection_error(rejection: JsonRejection, limit: usize) -> AppError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return AppError::PayloadTooLarge { limit };
    }

    let detail = rejection.body_text();
    if matches!(rejection, JsonRejection::JsonDataError(_)) && detail.contains("missing field `message`") {
        return AppError::MissingField {
            field: "message".to_string(),
        };
    }

    AppError::InvalidFormat { message: detail }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petpal_common::config::AppConfig;
    use uuid::Uuid;

    #[test]
    fn test_plain_message_has_no_system_prompt() {
        let messages = build_messages(None, None, &[], "hello");
        assert_eq!(messages, vec![ChatMessage::user("hello")]);
    }

    #[test]
    fn test_default_config_sends_persona() {
        let config = AppConfig::default();
        let messages = build_messages(config.chat.system_prompt.as_deref(), None, &[], "hi");

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.starts_with("You are PetPal"));
        assert_eq!(messages[1], ChatMessage::user("hi"));
    }

    #[test]
    fn test_blank_system_prompt_is_skipped() {
        let messages = build_messages(Some("  "), None, &[], "hello");
        assert_eq!(messages, vec![ChatMessage::user("hello")]);
    }

    #[test]
    fn test_long_messages_are_valid() {
        let request = ChatRequest {
            message: "a".repeat(40_000),
        };
        assert!(request.validate().is_ok());

        let empty = ChatRequest {
            message: String::new(),
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_unknown_emotion_adds_no_hint() {
        let messages = build_messages(None, Some(UNKNOWN_EMOTION), &[], "hello");
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_system_prompt_combines_parts() {
        let chunks = vec![ChunkMatch {
            chunk_id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            chunk_text: "Puppies sleep 18 hours a day.".to_string(),
            similarity: 0.8,
        }];
        let messages = build_messages(Some("You are PetPal."), Some("sadness"), &chunks, "hi");

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.starts_with("You are PetPal."));
        assert!(messages[0].content.contains("feeling sadness"));
        assert!(messages[0].content.contains("Puppies sleep 18 hours a day."));
        assert_eq!(messages[1], ChatMessage::user("hi"));
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let body = serde_json::to_value(ChatResponse {
            response: "Hi!".to_string(),
            detected_emotion: None,
            blocked: false,
            sources: Vec::new(),
        })
        .unwrap();

        assert_eq!(body, serde_json::json!({"response": "Hi!"}));
    }
}
