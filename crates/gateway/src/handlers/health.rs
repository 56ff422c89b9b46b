//! Status, health check and metrics handlers

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use crate::AppState;

#[derive(Serialize)]
pub struct RootResponse {
    pub status: &'static str,
    pub message: &'static str,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: &'static str,
    pub chat_model: String,
    pub embed_model: String,
    pub api_key_set: bool,
    pub emotion_enabled: bool,
    pub emotion_model_present: bool,
    pub rag_enabled: bool,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub chat_api_key: CheckResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<CheckResult>,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    fn up(latency_ms: Option<u64>) -> Self {
        Self {
            status: "up".to_string(),
            latency_ms,
            error: None,
        }
    }

    fn down(error: impl Into<String>) -> Self {
        Self {
            status: "down".to_string(),
            latency_ms: None,
            error: Some(error.into()),
        }
    }

    fn is_up(&self) -> bool {
        self.status == "up"
    }
}

/// Banner for `GET /`
pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        status: "ok",
        message: "PetPal backend running. POST /chat to chat.",
    })
}

/// Liveness probe with the effective model setup
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: petpal_common::VERSION,
        chat_model: state.chat.model().to_string(),
        embed_model: state.config.embedding.model.clone(),
        api_key_set: state.chat.has_api_key(),
        emotion_enabled: state.config.emotion.enabled,
        emotion_model_present: state.emotion.model_present(),
        rag_enabled: state.retriever.is_some(),
    })
}

/// Readiness probe - checks all dependencies
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let chat_api_key = if state.chat.has_api_key() {
        CheckResult::up(None)
    } else {
        CheckResult::down("OPENROUTER_API_KEY is not set")
    };

    let database = match &state.database {
        Some(repo) => {
            let start = std::time::Instant::now();
            Some(match repo.ping().await {
                Ok(_) => CheckResult::up(Some(start.elapsed().as_millis() as u64)),
                Err(e) => CheckResult::down(e.to_string()),
            })
        }
        None if state.config.database.url().is_some() => {
            Some(CheckResult::down("database configured but not connected"))
        }
        None => None,
    };

    let all_healthy = chat_api_key.is_up() && database.as_ref().map_or(true, CheckResult::is_up);

    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            status: if all_healthy { "ready" } else { "not_ready" }.to_string(),
            checks: HealthChecks {
                chat_api_key,
                database,
            },
        }),
    )
}

/// Prometheus scrape endpoint
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}
