//! PetPal API Gateway
//!
//! The HTTP entry point for the PetPal chat frontend.
//! Handles:
//! - Chat forwarding to the hosted LLM
//! - Emotion tagging and optional document context
//! - Rate limiting and the safety gate
//! - Observability (logging, metrics)

mod handlers;
mod middleware;
mod rag;
mod safety;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use petpal_common::{
    chat::ChatClient,
    config::AppConfig,
    db::{DbPool, Repository},
    embeddings::create_embedder,
    emotion::EmotionService,
    errors::AppError,
    logging, metrics,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::{limit::ConcurrencyLimitLayer, ServiceBuilder};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::middleware::rate_limit::{rate_limit_middleware, RateLimitState};
use crate::rag::Retriever;
use crate::safety::SafetyGate;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub chat: ChatClient,
    pub emotion: Arc<EmotionService>,
    pub safety: Arc<SafetyGate>,
    pub database: Option<Repository>,
    pub retriever: Option<Retriever>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Build the state without touching the network
    pub fn new(config: Arc<AppConfig>) -> Result<Self, AppError> {
        Ok(Self {
            chat: ChatClient::new(&config.chat)?,
            emotion: Arc::new(EmotionService::new(&config.emotion)),
            safety: Arc::new(SafetyGate::new(&config.safety)),
            database: None,
            retriever: None,
            metrics: None,
            config,
        })
    }
}

#[derive(Parser)]
#[command(name = "gateway", version, about = "PetPal chat backend")]
struct Cli {
    /// Configuration file to load instead of config/default
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,

    /// List the models offered by the chat API
    Models {
        /// Only show free models
        #[arg(long)]
        free: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Load configuration
    let config = AppConfig::load_with(cli.config.as_deref())?;

    logging::init(&config.observability);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Models { free } => list_models(&config, free).await,
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    info!("Starting PetPal API Gateway v{}", petpal_common::VERSION);

    let config = Arc::new(config);
    let mut state = AppState::new(config.clone())?;

    if !state.chat.has_api_key() {
        warn!("OPENROUTER_API_KEY is not set; /chat will answer 500");
    }

    if config.emotion.enabled && !state.emotion.model_present() {
        warn!(
            model_dir = %config.emotion.model_dir.display(),
            "Emotion model not found; detected_emotion will be \"unknown\""
        );
    }

    // Initialize metrics
    if config.observability.metrics_enabled {
        state.metrics = Some(install_metrics_recorder()?);
        metrics::register_metrics();
    }

    // Database is optional; without RAG a failed connection only shows up in /ready
    if config.database.url().is_some() {
        match DbPool::new(&config.database).await {
            Ok(db) => state.database = Some(Repository::new(db)),
            Err(e) if config.rag.enabled => return Err(e.into()),
            Err(e) => warn!(error = %e, "Database unavailable"),
        }
    }

    // Initialize retrieval
    if config.rag.enabled {
        match &state.database {
            Some(repo) => {
                let embedder = create_embedder(&config.embedding)?;
                state.retriever = Some(Retriever::new(embedder, repo.clone(), config.rag.top_k));
                info!(top_k = config.rag.top_k, "Document context enabled");
            }
            None => {
                warn!("rag.enabled is set but no database URL is configured; answering without context");
            }
        }
    }

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Print the chat API's model catalogue
async fn list_models(config: &AppConfig, free_only: bool) -> anyhow::Result<()> {
    let client = ChatClient::new(&config.chat)?;
    if !client.has_api_key() {
        eprintln!("OPENROUTER_API_KEY not set. Add it to .env");
        std::process::exit(1);
    }

    let mut models = client.list_models().await?;
    if free_only {
        models.retain(|m| m.is_free());
    }

    println!(
        "{} models{}:\n",
        models.len(),
        if free_only { " (free only)" } else { "" }
    );

    for model in &models {
        let price = if model.is_free() {
            "FREE".to_string()
        } else {
            format!("${}/{}", model.pricing.prompt, model.pricing.completion)
        };
        let context = model
            .context_length
            .map(|c| c.to_string())
            .unwrap_or_else(|| "?".to_string());

        println!("  {}  |  {}  |  ctx: {}", model.id, price, context);
    }

    println!("\nSet OPENROUTER_MODEL in .env to one of the IDs above.");
    Ok(())
}

fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_chat_duration_seconds", metrics::METRICS_PREFIX)),
            metrics::CHAT_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_embedding_duration_seconds", metrics::METRICS_PREFIX)),
            metrics::EMBEDDING_BUCKETS,
        )?
        .install_recorder()?;

    Ok(handle)
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    let server = &state.config.server;
    let request_timeout = state.config.request_timeout();

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut chat_routes = Router::new().route("/chat", post(handlers::chat::chat));
    if state.config.rate_limit.enabled {
        chat_routes = chat_routes.route_layer(axum::middleware::from_fn_with_state(
            RateLimitState::new(&state.config.rate_limit),
            rate_limit_middleware,
        ));
    }

    let mut app = Router::new()
        .route("/", get(handlers::health::root))
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .merge(chat_routes);

    if state.metrics.is_some() {
        app = app.route("/metrics", get(handlers::health::metrics));
    }

    app.layer(
        ServiceBuilder::new()
            // Request ID propagation
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            // Request timeout
            .layer(TimeoutLayer::new(request_timeout))
            // Concurrency limit for backpressure
            .layer(ConcurrencyLimitLayer::new(server.max_concurrent_requests)),
    )
    // Oversized bodies are rejected by the JSON extractor as 413
    .layer(DefaultBodyLimit::max(server.max_body_bytes))
    .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{header, Request, StatusCode};
    use petpal_common::config::{ChatConfig, EmotionConfig, RateLimitConfig};
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use tower::ServiceExt;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(api_base: &str, api_key: Option<&str>) -> AppConfig {
        let mut config = AppConfig::default();
        config.chat = ChatConfig {
            api_key: api_key.map(str::to_string),
            api_base: api_base.to_string(),
            ..ChatConfig::default()
        };
        config.emotion = EmotionConfig {
            model_dir: PathBuf::from("/nonexistent/emotion_model"),
            ..EmotionConfig::default()
        };
        config
    }

    fn app_for(config: AppConfig) -> Router {
        create_router(AppState::new(Arc::new(config)).unwrap())
    }

    fn chat_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn chat_request_from(ip: [u8; 4], body: &str) -> Request<Body> {
        let mut request = chat_request(body);
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 50000))));
        request
    }

    async fn json_body(res: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn upstream_replying(status: u16, body: Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_root_banner() {
        let app = app_for(test_config("http://127.0.0.1:1", None));
        let res = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            json_body(res).await,
            json!({"status": "ok", "message": "PetPal backend running. POST /chat to chat."})
        );
    }

    #[tokio::test]
    async fn test_chat_success_with_unknown_emotion() {
        let server = upstream_replying(
            200,
            json!({"choices": [{"message": {"role": "assistant", "content": "Woof! Hello!"}}]}),
        )
        .await;
        let app = app_for(test_config(&server.uri(), Some("sk-test")));

        let res = app.oneshot(chat_request(r#"{"message": "Hi PetPal"}"#)).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["response"], "Woof! Hello!");
        assert_eq!(body["detected_emotion"], "unknown");
        assert!(body.get("blocked").is_none());
        assert!(body.get("sources").is_none());
    }

    #[tokio::test]
    async fn test_chat_without_emotion_field_when_disabled() {
        let server = upstream_replying(
            200,
            json!({"choices": [{"message": {"content": "Meow."}}]}),
        )
        .await;
        let mut config = test_config(&server.uri(), Some("sk-test"));
        config.emotion.enabled = false;

        let res = app_for(config)
            .oneshot(chat_request(r#"{"message": "Hi"}"#))
            .await
            .unwrap();

        assert_eq!(json_body(res).await, json!({"response": "Meow."}));
    }

    #[tokio::test]
    async fn test_chat_missing_key_is_500() {
        let app = app_for(test_config("http://127.0.0.1:1", None));

        let res = app.oneshot(chat_request(r#"{"message": "Hi"}"#)).await.unwrap();

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(res).await;
        assert_eq!(body["error"]["code"], "CONFIGURATION_ERROR");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("OpenRouter API key not configured"));
    }

    #[tokio::test]
    async fn test_chat_upstream_status_passthrough() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(402).set_body_string("Insufficient credits"))
            .mount(&server)
            .await;
        let app = app_for(test_config(&server.uri(), Some("sk-test")));

        let res = app.oneshot(chat_request(r#"{"message": "Hi"}"#)).await.unwrap();

        assert_eq!(res.status(), StatusCode::PAYMENT_REQUIRED);
        let body = json_body(res).await;
        assert_eq!(body["error"]["code"], "UPSTREAM_ERROR");
        assert_eq!(body["error"]["message"], "Insufficient credits");
    }

    #[tokio::test]
    async fn test_chat_rejects_bad_bodies() {
        let app = app_for(test_config("http://127.0.0.1:1", Some("sk-test")));

        for body in [r#"{"message": "   "}"#, r#"{"message": ""}"#, r#"{}"#, "not json", r#"{"message": 5}"#] {
            let res = app.clone().oneshot(chat_request(body)).await.unwrap();
            assert_eq!(res.status(), StatusCode::BAD_REQUEST, "body: {body}");
        }
    }

    #[tokio::test]
    async fn test_chat_blocked_message_skips_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let app = app_for(test_config(&server.uri(), Some("sk-test")));

        let res = app
            .oneshot(chat_request(r#"{"message": "Tell me how to KILL MYSELF"}"#))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["blocked"], true);
        assert_eq!(body["response"], safety::SUPPORTIVE_REPLY);
    }

    #[tokio::test]
    async fn test_chat_rate_limited_per_client() {
        let server = upstream_replying(
            200,
            json!({"choices": [{"message": {"content": "ok"}}]}),
        )
        .await;
        let mut config = test_config(&server.uri(), Some("sk-test"));
        config.rate_limit = RateLimitConfig {
            enabled: true,
            requests_per_minute: 1,
            burst: 1,
            trust_proxy: false,
        };
        let app = app_for(config);

        let first = app
            .clone()
            .oneshot(chat_request_from([10, 0, 0, 1], r#"{"message": "Hi"}"#))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .clone()
            .oneshot(chat_request_from([10, 0, 0, 1], r#"{"message": "Hi"}"#))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(second).await["error"]["code"], "RATE_LIMITED");

        let other = app
            .oneshot(chat_request_from([10, 0, 0, 2], r#"{"message": "Hi"}"#))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_chat_body_over_limit_is_413() {
        let mut config = test_config("http://127.0.0.1:1", Some("sk-test"));
        config.server.max_body_bytes = 64;
        let app = app_for(config);
        let body = json!({"message": "woof ".repeat(40)}).to_string();

        let res = app.clone().oneshot(chat_request(&body)).await.unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json_body(res).await["error"]["code"], "PAYLOAD_TOO_LARGE");

        // declared length over the limit gets the same JSON error
        let mut request = chat_request(&body);
        request
            .headers_mut()
            .insert(header::CONTENT_LENGTH, body.len().into());
        let res = app.oneshot(request).await.unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json_body(res).await["error"]["code"], "PAYLOAD_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_chat_accepts_long_message() {
        let server = upstream_replying(
            200,
            json!({"choices": [{"message": {"content": "That is a lot!"}}]}),
        )
        .await;
        let app = app_for(test_config(&server.uri(), Some("sk-test")));
        let body = json!({"message": "a".repeat(40_000)}).to_string();

        let res = app.oneshot(chat_request(&body)).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["response"], "That is a lot!");
    }

    #[tokio::test]
    async fn test_chat_sends_default_persona() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("You are PetPal"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"choices": [{"message": {"content": "Hello!"}}]})),
            )
            .expect(1)
            .mount(&server)
            .await;
        let app = app_for(test_config(&server.uri(), Some("sk-test")));

        let res = app.oneshot(chat_request(r#"{"message": "Hi"}"#)).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_setup() {
        let app = app_for(test_config("http://127.0.0.1:1", None));
        let res = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = json_body(res).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["api_key_set"], false);
        assert_eq!(body["emotion_model_present"], false);
        assert_eq!(body["rag_enabled"], false);
        assert_eq!(body["chat_model"], petpal_common::DEFAULT_CHAT_MODEL);
    }

    #[tokio::test]
    async fn test_ready_requires_api_key() {
        let app = app_for(test_config("http://127.0.0.1:1", None));
        let res = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(res).await["checks"]["chat_api_key"]["status"], "down");
    }

    #[tokio::test]
    async fn test_ready_reports_unconnected_database() {
        let mut config = test_config("http://127.0.0.1:1", Some("sk-test"));
        config.database.url = Some("postgres://petpal@127.0.0.1:1/petpal".to_string());
        let app = app_for(config);

        let res = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(res).await;
        assert_eq!(body["checks"]["chat_api_key"]["status"], "up");
        assert_eq!(body["checks"]["database"]["status"], "down");
    }

    #[tokio::test]
    async fn test_ready_without_database() {
        let app = app_for(test_config("http://127.0.0.1:1", Some("sk-test")));
        let res = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert!(json_body(res).await["checks"].get("database").is_none());
    }

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let app = app_for(test_config("http://127.0.0.1:1", None));
        let res = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(res.headers().contains_key("x-request-id"));
    }

    #[test]
    fn test_cli_defaults_to_serve() {
        let cli = Cli::try_parse_from(["gateway"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["gateway", "models", "--free"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Models { free: true })));

        let cli = Cli::try_parse_from(["gateway", "serve", "--config", "config/prod"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("config/prod"));
    }
}
