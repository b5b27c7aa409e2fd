use crate::auth::TokenCache;
use crate::cli::AppConfig;
use crate::message_tracing::MessageTracer;
use crate::models::{
    ChatCompletionRequest, ImageData, ImageGenerationRequest, ImageGenerationResponse, ModelList, TokenCheckRequest,
    TokenCheckResponse, VideoGenerationRequest, VideoGenerationResponse,
};
use crate::orchestrator::Orchestrator;
use crate::providers::{GlmClient, ProviderError};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router as AxumRouter,
};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Application state shared across handlers
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub message_tracer: Arc<MessageTracer>,
    pub models: Vec<String>,
}

impl AppState {
    /// Wire the vendor client, token cache and orchestrator from config
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let client = Arc::new(GlmClient::new(&config.upstream)?);
        let tokens = TokenCache::new(client.clone(), config.upstream.token_ttl());
        Ok(Self {
            orchestrator: Orchestrator::new(config, client, tokens)?,
            message_tracer: Arc::new(MessageTracer::new(config.server.tracing.clone())),
            models: config.models.clone(),
        })
    }
}

/// HTTP routes of the relay
pub fn app(state: Arc<AppState>) -> AxumRouter {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    AxumRouter::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/models", get(get_models))
        .route("/v1/images/generations", post(handle_image_generations))
        .route("/v1/videos/generations", post(handle_video_generations))
        .route("/token/check", post(handle_token_check))
        .route("/health", get(health_check))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(config: AppConfig) -> anyhow::Result<()> {
    let state = Arc::new(
        AppState::from_config(&config)
            .map_err(|e| anyhow::anyhow!("Failed to initialize upstream client: {}", e))?,
    );
    info!("📦 Serving {} models", state.models.len());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🚀 Server listening on {}", addr);

    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Pick one refresh token from `Authorization: Bearer t1,t2,...`
fn refresh_token(headers: &HeaderMap) -> Result<String, AppError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".to_string()))?;

    let value = value.trim();
    let value = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value);
    let tokens: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    tokens
        .choose(&mut rand::thread_rng())
        .map(|t| t.to_string())
        .ok_or_else(|| AppError::Unauthorized("No refresh token in Authorization header".to_string()))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "glm-relay"
    }))
}

async fn get_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList::from_ids(&state.models))
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let refresh_token = refresh_token(&headers)?;
    let Json(request) = payload?;
    if request.messages.is_empty() {
        return Err(AppError::BadRequest("messages must not be empty".to_string()));
    }

    let start_time = Instant::now();
    let tracer = state.message_tracer.clone();
    let trace_id = tracer.new_trace_id();
    tracer.trace_request(&trace_id, &request);

    if request.is_stream() {
        let relay = match state.orchestrator.create_completion_stream(&request, &refresh_token).await {
            Ok(relay) => relay,
            Err(e) => {
                tracer.trace_error(&trace_id, &e.to_string());
                return Err(e.into());
            }
        };
        let relay = relay.on_complete(move |outcome| {
            let latency_ms = start_time.elapsed().as_millis() as u64;
            tracer.trace_response(&trace_id, &outcome.content, &outcome.usage, latency_ms);
        });

        return Ok((
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
                (header::CONNECTION, "keep-alive"),
            ],
            Body::from_stream(relay),
        )
            .into_response());
    }

    match state.orchestrator.create_completion(&request, &refresh_token).await {
        Ok(completion) => {
            let latency_ms = start_time.elapsed().as_millis() as u64;
            info!(
                "📊 {} {}ms {}tok",
                request.model, latency_ms, completion.usage.completion_tokens
            );
            if let Some(choice) = completion.choices.first() {
                tracer.trace_response(&trace_id, &choice.message.content, &completion.usage, latency_ms);
            }
            Ok(Json(completion).into_response())
        }
        Err(e) => {
            tracer.trace_error(&trace_id, &e.to_string());
            Err(e.into())
        }
    }
}

async fn handle_image_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ImageGenerationRequest>, JsonRejection>,
) -> Result<Json<ImageGenerationResponse>, AppError> {
    let refresh_token = refresh_token(&headers)?;
    let Json(request) = payload?;
    if request.prompt.trim().is_empty() {
        return Err(AppError::BadRequest("prompt must not be empty".to_string()));
    }

    let urls = state
        .orchestrator
        .generate_images(request.model.as_deref(), &request.prompt, &refresh_token)
        .await?;
    Ok(Json(ImageGenerationResponse {
        created: chrono::Utc::now().timestamp(),
        data: urls.into_iter().map(|url| ImageData { url }).collect(),
    }))
}

async fn handle_video_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<VideoGenerationRequest>, JsonRejection>,
) -> Result<Json<VideoGenerationResponse>, AppError> {
    let refresh_token = refresh_token(&headers)?;
    let Json(request) = payload?;
    if request.prompt.trim().is_empty() {
        return Err(AppError::BadRequest("prompt must not be empty".to_string()));
    }
    if request.audio_id.as_deref().is_some_and(|id| !id.contains('-')) {
        return Err(AppError::BadRequest("audio_id must look like <key>-<id>".to_string()));
    }

    let data = state.orchestrator.generate_videos(&request, &refresh_token).await?;
    Ok(Json(VideoGenerationResponse {
        created: chrono::Utc::now().timestamp(),
        data,
    }))
}

async fn handle_token_check(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TokenCheckRequest>, JsonRejection>,
) -> Result<Json<TokenCheckResponse>, AppError> {
    let Json(request) = payload?;
    let live = state.orchestrator.tokens().is_live(&request.token).await;
    Ok(Json(TokenCheckResponse { live }))
}

/// Application error types
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Provider(ProviderError),
}

impl From<ProviderError> for AppError {
    fn from(e: ProviderError) -> Self {
        AppError::Provider(e)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", "invalid_request"),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "authentication_error", "missing_token"),
            AppError::Provider(e) => match e {
                ProviderError::FileInvalid(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", "file_invalid"),
                ProviderError::ContentFiltered => (StatusCode::BAD_REQUEST, "invalid_request_error", "content_filtered"),
                ProviderError::UpstreamAuth(_) => (StatusCode::UNAUTHORIZED, "authentication_error", "upstream_auth"),
                e if e.is_auth_failure() => (StatusCode::UNAUTHORIZED, "authentication_error", "upstream_auth"),
                e if e.is_timeout() => (StatusCode::GATEWAY_TIMEOUT, "upstream_error", "timeout"),
                ProviderError::MalformedStream(_) => (StatusCode::BAD_GATEWAY, "upstream_error", "malformed_stream"),
                ProviderError::GenerationFailed(_) => (StatusCode::BAD_GATEWAY, "upstream_error", "generation_failed"),
                _ => (StatusCode::BAD_GATEWAY, "upstream_error", "upstream_request_failed"),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, code) = self.parts();
        if status.is_server_error() {
            warn!("⚠️ Request failed: {}", self);
        }

        let body = Json(serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": kind,
                "code": code
            }
        }));

        (status, body).into_response()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Provider(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AppError {}
