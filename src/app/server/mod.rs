use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::app::Result;
use crate::core::{CacheStatus, TokenId, TokenizerError};
use crate::envconfig::Host;
use crate::service::TokenizerService;

#[derive(Clone)]
pub struct AppState {
    pub service: TokenizerService,
    /// Per-request limit; an expired request does not cancel a shared load.
    pub request_timeout: Duration,
}

pub struct Server {
    host: Host,
    router: Router,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self {
            host: Host::default(),
            router: create_router(state),
        }
    }

    pub fn host(mut self, host: Host) -> Self {
        self.host = host;
        self
    }

    pub async fn run(self) -> Result<()> {
        let addr = self.host.addr();
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Server listening on {}", addr);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutting down");
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenizeRequest {
    pub model: String,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenizeResponse {
    /// Canonical model that produced the tokens.
    pub model: String,
    pub tokens: Vec<TokenId>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub model: String,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<String>,
    pub cache: Vec<CacheStatus>,
}

#[derive(Debug)]
pub enum ApiError {
    Tokenizer(TokenizerError),
    Timeout,
    Internal(String),
}

impl From<TokenizerError> for ApiError {
    fn from(e: TokenizerError) -> Self {
        ApiError::Tokenizer(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Tokenizer(e) => {
                let status = match e {
                    TokenizerError::UnknownModel { .. } => StatusCode::NOT_FOUND,
                    TokenizerError::LoadFailure { .. } => StatusCode::BAD_GATEWAY,
                    TokenizerError::EngineFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, e.to_string())
            }
            ApiError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "request timed out".to_string()),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/tokenize", post(tokenize))
        .route("/count", post(count))
        .route("/models", get(list_models))
        .route("/healthz", get(health))
        .with_state(state)
}

/// Runs a facade call on the blocking pool, bounded by the request timeout.
async fn run_blocking<T, F>(state: &AppState, f: F) -> std::result::Result<T, ApiError>
where
    F: FnOnce(&TokenizerService) -> std::result::Result<T, TokenizerError> + Send + 'static,
    T: Send + 'static,
{
    let service = state.service.clone();
    let task = tokio::task::spawn_blocking(move || f(&service));

    match tokio::time::timeout(state.request_timeout, task).await {
        Err(_) => Err(ApiError::Timeout),
        Ok(Err(e)) => Err(ApiError::Internal(e.to_string())),
        Ok(Ok(result)) => result.map_err(ApiError::from),
    }
}

async fn tokenize(
    State(state): State<AppState>,
    Json(req): Json<TokenizeRequest>,
) -> std::result::Result<Json<TokenizeResponse>, ApiError> {
    let response = run_blocking(&state, move |service| {
        let model = service.optimal_tokenizer_model(&req.model)?;
        let tokens = service.tokenize(&model, &req.prompt)?;
        Ok(TokenizeResponse {
            model,
            count: tokens.len(),
            tokens,
        })
    })
    .await?;

    Ok(Json(response))
}

async fn count(
    State(state): State<AppState>,
    Json(req): Json<TokenizeRequest>,
) -> std::result::Result<Json<CountResponse>, ApiError> {
    let response = run_blocking(&state, move |service| {
        let model = service.optimal_tokenizer_model(&req.model)?;
        let count = service.count_tokens(&model, &req.prompt)?;
        Ok(CountResponse { model, count })
    })
    .await?;

    Ok(Json(response))
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.service.available_models(),
        cache: state.service.cache_status(),
    })
}

async fn health() -> &'static str {
    "ok"
}
