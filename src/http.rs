//! Decodes `POST /generate`, delegates to the [`Service`], and encodes the
//! response. The boundary, not the hard part.

use crate::service::{Error as ServiceError, Service};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_IMAGE_COUNT: i64 = 1;
const DEFAULT_WIDTH: i64 = 450;
const DEFAULT_HEIGHT: i64 = 450;

pub struct AppState {
    pub service: Service,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    prompt: String,
    #[serde(default)]
    image_count: i64,
    #[serde(default)]
    width: i64,
    #[serde(default)]
    height: i64,
    #[serde(default)]
    webhook_url: String,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    prompt_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(error) => (StatusCode::BAD_REQUEST, error),
            ApiError::Internal(error) => (StatusCode::INTERNAL_SERVER_ERROR, error),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateRequest>,
) -> std::result::Result<Json<GenerateResponse>, ApiError> {
    if request.prompt.is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".to_string()));
    }

    let image_count = if request.image_count > 0 {
        request.image_count
    } else {
        DEFAULT_IMAGE_COUNT
    };
    let width = if request.width > 0 { request.width } else { DEFAULT_WIDTH };
    let height = if request.height > 0 {
        request.height
    } else {
        DEFAULT_HEIGHT
    };
    let seed = wall_clock_seed();

    let mut params: HashMap<String, Value> = HashMap::new();
    params.insert("prompt".to_string(), Value::from(request.prompt));
    params.insert("width".to_string(), Value::from(width));
    params.insert("height".to_string(), Value::from(height));
    params.insert("imageCount".to_string(), Value::from(image_count));
    params.insert("seed".to_string(), Value::from(seed));

    let webhook_url = (!request.webhook_url.is_empty()).then_some(request.webhook_url);

    let result = state
        .service
        .generate_image("default", &params, webhook_url)
        .await?;

    Ok(Json(GenerateResponse {
        prompt_id: result.prompt_id,
    }))
}

fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}
