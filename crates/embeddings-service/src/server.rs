//! JSON HTTP server.
//!
//! Routes:
//! - `GET /healthz`, `GET /info`
//! - `POST /v1/embeddings/{text,weighted,weighted-map,image-url,query}`
//! - `GET /v1/models`, `GET /v1/models/loaded`
//! - `POST /v1/models/{load,load-advanced,active}`
//! - `GET|PUT /v1/index-configs`, `GET /v1/index-configs/:application_id`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{info, warn};

use embeddings_models::WeightedInputs;
use embeddings_types::{ApplicationIndexConfig, IndexConfigFilter, ModelInfo, SystemModel};

use crate::api::{
    EmbeddingVector, ImageUrlRequest, LoadModelRequest, QueryEmbeddingInput, QueryEmbeddingResult,
    SetActiveModelRequest, TextEmbeddingRequest, UpsertIndexConfigInput, WeightedMapRequest,
    WeightedQueryRequest,
};
use crate::error::ServiceError;
use crate::service::{EmbeddingsService, ServiceInfo};

type AppState = Arc<EmbeddingsService>;
type ApiResult<T> = Result<Json<T>, ServiceError>;

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(status = %status, error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the router over `service`.
pub fn router(service: Arc<EmbeddingsService>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/info", get(info_handler))
        .route("/v1/embeddings/text", post(text_embedding))
        .route("/v1/embeddings/weighted", post(weighted_query_embedding))
        .route("/v1/embeddings/weighted-map", post(weighted_query_embedding_from_map))
        .route("/v1/embeddings/image-url", post(image_url_embedding))
        .route("/v1/embeddings/query", post(build_query_embedding))
        .route("/v1/models", get(models))
        .route("/v1/models/loaded", get(loaded_models))
        .route("/v1/models/load", post(load_model))
        .route("/v1/models/load-advanced", post(load_model_advanced))
        .route("/v1/models/active", post(set_active_model))
        .route("/v1/index-configs", get(index_configs).put(upsert_index_config))
        .route("/v1/index-configs/:application_id", get(index_config))
        .with_state(service)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn info_handler(State(service): State<AppState>) -> Json<ServiceInfo> {
    Json(service.info().clone())
}

async fn text_embedding(
    State(service): State<AppState>,
    Json(req): Json<TextEmbeddingRequest>,
) -> ApiResult<EmbeddingVector> {
    Ok(Json(
        service
            .text_embedding(&req.text, req.model_name.as_deref())
            .await?,
    ))
}

async fn weighted_query_embedding(
    State(service): State<AppState>,
    Json(req): Json<WeightedQueryRequest>,
) -> ApiResult<EmbeddingVector> {
    let weights: WeightedInputs = req.weights.into_iter().map(|w| (w.term, w.weight)).collect();
    Ok(Json(
        service
            .weighted_query_embedding(&weights, req.model_name.as_deref())
            .await?,
    ))
}

async fn weighted_query_embedding_from_map(
    State(service): State<AppState>,
    Json(req): Json<WeightedMapRequest>,
) -> ApiResult<EmbeddingVector> {
    Ok(Json(
        service
            .weighted_query_embedding_from_map(&req.weights_map, req.model_name.as_deref())
            .await?,
    ))
}

async fn image_url_embedding(
    State(service): State<AppState>,
    Json(req): Json<ImageUrlRequest>,
) -> ApiResult<EmbeddingVector> {
    Ok(Json(
        service
            .image_url_embedding(&req.image_url, req.model_name.as_deref())
            .await?,
    ))
}

async fn build_query_embedding(
    State(service): State<AppState>,
    Json(input): Json<QueryEmbeddingInput>,
) -> ApiResult<QueryEmbeddingResult> {
    Ok(Json(service.build_query_embedding(input).await?))
}

async fn models(State(service): State<AppState>) -> ApiResult<Vec<SystemModel>> {
    Ok(Json(service.models()?))
}

async fn loaded_models(State(service): State<AppState>) -> Json<Vec<ModelInfo>> {
    Json(service.loaded_models())
}

async fn load_model(
    State(service): State<AppState>,
    Json(req): Json<LoadModelRequest>,
) -> ApiResult<SystemModel> {
    Ok(Json(service.load_model(&req.name, &req.model_type).await?))
}

async fn load_model_advanced(
    State(service): State<AppState>,
    Json(req): Json<LoadModelRequest>,
) -> ApiResult<SystemModel> {
    Ok(Json(
        service
            .load_model_advanced(&req.name, &req.model_type, req.activate)
            .await?,
    ))
}

async fn set_active_model(
    State(service): State<AppState>,
    Json(req): Json<SetActiveModelRequest>,
) -> ApiResult<SystemModel> {
    Ok(Json(service.set_active_model(&req.name)?))
}

async fn index_configs(
    State(service): State<AppState>,
    Query(filter): Query<IndexConfigFilter>,
) -> ApiResult<Vec<ApplicationIndexConfig>> {
    Ok(Json(service.index_configs(&filter)?))
}

async fn index_config(
    State(service): State<AppState>,
    Path(application_id): Path<String>,
) -> Result<Json<ApplicationIndexConfig>, ServiceError> {
    service
        .index_config(&application_id)?
        .map(Json)
        .ok_or_else(|| ServiceError::NotFound(format!("index config {}", application_id)))
}

async fn upsert_index_config(
    State(service): State<AppState>,
    Json(input): Json<UpsertIndexConfigInput>,
) -> ApiResult<ApplicationIndexConfig> {
    Ok(Json(service.upsert_index_config(input).await?))
}

/// Serve until the process is killed.
pub async fn run_server(
    addr: SocketAddr,
    service: Arc<EmbeddingsService>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    run_server_with_shutdown(addr, service, std::future::pending()).await
}

/// Serve until `shutdown_signal` resolves, then drain in-flight requests.
pub async fn run_server_with_shutdown<F>(
    addr: SocketAddr,
    service: Arc<EmbeddingsService>,
    shutdown_signal: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server ready on {}", listener.local_addr()?);

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("HTTP server shutdown complete");
    Ok(())
}
