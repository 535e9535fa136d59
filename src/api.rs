use std::path::PathBuf;
use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::spawn;
use tracing::{error, info};
use url::Url;

use crate::{
    app_state::{AppState, Status},
    graph::ConnectionStatus,
    ingest::IngestTarget,
    models::{AuditEntry, PipelineResponse, RetrievalMode},
    prompts::Role,
};

type ApiError = (StatusCode, Json<serde_json::Value>);

const DEFAULT_SCRATCHPAD_LIMIT: usize = 50;

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct QueryPayload {
    query: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

#[derive(Deserialize)]
pub struct IngestPayload {
    path: String,
    #[serde(default)]
    target: IngestTarget,
}

#[derive(Deserialize)]
pub struct ScratchpadParams {
    limit: Option<usize>,
}

#[derive(Serialize)]
pub struct ModeInfo {
    id: RetrievalMode,
    label: &'static str,
    description: &'static str,
}

#[derive(Serialize)]
pub struct RoleInfo {
    id: Role,
    name: &'static str,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/query", post(query_handler))
        .route("/api/ingest", post(ingest_handler))
        .route("/api/status", get(status_handler))
        .route("/api/modes", get(modes_handler))
        .route("/api/roles", get(roles_handler))
        .route("/api/scratchpad", get(scratchpad_handler).delete(clear_scratchpad_handler))
        .route("/api/graph-info", get(graph_info_handler))
        .route("/api/reset", post(reset_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message.into() })))
}

// --- Handlers ---

#[axum::debug_handler]
async fn query_handler(
    State(state): State<AppState>,
    Json(payload): Json<QueryPayload>,
) -> Result<Json<PipelineResponse>, ApiError> {
    if payload.query.trim().is_empty() {
        return Err(bad_request("La consulta no puede estar vacía."));
    }
    let mode = match payload.mode.as_deref() {
        Some(raw) => raw.parse::<RetrievalMode>().map_err(bad_request)?,
        None => RetrievalMode::Hybrid,
    };
    let role = payload.role.as_deref().map(Role::parse).unwrap_or_default();

    let response = state.pipeline.run(&payload.query, mode, role).await;
    Ok(Json(response))
}

#[axum::debug_handler]
async fn ingest_handler(
    State(state): State<AppState>,
    Json(payload): Json<IngestPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let root_dir = PathBuf::from(&payload.path);
    if !root_dir.is_dir() {
        return Err(bad_request("La ruta proporcionada no es un directorio válido."));
    }
    {
        let mut status = state.status.lock().unwrap_or_else(|e| e.into_inner());
        if status.is_busy {
            return Err((
                StatusCode::CONFLICT,
                Json(json!({"error": "Ya hay una indexación en curso."})),
            ));
        }
        status.is_busy = true;
        status.message = "Iniciando indexación...".to_string();
        status.progress = 0.0;
    }

    spawn(async move {
        let result = state
            .ingestion
            .ingest_directory(&state.processor, &root_dir, payload.target, state.status.clone())
            .await;

        let mut status = state.status.lock().unwrap_or_else(|e| e.into_inner());
        status.is_busy = false;
        status.progress = 0.0;
        match result {
            Ok(summary) => {
                info!("Indexación completada: {summary}");
                status.message = format!("¡Indexación completada! {}", summary);
            }
            Err(err) => {
                status.message = format!("Error en la indexación: {}", err);
                error!("Error de ingesta: {}", err);
            }
        }
    });

    Ok(StatusCode::ACCEPTED)
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.status.lock().unwrap_or_else(|e| e.into_inner()).clone())
}

async fn modes_handler() -> Json<Vec<ModeInfo>> {
    Json(
        RetrievalMode::ALL
            .iter()
            .map(|mode| ModeInfo {
                id: *mode,
                label: mode.label(),
                description: mode.description(),
            })
            .collect(),
    )
}

async fn roles_handler() -> Json<Vec<RoleInfo>> {
    Json(
        Role::ALL
            .iter()
            .map(|role| RoleInfo { id: *role, name: role.name() })
            .collect(),
    )
}

/// Entradas más recientes primero.
#[axum::debug_handler]
async fn scratchpad_handler(
    State(state): State<AppState>,
    Query(params): Query<ScratchpadParams>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_SCRATCHPAD_LIMIT);
    match state.pipeline.audit().read(limit).await {
        Ok(mut entries) => {
            entries.reverse();
            Ok(Json(entries))
        }
        Err(e) => {
            error!("Error leyendo el scratchpad: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            ))
        }
    }
}

#[axum::debug_handler]
async fn clear_scratchpad_handler(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.pipeline.audit().clear().await.map_err(|e| {
        error!("Error vaciando el scratchpad: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
    })?;
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn graph_info_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let browser_url = match Url::parse(&state.config.neo4j_uri) {
        Ok(mut url) => {
            let _ = url.set_scheme("http");
            let _ = url.set_port(Some(7474));
            url.to_string()
        }
        Err(_) => "http://localhost:7474".to_string(),
    };

    let graph = state.pipeline.graph();
    let status = match graph.status() {
        ConnectionStatus::Connected => "connected",
        ConnectionStatus::Disconnected => "disconnected",
    };
    Json(json!({
        "status": status,
        "store": graph.store_name(),
        "stats": graph.stats().await,
        "vector_backends": state.pipeline.fusion().backend_names(),
        "browser_url": browser_url,
    }))
}

#[axum::debug_handler]
async fn reset_handler(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    info!("Reseteando almacenes de recuperación.");
    state.pipeline.fusion().reset().await;
    state.pipeline.graph().reset().await.map_err(|e| {
        error!("Error reseteando el grafo: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
    })?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Handler de Apagado ---

#[axum::debug_handler]
async fn shutdown_handler(
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state.shutdown_sender.lock().unwrap_or_else(|e| e.into_inner()).take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}
