//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use gpucell_core::{CellId, CellInfo, GpucellError, NodeEvent, ResourceRequest};
use gpucell_scheduler::{Candidate, InventorySnapshot, Scheduler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    /// Feeds the topology listener
    pub node_events: mpsc::Sender<NodeEvent>,
}

type ApiError = (StatusCode, String);

fn error_response(err: GpucellError) -> ApiError {
    let status = match err {
        GpucellError::Release(_) => StatusCode::CONFLICT,
        GpucellError::InvalidRequest(_) | GpucellError::InvariantViolation(_) => {
            StatusCode::BAD_REQUEST
        }
        GpucellError::Inventory(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

/// Create the API router
pub fn create_router(scheduler: Arc<Scheduler>, node_events: mpsc::Sender<NodeEvent>) -> Router {
    let state = Arc::new(AppState {
        scheduler,
        node_events,
    });

    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/cells", get(get_cells))
        .route("/api/v1/cells/:gpu_type/:level", get(inspect_level))
        .route("/api/v1/candidates", post(select_candidates))
        .route(
            "/api/v1/reservations",
            post(create_reservation).get(list_reservations),
        )
        .route("/api/v1/reservations/:cell", delete(delete_reservation))
        .route("/api/v1/requesters/:requester", delete(release_requester))
        .route("/api/v1/nodes", post(post_node_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Request to reserve a cell
#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    /// Pod or request identifier owning the reservation
    pub requester: String,
    /// Fraction of one GPU, e.g. 0.25
    #[serde(default)]
    pub gpu_request: Option<f64>,
    /// Explicit level name, exclusive with `gpu_request`
    #[serde(default)]
    pub level: Option<String>,
    /// Acceptable GPU types; empty means any
    #[serde(default)]
    pub gpu_types: Vec<String>,
    /// Restrict the reservation to one node
    #[serde(default)]
    pub node: Option<String>,
}

impl ReserveRequest {
    fn resource_request(&self) -> Result<ResourceRequest, GpucellError> {
        let request = match (self.gpu_request, &self.level) {
            (Some(_), Some(_)) => {
                return Err(GpucellError::InvalidRequest(
                    "gpu_request and level are mutually exclusive".to_string(),
                ))
            }
            (Some(fraction), None) => ResourceRequest::fraction(fraction)?,
            (None, Some(level)) => ResourceRequest::level(level.clone()),
            (None, None) => {
                return Err(GpucellError::InvalidRequest(
                    "either gpu_request or level is required".to_string(),
                ))
            }
        };
        Ok(request.with_gpu_types(self.gpu_types.iter().cloned()))
    }
}

/// Selection request without reserving
#[derive(Debug, Deserialize)]
pub struct CandidatesRequest {
    #[serde(default)]
    pub gpu_request: Option<f64>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub gpu_types: Vec<String>,
}

/// Free cell count of one level
#[derive(Debug, Serialize)]
pub struct InspectResponse {
    pub gpu_type: String,
    pub level: String,
    pub free: usize,
}

/// Number of cells released for a requester
#[derive(Debug, Serialize)]
pub struct ReleaseOwnerResponse {
    pub requester: String,
    pub released: usize,
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    /// GPU types, most preferred first
    pub gpu_types: Vec<String>,
    /// Physical coarsest cells across all types
    pub capacity: usize,
    pub allocated: usize,
}

/// Reserve a cell from the most preferred GPU type with capacity
async fn create_reservation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReserveRequest>,
) -> Result<Json<CellInfo>, ApiError> {
    let request = req.resource_request().map_err(error_response)?;
    info!(
        requester = %req.requester,
        request = ?request,
        node = ?req.node,
        "Reservation requested"
    );

    let cell = state
        .scheduler
        .reserve(&request, &req.requester, req.node.as_deref())
        .await
        .map_err(error_response)?
        .ok_or_else(|| {
            (
                StatusCode::CONFLICT,
                format!("No capacity for request of {}", req.requester),
            )
        })?;

    Ok(Json(cell))
}

/// List allocated cells
async fn list_reservations(State(state): State<Arc<AppState>>) -> Json<Vec<CellInfo>> {
    Json(state.scheduler.allocated().await)
}

/// Release one reserved cell
async fn delete_reservation(
    State(state): State<Arc<AppState>>,
    Path(cell): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id: CellId = cell.parse().map_err(error_response)?;
    state.scheduler.release(id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Release every cell held by a requester
async fn release_requester(
    State(state): State<Arc<AppState>>,
    Path(requester): Path<String>,
) -> Result<Json<ReleaseOwnerResponse>, ApiError> {
    let released = state
        .scheduler
        .release_owner(&requester)
        .await
        .map_err(error_response)?;
    info!(requester = %requester, released = released, "Released requester");

    Ok(Json(ReleaseOwnerResponse {
        requester,
        released,
    }))
}

/// GPU types able to serve a request, most preferred first
async fn select_candidates(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CandidatesRequest>,
) -> Result<Json<Vec<Candidate>>, ApiError> {
    let request = ReserveRequest {
        requester: String::new(),
        gpu_request: req.gpu_request,
        level: req.level,
        gpu_types: req.gpu_types,
        node: None,
    }
    .resource_request()
    .map_err(error_response)?;

    Ok(Json(state.scheduler.select_gpu_types(&request).await))
}

/// Free counts for every GPU type and level
async fn get_cells(State(state): State<Arc<AppState>>) -> Json<InventorySnapshot> {
    Json(state.scheduler.snapshot().await)
}

/// Free count for one level
async fn inspect_level(
    State(state): State<Arc<AppState>>,
    Path((gpu_type, level)): Path<(String, String)>,
) -> Result<Json<InspectResponse>, ApiError> {
    let free = state
        .scheduler
        .inspect(&gpu_type, &level)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;

    Ok(Json(InspectResponse {
        gpu_type,
        level,
        free,
    }))
}

/// Forward a node event to the topology listener
async fn post_node_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<NodeEvent>,
) -> Result<StatusCode, ApiError> {
    info!(node = %event.node().name, event = event.kind(), "Node event received");
    state
        .node_events
        .send(event)
        .await
        .map_err(|_| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Topology listener is not running".to_string(),
            )
        })?;
    Ok(StatusCode::ACCEPTED)
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let snapshot = state.scheduler.snapshot().await;

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        gpu_types: snapshot.gpu_types.iter().map(|t| t.gpu_type.clone()).collect(),
        capacity: snapshot.gpu_types.iter().map(|t| t.capacity).sum(),
        allocated: snapshot.gpu_types.iter().map(|t| t.allocated).sum(),
    })
}
