//! HTTP API server for the HopSwitch node.
//!
//! Read-only endpoints for switch status, open circuits and witness lookups.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use hopswitch::SwitchError;
use hopswitch_core::PaymentHash;
use hopswitch_store::Circuit;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::state::NodeState;

// --- Response types ---

#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: u64,
    pub storage_backend: String,
    pub open_circuits: usize,
    pub held_htlcs: usize,
    pub subscriptions: usize,
    pub halted: bool,
    pub interceptor_registered: bool,
}

#[derive(Serialize)]
pub struct CircuitInfo {
    pub incoming: String,
    pub outgoing: Option<String>,
    pub payment_hash: String,
    pub incoming_amount_msat: u64,
    pub outgoing_amount_msat: u64,
    pub created_at: String,
    pub resolution: Option<String>,
}

impl From<&Circuit> for CircuitInfo {
    fn from(c: &Circuit) -> Self {
        Self {
            incoming: c.incoming.to_string(),
            outgoing: c.outgoing.map(|k| k.to_string()),
            payment_hash: c.payment_hash.to_hex(),
            incoming_amount_msat: c.incoming_amount_msat,
            outgoing_amount_msat: c.outgoing_amount_msat,
            created_at: c.created_at.to_rfc3339(),
            resolution: c.resolution.as_ref().map(|r| r.to_string()),
        }
    }
}

#[derive(Serialize)]
pub struct CircuitsResponse {
    pub circuits: Vec<CircuitInfo>,
    pub count: usize,
}

#[derive(Serialize)]
pub struct PreimageResponse {
    pub payment_hash: String,
    pub preimage: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

// --- Handlers ---

async fn handle_status(State(state): State<Arc<NodeState>>) -> Json<StatusResponse> {
    let switch = &state.switch;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        storage_backend: state.backend.to_string(),
        open_circuits: switch.circuit_count(),
        held_htlcs: switch.held_count(),
        subscriptions: switch.beacon().total_subscribers(),
        halted: switch.is_halted(),
        interceptor_registered: switch.has_interceptor(),
    })
}

async fn handle_circuits(State(state): State<Arc<NodeState>>) -> Json<CircuitsResponse> {
    let circuits: Vec<CircuitInfo> = state
        .switch
        .open_circuits()
        .iter()
        .map(CircuitInfo::from)
        .collect();
    let count = circuits.len();
    Json(CircuitsResponse { circuits, count })
}

async fn handle_preimage(
    State(state): State<Arc<NodeState>>,
    Path(hash): Path<String>,
) -> Result<Json<PreimageResponse>, ApiError> {
    let payment_hash: PaymentHash = hash
        .parse()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;

    match state.switch.lookup_preimage(&payment_hash) {
        Ok(Some(preimage)) => Ok(Json(PreimageResponse {
            payment_hash: payment_hash.to_hex(),
            preimage: preimage.to_hex(),
        })),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "preimage not known")),
        Err(e @ SwitchError::Storage(_)) => Err(api_error(StatusCode::SERVICE_UNAVAILABLE, e)),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

// --- Server ---

pub fn build_router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/api/v1/status", get(handle_status))
        .route("/api/v1/circuits", get(handle_circuits))
        .route("/api/v1/preimages/{hash}", get(handle_preimage))
        .with_state(state)
}

pub async fn start_api_server(
    listen_addr: SocketAddr,
    state: Arc<NodeState>,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "HTTP API server started");
    axum::serve(listener, app).await?;
    Ok(())
}
