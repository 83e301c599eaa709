//! Node lifecycle endpoints.
//!
//! Thin wrappers over the registry: parse the id, invoke the operation,
//! shape the record into its API view. All sequencing and rollback lives
//! in the registry.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use vmlab_id::NodeId;

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::node::{NodeRecord, NodeStatus};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/nodes", get(list_nodes).post(create_node))
        .route("/nodes/{node_id}/run", post(run_node))
        .route("/nodes/{node_id}/stop", post(stop_node))
        .route("/nodes/{node_id}/wipe", post(wipe_node))
        .route("/nodes/{node_id}", delete(delete_node))
}

/// One node as reported by the API.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct NodeView {
    pub id: String,
    pub status: NodeStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    /// Client-facing URL for the node's remote-desktop session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_url: Option<String>,
}

impl NodeView {
    fn from_record(node: &NodeRecord, state: &AppState) -> Self {
        let runtime = node.runtime.as_ref();
        Self {
            id: node.id.to_string(),
            status: node.status(),
            display_port: runtime.map(|rt| rt.display_port),
            connection_id: runtime.map(|rt| rt.connection_id.clone()),
            broker_url: runtime
                .map(|rt| client_url(state.client_base_url(), state.data_source(), &rt.connection_id)),
        }
    }
}

/// Build the client-viewable URL for a live connection.
///
/// The path segment encodes `{connection_id}\0c\0{data_source}`; the `c`
/// marks a single connection as opposed to a connection group.
fn client_url(base: &str, data_source: &str, connection_id: &str) -> String {
    let identifier = format!("{connection_id}\0c\0{data_source}");
    let encoded = STANDARD.encode(identifier.as_bytes());
    format!("{base}/#/client/{encoded}")
}

/// An id that does not parse cannot name a known node.
fn parse_node_id(raw: &str) -> Result<NodeId, ApiError> {
    NodeId::parse(raw)
        .map_err(|_| ApiError::not_found("node-not-found", format!("unknown node id: {raw}")))
}

async fn list_nodes(State(state): State<AppState>) -> Result<Json<Vec<NodeView>>, ApiError> {
    let nodes = state.registry().list().await?;
    let views = nodes
        .iter()
        .map(|node| NodeView::from_record(node, &state))
        .collect();
    Ok(Json(views))
}

async fn create_node(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let node = state.registry().create().await?;
    Ok((
        StatusCode::CREATED,
        Json(NodeView::from_record(&node, &state)),
    ))
}

async fn run_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeView>, ApiError> {
    let id = parse_node_id(&node_id)?;
    let node = state.registry().start(id).await?;
    Ok(Json(NodeView::from_record(&node, &state)))
}

async fn stop_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeView>, ApiError> {
    let id = parse_node_id(&node_id)?;
    let node = state.registry().stop(id).await?;
    Ok(Json(NodeView::from_record(&node, &state)))
}

async fn wipe_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeView>, ApiError> {
    let id = parse_node_id(&node_id)?;
    let node = state.registry().wipe(id).await?;
    Ok(Json(NodeView::from_record(&node, &state)))
}

async fn delete_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_node_id(&node_id)?;
    state.registry().delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
