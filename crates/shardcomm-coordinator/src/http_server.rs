//! Inbound answer endpoint.
//!
//! Database servers deliver asynchronous answers as `PUT` requests to the
//! coordinator's `/_api/shard-comm` path. The handler feeds them into
//! [`ShardComm::process_answer`]; correlation failures are reported back
//! to the sending server and go no further.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use axum::{Json, Router};
use serde_json::json;
use shardcomm_common::{headers as wire, InboundRequest};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::answer::AnswerError;
use crate::dispatcher::ShardComm;

/// Builds the router serving the answer endpoint.
pub fn answer_router(comm: Arc<ShardComm>) -> Router {
    Router::new()
        .route(wire::SHARD_COMM_PATH, put(handle_answer))
        .layer(TraceLayer::new_for_http())
        .with_state(comm)
}

/// Binds and serves the answer endpoint until the task is dropped.
pub async fn serve(comm: Arc<ShardComm>, addr: SocketAddr) -> shardcomm_common::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("answer endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, answer_router(comm)).await?;
    Ok(())
}

async fn handle_answer(
    State(comm): State<Arc<ShardComm>>,
    header_map: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation = header_map
        .get(wire::COORDINATOR)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let Some(correlation) = correlation else {
        return answer_error(
            StatusCode::BAD_REQUEST,
            &format!("missing '{}' header", wire::COORDINATOR),
        );
    };

    let headers: HashMap<String, String> = header_map
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    match comm.process_answer(&correlation, InboundRequest { headers, body }) {
        Ok(()) => (StatusCode::OK, Json(json!({ "error": false }))).into_response(),
        Err(error @ AnswerError::AlreadyDropped) => {
            answer_error(StatusCode::NOT_FOUND, &error.to_string())
        }
        Err(error) => answer_error(StatusCode::BAD_REQUEST, &error.to_string()),
    }
}

fn answer_error(code: StatusCode, message: &str) -> Response {
    (
        code,
        Json(json!({ "error": true, "errorMessage": message })),
    )
        .into_response()
}
