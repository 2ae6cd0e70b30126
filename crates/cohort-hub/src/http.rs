//! Axum routes for the hub API.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use cohort_common::error::ErrorCode;
use cohort_enroll::protocol::ErrorBody;

use crate::error::HubError;
use crate::ops::{EnrollRequest, Hub};
use crate::registry::NodeChange;

pub fn routes(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/v1/hub/nodes", get(list_nodes).post(enroll_node))
        .route("/v1/hub/nodes/:address", get(get_node))
        .route("/v1/hub/nodes/:address/renew", post(renew_node))
        .route("/v1/hub/nodes/:address/forget", post(forget_node))
        .route("/v1/hub/nodes/:address/test", get(test_node))
        .route("/v1/hub/nodes/:address/inspect", get(inspect_node))
        .route("/v1/hub/changes", get(changes))
        .with_state(hub)
}

async fn list_nodes(State(hub): State<Arc<Hub>>) -> Response {
    Json(hub.registry().list().await).into_response()
}

async fn get_node(State(hub): State<Arc<Hub>>, Path(address): Path<String>) -> Response {
    match hub.registry().get(&address).await {
        Some(node) => Json(node).into_response(),
        None => error_response(&HubError::NotFound(address)),
    }
}

async fn enroll_node(
    State(hub): State<Arc<Hub>>,
    Json(req): Json<EnrollRequest>,
) -> Response {
    match hub.enroll_node(&req).await {
        Ok(node) => Json(node).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn renew_node(State(hub): State<Arc<Hub>>, Path(address): Path<String>) -> Response {
    match hub.renew_node(&address).await {
        Ok(node) => Json(node).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ForgetParams {
    #[serde(default)]
    allow_missing: bool,
}

async fn forget_node(
    State(hub): State<Arc<Hub>>,
    Path(address): Path<String>,
    Query(params): Query<ForgetParams>,
) -> Response {
    match hub.forget_node(&address, params.allow_missing).await {
        Ok(removed) => Json(removed).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn test_node(State(hub): State<Arc<Hub>>, Path(address): Path<String>) -> Response {
    match hub.test_node(&address).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn inspect_node(State(hub): State<Arc<Hub>>, Path(address): Path<String>) -> Response {
    match hub.inspect_node(&address).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChangesParams {
    /// Skip the initial snapshot and stream only subsequent changes.
    #[serde(default)]
    updates_only: bool,
}

async fn changes(
    State(hub): State<Arc<Hub>>,
    Query(params): Query<ChangesParams>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before snapshotting so no mutation falls in the gap.
    let rx = hub.registry().subscribe();
    let snapshot = if params.updates_only {
        Vec::new()
    } else {
        hub.registry().list().await
    };

    let initial = tokio_stream::iter(snapshot.into_iter().map(NodeChange::added));
    let live = BroadcastStream::new(rx).filter_map(|result| result.ok());

    let stream = initial
        .chain(live)
        .map(|change| Ok(sse_event(&change)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(change: &NodeChange) -> Event {
    match Event::default().json_data(change) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode change event");
            Event::default().comment("encoding error")
        }
    }
}

fn error_response(err: &HubError) -> Response {
    let code = ErrorCode::from(err);
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::warn!(code = ?code, error = %err, "hub request failed");
    }
    (
        status,
        Json(ErrorBody {
            error: code,
            message: err.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testutil::{make_hub, spawn_node};
    use crate::registry::HubNode;
    use axum::body::Body;
    use axum::http::Request;
    use cohort_common::test::scratch_dir;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn empty_registry_lists_nothing() {
        let dir = scratch_dir("hub-http-empty");
        let app = routes(Arc::new(make_hub("hub", &dir)));

        let response = app.oneshot(get("/v1/hub/nodes")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!([]));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unknown_node_is_404() {
        let dir = scratch_dir("hub-http-404");
        let app = routes(Arc::new(make_hub("hub", &dir)));

        let response = app
            .oneshot(get("/v1/hub/nodes/10.0.0.1:443"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "not_found");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn listed_node_is_fetchable_by_address() {
        let dir = scratch_dir("hub-http-list");
        let hub = Arc::new(make_hub("hub", &dir));
        hub.registry()
            .insert(HubNode {
                address: "10.0.0.1:443".into(),
                name: "ac-60".into(),
                description: String::new(),
                cert_chain_pem: String::new(),
                fingerprint: "00".repeat(32),
                enrolled_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let app = routes(hub);

        let response = app
            .clone()
            .oneshot(get("/v1/hub/nodes"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let response = app
            .oneshot(get("/v1/hub/nodes/10.0.0.1:443"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["name"], "ac-60");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn enroll_endpoint_round_trips() {
        let node = spawn_node("hub-http-enroll").await;
        let dir = scratch_dir("hub-http-enroll-reg");
        let app = routes(Arc::new(make_hub("hub", &dir)));

        let request = Request::builder()
            .method("POST")
            .uri("/v1/hub/nodes")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&EnrollRequest {
                    name: "ac-61".into(),
                    address: node.address.clone(),
                    description: String::new(),
                    pin: None,
                })
                .unwrap(),
            ))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["name"], "ac-61");

        let response = app
            .oneshot(get(&format!("/v1/hub/nodes/{}", node.address)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        node.handle.shutdown();
        let _ = std::fs::remove_dir_all(&node.dir);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn forget_missing_without_flag_is_404() {
        let dir = scratch_dir("hub-http-forget");
        let app = routes(Arc::new(make_hub("hub", &dir)));

        let request = Request::builder()
            .method("POST")
            .uri("/v1/hub/nodes/10.0.0.9:443/forget")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
