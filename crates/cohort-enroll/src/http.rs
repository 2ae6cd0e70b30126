//! Axum routes for the node enrollment API.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use cohort_common::error::ErrorCode;

use crate::error::EnrollError;
use crate::protocol::{EnrollmentDoc, ErrorBody};
use crate::server::EnrollmentServer;

pub fn routes(server: Arc<EnrollmentServer>) -> Router {
    Router::new()
        .route(
            "/v1/enrollment",
            get(get_enrollment)
                .post(create_enrollment)
                .put(renew_enrollment)
                .delete(delete_enrollment),
        )
        .with_state(server)
}

async fn get_enrollment(State(server): State<Arc<EnrollmentServer>>) -> Response {
    match server.document() {
        Ok(doc) => Json(doc).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn create_enrollment(
    State(server): State<Arc<EnrollmentServer>>,
    Json(doc): Json<EnrollmentDoc>,
) -> Response {
    match server.create(&doc) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn renew_enrollment(
    State(server): State<Arc<EnrollmentServer>>,
    Json(doc): Json<EnrollmentDoc>,
) -> Response {
    match server.renew(&doc) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn delete_enrollment(State(server): State<Arc<EnrollmentServer>>) -> Response {
    match server.delete() {
        Ok(doc) => Json(doc).into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &EnrollError) -> Response {
    let code = ErrorCode::from(err);
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::warn!(code = ?code, error = %err, "enrollment request failed");
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
