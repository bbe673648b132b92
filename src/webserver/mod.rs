//! A small HTTP API for watching a job run from outside.
//!
//! Started by [`crate::run::Cluster::submit`] when
//! `FAULTLINE_API_ENABLED` is set.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::Json;
use axum::Router;
use prometheus::Encoder;
use prometheus::TextEncoder;

use crate::errors::tracked_err;
use crate::errors::HarnessError;
use crate::errors::HarnessResult;
use crate::oracle::CompletionOracle;

struct State {
    pipeline_json: serde_json::Value,
    oracle: CompletionOracle,
}

pub(crate) fn api_port() -> HarnessResult<u16> {
    match std::env::var("FAULTLINE_API_PORT") {
        Ok(var) => var.parse().map_err(|_| {
            tracked_err(
                HarnessError::Config,
                &format!("unable to parse FAULTLINE_API_PORT {var:?}"),
            )
        }),
        Err(_) => Ok(3030),
    }
}

pub(crate) async fn run_webserver(
    pipeline_json: serde_json::Value,
    oracle: CompletionOracle,
    port: u16,
) -> HarnessResult<()> {
    let shared_state = Arc::new(State {
        pipeline_json,
        oracle,
    });

    let app = Router::new()
        .route("/pipeline", get(get_pipeline))
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .layer(Extension(shared_state));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting job API server on {addr:?}");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| {
            tracked_err(
                HarnessError::Runtime,
                &format!("unable to create local webserver at port {port}: {err}"),
            )
        })
}

async fn get_pipeline(Extension(state): Extension<Arc<State>>) -> impl IntoResponse {
    Json(state.pipeline_json.clone())
}

async fn get_status(Extension(state): Extension<Arc<State>>) -> impl IntoResponse {
    Json(state.oracle.snapshot())
}

async fn get_metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
