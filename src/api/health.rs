//! `GET /health/status` and `GET /health/ready` (`spec.md` §6).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::service_status::{ServiceStatus, WorkerMetrics};
use crate::AppState;

pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/health/status", get(status))
		.route("/health/ready", get(ready))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
	workers: std::collections::HashMap<&'static str, ServiceStatus>,
	metrics: std::collections::HashMap<&'static str, WorkerMetrics>,
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
	Json(StatusResponse {
		workers: state.service_registry.snapshot(),
		metrics: state.service_registry.metrics_snapshot(),
	})
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
	if state.service_registry.all_running() {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	}
}
