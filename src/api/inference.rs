//! `POST /inference` and `GET /inference/status/{id}` (`spec.md` §6).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::entities::{
	InferenceRequest, InferenceRequestState, InputMetadata, InputResource, OutputResource, RequestStatus,
};
use crate::error::GatewayError;
use crate::platform::PlatformClient;
use crate::types::Priority;
use crate::AppState;

pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/inference", post(submit))
		.route("/inference/status/{id}", get(status))
}

/// The inbound JSON shape for `POST /inference`; mirrors [`InferenceRequest`]
/// minus the fields the gateway itself assigns (`jobId`, `payloadId`,
/// `stagingPath`, lifecycle state).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitInferenceRequest {
	transaction_id: String,
	job_name: String,
	pipeline_id: String,
	input_resources: Vec<InputResource>,
	#[serde(default)]
	output_resources: Vec<OutputResource>,
	input_metadata: InputMetadata,
	#[serde(default)]
	priority: Priority,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitInferenceResponse {
	transaction_id: String,
	job_id: uuid::Uuid,
	payload_id: uuid::Uuid,
}

async fn submit(State(state): State<AppState>, Json(payload): Json<SubmitInferenceRequest>) -> impl IntoResponse {
	let (job_id, payload_id) = crate::platform::new_ids();
	let staging_path = state.requests_staging_root.join(&payload.transaction_id);

	let request = InferenceRequest {
		transaction_id: payload.transaction_id.clone(),
		job_id,
		payload_id,
		job_name: payload.job_name,
		pipeline_id: payload.pipeline_id,
		input_resources: payload.input_resources,
		output_resources: payload.output_resources,
		input_metadata: payload.input_metadata,
		priority: payload.priority,
		staging_path,
		state: InferenceRequestState::Queued,
		status: None,
		try_count: 0,
	};

	match state.inference_store.submit(request).await {
		Ok(_accepted) => Json(SubmitInferenceResponse {
			transaction_id: payload.transaction_id,
			job_id,
			payload_id,
		})
		.into_response(),
		Err(GatewayError::Validation(reason)) => (StatusCode::UNPROCESSABLE_ENTITY, reason).into_response(),
		Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
	}
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DicomStatus {
	state: String,
	status: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlatformStatus {
	job_id: Option<String>,
	payload_id: Option<String>,
	state: Option<String>,
	priority: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceStatusResponse {
	dicom: DicomStatus,
	platform: PlatformStatus,
	message: String,
}

async fn status(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
	let Ok(Some(request)) = state.inference_store.find_by_transaction_id(&id).await else {
		return StatusCode::NOT_FOUND.into_response();
	};

	let job = match state.job_repository.find(&request.job_id.to_string()).await {
		Ok(job) => job,
		Err(err) => return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
	};

	let (platform_state, platform_job_id, platform_payload_id, priority) = match &job {
		Some(job) => {
			let platform_state = match &job.platform_job_id {
				Some(platform_job_id) => state.platform.job_status(platform_job_id).await.ok().map(|s| s.state),
				None => None,
			};
			(
				platform_state,
				job.platform_job_id.clone(),
				job.platform_payload_id.clone(),
				format!("{:?}", job.priority),
			)
		}
		None => (None, None, None, format!("{:?}", request.priority)),
	};

	let dicom_state = job.as_ref().map_or_else(
		|| format!("{:?}", request.state),
		|job| format!("{:?}", job.state),
	);
	let dicom_status = job
		.as_ref()
		.map(|job| format!("{:?}", job.status))
		.or_else(|| request.status.map(|status| format!("{:?}", status)));

	let message = match request.status {
		Some(RequestStatus::Fail) => "inference request failed".to_string(),
		Some(RequestStatus::Success) => "inference request completed".to_string(),
		None => "inference request in progress".to_string(),
	};

	Json(InferenceStatusResponse {
		dicom: DicomStatus {
			state: dicom_state,
			status: dicom_status,
		},
		platform: PlatformStatus {
			job_id: platform_job_id,
			payload_id: platform_payload_id,
			state: platform_state,
			priority,
		},
		message,
	})
	.into_response()
}
