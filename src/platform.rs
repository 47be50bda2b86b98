//! The downstream inference platform's Jobs and Payloads APIs (`spec.md`
//! §4.4): job lifecycle calls and per-file payload upload/download.
//!
//! Trait-based so the Job-Submission Service can be tested against a fake
//! implementation without a live platform, matching the teacher's
//! trait-per-service pattern (`api::wado::service::WadoService`,
//! `api::stow::service::StowService`).

use std::future::Future;
use std::path::Path;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PlatformConfig;
use crate::error::GatewayError;

#[derive(Debug, Clone, Serialize)]
pub struct CreateJobRequest<'a> {
	pub job_name: &'a str,
	pub pipeline_id: &'a str,
	pub priority: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobResponse {
	pub job_id: String,
	pub payload_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStatusResponse {
	pub state: String,
}

/// The platform's Jobs and Payloads APIs, as a single client trait so the
/// job-submission state machine is testable without a live platform.
pub trait PlatformClient: Send + Sync {
	fn create_job(
		&self,
		request: CreateJobRequest<'_>,
	) -> impl Future<Output = Result<CreateJobResponse, GatewayError>> + Send;

	fn upload_metadata(
		&self,
		payload_id: &str,
		metadata: serde_json::Value,
	) -> impl Future<Output = Result<(), GatewayError>> + Send;

	fn upload_payload_file(
		&self,
		payload_id: &str,
		relative_path: &str,
		file: &Path,
	) -> impl Future<Output = Result<(), GatewayError>> + Send;

	fn start_job(&self, job_id: &str) -> impl Future<Output = Result<(), GatewayError>> + Send;

	fn job_status(&self, job_id: &str) -> impl Future<Output = Result<JobStatusResponse, GatewayError>> + Send;

	fn download_payload_file(
		&self,
		payload_id: &str,
		relative_path: &str,
		destination: &Path,
	) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

#[derive(Clone)]
pub struct HttpPlatformClient {
	http: Client,
	config: PlatformConfig,
}

impl HttpPlatformClient {
	#[must_use]
	pub fn new(config: PlatformConfig) -> Self {
		Self {
			http: Client::new(),
			config,
		}
	}

	fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		match &self.config.api_key {
			Some(key) => request.header("Authorization", format!("Bearer {key}")),
			None => request,
		}
	}
}

impl PlatformClient for HttpPlatformClient {
	async fn create_job(&self, request: CreateJobRequest<'_>) -> Result<CreateJobResponse, GatewayError> {
		let url = self
			.config
			.jobs_base_url
			.clone();
		let response = self
			.authorize(self.http.post(url).json(&request))
			.send()
			.await
			.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;

		parse_json_or_classify(response).await
	}

	async fn upload_metadata(&self, payload_id: &str, metadata: serde_json::Value) -> Result<(), GatewayError> {
		let url = join_path(&self.config.payloads_base_url, &format!("{payload_id}/metadata"));
		let response = self
			.authorize(self.http.put(url).json(&metadata))
			.send()
			.await
			.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
		ensure_success(response).await
	}

	async fn upload_payload_file(
		&self,
		payload_id: &str,
		relative_path: &str,
		file: &Path,
	) -> Result<(), GatewayError> {
		let bytes = tokio::fs::read(file).await.map_err(GatewayError::from_io)?;
		let part = reqwest::multipart::Part::bytes(bytes)
			.file_name(relative_path.to_string());
		let form = reqwest::multipart::Form::new().part("file", part);

		let url = join_path(&self.config.payloads_base_url, &format!("{payload_id}/files"));
		let response = self
			.authorize(self.http.post(url).multipart(form))
			.send()
			.await
			.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
		ensure_success(response).await
	}

	async fn start_job(&self, job_id: &str) -> Result<(), GatewayError> {
		let url = join_path(&self.config.jobs_base_url, &format!("{job_id}/start"));
		let response = self
			.authorize(self.http.post(url))
			.send()
			.await
			.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
		ensure_success(response).await
	}

	async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse, GatewayError> {
		let url = join_path(&self.config.jobs_base_url, job_id);
		let response = self
			.authorize(self.http.get(url))
			.send()
			.await
			.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
		parse_json_or_classify(response).await
	}

	async fn download_payload_file(
		&self,
		payload_id: &str,
		relative_path: &str,
		destination: &Path,
	) -> Result<(), GatewayError> {
		let url = join_path(
			&self.config.payloads_base_url,
			&format!("{payload_id}/files/{relative_path}"),
		);
		let response = self
			.authorize(self.http.get(url))
			.send()
			.await
			.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;

		if !response.status().is_success() {
			return Err(classify_response_status(response.status()));
		}
		let bytes = response
			.bytes()
			.await
			.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;

		if let Some(parent) = destination.parent() {
			tokio::fs::create_dir_all(parent).await.map_err(GatewayError::from_io)?;
		}
		tokio::fs::write(destination, &bytes).await.map_err(GatewayError::from_io)
	}
}

fn join_path(base: &url::Url, segment: &str) -> url::Url {
	base.join(&format!("{}/{segment}", base.path().trim_end_matches('/')))
		.unwrap_or_else(|_| base.clone())
}

async fn ensure_success(response: reqwest::Response) -> Result<(), GatewayError> {
	if response.status().is_success() {
		Ok(())
	} else {
		Err(classify_response_status(response.status()))
	}
}

async fn parse_json_or_classify<T: serde::de::DeserializeOwned>(
	response: reqwest::Response,
) -> Result<T, GatewayError> {
	if !response.status().is_success() {
		return Err(classify_response_status(response.status()));
	}
	response
		.json()
		.await
		.map_err(|err| GatewayError::DataCorruption(err.to_string()))
}

fn classify_response_status(status: reqwest::StatusCode) -> GatewayError {
	if status.is_server_error() {
		GatewayError::TransientTransport(format!("platform returned {status}"))
	} else {
		GatewayError::PermanentTransport(format!("platform returned {status}"))
	}
}

/// Generates the `payloadId`/`jobId` pair a freshly created
/// [`crate::entities::InferenceJob`] needs before the platform has assigned
/// its own ids.
#[must_use]
pub fn new_ids() -> (Uuid, Uuid) {
	(Uuid::new_v4(), Uuid::new_v4())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classify_response_status_treats_5xx_as_transient() {
		let err = classify_response_status(reqwest::StatusCode::SERVICE_UNAVAILABLE);
		assert!(matches!(err, GatewayError::TransientTransport(_)));
	}

	#[test]
	fn classify_response_status_treats_4xx_as_permanent() {
		let err = classify_response_status(reqwest::StatusCode::UNAUTHORIZED);
		assert!(matches!(err, GatewayError::PermanentTransport(_)));
	}

	#[test]
	fn join_path_appends_a_segment_to_the_base_path() {
		let base: url::Url = "https://platform.example.org/payloads".parse().unwrap();
		let joined = join_path(&base, "abc-123/files");
		assert_eq!(joined.as_str(), "https://platform.example.org/payloads/abc-123/files");
	}

	#[test]
	fn join_path_does_not_double_slash_a_trailing_slash_base() {
		let base: url::Url = "https://platform.example.org/payloads/".parse().unwrap();
		let joined = join_path(&base, "abc-123");
		assert_eq!(joined.as_str(), "https://platform.example.org/payloads/abc-123");
	}

	#[test]
	fn new_ids_returns_distinct_uuids() {
		let (job_id, payload_id) = new_ids();
		assert_ne!(job_id, payload_id);
	}
}
