//! The Results Service client (`spec.md` §4.6): the Export Service's
//! upstream, used to pull completed platform jobs and to report each
//! export's outcome back.

use std::future::Future;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ResultsServiceConfig;
use crate::error::GatewayError;

#[derive(Debug, Clone, Deserialize)]
pub struct PendingResultJob {
	pub job_id: String,
	pub payload_id: String,
	pub task_id: String,
	/// Relative payload file names the Export Service must download before
	/// pushing them to the configured destinations (§4.6 "Download").
	#[serde(default)]
	pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport<'a> {
	pub task_id: &'a str,
	pub reason: &'a str,
	pub retriable: bool,
}

pub trait ResultsServiceClient: Send + Sync {
	fn pending_jobs(&self) -> impl Future<Output = Result<Vec<PendingResultJob>, GatewayError>> + Send;

	fn report_success(&self, task_id: &str) -> impl Future<Output = Result<(), GatewayError>> + Send;

	fn report_failure(
		&self,
		report: FailureReport<'_>,
	) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

#[derive(Clone)]
pub struct HttpResultsServiceClient {
	http: Client,
	config: ResultsServiceConfig,
}

impl HttpResultsServiceClient {
	#[must_use]
	pub fn new(config: ResultsServiceConfig) -> Self {
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

impl ResultsServiceClient for HttpResultsServiceClient {
	async fn pending_jobs(&self) -> Result<Vec<PendingResultJob>, GatewayError> {
		let url = self
			.config
			.base_url
			.join("pending")
			.map_err(|err| GatewayError::Validation(err.to_string()))?;
		let response = self
			.authorize(self.http.get(url))
			.send()
			.await
			.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;

		if !response.status().is_success() {
			return Err(GatewayError::TransientTransport(format!(
				"results service returned {}",
				response.status()
			)));
		}
		response
			.json()
			.await
			.map_err(|err| GatewayError::DataCorruption(err.to_string()))
	}

	async fn report_success(&self, task_id: &str) -> Result<(), GatewayError> {
		let url = self
			.config
			.base_url
			.join(&format!("{task_id}/success"))
			.map_err(|err| GatewayError::Validation(err.to_string()))?;
		let response = self
			.authorize(self.http.post(url))
			.send()
			.await
			.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
		ensure_success(response)
	}

	async fn report_failure(&self, report: FailureReport<'_>) -> Result<(), GatewayError> {
		let url = self
			.config
			.base_url
			.join(&format!("{}/failure", report.task_id))
			.map_err(|err| GatewayError::Validation(err.to_string()))?;
		let response = self
			.authorize(self.http.post(url).json(&report))
			.send()
			.await
			.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
		ensure_success(response)
	}
}

fn ensure_success(response: reqwest::Response) -> Result<(), GatewayError> {
	if response.status().is_success() {
		Ok(())
	} else {
		Err(GatewayError::TransientTransport(format!(
			"results service returned {}",
			response.status()
		)))
	}
}
