//! The Export Service (`spec.md` §4.6): polls the results service for
//! completed platform jobs, downloads their output files, pushes them to a
//! configured destination, and reports the outcome back.
//!
//! The pipeline itself (Query -> Convert -> Download -> Export -> Report) is
//! generic over an [`ExportSink`] that supplies the two destination-specific
//! stages — Convert and Export — so the DICOMweb STOW-RS and DICOM C-STORE
//! SCU variants of §4.6 share the download/threshold/report plumbing.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dicom::object::open_file;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::ae_manager::AeManager;
use crate::backend::dimse::association::pool::AssociationPools;
use crate::backend::dimse::cstore::storescu::StoreServiceClassUser;
use crate::cleanup_queue::CleanupQueue;
use crate::config::ExportConfig;
use crate::entities::{AuthType, ConnectionDetails, OutputJob, ResourceInterface};
use crate::error::GatewayError;
use crate::inference_request_store::InferenceRequestStore;
use crate::platform::PlatformClient;
use crate::results_service::{FailureReport, PendingResultJob, ResultsServiceClient};
use crate::retry::with_disk_full_retry;
use crate::storage_info::StorageInfoProvider;

/// Outcome of the Convert stage (§4.6 step 2): zero-or-more `OutputJob`s, or
/// an immediate non-retriable failure report when the task cannot be
/// converted at all (e.g. no matching destination configured).
pub enum ConvertOutcome {
	Skip,
	ReportFailure(String),
	Jobs(Vec<OutputJob>),
}

/// The destination-specific half of the export pipeline (§4.6 "subclass-defined").
pub trait ExportSink: Send + Sync {
	fn convert(&self, task: &PendingResultJob) -> impl Future<Output = ConvertOutcome> + Send;

	/// Sends the already-downloaded files to the destination, returning
	/// `(success_count, failure_count)` for this stage only.
	fn export(
		&self,
		job: &OutputJob,
		downloaded: &[PathBuf],
	) -> impl Future<Output = (usize, usize)> + Send;
}

pub struct ExportService<R: ResultsServiceClient, P: PlatformClient, S: ExportSink> {
	results: Arc<R>,
	platform: Arc<P>,
	sink: S,
	storage: StorageInfoProvider,
	cleanup_queue: CleanupQueue,
	export_staging_root: PathBuf,
	poll_interval: Duration,
	concurrency: usize,
	failure_threshold: f64,
}

impl<R, P, S> ExportService<R, P, S>
where
	R: ResultsServiceClient + 'static,
	P: PlatformClient + 'static,
	S: ExportSink + 'static,
{
	#[must_use]
	pub fn new(
		results: Arc<R>,
		platform: Arc<P>,
		sink: S,
		storage: StorageInfoProvider,
		cleanup_queue: CleanupQueue,
		export_staging_root: PathBuf,
		config: &ExportConfig,
	) -> Self {
		Self {
			results,
			platform,
			sink,
			storage,
			cleanup_queue,
			export_staging_root,
			poll_interval: Duration::from_millis(config.poll_frequency_ms),
			concurrency: config.concurrency,
			failure_threshold: config.failure_threshold,
		}
	}

	/// Runs the poll loop until `cancel` fires.
	///
	/// # Errors
	/// Returns a [`GatewayError`] if the storage backpressure check itself
	/// fails; per-task failures are caught and turned into results-service
	/// reports instead of propagated.
	pub async fn run(&self, cancel: CancellationToken) -> Result<(), GatewayError> {
		loop {
			if cancel.is_cancelled() {
				return Ok(());
			}

			if !self.storage.has_space_available_for_export()? {
				tokio::select! {
					() = tokio::time::sleep(self.poll_interval) => continue,
					() = cancel.cancelled() => return Ok(()),
				}
			}

			let tasks = match self.results.pending_jobs().await {
				Ok(tasks) => tasks,
				Err(err) => {
					warn!("failed to poll results service for pending jobs: {err}");
					Vec::new()
				}
			};

			if tasks.is_empty() {
				tokio::select! {
					() = tokio::time::sleep(self.poll_interval) => continue,
					() = cancel.cancelled() => return Ok(()),
				}
			}

			let semaphore = Semaphore::new(self.concurrency.max(1));
			let mut pending = FuturesUnordered::new();
			for task in &tasks {
				pending.push(async {
					let _permit = semaphore.acquire().await.expect("semaphore never closed");
					self.process_task(task).await;
				});
			}
			while pending.next().await.is_some() {}
		}
	}

	async fn process_task(&self, task: &PendingResultJob) {
		match self.sink.convert(task).await {
			ConvertOutcome::Skip => {}
			ConvertOutcome::ReportFailure(reason) => {
				self.report_failure(task, &reason, false).await;
			}
			ConvertOutcome::Jobs(jobs) => {
				for job in jobs {
					self.process_output_job(task, job).await;
				}
			}
		}
	}

	/// §4.6 steps 3-5 for a single `OutputJob`: download every file,
	/// dropping the job with a non-retriable failure report if the download
	/// failure ratio exceeds `failureThreshold`; otherwise hand the
	/// downloaded files to the sink's Export stage and report the combined
	/// outcome.
	async fn process_output_job(&self, task: &PendingResultJob, mut job: OutputJob) {
		let mut downloaded = Vec::with_capacity(job.files.len());
		let mut failure_count = 0usize;

		for relative in &job.files {
			let relative_path = relative.to_string_lossy().into_owned();
			let destination = self.export_staging_root.join(&job.task_id).join(&relative_path);
			let result = with_disk_full_retry(|| {
				self.platform
					.download_payload_file(&job.payload_id, &relative_path, &destination)
			})
			.await;

			match result {
				Ok(()) => downloaded.push(destination),
				Err(err) => {
					warn!(task_id = %task.task_id, file = %relative_path, "failed to download export payload file: {err}");
					failure_count += 1;
				}
			}
		}

		job.success_count = downloaded.len();
		job.failure_count = failure_count;

		if job.failure_ratio() > self.failure_threshold {
			warn!(
				task_id = %task.task_id,
				ratio = job.failure_ratio(),
				"dropping export job: download failure ratio exceeds threshold"
			);
			self.cleanup_queue.enqueue_all(downloaded);
			self.report_failure(task, "download failure ratio exceeded threshold", false)
				.await;
			return;
		}

		let (export_success, export_failure) = self.sink.export(&job, &downloaded).await;
		job.success_count += export_success;
		job.failure_count += export_failure;

		self.cleanup_queue.enqueue_all(downloaded);

		if job.success_count > 0 && job.failure_count == 0 {
			self.report_success(task).await;
		} else {
			let retriable = job.failure_ratio() < self.failure_threshold;
			let reason = format!(
				"export completed with {} success(es) and {} failure(s)",
				job.success_count, job.failure_count
			);
			self.report_failure(task, &reason, retriable).await;
		}
	}

	async fn report_success(&self, task: &PendingResultJob) {
		if let Err(err) = self.results.report_success(&task.task_id).await {
			error!(task_id = %task.task_id, "failed to report export success: {err}");
		}
	}

	async fn report_failure(&self, task: &PendingResultJob, reason: &str, retriable: bool) {
		if let Err(err) = self
			.results
			.report_failure(FailureReport {
				task_id: &task.task_id,
				reason,
				retriable,
			})
			.await
		{
			error!(task_id = %task.task_id, "failed to report export failure: {err}");
		}
	}
}

/// DICOMweb STOW-RS export sink (§4.6 "DICOMweb variant"): looks up the
/// `InferenceRequest` that produced the job, POSTs every downloaded file to
/// each `DicomWeb` output resource's `studies/` endpoint.
pub struct DicomWebExportSink {
	requests: InferenceRequestStore,
	http: Client,
}

impl DicomWebExportSink {
	#[must_use]
	pub fn new(requests: InferenceRequestStore) -> Self {
		Self {
			requests,
			http: Client::new(),
		}
	}

	fn authorize(&self, request: reqwest::RequestBuilder, connection: &ConnectionDetails) -> reqwest::RequestBuilder {
		match connection.auth_type {
			AuthType::Basic => request.header("Authorization", format!("Basic {}", connection.auth_token)),
			AuthType::Bearer => request.bearer_auth(&connection.auth_token),
		}
	}

	fn output_connections(request: &crate::entities::InferenceRequest) -> Vec<ConnectionDetails> {
		request
			.output_resources
			.iter()
			.filter(|resource| resource.interface == ResourceInterface::DicomWeb)
			.filter_map(|resource| resource.connection.clone())
			.collect()
	}

	async fn store_instance(&self, connection: &ConnectionDetails, path: &Path) -> Result<(), GatewayError> {
		let bytes = tokio::fs::read(path).await.map_err(GatewayError::from_io)?;
		let url = connection
			.uri
			.join("studies")
			.map_err(|err| GatewayError::Validation(err.to_string()))?;
		let part = reqwest::multipart::Part::bytes(bytes)
			.mime_str("application/dicom")
			.map_err(|err| GatewayError::Validation(err.to_string()))?;
		let form = reqwest::multipart::Form::new().part("file", part);

		let response = self
			.authorize(self.http.post(url).multipart(form), connection)
			.send()
			.await
			.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;

		if response.status() == reqwest::StatusCode::OK {
			Ok(())
		} else {
			Err(GatewayError::PermanentTransport(format!(
				"stow-rs returned {}",
				response.status()
			)))
		}
	}
}

impl ExportSink for DicomWebExportSink {
	async fn convert(&self, task: &PendingResultJob) -> ConvertOutcome {
		let requests = match self.requests.find_by_job_id(&task.job_id).await {
			Ok(requests) => requests,
			Err(err) => return ConvertOutcome::ReportFailure(format!("failed to look up inference request: {err}")),
		};
		let Some(request) = requests.into_iter().next() else {
			return ConvertOutcome::ReportFailure(format!("no inference request found for job {}", task.job_id));
		};

		let connections = Self::output_connections(&request);
		if connections.is_empty() {
			return ConvertOutcome::ReportFailure(format!(
				"inference request {} has no DicomWeb output resource",
				request.transaction_id
			));
		}

		ConvertOutcome::Jobs(
			connections
				.into_iter()
				.map(|connection| OutputJob {
					task_id: task.task_id.clone(),
					payload_id: task.payload_id.clone(),
					job_id: task.job_id.clone(),
					agent: connection.uri.to_string(),
					files: task.files.iter().map(PathBuf::from).collect(),
					success_count: 0,
					failure_count: 0,
				})
				.collect(),
		)
	}

	async fn export(&self, job: &OutputJob, downloaded: &[PathBuf]) -> (usize, usize) {
		let requests = match self.requests.find_by_job_id(&job.job_id).await {
			Ok(requests) => requests,
			Err(err) => {
				error!(job_id = %job.job_id, "failed to re-resolve inference request for export: {err}");
				return (0, downloaded.len());
			}
		};
		let Some(connection) = requests
			.into_iter()
			.next()
			.map(|request| Self::output_connections(&request))
			.into_iter()
			.flatten()
			.find(|connection| connection.uri.as_str() == job.agent)
		else {
			return (0, downloaded.len());
		};

		let mut success = 0;
		let mut failure = 0;
		for path in downloaded {
			match self.store_instance(&connection, path).await {
				Ok(()) => success += 1,
				Err(err) => {
					warn!(job_id = %job.job_id, destination = %job.agent, "stow-rs export failed: {err}");
					failure += 1;
				}
			}
		}
		(success, failure)
	}
}

/// DICOM C-STORE SCU export sink (§4.6 "DICOM SCU variant"): looks up a
/// `DestinationApplicationEntity` by name, opens/reuses a pooled
/// association, and sends each downloaded file, retrying up to
/// `max_association_retries` times when the association itself fails.
pub struct DicomScuExportSink {
	ae_manager: AeManager,
	pools: AssociationPools,
	timeout: Duration,
	destination_name: String,
	max_association_retries: u32,
}

impl DicomScuExportSink {
	#[must_use]
	pub fn new(
		ae_manager: AeManager,
		pools: AssociationPools,
		timeout: Duration,
		destination_name: String,
		max_association_retries: u32,
	) -> Self {
		Self {
			ae_manager,
			pools,
			timeout,
			destination_name,
			max_association_retries,
		}
	}

	async fn send_with_retry(&self, scu: &StoreServiceClassUser, path: &Path) -> Result<(), GatewayError> {
		let mut attempt = 0u32;
		loop {
			let object =
				open_file(path).map_err(|err| GatewayError::DataCorruption(err.to_string()))?;
			match scu.store(object).await {
				Ok(()) => return Ok(()),
				Err(err) => {
					attempt += 1;
					if attempt > self.max_association_retries {
						return Err(GatewayError::TransientTransport(err.to_string()));
					}
					warn!(attempt, "association store attempt failed, retrying: {err}");
				}
			}
		}
	}
}

impl ExportSink for DicomScuExportSink {
	async fn convert(&self, task: &PendingResultJob) -> ConvertOutcome {
		match self.ae_manager.find_destination(&self.destination_name).await {
			Ok(Some(_destination)) => ConvertOutcome::Jobs(vec![OutputJob {
				task_id: task.task_id.clone(),
				payload_id: task.payload_id.clone(),
				job_id: task.job_id.clone(),
				agent: self.destination_name.clone(),
				files: task.files.iter().map(PathBuf::from).collect(),
				success_count: 0,
				failure_count: 0,
			}]),
			Ok(None) => ConvertOutcome::ReportFailure(format!(
				"destination application entity '{}' is not configured",
				self.destination_name
			)),
			Err(err) => ConvertOutcome::ReportFailure(format!(
				"failed to look up destination '{}': {err}",
				self.destination_name
			)),
		}
	}

	async fn export(&self, job: &OutputJob, downloaded: &[PathBuf]) -> (usize, usize) {
		let Some(pool) = self.pools.get(&job.agent) else {
			warn!(destination = %job.agent, "association pool missing for export destination");
			return (0, downloaded.len());
		};
		let scu = StoreServiceClassUser::new(pool.clone(), self.timeout);

		let mut success = 0;
		let mut failure = 0;
		for path in downloaded {
			match self.send_with_retry(&scu, path).await {
				Ok(()) => success += 1,
				Err(err) => {
					warn!(destination = %job.agent, "dicom c-store export failed: {err}");
					failure += 1;
				}
			}
		}
		(success, failure)
	}
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::platform::{CreateJobRequest, CreateJobResponse, JobStatusResponse};

	struct FakePlatform {
		fail_downloads: AtomicUsize,
	}

	impl PlatformClient for FakePlatform {
		async fn create_job(&self, _request: CreateJobRequest<'_>) -> Result<CreateJobResponse, GatewayError> {
			unreachable!("export service does not call create_job")
		}

		async fn upload_metadata(&self, _payload_id: &str, _metadata: serde_json::Value) -> Result<(), GatewayError> {
			unreachable!("export service does not call upload_metadata")
		}

		async fn upload_payload_file(
			&self,
			_payload_id: &str,
			_relative_path: &str,
			_file: &Path,
		) -> Result<(), GatewayError> {
			unreachable!("export service does not call upload_payload_file")
		}

		async fn start_job(&self, _job_id: &str) -> Result<(), GatewayError> {
			unreachable!("export service does not call start_job")
		}

		async fn job_status(&self, _job_id: &str) -> Result<JobStatusResponse, GatewayError> {
			unreachable!("export service does not call job_status")
		}

		async fn download_payload_file(
			&self,
			_payload_id: &str,
			_relative_path: &str,
			destination: &Path,
		) -> Result<(), GatewayError> {
			if self.fail_downloads.load(Ordering::SeqCst) > 0 {
				self.fail_downloads.fetch_sub(1, Ordering::SeqCst);
				return Err(GatewayError::PermanentTransport("simulated download failure".into()));
			}
			if let Some(parent) = destination.parent() {
				tokio::fs::create_dir_all(parent).await.map_err(GatewayError::from_io)?;
			}
			tokio::fs::write(destination, b"dicom-bytes").await.map_err(GatewayError::from_io)
		}
	}

	#[derive(Default)]
	struct FakeResultsService {
		pending: std::sync::Mutex<Vec<PendingResultJob>>,
		successes: std::sync::Mutex<Vec<String>>,
		failures: std::sync::Mutex<Vec<(String, bool)>>,
	}

	impl ResultsServiceClient for FakeResultsService {
		async fn pending_jobs(&self) -> Result<Vec<PendingResultJob>, GatewayError> {
			let mut guard = self.pending.lock().unwrap();
			Ok(std::mem::take(&mut *guard))
		}

		async fn report_success(&self, task_id: &str) -> Result<(), GatewayError> {
			self.successes.lock().unwrap().push(task_id.to_string());
			Ok(())
		}

		async fn report_failure(&self, report: FailureReport<'_>) -> Result<(), GatewayError> {
			self.failures
				.lock()
				.unwrap()
				.push((report.task_id.to_string(), report.retriable));
			Ok(())
		}
	}

	struct FakeSink {
		export_failures: AtomicUsize,
	}

	impl ExportSink for FakeSink {
		async fn convert(&self, task: &PendingResultJob) -> ConvertOutcome {
			ConvertOutcome::Jobs(vec![OutputJob {
				task_id: task.task_id.clone(),
				payload_id: task.payload_id.clone(),
				job_id: task.job_id.clone(),
				agent: "fake-destination".into(),
				files: task.files.iter().map(PathBuf::from).collect(),
				success_count: 0,
				failure_count: 0,
			}])
		}

		async fn export(&self, _job: &OutputJob, downloaded: &[PathBuf]) -> (usize, usize) {
			if self.export_failures.load(Ordering::SeqCst) > 0 {
				self.export_failures.fetch_sub(1, Ordering::SeqCst);
				return (0, downloaded.len());
			}
			(downloaded.len(), 0)
		}
	}

	fn sample_config() -> ExportConfig {
		ExportConfig {
			agent: "fake-agent".into(),
			poll_frequency_ms: 10,
			maximum_number_of_associations: 1,
			failure_threshold: 0.5,
			concurrency: 2,
		}
	}

	fn sample_task(task_id: &str, files: &[&str]) -> PendingResultJob {
		PendingResultJob {
			job_id: "job-1".into(),
			payload_id: "payload-1".into(),
			task_id: task_id.into(),
			files: files.iter().map(|f| (*f).to_string()).collect(),
		}
	}

	fn sample_storage() -> StorageInfoProvider {
		StorageInfoProvider::new(&crate::config::StorageConfig {
			temporary: std::env::temp_dir(),
			min_free_bytes_to_store: 0,
			min_free_bytes_to_retrieve: 0,
			min_free_bytes_to_export: 0,
		})
	}

	#[tokio::test]
	async fn successful_export_reports_success() {
		let results = Arc::new(FakeResultsService::default());
		results.pending.lock().unwrap().push(sample_task("task-1", &["a.dcm", "b.dcm"]));
		let platform = Arc::new(FakePlatform { fail_downloads: AtomicUsize::new(0) });
		let sink = FakeSink { export_failures: AtomicUsize::new(0) };
		let (cleanup_queue, _rx) = CleanupQueue::new();
		let staging = tempfile::tempdir().unwrap();

		let service = ExportService::new(
			Arc::clone(&results),
			platform,
			sink,
			sample_storage(),
			cleanup_queue,
			staging.path().to_path_buf(),
			&sample_config(),
		);

		let task = results.pending.lock().unwrap().pop().unwrap();
		service.process_task(&task).await;

		assert_eq!(results.successes.lock().unwrap().as_slice(), ["task-1"]);
		assert!(results.failures.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn download_failure_ratio_above_threshold_drops_job_non_retriable() {
		let results = Arc::new(FakeResultsService::default());
		let platform = Arc::new(FakePlatform { fail_downloads: AtomicUsize::new(2) });
		let sink = FakeSink { export_failures: AtomicUsize::new(0) };
		let (cleanup_queue, _rx) = CleanupQueue::new();
		let staging = tempfile::tempdir().unwrap();

		let service = ExportService::new(
			Arc::clone(&results),
			platform,
			sink,
			sample_storage(),
			cleanup_queue,
			staging.path().to_path_buf(),
			&sample_config(),
		);

		let task = sample_task("task-2", &["a.dcm", "b.dcm"]);
		service.process_task(&task).await;

		let failures = results.failures.lock().unwrap();
		assert_eq!(failures.as_slice(), [("task-2".to_string(), false)]);
	}

	#[tokio::test]
	async fn partial_export_failure_reports_retriable_failure() {
		let results = Arc::new(FakeResultsService::default());
		let platform = Arc::new(FakePlatform { fail_downloads: AtomicUsize::new(0) });
		let sink = FakeSink { export_failures: AtomicUsize::new(1) };
		let (cleanup_queue, _rx) = CleanupQueue::new();
		let staging = tempfile::tempdir().unwrap();

		let service = ExportService::new(
			Arc::clone(&results),
			platform,
			sink,
			sample_storage(),
			cleanup_queue,
			staging.path().to_path_buf(),
			&sample_config(),
		);

		let task = sample_task("task-3", &["a.dcm"]);
		service.process_task(&task).await;

		let failures = results.failures.lock().unwrap();
		assert_eq!(failures.len(), 1);
		assert_eq!(failures[0].0, "task-3");
		assert!(failures[0].1, "a single failed file out of one stays below the 0.5 threshold");
	}
}
