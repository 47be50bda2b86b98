//! The Job-Submission Service (`spec.md` §4.4): drives each [`InferenceJob`]
//! through `Creating -> MetadataUploading -> PayloadUploading -> Starting ->
//! Completed | Faulted` against the downstream [`PlatformClient`].

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cleanup_queue::CleanupQueue;
use crate::config::PlatformConfig;
use crate::entities::{chrono_like::Timestamp, InferenceJob, JobState, JobStatus};
use crate::error::GatewayError;
use crate::job_repository::JobRepository;
use crate::platform::{CreateJobRequest, PlatformClient};
use crate::retry::with_disk_full_retry;
use crate::service_status::ServiceHandle;

pub struct JobSubmissionService<P: PlatformClient> {
	repository: JobRepository,
	platform: Arc<P>,
	platform_config: PlatformConfig,
	cleanup_queue: CleanupQueue,
	poll_interval: Duration,
	metrics: ServiceHandle,
}

impl<P: PlatformClient + 'static> JobSubmissionService<P> {
	#[must_use]
	pub fn new(
		repository: JobRepository,
		platform: Arc<P>,
		platform_config: PlatformConfig,
		cleanup_queue: CleanupQueue,
		poll_interval: Duration,
		metrics: ServiceHandle,
	) -> Self {
		Self {
			repository,
			platform,
			platform_config,
			cleanup_queue,
			poll_interval,
			metrics,
		}
	}

	/// Runs the take-and-advance loop until `cancel` fires. Idle ticks (no
	/// takeable job) sleep for `poll_interval` before trying again.
	///
	/// # Errors
	/// Returns a persistence error if the repository itself becomes
	/// unusable; per-job failures are caught and turned into state
	/// transitions instead of propagated.
	pub async fn run(&self, cancel: CancellationToken) -> Result<(), GatewayError> {
		loop {
			if cancel.is_cancelled() {
				return Ok(());
			}

			let now = Timestamp(now_unix_seconds());
			match self.repository.take(now).await? {
				Some(job) => self.advance(job).await,
				None => {
					tokio::select! {
						() = tokio::time::sleep(self.poll_interval) => {}
						() = cancel.cancelled() => return Ok(()),
					}
				}
			}
		}
	}

	async fn advance(&self, job: InferenceJob) {
		let job_id = job.job_id;
		let result = match job.state {
			JobState::Creating => self.handle_creating(job).await,
			JobState::MetadataUploading => self.handle_metadata_uploading(job).await,
			JobState::PayloadUploading => self.handle_payload_uploading(job).await,
			JobState::Starting => self.handle_starting(job).await,
			JobState::Completed | JobState::Faulted => Ok(()),
		};

		if let Err(err) = result {
			error!(%job_id, "job-submission step failed: {err}");
		}
	}

	async fn handle_creating(&self, mut job: InferenceJob) -> Result<(), GatewayError> {
		let priority = format!("{:?}", job.priority);
		let request = CreateJobRequest {
			job_name: &job.job_name,
			pipeline_id: &job.pipeline_id,
			priority: &priority,
		};

		match self.platform.create_job(request).await {
			Ok(response) => {
				job.platform_job_id = Some(response.job_id);
				job.platform_payload_id = Some(response.payload_id);
				job.state = JobState::MetadataUploading;
				self.repository.update(job).await
			}
			Err(err) => self.fail_or_retry(job, &err).await,
		}
	}

	async fn handle_metadata_uploading(&self, mut job: InferenceJob) -> Result<(), GatewayError> {
		if !self.platform_config.upload_metadata {
			job.state = JobState::PayloadUploading;
			return self.repository.update(job).await;
		}

		let payload_id = job
			.platform_payload_id
			.clone()
			.ok_or_else(|| GatewayError::InvalidState("job has no platform payload id".into()))?;

		let metadata = json!({
			"jobName": job.job_name,
			"source": job.source,
			"instanceCount": job.instances.len(),
		});

		match self.platform.upload_metadata(&payload_id, metadata).await {
			Ok(()) => {
				job.state = JobState::PayloadUploading;
				self.repository.update(job).await
			}
			Err(err) => self.fail_or_retry(job, &err).await,
		}
	}

	async fn handle_payload_uploading(&self, mut job: InferenceJob) -> Result<(), GatewayError> {
		let payload_id = job
			.platform_payload_id
			.clone()
			.ok_or_else(|| GatewayError::InvalidState("job has no platform payload id".into()))?;

		let semaphore = Arc::new(Semaphore::new(self.platform_config.parallel_uploads.max(1)));
		let mut uploads = FuturesUnordered::new();

		for instance in job.instances.clone() {
			let semaphore = Arc::clone(&semaphore);
			let platform = Arc::clone(&self.platform);
			let payload_id = payload_id.clone();
			let cleanup_queue = self.cleanup_queue.clone();

			uploads.push(async move {
				let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
				let relative_path = format!("{}.dcm", instance.sop_instance_uid);
				let result = with_disk_full_retry(|| {
					platform.upload_payload_file(&payload_id, &relative_path, &instance.staging_path)
				})
				.await;

				if result.is_ok() {
					cleanup_queue.enqueue(instance.staging_path.clone());
					cleanup_queue.enqueue(instance.source_staging_path.clone());
				}
				result
			});
		}

		let mut failed_count = 0usize;
		while let Some(result) = uploads.next().await {
			if result.is_err() {
				failed_count += 1;
			}
		}

		if failed_count > 0 {
			let err = GatewayError::PayloadUploadException { failed_count };
			return self.fail_or_retry(job, &err).await;
		}

		job.state = JobState::Starting;
		self.repository.update(job).await
	}

	async fn handle_starting(&self, mut job: InferenceJob) -> Result<(), GatewayError> {
		let platform_job_id = job
			.platform_job_id
			.clone()
			.ok_or_else(|| GatewayError::InvalidState("job has no platform job id".into()))?;

		match self.platform.start_job(&platform_job_id).await {
			Ok(()) => {
				job.state = JobState::Completed;
				job.status = JobStatus::Success;
				self.metrics.record_processed();
				self.repository.update(job).await
			}
			Err(err) => self.fail_or_retry(job, &err).await,
		}
	}

	/// On a retryable failure, re-queues for another `take()`; once
	/// `try_count` exhausts `InferenceJob::MAX_RETRY`, the job is marked
	/// `Faulted` and every staged file — both the job's payload copy and the
	/// original SCP/Data-Retrieval staging file it was copied from — is
	/// enqueued for cleanup (§3 "both locations are reclaimed on terminal
	/// states", §4.4 "terminal cleanup").
	async fn fail_or_retry(&self, mut job: InferenceJob, err: &GatewayError) -> Result<(), GatewayError> {
		job.try_count += 1;
		if job.try_count >= InferenceJob::MAX_RETRY {
			warn!(job_id = %job.job_id, "job faulted after {} attempts: {err}", job.try_count);
			job.state = JobState::Faulted;
			job.status = JobStatus::Fail;
			self.metrics.record_failed();
			self.cleanup_queue.enqueue_all(
				job.instances
					.iter()
					.flat_map(|instance| [instance.staging_path.clone(), instance.source_staging_path.clone()]),
			);
		} else {
			info!(job_id = %job.job_id, attempt = job.try_count, "job step failed, will retry: {err}");
			self.metrics.record_retried();
		}
		self.repository.update(job).await
	}
}

fn now_unix_seconds() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use std::future::Future;
	use std::path::{Path, PathBuf};
	use std::sync::atomic::{AtomicUsize, Ordering};

	use uuid::Uuid;

	use super::*;
	use crate::entities::InstanceStorageInfo;
	use crate::persistence::PersistentTable;
	use crate::platform::{CreateJobResponse, JobStatusResponse};
	use crate::types::Priority;

	struct FakePlatform {
		fail_uploads: AtomicUsize,
	}

	impl PlatformClient for FakePlatform {
		async fn create_job(&self, _request: CreateJobRequest<'_>) -> Result<CreateJobResponse, GatewayError> {
			Ok(CreateJobResponse {
				job_id: "platform-job-1".into(),
				payload_id: "platform-payload-1".into(),
			})
		}

		async fn upload_metadata(&self, _payload_id: &str, _metadata: serde_json::Value) -> Result<(), GatewayError> {
			Ok(())
		}

		async fn upload_payload_file(
			&self,
			_payload_id: &str,
			_relative_path: &str,
			_file: &Path,
		) -> Result<(), GatewayError> {
			if self.fail_uploads.load(Ordering::SeqCst) > 0 {
				self.fail_uploads.fetch_sub(1, Ordering::SeqCst);
				return Err(GatewayError::PermanentTransport("simulated failure".into()));
			}
			Ok(())
		}

		async fn start_job(&self, _job_id: &str) -> Result<(), GatewayError> {
			Ok(())
		}

		async fn job_status(&self, _job_id: &str) -> Result<JobStatusResponse, GatewayError> {
			Ok(JobStatusResponse { state: "Running".into() })
		}

		async fn download_payload_file(
			&self,
			_payload_id: &str,
			_relative_path: &str,
			_destination: &Path,
		) -> Result<(), GatewayError> {
			Ok(())
		}
	}

	fn sample_job(state: JobState) -> InferenceJob {
		InferenceJob {
			job_id: Uuid::new_v4(),
			payload_id: Uuid::new_v4(),
			job_name: "job".into(),
			pipeline_id: "pipeline".into(),
			priority: Priority::Medium,
			staging_path: PathBuf::from("/staging/job1"),
			instances: vec![InstanceStorageInfo {
				sop_instance_uid: "1.2.3".into(),
				study_instance_uid: "1.2".into(),
				series_instance_uid: "1.2.1".into(),
				patient_id: "PAT1".into(),
				staging_path: PathBuf::from("/staging/job1/1.2.3.dcm"),
				source_staging_path: PathBuf::from("/staging/MODALITY1/1.2/1.2.3.dcm"),
				source_aet: "MODALITY1".into(),
				association_id: 1,
			}],
			state,
			status: JobStatus::Pending,
			try_count: 0,
			source: "MODALITY1".into(),
			platform_job_id: None,
			platform_payload_id: None,
			last_taken: None,
		}
	}

	fn platform_config() -> PlatformConfig {
		PlatformConfig {
			jobs_base_url: "http://platform.example/jobs".parse().unwrap(),
			payloads_base_url: "http://platform.example/payloads".parse().unwrap(),
			api_key: None,
			parallel_uploads: 2,
			upload_metadata: true,
			metadata_dicom_source: None,
			request_timeout_ms: 1_000,
		}
	}

	async fn new_service(
		platform: FakePlatform,
	) -> (JobSubmissionService<FakePlatform>, JobRepository, crate::cleanup_queue::CleanupQueueReceiver) {
		let dir = tempfile::tempdir().unwrap();
		let db = crate::persistence::open_database(&dir.path().join("jobs.redb")).unwrap();
		let table = PersistentTable::open(db, "jobs").unwrap();
		let repository = JobRepository::new(table);
		let (cleanup_queue, rx) = CleanupQueue::new();

		(
			JobSubmissionService::new(
				repository.clone(),
				Arc::new(platform),
				platform_config(),
				cleanup_queue,
				Duration::from_millis(10),
				crate::service_status::ServiceRegistry::new().register("job-submission"),
			),
			repository,
			rx,
		)
	}

	#[tokio::test]
	async fn creating_job_advances_to_metadata_uploading() {
		let (service, repository, _rx) = new_service(FakePlatform { fail_uploads: AtomicUsize::new(0) }).await;
		let job = sample_job(JobState::Creating);
		let job_id = job.job_id;
		repository.add(job.clone()).await.unwrap();

		service.advance(job).await;

		let reloaded = repository.find(&job_id.to_string()).await.unwrap().unwrap();
		assert_eq!(reloaded.state, JobState::MetadataUploading);
		assert_eq!(reloaded.platform_job_id.as_deref(), Some("platform-job-1"));
	}

	#[tokio::test]
	async fn payload_uploading_advances_to_starting_when_all_files_succeed() {
		let (service, repository, mut rx) =
			new_service(FakePlatform { fail_uploads: AtomicUsize::new(0) }).await;
		let mut job = sample_job(JobState::PayloadUploading);
		job.platform_payload_id = Some("platform-payload-1".into());
		let job_id = job.job_id;
		repository.add(job.clone()).await.unwrap();

		service.advance(job).await;

		let reloaded = repository.find(&job_id.to_string()).await.unwrap().unwrap();
		assert_eq!(reloaded.state, JobState::Starting);

		// Both the payload copy and the original staged file are reclaimed
		// as soon as their upload succeeds (§3 "both locations are
		// reclaimed").
		let mut enqueued = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
		enqueued.sort();
		let mut expected = vec![
			PathBuf::from("/staging/job1/1.2.3.dcm"),
			PathBuf::from("/staging/MODALITY1/1.2/1.2.3.dcm"),
		];
		expected.sort();
		assert_eq!(enqueued, expected);
	}

	#[tokio::test]
	async fn exhausted_retries_mark_job_faulted() {
		let (service, repository, mut rx) =
			new_service(FakePlatform { fail_uploads: AtomicUsize::new(100) }).await;
		let mut job = sample_job(JobState::PayloadUploading);
		job.platform_payload_id = Some("platform-payload-1".into());
		job.try_count = InferenceJob::MAX_RETRY - 1;
		let job_id = job.job_id;
		repository.add(job.clone()).await.unwrap();

		service.advance(job).await;

		let reloaded = repository.find(&job_id.to_string()).await.unwrap().unwrap();
		assert_eq!(reloaded.state, JobState::Faulted);
		assert_eq!(reloaded.status, JobStatus::Fail);

		let mut enqueued = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
		enqueued.sort();
		let mut expected = vec![
			PathBuf::from("/staging/job1/1.2.3.dcm"),
			PathBuf::from("/staging/MODALITY1/1.2/1.2.3.dcm"),
		];
		expected.sort();
		assert_eq!(enqueued, expected);
	}
}
