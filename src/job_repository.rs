//! The Job Repository (`spec.md` §4.4): durable storage for
//! [`InferenceJob`]s, plus the `take()`/`resetJobState()` semantics the
//! Job-Submission Service's state machine depends on.

use crate::entities::{chrono_like::Timestamp, InferenceJob, InstanceStorageInfo, JobState};
use crate::error::GatewayError;
use crate::persistence::{Label, PersistentTable};
use crate::retry::with_disk_full_retry;

#[derive(Clone)]
pub struct JobRepository {
	table: PersistentTable<InferenceJob>,
}

impl JobRepository {
	#[must_use]
	pub fn new(table: PersistentTable<InferenceJob>) -> Self {
		Self { table }
	}

	/// # Errors
	/// Returns a persistence error if the insert fails.
	pub async fn add(&self, job: InferenceJob) -> Result<(), GatewayError> {
		self.table.add(&job.job_id.to_string(), job).await
	}

	/// `add(job, instances)` (§4.4 "Copying"): copies every source instance
	/// from wherever it is currently staged (SCP staging subtree or
	/// Data-Retrieval's request staging path) into `job.staging_path`, then
	/// inserts the job with its `instances` rewritten to point at the
	/// copies. The original staged files are left untouched — they remain
	/// owned by whoever staged them until their own cleanup path enqueues
	/// them.
	///
	/// IO failures matching the disk-full heuristic (`GatewayError::IoFull`)
	/// retry on the fixed 1s/2s/3s schedule; any other IO error aborts and
	/// propagates immediately.
	///
	/// # Errors
	/// Returns a persistence or IO error if copying or the insert fails.
	pub async fn add_with_instances(
		&self,
		mut job: InferenceJob,
		source_instances: Vec<InstanceStorageInfo>,
	) -> Result<(), GatewayError> {
		let mut payload_instances = Vec::with_capacity(source_instances.len());
		for instance in source_instances {
			let destination = job
				.staging_path
				.join(format!("{}.dcm", instance.sop_instance_uid));
			copy_instance(&instance.staging_path, &destination).await?;
			payload_instances.push(InstanceStorageInfo {
				source_staging_path: instance.staging_path.clone(),
				staging_path: destination,
				..instance
			});
		}
		job.instances = payload_instances;
		self.add(job).await
	}

	/// # Errors
	/// Returns a persistence error if the update fails.
	pub async fn update(&self, job: InferenceJob) -> Result<(), GatewayError> {
		self.table.add(&job.job_id.to_string(), job).await
	}

	/// # Errors
	/// Returns a persistence error if the lookup fails.
	pub async fn find(&self, job_id: &str) -> Result<Option<InferenceJob>, GatewayError> {
		Ok(self.table.find(job_id).await?.map(|row| row.value))
	}

	/// # Errors
	/// Returns a persistence error if the lookup fails.
	pub async fn find_by_payload_id(&self, payload_id: &str) -> Result<Vec<InferenceJob>, GatewayError> {
		Ok(self
			.table
			.find_by_label(Label::PayloadId(payload_id))
			.await?
			.into_iter()
			.map(|row| row.value)
			.collect())
	}

	/// Takes the oldest takeable job (§4.4 `take()`): any non-terminal job,
	/// preferring one that has never been taken, then the least recently
	/// taken. Only `last_taken` is persisted — the job's `state` is left
	/// untouched so a crash between `take()` and the handler completing
	/// resumes in the same state.
	///
	/// # Errors
	/// Returns a persistence error if the update fails.
	pub async fn take(&self, now: Timestamp) -> Result<Option<InferenceJob>, GatewayError> {
		let mut rows = self.table.to_list().await?;
		rows.retain(|row| row.value.state.is_takeable());
		rows.sort_by_key(|row| row.value.last_taken.map_or(0, |t| t.0));

		let Some(row) = rows.into_iter().next() else {
			return Ok(None);
		};

		let mut job = row.value;
		job.last_taken = Some(now);
		self.update(job.clone()).await?;
		Ok(Some(job))
	}

	/// Crash-recovery sweep run once at startup: clears `last_taken` on
	/// every non-terminal job so it becomes takeable again, without
	/// otherwise touching its state. `Completed`/`Faulted` jobs are left
	/// untouched (§4.4, §9 Open Question).
	///
	/// # Errors
	/// Returns a persistence error if a row cannot be updated.
	pub async fn reset_job_state(&self) -> Result<usize, GatewayError> {
		let rows = self.table.to_list().await?;
		let mut reset_count = 0;
		for row in rows {
			let mut job = row.value;
			if job.state.is_terminal() {
				continue;
			}
			if job.last_taken.is_none() {
				continue;
			}
			job.last_taken = None;
			self.update(job).await?;
			reset_count += 1;
		}
		Ok(reset_count)
	}

	/// # Errors
	/// Returns a persistence error if the listing fails.
	pub async fn list_by_state(&self, state: JobState) -> Result<Vec<InferenceJob>, GatewayError> {
		Ok(self
			.table
			.to_list()
			.await?
			.into_iter()
			.filter(|row| row.value.state == state)
			.map(|row| row.value)
			.collect())
	}
}

async fn copy_instance(source: &std::path::Path, destination: &std::path::Path) -> Result<(), GatewayError> {
	if let Some(parent) = destination.parent() {
		tokio::fs::create_dir_all(parent).await.map_err(GatewayError::from_io)?;
	}
	with_disk_full_retry(|| async {
		tokio::fs::copy(source, destination)
			.await
			.map(|_bytes| ())
			.map_err(GatewayError::from_io)
	})
	.await
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use super::*;
	use crate::entities::JobStatus;
	use crate::types::Priority;
	use uuid::Uuid;

	fn sample_job() -> InferenceJob {
		InferenceJob {
			job_id: Uuid::new_v4(),
			payload_id: Uuid::new_v4(),
			job_name: "job".into(),
			pipeline_id: "pipeline".into(),
			priority: Priority::Medium,
			staging_path: PathBuf::from("/staging/job1"),
			instances: vec![],
			state: JobState::Creating,
			status: JobStatus::Pending,
			try_count: 0,
			source: "MODALITY1".into(),
			platform_job_id: None,
			platform_payload_id: None,
			last_taken: None,
		}
	}

	async fn new_repository() -> JobRepository {
		let dir = tempfile::tempdir().unwrap();
		let db = crate::persistence::open_database(&dir.path().join("jobs.redb")).unwrap();
		let table = PersistentTable::open(db, "jobs").unwrap();
		JobRepository::new(table)
	}

	#[tokio::test]
	async fn take_marks_last_taken_without_changing_state() {
		let repo = new_repository().await;
		repo.add(sample_job()).await.unwrap();

		let taken = repo.take(Timestamp(1)).await.unwrap().unwrap();
		assert_eq!(taken.state, JobState::Creating);
		assert_eq!(taken.last_taken, Some(Timestamp(1)));
	}

	#[tokio::test]
	async fn completed_jobs_are_never_taken() {
		let repo = new_repository().await;
		let mut job = sample_job();
		job.state = JobState::Completed;
		repo.add(job).await.unwrap();

		assert!(repo.take(Timestamp(1)).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn reset_job_state_clears_last_taken_but_not_terminal_jobs() {
		let repo = new_repository().await;
		let mut in_flight = sample_job();
		in_flight.state = JobState::PayloadUploading;
		in_flight.last_taken = Some(Timestamp(5));
		repo.add(in_flight.clone()).await.unwrap();

		let mut completed = sample_job();
		completed.state = JobState::Completed;
		completed.last_taken = Some(Timestamp(5));
		repo.add(completed.clone()).await.unwrap();

		let reset_count = repo.reset_job_state().await.unwrap();
		assert_eq!(reset_count, 1);

		let reloaded = repo.find(&in_flight.job_id.to_string()).await.unwrap().unwrap();
		assert_eq!(reloaded.state, JobState::PayloadUploading);
		assert_eq!(reloaded.last_taken, None);

		let reloaded_completed = repo.find(&completed.job_id.to_string()).await.unwrap().unwrap();
		assert_eq!(reloaded_completed.last_taken, Some(Timestamp(5)));
	}

	#[tokio::test]
	async fn add_with_instances_copies_files_into_the_job_payload_directory() {
		let repo = new_repository().await;
		let source_dir = tempfile::tempdir().unwrap();
		let source_path = source_dir.path().join("1.2.3.dcm");
		std::fs::write(&source_path, b"dicom-bytes").unwrap();

		let payload_dir = tempfile::tempdir().unwrap();
		let mut job = sample_job();
		job.staging_path = payload_dir.path().to_path_buf();
		let job_id = job.job_id;

		let instance = InstanceStorageInfo {
			sop_instance_uid: "1.2.3".into(),
			study_instance_uid: "1.2".into(),
			series_instance_uid: "1.2.1".into(),
			patient_id: "PAT1".into(),
			staging_path: source_path.clone(),
			source_staging_path: PathBuf::new(),
			source_aet: "MODALITY1".into(),
			association_id: 1,
		};

		repo.add_with_instances(job, vec![instance]).await.unwrap();

		let reloaded = repo.find(&job_id.to_string()).await.unwrap().unwrap();
		assert_eq!(reloaded.instances.len(), 1);
		let copied_path = &reloaded.instances[0].staging_path;
		assert_eq!(copied_path, &payload_dir.path().join("1.2.3.dcm"));
		assert!(copied_path.exists());
		assert_eq!(reloaded.instances[0].source_staging_path, source_path);
		assert!(source_path.exists(), "source file must remain until its own reclaimer enqueues it");
	}
}
