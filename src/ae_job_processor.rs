//! Per-AE job processors (`spec.md` §2 item 4, §4.1): the Notification Bus
//! subscribers that turn newly-staged SCP instances into [`InferenceJob`]s,
//! completing the `SCP admission -> staging dir -> notification bus ->
//! per-AE processor -> Job Repository` data flow of §2.
//!
//! One task runs per configured [`ApplicationEntity`] whose `processor` is
//! `"inference-submit"` (`ae_manager::BUILTIN_PROCESSORS`). Instances are
//! grouped by their originating association and flushed into a single job
//! once that association has been quiet for `debounce` — a C-STORE
//! association typically sends every instance of one study back to back,
//! so "no new instance for a while" is a reasonable proxy for "the sender
//! has moved on".

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::{ApplicationEntity, InferenceJob, InstanceStorageInfo, JobState, JobStatus};
use crate::job_repository::JobRepository;
use crate::notification_bus::NotificationBus;
use crate::types::Priority;

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Runs the per-AE processor for `ae` until `cancel` fires.
pub async fn run(
	ae: ApplicationEntity,
	bus: NotificationBus,
	job_repository: JobRepository,
	jobs_staging_root: std::path::PathBuf,
	cancel: CancellationToken,
) {
	let mut subscription = bus.subscribe(ae.aet.clone()).await;
	let mut pending: HashMap<u32, Vec<InstanceStorageInfo>> = HashMap::new();

	loop {
		let recv = tokio::time::timeout(DEFAULT_DEBOUNCE, subscription.recv());
		tokio::select! {
			() = cancel.cancelled() => {
				flush_all(&ae, &job_repository, &jobs_staging_root, &mut pending).await;
				return;
			}
			result = recv => match result {
				Ok(Some(instance)) => {
					pending.entry(instance.association_id).or_default().push(instance);
				}
				Ok(None) => {
					flush_all(&ae, &job_repository, &jobs_staging_root, &mut pending).await;
					return;
				}
				Err(_elapsed) => {
					flush_all(&ae, &job_repository, &jobs_staging_root, &mut pending).await;
				}
			},
		}
	}
}

async fn flush_all(
	ae: &ApplicationEntity,
	job_repository: &JobRepository,
	jobs_staging_root: &std::path::Path,
	pending: &mut HashMap<u32, Vec<InstanceStorageInfo>>,
) {
	for (association_id, instances) in pending.drain() {
		if instances.is_empty() {
			continue;
		}
		flush_association(ae, job_repository, jobs_staging_root, association_id, instances).await;
	}
}

async fn flush_association(
	ae: &ApplicationEntity,
	job_repository: &JobRepository,
	jobs_staging_root: &std::path::Path,
	association_id: u32,
	instances: Vec<InstanceStorageInfo>,
) {
	let job_id = Uuid::new_v4();
	let pipeline_id = ae
		.processor_settings
		.get("pipelineId")
		.cloned()
		.unwrap_or_else(|| "default".to_string());
	let priority = ae
		.processor_settings
		.get("priority")
		.and_then(|value| match value.as_str() {
			"low" => Some(Priority::Low),
			"high" => Some(Priority::High),
			"medium" => Some(Priority::Medium),
			_ => None,
		})
		.unwrap_or_default();

	let job = InferenceJob {
		job_id,
		payload_id: Uuid::new_v4(),
		job_name: format!("{}-{association_id}", ae.name),
		pipeline_id,
		priority,
		staging_path: jobs_staging_root.join(job_id.to_string()),
		instances: Vec::new(),
		state: JobState::Creating,
		status: JobStatus::Pending,
		try_count: 0,
		source: ae.name.clone(),
		platform_job_id: None,
		platform_payload_id: None,
		last_taken: None,
	};

	info!(ae = %ae.name, association_id, job_id = %job_id, instance_count = instances.len(), "creating inference job from stored association");
	if let Err(err) = job_repository.add_with_instances(job, instances).await {
		error!(ae = %ae.name, association_id, "failed to create inference job from stored instances: {err}");
	}
}

/// Spawns one processor task per configured AE whose processor is
/// `"inference-submit"`; AEs using `"archive-only"` stage instances without
/// any automatic submission (§4.1 processor descriptors).
pub fn spawn_all(
	aes: Vec<ApplicationEntity>,
	bus: NotificationBus,
	job_repository: JobRepository,
	jobs_staging_root: std::path::PathBuf,
	cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
	aes.into_iter()
		.filter(|ae| ae.processor == "inference-submit")
		.map(|ae| {
			let bus = bus.clone();
			let job_repository = job_repository.clone();
			let jobs_staging_root = jobs_staging_root.clone();
			let cancel = cancel.clone();
			tokio::spawn(async move {
				run(ae, bus, job_repository, jobs_staging_root, cancel).await;
			})
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use super::*;

	fn sample_ae() -> ApplicationEntity {
		ApplicationEntity {
			name: "MODALITY1".into(),
			aet: crate::types::AeTitle::new("MODALITY1").unwrap(),
			ignored_sop_classes: vec![],
			overwrite_same_instance: false,
			processor: "inference-submit".into(),
			processor_settings: std::collections::HashMap::from([(
				"pipelineId".to_string(),
				"pipeline-1".to_string(),
			)]),
		}
	}

	fn sample_instance(association_id: u32, uid: &str) -> InstanceStorageInfo {
		InstanceStorageInfo {
			sop_instance_uid: uid.into(),
			study_instance_uid: "1.2".into(),
			series_instance_uid: "1.2.1".into(),
			patient_id: "PAT1".into(),
			staging_path: PathBuf::from(format!("/staging/MODALITY1/1.2/{uid}.dcm")),
			source_staging_path: PathBuf::new(),
			source_aet: "MODALITY1".into(),
			association_id,
		}
	}

	async fn new_job_repository() -> JobRepository {
		let dir = tempfile::tempdir().unwrap();
		let db = crate::persistence::open_database(&dir.path().join("jobs.redb")).unwrap();
		let table = crate::persistence::PersistentTable::open(db, "jobs").unwrap();
		JobRepository::new(table)
	}

	#[tokio::test]
	async fn debounce_timeout_flushes_pending_instances_into_one_job_per_association() {
		let source_dir = tempfile::tempdir().unwrap();
		let src = source_dir.path().join("1.2.3.dcm");
		std::fs::write(&src, b"dicom-bytes").unwrap();

		let ae = sample_ae();
		let bus = NotificationBus::new();
		let job_repository = new_job_repository().await;
		let jobs_root = tempfile::tempdir().unwrap();
		let cancel = CancellationToken::new();

		let mut instance = sample_instance(1, "1.2.3");
		instance.staging_path = src.clone();
		bus.publish(&ae.aet, instance).await;

		let handle = tokio::spawn(run(
			ae.clone(),
			bus.clone(),
			job_repository.clone(),
			jobs_root.path().to_path_buf(),
			cancel.clone(),
		));

		// Let the debounce timeout (2s) elapse, then cancel so the test does
		// not wait on an unbounded run loop.
		tokio::time::sleep(Duration::from_millis(2100)).await;
		cancel.cancel();
		handle.await.unwrap();

		let jobs = job_repository.list_by_state(JobState::Creating).await.unwrap();
		assert_eq!(jobs.len(), 1);
		assert_eq!(jobs[0].pipeline_id, "pipeline-1");
		assert_eq!(jobs[0].instances.len(), 1);
	}
}
