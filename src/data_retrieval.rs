//! The Data-Retrieval Service (`spec.md` §4.5): consumes inference requests,
//! restores whatever is already staged, fetches the rest over DICOMweb, and
//! hands a fully staged request to the Job Repository as an [`InferenceJob`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::dicomweb_client::DicomWebClient;
use crate::entities::{
	InferenceRequest, InputMetadata, InputResource, InstanceStorageInfo, JobState, JobStatus,
	RequestStatus, ResourceInterface,
};
use crate::error::GatewayError;
use crate::inference_request_store::InferenceRequestStore;
use crate::job_repository::JobRepository;
use crate::storage_info::StorageInfoProvider;

pub struct DataRetrievalService {
	store: InferenceRequestStore,
	job_repository: JobRepository,
	storage: StorageInfoProvider,
	client: DicomWebClient,
	poll_interval: Duration,
}

impl DataRetrievalService {
	#[must_use]
	pub fn new(
		store: InferenceRequestStore,
		job_repository: JobRepository,
		storage: StorageInfoProvider,
		client: DicomWebClient,
		poll_interval: Duration,
	) -> Self {
		Self {
			store,
			job_repository,
			storage,
			client,
			poll_interval,
		}
	}

	/// Runs the take-and-retrieve loop until `cancel` fires.
	///
	/// # Errors
	/// Returns a persistence error if the request store itself becomes
	/// unusable; per-request failures are caught and turned into retries or
	/// terminal failures instead of propagated.
	pub async fn run(&self, cancel: CancellationToken) -> Result<(), GatewayError> {
		loop {
			if cancel.is_cancelled() {
				return Ok(());
			}

			// §4.5 Admission: pause consuming new requests while storage is
			// under pressure, without rejecting work already accepted.
			if !self.storage.has_space_available_to_retrieve()? {
				tokio::select! {
					() = tokio::time::sleep(self.poll_interval) => continue,
					() = cancel.cancelled() => return Ok(()),
				}
			}

			match self.store.take().await? {
				Some(request) => self.process(request).await,
				None => {
					tokio::select! {
						() = tokio::time::sleep(self.poll_interval) => {}
						() = cancel.cancelled() => return Ok(()),
					}
				}
			}
		}
	}

	async fn process(&self, request: InferenceRequest) {
		let transaction_id = request.transaction_id.clone();
		match self.retrieve(&request).await {
			Ok(instances) if instances.is_empty() => {
				warn!(transaction_id, "no instances retrieved for this request");
				self.fail_or_retry(request, "no instances were retrieved for this request").await;
			}
			Ok(instances) => {
				if let Err(err) = self.create_job(&request, instances).await {
					error!(transaction_id, "failed to create inference job: {err}");
					self.fail_or_retry(request, &err.to_string()).await;
				} else if let Err(err) = self.store.complete(request, RequestStatus::Success).await {
					error!(transaction_id, "failed to mark request completed: {err}");
				}
			}
			Err(err) => {
				error!(transaction_id, "retrieval failed: {err}");
				self.fail_or_retry(request, &err.to_string()).await;
			}
		}
	}

	/// Restores any already-staged instances, then retrieves the rest
	/// according to each non-algorithm input resource's `Interface` and the
	/// request's `InputMetadata` dispatch (§4.5).
	async fn retrieve(&self, request: &InferenceRequest) -> Result<Vec<InstanceStorageInfo>, GatewayError> {
		let mut seen = HashMap::new();

		for instance in restore_staged_instances(&request.staging_path) {
			seen.entry(instance.sop_instance_uid.clone()).or_insert(instance);
		}

		for resource in &request.input_resources {
			if resource.interface == ResourceInterface::Algorithm {
				continue;
			}

			if !self.storage.has_space_available_to_retrieve()? {
				break;
			}

			self.retrieve_resource(request, resource, &mut seen).await?;
		}

		Ok(seen.into_values().collect())
	}

	async fn retrieve_resource(
		&self,
		request: &InferenceRequest,
		resource: &InputResource,
		seen: &mut HashMap<String, InstanceStorageInfo>,
	) -> Result<(), GatewayError> {
		let connection = resource
			.connection
			.as_ref()
			.ok_or_else(|| GatewayError::InferenceRequestException("DICOMweb resource has no connection details".into()))?;

		match &request.input_metadata {
			InputMetadata::DicomUid { studies } => {
				for study in studies {
					if study.series.is_empty() {
						let parts = self.client.retrieve_study(connection, &study.uid).await?;
						self.stage_parts(request, parts, seen).await?;
						continue;
					}
					for series in &study.series {
						if series.instances.is_empty() {
							let parts = self
								.client
								.retrieve_series(connection, &study.uid, &series.uid)
								.await?;
							self.stage_parts(request, parts, seen).await?;
							continue;
						}
						for instance_uid in &series.instances {
							if !self.storage.has_space_available_to_retrieve()? {
								return Ok(());
							}
							let parts = self
								.client
								.retrieve_instance(connection, &study.uid, &series.uid, instance_uid)
								.await?;
							self.stage_parts(request, parts, seen).await?;
						}
					}
				}
			}
			InputMetadata::DicomPatientId { patient_id } => {
				let studies = self.client.query_studies(connection, "PatientID", patient_id).await?;
				for study_uid in studies {
					let parts = self.client.retrieve_study(connection, &study_uid).await?;
					self.stage_parts(request, parts, seen).await?;
				}
			}
			InputMetadata::AccessionNumber { accession_numbers } => {
				for accession_number in accession_numbers {
					let studies = self
						.client
						.query_studies(connection, "AccessionNumber", accession_number)
						.await?;
					for study_uid in studies {
						let parts = self.client.retrieve_study(connection, &study_uid).await?;
						self.stage_parts(request, parts, seen).await?;
					}
				}
			}
		}
		Ok(())
	}

	/// Writes each retrieved DICOM part to the request's staging path,
	/// counting it only on the first occurrence of its SOP Instance UID
	/// (§4.5, §8 invariant 4).
	async fn stage_parts(
		&self,
		request: &InferenceRequest,
		parts: Vec<bytes::Bytes>,
		seen: &mut HashMap<String, InstanceStorageInfo>,
	) -> Result<(), GatewayError> {
		for part in parts {
			if !self.storage.has_space_available_to_retrieve()? {
				break;
			}

			let Some(info) = parse_and_stage(&request.staging_path, &part)? else {
				warn!("skipping retrieved part with no readable DICOM header");
				continue;
			};
			seen.entry(info.sop_instance_uid.clone()).or_insert(info);
		}
		Ok(())
	}

	async fn create_job(&self, request: &InferenceRequest, instances: Vec<InstanceStorageInfo>) -> Result<(), GatewayError> {
		let job = crate::entities::InferenceJob {
			job_id: request.job_id,
			payload_id: request.payload_id,
			job_name: request.job_name.clone(),
			pipeline_id: request.pipeline_id.clone(),
			priority: request.priority,
			staging_path: job_payload_dir(&request.staging_path, request.job_id),
			instances: Vec::new(),
			state: JobState::Creating,
			status: JobStatus::Pending,
			try_count: 0,
			source: "dicomweb".into(),
			platform_job_id: None,
			platform_payload_id: None,
			last_taken: None,
		};
		self.job_repository.add_with_instances(job, instances).await
	}

	/// On a retryable failure, re-queues the request for another `take()`;
	/// once `try_count` exhausts `InferenceRequest::MAX_RETRY`, archives it
	/// as `Fail` (§4.3 "Update policy").
	async fn fail_or_retry(&self, request: InferenceRequest, reason: &str) {
		let transaction_id = request.transaction_id.clone();
		if request.try_count >= InferenceRequest::MAX_RETRY {
			warn!(transaction_id, reason, "request exhausted retries, archiving as failed");
			if let Err(err) = self.store.complete(request, RequestStatus::Fail).await {
				error!(transaction_id, "failed to archive exhausted request: {err}");
			}
		} else if let Err(err) = self.store.retry(request).await {
			error!(transaction_id, "failed to persist retry: {err}");
		}
	}
}

/// Scans `staging_path` for `.dcm` files with a valid DICOM header,
/// indexing by SOP Instance UID (duplicates dropped, first path wins).
fn restore_staged_instances(staging_path: &Path) -> Vec<InstanceStorageInfo> {
	let mut found = HashMap::new();
	let Ok(entries) = std::fs::read_dir(staging_path) else {
		return Vec::new();
	};

	for entry in entries.flatten() {
		let path = entry.path();
		if path.extension().and_then(|ext| ext.to_str()) != Some("dcm") {
			continue;
		}
		match dicom::object::open_file(&path) {
			Ok(object) => {
				if let Some(info) = instance_info_from_object(&object, path.clone()) {
					found.entry(info.sop_instance_uid.clone()).or_insert(info);
				}
			}
			Err(err) => {
				debug!(path = %path.display(), "not a readable DICOM file, skipping restore: {err}");
			}
		}
	}

	found.into_values().collect()
}

fn parse_and_stage(staging_path: &Path, bytes: &[u8]) -> Result<Option<InstanceStorageInfo>, GatewayError> {
	let cursor = std::io::Cursor::new(bytes);
	let object = match dicom::object::from_reader(cursor) {
		Ok(object) => object,
		Err(err) => return Err(GatewayError::DataCorruption(err.to_string())),
	};

	let sop_instance_uid = object
		.element(tags::SOP_INSTANCE_UID)
		.ok()
		.and_then(|el| el.to_str().ok())
		.map(|uid| uid.trim_end_matches('\0').to_string())
		.ok_or_else(|| GatewayError::DataCorruption("retrieved part has no SOPInstanceUID".into()))?;

	std::fs::create_dir_all(staging_path).map_err(GatewayError::from_io)?;
	let destination = staging_path.join(format!("{sop_instance_uid}.dcm"));
	object.write_to_file(&destination).map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))?;

	Ok(instance_info_from_object(&object, destination))
}

fn instance_info_from_object(
	object: &dicom::object::FileDicomObject<dicom::object::InMemDicomObject>,
	staging_path: PathBuf,
) -> Option<InstanceStorageInfo> {
	let get_str = |tag| -> String {
		object
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|v| v.trim_end_matches('\0').to_string())
			.unwrap_or_default()
	};

	let sop_instance_uid = get_str(tags::SOP_INSTANCE_UID);
	if sop_instance_uid.is_empty() {
		return None;
	}

	Some(InstanceStorageInfo {
		sop_instance_uid,
		study_instance_uid: get_str(tags::STUDY_INSTANCE_UID),
		series_instance_uid: get_str(tags::SERIES_INSTANCE_UID),
		patient_id: get_str(tags::PATIENT_ID),
		staging_path,
		source_staging_path: PathBuf::new(),
		source_aet: "dicomweb".into(),
		association_id: 0,
	})
}

/// The staging directory a retrieved request's derived job copies into,
/// distinct from the request's own staging path (§3 "staging directories
/// are exclusively owned by the job they belong to").
fn job_payload_dir(request_staging_path: &Path, job_id: Uuid) -> PathBuf {
	request_staging_path
		.parent()
		.unwrap_or(request_staging_path)
		.join("jobs")
		.join(job_id.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::entities::{AuthType, ConnectionDetails, InputResource};

	#[test]
	fn restoring_an_empty_directory_yields_nothing() {
		let dir = tempfile::tempdir().unwrap();
		assert!(restore_staged_instances(dir.path()).is_empty());
	}

	#[test]
	fn restoring_ignores_non_dcm_files() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
		assert!(restore_staged_instances(dir.path()).is_empty());
	}

	fn sample_connection() -> ConnectionDetails {
		ConnectionDetails {
			uri: "http://dicomweb.example/".parse().unwrap(),
			auth_type: AuthType::Bearer,
			auth_token: "token".into(),
		}
	}

	#[test]
	fn dicom_uid_input_resource_round_trips_through_serde() {
		let resource = InputResource {
			interface: ResourceInterface::DicomWeb,
			connection: Some(sample_connection()),
		};
		let json = serde_json::to_string(&resource).unwrap();
		let reparsed: InputResource = serde_json::from_str(&json).unwrap();
		assert_eq!(reparsed.interface, ResourceInterface::DicomWeb);
	}

	#[test]
	fn unrecognized_auth_type_fails_to_deserialize() {
		let json = r#"{"uri":"http://x/","authType":"Digest","authToken":"t"}"#;
		let result: Result<ConnectionDetails, _> = serde_json::from_str(json);
		assert!(result.is_err(), "AuthType must reject values outside {{Basic, Bearer}}");
	}

	#[test]
	fn job_payload_dir_is_sibling_of_the_request_staging_path() {
		let job_id = Uuid::new_v4();
		let dir = job_payload_dir(Path::new("/staging/requests/tx1"), job_id);
		assert_eq!(dir, PathBuf::from(format!("/staging/requests/jobs/{job_id}")));
	}

	fn base_request() -> InferenceRequest {
		InferenceRequest {
			transaction_id: "T1".into(),
			job_id: Uuid::new_v4(),
			payload_id: Uuid::new_v4(),
			job_name: "job".into(),
			pipeline_id: "pipeline".into(),
			input_resources: vec![InputResource {
				interface: ResourceInterface::DicomWeb,
				connection: None,
			}],
			output_resources: vec![],
			input_metadata: crate::entities::InputMetadata::DicomUid {
				studies: vec![crate::entities::StudySelector {
					uid: "S1".into(),
					series: vec![],
				}],
			},
			priority: crate::types::Priority::Medium,
			staging_path: PathBuf::from("/staging/t1"),
			state: crate::entities::InferenceRequestState::Queued,
			status: None,
			try_count: 0,
		}
	}

	async fn new_service() -> DataRetrievalService {
		let dir = tempfile::tempdir().unwrap();
		let db = crate::persistence::open_database(&dir.path().join("gateway.redb")).unwrap();
		let requests = crate::persistence::PersistentTable::open(db.clone(), "requests").unwrap();
		let jobs = crate::persistence::PersistentTable::open(db, "jobs").unwrap();
		DataRetrievalService::new(
			InferenceRequestStore::new(requests),
			JobRepository::new(jobs),
			StorageInfoProvider::new(&crate::config::StorageConfig {
				temporary: dir.path().to_path_buf(),
				min_free_bytes_to_store: 0,
				min_free_bytes_to_retrieve: 0,
				min_free_bytes_to_export: 0,
			}),
			DicomWebClient::new(),
			Duration::from_millis(10),
		)
	}

	/// Scenario §8.3: a request survives `MAX_RETRY` retries and is archived
	/// `Fail` with `tryCount == MAX_RETRY` only after the *next* (fourth)
	/// failure, matching the job-submission service's increment-then-compare
	/// semantics.
	#[tokio::test]
	async fn fourth_consecutive_failure_archives_with_try_count_at_max_retry() {
		let service = new_service().await;
		let mut request = base_request();
		service.store.submit(request.clone()).await.unwrap();
		request = service.store.take().await.unwrap().unwrap();

		for expected_try_count in 1..=InferenceRequest::MAX_RETRY {
			service.fail_or_retry(request.clone(), "simulated failure").await;
			let persisted = service
				.store
				.find_by_transaction_id(&request.transaction_id)
				.await
				.unwrap()
				.unwrap();
			assert_eq!(persisted.try_count, expected_try_count);
			assert_eq!(persisted.state, crate::entities::InferenceRequestState::Queued);
			request = persisted;
		}

		service.fail_or_retry(request, "final simulated failure").await;
		let archived = service
			.store
			.find_by_transaction_id("T1")
			.await
			.unwrap()
			.unwrap();
		assert_eq!(archived.try_count, InferenceRequest::MAX_RETRY);
		assert_eq!(archived.state, crate::entities::InferenceRequestState::Completed);
		assert_eq!(archived.status, Some(RequestStatus::Fail));
	}
}
