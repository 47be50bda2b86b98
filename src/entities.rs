//! The entities of `spec.md` §3, as plain `serde`-encodable Rust types.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persistence::Labeled;
use crate::types::{AeTitle, Port, Priority};

/// A called Application Entity: the inbound C-STORE target configured for
/// a hospital modality / PACS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationEntity {
	/// Unique name (primary key).
	pub name: String,
	pub aet: AeTitle,
	pub ignored_sop_classes: Vec<String>,
	pub overwrite_same_instance: bool,
	/// Short name of a registered [`crate::ae_manager::ProcessorDescriptor`].
	pub processor: String,
	pub processor_settings: HashMap<String, String>,
}

/// An outbound DICOM C-STORE SCU destination used by the Export Service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationApplicationEntity {
	pub name: String,
	pub aet: AeTitle,
	pub host: String,
	pub port: Port,
}

/// A remote DICOMweb/DIMSE source the Data-Retrieval Service may fetch from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceApplicationEntity {
	pub aet: AeTitle,
	pub host: String,
}

/// Records where a single stored/retrieved instance lives on disk.
///
/// `staging_path` starts out pointing at wherever the instance was first
/// staged (the SCP staging subtree or a Data-Retrieval request directory);
/// `JobRepository::add_with_instances` copies it into the job's payload
/// directory and rewrites `staging_path` to the copy, moving the original
/// location into `source_staging_path` so both can be reclaimed once the
/// job reaches a terminal state (§3 Ownership).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStorageInfo {
	pub sop_instance_uid: String,
	pub study_instance_uid: String,
	pub series_instance_uid: String,
	pub patient_id: String,
	pub staging_path: PathBuf,
	#[serde(default)]
	pub source_staging_path: PathBuf,
	pub source_aet: String,
	pub association_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InferenceRequestState {
	Queued,
	InProcess,
	Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
	Success,
	Fail,
}

/// Dispatch tag for an input resource's identifying metadata — the "typed
/// union" of `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InputMetadata {
	DicomUid { studies: Vec<StudySelector> },
	DicomPatientId { patient_id: String },
	AccessionNumber { accession_numbers: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudySelector {
	pub uid: String,
	#[serde(default)]
	pub series: Vec<SeriesSelector>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSelector {
	pub uid: String,
	#[serde(default)]
	pub instances: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
	Basic,
	Bearer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDetails {
	pub uri: url::Url,
	pub auth_type: AuthType,
	pub auth_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceInterface {
	DicomWeb,
	Algorithm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputResource {
	pub interface: ResourceInterface,
	pub connection: Option<ConnectionDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputResource {
	pub interface: ResourceInterface,
	pub connection: Option<ConnectionDetails>,
}

/// An externally submitted inference request, durably queued through its
/// `Queued -> InProcess -> Completed` lifecycle (§3, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
	pub transaction_id: String,
	pub job_id: Uuid,
	pub payload_id: Uuid,
	/// Passed straight through to the downstream platform's create-job call
	/// once a `InferenceJob` is built (§4.4 `Creating`). `spec.md` §3 leaves
	/// the carrier of `jobName`/`pipelineId` onto `InferenceJob` implicit;
	/// resolved here by carrying both on the submitted request itself (see
	/// `DESIGN.md`).
	pub job_name: String,
	pub pipeline_id: String,
	pub input_resources: Vec<InputResource>,
	pub output_resources: Vec<OutputResource>,
	pub input_metadata: InputMetadata,
	pub priority: Priority,
	pub staging_path: PathBuf,
	pub state: InferenceRequestState,
	pub status: Option<RequestStatus>,
	pub try_count: u32,
}

impl InferenceRequest {
	pub const MAX_RETRY: u32 = 3;

	/// Validates the structural invariants of §3/§8: a non-empty
	/// transaction id, at least one non-algorithm input resource, and (for
	/// `DicomUid` requests) at least one study.
	pub fn validate(&self) -> Result<(), String> {
		if self.transaction_id.is_empty() {
			return Err("transactionId must not be empty".into());
		}
		if self.pipeline_id.is_empty() {
			return Err("pipelineId must not be empty".into());
		}
		if !self
			.input_resources
			.iter()
			.any(|r| r.interface != ResourceInterface::Algorithm)
		{
			return Err("at least one non-algorithm input resource is required".into());
		}
		if let InputMetadata::DicomUid { studies } = &self.input_metadata {
			if studies.is_empty() {
				return Err("DicomUid input metadata requires at least one study".into());
			}
		}
		Ok(())
	}
}

impl Labeled for InferenceRequest {
	fn job_id(&self) -> Option<String> {
		Some(self.job_id.to_string())
	}
	fn payload_id(&self) -> Option<String> {
		Some(self.payload_id.to_string())
	}
	fn transaction_id(&self) -> Option<String> {
		Some(self.transaction_id.clone())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
	Creating,
	MetadataUploading,
	PayloadUploading,
	Starting,
	Completed,
	Faulted,
}

impl JobState {
	/// States `take()` (§4.4) may hand out: every non-terminal state.
	#[must_use]
	pub const fn is_takeable(self) -> bool {
		!matches!(self, Self::Completed | Self::Faulted)
	}

	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Faulted)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
	Pending,
	Success,
	Fail,
}

/// A job driven through the §4.4 state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceJob {
	pub job_id: Uuid,
	pub payload_id: Uuid,
	pub job_name: String,
	pub pipeline_id: String,
	pub priority: Priority,
	pub staging_path: PathBuf,
	pub instances: Vec<InstanceStorageInfo>,
	pub state: JobState,
	pub status: JobStatus,
	pub try_count: u32,
	pub source: String,
	pub platform_job_id: Option<String>,
	pub platform_payload_id: Option<String>,
	#[serde(default)]
	pub last_taken: Option<chrono_like::Timestamp>,
}

impl InferenceJob {
	pub const MAX_RETRY: u32 = 3;
}

impl Labeled for InferenceJob {
	fn job_id(&self) -> Option<String> {
		Some(self.job_id.to_string())
	}
	fn payload_id(&self) -> Option<String> {
		Some(self.payload_id.to_string())
	}
}

/// An in-flight export unit built from a completed downstream job (§3 `OutputJob`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputJob {
	pub task_id: String,
	pub payload_id: String,
	pub job_id: String,
	pub agent: String,
	pub files: Vec<PathBuf>,
	pub success_count: usize,
	pub failure_count: usize,
}

impl OutputJob {
	/// §4.6 step 3: drop the job and report non-retriable failure once the
	/// failure ratio exceeds `failure_threshold`.
	#[must_use]
	pub fn failure_ratio(&self) -> f64 {
		let total = self.files.len().max(1);
		self.failure_count as f64 / total as f64
	}
}

/// A minimal monotonic timestamp usable without `SystemTime::now()` calls
/// scattered through business logic — callers stamp it explicitly so tests
/// stay deterministic.
pub mod chrono_like {
	use serde::{Deserialize, Serialize};

	#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
	pub struct Timestamp(pub u64);
}

#[cfg(test)]
mod tests {
	use super::*;

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
			input_metadata: InputMetadata::DicomUid {
				studies: vec![StudySelector {
					uid: "S1".into(),
					series: vec![],
				}],
			},
			priority: Priority::Medium,
			staging_path: PathBuf::from("/staging/t1"),
			state: InferenceRequestState::Queued,
			status: None,
			try_count: 0,
		}
	}

	#[test]
	fn valid_request_passes() {
		assert!(base_request().validate().is_ok());
	}

	#[test]
	fn empty_transaction_id_is_rejected() {
		let mut request = base_request();
		request.transaction_id = String::new();
		assert!(request.validate().is_err());
	}

	#[test]
	fn request_with_only_algorithm_inputs_is_rejected() {
		let mut request = base_request();
		request.input_resources = vec![InputResource {
			interface: ResourceInterface::Algorithm,
			connection: None,
		}];
		assert!(request.validate().is_err());
	}

	#[test]
	fn dicom_uid_request_with_no_studies_is_rejected() {
		let mut request = base_request();
		request.input_metadata = InputMetadata::DicomUid { studies: vec![] };
		assert!(request.validate().is_err());
	}

	#[test]
	fn dicom_patient_id_request_does_not_require_studies() {
		let mut request = base_request();
		request.input_metadata = InputMetadata::DicomPatientId {
			patient_id: "PAT1".into(),
		};
		assert!(request.validate().is_ok());
	}

	#[test]
	fn output_job_failure_ratio_divides_by_total_files() {
		let job = OutputJob {
			task_id: "t1".into(),
			payload_id: "p1".into(),
			job_id: "j1".into(),
			agent: "agent".into(),
			files: vec![PathBuf::from("a"), PathBuf::from("b")],
			success_count: 0,
			failure_count: 1,
		};
		assert!((job.failure_ratio() - 0.5).abs() < f64::EPSILON);
	}

	#[test]
	fn job_state_take_and_terminal_classification() {
		assert!(JobState::Creating.is_takeable());
		assert!(!JobState::Completed.is_takeable());
		assert!(JobState::Faulted.is_terminal());
		assert!(!JobState::Starting.is_terminal());
	}
}
