//! The Inference-Request Store (`spec.md` §4.3): a durable
//! `Queued -> InProcess -> Completed` queue of [`InferenceRequest`]s, with
//! submission-time deduplication and lookup by any of its three identifiers.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::entities::{InferenceRequest, InferenceRequestState, RequestStatus};
use crate::error::GatewayError;
use crate::persistence::{Label, PersistentTable};

/// Dedup key preventing the same logical request from being queued twice
/// while its first submission is still in flight (§4.3 "Deduplication").
fn dedup_key(request: &InferenceRequest) -> String {
	request.transaction_id.clone()
}

#[derive(Clone)]
pub struct InferenceRequestStore {
	table: PersistentTable<InferenceRequest>,
	in_flight: Arc<Mutex<HashSet<String>>>,
	take_lock: Arc<Mutex<()>>,
}

impl InferenceRequestStore {
	#[must_use]
	pub fn new(table: PersistentTable<InferenceRequest>) -> Self {
		Self {
			table,
			in_flight: Arc::new(Mutex::new(HashSet::new())),
			take_lock: Arc::new(Mutex::new(())),
		}
	}

	/// Validates and queues a new request. Returns `Ok(false)` without
	/// inserting anything if a request with the same `transactionId` is
	/// already queued or in process (§4.3 "Deduplication").
	///
	/// # Errors
	/// Returns [`GatewayError::Validation`] if the request fails structural
	/// validation, or a persistence error otherwise.
	pub async fn submit(&self, request: InferenceRequest) -> Result<bool, GatewayError> {
		request
			.validate()
			.map_err(GatewayError::Validation)?;

		let key = dedup_key(&request);
		{
			let mut in_flight = self.in_flight.lock().await;
			if in_flight.contains(&key) {
				debug!(transaction_id = %key, "rejecting duplicate in-flight inference request");
				return Ok(false);
			}
			in_flight.insert(key.clone());
		}

		let transaction_id = request.transaction_id.clone();
		let mut request = request;
		request.state = InferenceRequestState::Queued;
		request.status = None;
		request.try_count = 0;

		if let Err(err) = self.table.add(&transaction_id, request).await {
			self.in_flight.lock().await.remove(&key);
			return Err(err);
		}

		info!(transaction_id, "queued inference request");
		Ok(true)
	}

	/// Atomically takes the oldest `Queued` request and transitions it to
	/// `InProcess`. Returns `None` if the queue is empty.
	///
	/// # Errors
	/// Returns a persistence error if the state transition cannot be saved.
	pub async fn take(&self) -> Result<Option<InferenceRequest>, GatewayError> {
		let _guard = self.take_lock.lock().await;

		let mut rows = self.table.to_list().await?;
		rows.retain(|row| row.value.state == InferenceRequestState::Queued);
		rows.sort_by_key(|row| row.version);

		let Some(mut row) = rows.into_iter().next() else {
			return Ok(None);
		};

		row.value.state = InferenceRequestState::InProcess;
		self.table.add(&row.key, row.value.clone()).await?;
		Ok(Some(row.value))
	}

	/// Marks a request `Completed` with the given terminal status, releases
	/// its dedup slot, and persists the final row (§4.3 "archive on
	/// terminal" — here the request simply remains in the table at
	/// `Completed`, which doubles as the archive since nothing evicts it).
	///
	/// # Errors
	/// Returns a persistence error if the update cannot be saved.
	pub async fn complete(
		&self,
		mut request: InferenceRequest,
		status: RequestStatus,
	) -> Result<(), GatewayError> {
		request.state = InferenceRequestState::Completed;
		request.status = Some(status);
		let transaction_id = request.transaction_id.clone();

		self.table.add(&transaction_id, request).await?;
		self.in_flight.lock().await.remove(&transaction_id);
		Ok(())
	}

	/// Re-queues a request for retry, incrementing its try count. Callers
	/// should check `try_count >= InferenceRequest::MAX_RETRY` first and
	/// call [`InferenceRequestStore::complete`] with `RequestStatus::Fail`
	/// instead once retries are exhausted.
	///
	/// # Errors
	/// Returns a persistence error if the update cannot be saved.
	pub async fn retry(&self, mut request: InferenceRequest) -> Result<(), GatewayError> {
		request.state = InferenceRequestState::Queued;
		request.try_count += 1;
		let transaction_id = request.transaction_id.clone();
		self.table.add(&transaction_id, request).await
	}

	/// # Errors
	/// Returns a persistence error if the lookup fails.
	pub async fn find_by_transaction_id(
		&self,
		transaction_id: &str,
	) -> Result<Option<InferenceRequest>, GatewayError> {
		Ok(self.table.find(transaction_id).await?.map(|row| row.value))
	}

	/// # Errors
	/// Returns a persistence error if the lookup fails.
	pub async fn find_by_job_id(&self, job_id: &str) -> Result<Vec<InferenceRequest>, GatewayError> {
		Ok(self
			.table
			.find_by_label(Label::JobId(job_id))
			.await?
			.into_iter()
			.map(|row| row.value)
			.collect())
	}

	/// # Errors
	/// Returns a persistence error if the lookup fails.
	pub async fn find_by_payload_id(&self, payload_id: &str) -> Result<Vec<InferenceRequest>, GatewayError> {
		Ok(self
			.table
			.find_by_label(Label::PayloadId(payload_id))
			.await?
			.into_iter()
			.map(|row| row.value)
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use super::*;
	use crate::entities::{InputMetadata, InputResource, ResourceInterface, StudySelector};
	use crate::types::Priority;

	fn sample_request(transaction_id: &str) -> InferenceRequest {
		InferenceRequest {
			transaction_id: transaction_id.to_string(),
			job_id: uuid::Uuid::new_v4(),
			payload_id: uuid::Uuid::new_v4(),
			job_name: "job".into(),
			pipeline_id: "pipeline".into(),
			input_resources: vec![InputResource {
				interface: ResourceInterface::DicomWeb,
				connection: None,
			}],
			output_resources: vec![],
			input_metadata: InputMetadata::DicomUid {
				studies: vec![StudySelector {
					uid: "1.2.3".into(),
					series: vec![],
				}],
			},
			priority: Priority::Medium,
			staging_path: PathBuf::from("/staging/tx1"),
			state: InferenceRequestState::Queued,
			status: None,
			try_count: 0,
		}
	}

	async fn new_store() -> InferenceRequestStore {
		let dir = tempfile::tempdir().unwrap();
		let db = crate::persistence::open_database(&dir.path().join("test.redb")).unwrap();
		let table = PersistentTable::open(db, "inference_requests").unwrap();
		InferenceRequestStore::new(table)
	}

	#[tokio::test]
	async fn duplicate_transaction_id_is_rejected_while_in_flight() {
		let store = new_store().await;
		assert!(store.submit(sample_request("tx1")).await.unwrap());
		assert!(!store.submit(sample_request("tx1")).await.unwrap());
	}

	#[tokio::test]
	async fn take_returns_queued_requests_in_submission_order() {
		let store = new_store().await;
		store.submit(sample_request("tx1")).await.unwrap();
		store.submit(sample_request("tx2")).await.unwrap();

		let first = store.take().await.unwrap().unwrap();
		assert_eq!(first.transaction_id, "tx1");
		assert_eq!(first.state, InferenceRequestState::InProcess);

		let second = store.take().await.unwrap().unwrap();
		assert_eq!(second.transaction_id, "tx2");

		assert!(store.take().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn completing_a_request_releases_its_dedup_slot() {
		let store = new_store().await;
		store.submit(sample_request("tx1")).await.unwrap();
		let request = store.take().await.unwrap().unwrap();
		store.complete(request, RequestStatus::Success).await.unwrap();

		assert!(store.submit(sample_request("tx1")).await.unwrap());
	}
}
