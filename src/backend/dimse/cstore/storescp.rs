//! The SCP admission path (`spec.md` §4.1): accepts incoming C-STORE
//! requests, applies admission checks, stages the instance to disk, and
//! publishes it on the [`NotificationBus`] for the calling AE's processor.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::FileMetaTableBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use association::server::{ServerAssociation, ServerAssociationOptions};
use association::Association;

use crate::ae_manager::AeManager;
use crate::backend::dimse::association;
use crate::backend::dimse::cstore::{CompositeStoreResponse, COMMAND_FIELD_COMPOSITE_STORE_REQUEST};
use crate::backend::dimse::{DicomMessageReader, DicomMessageWriter};
use crate::config::ScpServerConfig;
use crate::entities::InstanceStorageInfo;
use crate::error::GatewayError;
use crate::notification_bus::NotificationBus;
use crate::storage_info::StorageInfoProvider;
use crate::types::{UI, US};

/// The AE title this gateway presents on the SCP port. Admission is resolved
/// against this *called* AE (the configured `ApplicationEntity`, §3); the
/// modality's calling AE is recorded as the instance's `source_aet` but never
/// used to pick the admitted AE (§4.1).
pub const GATEWAY_AE_TITLE: &str = "IMAGING-GATEWAY";

const RETRY_SAVE_ATTEMPTS: u32 = 3;

/// Shared state for every accepted association.
struct Shared {
	config: ScpServerConfig,
	ae_manager: AeManager,
	notification_bus: NotificationBus,
	storage: StorageInfoProvider,
	next_association_id: AtomicU32,
}

/// Runs the SCP admission path until `cancel` fires.
pub struct StoreServiceClassProvider {
	shared: Arc<Shared>,
}

impl StoreServiceClassProvider {
	#[must_use]
	pub fn new(
		config: ScpServerConfig,
		ae_manager: AeManager,
		notification_bus: NotificationBus,
		storage: StorageInfoProvider,
	) -> Self {
		Self {
			shared: Arc::new(Shared {
				config,
				ae_manager,
				notification_bus,
				storage,
				next_association_id: AtomicU32::new(1),
			}),
		}
	}

	/// Binds the configured SCP port and accepts connections until
	/// cancelled.
	pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
		let address = SocketAddr::from((self.shared.config.interface, self.shared.config.port));
		let listener = TcpListener::bind(&address).await?;
		info!("Started Store Service Class Provider on {}", address);

		loop {
			tokio::select! {
				() = cancel.cancelled() => {
					debug!("SCP admission path shutting down");
					return Ok(());
				}
				accepted = listener.accept() => {
					match accepted {
						Ok((stream, peer)) => {
							let association_id = self.shared.next_association_id.fetch_add(1, Ordering::SeqCst);
							let span = info_span!("STORE-SCP", association_id, peer = peer.to_string());
							let shared = Arc::clone(&self.shared);
							tokio::spawn(async move {
								if let Err(err) = process(stream, shared, association_id).instrument(span).await {
									error!("{err}");
								}
							});
						}
						Err(err) => error!("Failed to accept incoming connection: {err}"),
					}
				}
			}
		}
	}
}

#[instrument(skip_all)]
async fn process(stream: TcpStream, shared: Arc<Shared>, association_id: u32) -> anyhow::Result<()> {
	let tcp_stream = stream.into_std()?;
	// Required because `dicom-rs` associations run their own blocking I/O
	// thread; see `ServerAssociation`.
	tcp_stream.set_nonblocking(false)?;

	let options = ServerAssociationOptions {
		aet: GATEWAY_AE_TITLE.to_string(),
		tcp_stream,
		uncompressed: shared.config.uncompressed,
	};
	let association = ServerAssociation::new(options).await?;
	let calling_aet = association.calling_aet().to_string();
	let called_aet = association.called_aet().to_string();

	let configured = shared.ae_manager.find_by_called_aet(&called_aet).await?;
	let Some(configured) = configured else {
		warn!(called_aet, "rejecting instance: AE title is not configured");
		return Err(GatewayError::AeNotConfigured(called_aet).into());
	};

	while let Ok(message) = association.read_message(Duration::MAX).await {
		let pctx = association
			.presentation_contexts()
			.first()
			.context("No presentation context available")?;

		let command_field = message
			.command
			.get(tags::COMMAND_FIELD)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.context("Missing tag COMMAND_FIELD (0000,0100)")?;

		if command_field != COMMAND_FIELD_COMPOSITE_STORE_REQUEST {
			return Err(anyhow::Error::msg(
				"Unexpected Command Field. Only C-STORE-RQ is supported.",
			));
		}

		let message_id = message
			.command
			.get(tags::MESSAGE_ID)
			.map(InMemElement::to_int)
			.and_then(Result::ok)
			.unwrap_or(0);

		let sop_class_uid = message
			.command
			.get(tags::AFFECTED_SOP_CLASS_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.context("Missing tag AFFECTED_SOP_CLASS_UID (0000,0002)")?
			.into_owned();

		let sop_instance_uid = message
			.command
			.get(tags::AFFECTED_SOP_INSTANCE_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.context("Missing tag AFFECTED_SOP_INSTANCE_UID (0000,1000)")?
			.into_owned();

		if configured
			.ignored_sop_classes
			.iter()
			.any(|ignored| ignored == &sop_class_uid)
		{
			info!(sop_class_uid, "ignoring instance of ignored SOP class");
			respond(&association, message_id, &sop_class_uid, &sop_instance_uid).await?;
			continue;
		}

		if !shared.storage.has_space_available_to_store()? {
			warn!("rejecting instance: insufficient storage");
			return Err(GatewayError::InsufficientStorage("staging volume").into());
		}

		let dataset = message
			.data
			.context("C-STORE-RQ is missing its data set")?
			.with_exact_meta(
				FileMetaTableBuilder::new()
					.media_storage_sop_class_uid(sop_class_uid.as_str())
					.media_storage_sop_instance_uid(sop_instance_uid.as_str())
					.transfer_syntax(&pctx.transfer_syntax)
					.build()
					.expect("FileMetaTableBuilder should contain required data"),
			);

		let study_instance_uid = dataset
			.get(tags::STUDY_INSTANCE_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.unwrap_or_default()
			.into_owned();
		let series_instance_uid = dataset
			.get(tags::SERIES_INSTANCE_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.unwrap_or_default()
			.into_owned();
		let patient_id = dataset
			.get(tags::PATIENT_ID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.unwrap_or_default()
			.into_owned();

		let staging_dir = shared
			.storage
			.staging_root()
			.join(configured.aet.as_str())
			.join(&study_instance_uid);
		let staging_path = staging_dir.join(format!("{sop_instance_uid}.dcm"));

		if staging_path.exists() && !configured.overwrite_same_instance {
			info!(sop_instance_uid, "skipping duplicate instance (overwrite disabled)");
			respond(&association, message_id, &sop_class_uid, &sop_instance_uid).await?;
			continue;
		}

		save_with_retry(&staging_dir, &staging_path, &dataset).await?;

		respond(&association, message_id, &sop_class_uid, &sop_instance_uid).await?;

		let info = InstanceStorageInfo {
			sop_instance_uid,
			study_instance_uid,
			series_instance_uid,
			patient_id,
			staging_path,
			source_staging_path: PathBuf::new(),
			source_aet: calling_aet.clone(),
			association_id,
		};
		shared.notification_bus.publish(&configured.aet, info).await;
	}

	Ok(())
}

async fn respond(
	association: &ServerAssociation,
	message_id: US,
	sop_class_uid: &str,
	sop_instance_uid: &str,
) -> anyhow::Result<()> {
	let response = CompositeStoreResponse {
		sop_instance_uid: UI::from(sop_instance_uid),
		sop_class_uid: UI::from(sop_class_uid),
		message_id,
	};
	association
		.write_message(response, None, Duration::from_secs(10))
		.await?;
	Ok(())
}

/// Backoff schedule for staging writes (§4.1): 250ms/500ms/1s, distinct from
/// the 1s/2s/3s disk-full schedule used when copying staged instances into a
/// job's payload directory (§4.4 "Copying").
fn save_backoff(attempt: u32) -> Duration {
	match attempt {
		1 => Duration::from_millis(250),
		2 => Duration::from_millis(500),
		_ => Duration::from_secs(1),
	}
}

/// Writes the staged file to disk, retrying any failure up to
/// [`RETRY_SAVE_ATTEMPTS`] times; exhausting the schedule is fatal to this
/// store (§4.1).
async fn save_with_retry(
	staging_dir: &std::path::Path,
	staging_path: &PathBuf,
	dataset: &dicom::object::FileDicomObject<dicom::object::InMemDicomObject>,
) -> Result<(), GatewayError> {
	let mut attempt = 1;
	loop {
		match try_save(staging_dir, staging_path, dataset) {
			Ok(()) => return Ok(()),
			Err(err) if attempt <= RETRY_SAVE_ATTEMPTS => {
				let wait = save_backoff(attempt);
				warn!(attempt, wait = ?wait, "failed to stage instance, retrying: {err}");
				tokio::time::sleep(wait).await;
				attempt += 1;
			}
			Err(err) => return Err(err),
		}
	}
}

fn try_save(
	staging_dir: &std::path::Path,
	staging_path: &PathBuf,
	dataset: &dicom::object::FileDicomObject<dicom::object::InMemDicomObject>,
) -> Result<(), GatewayError> {
	std::fs::create_dir_all(staging_dir).map_err(GatewayError::from_io)?;
	dataset
		.write_to_file(staging_path)
		.map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn save_backoff_matches_the_fixed_schedule() {
		assert_eq!(save_backoff(1), Duration::from_millis(250));
		assert_eq!(save_backoff(2), Duration::from_millis(500));
		assert_eq!(save_backoff(3), Duration::from_secs(1));
	}
}
