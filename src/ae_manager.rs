//! The AE-Manager (`spec.md` §4.1, §6): CRUD over the three Application
//! Entity kinds, the registry of processor descriptors an `ApplicationEntity`
//! may name, and the startup staging-subtree sweep.
//!
//! The registry half is grounded on the teacher's `PluginRegistry`
//! (`backend/plugin/registry.rs`): a name -> descriptor map plus an AET
//! binding lookup. Unlike the teacher, descriptors here are plain
//! in-process values rather than dynamically loaded `.so`/`.dylib` modules —
//! this gateway has no plugin-extensibility requirement, so the `abi_stable`
//! FFI machinery is dropped (see `DESIGN.md`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::cleanup_queue::CleanupQueue;
use crate::config::AppConfig;
use crate::entities::{ApplicationEntity, DestinationApplicationEntity, SourceApplicationEntity};
use crate::error::GatewayError;
use crate::persistence::PersistentTable;
use crate::types::AeTitle;

/// Describes one kind of per-AE processing an `ApplicationEntity.processor`
/// field may reference. The gateway ships a fixed, compiled-in set; there is
/// no runtime loading.
#[derive(Debug, Clone)]
pub struct ProcessorDescriptor {
	pub name: &'static str,
	pub description: &'static str,
}

/// The processor kinds a freshly admitted instance may be routed to (§4.1,
/// §4.3): either straight into the inference-request pipeline, or held for
/// an operator-triggered export with no automatic submission.
pub const BUILTIN_PROCESSORS: &[ProcessorDescriptor] = &[
	ProcessorDescriptor {
		name: "inference-submit",
		description: "Submit every instance stored for this AE as an inference request",
	},
	ProcessorDescriptor {
		name: "archive-only",
		description: "Stage instances without submitting an inference request",
	},
];

#[derive(Debug, Error)]
pub enum AeManagerError {
	#[error("AE title invalid: {0}")]
	InvalidAeTitle(#[from] crate::types::AeTitleError),
	#[error("unknown processor '{0}'")]
	UnknownProcessor(String),
	#[error(transparent)]
	Gateway(#[from] GatewayError),
}

/// Owns the three AE tables and the processor registry; shared across the
/// SCP admission path, the REST config routes, and the Export Service.
#[derive(Clone)]
pub struct AeManager {
	applications: PersistentTable<ApplicationEntity>,
	destinations: PersistentTable<DestinationApplicationEntity>,
	sources: PersistentTable<SourceApplicationEntity>,
	processors: Arc<HashMap<&'static str, ProcessorDescriptor>>,
}

impl AeManager {
	#[must_use]
	pub fn new(
		applications: PersistentTable<ApplicationEntity>,
		destinations: PersistentTable<DestinationApplicationEntity>,
		sources: PersistentTable<SourceApplicationEntity>,
	) -> Self {
		let processors = BUILTIN_PROCESSORS
			.iter()
			.map(|descriptor| (descriptor.name, descriptor.clone()))
			.collect();
		Self {
			applications,
			destinations,
			sources,
			processors: Arc::new(processors),
		}
	}

	/// Loads the statically configured `aets` bootstrap list (§6
	/// `Dicom.Scp.AeTitles`) into the persistent table, skipping entries
	/// already present so a restart does not clobber CRUD-managed changes.
	///
	/// # Errors
	/// Returns an [`AeManagerError`] if a bootstrap entry is invalid or
	/// persistence fails.
	pub async fn bootstrap(&self, config: &AppConfig) -> Result<(), AeManagerError> {
		for bootstrap in &config.aets {
			if self.applications.find(&bootstrap.name).await?.is_some() {
				continue;
			}
			let aet = AeTitle::new(bootstrap.aet.clone())?;
			self.validate_processor(&bootstrap.processor)?;
			self.applications
				.add(
					&bootstrap.name,
					ApplicationEntity {
						name: bootstrap.name.clone(),
						aet,
						ignored_sop_classes: bootstrap.ignored_sop_classes.clone(),
						overwrite_same_instance: bootstrap.overwrite_same_instance,
						processor: bootstrap.processor.clone(),
						processor_settings: bootstrap.processor_settings.clone(),
					},
				)
				.await?;
			info!(name = %bootstrap.name, "bootstrapped application entity from configuration");
		}
		Ok(())
	}

	fn validate_processor(&self, name: &str) -> Result<(), AeManagerError> {
		if self.processors.contains_key(name) {
			Ok(())
		} else {
			Err(AeManagerError::UnknownProcessor(name.to_string()))
		}
	}

	/// Creates or replaces a called Application Entity.
	///
	/// # Errors
	/// Returns an [`AeManagerError`] if the AE title or processor name is
	/// invalid, or persistence fails.
	pub async fn put_application_entity(
		&self,
		entity: ApplicationEntity,
	) -> Result<(), AeManagerError> {
		self.validate_processor(&entity.processor)?;
		self.applications.add(&entity.name, entity).await?;
		Ok(())
	}

	/// # Errors
	/// Returns an [`AeManagerError`] if persistence fails.
	pub async fn remove_application_entity(&self, name: &str) -> Result<(), AeManagerError> {
		self.applications.remove(name).await?;
		Ok(())
	}

	/// # Errors
	/// Returns an [`AeManagerError`] if persistence fails.
	pub async fn find_application_entity(
		&self,
		name: &str,
	) -> Result<Option<ApplicationEntity>, AeManagerError> {
		Ok(self.applications.find(name).await?.map(|row| row.value))
	}

	/// Looks up the configured AE whose called title matches `aet`, as asked
	/// at SCP admission time.
	///
	/// # Errors
	/// Returns an [`AeManagerError`] if persistence fails.
	pub async fn find_by_called_aet(
		&self,
		aet: &str,
	) -> Result<Option<ApplicationEntity>, AeManagerError> {
		let all = self.applications.to_list().await?;
		Ok(all
			.into_iter()
			.find(|row| row.value.aet.as_str() == aet)
			.map(|row| row.value))
	}

	/// # Errors
	/// Returns an [`AeManagerError`] if persistence fails.
	pub async fn list_application_entities(&self) -> Result<Vec<ApplicationEntity>, AeManagerError> {
		Ok(self
			.applications
			.to_list()
			.await?
			.into_iter()
			.map(|row| row.value)
			.collect())
	}

	/// # Errors
	/// Returns an [`AeManagerError`] if persistence fails.
	pub async fn put_destination(
		&self,
		entity: DestinationApplicationEntity,
	) -> Result<(), AeManagerError> {
		self.destinations.add(&entity.name, entity).await?;
		Ok(())
	}

	/// # Errors
	/// Returns an [`AeManagerError`] if persistence fails.
	pub async fn remove_destination(&self, name: &str) -> Result<(), AeManagerError> {
		self.destinations.remove(name).await?;
		Ok(())
	}

	/// # Errors
	/// Returns an [`AeManagerError`] if persistence fails.
	pub async fn find_destination(
		&self,
		name: &str,
	) -> Result<Option<DestinationApplicationEntity>, AeManagerError> {
		Ok(self.destinations.find(name).await?.map(|row| row.value))
	}

	/// # Errors
	/// Returns an [`AeManagerError`] if persistence fails.
	pub async fn list_destinations(&self) -> Result<Vec<DestinationApplicationEntity>, AeManagerError> {
		Ok(self
			.destinations
			.to_list()
			.await?
			.into_iter()
			.map(|row| row.value)
			.collect())
	}

	/// # Errors
	/// Returns an [`AeManagerError`] if persistence fails.
	pub async fn put_source(&self, entity: SourceApplicationEntity) -> Result<(), AeManagerError> {
		self.sources.add(entity.aet.as_str(), entity).await?;
		Ok(())
	}

	/// # Errors
	/// Returns an [`AeManagerError`] if persistence fails.
	pub async fn remove_source(&self, aet: &str) -> Result<(), AeManagerError> {
		self.sources.remove(aet).await?;
		Ok(())
	}

	/// # Errors
	/// Returns an [`AeManagerError`] if persistence fails.
	pub async fn list_sources(&self) -> Result<Vec<SourceApplicationEntity>, AeManagerError> {
		Ok(self
			.sources
			.to_list()
			.await?
			.into_iter()
			.map(|row| row.value)
			.collect())
	}

	#[must_use]
	pub fn processors(&self) -> Vec<ProcessorDescriptor> {
		self.processors.values().cloned().collect()
	}

	/// Startup staging-subtree cleanup (§4.1): removes (enqueues for
	/// deletion) any per-AE staging subdirectory whose name no longer
	/// matches a configured Application Entity's AE title, so a removed AE's
	/// orphaned files do not accumulate forever.
	///
	/// Staging subtrees are named by AE title, not by the AE's `name` (see
	/// `storescp.rs`'s `staging_dir` construction and the
	/// `NotificationBus::publish`/`subscribe` call sites), so `known` must be
	/// keyed the same way or live subtrees get swept as orphaned.
	///
	/// # Errors
	/// Returns an [`AeManagerError`] if the staging root cannot be read.
	pub async fn sweep_orphaned_staging_subtrees(
		&self,
		staging_root: &Path,
		cleanup_queue: &CleanupQueue,
	) -> Result<(), AeManagerError> {
		let known: std::collections::HashSet<String> = self
			.list_application_entities()
			.await?
			.into_iter()
			.map(|ae| ae.aet.as_str().to_string())
			.collect();

		let entries = match std::fs::read_dir(staging_root) {
			Ok(entries) => entries,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
			Err(err) => return Err(AeManagerError::Gateway(GatewayError::from_io(err))),
		};

		for entry in entries {
			let entry = entry.map_err(|err| AeManagerError::Gateway(GatewayError::from_io(err)))?;
			let Ok(file_type) = entry.file_type() else {
				continue;
			};
			if !file_type.is_dir() {
				continue;
			}
			let name = entry.file_name().to_string_lossy().into_owned();
			if known.contains(&name) {
				continue;
			}

			warn!(ae = %name, "sweeping orphaned staging subtree for removed application entity");
			enqueue_subtree(&entry.path(), cleanup_queue);
		}
		Ok(())
	}
}

fn enqueue_subtree(dir: &Path, cleanup_queue: &CleanupQueue) {
	let Ok(entries) = std::fs::read_dir(dir) else {
		return;
	};
	for entry in entries.flatten() {
		let path = entry.path();
		if path.is_dir() {
			enqueue_subtree(&path, cleanup_queue);
		} else {
			cleanup_queue.enqueue(path);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::entities::{ApplicationEntity, DestinationApplicationEntity, SourceApplicationEntity};
	use crate::persistence::open_database;
	use crate::types::Port;

	async fn new_manager() -> AeManager {
		let dir = tempfile::tempdir().unwrap();
		let db = open_database(&dir.path().join("ae.redb")).unwrap();
		let applications = PersistentTable::open(db.clone(), "applications").unwrap();
		let destinations = PersistentTable::open(db.clone(), "destinations").unwrap();
		let sources = PersistentTable::open(db, "sources").unwrap();
		AeManager::new(applications, destinations, sources)
	}

	fn sample_ae(name: &str, processor: &str) -> ApplicationEntity {
		ApplicationEntity {
			name: name.into(),
			aet: AeTitle::new(name).unwrap(),
			ignored_sop_classes: vec![],
			overwrite_same_instance: false,
			processor: processor.into(),
			processor_settings: HashMap::new(),
		}
	}

	#[tokio::test]
	async fn put_application_entity_rejects_unknown_processor() {
		let manager = new_manager().await;
		let err = manager
			.put_application_entity(sample_ae("CLARA", "does-not-exist"))
			.await
			.unwrap_err();
		assert!(matches!(err, AeManagerError::UnknownProcessor(name) if name == "does-not-exist"));
	}

	#[tokio::test]
	async fn put_application_entity_accepts_builtin_processor() {
		let manager = new_manager().await;
		manager
			.put_application_entity(sample_ae("CLARA", "inference-submit"))
			.await
			.unwrap();

		let found = manager.find_application_entity("CLARA").await.unwrap().unwrap();
		assert_eq!(found.aet.as_str(), "CLARA");
	}

	#[tokio::test]
	async fn find_by_called_aet_matches_on_the_aet_not_the_name() {
		let manager = new_manager().await;
		manager
			.put_application_entity(sample_ae("clara-prod", "inference-submit"))
			.await
			.unwrap();

		// the entity's name differs from its AE title in general; look up by AET.
		let mut entity = sample_ae("clara-prod", "inference-submit");
		entity.aet = AeTitle::new("CLARAAET").unwrap();
		manager.put_application_entity(entity).await.unwrap();

		let found = manager.find_by_called_aet("CLARAAET").await.unwrap().unwrap();
		assert_eq!(found.name, "clara-prod");
		assert!(manager.find_by_called_aet("UNKNOWNAET").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn removing_an_application_entity_revokes_future_lookups() {
		let manager = new_manager().await;
		manager
			.put_application_entity(sample_ae("CLARA", "inference-submit"))
			.await
			.unwrap();
		manager.remove_application_entity("CLARA").await.unwrap();

		assert!(manager.find_application_entity("CLARA").await.unwrap().is_none());
		assert!(manager.find_by_called_aet("CLARA").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn destination_and_source_crud_round_trips() {
		let manager = new_manager().await;
		manager
			.put_destination(DestinationApplicationEntity {
				name: "pacs-1".into(),
				aet: AeTitle::new("PACS1").unwrap(),
				host: "pacs.example.org".into(),
				port: Port::new(104).unwrap(),
			})
			.await
			.unwrap();
		manager
			.put_source(SourceApplicationEntity {
				aet: AeTitle::new("MODALITY1").unwrap(),
				host: "modality.example.org".into(),
			})
			.await
			.unwrap();

		assert_eq!(manager.list_destinations().await.unwrap().len(), 1);
		assert_eq!(manager.list_sources().await.unwrap().len(), 1);

		manager.remove_destination("pacs-1").await.unwrap();
		manager.remove_source("MODALITY1").await.unwrap();

		assert!(manager.list_destinations().await.unwrap().is_empty());
		assert!(manager.list_sources().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn sweep_orphaned_staging_subtrees_enqueues_only_unknown_aets() {
		let manager = new_manager().await;
		let mut ae = sample_ae("clara-pipeline", "inference-submit");
		ae.aet = AeTitle::new("CLARA").unwrap();
		manager.put_application_entity(ae).await.unwrap();

		// Staging subtrees are named by AE title, not by the AE's `name`
		// (which differs here), so the sweep must key on `aet`.
		let staging_root = tempfile::tempdir().unwrap();
		let known_dir = staging_root.path().join("CLARA");
		let orphan_dir = staging_root.path().join("REMOVED-AE");
		std::fs::create_dir_all(&known_dir).unwrap();
		std::fs::create_dir_all(&orphan_dir).unwrap();
		std::fs::write(known_dir.join("1.2.3.dcm"), b"keep").unwrap();
		std::fs::write(orphan_dir.join("9.9.9.dcm"), b"drop").unwrap();

		let (cleanup_queue, mut rx) = CleanupQueue::new();
		manager
			.sweep_orphaned_staging_subtrees(staging_root.path(), &cleanup_queue)
			.await
			.unwrap();
		drop(cleanup_queue);

		let mut enqueued = Vec::new();
		while let Some(path) = rx.recv().await {
			enqueued.push(path);
		}
		assert_eq!(enqueued, vec![orphan_dir.join("9.9.9.dcm")]);
	}
}
