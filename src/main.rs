mod ae_job_processor;
mod ae_manager;
mod api;
mod backend;
mod cleanup_queue;
mod config;
mod data_retrieval;
mod dicomweb_client;
mod entities;
mod error;
mod export_service;
mod inference_request_store;
mod job_repository;
mod job_submission;
mod notification_bus;
mod persistence;
mod platform;
mod reclaimer;
mod results_service;
mod retry;
mod service_status;
mod storage_info;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use ae_manager::AeManager;
use backend::dimse::association::pool::AssociationPools;
use backend::dimse::cstore::storescp::{StoreServiceClassProvider, GATEWAY_AE_TITLE};
use cleanup_queue::CleanupQueue;
use config::AppConfig;
use data_retrieval::DataRetrievalService;
use dicomweb_client::DicomWebClient;
use export_service::{DicomScuExportSink, ExportService};
use inference_request_store::InferenceRequestStore;
use job_repository::JobRepository;
use job_submission::JobSubmissionService;
use notification_bus::NotificationBus;
use persistence::{open_database, PersistentTable};
use platform::HttpPlatformClient;
use results_service::HttpResultsServiceClient;
use service_status::{ServiceRegistry, ServiceStatus};
use storage_info::StorageInfoProvider;

/// `maxAssociationRetries` for the DICOM SCU export sink (`spec.md` §4.6,
/// "DICOM SCU variant"). No configuration key covers this in the example
/// deployment manifest, so it is a fixed constant (see `DESIGN.md`).
const EXPORT_MAX_ASSOCIATION_RETRIES: u32 = 2;

/// Shared application state threaded through every Axum handler (`spec.md`
/// §6). Cheap to clone: everything inside is a thin handle (an `Arc`, a
/// `redb`-backed table handle, or an `mpsc` sender).
#[derive(Clone)]
pub struct AppState {
	pub ae_manager: AeManager,
	pub notification_bus: NotificationBus,
	pub storage: StorageInfoProvider,
	pub inference_store: InferenceRequestStore,
	pub job_repository: JobRepository,
	pub cleanup_queue: CleanupQueue,
	pub platform: Arc<HttpPlatformClient>,
	pub service_registry: ServiceRegistry,
	pub requests_staging_root: std::path::PathBuf,
}

fn init_logger(level: tracing::Level) -> Result<(), anyhow::Error> {
	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_file(true)
		.with_line_number(true)
		.with_target(false)
		.with_env_filter(EnvFilter::builder().with_default_directive(level.into()).from_env_lossy())
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
	let config = AppConfig::load()?;
	init_logger(config.telemetry.level)?;
	debug!(?config, "loaded configuration");

	let _sentry_guard = config.telemetry.sentry.as_ref().map(|dsn| {
		sentry::init((
			dsn.clone(),
			sentry::ClientOptions {
				release: sentry::release_name!(),
				traces_sample_rate: 0.0,
				..Default::default()
			},
		))
	});

	let db = open_database(&config.persistence.path)?;
	let applications_table = PersistentTable::open(db.clone(), "application_entities")?;
	let destinations_table = PersistentTable::open(db.clone(), "destination_entities")?;
	let sources_table = PersistentTable::open(db.clone(), "source_entities")?;
	let inference_requests_table = PersistentTable::open(db.clone(), "inference_requests")?;
	let jobs_table = PersistentTable::open(db, "inference_jobs")?;

	let ae_manager = AeManager::new(applications_table, destinations_table, sources_table);
	ae_manager.bootstrap(&config).await?;

	let staging_root = config.storage.temporary.clone();
	let requests_staging_root = staging_root.join("requests");
	let jobs_staging_root = staging_root.join("jobs");
	let export_staging_root = staging_root.join("export");

	let notification_bus = NotificationBus::new();
	let storage = StorageInfoProvider::new(&config.storage);
	let (cleanup_queue, cleanup_rx) = CleanupQueue::new();

	// §4.1 startup contract: prior-run staging artifacts never survive a restart.
	ae_manager
		.sweep_orphaned_staging_subtrees(&staging_root, &cleanup_queue)
		.await?;

	let inference_store = InferenceRequestStore::new(inference_requests_table);
	let job_repository = JobRepository::new(jobs_table);
	job_repository.reset_job_state().await?;

	let platform = Arc::new(HttpPlatformClient::new(config.platform.clone()));
	let results_service = Arc::new(HttpResultsServiceClient::new(config.results_service.clone()));
	let dicomweb_client = DicomWebClient::new();

	let service_registry = ServiceRegistry::new();
	let cancel = CancellationToken::new();

	let state = AppState {
		ae_manager: ae_manager.clone(),
		notification_bus: notification_bus.clone(),
		storage: storage.clone(),
		inference_store: inference_store.clone(),
		job_repository: job_repository.clone(),
		cleanup_queue: cleanup_queue.clone(),
		platform: Arc::clone(&platform),
		service_registry: service_registry.clone(),
		requests_staging_root,
	};

	let mut workers = Vec::new();

	let reclaimer_handle = service_registry.register("reclaimer");
	reclaimer_handle.set(ServiceStatus::Running);
	workers.push(tokio::spawn({
		let cancel = cancel.clone();
		async move {
			reclaimer::run(cleanup_rx, cancel).await;
			reclaimer_handle.set(ServiceStatus::Stopped);
		}
	}));

	let data_retrieval = DataRetrievalService::new(
		inference_store.clone(),
		job_repository.clone(),
		storage.clone(),
		dicomweb_client,
		Duration::from_millis(config.persistence.crd_read_interval_ms),
	);
	let data_retrieval_handle = service_registry.register("data-retrieval");
	data_retrieval_handle.set(ServiceStatus::Running);
	workers.push(tokio::spawn({
		let cancel = cancel.clone();
		async move {
			if let Err(err) = data_retrieval.run(cancel).await {
				error!("data-retrieval service exited with error: {err}");
			}
			data_retrieval_handle.set(ServiceStatus::Stopped);
		}
	}));

	let job_submission = JobSubmissionService::new(
		job_repository.clone(),
		Arc::clone(&platform),
		config.platform.clone(),
		cleanup_queue.clone(),
		Duration::from_millis(config.persistence.crd_read_interval_ms),
	);
	let job_submission_handle = service_registry.register("job-submission");
	job_submission_handle.set(ServiceStatus::Running);
	workers.push(tokio::spawn({
		let cancel = cancel.clone();
		async move {
			if let Err(err) = job_submission.run(cancel).await {
				error!("job-submission service exited with error: {err}");
			}
			job_submission_handle.set(ServiceStatus::Stopped);
		}
	}));

	let ae_processor_handle = service_registry.register("ae-job-processors");
	ae_processor_handle.set(ServiceStatus::Running);
	let configured_aes = ae_manager.list_application_entities().await?;
	let ae_processor_handles = ae_job_processor::spawn_all(
		configured_aes,
		notification_bus.clone(),
		job_repository.clone(),
		jobs_staging_root,
		cancel.clone(),
	);
	workers.push(tokio::spawn(async move {
		for handle in ae_processor_handles {
			let _ = handle.await;
		}
		ae_processor_handle.set(ServiceStatus::Stopped);
	}));

	let destinations = ae_manager.list_destinations().await?;
	let association_pools = AssociationPools::new(GATEWAY_AE_TITLE, &destinations, &config.export);
	let export_sink = DicomScuExportSink::new(
		ae_manager.clone(),
		association_pools,
		Duration::from_millis(config.platform.request_timeout_ms),
		config.export.agent.clone(),
		EXPORT_MAX_ASSOCIATION_RETRIES,
	);
	let export_service = ExportService::new(
		Arc::clone(&results_service),
		Arc::clone(&platform),
		export_sink,
		storage.clone(),
		cleanup_queue.clone(),
		export_staging_root,
		&config.export,
	);
	let export_handle = service_registry.register("export");
	export_handle.set(ServiceStatus::Running);
	workers.push(tokio::spawn({
		let cancel = cancel.clone();
		async move {
			if let Err(err) = export_service.run(cancel).await {
				error!("export service exited with error: {err}");
			}
			export_handle.set(ServiceStatus::Stopped);
		}
	}));

	let scp = StoreServiceClassProvider::new(
		config.server.scp.clone(),
		ae_manager.clone(),
		notification_bus.clone(),
		storage.clone(),
	);
	let scp_handle = service_registry.register("scp-admission");
	scp_handle.set(ServiceStatus::Running);
	workers.push(tokio::spawn({
		let cancel = cancel.clone();
		async move {
			if let Err(err) = scp.run(cancel).await {
				error!("SCP admission path exited with error: {err}");
			}
			scp_handle.set(ServiceStatus::Stopped);
		}
	}));

	let http_handle = service_registry.register("http");
	http_handle.set(ServiceStatus::Running);
	let http_config = config.server.http.clone();
	let app = api::routes(&http_config.base_path).with_state(state);
	let address = std::net::SocketAddr::from((http_config.interface, http_config.port));
	let listener = tokio::net::TcpListener::bind(address).await?;
	info!("Starting HTTP server on http://{address}");

	let http_cancel = cancel.clone();
	workers.push(tokio::spawn(async move {
		let result = axum::serve(listener, app)
			.with_graceful_shutdown(async move { http_cancel.cancelled().await })
			.await;
		if let Err(err) = result {
			error!("HTTP server exited with error: {err}");
		}
		http_handle.set(ServiceStatus::Stopped);
	}));

	shutdown_signal().await;
	info!("shutdown requested, cancelling workers");
	cancel.cancel();

	for worker in workers {
		let _ = worker.await;
	}

	Ok(())
}

/// Waits for Ctrl-C (or, on Unix, SIGTERM). Cancelling an already-cancelled
/// [`CancellationToken`] is a no-op, so a second signal during shutdown is
/// harmless.
async fn shutdown_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};

	#[cfg(unix)]
	let terminate = async {
		let _ = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {}
		() = terminate => {}
	}
}
