//! Layered application configuration.
//!
//! Mirrors the teacher's `AppConfig::new()` three-source layering: compiled
//! defaults, an optional `config.yaml` next to the binary, then environment
//! variables prefixed `GATEWAY_`. See `spec.md` §6 "Configuration" for the
//! recognized options.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::types::AeTitle;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
	#[serde(default)]
	pub telemetry: TelemetryConfig,
	#[serde(default)]
	pub server: ServerConfig,
	pub storage: StorageConfig,
	#[serde(default)]
	pub persistence: PersistenceConfig,
	/// `Dicom.Scp.AeTitles` — static bootstrap of `ApplicationEntity`s.
	#[serde(default)]
	pub aets: Vec<ApplicationEntityBootstrap>,
	/// `ReadAeTitlesFromCrd` — feature flag enabling CRUD of AE titles at runtime.
	#[serde(default)]
	pub read_ae_titles_from_crd: bool,
	pub platform: PlatformConfig,
	pub results_service: ResultsServiceConfig,
	#[serde(rename = "dicom-scu-export-settings")]
	pub export: ExportConfig,
}

impl AppConfig {
	/// Loads configuration from:
	/// 1. Defaults (`defaults.yaml`, compiled into the binary)
	/// 2. `config.yaml` in the current working directory
	/// 3. Environment variables prefixed `GATEWAY_`, `_`-separated
	///
	/// # Errors
	/// Returns a [`config::ConfigError`] if source collection or
	/// deserialization fails.
	pub fn load() -> Result<Self, config::ConfigError> {
		use config::{Config, Environment, File, FileFormat};
		Config::builder()
			.add_source(File::from_str(
				include_str!("defaults.yaml"),
				FileFormat::Yaml,
			))
			.add_source(File::with_name("config.yaml").required(false))
			.add_source(Environment::with_prefix("GATEWAY").separator("__"))
			.build()?
			.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
	pub sentry: Option<String>,
	#[serde(deserialize_with = "deserialize_log_level")]
	pub level: tracing::Level,
}

impl Default for TelemetryConfig {
	fn default() -> Self {
		Self {
			sentry: None,
			level: tracing::Level::INFO,
		}
	}
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
where
	D: Deserializer<'de>,
{
	let value = String::deserialize(deserializer)?;
	tracing::Level::from_str(&value)
		.map_err(|_| D::Error::unknown_variant(&value, &["TRACE", "DEBUG", "INFO", "WARN", "ERROR"]))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
	pub http: HttpServerConfig,
	pub scp: ScpServerConfig,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			http: HttpServerConfig::default(),
			scp: ScpServerConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpServerConfig {
	pub interface: IpAddr,
	pub port: u16,
	pub request_timeout: u64,
	pub graceful_shutdown: bool,
	pub base_path: String,
}

impl Default for HttpServerConfig {
	fn default() -> Self {
		Self {
			interface: IpAddr::from([0, 0, 0, 0]),
			port: 8080,
			request_timeout: 60_000,
			graceful_shutdown: true,
			base_path: String::from("/"),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScpServerConfig {
	pub interface: IpAddr,
	pub port: u16,
	pub uncompressed: bool,
}

impl Default for ScpServerConfig {
	fn default() -> Self {
		Self {
			interface: IpAddr::from([0, 0, 0, 0]),
			port: 11112,
			uncompressed: true,
		}
	}
}

/// `Storage.Temporary` plus the disk-pressure thresholds gating the three
/// intake paths (§5 "Backpressure").
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
	pub temporary: PathBuf,
	#[serde(default = "StorageConfig::default_min_free_bytes")]
	pub min_free_bytes_to_store: u64,
	#[serde(default = "StorageConfig::default_min_free_bytes")]
	pub min_free_bytes_to_retrieve: u64,
	#[serde(default = "StorageConfig::default_min_free_bytes")]
	pub min_free_bytes_to_export: u64,
}

impl StorageConfig {
	const fn default_min_free_bytes() -> u64 {
		1_073_741_824 // 1 GiB
	}
}

/// `CrdReadIntervals` — polling interval for watch-style stores, plus the
/// embedded database file location.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PersistenceConfig {
	pub path: PathBuf,
	pub crd_read_interval_ms: u64,
}

impl Default for PersistenceConfig {
	fn default() -> Self {
		Self {
			path: PathBuf::from("gateway.redb"),
			crd_read_interval_ms: 5_000,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApplicationEntityBootstrap {
	pub name: String,
	pub aet: String,
	#[serde(default)]
	pub ignored_sop_classes: Vec<String>,
	#[serde(default)]
	pub overwrite_same_instance: bool,
	pub processor: String,
	#[serde(default)]
	pub processor_settings: std::collections::HashMap<String, String>,
}

/// `Services.Platform.*` — downstream inference platform connection and the
/// `MetadataUploading`/`PayloadUploading` tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlatformConfig {
	pub jobs_base_url: url::Url,
	pub payloads_base_url: url::Url,
	#[serde(default)]
	pub api_key: Option<String>,
	#[serde(default = "PlatformConfig::default_parallel_uploads")]
	pub parallel_uploads: usize,
	#[serde(default = "PlatformConfig::default_true")]
	pub upload_metadata: bool,
	#[serde(default)]
	pub metadata_dicom_source: Option<String>,
	#[serde(default = "PlatformConfig::default_timeout_ms")]
	pub request_timeout_ms: u64,
}

impl PlatformConfig {
	const fn default_parallel_uploads() -> usize {
		4
	}
	const fn default_true() -> bool {
		true
	}
	const fn default_timeout_ms() -> u64 {
		30_000
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResultsServiceConfig {
	pub base_url: url::Url,
	#[serde(default)]
	pub api_key: Option<String>,
	#[serde(default = "ResultsServiceConfig::default_timeout_ms")]
	pub request_timeout_ms: u64,
}

impl ResultsServiceConfig {
	const fn default_timeout_ms() -> u64 {
		30_000
	}
}

/// `Dicom.Scu.ExportSettings.*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExportConfig {
	pub agent: String,
	#[serde(default = "ExportConfig::default_poll_frequency_ms")]
	pub poll_frequency_ms: u64,
	#[serde(default = "ExportConfig::default_maximum_number_of_associations")]
	pub maximum_number_of_associations: usize,
	#[serde(default = "ExportConfig::default_failure_threshold")]
	pub failure_threshold: f64,
	#[serde(default = "ExportConfig::default_concurrency")]
	pub concurrency: usize,
}

impl ExportConfig {
	const fn default_poll_frequency_ms() -> u64 {
		5_000
	}
	const fn default_maximum_number_of_associations() -> usize {
		4
	}
	const fn default_failure_threshold() -> f64 {
		0.2
	}
	const fn default_concurrency() -> usize {
		4
	}
}

/// Validates that a configured AE title parses, for use at CRUD boundaries
/// (`/config/ae` etc. — §6, §8 "AE-title length 16 accepted, 17 rejected").
pub fn validate_aet(value: &str) -> Result<AeTitle, crate::types::AeTitleError> {
	AeTitle::new(value)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn compiled_defaults_parse_into_app_config() {
		let config = AppConfig::load().expect("defaults.yaml must deserialize into AppConfig");
		assert_eq!(config.server.http.port, 8080);
		assert_eq!(config.server.scp.port, 11112);
		assert_eq!(config.platform.parallel_uploads, 4);
		assert!((config.export.failure_threshold - 0.2).abs() < f64::EPSILON);
		assert!(config.aets.is_empty());
	}

	#[test]
	fn validate_aet_rejects_titles_over_sixteen_bytes() {
		assert!(validate_aet(&"A".repeat(17)).is_err());
		assert!(validate_aet(&"A".repeat(16)).is_ok());
	}
}
