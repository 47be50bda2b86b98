//! The worker health registry backing `GET /health/status` and
//! `GET /health/ready` (`spec.md` §6): every long-running worker registers
//! itself here and flips its status as it starts, runs, and stops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ServiceStatus {
	Unknown,
	Running,
	Stopped,
	Cancelled,
}

/// Per-worker processed/failed/retried counters (`SPEC_FULL.md` §4
/// supplemental: a lightweight in-process metrics counter per worker,
/// surfaced via `/health/status` rather than exported to Prometheus).
#[derive(Debug, Default)]
struct WorkerCounters {
	processed: AtomicU64,
	failed: AtomicU64,
	retried: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct WorkerMetrics {
	pub processed: u64,
	pub failed: u64,
	pub retried: u64,
}

/// A single worker's named handle into the shared registry. Cheap to clone;
/// every clone updates the same row.
#[derive(Clone)]
pub struct ServiceHandle {
	name: &'static str,
	registry: ServiceRegistry,
}

impl ServiceHandle {
	pub fn set(&self, status: ServiceStatus) {
		self.registry.set(self.name, status);
	}

	pub fn record_processed(&self) {
		self.registry.counters(self.name).processed.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_failed(&self) {
		self.registry.counters(self.name).failed.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_retried(&self) {
		self.registry.counters(self.name).retried.fetch_add(1, Ordering::Relaxed);
	}
}

/// Shared registry of every worker's last reported [`ServiceStatus`] and
/// running counters.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
	statuses: Arc<Mutex<HashMap<&'static str, ServiceStatus>>>,
	counters: Arc<Mutex<HashMap<&'static str, Arc<WorkerCounters>>>>,
}

impl ServiceRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `name` as `Unknown` and returns a handle it can use to
	/// report its own transitions and counters.
	#[must_use]
	pub fn register(&self, name: &'static str) -> ServiceHandle {
		self.statuses.lock().unwrap().insert(name, ServiceStatus::Unknown);
		self.counters.lock().unwrap().entry(name).or_insert_with(|| Arc::new(WorkerCounters::default()));
		ServiceHandle {
			name,
			registry: self.clone(),
		}
	}

	fn set(&self, name: &'static str, status: ServiceStatus) {
		self.statuses.lock().unwrap().insert(name, status);
	}

	fn counters(&self, name: &'static str) -> Arc<WorkerCounters> {
		Arc::clone(
			self.counters
				.lock()
				.unwrap()
				.entry(name)
				.or_insert_with(|| Arc::new(WorkerCounters::default())),
		)
	}

	#[must_use]
	pub fn snapshot(&self) -> HashMap<&'static str, ServiceStatus> {
		self.statuses.lock().unwrap().clone()
	}

	#[must_use]
	pub fn metrics_snapshot(&self) -> HashMap<&'static str, WorkerMetrics> {
		self.counters
			.lock()
			.unwrap()
			.iter()
			.map(|(name, counters)| {
				(
					*name,
					WorkerMetrics {
						processed: counters.processed.load(Ordering::Relaxed),
						failed: counters.failed.load(Ordering::Relaxed),
						retried: counters.retried.load(Ordering::Relaxed),
					},
				)
			})
			.collect()
	}

	/// `ready = Healthy` iff every registered worker reports `Running` (§6).
	#[must_use]
	pub fn all_running(&self) -> bool {
		let statuses = self.statuses.lock().unwrap();
		!statuses.is_empty() && statuses.values().all(|status| *status == ServiceStatus::Running)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn freshly_registered_worker_is_unknown() {
		let registry = ServiceRegistry::new();
		registry.register("data-retrieval");
		assert_eq!(registry.snapshot()["data-retrieval"], ServiceStatus::Unknown);
		assert!(!registry.all_running());
	}

	#[test]
	fn ready_iff_every_worker_is_running() {
		let registry = ServiceRegistry::new();
		let a = registry.register("a");
		let b = registry.register("b");
		a.set(ServiceStatus::Running);
		assert!(!registry.all_running());
		b.set(ServiceStatus::Running);
		assert!(registry.all_running());
	}
}
