//! The Persistence Layer (`spec.md` §4.2): durable key/value tables with
//! at-least-once `watch()` notifications and a monotonic per-row version.
//!
//! Storage is `redb` (the embedded, ACID, pure-Rust key/value store used by
//! the `harmony` example repo for its own persistence layer — see
//! `DESIGN.md`). Exact encoding is an implementation choice per `spec.md`
//! §6; rows are stored as JSON-serialized bytes keyed by a `String` id,
//! which keeps the table generic over every entity in `entities.rs` without
//! hand-writing a `redb::Value` impl per type.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::retry::with_backoff;

/// A row plus its monotonic version, as returned by `find`/`toList`/`watch`.
#[derive(Debug, Clone)]
pub struct Stored<T> {
	pub key: String,
	pub version: u64,
	pub value: T,
}

/// At-least-once change notification emitted by [`Table::watch`].
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
	Added(Stored<T>),
	Modified(Stored<T>),
	Deleted { key: String, version: u64 },
}

const MAX_MUTATION_ATTEMPTS: u32 = 4;

/// A durable table for one entity type, backed by a single `redb` table.
///
/// Concurrent reads are `redb`'s native MVCC read transactions. Writes are
/// serialized per table by `write_lock`, which is the coarse-grained but
/// correct reading of "serialize writes per key" (`spec.md` §4.2) for a
/// single shared embedded database file.
pub struct PersistentTable<T> {
	db: Arc<Database>,
	table: TableDefinition<'static, &'static str, &'static [u8]>,
	write_lock: Arc<Mutex<()>>,
	watch_tx: broadcast::Sender<WatchEvent<T>>,
	versions: Arc<std::sync::Mutex<HashMap<String, u64>>>,
	next_version: Arc<AtomicU64>,
	_marker: PhantomData<T>,
}

impl<T> Clone for PersistentTable<T> {
	fn clone(&self) -> Self {
		Self {
			db: Arc::clone(&self.db),
			table: self.table,
			write_lock: Arc::clone(&self.write_lock),
			watch_tx: self.watch_tx.clone(),
			versions: Arc::clone(&self.versions),
			next_version: Arc::clone(&self.next_version),
			_marker: PhantomData,
		}
	}
}

impl<T> PersistentTable<T>
where
	T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
	/// Opens (creating if absent) the named table within `db`.
	///
	/// # Errors
	/// Returns a [`GatewayError::IoOther`] if the table cannot be opened.
	pub fn open(db: Arc<Database>, name: &'static str) -> Result<Self, GatewayError> {
		let table: TableDefinition<'static, &'static str, &'static [u8]> = TableDefinition::new(name);
		let write_txn = db
			.begin_write()
			.map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))?;
		{
			write_txn
				.open_table(table)
				.map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))?;
		}
		write_txn
			.commit()
			.map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))?;

		let (watch_tx, _rx) = broadcast::channel(1024);
		Ok(Self {
			db,
			table,
			write_lock: Arc::new(Mutex::new(())),
			watch_tx,
			versions: Arc::new(std::sync::Mutex::new(HashMap::new())),
			next_version: Arc::new(AtomicU64::new(1)),
			_marker: PhantomData,
		})
	}

	/// Inserts or replaces the row at `key`, retrying transient transport
	/// failures with `2^n` second backoff up to 3 times (§4.2, §7).
	///
	/// # Errors
	/// Returns [`GatewayError`] if the mutation fails after retrying.
	pub async fn add(&self, key: &str, value: T) -> Result<(), GatewayError> {
		let existed = self.find(key).await?.is_some();
		with_backoff(MAX_MUTATION_ATTEMPTS, || self.write_row(key, &value)).await?;

		let version = self.bump_version(key);
		let stored = Stored {
			key: key.to_string(),
			version,
			value,
		};
		let event = if existed {
			WatchEvent::Modified(stored)
		} else {
			WatchEvent::Added(stored)
		};
		self.publish(event);
		Ok(())
	}

	/// Looks up a single row by key.
	///
	/// # Errors
	/// Returns [`GatewayError`] if the read transaction fails.
	pub async fn find(&self, key: &str) -> Result<Option<Stored<T>>, GatewayError> {
		let db = Arc::clone(&self.db);
		let table = self.table;
		let key = key.to_string();
		let bytes = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>, GatewayError> {
			let read_txn = db
				.begin_read()
				.map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))?;
			let table = read_txn
				.open_table(table)
				.map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))?;
			Ok(table
				.get(key.as_str())
				.map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))?
				.map(|value| value.value().to_vec()))
		})
		.await
		.map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))??;

		let Some(bytes) = bytes else {
			return Ok(None);
		};
		let value: T = serde_json::from_slice(&bytes)
			.map_err(|err| GatewayError::DataCorruption(err.to_string()))?;
		let version = self
			.versions
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
			.get(&key)
			.copied()
			.unwrap_or(1);

		Ok(Some(Stored { key, version, value }))
	}

	/// Removes a row, retrying on transient failure. A missing row is a
	/// no-op (§8 "Reclaiming a non-existent path is a no-op" generalizes
	/// here to "removing an absent row is a no-op").
	///
	/// # Errors
	/// Returns [`GatewayError`] if the mutation fails after retrying.
	pub async fn remove(&self, key: &str) -> Result<(), GatewayError> {
		with_backoff(MAX_MUTATION_ATTEMPTS, || self.delete_row(key)).await?;

		let version = self
			.versions
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
			.remove(key)
			.unwrap_or(0);
		self.publish(WatchEvent::Deleted {
			key: key.to_string(),
			version,
		});
		Ok(())
	}

	/// Returns every row currently in the table.
	///
	/// # Errors
	/// Returns [`GatewayError`] if the read transaction fails.
	pub async fn to_list(&self) -> Result<Vec<Stored<T>>, GatewayError> {
		let db = Arc::clone(&self.db);
		let table = self.table;
		let rows = tokio::task::spawn_blocking(move || -> Result<Vec<(String, Vec<u8>)>, GatewayError> {
			let read_txn = db
				.begin_read()
				.map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))?;
			let table = read_txn
				.open_table(table)
				.map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))?;
			let mut rows = Vec::new();
			for entry in table
				.iter()
				.map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))?
			{
				let (key, value) = entry.map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))?;
				rows.push((key.value().to_string(), value.value().to_vec()));
			}
			Ok(rows)
		})
		.await
		.map_err(|err| GatewayError::IoOther(std::io::Error::other(err)))??;

		let versions = self
			.versions
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
			.clone();

		rows.into_iter()
			.map(|(key, bytes)| {
				let value: T = serde_json::from_slice(&bytes)
					.map_err(|err| GatewayError::DataCorruption(err.to_string()))?;
				let version = versions.get(&key).copied().unwrap_or(1);
				Ok(Stored { key, version, value })
			})
			.collect()
	}

	/// Subscribes to ordered, at-least-once `Added`/`Modified`/`Deleted`
	/// events for this table.
	#[must_use]
	pub fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
		self.watch_tx.subscribe()
	}

	/// Flushes pending state. `redb` commits durably on every transaction,
	/// so this is a no-op kept for interface parity with `spec.md` §4.2.
	pub fn save(&self) {}

	async fn write_row(&self, key: &str, value: &T) -> Result<(), GatewayError> {
		let bytes = serde_json::to_vec(value).map_err(|err| GatewayError::DataCorruption(err.to_string()))?;
		let db = Arc::clone(&self.db);
		let table = self.table;
		let key = key.to_string();
		let _guard = self.write_lock.lock().await;
		tokio::task::spawn_blocking(move || -> Result<(), GatewayError> {
			let write_txn = db
				.begin_write()
				.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
			{
				let mut table = write_txn
					.open_table(table)
					.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
				table
					.insert(key.as_str(), bytes.as_slice())
					.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
			}
			write_txn
				.commit()
				.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
			Ok(())
		})
		.await
		.map_err(|err| GatewayError::TransientTransport(err.to_string()))?
	}

	async fn delete_row(&self, key: &str) -> Result<(), GatewayError> {
		let db = Arc::clone(&self.db);
		let table = self.table;
		let key = key.to_string();
		let _guard = self.write_lock.lock().await;
		tokio::task::spawn_blocking(move || -> Result<(), GatewayError> {
			let write_txn = db
				.begin_write()
				.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
			{
				let mut table = write_txn
					.open_table(table)
					.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
				table
					.remove(key.as_str())
					.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
			}
			write_txn
				.commit()
				.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
			Ok(())
		})
		.await
		.map_err(|err| GatewayError::TransientTransport(err.to_string()))?
	}

	fn bump_version(&self, key: &str) -> u64 {
		let version = self.next_version.fetch_add(1, Ordering::SeqCst);
		self.versions
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
			.insert(key.to_string(), version);
		version
	}

	fn publish(&self, event: WatchEvent<T>) {
		if self.watch_tx.send(event).is_err() {
			debug!("no subscribers currently watching this table");
		}
	}
}

/// Opens the embedded database at the configured path, creating parent
/// directories as needed.
///
/// # Errors
/// Returns a [`GatewayError`] if the database cannot be created/opened.
pub fn open_database(path: &std::path::Path) -> Result<Arc<Database>, GatewayError> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).map_err(GatewayError::from_io)?;
	}
	let db = Database::create(path).map_err(|err| {
		warn!("failed to open persistence database at {}: {err}", path.display());
		GatewayError::IoOther(std::io::Error::other(err))
	})?;
	Ok(Arc::new(db))
}

/// Label-based query support (§4.2 `asQueryable`): implemented for entities
/// that carry one or more of `jobId`/`payloadId`/`transactionId`.
pub trait Labeled {
	fn job_id(&self) -> Option<String> {
		None
	}
	fn payload_id(&self) -> Option<String> {
		None
	}
	fn transaction_id(&self) -> Option<String> {
		None
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label<'a> {
	JobId(&'a str),
	PayloadId(&'a str),
	TransactionId(&'a str),
}

impl<T> PersistentTable<T>
where
	T: Serialize + DeserializeOwned + Clone + Send + Sync + Labeled + 'static,
{
	/// `asQueryable()` — filters the table by one of the three recognized
	/// labels without a full secondary index, acceptable given the small
	/// working set of concurrently in-flight requests/jobs.
	///
	/// # Errors
	/// Returns [`GatewayError`] if the underlying scan fails.
	pub async fn find_by_label(&self, label: Label<'_>) -> Result<Vec<Stored<T>>, GatewayError> {
		let rows = self.to_list().await?;
		Ok(rows
			.into_iter()
			.filter(|row| match label {
				Label::JobId(id) => row.value.job_id().as_deref() == Some(id),
				Label::PayloadId(id) => row.value.payload_id().as_deref() == Some(id),
				Label::TransactionId(id) => row.value.transaction_id().as_deref() == Some(id),
			})
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use serde::{Deserialize, Serialize};

	use super::*;

	#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
	struct Widget {
		name: String,
		count: u32,
	}

	impl Labeled for Widget {
		fn job_id(&self) -> Option<String> {
			Some(self.name.clone())
		}
	}

	async fn open_table() -> PersistentTable<Widget> {
		let dir = tempfile::tempdir().unwrap();
		let db = open_database(&dir.path().join("widgets.redb")).unwrap();
		PersistentTable::open(db, "widgets").unwrap()
	}

	#[tokio::test]
	async fn add_then_find_round_trips_the_row() {
		let table = open_table().await;
		table
			.add("w1", Widget { name: "w1".into(), count: 1 })
			.await
			.unwrap();

		let found = table.find("w1").await.unwrap().unwrap();
		assert_eq!(found.value.count, 1);
		assert_eq!(found.version, 1);
	}

	#[tokio::test]
	async fn find_on_missing_key_returns_none() {
		let table = open_table().await;
		assert!(table.find("missing").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn remove_on_missing_key_is_a_no_op() {
		let table = open_table().await;
		table.remove("missing").await.unwrap();
	}

	#[tokio::test]
	async fn second_add_bumps_version_and_replaces_value() {
		let table = open_table().await;
		table
			.add("w1", Widget { name: "w1".into(), count: 1 })
			.await
			.unwrap();
		table
			.add("w1", Widget { name: "w1".into(), count: 2 })
			.await
			.unwrap();

		let found = table.find("w1").await.unwrap().unwrap();
		assert_eq!(found.value.count, 2);
		assert_eq!(found.version, 2);
	}

	#[tokio::test]
	async fn watch_observes_added_then_modified_then_deleted_in_order() {
		let table = open_table().await;
		let mut rx = table.watch();

		table
			.add("w1", Widget { name: "w1".into(), count: 1 })
			.await
			.unwrap();
		table
			.add("w1", Widget { name: "w1".into(), count: 2 })
			.await
			.unwrap();
		table.remove("w1").await.unwrap();

		assert!(matches!(rx.recv().await.unwrap(), WatchEvent::Added(_)));
		assert!(matches!(rx.recv().await.unwrap(), WatchEvent::Modified(_)));
		assert!(matches!(rx.recv().await.unwrap(), WatchEvent::Deleted { .. }));
	}

	#[tokio::test]
	async fn find_by_label_filters_on_the_requested_label_only() {
		let table = open_table().await;
		table
			.add("w1", Widget { name: "w1".into(), count: 1 })
			.await
			.unwrap();
		table
			.add("w2", Widget { name: "w2".into(), count: 2 })
			.await
			.unwrap();

		let matches = table.find_by_label(Label::JobId("w1")).await.unwrap();
		assert_eq!(matches.len(), 1);
		assert_eq!(matches[0].value.name, "w1");

		let none = table.find_by_label(Label::PayloadId("w1")).await.unwrap();
		assert!(none.is_empty());
	}

	#[tokio::test]
	async fn to_list_returns_every_row() {
		let table = open_table().await;
		table
			.add("w1", Widget { name: "w1".into(), count: 1 })
			.await
			.unwrap();
		table
			.add("w2", Widget { name: "w2".into(), count: 2 })
			.await
			.unwrap();

		let all = table.to_list().await.unwrap();
		assert_eq!(all.len(), 2);
	}
}
