use crate::backend::dimse::association;
use crate::backend::dimse::EchoServiceClassUser;
use crate::config::ExportConfig;
use crate::entities::DestinationApplicationEntity;
use crate::types::UI;
use association::client::{ClientAssociation, ClientAssociationOptions};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::ops::Deref;

use futures::TryFutureExt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PoolError<T> {
	#[error(transparent)]
	Backend(#[from] T),
	#[error("Timed out")]
	Timeout,
	#[error("Failed to recycle object: {0}")]
	Recycle(String),
}

pub trait Manager: Send + Sync {
	type Object;
	type Error;
	type Parameter: PartialEq;

	async fn create(&self, param: &Self::Parameter)
		-> Result<Self::Object, PoolError<Self::Error>>;
	async fn recycle(&self, object: &Self::Object) -> Result<(), String>;
}

pub struct Pool<M: Manager> {
	inner: Arc<InnerPool<M>>,
}

impl<M: Manager> Pool<M> {
	pub fn new(manager: M, pool_size: usize, timeout: Duration) -> Self {
		Self {
			inner: Arc::new(InnerPool {
				manager,
				slots: Mutex::new(VecDeque::new()),
				semaphore: Semaphore::new(pool_size),
				timeout,
			}),
		}
	}

	pub async fn get(&self, parameter: M::Parameter) -> Result<Object<M>, PoolError<M::Error>> {
		let timeout = tokio::time::timeout(self.inner.timeout, async {
			self.inner
				.semaphore
				.acquire()
				.await
				.expect("Semaphore should not be closed")
				.forget();

			let slot: Option<ObjectInner<M>> = {
				let mut slots = self.inner.slots.lock().unwrap();
				let target_slot = slots
					.iter()
					.rposition(|slot| slot.parameter == parameter)
					.and_then(|position| slots.remove(position));

				if let Some(target_slot) = target_slot {
					Some(target_slot)
				} else {
					slots.pop_front();
					None
				}
			};

			let object_inner = if let Some(mut slot) = slot {
				let obj = {
					let recycle_result = self.inner.manager.recycle(&slot.object).await;
					if recycle_result.is_ok() {
						slot.metrics.recycle_count += 1;
						slot.metrics.last_used = Instant::now();
						slot
					} else {
						let object = self.inner.manager.create(&parameter).await?;
						let now = Instant::now();
						ObjectInner {
							object,
							parameter,
							metrics: Metrics {
								recycle_count: 0,
								created: now,
								last_used: now,
							},
						}
					}
				};

				obj
			} else {
				let object = self.inner.manager.create(&parameter).await?;
				let now = Instant::now();

				ObjectInner {
					object,
					parameter,
					metrics: Metrics {
						recycle_count: 0,
						created: now,
						last_used: now,
					},
				}
			};

			Ok(Object {
				pool: Arc::downgrade(&self.inner),
				inner: Some(object_inner),
			})
		});

		timeout.unwrap_or_else(|_| Err(PoolError::Timeout)).await
	}
}

pub struct Object<M: Manager> {
	pool: Weak<InnerPool<M>>,
	inner: Option<ObjectInner<M>>,
}

impl<M: Manager> Deref for Object<M> {
	type Target = M::Object;

	fn deref(&self) -> &Self::Target {
		&self.inner.as_ref().unwrap().object
	}
}

impl<M: Manager> Drop for Object<M> {
	fn drop(&mut self) {
		if let Some(pool) = self.pool.upgrade() {
			pool.semaphore.add_permits(1);
			if let Some(object) = self.inner.take() {
				let mut slots = pool.slots.lock().unwrap();
				slots.push_back(object);
			}
		}
	}
}

impl<M: Manager> Clone for Pool<M> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

struct InnerPool<M: Manager> {
	manager: M,
	slots: Mutex<VecDeque<ObjectInner<M>>>,
	semaphore: Semaphore,
	timeout: Duration,
}

struct ObjectInner<M: Manager> {
	object: M::Object,
	parameter: M::Parameter,
	metrics: Metrics,
}

#[derive(Debug)]
pub struct Metrics {
	pub created: Instant,
	pub recycle_count: usize,
	pub last_used: Instant,
}

pub struct AssociationManager {
	pub address: SocketAddr,
	pub calling_aet: String,
	pub called_aet: String,
}

pub struct PresentationParameter {
	pub abstract_syntax_uid: UI,
	pub transfer_syntax_uids: Vec<UI>,
}

impl PartialEq for PresentationParameter {
	fn eq(&self, other: &Self) -> bool {
		self.abstract_syntax_uid == other.abstract_syntax_uid
			&& self
				.transfer_syntax_uids
				.iter()
				.any(|ts| other.transfer_syntax_uids.contains(ts))
	}
}

impl Manager for AssociationManager {
	type Object = ClientAssociation;
	type Error = association::AssociationError;
	type Parameter = PresentationParameter;

	async fn create(
		&self,
		param: &Self::Parameter,
	) -> Result<Self::Object, PoolError<Self::Error>> {
		let options = ClientAssociationOptions {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.called_aet.clone(),
			abstract_syntax: param.abstract_syntax_uid.clone(),
			transfer_syntaxes: param.transfer_syntax_uids.clone(),
			address: self.address,
		};

		let association = ClientAssociation::new(options)
			.await
			.map_err(PoolError::Backend);

		if let Ok(association) = &association {
			info!(
				backend_uuid = association.uuid().to_string(),
				"Created new client association"
			);
		} else {
			warn!("Failed to create new client association");
		}

		association
	}

	async fn recycle(&self, association: &Self::Object) -> Result<(), String> {
		let successful = EchoServiceClassUser::new(association)
			.echo(Duration::from_secs(5))
			.await
			.map_err(|err| format!("Failed to recycle association: {err}"))?;

		if successful {
			info!(
				backend_uuid = association.uuid().to_string(),
				"Recycled association"
			);
			Ok(())
		} else {
			warn!(
				backend_uuid = association.uuid().to_string(),
				"Recycling failed"
			);
			Err(String::from("C-ECHO returned non-successful status code"))
		}
	}
}

pub type AssociationPool = Pool<AssociationManager>;

/// One association pool per configured export destination, keyed by the
/// destination's name (`spec.md` §4.6, §3 `DestinationApplicationEntity`).
#[derive(Clone)]
pub struct AssociationPools(HashMap<String, AssociationPool>);

impl AssociationPools {
	/// Builds one pool per destination, sized by
	/// `ExportConfig.maximum_number_of_associations`.
	pub fn new(
		calling_aet: &str,
		destinations: &[DestinationApplicationEntity],
		export: &ExportConfig,
	) -> Self {
		let mut pools = HashMap::with_capacity(destinations.len());
		for destination in destinations {
			let address = SocketAddr::from((
				resolve_host(&destination.host),
				destination.port.get(),
			));
			let mgr = AssociationManager {
				calling_aet: calling_aet.to_string(),
				address,
				called_aet: destination.aet.to_string(),
			};

			let pool = Pool::new(
				mgr,
				export.maximum_number_of_associations,
				Duration::from_secs(30),
			);
			pools.insert(destination.name.clone(), pool);

			info!(
				destination = destination.name,
				pool_size = export.maximum_number_of_associations,
				"Created new association pool"
			);
		}

		Self(pools)
	}

	#[inline]
	pub fn get(&self, destination_name: &str) -> Option<&AssociationPool> {
		self.0.get(destination_name)
	}

	#[inline]
	pub fn destination_names(&self) -> impl Iterator<Item = &String> {
		self.0.keys()
	}
}

fn resolve_host(host: &str) -> std::net::IpAddr {
	use std::net::ToSocketAddrs;
	host.parse().unwrap_or_else(|_| {
		(host, 0)
			.to_socket_addrs()
			.ok()
			.and_then(|mut addrs| addrs.next())
			.map_or(std::net::IpAddr::from([0, 0, 0, 0]), |addr| addr.ip())
	})
}
