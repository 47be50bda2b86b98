//! The Instance-Stored Notification Bus (`spec.md` §4.1, §4.3): fans
//! newly-staged instances out to whichever per-AE processor subscribed to
//! that Application Entity.
//!
//! Grounded on the teacher's STORE-SCP/MOVE-SCU mediator
//! (`backend/dimse/cmove/mediator.rs`'s `MoveMediator`, a `HashMap` of
//! callbacks keyed by task identity) but reworked for this gateway: keys are
//! `AeTitle`s rather than `TaskKey`s, there can be more than one subscriber
//! per key, and delivery is a plain `mpsc` channel rather than a
//! request/response callback.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::entities::InstanceStorageInfo;
use crate::types::AeTitle;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// Receiver half handed to a subscribed processor.
pub type Subscription = mpsc::Receiver<InstanceStorageInfo>;

#[derive(Default, Clone)]
pub struct NotificationBus {
	subscribers: Arc<Mutex<HashMap<AeTitle, Vec<mpsc::Sender<InstanceStorageInfo>>>>>,
}

impl NotificationBus {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a new subscriber for `aet`. The called AE may have more
	/// than one live subscription at a time (e.g. during a processor
	/// restart); all of them receive every notification.
	pub async fn subscribe(&self, aet: AeTitle) -> Subscription {
		let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
		self.subscribers.lock().await.entry(aet).or_default().push(tx);
		rx
	}

	/// Publishes a newly-staged instance to every subscriber of its called
	/// AE. Delivery is best-effort: a subscriber whose channel is full or
	/// closed is pruned rather than blocking the SCP admission path.
	pub async fn publish(&self, aet: &AeTitle, info: InstanceStorageInfo) {
		let mut subscribers = self.subscribers.lock().await;
		let Some(senders) = subscribers.get_mut(aet) else {
			debug!(aet = %aet, "no processor subscribed for this AE title");
			return;
		};

		senders.retain(|tx| match tx.try_send(info.clone()) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				debug!(aet = %aet, "subscriber channel full, dropping one slow subscriber");
				true
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		});
	}
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use super::*;

	fn sample_instance() -> InstanceStorageInfo {
		InstanceStorageInfo {
			sop_instance_uid: "1.2.3".into(),
			study_instance_uid: "1.2".into(),
			series_instance_uid: "1.2.3.1".into(),
			patient_id: "PAT1".into(),
			staging_path: PathBuf::from("/staging/1.2.3.dcm"),
			source_staging_path: PathBuf::new(),
			source_aet: "MODALITY1".into(),
			association_id: 1,
		}
	}

	#[tokio::test]
	async fn subscriber_receives_published_instance() {
		let bus = NotificationBus::new();
		let aet = AeTitle::new("RECEIVER1").unwrap();
		let mut rx = bus.subscribe(aet.clone()).await;

		bus.publish(&aet, sample_instance()).await;

		let received = rx.recv().await.unwrap();
		assert_eq!(received.sop_instance_uid, "1.2.3");
	}

	#[tokio::test]
	async fn publish_with_no_subscriber_does_not_panic() {
		let bus = NotificationBus::new();
		let aet = AeTitle::new("NOBODY").unwrap();
		bus.publish(&aet, sample_instance()).await;
	}

	#[tokio::test]
	async fn dropped_subscriber_is_pruned_on_next_publish() {
		let bus = NotificationBus::new();
		let aet = AeTitle::new("RECEIVER1").unwrap();
		let rx = bus.subscribe(aet.clone()).await;
		drop(rx);

		bus.publish(&aet, sample_instance()).await;
		assert!(bus.subscribers.lock().await.get(&aet).unwrap().is_empty());
	}
}
