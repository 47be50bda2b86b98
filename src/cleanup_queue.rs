//! The Instance-Cleanup Queue (`spec.md` §4.7): an unbounded FIFO of
//! absolute file paths awaiting deletion by the Disk Reclaimer.

use std::path::PathBuf;

use tokio::sync::mpsc;

/// Producer handle, cloned freely across the Job-Submission Service, Export
/// Service, and Data-Retrieval Service.
#[derive(Debug, Clone)]
pub struct CleanupQueue {
	tx: mpsc::UnboundedSender<PathBuf>,
}

/// Consumer handle held by the Disk Reclaimer.
pub struct CleanupQueueReceiver {
	rx: mpsc::UnboundedReceiver<PathBuf>,
}

impl CleanupQueue {
	#[must_use]
	pub fn new() -> (Self, CleanupQueueReceiver) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, CleanupQueueReceiver { rx })
	}

	/// Enqueues a path for eventual deletion. Never blocks and never fails:
	/// the channel is unbounded, matching the "fire and forget" enqueue of
	/// §4.7.
	pub fn enqueue(&self, path: PathBuf) {
		// A closed receiver only happens during shutdown, after which a
		// dropped cleanup entry is harmless; the path stays on disk for the
		// next startup's staging-subtree sweep to find.
		let _ = self.tx.send(path);
	}

	pub fn enqueue_all(&self, paths: impl IntoIterator<Item = PathBuf>) {
		for path in paths {
			self.enqueue(path);
		}
	}
}

impl CleanupQueueReceiver {
	pub async fn recv(&mut self) -> Option<PathBuf> {
		self.rx.recv().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn enqueued_paths_arrive_in_order() {
		let (queue, mut rx) = CleanupQueue::new();
		queue.enqueue(PathBuf::from("/staging/a.dcm"));
		queue.enqueue(PathBuf::from("/staging/b.dcm"));

		assert_eq!(rx.recv().await, Some(PathBuf::from("/staging/a.dcm")));
		assert_eq!(rx.recv().await, Some(PathBuf::from("/staging/b.dcm")));
	}

	#[tokio::test]
	async fn enqueue_after_receiver_drop_does_not_panic() {
		let (queue, rx) = CleanupQueue::new();
		drop(rx);
		queue.enqueue(PathBuf::from("/staging/a.dcm"));
	}
}
