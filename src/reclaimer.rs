//! The Disk Reclaimer (`spec.md` §4.7): a single worker draining the
//! Instance-Cleanup Queue and deleting each path, tolerating paths that are
//! already gone and retrying transient I/O failures a bounded number of
//! times.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cleanup_queue::CleanupQueueReceiver;
use crate::error::GatewayError;

const MAX_DELETE_ATTEMPTS: u32 = 3;

/// Runs until `cancel` fires or the queue's last producer is dropped.
pub async fn run(mut queue: CleanupQueueReceiver, cancel: CancellationToken) {
	loop {
		let path = tokio::select! {
			() = cancel.cancelled() => {
				debug!("disk reclaimer shutting down");
				return;
			}
			path = queue.recv() => path,
		};

		let Some(path) = path else {
			debug!("cleanup queue closed, disk reclaimer exiting");
			return;
		};

		if let Err(err) = delete_with_retry(&path).await {
			warn!(path = %path.display(), "giving up reclaiming path: {err}");
		}
	}
}

async fn delete_with_retry(path: &std::path::Path) -> Result<(), GatewayError> {
	let mut attempt = 1;
	loop {
		match tokio::fs::remove_file(path).await {
			Ok(()) => return Ok(()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
				// Reclaiming a path that is already gone is a no-op (§8).
				return Ok(());
			}
			Err(err) if attempt < MAX_DELETE_ATTEMPTS => {
				let wait = crate::error::io_full_backoff(attempt);
				warn!(path = %path.display(), attempt, "retrying delete after error: {err}");
				tokio::time::sleep(wait).await;
				attempt += 1;
			}
			Err(err) => return Err(GatewayError::from_io(err)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cleanup_queue::CleanupQueue;

	#[tokio::test]
	async fn deletes_an_existing_file() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("a.dcm");
		std::fs::write(&file, b"data").unwrap();

		let (queue, rx) = CleanupQueue::new();
		let cancel = CancellationToken::new();
		queue.enqueue(file.clone());
		cancel.cancel();

		// Drain manually instead of spawning `run` so the test does not race
		// the cancellation against the single enqueued item.
		delete_with_retry(&file).await.unwrap();
		assert!(!file.exists());
		drop(rx);
	}

	#[tokio::test]
	async fn deleting_a_missing_file_is_a_no_op() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("missing.dcm");
		assert!(delete_with_retry(&file).await.is_ok());
	}
}
