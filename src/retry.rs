//! Shared retry combinator built on [`crate::error::classify`].

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{classify, Classification, GatewayError};

/// Retries `operation` per the classification of the error it returns, up to
/// `max_attempts` total tries. Used for persistence mutations (backoff
/// `2^n` seconds, §4.2/§7) and DICOMweb/platform transport calls.
pub async fn with_backoff<T, F, Fut>(max_attempts: u32, mut operation: F) -> Result<T, GatewayError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, GatewayError>>,
{
	let mut attempt = 1;
	loop {
		match operation().await {
			Ok(value) => return Ok(value),
			Err(err) => match classify(&err, attempt, max_attempts) {
				Classification::Retry { attempt: next, wait } => {
					warn!(attempt, wait = ?wait, "retrying after error: {err}");
					tokio::time::sleep(wait).await;
					attempt = next;
				}
				Classification::Fatal => {
					warn!(attempt, "giving up after error: {err}");
					return Err(err);
				}
				Classification::Cancelled => {
					debug!("operation cancelled: {err}");
					return Err(err);
				}
			},
		}
	}
}

/// Retries `operation` using the fixed 1s/2s/3s schedule reserved for
/// `IOFull` conditions during staging-to-payload copies (§4.4 "Copying").
/// Any other I/O error aborts immediately and propagates.
pub async fn with_disk_full_retry<T, F, Fut>(operation: F) -> Result<T, GatewayError>
where
	F: Fn() -> Fut,
	Fut: Future<Output = Result<T, GatewayError>>,
{
	let mut attempt = 1u32;
	loop {
		match operation().await {
			Ok(value) => return Ok(value),
			Err(GatewayError::IoFull(source)) if attempt <= 3 => {
				let wait = Duration::from_secs(u64::from(attempt));
				warn!(attempt, wait = ?wait, "disk full, retrying copy: {source}");
				tokio::time::sleep(wait).await;
				attempt += 1;
			}
			Err(err) => return Err(err),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};

	use super::*;

	#[tokio::test(start_paused = true)]
	async fn with_backoff_retries_until_success() {
		let attempts = AtomicU32::new(0);
		let result = with_backoff(3, || async {
			let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
			if attempt < 3 {
				Err(GatewayError::TransientTransport("flaky".into()))
			} else {
				Ok(attempt)
			}
		})
		.await
		.unwrap();

		assert_eq!(result, 3);
		assert_eq!(attempts.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn with_backoff_gives_up_after_max_attempts() {
		let attempts = AtomicU32::new(0);
		let result: Result<(), GatewayError> = with_backoff(3, || async {
			attempts.fetch_add(1, Ordering::SeqCst);
			Err(GatewayError::TransientTransport("always flaky".into()))
		})
		.await;

		assert!(result.is_err());
		assert_eq!(attempts.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn with_backoff_does_not_retry_fatal_errors() {
		let attempts = AtomicU32::new(0);
		let result: Result<(), GatewayError> = with_backoff(3, || async {
			attempts.fetch_add(1, Ordering::SeqCst);
			Err(GatewayError::Validation("bad input".into()))
		})
		.await;

		assert!(result.is_err());
		assert_eq!(attempts.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn with_disk_full_retry_retries_up_to_three_times() {
		let attempts = AtomicU32::new(0);
		let result = with_disk_full_retry(|| async {
			let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
			if attempt < 4 {
				Err(GatewayError::IoFull(std::io::Error::from_raw_os_error(28)))
			} else {
				Ok(attempt)
			}
		})
		.await
		.unwrap();

		assert_eq!(result, 4);
	}

	#[tokio::test]
	async fn with_disk_full_retry_propagates_non_disk_full_errors_immediately() {
		let attempts = AtomicU32::new(0);
		let result: Result<(), GatewayError> = with_disk_full_retry(|| async {
			attempts.fetch_add(1, Ordering::SeqCst);
			Err(GatewayError::IoOther(std::io::Error::other("not disk related")))
		})
		.await;

		assert!(result.is_err());
		assert_eq!(attempts.load(Ordering::SeqCst), 1);
	}
}
