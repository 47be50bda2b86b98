//! Error kinds shared across the job-lifecycle pipeline.
//!
//! `spec.md` §7 describes these as *kinds*, not concrete exception types, so
//! [`GatewayError`] is a single flat enum rather than one type per component.
//! [`classify`] maps an error to a retry decision, replacing the
//! exceptions-for-flow pattern of the source system (see `DESIGN.md`).

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by any pipeline worker.
#[derive(Debug, Error)]
pub enum GatewayError {
	#[error("validation failed: {0}")]
	Validation(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("AE title '{0}' is not configured")]
	AeNotConfigured(String),

	#[error("insufficient storage for {0}")]
	InsufficientStorage(&'static str),

	#[error("transient transport error: {0}")]
	TransientTransport(String),

	#[error("permanent transport error: {0}")]
	PermanentTransport(String),

	#[error("inference request error: {0}")]
	InferenceRequestException(String),

	#[error("payload upload failed for {failed_count} file(s)")]
	PayloadUploadException { failed_count: usize },

	#[error("disk is full: {0}")]
	IoFull(#[source] std::io::Error),

	#[error("I/O error: {0}")]
	IoOther(#[from] std::io::Error),

	#[error("operation cancelled")]
	OperationCancelled,

	#[error("invalid state for this operation: {0}")]
	InvalidState(String),

	#[error("DICOM data corruption: {0}")]
	DataCorruption(String),
}

impl GatewayError {
	/// Wraps a [`std::io::Error`] as [`GatewayError::IoFull`] or
	/// [`GatewayError::IoOther`] depending on the OS error code.
	///
	/// Disk-full detection (Design Note §9, Open Question): on Linux, the
	/// source's two Windows-specific "disk full" codes map to `ENOSPC` (28,
	/// no space left on device) and `EDQUOT`/`EMLINK` (122/31, quota
	/// exceeded / too many links — the closest POSIX analogue of the
	/// source's "too many links" disk-pressure signal).
	pub fn from_io(err: std::io::Error) -> Self {
		const ENOSPC: i32 = 28;
		const EMLINK: i32 = 31;
		const EDQUOT: i32 = 122;

		match err.raw_os_error() {
			Some(ENOSPC | EMLINK | EDQUOT) => Self::IoFull(err),
			_ => Self::IoOther(err),
		}
	}
}

/// The outcome of classifying an error for a retry combinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
	/// Retry attempt number `attempt` (1-based) after waiting `wait`.
	Retry { attempt: u32, wait: Duration },
	/// Do not retry; the operation has permanently failed.
	Fatal,
	/// The operation was cancelled; log and swallow at the worker boundary.
	Cancelled,
}

/// Classifies an error and the attempt number that just failed into a retry
/// decision (Design Note §9: "Exceptions-for-flow" → `classify(err)`).
///
/// `max_attempts` bounds the number of retries (§3 `MaxRetry = 3` for
/// `InferenceRequest`/`InferenceJob` try-counts; §4.2/§7 persistence
/// mutations use the same bound with `2^n` second backoff).
#[must_use]
pub fn classify(err: &GatewayError, attempt: u32, max_attempts: u32) -> Classification {
	if matches!(err, GatewayError::OperationCancelled) {
		return Classification::Cancelled;
	}

	let retryable = matches!(
		err,
		GatewayError::TransientTransport(_) | GatewayError::IoFull(_)
	);

	if retryable && attempt < max_attempts {
		Classification::Retry {
			attempt: attempt + 1,
			wait: Duration::from_secs(2u64.pow(attempt)),
		}
	} else {
		Classification::Fatal
	}
}

/// Backoff schedule for [`GatewayError::IoFull`] retries: 1s, 2s, 3s (§4.4
/// "Copying") instead of the exponential `2^n` schedule used for persistence
/// mutations and transport retries.
#[must_use]
pub fn io_full_backoff(attempt: u32) -> Duration {
	Duration::from_secs(u64::from(attempt))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_io_maps_enospc_to_io_full() {
		let err = std::io::Error::from_raw_os_error(28);
		assert!(matches!(GatewayError::from_io(err), GatewayError::IoFull(_)));
	}

	#[test]
	fn from_io_maps_unrelated_errors_to_io_other() {
		let err = std::io::Error::from_raw_os_error(13); // EACCES
		assert!(matches!(GatewayError::from_io(err), GatewayError::IoOther(_)));
	}

	#[test]
	fn classify_retries_transient_transport_below_max_attempts() {
		let err = GatewayError::TransientTransport("boom".into());
		match classify(&err, 1, 3) {
			Classification::Retry { attempt, wait } => {
				assert_eq!(attempt, 2);
				assert_eq!(wait, Duration::from_secs(2));
			}
			other => panic!("expected Retry, got {other:?}"),
		}
	}

	#[test]
	fn classify_is_fatal_once_max_attempts_reached() {
		let err = GatewayError::TransientTransport("boom".into());
		assert_eq!(classify(&err, 3, 3), Classification::Fatal);
	}

	#[test]
	fn classify_never_retries_validation_errors() {
		let err = GatewayError::Validation("bad".into());
		assert_eq!(classify(&err, 1, 3), Classification::Fatal);
	}

	#[test]
	fn classify_reports_cancellation_even_on_first_attempt() {
		assert_eq!(classify(&GatewayError::OperationCancelled, 1, 3), Classification::Cancelled);
	}

	#[test]
	fn io_full_backoff_matches_the_fixed_schedule() {
		assert_eq!(io_full_backoff(1), Duration::from_secs(1));
		assert_eq!(io_full_backoff(2), Duration::from_secs(2));
		assert_eq!(io_full_backoff(3), Duration::from_secs(3));
	}
}
