//! Outbound DICOMweb client (`spec.md` §4.5): WADO-RS retrieval and QIDO-RS
//! query against a remote source's [`ConnectionDetails`]. The teacher
//! implements DICOMweb as a *server*; there is no client counterpart to
//! generalize, so this is built fresh using `reqwest`, the HTTP client the
//! wider example pack (`harmony`) uses for its own outbound calls.

use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, StatusCode};

use crate::entities::{AuthType, ConnectionDetails};
use crate::error::GatewayError;

#[derive(Clone)]
pub struct DicomWebClient {
	http: Client,
}

impl Default for DicomWebClient {
	fn default() -> Self {
		Self::new()
	}
}

impl DicomWebClient {
	#[must_use]
	pub fn new() -> Self {
		Self { http: Client::new() }
	}

	/// WADO-RS retrieve-instances-within-study, collected as individual
	/// `multipart/related` parts. Returns one `Bytes` buffer per instance.
	///
	/// # Errors
	/// Returns [`GatewayError::TransientTransport`] on a network failure and
	/// [`GatewayError::InferenceRequestException`] on an unauthorized or
	/// malformed auth declaration (§7 "InferenceRequestException").
	pub async fn retrieve_study(
		&self,
		connection: &ConnectionDetails,
		study_instance_uid: &str,
	) -> Result<Vec<Bytes>, GatewayError> {
		let url = connection
			.uri
			.join(&format!("studies/{study_instance_uid}"))
			.map_err(|err| GatewayError::Validation(err.to_string()))?;
		self.wado_get(connection, url).await
	}

	/// WADO-RS retrieve-instances-within-series.
	///
	/// # Errors
	/// See [`DicomWebClient::retrieve_study`].
	pub async fn retrieve_series(
		&self,
		connection: &ConnectionDetails,
		study_instance_uid: &str,
		series_instance_uid: &str,
	) -> Result<Vec<Bytes>, GatewayError> {
		let url = connection
			.uri
			.join(&format!(
				"studies/{study_instance_uid}/series/{series_instance_uid}"
			))
			.map_err(|err| GatewayError::Validation(err.to_string()))?;
		self.wado_get(connection, url).await
	}

	/// WADO-RS retrieve a single instance.
	///
	/// # Errors
	/// See [`DicomWebClient::retrieve_study`].
	pub async fn retrieve_instance(
		&self,
		connection: &ConnectionDetails,
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
	) -> Result<Vec<Bytes>, GatewayError> {
		let url = connection
			.uri
			.join(&format!(
				"studies/{study_instance_uid}/series/{series_instance_uid}/instances/{sop_instance_uid}"
			))
			.map_err(|err| GatewayError::Validation(err.to_string()))?;
		self.wado_get(connection, url).await
	}

	/// QIDO-RS study-level search by an arbitrary attribute (`PatientID` or
	/// `AccessionNumber`), returning each matched `StudyInstanceUID`.
	///
	/// # Errors
	/// See [`DicomWebClient::retrieve_study`].
	pub async fn query_studies(
		&self,
		connection: &ConnectionDetails,
		attribute: &str,
		value: &str,
	) -> Result<Vec<String>, GatewayError> {
		let mut url = connection
			.uri
			.join("studies")
			.map_err(|err| GatewayError::Validation(err.to_string()))?;
		url.query_pairs_mut().append_pair(attribute, value);

		let response = self
			.authorized_get(connection, url)
			.send()
			.await
			.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;

		if !response.status().is_success() {
			return Err(classify_http_status(response.status()));
		}

		let body: Vec<serde_json::Value> = response
			.json()
			.await
			.map_err(|err| GatewayError::DataCorruption(err.to_string()))?;

		Ok(body
			.iter()
			.filter_map(|study| {
				study
					.get("0020000D")
					.and_then(|el| el.get("Value"))
					.and_then(|values| values.get(0))
					.and_then(|v| v.as_str())
					.map(str::to_string)
			})
			.collect())
	}

	fn authorized_get(&self, connection: &ConnectionDetails, url: url::Url) -> reqwest::RequestBuilder {
		let request = self.http.get(url);
		match connection.auth_type {
			AuthType::Basic => request.header(
				"Authorization",
				format!("Basic {}", connection.auth_token),
			),
			AuthType::Bearer => request.bearer_auth(&connection.auth_token),
		}
	}

	async fn wado_get(
		&self,
		connection: &ConnectionDetails,
		url: url::Url,
	) -> Result<Vec<Bytes>, GatewayError> {
		let response = self
			.authorized_get(connection, url)
			.header("Accept", "multipart/related; type=\"application/dicom\"")
			.send()
			.await
			.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;

		if !response.status().is_success() {
			return Err(classify_http_status(response.status()));
		}

		let content_type = response
			.headers()
			.get(reqwest::header::CONTENT_TYPE)
			.and_then(|value| value.to_str().ok())
			.unwrap_or_default()
			.to_string();
		let boundary = multipart_boundary(&content_type)
			.ok_or_else(|| GatewayError::DataCorruption("missing multipart boundary".into()))?;

		let mut stream = response.bytes_stream();
		let mut buffer = Vec::new();
		while let Some(chunk) = stream.next().await {
			let chunk = chunk.map_err(|err| GatewayError::TransientTransport(err.to_string()))?;
			buffer.extend_from_slice(&chunk);
		}

		Ok(split_multipart_parts(&buffer, &boundary))
	}
}

fn classify_http_status(status: StatusCode) -> GatewayError {
	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		GatewayError::InferenceRequestException(format!("unauthorized: {status}"))
	} else if status.is_server_error() {
		GatewayError::TransientTransport(format!("remote returned {status}"))
	} else {
		GatewayError::PermanentTransport(format!("remote returned {status}"))
	}
}

fn multipart_boundary(content_type: &str) -> Option<String> {
	content_type
		.split(';')
		.map(str::trim)
		.find_map(|part| part.strip_prefix("boundary="))
		.map(|boundary| boundary.trim_matches('"').to_string())
}

/// Splits a `multipart/related` body into its constituent part payloads,
/// dropping each part's headers. Minimal by design: this gateway only needs
/// the DICOM payload bytes, not arbitrary multipart metadata.
fn split_multipart_parts(body: &[u8], boundary: &str) -> Vec<Bytes> {
	let delimiter = format!("--{boundary}").into_bytes();
	let mut parts = Vec::new();

	let mut rest = body;
	while let Some(pos) = find_subslice(rest, &delimiter) {
		rest = &rest[pos + delimiter.len()..];
		if rest.starts_with(b"--") {
			break;
		}
		let Some(next) = find_subslice(rest, &delimiter) else {
			break;
		};
		let part = &rest[..next];
		if let Some(header_end) = find_subslice(part, b"\r\n\r\n") {
			let payload = &part[header_end + 4..];
			let trimmed = payload.strip_suffix(b"\r\n").unwrap_or(payload);
			if !trimmed.is_empty() {
				parts.push(Bytes::copy_from_slice(trimmed));
			}
		}
	}

	parts
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	haystack
		.windows(needle.len())
		.position(|window| window == needle)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extracts_boundary_from_content_type() {
		let content_type = "multipart/related; type=\"application/dicom\"; boundary=\"abc123\"";
		assert_eq!(multipart_boundary(content_type), Some("abc123".to_string()));
	}

	#[test]
	fn splits_a_two_part_multipart_body() {
		let boundary = "boundary1";
		let body = format!(
			"--{boundary}\r\nContent-Type: application/dicom\r\n\r\nPART-ONE\r\n--{boundary}\r\nContent-Type: application/dicom\r\n\r\nPART-TWO\r\n--{boundary}--"
		);
		let parts = split_multipart_parts(body.as_bytes(), boundary);
		assert_eq!(parts.len(), 2);
		assert_eq!(parts[0].as_ref(), b"PART-ONE");
		assert_eq!(parts[1].as_ref(), b"PART-TWO");
	}
}
