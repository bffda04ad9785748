use url::Url;

use crate::http::HeaderMap;
use crate::*;

/// Header carrying the jump-host destination on bastion rules.
pub const JUMP_DESTINATION_HEADER: &str = "Cf-Access-Jump-Destination";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BastionError {
	#[error("bastion destination header {JUMP_DESTINATION_HEADER} is missing")]
	MissingHeader,
	#[error("invalid bastion destination: {0}")]
	Invalid(String),
}

/// Resolve the dial target from the jump-destination header. URL-shaped
/// values contribute their authority verbatim (no default port is injected);
/// anything else passes through as a literal `host:port`.
pub fn resolve_dest(headers: &HeaderMap) -> Result<String, BastionError> {
	let raw = headers
		.get(JUMP_DESTINATION_HEADER)
		.ok_or(BastionError::MissingHeader)?
		.to_str()
		.map_err(|_| BastionError::Invalid("header is not valid ascii".to_string()))?;
	if raw.is_empty() {
		return Err(BastionError::MissingHeader);
	}
	match Url::parse(raw) {
		Ok(url) if url.host_str().is_some() => {
			let host = url.host_str().expect("checked above");
			Ok(match url.port() {
				Some(port) => format!("{host}:{port}"),
				None => host.to_string(),
			})
		},
		_ => Ok(raw.to_string()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::HeaderValue;

	fn headers(value: Option<&str>) -> HeaderMap {
		let mut h = HeaderMap::new();
		if let Some(v) = value {
			h.insert(JUMP_DESTINATION_HEADER, HeaderValue::from_str(v).unwrap());
		}
		h
	}

	#[test]
	fn url_destinations_use_host_and_port() {
		assert_eq!(
			resolve_dest(&headers(Some("ssh://localhost:9000/metrics"))).unwrap(),
			"localhost:9000"
		);
	}

	#[test]
	fn url_without_port_passes_host_through() {
		assert_eq!(
			resolve_dest(&headers(Some("ssh://jumpbox.internal"))).unwrap(),
			"jumpbox.internal"
		);
	}

	#[test]
	fn literal_host_port_passes_through() {
		assert_eq!(
			resolve_dest(&headers(Some("127.0.0.1:9000"))).unwrap(),
			"127.0.0.1:9000"
		);
	}

	#[test]
	fn missing_header_is_an_error() {
		assert_eq!(resolve_dest(&headers(None)), Err(BastionError::MissingHeader));
	}
}
