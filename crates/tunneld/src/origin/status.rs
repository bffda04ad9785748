use std::sync::Once;

use crate::http::{empty_body, Request, Response, StatusCode};
use crate::origin::{HttpRoundTripper, OriginError};
use crate::*;

/// Synthesizes a fixed status without contacting anything. The default
/// variant stands in when no ingress was configured and says so, once.
pub struct StatusOrigin {
	code: u16,
	is_default: bool,
	warn_once: Once,
}

impl StatusOrigin {
	pub fn new(code: u16, is_default: bool) -> Self {
		StatusOrigin {
			code,
			is_default,
			warn_once: Once::new(),
		}
	}

	pub fn code(&self) -> u16 {
		self.code
	}
}

#[async_trait::async_trait]
impl HttpRoundTripper for StatusOrigin {
	async fn round_trip(&self, _req: Request) -> Result<Response, OriginError> {
		if self.is_default {
			let code = self.code;
			self.warn_once.call_once(|| {
				warn!(
					code,
					"no ingress rules configured; answering every request with a synthetic status"
				);
			});
		}
		let status = StatusCode::from_u16(self.code).unwrap_or_else(|_| {
			debug!(code = self.code, "status code not expressible; using 502");
			StatusCode::BAD_GATEWAY
		});
		Ok(
			::http::Response::builder()
				.status(status)
				.body(empty_body())
				.expect("static response must build"),
		)
	}
}
