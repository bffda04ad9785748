use std::path::PathBuf;

use once_cell::sync::OnceCell;
use rustls_pki_types::ServerName;

use crate::http::{header, request_host, HeaderValue, Request, Response};
use crate::ingress::origin_request::OriginRequestConfig;
use crate::origin::http_origin::{buffer_body, build_tls_config, origin_form, single_roundtrip};
use crate::origin::{HttpRoundTripper, OriginError};
use crate::*;

/// HTTP over a unix domain socket. Each request dials the socket; the "host"
/// of the origin is nominal.
pub struct UnixOrigin {
	path: PathBuf,
	tls: bool,
	cfg: OriginRequestConfig,
	tls_config: OnceCell<Arc<rustls::ClientConfig>>,
}

impl UnixOrigin {
	pub fn new(path: PathBuf, tls: bool, cfg: &OriginRequestConfig) -> Self {
		UnixOrigin {
			path,
			tls,
			cfg: cfg.clone(),
			tls_config: OnceCell::new(),
		}
	}
}

#[async_trait::async_trait]
impl HttpRoundTripper for UnixOrigin {
	async fn round_trip(&self, mut req: Request) -> Result<Response, OriginError> {
		let original_host = request_host(&req).map(|h| h.to_string());
		if self.cfg.disable_chunked_encoding {
			req = buffer_body(req).await?;
		}
		*req.uri_mut() = origin_form(req.uri());
		match &self.cfg.http_host_header {
			Some(host) => {
				if let Some(orig) = original_host {
					if let Ok(v) = HeaderValue::from_str(&orig) {
						req.headers_mut().insert("x-forwarded-host", v);
					}
				}
				if let Ok(v) = HeaderValue::from_str(host) {
					req.headers_mut().insert(header::HOST, v);
				}
			},
			None => {
				req
					.headers_mut()
					.insert(header::HOST, HeaderValue::from_static("localhost"));
			},
		}

		let name: Strng = strng::format!("{}", self.path.display());
		let stream = tokio::time::timeout(
			self.cfg.connect_timeout,
			tokio::net::UnixStream::connect(&self.path),
		)
		.await
		.map_err(|_| OriginError::ConnectTimeout(name.clone()))?
		.map_err(|e| OriginError::Connect(name.clone(), e))?;

		if self.tls {
			let sni = self
				.cfg
				.origin_server_name
				.as_deref()
				.unwrap_or("localhost")
				.to_string();
			let server_name = ServerName::try_from(sni.clone())
				.map_err(|_| OriginError::InvalidRequest(format!("invalid sni host {sni}")))?;
			let tls_config = self
				.tls_config
				.get_or_try_init(|| build_tls_config(&self.cfg).map(Arc::new))
				.map_err(OriginError::Internal)?;
			let connector = tokio_rustls::TlsConnector::from(tls_config.clone());
			let tls = tokio::time::timeout(self.cfg.tls_timeout, connector.connect(server_name, stream))
				.await
				.map_err(|_| OriginError::TlsTimeout(name.clone()))?
				.map_err(|e| OriginError::Tls(name, e))?;
			single_roundtrip(tls, req, self.cfg.http2_origin).await
		} else {
			single_roundtrip(stream, req, self.cfg.http2_origin).await
		}
	}
}
