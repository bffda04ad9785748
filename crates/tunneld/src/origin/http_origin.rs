use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use once_cell::sync::OnceCell;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

use crate::http::{
	full_body, header, incoming_body, request_host, Body, HeaderValue, Request, Response,
};
use crate::ingress::origin_request::OriginRequestConfig;
use crate::origin::{dial, HttpRoundTripper, OriginError};
use crate::*;

type PooledClient = Client<HttpsConnector<HttpConnector>, Body>;

/// HTTP(S) origin. `ws`/`wss` URLs are carried here too: the framing is the
/// eyeball's business, the origin dial is plain HTTP with an Upgrade.
pub struct HttpOrigin {
	tls: bool,
	host: Strng,
	port: u16,
	host_header: Option<Strng>,
	match_sni_to_host: bool,
	cfg: OriginRequestConfig,
	tls_config: OnceCell<Arc<rustls::ClientConfig>>,
	client: tokio::sync::OnceCell<PooledClient>,
}

impl HttpOrigin {
	pub fn new(url: Url, cfg: &OriginRequestConfig) -> Self {
		// ws maps to http, wss to https.
		let tls = matches!(url.scheme(), "https" | "wss");
		let host = url.host_str().unwrap_or_default();
		let port = url
			.port()
			.unwrap_or(if tls { 443 } else { 80 });
		HttpOrigin {
			tls,
			host: host.into(),
			port,
			host_header: cfg.http_host_header.clone(),
			match_sni_to_host: false,
			cfg: cfg.clone(),
			tls_config: OnceCell::new(),
			client: tokio::sync::OnceCell::new(),
		}
	}

	pub fn with_match_sni_to_host(mut self, enabled: bool) -> Self {
		self.match_sni_to_host = enabled;
		self
	}

	/// Warm the shared transport so the first proxied request does not pay
	/// for TLS configuration loading.
	pub async fn start(&self) -> anyhow::Result<()> {
		if !self.needs_dedicated_dial() {
			self.pooled_client().await?;
		}
		Ok(())
	}

	fn authority(&self) -> String {
		let default_port = if self.tls { 443 } else { 80 };
		if self.port == default_port {
			self.host.to_string()
		} else {
			format!("{}:{}", self.host, self.port)
		}
	}

	/// Per-request SNI (match-SNI-to-host) cannot ride the pooled connector;
	/// a fixed SNI override keeps the dial on the dedicated path as well.
	fn needs_dedicated_dial(&self) -> bool {
		self.tls && (self.match_sni_to_host || self.cfg.origin_server_name.is_some())
	}

	fn tls_client_config(&self) -> Result<&Arc<rustls::ClientConfig>, OriginError> {
		self
			.tls_config
			.get_or_try_init(|| build_tls_config(&self.cfg).map(Arc::new))
			.map_err(OriginError::Internal)
	}

	async fn pooled_client(&self) -> Result<&PooledClient, OriginError> {
		self
			.client
			.get_or_try_init(|| async {
				let mut tls = self.tls_client_config()?.as_ref().clone();
				// hyper-rustls sets ALPN itself via enable_http1/enable_http2 and
				// panics if the config already has protocols configured.
				tls.alpn_protocols.clear();
				let mut http = HttpConnector::new();
				http.enforce_http(false);
				http.set_nodelay(true);
				http.set_connect_timeout(Some(self.cfg.connect_timeout));
				http.set_keepalive(Some(self.cfg.tcp_keepalive));
				let https = if self.cfg.http2_origin {
					hyper_rustls::HttpsConnectorBuilder::new()
						.with_tls_config(tls)
						.https_or_http()
						.enable_http2()
						.wrap_connector(http)
				} else {
					hyper_rustls::HttpsConnectorBuilder::new()
						.with_tls_config(tls)
						.https_or_http()
						.enable_http1()
						.wrap_connector(http)
				};
				let mut builder = Client::builder(TokioExecutor::new());
				builder
					.pool_idle_timeout(self.cfg.keepalive_timeout)
					.pool_max_idle_per_host(self.cfg.keepalive_connections);
				if self.cfg.http2_origin {
					builder.http2_only(true);
				}
				Ok(builder.build(https))
			})
			.await
	}

	fn apply_host_headers(&self, req: &mut Request, original_host: Option<&str>) {
		match &self.host_header {
			Some(override_host) => {
				if let Some(orig) = original_host {
					if let Ok(v) = HeaderValue::from_str(orig) {
						req.headers_mut().insert("x-forwarded-host", v);
					}
				}
				if let Ok(v) = HeaderValue::from_str(override_host) {
					req.headers_mut().insert(header::HOST, v);
				}
			},
			None => {
				if let Ok(v) = HeaderValue::from_str(&self.authority()) {
					req.headers_mut().insert(header::HOST, v);
				}
			},
		}
	}

	async fn dedicated_roundtrip(
		&self,
		mut req: Request,
		original_host: Option<String>,
	) -> Result<Response, OriginError> {
		// Origin-form target: the connection below is already pinned to the
		// origin, the URI only carries path and query.
		let path = origin_form(req.uri());
		*req.uri_mut() = path;
		self.apply_host_headers(&mut req, original_host.as_deref());

		let dest = format!("{}:{}", self.host, self.port);
		let tcp = dial(&dest, self.cfg.connect_timeout, self.cfg.no_happy_eyeballs).await?;
		let sni_host: String = match (&self.cfg.origin_server_name, self.match_sni_to_host) {
			(Some(name), _) => name.to_string(),
			(None, true) => original_host
				.map(|h| crate::ingress::strip_port(&h).to_string())
				.unwrap_or_else(|| self.host.to_string()),
			(None, false) => self.host.to_string(),
		};
		let server_name = ServerName::try_from(sni_host.clone())
			.map_err(|_| OriginError::InvalidRequest(format!("invalid sni host {sni_host}")))?;
		let connector = tokio_rustls::TlsConnector::from(self.tls_client_config()?.clone());
		let tls = tokio::time::timeout(self.cfg.tls_timeout, connector.connect(server_name, tcp))
			.await
			.map_err(|_| OriginError::TlsTimeout(self.host.clone()))?
			.map_err(|e| OriginError::Tls(self.host.clone(), e))?;
		single_roundtrip(tls, req, self.cfg.http2_origin).await
	}
}

#[async_trait::async_trait]
impl HttpRoundTripper for HttpOrigin {
	async fn round_trip(&self, mut req: Request) -> Result<Response, OriginError> {
		let original_host = request_host(&req).map(|h| h.to_string());
		if self.cfg.disable_chunked_encoding {
			req = buffer_body(req).await?;
		}
		if self.needs_dedicated_dial() {
			return self.dedicated_roundtrip(req, original_host).await;
		}

		// Rewrite to the configured origin, keeping path and query.
		let scheme = if self.tls { "https" } else { "http" };
		let path_and_query = req
			.uri()
			.path_and_query()
			.map(|pq| pq.as_str())
			.unwrap_or("/")
			.to_string();
		let uri = ::http::Uri::builder()
			.scheme(scheme)
			.authority(self.authority())
			.path_and_query(path_and_query)
			.build()
			.map_err(|e| OriginError::InvalidRequest(e.to_string()))?;
		*req.uri_mut() = uri;
		self.apply_host_headers(&mut req, original_host.as_deref());

		let client = self.pooled_client().await?;
		let resp = client
			.request(req)
			.await
			.map_err(|e| OriginError::RoundTrip(e.to_string()))?;
		Ok(resp.map(incoming_body))
	}
}

/// Reduce a URI to origin-form (path + query) for a pinned connection.
pub(crate) fn origin_form(uri: &::http::Uri) -> ::http::Uri {
	uri
		.path_and_query()
		.map(|pq| ::http::Uri::try_from(pq.as_str()).expect("path and query is a valid uri"))
		.unwrap_or_else(|| ::http::Uri::from_static("/"))
}

/// Buffer the request body so it is sent with a Content-Length instead of
/// chunked transfer encoding (some origins refuse chunked requests).
pub(crate) async fn buffer_body(req: Request) -> Result<Request, OriginError> {
	if req.headers().contains_key(header::CONTENT_LENGTH) {
		return Ok(req);
	}
	let (parts, body) = req.into_parts();
	let bytes = body
		.collect()
		.await
		.map_err(|e| OriginError::RoundTrip(e.to_string()))?
		.to_bytes();
	let len = bytes.len();
	let mut req = Request::from_parts(parts, full_body(bytes));
	req
		.headers_mut()
		.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
	Ok(req)
}

/// Drive one request over a dedicated connection (no pooling). Used for the
/// per-request-SNI path, unix sockets, and the hello-world origin.
pub(crate) async fn single_roundtrip<S>(
	io: S,
	req: Request,
	http2: bool,
) -> Result<Response, OriginError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	if http2 {
		let (mut sender, conn) =
			hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(io))
				.await
				.map_err(|e| OriginError::RoundTrip(e.to_string()))?;
		tokio::spawn(async move {
			if let Err(e) = conn.await {
				debug!(err=%e, "origin connection closed");
			}
		});
		let resp = sender
			.send_request(req)
			.await
			.map_err(|e| OriginError::RoundTrip(e.to_string()))?;
		Ok(resp.map(incoming_body))
	} else {
		let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
			.await
			.map_err(|e| OriginError::RoundTrip(e.to_string()))?;
		tokio::spawn(async move {
			if let Err(e) = conn.with_upgrades().await {
				debug!(err=%e, "origin connection closed");
			}
		});
		let resp = sender
			.send_request(req)
			.await
			.map_err(|e| OriginError::RoundTrip(e.to_string()))?;
		Ok(resp.map(incoming_body))
	}
}

/// Client TLS for origins: custom CA pool or the system roots, with an
/// opt-out verifier for origins fronted by self-signed certificates.
pub(crate) fn build_tls_config(cfg: &OriginRequestConfig) -> anyhow::Result<rustls::ClientConfig> {
	let mut roots = rustls::RootCertStore::empty();
	if let Some(ca_pool) = &cfg.ca_pool {
		let pem = fs_err::read(ca_pool.as_str())?;
		let mut reader = std::io::BufReader::new(std::io::Cursor::new(pem));
		let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
		roots.add_parsable_certificates(certs);
	} else {
		for cert in rustls_native_certs::load_native_certs().certs {
			let _ = roots.add(cert);
		}
	}
	let mut config = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	if cfg.no_tls_verify {
		config
			.dangerous()
			.set_certificate_verifier(Arc::new(insecure::NoVerifier));
	}
	config.alpn_protocols = if cfg.http2_origin {
		vec![b"h2".to_vec()]
	} else {
		vec![b"http/1.1".to_vec()]
	};
	Ok(config)
}

pub(crate) mod insecure {
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::{DigitallySignedStruct, SignatureScheme};
	use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

	#[derive(Debug)]
	pub struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer,
			_intermediates: &[CertificateDer],
			_server_name: &ServerName,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			vec![
				SignatureScheme::RSA_PKCS1_SHA1,
				SignatureScheme::ECDSA_SHA1_Legacy,
				SignatureScheme::RSA_PKCS1_SHA256,
				SignatureScheme::ECDSA_NISTP256_SHA256,
				SignatureScheme::RSA_PKCS1_SHA384,
				SignatureScheme::ECDSA_NISTP384_SHA384,
				SignatureScheme::RSA_PKCS1_SHA512,
				SignatureScheme::ECDSA_NISTP521_SHA512,
				SignatureScheme::RSA_PSS_SHA256,
				SignatureScheme::RSA_PSS_SHA384,
				SignatureScheme::RSA_PSS_SHA512,
				SignatureScheme::ED25519,
				SignatureScheme::ED448,
			]
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn origin_form_strips_authority() {
		let uri: ::http::Uri = "https://eyeball.example/a/b?q=1".parse().unwrap();
		assert_eq!(origin_form(&uri).to_string(), "/a/b?q=1");
		let bare: ::http::Uri = "https://eyeball.example".parse().unwrap();
		assert_eq!(origin_form(&bare).to_string(), "/");
	}

	#[test]
	fn authority_omits_default_ports() {
		let cfg = OriginRequestConfig::default();
		let o = HttpOrigin::new(Url::parse("http://origin.internal").unwrap(), &cfg);
		assert_eq!(o.authority(), "origin.internal");
		let o = HttpOrigin::new(Url::parse("https://origin.internal:8443").unwrap(), &cfg);
		assert_eq!(o.authority(), "origin.internal:8443");
		// wss maps to https and its default port.
		let o = HttpOrigin::new(Url::parse("wss://origin.internal").unwrap(), &cfg);
		assert!(o.tls);
		assert_eq!(o.port, 443);
	}
}
