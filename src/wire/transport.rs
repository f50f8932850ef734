use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::config::TlsOptions;
use crate::error::{Error, Result};
use crate::wire::codec::EOT;

/// A byte-level duplex channel delivering whole frames.
///
/// Implementations must deliver exactly the framed messages produced by the
/// server, terminated by a single EOT byte; the driver never reframes.
#[async_trait]
pub trait Transport: Send
{
	/// Sends one encoded frame (terminator included).
	async fn send(&mut self, frame: &[u8]) -> io::Result<()>;

	/// Receives one frame, with the terminator stripped.
	async fn receive(&mut self) -> io::Result<Vec<u8>>;

	/// Whether the channel is still usable.
	fn is_healthy(&self) -> bool;

	/// Shuts the channel down. Idempotent.
	async fn close(&mut self) -> io::Result<()>;
}

enum Stream
{
	Plain(TcpStream),
	Tls(Box<TlsStream<TcpStream>>),
}

/// [`Transport`] over TCP, optionally wrapped in TLS.
pub struct TcpTransport
{
	stream: Stream,
	buffer: BytesMut,
	healthy: bool,
}

impl std::fmt::Debug for TcpTransport
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("TcpTransport")
			.field("tls", &matches!(self.stream, Stream::Tls(_)))
			.field("healthy", &self.healthy)
			.finish_non_exhaustive()
	}
}

impl TcpTransport
{
	/// Establishes a TCP connection to `host:port`, negotiating TLS when
	/// `tls` requests it.
	#[tracing::instrument(level = "debug", skip(tls), err)]
	pub async fn connect(
		host: &str,
		port: u16,
		tls: Option<&TlsOptions>,
		connect_timeout: Duration,
	) -> Result<Self>
	{
		let addr = format!("{host}:{port}");

		let tcp_stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
			.await
			.map_err(|_| {
				Error::connection(format!("timed out connecting to {addr}"))
					.with_detail("address", &addr)
			})?
			.map_err(|err| {
				Error::connection(format!("failed to connect to {addr}"))
					.with_detail("address", &addr)
					.with_source(err)
			})?;

		tcp_stream.set_nodelay(true).map_err(Error::from)?;

		let stream = match tls {
			Some(tls_options) if tls_options.enabled => {
				let connector = build_tls_connector(tls_options)?;
				let server_name = ServerName::try_from(host.to_owned()).map_err(|err| {
					Error::connection(format!("invalid TLS server name {host:?}")).with_source(err)
				})?;

				let tls_stream = tokio::time::timeout(
					connect_timeout,
					connector.connect(server_name, tcp_stream),
				)
				.await
				.map_err(|_| Error::connection(format!("TLS handshake with {addr} timed out")))?
				.map_err(|err| {
					Error::connection(format!("TLS handshake with {addr} failed")).with_source(err)
				})?;

				tracing::debug!(address = %addr, "TLS handshake completed");
				Stream::Tls(Box::new(tls_stream))
			},
			_ => Stream::Plain(tcp_stream),
		};

		Ok(Self { stream, buffer: BytesMut::with_capacity(8 * 1024), healthy: true })
	}
}

#[async_trait]
impl Transport for TcpTransport
{
	async fn send(&mut self, frame: &[u8]) -> io::Result<()>
	{
		let result = match self.stream {
			Stream::Plain(ref mut stream) => stream.write_all(frame).await,
			Stream::Tls(ref mut stream) => stream.write_all(frame).await,
		};

		if result.is_err() {
			self.healthy = false;
		}

		result
	}

	async fn receive(&mut self) -> io::Result<Vec<u8>>
	{
		loop {
			if let Some(pos) = self.buffer.iter().position(|&byte| byte == EOT) {
				let mut frame = self.buffer.split_to(pos + 1);
				frame.truncate(pos);
				return Ok(frame.to_vec());
			}

			let read = match self.stream {
				Stream::Plain(ref mut stream) => stream.read_buf(&mut self.buffer).await,
				Stream::Tls(ref mut stream) => stream.read_buf(&mut self.buffer).await,
			};

			match read {
				Ok(0) => {
					self.healthy = false;
					return Err(io::Error::new(
						io::ErrorKind::UnexpectedEof,
						"connection closed before frame terminator",
					));
				},
				Ok(_) => {},
				Err(err) => {
					self.healthy = false;
					return Err(err);
				},
			}
		}
	}

	fn is_healthy(&self) -> bool
	{
		self.healthy
	}

	async fn close(&mut self) -> io::Result<()>
	{
		self.healthy = false;
		self.buffer.advance(self.buffer.len());

		match self.stream {
			Stream::Plain(ref mut stream) => stream.shutdown().await,
			Stream::Tls(ref mut stream) => stream.shutdown().await,
		}
	}
}

fn build_tls_connector(options: &TlsOptions) -> Result<TlsConnector>
{
	let builder = ClientConfig::builder();

	let builder = if options.insecure_skip_verify {
		tracing::warn!("TLS certificate verification is disabled");

		builder
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
	} else {
		let mut roots = RootCertStore::empty();

		match options.ca_file {
			Some(ref ca_file) => {
				let pem = std::fs::read(ca_file).map_err(|err| {
					Error::connection(format!("failed to read CA file {}", ca_file.display()))
						.with_source(err)
				})?;

				for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
					let cert = cert.map_err(|err| {
						Error::connection("failed to parse CA certificate").with_source(err)
					})?;

					roots.add(cert).map_err(|err| {
						Error::connection("failed to add CA certificate to root store")
							.with_source(err)
					})?;
				}
			},
			None => {
				roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
			},
		}

		builder.with_root_certificates(roots)
	};

	let config = match (&options.cert_file, &options.key_file) {
		(Some(cert_file), Some(key_file)) => {
			let cert_pem = std::fs::read(cert_file).map_err(|err| {
				Error::connection(format!(
					"failed to read client certificate {}",
					cert_file.display(),
				))
				.with_source(err)
			})?;

			let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
				.collect::<io::Result<Vec<_>>>()
				.map_err(|err| {
					Error::connection("failed to parse client certificate").with_source(err)
				})?;

			let key_pem = std::fs::read(key_file).map_err(|err| {
				Error::connection(format!("failed to read client key {}", key_file.display()))
					.with_source(err)
			})?;

			let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
				.map_err(|err| {
					Error::connection("failed to parse client key").with_source(err)
				})?
				.ok_or_else(|| Error::connection("client key file contains no private key"))?;

			builder.with_client_auth_cert(certs, key).map_err(|err| {
				Error::connection("client certificate/key rejected").with_source(err)
			})?
		},
		_ => builder.with_no_client_auth(),
	};

	Ok(TlsConnector::from(Arc::new(config)))
}

mod danger
{
	use tokio_rustls::rustls::client::danger::{
		HandshakeSignatureValid,
		ServerCertVerified,
		ServerCertVerifier,
	};
	use tokio_rustls::rustls::crypto::CryptoProvider;
	use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
	use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

	/// Accepts any server certificate. Only reachable through the
	/// `tls-insecure-skip-verify` option, which logs a warning.
	#[derive(Debug)]
	pub(super) struct NoVerification
	{
		provider: CryptoProvider,
	}

	impl NoVerification
	{
		pub(super) fn new() -> Self
		{
			Self {
				provider: tokio_rustls::rustls::crypto::aws_lc_rs::default_provider(),
			}
		}
	}

	impl ServerCertVerifier for NoVerification
	{
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, tokio_rustls::rustls::Error>
		{
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error>
		{
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error>
		{
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme>
		{
			self.provider
				.signature_verification_algorithms
				.supported_schemes()
		}
	}
}
