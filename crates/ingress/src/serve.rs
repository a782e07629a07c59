use std::convert::Infallible;
use std::path::Path;

use faros_core::drain::DrainWatcher;
use faros_core::prelude::*;
use futures_util::FutureExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::http::{Body, Request, Response, StatusCode, empty_response};

pub fn auto_server() -> auto::Builder<TokioExecutor> {
	let mut b = auto::Builder::new(TokioExecutor::new());
	b.http2().timer(TokioTimer::new());
	b
}

/// Loads a rustls server config from PEM cert/key files, with ALPN for h2 and
/// HTTP/1.1.
pub fn tls_server_config(cert: &Path, key: &Path) -> anyhow::Result<Arc<ServerConfig>> {
	let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
		std::fs::File::open(cert).with_context(|| format!("open {}", cert.display()))?,
	))
	.collect::<Result<Vec<_>, _>>()?;
	let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
		std::fs::File::open(key).with_context(|| format!("open {}", key.display()))?,
	))?
	.context("no private key found")?;
	let mut config =
		ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
			.with_safe_default_protocol_versions()?
			.with_no_client_auth()
			.with_single_cert(certs, key)?;
	config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Ok(Arc::new(config))
}

/// Accept loop shared by the gateway and API servers: optional TLS, HTTP/1.1
/// and HTTP/2, panic containment per request and graceful drain.
pub async fn serve<F, Fut>(
	name: &'static str,
	listener: TcpListener,
	tls: Option<Arc<ServerConfig>>,
	drain: DrainWatcher,
	handler: F,
) -> anyhow::Result<()>
where
	F: Fn(Request) -> Fut + Clone + Send + Sync + 'static,
	Fut: Future<Output = Response> + Send + 'static,
{
	let address = listener.local_addr()?;
	info!(%address, component = name, tls = tls.is_some(), "listener established");
	let wait = drain.clone().wait_for_drain();
	tokio::pin!(wait);
	loop {
		tokio::select! {
			res = listener.accept() => {
				let (stream, peer) = match res {
					Ok(accepted) => accepted,
					Err(err) => {
						error!(component = name, %err, "failed to accept connection");
						continue;
					},
				};
				let _ = stream.set_nodelay(true);
				let tls = tls.clone();
				let handler = handler.clone();
				let drain = drain.clone();
				tokio::spawn(async move {
					trace!(component = name, %peer, "connection opened");
					let res = match tls {
						Some(cfg) => match TlsAcceptor::from(cfg).accept(stream).await {
							Ok(stream) => serve_connection(stream, handler, drain).await,
							Err(err) => {
								debug!(component = name, %peer, %err, "TLS handshake failed");
								return;
							},
						},
						None => serve_connection(stream, handler, drain).await,
					};
					if let Err(err) = res {
						debug!(component = name, %peer, "connection closed: {err}");
					}
				});
			}
			release = &mut wait => {
				info!(component = name, "listener drained");
				drop(release);
				return Ok(());
			}
		}
	}
}

async fn serve_connection<IO, F, Fut>(
	stream: IO,
	handler: F,
	drain: DrainWatcher,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
	IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	F: Fn(Request) -> Fut + Clone + Send + Sync + 'static,
	Fut: Future<Output = Response> + Send + 'static,
{
	let service = service_fn(move |req: ::http::Request<Incoming>| {
		let handler = handler.clone();
		async move {
			let req = req.map(Body::new);
			// A panicking handler must not tear down the whole connection.
			let resp = std::panic::AssertUnwindSafe(handler(req))
				.catch_unwind()
				.await
				.unwrap_or_else(|_| {
					error!("request handler panicked");
					empty_response(StatusCode::INTERNAL_SERVER_ERROR)
				});
			Ok::<_, Infallible>(resp)
		}
	});
	let builder = auto_server();
	let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
	tokio::pin!(conn);
	tokio::select! {
		res = &mut conn => res,
		// On drain, nudge the client with GOAWAY/Connection: close and let
		// in-flight requests finish.
		release = drain.wait_for_drain() => {
			conn.as_mut().graceful_shutdown();
			let res = conn.await;
			drop(release);
			res
		},
	}
}
