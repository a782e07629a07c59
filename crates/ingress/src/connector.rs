//! The connector: dials out to its gateway, keeps the tunnel alive and
//! reverse-proxies tunneled requests to the local downstream service.

use std::convert::Infallible;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use faros_core::prelude::*;
use faros_revdial::{Conn, Listener};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio_util::sync::CancellationToken;

use crate::client::ApiClient;
use crate::config::ConnectorConfig;
use crate::http::{
	Body, HeaderMap, Response, StatusCode, copy_proxy_headers, plaintext_response,
};
use crate::types::PROXY_PREFIX;

/// A session that lived at least this long resets the reconnect backoff.
const BACKOFF_RESET: Duration = Duration::from_secs(2);

pub struct Connector {
	config: ConnectorConfig,
	api: ApiClient,
	tunnel_client: reqwest::Client,
	downstream: reqwest::Client,
}

impl Connector {
	pub fn new(config: ConnectorConfig) -> anyhow::Result<Connector> {
		anyhow::ensure!(!config.token.is_empty(), "a connection token is required");
		anyhow::ensure!(!config.connection_id.is_empty(), "a connection id is required");
		let api = ApiClient::new(&config.controller_url, &config.token, config.tls_skip_verify)?;
		let tunnel_client = faros_revdial::default_client(config.tls_skip_verify)?;
		let downstream = reqwest::Client::builder()
			.danger_accept_invalid_certs(true)
			.redirect(reqwest::redirect::Policy::none())
			.build()?;
		Ok(Connector {
			config,
			api,
			tunnel_client,
			downstream,
		})
	}

	/// Runs tunnel sessions until `shutdown` fires, re-dialing with
	/// exponential backoff (1s initial, 60s cap, full jitter).
	pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
		let mut policy = ExponentialBackoff {
			initial_interval: Duration::from_secs(1),
			max_interval: Duration::from_secs(60),
			multiplier: 2.0,
			randomization_factor: 1.0,
			max_elapsed_time: None,
			..Default::default()
		};
		loop {
			if shutdown.is_cancelled() {
				return Ok(());
			}
			let started = Instant::now();
			match self.run_session(&shutdown).await {
				Ok(()) => return Ok(()),
				Err(err) => warn!(%err, "tunnel session ended"),
			}
			// A session that held for a while means the gateway was healthy;
			// start the next dial promptly.
			if started.elapsed() > BACKOFF_RESET {
				policy.reset();
			}
			let delay = policy.next_backoff().unwrap_or(policy.max_interval);
			debug!(?delay, "reconnecting after backoff");
			tokio::select! {
				_ = shutdown.cancelled() => return Ok(()),
				_ = tokio::time::sleep(delay) => {},
			}
		}
	}

	/// One tunnel session: resolve the gateway, attach the listener, serve
	/// accepted streams until the transport dies or shutdown is requested.
	async fn run_session(&self, shutdown: &CancellationToken) -> anyhow::Result<()> {
		let gateway = self
			.api
			.get_connection_gateway(&self.config.connection_id)
			.await?;
		let base = format!("{}{}", gateway.hostname.trim_end_matches('/'), PROXY_PREFIX);
		debug!(gateway = %base, "dialing tunnel");
		let listener = Listener::connect(self.tunnel_client.clone(), &base, &self.config.token).await?;
		info!(
			gateway = %gateway.hostname,
			downstream = %self.config.downstream_url,
			"tunnel established"
		);
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => {
					listener.close();
					return Ok(());
				}
				conn = listener.accept() => {
					let conn = conn?;
					tokio::spawn(
						serve_tunneled_connection(
							self.downstream.clone(),
							self.config.downstream_url.clone(),
							conn,
						)
						.in_current_span(),
					);
				}
			}
		}
	}
}

/// Serves HTTP/1.1 on one tunneled stream, proxying every request downstream.
async fn serve_tunneled_connection(client: reqwest::Client, downstream_url: String, conn: Conn) {
	let service = service_fn(move |req: ::http::Request<Incoming>| {
		let client = client.clone();
		let downstream_url = downstream_url.clone();
		async move {
			let resp = match proxy_downstream(&client, &downstream_url, req).await {
				Ok(resp) => resp,
				Err(err) => {
					warn!(%err, "downstream request failed");
					plaintext_response(StatusCode::BAD_GATEWAY, "downstream request failed")
				},
			};
			Ok::<_, Infallible>(resp)
		}
	});
	if let Err(err) = hyper::server::conn::http1::Builder::new()
		.serve_connection(TokioIo::new(conn), service)
		.await
	{
		debug!(%err, "tunneled connection ended");
	}
}

async fn proxy_downstream(
	client: &reqwest::Client,
	downstream_url: &str,
	req: ::http::Request<Incoming>,
) -> anyhow::Result<Response> {
	let (parts, body) = req.into_parts();
	let mut path = parts.uri.path().to_string();
	if let Some(query) = parts.uri.query() {
		path.push('?');
		path.push_str(query);
	}
	let url = format!("{}{}", downstream_url.trim_end_matches('/'), path);
	trace!(method = %parts.method, %url, "proxying tunneled request");

	let mut headers = HeaderMap::new();
	copy_proxy_headers(&parts.headers, &mut headers);

	let resp = client
		.request(parts.method, &url)
		.headers(headers)
		.body(reqwest::Body::wrap_stream(
			Body::new(body).into_data_stream(),
		))
		.send()
		.await?;

	let mut builder = ::http::Response::builder().status(resp.status());
	let resp_headers = builder.headers_mut().expect("fresh builder cannot have errored");
	copy_proxy_headers(resp.headers(), resp_headers);
	Ok(builder.body(Body::from_stream(resp.bytes_stream()))?)
}
