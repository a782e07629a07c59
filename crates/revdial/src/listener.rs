use faros_core::prelude::*;
use futures_util::StreamExt;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::conn::{Conn, ConnHandle};
use crate::{
	CONNECTION_CLIENT_CONNECTOR, CONNECTION_CLIENT_HEADER, Command, ControlMessage, Error,
	PATH_REV_DIAL, URL_PARAM_ID,
};

/// Data streams buffered between arrival and `accept`.
const ACCEPT_BACKLOG: usize = 4;
/// Attempts at opening the control stream before giving up.
const MAX_DIAL_ATTEMPTS: u32 = 5;

/// Builds an HTTP/2 client suitable for the tunnel transport: TLS with h2 and
/// keep-alive pings so a silently dead transport is detected within ~45s.
pub fn default_client(insecure_skip_verify: bool) -> Result<reqwest::Client, Error> {
	let mut builder = reqwest::Client::builder()
		.use_rustls_tls()
		.http2_prior_knowledge()
		.http2_keep_alive_interval(Duration::from_secs(30))
		.http2_keep_alive_timeout(Duration::from_secs(15))
		.http2_keep_alive_while_idle(true);
	if insecure_skip_verify {
		builder = builder.danger_accept_invalid_certs(true);
	}
	Ok(builder.build()?)
}

/// Listener yields connections which arrive from a corresponding [`crate::Dialer`].
///
/// It dials the gateway's `revdial` endpoint to establish the control stream,
/// then opens one further stream per `conn-ready` message; those streams come
/// out of [`Listener::accept`].
pub struct Listener {
	conn_rx: AsyncMutex<mpsc::Receiver<Conn>>,
	control: ConnHandle,
	done: CancellationToken,
}

impl Listener {
	/// Dials the control stream at `<base_url>/revdial?id=<id>` with retries
	/// (doubling backoff with jitter, starting at one second).
	pub async fn connect(client: reqwest::Client, base_url: &str, id: &str) -> Result<Listener, Error> {
		let url = server_url(base_url, id)?;
		let mut sleep = Duration::from_secs(1);
		let mut control = None;
		let mut last_err = None;
		for attempt in 1..=MAX_DIAL_ATTEMPTS {
			match dial_stream(&client, &url).await {
				Ok(conn) => {
					control = Some(conn);
					break;
				},
				Err(err) => {
					debug!(attempt, %err, "control stream dial failed");
					last_err = Some(err);
					if attempt == MAX_DIAL_ATTEMPTS {
						break;
					}
					// Jitter so a fleet of reconnecting connectors does not stampede.
					let jitter =
						Duration::from_millis(rand::rng().random_range(0..sleep.as_millis().max(2) as u64));
					sleep = sleep * 2 + jitter / 2;
					tokio::time::sleep(sleep).await;
				},
			}
		}
		let Some(conn) = control else {
			return Err(Error::TransportUnavailable(Box::new(
				last_err.expect("at least one dial attempt was made"),
			)));
		};
		Ok(Self::from_control(client, url, conn))
	}

	fn from_control(client: reqwest::Client, url: String, conn: Conn) -> Listener {
		let control = conn.handle();
		let done = CancellationToken::new();
		let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_BACKLOG);
		let (msg_tx, msg_rx) = mpsc::channel(8);
		let (read_half, write_half) = tokio::io::split(conn);
		tokio::spawn(write_loop(write_half, msg_rx, control.clone(), done.clone()).in_current_span());
		tokio::spawn(
			read_loop(
				read_half,
				client,
				url,
				conn_tx,
				msg_tx,
				control.clone(),
				done.clone(),
			)
			.in_current_span(),
		);
		Listener {
			conn_rx: AsyncMutex::new(conn_rx),
			control,
			done,
		}
	}

	/// Blocks until the next data stream arrives.
	/// Returns [`Error::ListenerClosed`] once the listener is closed.
	pub async fn accept(&self) -> Result<Conn, Error> {
		let mut conn_rx = self.conn_rx.lock().await;
		tokio::select! {
			_ = self.done.cancelled() => Err(Error::ListenerClosed),
			conn = conn_rx.recv() => conn.ok_or(Error::ListenerClosed),
		}
	}

	/// Closes the listener; future `accept` calls fail. Idempotent.
	pub fn close(&self) {
		self.done.cancel();
		self.control.close_now();
	}

	pub fn is_closed(&self) -> bool {
		self.done.is_cancelled() || self.control.is_closed()
	}

	/// Completes when the listener shuts down, locally or because the control
	/// stream died.
	pub async fn done(&self) {
		tokio::select! {
			_ = self.done.cancelled() => {},
			_ = self.control.closed() => {},
		}
	}
}

impl Drop for Listener {
	fn drop(&mut self) {
		self.close();
	}
}

impl Debug for Listener {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Listener")
			.field("closed", &self.is_closed())
			.finish()
	}
}

/// Opens one HTTP/2 stream against the revdial endpoint and wraps the request
/// and response bodies as a [`Conn`].
async fn dial_stream(client: &reqwest::Client, url: &str) -> Result<Conn, Error> {
	let (body_tx, body_rx) = mpsc::channel::<Bytes>(16);
	let outbound = ReceiverStream::new(body_rx).map(Ok::<_, std::io::Error>);
	let resp = client
		.get(url)
		.header(CONNECTION_CLIENT_HEADER, CONNECTION_CLIENT_CONNECTOR)
		.body(reqwest::Body::wrap_stream(outbound))
		.send()
		.await?;
	if resp.status() != http::StatusCode::OK {
		return Err(Error::UnexpectedStatus(resp.status()));
	}
	Ok(Conn::new(resp.bytes_stream(), body_tx))
}

async fn write_loop(
	mut write_half: WriteHalf<Conn>,
	mut msg_rx: mpsc::Receiver<ControlMessage>,
	control: ConnHandle,
	done: CancellationToken,
) {
	loop {
		let msg = tokio::select! {
			_ = done.cancelled() => break,
			msg = msg_rx.recv() => match msg {
				Some(msg) => msg,
				None => break,
			},
		};
		if let Err(err) = write_half.write_all(&msg.encode()).await {
			debug!(%err, "control channel write failed");
			break;
		}
	}
	done.cancel();
	control.close_now();
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
	read_half: ReadHalf<Conn>,
	client: reqwest::Client,
	url: String,
	conn_tx: mpsc::Sender<Conn>,
	msg_tx: mpsc::Sender<ControlMessage>,
	control: ConnHandle,
	done: CancellationToken,
) {
	let mut reader = BufReader::new(read_half);
	let mut line = Vec::new();
	loop {
		line.clear();
		let eof = tokio::select! {
			_ = done.cancelled() => break,
			res = reader.read_until(b'\n', &mut line) => match res {
				Ok(0) => true,
				Ok(_) => false,
				Err(err) => {
					debug!(%err, "control channel read failed");
					true
				},
			},
		};
		if eof {
			break;
		}
		let msg: ControlMessage = match serde_json::from_slice(&line) {
			Ok(msg) => msg,
			Err(err) => {
				warn!(%err, "invalid control message, tearing down transport");
				break;
			},
		};
		match msg.command {
			Command::ConnReady => {
				tokio::spawn(
					grab_conn(
						client.clone(),
						url.clone(),
						conn_tx.clone(),
						msg_tx.clone(),
						done.clone(),
					)
					.in_current_span(),
				);
			},
			// Occasional no-op from the server to keep us alive through NAT timeouts.
			Command::KeepAlive => {},
			_ => {},
		}
	}
	done.cancel();
	control.close_now();
}

/// Opens a fresh data stream and queues it for `accept`; on failure the error
/// is reported back over the control channel.
async fn grab_conn(
	client: reqwest::Client,
	url: String,
	conn_tx: mpsc::Sender<Conn>,
	msg_tx: mpsc::Sender<ControlMessage>,
	done: CancellationToken,
) {
	match dial_stream(&client, &url).await {
		Ok(conn) => {
			tokio::select! {
				// Listener closed before anyone accepted; dropping the conn closes the stream.
				_ = done.cancelled() => {},
				_ = conn_tx.send(conn) => {},
			}
		},
		Err(err) => {
			debug!(%err, "failed to pick up connection");
			let _ = msg_tx.send(ControlMessage::pickup_failed(err)).await;
		},
	}
}

/// Builds the revdial URL, requiring an https base.
fn server_url(base_url: &str, id: &str) -> Result<String, Error> {
	if id.is_empty() {
		return Err(Error::EmptyId);
	}
	let parsed =
		url::Url::parse(base_url).map_err(|_| Error::InvalidUrl(base_url.to_string()))?;
	if parsed.scheme() != "https" || parsed.host_str().is_none() {
		return Err(Error::InvalidUrl(base_url.to_string()));
	}
	Ok(format!(
		"{}/{PATH_REV_DIAL}?{URL_PARAM_ID}={id}",
		base_url.trim_end_matches('/')
	))
}
