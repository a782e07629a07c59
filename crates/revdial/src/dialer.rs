use faros_core::prelude::*;
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::conn::{Conn, ConnHandle};
use crate::{Command, ControlMessage, Error};

/// Deadline for writing a single control message.
const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dialer mints new connections back to the connector that owns the matching
/// [`crate::Listener`].
///
/// It owns the control stream: `dial` asks the serve loop to emit a
/// `conn-ready` message, the connector opens a fresh stream, and the gateway
/// handler hands it back through [`Dialer::deliver`].
pub struct Dialer {
	id: Strng,
	msg_tx: mpsc::Sender<ControlMessage>,
	pickup_tx: mpsc::Sender<Result<Conn, Error>>,
	pickup_rx: AsyncMutex<mpsc::Receiver<Result<Conn, Error>>>,
	control: ConnHandle,
}

impl Dialer {
	/// Takes ownership of the control connection and starts the serve loops.
	pub fn new(id: Strng, conn: Conn) -> Arc<Dialer> {
		let control = conn.handle();
		let (msg_tx, msg_rx) = mpsc::channel(8);
		let (pickup_tx, pickup_rx) = mpsc::channel(1);
		let (read_half, write_half) = tokio::io::split(conn);
		tokio::spawn(write_loop(write_half, msg_rx, control.clone()).in_current_span());
		tokio::spawn(read_loop(read_half, pickup_tx.clone(), control.clone()).in_current_span());
		Arc::new(Dialer {
			id,
			msg_tx,
			pickup_tx,
			pickup_rx: AsyncMutex::new(pickup_rx),
			control,
		})
	}

	pub fn id(&self) -> &Strng {
		&self.id
	}

	/// Creates a new connection back to the listener. Dropping the returned
	/// future abandons the pickup; the next arriving stream then goes to the
	/// next caller.
	pub async fn dial(&self) -> Result<Conn, Error> {
		// First, tell the serve loop we want a connection.
		tokio::select! {
			_ = self.control.closed() => return Err(Error::DialerClosed),
			res = self.msg_tx.send(ControlMessage::conn_ready()) => {
				if res.is_err() {
					return Err(Error::DialerClosed);
				}
			},
		}
		// Then pick it up.
		let mut pickup = self.pickup_rx.lock().await;
		tokio::select! {
			_ = self.control.closed() => Err(Error::DialerClosed),
			picked = pickup.recv() => match picked {
				Some(res) => res,
				None => Err(Error::DialerClosed),
			},
		}
	}

	/// Hands an arrived data stream to a waiting `dial` call.
	pub async fn deliver(&self, conn: Conn) -> Result<(), Error> {
		let send = self.pickup_tx.send(Ok(conn));
		tokio::select! {
			_ = self.control.closed() => Err(Error::DialerClosed),
			res = send => res.map_err(|_| Error::DialerClosed),
		}
	}

	/// Closes the dialer and its control stream. Idempotent.
	pub fn close(&self) {
		self.control.close_now();
	}

	pub fn is_closed(&self) -> bool {
		self.control.is_closed()
	}

	/// Completes when the dialer is closed, locally or by the peer.
	pub async fn done(&self) {
		self.control.closed().await
	}
}

impl Drop for Dialer {
	fn drop(&mut self) {
		self.close();
	}
}

impl Debug for Dialer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Dialer")
			.field("id", &self.id)
			.field("closed", &self.is_closed())
			.finish()
	}
}

async fn write_loop(
	mut write_half: WriteHalf<Conn>,
	mut msg_rx: mpsc::Receiver<ControlMessage>,
	control: ConnHandle,
) {
	loop {
		let msg = tokio::select! {
			_ = control.closed() => break,
			msg = msg_rx.recv() => match msg {
				Some(msg) => msg,
				None => break,
			},
		};
		let line = msg.encode();
		match tokio::time::timeout(CONTROL_WRITE_TIMEOUT, write_half.write_all(&line)).await {
			Ok(Ok(())) => {},
			Ok(Err(err)) => {
				debug!(%err, "control channel write failed");
				break;
			},
			Err(_) => {
				debug!("control channel write deadline exceeded");
				break;
			},
		}
	}
	control.close_now();
}

async fn read_loop(
	read_half: ReadHalf<Conn>,
	pickup_tx: mpsc::Sender<Result<Conn, Error>>,
	control: ConnHandle,
) {
	let mut reader = BufReader::new(read_half);
	let mut line = Vec::new();
	loop {
		line.clear();
		let eof = tokio::select! {
			_ = control.closed() => break,
			res = tokio::io::AsyncBufReadExt::read_until(&mut reader, b'\n', &mut line) => match res {
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
			Command::PickupFailed => {
				let failure = Err(Error::PickupFailed(msg.err));
				tokio::select! {
					_ = control.closed() => break,
					_ = pickup_tx.send(failure) => {},
				}
			},
			// The dialer side only ever expects pickup failures; everything
			// else (including unknown commands) is ignored.
			_ => {},
		}
	}
	control.close_now();
}
