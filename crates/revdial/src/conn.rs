use std::io;
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;
use faros_core::prelude::*;
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, PollSender, WaitForCancellationFutureOwned};

/// Chunks buffered between the reader task and `poll_read`.
const READ_CHANNEL_CAPACITY: usize = 16;
/// How long `ConnHandle::close` waits after the most recent write, giving the
/// peer time to consume what was flushed.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// A logical connection carried on one HTTP/2 stream.
///
/// One side of the stream is a chunked byte reader (an HTTP body), the other an
/// `mpsc::Sender<Bytes>` backing a channel body. A dedicated reader task pumps
/// the body into an internal channel so a blocked read never prevents close or
/// a deadline from taking effect.
pub struct Conn {
	rx: mpsc::Receiver<Bytes>,
	leftover: Bytes,
	tx: PollSender<Bytes>,
	shared: Arc<Shared>,
	cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
	closed: bool,
	read_deadline: Option<Pin<Box<Sleep>>>,
	write_deadline: Option<Pin<Box<Sleep>>>,
}

struct Shared {
	done: CancellationToken,
	last_write: Mutex<Option<Instant>>,
}

/// Lifecycle handle for a [`Conn`], detached from the I/O halves so owners can
/// close or observe the connection while it is lent out (or split).
#[derive(Clone)]
pub struct ConnHandle(Arc<Shared>);

impl ConnHandle {
	/// Closes the connection. Idempotent. If a write happened within the last
	/// second, closing is delayed by the remainder so the peer can drain.
	pub async fn close(&self) {
		let last = *self.0.last_write.lock().expect("poisoned");
		if let Some(at) = last {
			let elapsed = at.elapsed();
			if elapsed < CLOSE_GRACE {
				tokio::time::sleep(CLOSE_GRACE - elapsed).await;
			}
		}
		self.0.done.cancel();
	}

	/// Closes the connection immediately, skipping the flush grace.
	pub fn close_now(&self) {
		self.0.done.cancel();
	}

	/// Completes when the connection has been closed by either side.
	pub async fn closed(&self) {
		self.0.done.cancelled().await
	}

	pub fn is_closed(&self) -> bool {
		self.0.done.is_cancelled()
	}
}

impl Conn {
	/// Wraps a chunk stream and a chunk sender as a connection.
	pub fn new<S, E>(reader: S, writer: mpsc::Sender<Bytes>) -> Conn
	where
		S: Stream<Item = Result<Bytes, E>> + Send + 'static,
		E: Display + Send,
	{
		let shared = Arc::new(Shared {
			done: CancellationToken::new(),
			last_write: Mutex::new(None),
		});
		let (rx_tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
		let done = shared.done.clone();
		tokio::spawn(async move {
			let mut reader = std::pin::pin!(reader);
			loop {
				let chunk = tokio::select! {
					_ = done.cancelled() => break,
					chunk = reader.next() => chunk,
				};
				match chunk {
					Some(Ok(data)) => {
						if data.is_empty() {
							continue;
						}
						let delivered = tokio::select! {
							_ = done.cancelled() => false,
							res = rx_tx.send(data) => res.is_ok(),
						};
						if !delivered {
							break;
						}
					},
					Some(Err(err)) => {
						trace!(%err, "connection read stream failed");
						break;
					},
					None => break,
				}
			}
			// Dropping rx_tx lets pending reads drain buffered chunks and then observe EOF.
		});
		Conn {
			rx,
			leftover: Bytes::new(),
			tx: PollSender::new(writer),
			cancelled: Box::pin(shared.done.clone().cancelled_owned()),
			shared,
			closed: false,
			read_deadline: None,
			write_deadline: None,
		}
	}

	/// Returns the lifecycle handle for this connection.
	pub fn handle(&self) -> ConnHandle {
		ConnHandle(self.shared.clone())
	}

	/// Sets the read deadline. `None` clears any previous deadline; a deadline
	/// in the past fails reads immediately.
	pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
		self.read_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d.into())));
	}

	/// Sets the write deadline. `None` clears any previous deadline.
	pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
		self.write_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d.into())));
	}

	/// Builds a connected in-memory pair, bytes written on one end are read on
	/// the other.
	pub fn pipe() -> (Conn, Conn) {
		let (ltx, lrx) = mpsc::channel::<Bytes>(READ_CHANNEL_CAPACITY);
		let (rtx, rrx) = mpsc::channel::<Bytes>(READ_CHANNEL_CAPACITY);
		let left = Conn::new(ReceiverStream::new(rrx).map(Ok::<_, io::Error>), ltx);
		let right = Conn::new(ReceiverStream::new(lrx).map(Ok::<_, io::Error>), rtx);
		(left, right)
	}

	/// Polls the done token once, latching the closed flag.
	fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
		if self.closed {
			return true;
		}
		if self.cancelled.as_mut().poll(cx).is_ready() {
			self.closed = true;
		}
		self.closed
	}
}

fn closed_pipe() -> io::Error {
	io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

fn deadline_exceeded() -> io::Error {
	io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

impl AsyncRead for Conn {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		if !this.leftover.is_empty() {
			let n = this.leftover.len().min(buf.remaining());
			buf.put_slice(&this.leftover.split_to(n));
			return Poll::Ready(Ok(()));
		}
		if this.poll_closed(cx) {
			// EOF after close.
			return Poll::Ready(Ok(()));
		}
		if let Some(deadline) = this.read_deadline.as_mut()
			&& deadline.as_mut().poll(cx).is_ready()
		{
			return Poll::Ready(Err(deadline_exceeded()));
		}
		match this.rx.poll_recv(cx) {
			Poll::Ready(Some(mut data)) => {
				let n = data.len().min(buf.remaining());
				buf.put_slice(&data.split_to(n));
				this.leftover = data;
				Poll::Ready(Ok(()))
			},
			// Reader task finished and the buffer is drained: EOF.
			Poll::Ready(None) => Poll::Ready(Ok(())),
			Poll::Pending => Poll::Pending,
		}
	}
}

impl AsyncWrite for Conn {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		if this.poll_closed(cx) {
			return Poll::Ready(Err(closed_pipe()));
		}
		if let Some(deadline) = this.write_deadline.as_mut()
			&& deadline.as_mut().poll(cx).is_ready()
		{
			return Poll::Ready(Err(deadline_exceeded()));
		}
		match this.tx.poll_reserve(cx) {
			Poll::Ready(Ok(())) => {},
			Poll::Ready(Err(_)) => return Poll::Ready(Err(closed_pipe())),
			Poll::Pending => return Poll::Pending,
		}
		if this.tx.send_item(Bytes::copy_from_slice(buf)).is_err() {
			return Poll::Ready(Err(closed_pipe()));
		}
		*this.shared.last_write.lock().expect("poisoned") = Some(Instant::now());
		Poll::Ready(Ok(buf.len()))
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		// Chunks are handed to the body channel as they are written.
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		this.tx.close();
		Poll::Ready(Ok(()))
	}
}

impl Drop for Conn {
	fn drop(&mut self) {
		// Stops the reader task and wakes anything waiting on the handle.
		self.shared.done.cancel();
	}
}

impl Debug for Conn {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Conn")
			.field("closed", &self.shared.done.is_cancelled())
			.finish()
	}
}
