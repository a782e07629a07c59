use tokio::sync::{mpsc, watch};

/// Constructs a new pair for draining.
/// * DrainTrigger can be used to start a draining sequence and wait for it to complete.
/// * DrainWatcher should be held by anything that wants to participate in the draining. This can be
///   cloned, and a drain will not complete until all outstanding DrainWatchers are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(None);
	let (drained_tx, drained_rx) = mpsc::channel(1);
	(
		DrainTrigger {
			signal_tx,
			drained_rx,
		},
		DrainWatcher {
			drained_tx,
			signal_rx,
		},
	)
}

enum Never {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
	Immediate,
	Graceful,
}

/// DrainTrigger starts a drain and waits for all watchers to release.
pub struct DrainTrigger {
	signal_tx: watch::Sender<Option<DrainMode>>,
	drained_rx: mpsc::Receiver<Never>,
}

impl DrainTrigger {
	/// Signals all watchers to begin draining and waits for every handle to be dropped.
	pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
		let _ = self.signal_tx.send(Some(mode));
		match self.drained_rx.recv().await {
			None => {},
			Some(n) => match n {},
		}
	}
}

/// DrainWatcher observes a drain signal. Holding one blocks the trigger from completing.
#[derive(Clone)]
pub struct DrainWatcher {
	drained_tx: mpsc::Sender<Never>,
	signal_rx: watch::Receiver<Option<DrainMode>>,
}

impl DrainWatcher {
	/// Completes once a drain has been signaled. The returned handle must be dropped to
	/// release the trigger.
	pub async fn wait_for_drain(mut self) -> ReleaseShutdown {
		let mode = self
			.signal_rx
			.wait_for(Option::is_some)
			.await
			.map(|mode| mode.expect("already asserted it is_some"))
			// The trigger was dropped entirely; treat as an immediate termination.
			.unwrap_or(DrainMode::Immediate);
		ReleaseShutdown(self.drained_tx, mode)
	}
}

#[must_use = "ReleaseShutdown should be dropped explicitly to release the runtime"]
pub struct ReleaseShutdown(mpsc::Sender<Never>, DrainMode);

impl ReleaseShutdown {
	pub fn mode(&self) -> DrainMode {
		self.1
	}
}
