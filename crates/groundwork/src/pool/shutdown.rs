use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};

/// Creates a shutdown pair.
/// * [`ShutdownTrigger`] is held by whoever owns the lifecycle; firing it (or
///   dropping it) signals shutdown to every watcher.
/// * [`ShutdownWatcher`] can be cloned freely and observed either by polling
///   or by selecting on its receiver.
///
/// The signal is the disconnection of a zero-capacity channel, so a watcher
/// blocked in `select!` wakes immediately and the trigger can never be missed.
pub fn new() -> (ShutdownTrigger, ShutdownWatcher) {
	let (tx, rx) = bounded::<()>(0);
	(ShutdownTrigger { _tx: tx }, ShutdownWatcher { rx })
}

pub struct ShutdownTrigger {
	_tx: Sender<()>,
}

impl ShutdownTrigger {
	/// Signals shutdown to all watchers.
	pub fn trigger(self) {
		// Dropping the sender disconnects the channel.
	}
}

#[derive(Clone)]
pub struct ShutdownWatcher {
	rx: Receiver<()>,
}

impl ShutdownWatcher {
	pub fn is_triggered(&self) -> bool {
		matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
	}

	/// Blocks the calling thread until shutdown is triggered.
	pub fn wait(&self) {
		let _ = self.rx.recv();
	}

	/// The underlying receiver, for use in `crossbeam_channel::select!`. It
	/// never yields a message; it only disconnects.
	pub fn receiver(&self) -> &Receiver<()> {
		&self.rx
	}
}

impl std::fmt::Debug for ShutdownWatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ShutdownWatcher")
			.field("triggered", &self.is_triggered())
			.finish()
	}
}
