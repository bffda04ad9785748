use tokio::sync::mpsc;

/// Process-wide shutdown coordination: completes when the OS asks us to stop
/// or when a component triggers shutdown explicitly.
pub struct Shutdown {
	trigger_tx: mpsc::Sender<()>,
	trigger_rx: mpsc::Receiver<()>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (trigger_tx, trigger_rx) = mpsc::channel(1);
		Shutdown {
			trigger_tx,
			trigger_rx,
		}
	}

	/// trigger returns a handle which can be used to start a shutdown immediately
	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			trigger_tx: self.trigger_tx.clone(),
		}
	}

	/// wait completes once shutdown has been requested
	pub async fn wait(mut self) {
		imp::wait(&mut self.trigger_rx).await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	trigger_tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.trigger_tx.send(()).await;
	}
}

#[cfg(unix)]
mod imp {
	use std::process;

	use tokio::signal::unix::{SignalKind, signal};
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = catch(SignalKind::interrupt(), "SIGINT") => {
				// A second interrupt skips graceful teardown.
				tokio::spawn(async {
					catch(SignalKind::interrupt(), "SIGINT").await;
					info!("second interrupt, exiting immediately");
					process::exit(0);
				});
			}
			_ = catch(SignalKind::terminate(), "SIGTERM") => {}
			_ = receiver.recv() => {
				info!("received explicit shutdown trigger");
			}
		};
	}

	async fn catch(kind: SignalKind, name: &'static str) {
		signal(kind)
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received {name}, starting shutdown");
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = ctrl_c() => {}
			_ = receiver.recv() => {
				info!("received explicit shutdown trigger");
			}
		};
	}

	async fn ctrl_c() {
		tokio::signal::windows::ctrl_c()
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received ctrl-c, starting shutdown");
	}
}
