//! C2: ownership of one encoder child process.
//!
//! Spawns the encoder with stdin closed and stdout/stderr piped, in its own
//! process group so the whole group can be signalled on shutdown. Exposes a
//! lazy stream of NAL units driven off stdout, and drains stderr to the log
//! so the child never blocks on a full pipe.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Child;

use crate::config::{EncoderConfig, StreamConfig};
use crate::error::{Error, Result};
use crate::nal::Extractor;

/// Owns one encoder subprocess and exposes its stdout as NAL units.
pub struct EncoderSource {
	encoder: EncoderConfig,
	stream: StreamConfig,
	child: Option<Child>,
	running: Arc<AtomicBool>,
}

impl EncoderSource {
	pub fn new(encoder: EncoderConfig, stream: StreamConfig) -> Self {
		Self {
			encoder,
			stream,
			child: None,
			running: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::Relaxed)
	}

	/// Spawns the encoder child. Fails if already running.
	#[tracing::instrument(skip(self), fields(program = %self.encoder.program))]
	pub async fn start(&mut self) -> Result<()> {
		if self.is_running() {
			return Err(Error::InvalidState {
				action: "start",
				state: "running",
			});
		}

		let mut cmd = self.encoder.command(&self.stream);
		cmd.stdin(Stdio::null());
		cmd.stdout(Stdio::piped());
		cmd.stderr(Stdio::piped());

		// Place the child in its own process group so TERM/KILL can target the
		// whole group, not just the immediate child.
		#[cfg(unix)]
		{
			use std::os::unix::process::CommandExt;
			cmd.process_group(0);
		}

		let mut child = cmd
			.spawn()
			.map_err(|err| Error::Infrastructure(format!("failed to spawn encoder: {err}")))?;
		let pid = child.id();
		tracing::info!(pid, "encoder started");

		if let Some(stderr) = child.stderr.take() {
			tokio::spawn(drain_stderr(stderr));
		}

		self.child = Some(child);
		self.running.store(true, Ordering::Relaxed);
		Ok(())
	}

	/// Reads stdout in chunks and feeds the extractor, yielding each NAL unit
	/// as it completes. Ends cleanly on EOF or after `stop`, flushing any
	/// trailing partial unit first. Does not borrow `self` past this call, so
	/// `stop` may be invoked concurrently to end the stream early.
	pub fn stream(&mut self) -> impl futures::Stream<Item = Bytes> + Send + 'static {
		let stdout = self.child.as_mut().and_then(|child| child.stdout.take());
		let running = self.running.clone();
		let chunk_size = self.encoder.read_chunk_bytes.max(1);

		async_stream::stream! {
			let Some(mut stdout) = stdout else { return };
			let mut extractor = Extractor::new();
			let mut buf = vec![0u8; chunk_size];

			loop {
				if !running.load(Ordering::Relaxed) {
					break;
				}

				match stdout.read(&mut buf).await {
					Ok(0) => {
						tracing::info!("encoder stdout closed");
						break;
					}
					Ok(n) => {
						for nal in extractor.push(&buf[..n]) {
							yield nal;
						}
					}
					Err(err) => {
						tracing::warn!(%err, "error reading encoder stdout");
						break;
					}
				}
			}

			for nal in extractor.flush() {
				yield nal;
			}
		}
	}

	/// Graceful-then-forceful shutdown: TERM the process group, wait up to
	/// the configured timeout, then KILL the group if it's still alive.
	/// Idempotent; always leaves the source not-running.
	#[tracing::instrument(skip(self))]
	pub async fn stop(&mut self) -> Result<()> {
		self.running.store(false, Ordering::Relaxed);

		let Some(mut child) = self.child.take() else {
			return Ok(());
		};
		let Some(pid) = child.id() else {
			return Ok(());
		};

		tracing::info!(pid, "stopping encoder");
		signal_group(pid, Signal::SIGTERM);

		match tokio::time::timeout(self.encoder.stop_timeout(), child.wait()).await {
			Ok(Ok(status)) => tracing::info!(?status, "encoder exited gracefully"),
			Ok(Err(err)) => tracing::warn!(%err, "error waiting for encoder exit"),
			Err(_) => {
				tracing::warn!(pid, "encoder did not exit in time, sending SIGKILL");
				signal_group(pid, Signal::SIGKILL);
				let _ = child.wait().await;
			}
		}

		Ok(())
	}
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: Signal) {
	if let Err(err) = signal::killpg(Pid::from_raw(pid as i32), sig) {
		tracing::debug!(pid, %err, "failed to signal encoder process group (already gone?)");
	}
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _sig: Signal) {}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
	let mut lines = BufReader::new(stderr).lines();
	loop {
		match lines.next_line().await {
			Ok(Some(line)) => tracing::debug!(encoder = %line, "encoder stderr"),
			Ok(None) => break,
			Err(err) => {
				tracing::debug!(%err, "error reading encoder stderr");
				break;
			}
		}
	}
}

#[cfg(test)]
impl EncoderSource {
	/// Wraps an already-spawned child as if `start` had produced it, for
	/// tests that fake the encoder with a shell one-liner instead of a real
	/// video encoder.
	pub(crate) fn for_test(encoder: EncoderConfig, stream: StreamConfig, child: Child) -> Self {
		Self {
			encoder,
			stream,
			child: Some(child),
			running: Arc::new(AtomicBool::new(true)),
		}
	}
}
