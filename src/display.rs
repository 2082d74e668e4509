//! C4 (display half): a pool of headless X displays, each backed by a
//! display server and window manager subprocess pair.
//!
//! Display numbers are drawn from `[base, base+max)`. Before handing one
//! out, a stale lock file left behind by a display server that died without
//! cleaning up after itself is removed, the same check `xvfb.get_display`
//! performs before starting a new Xvfb.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::Mutex;

use crate::config::{DisplayPoolConfig, StreamConfig};
use crate::error::{Error, Result};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(200);
const READINESS_POLL_ATTEMPTS: u32 = 15; // ~3s budget
const STOP_TIMEOUT: Duration = Duration::from_secs(3);
const WINDOW_MANAGER_SETTLE: Duration = Duration::from_millis(500);

/// One allocated display: its number, the display server, and (if
/// configured) a window manager running against it.
pub struct Display {
	pub id: u32,
	pub name: String,
	server: Child,
	window_manager: Option<Child>,
}

impl Display {
	pub fn display_var(&self) -> &str {
		&self.name
	}
}

/// Spawns and tracks the display server + window manager pair per display.
pub struct DisplayPool {
	config: DisplayPoolConfig,
	server_program: String,
	window_manager_program: Option<String>,
	allocated: Mutex<HashSet<u32>>,
}

impl DisplayPool {
	pub fn new(config: DisplayPoolConfig, server_program: impl Into<String>, window_manager_program: Option<String>) -> Self {
		Self {
			config,
			server_program: server_program.into(),
			window_manager_program,
			allocated: Mutex::new(HashSet::new()),
		}
	}

	/// Allocates the lowest free display number, spawns a display server
	/// sized for `stream`, waits for it to become ready, and (if configured)
	/// starts a window manager against it.
	#[tracing::instrument(skip(self, stream))]
	pub async fn allocate(&self, stream: &StreamConfig) -> Result<Display> {
		// Reserving an id takes two short, non-suspending critical sections
		// around the suspending stale-lock cleanup, rather than one long one,
		// so concurrent allocate/release calls never serialize behind that
		// filesystem I/O. A candidate taken by a racing allocate in between is
		// just retried.
		let id = loop {
			let snapshot = self.allocated.lock().await.clone();
			let candidate = self.find_free_id(&snapshot).await?;

			let mut allocated = self.allocated.lock().await;
			if allocated.contains(&candidate) {
				continue;
			}
			allocated.insert(candidate);
			break candidate;
		};

		match self.allocate_inner(id, stream).await {
			Ok(display) => Ok(display),
			Err(err) => {
				self.allocated.lock().await.remove(&id);
				Err(err)
			}
		}
	}

	async fn find_free_id(&self, allocated: &HashSet<u32>) -> Result<u32> {
		for id in self.config.base..self.config.base + self.config.max {
			if allocated.contains(&id) {
				continue;
			}
			cleanup_stale_lock(id).await;
			return Ok(id);
		}
		Err(Error::CapacityExceeded)
	}

	async fn allocate_inner(&self, id: u32, stream: &StreamConfig) -> Result<Display> {
		let name = format!(":{id}");

		let mut server_cmd = tokio::process::Command::new(&self.server_program);
		server_cmd.arg(&name).args(["-screen", "0", &format!("{}x{}x24", stream.width, stream.height), "-nolisten", "tcp"]);
		server_cmd.stdin(std::process::Stdio::null());
		server_cmd.stdout(std::process::Stdio::null());
		server_cmd.stderr(std::process::Stdio::null());
		#[cfg(unix)]
		{
			use std::os::unix::process::CommandExt;
			server_cmd.process_group(0);
		}
		let mut server = server_cmd
			.spawn()
			.map_err(|err| Error::Infrastructure(format!("failed to spawn display server: {err}")))?;

		if let Err(err) = wait_ready(&self.config.probe_program, &name).await {
			tracing::warn!(display = id, "display server did not become ready, tearing it down");
			stop_child(&mut server, "display server").await;
			cleanup_stale_lock(id).await;
			return Err(err);
		}

		let window_manager = match &self.window_manager_program {
			Some(program) => {
				let mut cmd = tokio::process::Command::new(program);
				cmd.env("DISPLAY", &name);
				cmd.stdin(std::process::Stdio::null());
				cmd.stdout(std::process::Stdio::null());
				cmd.stderr(std::process::Stdio::null());
				#[cfg(unix)]
				{
					use std::os::unix::process::CommandExt;
					cmd.process_group(0);
				}
				let child = cmd
					.spawn()
					.map_err(|err| Error::Infrastructure(format!("failed to spawn window manager: {err}")))?;
				// Give it a moment to map its windows before a browser or the
				// encoder starts relying on the display looking settled.
				tokio::time::sleep(WINDOW_MANAGER_SETTLE).await;
				Some(child)
			}
			None => None,
		};

		tracing::info!(display = id, "display ready");
		Ok(Display {
			id,
			name,
			server,
			window_manager,
		})
	}

	/// Tears down a display's processes (window manager then server) and
	/// frees its number for reuse. Best-effort: failures are logged, not
	/// propagated, since there's nothing left to roll back to.
	#[tracing::instrument(skip(self, display), fields(display = display.id))]
	pub async fn release(&self, mut display: Display) {
		if let Some(mut wm) = display.window_manager.take() {
			stop_child(&mut wm, "window manager").await;
		}
		stop_child(&mut display.server, "display server").await;
		self.allocated.lock().await.remove(&display.id);
		tracing::info!(display = display.id, "display released");
	}

	pub async fn release_all(&self, displays: Vec<Display>) {
		for display in displays {
			self.release(display).await;
		}
	}

	pub async fn allocated_count(&self) -> usize {
		self.allocated.lock().await.len()
	}
}

/// Trait boundary over display allocation, so the session manager can be
/// tested without spawning a real display server.
#[async_trait::async_trait]
pub trait DisplayAllocator: Send + Sync {
	async fn allocate(&self, stream: &StreamConfig) -> Result<Display>;
	async fn release(&self, display: Display);
}

#[async_trait::async_trait]
impl DisplayAllocator for DisplayPool {
	async fn allocate(&self, stream: &StreamConfig) -> Result<Display> {
		DisplayPool::allocate(self, stream).await
	}

	async fn release(&self, display: Display) {
		DisplayPool::release(self, display).await
	}
}

/// Polls `<probe_program> -display <display>` until it exits successfully,
/// the way `xvfb.py::check_display` shells out to `xdpyinfo`.
async fn wait_ready(probe_program: &str, display: &str) -> Result<()> {
	let id = display.trim_start_matches(':').parse().unwrap_or(0);
	for _ in 0..READINESS_POLL_ATTEMPTS {
		let probed = tokio::process::Command::new(probe_program)
			.arg("-display")
			.arg(display)
			.stdin(std::process::Stdio::null())
			.stdout(std::process::Stdio::null())
			.stderr(std::process::Stdio::null())
			.status()
			.await
			.map(|status| status.success())
			.unwrap_or(false);
		if probed {
			return Ok(());
		}
		tokio::time::sleep(READINESS_POLL_INTERVAL).await;
	}
	Err(Error::DisplayTimeout(id))
}

async fn cleanup_stale_lock(id: u32) {
	let lock_path = PathBuf::from(format!("/tmp/.X{id}-lock"));
	let Ok(contents) = tokio::fs::read_to_string(&lock_path).await else {
		return;
	};
	let Ok(pid) = contents.trim().parse::<i32>() else {
		let _ = tokio::fs::remove_file(&lock_path).await;
		return;
	};

	if process_is_alive(pid) {
		return;
	}

	tracing::info!(display = id, pid, "removing stale display lock file");
	let _ = tokio::fs::remove_file(&lock_path).await;
	let _ = tokio::fs::remove_file(format!("/tmp/.X11-unix/X{id}")).await;
}

#[cfg(unix)]
fn process_is_alive(pid: i32) -> bool {
	// `kill(pid, 0)` sends no signal; it only checks whether the process
	// could be signalled, which is exactly "does it still exist".
	signal::kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn process_is_alive(_pid: i32) -> bool {
	true
}

async fn stop_child(child: &mut Child, what: &str) {
	let Some(pid) = child.id() else { return };

	#[cfg(unix)]
	if let Err(err) = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
		tracing::debug!(%err, what, "failed to TERM process group (already gone?)");
	}

	match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
		Ok(_) => {}
		Err(_) => {
			tracing::warn!(pid, what, "did not exit in time, sending SIGKILL");
			#[cfg(unix)]
			{
				let _ = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
			}
			let _ = child.wait().await;
		}
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	fn test_pool(max: u32) -> DisplayPool {
		DisplayPool::new(
			DisplayPoolConfig {
				base: 900,
				max,
				..Default::default()
			},
			"sh",
			None,
		)
	}

	#[tokio::test]
	async fn allocation_is_bounded_by_max() {
		let pool = test_pool(2);
		// Bypass the real Xvfb spawn + readiness wait by exercising only the
		// bookkeeping surface: find_free_id and the allocated set.
		{
			let mut allocated = pool.allocated.lock().await;
			allocated.insert(900);
		}
		let next = pool.find_free_id(&pool.allocated.lock().await.clone()).await.unwrap();
		assert_eq!(next, 901);

		{
			let mut allocated = pool.allocated.lock().await;
			allocated.insert(901);
		}
		let err = pool.find_free_id(&pool.allocated.lock().await.clone()).await.unwrap_err();
		matches!(err, Error::CapacityExceeded);
	}

	#[tokio::test]
	async fn release_frees_the_display_number_for_reuse() {
		let pool = test_pool(1);
		pool.allocated.lock().await.insert(900);
		assert_eq!(pool.allocated_count().await, 1);

		// Build a throwaway Display without going through `allocate` (which
		// would need a real Xvfb); release only needs processes to signal.
		let server = tokio::process::Command::new("sh").arg("-c").arg("sleep 5").spawn().unwrap();
		let display = Display {
			id: 900,
			name: ":900".to_string(),
			server,
			window_manager: None,
		};
		pool.release(display).await;
		assert_eq!(pool.allocated_count().await, 0);
	}

	#[tokio::test]
	async fn dead_pid_is_detected_as_not_alive() {
		// A pid this high is never actually assigned, so `kill(pid, 0)` must
		// fail with ESRCH, the same check a stale lock file's owner gets.
		assert!(!process_is_alive(i32::MAX - 1));
	}

	#[tokio::test]
	async fn cleanup_stale_lock_removes_lock_with_dead_pid() {
		let lock_path = "/tmp/.X778-lock";
		tokio::fs::write(lock_path, format!("{}\n", i32::MAX - 1)).await.unwrap();

		cleanup_stale_lock(778).await;

		assert!(tokio::fs::metadata(lock_path).await.is_err());
	}

	#[tokio::test]
	async fn cleanup_stale_lock_leaves_lock_with_live_pid() {
		let lock_path = "/tmp/.X779-lock";
		// Our own pid is definitely alive, so the lock must be left in place.
		tokio::fs::write(lock_path, format!("{}\n", std::process::id())).await.unwrap();

		cleanup_stale_lock(779).await;

		assert!(tokio::fs::metadata(lock_path).await.is_ok());
		let _ = tokio::fs::remove_file(lock_path).await;
	}

	#[tokio::test]
	async fn readiness_timeout_tears_down_server_and_cleans_lock() {
		let id = 777;
		let lock_path = format!("/tmp/.X{id}-lock");
		tokio::fs::write(&lock_path, format!("{}\n", i32::MAX - 1)).await.unwrap();

		let pool = DisplayPool::new(
			DisplayPoolConfig {
				base: id,
				max: 1,
				probe_program: "false".to_string(),
			},
			"sh",
			None,
		);

		let err = pool.allocate_inner(id, &StreamConfig::default()).await.unwrap_err();
		matches!(err, Error::DisplayTimeout(d) if d == id);

		// The timeout path re-runs stale-lock cleanup, which removes a lock
		// whose pid is dead, and the spawned server was killed rather than
		// left running.
		assert!(tokio::fs::metadata(&lock_path).await.is_err());
	}
}
