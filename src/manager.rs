//! C4 (session half): atomically brings up a display, browser, and stream
//! session together, and tears them down in the reverse order.

use std::collections::HashMap;
use std::sync::Arc;

use crate::browser::{Automation, Browser, Launcher};
use crate::config::{EncoderConfig, StreamConfig};
use crate::display::{Display, DisplayAllocator};
use crate::encoder::EncoderSource;
use crate::error::{Error, Result};
use crate::session::StreamSession;
use tokio::sync::Mutex;

/// `None` marks a session id that's reserved but not yet fully created,
/// closing the window where a concurrent `create` with the same id could
/// race the slow allocate-launch-start pipeline below.
type Slot = Option<Entry>;

struct Entry {
	session: Arc<StreamSession>,
	automation: Box<dyn Automation>,
	browser: Box<dyn Browser>,
	display: Display,
}

/// Owns the full fleet of sessions: for each, a display, a browser pointed
/// at it, and the stream session fanning out its encoded output.
pub struct SessionManager {
	displays: Arc<dyn DisplayAllocator>,
	launcher: Arc<dyn Launcher>,
	encoder: EncoderConfig,
	sessions: Mutex<HashMap<String, Slot>>,
}

impl SessionManager {
	pub fn new(displays: Arc<dyn DisplayAllocator>, launcher: Arc<dyn Launcher>, encoder: EncoderConfig) -> Self {
		Self {
			displays,
			launcher,
			encoder,
			sessions: Mutex::new(HashMap::new()),
		}
	}

	pub async fn get(&self, id: &str) -> Option<Arc<StreamSession>> {
		match self.sessions.lock().await.get(id) {
			Some(Some(entry)) => Some(entry.session.clone()),
			_ => None,
		}
	}

	pub async fn session_ids(&self) -> Vec<String> {
		self.sessions.lock().await.keys().cloned().collect()
	}

	/// Allocates a display, launches a browser against `url` on it, and
	/// starts the stream session, in that order. If any step fails, every
	/// step that already succeeded is rolled back in reverse order and the
	/// session id is freed for another attempt.
	#[tracing::instrument(skip(self, url, stream), fields(session = %id))]
	pub async fn create(&self, id: impl Into<String>, url: impl Into<String>, stream: StreamConfig) -> Result<Arc<StreamSession>> {
		let id = id.into();
		let url = url.into();

		{
			let mut sessions = self.sessions.lock().await;
			if sessions.contains_key(&id) {
				return Err(Error::AlreadyExists(id));
			}
			sessions.insert(id.clone(), None);
		}

		match self.create_inner(&id, &url, stream).await {
			Ok(entry) => {
				let session = entry.session.clone();
				self.sessions.lock().await.insert(id, Some(entry));
				Ok(session)
			}
			Err(err) => {
				self.sessions.lock().await.remove(&id);
				Err(err)
			}
		}
	}

	async fn create_inner(&self, id: &str, url: &str, stream: StreamConfig) -> Result<Entry> {
		let display = self.displays.allocate(&stream).await?;

		let (automation, browser) = match self.launcher.launch(&display.name, url, stream.width, stream.height).await {
			Ok(pair) => pair,
			Err(err) => {
				tracing::warn!(%err, "browser launch failed, rolling back display");
				self.displays.release(display).await;
				return Err(err);
			}
		};

		let mut encoder_stream = stream;
		encoder_stream.display = display.name.clone();
		let encoder = EncoderSource::new(self.encoder.clone(), encoder_stream.clone());

		let session = Arc::new(StreamSession::new(id, url, encoder_stream));
		if let Err(err) = session.start(encoder).await {
			tracing::warn!(%err, "session start failed, rolling back browser and display");
			let mut automation = automation;
			let mut browser = browser;
			let _ = browser.close().await;
			let _ = automation.stop().await;
			self.displays.release(display).await;
			return Err(err);
		}

		tracing::info!("session created");
		Ok(Entry {
			session,
			automation,
			browser,
			display,
		})
	}

	/// Tears down one session: stream session, then browser, then
	/// automation, then display — the reverse of creation order.
	#[tracing::instrument(skip(self), fields(session = %id))]
	pub async fn stop(&self, id: &str) -> Result<()> {
		let entry = {
			let mut sessions = self.sessions.lock().await;
			match sessions.remove(id) {
				Some(Some(entry)) => entry,
				Some(None) => {
					sessions.insert(id.to_string(), None);
					return Err(Error::InvalidState {
						action: "stop",
						state: "creating",
					});
				}
				None => return Err(Error::NotFound(id.to_string())),
			}
		};
		self.teardown(entry).await;
		Ok(())
	}

	/// Tears down every fully-created session concurrently. Sessions still
	/// mid-creation are left in place; the in-flight `create` call is
	/// responsible for rolling itself back if it fails.
	pub async fn stop_all(&self) {
		let entries: Vec<Entry> = {
			let mut sessions = self.sessions.lock().await;
			let ids: Vec<String> = sessions.iter().filter(|(_, slot)| slot.is_some()).map(|(id, _)| id.clone()).collect();
			ids.into_iter().filter_map(|id| sessions.remove(&id).flatten()).collect()
		};

		futures::future::join_all(entries.into_iter().map(|entry| self.teardown(entry))).await;
	}

	async fn teardown(&self, entry: Entry) {
		let Entry {
			session,
			mut automation,
			mut browser,
			display,
		} = entry;

		if let Err(err) = session.stop().await {
			tracing::warn!(%err, "error stopping session during teardown");
		}
		if let Err(err) = browser.close().await {
			tracing::warn!(%err, "error closing browser during teardown");
		}
		if let Err(err) = automation.stop().await {
			tracing::warn!(%err, "error stopping automation during teardown");
		}
		self.displays.release(display).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::browser::test_support::FakeLauncher;
	use crate::display::test_support::FakeDisplayAllocator;

	fn manager(displays: FakeDisplayAllocator, launcher: FakeLauncher) -> SessionManager {
		SessionManager::new(Arc::new(displays), Arc::new(launcher), EncoderConfig::default())
	}

	// `sh` rejects the x11grab-style flags `EncoderConfig::command` always
	// builds and exits immediately, which is fine here: these tests only
	// assert on session bookkeeping, not on anything the encoder streams,
	// and this way they don't depend on a real encoder being installed.
	fn fast_encoder() -> EncoderConfig {
		EncoderConfig {
			program: "sh".to_string(),
			..Default::default()
		}
	}

	#[tokio::test]
	async fn create_then_get_then_stop() {
		let mgr = SessionManager::new(
			Arc::new(FakeDisplayAllocator::new()),
			Arc::new(FakeLauncher { should_fail: false }),
			fast_encoder(),
		);

		let session = mgr.create("s1", "http://example.invalid", StreamConfig::default()).await.unwrap();
		assert_eq!(session.id(), "s1");
		assert!(mgr.get("s1").await.is_some());

		mgr.stop("s1").await.unwrap();
		assert!(mgr.get("s1").await.is_none());
	}

	#[tokio::test]
	async fn duplicate_create_is_rejected() {
		let mgr = SessionManager::new(
			Arc::new(FakeDisplayAllocator::new()),
			Arc::new(FakeLauncher { should_fail: false }),
			fast_encoder(),
		);

		mgr.create("dup", "http://example.invalid", StreamConfig::default()).await.unwrap();
		let err = mgr.create("dup", "http://example.invalid", StreamConfig::default()).await.unwrap_err();
		matches!(err, Error::AlreadyExists(_));

		mgr.stop("dup").await.unwrap();
	}

	#[tokio::test]
	async fn stop_missing_session_is_not_found() {
		let mgr = manager(FakeDisplayAllocator::new(), FakeLauncher { should_fail: false });
		let err = mgr.stop("nope").await.unwrap_err();
		matches!(err, Error::NotFound(_));
	}

	#[tokio::test]
	async fn failed_display_allocation_leaves_no_session_behind() {
		let mgr = manager(FakeDisplayAllocator::failing(), FakeLauncher { should_fail: false });
		let err = mgr.create("s1", "http://example.invalid", StreamConfig::default()).await.unwrap_err();
		matches!(err, Error::CapacityExceeded);
		assert!(mgr.get("s1").await.is_none());
		assert!(mgr.session_ids().await.is_empty());
	}

	#[tokio::test]
	async fn failed_browser_launch_rolls_back_the_display() {
		let mgr = manager(FakeDisplayAllocator::new(), FakeLauncher { should_fail: true });
		let err = mgr.create("s1", "http://example.invalid", StreamConfig::default()).await.unwrap_err();
		matches!(err, Error::Infrastructure(_));
		assert!(mgr.get("s1").await.is_none());
		assert!(mgr.session_ids().await.is_empty());
	}

	#[tokio::test]
	async fn stop_all_tears_down_every_session() {
		let mgr = SessionManager::new(
			Arc::new(FakeDisplayAllocator::new()),
			Arc::new(FakeLauncher { should_fail: false }),
			fast_encoder(),
		);

		mgr.create("a", "http://example.invalid", StreamConfig::default()).await.unwrap();
		mgr.create("b", "http://example.invalid", StreamConfig::default()).await.unwrap();

		mgr.stop_all().await;
		assert!(mgr.session_ids().await.is_empty());
	}
}
