//! C3: one browser's capture pipeline, fanned out to any number of
//! subscribers with a late-join cache and per-subscriber backpressure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::StreamConfig;
use crate::encoder::EncoderSource;
use crate::error::{Error, Result};
use crate::nal::{nal_type, NAL_TYPE_IDR, NAL_TYPE_NON_IDR, NAL_TYPE_PPS, NAL_TYPE_SPS};

/// A cached GOP stays until it would exceed this much memory, at which
/// point it's invalidated and late joiners fall back to sync-up.
const MAX_CACHE_BYTES: usize = 4 * 1024 * 1024;

/// Baseline depth of each subscriber's bounded NAL queue; enlarged to fit
/// the late-join snapshot when one is delivered.
pub const BASE_QUEUE_DEPTH: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
	Created,
	Starting,
	Streaming,
	Stopping,
	Stopped,
}

impl Status {
	fn label(self) -> &'static str {
		match self {
			Status::Created => "created",
			Status::Starting => "starting",
			Status::Streaming => "streaming",
			Status::Stopping => "stopping",
			Status::Stopped => "stopped",
		}
	}
}

/// Tracks the most recent parameter sets (independent of any cached GOP)
/// and the current GOP: `[SPS, PPS, IDR, non-IDR...]` once an IDR has been
/// seen, using the SPS/PPS that were current at that IDR.
#[derive(Default)]
struct GopCache {
	last_sps: Option<Bytes>,
	last_pps: Option<Bytes>,
	gop_nals: Vec<Bytes>,
	gop_bytes: usize,
	gop_has_idr: bool,
}

impl GopCache {
	fn update(&mut self, nal: &Bytes) {
		match nal_type(nal) {
			NAL_TYPE_SPS => self.last_sps = Some(nal.clone()),
			NAL_TYPE_PPS => self.last_pps = Some(nal.clone()),
			NAL_TYPE_IDR => {
				self.gop_nals.clear();
				self.gop_bytes = 0;
				for parameter_set in [&self.last_sps, &self.last_pps] {
					if let Some(unit) = parameter_set {
						self.gop_bytes += unit.len();
						self.gop_nals.push(unit.clone());
					}
				}
				self.gop_bytes += nal.len();
				self.gop_nals.push(nal.clone());
				self.gop_has_idr = true;
			}
			NAL_TYPE_NON_IDR if self.gop_has_idr => {
				self.gop_nals.push(nal.clone());
				self.gop_bytes += nal.len();
				if self.gop_bytes > MAX_CACHE_BYTES {
					tracing::warn!(bytes = self.gop_bytes, "GOP cache exceeded limit, invalidating");
					self.gop_nals.clear();
					self.gop_bytes = 0;
					self.gop_has_idr = false;
				}
			}
			_ => {}
		}
	}

	/// The decodable prefix a late joiner should receive, or `None` if there's
	/// no cached IDR yet (the joiner must sync up instead).
	fn snapshot(&self) -> Option<Vec<Bytes>> {
		self.gop_has_idr.then(|| self.gop_nals.clone())
	}
}

enum SyncState {
	/// Caught up: every unit is forwarded.
	Live,
	/// No cached IDR was available at subscribe time: at most one SPS and at
	/// most one PPS are forwarded, non-IDR slices are dropped, until the
	/// first live IDR arrives.
	Syncing { sent_sps: bool, sent_pps: bool },
}

struct Subscriber {
	tx: mpsc::Sender<Bytes>,
	sync: SyncState,
}

struct Inner {
	status: Status,
	cache: GopCache,
	subscribers: HashMap<u64, Subscriber>,
	next_id: u64,
}

/// A session's live capture-and-fanout pipeline.
pub struct StreamSession {
	id: String,
	url: String,
	config: StreamConfig,
	created_at: Instant,
	inner: Arc<Mutex<Inner>>,
	task: Mutex<Option<JoinHandle<()>>>,
	stop_tx: watch::Sender<bool>,
	stop_rx: watch::Receiver<bool>,
}

impl StreamSession {
	pub fn new(id: impl Into<String>, url: impl Into<String>, config: StreamConfig) -> Self {
		let (stop_tx, stop_rx) = watch::channel(false);
		Self {
			id: id.into(),
			url: url.into(),
			config,
			created_at: Instant::now(),
			inner: Arc::new(Mutex::new(Inner {
				status: Status::Created,
				cache: GopCache::default(),
				subscribers: HashMap::new(),
				next_id: 0,
			})),
			task: Mutex::new(None),
			stop_tx,
			stop_rx,
		}
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	pub fn display(&self) -> &str {
		&self.config.display
	}

	pub fn resolution(&self) -> (u32, u32) {
		(self.config.width, self.config.height)
	}

	pub fn created_at(&self) -> Instant {
		self.created_at
	}

	pub async fn status(&self) -> Status {
		self.inner.lock().await.status
	}

	pub async fn subscriber_count(&self) -> usize {
		self.inner.lock().await.subscribers.len()
	}

	/// Starts the encoder and spawns the fanout task. The session owns
	/// `encoder` for the rest of its life; `stop` tears it down.
	#[tracing::instrument(skip(self, encoder), fields(session = %self.id))]
	pub async fn start(&self, mut encoder: EncoderSource) -> Result<()> {
		{
			let mut inner = self.inner.lock().await;
			if !matches!(inner.status, Status::Created | Status::Stopped) {
				return Err(Error::InvalidState {
					action: "start",
					state: inner.status.label(),
				});
			}
			inner.status = Status::Starting;
		}
		// A restart after a prior stop needs the watch reset: the receiver
		// clone below only reports changes made *after* it's taken, so the
		// sender must be back at `false` before that clone happens.
		let _ = self.stop_tx.send(false);

		if let Err(err) = encoder.start().await {
			let mut inner = self.inner.lock().await;
			inner.status = Status::Stopped;
			return Err(err);
		}

		{
			let mut inner = self.inner.lock().await;
			inner.status = Status::Streaming;
		}

		let inner = self.inner.clone();
		let mut stop_rx = self.stop_rx.clone();
		let session_id = self.id.clone();

		let handle = tokio::spawn(async move {
			let nals = encoder.stream();
			tokio::pin!(nals);

			loop {
				tokio::select! {
					biased;
					_ = stop_rx.changed() => break,
					next = nals.next() => {
						match next {
							Some(nal) => {
								let mut guard = inner.lock().await;
								broadcast(&mut guard, nal);
							}
							None => break,
						}
					}
				}
			}

			if let Err(err) = encoder.stop().await {
				tracing::warn!(session = %session_id, %err, "error stopping encoder");
			}

			let mut guard = inner.lock().await;
			guard.status = Status::Stopped;
			guard.subscribers.clear();
			tracing::info!(session = %session_id, "session stopped");
		});

		*self.task.lock().await = Some(handle);
		Ok(())
	}

	/// Stops the session and waits for the fanout task to fully exit. Safe
	/// to call more than once, and safe to call concurrently with `start`'s
	/// in-flight fanout.
	#[tracing::instrument(skip(self), fields(session = %self.id))]
	pub async fn stop(&self) -> Result<()> {
		{
			let mut inner = self.inner.lock().await;
			match inner.status {
				Status::Created => {
					return Err(Error::InvalidState {
						action: "stop",
						state: inner.status.label(),
					});
				}
				Status::Stopped => return Ok(()),
				Status::Starting | Status::Streaming => inner.status = Status::Stopping,
				Status::Stopping => {}
			}
		}

		let _ = self.stop_tx.send(true);

		let handle = self.task.lock().await.take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}
		Ok(())
	}

	/// Registers a new subscriber, delivering the cached decodable prefix (if
	/// any) before returning so the caller never misses units broadcast
	/// between the snapshot and registration.
	pub async fn subscribe(&self) -> Subscription {
		let mut inner = self.inner.lock().await;
		let snapshot = inner.cache.snapshot();
		let depth = BASE_QUEUE_DEPTH.max(snapshot.as_ref().map_or(0, Vec::len) + BASE_QUEUE_DEPTH);
		let (tx, rx) = mpsc::channel(depth);
		let id = inner.next_id;
		inner.next_id += 1;

		let sync = match snapshot {
			Some(units) => {
				for unit in units {
					let _ = tx.try_send(unit);
				}
				SyncState::Live
			}
			None => SyncState::Syncing {
				sent_sps: false,
				sent_pps: false,
			},
		};

		inner.subscribers.insert(id, Subscriber { tx, sync });

		Subscription {
			id,
			rx,
			inner: self.inner.clone(),
		}
	}
}

/// Sends `nal` to one subscriber, removing it from `dead` if the queue is
/// closed. Drops silently on a full queue.
fn send_to(id: u64, tx: &mpsc::Sender<Bytes>, unit: Bytes, dead: &mut Vec<u64>) {
	match tx.try_send(unit) {
		Ok(()) => {}
		Err(mpsc::error::TrySendError::Full(_)) => {
			tracing::debug!(subscriber = id, "subscriber queue full, dropping unit");
		}
		Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
	}
}

fn broadcast(inner: &mut Inner, nal: Bytes) {
	inner.cache.update(&nal);
	// Safe to capture after `update`: IDR handling never mutates these, so a
	// syncing subscriber that's about to go live on this very unit sees the
	// parameter sets current as of this GOP.
	let last_sps = inner.cache.last_sps.clone();
	let last_pps = inner.cache.last_pps.clone();
	let t = nal_type(&nal);

	let mut dead = Vec::new();
	for (&id, sub) in inner.subscribers.iter_mut() {
		match &mut sub.sync {
			SyncState::Live => send_to(id, &sub.tx, nal.clone(), &mut dead),
			SyncState::Syncing { sent_sps, sent_pps } => match t {
				NAL_TYPE_SPS if !*sent_sps => {
					*sent_sps = true;
					send_to(id, &sub.tx, nal.clone(), &mut dead);
				}
				NAL_TYPE_PPS if !*sent_pps => {
					*sent_pps = true;
					send_to(id, &sub.tx, nal.clone(), &mut dead);
				}
				NAL_TYPE_IDR => {
					// The encoder may never resend parameter sets once sent
					// live, so a subscriber that missed them during sync-up
					// gets the cached ones synthesized right before the IDR.
					if !*sent_sps {
						if let Some(sps) = &last_sps {
							send_to(id, &sub.tx, sps.clone(), &mut dead);
						}
					}
					if !*sent_pps {
						if let Some(pps) = &last_pps {
							send_to(id, &sub.tx, pps.clone(), &mut dead);
						}
					}
					sub.sync = SyncState::Live;
					send_to(id, &sub.tx, nal.clone(), &mut dead);
				}
				_ => {}
			},
		}
	}

	for id in dead {
		inner.subscribers.remove(&id);
	}
}

/// A live subscription to a session's NAL stream. Dropping it unregisters
/// the subscriber on a best-effort basis.
pub struct Subscription {
	id: u64,
	rx: mpsc::Receiver<Bytes>,
	inner: Arc<Mutex<Inner>>,
}

impl Subscription {
	pub async fn recv(&mut self) -> Option<Bytes> {
		self.rx.recv().await
	}
}

impl futures::Stream for Subscription {
	type Item = Bytes;

	fn poll_next(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Option<Self::Item>> {
		self.rx.poll_recv(cx)
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		let inner = self.inner.clone();
		let id = self.id;
		tokio::spawn(async move {
			inner.lock().await.subscribers.remove(&id);
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{EncoderConfig, StreamConfig};
	use std::process::Stdio;
	use std::time::Duration;

	fn nal(nal_type: u8, payload: &[u8]) -> Vec<u8> {
		let mut out = vec![0, 0, 0, 1, 0x60 | (nal_type & 0x1f)];
		out.extend_from_slice(payload);
		out
	}

	fn printf_escape(bytes: &[u8]) -> String {
		bytes.iter().map(|b| format!("\\x{:02x}", b)).collect()
	}

	/// Builds a fake encoder that runs `script` under `sh -c` instead of
	/// spawning a real encoder binary, paired with a fresh session.
	fn spawn_fake_encoder(script: String) -> (StreamSession, EncoderSource) {
		let mut cmd = tokio::process::Command::new("sh");
		cmd.arg("-c").arg(script);
		cmd.stdin(Stdio::null());
		cmd.stdout(Stdio::piped());
		let child = cmd.spawn().expect("failed to spawn fake encoder");
		let encoder_cfg = EncoderConfig {
			program: "sh".to_string(),
			..Default::default()
		};
		let encoder = EncoderSource::for_test(encoder_cfg, StreamConfig::default(), child);
		let session = StreamSession::new("test-session", "https://example.invalid/", StreamConfig::default());
		(session, encoder)
	}

	fn one_gop() -> Vec<u8> {
		let mut out = Vec::new();
		out.extend(nal(7, &[0xaa]));
		out.extend(nal(8, &[0xbb]));
		out.extend(nal(5, &[0x01, 0x02]));
		out.extend(nal(1, &[0x03]));
		out.extend(nal(1, &[0x04]));
		out
	}

	async fn drain_n(sub: &mut Subscription, n: usize) -> Vec<Bytes> {
		let mut out = Vec::new();
		for _ in 0..n {
			out.push(tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.expect("timed out").expect("stream ended early"));
		}
		out
	}

	#[tokio::test]
	async fn subscriber_receives_units_in_order() {
		let gop = one_gop();
		let (session, encoder) = spawn_fake_encoder(format!("printf '{}'", printf_escape(&gop)));
		session.start(encoder).await.unwrap();

		let mut sub = session.subscribe().await;
		let received = drain_n(&mut sub, 5).await;
		let types: Vec<u8> = received.iter().map(|b| crate::nal::nal_type(b)).collect();
		assert_eq!(types, vec![7, 8, 5, 1, 1]);

		session.stop().await.unwrap();
	}

	#[tokio::test]
	async fn late_joiner_gets_decodable_prefix_first() {
		let gop = one_gop();
		let (session, encoder) = spawn_fake_encoder(format!("printf '{}'; sleep 1", printf_escape(&gop)));
		session.start(encoder).await.unwrap();

		// Give the fanout task a moment to process the whole GOP before the
		// late joiner subscribes.
		tokio::time::sleep(Duration::from_millis(200)).await;

		let mut sub = session.subscribe().await;
		let received = drain_n(&mut sub, 3).await;
		let types: Vec<u8> = received.iter().map(|b| crate::nal::nal_type(b)).collect();
		assert_eq!(types, vec![7, 8, 5]);

		session.stop().await.unwrap();
	}

	#[tokio::test]
	async fn sync_up_drops_non_idr_until_first_live_idr() {
		// Subscriber joins before anything has streamed, so there's no cached
		// IDR: it must sync up.
		let mut parts = Vec::new();
		parts.extend(nal(1, &[0x10])); // stray non-idr before any parameter sets: dropped, not cached
		parts.extend(nal(7, &[0xaa]));
		parts.extend(nal(8, &[0xbb]));
		parts.extend(nal(1, &[0x20])); // non-idr slice before the first IDR: dropped while syncing
		parts.extend(nal(5, &[0x01])); // first live IDR: delivered, subscriber goes live
		parts.extend(nal(1, &[0x30])); // now live: delivered

		let (session, encoder) = spawn_fake_encoder(format!("printf '{}'; sleep 1", printf_escape(&parts)));

		let mut sub = session.subscribe().await;
		session.start(encoder).await.unwrap();

		let received = drain_n(&mut sub, 3).await;
		let types: Vec<u8> = received.iter().map(|b| crate::nal::nal_type(b)).collect();
		assert_eq!(types, vec![7, 8, 5]);

		let live = drain_n(&mut sub, 1).await;
		assert_eq!(crate::nal::nal_type(&live[0]), 1);

		session.stop().await.unwrap();
	}

	#[tokio::test]
	async fn sync_up_synthesizes_cached_parameter_sets_before_first_idr() {
		// Parameter sets stream live before the subscriber joins, so by the
		// time it subscribes there's no cached IDR yet (sync-up) but the
		// session already knows `last_sps`/`last_pps`. The subscriber should
		// never see them live, so they must be synthesized just before the
		// first IDR it does see.
		let mut before = Vec::new();
		before.extend(nal(7, &[0xaa]));
		before.extend(nal(8, &[0xbb]));
		before.extend(nal(1, &[0x10])); // non-idr with no GOP yet: not cached

		let mut after = Vec::new();
		after.extend(nal(5, &[0x01])); // first IDR, arrives after the subscriber joins
		after.extend(nal(1, &[0x20]));

		let script = format!("printf '{}'; sleep 1; printf '{}'", printf_escape(&before), printf_escape(&after));
		let (session, encoder) = spawn_fake_encoder(script);
		session.start(encoder).await.unwrap();

		// Let the parameter sets and the stray non-idr stream live before
		// subscribing, so this subscriber's sync-up window starts after them.
		tokio::time::sleep(Duration::from_millis(300)).await;
		let mut sub = session.subscribe().await;

		let received = drain_n(&mut sub, 3).await;
		let types: Vec<u8> = received.iter().map(|b| crate::nal::nal_type(b)).collect();
		assert_eq!(types, vec![7, 8, 5]);
		assert_eq!(received[0].as_ref(), nal(7, &[0xaa]).as_slice());
		assert_eq!(received[1].as_ref(), nal(8, &[0xbb]).as_slice());

		session.stop().await.unwrap();
	}

	#[tokio::test]
	async fn dropped_subscription_is_eventually_cleaned_up() {
		let (session, encoder) = spawn_fake_encoder("sleep 1".to_string());
		session.start(encoder).await.unwrap();

		let sub = session.subscribe().await;
		assert_eq!(session.subscriber_count().await, 1);
		drop(sub);

		for _ in 0..50 {
			if session.subscriber_count().await == 0 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(session.subscriber_count().await, 0);

		session.stop().await.unwrap();
	}

	#[tokio::test]
	async fn stop_implies_subscribers_see_end_of_stream() {
		let (session, encoder) = spawn_fake_encoder("sleep 1".to_string());
		session.start(encoder).await.unwrap();

		let mut sub = session.subscribe().await;
		session.stop().await.unwrap();

		assert_eq!(session.status().await, Status::Stopped);
		assert_eq!(tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap(), None);
	}

	#[tokio::test]
	async fn cannot_start_twice() {
		let (session, encoder) = spawn_fake_encoder("sleep 1".to_string());
		session.start(encoder).await.unwrap();

		let encoder2 = EncoderSource::new(EncoderConfig::default(), StreamConfig::default());
		let err = session.start(encoder2).await.unwrap_err();
		matches!(err, Error::InvalidState { .. });

		session.stop().await.unwrap();
	}

	#[tokio::test]
	async fn stopped_session_can_be_restarted() {
		let (session, encoder) = spawn_fake_encoder("sleep 1".to_string());
		session.start(encoder).await.unwrap();
		session.stop().await.unwrap();
		assert_eq!(session.status().await, Status::Stopped);

		let (_, encoder2) = spawn_fake_encoder("sleep 1".to_string());
		session.start(encoder2).await.unwrap();
		assert_eq!(session.status().await, Status::Streaming);

		session.stop().await.unwrap();
		assert_eq!(session.status().await, Status::Stopped);
	}
}
