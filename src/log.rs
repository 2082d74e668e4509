//! Tracing setup for applications embedding this crate.
//!
//! The streaming plane itself only emits `tracing` events; installing a
//! subscriber is left to the embedder, the same way `moq-native::Log` is a
//! small `clap::Args` struct that `main()` calls `.init()` on before doing
//! anything else (see `moq-clock/src/main.rs`).

/// Logging configuration, parsed from the CLI or a config file.
#[derive(clap::Args, Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
	/// Overrides `RUST_LOG`; falls back to `info` if neither is set.
	#[arg(long)]
	pub level: Option<String>,
}

impl LogConfig {
	/// Installs a global `tracing-subscriber` filtered by `RUST_LOG`, or
	/// `self.level` if set, or `info` as a last resort.
	pub fn init(&self) {
		let filter = self
			.level
			.clone()
			.map(tracing_subscriber::EnvFilter::new)
			.unwrap_or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")));

		let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
	}
}
