//! Configuration surface for the streaming plane.
//!
//! Mirrors `moq-native`'s `clap::Args` + `serde` configuration structs: every
//! value has a sane default, and the whole thing can be parsed from a CLI or
//! a config file by an embedding application. The core itself never reads
//! environment variables or config files on its own.

use std::time::Duration;

/// Per-session stream configuration. Immutable once the session is created.
#[derive(clap::Args, Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
	/// X11 display identifier the encoder captures from (e.g. ":99").
	#[arg(long, default_value = ":99")]
	pub display: String,

	/// Capture width in pixels.
	#[arg(long, default_value_t = 1280)]
	pub width: u32,

	/// Capture height in pixels.
	#[arg(long, default_value_t = 720)]
	pub height: u32,

	/// Capture framerate in frames per second.
	#[arg(long, default_value_t = 15)]
	pub framerate: u32,

	/// H.264 target bitrate, ffmpeg-style (e.g. "500k").
	#[arg(long, default_value = "500k")]
	pub bitrate: String,

	/// H.264 max bitrate, ffmpeg-style.
	#[arg(long, default_value = "800k")]
	pub maxrate: String,

	/// H.264 rate control buffer size, ffmpeg-style.
	#[arg(long, default_value = "500k")]
	pub bufsize: String,

	/// Group-of-pictures size in frames; also the late-join interval.
	#[arg(long, default_value_t = 10)]
	pub gop_size: u32,
}

impl Default for StreamConfig {
	fn default() -> Self {
		Self {
			display: ":99".to_string(),
			width: 1280,
			height: 720,
			framerate: 15,
			bitrate: "500k".to_string(),
			maxrate: "800k".to_string(),
			bufsize: "500k".to_string(),
			gop_size: 10,
		}
	}
}

/// Encoder subprocess configuration: which program to run and how long to
/// give it to shut down gracefully before it's force-killed.
#[derive(clap::Args, Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncoderConfig {
	/// The encoder binary to spawn.
	#[arg(long, default_value = "ffmpeg")]
	pub program: String,

	/// Extra arguments appended after the default x11grab/libx264 pipeline.
	#[arg(long)]
	pub extra_args: Vec<String>,

	/// Chunk size used when reading the encoder's stdout.
	#[arg(skip = 32 * 1024usize)]
	#[serde(skip, default = "default_read_chunk_bytes")]
	pub read_chunk_bytes: usize,

	/// How long to wait after SIGTERM before SIGKILL-ing the process group.
	#[arg(skip = None)]
	#[serde(skip)]
	pub stop_timeout: Option<Duration>,
}

fn default_read_chunk_bytes() -> usize {
	32 * 1024
}

impl Default for EncoderConfig {
	fn default() -> Self {
		Self {
			program: "ffmpeg".to_string(),
			extra_args: Vec::new(),
			read_chunk_bytes: 32 * 1024,
			stop_timeout: None,
		}
	}
}

impl EncoderConfig {
	pub fn stop_timeout(&self) -> Duration {
		self.stop_timeout.unwrap_or(Duration::from_secs(5))
	}

	/// Builds the default x11grab -> libx264 -> Annex-B command line for the
	/// given stream config, the way `FFmpegSource._build_command` does.
	pub fn command(&self, stream: &StreamConfig) -> tokio::process::Command {
		let mut cmd = tokio::process::Command::new(&self.program);
		cmd.args([
			"-nostdin",
			"-f",
			"x11grab",
			"-video_size",
			&format!("{}x{}", stream.width, stream.height),
			"-framerate",
			&stream.framerate.to_string(),
			"-draw_mouse",
			"0",
			"-i",
			&stream.display,
			"-c:v",
			"libx264",
			"-preset",
			"ultrafast",
			"-tune",
			"zerolatency",
			"-profile:v",
			"baseline",
			"-level",
			"3.1",
			"-pix_fmt",
			"yuv420p",
			"-g",
			&stream.gop_size.to_string(),
			"-keyint_min",
			&stream.gop_size.to_string(),
			"-sc_threshold",
			"0",
			"-b:v",
			&stream.bitrate,
			"-maxrate",
			&stream.maxrate,
			"-bufsize",
			&stream.bufsize,
			"-f",
			"h264",
			"-",
		]);
		cmd.args(&self.extra_args);
		cmd
	}
}

/// Display pool sizing: `max` virtual displays drawn from `[base, base+max)`.
#[derive(clap::Args, Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisplayPoolConfig {
	/// Lowest display number the pool will allocate.
	#[arg(long, default_value_t = 100)]
	pub base: u32,

	/// Maximum number of concurrent displays.
	#[arg(long, default_value_t = 5)]
	pub max: u32,

	/// Readiness-probe command run as `<probe_program> -display <display>`;
	/// the display is considered ready once it exits successfully.
	#[arg(long, default_value = "xdpyinfo")]
	pub probe_program: String,
}

impl Default for DisplayPoolConfig {
	fn default() -> Self {
		Self {
			base: 100,
			max: 5,
			probe_program: "xdpyinfo".to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encoder_command_includes_stream_geometry() {
		let stream = StreamConfig {
			width: 640,
			height: 480,
			..Default::default()
		};
		let cmd = EncoderConfig::default().command(&stream);
		let args: Vec<String> = cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
		assert!(args.iter().any(|a| a == "640x480"));
		assert!(args.iter().any(|a| a == ":99"));
	}
}
