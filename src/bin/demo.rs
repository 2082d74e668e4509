//! Manual-testing aid: captures one display through a single stream session
//! and prints each NAL unit's type and size as it arrives. Doesn't drive a
//! browser — point `--display` at an already-running X display (a real one
//! or a hand-started Xvfb) and this will start encoding it.

use clap::Parser;
use futures::StreamExt;
use vscreen_relay::{EncoderConfig, EncoderSource, LogConfig, StreamConfig, StreamSession};

#[derive(Parser, Debug)]
struct Cli {
	#[command(flatten)]
	stream: StreamConfig,

	#[command(flatten)]
	encoder: EncoderConfig,

	#[command(flatten)]
	log: LogConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	cli.log.init();

	let session = StreamSession::new("demo", "about:blank", cli.stream.clone());
	let encoder = EncoderSource::new(cli.encoder, cli.stream.clone());
	session.start(encoder).await?;

	tracing::info!(display = %cli.stream.display, "streaming started, press ctrl-c to stop");

	let mut subscription = session.subscribe().await;
	tokio::select! {
		_ = async {
			while let Some(nal) = subscription.next().await {
				let kind = vscreen_relay::nal::nal_type(&nal);
				println!("nal type={kind} bytes={}", nal.len());
			}
		} => {}
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("ctrl-c received, stopping");
		}
	}

	session.stop().await?;
	Ok(())
}
