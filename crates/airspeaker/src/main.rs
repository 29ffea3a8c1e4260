//! AirSpeaker: relay system audio to a Google Cast receiver.
//!
//! An external encoder captures and encodes audio, the broadcaster fans it out to
//! HTTP clients, and the supervisor keeps a Cast receiver pulling the stream.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use airspeaker::{cli, runtime};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,airspeaker=info")
        }))
        .init();
    runtime::run(args)
}
