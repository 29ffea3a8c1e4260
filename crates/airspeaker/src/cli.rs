use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{Codec, Overrides};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "airspeaker", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Optional config file (TOML). Defaults to config.toml next to the binary if present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Stream codec
    #[arg(long, global = true, value_enum)]
    pub codec: Option<Codec>,

    /// HTTP stream port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Capture input passed to the encoder, e.g. "BlackHole 2ch"
    #[arg(long, global = true)]
    pub audio_device: Option<String>,

    /// Host or IP receivers should use to reach this machine
    #[arg(long, global = true)]
    pub public_host: Option<String>,
}

impl Args {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            port: self.port,
            codec: self.codec,
            audio_device: self.audio_device.clone(),
            public_host: self.public_host.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List Cast receivers on the local network
    Discover,

    /// List capture inputs the encoder can see
    Inputs,

    /// Run the encoder and HTTP stream until Ctrl-C
    Serve,

    /// Stream to a Cast receiver and keep it playing until Ctrl-C
    Cast {
        /// Receiver id or (part of) its name
        device: String,
    },

    /// Pull a stream for a while and report what arrived
    Probe {
        /// Stream URL, e.g. http://192.168.1.20:18573/stream
        url: String,

        /// How long to read
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}
