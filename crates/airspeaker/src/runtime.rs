//! Subcommand entry points.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::cast::DeviceDescriptor;
use crate::cli::{Args, Command};
use crate::config::{Overrides, Settings, SpeakerConfig};
use crate::encoder;
use crate::probe;
use crate::streamer::Streamer;
use crate::supervisor::ConnectionSupervisor;

/// How often the foreground loop checks on the encoder while waiting for Ctrl-C.
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

pub fn run(args: Args) -> Result<()> {
    let overrides = args.overrides();
    let settings = || load_settings(args.config.as_deref(), &overrides);
    match args.cmd {
        Command::Discover => run_discover(&settings()?),
        Command::Inputs => run_inputs(&settings()?),
        Command::Serve => run_serve(settings()?, shutdown_channel()?),
        Command::Cast { device } => run_cast(settings()?, &device, shutdown_channel()?),
        Command::Probe { url, seconds } => run_probe(&url, Duration::from_secs(seconds)),
    }
}

/// Explicit `--config`, else `config.toml` beside the executable, else defaults.
pub fn load_settings(path: Option<&Path>, overrides: &Overrides) -> Result<Settings> {
    let mut cfg = match path {
        Some(path) => SpeakerConfig::load(path)?,
        None => match auto_config_path().filter(|p| p.exists()) {
            Some(path) => {
                tracing::info!(path = %path.display(), "using config next to binary");
                SpeakerConfig::load(&path)?
            }
            None => SpeakerConfig::default(),
        },
    };
    cfg.apply_overrides(overrides);
    cfg.resolve()
}

fn auto_config_path() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|dir| dir.join("config.toml")))
}

/// Fires once on Ctrl-C.
pub fn shutdown_channel() -> Result<Receiver<()>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("install Ctrl-C handler")?;
    Ok(rx)
}

pub fn run_discover(settings: &Settings) -> Result<()> {
    let supervisor = ConnectionSupervisor::with_cast_defaults(settings.cast.clone());
    let devices = supervisor.discover();
    if devices.is_empty() {
        println!("no Cast receivers found");
        return Ok(());
    }
    for device in &devices {
        println!("{}", device_line(device));
    }
    Ok(())
}

pub fn run_inputs(settings: &Settings) -> Result<()> {
    let inputs = encoder::list_audio_inputs(&settings.encoder)?;
    if inputs.is_empty() {
        println!("no audio inputs reported by {}", settings.encoder.program);
    }
    for (index, name) in inputs.iter().enumerate() {
        let marker = if *name == settings.encoder.audio_device { "*" } else { " " };
        println!("{marker} [{index}] {name}");
    }
    Ok(())
}

pub fn run_serve(settings: Settings, shutdown: Receiver<()>) -> Result<()> {
    let mut streamer = Streamer::new(settings.stream.clone(), &settings.encoder);
    let url = streamer.start()?;
    println!("streaming {} at {url}", streamer.content_type());
    wait_for_shutdown(&streamer, &shutdown);
    streamer.stop();
    Ok(())
}

pub fn run_cast(settings: Settings, query: &str, shutdown: Receiver<()>) -> Result<()> {
    let mut streamer = Streamer::new(settings.stream.clone(), &settings.encoder);
    let url = streamer.start()?;

    let mut supervisor = ConnectionSupervisor::with_cast_defaults(settings.cast.clone())
        .with_title(settings.stream.name.clone());
    let devices = supervisor.discover();
    let Some(device) = supervisor.find_device(query) else {
        streamer.stop();
        let names = devices
            .iter()
            .map(|d| d.friendly_name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(anyhow::anyhow!("no receiver matches {query:?} (found: {names})"));
    };

    if let Err(e) = supervisor.connect(&device.id, &url, streamer.content_type()) {
        streamer.stop();
        return Err(e);
    }
    println!("casting {url} to {}", device.label());
    wait_for_shutdown(&streamer, &shutdown);

    supervisor.disconnect();
    streamer.stop();
    Ok(())
}

pub fn run_probe(url: &str, duration: Duration) -> Result<()> {
    let report = probe::probe_stream(url, duration)?;
    println!("{}", report.summary());
    Ok(())
}

fn wait_for_shutdown(streamer: &Streamer, shutdown: &Receiver<()>) {
    let mut warned = false;
    loop {
        match shutdown.recv_timeout(HEALTH_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if !warned && !streamer.encoder_alive() {
            tracing::warn!("encoder is not running; stream has no new data");
            warned = true;
        }
    }
    tracing::info!("shutting down");
}

fn device_line(device: &DeviceDescriptor) -> String {
    format!("{}  {}  {}:{}", device.id, device.label(), device.host, device.port)
}
