//! External capture/encoder process.
//!
//! The encoder is a black box that writes encoded frames to stdout. One thread pumps
//! stdout into the [`Broadcaster`]; another drains stderr so the child never blocks on
//! a full pipe.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;

use crate::broadcast::Broadcaster;
use crate::config::{Codec, EncoderSettings};

/// Bytes requested per stdout read.
const READ_CHUNK_BYTES: usize = 4096;

/// Program and arguments for the encoder child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EncoderCommand {
    /// Build the capture + encode command line for `codec`.
    pub fn for_codec(settings: &EncoderSettings, codec: Codec) -> Self {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-fflags",
            "nobuffer",
            "-analyzeduration",
            "100000",
            "-probesize",
            "32768",
            "-f",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(settings.input_format.clone());
        args.push("-i".to_string());
        args.push(input_spec(&settings.input_format, &settings.audio_device));
        args.extend(
            [
                "-acodec".to_string(),
                codec.encoder_name().to_string(),
                "-b:a".to_string(),
                settings.bitrate.clone(),
                "-ar".to_string(),
                settings.sample_rate.to_string(),
                "-ac".to_string(),
                settings.channels.to_string(),
                "-flush_packets".to_string(),
                "1".to_string(),
                "-f".to_string(),
                codec.container().to_string(),
                "pipe:1".to_string(),
            ]
            .into_iter(),
        );
        Self {
            program: settings.program.clone(),
            args,
        }
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// avfoundation addresses audio-only inputs as `:<name>`.
fn input_spec(input_format: &str, device: &str) -> String {
    if input_format == "avfoundation" {
        format!(":{device}")
    } else {
        device.to_string()
    }
}

/// A running encoder child with its reader threads.
pub struct EncoderProducer {
    child: Option<Child>,
    running: Arc<AtomicBool>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl EncoderProducer {
    /// Launch the encoder and start pumping its output into `broadcaster`.
    pub fn spawn(command: &EncoderCommand, broadcaster: Arc<Broadcaster>) -> Result<Self> {
        tracing::info!(command = %command.display(), "encoder: starting");
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn encoder {:?}", command.program))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("encoder stdout not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            std::thread::Builder::new()
                .name("encoder-stderr".to_string())
                .spawn(move || drain_stderr(stderr))
                .context("spawn encoder stderr thread")?;
        }

        let running = Arc::new(AtomicBool::new(true));
        let reader = {
            let running = running.clone();
            std::thread::Builder::new()
                .name("encoder-reader".to_string())
                .spawn(move || {
                    let pushed = pump(stdout, &broadcaster, &running);
                    if running.load(Ordering::Relaxed) {
                        tracing::warn!(bytes = pushed, "encoder: process ended unexpectedly");
                    } else {
                        tracing::debug!(bytes = pushed, "encoder: reader stopped");
                    }
                })
                .context("spawn encoder reader thread")?
        };

        Ok(Self {
            child: Some(child),
            running,
            reader: Some(reader),
        })
    }

    /// True until [`EncoderProducer::stop`] is called or the reader hit end of stream.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && self.reader.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Kill the child and wait for the reader to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                tracing::debug!(error = %e, "encoder: kill failed (already exited?)");
            }
            match child.wait() {
                Ok(status) => tracing::info!(status = %status, "encoder: stopped"),
                Err(e) => tracing::warn!(error = %e, "encoder: wait failed"),
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for EncoderProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Copy `source` into `broadcaster` until end of stream or `running` is cleared.
///
/// Returns the number of bytes pushed.
pub fn pump<R: Read>(mut source: R, broadcaster: &Broadcaster, running: &AtomicBool) -> u64 {
    let mut buf = [0u8; READ_CHUNK_BYTES];
    let mut total = 0u64;
    while running.load(Ordering::Relaxed) {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                broadcaster.push(Bytes::copy_from_slice(&buf[..n]));
                total += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "encoder: read failed");
                break;
            }
        }
    }
    total
}

fn drain_stderr<R: Read>(stderr: R) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::warn!(target: "airspeaker::encoder", "encoder: {line}");
                }
            }
            Err(_) => break,
        }
    }
}

/// Ask the encoder program for the capture inputs it can see.
pub fn list_audio_inputs(settings: &EncoderSettings) -> Result<Vec<String>> {
    let mut child = Command::new(&settings.program)
        .args([
            "-hide_banner",
            "-f",
            settings.input_format.as_str(),
            "-list_devices",
            "true",
            "-i",
            "",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {:?}", settings.program))?;

    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        pipe.read_to_string(&mut stderr)
            .context("read device listing")?;
    }
    // The listing run always exits non-zero ("no input"), so only the output matters.
    let _ = wait_with_timeout(&mut child, Duration::from_secs(5));
    Ok(parse_avfoundation_audio_devices(&stderr))
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<()> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            child.kill()?;
            child.wait()?;
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Extract audio device names from an avfoundation `-list_devices` listing.
///
/// Lines look like `[AVFoundation indev @ 0x...] [0] BlackHole 2ch`.
pub fn parse_avfoundation_audio_devices(listing: &str) -> Vec<String> {
    let mut devices = Vec::new();
    let mut in_audio = false;
    for line in listing.lines() {
        if line.contains("AVFoundation audio devices:") {
            in_audio = true;
            continue;
        }
        if !in_audio {
            continue;
        }
        if !line.trim_start().starts_with("[AVFoundation") {
            break;
        }
        let parts: Vec<&str> = line.split(']').collect();
        if parts.len() >= 3 {
            if let Some(name) = parts.last().map(|s| s.trim()).filter(|s| !s.is_empty()) {
                devices.push(name.to_string());
            }
        }
    }
    devices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{BroadcastConfig, PullResult};
    use crate::config::SpeakerConfig;
    use std::io::Cursor;

    fn settings() -> EncoderSettings {
        SpeakerConfig::default().resolve().unwrap().encoder
    }

    #[test]
    fn aac_command_targets_adts_on_stdout() {
        let cmd = EncoderCommand::for_codec(&settings(), Codec::Aac);
        assert_eq!(cmd.program, "ffmpeg");
        let joined = cmd.args.join(" ");
        assert!(joined.contains("-f avfoundation -i :BlackHole 2ch"));
        assert!(joined.contains("-acodec aac -b:a 192k -ar 44100 -ac 2"));
        assert!(joined.ends_with("-flush_packets 1 -f adts pipe:1"));
    }

    #[test]
    fn mp3_command_uses_lame() {
        let cmd = EncoderCommand::for_codec(&settings(), Codec::Mp3);
        let joined = cmd.args.join(" ");
        assert!(joined.contains("-acodec libmp3lame"));
        assert!(joined.ends_with("-f mp3 pipe:1"));
    }

    #[test]
    fn non_avfoundation_input_is_passed_verbatim() {
        let mut s = settings();
        s.input_format = "pulse".to_string();
        s.audio_device = "default".to_string();
        let cmd = EncoderCommand::for_codec(&s, Codec::Aac);
        assert!(cmd.args.join(" ").contains("-f pulse -i default"));
    }

    #[test]
    fn pump_pushes_everything_in_order() {
        let b = Broadcaster::new(BroadcastConfig {
            min_flush_bytes: 1,
            max_consumer_bytes: None,
        });
        let id = b.register();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let running = AtomicBool::new(true);
        let pushed = pump(Cursor::new(payload.clone()), &b, &running);
        assert_eq!(pushed, payload.len() as u64);
        assert_eq!(
            b.pull(id, Duration::from_millis(10)),
            PullResult::Data(Bytes::from(payload))
        );
    }

    #[test]
    fn pump_stops_when_flag_cleared() {
        let b = Broadcaster::default();
        let running = AtomicBool::new(false);
        assert_eq!(pump(Cursor::new(vec![1u8; 64]), &b, &running), 0);
    }

    #[cfg(unix)]
    #[test]
    fn spawned_process_output_reaches_consumers() {
        let b = Arc::new(Broadcaster::new(BroadcastConfig {
            min_flush_bytes: 1,
            max_consumer_bytes: None,
        }));
        let id = b.register();
        let command = EncoderCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "printf 'abc'; echo oops >&2".to_string()],
        };
        let mut producer = EncoderProducer::spawn(&command, b.clone()).unwrap();
        let mut received = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while received.len() < 3 && std::time::Instant::now() < deadline {
            if let PullResult::Data(data) = b.pull(id, Duration::from_millis(50)) {
                received.extend_from_slice(&data);
            }
        }
        producer.stop();
        assert_eq!(received, b"abc");
        assert!(!producer.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn stop_kills_a_live_child_and_is_idempotent() {
        let command = EncoderCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exec sleep 30".to_string()],
        };
        let mut producer = EncoderProducer::spawn(&command, Arc::new(Broadcaster::default())).unwrap();
        assert!(producer.is_running());

        let started = std::time::Instant::now();
        producer.stop();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!producer.is_running());
        assert!(producer.child.is_none());

        producer.stop();
        assert!(!producer.is_running());
    }

    #[test]
    fn spawn_reports_missing_program() {
        let command = EncoderCommand {
            program: "definitely-not-an-encoder-binary".to_string(),
            args: Vec::new(),
        };
        assert!(EncoderProducer::spawn(&command, Arc::new(Broadcaster::default())).is_err());
    }

    #[test]
    fn parses_avfoundation_listing() {
        let listing = "\
[AVFoundation indev @ 0x7f] AVFoundation video devices:
[AVFoundation indev @ 0x7f] [0] FaceTime HD Camera
[AVFoundation indev @ 0x7f] AVFoundation audio devices:
[AVFoundation indev @ 0x7f] [0] BlackHole 2ch
[AVFoundation indev @ 0x7f] [1] MacBook Pro Microphone
[in#0 @ 0x7f] Error opening input: Input/output error
";
        assert_eq!(
            parse_avfoundation_audio_devices(listing),
            vec!["BlackHole 2ch".to_string(), "MacBook Pro Microphone".to_string()]
        );
    }

    #[test]
    fn parse_without_audio_section_is_empty() {
        assert!(parse_avfoundation_audio_devices("nothing here").is_empty());
    }
}
