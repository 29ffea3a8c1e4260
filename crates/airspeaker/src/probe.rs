//! Diagnostic client: pull a stream for a while and report what arrived.

use std::io::Read;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Extra time allowed past the sampling window before the request is abandoned.
const PROBE_SLACK: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub status: u16,
    pub content_type: Option<String>,
    pub stream_name: Option<String>,
    pub bytes: u64,
    pub first_byte: Option<Duration>,
    pub elapsed: Duration,
}

impl ProbeReport {
    pub fn kbits_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / 1000.0 / secs
    }

    pub fn summary(&self) -> String {
        let first = self
            .first_byte
            .map(|d| format!("{} ms", d.as_millis()))
            .unwrap_or_else(|| "never".to_string());
        format!(
            "status {} | content-type {} | name {} | {} bytes in {:.1}s ({:.1} kbit/s) | first byte {}",
            self.status,
            self.content_type.as_deref().unwrap_or("-"),
            self.stream_name.as_deref().unwrap_or("-"),
            self.bytes,
            self.elapsed.as_secs_f64(),
            self.kbits_per_sec(),
            first,
        )
    }
}

/// GET `url` and read the body for `duration`.
pub fn probe_stream(url: &str, duration: Duration) -> Result<ProbeReport> {
    let started = Instant::now();
    let resp = ureq::get(url)
        .config()
        .timeout_per_call(Some(duration + PROBE_SLACK))
        .build()
        .call()
        .with_context(|| format!("GET {url}"))?;

    let header = |name: &str| {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    let status = resp.status().as_u16();
    let content_type = header("content-type");
    let stream_name = header("icy-name");

    let (_, body) = resp.into_parts();
    let mut reader = body.into_reader();
    let mut buf = [0u8; 4096];
    let mut bytes = 0u64;
    let mut first_byte = None;
    while started.elapsed() < duration {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if first_byte.is_none() {
                    first_byte = Some(started.elapsed());
                }
                bytes += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "probe: read ended");
                break;
            }
        }
    }

    let report = ProbeReport {
        status,
        content_type,
        stream_name,
        bytes,
        first_byte,
        elapsed: started.elapsed(),
    };
    tracing::info!(url = %url, bytes = report.bytes, "probe: finished");
    Ok(report)
}
