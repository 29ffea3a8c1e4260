//! mDNS discovery of Cast receivers (`_googlecast._tcp.local.`).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent};

use super::{DeviceDescriptor, DeviceDiscovery};

const CAST_SERVICE: &str = "_googlecast._tcp.local.";

/// Browses the local network for a fixed window and returns everything resolved.
#[derive(Debug, Default, Clone)]
pub struct MdnsDiscovery;

impl MdnsDiscovery {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceDiscovery for MdnsDiscovery {
    fn discover(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
        let daemon = ServiceDaemon::new().context("mdns: failed to start daemon")?;
        let receiver = daemon
            .browse(CAST_SERVICE)
            .context("mdns: browse failed")?;
        tracing::info!(timeout_ms = timeout.as_millis() as u64, "mdns: browsing for {CAST_SERVICE}");

        let deadline = Instant::now() + timeout;
        let mut found: HashMap<String, DeviceDescriptor> = HashMap::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let event = match receiver.recv_timeout(remaining) {
                Ok(event) => event,
                Err(_) => break,
            };
            let ServiceEvent::ServiceResolved(info) = event else {
                continue;
            };
            let record = ServiceRecord {
                fullname: info.get_fullname().to_string(),
                id: txt_value(info.get_property("id").map(|p| p.val_str().to_string()), "id"),
                friendly_name: txt_value(
                    info.get_property("fn").map(|p| p.val_str().to_string()),
                    "fn",
                ),
                model_name: txt_value(
                    info.get_property("md").map(|p| p.val_str().to_string()),
                    "md",
                ),
                ipv4: info.get_addresses().iter().find_map(|ip| match ip {
                    mdns_sd::ScopedIp::V4(v4) => Some(*v4.addr()),
                    _ => None,
                }),
                port: info.get_port(),
            };
            match device_from_record(record) {
                Some(device) => {
                    tracing::info!(
                        cast_id = %device.id,
                        name = %device.friendly_name,
                        host = %device.host,
                        "mdns: receiver resolved"
                    );
                    found.insert(device.id.clone(), device);
                }
                None => tracing::warn!("mdns: receiver resolved without IPv4"),
            }
        }

        if let Ok(status) = daemon.shutdown() {
            let _ = status.recv_timeout(Duration::from_millis(500));
        }
        Ok(sorted_devices(found.into_values().collect()))
    }
}

/// Fields pulled off one resolved mDNS service.
#[derive(Debug, Clone, Default)]
struct ServiceRecord {
    fullname: String,
    id: Option<String>,
    friendly_name: Option<String>,
    model_name: Option<String>,
    ipv4: Option<Ipv4Addr>,
    port: u16,
}

/// Some responders repeat the key inside the value (`id=abc`).
fn txt_value(raw: Option<String>, key: &str) -> Option<String> {
    let raw = raw?;
    let prefix = format!("{key}=");
    let value = raw.strip_prefix(&prefix).unwrap_or(&raw).trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn device_from_record(record: ServiceRecord) -> Option<DeviceDescriptor> {
    let ip = record.ipv4?;
    let instance = record
        .fullname
        .strip_suffix(&format!(".{CAST_SERVICE}"))
        .unwrap_or(&record.fullname)
        .to_string();
    let id = record.id.unwrap_or_else(|| instance.clone());
    let friendly_name = record.friendly_name.unwrap_or(instance);
    Some(DeviceDescriptor {
        id,
        friendly_name,
        model_name: record.model_name.unwrap_or_default(),
        host: ip.to_string(),
        port: record.port,
    })
}

fn sorted_devices(mut devices: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
    devices.sort_by(|a, b| {
        a.friendly_name
            .to_lowercase()
            .cmp(&b.friendly_name.to_lowercase())
            .then_with(|| a.id.cmp(&b.id))
    });
    devices
}
