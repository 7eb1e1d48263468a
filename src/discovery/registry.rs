use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(20);

/// Announcement a camera multicasts while it is up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub ip: String,
    pub port: u16,
    #[serde(alias = "id")]
    pub uuid: String,
}

impl Beacon {
    pub fn parse(datagram: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(datagram)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredDevice {
    pub ip: String,
    pub port: u16,
    pub id: String,
    #[serde(skip)]
    pub last_seen: Instant,
    pub seen_at: DateTime<Utc>,
}

impl DiscoveredDevice {
    /// `ip:port` as shown to the user
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.ip.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }
}

/// Cameras heard recently, one entry per id, kept sorted by id
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Vec<DiscoveredDevice>,
    expiry: Duration,
}

impl DeviceRegistry {
    pub fn new(expiry: Duration) -> Self {
        Self {
            devices: Vec::new(),
            expiry,
        }
    }

    /// Record a beacon; returns true for an id not seen before
    pub fn observe(&mut self, beacon: Beacon, now: Instant) -> bool {
        let device = DiscoveredDevice {
            ip: beacon.ip,
            port: beacon.port,
            id: beacon.uuid,
            last_seen: now,
            seen_at: Utc::now(),
        };

        let is_new = match self.devices.iter_mut().find(|d| d.id == device.id) {
            Some(existing) => {
                *existing = device;
                false
            }
            None => {
                self.devices.push(device);
                true
            }
        };
        self.devices.sort_by(|a, b| a.id.cmp(&b.id));
        is_new
    }

    /// Drop entries not refreshed within the expiry window
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.devices.len();
        let expiry = self.expiry;
        self.devices
            .retain(|d| now.saturating_duration_since(d.last_seen) <= expiry);
        before - self.devices.len()
    }

    /// Entry with the lowest id
    pub fn best(&self) -> Option<&DiscoveredDevice> {
        self.devices.first()
    }

    pub fn find(&self, id: &str) -> Option<&DiscoveredDevice> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRY)
    }
}
