//! Camera discovery over UDP multicast beacons.

pub mod registry;

pub use registry::{Beacon, DeviceRegistry, DiscoveredDevice};

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::device::Notification;

const MAX_DATAGRAM: usize = 1024;

/// UDP socket bound to `port` with address reuse and broadcast enabled,
/// joined to `group` on `interface`
pub fn bind_multicast(port: u16, group: Ipv4Addr, interface: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;

    if let Err(e) = socket.join_multicast_v4(&group, &interface) {
        // Still useful for broadcast beacons
        log::warn!("Could not join multicast group {} on {}: {}", group, interface, e);
    }

    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

#[derive(Debug, Clone)]
pub struct DiscoveryTiming {
    pub tick: Duration,
    pub recv_window: Duration,
    pub expiry: Duration,
}

impl Default for DiscoveryTiming {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(200),
            recv_window: Duration::from_millis(100),
            expiry: registry::DEFAULT_EXPIRY,
        }
    }
}

pub struct DiscoveryListener {
    socket: UdpSocket,
    registry: DeviceRegistry,
    devices_tx: watch::Sender<Vec<DiscoveredDevice>>,
    notify: mpsc::Sender<Notification>,
    timing: DiscoveryTiming,
}

impl DiscoveryListener {
    pub fn new(
        socket: UdpSocket,
        devices_tx: watch::Sender<Vec<DiscoveredDevice>>,
        notify: mpsc::Sender<Notification>,
        timing: DiscoveryTiming,
    ) -> Self {
        Self {
            socket,
            registry: DeviceRegistry::new(timing.expiry),
            devices_tx,
            notify,
            timing,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(mut self, mut stop_rx: mpsc::Receiver<()>) {
        let mut ticker = interval(self.timing.tick.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffer = [0u8; MAX_DATAGRAM];

        log::info!("Discovery listening on {:?}", self.socket.local_addr());

        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = ticker.tick() => {}
            }

            match timeout(self.timing.recv_window, self.socket.recv_from(&mut buffer)).await {
                Ok(Ok((n, from))) => {
                    self.handle_datagram(&buffer[..n], from);
                    // Drain whatever else is already queued
                    while let Ok((n, from)) = self.socket.try_recv_from(&mut buffer) {
                        self.handle_datagram(&buffer[..n], from);
                    }
                }
                Ok(Err(e)) => log::error!("Discovery receive failed: {}", e),
                Err(_) => {}
            }

            if !self.publish().await {
                break;
            }
        }

        log::info!("Discovery stopped");
    }

    fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        match Beacon::parse(datagram) {
            Ok(beacon) => {
                let id = beacon.uuid.clone();
                if self.registry.observe(beacon, Instant::now()) {
                    log::info!("Discovered camera {} (beacon from {})", id, from);
                } else {
                    log::trace!("Beacon refresh for {} from {}", id, from);
                }
            }
            Err(e) => log::warn!("Ignoring malformed beacon from {}: {}", from, e),
        }
    }

    /// Expire stale entries and report the preferred camera.
    /// Returns false once nobody listens for notifications.
    async fn publish(&mut self) -> bool {
        let expired = self.registry.expire(Instant::now());
        if expired > 0 {
            log::info!("{} camera(s) went silent", expired);
        }

        let devices = self.registry.devices();
        self.devices_tx.send_if_modified(|current| {
            let changed = current.len() != devices.len()
                || current.iter().zip(devices).any(|(a, b)| a.id != b.id || a.address() != b.address());
            // Refresh timestamps regardless, only wake watchers on real changes
            *current = devices.to_vec();
            changed
        });

        match self.registry.best() {
            Some(best) => self
                .notify
                .send(Notification::SocketSearchResult(best.address()))
                .await
                .is_ok(),
            None => true,
        }
    }
}
