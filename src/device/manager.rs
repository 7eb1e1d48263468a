use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::port_monitor::{PortScanner, SystemPortScanner};
use super::serial_worker::{SerialTiming, SerialWorker};
use super::socket_worker::SocketWorker;
use super::{DeviceError, Notification, Result};
use crate::camera::{CameraError, CameraServer, TcpTransport};
use crate::commands::{Command, SerialCommand, SocketCommand};
use crate::config::Settings;
use crate::discovery::{self, DiscoveredDevice, DiscoveryListener};
use crate::serial::{SerialError, SerialInterface, SerialTarget};
use crate::transport::Transport;

const COMMAND_QUEUE: usize = 32;
const NOTIFICATION_QUEUE: usize = 256;
const SUBSCRIBER_QUEUE: usize = 1024;

struct WorkerHandle {
    name: &'static str,
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Entry point of the device layer.
///
/// Owns one worker task per transport, routes decoded commands to them and
/// fans their notifications out to every subscriber.
pub struct DriverManagement {
    socket_tx: mpsc::Sender<SocketCommand>,
    serial_tx: mpsc::Sender<SerialCommand>,
    notify_tx: Option<mpsc::Sender<Notification>>,
    events_tx: broadcast::Sender<Notification>,
    workers: Vec<WorkerHandle>,
    forwarder: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

/// Configures the transports before the workers start
pub struct DriverManagementBuilder<S, C> {
    settings: Settings,
    serial_transport: S,
    camera_transport: C,
    scanner: Arc<dyn PortScanner>,
}

impl DriverManagement {
    /// Start with the real serial line and TCP camera link
    pub async fn start(settings: Settings) -> (Self, broadcast::Receiver<Notification>) {
        Self::builder(settings).start().await
    }

    pub fn builder(settings: Settings) -> DriverManagementBuilder<SerialInterface, TcpTransport> {
        DriverManagementBuilder {
            serial_transport: SerialInterface::with_timeout(settings.serial_read_timeout()),
            camera_transport: TcpTransport::with_timeouts(settings.connect_timeout(), settings.read_timeout())
                .with_write_timeout(settings.write_timeout()),
            scanner: Arc::new(SystemPortScanner),
            settings,
        }
    }

    /// Decode one JSON envelope and route it. Invalid envelopes are reported
    /// as a warning and never reach a worker.
    pub async fn handle_message(&self, message: &str) -> Result<()> {
        match Command::parse(message) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => {
                log::error!("Rejected command {}: {}", message.trim(), e);
                self.warn(e.to_string()).await;
                Err(e)
            }
        }
    }

    pub async fn dispatch(&self, command: Command) -> Result<()> {
        log::debug!("Dispatching {}.{}", command.driver(), command.name());
        match command {
            Command::Socket(command) => self
                .socket_tx
                .send(command)
                .await
                .map_err(|_| DeviceError::WorkerStopped("camera socket")),
            Command::Serial(command) => self
                .serial_tx
                .send(command)
                .await
                .map_err(|_| DeviceError::WorkerStopped("serial")),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events_tx.subscribe()
    }

    /// Handle for collaborators that publish their own notifications,
    /// such as an OS WiFi scanner reporting `WifiSsidList`
    pub fn notifier(&self) -> Option<mpsc::Sender<Notification>> {
        self.notify_tx.clone()
    }

    async fn warn(&self, text: String) {
        if let Some(notify) = &self.notify_tx {
            let _ = notify.send(Notification::Warning(text)).await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Stop every worker and wait for them, bounded per worker.
    /// Calling it again is a no-op.
    pub async fn shutdown(&mut self) {
        if self.workers.is_empty() && self.forwarder.is_none() {
            return;
        }
        log::info!("Stopping device workers");

        let workers = std::mem::take(&mut self.workers);
        for worker in &workers {
            let _ = worker.stop_tx.try_send(());
        }
        for mut worker in workers {
            match timeout(self.shutdown_timeout, &mut worker.task).await {
                Ok(Ok(())) => log::debug!("{} worker stopped", worker.name),
                Ok(Err(e)) => log::error!("{} worker ended abnormally: {}", worker.name, e),
                Err(_) => {
                    log::warn!("{} worker did not stop within {:?}, aborting", worker.name, self.shutdown_timeout);
                    worker.task.abort();
                }
            }
        }

        // Closing our sender lets the forwarder drain and finish
        self.notify_tx = None;
        if let Some(mut forwarder) = self.forwarder.take() {
            if timeout(self.shutdown_timeout, &mut forwarder).await.is_err() {
                // External notifier handles are still alive
                forwarder.abort();
            }
        }
        log::info!("Device workers stopped");
    }
}

impl Drop for DriverManagement {
    fn drop(&mut self) {
        for worker in self.workers.drain(..) {
            let _ = worker.stop_tx.try_send(());
            worker.task.abort();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl<S, C> DriverManagementBuilder<S, C>
where
    S: Transport<Target = SerialTarget, Error = SerialError> + 'static,
    C: Transport<Target = std::net::SocketAddr, Error = CameraError> + 'static,
{
    pub fn serial_transport<U>(self, transport: U) -> DriverManagementBuilder<U, C> {
        DriverManagementBuilder {
            settings: self.settings,
            serial_transport: transport,
            camera_transport: self.camera_transport,
            scanner: self.scanner,
        }
    }

    pub fn camera_transport<U>(self, transport: U) -> DriverManagementBuilder<S, U> {
        DriverManagementBuilder {
            settings: self.settings,
            serial_transport: self.serial_transport,
            camera_transport: transport,
            scanner: self.scanner,
        }
    }

    pub fn port_scanner(mut self, scanner: impl PortScanner) -> Self {
        self.scanner = Arc::new(scanner);
        self
    }

    /// Spawn the workers. The returned receiver sees every notification,
    /// including the ones emitted while starting up.
    pub async fn start(self) -> (DriverManagement, broadcast::Receiver<Notification>) {
        let settings = self.settings;

        let (notify_tx, mut notify_rx) = mpsc::channel::<Notification>(NOTIFICATION_QUEUE);
        let (events_tx, events_rx) = broadcast::channel(SUBSCRIBER_QUEUE);
        let (authorized_tx, authorized_rx) = watch::channel::<Option<IpAddr>>(None);
        let (devices_tx, devices_rx) = watch::channel::<Vec<DiscoveredDevice>>(Vec::new());

        let forward_tx = events_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notify_rx.recv().await {
                log::trace!("Notification: {:?}", notification);
                // No subscribers is fine
                let _ = forward_tx.send(notification);
            }
        });

        let mut workers = Vec::new();

        let (socket_tx, socket_rx) = mpsc::channel(COMMAND_QUEUE);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let worker = SocketWorker::new(self.camera_transport, authorized_tx, devices_rx, notify_tx.clone());
        workers.push(WorkerHandle {
            name: "camera socket",
            stop_tx,
            task: tokio::spawn(worker.run(socket_rx, stop_rx)),
        });

        let (serial_tx, serial_rx) = mpsc::channel(COMMAND_QUEUE);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let timing = SerialTiming {
            scan_interval: settings.serial_scan_interval(),
            wifi_reconfigure_delay: settings.wifi_reconfigure_delay(),
        };
        let worker = SerialWorker::new(self.serial_transport, self.scanner, timing, notify_tx.clone());
        workers.push(WorkerHandle {
            name: "serial",
            stop_tx,
            task: tokio::spawn(worker.run(serial_rx, stop_rx)),
        });

        if settings.camera_server_enabled {
            match CameraServer::bind(
                &settings.camera_server_bind,
                authorized_rx,
                notify_tx.clone(),
                settings.upload_limits(),
            )
            .await
            {
                Ok(server) => {
                    let (stop_tx, stop_rx) = mpsc::channel(1);
                    workers.push(WorkerHandle {
                        name: "image server",
                        stop_tx,
                        task: tokio::spawn(server.run(stop_rx)),
                    });
                }
                Err(e) => {
                    log::error!("Failed to start image server on {}: {}", settings.camera_server_bind, e);
                    let _ = notify_tx
                        .send(Notification::warning(format!("Image server unavailable: {}", e)))
                        .await;
                }
            }
        }

        if settings.discovery_enabled {
            match discovery::bind_multicast(
                settings.discovery_port,
                settings.discovery_group,
                settings.discovery_interface,
            ) {
                Ok(socket) => {
                    let listener =
                        DiscoveryListener::new(socket, devices_tx, notify_tx.clone(), settings.discovery_timing());
                    let (stop_tx, stop_rx) = mpsc::channel(1);
                    workers.push(WorkerHandle {
                        name: "discovery",
                        stop_tx,
                        task: tokio::spawn(listener.run(stop_rx)),
                    });
                }
                Err(e) => {
                    log::error!("Failed to start discovery on port {}: {}", settings.discovery_port, e);
                    let _ = notify_tx
                        .send(Notification::warning(format!("Camera discovery unavailable: {}", e)))
                        .await;
                }
            }
        }

        log::info!("Started {} device workers", workers.len());

        let manager = DriverManagement {
            socket_tx,
            serial_tx,
            notify_tx: Some(notify_tx),
            events_tx,
            workers,
            forwarder: Some(forwarder),
            shutdown_timeout: settings.shutdown_timeout(),
        };
        (manager, events_rx)
    }
}
