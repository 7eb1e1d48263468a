use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use tokio::sync::{mpsc, watch};

use super::{ConnectionState, Interrupt, Notification};
use crate::camera::{CameraClient, CameraError};
use crate::commands::{CameraTarget, SocketCommand};
use crate::discovery::DiscoveredDevice;
use crate::transport::Transport;

/// Owns the camera control connection and its state.
///
/// Commands run one at a time in arrival order. The camera we are connected
/// to is published on `authorized` so the image server accepts its uploads.
pub struct SocketWorker<T> {
    client: CameraClient<T>,
    state: ConnectionState,
    endpoint: Option<SocketAddr>,
    authorized: watch::Sender<Option<IpAddr>>,
    devices: watch::Receiver<Vec<DiscoveredDevice>>,
    notify: mpsc::Sender<Notification>,
}

impl<T> SocketWorker<T>
where
    T: Transport<Target = SocketAddr, Error = CameraError> + 'static,
{
    pub fn new(
        transport: T,
        authorized: watch::Sender<Option<IpAddr>>,
        devices: watch::Receiver<Vec<DiscoveredDevice>>,
        notify: mpsc::Sender<Notification>,
    ) -> Self {
        Self {
            client: CameraClient::new(transport),
            state: ConnectionState::Disconnected,
            endpoint: None,
            authorized,
            devices,
            notify,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<SocketCommand>, mut stop_rx: mpsc::Receiver<()>) {
        log::info!("Camera socket worker started");

        // Commands that arrived while another one was running
        let mut queued = VecDeque::new();
        let mut inbox_open = true;

        loop {
            let command = match queued.pop_front() {
                Some(command) => command,
                None => tokio::select! {
                    _ = stop_rx.recv() => break,
                    command = commands.recv() => match command {
                        Some(command) => command,
                        None => break,
                    },
                },
            };

            log::debug!("Camera command: {}", command.name());
            let interrupt = {
                let operation = self.handle(command);
                tokio::pin!(operation);
                loop {
                    tokio::select! {
                        _ = &mut operation => break None,
                        _ = stop_rx.recv() => break Some(Interrupt::Stop),
                        next = commands.recv(), if inbox_open => match next {
                            Some(SocketCommand::Disconnect) => break Some(Interrupt::Disconnect),
                            Some(next) => queued.push_back(next),
                            None => inbox_open = false,
                        },
                    }
                }
            };

            match interrupt {
                None => {}
                Some(Interrupt::Stop) => {
                    log::info!("Aborting in-flight camera command");
                    break;
                }
                Some(Interrupt::Disconnect) => {
                    log::info!("Disconnect requested, aborting in-flight camera command");
                    if !queued.is_empty() {
                        log::info!("Dropping {} camera commands queued before the disconnect", queued.len());
                        queued.clear();
                    }
                    self.disconnect().await;
                }
            }
        }

        self.drop_connection().await;
        log::info!("Camera socket worker stopped");
    }

    async fn handle(&mut self, command: SocketCommand) {
        match command {
            SocketCommand::Connect(target) => self.connect(target).await,
            SocketCommand::Disconnect => self.disconnect().await,
            SocketCommand::Ping => {
                if let Err(e) = self.ping().await {
                    self.fail("Ping", e).await;
                }
            }
            SocketCommand::GetConfig => self.fetch_config().await,
            SocketCommand::SetConfig(config) => {
                if let Err(e) = self.set_config(&config).await {
                    self.fail("Set config", e).await;
                }
            }
            SocketCommand::Control(control) => {
                if let Err(e) = self.control(&control).await {
                    self.fail("Control", e).await;
                }
            }
            SocketCommand::Upgrade(path) => {
                if let Err(e) = self.upgrade(&path).await {
                    self.fail("Upgrade", e).await;
                }
            }
        }
    }

    fn resolve(&self, target: CameraTarget) -> Result<SocketAddr, String> {
        match target {
            CameraTarget::Address(addr) => Ok(addr),
            CameraTarget::Discovered(id) => {
                let devices = self.devices.borrow();
                let device = devices
                    .iter()
                    .find(|d| d.id == id)
                    .ok_or_else(|| format!("Camera '{}' has not been discovered", id))?;
                device
                    .socket_addr()
                    .ok_or_else(|| format!("Camera '{}' announced an invalid address {}", id, device.address()))
            }
        }
    }

    async fn connect(&mut self, target: CameraTarget) {
        let addr = match self.resolve(target) {
            Ok(addr) => addr,
            Err(message) => {
                log::error!("{}", message);
                self.emit(Notification::warning(message)).await;
                self.disconnect().await;
                return;
            }
        };

        // One camera at a time
        if self.state.is_connected() && self.endpoint != Some(addr) {
            self.disconnect().await;
        }

        self.state = ConnectionState::Connecting;
        log::info!("Connecting to camera at {}", addr);

        match self.client.ping(addr).await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                self.endpoint = Some(addr);
                self.authorized.send_replace(Some(addr.ip()));
                log::info!("Connected to camera at {}", addr);
                self.emit(Notification::SocketStatusChanged(true)).await;
                self.fetch_config().await;
            }
            Err(e) => {
                log::error!("Camera connection to {} failed: {}", addr, e);
                self.state = ConnectionState::Disconnected;
                self.endpoint = None;
                self.authorized.send_replace(None);
                self.emit(Notification::warning(format!("Camera connection failed: {}", e))).await;
                self.emit(Notification::SocketStatusChanged(false)).await;
            }
        }
    }

    async fn disconnect(&mut self) {
        log::info!("Disconnecting camera {:?}", self.endpoint);
        let was_connected = self.state != ConnectionState::Disconnected;
        self.drop_connection().await;
        if !was_connected {
            // Still confirm the state to the caller
            self.emit(Notification::SocketStatusChanged(false)).await;
        }
    }

    /// Release the link and revoke the image server's authorization
    async fn drop_connection(&mut self) {
        self.client.close().await;
        self.endpoint = None;
        self.authorized.send_replace(None);

        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnected;
            self.emit(Notification::SocketStatusChanged(false)).await;
        }
    }

    fn endpoint(&self) -> Result<SocketAddr, CameraError> {
        match (self.state, self.endpoint) {
            (ConnectionState::Connected, Some(addr)) => Ok(addr),
            _ => Err(CameraError::NotConnected),
        }
    }

    async fn ping(&mut self) -> Result<(), CameraError> {
        let addr = self.endpoint()?;
        self.client.ping(addr).await
    }

    async fn fetch_config(&mut self) {
        let result = match self.endpoint() {
            Ok(addr) => self.client.get_config(addr).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(config) => {
                log::debug!("Camera config: {}", config);
                self.emit(Notification::SocketConfig(config)).await;
            }
            Err(e) => self.fail("Get config", e).await,
        }
    }

    async fn set_config(&mut self, config: &str) -> Result<(), CameraError> {
        let addr = self.endpoint()?;
        self.client.set_config(addr, config).await
    }

    async fn control(&mut self, control: &str) -> Result<(), CameraError> {
        let addr = self.endpoint()?;
        self.client.control(addr, control).await
    }

    async fn upgrade(&mut self, path: &Path) -> Result<(), CameraError> {
        let addr = self.endpoint()?;
        let firmware = tokio::fs::read(path).await.map_err(|e| {
            CameraError::DecodeError(format!("cannot read firmware {}: {}", path.display(), e))
        })?;
        self.client.upgrade(addr, &firmware).await?;
        log::info!("Firmware {} accepted by camera", path.display());
        Ok(())
    }

    async fn fail(&mut self, action: &str, error: CameraError) {
        log::error!("{} failed: {}", action, error);
        self.emit(Notification::warning(format!("{} failed: {}", action, error))).await;

        if error.is_transport_fault() {
            self.drop_connection().await;
        }
    }

    async fn emit(&mut self, notification: Notification) {
        if self.notify.send(notification).await.is_err() {
            log::debug!("Notification channel closed");
        }
    }
}
