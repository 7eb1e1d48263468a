use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use super::port_monitor::{resolve_port, PortListTracker, PortScanner};
use super::{ConnectionState, Interrupt, Notification};
use crate::commands::SerialCommand;
use crate::serial::{SerialError, SerialPortDescriptor, SerialTarget, WifiInfo, WifiProtocol};
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct SerialTiming {
    pub scan_interval: Duration,
    /// Pause between disabling WiFi and writing new credentials
    pub wifi_reconfigure_delay: Duration,
}

impl Default for SerialTiming {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(2),
            wifi_reconfigure_delay: Duration::from_secs(1),
        }
    }
}

enum Event {
    Scan,
    Command(SerialCommand),
}

/// Owns the WiFi peripheral's serial line and keeps the port list fresh
pub struct SerialWorker<T> {
    protocol: WifiProtocol<T>,
    state: ConnectionState,
    scanner: Arc<dyn PortScanner>,
    tracker: PortListTracker,
    timing: SerialTiming,
    notify: mpsc::Sender<Notification>,
}

fn is_transport_fault(error: &SerialError) -> bool {
    !matches!(error, SerialError::PortNotFound(_))
}

impl<T> SerialWorker<T>
where
    T: Transport<Target = SerialTarget, Error = SerialError> + 'static,
{
    pub fn new(
        transport: T,
        scanner: Arc<dyn PortScanner>,
        timing: SerialTiming,
        notify: mpsc::Sender<Notification>,
    ) -> Self {
        Self {
            protocol: WifiProtocol::new(transport),
            state: ConnectionState::Disconnected,
            scanner,
            tracker: PortListTracker::new(),
            timing,
            notify,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<SerialCommand>, mut stop_rx: mpsc::Receiver<()>) {
        log::info!("Serial worker started");

        let mut scan = interval(self.timing.scan_interval.max(Duration::from_millis(1)));
        scan.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Commands that arrived while another one was running
        let mut queued = VecDeque::new();
        let mut inbox_open = true;

        loop {
            let event = match queued.pop_front() {
                Some(command) => Event::Command(command),
                None => tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = scan.tick() => Event::Scan,
                    command = commands.recv() => match command {
                        Some(command) => Event::Command(command),
                        None => break,
                    },
                },
            };

            let command = match event {
                Event::Scan => {
                    self.scan_ports().await;
                    continue;
                }
                Event::Command(command) => command,
            };

            log::debug!("Serial command: {}", command.name());
            let interrupt = {
                let operation = self.handle(command);
                tokio::pin!(operation);
                loop {
                    tokio::select! {
                        _ = &mut operation => break None,
                        _ = stop_rx.recv() => break Some(Interrupt::Stop),
                        next = commands.recv(), if inbox_open => match next {
                            Some(SerialCommand::Disconnect) => break Some(Interrupt::Disconnect),
                            Some(next) => queued.push_back(next),
                            None => inbox_open = false,
                        },
                    }
                }
            };

            match interrupt {
                None => {}
                Some(Interrupt::Stop) => {
                    log::info!("Aborting in-flight serial command");
                    break;
                }
                Some(Interrupt::Disconnect) => {
                    log::info!("Disconnect requested, aborting in-flight serial command");
                    if !queued.is_empty() {
                        log::info!("Dropping {} serial commands queued before the disconnect", queued.len());
                        queued.clear();
                    }
                    self.disconnect().await;
                }
            }
        }

        self.release().await;
        log::info!("Serial worker stopped");
    }

    async fn scan_ports(&mut self) {
        let scanner = Arc::clone(&self.scanner);
        let ports = match tokio::task::spawn_blocking(move || scanner.scan()).await {
            Ok(Ok(ports)) => ports,
            Ok(Err(e)) => {
                log::warn!("Serial port scan failed: {}", e);
                return;
            }
            Err(e) => {
                log::error!("Serial port scan task failed: {}", e);
                return;
            }
        };

        if let Some(ports) = self.tracker.update(ports) {
            self.emit(Notification::SerialListChanged(ports)).await;
        }
    }

    async fn handle(&mut self, command: SerialCommand) {
        let label = command_label(&command);
        let result = match command {
            SerialCommand::Connect { com, baud } => {
                self.connect(&com, baud).await;
                return;
            }
            SerialCommand::Disconnect => {
                self.disconnect().await;
                return;
            }
            SerialCommand::ConnectWifi { ssid, password } => self.connect_wifi(&ssid, &password).await,
            SerialCommand::DisconnectWifi => self.disconnect_wifi().await,
            SerialCommand::GetSsid => self.read_ssid().await,
            SerialCommand::GetPassword => self.read_password().await,
            SerialCommand::GetWifiStatus => self.read_wifi_status().await,
        };

        if let Err(e) = result {
            self.fail(label, e).await;
        }
    }

    async fn connect(&mut self, com: &str, baud: u32) {
        if self.protocol.is_open() {
            self.protocol.close().await;
        }

        let port_name = resolve_port(self.known_ports(), com);
        self.state = ConnectionState::Connecting;
        log::info!("Connecting to serial peripheral on {} ({}) at {} baud", port_name, com, baud);

        match self.protocol.open(&SerialTarget::new(port_name, baud)).await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                self.emit(Notification::SerialStatusChanged(true)).await;

                match self.protocol.read_wifi_info().await {
                    Ok(info) => self.emit(Notification::WifiInfo(info)).await,
                    Err(e) => self.fail("Read WiFi info", e).await,
                }
            }
            Err(e) => {
                log::error!("Serial connection failed: {}", e);
                self.state = ConnectionState::Disconnected;
                self.emit(Notification::warning(format!("Serial connection failed: {}", e))).await;
                self.emit(Notification::SerialStatusChanged(false)).await;
            }
        }
    }

    fn known_ports(&self) -> &[SerialPortDescriptor] {
        self.tracker.ports()
    }

    async fn disconnect(&mut self) {
        let was_connected = self.state != ConnectionState::Disconnected;
        self.release().await;
        if !was_connected {
            self.emit(Notification::SerialStatusChanged(false)).await;
        }
    }

    /// Close the port; reports the transition if one happened
    async fn release(&mut self) {
        self.protocol.close().await;
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnected;
            self.emit(Notification::SerialStatusChanged(false)).await;
        }
    }

    fn ensure_connected(&self) -> Result<(), SerialError> {
        if self.state.is_connected() && self.protocol.is_open() {
            Ok(())
        } else {
            Err(SerialError::NotOpen)
        }
    }

    async fn connect_wifi(&mut self, ssid: &str, password: &str) -> Result<(), SerialError> {
        self.ensure_connected()?;
        log::info!("Configuring peripheral WiFi for '{}'", ssid);

        let disabled = self.protocol.set_wifi_enable(false).await?;
        tokio::time::sleep(self.timing.wifi_reconfigure_delay).await;
        let ssid_set = self.protocol.set_ssid(ssid).await?;
        let password_set = self.protocol.set_password(password).await?;
        let enabled = self.protocol.set_wifi_enable(true).await?;

        if !(disabled && ssid_set && password_set && enabled) {
            self.emit(Notification::warning("The peripheral rejected part of the WiFi configuration"))
                .await;
        }
        Ok(())
    }

    async fn disconnect_wifi(&mut self) -> Result<(), SerialError> {
        self.ensure_connected()?;
        if !self.protocol.set_wifi_enable(false).await? {
            self.emit(Notification::warning("The peripheral did not acknowledge disabling WiFi"))
                .await;
        }
        Ok(())
    }

    async fn read_ssid(&mut self) -> Result<(), SerialError> {
        self.ensure_connected()?;
        let ssid = self.protocol.get_ssid().await?;
        self.report(WifiInfo { ssid, ..WifiInfo::default() }).await;
        Ok(())
    }

    async fn read_password(&mut self) -> Result<(), SerialError> {
        self.ensure_connected()?;
        let password = self.protocol.get_password().await?;
        self.report(WifiInfo { password, ..WifiInfo::default() }).await;
        Ok(())
    }

    async fn read_wifi_status(&mut self) -> Result<(), SerialError> {
        self.ensure_connected()?;
        let connected = self.protocol.get_wifi_connect_status().await?;
        self.report(WifiInfo { connected, ..WifiInfo::default() }).await;
        Ok(())
    }

    async fn report(&mut self, info: WifiInfo) {
        if info == WifiInfo::default() {
            self.emit(Notification::warning("The peripheral returned no data")).await;
        } else {
            self.emit(Notification::WifiInfo(info)).await;
        }
    }

    async fn fail(&mut self, action: &str, error: SerialError) {
        log::error!("{} failed: {}", action, error);
        self.emit(Notification::warning(format!("{} failed: {}", action, error))).await;

        if is_transport_fault(&error) {
            self.release().await;
        }
    }

    async fn emit(&mut self, notification: Notification) {
        if self.notify.send(notification).await.is_err() {
            log::debug!("Notification channel closed");
        }
    }
}

fn command_label(command: &SerialCommand) -> &'static str {
    match command {
        SerialCommand::Connect { .. } => "Connect",
        SerialCommand::Disconnect => "Disconnect",
        SerialCommand::ConnectWifi { .. } => "Configure WiFi",
        SerialCommand::DisconnectWifi => "Disable WiFi",
        SerialCommand::GetSsid => "Read SSID",
        SerialCommand::GetPassword => "Read password",
        SerialCommand::GetWifiStatus => "Read WiFi status",
    }
}
