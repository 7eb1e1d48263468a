use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPortType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};

use super::{Result, SerialError, SerialPortDescriptor};
use crate::transport::Transport;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Descriptions of OS-level virtual Bluetooth serial ports
const BLUETOOTH_MARKERS: &[&str] = &["Bluetooth", "蓝牙"];

/// Port and line settings for one connect call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialTarget {
    pub port_name: String,
    pub baud_rate: u32,
}

impl SerialTarget {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
        }
    }
}

/// Serial line driven through `tokio-serial` (8N1). Reads and writes are
/// bounded by `read_timeout` and can be cancelled by dropping the future.
pub struct SerialInterface {
    port: Option<SerialStream>,
    port_name: Option<String>,
    read_timeout: Duration,
}

impl SerialInterface {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_READ_TIMEOUT)
    }

    pub fn with_timeout(read_timeout: Duration) -> Self {
        Self {
            port: None,
            port_name: None,
            read_timeout,
        }
    }

    /// List serial ports, skipping Bluetooth virtual ports
    pub fn discover_ports() -> Result<Vec<SerialPortDescriptor>> {
        let ports = serialport::available_ports()?;
        let mut descriptors = Vec::new();

        for port in ports {
            let description = match &port.port_type {
                SerialPortType::BluetoothPort => continue,
                SerialPortType::UsbPort(usb_info) => usb_info
                    .product
                    .clone()
                    .or_else(|| usb_info.manufacturer.clone())
                    .unwrap_or_else(|| format!("USB Serial ({:04X}:{:04X})", usb_info.vid, usb_info.pid)),
                SerialPortType::PciPort => "PCI Serial Port".to_string(),
                SerialPortType::Unknown => port.port_name.clone(),
            };

            if is_bluetooth(&description) {
                log::debug!("Skipping bluetooth port {} ({})", port.port_name, description);
                continue;
            }

            descriptors.push(SerialPortDescriptor {
                port_name: port.port_name,
                description,
            });
        }

        Ok(descriptors)
    }

    /// Name of the currently open port
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }
}

pub fn is_bluetooth(description: &str) -> bool {
    BLUETOOTH_MARKERS.iter().any(|marker| description.contains(marker))
}

impl Default for SerialInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SerialInterface {
    type Target = SerialTarget;
    type Error = SerialError;

    async fn open(&mut self, target: &SerialTarget) -> Result<()> {
        self.close().await;

        let port = tokio_serial::new(&target.port_name, target.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", target.port_name, e)))?;

        self.port = Some(port);
        self.port_name = Some(target.port_name.clone());

        log::info!("Opened serial port {} at {} baud", target.port_name, target.baud_rate);
        Ok(())
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("Closed serial port {}", self.port_name.as_deref().unwrap_or("?"));
        }
        self.port_name = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port.as_mut().ok_or(SerialError::NotOpen)?;

        // Half-duplex line: drop anything stale so the next read pairs with this request
        port.clear(ClearBuffer::All)
            .map_err(|e| SerialError::SendFailed(format!("clearing buffers: {}", e)))?;

        let write = async {
            port.write_all(data).await?;
            port.flush().await
        };
        match timeout(self.read_timeout, write).await {
            Ok(Ok(())) => Ok(data.len()),
            Ok(Err(e)) => Err(SerialError::SendFailed(e.to_string())),
            Err(_) => Err(SerialError::Timeout),
        }
    }

    /// Collect up to `max_len` bytes until the read timeout elapses
    async fn recv(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let port = self.port.as_mut().ok_or(SerialError::NotOpen)?;
        let deadline = Instant::now() + self.read_timeout;

        let mut buffer = vec![0u8; max_len];
        let mut total_read = 0;

        while total_read < max_len {
            match timeout_at(deadline, port.read(&mut buffer[total_read..])).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(bytes_read)) => total_read += bytes_read,
                Ok(Err(e)) => return Err(SerialError::IoError(e)),
            }
        }

        buffer.truncate(total_read);
        Ok(buffer)
    }
}
