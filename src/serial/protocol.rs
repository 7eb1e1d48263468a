use serde::{Deserialize, Serialize};

use super::frame;
use super::{Result, SerialError, SerialTarget};
use crate::transport::Transport;

/// Upper bound for one acknowledgement read
pub const MAX_ACK_LEN: usize = 100;

/// WiFi configuration protocol for the camera's serial peripheral.
/// Each operation is one request/acknowledgement round trip.
pub struct WifiProtocol<T> {
    transport: T,
}

/// Snapshot of the peripheral's WiFi registers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiInfo {
    pub ssid: Option<String>,
    pub password: Option<String>,
    pub connected: Option<bool>,
}

impl<T> WifiProtocol<T>
where
    T: Transport<Target = SerialTarget, Error = SerialError>,
{
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub async fn open(&mut self, target: &SerialTarget) -> Result<()> {
        self.transport.open(target).await
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    async fn round_trip(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        if !self.transport.is_open() {
            return Err(SerialError::NotOpen);
        }

        let written = self.transport.send(request).await?;
        if written != request.len() {
            return Err(SerialError::SendFailed(format!(
                "wrote {} of {} bytes",
                written,
                request.len()
            )));
        }

        self.transport.recv(MAX_ACK_LEN).await
    }

    /// `Ok(None)` when the peripheral answered with an invalid or empty frame
    async fn read_register(&mut self, request: Vec<u8>, what: &str) -> Result<Option<Vec<u8>>> {
        let ack = self.round_trip(&request).await?;
        let data = frame::parse_read_ack(&ack);
        if data.is_empty() {
            log::warn!("get {} error: invalid ack {:02X?}", what, ack);
            return Ok(None);
        }
        Ok(Some(data))
    }

    async fn write_register(&mut self, request: Vec<u8>, what: &str) -> Result<bool> {
        let ack = self.round_trip(&request).await?;
        if !frame::parse_write_ack(&ack) {
            log::warn!("set {} error: invalid ack {:02X?}", what, ack);
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn get_ssid(&mut self) -> Result<Option<String>> {
        let data = self.read_register(frame::get_ssid_frame(), "ssid").await?;
        Ok(data.map(|d| frame::decode_credential(&d)))
    }

    pub async fn set_ssid(&mut self, ssid: &str) -> Result<bool> {
        self.write_register(frame::set_ssid_frame(ssid), "ssid").await
    }

    pub async fn get_password(&mut self) -> Result<Option<String>> {
        let data = self.read_register(frame::get_password_frame(), "password").await?;
        Ok(data.map(|d| frame::decode_credential(&d)))
    }

    pub async fn set_password(&mut self, password: &str) -> Result<bool> {
        self.write_register(frame::set_password_frame(password), "password").await
    }

    pub async fn get_wifi_enable(&mut self) -> Result<Option<bool>> {
        let data = self.read_register(frame::get_wifi_enable_frame(), "wifi enable").await?;
        Ok(data.map(|d| d[0] != 0))
    }

    pub async fn set_wifi_enable(&mut self, enable: bool) -> Result<bool> {
        self.write_register(frame::set_wifi_enable_frame(enable), "wifi enable").await
    }

    pub async fn get_wifi_connect_status(&mut self) -> Result<Option<bool>> {
        let data = self.read_register(frame::get_wifi_status_frame(), "wifi status").await?;
        Ok(data.map(|d| d[0] != 0))
    }

    /// SSID, password and connect status in three round trips
    pub async fn read_wifi_info(&mut self) -> Result<WifiInfo> {
        let ssid = self.get_ssid().await?;
        let password = self.get_password().await?;
        let connected = self.get_wifi_connect_status().await?;
        Ok(WifiInfo {
            ssid,
            password,
            connected,
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::frame::{PASSWORD_REGISTER, SSID_REGISTER, WIFI_STATUS_REGISTER};
    use crate::serial::MockPeripheral;

    async fn open_protocol() -> (WifiProtocol<MockPeripheral>, MockPeripheral) {
        let peripheral = MockPeripheral::new();
        let mut protocol = WifiProtocol::new(peripheral.clone());
        protocol.open(&SerialTarget::new("COM3", 9600)).await.expect("open");
        (protocol, peripheral)
    }

    #[tokio::test]
    async fn test_set_then_get_credentials() {
        let (mut protocol, peripheral) = open_protocol().await;

        assert!(protocol.set_ssid("home-net").await.unwrap());
        assert!(protocol.set_password("hunter22").await.unwrap());
        assert_eq!(protocol.get_ssid().await.unwrap().as_deref(), Some("home-net"));
        assert_eq!(protocol.get_password().await.unwrap().as_deref(), Some("hunter22"));

        let stored = peripheral.registers(SSID_REGISTER, 32);
        assert_eq!(&stored[..8], b"home-net");
        assert!(stored[8..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_wifi_enable_and_status() {
        let (mut protocol, peripheral) = open_protocol().await;

        assert!(protocol.set_wifi_enable(true).await.unwrap());
        assert_eq!(protocol.get_wifi_enable().await.unwrap(), Some(true));
        assert!(protocol.set_wifi_enable(false).await.unwrap());
        assert_eq!(protocol.get_wifi_enable().await.unwrap(), Some(false));

        peripheral.write_registers(WIFI_STATUS_REGISTER, &[1]);
        assert_eq!(protocol.get_wifi_connect_status().await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_read_wifi_info_issues_three_reads() {
        let (mut protocol, peripheral) = open_protocol().await;
        peripheral.write_registers(SSID_REGISTER, b"lab");
        peripheral.write_registers(PASSWORD_REGISTER, b"secret");

        let info = protocol.read_wifi_info().await.unwrap();
        assert_eq!(info.ssid.as_deref(), Some("lab"));
        assert_eq!(info.password.as_deref(), Some("secret"));
        assert_eq!(info.connected, Some(false));

        let frames = peripheral.sent_frames();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f[1] == frame::READ));
    }

    #[tokio::test]
    async fn test_invalid_ack_is_no_data() {
        let (mut protocol, peripheral) = open_protocol().await;

        peripheral.set_corrupt_acks(true);
        assert_eq!(protocol.get_ssid().await.unwrap(), None);
        assert!(!protocol.set_ssid("x").await.unwrap());

        peripheral.set_corrupt_acks(false);
        peripheral.set_silent(true);
        assert_eq!(protocol.get_wifi_connect_status().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_transport_is_unavailable() {
        let (mut protocol, _peripheral) = open_protocol().await;
        protocol.close().await;
        protocol.close().await;
        assert!(!protocol.is_open());
        assert!(matches!(protocol.get_ssid().await, Err(SerialError::NotOpen)));
    }
}
