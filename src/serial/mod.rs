pub mod frame;
pub mod interface;
pub mod mock;
pub mod protocol;

pub use interface::{SerialInterface, SerialTarget};
pub use mock::MockPeripheral;
pub use protocol::{WifiInfo, WifiProtocol};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortDescriptor {
    pub port_name: String,
    pub description: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Serial port is not open")]
    NotOpen,

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
