pub mod manager;
pub mod models;
pub mod port_monitor;
pub mod serial_worker;
pub mod socket_worker;

pub use manager::{DriverManagement, DriverManagementBuilder};
pub use models::*;
pub use port_monitor::{PortScanner, SystemPortScanner};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Invalid command message: {0}")]
    Decode(String),

    #[error("Unknown driver '{0}'")]
    UnknownDriver(String),

    #[error("Unknown command '{command}' for driver '{driver}'")]
    UnknownCommand { driver: String, command: String },

    #[error("Command '{command}' is missing field '{field}'")]
    MissingField { command: String, field: &'static str },

    #[error("Command '{command}' has an invalid '{field}': {reason}")]
    InvalidField {
        command: String,
        field: &'static str,
        reason: String,
    },

    #[error("The {0} worker is not running")]
    WorkerStopped(&'static str),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),

    #[error("Camera communication error: {0}")]
    CameraError(#[from] crate::camera::CameraError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Why a worker abandoned the command it was running
enum Interrupt {
    Stop,
    Disconnect,
}
