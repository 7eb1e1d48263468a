pub mod frame;
pub mod interface;
pub mod protocol;
pub mod server;

pub use interface::TcpTransport;
pub use protocol::CameraClient;
pub use server::{CameraServer, UploadLimits};

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("Camera is not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive timed out")]
    RecvTimeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CameraError {
    /// Errors that leave the camera link unusable
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            CameraError::NotConnected
                | CameraError::ConnectFailed(_)
                | CameraError::SendFailed(_)
                | CameraError::RecvTimeout
                | CameraError::IoError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CameraError>;
