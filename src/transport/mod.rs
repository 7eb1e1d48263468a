//! Transport capability shared by the serial peripheral and camera socket drivers.
//!
//! Protocol clients (`serial::WifiProtocol`, `camera::CameraClient`) are generic
//! over this trait so the wire handling can be exercised against scripted
//! transports in tests.

use async_trait::async_trait;

#[async_trait]
pub trait Transport: Send {
    /// What the transport opens: serial port settings or a socket address.
    type Target: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open the underlying handle. A transport that is already open is closed first.
    async fn open(&mut self, target: &Self::Target) -> Result<(), Self::Error>;

    /// Release the handle. Safe to call on a closed transport.
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Write the whole buffer, returns the number of bytes written
    async fn send(&mut self, data: &[u8]) -> Result<usize, Self::Error>;

    /// Read at most `max_len` bytes. An empty vector means the peer closed.
    async fn recv(&mut self, max_len: usize) -> Result<Vec<u8>, Self::Error>;
}
