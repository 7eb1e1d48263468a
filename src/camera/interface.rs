use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{CameraError, Result};
use crate::transport::Transport;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Longest the camera may stall while we are writing one chunk
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const WRITE_CHUNK: usize = 64 * 1024;

/// One TCP connection to the camera's control port
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }

    pub fn with_timeouts(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            stream: None,
            peer: None,
            connect_timeout,
            read_timeout,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Target = SocketAddr;
    type Error = CameraError;

    async fn open(&mut self, target: &SocketAddr) -> Result<()> {
        self.close().await;

        let stream = match timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(CameraError::ConnectFailed(format!("{}: {}", target, e))),
            Err(_) => {
                return Err(CameraError::ConnectFailed(format!(
                    "{}: no answer within {:?}",
                    target, self.connect_timeout
                )))
            }
        };
        stream.set_nodelay(true)?;

        log::debug!("Connected to camera at {}", target);
        self.stream = Some(stream);
        self.peer = Some(*target);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                log::debug!("Camera socket shutdown: {}", e);
            }
            log::debug!("Closed camera connection to {:?}", self.peer);
        }
        self.peer = None;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(CameraError::NotConnected)?;
        let mut sent = 0;
        for chunk in data.chunks(WRITE_CHUNK) {
            match timeout(self.write_timeout, stream.write_all(chunk)).await {
                Ok(Ok(())) => sent += chunk.len(),
                Ok(Err(e)) => return Err(CameraError::SendFailed(e.to_string())),
                Err(_) => {
                    return Err(CameraError::SendFailed(format!(
                        "camera stopped reading after {} of {} bytes",
                        sent,
                        data.len()
                    )))
                }
            }
        }
        Ok(sent)
    }

    /// Empty result means the peer closed its side
    async fn recv(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(CameraError::NotConnected)?;
        let mut buffer = vec![0u8; max_len];
        let n = timeout(self.read_timeout, stream.read(&mut buffer))
            .await
            .map_err(|_| CameraError::RecvTimeout)??;
        buffer.truncate(n);
        Ok(buffer)
    }
}
