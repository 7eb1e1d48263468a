use std::net::SocketAddr;

use super::frame::{self, Assembly, FrameAssembler};
use super::{CameraError, Result};
use crate::transport::Transport;

pub const PING_PATH: &str = "/camera/ping";
pub const CONFIG_PATH: &str = "/camera/config";
pub const CONTROL_PATH: &str = "/camera/control";
pub const UPGRADE_PATH: &str = "/camera/upgrade";

const RECV_CHUNK: usize = 1024;
/// Responses carry config JSON at most
const MAX_RESPONSE_BODY: usize = 1024 * 1024;

/// Request/response client for the camera's control endpoints.
///
/// Every call opens a fresh connection, sends one request, reads the reply
/// and closes the connection again, whatever the outcome.
pub struct CameraClient<T> {
    transport: T,
}

impl<T> CameraClient<T>
where
    T: Transport<Target = SocketAddr, Error = CameraError>,
{
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub async fn ping(&mut self, addr: SocketAddr) -> Result<()> {
        self.request(addr, &frame::build_get_request(PING_PATH)).await?;
        Ok(())
    }

    /// Current camera configuration as JSON text
    pub async fn get_config(&mut self, addr: SocketAddr) -> Result<String> {
        let body = self.request(addr, &frame::build_get_request(CONFIG_PATH)).await?;
        String::from_utf8(body).map_err(|e| CameraError::DecodeError(format!("config is not UTF-8: {}", e)))
    }

    pub async fn set_config(&mut self, addr: SocketAddr, config: &str) -> Result<()> {
        self.request(addr, &frame::build_post_json(CONFIG_PATH, config)).await?;
        Ok(())
    }

    pub async fn control(&mut self, addr: SocketAddr, command: &str) -> Result<()> {
        self.request(addr, &frame::build_post_json(CONTROL_PATH, command)).await?;
        Ok(())
    }

    pub async fn upgrade(&mut self, addr: SocketAddr, firmware: &[u8]) -> Result<()> {
        log::info!("Uploading {} bytes of firmware to {}", firmware.len(), addr);
        self.request(addr, &frame::build_post_stream(UPGRADE_PATH, firmware)).await?;
        Ok(())
    }

    /// Release a connection left behind by an interrupted call
    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    async fn request(&mut self, addr: SocketAddr, request: &[u8]) -> Result<Vec<u8>> {
        self.transport.open(&addr).await?;
        let result = self.exchange(request).await;
        self.transport.close().await;

        if let Err(e) = &result {
            log::warn!("Camera request to {} failed: {}", addr, e);
        }
        result
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let written = self.transport.send(request).await?;
        if written != request.len() {
            return Err(CameraError::SendFailed(format!("wrote {} of {} bytes", written, request.len())));
        }

        let mut response = Vec::new();
        let mut assembler = FrameAssembler::new(MAX_RESPONSE_BODY);
        let mut timed_out = false;

        loop {
            let chunk = match self.transport.recv(RECV_CHUNK).await {
                Ok(chunk) => chunk,
                Err(CameraError::RecvTimeout) => {
                    timed_out = true;
                    break;
                }
                Err(e) => return Err(e),
            };
            if chunk.is_empty() {
                break;
            }
            response.extend_from_slice(&chunk);

            match assembler.push(&chunk) {
                Ok(Assembly::Complete) => break,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Camera response framing: {}", e);
                    break;
                }
            }
        }

        if response.is_empty() && timed_out {
            return Err(CameraError::RecvTimeout);
        }

        match frame::parse_response(&response) {
            (true, body) => Ok(body),
            (false, _) => {
                let status = frame::FrameHeader::parse(&response)
                    .map(|h| h.start_line)
                    .unwrap_or_else(|| format!("{} unframed bytes", response.len()));
                Err(CameraError::ProtocolError(format!("unexpected response: {}", status)))
            }
        }
    }
}
