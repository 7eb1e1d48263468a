//! Push-style image receiver.
//!
//! The camera connects to us and uploads one image per connection as
//! `POST /camera/image`. Only the camera we are currently connected to is
//! served; anyone else is dropped without a reply.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use super::frame::{self, Assembly, FrameAssembler, FrameError};
use crate::device::Notification;

pub const IMAGE_REQUEST_LINE: &str = "POST /camera/image HTTP/1.1";
const RECV_CHUNK: usize = 40960;

/// Bounds applied to a single upload
#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub header_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_body: usize,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            header_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_millis(300),
            max_body: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("no complete header within {0:?}")]
    HeaderTimeout(Duration),

    #[error("unexpected request line '{0}'")]
    WrongRequest(String),

    #[error("{0}")]
    Framing(#[from] FrameError),

    #[error("Content-Length must be positive")]
    EmptyBody,

    #[error("body stalled after {received} of {expected} bytes")]
    ShortBody { received: usize, expected: usize },

    #[error("Content-MD5 mismatch")]
    DigestMismatch,

    #[error("multipart body has no complete part for boundary '{0}'")]
    MalformedMultipart(String),

    #[error("multipart content type without a boundary")]
    MissingBoundary,

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

async fn read_chunk<S>(stream: &mut S, buffer: &mut [u8], limit: Duration) -> Option<io::Result<usize>>
where
    S: AsyncRead + Unpin,
{
    timeout(limit, stream.read(buffer)).await.ok()
}

/// Read one image upload from `stream`
pub async fn read_upload<S>(stream: &mut S, limits: &UploadLimits) -> Result<Vec<u8>, UploadError>
where
    S: AsyncRead + Unpin,
{
    let mut assembler = FrameAssembler::new(limits.max_body);
    let mut buffer = vec![0u8; RECV_CHUNK];

    loop {
        let waiting_for_header = assembler.header().is_none();
        let limit = if waiting_for_header {
            limits.header_timeout
        } else {
            limits.idle_timeout
        };

        let n = match read_chunk(stream, &mut buffer, limit).await {
            Some(result) => result?,
            None if waiting_for_header => return Err(UploadError::HeaderTimeout(limit)),
            None => return Err(short_body(&assembler)),
        };
        if n == 0 {
            return match assembler.header() {
                None => Err(UploadError::HeaderTimeout(limit)),
                Some(_) => Err(short_body(&assembler)),
            };
        }

        let progress = assembler.push(&buffer[..n]);

        // Validate the request line as soon as the header is in
        if waiting_for_header {
            if let Some(header) = assembler.header() {
                if header.start_line != IMAGE_REQUEST_LINE {
                    return Err(UploadError::WrongRequest(header.start_line.clone()));
                }
                if assembler.expected_len() == Some(0) {
                    return Err(UploadError::EmptyBody);
                }
            }
        }

        match progress? {
            Assembly::Complete => break,
            Assembly::Header | Assembly::Body { .. } => {}
        }
    }

    if let Some(expected) = assembler.header().and_then(|h| h.header("Content-MD5")) {
        if !expected.eq_ignore_ascii_case(&frame::md5_hex(assembler.body())) {
            return Err(UploadError::DigestMismatch);
        }
    }

    let content_type = assembler.header().and_then(|h| h.header("Content-Type")).map(str::to_string);
    let body = assembler.into_body();
    match content_type {
        Some(content_type) if is_multipart(&content_type) => {
            let boundary = frame::multipart_boundary(&content_type).ok_or(UploadError::MissingBoundary)?;
            frame::extract_multipart_part(&body, boundary)
                .ok_or_else(|| UploadError::MalformedMultipart(boundary.to_string()))
        }
        _ => Ok(body),
    }
}

fn is_multipart(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|media_type| media_type.trim().eq_ignore_ascii_case("multipart/form-data"))
}

fn short_body(assembler: &FrameAssembler) -> UploadError {
    UploadError::ShortBody {
        received: assembler.body().len(),
        expected: assembler.expected_len().unwrap_or(0),
    }
}

/// Read an upload and answer it: 200 with the image, or 400 with nothing
pub async fn serve_upload<S>(stream: &mut S, limits: &UploadLimits) -> Option<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reply, image) = match read_upload(stream, limits).await {
        Ok(image) => (frame::RESPONSE_OK, Some(image)),
        Err(UploadError::IoError(e)) => {
            log::warn!("Image upload aborted: {}", e);
            return None;
        }
        Err(e) => {
            log::warn!("Rejected image upload: {}", e);
            (frame::RESPONSE_BAD_REQUEST, None)
        }
    };

    if let Err(e) = stream.write_all(reply).await {
        log::debug!("Could not send upload reply: {}", e);
    }
    let _ = stream.shutdown().await;
    image
}

/// Resolves once `peer` is no longer the authorized camera
async fn revoked(authorized: &mut watch::Receiver<Option<IpAddr>>, peer: IpAddr) {
    loop {
        if *authorized.borrow_and_update() != Some(peer) {
            return;
        }
        if authorized.changed().await.is_err() {
            // Sender gone: nobody can revoke any more
            std::future::pending::<()>().await;
        }
    }
}

pub struct CameraServer {
    listener: TcpListener,
    authorized: watch::Receiver<Option<IpAddr>>,
    notify: mpsc::Sender<Notification>,
    limits: UploadLimits,
}

impl CameraServer {
    pub async fn bind(
        addr: &str,
        authorized: watch::Receiver<Option<IpAddr>>,
        notify: mpsc::Sender<Notification>,
        limits: UploadLimits,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("Image server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            authorized,
            notify,
            limits,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn is_authorized(&self, peer: &SocketAddr) -> bool {
        *self.authorized.borrow() == Some(peer.ip())
    }

    pub async fn run(self, mut stop_rx: mpsc::Receiver<()>) {
        loop {
            let (mut stream, peer) = tokio::select! {
                _ = stop_rx.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("Image server accept failed: {}", e);
                        continue;
                    }
                },
            };

            if !self.is_authorized(&peer) {
                log::debug!("Dropping connection from unauthorized peer {}", peer);
                continue;
            }

            let mut authorized = self.authorized.clone();
            let image = tokio::select! {
                image = serve_upload(&mut stream, &self.limits) => image,
                _ = revoked(&mut authorized, peer.ip()) => {
                    log::info!("Camera no longer authorized, aborting upload from {}", peer);
                    None
                }
                _ = stop_rx.recv() => break,
            };
            drop(stream);

            if let Some(image) = image {
                log::debug!("Received {} byte image from {}", image.len(), peer);
                if self.notify.send(Notification::SocketImage(image)).await.is_err() {
                    break;
                }
            }
        }

        log::info!("Image server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpStream;

    fn upload(body: &[u8]) -> Vec<u8> {
        let mut request = format!("{}\r\nContent-Length: {}\r\n\r\n", IMAGE_REQUEST_LINE, body.len()).into_bytes();
        request.extend_from_slice(body);
        request
    }

    fn fast_limits() -> UploadLimits {
        UploadLimits {
            header_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_millis(100),
            max_body: 1024,
        }
    }

    /// Feed `request` from a simulated camera, returning (image, reply bytes)
    async fn exchange(request: Vec<u8>, chunk: usize, close_after: bool) -> (Option<Vec<u8>>, Vec<u8>) {
        let (mut server_side, mut camera_side) = duplex(64 * 1024);
        let camera = tokio::spawn(async move {
            for piece in request.chunks(chunk.max(1)) {
                camera_side.write_all(piece).await.unwrap();
            }
            if close_after {
                camera_side.shutdown().await.unwrap();
            }
            let mut reply = Vec::new();
            camera_side.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let image = serve_upload(&mut server_side, &fast_limits()).await;
        drop(server_side);
        (image, camera.await.unwrap())
    }

    #[tokio::test]
    async fn test_upload_accepted() {
        let body: Vec<u8> = (0..300).map(|i| (i % 256) as u8).collect();
        let (image, reply) = exchange(upload(&body), 4096, false).await;
        assert_eq!(image, Some(body));
        assert_eq!(reply, frame::RESPONSE_OK);
    }

    #[tokio::test]
    async fn test_upload_in_one_byte_chunks() {
        let body = vec![0xAB; 150];
        let (image, reply) = exchange(upload(&body), 1, false).await;
        assert_eq!(image, Some(body));
        assert_eq!(reply, frame::RESPONSE_OK);
    }

    #[tokio::test]
    async fn test_short_upload_rejected() {
        let mut request = upload(&[7u8; 100]);
        request.truncate(request.len() - 10);
        let (image, reply) = exchange(request, 4096, true).await;
        assert_eq!(image, None);
        assert_eq!(reply, frame::RESPONSE_BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stalled_upload_rejected() {
        let mut request = upload(&[7u8; 100]);
        request.truncate(request.len() - 10);
        // Camera keeps the connection open but stops sending
        let (image, reply) = exchange(request, 4096, false).await;
        assert_eq!(image, None);
        assert_eq!(reply, frame::RESPONSE_BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bad_requests_rejected() {
        let wrong_path = b"POST /camera/video HTTP/1.1\r\nContent-Length: 1\r\n\r\nx".to_vec();
        let no_length = format!("{}\r\n\r\n", IMAGE_REQUEST_LINE).into_bytes();
        let zero_length = format!("{}\r\nContent-Length: 0\r\n\r\n", IMAGE_REQUEST_LINE).into_bytes();
        let negative = format!("{}\r\nContent-Length: -3\r\n\r\n", IMAGE_REQUEST_LINE).into_bytes();
        let oversized = format!("{}\r\nContent-Length: 4096\r\n\r\n", IMAGE_REQUEST_LINE).into_bytes();
        let no_header = b"POST /camera/image HTTP/1.1\r\nContent-Le".to_vec();

        for request in [wrong_path, no_length, zero_length, negative, oversized, no_header] {
            let (image, reply) = exchange(request, 4096, false).await;
            assert_eq!(image, None);
            assert_eq!(reply, frame::RESPONSE_BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_content_md5_checked() {
        let body = b"jpeg-bytes".to_vec();
        let with_digest = |digest: &str| {
            let mut request = format!(
                "{}\r\nContent-Length: {}\r\nContent-MD5: {}\r\n\r\n",
                IMAGE_REQUEST_LINE,
                body.len(),
                digest
            )
            .into_bytes();
            request.extend_from_slice(&body);
            request
        };

        let (image, _) = exchange(with_digest(&frame::md5_hex(&body)), 4096, false).await;
        assert_eq!(image, Some(body.clone()));

        let (image, reply) = exchange(with_digest("00000000000000000000000000000000"), 4096, false).await;
        assert_eq!(image, None);
        assert_eq!(reply, frame::RESPONSE_BAD_REQUEST);
    }

    fn multipart_upload(content_type: &str, body: &[u8]) -> Vec<u8> {
        let mut request = format!(
            "{}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            IMAGE_REQUEST_LINE,
            content_type,
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);
        request
    }

    #[tokio::test]
    async fn test_multipart_upload_yields_file_part() {
        let jpeg = b"\xff\xd8\xff\xe0JFIF\x00\xff\xd9\r\n".to_vec();
        let mut body = b"--bnd\r\nContent-Disposition: form-data; name=\"image\"; filename=\"1.jpg\"\r\n".to_vec();
        body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(&jpeg);
        body.extend_from_slice(b"\r\n--bnd--\r\n");

        let (image, reply) = exchange(multipart_upload("multipart/form-data; boundary=bnd", &body), 7, false).await;
        assert_eq!(image, Some(jpeg));
        assert_eq!(reply, frame::RESPONSE_OK);

        let (image, reply) = exchange(multipart_upload("multipart/form-data", &body), 4096, false).await;
        assert_eq!(image, None);
        assert_eq!(reply, frame::RESPONSE_BAD_REQUEST);

        let (image, reply) = exchange(multipart_upload("multipart/form-data; boundary=zzz", &body), 4096, false).await;
        assert_eq!(image, None);
        assert_eq!(reply, frame::RESPONSE_BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_server_serves_only_authorized_peer() {
        let (auth_tx, auth_rx) = watch::channel(None);
        let (notify_tx, mut notify_rx) = mpsc::channel(8);
        let server = CameraServer::bind("127.0.0.1:0", auth_rx, notify_tx, fast_limits())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(server.run(stop_rx));

        // Not authorized yet: dropped without a reply
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = stream.write_all(&upload(b"ignored")).await;
        let mut reply = Vec::new();
        // Either a clean close or a reset, never an answer
        let _ = stream.read_to_end(&mut reply).await;
        assert!(reply.is_empty());

        auth_tx.send_replace(Some(IpAddr::from([127, 0, 0, 1])));
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&upload(b"frame-1")).await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, frame::RESPONSE_OK);
        assert_eq!(notify_rx.recv().await, Some(Notification::SocketImage(b"frame-1".to_vec())));

        stop_tx.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_revocation_aborts_upload() {
        let (auth_tx, auth_rx) = watch::channel(Some(IpAddr::from([127, 0, 0, 1])));
        let (notify_tx, mut notify_rx) = mpsc::channel(8);
        let limits = UploadLimits {
            header_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
            max_body: 1024,
        };
        let server = CameraServer::bind("127.0.0.1:0", auth_rx, notify_tx, limits).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (_stop_tx, stop_rx) = mpsc::channel(1);
        tokio::spawn(server.run(stop_rx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = upload(&[1u8; 64]);
        stream.write_all(&request[..request.len() - 8]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        auth_tx.send_replace(None);

        let mut reply = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut reply))
            .await
            .unwrap();
        assert!(reply.is_empty());
        assert!(notify_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_switching_camera_aborts_upload() {
        let (auth_tx, auth_rx) = watch::channel(Some(IpAddr::from([127, 0, 0, 1])));
        let (notify_tx, mut notify_rx) = mpsc::channel(8);
        let limits = UploadLimits {
            header_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
            max_body: 1024,
        };
        let server = CameraServer::bind("127.0.0.1:0", auth_rx, notify_tx, limits).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (_stop_tx, stop_rx) = mpsc::channel(1);
        tokio::spawn(server.run(stop_rx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = upload(&[2u8; 64]);
        stream.write_all(&request[..request.len() - 8]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        auth_tx.send_replace(Some(IpAddr::from([10, 0, 0, 9])));

        // The rest arrives after the switch and must not be delivered
        let _ = stream.write_all(&request[request.len() - 8..]).await;
        let mut reply = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut reply))
            .await
            .unwrap();
        assert!(reply.is_empty());
        assert!(notify_rx.try_recv().is_err());
    }
}
