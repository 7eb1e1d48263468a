//! HTTP-style framing used on the camera link.
//!
//! Every message is a header block terminated by `\r\n\r\n` followed by
//! exactly `Content-Length` body bytes. Only the small subset the camera
//! speaks is supported: no chunked encoding, no keep-alive.

use md5::{Digest, Md5};

pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
pub const STATUS_OK: &str = "HTTP/1.1 200 OK";

/// Largest header block accepted before the frame is rejected
pub const MAX_HEADER_LEN: usize = 8 * 1024;

pub const RESPONSE_OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
pub const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";

pub fn build_get_request(path: &str) -> Vec<u8> {
    format!("GET {} HTTP/1.1\r\n\r\n", path).into_bytes()
}

pub fn build_post_json(path: &str, body: &str) -> Vec<u8> {
    let mut request = format!(
        "POST {} HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        path,
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(body.as_bytes());
    request
}

pub fn build_post_stream(path: &str, data: &[u8]) -> Vec<u8> {
    let mut request = format!(
        "POST {} HTTP/1.1\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nContent-MD5: {}\r\n\r\n",
        path,
        data.len(),
        md5_hex(data)
    )
    .into_bytes();
    request.extend_from_slice(data);
    request
}

/// Lowercase hex MD5 digest
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Parsed header block of a request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub start_line: String,
    headers: Vec<(String, String)>,
    /// Header block length including the terminator
    pub len: usize,
}

impl FrameHeader {
    /// Parse the header block at the front of `buffer`.
    /// `None` until the terminator has arrived or when the block is not text.
    pub fn parse(buffer: &[u8]) -> Option<FrameHeader> {
        let end = find_terminator(buffer)?;
        let text = std::str::from_utf8(&buffer[..end]).ok()?;

        let mut lines = text.split("\r\n");
        let start_line = lines.next()?.trim().to_string();
        let headers = lines
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        Some(FrameHeader {
            start_line,
            headers,
            len: end + HEADER_TERMINATOR.len(),
        })
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Raw declared length; negative values are passed through for the caller to reject
    pub fn content_length(&self) -> Option<i64> {
        self.header("Content-Length")?.parse().ok()
    }

    fn content_length_field(&self) -> Option<Result<i64, FrameError>> {
        let raw = self.header("Content-Length")?;
        Some(raw.parse().map_err(|_| FrameError::InvalidHeader))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("header block exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("malformed header block")]
    InvalidHeader,

    #[error("missing Content-Length")]
    MissingContentLength,

    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(i64),

    #[error("body of {0} bytes exceeds the limit")]
    BodyTooLarge(usize),

    #[error("received {received} bytes past the declared length")]
    Overrun { received: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assembly {
    Header,
    Body { received: usize, expected: usize },
    Complete,
}

/// Incremental Content-Length reassembly over arbitrarily split reads
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    header: Option<FrameHeader>,
    expected: Option<usize>,
    max_body: usize,
}

impl FrameAssembler {
    pub fn new(max_body: usize) -> Self {
        Self {
            buffer: Vec::new(),
            header: None,
            expected: None,
            max_body,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Assembly, FrameError> {
        self.buffer.extend_from_slice(chunk);

        if self.header.is_none() {
            match FrameHeader::parse(&self.buffer) {
                Some(header) => self.header = Some(header),
                None if self.buffer.len() > MAX_HEADER_LEN => {
                    return Err(FrameError::HeaderTooLarge(MAX_HEADER_LEN))
                }
                None if find_terminator(&self.buffer).is_some() => {
                    return Err(FrameError::InvalidHeader)
                }
                None => return Ok(Assembly::Header),
            }
        }

        let expected = match self.expected {
            Some(expected) => expected,
            None => {
                let declared = self
                    .header
                    .as_ref()
                    .and_then(FrameHeader::content_length_field)
                    .ok_or(FrameError::MissingContentLength)??;
                if declared < 0 {
                    return Err(FrameError::InvalidContentLength(declared));
                }
                let declared = declared as usize;
                if declared > self.max_body {
                    return Err(FrameError::BodyTooLarge(declared));
                }
                self.expected = Some(declared);
                declared
            }
        };

        let received = self.body_received();
        if received > expected {
            return Err(FrameError::Overrun { received });
        }
        if received == expected {
            return Ok(Assembly::Complete);
        }
        Ok(Assembly::Body { received, expected })
    }

    pub fn header(&self) -> Option<&FrameHeader> {
        self.header.as_ref()
    }

    pub fn expected_len(&self) -> Option<usize> {
        self.expected
    }

    fn body_received(&self) -> usize {
        self.header
            .as_ref()
            .map(|h| self.buffer.len().saturating_sub(h.len))
            .unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.expected, Some(expected) if self.body_received() == expected)
    }

    /// Body bytes received so far
    pub fn body(&self) -> &[u8] {
        match &self.header {
            Some(header) => &self.buffer[header.len.min(self.buffer.len())..],
            None => &[],
        }
    }

    pub fn into_body(mut self) -> Vec<u8> {
        let start = self.header.as_ref().map(|h| h.len).unwrap_or(self.buffer.len());
        self.buffer.split_off(start.min(self.buffer.len()))
    }
}

/// Check a camera response; `(true, body)` only for a complete `200 OK`
pub fn parse_response(response: &[u8]) -> (bool, Vec<u8>) {
    let header = match FrameHeader::parse(response) {
        Some(header) => header,
        None => return (false, Vec::new()),
    };
    if !header.start_line.starts_with(STATUS_OK) {
        return (false, Vec::new());
    }

    let length = match header.content_length() {
        Some(length) if length >= 0 => length as usize,
        _ => return (false, Vec::new()),
    };
    match response.get(header.len..header.len + length) {
        Some(body) => (true, body.to_vec()),
        None => (false, Vec::new()),
    }
}

/// `boundary` parameter of a `multipart/form-data` content type
pub fn multipart_boundary(content_type: &str) -> Option<&str> {
    let mut params = content_type.split(';');
    let media_type = params.next()?.trim();
    if !media_type.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"'))
        .filter(|boundary| !boundary.is_empty())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Content of the first part of a multipart body: everything between the
/// part's header block and the next `\r\n--boundary` delimiter
pub fn extract_multipart_part(body: &[u8], boundary: &str) -> Option<Vec<u8>> {
    let opening = format!("--{}", boundary);
    let closing = format!("\r\n--{}", boundary);

    let part_start = find(body, opening.as_bytes())? + opening.len();
    let part = &body[part_start..];
    let content_start = find(part, HEADER_TERMINATOR)? + HEADER_TERMINATOR.len();
    let content = &part[content_start..];
    let content_end = find(content, closing.as_bytes())?;
    Some(content[..content_end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_response(body: &[u8]) -> Vec<u8> {
        let mut response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        response.extend_from_slice(body);
        response
    }

    #[test]
    fn test_build_get_request() {
        assert_eq!(build_get_request("/camera/ping"), b"GET /camera/ping HTTP/1.1\r\n\r\n".to_vec());
    }

    #[test]
    fn test_build_post_json() {
        let request = build_post_json("/camera/config", "{\"fps\":30}");
        let text = String::from_utf8(request).unwrap();
        assert!(text.starts_with("POST /camera/config HTTP/1.1\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 10\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"fps\":30}"));
    }

    #[test]
    fn test_build_post_stream_carries_md5() {
        let request = build_post_stream("/camera/upgrade", b"firmware");
        let header = FrameHeader::parse(&request).unwrap();
        assert_eq!(header.start_line, "POST /camera/upgrade HTTP/1.1");
        assert_eq!(header.header("content-type"), Some("application/octet-stream"));
        assert_eq!(header.content_length(), Some(8));
        assert_eq!(header.header("Content-MD5"), Some(md5_hex(b"firmware").as_str()));
        assert_eq!(&request[header.len..], b"firmware");
    }

    #[test]
    fn test_md5_hex_known_value() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_parse_response_ok() {
        assert_eq!(parse_response(&ok_response(b"{\"a\":1}")), (true, b"{\"a\":1}".to_vec()));
        assert_eq!(parse_response(&ok_response(b"")), (true, Vec::new()));
    }

    #[test]
    fn test_parse_response_ignores_trailing_bytes() {
        let mut response = ok_response(b"abc");
        response.extend_from_slice(b"\r\n");
        assert_eq!(parse_response(&response), (true, b"abc".to_vec()));
    }

    #[test]
    fn test_parse_response_failures() {
        let failures: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n".to_vec(),
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_vec(),
            b"HTTP/1.1 200 OK\r\n\r\n".to_vec(),
            b"HTTP/1.1 200 OK\r\nContent-Length: nope\r\n\r\n".to_vec(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort".to_vec(),
        ];
        for response in failures {
            assert_eq!(parse_response(&response), (false, Vec::new()), "{:?}", String::from_utf8_lossy(&response));
        }
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let header = FrameHeader::parse(b"POST /camera/image HTTP/1.1\r\ncontent-length: 42\r\n\r\n").unwrap();
        assert_eq!(header.content_length(), Some(42));
        assert_eq!(header.header("CONTENT-LENGTH"), Some("42"));
    }

    #[test]
    fn test_reassembly_one_byte_at_a_time() {
        for n in [1usize, 100, 257] {
            let body: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            let frame = ok_response(&body);

            let mut assembler = FrameAssembler::new(1024);
            let mut last = Assembly::Header;
            for byte in &frame {
                assert_ne!(last, Assembly::Complete);
                last = assembler.push(std::slice::from_ref(byte)).unwrap();
            }
            assert_eq!(last, Assembly::Complete);
            assert_eq!(assembler.body(), body.as_slice());
            assert_eq!(assembler.into_body(), body);
        }
    }

    #[test]
    fn test_reassembly_reports_progress() {
        let mut assembler = FrameAssembler::new(1024);
        assert_eq!(assembler.push(b"POST /camera/image HTTP/1.1\r\nContent-Len").unwrap(), Assembly::Header);
        assert_eq!(
            assembler.push(b"gth: 6\r\n\r\nabc").unwrap(),
            Assembly::Body { received: 3, expected: 6 }
        );
        assert!(!assembler.is_complete());
        assert_eq!(assembler.push(b"def").unwrap(), Assembly::Complete);
        assert!(assembler.is_complete());
        assert_eq!(assembler.expected_len(), Some(6));
    }

    #[test]
    fn test_assembler_rejections() {
        let mut missing = FrameAssembler::new(1024);
        assert_eq!(missing.push(b"POST / HTTP/1.1\r\n\r\n"), Err(FrameError::MissingContentLength));
        assert!(missing.header().is_some());

        let mut negative = FrameAssembler::new(1024);
        assert_eq!(
            negative.push(b"POST / HTTP/1.1\r\nContent-Length: -5\r\n\r\n"),
            Err(FrameError::InvalidContentLength(-5))
        );

        let mut too_big = FrameAssembler::new(16);
        assert_eq!(
            too_big.push(b"POST / HTTP/1.1\r\nContent-Length: 17\r\n\r\n"),
            Err(FrameError::BodyTooLarge(17))
        );

        let mut overrun = FrameAssembler::new(16);
        assert_eq!(
            overrun.push(b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\nabc"),
            Err(FrameError::Overrun { received: 3 })
        );

        let mut endless = FrameAssembler::new(16);
        let filler = vec![b'a'; MAX_HEADER_LEN + 1];
        assert_eq!(endless.push(&filler), Err(FrameError::HeaderTooLarge(MAX_HEADER_LEN)));
    }

    fn multipart(boundary: &str, file: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"shot.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n",
            b = boundary
        )
        .into_bytes();
        body.extend_from_slice(file);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
        body
    }

    #[test]
    fn test_multipart_boundary() {
        assert_eq!(multipart_boundary("multipart/form-data; boundary=bnd"), Some("bnd"));
        assert_eq!(multipart_boundary("Multipart/Form-Data; charset=utf-8; boundary=\"x y\""), Some("x y"));
        assert_eq!(multipart_boundary("multipart/form-data"), None);
        assert_eq!(multipart_boundary("multipart/form-data; boundary="), None);
        assert_eq!(multipart_boundary("image/jpeg"), None);
    }

    #[test]
    fn test_extract_multipart_part() {
        let jpeg = b"\xff\xd8\xff\xe0\r\n--nearly\xff\xd9".to_vec();
        assert_eq!(extract_multipart_part(&multipart("bnd", &jpeg), "bnd"), Some(jpeg.clone()));

        // Delimiter missing or wrong boundary
        let mut truncated = multipart("bnd", &jpeg);
        truncated.truncate(truncated.len() - 12);
        assert_eq!(extract_multipart_part(&truncated, "bnd"), None);
        assert_eq!(extract_multipart_part(&multipart("bnd", &jpeg), "other"), None);
        assert_eq!(extract_multipart_part(b"--bnd\r\nno header end", "bnd"), None);
    }
}
