//! Modbus-style frame codec for the WiFi configuration peripheral.
//!
//! Frame layout: `[address, function, register_hi, register_lo, payload..., crc_lo, crc_hi]`.
//! The CRC is CRC-16/MODBUS over everything before it.

/// The line carries exactly one peripheral
pub const ADDR: u8 = 0x01;
pub const READ: u8 = 0x03;
pub const WRITE: u8 = 0x06;

// Register map
pub const SSID_REGISTER: u16 = 0x00;
pub const PASSWORD_REGISTER: u16 = 0x20;
pub const WIFI_ENABLE_REGISTER: u16 = 0x40;
pub const WIFI_STATUS_REGISTER: u16 = 0x41;

/// SSID and password registers are fixed-width
pub const CREDENTIAL_LEN: usize = 32;

/// address + function + length + crc(2)
const ACK_OVERHEAD: usize = 5;

const CRC16_POLY: u16 = 0xA001;
const CRC16_INIT: u16 = 0xFFFF;

/// CRC-16/MODBUS (reflected polynomial 0xA001, initial value 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(CRC16_INIT, |crc, &byte| crc16_update_byte(crc, byte))
}

fn crc16_update_byte(mut crc: u16, byte: u8) -> u16 {
    crc ^= byte as u16;
    for _ in 0..8 {
        if crc & 1 != 0 {
            crc = (crc >> 1) ^ CRC16_POLY;
        } else {
            crc >>= 1;
        }
    }
    crc
}

/// Append the CRC of `frame` low byte first
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

fn build_frame(function: u8, register: u16, payload: &[u8]) -> Vec<u8> {
    let [register_hi, register_lo] = register.to_be_bytes();
    let mut frame = Vec::with_capacity(payload.len() + 6);
    frame.extend_from_slice(&[ADDR, function, register_hi, register_lo]);
    frame.extend_from_slice(payload);
    append_crc(&mut frame);
    frame
}

/// Read `length` bytes starting at `register`
pub fn build_read_frame(register: u16, length: u8) -> Vec<u8> {
    build_frame(READ, register, &[length])
}

/// Write `data` starting at `register`; the payload is prefixed with its length.
/// Payloads longer than 255 bytes are cut to fit the one-byte length field.
pub fn build_write_frame(register: u16, data: &[u8]) -> Vec<u8> {
    let data = &data[..data.len().min(u8::MAX as usize)];
    let mut payload = Vec::with_capacity(data.len() + 1);
    payload.push(data.len() as u8);
    payload.extend_from_slice(data);
    build_frame(WRITE, register, &payload)
}

fn validate_ack(ack: &[u8], function: u8) -> Option<&[u8]> {
    if ack.len() <= ACK_OVERHEAD || ack[0] != ADDR || ack[1] != function {
        return None;
    }
    let length = ack[2] as usize;
    if length != ack.len() - ACK_OVERHEAD {
        return None;
    }
    let (body, crc) = ack.split_at(ack.len() - 2);
    if crc != crc16(body).to_le_bytes() {
        return None;
    }
    Some(&ack[3..3 + length])
}

/// Payload of a read acknowledgement, or an empty vector if the frame is invalid
pub fn parse_read_ack(ack: &[u8]) -> Vec<u8> {
    validate_ack(ack, READ).map(<[u8]>::to_vec).unwrap_or_default()
}

/// Whether `ack` is a valid write acknowledgement
pub fn parse_write_ack(ack: &[u8]) -> bool {
    validate_ack(ack, WRITE).is_some()
}

/// Truncate or zero-pad a credential to the register width
pub fn pad_credential(value: &str) -> [u8; CREDENTIAL_LEN] {
    let mut out = [0u8; CREDENTIAL_LEN];
    let bytes = value.as_bytes();
    let n = bytes.len().min(CREDENTIAL_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Decode a credential register, stopping at the first NUL
pub fn decode_credential(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

pub fn get_ssid_frame() -> Vec<u8> {
    build_read_frame(SSID_REGISTER, CREDENTIAL_LEN as u8)
}

pub fn set_ssid_frame(ssid: &str) -> Vec<u8> {
    build_write_frame(SSID_REGISTER, &pad_credential(ssid))
}

pub fn get_password_frame() -> Vec<u8> {
    build_read_frame(PASSWORD_REGISTER, CREDENTIAL_LEN as u8)
}

pub fn set_password_frame(password: &str) -> Vec<u8> {
    build_write_frame(PASSWORD_REGISTER, &pad_credential(password))
}

pub fn get_wifi_enable_frame() -> Vec<u8> {
    build_read_frame(WIFI_ENABLE_REGISTER, 1)
}

pub fn set_wifi_enable_frame(enable: bool) -> Vec<u8> {
    build_write_frame(WIFI_ENABLE_REGISTER, &[enable as u8])
}

pub fn get_wifi_status_frame() -> Vec<u8> {
    build_read_frame(WIFI_STATUS_REGISTER, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
        append_crc(&mut frame);
        frame
    }

    #[test]
    fn test_crc16_modbus_check_value() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_crc_round_trip() {
        for len in 0..64usize {
            let data: Vec<u8> = (0..len).map(|i| (i * 37 + len) as u8).collect();
            let frame = with_crc(data);
            let (body, crc) = frame.split_at(frame.len() - 2);
            assert_eq!(crc, crc16(body).to_le_bytes(), "length {}", len);
        }
    }

    #[test]
    fn test_build_read_frame() {
        let frame = build_read_frame(0x1000, 32);
        assert_eq!(&frame[..5], &[ADDR, READ, 0x10, 0x00, 32]);
        assert_eq!(frame.len(), 7);
        assert_eq!(frame, with_crc(vec![ADDR, READ, 0x10, 0x00, 32]));
    }

    #[test]
    fn test_build_write_frame() {
        let frame = build_write_frame(0x00, b"ABC");
        assert_eq!(frame, with_crc(vec![ADDR, WRITE, 0x00, 0x00, 3, 0x41, 0x42, 0x43]));
    }

    #[test]
    fn test_register_frames() {
        assert_eq!(get_ssid_frame(), build_read_frame(0x00, 32));
        assert_eq!(get_password_frame(), build_read_frame(0x20, 32));
        assert_eq!(get_wifi_status_frame(), build_read_frame(0x41, 1));
        assert_eq!(get_wifi_enable_frame(), build_read_frame(0x40, 1));
        assert_eq!(set_wifi_enable_frame(true), with_crc(vec![ADDR, WRITE, 0x00, 0x40, 1, 1]));
        assert_eq!(set_wifi_enable_frame(false), with_crc(vec![ADDR, WRITE, 0x00, 0x40, 1, 0]));
    }

    #[test]
    fn test_credential_payload_is_always_32_bytes() {
        let long = "1234567890ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        for value in ["", "TestSSID", "1234567890ABCDEFGHIJKLMNOPQRSTUV", long] {
            let frame = set_ssid_frame(value);
            // header(4) + length(1) + 32 + crc(2)
            assert_eq!(frame.len(), 4 + 1 + CREDENTIAL_LEN + 2);
            assert_eq!(frame[4] as usize, CREDENTIAL_LEN);

            let payload = &frame[5..5 + CREDENTIAL_LEN];
            let kept = value.len().min(CREDENTIAL_LEN);
            assert_eq!(&payload[..kept], &value.as_bytes()[..kept]);
            assert!(payload[kept..].iter().all(|&b| b == 0));
        }

        let frame = set_password_frame("TestPass");
        assert_eq!(&frame[2..4], &[0x00, 0x20]);
        assert_eq!(decode_credential(&frame[5..5 + CREDENTIAL_LEN]), "TestPass");
    }

    #[test]
    fn test_parse_read_ack_valid() {
        let ack = with_crc(vec![ADDR, READ, 2, 0x12, 0x34]);
        assert_eq!(parse_read_ack(&ack), vec![0x12, 0x34]);
    }

    #[test]
    fn test_parse_ack_rejections() {
        let valid = with_crc(vec![ADDR, READ, 2, 0x12, 0x34]);

        let mut wrong_address = valid.clone();
        wrong_address[0] = 0x02;
        let mut wrong_function = valid.clone();
        wrong_function[1] = 0x04;
        let mut wrong_length = valid.clone();
        wrong_length[2] = 3;
        let mut tampered_crc = valid.clone();
        let last = tampered_crc.len() - 1;
        tampered_crc[last] ^= 0x01;

        for ack in [&wrong_address, &wrong_function, &wrong_length, &tampered_crc] {
            assert!(parse_read_ack(ack).is_empty());
            assert!(!parse_write_ack(ack));
        }

        // Too short to hold a frame at all
        for short in [&[][..], &[ADDR][..], &[ADDR, READ][..], &[ADDR, READ, 0, 0, 0][..]] {
            assert!(parse_read_ack(short).is_empty());
            assert!(!parse_write_ack(short));
        }
    }

    #[test]
    fn test_parse_write_ack() {
        let ack = with_crc(vec![ADDR, WRITE, 2, 0x12, 0x34]);
        assert!(parse_write_ack(&ack));
        // A read ack is not a write ack
        assert!(!parse_write_ack(&with_crc(vec![ADDR, READ, 2, 0x12, 0x34])));
    }

    #[test]
    fn test_decode_credential_stops_at_nul() {
        let padded = pad_credential("home-net");
        assert_eq!(decode_credential(&padded), "home-net");
        assert_eq!(decode_credential(b"no-padding"), "no-padding");
    }
}
