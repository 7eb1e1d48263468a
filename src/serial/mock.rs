//! Simulated WiFi peripheral for tests and offline runs.
//!
//! Answers read/write frames from an in-memory register file the way the real
//! board does. Clones share state, so a test can keep a handle while the
//! serial worker owns another.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::frame::{self, ADDR, READ, WRITE};
use super::{Result, SerialError, SerialTarget};
use crate::transport::Transport;

const REGISTER_COUNT: usize = 0x42;

#[derive(Clone)]
pub struct MockPeripheral {
    inner: Arc<Mutex<MockInner>>,
}

struct MockInner {
    registers: [u8; REGISTER_COUNT],
    open: Option<SerialTarget>,
    refuse_open: bool,
    silent: bool,
    corrupt_acks: bool,
    response_delay: Option<Duration>,
    pending: VecDeque<u8>,
    sent_frames: Vec<Vec<u8>>,
    open_count: usize,
}

impl MockPeripheral {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner {
                registers: [0; REGISTER_COUNT],
                open: None,
                refuse_open: false,
                silent: false,
                corrupt_acks: false,
                response_delay: None,
                pending: VecDeque::new(),
                sent_frames: Vec::new(),
                open_count: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `open` calls fail like a missing port
    pub fn refuse_open(&self, refuse: bool) {
        self.lock().refuse_open = refuse;
    }

    /// Stop answering requests (reads then time out empty)
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Hold every read for `delay` before answering, like a slow line
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        self.lock().response_delay = delay;
    }

    /// Flip a CRC bit in every acknowledgement
    pub fn set_corrupt_acks(&self, corrupt: bool) {
        self.lock().corrupt_acks = corrupt;
    }

    /// Preload a register range
    pub fn write_registers(&self, start: u16, data: &[u8]) {
        let mut inner = self.lock();
        let start = start as usize;
        let end = (start + data.len()).min(REGISTER_COUNT);
        inner.registers[start..end].copy_from_slice(&data[..end - start]);
    }

    pub fn registers(&self, start: u16, len: usize) -> Vec<u8> {
        let inner = self.lock();
        let start = (start as usize).min(REGISTER_COUNT);
        let end = (start + len).min(REGISTER_COUNT);
        inner.registers[start..end].to_vec()
    }

    /// Every frame sent by the host, in order
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.lock().sent_frames.clone()
    }

    pub fn open_target(&self) -> Option<SerialTarget> {
        self.lock().open.clone()
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }
}

impl Default for MockPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl MockInner {
    fn answer(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < 7 || request[0] != ADDR {
            return None;
        }
        let (body, crc) = request.split_at(request.len() - 2);
        if crc != frame::crc16(body).to_le_bytes() {
            return None;
        }

        let register = u16::from_be_bytes([request[2], request[3]]) as usize;
        let length = request[4] as usize;
        let end = register.checked_add(length).filter(|&end| end <= REGISTER_COUNT)?;

        let mut ack = match request[1] {
            READ => {
                let mut ack = vec![ADDR, READ, length as u8];
                ack.extend_from_slice(&self.registers[register..end]);
                ack
            }
            WRITE => {
                let data = request.get(5..5 + length)?;
                self.registers[register..end].copy_from_slice(data);
                let mut ack = vec![ADDR, WRITE, length as u8];
                ack.extend_from_slice(data);
                ack
            }
            _ => return None,
        };

        frame::append_crc(&mut ack);
        if self.corrupt_acks {
            let last = ack.len() - 1;
            ack[last] ^= 0x01;
        }
        Some(ack)
    }
}

#[async_trait]
impl Transport for MockPeripheral {
    type Target = SerialTarget;
    type Error = SerialError;

    async fn open(&mut self, target: &SerialTarget) -> Result<()> {
        let mut inner = self.lock();
        if inner.refuse_open {
            return Err(SerialError::ConnectionFailed(format!("{}: refused", target.port_name)));
        }
        inner.open = Some(target.clone());
        inner.open_count += 1;
        inner.pending.clear();
        Ok(())
    }

    async fn close(&mut self) {
        let mut inner = self.lock();
        inner.open = None;
        inner.pending.clear();
    }

    fn is_open(&self) -> bool {
        self.lock().open.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let mut inner = self.lock();
        if inner.open.is_none() {
            return Err(SerialError::NotOpen);
        }
        inner.pending.clear();
        inner.sent_frames.push(data.to_vec());
        if !inner.silent {
            if let Some(ack) = inner.answer(data) {
                inner.pending.extend(ack);
            }
        }
        Ok(data.len())
    }

    async fn recv(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let delay = self.lock().response_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if inner.open.is_none() {
            return Err(SerialError::NotOpen);
        }
        let n = inner.pending.len().min(max_len);
        Ok(inner.pending.drain(..n).collect())
    }
}
