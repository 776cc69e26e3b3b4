//! Scripted in-memory controller for tests.
//!
//! A [`MockDevice`] is a cheap handle; every clone and every link opened through
//! [`MockDevice::opener`] shares the same state, so a test can script the device while
//! the bridge talks to it.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use super::link::{LinkOpener, SerialLink};
use crate::error::TransportError;

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// Something the device observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Opened,
    /// A complete line written by the host (without the newline).
    Wrote(String),
    /// Bytes handed to the host by one read call.
    Read(String),
}

#[derive(Default)]
struct MockState {
    rx: VecDeque<u8>,
    pending_write: Vec<u8>,
    events: Vec<MockEvent>,
    open_failures: usize,
    opens: usize,
    unplugged: bool,
    fail_next_write: Option<String>,
    fail_next_read: Option<String>,
    responder: Option<Responder>,
}

#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the device from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue one line (newline appended) for the host to read.
    pub fn emit_line(&self, line: &str) {
        self.emit_raw(format!("{line}\n").as_bytes());
    }

    /// Queue raw bytes, e.g. half a line.
    pub fn emit_raw(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes.iter().copied());
    }

    /// Answer every written line via `f`; `None` means stay silent.
    pub fn respond_with<F>(&self, f: F)
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        self.lock().responder = Some(Box::new(f));
    }

    /// Make the next `n` open attempts fail.
    pub fn fail_opens(&self, n: usize) {
        self.lock().open_failures = n;
    }

    /// Make the next write fail with `message`.
    pub fn fail_next_write(&self, message: &str) {
        self.lock().fail_next_write = Some(message.to_string());
    }

    /// Make the next read or poll fail with `message`.
    pub fn fail_next_read(&self, message: &str) {
        self.lock().fail_next_read = Some(message.to_string());
    }

    /// Simulate pulling the cable: live links error out and opens fail until
    /// [`MockDevice::plug_in`].
    pub fn unplug(&self) {
        self.lock().unplugged = true;
    }

    pub fn plug_in(&self) {
        self.lock().unplugged = false;
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.lock().events.clone()
    }

    /// Lines written by the host so far.
    pub fn written(&self) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Wrote(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn opener(&self, port: &str) -> MockOpener {
        MockOpener {
            device: self.clone(),
            port: port.to_string(),
        }
    }
}

pub struct MockOpener {
    device: MockDevice,
    port: String,
}

impl LinkOpener for MockOpener {
    fn open(&mut self) -> Result<Box<dyn SerialLink>, TransportError> {
        let mut state = self.device.lock();
        if state.unplugged || state.open_failures > 0 {
            state.open_failures = state.open_failures.saturating_sub(1);
            return Err(TransportError::Open {
                port: self.port.clone(),
                reason: "No such file or directory".to_string(),
            });
        }
        state.opens += 1;
        state.events.push(MockEvent::Opened);
        Ok(Box::new(MockLink {
            device: self.device.clone(),
        }))
    }

    fn port_name(&self) -> &str {
        &self.port
    }
}

struct MockLink {
    device: MockDevice,
}

fn unplugged() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")
}

impl SerialLink for MockLink {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        let mut state = self.device.lock();
        if state.unplugged {
            return Err(unplugged());
        }
        if let Some(message) = state.fail_next_read.take() {
            return Err(io::Error::new(io::ErrorKind::Other, message));
        }
        Ok(state.rx.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.device.lock();
        if state.unplugged {
            return Err(unplugged());
        }
        if let Some(message) = state.fail_next_read.take() {
            return Err(io::Error::new(io::ErrorKind::Other, message));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        if n > 0 {
            let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
            state.events.push(MockEvent::Read(chunk));
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.device.lock();
        if state.unplugged {
            return Err(unplugged());
        }
        if let Some(message) = state.fail_next_write.take() {
            return Err(io::Error::new(io::ErrorKind::Other, message));
        }
        state.pending_write.extend_from_slice(data);
        while let Some(pos) = state.pending_write.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = state.pending_write.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1])
                .trim_end_matches('\r')
                .to_string();
            state.events.push(MockEvent::Wrote(line.clone()));
            let reply = state.responder.as_mut().and_then(|f| f(&line));
            if let Some(reply) = reply {
                state.rx.extend(reply.bytes());
                state.rx.push_back(b'\n');
            }
        }
        Ok(())
    }
}
