//! # Serial channel to the xARM controller
//!
//! [`SerialChannel`] owns the single physical link to the controller. It opens the
//! port lazily, retries forever with capped exponential backoff while the device is
//! missing, frames newline-terminated lines in both directions and tears the link
//! down whenever a transport error is observed. The next caller reconnects.
//!
//! The channel itself is not synchronised; the bridge only ever reaches it through
//! [`crate::bridge::ChannelMutex`].
//!
//! ## Line protocol
//!
//! ```text
//! host   -> device   "GET BLOCK 5\n"
//! device -> host     "GET BLOCK 5: true\r\n"
//! ```
//!
//! Replies are single lines. A missing reply can only be told apart from an empty
//! one by timing out.

pub mod backoff;
pub mod link;
pub mod mock;

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::time::{sleep, Duration, Instant};

use crate::error::{BridgeError, BridgeResult, TransportError};
use crate::logutil::escape_line;
use crate::metrics::BridgeMetrics;
use crate::shutdown::Shutdown;

pub use backoff::{Backoff, BackoffPolicy};
pub use link::{LinkOpener, SerialLink, SerialPortOpener};

/// Default settle time after opening a port (boards reboot on DTR).
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(150);
/// Default granularity for polling pending input.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Upper bound on a single buffered line; longer garbage is discarded.
const MAX_LINE_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No link. Initial state, and the state left behind by [`SerialChannel::fault`].
    Disconnected,
    /// An open attempt is in progress.
    Connecting,
    /// A live link exists.
    Open,
    /// The last open attempt failed; waiting out the backoff delay.
    Faulted,
}

pub struct SerialChannel {
    opener: Box<dyn LinkOpener>,
    link: Option<Box<dyn SerialLink>>,
    state: ChannelState,
    backoff: Backoff,
    settle: Duration,
    poll_interval: Duration,
    rx_buf: Vec<u8>,
    last_fault: Option<String>,
    metrics: Arc<BridgeMetrics>,
}

impl SerialChannel {
    pub fn new(opener: Box<dyn LinkOpener>, policy: BackoffPolicy, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            opener,
            link: None,
            state: ChannelState::Disconnected,
            backoff: policy.start(),
            settle: DEFAULT_SETTLE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            rx_buf: Vec::new(),
            last_fault: None,
            metrics,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    pub fn port_name(&self) -> &str {
        self.opener.port_name()
    }

    /// Reason given for the most recent fault, if any.
    pub fn last_fault(&self) -> Option<&str> {
        self.last_fault.as_deref()
    }

    /// Delay the next failed open attempt would wait.
    pub fn current_backoff(&self) -> Duration {
        self.backoff.current()
    }

    /// Make sure a live link exists, opening one if needed.
    ///
    /// Open failures are logged and retried forever; the only way out without a
    /// link is a shutdown request, reported as [`BridgeError::Shutdown`].
    pub async fn acquire_open(&mut self, shutdown: &mut Shutdown) -> BridgeResult<()> {
        if self.link.is_some() {
            return Ok(());
        }
        loop {
            if shutdown.is_shutdown() {
                return Err(BridgeError::Shutdown);
            }
            self.state = ChannelState::Connecting;
            self.metrics.inc_open_attempt();
            match self.opener.open() {
                Ok(link) => {
                    self.link = Some(link);
                    self.state = ChannelState::Open;
                    self.backoff.reset();
                    self.metrics.inc_open();
                    info!("Serial link open on {}", self.opener.port_name());
                    self.settle_and_purge().await;
                    return Ok(());
                }
                Err(e) => {
                    self.state = ChannelState::Faulted;
                    let delay = self.backoff.next_delay();
                    warn!("{} (retrying in {:?})", e, delay);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.recv() => return Err(BridgeError::Shutdown),
                    }
                }
            }
        }
    }

    async fn settle_and_purge(&mut self) {
        if !self.settle.is_zero() {
            sleep(self.settle).await;
        }
        self.rx_buf.clear();
        let Some(link) = self.link.as_mut() else {
            return;
        };
        // Drop boot banners and anything left over from a previous session.
        let mut purge = [0u8; 512];
        let mut discarded = 0usize;
        while let Ok(available) = link.bytes_to_read() {
            if available == 0 {
                break;
            }
            match link.read(&mut purge[..available.min(512)]) {
                Ok(0) | Err(_) => break,
                Ok(n) => discarded += n,
            }
        }
        if discarded > 0 {
            debug!("Discarded {} stale bytes after open", discarded);
        }
    }

    fn link(&mut self) -> Result<&mut Box<dyn SerialLink>, TransportError> {
        self.link.as_mut().ok_or(TransportError::NotOpen)
    }

    /// Send one command line; the newline is appended here.
    pub fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut frame = String::with_capacity(line.len() + 1);
        frame.push_str(line.trim_end_matches(['\r', '\n']));
        frame.push('\n');
        self.link()?.write_all(frame.as_bytes())?;
        debug!("serial <- {}", escape_line(line));
        Ok(())
    }

    /// Whether unread input is buffered either here or in the port.
    pub fn has_pending_input(&mut self) -> Result<bool, TransportError> {
        if !self.rx_buf.is_empty() {
            return Ok(true);
        }
        Ok(self.link()?.bytes_to_read()? > 0)
    }

    /// Next complete line if one is already available, without waiting.
    pub fn try_read_line(&mut self) -> Result<Option<String>, TransportError> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        self.fill()?;
        Ok(self.take_line())
    }

    /// Next line, or `None` once `timeout` has elapsed without a complete line.
    pub async fn read_line_with_timeout(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.try_read_line()? {
                return Ok(Some(line));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Drop an unterminated fragment left behind by an earlier read. Complete lines
    /// already buffered are kept. Returns the number of bytes discarded.
    pub fn discard_partial_line(&mut self) -> Result<usize, TransportError> {
        self.fill()?;
        let keep = self.rx_buf.iter().rposition(|&b| b == b'\n').map_or(0, |pos| pos + 1);
        let dropped = self.rx_buf.len() - keep;
        if dropped > 0 {
            debug!(
                "Discarding partial serial line: {}",
                escape_line(&String::from_utf8_lossy(&self.rx_buf[keep..]))
            );
            self.rx_buf.truncate(keep);
        }
        Ok(dropped)
    }

    /// Tear the link down. Safe to call repeatedly; only the first call after a
    /// successful open is counted as a fault.
    pub fn fault(&mut self, reason: &str) {
        self.rx_buf.clear();
        self.last_fault = Some(reason.to_string());
        if self.link.take().is_some() {
            self.metrics.inc_fault();
            warn!(
                "Serial link on {} faulted: {} (will reconnect on next use)",
                self.opener.port_name(),
                reason
            );
        } else {
            debug!("Fault on already closed serial link: {}", reason);
        }
        self.state = ChannelState::Disconnected;
    }

    fn fill(&mut self) -> Result<(), TransportError> {
        let link = self.link()?;
        let available = link.bytes_to_read()?;
        if available == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; available.min(1024)];
        let n = link.read(&mut buf)?;
        self.rx_buf.extend_from_slice(&buf[..n]);
        if self.rx_buf.len() > MAX_LINE_BYTES && !self.rx_buf.contains(&b'\n') {
            warn!("Discarding {} bytes of unterminated serial input", self.rx_buf.len());
            self.rx_buf.clear();
        }
        Ok(())
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.rx_buf.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.rx_buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw[..raw.len() - 1])
            .trim_end_matches('\r')
            .to_string();
        debug!("serial -> {}", escape_line(&line));
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockDevice;
    use super::*;
    use crate::shutdown;

    fn channel_for(device: &MockDevice, policy: BackoffPolicy) -> SerialChannel {
        SerialChannel::new(Box::new(device.opener("mock0")), policy, Arc::new(BridgeMetrics::new()))
            .with_settle(Duration::ZERO)
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn opens_lazily_and_reads_lines() {
        let device = MockDevice::new();
        let (_trigger, mut sd) = shutdown::channel();
        let mut chan = channel_for(&device, BackoffPolicy::default());
        assert_eq!(chan.state(), ChannelState::Disconnected);

        chan.acquire_open(&mut sd).await.unwrap();
        assert_eq!(chan.state(), ChannelState::Open);

        device.emit_raw(b"HOLDING: ");
        assert_eq!(chan.try_read_line().unwrap(), None);
        device.emit_raw(b"false\r\nSCAN");
        assert_eq!(chan.try_read_line().unwrap().as_deref(), Some("HOLDING: false"));
        assert!(chan.has_pending_input().unwrap());
        assert_eq!(chan.try_read_line().unwrap(), None);
    }

    #[tokio::test]
    async fn stale_bytes_are_purged_on_open() {
        let device = MockDevice::new();
        device.emit_line("xARM ready");
        let (_trigger, mut sd) = shutdown::channel();
        let mut chan = channel_for(&device, BackoffPolicy::default());
        chan.acquire_open(&mut sd).await.unwrap();
        assert!(!chan.has_pending_input().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_returns_none_at_deadline() {
        let device = MockDevice::new();
        let (_trigger, mut sd) = shutdown::channel();
        let mut chan = channel_for(&device, BackoffPolicy::default());
        chan.acquire_open(&mut sd).await.unwrap();

        let start = Instant::now();
        let line = chan.read_line_with_timeout(Duration::from_millis(300)).await.unwrap();
        assert_eq!(line, None);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(300), "returned early after {:?}", waited);
        assert!(waited < Duration::from_millis(320), "overslept: {:?}", waited);
    }

    #[tokio::test]
    async fn partial_line_is_discarded_but_complete_lines_kept() {
        let device = MockDevice::new();
        let (_trigger, mut sd) = shutdown::channel();
        let mut chan = channel_for(&device, BackoffPolicy::default());
        chan.acquire_open(&mut sd).await.unwrap();

        device.emit_raw(b"TEMP 21\nTEMP 2");
        assert_eq!(chan.discard_partial_line().unwrap(), 6);
        assert_eq!(chan.try_read_line().unwrap().as_deref(), Some("TEMP 21"));
        assert!(!chan.has_pending_input().unwrap());
        assert_eq!(chan.discard_partial_line().unwrap(), 0);
    }

    #[tokio::test]
    async fn write_appends_single_newline() {
        let device = MockDevice::new();
        let (_trigger, mut sd) = shutdown::channel();
        let mut chan = channel_for(&device, BackoffPolicy::default());
        chan.acquire_open(&mut sd).await.unwrap();
        chan.write_line("GET COLOR\n").unwrap();
        assert_eq!(device.written(), vec!["GET COLOR".to_string()]);
    }

    #[tokio::test]
    async fn fault_is_idempotent_and_forces_reconnect() {
        let device = MockDevice::new();
        let metrics = Arc::new(BridgeMetrics::new());
        let (_trigger, mut sd) = shutdown::channel();
        let mut chan = SerialChannel::new(Box::new(device.opener("mock0")), BackoffPolicy::default(), metrics.clone())
            .with_settle(Duration::ZERO);
        chan.acquire_open(&mut sd).await.unwrap();

        chan.fault("write failed");
        chan.fault("write failed again");
        assert_eq!(chan.state(), ChannelState::Disconnected);
        assert!(!chan.is_open());
        assert_eq!(chan.last_fault(), Some("write failed again"));
        assert_eq!(metrics.snapshot().faults, 1);
        assert!(matches!(chan.write_line("x"), Err(TransportError::NotOpen)));

        chan.acquire_open(&mut sd).await.unwrap();
        assert_eq!(device.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_opens_follow_backoff_and_reset() {
        let device = MockDevice::new();
        device.fail_opens(5);
        let (_trigger, mut sd) = shutdown::channel();
        let mut chan = channel_for(&device, BackoffPolicy::default());

        let start = Instant::now();
        chan.acquire_open(&mut sd).await.unwrap();
        // 2 + 4 + 8 + 16 + 30 seconds of waiting before the sixth attempt succeeds.
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(61), "waited {:?}", waited);
        assert_eq!(chan.current_backoff(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_reconnect_wait() {
        let device = MockDevice::new();
        device.unplug();
        let (trigger, mut sd) = shutdown::channel();
        let mut chan = channel_for(&device, BackoffPolicy::default());

        let stopper = tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            trigger.shutdown();
        });
        let result = chan.acquire_open(&mut sd).await;
        assert!(matches!(result, Err(BridgeError::Shutdown)));
        assert_eq!(chan.state(), ChannelState::Faulted);
        stopper.await.unwrap();
    }
}
