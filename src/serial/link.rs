//! Physical link abstraction and the `serialport` backed opener.

use std::io;
use std::time::Duration;

use crate::error::TransportError;

/// A raw, already-open byte link to the controller.
///
/// Reads must not block for long: callers only read after `bytes_to_read` reported
/// pending input, and the port read timeout bounds everything else.
pub trait SerialLink: Send {
    /// Number of bytes that can be read without blocking.
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer and flush it to the device.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Opens fresh links to the controller. Called again after every fault.
pub trait LinkOpener: Send {
    fn open(&mut self) -> Result<Box<dyn SerialLink>, TransportError>;

    /// Port identifier, for logs.
    fn port_name(&self) -> &str;
}

/// Opener for a real serial port.
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl SerialPortOpener {
    pub fn new(port: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            read_timeout,
        }
    }
}

#[cfg(feature = "serial")]
mod native {
    use std::io::{self, Read, Write};

    use serialport::SerialPort;

    use super::{LinkOpener, SerialLink, SerialPortOpener};
    use crate::error::TransportError;

    pub(super) struct NativeLink {
        port: Box<dyn SerialPort>,
    }

    impl SerialLink for NativeLink {
        fn bytes_to_read(&mut self) -> io::Result<usize> {
            self.port
                .bytes_to_read()
                .map(|n| n as usize)
                .map_err(io::Error::from)
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.port.read(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
                other => other,
            }
        }

        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.port.write_all(data)?;
            self.port.flush()
        }
    }

    impl LinkOpener for SerialPortOpener {
        fn open(&mut self) -> Result<Box<dyn SerialLink>, TransportError> {
            let mut builder = serialport::new(&self.port, self.baud_rate).timeout(self.read_timeout);
            #[cfg(unix)]
            {
                builder = builder
                    .data_bits(serialport::DataBits::Eight)
                    .stop_bits(serialport::StopBits::One)
                    .parity(serialport::Parity::None);
            }
            let mut port = builder.open().map_err(|e| TransportError::Open {
                port: self.port.clone(),
                reason: e.to_string(),
            })?;
            // Arduino-class boards reset on DTR; keep both lines asserted.
            let _ = port.write_data_terminal_ready(true);
            let _ = port.write_request_to_send(true);
            Ok(Box::new(NativeLink { port }))
        }

        fn port_name(&self) -> &str {
            &self.port
        }
    }
}

#[cfg(not(feature = "serial"))]
impl LinkOpener for SerialPortOpener {
    fn open(&mut self) -> Result<Box<dyn SerialLink>, TransportError> {
        Err(TransportError::Open {
            port: self.port.clone(),
            reason: "serial support not compiled in (enable the `serial` feature)".to_string(),
        })
    }

    fn port_name(&self) -> &str {
        &self.port
    }
}
