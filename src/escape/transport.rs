//! Serial transport layer for the DTM escape.
//!
//! Provides a trait-based abstraction over the serial port so the state
//! machine can be driven by real hardware or by a scripted fake in tests.

use std::io::{Read, Write};
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use serialport::SerialPort;
use tracing::{debug, trace};

use super::config::{FlowControl, PortSettings, SERIAL_READ_TIMEOUT};
use super::error::{TransportError, TransportResult};

/// Trait for serial transport operations used by the escape state machine.
#[cfg_attr(test, automock)]
pub trait SerialTransport: Send {
    /// Open the named device with 8N1 framing and the given settings.
    ///
    /// An already open port is fully closed first.
    fn open(&mut self, port_name: &str, settings: PortSettings) -> TransportResult<()>;

    /// Close the port. Does nothing if it is not open.
    fn close(&mut self);

    /// Whether the port is currently open.
    fn is_open(&self) -> bool;

    /// Write raw bytes, returning the number of bytes written.
    fn write(&mut self, data: &[u8]) -> TransportResult<usize>;

    /// Read whatever is available into `buffer`.
    ///
    /// Returns 0 if nothing arrived within the transport's read timeout.
    fn read(&mut self, buffer: &mut [u8]) -> TransportResult<usize>;

    /// Current level of the CTS input (`true` = asserted).
    fn handshake_level(&mut self) -> TransportResult<bool>;
}

/// Serial port transport implementation.
pub struct SerialPortTransport {
    port: Option<Box<dyn SerialPort>>,
    read_timeout: Duration,
}

impl SerialPortTransport {
    pub fn new() -> Self {
        Self::with_read_timeout(SERIAL_READ_TIMEOUT)
    }

    pub fn with_read_timeout(read_timeout: Duration) -> Self {
        Self {
            port: None,
            read_timeout,
        }
    }

    fn port_mut(&mut self) -> TransportResult<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Default for SerialPortTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialTransport for SerialPortTransport {
    fn open(&mut self, port_name: &str, settings: PortSettings) -> TransportResult<()> {
        self.close();

        let normalized_name = normalize_port_name(port_name);
        debug!(port = %normalized_name, %settings, "opening serial port");

        let port = serialport::new(&normalized_name, settings.baud_rate)
            .timeout(self.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(to_serialport_flow(settings.flow_control))
            .open()
            .map_err(|e| map_open_error(port_name, e))?;

        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(port) = self.port.take() {
            // Discard anything still queued in either direction before dropping the handle
            port.clear(serialport::ClearBuffer::All).ok();
            debug!("serial port closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, data: &[u8]) -> TransportResult<usize> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        trace!(bytes = data.len(), "wrote to serial port");
        Ok(data.len())
    }

    fn read(&mut self, buffer: &mut [u8]) -> TransportResult<usize> {
        let port = self.port_mut()?;

        match port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn handshake_level(&mut self) -> TransportResult<bool> {
        let port = self.port_mut()?;
        Ok(port.read_clear_to_send()?)
    }
}

fn to_serialport_flow(flow: FlowControl) -> serialport::FlowControl {
    match flow {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
        FlowControl::Software => serialport::FlowControl::Software,
    }
}

/// Convert a serialport open failure into the matching transport error.
fn map_open_error(port_name: &str, e: serialport::Error) -> TransportError {
    let err_str = e.to_string().to_lowercase();

    match e.kind() {
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            TransportError::PortPermissionDenied {
                port: port_name.to_string(),
            }
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) | serialport::ErrorKind::NoDevice => {
            TransportError::NotFound {
                port: port_name.to_string(),
            }
        }
        _ if err_str.contains("busy") || err_str.contains("in use") => TransportError::PortBusy {
            port: port_name.to_string(),
        },
        _ => TransportError::Serial(e),
    }
}

/// Normalize a port name for cross-platform compatibility.
#[cfg(target_os = "windows")]
fn normalize_port_name(name: &str) -> String {
    windows_port_name(name)
}

/// Normalize a port name for cross-platform compatibility.
#[cfg(not(target_os = "windows"))]
fn normalize_port_name(name: &str) -> String {
    // Prefer cu. over tty. so opening does not block waiting for DCD
    if cfg!(target_os = "macos") && name.starts_with("/dev/tty.") {
        return name.replace("/dev/tty.", "/dev/cu.");
    }

    name.to_string()
}

/// Windows device path for `name`. Anything that is not already a COM name
/// or a device path gets the `COM` prefix, and COM ports > 9 need `\\.\`.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn windows_port_name(name: &str) -> String {
    if name.starts_with("\\\\") {
        return name.to_string();
    }

    let name = if name.to_ascii_uppercase().starts_with("COM") {
        name.to_string()
    } else {
        format!("COM{}", name)
    };

    match name.get(3..).and_then(|number| number.parse::<u32>().ok()) {
        Some(n) if n > 9 => format!("\\\\.\\{}", name),
        _ => name,
    }
}
