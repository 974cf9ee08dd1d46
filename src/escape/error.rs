//! Error types for the DTM escape.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::STANDARD_MAX_BAUD_RATE;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors reported by the serial transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device does not exist (unplugged or misspelled).
    #[error("Serial device '{port}' not found")]
    NotFound { port: String },

    /// Serial port is busy (in use by another process).
    #[error("Port '{port}' is busy or in use by another application")]
    PortBusy { port: String },

    /// Permission denied accessing serial port.
    #[error("Permission denied for port '{port}'")]
    PortPermissionDenied { port: String },

    /// An operation needed an open port.
    #[error("Serial port is not open")]
    NotOpen,
}

impl TransportError {
    /// Classify this error the way line errors are classified.
    pub fn kind(&self) -> LineErrorKind {
        match self {
            TransportError::PortPermissionDenied { .. } => LineErrorKind::Permission,
            TransportError::NotFound { .. } | TransportError::NotOpen => LineErrorKind::Resource,
            TransportError::Io(e) => LineErrorKind::from_io(e.kind()),
            TransportError::Serial(e) => match e.kind() {
                serialport::ErrorKind::NoDevice => LineErrorKind::Resource,
                serialport::ErrorKind::Io(kind) => LineErrorKind::from_io(kind),
                _ => LineErrorKind::Other,
            },
            TransportError::PortBusy { .. } => LineErrorKind::Other,
        }
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Serial(_) => "DTM-001",
            TransportError::Io(_) => "DTM-002",
            TransportError::NotFound { .. } => "DTM-050",
            TransportError::PortBusy { .. } => "DTM-052",
            TransportError::PortPermissionDenied { .. } => "DTM-053",
            TransportError::NotOpen => "DTM-055",
        }
    }
}

/// Class of a serial line error.
///
/// Resource and permission errors mean the device went away (unplugged, or
/// access revoked) and are fatal to a run. Anything else is reported and
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineErrorKind {
    Resource,
    Permission,
    Other,
}

impl LineErrorKind {
    fn from_io(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind;

        match kind {
            ErrorKind::PermissionDenied => LineErrorKind::Permission,
            ErrorKind::NotFound
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => LineErrorKind::Resource,
            _ => LineErrorKind::Other,
        }
    }

    /// Whether this error ends an active run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LineErrorKind::Resource | LineErrorKind::Permission)
    }
}

/// Reasons a run could not be started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenError {
    /// No serial device was specified.
    #[error("No serial port was selected")]
    NoDevice,

    /// The transport refused to open.
    #[error("Error whilst attempting to open the serial device: {0}")]
    OpenFailed(String),

    /// A run is already in progress on this machine.
    #[error("An escape run is already in progress")]
    Busy,
}

impl OpenError {
    /// Troubleshooting text shown alongside the error.
    pub fn hint(&self, baud_rate: u32) -> String {
        match self {
            OpenError::NoDevice => "Please select a serial port and try again. If no serial \
                ports are listed, ensure your device is connected and its drivers are installed."
                .to_string(),
            OpenError::OpenFailed(_) => {
                let mut hint = String::from(
                    "If the serial port is open in another application, please close the other \
                     application",
                );
                if cfg!(not(any(target_os = "windows", target_os = "macos"))) {
                    hint.push_str(
                        ", please also ensure you have been granted permission to the serial \
                         device in /dev/",
                    );
                }
                if baud_rate > STANDARD_MAX_BAUD_RATE {
                    hint.push_str(&format!(
                        ", please also ensure that your serial device supports baud rates \
                         greater than {} (normal COM ports do not)",
                        STANDARD_MAX_BAUD_RATE
                    ));
                }
                hint.push_str(" and try again.");
                hint
            }
            OpenError::Busy => "Wait for the current run to finish or cancel it first.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_kind() {
        assert_eq!(
            TransportError::PortPermissionDenied {
                port: "COM3".into()
            }
            .kind(),
            LineErrorKind::Permission
        );
        assert_eq!(
            TransportError::NotFound {
                port: "/dev/ttyUSB0".into()
            }
            .kind(),
            LineErrorKind::Resource
        );
        assert_eq!(
            TransportError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).kind(),
            LineErrorKind::Resource
        );
        assert_eq!(
            TransportError::Io(std::io::Error::from(std::io::ErrorKind::InvalidData)).kind(),
            LineErrorKind::Other
        );
    }

    #[test]
    fn test_line_error_kind_is_fatal() {
        assert!(LineErrorKind::Resource.is_fatal());
        assert!(LineErrorKind::Permission.is_fatal());
        assert!(!LineErrorKind::Other.is_fatal());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(TransportError::NotOpen.error_code(), "DTM-055");
        assert_eq!(
            TransportError::PortBusy {
                port: "COM1".into()
            }
            .error_code(),
            "DTM-052"
        );
    }

    #[test]
    fn test_open_error_hint_mentions_high_baud() {
        let hint = OpenError::OpenFailed("busy".into()).hint(1_000_000);
        assert!(hint.contains("greater than 115200"));

        let hint = OpenError::OpenFailed("busy".into()).hint(115_200);
        assert!(!hint.contains("greater than"));
        assert!(hint.ends_with("and try again."));
    }
}
