//! Recovery of BL654 modules stuck in Direct Test Mode (DTM).
//!
//! A module left in DTM only answers the binary HCI test protocol at
//! 19200 baud. This module talks it back into its AT firmware over the
//! serial port it is attached to.
//!
//! # Sequence Overview
//!
//! 1. **DTM Exit** - Open at 19200,N and send `3F FF`; the module reboots
//!    and raises CTS (or a grace delay passes on hosts without usable CTS)
//! 2. **Filesystem Erase** - Reopen at application settings and send
//!    `at&f*`; wait for `FFS Erased, Rebooting...` and the `00` response
//! 3. **License Check** (optional) - Send `at i 4` and `at i 14`, and
//!    check the license key against the unprogrammed placeholder
//!
//! # Example
//!
//! ```ignore
//! use escape::{monitor_for, EscapeMachine, HandshakeMode, SerialPortTransport, SessionConfig};
//!
//! let mut machine = EscapeMachine::new(
//!     SerialPortTransport::new(),
//!     monitor_for(HandshakeMode::for_platform()),
//!     |event| println!("{}", event.message()),
//! );
//! machine.start(SessionConfig::new("/dev/ttyUSB0"))?;
//! ```

mod buffer;
mod config;
mod error;
mod handshake;
mod license;
mod protocol;
mod timer;
mod transport;

// Configuration
pub use config::{
    FlowControl, PortSettings, SessionConfig, TimeoutPolicy, EXIT_CODE_INVALID_PORT, EXIT_CODE_OK,
    HANDSHAKE_POLL_INTERVAL, MODULE_TIMEOUT,
};

// Errors
pub use error::OpenError;

// Handshake strategy
pub use handshake::{monitor_for, HandshakeMode};

// State machine
pub use license::LicenseReport;
pub use protocol::{EscapeEvent, EscapeMachine, Outcome, TrafficCounters};

// Transport
pub use transport::{SerialPortTransport, SerialTransport};

// Used by the scripted fake module and fixtures
#[cfg(test)]
pub use config::{DEFAULT_APP_BAUD_RATE, DTM_BAUD_RATE, DTM_EXIT_COMMAND};
#[cfg(test)]
pub use error::{TransportError, TransportResult};
#[cfg(test)]
pub use protocol::Stage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify key types are accessible
        let _ = std::any::type_name::<EscapeMachine<SerialPortTransport, fn(EscapeEvent)>>();
        let _ = std::any::type_name::<Outcome>();
        let _ = std::any::type_name::<LicenseReport>();
    }
}
