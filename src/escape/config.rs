//! Configuration constants and per-run session configuration for the DTM escape.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Serial Communication
// ============================================================================

/// Baud rate the module listens on while it is in Direct Test Mode.
pub const DTM_BAUD_RATE: u32 = 19_200;

/// Flow control used while the module is in Direct Test Mode.
pub const DTM_FLOW_CONTROL: FlowControl = FlowControl::None;

/// Default application-mode baud rate of the module firmware.
pub const DEFAULT_APP_BAUD_RATE: u32 = 115_200;

/// Default application-mode flow control of the module firmware.
pub const DEFAULT_APP_FLOW_CONTROL: FlowControl = FlowControl::Hardware;

/// Read timeout used by the session driver for each input poll.
///
/// Kept short so timer expiry and CTS polling are serviced promptly.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Baud rates above this need a serial adapter with high-speed support.
pub const STANDARD_MAX_BAUD_RATE: u32 = 115_200;

// ============================================================================
// Timing
// ============================================================================

/// Time until a run is considered timed out (14 seconds).
pub const MODULE_TIMEOUT: Duration = Duration::from_millis(14_000);

/// Cadence at which the CTS line is sampled while the port is open.
pub const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delay after the DTM exit command before the blind monitor assumes the
/// module has left DTM.
pub const BLIND_HANDSHAKE_GRACE: Duration = Duration::from_millis(350);

// ============================================================================
// Wire Commands
// ============================================================================

/// Two-byte command that makes the module leave Direct Test Mode.
pub const DTM_EXIT_COMMAND: [u8; 2] = [0x3F, 0xFF];

/// Line terminator appended to every AT command.
pub const LINE_END: &[u8] = b"\r";

/// Restores factory configuration and erases the module filesystem.
pub const CLEAR_CONFIG_COMMAND: &str = "at&f*";

/// Queries the license key.
pub const LICENSE_QUERY_COMMAND: &str = "at i 4";

/// Queries the Bluetooth address (needed by support to issue a license).
pub const ADDRESS_QUERY_COMMAND: &str = "at i 14";

// ============================================================================
// Response Matching
// ============================================================================

/// Printed by the module once `at&f*` has erased the filesystem.
pub const ERASE_MARKER: &str = "\nFFS Erased, Rebooting...";

/// Success response terminator of the AT firmware.
pub const RESPONSE_OK_MARKER: &str = "\n00\r";

/// Minimum number of received lines before the erase response is inspected.
pub const ERASE_MIN_LINES: u32 = 2;

/// Number of received lines that make up the two license query responses.
pub const LICENSE_RESPONSE_LINES: u32 = 4;

/// Placeholder key programmed into modules without a real license.
pub const SENTINEL_LICENSE_KEY: &str = "0016A4C0FFEE";

// ============================================================================
// Process Exit Codes
// ============================================================================

pub const EXIT_CODE_OK: i32 = 0;
pub const EXIT_CODE_INVALID_PORT: i32 = -1;
pub const EXIT_CODE_CTS_ASSERTED: i32 = -2;
pub const EXIT_CODE_LICENSE_MISSING: i32 = -3;
pub const EXIT_CODE_TIMEOUT: i32 = -4;
pub const EXIT_CODE_SERIAL_PORT_ERROR: i32 = -5;

// ============================================================================
// Port Settings
// ============================================================================

/// Serial flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    None,
    #[default]
    Hardware,
    Software,
}

impl FlowControl {
    /// Parse the numeric selector used on the command line (0 = none,
    /// 1 = hardware, 2 = software).
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(FlowControl::None),
            1 => Some(FlowControl::Hardware),
            2 => Some(FlowControl::Software),
            _ => None,
        }
    }

    /// Single-letter code used in status lines.
    pub fn short_code(&self) -> char {
        match self {
            FlowControl::None => 'N',
            FlowControl::Hardware => 'H',
            FlowControl::Software => 'S',
        }
    }
}

impl fmt::Display for FlowControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowControl::None => "None",
            FlowControl::Hardware => "Hardware (CTS/RTS)",
            FlowControl::Software => "Software (XON/XOFF)",
        };
        f.write_str(name)
    }
}

/// Baud rate and flow control for one open of the port. Framing is always 8N1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub flow_control: FlowControl,
}

impl PortSettings {
    pub const fn new(baud_rate: u32, flow_control: FlowControl) -> Self {
        Self {
            baud_rate,
            flow_control,
        }
    }

    /// Settings the module uses while stuck in Direct Test Mode.
    pub const fn dtm() -> Self {
        Self::new(DTM_BAUD_RATE, DTM_FLOW_CONTROL)
    }

    /// Default application-mode settings.
    pub const fn application_default() -> Self {
        Self::new(DEFAULT_APP_BAUD_RATE, DEFAULT_APP_FLOW_CONTROL)
    }
}

impl fmt::Display for PortSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.baud_rate, self.flow_control.short_code())
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// How the stage deadline is shared between the stages of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutPolicy {
    /// One deadline, armed at start, covers the whole escape sequence.
    #[default]
    Shared,
    /// The deadline is re-armed on entry to every stage.
    PerStage,
}

/// Immutable configuration for one escape run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// OS serial device identifier (e.g. "/dev/ttyUSB0" or "COM3").
    pub port_name: String,
    /// Settings used once the module is back in application mode.
    pub application: PortSettings,
    /// Settings used to talk to the module while it is in DTM.
    pub dtm: PortSettings,
    /// Query and validate the license key after the filesystem erase.
    pub check_license: bool,
    /// Stage deadline.
    pub module_timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
}

impl SessionConfig {
    /// Configuration with the module defaults for the given port.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            application: PortSettings::application_default(),
            dtm: PortSettings::dtm(),
            check_license: true,
            module_timeout: MODULE_TIMEOUT,
            timeout_policy: TimeoutPolicy::default(),
        }
    }

    pub fn with_application(mut self, settings: PortSettings) -> Self {
        self.application = settings;
        self
    }

    pub fn with_license_check(mut self, check_license: bool) -> Self {
        self.check_license = check_license;
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    pub fn with_module_timeout(mut self, timeout: Duration) -> Self {
        self.module_timeout = timeout;
        self
    }
}
