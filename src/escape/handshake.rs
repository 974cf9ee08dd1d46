//! CTS observation strategies.
//!
//! The module raises CTS once it has left DTM and rebooted into its
//! application firmware. On most hosts that edge is observed directly. On
//! macOS the CTS level reported by the driver cannot be trusted, so the
//! module is instead assumed to have left DTM after a fixed grace delay.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::BLIND_HANDSHAKE_GRACE;

/// How the module-exit signal is detected.
pub trait HandshakeMonitor: Send {
    /// Whether CTS asserted straight after opening at DTM settings aborts the run.
    fn checks_precondition(&self) -> bool;

    /// Whether an asserted CTS sample completes the module-exit stage.
    fn follows_line(&self) -> bool;

    /// Delay after the DTM exit command after which module exit is assumed.
    fn grace_period(&self) -> Option<Duration>;

    fn mode(&self) -> HandshakeMode;
}

/// Observes the CTS line directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct CtsLineMonitor;

impl HandshakeMonitor for CtsLineMonitor {
    fn checks_precondition(&self) -> bool {
        true
    }

    fn follows_line(&self) -> bool {
        true
    }

    fn grace_period(&self) -> Option<Duration> {
        None
    }

    fn mode(&self) -> HandshakeMode {
        HandshakeMode::Line
    }
}

/// Ignores the CTS line and assumes module exit after a grace delay.
#[derive(Debug, Clone, Copy)]
pub struct BlindGraceMonitor {
    delay: Duration,
}

impl BlindGraceMonitor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for BlindGraceMonitor {
    fn default() -> Self {
        Self::new(BLIND_HANDSHAKE_GRACE)
    }
}

impl HandshakeMonitor for BlindGraceMonitor {
    fn checks_precondition(&self) -> bool {
        false
    }

    fn follows_line(&self) -> bool {
        false
    }

    fn grace_period(&self) -> Option<Duration> {
        Some(self.delay)
    }

    fn mode(&self) -> HandshakeMode {
        HandshakeMode::Blind
    }
}

/// Selector for the handshake strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeMode {
    Line,
    Blind,
}

impl HandshakeMode {
    /// The strategy that works on the host platform.
    pub fn for_platform() -> Self {
        if cfg!(target_os = "macos") {
            HandshakeMode::Blind
        } else {
            HandshakeMode::Line
        }
    }
}

impl fmt::Display for HandshakeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeMode::Line => f.write_str("line"),
            HandshakeMode::Blind => f.write_str("blind"),
        }
    }
}

/// Build the monitor for a mode.
pub fn monitor_for(mode: HandshakeMode) -> Box<dyn HandshakeMonitor> {
    match mode {
        HandshakeMode::Line => Box::new(CtsLineMonitor),
        HandshakeMode::Blind => Box::new(BlindGraceMonitor::default()),
    }
}
