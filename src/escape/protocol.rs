//! DTM escape state machine.
//!
//! Drives a module from Direct Test Mode back to its application firmware:
//! 1. AwaitingModuleExit - Send `3F FF` at 19200 baud, wait for CTS to rise
//! 2. AwaitingFilesystemErase - Reopen at application settings, send `at&f*`
//! 3. AwaitingLicenseCheck - Send `at i 4` / `at i 14` and inspect the key
//!
//! The machine never blocks. It is driven by one event at a time (received
//! bytes, CTS samples, timer expiry) and publishes [`EscapeEvent`]s to a
//! subscriber closure.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::buffer::{ResponseBuffer, ResponsePattern};
use super::config::{
    PortSettings, SessionConfig, TimeoutPolicy, ADDRESS_QUERY_COMMAND, CLEAR_CONFIG_COMMAND,
    DTM_EXIT_COMMAND, ERASE_MIN_LINES, EXIT_CODE_CTS_ASSERTED, EXIT_CODE_LICENSE_MISSING,
    EXIT_CODE_OK, EXIT_CODE_SERIAL_PORT_ERROR, EXIT_CODE_TIMEOUT, LICENSE_QUERY_COMMAND,
    LICENSE_RESPONSE_LINES, LINE_END,
};
use super::error::{LineErrorKind, OpenError, TransportError};
use super::handshake::HandshakeMonitor;
use super::license::LicenseReport;
use super::timer::StageTimer;
use super::transport::SerialTransport;

/// Position of the escape sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Idle,
    AwaitingModuleExit,
    AwaitingFilesystemErase,
    AwaitingLicenseCheck,
}

impl Stage {
    /// Numeric stage id quoted in support diagnostics.
    pub fn id(&self) -> u8 {
        match self {
            Stage::Idle => 0,
            Stage::AwaitingModuleExit => 1,
            Stage::AwaitingFilesystemErase => 2,
            Stage::AwaitingLicenseCheck => 3,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::AwaitingModuleExit => "waiting for module to leave DTM",
            Stage::AwaitingFilesystemErase => "waiting for filesystem erase",
            Stage::AwaitingLicenseCheck => "checking license",
        };
        f.write_str(name)
    }
}

/// Terminal result of a run. Produced exactly once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "data", rename_all = "camelCase")]
pub enum Outcome {
    /// Module is out of DTM. `license_valid` is only meaningful when
    /// `license_checked` is set.
    Success {
        license_valid: bool,
        license_checked: bool,
    },
    /// Run ended by a non-fatal transport failure (e.g. a rejected write).
    Aborted { reason: String },
    /// No expected response before the stage deadline.
    Timeout,
    /// Device disappeared or access was revoked, or the mid-run reopen failed.
    PortError,
    /// CTS was asserted while the module should have been in DTM.
    HandshakeUnexpected,
}

impl Outcome {
    /// Process exit code reported when the host exits on completion.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Success {
                license_valid: false,
                license_checked: true,
            } => EXIT_CODE_LICENSE_MISSING,
            Outcome::Success { .. } => EXIT_CODE_OK,
            Outcome::Aborted { .. } | Outcome::PortError => EXIT_CODE_SERIAL_PORT_ERROR,
            Outcome::Timeout => EXIT_CODE_TIMEOUT,
            Outcome::HandshakeUnexpected => EXIT_CODE_CTS_ASSERTED,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Human-readable result.
    pub fn message(&self) -> String {
        match self {
            Outcome::Success {
                license_checked: false,
                ..
            } => "Escape from DTM mode complete, you can now communicate with the module as \
                  required. The module's license has not been checked."
                .into(),
            Outcome::Success { .. } => "Escape from DTM mode complete, you can now communicate \
                                        with the module as required."
                .into(),
            Outcome::Aborted { reason } => format!("DTM escape aborted: {}", reason),
            Outcome::Timeout => "Timed out waiting for the module to respond.".into(),
            Outcome::PortError => "Fatal error with serial connection. Please reconnect to the \
                                   device to continue."
                .into(),
            Outcome::HandshakeUnexpected => {
                "CTS should not be asserted whilst in DTM mode, aborting...".into()
            }
        }
    }
}

/// Context captured when a run times out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutDiagnostics {
    pub port_name: String,
    pub application: PortSettings,
    pub stage: Stage,
    pub handshake: bool,
    pub lines: u32,
    pub received: String,
}

impl TimeoutDiagnostics {
    pub fn message(&self) -> String {
        format!(
            "An error has occurred whilst attempting to exit DTM mode on the attached module. \
             Are you sure this module is a valid BL654 device and has the UART pins (and nRESET) \
             wired correctly? Are you sure {} is the correct serial port for this device? Are you \
             sure there is a valid firmware image loaded to the module? Are you sure the provided \
             serial settings (Baud rate: {}, Handshaking: {}) are correct?\n\n\
             Process ID: {} CTS: {}, Lines: {}, Data: {:?}",
            self.port_name,
            self.application.baud_rate,
            self.application.flow_control,
            self.stage.id(),
            u8::from(self.handshake),
            self.lines,
            self.received
        )
    }
}

/// Byte counters for the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Telemetry published by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum EscapeEvent {
    PortOpened { port: String, settings: PortSettings },
    PortClosed,
    StageEntered { stage: Stage },
    Sent { data: Vec<u8> },
    Received { data: Vec<u8> },
    HandshakeChanged { asserted: bool },
    LicenseChecked { report: LicenseReport },
    LineError { kind: LineErrorKind, message: String },
    TimedOut { diagnostics: TimeoutDiagnostics },
    Cancelled,
    Finished { outcome: Outcome },
}

impl EscapeEvent {
    /// Get a human-readable message for this event.
    pub fn message(&self) -> String {
        match self {
            EscapeEvent::PortOpened { port, settings } => format!("[{}:{}]", port, settings),
            EscapeEvent::PortClosed => "[Port not open]".into(),
            EscapeEvent::StageEntered { stage } => format!("Stage: {}", stage),
            EscapeEvent::Sent { data } => format!("< {}", render_sent(data)),
            EscapeEvent::Received { data } => format!("> {}", render_received(data)),
            EscapeEvent::HandshakeChanged { asserted } => {
                format!("CTS {}", if *asserted { "asserted" } else { "deasserted" })
            }
            EscapeEvent::LicenseChecked { report } => {
                if report.valid {
                    "License check: good key.".into()
                } else {
                    "License check: bad key.".into()
                }
            }
            EscapeEvent::LineError { kind, message } => {
                format!("Serial line error ({:?}): {}", kind, message)
            }
            EscapeEvent::TimedOut { diagnostics } => diagnostics.message(),
            EscapeEvent::Cancelled => "Operation cancelled!".into(),
            EscapeEvent::Finished { outcome } => outcome.message(),
        }
    }
}

/// Render module output for the transcript: CR/LF dropped, control and
/// non-ASCII bytes shown as `\XX`.
pub fn render_received(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &byte in data {
        match byte {
            b'\r' | b'\n' => {}
            b'\t' | 0x20..=0x7E => out.push(byte as char),
            _ => out.push_str(&format!("\\{:02X}", byte)),
        }
    }
    out
}

/// Render a transmitted command: the text of an AT command, or every byte
/// as `\XX` for binary commands.
pub fn render_sent(data: &[u8]) -> String {
    let body = data.strip_suffix(LINE_END).unwrap_or(data);
    if !body.is_empty() && body.iter().all(|&b| b == b' ' || b.is_ascii_graphic()) {
        String::from_utf8_lossy(body).into_owned()
    } else {
        data.iter().map(|b| format!("\\{:02X}", b)).collect()
    }
}

/// Data that only exists while a run is in progress.
struct ActiveRun {
    config: SessionConfig,
    stage: Stage,
    stage_timer: StageTimer,
    grace_timer: StageTimer,
}

/// DTM escape state machine.
pub struct EscapeMachine<T: SerialTransport, L: Fn(EscapeEvent)> {
    transport: T,
    monitor: Box<dyn HandshakeMonitor>,
    log: L,
    run: Option<ActiveRun>,
    buffer: ResponseBuffer,
    handshake: bool,
    counters: TrafficCounters,
}

impl<T: SerialTransport, L: Fn(EscapeEvent)> EscapeMachine<T, L> {
    /// Create a machine over the given transport, handshake strategy and event subscriber.
    pub fn new(transport: T, monitor: Box<dyn HandshakeMonitor>, log: L) -> Self {
        Self {
            transport,
            monitor,
            log,
            run: None,
            buffer: ResponseBuffer::new(),
            handshake: false,
            counters: TrafficCounters::default(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.run.as_ref().map_or(Stage::Idle, |run| run.stage)
    }

    pub fn is_active(&self) -> bool {
        self.run.is_some()
    }

    pub fn is_port_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Last observed CTS level.
    pub fn handshake_level(&self) -> bool {
        self.handshake
    }

    pub fn line_count(&self) -> u32 {
        self.buffer.line_count()
    }

    pub fn counters(&self) -> TrafficCounters {
        self.counters
    }

    pub fn is_stage_timer_armed(&self) -> bool {
        self.run.as_ref().is_some_and(|run| run.stage_timer.is_armed())
    }

    pub fn is_grace_timer_armed(&self) -> bool {
        self.run.as_ref().is_some_and(|run| run.grace_timer.is_armed())
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Begin a run: open at DTM settings and send the DTM exit command.
    ///
    /// Returns `Ok(Some(outcome))` if the run ended immediately (CTS asserted
    /// in DTM, or the first write failed).
    pub fn start(&mut self, config: SessionConfig) -> Result<Option<Outcome>, OpenError> {
        if self.run.is_some() {
            return Err(OpenError::Busy);
        }

        let port_name = config.port_name.trim().to_string();
        if port_name.is_empty() {
            return Err(OpenError::NoDevice);
        }

        // Nothing from an earlier run carries over
        self.counters = TrafficCounters::default();
        self.handshake = false;

        self.transport
            .open(&port_name, config.dtm)
            .map_err(|e| {
                warn!(port = %port_name, error = %e, "failed to open serial port");
                OpenError::OpenFailed(e.to_string())
            })?;
        self.emit(EscapeEvent::PortOpened {
            port: port_name.clone(),
            settings: config.dtm,
        });
        self.buffer.reset();

        let level = match self.transport.handshake_level() {
            Ok(level) => level,
            Err(e) => {
                self.close_port();
                return Err(OpenError::OpenFailed(e.to_string()));
            }
        };
        self.record_handshake(level);

        if self.monitor.checks_precondition() && level {
            warn!(port = %port_name, "CTS asserted at DTM settings");
            self.close_port();
            let outcome = Outcome::HandshakeUnexpected;
            self.emit(EscapeEvent::Finished {
                outcome: outcome.clone(),
            });
            return Ok(Some(outcome));
        }

        info!(
            port = %port_name,
            handshake = %self.monitor.mode(),
            license = config.check_license,
            "starting DTM escape"
        );

        let mut stage_timer = StageTimer::new();
        stage_timer.arm(config.module_timeout);
        self.run = Some(ActiveRun {
            config: SessionConfig {
                port_name,
                ..config
            },
            stage: Stage::Idle,
            stage_timer,
            grace_timer: StageTimer::new(),
        });
        self.enter_stage(Stage::AwaitingModuleExit);

        if let Err(e) = self.send(&DTM_EXIT_COMMAND) {
            return Ok(Some(self.fail_transport(e)));
        }

        if let Some(delay) = self.monitor.grace_period() {
            if let Some(run) = self.run.as_mut() {
                run.grace_timer.arm(delay);
            }
        }

        Ok(None)
    }

    /// Deliver bytes received from the module.
    pub fn on_bytes_received(&mut self, bytes: &[u8]) -> Option<Outcome> {
        if bytes.is_empty() {
            return None;
        }

        self.counters.rx_bytes += bytes.len() as u64;
        self.emit(EscapeEvent::Received {
            data: bytes.to_vec(),
        });

        let stage = self.stage();
        if stage == Stage::Idle {
            return None;
        }

        self.buffer.append(bytes);
        debug!(lines = self.buffer.line_count(), %stage, "response data accumulated");

        match stage {
            Stage::AwaitingFilesystemErase
                if self.buffer.line_count() >= ERASE_MIN_LINES
                    && self.buffer.contains(ResponsePattern::EraseComplete).is_some() =>
            {
                self.filesystem_erased()
            }
            Stage::AwaitingLicenseCheck if self.buffer.line_count() == LICENSE_RESPONSE_LINES => {
                Some(self.license_checked())
            }
            _ => None,
        }
    }

    /// Deliver a CTS sample.
    pub fn on_handshake_changed(&mut self, level: bool) -> Option<Outcome> {
        self.record_handshake(level);

        if level && self.stage() == Stage::AwaitingModuleExit && self.monitor.follows_line() {
            info!("CTS asserted, module has left DTM");
            return self.module_exited();
        }
        None
    }

    /// Deliver expiry of the blind-handshake grace timer.
    pub fn on_workaround_timer_fired(&mut self) -> Option<Outcome> {
        if self.stage() == Stage::AwaitingModuleExit {
            info!("grace delay elapsed, assuming module has left DTM");
            return self.module_exited();
        }
        None
    }

    /// Deliver expiry of the stage deadline.
    pub fn on_stage_timeout(&mut self) -> Option<Outcome> {
        let run = self.run.as_ref()?;

        let diagnostics = TimeoutDiagnostics {
            port_name: run.config.port_name.clone(),
            application: run.config.application,
            stage: run.stage,
            handshake: self.handshake,
            lines: self.buffer.line_count(),
            received: self.buffer.text().into_owned(),
        };
        warn!(
            stage = %diagnostics.stage,
            cts = diagnostics.handshake,
            lines = diagnostics.lines,
            "stage timed out"
        );
        self.emit(EscapeEvent::TimedOut { diagnostics });

        Some(self.finish(Outcome::Timeout))
    }

    /// Deliver a serial line error.
    pub fn on_line_error(&mut self, kind: LineErrorKind, message: &str) -> Option<Outcome> {
        self.emit(EscapeEvent::LineError {
            kind,
            message: message.to_string(),
        });

        if !kind.is_fatal() {
            debug!(?kind, message, "ignoring serial line error");
            return None;
        }

        warn!(?kind, message, "fatal serial line error");
        if self.run.is_some() {
            Some(self.finish(Outcome::PortError))
        } else {
            self.close_port();
            None
        }
    }

    /// Deliver a transport failure observed by the driver.
    pub fn on_transport_error(&mut self, error: TransportError) -> Option<Outcome> {
        self.on_line_error(error.kind(), &error.to_string())
    }

    /// Fire whichever timers are due at `now`.
    pub fn poll_timers(&mut self, now: Instant) -> Option<Outcome> {
        let run = self.run.as_mut()?;
        let stage_due = run.stage_timer.fire_if_due(now);
        let grace_due = run.grace_timer.fire_if_due(now);

        if stage_due {
            return self.on_stage_timeout();
        }
        if grace_due {
            return self.on_workaround_timer_fired();
        }
        None
    }

    /// Sample CTS and deliver it. Does nothing while the port is closed.
    pub fn poll_handshake(&mut self) -> Option<Outcome> {
        if !self.transport.is_open() {
            return None;
        }

        match self.transport.handshake_level() {
            Ok(level) => self.on_handshake_changed(level),
            Err(e) => self.on_transport_error(e),
        }
    }

    /// Abort the current run without producing an outcome.
    pub fn cancel(&mut self) {
        let was_active = self.run.take().is_some();
        self.close_port();
        self.buffer.reset();

        if was_active {
            info!("DTM escape cancelled");
            self.emit(EscapeEvent::Cancelled);
        }
    }

    /// CTS rose (or the grace delay elapsed): reopen at application settings
    /// and clear the module configuration.
    fn module_exited(&mut self) -> Option<Outcome> {
        let (port_name, settings) = {
            let run = self.run.as_mut()?;
            run.grace_timer.cancel();
            (run.config.port_name.clone(), run.config.application)
        };

        self.close_port();
        if let Err(e) = self.transport.open(&port_name, settings) {
            warn!(port = %port_name, %settings, error = %e, "failed to reopen at application settings");
            return Some(self.finish(Outcome::PortError));
        }
        self.emit(EscapeEvent::PortOpened {
            port: port_name,
            settings,
        });

        self.buffer.reset();
        self.enter_stage(Stage::AwaitingFilesystemErase);

        // Flush out anything the module collected while switching modes
        if let Err(e) = self.send(LINE_END) {
            return Some(self.fail_transport(e));
        }
        if let Err(e) = self.send_command(CLEAR_CONFIG_COMMAND) {
            return Some(self.fail_transport(e));
        }
        None
    }

    fn filesystem_erased(&mut self) -> Option<Outcome> {
        info!("module filesystem erased");
        self.buffer.reset();

        let check_license = self.run.as_ref()?.config.check_license;
        if !check_license {
            info!("license check not performed");
            return Some(self.finish(Outcome::Success {
                license_valid: false,
                license_checked: false,
            }));
        }

        self.enter_stage(Stage::AwaitingLicenseCheck);
        for command in [LICENSE_QUERY_COMMAND, ADDRESS_QUERY_COMMAND] {
            if let Err(e) = self.send_command(command) {
                return Some(self.fail_transport(e));
            }
        }
        None
    }

    fn license_checked(&mut self) -> Outcome {
        let report = LicenseReport::inspect(&self.buffer);
        info!(valid = report.valid, key = ?report.key, "license checked");

        let outcome = Outcome::Success {
            license_valid: report.valid,
            license_checked: true,
        };
        self.emit(EscapeEvent::LicenseChecked { report });
        self.finish(outcome)
    }

    fn enter_stage(&mut self, stage: Stage) {
        let Some(run) = self.run.as_mut() else {
            return;
        };

        run.stage = stage;
        if run.config.timeout_policy == TimeoutPolicy::PerStage {
            run.stage_timer.arm(run.config.module_timeout);
        }
        debug!(%stage, "entered stage");
        self.emit(EscapeEvent::StageEntered { stage });
    }

    fn send_command(&mut self, command: &str) -> Result<(), TransportError> {
        let data = [command.as_bytes(), LINE_END].concat();
        self.send(&data)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let written = self.transport.write(data)?;
        self.counters.tx_bytes += written as u64;
        debug!(data = %render_sent(data), bytes = written, "sent");
        self.emit(EscapeEvent::Sent {
            data: data.to_vec(),
        });
        Ok(())
    }

    fn record_handshake(&mut self, level: bool) {
        if level != self.handshake {
            self.handshake = level;
            self.emit(EscapeEvent::HandshakeChanged { asserted: level });
        }
    }

    fn fail_transport(&mut self, error: TransportError) -> Outcome {
        let outcome = if error.kind().is_fatal() {
            Outcome::PortError
        } else {
            Outcome::Aborted {
                reason: error.to_string(),
            }
        };
        warn!(error = %error, "transport failure during DTM escape");
        self.finish(outcome)
    }

    /// End the run: disarm timers, close the port and publish the outcome.
    fn finish(&mut self, outcome: Outcome) -> Outcome {
        if let Some(mut run) = self.run.take() {
            run.stage_timer.cancel();
            run.grace_timer.cancel();
        }
        self.close_port();
        self.buffer.reset();

        info!(?outcome, "DTM escape finished");
        self.emit(EscapeEvent::Finished {
            outcome: outcome.clone(),
        });
        outcome
    }

    fn close_port(&mut self) {
        if self.transport.is_open() {
            self.transport.close();
            self.emit(EscapeEvent::PortClosed);
        }
    }

    fn emit(&self, event: EscapeEvent) {
        (self.log)(event);
    }
}
