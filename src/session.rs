//! Blocking driver that feeds serial input, CTS samples, timer expiry and
//! cancellation into an [`EscapeMachine`].
//!
//! Runs on a single thread. The front-end moves it onto a blocking task and
//! receives [`EscapeEvent`]s through the subscriber closure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::escape::{
    monitor_for, EscapeEvent, EscapeMachine, HandshakeMode, OpenError, Outcome,
    SerialPortTransport, SerialTransport, SessionConfig, TrafficCounters, HANDSHAKE_POLL_INTERVAL,
};

/// Exit code when the user interrupts a run.
pub const EXIT_CODE_CANCELLED: i32 = 1;

/// Largest chunk handed to the machine per read.
const READ_CHUNK_SIZE: usize = 1024;

/// Pause between loop iterations that had nothing to read from.
const IDLE_DELAY: Duration = Duration::from_millis(5);

/// How a driven run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "end", content = "data", rename_all = "camelCase")]
pub enum SessionEnd {
    Finished(Outcome),
    Cancelled,
}

impl SessionEnd {
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionEnd::Finished(outcome) => outcome.exit_code(),
            SessionEnd::Cancelled => EXIT_CODE_CANCELLED,
        }
    }
}

/// Summary of a driven run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub end: SessionEnd,
    pub counters: TrafficCounters,
}

/// Run one escape on `machine` until it produces an outcome or `cancel` is set.
pub fn run_session<T, L>(
    machine: &mut EscapeMachine<T, L>,
    config: SessionConfig,
    cancel: &AtomicBool,
) -> Result<SessionReport, OpenError>
where
    T: SerialTransport,
    L: Fn(EscapeEvent),
{
    let end = drive(machine, config, cancel)?;
    Ok(SessionReport {
        end,
        counters: machine.counters(),
    })
}

fn drive<T, L>(
    machine: &mut EscapeMachine<T, L>,
    config: SessionConfig,
    cancel: &AtomicBool,
) -> Result<SessionEnd, OpenError>
where
    T: SerialTransport,
    L: Fn(EscapeEvent),
{
    if let Some(outcome) = machine.start(config)? {
        return Ok(SessionEnd::Finished(outcome));
    }

    let mut buffer = [0u8; READ_CHUNK_SIZE];
    let mut next_handshake_poll = Instant::now() + HANDSHAKE_POLL_INTERVAL;

    loop {
        if cancel.load(Ordering::SeqCst) {
            machine.cancel();
            return Ok(SessionEnd::Cancelled);
        }

        let now = Instant::now();
        if let Some(outcome) = machine.poll_timers(now) {
            return Ok(SessionEnd::Finished(outcome));
        }

        if now >= next_handshake_poll {
            next_handshake_poll = now + HANDSHAKE_POLL_INTERVAL;
            if let Some(outcome) = machine.poll_handshake() {
                return Ok(SessionEnd::Finished(outcome));
            }
        }

        if !machine.is_port_open() {
            thread::sleep(IDLE_DELAY);
            continue;
        }

        let outcome = match machine.transport_mut().read(&mut buffer) {
            Ok(0) => None,
            Ok(count) => machine.on_bytes_received(&buffer[..count]),
            Err(e) => {
                debug!(error = %e, code = e.error_code(), "serial read failed");
                let outcome = machine.on_transport_error(e);
                if outcome.is_none() {
                    thread::sleep(IDLE_DELAY);
                }
                outcome
            }
        };
        if let Some(outcome) = outcome {
            return Ok(SessionEnd::Finished(outcome));
        }
    }
}

/// Escape the module on `config.port_name` using the real serial port.
pub fn run_recovery<F>(
    config: SessionConfig,
    mode: HandshakeMode,
    cancel: &AtomicBool,
    on_event: F,
) -> Result<SessionReport, OpenError>
where
    F: Fn(EscapeEvent),
{
    info!(
        port = %config.port_name,
        application = %config.application,
        %mode,
        "recovering module"
    );

    let mut machine = EscapeMachine::new(SerialPortTransport::new(), monitor_for(mode), on_event);
    run_session(&mut machine, config, cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::mpsc;
    use std::sync::Arc;

    use crate::escape::DTM_EXIT_COMMAND;
    use crate::test_helpers::fixtures::only_opened_at_dtm;
    use crate::test_helpers::{FakeModuleBuilder, FakeTransport};

    fn run(
        transport: FakeTransport,
        config: SessionConfig,
        cancel: &AtomicBool,
    ) -> (Result<SessionReport, OpenError>, Vec<EscapeEvent>, FakeTransport) {
        let (tx, rx) = mpsc::channel();
        let mut machine = EscapeMachine::new(transport, monitor_for(HandshakeMode::Line), move |event| {
            tx.send(event).ok();
        });
        let result = run_session(&mut machine, config, cancel);
        let events = rx.try_iter().collect();

        let mut transport = FakeTransport::new();
        std::mem::swap(machine.transport_mut(), &mut transport);
        (result, events, transport)
    }

    #[test]
    fn test_run_to_success() {
        let cancel = AtomicBool::new(false);
        let (result, events, transport) = run(
            FakeModuleBuilder::new().build(),
            SessionConfig::new("/dev/ttyUSB0"),
            &cancel,
        );

        let report = result.unwrap();
        assert_eq!(
            report.end,
            SessionEnd::Finished(Outcome::Success {
                license_valid: true,
                license_checked: true
            })
        );
        assert_eq!(report.end.exit_code(), 0);
        assert_eq!(report.counters.tx_bytes, 24);
        assert!(report.counters.rx_bytes > 0);
        assert!(!transport.is_open());
        assert_eq!(transport.opens().len(), 2);
        assert!(matches!(events.last(), Some(EscapeEvent::Finished { .. })));
    }

    #[test]
    fn test_run_without_license_check() {
        let cancel = AtomicBool::new(false);
        let config = SessionConfig::new("COM3").with_license_check(false);
        let (result, _, transport) = run(FakeModuleBuilder::new().build(), config, &cancel);

        assert_eq!(result.unwrap().end.exit_code(), 0);
        assert_eq!(transport.writes().len(), 3);
    }

    #[test]
    fn test_run_times_out() {
        let cancel = AtomicBool::new(false);
        let config = SessionConfig::new("COM3").with_module_timeout(Duration::from_millis(250));
        let (result, events, transport) =
            run(FakeModuleBuilder::new().stuck_in_dtm().build(), config, &cancel);

        let report = result.unwrap();
        assert_eq!(report.end, SessionEnd::Finished(Outcome::Timeout));
        assert_eq!(report.end.exit_code(), -4);
        assert!(!transport.is_open());
        assert!(events
            .iter()
            .any(|e| matches!(e, EscapeEvent::TimedOut { .. })));
    }

    #[test]
    fn test_cancelled_before_first_poll() {
        let cancel = AtomicBool::new(true);
        let (result, events, transport) = run(
            FakeModuleBuilder::new().build(),
            SessionConfig::new("COM3"),
            &cancel,
        );

        let report = result.unwrap();
        assert_eq!(report.end, SessionEnd::Cancelled);
        assert_eq!(report.end.exit_code(), EXIT_CODE_CANCELLED);
        assert!(!transport.is_open());
        assert!(!events
            .iter()
            .any(|e| matches!(e, EscapeEvent::Finished { .. })));
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });

        let (result, _, _) = run(
            FakeModuleBuilder::new().stuck_in_dtm().build(),
            SessionConfig::new("COM3"),
            &cancel,
        );
        canceller.join().unwrap();

        assert_eq!(result.unwrap().end, SessionEnd::Cancelled);
    }

    #[test]
    fn test_fatal_read_error_ends_run() {
        let cancel = AtomicBool::new(false);
        let mut transport = FakeModuleBuilder::new().stuck_in_dtm().build();
        transport.fail_reads_with(io::ErrorKind::BrokenPipe);

        let (result, _, _) = run(transport, SessionConfig::new("COM3"), &cancel);
        let report = result.unwrap();

        assert_eq!(report.end, SessionEnd::Finished(Outcome::PortError));
        assert_eq!(report.end.exit_code(), -5);
    }

    #[test]
    fn test_non_fatal_read_errors_are_ignored() {
        let cancel = AtomicBool::new(false);
        let mut transport = FakeModuleBuilder::new().stuck_in_dtm().build();
        transport.fail_reads_with(io::ErrorKind::InvalidData);
        let config = SessionConfig::new("COM3").with_module_timeout(Duration::from_millis(100));

        let (result, events, _) = run(transport, config, &cancel);

        assert_eq!(result.unwrap().end, SessionEnd::Finished(Outcome::Timeout));
        assert!(events
            .iter()
            .any(|e| matches!(e, EscapeEvent::LineError { .. })));
    }

    #[test]
    fn test_reopen_failure_ends_run() {
        let cancel = AtomicBool::new(false);
        let (result, _, transport) = run(
            FakeModuleBuilder::new().reopen_fails().build(),
            SessionConfig::new("COM3"),
            &cancel,
        );

        let report = result.unwrap();
        assert_eq!(report.end, SessionEnd::Finished(Outcome::PortError));
        assert_eq!(report.end.exit_code(), -5);
        assert!(only_opened_at_dtm(&transport));
        assert_eq!(transport.writes(), &[DTM_EXIT_COMMAND.to_vec()]);
        assert!(!transport.is_open());
    }

    #[test]
    fn test_open_error_is_returned() {
        let cancel = AtomicBool::new(false);
        let (result, events, _) = run(FakeTransport::new(), SessionConfig::new(""), &cancel);

        assert_eq!(result, Err(OpenError::NoDevice));
        assert!(events.is_empty());
    }
}
