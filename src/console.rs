//! Console rendering of escape events and results.

use crate::cli::RecoverOptions;
use crate::escape::{EscapeEvent, LicenseReport, OpenError, Outcome};
use crate::session::{SessionEnd, SessionReport};

/// How much the console prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Nothing; the exit code is the only result.
    Silent,
    /// A single result line.
    Summary,
    /// Serial traffic, stage changes and a detailed result.
    Transcript,
}

impl Verbosity {
    pub fn from_options(opts: &RecoverOptions) -> Self {
        if opts.no_window() {
            Verbosity::Silent
        } else if opts.auto_exit {
            Verbosity::Summary
        } else {
            Verbosity::Transcript
        }
    }
}

pub struct Console {
    verbosity: Verbosity,
    license: Option<LicenseReport>,
}

impl Console {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            license: None,
        }
    }

    /// Line to print for an event as it happens.
    pub fn render_event(&mut self, event: &EscapeEvent) -> Option<String> {
        match event {
            EscapeEvent::LicenseChecked { report } => {
                self.license = Some(report.clone());
                None
            }
            // The outcome is printed with the final report
            EscapeEvent::Finished { .. } => None,
            _ if self.verbosity == Verbosity::Transcript => Some(event.message()),
            _ => None,
        }
    }

    /// Result text for a completed run.
    pub fn render_report(&self, report: &SessionReport) -> Option<String> {
        let mut text = match &report.end {
            SessionEnd::Finished(outcome) => self.outcome_text(outcome),
            SessionEnd::Cancelled => "Operation cancelled.".to_string(),
        };

        match self.verbosity {
            Verbosity::Silent => None,
            Verbosity::Summary => Some(format!(
                "{} (exit code {})",
                text.replace("\n\n", " ").replace('\n', " "),
                report.end.exit_code()
            )),
            Verbosity::Transcript => {
                text.push_str(&format!(
                    "\n\nRX: {} bytes, TX: {} bytes",
                    report.counters.rx_bytes, report.counters.tx_bytes
                ));
                Some(text)
            }
        }
    }

    /// Error text for a run that could not start.
    pub fn render_open_error(&self, error: &OpenError, baud_rate: u32) -> Option<String> {
        match self.verbosity {
            Verbosity::Silent => None,
            Verbosity::Summary => Some(error.to_string()),
            Verbosity::Transcript => Some(format!("{}\n\n{}", error, error.hint(baud_rate))),
        }
    }

    fn outcome_text(&self, outcome: &Outcome) -> String {
        let mut text = outcome.message();
        if let (
            Outcome::Success {
                license_checked: true,
                ..
            },
            Some(report),
        ) = (outcome, &self.license)
        {
            text.push_str("\n\n");
            text.push_str(&report.message());
        }
        text
    }
}
