//! Command line parsing.
//!
//! Arguments are bare case-insensitive keywords (`NOLICENSE`) or
//! `KEY=value` pairs (`COM=/dev/ttyUSB0`) so existing scripts and launchers
//! keep working. `--help` and `--version` are accepted as well.

use std::path::PathBuf;

use thiserror::Error;

use crate::escape::FlowControl;
use crate::settings::RecoverySettings;

/// Exit code for malformed arguments or an unusable settings file.
pub const EXIT_CODE_USAGE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CliError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("unknown argument '{0}' (try --help)")]
    UnknownArgument(String),
}

pub type Result<T> = std::result::Result<T, CliError>;

/// Top-level command selected by the arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Recover(RecoverOptions),
    ShowHelp,
    ShowVersion,
}

/// Options for a recovery run; values are `None` when not given.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecoverOptions {
    pub port: Option<String>,
    pub no_license: bool,
    pub no_recovery: bool,
    pub auto_exit: bool,
    /// Raw `NOWINDOW` flag; see [`RecoverOptions::no_window`].
    pub no_window_requested: bool,
    pub baud: Option<u32>,
    pub flow: Option<FlowControl>,
    pub config: Option<PathBuf>,
    pub debug: bool,
}

impl RecoverOptions {
    /// `NOWINDOW` is only honoured for unattended runs: `AUTOEXIT` and a
    /// port are given and recovery is not skipped.
    pub fn no_window(&self) -> bool {
        self.no_window_requested && self.auto_exit && self.port.is_some() && !self.no_recovery
    }

    /// Overlay the command line on top of the settings file.
    pub fn apply(&self, mut settings: RecoverySettings) -> RecoverySettings {
        if let Some(baud) = self.baud {
            settings.baud_rate = baud;
        }
        if let Some(flow) = self.flow {
            settings.flow_control = flow;
        }
        if self.no_license {
            settings.check_license = false;
        }
        settings
    }
}

impl Command {
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut opts = RecoverOptions::default();

        for arg in args {
            let (key, value) = match arg.split_once('=') {
                Some((key, value)) => (key.to_ascii_uppercase(), Some(value)),
                None => (arg.to_ascii_uppercase(), None),
            };

            match (key.as_str(), value) {
                ("-H" | "--HELP" | "HELP" | "/?", None) => return Ok(Command::ShowHelp),
                ("-V" | "--VERSION" | "VERSION", None) => return Ok(Command::ShowVersion),
                ("COM", Some(value)) => {
                    opts.port = Some(value.trim().to_string());
                }
                ("BAUD", Some(value)) => {
                    let baud: u32 = value.trim().parse().map_err(|_| {
                        CliError::InvalidArgs("BAUD must be a positive integer".to_string())
                    })?;
                    if baud == 0 {
                        return Err(CliError::InvalidArgs(
                            "BAUD must be a positive integer".to_string(),
                        ));
                    }
                    opts.baud = Some(baud);
                }
                ("FLOW", Some(value)) => {
                    let flow = value
                        .trim()
                        .parse::<u8>()
                        .ok()
                        .and_then(FlowControl::from_index)
                        .ok_or_else(|| {
                            CliError::InvalidArgs(
                                "FLOW must be 0 (none), 1 (hardware) or 2 (software)".to_string(),
                            )
                        })?;
                    opts.flow = Some(flow);
                }
                ("CONFIG", Some(value)) if !value.trim().is_empty() => {
                    opts.config = Some(PathBuf::from(value.trim()));
                }
                ("CONFIG", Some(_)) => {
                    return Err(CliError::InvalidArgs(
                        "CONFIG requires a file path".to_string(),
                    ));
                }
                ("NOLICENSE", None) => opts.no_license = true,
                ("NORECOVERY", None) => opts.no_recovery = true,
                ("AUTOEXIT", None) => opts.auto_exit = true,
                ("NOWINDOW", None) => opts.no_window_requested = true,
                ("DEBUG", None) => opts.debug = true,
                _ => return Err(CliError::UnknownArgument(arg.clone())),
            }
        }

        Ok(Command::Recover(opts))
    }

    pub fn help() -> String {
        concat!(
            "exitdtm - Escape a BL654 module from Direct Test Mode\n",
            "\n",
            "USAGE:\n",
            "  exitdtm COM=<port> [BAUD=<number>] [FLOW=<0|1|2>] [NOLICENSE] [AUTOEXIT] [NOWINDOW]\n",
            "  exitdtm --help\n",
            "  exitdtm --version\n",
            "\n",
            "ARGUMENTS:\n",
            "  COM=<port>        Serial port the module is attached to (e.g. COM3, /dev/ttyUSB0)\n",
            "  BAUD=<number>     Application baud rate of the module (default: 115200)\n",
            "  FLOW=<0|1|2>      Application flow control: none, hardware, software (default: 1)\n",
            "  CONFIG=<path>     Settings file to use (created with defaults if missing)\n",
            "  NOLICENSE         Skip the license check\n",
            "  NORECOVERY        Do not attempt recovery\n",
            "  AUTOEXIT          Print a one-line result; the exit code reports the outcome\n",
            "  NOWINDOW          Print nothing (needs AUTOEXIT and COM=)\n",
            "  DEBUG             Verbose logging on stderr (RUST_LOG overrides)\n",
            "  -h, --help        Show this help\n",
            "  -V, --version     Show version\n",
            "\n",
            "EXIT CODES:\n",
            "   0  module recovered\n",
            "  -1  no or invalid serial port\n",
            "  -2  CTS asserted while the module should be in DTM\n",
            "  -3  license missing or invalid\n",
            "  -4  module did not respond in time\n",
            "  -5  serial port error\n",
        )
        .to_string()
    }

    pub fn print_help() {
        println!("{}", Self::help());
    }
}
