mod cli;
mod console;
mod escape;
mod logging;
mod session;
mod settings;

#[cfg(test)]
mod test_helpers;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::{Context, Result};
use tracing::{info, warn};

use cli::{Command, RecoverOptions, EXIT_CODE_USAGE};
use console::{Console, Verbosity};
use escape::{EscapeEvent, EXIT_CODE_INVALID_PORT, EXIT_CODE_OK};
use settings::{RecoverySettings, SettingsManager};

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let code = match Command::parse(&args) {
        Ok(Command::ShowHelp) => {
            Command::print_help();
            EXIT_CODE_OK
        }
        Ok(Command::ShowVersion) => {
            println!("{} {}", APP_NAME, VERSION);
            EXIT_CODE_OK
        }
        Ok(Command::Recover(opts)) => match recover(opts).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                EXIT_CODE_USAGE
            }
        },
        Err(e) => {
            eprintln!("{}", e);
            EXIT_CODE_USAGE
        }
    };

    std::process::exit(code);
}

fn load_settings(opts: &RecoverOptions) -> Result<RecoverySettings> {
    match &opts.config {
        Some(path) => SettingsManager::from_path(path).load_or_create(),
        None => SettingsManager::new(Path::new(".")).load(),
    }
}

async fn recover(opts: RecoverOptions) -> Result<i32> {
    logging::setup_logging(opts.debug)?;
    info!("Starting {} v{}", APP_NAME, VERSION);

    let verbosity = Verbosity::from_options(&opts);
    let settings = opts.apply(load_settings(&opts)?);

    if opts.no_recovery {
        if verbosity != Verbosity::Silent {
            println!("Module recovery skipped.");
        }
        return Ok(EXIT_CODE_OK);
    }

    let Some(port) = opts.port.clone() else {
        eprintln!("No serial port given, use COM=<port> (see --help).");
        return Ok(EXIT_CODE_INVALID_PORT);
    };

    let baud_rate = settings.baud_rate;
    let mode = settings.handshake_mode();
    let config = settings.to_session_config(&port);

    // Ctrl-C stops the run between driver iterations
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            cancel_flag.store(true, Ordering::SeqCst);
        }
    });

    // Create a channel for events from the blocking thread
    let (tx, rx) = mpsc::channel::<EscapeEvent>();

    // Print events as they arrive
    let printer = thread::spawn(move || {
        let mut console = Console::new(verbosity);
        while let Ok(event) = rx.recv() {
            if let Some(line) = console.render_event(&event) {
                println!("{}", line);
            }
        }
        console
    });

    // Run the escape in a blocking task
    let result = tokio::task::spawn_blocking(move || {
        session::run_recovery(config, mode, &cancel, |event| {
            let _ = tx.send(event);
        })
    })
    .await
    .context("Recovery task panicked")?;

    // Wait for event printing to complete
    let console = printer
        .join()
        .map_err(|_| anyhow::anyhow!("Console thread panicked"))?;

    match result {
        Ok(report) => {
            info!(end = ?report.end, "recovery finished");
            if let Some(text) = console.render_report(&report) {
                println!("{}", text);
            }
            Ok(report.end.exit_code())
        }
        Err(e) => {
            warn!(error = %e, "recovery could not start");
            if let Some(text) = console.render_open_error(&e, baud_rate) {
                eprintln!("{}", text);
            }
            Ok(EXIT_CODE_INVALID_PORT)
        }
    }
}
