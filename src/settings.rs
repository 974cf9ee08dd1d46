//! Persistent recovery settings.
//!
//! This module provides:
//! - `RecoverySettings` with the application serial settings and run options
//! - Persistence to a JSON file, `exitdtm.json` by default
//! - Conversion into the `SessionConfig` for a run
//!
//! Every field has a default, so a partial or missing file is fine. Command
//! line arguments override whatever the file says.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::escape::{
    FlowControl, HandshakeMode, PortSettings, SessionConfig, TimeoutPolicy, MODULE_TIMEOUT,
};

/// Settings file name used when no path is given.
pub const SETTINGS_FILENAME: &str = "exitdtm.json";

/// Defaults for a recovery run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RecoverySettings {
    /// Baud rate of the module's application firmware.
    pub baud_rate: u32,

    /// Flow control of the module's application firmware.
    pub flow_control: FlowControl,

    /// Query the license key after the filesystem erase.
    pub check_license: bool,

    /// Force a handshake strategy instead of the platform default.
    pub handshake_mode: Option<HandshakeMode>,

    pub timeout_policy: TimeoutPolicy,

    /// Stage deadline in milliseconds.
    pub module_timeout_ms: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        let application = PortSettings::application_default();
        Self {
            baud_rate: application.baud_rate,
            flow_control: application.flow_control,
            check_license: true,
            handshake_mode: None,
            timeout_policy: TimeoutPolicy::default(),
            module_timeout_ms: MODULE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl RecoverySettings {
    pub fn application(&self) -> PortSettings {
        PortSettings::new(self.baud_rate, self.flow_control)
    }

    /// The configured handshake strategy, or the one that works on this host.
    pub fn handshake_mode(&self) -> HandshakeMode {
        self.handshake_mode.unwrap_or_else(HandshakeMode::for_platform)
    }

    /// Build the configuration for one run on `port_name`.
    pub fn to_session_config(&self, port_name: &str) -> SessionConfig {
        SessionConfig::new(port_name)
            .with_application(self.application())
            .with_license_check(self.check_license)
            .with_timeout_policy(self.timeout_policy)
            .with_module_timeout(Duration::from_millis(self.module_timeout_ms))
    }

    /// Check if these settings differ from defaults.
    pub fn has_non_default_settings(&self) -> bool {
        *self != Self::default()
    }
}

/// Manages persistence of recovery settings to a JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Settings stored as `exitdtm.json` in `dir`.
    pub fn new(dir: &Path) -> Self {
        Self::from_path(dir.join(SETTINGS_FILENAME))
    }

    /// Settings stored at an explicit path.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            settings_file_path: path.into(),
        }
    }

    /// Load settings from disk, returning defaults if the file doesn't exist.
    pub fn load(&self) -> Result<RecoverySettings> {
        if !self.settings_file_path.exists() {
            debug!(path = %self.settings_file_path.display(), "no settings file, using defaults");
            return Ok(RecoverySettings::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path).with_context(|| {
            format!(
                "Failed to read settings file: {}",
                self.settings_file_path.display()
            )
        })?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(RecoverySettings::default());
        }

        let settings = serde_json::from_str(&contents).with_context(|| {
            format!(
                "Failed to parse settings file: {}",
                self.settings_file_path.display()
            )
        })?;

        info!(path = %self.settings_file_path.display(), "loaded settings");
        Ok(settings)
    }

    /// Load settings, writing the defaults out first if the file is missing.
    pub fn load_or_create(&self) -> Result<RecoverySettings> {
        if !self.settings_file_path.exists() {
            self.save(&RecoverySettings::default())?;
        }
        self.load()
    }

    /// Save settings to disk.
    pub fn save(&self, settings: &RecoverySettings) -> Result<()> {
        if let Some(parent) = self.settings_file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create settings directory: {}", parent.display())
                })?;
            }
        }

        let contents =
            serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;

        fs::write(&self.settings_file_path, contents).with_context(|| {
            format!(
                "Failed to write settings file: {}",
                self.settings_file_path.display()
            )
        })?;

        info!(path = %self.settings_file_path.display(), "saved settings");
        Ok(())
    }
}
