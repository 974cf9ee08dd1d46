use crate::escape::{PortSettings, DTM_BAUD_RATE};

use super::fake_transport::FakeTransport;

/// What the module prints after `at&f*`: two lines with the erase notice
/// followed by a success response.
pub const ERASE_RESPONSE: &[u8] = b"\nFFS Erased, Rebooting...\nsome text\n00\r";

/// `at i 14` reply carrying a Bluetooth address.
pub const ADDRESS_RESPONSE: &[u8] = b"\n10\t14\t01 C0FFEE123456\r\n00\r";

/// `at i 4` reply carrying `key`.
pub fn license_key_response(key: &str) -> Vec<u8> {
    format!("\n10\t4\t00 {}\r\n00\r", key).into_bytes()
}

/// Both license query replies back to back, four lines in total.
pub fn license_response(key: &str) -> Vec<u8> {
    let mut response = license_key_response(key);
    response.extend_from_slice(ADDRESS_RESPONSE);
    response
}

/// Builder for a scripted module on a [`FakeTransport`].
pub struct FakeModuleBuilder {
    license_key: Option<String>,
    cts_in_dtm: bool,
    leaves_dtm: bool,
    erases: bool,
    reopen_fails: bool,
}

impl FakeModuleBuilder {
    /// A healthy module stuck in DTM with a valid license.
    pub fn new() -> Self {
        Self {
            license_key: Some("A1B2C3D4E5F6".to_string()),
            cts_in_dtm: false,
            leaves_dtm: true,
            erases: true,
            reopen_fails: false,
        }
    }

    pub fn license_key(mut self, key: &str) -> Self {
        self.license_key = Some(key.to_string());
        self
    }

    /// The module never answers the license queries.
    pub fn no_license_reply(mut self) -> Self {
        self.license_key = None;
        self
    }

    /// CTS is already asserted when the port is opened at DTM settings.
    pub fn cts_in_dtm(mut self) -> Self {
        self.cts_in_dtm = true;
        self
    }

    /// The module ignores the DTM exit command.
    pub fn stuck_in_dtm(mut self) -> Self {
        self.leaves_dtm = false;
        self
    }

    /// The module never reports the filesystem erase.
    pub fn no_erase_reply(mut self) -> Self {
        self.erases = false;
        self
    }

    /// The port cannot be reopened at application settings.
    pub fn reopen_fails(mut self) -> Self {
        self.reopen_fails = true;
        self
    }

    pub fn build(self) -> FakeTransport {
        let mut transport = FakeTransport::new();
        transport.set_cts(self.cts_in_dtm);
        if self.leaves_dtm {
            transport.assert_cts_on_dtm_exit();
        }
        if self.erases {
            transport.respond_to(b"at&f*\r", ERASE_RESPONSE);
        }
        if let Some(key) = &self.license_key {
            transport.respond_to(b"at i 4\r", &license_key_response(key));
            transport.respond_to(b"at i 14\r", ADDRESS_RESPONSE);
        }
        if self.reopen_fails {
            transport.fail_open_at(PortSettings::application_default().baud_rate);
        }
        transport
    }
}

impl Default for FakeModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// True if the transport was only ever opened at DTM settings.
pub fn only_opened_at_dtm(transport: &FakeTransport) -> bool {
    transport
        .opens()
        .iter()
        .all(|(_, settings)| settings.baud_rate == DTM_BAUD_RATE)
}
