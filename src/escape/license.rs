//! License key inspection from the `at i 4` / `at i 14` responses.

use serde::{Deserialize, Serialize};

use super::buffer::{ResponseBuffer, ResponsePattern};
use super::config::{ADDRESS_QUERY_COMMAND, SENTINEL_LICENSE_KEY};

/// Result of inspecting the license query responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseReport {
    /// Uppercased 12-character key, if a well-formed `at i 4` response was seen.
    pub key: Option<String>,
    pub valid: bool,
    /// Bluetooth address from `at i 14`, only looked up for invalid licenses.
    pub address: Option<String>,
}

impl LicenseReport {
    /// Inspect the accumulated license query responses.
    ///
    /// The sentinel key (compared case-insensitively) means no license was
    /// programmed. Any other well-formed key is valid; no key at all is
    /// treated as invalid.
    pub fn inspect(buffer: &ResponseBuffer) -> Self {
        let key = buffer
            .contains(ResponsePattern::LicenseKey)
            .and_then(|m| m.token)
            .map(|token| token.to_uppercase());

        let valid = matches!(key.as_deref(), Some(k) if k != SENTINEL_LICENSE_KEY);

        let address = if valid {
            None
        } else {
            buffer
                .contains(ResponsePattern::BluetoothAddress)
                .and_then(|m| m.token)
        };

        Self {
            key,
            valid,
            address,
        }
    }

    /// Human-readable summary shown at the end of a run.
    pub fn message(&self) -> String {
        match (&self.key, self.valid) {
            (Some(key), true) => {
                format!("Your module has a valid license ({}) and is ready for use.", key)
            }
            _ => {
                let mut message = format!(
                    "Your module does not have a valid license, you will need to send the \
                     response to the command '{}' to support for them to generate you a license.",
                    ADDRESS_QUERY_COMMAND
                );
                if let Some(address) = &self.address {
                    message.push_str(&format!(
                        "\n{} response from this module: {}.",
                        ADDRESS_QUERY_COMMAND.to_uppercase(),
                        address
                    ));
                }
                message
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(text: &str) -> ResponseBuffer {
        let mut buffer = ResponseBuffer::new();
        buffer.append(text.as_bytes());
        buffer
    }

    #[test]
    fn test_sentinel_key_is_invalid_in_any_case() {
        for key in ["0016A4C0FFEE", "0016a4c0ffee", "0016A4c0FfEe"] {
            let buffer = buffer_with(&format!("\n10\t4\t00 {}\r\n00\r\n", key));
            let report = LicenseReport::inspect(&buffer);

            assert!(!report.valid, "{} should be invalid", key);
            assert_eq!(report.key.as_deref(), Some("0016A4C0FFEE"));
        }
    }

    #[test]
    fn test_other_key_is_valid() {
        let buffer = buffer_with("\n10\t4\t00 a1b2c3d4e5f6\r\n00\r\n\n10\t14\t01 C0FFEE123456\r\n00\r");
        let report = LicenseReport::inspect(&buffer);

        assert!(report.valid);
        assert_eq!(report.key.as_deref(), Some("A1B2C3D4E5F6"));
        assert_eq!(report.address, None);
        assert!(report.message().contains("(A1B2C3D4E5F6)"));
    }

    #[test]
    fn test_missing_key_is_invalid() {
        let report = LicenseReport::inspect(&buffer_with("\n01\t0000\r\n\n01\t0000\r\n"));

        assert!(!report.valid);
        assert_eq!(report.key, None);
    }

    #[test]
    fn test_invalid_license_reports_address() {
        let buffer = buffer_with(
            "\n10\t4\t00 0016A4C0FFEE\r\n00\r\n\n10\t14\t01 C0FFEE123456\r\n00\r",
        );
        let report = LicenseReport::inspect(&buffer);

        assert!(!report.valid);
        assert_eq!(report.address.as_deref(), Some("C0FFEE123456"));
        assert!(report
            .message()
            .contains("AT I 14 response from this module: C0FFEE123456."));
    }
}
