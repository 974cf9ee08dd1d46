//! Accumulator for module output received during a stage.

use std::borrow::Cow;

use regex::Regex;

use super::config::{ERASE_MARKER, RESPONSE_OK_MARKER};

/// Fixed set of responses the escape sequence looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePattern {
    /// Filesystem erase notice followed later by an `00` success response.
    EraseComplete,
    /// `at i 4` response carrying the 12-character license key.
    LicenseKey,
    /// `at i 14` response carrying the 12-character Bluetooth address.
    BluetoothAddress,
}

/// Location of a pattern match in the accumulated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub start: usize,
    pub end: usize,
    /// The 12-character token captured by the pattern, if it has one.
    pub token: Option<String>,
}

/// Compiled regular expressions for the `at i` responses.
struct ResponseRegexes {
    license_key: Regex,
    bluetooth_address: Regex,
}

impl ResponseRegexes {
    fn new() -> Self {
        Self {
            license_key: Regex::new(r"\n10\t4\t00 ([a-zA-Z0-9]{12})\r\n00\r")
                .expect("Invalid license key regex"),
            bluetooth_address: Regex::new(r"\n10\t14\t(?:00|01|02|03|04) ([a-zA-Z0-9]{12})\r\n00\r")
                .expect("Invalid Bluetooth address regex"),
        }
    }
}

/// Bytes received since the start of the current stage.
pub struct ResponseBuffer {
    data: Vec<u8>,
    lines: u32,
    regexes: ResponseRegexes,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            lines: 0,
            regexes: ResponseRegexes::new(),
        }
    }

    /// Append received bytes, counting every `\n` among them.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.lines += bytes.iter().filter(|&&b| b == b'\n').count() as u32;
    }

    /// Number of `\n` bytes appended since the last reset.
    pub fn line_count(&self) -> u32 {
        self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Accumulated bytes as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Search the accumulated text for one of the known responses.
    pub fn contains(&self, pattern: ResponsePattern) -> Option<Match> {
        let text = self.text();

        match pattern {
            ResponsePattern::EraseComplete => {
                let start = text.find(ERASE_MARKER)?;
                // The success response may begin with the newline that ends the marker line
                let ok = text[start + 1..].find(RESPONSE_OK_MARKER)? + start + 1;
                Some(Match {
                    start,
                    end: ok + RESPONSE_OK_MARKER.len(),
                    token: None,
                })
            }
            ResponsePattern::LicenseKey => capture_token(&self.regexes.license_key, &text),
            ResponsePattern::BluetoothAddress => {
                capture_token(&self.regexes.bluetooth_address, &text)
            }
        }
    }

    /// Discard everything accumulated so far.
    pub fn reset(&mut self) {
        self.data.clear();
        self.lines = 0;
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn capture_token(regex: &Regex, text: &str) -> Option<Match> {
    let captures = regex.captures(text)?;
    let whole = captures.get(0)?;
    Some(Match {
        start: whole.start(),
        end: whole.end(),
        token: captures.get(1).map(|m| m.as_str().to_string()),
    })
}
