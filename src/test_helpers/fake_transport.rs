use std::collections::VecDeque;
use std::io;
use std::thread;
use std::time::Duration;

use crate::escape::{PortSettings, SerialTransport, TransportError, TransportResult, DTM_EXIT_COMMAND};

/// Scripted stand-in for a BL654 on a serial port.
///
/// Replies are queued when an exact command is written and handed back by
/// `read`. CTS can be made to rise when the DTM exit command arrives.
#[derive(Debug, Default)]
pub struct FakeTransport {
    open: Option<PortSettings>,
    opens: Vec<(String, PortSettings)>,
    closes: usize,
    writes: Vec<Vec<u8>>,
    cts: bool,
    cts_on_dtm_exit: bool,
    responses: Vec<(Vec<u8>, Vec<u8>)>,
    incoming: VecDeque<u8>,
    fail_open_baud: Option<u32>,
    fail_writes: Option<io::ErrorKind>,
    fail_reads: Option<io::ErrorKind>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level reported for CTS until something changes it.
    pub fn set_cts(&mut self, level: bool) {
        self.cts = level;
    }

    /// Raise CTS as soon as `3F FF` is written.
    pub fn assert_cts_on_dtm_exit(&mut self) {
        self.cts_on_dtm_exit = true;
    }

    /// Queue `response` whenever exactly `command` is written.
    pub fn respond_to(&mut self, command: &[u8], response: &[u8]) {
        self.responses.push((command.to_vec(), response.to_vec()));
    }

    /// Refuse to open at this baud rate.
    pub fn fail_open_at(&mut self, baud_rate: u32) {
        self.fail_open_baud = Some(baud_rate);
    }

    pub fn fail_writes_with(&mut self, kind: io::ErrorKind) {
        self.fail_writes = Some(kind);
    }

    pub fn fail_reads_with(&mut self, kind: io::ErrorKind) {
        self.fail_reads = Some(kind);
    }

    pub fn opens(&self) -> &[(String, PortSettings)] {
        &self.opens
    }

    pub fn close_count(&self) -> usize {
        self.closes
    }

    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    pub fn current_settings(&self) -> Option<PortSettings> {
        self.open
    }
}

impl SerialTransport for FakeTransport {
    fn open(&mut self, port_name: &str, settings: PortSettings) -> TransportResult<()> {
        self.close();

        if self.fail_open_baud == Some(settings.baud_rate) {
            return Err(TransportError::NotFound {
                port: port_name.to_string(),
            });
        }

        self.open = Some(settings);
        self.opens.push((port_name.to_string(), settings));
        Ok(())
    }

    fn close(&mut self) {
        if self.open.take().is_some() {
            self.closes += 1;
            self.incoming.clear();
        }
    }

    fn is_open(&self) -> bool {
        self.open.is_some()
    }

    fn write(&mut self, data: &[u8]) -> TransportResult<usize> {
        if self.open.is_none() {
            return Err(TransportError::NotOpen);
        }
        if let Some(kind) = self.fail_writes {
            return Err(TransportError::Io(io::Error::from(kind)));
        }

        self.writes.push(data.to_vec());
        if self.cts_on_dtm_exit && data == DTM_EXIT_COMMAND {
            self.cts = true;
        }
        if let Some((_, response)) = self.responses.iter().find(|(command, _)| command == data) {
            self.incoming.extend(response.iter().copied());
        }
        Ok(data.len())
    }

    fn read(&mut self, buffer: &mut [u8]) -> TransportResult<usize> {
        if self.open.is_none() {
            return Err(TransportError::NotOpen);
        }
        if let Some(kind) = self.fail_reads {
            return Err(TransportError::Io(io::Error::from(kind)));
        }

        if self.incoming.is_empty() {
            thread::sleep(Duration::from_millis(1));
            return Ok(0);
        }

        let count = buffer.len().min(self.incoming.len());
        for (slot, byte) in buffer.iter_mut().zip(self.incoming.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn handshake_level(&mut self) -> TransportResult<bool> {
        if self.open.is_none() {
            return Err(TransportError::NotOpen);
        }
        Ok(self.cts)
    }
}
