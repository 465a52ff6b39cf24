//! Line- and record-oriented reader/writer over the byte transport.
//!
//! The modem interleaves three kinds of framing on one UART:
//!
//! * delimiter-terminated text lines (command responses and unsolicited
//!   notifications),
//! * a bare `>` prompt during the send handshake,
//! * headers ending in `:` (`+IPD,id,len:`, `+CIPRECVDATA,len:`) followed
//!   by exactly that many raw payload bytes.
//!
//! [`AtParser::poll`] assembles the first two into [`Token`]s; after a
//! colon-terminated header the caller switches to [`AtParser::read_exact`]
//! to drain the payload before line assembly resumes. Classification of
//! lines (unsolicited vs. response match) happens one layer up, in the
//! session.

use crate::serial::SerialPort;
use core::fmt;
use fugit::{TimerDurationU32, TimerInstantU32};
use fugit_timer::Timer;
use heapless::{String, Vec};

/// Capacity for one assembled line. Scan records are the longest lines the
/// firmware produces and stay well below this.
pub(crate) const LINE_CAPACITY: usize = 192;

/// Capacity for one formatted command.
const COMMAND_CAPACITY: usize = 128;

/// Prefixes whose records terminate at `:` with an inline payload behind.
const RAW_HEADER_PREFIXES: [&[u8]; 2] = [b"+IPD,", b"+CIPRECVDATA,"];

/// One complete record assembled from the wire.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Token {
    /// A line, delimiter stripped. Colon-terminated headers keep the `:`.
    Line(String<LINE_CAPACITY>),
    /// The `>` prompt of the send handshake.
    Prompt,
}

/// Parser-level failures. Recoverable: callers retry or map to a device
/// error at the command layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum RecvError {
    /// Deadline elapsed before a complete record arrived.
    Timeout,
    /// The serial port reported a hard error.
    Transport,
    /// A formatted command did not fit the command buffer.
    Overflow,
}

pub(crate) struct AtParser<S: SerialPort, T: Timer<TIMER_HZ>, const TIMER_HZ: u32> {
    serial: S,
    timer: T,
    timeout: TimerDurationU32<TIMER_HZ>,
    delimiter: &'static str,
    buffer: Vec<u8, LINE_CAPACITY>,
    /// Swallow one space directly after an emitted prompt (`"> "`).
    swallow_space: bool,
    debug: bool,
}

impl<S: SerialPort, T: Timer<TIMER_HZ>, const TIMER_HZ: u32> AtParser<S, T, TIMER_HZ> {
    pub(crate) fn new(serial: S, timer: T, timeout_ms: u32) -> Self {
        Self {
            serial,
            timer,
            timeout: TimerDurationU32::millis(timeout_ms),
            delimiter: "\r\n",
            buffer: Vec::new(),
            swallow_space: false,
            debug: false,
        }
    }

    pub(crate) fn serial_mut(&mut self) -> &mut S {
        &mut self.serial
    }

    pub(crate) fn readable(&self) -> bool {
        self.serial.readable()
    }

    pub(crate) fn writeable(&self) -> bool {
        self.serial.writeable()
    }

    pub(crate) fn set_timeout_ms(&mut self, timeout_ms: u32) {
        self.timeout = TimerDurationU32::millis(timeout_ms);
    }

    pub(crate) fn set_delimiter(&mut self, delimiter: &'static str) {
        self.delimiter = delimiter;
    }

    pub(crate) fn debug_on(&mut self, enabled: bool) {
        self.debug = enabled;
    }

    pub(crate) fn now(&mut self) -> TimerInstantU32<TIMER_HZ> {
        self.timer.now()
    }

    /// Absolute deadline `timeout_ms` from now.
    pub(crate) fn deadline(&mut self, timeout_ms: u32) -> TimerInstantU32<TIMER_HZ> {
        self.timer.now() + TimerDurationU32::millis(timeout_ms)
    }

    /// Absolute deadline derived from the active timeout.
    pub(crate) fn default_deadline(&mut self) -> TimerInstantU32<TIMER_HZ> {
        self.timer.now() + self.timeout
    }

    /// Consumes input until one complete [`Token`] is assembled or the
    /// deadline elapses. Partial input is kept across calls.
    pub(crate) fn poll(
        &mut self,
        deadline: TimerInstantU32<TIMER_HZ>,
    ) -> Result<Token, RecvError> {
        loop {
            match self.serial.read() {
                Ok(byte) => {
                    if let Some(token) = self.accept(byte) {
                        return Ok(token);
                    }
                }
                Err(nb::Error::WouldBlock) => {
                    if self.timer.now() >= deadline {
                        return Err(RecvError::Timeout);
                    }
                }
                Err(nb::Error::Other(_)) => return Err(RecvError::Transport),
            }
        }
    }

    /// Feeds one byte into the assembler; returns a token when the byte
    /// completes a record.
    fn accept(&mut self, byte: u8) -> Option<Token> {
        if self.swallow_space {
            self.swallow_space = false;
            if byte == b' ' {
                return None;
            }
        }

        if self.buffer.is_empty() && byte == b'>' {
            self.swallow_space = true;
            if self.debug {
                debug!("AT << >");
            }
            return Some(Token::Prompt);
        }

        if self.buffer.push(byte).is_err() {
            warn!("AT line exceeded {} bytes, dropping", LINE_CAPACITY);
            self.buffer.clear();
            return None;
        }

        if self.buffer.ends_with(self.delimiter.as_bytes()) {
            let end = self.buffer.len() - self.delimiter.len();
            self.buffer.truncate(end);
            return self.take_line();
        }

        if byte == b':' && self.is_raw_header() {
            return self.take_line();
        }

        None
    }

    /// Empties the assembly buffer into a line token; blank and non-UTF-8
    /// lines are discarded.
    fn take_line(&mut self) -> Option<Token> {
        let raw = core::mem::take(&mut self.buffer);
        if raw.is_empty() {
            return None;
        }

        match core::str::from_utf8(&raw) {
            Ok(text) => {
                let mut line = String::new();
                // Cannot overflow: the buffer and the line share a capacity.
                line.push_str(text).ok()?;
                if self.debug {
                    debug!("AT << {}", line.as_str());
                }
                Some(Token::Line(line))
            }
            Err(_) => {
                warn!("dropping non-UTF-8 line");
                None
            }
        }
    }

    fn is_raw_header(&self) -> bool {
        RAW_HEADER_PREFIXES
            .iter()
            .any(|prefix| self.buffer.starts_with(prefix))
    }

    /// Raw-mode read of exactly `buf.len()` payload bytes. Returns the
    /// number of bytes read, which is short when the deadline elapses.
    pub(crate) fn read_exact(
        &mut self,
        buf: &mut [u8],
        deadline: TimerInstantU32<TIMER_HZ>,
    ) -> Result<usize, RecvError> {
        let mut count = 0;

        while count < buf.len() {
            match self.serial.read() {
                Ok(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                Err(nb::Error::WouldBlock) => {
                    if self.timer.now() >= deadline {
                        break;
                    }
                }
                Err(nb::Error::Other(_)) => return Err(RecvError::Transport),
            }
        }

        Ok(count)
    }

    /// Reads and discards `len` payload bytes, keeping line assembly
    /// aligned when a packet cannot be stored.
    pub(crate) fn discard_exact(
        &mut self,
        len: usize,
        deadline: TimerInstantU32<TIMER_HZ>,
    ) -> Result<usize, RecvError> {
        let mut count = 0;

        while count < len {
            match self.serial.read() {
                Ok(_) => count += 1,
                Err(nb::Error::WouldBlock) => {
                    if self.timer.now() >= deadline {
                        break;
                    }
                }
                Err(nb::Error::Other(_)) => return Err(RecvError::Transport),
            }
        }

        Ok(count)
    }

    /// Writes the whole buffer within the deadline.
    pub(crate) fn write_all(
        &mut self,
        buf: &[u8],
        deadline: TimerInstantU32<TIMER_HZ>,
    ) -> Result<(), RecvError> {
        let mut written = 0;

        while written < buf.len() {
            match self.serial.write(&buf[written..]) {
                Ok(n) => written += n,
                Err(nb::Error::WouldBlock) => {
                    if self.timer.now() >= deadline {
                        return Err(RecvError::Timeout);
                    }
                }
                Err(nb::Error::Other(_)) => return Err(RecvError::Transport),
            }
        }

        loop {
            match self.serial.flush() {
                Ok(()) => return Ok(()),
                Err(nb::Error::WouldBlock) => {
                    if self.timer.now() >= deadline {
                        return Err(RecvError::Timeout);
                    }
                }
                Err(nb::Error::Other(_)) => return Err(RecvError::Transport),
            }
        }
    }

    /// Formats one command, appends the delimiter and transmits it.
    pub(crate) fn send_command(
        &mut self,
        args: fmt::Arguments<'_>,
        deadline: TimerInstantU32<TIMER_HZ>,
    ) -> Result<(), RecvError> {
        let mut command: String<COMMAND_CAPACITY> = String::new();
        fmt::write(&mut command, args).map_err(|_| RecvError::Overflow)?;

        if self.debug {
            debug!("AT >> {}", command.as_str());
        }

        command.push_str(self.delimiter).map_err(|_| RecvError::Overflow)?;
        self.write_all(command.as_bytes(), deadline)
    }
}
