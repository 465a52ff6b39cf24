//! Mocks for doc examples.
//!
//! [`ExampleSerialPort`] replays canned modem responses for the commands
//! the documentation examples produce, including the raw-payload phase of
//! the send handshake. Not intended for real use.

use crate::serial::SerialPort;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use fugit::{TimerDurationU32, TimerInstantU32};
use fugit_timer::Timer;

/// Serial port mock answering a fixed command set.
#[derive(Default)]
pub struct ExampleSerialPort {
    rx: VecDeque<u8>,
    line: Vec<u8>,
    /// Raw payload bytes expected after an accepted `CIPSEND`.
    raw_pending: usize,
}

impl ExampleSerialPort {
    pub fn new() -> Self {
        Self::default()
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    fn accept(&mut self, byte: u8) {
        if self.raw_pending > 0 {
            self.raw_pending -= 1;
            if self.raw_pending == 0 {
                self.reply(b"Recv 6 bytes\r\nSEND OK\r\n+IPD,0,16\r\n");
            }
            return;
        }

        self.line.push(byte);
        if self.line.ends_with(b"\r\n") {
            let command = self.line[..self.line.len() - 2].to_vec();
            self.line.clear();
            self.respond(&command);
        }
    }

    fn respond(&mut self, command: &[u8]) {
        match command {
            b"AT+RST" => self.reply(b"OK\r\nready\r\n"),
            b"AT+GMR" => self.reply(
                b"AT version:1.7.0.0(Aug 16 2018 00:00:00)\r\nSDK version:3.0.0(d49923c)\r\nOK\r\n",
            ),
            b"AT+CWMODE_DEF?" => self.reply(b"+CWMODE_DEF:1\r\nOK\r\n"),
            b"AT+CWJAP_CUR=\"test_wifi\",\"secret1234\"" => {
                self.reply(b"WIFI CONNECTED\r\nWIFI GOT IP\r\nOK\r\n")
            }
            b"AT+CIFSR" => self.reply(
                b"+CIFSR:STAIP,\"10.0.0.181\"\r\n+CIFSR:STAMAC,\"10:fe:ed:05:ba:50\"\r\nOK\r\n",
            ),
            b"AT+CIPRECVDATA=0,16" => self.reply(b"+CIPRECVDATA,16:nice to see you!OK\r\n"),
            b"AT+CIPCLOSE=0" => self.reply(b"0,CLOSED\r\nOK\r\n"),
            command if command.starts_with(b"AT+CIPSEND=0,") => {
                self.raw_pending = 6;
                self.reply(b"OK\r\n> ");
            }
            _ => self.reply(b"OK\r\n"),
        }
    }
}

impl SerialPort for ExampleSerialPort {
    type Error = core::convert::Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn write(&mut self, buf: &[u8]) -> nb::Result<usize, Self::Error> {
        for byte in buf {
            self.accept(*byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }

    fn readable(&self) -> bool {
        !self.rx.is_empty()
    }

    fn writeable(&self) -> bool {
        true
    }

    fn set_baud_rate(&mut self, _baud: u32) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_flow_control(&mut self, _enabled: bool) -> Result<(), Self::Error> {
        Ok(())
    }

    fn on_data_ready(&mut self, _callback: fn()) {}
}

/// Timer mock: every query advances time by 100 µs, so deadlines always
/// make progress.
#[derive(Default)]
pub struct ExampleTimer {
    ticks: u32,
}

impl Timer<1_000_000> for ExampleTimer {
    type Error = u32;

    fn now(&mut self) -> TimerInstantU32<1_000_000> {
        self.ticks = self.ticks.wrapping_add(100);
        TimerInstantU32::from_ticks(self.ticks)
    }

    fn start(&mut self, _duration: TimerDurationU32<1_000_000>) -> Result<(), Self::Error> {
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn wait(&mut self) -> nb::Result<(), Self::Error> {
        Err(nb::Error::WouldBlock)
    }
}
