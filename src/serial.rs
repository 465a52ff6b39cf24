//! Byte transport abstraction.
//!
//! The driver talks to the modem through this trait only. Implementations
//! wrap a UART (or a pty/TCP bridge in tests) and provide non-blocking byte
//! I/O plus the control knobs the driver negotiates during initialization.

use core::fmt::Debug;

/// A bidirectional byte pipe bound to the modem UART.
pub trait SerialPort {
    /// Transport error. Surfaced to the application as
    /// [`Error::DeviceError`](crate::Error::DeviceError).
    type Error: Debug;

    /// Reads a single byte. `WouldBlock` when no byte is buffered.
    fn read(&mut self) -> nb::Result<u8, Self::Error>;

    /// Writes as much of `buf` as currently fits, returning the number of
    /// bytes accepted. `WouldBlock` when the transmit path is full.
    fn write(&mut self, buf: &[u8]) -> nb::Result<usize, Self::Error>;

    /// Blocks until all accepted bytes have left the transmit buffer.
    fn flush(&mut self) -> nb::Result<(), Self::Error>;

    /// True if at least one byte can be read without blocking.
    fn readable(&self) -> bool;

    /// True if at least one byte can be written without blocking.
    fn writeable(&self) -> bool;

    /// Reconfigures the line speed.
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Self::Error>;

    /// Enables or disables RTS/CTS flow control. Implementations without
    /// the pins wired return `Ok` and stay unpaced; the driver compensates
    /// in software (see [`Config::hw_flow_control`](crate::Config)).
    fn set_flow_control(&mut self, enabled: bool) -> Result<(), Self::Error>;

    /// Installs a data-ready callback.
    ///
    /// May be invoked from interrupt context. The callback must only wake
    /// the task that calls [`Interface::process_events`](crate::Interface);
    /// it must never touch driver state directly.
    fn on_data_ready(&mut self, callback: fn());
}
