//! Driver configuration.

/// Number of connection slots multiplexed by the AT firmware (link ids 0..4).
pub const SOCKET_COUNT: usize = 5;

/// Maximum SSID length in bytes.
pub const SSID_MAX_LENGTH: usize = 32;

/// Minimum WPA passphrase length in bytes.
pub const PASSPHRASE_MIN_LENGTH: usize = 8;

/// Maximum WPA passphrase length in bytes.
pub const PASSPHRASE_MAX_LENGTH: usize = 63;

/// Largest payload the device accepts for a single `CIPSEND`.
pub const MAX_SEND_CHUNK: usize = 2048;

/// Largest accepted TCP keepalive interval in seconds.
pub const KEEPALIVE_MAX_SECS: u16 = 7200;

/// Tunable driver parameters. All timeouts are in milliseconds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// UART baud rate applied during initialization.
    pub baud_rate: u32,

    /// Timeout for association and other long-running commands (reset,
    /// scan, address queries during connect).
    pub connect_timeout_ms: u32,

    /// Timeout for one complete `CIPSEND` exchange.
    pub send_timeout_ms: u32,

    /// Timeout for inbound payload reads and receive polls.
    pub recv_timeout_ms: u32,

    /// Timeout for every other command round-trip.
    pub misc_timeout_ms: u32,

    /// Ceiling in bytes for inbound packets queued across all sockets.
    /// Arriving packets are dropped with a warning once the queue holds at
    /// least this many bytes.
    pub socket_buffer_ceiling: usize,

    /// True if both RTS and CTS are wired and hardware flow control should
    /// be negotiated during initialization. Without it the driver drains
    /// pending notifications after every send instead.
    pub hw_flow_control: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            connect_timeout_ms: 15_000,
            send_timeout_ms: 500,
            recv_timeout_ms: 500,
            misc_timeout_ms: 500,
            socket_buffer_ceiling: 8192,
            hw_flow_control: false,
        }
    }
}

impl Config {
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    pub fn connect_timeout_ms(mut self, timeout: u32) -> Self {
        self.connect_timeout_ms = timeout;
        self
    }

    pub fn send_timeout_ms(mut self, timeout: u32) -> Self {
        self.send_timeout_ms = timeout;
        self
    }

    pub fn recv_timeout_ms(mut self, timeout: u32) -> Self {
        self.recv_timeout_ms = timeout;
        self
    }

    pub fn misc_timeout_ms(mut self, timeout: u32) -> Self {
        self.misc_timeout_ms = timeout;
        self
    }

    pub fn socket_buffer_ceiling(mut self, bytes: usize) -> Self {
        self.socket_buffer_ceiling = bytes;
        self
    }

    pub fn hw_flow_control(mut self, enabled: bool) -> Self {
        self.hw_flow_control = enabled;
        self
    }
}
