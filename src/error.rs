//! Public error codes.
//!
//! Every fallible driver operation returns exactly one of these codes in its
//! negative branch. Operations with a non-blocking contract additionally use
//! [`nb::Error::WouldBlock`] to signal "no data / try again"; that case is
//! not an error in this taxonomy.

/// Driver error codes surfaced to the application.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The device reported a failure, a response did not match the expected
    /// shape, or the serial link timed out mid-command.
    DeviceError,
    /// All connection slots are in use.
    NoSocket,
    /// Inbound packet allocation was refused.
    NoMemory,
    /// No SSID configured or the target network was not found.
    NoSsid,
    /// The access point rejected the passphrase.
    AuthFailure,
    /// Association did not complete within the connect timeout.
    ConnectionTimeout,
    /// The connection attempt failed for an unspecified reason, or the
    /// operation requires a connection that is not established.
    NoConnection,
    /// Already associated (or socket already connected).
    IsConnected,
    /// No IP address was assigned by the access point.
    DhcpFailure,
    /// Invalid argument: bad mode, out-of-range id, duplicate local port,
    /// credential length out of bounds.
    Parameter,
    /// The operation or option is not supported by the device.
    Unsupported,
    /// Host name resolution failed.
    DnsFailure,
}
