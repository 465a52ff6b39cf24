//! Socket multiplexer.
//!
//! Maps application socket handles onto the five device link ids and
//! implements the [`embedded_nal`] TCP/UDP stacks plus DNS on top of the
//! modem session. Handles carry no payload storage; every buffered byte
//! lives in the session's packet queue.
//!
//! ## Example
//!
//! ````
//! use embedded_nal::{SocketAddr, TcpClientStack};
//! use esp8266_nal::example::{ExampleSerialPort, ExampleTimer};
//! use esp8266_nal::wifi::{Security, WifiInterface};
//! use esp8266_nal::{Config, Interface};
//! use core::str::FromStr;
//!
//! let serial = ExampleSerialPort::new();
//! let mut interface = Interface::new(serial, ExampleTimer::default(), Config::default());
//! interface.join("test_wifi", "secret1234", Security::Wpa2).unwrap();
//!
//! // Creating a TCP connection
//! let mut socket = interface.socket().unwrap();
//! interface
//!     .connect(&mut socket, SocketAddr::from_str("10.0.0.1:21").unwrap())
//!     .unwrap();
//!
//! // Sending some data
//! interface.send(&mut socket, b"hallo!").unwrap();
//!
//! // Receiving some data
//! let mut rx_buffer = [0x0; 64];
//! let length = interface.receive(&mut socket, &mut rx_buffer).unwrap();
//! assert_eq!(16, length);
//! assert_eq!(b"nice to see you!", &rx_buffer[..16]);
//!
//! // Closing the socket
//! interface.close(socket).unwrap();
//! ````

use crate::config::{Config, KEEPALIVE_MAX_SECS, SOCKET_COUNT};
use crate::error::Error;
use crate::events::{DriverEvent, EventListener, NullListener};
use crate::serial::SerialPort;
use crate::session::{Modem, Protocol};
use embedded_nal::{AddrType, Dns, IpAddr, SocketAddr};
use embedded_nal::{TcpClientStack, UdpClientStack, UdpFullStack};
use fugit_timer::Timer;
use heapless::String;

/// Opaque handle to one multiplexed connection.
#[derive(Debug)]
pub struct Socket {
    pub(crate) link_id: usize,
}

impl Socket {
    pub(crate) fn new(link_id: usize) -> Self {
        Self { link_id }
    }
}

/// Application-side state of one handle slot.
#[derive(Copy, Clone, Debug)]
pub(crate) struct HandleEntry {
    pub(crate) in_use: bool,
    pub(crate) proto: Protocol,
    pub(crate) connected: bool,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) keepalive: u16,
    pub(crate) local_port: u16,
}

impl Default for HandleEntry {
    fn default() -> Self {
        Self {
            in_use: false,
            proto: Protocol::Tcp,
            connected: false,
            remote: None,
            keepalive: 0,
            local_port: 0,
        }
    }
}

/// The network interface handed to the application.
pub struct Interface<S: SerialPort, T: Timer<TIMER_HZ>, L: EventListener, const TIMER_HZ: u32> {
    pub(crate) modem: Modem<S, T, TIMER_HZ>,
    pub(crate) entries: [HandleEntry; SOCKET_COUNT],
    pub(crate) listener: L,
    pub(crate) initialized: bool,
    pub(crate) started: bool,
}

impl<S: SerialPort, T: Timer<TIMER_HZ>, const TIMER_HZ: u32>
    Interface<S, T, NullListener, TIMER_HZ>
{
    /// Creates an interface without an event listener; status is polled.
    pub fn new(serial: S, timer: T, config: Config) -> Self {
        Self::with_listener(serial, timer, config, NullListener)
    }
}

impl<S: SerialPort, T: Timer<TIMER_HZ>, L: EventListener, const TIMER_HZ: u32>
    Interface<S, T, L, TIMER_HZ>
{
    /// Creates an interface delivering status changes to `listener`.
    pub fn with_listener(serial: S, timer: T, config: Config, listener: L) -> Self {
        Self {
            modem: Modem::new(serial, timer, config),
            entries: [HandleEntry::default(); SOCKET_COUNT],
            listener,
            initialized: false,
            started: false,
        }
    }

    /// Cooperative worker entry point: drains buffered serial input and
    /// delivers queued status events to the listener. Call this from task
    /// context whenever the data-ready signal fired.
    pub fn process_events(&mut self) {
        self.modem.process_events();
        self.dispatch_events();
    }

    fn dispatch_events(&mut self) {
        for event in self.modem.take_events() {
            if let DriverEvent::SocketClosed(link_id) = event {
                self.entries[link_id].connected = false;
            }
            self.listener.on_event(event);
        }
    }

    /// Installs the serial data-ready callback (may fire in interrupt
    /// context; it must only wake the task calling
    /// [`process_events`](Self::process_events)).
    pub fn on_data_ready(&mut self, callback: fn()) {
        self.modem.on_data_ready(callback);
    }

    /// Enables tracing of the AT exchange.
    pub fn debug_on(&mut self, enabled: bool) {
        self.modem.debug_on(enabled);
    }

    /// Direct access to the modem session for operations outside the
    /// `embedded-nal` surface.
    pub fn modem_mut(&mut self) -> &mut Modem<S, T, TIMER_HZ> {
        &mut self.modem
    }

    /// Sets the TCP keepalive interval used by the next connect on this
    /// handle. The device only accepts it at connect time, so changing it
    /// on a connected socket is refused.
    pub fn set_keepalive(&mut self, socket: &Socket, secs: u16) -> Result<(), Error> {
        let entry = &mut self.entries[socket.link_id];

        if entry.proto != Protocol::Tcp || entry.connected {
            return Err(Error::Unsupported);
        }
        if secs > KEEPALIVE_MAX_SECS {
            return Err(Error::Parameter);
        }

        entry.keepalive = secs;
        Ok(())
    }

    pub(crate) fn init(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Ok(());
        }

        self.modem.initialize()?;
        self.initialized = true;
        Ok(())
    }

    pub(crate) fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Ok(());
        }

        self.modem.startup(crate::session::WifiMode::Station)?;
        self.started = true;
        Ok(())
    }

    fn alloc_entry(&mut self, proto: Protocol) -> Result<Socket, Error> {
        let link_id = self
            .entries
            .iter()
            .position(|entry| !entry.in_use)
            .ok_or(Error::NoSocket)?;

        self.entries[link_id] = HandleEntry {
            in_use: true,
            proto,
            ..HandleEntry::default()
        };

        Ok(Socket::new(link_id))
    }

    fn free_entry(&mut self, link_id: usize) {
        self.entries[link_id] = HandleEntry::default();
    }
}

impl<S: SerialPort, T: Timer<TIMER_HZ>, L: EventListener, const TIMER_HZ: u32> TcpClientStack
    for Interface<S, T, L, TIMER_HZ>
{
    type TcpSocket = Socket;
    type Error = Error;

    /// Reserves a free handle slot. No device traffic yet.
    fn socket(&mut self) -> Result<Socket, Error> {
        self.alloc_entry(Protocol::Tcp)
    }

    fn connect(&mut self, socket: &mut Socket, remote: SocketAddr) -> nb::Result<(), Error> {
        self.process_events();

        let entry = self.entries[socket.link_id];
        if entry.connected {
            return Err(nb::Error::Other(Error::IsConnected));
        }

        self.modem
            .open_tcp(socket.link_id, remote, entry.keepalive)
            .map_err(nb::Error::Other)?;

        self.entries[socket.link_id].connected = true;
        self.entries[socket.link_id].remote = Some(remote);
        Ok(())
    }

    /// True while the device has not reported the link closed.
    fn is_connected(&mut self, socket: &Socket) -> Result<bool, Error> {
        self.process_events();
        Ok(self.entries[socket.link_id].connected && self.modem.is_socket_open(socket.link_id))
    }

    fn send(&mut self, socket: &mut Socket, buffer: &[u8]) -> nb::Result<usize, Error> {
        self.process_events();

        if !self.entries[socket.link_id].connected {
            return Err(nb::Error::Other(Error::NoConnection));
        }

        self.modem
            .send(socket.link_id, buffer)
            .map_err(nb::Error::Other)?;
        Ok(buffer.len())
    }

    /// Non-blocking receive; `Ok(0)` marks end of stream after a peer
    /// close.
    fn receive(&mut self, socket: &mut Socket, buffer: &mut [u8]) -> nb::Result<usize, Error> {
        let length = self.modem.recv_tcp(socket.link_id, buffer, 0)?;

        if length == 0 {
            // Peer close observed and queue drained.
            self.entries[socket.link_id].connected = false;
        }

        self.dispatch_events();
        Ok(length)
    }

    /// Best-effort device close; the handle slot is freed regardless.
    fn close(&mut self, socket: Socket) -> Result<(), Error> {
        let result = self.modem.close(socket.link_id);
        self.free_entry(socket.link_id);
        self.dispatch_events();
        result
    }
}

impl<S: SerialPort, T: Timer<TIMER_HZ>, L: EventListener, const TIMER_HZ: u32> UdpClientStack
    for Interface<S, T, L, TIMER_HZ>
{
    type UdpSocket = Socket;
    type Error = Error;

    fn socket(&mut self) -> Result<Socket, Error> {
        self.alloc_entry(Protocol::Udp)
    }

    fn connect(&mut self, socket: &mut Socket, remote: SocketAddr) -> Result<(), Error> {
        self.process_events();

        let entry = self.entries[socket.link_id];
        if entry.connected {
            return Err(Error::IsConnected);
        }

        self.modem
            .open_udp(socket.link_id, remote, entry.local_port)?;

        self.entries[socket.link_id].connected = true;
        self.entries[socket.link_id].remote = Some(remote);
        Ok(())
    }

    fn send(&mut self, socket: &mut Socket, buffer: &[u8]) -> nb::Result<(), Error> {
        self.process_events();

        if !self.entries[socket.link_id].connected {
            return Err(nb::Error::Other(Error::NoConnection));
        }

        self.modem
            .send(socket.link_id, buffer)
            .map_err(nb::Error::Other)?;
        Ok(())
    }

    /// Non-blocking receive of at most one datagram, truncated to the
    /// buffer. The device does not report a source for unicast UDP, so the
    /// stored remote address is returned.
    fn receive(
        &mut self,
        socket: &mut Socket,
        buffer: &mut [u8],
    ) -> nb::Result<(usize, SocketAddr), Error> {
        let length = self.modem.recv_udp(socket.link_id, buffer, 0)?;
        let remote = self.entries[socket.link_id]
            .remote
            .ok_or(nb::Error::Other(Error::NoConnection))?;

        self.dispatch_events();
        Ok((length, remote))
    }

    fn close(&mut self, socket: Socket) -> Result<(), Error> {
        let result = self.modem.close(socket.link_id);
        self.free_entry(socket.link_id);
        self.dispatch_events();
        result
    }
}

impl<S: SerialPort, T: Timer<TIMER_HZ>, L: EventListener, const TIMER_HZ: u32> UdpFullStack
    for Interface<S, T, L, TIMER_HZ>
{
    /// Reserves a local port for this handle. Refused when another slot
    /// already claimed the port.
    fn bind(&mut self, socket: &mut Socket, local_port: u16) -> Result<(), Error> {
        self.process_events();

        if self.entries[socket.link_id].proto != Protocol::Udp {
            return Err(Error::Unsupported);
        }
        if self.entries[socket.link_id].connected {
            return Err(Error::Parameter);
        }

        let reserved = self.entries.iter().enumerate().any(|(id, entry)| {
            id != socket.link_id && entry.in_use && entry.local_port == local_port
        });
        if reserved {
            return Err(Error::Parameter);
        }

        self.entries[socket.link_id].local_port = local_port;
        Ok(())
    }

    /// Sends to an explicit destination, reconnecting the underlying
    /// device socket when the destination changed.
    fn send_to(
        &mut self,
        socket: &mut Socket,
        remote: SocketAddr,
        buffer: &[u8],
    ) -> nb::Result<(), Error> {
        self.process_events();

        if is_unspecified(&remote) {
            return Err(nb::Error::Other(Error::DnsFailure));
        }

        let entry = self.entries[socket.link_id];
        if entry.connected && entry.remote != Some(remote) {
            self.modem.close(socket.link_id).map_err(nb::Error::Other)?;
            self.entries[socket.link_id].connected = false;
        }

        if !self.entries[socket.link_id].connected {
            self.modem
                .open_udp(socket.link_id, remote, entry.local_port)
                .map_err(nb::Error::Other)?;
            self.entries[socket.link_id].connected = true;
            self.entries[socket.link_id].remote = Some(remote);
        }

        self.modem
            .send(socket.link_id, buffer)
            .map_err(nb::Error::Other)?;
        Ok(())
    }
}

impl<S: SerialPort, T: Timer<TIMER_HZ>, L: EventListener, const TIMER_HZ: u32> Dns
    for Interface<S, T, L, TIMER_HZ>
{
    type Error = Error;

    /// Resolves through the device. Only IPv4 results are supported.
    fn get_host_by_name(
        &mut self,
        hostname: &str,
        addr_type: AddrType,
    ) -> nb::Result<IpAddr, Error> {
        if matches!(addr_type, AddrType::IPv6) {
            return Err(nb::Error::Other(Error::Unsupported));
        }

        let ip = self
            .modem
            .dns_lookup(hostname)
            .map_err(nb::Error::Other)?;
        Ok(IpAddr::V4(ip))
    }

    fn get_host_by_address(&mut self, _addr: IpAddr) -> nb::Result<String<256>, Error> {
        // The firmware offers no reverse lookup.
        Err(nb::Error::Other(Error::Unsupported))
    }
}

fn is_unspecified(remote: &SocketAddr) -> bool {
    if remote.port() == 0 {
        return true;
    }

    match remote.ip() {
        IpAddr::V4(ip) => ip.octets() == [0, 0, 0, 0],
        IpAddr::V6(_) => false,
    }
}
