//! Modem command layer.
//!
//! [`Modem`] owns the AT parser and every piece of device-mirrored state:
//! the five socket slots, the inbound packet queue, the association state
//! and the transient flags unsolicited lines latch for the command in
//! flight. All command/response exchanges run inside `&mut self` methods,
//! which serializes them the same way the single serial link serializes
//! the wire.
//!
//! Unsolicited lines observed while a command is pending are applied to
//! session state *before* the command's result is produced; this is how
//! `ALREADY CONNECTED` and `UNLINK` race-correct the outcome of open and
//! close.

use crate::config::{Config, SOCKET_COUNT};
use crate::error::Error;
use crate::events::{DriverEvent, LinkStatus};
use crate::parser::{AtParser, RecvError, Token, LINE_CAPACITY};
use crate::queue::{Packet, PacketQueue};
use crate::serial::SerialPort;
use crate::urc::Urc;
use crate::wifi::AccessPoint;
use core::str::FromStr;
use embedded_nal::{IpAddr, Ipv4Addr, SocketAddr};
use fugit::TimerInstantU32;
use fugit_timer::Timer;
use heapless::String;

/// Oldest AT firmware whose TCP passive receive mode this driver trusts.
pub const AT_VERSION_TCP_PASSIVE: Version = Version::new(1, 7, 0);

const EVENT_QUEUE_CAPACITY: usize = 16;

/// Firmware version triple as reported by `AT+GMR`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }

    /// Parses `1.7.0.0(Aug 16 2018 ...)` style strings, taking the first
    /// three dot-separated components and ignoring trailing annotations.
    pub(crate) fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let major = parts.next()?.trim().parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch_part = parts.next()?;

        let digits = patch_part
            .as_bytes()
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        let patch = patch_part.get(..digits)?.parse().ok()?;

        Some(Self { major, minor, patch })
    }
}

/// Radio mode passed to [`Modem::startup`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WifiMode {
    Station = 1,
    SoftAp = 2,
    StationSoftAp = 3,
}

impl WifiMode {
    fn from_u8(mode: u8) -> Option<Self> {
        match mode {
            1 => Some(Self::Station),
            2 => Some(Self::SoftAp),
            3 => Some(Self::StationSoftAp),
            _ => None,
        }
    }
}

/// Transport protocol of a connection slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Device-mirrored state of one link id.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SocketSlot {
    /// True between an acknowledged `CIPSTART` and the matching close.
    pub(crate) open: bool,
    pub(crate) proto: Protocol,
    pub(crate) keepalive: u16,
    pub(crate) local_port: u16,
    /// Bytes buffered on the device (passive mode only).
    pub(crate) available: usize,
    /// The device reported `id,CLOSED` for this slot.
    pub(crate) remote_closed: bool,
    /// The post-close drain pull has already returned empty.
    final_pull_done: bool,
}

impl Default for SocketSlot {
    fn default() -> Self {
        Self {
            open: false,
            proto: Protocol::Tcp,
            keepalive: 0,
            local_port: 0,
            available: 0,
            remote_closed: false,
            final_pull_done: false,
        }
    }
}

/// Flags written by unsolicited lines during the command in flight, reset
/// on entry of each command and consumed at its call site.
#[derive(Default, Debug)]
struct PendingOutcome {
    /// The association attempt was terminated by `FAIL`.
    fail: bool,
    /// `+CWJAP:<code>` failure detail.
    connect_error: Option<u8>,
    /// `ALREADY CONNECTED` was seen for the in-flight `CIPSTART`.
    already_connected: bool,
    /// `UNLINK` was seen for the in-flight `CIPCLOSE`.
    link_closed: bool,
    /// `SEND OK` / `SEND FAIL` outcome.
    send_result: Option<bool>,
    /// `ready` boot marker after a reset.
    ready: bool,
    /// An unsolicited handler decided the pending match should give up.
    aborted: bool,
}

impl PendingOutcome {
    fn begin(&mut self) {
        *self = Self::default();
    }
}

/// Command-layer failures, mapped to [`Error`] at the public surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum CommandError {
    Timeout,
    Transport,
    Overflow,
    /// The device answered `ERROR` (or an equivalent negative response).
    Device,
    /// An unsolicited handler aborted the pending match.
    Aborted,
}

impl From<RecvError> for CommandError {
    fn from(error: RecvError) -> Self {
        match error {
            RecvError::Timeout => Self::Timeout,
            RecvError::Transport => Self::Transport,
            RecvError::Overflow => Self::Overflow,
        }
    }
}

impl From<CommandError> for Error {
    fn from(_: CommandError) -> Self {
        Error::DeviceError
    }
}

impl From<RecvError> for Error {
    fn from(_: RecvError) -> Self {
        Error::DeviceError
    }
}

/// One record handed to a response matcher.
enum Step {
    Line(String<LINE_CAPACITY>),
    Prompt,
    /// An unsolicited line was consumed and applied to session state.
    /// Yielded per notification so waiters can re-check latched flags.
    Handled,
}

/// The AT command session.
pub struct Modem<S: SerialPort, T: Timer<TIMER_HZ>, const TIMER_HZ: u32> {
    parser: AtParser<S, T, TIMER_HZ>,
    config: Config,
    link: LinkStatus,
    at_version: Option<Version>,
    sdk_version: Option<Version>,
    passive_mode: bool,
    hw_flow_ctrl: bool,
    sockets: [SocketSlot; SOCKET_COUNT],
    queue: PacketQueue,
    pending: PendingOutcome,
    events: heapless::Vec<DriverEvent, EVENT_QUEUE_CAPACITY>,
}

impl<S: SerialPort, T: Timer<TIMER_HZ>, const TIMER_HZ: u32> Modem<S, T, TIMER_HZ> {
    pub fn new(serial: S, timer: T, config: Config) -> Self {
        Self {
            parser: AtParser::new(serial, timer, config.recv_timeout_ms),
            config,
            link: LinkStatus::Disconnected,
            at_version: None,
            sdk_version: None,
            passive_mode: false,
            hw_flow_ctrl: false,
            sockets: [SocketSlot::default(); SOCKET_COUNT],
            queue: PacketQueue::default(),
            pending: PendingOutcome::default(),
            events: heapless::Vec::new(),
        }
    }

    pub fn link_status(&self) -> LinkStatus {
        self.link
    }

    pub fn at_version(&self) -> Option<Version> {
        self.at_version
    }

    pub fn sdk_version(&self) -> Option<Version> {
        self.sdk_version
    }

    pub fn is_socket_open(&self, link_id: usize) -> bool {
        link_id < SOCKET_COUNT && self.sockets[link_id].open
    }

    /// True if at least one byte is buffered on the serial link.
    pub fn readable(&self) -> bool {
        self.parser.readable()
    }

    /// True if the serial link accepts writes without blocking.
    pub fn writeable(&self) -> bool {
        self.parser.writeable()
    }

    /// Enables tracing of every transmitted and received line.
    pub fn debug_on(&mut self, enabled: bool) {
        self.parser.debug_on(enabled);
    }

    /// Overrides the timeout used for inline payload reads between
    /// commands.
    pub fn set_timeout_ms(&mut self, timeout_ms: u32) {
        self.parser.set_timeout_ms(timeout_ms);
    }

    /// Overrides the line delimiter, CRLF by default.
    pub fn set_delimiter(&mut self, delimiter: &'static str) {
        self.parser.set_delimiter(delimiter);
    }

    /// Installs the data-ready callback on the serial port. The callback
    /// may run in interrupt context and must only wake the task that calls
    /// [`process_events`](Self::process_events).
    pub fn on_data_ready(&mut self, callback: fn()) {
        self.parser.serial_mut().on_data_ready(callback);
    }

    /// Drains buffered input without blocking, applying any unsolicited
    /// notifications to session state.
    pub fn process_events(&mut self) {
        loop {
            let now = self.parser.now();
            match self.pump_once(now) {
                Ok(()) => {}
                Err(_) => break,
            }
        }
    }

    /// Hands out the queued status events.
    pub(crate) fn take_events(&mut self) -> heapless::Vec<DriverEvent, EVENT_QUEUE_CAPACITY> {
        core::mem::take(&mut self.events)
    }

    // ---- lifecycle -------------------------------------------------------

    /// Brings the device into a known state: reset, firmware check, flow
    /// control and passive mode negotiation, station-only default mode.
    pub fn initialize(&mut self) -> Result<(), Error> {
        let baud = self.config.baud_rate;
        self.parser
            .serial_mut()
            .set_baud_rate(baud)
            .map_err(|_| Error::DeviceError)?;

        self.reset()?;
        self.query_firmware_versions()?;

        if self.config.hw_flow_control {
            self.start_uart_hw_flow_ctrl()?;
        }
        self.cond_enable_tcp_passive_mode()?;

        if self.get_default_wifi_mode()? != WifiMode::Station {
            self.set_default_wifi_mode(WifiMode::Station)?;
        }

        Ok(())
    }

    /// Restarts the firmware and waits for its `ready` marker. Retried once.
    pub fn reset(&mut self) -> Result<(), Error> {
        for _ in 0..2 {
            self.pending.begin();
            if self.run_reset().is_ok() {
                self.apply_reset();
                return Ok(());
            }
        }

        Err(Error::DeviceError)
    }

    fn run_reset(&mut self) -> Result<(), CommandError> {
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser.send_command(format_args!("AT+RST"), deadline)?;
        self.expect_ok(deadline)?;

        // Booting takes a while; 'ready' is latched by the URC handler.
        let deadline = self.parser.deadline(self.config.connect_timeout_ms);
        while !self.pending.ready {
            self.pump_once(deadline)?;
        }

        Ok(())
    }

    /// Device state is gone after a restart; mirror that.
    fn apply_reset(&mut self) {
        self.sockets = [SocketSlot::default(); SOCKET_COUNT];
        self.queue = PacketQueue::default();
        self.passive_mode = false;
        self.set_link(LinkStatus::Disconnected);
    }

    /// Pings the device.
    pub fn at_available(&mut self) -> bool {
        self.pending.begin();
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);

        if self.parser.send_command(format_args!("AT"), deadline).is_err() {
            return false;
        }

        self.expect_ok(deadline).is_ok()
    }

    /// Selects the radio mode and enables connection multiplexing.
    pub fn startup(&mut self, mode: WifiMode) -> Result<(), Error> {
        self.pending.begin();
        self.run_startup(mode)?;
        Ok(())
    }

    fn run_startup(&mut self, mode: WifiMode) -> Result<(), CommandError> {
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser
            .send_command(format_args!("AT+CWMODE_CUR={}", mode as u8), deadline)?;
        self.expect_ok(deadline)?;

        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser.send_command(format_args!("AT+CIPMUX=1"), deadline)?;
        self.expect_ok(deadline)
    }

    /// Queries both firmware version triples and stores them on the session.
    pub fn query_firmware_versions(&mut self) -> Result<(Version, Version), Error> {
        self.pending.begin();
        let result = self.run_query_versions()?;
        Ok(result)
    }

    fn run_query_versions(&mut self) -> Result<(Version, Version), CommandError> {
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser.send_command(format_args!("AT+GMR"), deadline)?;

        let at = self.recv_capture(deadline, |line| {
            line.strip_prefix("AT version:").and_then(Version::parse)
        })?;
        let sdk = self.recv_capture(deadline, |line| {
            line.strip_prefix("SDK version:").and_then(Version::parse)
        })?;
        self.expect_ok(deadline)?;

        self.at_version = Some(at);
        self.sdk_version = Some(sdk);
        Ok((at, sdk))
    }

    /// Enables or disables DHCP. `mode`: 0 = SoftAP, 1 = station, 2 = both.
    pub fn dhcp(&mut self, enabled: bool, mode: u8) -> Result<(), Error> {
        if mode > 2 {
            return Err(Error::Parameter);
        }

        self.pending.begin();
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser.send_command(
            format_args!("AT+CWDHCP_CUR={},{}", mode, u8::from(enabled)),
            deadline,
        )?;
        self.expect_ok(deadline)?;
        Ok(())
    }

    /// Reads the radio mode stored in device flash.
    pub fn get_default_wifi_mode(&mut self) -> Result<WifiMode, Error> {
        self.pending.begin();
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser.send_command(format_args!("AT+CWMODE_DEF?"), deadline)?;

        let mode = self.recv_capture(deadline, |line| {
            line.strip_prefix("+CWMODE_DEF:")
                .and_then(|raw| raw.trim().parse::<u8>().ok())
        })?;
        self.expect_ok(deadline)?;

        WifiMode::from_u8(mode).ok_or(Error::DeviceError)
    }

    /// Writes the default radio mode to device flash.
    pub fn set_default_wifi_mode(&mut self, mode: WifiMode) -> Result<(), Error> {
        self.pending.begin();
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser
            .send_command(format_args!("AT+CWMODE_DEF={}", mode as u8), deadline)?;
        self.expect_ok(deadline)?;
        Ok(())
    }

    /// Negotiates RTS/CTS flow control on both ends of the UART.
    pub fn start_uart_hw_flow_ctrl(&mut self) -> Result<(), Error> {
        self.set_uart_flow_ctrl(true)
    }

    /// Returns both ends of the UART to unpaced operation.
    pub fn stop_uart_hw_flow_ctrl(&mut self) -> Result<(), Error> {
        self.set_uart_flow_ctrl(false)
    }

    fn set_uart_flow_ctrl(&mut self, enabled: bool) -> Result<(), Error> {
        self.pending.begin();
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        let baud = self.config.baud_rate;
        self.parser.send_command(
            format_args!("AT+UART_CUR={},8,1,0,{}", baud, if enabled { 3 } else { 0 }),
            deadline,
        )?;
        self.expect_ok(deadline)?;

        self.parser
            .serial_mut()
            .set_flow_control(enabled)
            .map_err(|_| Error::DeviceError)?;
        self.hw_flow_ctrl = enabled;
        Ok(())
    }

    /// Switches TCP receiving to passive (pull) mode when the firmware is
    /// recent enough to support it reliably. Returns whether it is enabled.
    pub fn cond_enable_tcp_passive_mode(&mut self) -> Result<bool, Error> {
        match self.at_version {
            Some(version) if version >= AT_VERSION_TCP_PASSIVE => {}
            _ => return Ok(false),
        }

        self.pending.begin();
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser
            .send_command(format_args!("AT+CIPRECVMODE=1"), deadline)?;
        self.expect_ok(deadline)?;
        self.passive_mode = true;
        Ok(true)
    }

    pub fn passive_mode(&self) -> bool {
        self.passive_mode
    }

    // ---- Wi-Fi -----------------------------------------------------------

    /// Associates with an access point. Blocks up to the connect timeout.
    pub fn connect(&mut self, ssid: &str, passphrase: &str) -> Result<(), Error> {
        self.pending.begin();
        self.set_link(LinkStatus::Connecting);

        let result = self.run_join(ssid, passphrase);
        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                self.set_link(LinkStatus::Disconnected);
                let code = self.pending.connect_error.take();
                self.pending.fail = false;

                Err(match (error, code) {
                    (CommandError::Timeout, None) => Error::ConnectionTimeout,
                    (_, Some(1)) => Error::ConnectionTimeout,
                    (_, Some(2)) => Error::AuthFailure,
                    (_, Some(3)) => Error::NoSsid,
                    _ => Error::NoConnection,
                })
            }
        }
    }

    fn run_join(&mut self, ssid: &str, passphrase: &str) -> Result<(), CommandError> {
        let deadline = self.parser.deadline(self.config.connect_timeout_ms);
        self.parser.send_command(
            format_args!("AT+CWJAP_CUR=\"{}\",\"{}\"", ssid, passphrase),
            deadline,
        )?;
        self.expect_ok(deadline)
    }

    /// Leaves the current access point.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        self.pending.begin();
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser.send_command(format_args!("AT+CWQAP"), deadline)?;
        self.expect_ok(deadline)?;
        self.set_link(LinkStatus::Disconnected);
        Ok(())
    }

    /// Station IPv4 address.
    pub fn ip_addr(&mut self) -> Result<Ipv4Addr, Error> {
        self.pending.begin();
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser.send_command(format_args!("AT+CIFSR"), deadline)?;

        let ip = self.recv_capture(deadline, |line| {
            line.strip_prefix("+CIFSR:STAIP,").and_then(parse_quoted_ip)
        })?;
        self.expect_ok(deadline)?;
        Ok(ip)
    }

    /// Station MAC address.
    pub fn mac_addr(&mut self) -> Result<String<17>, Error> {
        self.pending.begin();
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser.send_command(format_args!("AT+CIFSR"), deadline)?;

        let mac = self.recv_capture(deadline, |line| {
            line.strip_prefix("+CIFSR:STAMAC,")
                .and_then(quoted_field)
                .and_then(bounded_string)
        })?;
        self.expect_ok(deadline)?;
        Ok(mac)
    }

    /// Gateway address assigned by the access point.
    pub fn gateway(&mut self) -> Result<Ipv4Addr, Error> {
        self.query_station_field("gateway")
    }

    /// Network mask assigned by the access point.
    pub fn netmask(&mut self) -> Result<Ipv4Addr, Error> {
        self.query_station_field("netmask")
    }

    fn query_station_field(&mut self, field: &str) -> Result<Ipv4Addr, Error> {
        self.pending.begin();
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser
            .send_command(format_args!("AT+CIPSTA_CUR?"), deadline)?;

        let ip = self.recv_capture(deadline, |line| {
            line.strip_prefix("+CIPSTA_CUR:")
                .and_then(|rest| rest.strip_prefix(field))
                .and_then(|rest| rest.strip_prefix(':'))
                .and_then(parse_quoted_ip)
        })?;
        self.expect_ok(deadline)?;
        Ok(ip)
    }

    /// Signal strength of the current association. Queries the joined
    /// BSSID first, then asks for a targeted scan of it.
    pub fn rssi(&mut self) -> Result<i8, Error> {
        self.pending.begin();
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser
            .send_command(format_args!("AT+CWJAP_CUR?"), deadline)?;

        let bssid: String<17> = self.recv_capture(deadline, |line| {
            line.strip_prefix("+CWJAP_CUR:")
                .and_then(|rest| nth_quoted_field(rest, 1))
                .and_then(bounded_string)
        })?;
        self.expect_ok(deadline)?;

        self.pending.begin();
        let deadline = self.parser.deadline(self.config.connect_timeout_ms);
        self.parser
            .send_command(format_args!("AT+CWLAP=\"\",\"{}\",", bssid), deadline)?;

        let record = self.recv_capture(deadline, |line| AccessPoint::parse(line))?;
        self.expect_ok(deadline)?;
        Ok(record.rssi)
    }

    /// Scans for access points, filling `out` with up to `out.len()`
    /// records. Returns the total number of networks seen.
    pub fn scan(&mut self, out: &mut [AccessPoint]) -> Result<usize, Error> {
        self.pending.begin();
        let deadline = self.parser.deadline(self.config.connect_timeout_ms);
        self.parser.send_command(format_args!("AT+CWLAP"), deadline)?;

        let mut count = 0;
        loop {
            let record = self.recv_capture(deadline, |line| {
                if line == "OK" {
                    return Some(None);
                }
                AccessPoint::parse(line).map(Some)
            })?;

            match record {
                Some(ap) => {
                    if count < out.len() {
                        out[count] = ap;
                    }
                    count += 1;
                }
                None => return Ok(count),
            }
        }
    }

    /// Resolves a host name through the device.
    pub fn dns_lookup(&mut self, name: &str) -> Result<Ipv4Addr, Error> {
        self.pending.begin();
        let result = self.run_dns_lookup(name);
        result.map_err(|_| Error::DnsFailure)
    }

    fn run_dns_lookup(&mut self, name: &str) -> Result<Ipv4Addr, CommandError> {
        let deadline = self.parser.deadline(self.config.connect_timeout_ms);
        self.parser
            .send_command(format_args!("AT+CIPDOMAIN=\"{}\"", name), deadline)?;

        let ip = self.recv_capture(deadline, |line| {
            line.strip_prefix("+CIPDOMAIN:")
                .map(|raw| raw.trim().trim_matches('"'))
                .and_then(|raw| Ipv4Addr::from_str(raw).ok())
        })?;
        self.expect_ok(deadline)?;
        Ok(ip)
    }

    // ---- sockets ---------------------------------------------------------

    /// Opens a TCP connection on `link_id`. If the device reports the slot
    /// as already connected, the stale link is closed and the open is
    /// retried exactly once.
    pub fn open_tcp(
        &mut self,
        link_id: usize,
        remote: SocketAddr,
        keepalive_secs: u16,
    ) -> Result<(), Error> {
        let ip = self.check_open_args(link_id, &remote)?;
        let port = remote.port();

        self.pending.begin();
        match self.run_open_tcp(link_id, ip, port, keepalive_secs) {
            Ok(()) => {}
            Err(error) => {
                if !self.pending.already_connected {
                    return Err(error.into());
                }
                self.reopen_stale_slot(link_id)?;
                self.run_open_tcp(link_id, ip, port, keepalive_secs)
                    .map_err(Error::from)?;
            }
        }

        self.finish_open(link_id, Protocol::Tcp, keepalive_secs, 0);
        Ok(())
    }

    /// Opens a UDP association on `link_id`, optionally bound to a local
    /// port. The same already-connected race correction as TCP applies.
    pub fn open_udp(
        &mut self,
        link_id: usize,
        remote: SocketAddr,
        local_port: u16,
    ) -> Result<(), Error> {
        let ip = self.check_open_args(link_id, &remote)?;
        let port = remote.port();

        self.pending.begin();
        match self.run_open_udp(link_id, ip, port, local_port) {
            Ok(()) => {}
            Err(error) => {
                if !self.pending.already_connected {
                    return Err(error.into());
                }
                self.reopen_stale_slot(link_id)?;
                self.run_open_udp(link_id, ip, port, local_port)
                    .map_err(Error::from)?;
            }
        }

        self.finish_open(link_id, Protocol::Udp, 0, local_port);
        Ok(())
    }

    fn check_open_args(&self, link_id: usize, remote: &SocketAddr) -> Result<Ipv4Addr, Error> {
        if link_id >= SOCKET_COUNT {
            return Err(Error::Parameter);
        }
        if self.sockets[link_id].open {
            return Err(Error::Parameter);
        }

        match remote.ip() {
            IpAddr::V4(ip) => Ok(ip),
            IpAddr::V6(_) => Err(Error::Unsupported),
        }
    }

    fn run_open_tcp(
        &mut self,
        link_id: usize,
        ip: Ipv4Addr,
        port: u16,
        keepalive: u16,
    ) -> Result<(), CommandError> {
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        if keepalive > 0 {
            self.parser.send_command(
                format_args!("AT+CIPSTART={},\"TCP\",\"{}\",{},{}", link_id, ip, port, keepalive),
                deadline,
            )?;
        } else {
            self.parser.send_command(
                format_args!("AT+CIPSTART={},\"TCP\",\"{}\",{}", link_id, ip, port),
                deadline,
            )?;
        }
        self.expect_ok(deadline)
    }

    fn run_open_udp(
        &mut self,
        link_id: usize,
        ip: Ipv4Addr,
        port: u16,
        local_port: u16,
    ) -> Result<(), CommandError> {
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        if local_port > 0 {
            self.parser.send_command(
                format_args!("AT+CIPSTART={},\"UDP\",\"{}\",{},{}", link_id, ip, port, local_port),
                deadline,
            )?;
        } else {
            self.parser.send_command(
                format_args!("AT+CIPSTART={},\"UDP\",\"{}\",{}", link_id, ip, port),
                deadline,
            )?;
        }
        self.expect_ok(deadline)
    }

    /// Race correction for `ALREADY CONNECTED`: drop the aborted attempt's
    /// `ERROR` tail, then close the stale link. A close failure here means
    /// the driver's slot bookkeeping diverged from the device.
    fn reopen_stale_slot(&mut self, link_id: usize) -> Result<(), Error> {
        self.pending.begin();
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        let _ = self.expect_ok(deadline);

        self.pending.begin();
        let closed = self.run_close(link_id).is_ok() || self.pending.link_closed;
        debug_assert!(closed, "failed to close a slot the device reported as connected");
        if !closed {
            return Err(Error::DeviceError);
        }

        self.pending.begin();
        Ok(())
    }

    fn finish_open(&mut self, link_id: usize, proto: Protocol, keepalive: u16, local_port: u16) {
        self.sockets[link_id] = SocketSlot {
            open: true,
            proto,
            keepalive,
            local_port,
            available: 0,
            remote_closed: false,
            final_pull_done: false,
        };
        // Drop packets a previous user of this link id left behind.
        self.queue.clear_socket(link_id);
    }

    /// Sends one buffer on an open socket. Retried once on any failure of
    /// the prepare/prompt/payload/confirm sequence.
    pub fn send(&mut self, link_id: usize, buf: &[u8]) -> Result<(), Error> {
        if link_id >= SOCKET_COUNT {
            return Err(Error::Parameter);
        }
        if !self.sockets[link_id].open {
            return Err(Error::NoConnection);
        }
        if buf.is_empty() {
            return Ok(());
        }

        let mut result = Err(Error::DeviceError);
        for _ in 0..2 {
            self.pending.begin();
            if self.run_send(link_id, buf).is_ok() {
                result = Ok(());
                break;
            }
        }

        // Without hardware flow control the device may already be pushing
        // notifications; drain them before they overrun the UART.
        if !self.hw_flow_ctrl {
            self.process_events();
        }

        result
    }

    fn run_send(&mut self, link_id: usize, buf: &[u8]) -> Result<(), CommandError> {
        let deadline = self.parser.deadline(self.config.send_timeout_ms);
        self.parser
            .send_command(format_args!("AT+CIPSEND={},{}", link_id, buf.len()), deadline)?;
        self.expect_prompt(deadline)?;
        self.parser.write_all(buf, deadline)?;
        self.wait_send_confirm(deadline)
    }

    /// Waits for the firmware's transmission verdict: `SEND OK`/`SEND FAIL`
    /// on current firmware, a bare `OK` on older builds.
    fn wait_send_confirm(
        &mut self,
        deadline: TimerInstantU32<TIMER_HZ>,
    ) -> Result<(), CommandError> {
        loop {
            if let Some(confirmed) = self.pending.send_result.take() {
                return if confirmed {
                    Ok(())
                } else {
                    Err(CommandError::Device)
                };
            }

            match self.next_step(deadline)? {
                Step::Line(line) => {
                    if line.as_str() == "OK" {
                        return Ok(());
                    }
                    if line.as_str() == "ERROR" {
                        return Err(CommandError::Device);
                    }
                }
                Step::Prompt | Step::Handled => {}
            }
        }
    }

    /// Stream receive. Delivers bytes from the head packet of `link_id`,
    /// leaving any unread remainder queued. With `timeout_ms == 0` the call
    /// never blocks. Returns `Ok(0)` once the peer closed the connection
    /// and the queue is drained.
    pub fn recv_tcp(
        &mut self,
        link_id: usize,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> nb::Result<usize, Error> {
        self.check_recv_args(link_id, Protocol::Tcp)?;
        let deadline = self.parser.deadline(timeout_ms);
        self.process_events();

        if self.passive_mode {
            return self.recv_tcp_passive(link_id, buf, deadline, timeout_ms == 0);
        }

        loop {
            if let Some(n) = self.queue.read_tcp(link_id, buf) {
                return Ok(n);
            }

            let slot = &self.sockets[link_id];
            if !slot.open && slot.remote_closed {
                return Ok(0);
            }

            self.wait_or_would_block(deadline, timeout_ms == 0)?;
        }
    }

    /// Datagram receive: at most one whole packet, truncated to `buf` with
    /// the remainder discarded.
    pub fn recv_udp(
        &mut self,
        link_id: usize,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> nb::Result<usize, Error> {
        self.check_recv_args(link_id, Protocol::Udp)?;
        let deadline = self.parser.deadline(timeout_ms);
        self.process_events();

        loop {
            if let Some(n) = self.queue.read_udp(link_id, buf) {
                return Ok(n);
            }

            self.wait_or_would_block(deadline, timeout_ms == 0)?;
        }
    }

    fn check_recv_args(&self, link_id: usize, proto: Protocol) -> Result<(), Error> {
        if link_id >= SOCKET_COUNT {
            return Err(Error::Parameter);
        }
        if self.sockets[link_id].open && self.sockets[link_id].proto != proto {
            return Err(Error::Parameter);
        }
        Ok(())
    }

    /// Blocks for the next inbound record, or fails with `WouldBlock` when
    /// non-blocking or past the deadline.
    fn wait_or_would_block(
        &mut self,
        deadline: TimerInstantU32<TIMER_HZ>,
        non_blocking: bool,
    ) -> nb::Result<(), Error> {
        if non_blocking || self.parser.now() >= deadline {
            return Err(nb::Error::WouldBlock);
        }

        match self.pump_once(deadline) {
            Ok(()) => Ok(()),
            Err(CommandError::Timeout) => Err(nb::Error::WouldBlock),
            Err(_) => Err(nb::Error::Other(Error::DeviceError)),
        }
    }

    /// Passive-mode receive: pull buffered bytes with `CIPRECVDATA`. After
    /// a peer close one final pull drains what the device still holds,
    /// then the call reports end of stream.
    fn recv_tcp_passive(
        &mut self,
        link_id: usize,
        buf: &mut [u8],
        deadline: TimerInstantU32<TIMER_HZ>,
        non_blocking: bool,
    ) -> nb::Result<usize, Error> {
        loop {
            let slot = self.sockets[link_id];
            let peer_closed = !slot.open && slot.remote_closed;

            if slot.available == 0 && !peer_closed {
                self.wait_or_would_block(deadline, non_blocking)?;
                continue;
            }
            if peer_closed && slot.final_pull_done {
                return Ok(0);
            }

            let want = if slot.available > 0 {
                buf.len().min(slot.available)
            } else {
                buf.len()
            };

            self.pending.begin();
            match self.pull_data(link_id, &mut buf[..want]) {
                Ok(0) => {
                    self.sockets[link_id].available = 0;
                    if peer_closed {
                        self.sockets[link_id].final_pull_done = true;
                        return Ok(0);
                    }
                    self.wait_or_would_block(deadline, non_blocking)?;
                }
                Ok(n) => {
                    self.sockets[link_id].available = slot.available.saturating_sub(n);
                    return Ok(n);
                }
                Err(_) if peer_closed => {
                    self.sockets[link_id].final_pull_done = true;
                    return Ok(0);
                }
                Err(_) => return Err(nb::Error::Other(Error::DeviceError)),
            }
        }
    }

    fn pull_data(&mut self, link_id: usize, buf: &mut [u8]) -> Result<usize, CommandError> {
        let deadline = self.parser.deadline(self.config.recv_timeout_ms);
        self.parser.send_command(
            format_args!("AT+CIPRECVDATA={},{}", link_id, buf.len()),
            deadline,
        )?;

        let header = self.recv_capture(deadline, |line| {
            if line == "OK" {
                return Some(None);
            }
            line.strip_prefix("+CIPRECVDATA,")
                .and_then(|rest| rest.strip_suffix(':'))
                .and_then(|raw| raw.parse::<usize>().ok())
                .map(Some)
        })?;

        let Some(len) = header else {
            // No data buffered; the device answered with a bare OK.
            return Ok(0);
        };

        let take = len.min(buf.len());
        let n = self.parser.read_exact(&mut buf[..take], deadline)?;
        if len > take {
            let _ = self.parser.discard_exact(len - take, deadline);
        }
        self.expect_ok(deadline)?;
        Ok(n)
    }

    /// Closes `link_id`. Idempotent: closing an already-closed slot is a
    /// success. `UNLINK` from the device is treated as "already closed".
    pub fn close(&mut self, link_id: usize) -> Result<(), Error> {
        if link_id >= SOCKET_COUNT {
            return Err(Error::Parameter);
        }
        if !self.sockets[link_id].open {
            self.sockets[link_id] = SocketSlot::default();
            return Ok(());
        }

        let mut closed = false;
        for _ in 0..2 {
            self.pending.begin();
            if self.run_close(link_id).is_ok() || self.pending.link_closed {
                closed = true;
                break;
            }
        }

        // Reset the slot even on failure so the id can be reused.
        self.sockets[link_id] = SocketSlot::default();
        self.queue.clear_socket(link_id);

        if closed {
            Ok(())
        } else {
            Err(Error::DeviceError)
        }
    }

    fn run_close(&mut self, link_id: usize) -> Result<(), CommandError> {
        let deadline = self.parser.deadline(self.config.misc_timeout_ms);
        self.parser
            .send_command(format_args!("AT+CIPCLOSE={}", link_id), deadline)?;
        self.expect_ok(deadline)
    }

    // ---- record pump -----------------------------------------------------

    /// Consumes one record. An unsolicited line is applied to session
    /// state and reported as [`Step::Handled`]; a handler may abort the
    /// pending match instead.
    fn next_step(&mut self, deadline: TimerInstantU32<TIMER_HZ>) -> Result<Step, CommandError> {
        match self.parser.poll(deadline) {
            Ok(Token::Line(line)) => {
                if let Some(urc) = Urc::parse(&line) {
                    self.handle_urc(urc);
                    if self.pending.aborted {
                        return Err(CommandError::Aborted);
                    }
                    return Ok(Step::Handled);
                }
                Ok(Step::Line(line))
            }
            Ok(Token::Prompt) => Ok(Step::Prompt),
            Err(error) => Err(error.into()),
        }
    }

    /// Consumes one record outside any command, dropping stray lines.
    fn pump_once(&mut self, deadline: TimerInstantU32<TIMER_HZ>) -> Result<(), CommandError> {
        match self.next_step(deadline) {
            Ok(Step::Line(line)) => {
                debug!("dropping stray line: {}", line.as_str());
                Ok(())
            }
            Ok(Step::Prompt) | Ok(Step::Handled) => Ok(()),
            Err(CommandError::Aborted) => {
                self.pending.aborted = false;
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Consumes lines until `matcher` extracts a response, the device
    /// answers `ERROR`, the deadline elapses, or the match is aborted.
    fn recv_capture<R>(
        &mut self,
        deadline: TimerInstantU32<TIMER_HZ>,
        mut matcher: impl FnMut(&str) -> Option<R>,
    ) -> Result<R, CommandError> {
        loop {
            match self.next_step(deadline)? {
                Step::Line(line) => {
                    if line.as_str() == "ERROR" {
                        return Err(CommandError::Device);
                    }
                    if let Some(result) = matcher(&line) {
                        return Ok(result);
                    }
                }
                Step::Prompt | Step::Handled => {}
            }
        }
    }

    fn expect_ok(&mut self, deadline: TimerInstantU32<TIMER_HZ>) -> Result<(), CommandError> {
        self.recv_capture(deadline, |line| (line == "OK").then_some(()))
    }

    /// Waits for the `>` prompt of the send handshake.
    fn expect_prompt(&mut self, deadline: TimerInstantU32<TIMER_HZ>) -> Result<(), CommandError> {
        loop {
            match self.next_step(deadline)? {
                Step::Prompt => return Ok(()),
                Step::Line(line) => {
                    if line.as_str() == "ERROR" {
                        return Err(CommandError::Device);
                    }
                }
                Step::Handled => {}
            }
        }
    }

    // ---- unsolicited handling --------------------------------------------

    fn handle_urc(&mut self, urc: Urc) {
        match urc {
            Urc::DataInline { link_id, len } => self.ingest_packet(link_id, len),
            Urc::DataAvailable { link_id, len } => {
                let was_empty = self.sockets[link_id].available == 0;
                self.sockets[link_id].available = len;
                if was_empty && len > 0 {
                    self.push_event(DriverEvent::SocketReadable(link_id));
                }
            }
            Urc::SocketConnected(link_id) => debug!("link {} reports CONNECT", link_id),
            Urc::SocketClosed(link_id) => {
                self.sockets[link_id].open = false;
                self.sockets[link_id].remote_closed = true;
                self.push_event(DriverEvent::SocketClosed(link_id));
            }
            Urc::AlreadyConnected => {
                self.pending.already_connected = true;
                self.pending.aborted = true;
            }
            Urc::Unlink => self.pending.link_closed = true,
            Urc::WifiConnected => debug!("associated, waiting for IP"),
            Urc::WifiGotIp => self.set_link(LinkStatus::GlobalUp),
            Urc::WifiDisconnect => self.set_link(LinkStatus::Disconnected),
            Urc::ConnectFail(code) => {
                self.pending.connect_error = Some(code);
                self.pending.fail = true;
            }
            Urc::Fail => {
                self.pending.fail = true;
                self.pending.aborted = true;
            }
            Urc::SendOk => self.pending.send_result = Some(true),
            Urc::SendFail => self.pending.send_result = Some(false),
            Urc::Ready => self.pending.ready = true,
            Urc::Busy => debug!("device busy"),
        }
    }

    /// Reads the inline payload announced by `+IPD,id,len:` and queues it.
    /// Over-ceiling and out-of-memory packets are dropped, but their bytes
    /// are always drained so line assembly stays aligned.
    fn ingest_packet(&mut self, link_id: usize, len: usize) {
        let deadline = self.parser.default_deadline();

        if !self.queue.admits(self.config.socket_buffer_ceiling) {
            warn!(
                "socket buffer ceiling reached ({} bytes queued), dropping {} bytes for link {}",
                self.queue.bytes_queued(),
                len,
                link_id
            );
            let _ = self.parser.discard_exact(len, deadline);
            return;
        }

        let mut packet = match Packet::alloc(link_id, len) {
            Ok(packet) => packet,
            Err(()) => {
                warn!("no memory for a {} byte packet on link {}", len, link_id);
                let _ = self.parser.discard_exact(len, deadline);
                return;
            }
        };

        match self.parser.read_exact(packet.payload_mut(), deadline) {
            Ok(n) if n == len => {
                let was_empty = !self.queue.has_data(link_id);
                self.queue.push(packet);
                if was_empty {
                    self.push_event(DriverEvent::SocketReadable(link_id));
                }
            }
            Ok(n) => warn!("inbound packet truncated ({}/{} bytes), dropped", n, len),
            Err(_) => warn!("transport error while reading an inbound packet"),
        }
    }

    fn set_link(&mut self, status: LinkStatus) {
        if self.link != status {
            self.link = status;
            self.push_event(DriverEvent::LinkStatus(status));
        }
    }

    fn push_event(&mut self, event: DriverEvent) {
        if self.events.push(event).is_err() {
            warn!("event queue full, dropping event");
        }
    }

    #[cfg(test)]
    pub(crate) fn bytes_queued(&self) -> usize {
        self.queue.bytes_queued()
    }

    #[cfg(test)]
    pub(crate) fn serial_mut(&mut self) -> &mut S {
        self.parser.serial_mut()
    }
}

/// Extracts `content` from a `"content"`-style field.
fn quoted_field(raw: &str) -> Option<&str> {
    raw.trim().strip_prefix('"')?.split('"').next()
}

/// Copies a borrowed field into a bounded string, rejecting overflow.
pub(crate) fn bounded_string<const N: usize>(raw: &str) -> Option<String<N>> {
    let mut out = String::new();
    out.push_str(raw).ok()?;
    Some(out)
}

/// Returns the `n`-th double-quoted substring of `raw` (zero-based).
pub(crate) fn nth_quoted_field(raw: &str, n: usize) -> Option<&str> {
    raw.split('"').nth(2 * n + 1)
}

fn parse_quoted_ip(raw: &str) -> Option<Ipv4Addr> {
    Ipv4Addr::from_str(quoted_field(raw)?).ok()
}
