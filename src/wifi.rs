//! Wi-Fi facade.
//!
//! Joining an access point, querying address information and scanning.
//! Credential validation happens before any device traffic, so a malformed
//! SSID or passphrase never reaches the wire.
//!
//! ## Example
//!
//! ````
//! use esp8266_nal::example::{ExampleSerialPort, ExampleTimer};
//! use esp8266_nal::wifi::{Security, WifiInterface};
//! use esp8266_nal::{Config, Interface};
//!
//! let serial = ExampleSerialPort::new();
//! let mut interface = Interface::new(serial, ExampleTimer::default(), Config::default());
//!
//! interface.join("test_wifi", "secret1234", Security::Wpa2).unwrap();
//!
//! let ip = interface.get_ip_address().unwrap();
//! assert_eq!("10.0.0.181", ip.to_string());
//! ````

use crate::config::{PASSPHRASE_MAX_LENGTH, PASSPHRASE_MIN_LENGTH, SSID_MAX_LENGTH};
use crate::error::Error;
use crate::events::{EventListener, LinkStatus};
use crate::serial::SerialPort;
use crate::session::nth_quoted_field;
use crate::stack::Interface;
use core::fmt::Debug;
use embedded_nal::Ipv4Addr;
use fugit_timer::Timer;
use heapless::String;

/// Access point security mode, as reported in scan records.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Security {
    None,
    Wep,
    Wpa,
    Wpa2,
    WpaWpa2,
    #[default]
    Unknown,
}

impl Security {
    fn from_code(code: u8) -> Self {
        match code {
            0 => Self::None,
            1 => Self::Wep,
            2 => Self::Wpa,
            3 => Self::Wpa2,
            4 => Self::WpaWpa2,
            _ => Self::Unknown,
        }
    }
}

/// One discovered access point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String<{ SSID_MAX_LENGTH }>,
    pub bssid: [u8; 6],
    pub channel: u8,
    pub rssi: i8,
    pub security: Security,
}

impl AccessPoint {
    /// Parses a `+CWLAP:(sec,"ssid",rssi,"bssid",channel,...)` record.
    /// Trailing fields newer firmware appends are ignored.
    pub(crate) fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix("+CWLAP:(")?;
        let rest = rest.strip_suffix(')').unwrap_or(rest);

        let (sec, rest) = rest.split_once(',')?;
        let security = Security::from_code(sec.trim().parse().ok()?);

        let rest = rest.trim_start().strip_prefix('"')?;
        let (ssid, rest) = rest.split_once('"')?;
        let ssid = crate::session::bounded_string(ssid)?;

        let rest = rest.strip_prefix(',')?;
        let (rssi, rest) = rest.split_once(',')?;
        let rssi = rssi.trim().parse().ok()?;

        let bssid_raw = nth_quoted_field(rest, 0)?;
        let bssid = parse_bssid(bssid_raw)?;

        let channel = rest
            .split_once("\",")
            .and_then(|(_, tail)| tail.split(',').next())
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0);

        Some(Self {
            ssid,
            bssid,
            channel,
            rssi,
            security,
        })
    }
}

fn parse_bssid(raw: &str) -> Option<[u8; 6]> {
    let mut bssid = [0u8; 6];
    let mut parts = raw.split(':');

    for byte in bssid.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }

    parts.next().is_none().then_some(bssid)
}

/// Station-mode network control exposed to the application.
pub trait WifiInterface {
    type Error: Debug;

    /// Associates with an access point and waits for an IP address.
    fn join(&mut self, ssid: &str, passphrase: &str, security: Security)
        -> Result<(), Self::Error>;

    /// Leaves the current access point.
    fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Station IPv4 address, once assigned.
    fn get_ip_address(&mut self) -> Result<Ipv4Addr, Self::Error>;

    /// Station MAC address.
    fn get_mac_address(&mut self) -> Result<String<17>, Self::Error>;

    /// Gateway address assigned by the access point.
    fn get_gateway(&mut self) -> Result<Ipv4Addr, Self::Error>;

    /// Network mask assigned by the access point.
    fn get_netmask(&mut self) -> Result<Ipv4Addr, Self::Error>;

    /// Signal strength of the current association in dBm.
    fn get_rssi(&mut self) -> Result<i8, Self::Error>;

    /// Scans for access points, filling `out` with up to `out.len()`
    /// records. Returns the total number of networks found.
    fn scan(&mut self, out: &mut [AccessPoint]) -> Result<usize, Self::Error>;

    /// Current association state, with pending notifications applied.
    fn link_status(&mut self) -> LinkStatus;
}

impl<S: SerialPort, T: Timer<TIMER_HZ>, L: EventListener, const TIMER_HZ: u32> WifiInterface
    for Interface<S, T, L, TIMER_HZ>
{
    type Error = Error;

    /// Runs the whole join flow: device initialization (once), station
    /// mode, DHCP, association, IP check. Blocks up to the connect
    /// timeout.
    fn join(&mut self, ssid: &str, passphrase: &str, security: Security)
        -> Result<(), Error> {
        if ssid.is_empty() {
            return Err(Error::NoSsid);
        }
        if ssid.len() > SSID_MAX_LENGTH {
            return Err(Error::Parameter);
        }
        if security != Security::None
            && (passphrase.len() < PASSPHRASE_MIN_LENGTH
                || passphrase.len() > PASSPHRASE_MAX_LENGTH)
        {
            return Err(Error::Parameter);
        }

        self.process_events();
        if self.started && self.modem.link_status() == LinkStatus::GlobalUp {
            return Err(Error::IsConnected);
        }

        self.init()?;
        self.start()?;

        self.modem.dhcp(true, 1).map_err(|_| Error::DhcpFailure)?;
        self.modem.connect(ssid, passphrase)?;

        match self.modem.ip_addr() {
            Ok(ip) if ip.octets() != [0, 0, 0, 0] => Ok(()),
            _ => Err(Error::DhcpFailure),
        }
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        self.started = false;
        self.initialized = false;
        self.modem.disconnect()
    }

    fn get_ip_address(&mut self) -> Result<Ipv4Addr, Error> {
        if !self.started {
            return Err(Error::NoConnection);
        }

        match self.modem.ip_addr() {
            Ok(ip) if ip.octets() != [0, 0, 0, 0] => Ok(ip),
            Ok(_) => Err(Error::NoConnection),
            Err(error) => Err(error),
        }
    }

    fn get_mac_address(&mut self) -> Result<String<17>, Error> {
        self.modem.mac_addr()
    }

    fn get_gateway(&mut self) -> Result<Ipv4Addr, Error> {
        if !self.started {
            return Err(Error::NoConnection);
        }
        self.modem.gateway()
    }

    fn get_netmask(&mut self) -> Result<Ipv4Addr, Error> {
        if !self.started {
            return Err(Error::NoConnection);
        }
        self.modem.netmask()
    }

    fn get_rssi(&mut self) -> Result<i8, Error> {
        if !self.started {
            return Err(Error::NoConnection);
        }
        self.modem.rssi()
    }

    fn scan(&mut self, out: &mut [AccessPoint]) -> Result<usize, Error> {
        self.init()?;
        self.start()?;
        self.modem.scan(out)
    }

    fn link_status(&mut self) -> LinkStatus {
        self.process_events();
        self.modem.link_status()
    }
}
