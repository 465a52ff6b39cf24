//! # ESP8266 AT network layer
//!
//! Driver for a serial-attached ESP8266 running the AT command firmware,
//! exposing up to five concurrent TCP/UDP sockets through
//! [embedded-nal](embedded_nal) and a Wi-Fi control facade.
//!
//! The crate owns the whole transport: command formatting, response
//! matching, the unsolicited-notification dispatcher, inline payload
//! framing and the per-socket receive queue. Applications provide a
//! [`SerialPort`] implementation for their UART and a
//! [fugit timer](fugit_timer::Timer) for deadlines.
//!
//! Inbound packets are heap-allocated up to a configurable ceiling, so a
//! global allocator is required.
//!
//! ## Example
//!
//! ````
//! use core::str::FromStr;
//! use embedded_nal::{SocketAddr, TcpClientStack};
//! use esp8266_nal::example::{ExampleSerialPort, ExampleTimer};
//! use esp8266_nal::wifi::{Security, WifiInterface};
//! use esp8266_nal::{Config, Interface};
//!
//! let serial = ExampleSerialPort::new();
//! let mut interface = Interface::new(serial, ExampleTimer::default(), Config::default());
//!
//! // Joining a WIFI access point
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
//! ````
#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]

extern crate alloc;

// This module must come first so the others see its macros.
pub(crate) mod fmt;

pub mod config;
pub mod error;
pub mod events;
pub mod example;
pub(crate) mod parser;
pub(crate) mod queue;
pub mod serial;
pub mod session;
pub mod stack;
pub mod urc;
pub mod wifi;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use error::Error;
pub use events::{DriverEvent, EventListener, LinkStatus, NullListener};
pub use serial::SerialPort;
pub use session::{Modem, Version, WifiMode};
pub use stack::{Interface, Socket};
