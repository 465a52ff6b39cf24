//! Unsolicited (out-of-band) lines emitted by the modem.
//!
//! The recognized set is closed: every prefix the firmware can emit between
//! or during command exchanges maps to one [`Urc`] variant here, and the
//! session reacts to them in
//! [`Modem::handle_urc`](crate::session::Modem). Lines are classified
//! before they are offered to the response matcher of an in-flight command,
//! so state corrections (`ALREADY CONNECTED`, `UNLINK`, `id,CLOSED`) are
//! applied before the command's result is produced.

use crate::config::SOCKET_COUNT;

/// One classified unsolicited line.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Urc {
    /// `+IPD,id,len:`: an inline payload of `len` bytes follows on the
    /// wire (active receive mode, and UDP in every mode).
    DataInline { link_id: usize, len: usize },
    /// `+IPD,id,len`: `len` bytes are buffered on the device and must be
    /// pulled with `CIPRECVDATA` (passive TCP mode).
    DataAvailable { link_id: usize, len: usize },
    /// `id,CONNECT`
    SocketConnected(usize),
    /// `id,CLOSED`
    SocketClosed(usize),
    /// `ALREADY CONNECTED`: the slot of the in-flight `CIPSTART` is open.
    AlreadyConnected,
    /// `UNLINK`: the device tore a link down while closing.
    Unlink,
    /// `WIFI CONNECTED`
    WifiConnected,
    /// `WIFI GOT IP`
    WifiGotIp,
    /// `WIFI DISCONNECT`
    WifiDisconnect,
    /// `+CWJAP:<code>`: association failure detail, followed by `FAIL`.
    ConnectFail(u8),
    /// `FAIL` terminating a failed association.
    Fail,
    /// `SEND OK`
    SendOk,
    /// `SEND FAIL`
    SendFail,
    /// `ready`: the firmware finished booting.
    Ready,
    /// `busy s...` / `busy p...`
    Busy,
}

impl Urc {
    /// Classifies a complete line (delimiter stripped; `+IPD` and other
    /// colon-terminated records keep their trailing `:`). Returns `None`
    /// for anything that is not a recognized unsolicited line, e.g. command
    /// echo or the response the in-flight command is waiting for.
    pub fn parse(line: &str) -> Option<Self> {
        match line {
            "ALREADY CONNECTED" => return Some(Self::AlreadyConnected),
            "UNLINK" => return Some(Self::Unlink),
            "WIFI CONNECTED" => return Some(Self::WifiConnected),
            "WIFI GOT IP" => return Some(Self::WifiGotIp),
            "WIFI DISCONNECT" => return Some(Self::WifiDisconnect),
            "FAIL" => return Some(Self::Fail),
            "SEND OK" => return Some(Self::SendOk),
            "SEND FAIL" => return Some(Self::SendFail),
            "ready" => return Some(Self::Ready),
            _ => {}
        }

        if let Some(rest) = line.strip_prefix("+IPD,") {
            return Self::parse_data_header(rest);
        }

        if let Some(rest) = line.strip_prefix("+CWJAP:") {
            return rest.trim().parse::<u8>().ok().map(Self::ConnectFail);
        }

        if line.starts_with("busy") {
            return Some(Self::Busy);
        }

        Self::parse_socket_state(line)
    }

    /// `id,len:` (inline) or `id,len` (availability notice).
    fn parse_data_header(rest: &str) -> Option<Self> {
        let (inline, rest) = match rest.strip_suffix(':') {
            Some(stripped) => (true, stripped),
            None => (false, rest),
        };

        let (id, len) = rest.split_once(',')?;
        let link_id = id.parse::<usize>().ok().filter(|id| *id < SOCKET_COUNT)?;
        let len = len.parse::<usize>().ok()?;

        if inline {
            Some(Self::DataInline { link_id, len })
        } else {
            Some(Self::DataAvailable { link_id, len })
        }
    }

    /// `id,CONNECT` / `id,CLOSED`, one parser for all five slots.
    fn parse_socket_state(line: &str) -> Option<Self> {
        let (id, state) = line.split_once(',')?;
        let link_id = id.parse::<usize>().ok().filter(|id| *id < SOCKET_COUNT)?;

        match state {
            "CONNECT" => Some(Self::SocketConnected(link_id)),
            "CLOSED" => Some(Self::SocketClosed(link_id)),
            _ => None,
        }
    }
}
