use crate::config::Config;
use crate::error::Error;
use crate::events::{DriverEvent, EventListener, LinkStatus};
use crate::stack::Interface;
use crate::tests::mock::{self, MockSerialPort, MockTimer};
use alloc::string::ToString;
use core::str::FromStr;
use embedded_nal::{SocketAddr, TcpClientStack, UdpClientStack, UdpFullStack};

fn remote(addr: &str) -> SocketAddr {
    SocketAddr::from_str(addr).unwrap()
}

#[test]
fn test_socket_handles_are_allocated_in_order() {
    let mut interface = mock::interface(MockSerialPort::new());

    for expected in 0..5 {
        let socket = TcpClientStack::socket(&mut interface).unwrap();
        assert_eq!(expected, socket.link_id);
    }
}

#[test]
fn test_no_socket_when_all_slots_in_use() {
    let mut interface = mock::interface(MockSerialPort::new());

    let sockets: alloc::vec::Vec<_> = (0..5)
        .map(|_| TcpClientStack::socket(&mut interface).unwrap())
        .collect();

    assert_eq!(
        Error::NoSocket,
        TcpClientStack::socket(&mut interface).unwrap_err()
    );
    drop(sockets);
}

#[test]
fn test_close_frees_the_slot_for_reuse() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response(); // CIPSTART
    serial.add_ok_response(); // CIPCLOSE

    let mut interface = mock::interface(serial);

    let mut socket = TcpClientStack::socket(&mut interface).unwrap();
    TcpClientStack::connect(&mut interface, &mut socket, remote("10.0.0.1:80")).unwrap();
    TcpClientStack::close(&mut interface, socket).unwrap();

    let socket = TcpClientStack::socket(&mut interface).unwrap();
    assert_eq!(0, socket.link_id);
}

#[test]
fn test_tcp_connect_is_refused_when_connected() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut interface = mock::interface(serial);

    let mut socket = TcpClientStack::socket(&mut interface).unwrap();
    TcpClientStack::connect(&mut interface, &mut socket, remote("10.0.0.1:80")).unwrap();

    assert_eq!(
        nb::Error::Other(Error::IsConnected),
        TcpClientStack::connect(&mut interface, &mut socket, remote("10.0.0.1:81")).unwrap_err()
    );
}

#[test]
fn test_keepalive_is_applied_at_connect_time() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut interface = mock::interface(serial);

    let mut socket = TcpClientStack::socket(&mut interface).unwrap();
    interface.set_keepalive(&socket, 60).unwrap();
    TcpClientStack::connect(&mut interface, &mut socket, remote("10.0.0.1:80")).unwrap();

    let commands = interface.modem_mut().serial_mut().commands_as_strings();
    assert_eq!(
        ["AT+CIPSTART=0,\"TCP\",\"10.0.0.1\",80,60".to_string()],
        commands.as_slice()
    );
}

#[test]
fn test_keepalive_option_rules() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut interface = mock::interface(serial);

    let mut tcp = TcpClientStack::socket(&mut interface).unwrap();
    assert_eq!(
        Err(Error::Parameter),
        interface.set_keepalive(&tcp, 7201)
    );

    let udp = UdpClientStack::socket(&mut interface).unwrap();
    assert_eq!(Err(Error::Unsupported), interface.set_keepalive(&udp, 60));

    TcpClientStack::connect(&mut interface, &mut tcp, remote("10.0.0.1:80")).unwrap();
    // The device only accepts keepalive before the connect.
    assert_eq!(Err(Error::Unsupported), interface.set_keepalive(&tcp, 60));
}

#[test]
fn test_tcp_send_requires_connection() {
    let mut interface = mock::interface(MockSerialPort::new());
    let mut socket = TcpClientStack::socket(&mut interface).unwrap();

    assert_eq!(
        nb::Error::Other(Error::NoConnection),
        TcpClientStack::send(&mut interface, &mut socket, b"hi").unwrap_err()
    );
}

#[test]
fn test_tcp_receive_reports_eof_and_drops_connected_state() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut interface = mock::interface(serial);
    let mut socket = TcpClientStack::socket(&mut interface).unwrap();
    TcpClientStack::connect(&mut interface, &mut socket, remote("10.0.0.1:80")).unwrap();

    interface
        .modem_mut()
        .serial_mut()
        .add_unsolicited(b"+IPD,0,2:hi");
    interface
        .modem_mut()
        .serial_mut()
        .add_unsolicited(b"0,CLOSED\r\n");

    let mut buf = [0u8; 8];
    assert_eq!(
        Ok(2),
        TcpClientStack::receive(&mut interface, &mut socket, &mut buf)
    );
    assert_eq!(
        Ok(0),
        TcpClientStack::receive(&mut interface, &mut socket, &mut buf)
    );
    assert_eq!(Ok(false), interface.is_connected(&socket));
}

#[test]
fn test_udp_bind_rejects_duplicate_local_port() {
    let mut interface = mock::interface(MockSerialPort::new());

    let mut first = UdpClientStack::socket(&mut interface).unwrap();
    let mut second = UdpClientStack::socket(&mut interface).unwrap();

    interface.bind(&mut first, 4000).unwrap();
    assert_eq!(Err(Error::Parameter), interface.bind(&mut second, 4000));
    interface.bind(&mut second, 4001).unwrap();
}

#[test]
fn test_udp_connect_uses_bound_local_port() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut interface = mock::interface(serial);

    let mut socket = UdpClientStack::socket(&mut interface).unwrap();
    interface.bind(&mut socket, 4000).unwrap();
    UdpClientStack::connect(&mut interface, &mut socket, remote("10.0.0.2:5000")).unwrap();

    let commands = interface.modem_mut().serial_mut().commands_as_strings();
    assert_eq!(
        ["AT+CIPSTART=0,\"UDP\",\"10.0.0.2\",5000,4000".to_string()],
        commands.as_slice()
    );
}

#[test]
fn test_udp_receive_returns_stored_remote() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut interface = mock::interface(serial);

    let mut socket = UdpClientStack::socket(&mut interface).unwrap();
    UdpClientStack::connect(&mut interface, &mut socket, remote("10.0.0.2:5000")).unwrap();

    interface
        .modem_mut()
        .serial_mut()
        .add_unsolicited(b"+IPD,0,4:pong");

    let mut buf = [0u8; 8];
    let (length, source) =
        UdpClientStack::receive(&mut interface, &mut socket, &mut buf).unwrap();
    assert_eq!(4, length);
    assert_eq!(remote("10.0.0.2:5000"), source);
}

#[test]
fn test_send_to_rejects_unspecified_destination() {
    let mut interface = mock::interface(MockSerialPort::new());
    let mut socket = UdpClientStack::socket(&mut interface).unwrap();

    assert_eq!(
        nb::Error::Other(Error::DnsFailure),
        interface
            .send_to(&mut socket, remote("0.0.0.0:5000"), b"hi")
            .unwrap_err()
    );
    assert_eq!(
        nb::Error::Other(Error::DnsFailure),
        interface
            .send_to(&mut socket, remote("10.0.0.2:0"), b"hi")
            .unwrap_err()
    );
}

#[test]
fn test_send_to_reuses_connection_for_same_destination() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response(); // CIPSTART
    serial.add_response(b"OK\r\n> ");
    serial.add_response(b"SEND OK\r\n");
    serial.add_response(b"OK\r\n> ");
    serial.add_response(b"SEND OK\r\n");

    let mut interface = mock::interface(serial);
    let mut socket = UdpClientStack::socket(&mut interface).unwrap();

    interface
        .send_to(&mut socket, remote("10.0.0.2:5000"), b"one")
        .unwrap();
    interface
        .send_to(&mut socket, remote("10.0.0.2:5000"), b"two")
        .unwrap();

    let commands = interface.modem_mut().serial_mut().commands_as_strings();
    let opens = commands
        .iter()
        .filter(|c| c.starts_with("AT+CIPSTART="))
        .count();
    assert_eq!(1, opens);
}

#[test]
fn test_send_to_reconnects_on_destination_change() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response(); // CIPSTART to the first destination
    serial.add_response(b"OK\r\n> ");
    serial.add_response(b"SEND OK\r\n");
    serial.add_ok_response(); // CIPCLOSE
    serial.add_ok_response(); // CIPSTART to the second destination
    serial.add_response(b"OK\r\n> ");
    serial.add_response(b"SEND OK\r\n");

    let mut interface = mock::interface(serial);
    let mut socket = UdpClientStack::socket(&mut interface).unwrap();

    interface
        .send_to(&mut socket, remote("10.0.0.2:5000"), b"one")
        .unwrap();
    interface
        .send_to(&mut socket, remote("10.0.0.3:5000"), b"two")
        .unwrap();

    let commands = interface.modem_mut().serial_mut().commands_as_strings();
    assert!(commands.contains(&"AT+CIPSTART=0,\"UDP\",\"10.0.0.2\",5000".to_string()));
    assert!(commands.contains(&"AT+CIPCLOSE=0".to_string()));
    assert!(commands.contains(&"AT+CIPSTART=0,\"UDP\",\"10.0.0.3\",5000".to_string()));
}

#[derive(Default)]
struct RecordingListener {
    events: alloc::vec::Vec<DriverEvent>,
}

impl EventListener for RecordingListener {
    fn on_event(&mut self, event: DriverEvent) {
        self.events.push(event);
    }
}

#[test]
fn test_listener_receives_committed_status_changes() {
    let mut serial = MockSerialPort::new();
    serial.add_unsolicited(b"WIFI GOT IP\r\n");
    serial.add_unsolicited(b"0,CLOSED\r\n");

    let mut interface = Interface::with_listener(
        serial,
        MockTimer::ticking(),
        Config::default(),
        RecordingListener::default(),
    );

    interface.process_events();

    assert_eq!(
        [
            DriverEvent::LinkStatus(LinkStatus::GlobalUp),
            DriverEvent::SocketClosed(0),
        ],
        interface.listener.events.as_slice()
    );
    // The slot state was committed before the callback fired.
    assert!(!interface.modem_mut().is_socket_open(0));
}

#[test]
fn test_listener_sees_readable_on_new_data() {
    let mut serial = MockSerialPort::new();
    serial.add_unsolicited(b"+IPD,1,2:hi");

    let mut interface = Interface::with_listener(
        serial,
        MockTimer::ticking(),
        Config::default(),
        RecordingListener::default(),
    );

    interface.process_events();
    assert_eq!(
        [DriverEvent::SocketReadable(1)],
        interface.listener.events.as_slice()
    );
}

#[test]
fn test_dns_through_the_interface() {
    use embedded_nal::{AddrType, Dns, IpAddr};

    let mut serial = MockSerialPort::new();
    serial.add_response(b"+CIPDOMAIN:\"93.184.216.34\"\r\nOK\r\n");

    let mut interface = mock::interface(serial);
    let ip = interface
        .get_host_by_name("example.com", AddrType::IPv4)
        .unwrap();
    assert_eq!(IpAddr::from_str("93.184.216.34").unwrap(), ip);

    assert_eq!(
        nb::Error::Other(Error::Unsupported),
        interface
            .get_host_by_name("example.com", AddrType::IPv6)
            .unwrap_err()
    );
}
