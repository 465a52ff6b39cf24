use crate::config::Config;
use crate::error::Error;
use crate::events::LinkStatus;
use crate::session::{Version, WifiMode, AT_VERSION_TCP_PASSIVE};
use crate::tests::mock::{self, MockSerialPort, TestModem};
use alloc::string::ToString;
use core::str::FromStr;
use embedded_nal::SocketAddr;

fn remote(addr: &str) -> SocketAddr {
    SocketAddr::from_str(addr).unwrap()
}

/// Modem with a scripted `AT+GMR` exchange already consumed, so the
/// firmware gate for passive mode can be steered per test.
fn modem_with_at_version(version: &str) -> TestModem {
    let mut serial = MockSerialPort::new();
    serial.add_response(
        alloc::format!("AT version:{}(Aug 16 2018)\r\nSDK version:3.0.0(d49923c)\r\nOK\r\n", version)
            .as_bytes(),
    );

    let mut modem = mock::modem(serial);
    modem.query_firmware_versions().unwrap();
    modem
}

#[test]
fn test_version_parse() {
    assert_eq!(Some(Version::new(1, 7, 0)), Version::parse("1.7.0.0(Aug 16 2018 00:00:00)"));
    assert_eq!(Some(Version::new(3, 0, 0)), Version::parse("3.0.0(d49923c)"));
    assert_eq!(Some(Version::new(2, 1, 4)), Version::parse("2.1.4"));
    assert_eq!(None, Version::parse("garbage"));
    assert_eq!(None, Version::parse("1.2"));
}

#[test]
fn test_version_ordering_against_passive_gate() {
    assert!(Version::new(1, 7, 0) >= AT_VERSION_TCP_PASSIVE);
    assert!(Version::new(2, 0, 0) >= AT_VERSION_TCP_PASSIVE);
    assert!(Version::new(1, 6, 2) < AT_VERSION_TCP_PASSIVE);
}

#[test]
fn test_startup_commands() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    modem.startup(WifiMode::Station).unwrap();

    let commands = modem.serial_mut().commands_as_strings();
    assert_eq!(
        ["AT+CWMODE_CUR=1".to_string(), "AT+CIPMUX=1".to_string()],
        commands.as_slice()
    );
}

#[test]
fn test_startup_mode_error() {
    let mut serial = MockSerialPort::new();
    serial.add_error_response();

    let mut modem = mock::modem(serial);
    assert_eq!(Err(Error::DeviceError), modem.startup(WifiMode::SoftAp));
}

#[test]
fn test_reset_waits_for_ready() {
    let mut serial = MockSerialPort::new();
    serial.add_response(b"OK\r\nready\r\n");

    let mut modem = mock::modem(serial);
    modem.reset().unwrap();

    let commands = modem.serial_mut().commands_as_strings();
    assert_eq!(["AT+RST".to_string()], commands.as_slice());
}

#[test]
fn test_reset_retries_once() {
    let mut serial = MockSerialPort::new();
    serial.add_error_response();
    serial.add_response(b"OK\r\nready\r\n");

    let mut modem = mock::modem(serial);
    modem.reset().unwrap();

    let commands = modem.serial_mut().commands_as_strings();
    assert_eq!(
        ["AT+RST".to_string(), "AT+RST".to_string()],
        commands.as_slice()
    );
}

#[test]
fn test_reset_clears_socket_state() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();
    serial.add_response(b"OK\r\nready\r\n");

    let mut modem = mock::modem(serial);
    modem.open_tcp(0, remote("10.0.0.1:80"), 0).unwrap();
    assert!(modem.is_socket_open(0));

    modem.reset().unwrap();
    assert!(!modem.is_socket_open(0));
}

#[test]
fn test_at_available() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    assert!(modem.at_available());
    // Nothing scripted: the next ping times out.
    assert!(!modem.at_available());
}

#[test]
fn test_query_firmware_versions() {
    let mut modem = modem_with_at_version("1.7.0.0");

    assert_eq!(Some(Version::new(1, 7, 0)), modem.at_version());
    assert_eq!(Some(Version::new(3, 0, 0)), modem.sdk_version());
}

#[test]
fn test_dhcp_rejects_bad_mode() {
    let mut modem = mock::modem(MockSerialPort::new());
    assert_eq!(Err(Error::Parameter), modem.dhcp(true, 3));
    assert!(modem.serial_mut().written().is_empty());
}

#[test]
fn test_dhcp_command_shape() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    modem.dhcp(true, 1).unwrap();

    let commands = modem.serial_mut().commands_as_strings();
    assert_eq!(["AT+CWDHCP_CUR=1,1".to_string()], commands.as_slice());
}

#[test]
fn test_default_wifi_mode_query() {
    let mut serial = MockSerialPort::new();
    serial.add_response(b"+CWMODE_DEF:3\r\nOK\r\n");

    let mut modem = mock::modem(serial);
    assert_eq!(WifiMode::StationSoftAp, modem.get_default_wifi_mode().unwrap());
}

#[test]
fn test_uart_flow_ctrl_negotiation() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    modem.start_uart_hw_flow_ctrl().unwrap();
    modem.stop_uart_hw_flow_ctrl().unwrap();

    let commands = modem.serial_mut().commands_as_strings();
    assert_eq!(
        [
            "AT+UART_CUR=115200,8,1,0,3".to_string(),
            "AT+UART_CUR=115200,8,1,0,0".to_string()
        ],
        commands.as_slice()
    );
    assert_eq!(&[true, false], modem.serial_mut().flow_control_calls());
}

#[test]
fn test_passive_mode_skipped_on_old_firmware() {
    let mut modem = modem_with_at_version("1.6.2.0");

    assert_eq!(Ok(false), modem.cond_enable_tcp_passive_mode());
    assert!(!modem.passive_mode());
}

#[test]
fn test_passive_mode_enabled_on_current_firmware() {
    let mut modem = modem_with_at_version("1.7.0.0");
    modem.serial_mut().add_ok_response();

    assert_eq!(Ok(true), modem.cond_enable_tcp_passive_mode());
    assert!(modem.passive_mode());

    let commands = modem.serial_mut().commands_as_strings();
    assert!(commands.contains(&"AT+CIPRECVMODE=1".to_string()));
}

#[test]
fn test_join_success_updates_link() {
    let mut serial = MockSerialPort::new();
    serial.add_response(b"WIFI CONNECTED\r\nWIFI GOT IP\r\nOK\r\n");

    let mut modem = mock::modem(serial);
    modem.connect("test_wifi", "secret1234").unwrap();

    assert_eq!(LinkStatus::GlobalUp, modem.link_status());
    let commands = modem.serial_mut().commands_as_strings();
    assert_eq!(
        ["AT+CWJAP_CUR=\"test_wifi\",\"secret1234\"".to_string()],
        commands.as_slice()
    );
}

#[test]
fn test_join_error_code_mapping() {
    for (code, expected) in [
        (1u8, Error::ConnectionTimeout),
        (2, Error::AuthFailure),
        (3, Error::NoSsid),
        (7, Error::NoConnection),
    ] {
        let mut serial = MockSerialPort::new();
        serial.add_response(
            alloc::format!("+CWJAP:{}\r\nFAIL\r\n", code).as_bytes(),
        );

        let mut modem = mock::modem(serial);
        assert_eq!(Err(expected), modem.connect("net", "password"));
        assert_eq!(LinkStatus::Disconnected, modem.link_status());
    }
}

#[test]
fn test_join_timeout_maps_to_connection_timeout() {
    let mut modem = mock::modem(MockSerialPort::new());
    assert_eq!(
        Err(Error::ConnectionTimeout),
        modem.connect("net", "password")
    );
}

#[test]
fn test_disconnect() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    modem.disconnect().unwrap();

    let commands = modem.serial_mut().commands_as_strings();
    assert_eq!(["AT+CWQAP".to_string()], commands.as_slice());
}

#[test]
fn test_ip_and_mac_queries() {
    let mut serial = MockSerialPort::new();
    serial.add_response(
        b"+CIFSR:STAIP,\"10.0.0.181\"\r\n+CIFSR:STAMAC,\"10:fe:ed:05:ba:50\"\r\nOK\r\n",
    );
    serial.add_response(
        b"+CIFSR:STAIP,\"10.0.0.181\"\r\n+CIFSR:STAMAC,\"10:fe:ed:05:ba:50\"\r\nOK\r\n",
    );

    let mut modem = mock::modem(serial);
    assert_eq!("10.0.0.181", modem.ip_addr().unwrap().to_string());
    assert_eq!("10:fe:ed:05:ba:50", modem.mac_addr().unwrap().as_str());
}

#[test]
fn test_gateway_and_netmask_queries() {
    let response = b"+CIPSTA_CUR:ip:\"10.0.0.181\"\r\n+CIPSTA_CUR:gateway:\"10.0.0.1\"\r\n+CIPSTA_CUR:netmask:\"255.255.255.0\"\r\nOK\r\n";

    let mut serial = MockSerialPort::new();
    serial.add_response(response);
    serial.add_response(response);

    let mut modem = mock::modem(serial);
    assert_eq!("10.0.0.1", modem.gateway().unwrap().to_string());
    assert_eq!("255.255.255.0", modem.netmask().unwrap().to_string());
}

#[test]
fn test_rssi_two_step_query() {
    let mut serial = MockSerialPort::new();
    serial.add_response(b"+CWJAP_CUR:\"test_wifi\",\"aa:bb:cc:dd:ee:ff\",6,-60\r\nOK\r\n");
    serial.add_response(b"+CWLAP:(3,\"test_wifi\",-61,\"aa:bb:cc:dd:ee:ff\",6)\r\nOK\r\n");

    let mut modem = mock::modem(serial);
    assert_eq!(-61, modem.rssi().unwrap());

    let commands = modem.serial_mut().commands_as_strings();
    assert_eq!(
        [
            "AT+CWJAP_CUR?".to_string(),
            "AT+CWLAP=\"\",\"aa:bb:cc:dd:ee:ff\",".to_string()
        ],
        commands.as_slice()
    );
}

#[test]
fn test_dns_lookup() {
    let mut serial = MockSerialPort::new();
    serial.add_response(b"+CIPDOMAIN:\"93.184.216.34\"\r\nOK\r\n");

    let mut modem = mock::modem(serial);
    assert_eq!(
        "93.184.216.34",
        modem.dns_lookup("example.com").unwrap().to_string()
    );
}

#[test]
fn test_dns_lookup_failure() {
    let mut serial = MockSerialPort::new();
    serial.add_error_response();

    let mut modem = mock::modem(serial);
    assert_eq!(Err(Error::DnsFailure), modem.dns_lookup("nosuchhost.invalid"));
}

#[test]
fn test_open_tcp_command_shape() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    modem.open_tcp(0, remote("10.0.0.1:80"), 0).unwrap();
    assert!(modem.is_socket_open(0));

    let commands = modem.serial_mut().commands_as_strings();
    assert_eq!(
        ["AT+CIPSTART=0,\"TCP\",\"10.0.0.1\",80".to_string()],
        commands.as_slice()
    );
}

#[test]
fn test_open_tcp_with_keepalive() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    modem.open_tcp(1, remote("10.0.0.1:80"), 60).unwrap();

    let commands = modem.serial_mut().commands_as_strings();
    assert_eq!(
        ["AT+CIPSTART=1,\"TCP\",\"10.0.0.1\",80,60".to_string()],
        commands.as_slice()
    );
}

#[test]
fn test_open_udp_with_local_port() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    modem.open_udp(2, remote("10.0.0.2:5000"), 4000).unwrap();

    let commands = modem.serial_mut().commands_as_strings();
    assert_eq!(
        ["AT+CIPSTART=2,\"UDP\",\"10.0.0.2\",5000,4000".to_string()],
        commands.as_slice()
    );
}

#[test]
fn test_open_rejects_bad_arguments() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    assert_eq!(
        Err(Error::Parameter),
        modem.open_tcp(5, remote("10.0.0.1:80"), 0)
    );
    assert_eq!(
        Err(Error::Unsupported),
        modem.open_tcp(0, remote("[2001:db8::1]:80"), 0)
    );

    modem.open_tcp(0, remote("10.0.0.1:80"), 0).unwrap();
    assert_eq!(
        Err(Error::Parameter),
        modem.open_tcp(0, remote("10.0.0.1:81"), 0)
    );
}

#[test]
fn test_send_with_current_firmware_confirmation() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();
    serial.add_response(b"OK\r\n> ");
    serial.add_response(b"Recv 5 bytes\r\nSEND OK\r\n");

    let mut modem = mock::modem(serial);
    modem.open_tcp(0, remote("10.0.0.1:7"), 0).unwrap();
    modem.send(0, b"hello").unwrap();

    let written = modem.serial_mut().written();
    let tail = &written[written.len() - "hello".len()..];
    assert_eq!(b"hello", tail);
}

#[test]
fn test_send_with_old_firmware_confirmation() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();
    serial.add_response(b"> ");
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    modem.open_tcp(0, remote("10.0.0.1:7"), 0).unwrap();
    modem.send(0, b"hello").unwrap();
}

#[test]
fn test_send_retries_once_after_send_fail() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();
    serial.add_response(b"OK\r\n> ");
    serial.add_response(b"SEND FAIL\r\n");
    serial.add_response(b"OK\r\n> ");
    serial.add_response(b"SEND OK\r\n");

    let mut modem = mock::modem(serial);
    modem.open_tcp(0, remote("10.0.0.1:7"), 0).unwrap();
    modem.send(0, b"hello").unwrap();

    let commands = modem.serial_mut().commands_as_strings();
    let attempts = commands
        .iter()
        .filter(|c| c.starts_with("AT+CIPSEND=0,5"))
        .count();
    assert_eq!(2, attempts);
}

#[test]
fn test_send_on_closed_slot() {
    let mut modem = mock::modem(MockSerialPort::new());
    assert_eq!(Err(Error::NoConnection), modem.send(0, b"hello"));
}

#[test]
fn test_recv_tcp_would_block_when_empty() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    modem.open_tcp(0, remote("10.0.0.1:7"), 0).unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(
        Err(nb::Error::WouldBlock),
        modem.recv_tcp(0, &mut buf, 0)
    );
}

#[test]
fn test_recv_rejects_protocol_mismatch() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    modem.open_udp(0, remote("10.0.0.2:5000"), 0).unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(
        Err(nb::Error::Other(Error::Parameter)),
        modem.recv_tcp(0, &mut buf, 0)
    );
}

#[test]
fn test_close_is_idempotent() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    modem.open_tcp(0, remote("10.0.0.1:7"), 0).unwrap();
    modem.close(0).unwrap();
    modem.close(0).unwrap();

    let commands = modem.serial_mut().commands_as_strings();
    let closes = commands.iter().filter(|c| *c == "AT+CIPCLOSE=0").count();
    assert_eq!(1, closes);
}

#[test]
fn test_close_accepts_unlink_as_closed() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();
    serial.add_response(b"UNLINK\r\nERROR\r\n");

    let mut modem = mock::modem(serial);
    modem.open_tcp(0, remote("10.0.0.1:7"), 0).unwrap();
    modem.close(0).unwrap();
    assert!(!modem.is_socket_open(0));
}

#[test]
fn test_close_failure_still_frees_the_slot() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();

    let mut modem = mock::modem(serial);
    modem.open_tcp(0, remote("10.0.0.1:7"), 0).unwrap();

    // No response scripted: both close attempts time out.
    assert_eq!(Err(Error::DeviceError), modem.close(0));
    assert!(!modem.is_socket_open(0));

    modem.serial_mut().add_ok_response();
    modem.open_tcp(0, remote("10.0.0.1:7"), 0).unwrap();
}

#[test]
fn test_passive_recv_pulls_buffered_data() {
    let mut modem = modem_with_at_version("1.7.0.0");
    modem.serial_mut().add_ok_response();
    assert_eq!(Ok(true), modem.cond_enable_tcp_passive_mode());

    modem.serial_mut().add_ok_response();
    modem.open_tcp(0, remote("10.0.0.1:7"), 0).unwrap();

    modem.serial_mut().add_unsolicited(b"+IPD,0,16\r\n");
    modem
        .serial_mut()
        .add_response(b"+CIPRECVDATA,16:nice to see you!OK\r\n");

    let mut buf = [0u8; 32];
    assert_eq!(Ok(16), modem.recv_tcp(0, &mut buf, 0));
    assert_eq!(b"nice to see you!", &buf[..16]);

    // Device buffer drained: the next poll would block.
    assert_eq!(Err(nb::Error::WouldBlock), modem.recv_tcp(0, &mut buf, 0));
}

#[test]
fn test_passive_recv_final_pull_after_peer_close() {
    let mut modem = modem_with_at_version("1.7.0.0");
    modem.serial_mut().add_ok_response();
    assert_eq!(Ok(true), modem.cond_enable_tcp_passive_mode());

    modem.serial_mut().add_ok_response();
    modem.open_tcp(0, remote("10.0.0.1:7"), 0).unwrap();

    modem.serial_mut().add_unsolicited(b"0,CLOSED\r\n");
    modem.process_events();
    assert!(!modem.is_socket_open(0));

    // The device still holds five bytes the peer sent before closing.
    modem
        .serial_mut()
        .add_response(b"+CIPRECVDATA,5:helloOK\r\n");

    let mut buf = [0u8; 16];
    assert_eq!(Ok(5), modem.recv_tcp(0, &mut buf, 0));
    assert_eq!(b"hello", &buf[..5]);

    // Next pull comes back empty and the stream reports EOF from then on.
    modem.serial_mut().add_ok_response();
    assert_eq!(Ok(0), modem.recv_tcp(0, &mut buf, 0));
    assert_eq!(Ok(0), modem.recv_tcp(0, &mut buf, 0));
}

#[test]
fn test_send_drains_notifications_without_flow_control() {
    let mut serial = MockSerialPort::new();
    serial.add_ok_response();
    serial.add_response(b"OK\r\n> ");
    serial.add_response(b"SEND OK\r\n+IPD,0,2:hi");

    let mut modem = mock::modem(serial);
    modem.open_tcp(0, remote("10.0.0.1:7"), 0).unwrap();
    modem.send(0, b"hello").unwrap();

    // The notification behind SEND OK was ingested by the post-send drain.
    let mut buf = [0u8; 4];
    assert_eq!(Ok(2), modem.recv_tcp(0, &mut buf, 0));
    assert_eq!(b"hi", &buf[..2]);
}

#[test]
fn test_config_ceiling_is_respected() {
    let config = Config::default().socket_buffer_ceiling(3);

    let mut serial = MockSerialPort::new();
    serial.add_unsolicited(b"+IPD,0,3:abc");
    serial.add_unsolicited(b"+IPD,0,3:def");

    let mut modem = mock::modem_with_config(serial, config);
    modem.process_events();

    let mut buf = [0u8; 8];
    assert_eq!(Ok(3), modem.recv_tcp(0, &mut buf, 0));
    // The second frame exceeded the ceiling and was dropped.
    assert_eq!(Err(nb::Error::WouldBlock), modem.recv_tcp(0, &mut buf, 0));
}
