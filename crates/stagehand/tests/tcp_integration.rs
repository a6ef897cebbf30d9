//! TCP sockets through the bridge: two-phase transitions, accept and real traffic.

mod common;

use std::collections::HashSet;
use std::net::SocketAddr;

use common::{err, ok, start_default};
use pretty_assertions::assert_eq;
use stagehand::{Bridge, ErrorCode, Handle, IpAddressFamily, OptionValue, ShutdownType, SocketOption};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn listener(bridge: &Bridge) -> (Handle, SocketAddr) {
    let socket = ok(bridge.create_tcp_socket(IpAddressFamily::Ipv4));
    ok(bridge.tcp_start_bind(socket, loopback()));
    ok(bridge.tcp_finish_bind(socket));
    ok(bridge.tcp_start_listen(socket));
    ok(bridge.tcp_finish_listen(socket));
    let addr = ok(bridge.tcp_local_address(socket));
    (socket, addr)
}

fn connect(bridge: &Bridge, addr: SocketAddr) -> (Handle, Handle, Handle) {
    let socket = ok(bridge.create_tcp_socket(IpAddressFamily::Ipv4));
    ok(bridge.tcp_start_connect(socket, addr));
    let (input, output) = ok(bridge.tcp_finish_connect(socket));
    (socket, input, output)
}

/// Wait for a pending connection, then accept it.
fn accept(bridge: &Bridge, listener: Handle) -> (Handle, Handle, Handle) {
    let ready = ok(bridge.tcp_subscribe(listener));
    ok(bridge.pollable_block(ready));
    ok(bridge.drop_pollable(ready));
    ok(bridge.tcp_accept(listener))
}

fn read_exact(bridge: &Bridge, input: Handle, len: usize) -> Vec<u8> {
    let mut received = Vec::new();
    while received.len() < len {
        received.extend(ok(bridge.blocking_read(input, (len - received.len()) as u64)));
    }
    received
}

#[test_log::test]
fn test_handles_are_unique() {
    let (_context, bridge) = start_default();
    let mut seen = HashSet::new();
    for _ in 0..32 {
        let socket = ok(bridge.create_tcp_socket(IpAddressFamily::Ipv4));
        assert!(seen.insert(socket));
        ok(bridge.drop_tcp_socket(socket));
    }
}

#[test_log::test]
fn test_two_phase_ordering() {
    let (_context, bridge) = start_default();
    let socket = ok(bridge.create_tcp_socket(IpAddressFamily::Ipv4));

    assert_eq!(
        err(bridge.tcp_finish_bind(socket)).code(),
        Some(ErrorCode::NotInProgress)
    );

    ok(bridge.tcp_start_bind(socket, loopback()));
    assert_eq!(
        err(bridge.tcp_start_bind(socket, loopback())).code(),
        Some(ErrorCode::InvalidState)
    );
    ok(bridge.tcp_finish_bind(socket));

    // Listening without start-listen
    assert_eq!(
        err(bridge.tcp_finish_listen(socket)).code(),
        Some(ErrorCode::NotInProgress)
    );
    assert!(!ok(bridge.tcp_is_listening(socket)));
}

#[test_log::test]
fn test_port_zero_binds_distinct_ports() {
    let (_context, bridge) = start_default();
    let (_first, first) = listener(&bridge);
    let (_second, second) = listener(&bridge);
    assert_ne!(first.port(), 0);
    assert_ne!(second.port(), 0);
    assert_ne!(first.port(), second.port());
}

#[test_log::test]
fn test_accept_without_connection_would_block() {
    let (_context, bridge) = start_default();
    let (socket, _) = listener(&bridge);
    assert!(ok(bridge.tcp_is_listening(socket)));
    assert_eq!(
        err(bridge.tcp_accept(socket)).code(),
        Some(ErrorCode::WouldBlock)
    );
}

#[test_log::test]
fn test_echo() {
    let (_context, bridge) = start_default();
    let (server, addr) = listener(&bridge);
    let (client, client_in, client_out) = connect(&bridge, addr);
    let (accepted, server_in, server_out) = accept(&bridge, server);

    assert_eq!(
        ok(bridge.tcp_remote_address(accepted)),
        ok(bridge.tcp_local_address(client))
    );

    ok(bridge.blocking_write_and_flush(client_out, b"ping"));
    let request = read_exact(&bridge, server_in, 4);
    assert_eq!(request, b"ping".to_vec());

    ok(bridge.blocking_write_and_flush(server_out, &request));
    assert_eq!(read_exact(&bridge, client_in, 4), b"ping".to_vec());

    // Shutting down the send side ends the peer's input
    ok(bridge.tcp_shutdown(client, ShutdownType::Send));
    assert!(err(bridge.blocking_read(server_in, 1)).is_closed());
}

#[test_log::test]
fn test_connect_refused() {
    let (_context, bridge) = start_default();
    // Reserve a port, then free it so nothing listens there
    let addr = {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        reserved.local_addr().unwrap()
    };
    let socket = ok(bridge.create_tcp_socket(IpAddressFamily::Ipv4));
    ok(bridge.tcp_start_connect(socket, addr));
    assert_eq!(
        err(bridge.tcp_finish_connect(socket)).code(),
        Some(ErrorCode::ConnectionRefused)
    );
    // A failed connect is terminal
    assert_eq!(
        err(bridge.tcp_start_connect(socket, addr)).code(),
        Some(ErrorCode::InvalidState)
    );
}

#[test_log::test]
fn test_accepted_socket_inherits_listener_options() {
    let (_context, bridge) = start_default();
    let (server, addr) = listener(&bridge);

    ok(bridge.tcp_set_option(server, SocketOption::KeepAliveEnabled, OptionValue::Flag(true)));
    ok(bridge.tcp_set_option(server, SocketOption::KeepAliveIdleTime, OptionValue::Number(30_000_000_000)));
    ok(bridge.tcp_set_option(server, SocketOption::HopLimit, OptionValue::Number(42)));
    ok(bridge.tcp_set_option(server, SocketOption::ReceiveBufferSize, OptionValue::Number(32 * 1024)));
    ok(bridge.tcp_set_option(server, SocketOption::SendBufferSize, OptionValue::Number(48 * 1024)));

    let _client = connect(&bridge, addr);
    let (accepted, _, _) = accept(&bridge, server);

    let inherited = [
        SocketOption::KeepAliveEnabled,
        SocketOption::KeepAliveIdleTime,
        SocketOption::HopLimit,
        SocketOption::ReceiveBufferSize,
        SocketOption::SendBufferSize,
    ];
    for option in inherited {
        assert_eq!(
            ok(bridge.tcp_get_option(accepted, option)),
            ok(bridge.tcp_get_option(server, option)),
            "{} was not inherited",
            option.name()
        );
    }

    // Later changes on the listener do not reach the accepted socket
    ok(bridge.tcp_set_option(server, SocketOption::HopLimit, OptionValue::Number(7)));
    ok(bridge.tcp_set_option(server, SocketOption::KeepAliveEnabled, OptionValue::Flag(false)));
    assert_eq!(
        ok(bridge.tcp_get_option(accepted, SocketOption::HopLimit)),
        OptionValue::Number(42)
    );
    assert_eq!(
        ok(bridge.tcp_get_option(accepted, SocketOption::KeepAliveEnabled)),
        OptionValue::Flag(true)
    );
}

#[test_log::test]
fn test_address_family_mismatch_is_invalid_argument() {
    let (_context, bridge) = start_default();
    let socket = ok(bridge.create_tcp_socket(IpAddressFamily::Ipv4));
    assert_eq!(ok(bridge.tcp_address_family(socket)), IpAddressFamily::Ipv4);
    assert_eq!(
        err(bridge.tcp_start_bind(socket, "[::1]:0".parse().unwrap())).code(),
        Some(ErrorCode::InvalidArgument)
    );
}

#[test_log::test]
fn test_accepted_socket_reports_listener_default_buffer_sizes() {
    let (_context, bridge) = start_default();
    let (server, addr) = listener(&bridge);
    let _client = connect(&bridge, addr);
    let (accepted, _, _) = accept(&bridge, server);

    for option in [SocketOption::ReceiveBufferSize, SocketOption::SendBufferSize] {
        let from_listener = ok(bridge.tcp_get_option(server, option));
        assert_ne!(from_listener, OptionValue::Number(0));
        assert_eq!(ok(bridge.tcp_get_option(accepted, option)), from_listener);
    }
}

#[test_log::test]
fn test_drop_during_finish_connect_unblocks_caller() {
    let (_context, bridge) = start_default();
    let socket = ok(bridge.create_tcp_socket(IpAddressFamily::Ipv4));
    // Non-routable, so the connect normally stays pending
    ok(bridge.tcp_start_connect(socket, "10.255.255.1:9".parse().unwrap()));

    let connector = bridge.try_clone().unwrap();
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = done_tx.send(connector.tcp_finish_connect(socket));
    });

    std::thread::sleep(std::time::Duration::from_millis(100));
    ok(bridge.drop_tcp_socket(socket));

    let result = done_rx
        .recv_timeout(std::time::Duration::from_secs(5))
        .expect("finish-connect stayed blocked after the socket was dropped");
    // Whatever settled first, the outcome is a semantic one and the bridge stays usable
    assert!(result.is_ok(), "fatal error: {:?}", result.err());
    assert!(!bridge.is_poisoned());
}
