//! Streams and pollables driven through a bridge from plain threads.

mod common;

use std::time::{Duration, Instant};

use common::{err, ok, start_default};
use pretty_assertions::assert_eq;
use stagehand::{ErrorCode, IpAddressFamily, StreamSpec};

#[test_log::test]
fn test_pipe_round_trip() {
    let (_context, bridge) = start_default();
    let (output, input) = ok(bridge.create_pipe(Some(16)));

    assert_eq!(ok(bridge.check_write(output)), 16);
    ok(bridge.write(output, b"hello"));
    assert_eq!(ok(bridge.blocking_read(input, 64)), b"hello".to_vec());

    // Nothing buffered now
    assert_eq!(err(bridge.read(input, 1)).code(), Some(ErrorCode::WouldBlock));

    ok(bridge.drop_output_stream(output));
    assert!(err(bridge.blocking_read(input, 1)).is_closed());
}

#[test_log::test]
fn test_write_beyond_permit_is_invalid_argument() {
    let (_context, bridge) = start_default();
    let (output, _input) = ok(bridge.create_pipe(Some(4)));
    let failure = err(bridge.write(output, b"too long"));
    assert_eq!(failure.code(), Some(ErrorCode::InvalidArgument));
}

#[test_log::test]
fn test_bytes_stream_reads_to_end() {
    let (_context, bridge) = start_default();
    let input = ok(bridge.create_input_stream(StreamSpec::Bytes(b"abcdef".to_vec())));
    assert_eq!(ok(bridge.read(input, 4)), b"abcd".to_vec());
    assert_eq!(ok(bridge.skip(input, 10)), 2);
    assert!(err(bridge.read(input, 1)).is_closed());
}

#[test_log::test]
fn test_dropping_stream_wakes_blocked_reader_with_closed() {
    let (_context, bridge) = start_default();
    let (_output, input) = ok(bridge.create_pipe(None));

    let reader = bridge.try_clone().unwrap();
    let blocked = std::thread::spawn(move || reader.blocking_read(input, 8));

    std::thread::sleep(Duration::from_millis(100));
    ok(bridge.drop_input_stream(input));

    let result = blocked.join().unwrap();
    assert!(err(result).is_closed());
}

#[test_log::test]
fn test_blocking_flush_waits_for_reader() {
    let (_context, bridge) = start_default();
    let (output, input) = ok(bridge.create_pipe(Some(8)));

    let reader = bridge.try_clone().unwrap();
    let drain = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        let mut received = Vec::new();
        while received.len() < 20 {
            received.extend(ok(reader.blocking_read(input, 64)));
        }
        received
    });

    ok(bridge.blocking_write_and_flush(output, &[7u8; 20]));
    assert_eq!(drain.join().unwrap(), vec![7u8; 20]);
}

#[test_log::test]
fn test_poll_list_returns_only_ready_indices() {
    let (_context, bridge) = start_default();
    let expired = ok(bridge.subscribe_instant(0));
    let never = ok(bridge.create_pollable(false));

    assert_eq!(ok(bridge.poll_list(&[expired, never])), vec![0]);
    assert_eq!(ok(bridge.poll_list(&[never, expired])), vec![1]);
    assert!(!ok(bridge.pollable_ready(never)));
}

#[test_log::test]
fn test_poll_list_waits_for_deadline() {
    let (_context, bridge) = start_default();
    let timer = ok(bridge.subscribe_duration(50_000_000));
    let never = ok(bridge.create_pollable(false));

    let started = Instant::now();
    assert_eq!(ok(bridge.poll_list(&[never, timer])), vec![1]);
    assert!(started.elapsed() >= Duration::from_millis(45));
    assert!(ok(bridge.pollable_ready(timer)));
}

#[test_log::test]
fn test_empty_poll_list_is_invalid_argument() {
    let (_context, bridge) = start_default();
    assert_eq!(
        err(bridge.poll_list(&[])).code(),
        Some(ErrorCode::InvalidArgument)
    );
}

#[test_log::test]
fn test_readiness_follows_pipe_contents() {
    let (_context, bridge) = start_default();
    let (output, input) = ok(bridge.create_pipe(None));
    let readable = ok(bridge.input_stream_subscribe(input));

    assert!(!ok(bridge.pollable_ready(readable)));
    ok(bridge.write(output, b"x"));
    ok(bridge.pollable_block(readable));
    assert!(ok(bridge.pollable_ready(readable)));
}

#[test_log::test]
fn test_clock_is_monotonic() {
    let (_context, bridge) = start_default();
    let first = ok(bridge.clock_now());
    std::thread::sleep(Duration::from_millis(5));
    let second = ok(bridge.clock_now());
    assert!(second > first);
    assert!(ok(bridge.clock_resolution()) > 0);
}

#[test_log::test]
fn test_write_zeroes_beyond_permit_is_invalid_argument() {
    let (_context, bridge) = start_default();
    let (output, input) = ok(bridge.create_pipe(Some(16)));

    assert_eq!(
        err(bridge.write_zeroes(output, u64::MAX)).code(),
        Some(ErrorCode::InvalidArgument)
    );
    assert!(!bridge.is_poisoned());

    ok(bridge.write_zeroes(output, 5));
    assert_eq!(ok(bridge.blocking_read(input, 64)), vec![0u8; 5]);
}

#[test_log::test]
fn test_blocking_write_zeroes_waits_for_reader() {
    let (_context, bridge) = start_default();
    let (output, input) = ok(bridge.create_pipe(Some(8)));

    let reader = bridge.try_clone().unwrap();
    let drain = std::thread::spawn(move || {
        let mut received = Vec::new();
        while received.len() < 20 {
            received.extend(ok(reader.blocking_read(input, 64)));
        }
        received
    });

    ok(bridge.blocking_write_zeroes_and_flush(output, 20));
    assert_eq!(drain.join().unwrap(), vec![0u8; 20]);
}

#[test_log::test]
fn test_blocking_skip() {
    let (_context, bridge) = start_default();
    let input = ok(bridge.create_input_stream(StreamSpec::Bytes(b"abcdef".to_vec())));
    assert_eq!(ok(bridge.blocking_skip(input, 4)), 4);
    assert_eq!(ok(bridge.read(input, 8)), b"ef".to_vec());

    // Waits on an empty pipe until the writer delivers
    let (output, input) = ok(bridge.create_pipe(None));
    let writer = bridge.try_clone().unwrap();
    let feed = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        ok(writer.write(output, b"xyz"));
    });
    assert_eq!(ok(bridge.blocking_skip(input, 2)), 2);
    feed.join().unwrap();
    assert_eq!(ok(bridge.read(input, 8)), b"z".to_vec());
}

#[test_log::test]
fn test_splice_reports_reset_connection_as_last_operation_failed() {
    let (_context, bridge) = start_default();
    let server = ok(bridge.create_tcp_socket(IpAddressFamily::Ipv4));
    ok(bridge.tcp_start_bind(server, "127.0.0.1:0".parse().unwrap()));
    ok(bridge.tcp_finish_bind(server));
    ok(bridge.tcp_start_listen(server));
    ok(bridge.tcp_finish_listen(server));
    let addr = ok(bridge.tcp_local_address(server));

    let client = std::net::TcpStream::connect(addr).unwrap();
    let pending = ok(bridge.tcp_subscribe(server));
    ok(bridge.pollable_block(pending));
    let (_accepted, server_in, _server_out) = ok(bridge.tcp_accept(server));

    // A zero linger turns close into a reset
    socket2::SockRef::from(&client)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(client);

    let readable = ok(bridge.input_stream_subscribe(server_in));
    ok(bridge.pollable_block(readable));

    let (sink, _sink_in) = ok(bridge.create_pipe(None));
    let failure = err(bridge.splice(sink, server_in, 16));
    assert_eq!(failure.kind(), "last-operation-failed");
    assert!(failure.detail().unwrap().starts_with("connection-reset"));
    assert!(err(bridge.read(server_in, 1)).is_closed());
}
