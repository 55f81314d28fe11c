//! End-to-end scenarios driven over real TCP/UDP sockets against a live
//! `Server`, exercising the tick loop the way a client actually would:
//! connect, trade bytes, observe state. Unit tests inside each module cover
//! the pure pieces (codec framing, `dispatch` transitions); these cover the
//! wiring between them.
//!
//! Each test runs the server's own `run` loop on a scoped background thread
//! and drives it with plain blocking sockets from the main thread — the
//! server has no awareness it's under test.

use flux::logging;
use runtime_core::codec::{self, packet_type, CborValue, Envelope, Value};
use runtime_core::{Config, Server};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn test_logger() -> logging::Logger {
    logging::Logger::root(logging::Discard, logging::o!())
}

fn test_config(dir: &Path) -> Config {
    Config {
        bootstrap_enable: false,
        network_delay_test_enable: false,
        md5_enforce: false,
        userdb_enable: true,
        autoregister_enable: true,
        rsa_decrypt_enable: false,
        strip_password_prefix_32: true,
        legacy_echo_enable: true,

        tcp_port: 0,
        udp_port: 0,
        tick_sleep_ms: 2,
        busy_sleep_ms: 0,
        max_packet_bytes: 65536,
        max_accept_per_tick: 16,
        server_capacity: 1000,
        signup_timeout_ms: 60_000,
        registry_refresh_ms: 60_000,
        max_players_per_device: 50,

        registry_file: dir.join("extensions.json"),
        user_file: dir.join("users.txt"),
        uuid_binding_file: dir.join("device_bindings.txt"),
        whitelist_file: None,
        ban_words_file: None,
        ban_ip_file: None,
        temp_ban_ip_file: None,
        ban_uuid_file: None,
        rsa_public_key_path: None,
        rsa_private_key_path: None,
        core_entry_search_path: None,

        motd: "Welcome".to_string(),
        default_avatar: "liubei".to_string(),
        expected_md5: "".to_string(),
    }
}

/// Spawns the server's tick loop on a scoped background thread and hands the
/// test closure a ready-to-dial TCP and UDP address plus a handle it can
/// `Drop`/ignore — the loop stops automatically when `scope` returns because
/// `running` is cleared first.
fn with_running_server(test: impl FnOnce(SocketAddr, SocketAddr)) {
    let dir = tempfile::tempdir().unwrap();
    let log = test_logger();
    let mut server = Server::new(test_config(dir.path()), &log).unwrap();
    let tcp_addr = server.local_tcp_addr().unwrap();
    let udp_addr = server.local_udp_addr().unwrap();
    let running = AtomicBool::new(true);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            server.run(&running, &log).expect("server loop failed");
        });

        test(tcp_addr, udp_addr);

        running.store(false, Ordering::Relaxed);
    });
}

/// Strips the leading `extension_sync` JSON line every freshly accepted
/// connection receives before any CBOR envelope.
fn drain_broadcast_line(stream: &mut TcpStream) {
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).expect("broadcast line never arrived");
        if byte[0] == b'\n' {
            break;
        }
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).expect("connect failed");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    drain_broadcast_line(&mut stream);
    stream
}

fn setup_envelope(name: &str, password: &str, version: &str, uuid: &str) -> Envelope {
    let array = CborValue::Array(vec![
        CborValue::text(name),
        CborValue::text(password),
        CborValue::text(""),
        CborValue::text(version),
        CborValue::text(uuid),
    ]);
    Envelope::notification(
        packet_type::NOTIFICATION | packet_type::SRC_CLIENT | packet_type::DEST_SERVER,
        "Setup",
        Value::bytes(codec::encode_value(&array)),
    )
}

fn request_envelope(command: &str) -> Envelope {
    Envelope {
        request_id: 1,
        packet_type: packet_type::REQUEST | packet_type::SRC_CLIENT | packet_type::DEST_SERVER,
        command: Value::text(command),
        payload: Value::text(""),
        timeout: None,
        timestamp: None,
    }
}

fn send(stream: &mut TcpStream, envelope: &Envelope) {
    stream.write_all(&codec::encode(envelope)).unwrap();
}

/// Reads bytes until a full envelope can be decoded off the front of the
/// accumulated buffer, or the stream's read timeout elapses.
fn recv_envelope(stream: &mut TcpStream) -> Envelope {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Ok((envelope, _consumed)) = codec::decode_one(&buf) {
            return envelope;
        }
        let n = stream.read(&mut chunk).expect("expected more bytes but the connection produced none");
        assert!(n > 0, "connection closed before a full envelope arrived");
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn assert_connection_closed(stream: &mut TcpStream) {
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut trailing = [0u8; 16];
    let n = stream.read(&mut trailing).unwrap_or(0);
    assert_eq!(n, 0, "expected the server to have closed the connection");
}

#[test]
fn setup_then_ping_round_trips_pong() {
    with_running_server(|tcp_addr, _udp_addr| {
        let mut client = connect(tcp_addr);
        send(&mut client, &setup_envelope("alice", "hunter2", "0.5.19", "uuid-alice"));

        let setup_reply = recv_envelope(&mut client);
        assert_eq!(setup_reply.command_str(), Some("Setup"));

        send(&mut client, &request_envelope("ping"));
        let pong = recv_envelope(&mut client);
        assert!(pong.is_reply());
        assert_eq!(pong.payload_str(), Some("PONG"));
    });
}

#[test]
fn bye_request_closes_the_connection() {
    with_running_server(|tcp_addr, _udp_addr| {
        let mut client = connect(tcp_addr);
        send(&mut client, &setup_envelope("bob", "hunter2", "0.5.19", "uuid-bob"));
        let _ = recv_envelope(&mut client);

        send(&mut client, &request_envelope("bye"));
        let goodbye = recv_envelope(&mut client);
        assert_eq!(goodbye.payload_str(), Some("Goodbye"));

        assert_connection_closed(&mut client);
    });
}

#[test]
fn unsupported_client_version_is_rejected() {
    with_running_server(|tcp_addr, _udp_addr| {
        let mut client = connect(tcp_addr);
        send(&mut client, &setup_envelope("carol", "hunter2", "0.1.0", "uuid-carol"));

        let rejection = recv_envelope(&mut client);
        assert_eq!(rejection.command_str(), Some("ErrorDlg"));

        assert_connection_closed(&mut client);
    });
}

#[test]
fn second_login_with_same_account_kicks_the_first() {
    with_running_server(|tcp_addr, _udp_addr| {
        let mut first = connect(tcp_addr);
        send(&mut first, &setup_envelope("dave", "hunter2", "0.5.19", "uuid-dave-1"));
        let _ = recv_envelope(&mut first);

        let mut second = connect(tcp_addr);
        send(&mut second, &setup_envelope("dave", "hunter2", "0.5.19", "uuid-dave-2"));
        let _ = recv_envelope(&mut second);

        // the first connection receives a kick notice, then the server closes it.
        let kick = recv_envelope(&mut first);
        assert_eq!(kick.command_str(), Some("ErrorDlg"));
        assert_eq!(kick.payload_str(), Some("others logged in again with this name"));
        assert_connection_closed(&mut first);

        // the second connection is unaffected and still answers pings.
        send(&mut second, &request_envelope("ping"));
        let pong = recv_envelope(&mut second);
        assert_eq!(pong.payload_str(), Some("PONG"));
    });
}

#[test]
fn udp_detail_probe_reports_live_capacity_and_online_count() {
    with_running_server(|tcp_addr, udp_addr| {
        let mut client = connect(tcp_addr);
        send(&mut client, &setup_envelope("erin", "hunter2", "0.5.19", "uuid-erin"));
        let _ = recv_envelope(&mut client);

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        socket.send_to(b"fkGetDetail,myserver", udp_addr).unwrap();

        let mut reply = [0u8; 512];
        let len = socket.recv(&mut reply).expect("no udp reply arrived");
        let text = std::str::from_utf8(&reply[..len]).unwrap();
        assert!(text.starts_with(r#"["0.5.19+","","",1000,1,"myserver"]"#));
    });
}
