//! End-to-end scenarios over real loopback sockets (§8).
//!
//! `NetworkSystem` is intentionally not `Send` (its event pool is an
//! `Rc<RefCell<_>>`, per §5's single-threaded-cooperative model), so unlike
//! the teacher's multi-threaded `TcpConnector` tests, both ends of each
//! scenario here are ticked from one test thread in a single loop —
//! `process_queue` on each side in turn until the expected outcome shows up
//! or a deadline trips. The user callback only ever mutates its `Ctx`
//! accumulator (it can't reborrow the `NetworkSystem` that is already
//! borrowed to call it); any reply is sent from the driving loop right
//! after `process_queue` returns.

use std::io::Write as _;
use std::time::{Duration, Instant};

use netcore::config::Security;
use netcore::system::NetworkSystem;
use netcore::tags::str_to_tag;
use netcore::Config;

const TICK: Duration = Duration::from_millis(3);

fn wait_connected<A, B>(
    server: &mut NetworkSystem<A>,
    server_ctx: &mut A,
    client: &mut NetworkSystem<B>,
    client_ctx: &mut B,
    client_sock: usize,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        server.process_queue(server_ctx);
        client.process_queue(client_ctx);
        if client.is_connected(client_sock) {
            return;
        }
        std::thread::sleep(TICK);
    }
    panic!("client never reached connected state");
}

#[test]
fn word_service_client_request_gets_matching_reply() {
    #[derive(Default)]
    struct ServerCtx {
        pending: Vec<(i32, i32)>, // (src_sock, requested number)
    }
    #[derive(Default)]
    struct ClientCtx {
        replies: Vec<String>,
    }

    let mut server = NetworkSystem::<ServerCtx>::initialize(Config::default()).unwrap();
    let server_sock = server.start_server(0, Some(Security::PLAIN)).unwrap();
    let port = server.sock_src_addr(server_sock).unwrap().port();
    server.set_user_callback(|e, ctx: &mut ServerCtx| {
        if e.name() == str_to_tag("cRqs") {
            e.start_read();
            let _srv_sock = e.get_i32().unwrap();
            let _seq = e.get_i32().unwrap();
            let num = e.get_i32().unwrap();
            ctx.pending.push((e.src_sock(), num));
        }
        1
    });

    let mut client = NetworkSystem::<ClientCtx>::initialize(Config::default()).unwrap();
    let client_sock = client.connect_to_server("127.0.0.1", port, Some(Security::PLAIN)).unwrap();
    client.set_user_callback(|e, ctx: &mut ClientCtx| {
        if e.name() == str_to_tag("sRst") {
            e.start_read();
            ctx.replies.push(e.get_str().unwrap());
        }
        1
    });

    let mut server_ctx = ServerCtx::default();
    let mut client_ctx = ClientCtx::default();
    wait_connected(&mut server, &mut server_ctx, &mut client, &mut client_ctx, client_sock);

    let mut req = client.new_event(str_to_tag("app "), str_to_tag("cRqs"));
    req.attach_i32(server_sock as i32);
    req.attach_i32(0);
    req.attach_i32(42);
    assert!(client.send(&req, client_sock));

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && client_ctx.replies.is_empty() {
        server.process_queue(&mut server_ctx);
        for (src_sock, num) in server_ctx.pending.drain(..) {
            let word = word_for(num);
            let mut reply = server.new_event(str_to_tag("app "), str_to_tag("sRst"));
            reply.attach_str(&format!("========== {word} =========="));
            assert!(server.send(&reply, src_sock as usize));
        }
        client.process_queue(&mut client_ctx);
        std::thread::sleep(TICK);
    }

    assert_eq!(client_ctx.replies, vec!["========== forty two ==========".to_string()]);
}

fn word_for(num: i32) -> &'static str {
    match num {
        42 => "forty two",
        _ => "unknown",
    }
}

#[test]
fn bulk_transfer_100_events_match_reference_payload() {
    const COUNT: usize = 100;
    const LEN: usize = 1200;

    fn reference_payload() -> Vec<u8> {
        let mut buf = vec![b'-'; LEN];
        for (i, b) in buf.iter_mut().enumerate().skip(8).take(40) {
            *b = b'A' + ((i - 8) % 26) as u8;
        }
        buf[48] = b'\n';
        buf[LEN - 1] = b'*';
        buf
    }

    #[derive(Default)]
    struct ServerCtx {
        received: Vec<Vec<u8>>,
    }

    let mut server = NetworkSystem::<ServerCtx>::initialize(Config::default()).unwrap();
    let server_sock = server.start_server(0, Some(Security::PLAIN)).unwrap();
    let port = server.sock_src_addr(server_sock).unwrap().port();
    server.set_user_callback(|e, ctx: &mut ServerCtx| {
        if e.name() == str_to_tag("cRqs") {
            e.start_read();
            ctx.received.push(e.get_buf().unwrap());
        }
        1
    });

    let mut client = NetworkSystem::<()>::initialize(Config::default()).unwrap();
    let client_sock = client.connect_to_server("127.0.0.1", port, Some(Security::PLAIN)).unwrap();

    let mut server_ctx = ServerCtx::default();
    let mut client_ctx = ();
    wait_connected(&mut server, &mut server_ctx, &mut client, &mut client_ctx, client_sock);

    let reference = reference_payload();
    for _ in 0..COUNT {
        let mut e = client.new_event(str_to_tag("app "), str_to_tag("cRqs"));
        e.attach_buf(&reference);
        assert!(client.send(&e, client_sock));
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline && server_ctx.received.len() < COUNT {
        server.process_queue(&mut server_ctx);
        client.process_queue(&mut client_ctx);
        std::thread::sleep(TICK);
    }

    assert_eq!(server_ctx.received.len(), COUNT, "not all bulk events arrived before timeout");
    assert!(server_ctx.received.iter().all(|p| p == &reference));
}

#[test]
fn framing_stress_injected_events_decode_with_matching_lengths() {
    #[derive(Default)]
    struct ServerCtx {
        decoded_lens: Vec<u32>,
    }

    let mut server = NetworkSystem::<ServerCtx>::initialize(Config::default()).unwrap();
    let server_sock = server.start_server(0, Some(Security::PLAIN)).unwrap();

    // A real connected peer is needed only so the accepted socket exists for
    // the injected-buffer hook to target; no bytes actually cross the wire.
    let port = server.sock_src_addr(server_sock).unwrap().port();
    let mut client = NetworkSystem::<()>::initialize(Config::default()).unwrap();
    let client_sock = client.connect_to_server("127.0.0.1", port, Some(Security::PLAIN)).unwrap();

    let mut server_ctx = ServerCtx::default();
    let mut client_ctx = ();
    wait_connected(&mut server, &mut server_ctx, &mut client, &mut client_ctx, client_sock);

    let accepted_sock = server_sock + 1;
    let pool = server.pool().clone();
    let window = 64usize;
    let mut all_bytes = Vec::new();
    let mut expected_lens = Vec::new();
    for i in 0..20 {
        let payload_len = (window - 4) + i * 8;
        let mut e = netcore::Event::with_capacity(&pool, str_to_tag("app "), str_to_tag("cTst"), payload_len);
        let mut payload = vec![0u8; payload_len];
        let tail = format!("len={payload_len}");
        let tail_bytes = tail.as_bytes();
        payload[payload_len - tail_bytes.len()..].copy_from_slice(tail_bytes);
        e.attach_buf(&payload);
        all_bytes.extend_from_slice(&e.serialize());
        expected_lens.push(e.data_len());
    }

    server.set_user_callback(|e, ctx: &mut ServerCtx| {
        if e.name() == str_to_tag("cTst") {
            ctx.decoded_lens.push(e.data_len());
        }
        1
    });

    for chunk in all_bytes.chunks(window) {
        server.inject_bytes(accepted_sock, chunk).unwrap();
    }
    server.process_queue(&mut server_ctx);

    assert_eq!(server_ctx.decoded_lens, expected_lens);
}

#[test]
fn handshake_failure_exhausts_reconnect_budget_then_stops() {
    #[derive(Default)]
    struct ClientCtx {
        nerr_count: usize,
    }

    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = probe.local_addr().unwrap().port();
    drop(probe); // nothing listens here; every connect attempt is refused

    let mut cfg = Config::default();
    cfg.reconnect_limit = 2;
    cfg.reconnect_interval = netcore_timing::Nanos::from_millis(20);

    let mut client = NetworkSystem::<ClientCtx>::initialize(cfg).unwrap();
    client.set_user_callback(|e, ctx: &mut ClientCtx| {
        if e.name() == str_to_tag("nerr") {
            ctx.nerr_count += 1;
        }
        1
    });
    let sock = client.connect_to_server("127.0.0.1", dead_port, Some(Security::PLAIN)).unwrap();

    let mut ctx = ClientCtx::default();
    let mut last_count = 0usize;
    let mut last_growth = Instant::now();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        client.process_queue(&mut ctx);
        if ctx.nerr_count != last_count {
            last_count = ctx.nerr_count;
            last_growth = Instant::now();
        } else if ctx.nerr_count > 0 && last_growth.elapsed() > Duration::from_millis(300) {
            break;
        }
        std::thread::sleep(TICK);
    }

    assert!(ctx.nerr_count > 0, "expected at least one nerr event from the failed connect");
    assert!(!client.is_connected(sock));
    assert!(!client.socket_exists(sock), "socket should be reclaimed once the reconnect budget is exhausted");
}

/// Installs a `tracing` subscriber once per test binary so handshake
/// diagnostics from `net::tls`/`net::handshake` show up under `cargo test --
/// --nocapture` (`RUST_LOG=netcore=trace`), mirroring the other example
/// repos' test init pattern rather than leaving TLS failures silent.
fn init_test_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Mints a self-signed `localhost` certificate and writes the cert and key
/// PEMs to temp files suitable for [`netcore::config::TlsPaths`].
fn mint_self_signed_cert() -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(certified.cert.pem().as_bytes()).unwrap();
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file.write_all(certified.key_pair.serialize_pem().as_bytes()).unwrap();
    (cert_file, key_file)
}

#[test]
fn tls_both_modes_round_trip() {
    init_test_tracing();
    let (cert_file, key_file) = mint_self_signed_cert();

    #[derive(Default)]
    struct ServerCtx {
        pending: Vec<(i32, i32)>,
    }
    #[derive(Default)]
    struct ClientCtx {
        replies: Vec<String>,
    }

    let mut server_cfg = Config::default();
    server_cfg.security_level = Security::PLAIN | Security::TLS;
    server_cfg.tls.public_key = Some(cert_file.path().to_path_buf());
    server_cfg.tls.private_key = Some(key_file.path().to_path_buf());
    let mut server = NetworkSystem::<ServerCtx>::initialize(server_cfg).unwrap();
    let server_sock = server.start_server(0, None).unwrap();
    let port = server.sock_src_addr(server_sock).unwrap().port();
    server.set_user_callback(|e, ctx: &mut ServerCtx| {
        if e.name() == str_to_tag("cRqs") {
            e.start_read();
            let _srv_sock = e.get_i32().unwrap();
            let _seq = e.get_i32().unwrap();
            let num = e.get_i32().unwrap();
            ctx.pending.push((e.src_sock(), num));
        }
        1
    });

    let mut client_cfg = Config::default();
    client_cfg.security_level = Security::PLAIN | Security::TLS;
    client_cfg.tls.cert_file = Some(cert_file.path().to_path_buf());
    let mut client = NetworkSystem::<ClientCtx>::initialize(client_cfg).unwrap();
    let client_sock = client.connect_to_server("localhost", port, None).unwrap();
    client.set_user_callback(|e, ctx: &mut ClientCtx| {
        if e.name() == str_to_tag("sRst") {
            e.start_read();
            ctx.replies.push(e.get_str().unwrap());
        }
        1
    });

    let mut server_ctx = ServerCtx::default();
    let mut client_ctx = ClientCtx::default();
    wait_connected(&mut server, &mut server_ctx, &mut client, &mut client_ctx, client_sock);

    let mut req = client.new_event(str_to_tag("app "), str_to_tag("cRqs"));
    req.attach_i32(server_sock as i32);
    req.attach_i32(0);
    req.attach_i32(42);
    assert!(client.send(&req, client_sock));

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && client_ctx.replies.is_empty() {
        server.process_queue(&mut server_ctx);
        for (src_sock, num) in server_ctx.pending.drain(..) {
            let word = word_for(num);
            let mut reply = server.new_event(str_to_tag("app "), str_to_tag("sRst"));
            reply.attach_str(&format!("========== {word} =========="));
            assert!(server.send(&reply, src_sock as usize));
        }
        client.process_queue(&mut client_ctx);
        std::thread::sleep(TICK);
    }

    assert_eq!(client_ctx.replies, vec!["========== forty two ==========".to_string()]);
}

#[test]
fn tls_only_handshake_failure_with_untrusted_server_terminates() {
    init_test_tracing();
    let (cert_file, key_file) = mint_self_signed_cert();

    let mut server_cfg = Config::default();
    server_cfg.security_level = Security::TLS;
    server_cfg.tls.public_key = Some(cert_file.path().to_path_buf());
    server_cfg.tls.private_key = Some(key_file.path().to_path_buf());
    let mut server = NetworkSystem::<()>::initialize(server_cfg).unwrap();
    let server_sock = server.start_server(0, None).unwrap();
    let port = server.sock_src_addr(server_sock).unwrap().port();

    #[derive(Default)]
    struct ClientCtx {
        nerr_count: usize,
    }

    let mut client_cfg = Config::default();
    client_cfg.security_level = Security::TLS;
    client_cfg.reconnect_limit = 2;
    client_cfg.reconnect_interval = netcore_timing::Nanos::from_millis(20);
    // No `tls.cert_file` override: the client falls back to the
    // webpki-roots trust set, which does not trust this test's self-signed
    // certificate, so every handshake attempt fails verification — this is
    // spec.md §8 scenario 4 ("security=tls-only but no server public key
    // path").
    let mut client = NetworkSystem::<ClientCtx>::initialize(client_cfg).unwrap();
    client.set_user_callback(|e, ctx: &mut ClientCtx| {
        if e.name() == str_to_tag("nerr") {
            ctx.nerr_count += 1;
        }
        1
    });
    let sock = client.connect_to_server("localhost", port, None).unwrap();

    let mut ctx = ClientCtx::default();
    let mut server_ctx = ();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && client.socket_exists(sock) {
        server.process_queue(&mut server_ctx);
        client.process_queue(&mut ctx);
        std::thread::sleep(TICK);
    }

    assert!(ctx.nerr_count > 0, "expected at least one nerr event from the failed TLS handshake");
    assert!(!client.is_connected(sock));
    assert!(!client.socket_exists(sock), "socket should be reclaimed once the reconnect budget is exhausted");
}

#[test]
fn graceful_close_delivers_sfin_without_reconnect() {
    #[derive(Default)]
    struct ClientCtx {
        saw_sfin: bool,
    }

    let mut server = NetworkSystem::<()>::initialize(Config::default()).unwrap();
    let server_sock = server.start_server(0, Some(Security::PLAIN)).unwrap();
    let port = server.sock_src_addr(server_sock).unwrap().port();

    let mut client = NetworkSystem::<ClientCtx>::initialize(Config::default()).unwrap();
    client.set_user_callback(|e, ctx: &mut ClientCtx| {
        if e.name() == str_to_tag("sFIN") {
            ctx.saw_sfin = true;
        }
        1
    });
    let client_sock = client.connect_to_server("127.0.0.1", port, Some(Security::PLAIN)).unwrap();

    let mut server_ctx = ();
    let mut client_ctx = ClientCtx::default();
    wait_connected(&mut server, &mut server_ctx, &mut client, &mut client_ctx, client_sock);

    // The accepted per-client slot on the server is the next table index
    // after the listener.
    let accepted_sock = server_sock + 1;
    server.close_connection(accepted_sock);

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !client_ctx.saw_sfin {
        server.process_queue(&mut server_ctx);
        client.process_queue(&mut client_ctx);
        std::thread::sleep(TICK);
    }

    assert!(client_ctx.saw_sfin, "client never observed sFIN after server-initiated close");
    assert!(!client.is_connected(client_sock));

    // No reconnect attempt should follow a peer-initiated close: give it a
    // few more ticks and confirm the socket never returns to connected.
    for _ in 0..50 {
        client.process_queue(&mut client_ctx);
        std::thread::sleep(TICK);
    }
    assert!(!client.is_connected(client_sock));
}

#[test]
fn large_event_256kib_reassembles_correctly() {
    const SIZE: usize = 256 * 1024;

    #[derive(Default)]
    struct ServerCtx {
        received: Option<Vec<u8>>,
    }

    let mut server = NetworkSystem::<ServerCtx>::initialize(Config::default()).unwrap();
    let server_sock = server.start_server(0, Some(Security::PLAIN)).unwrap();
    let port = server.sock_src_addr(server_sock).unwrap().port();
    server.set_user_callback(|e, ctx: &mut ServerCtx| {
        if e.name() == str_to_tag("cRqs") {
            e.start_read();
            ctx.received = Some(e.get_buf().unwrap());
        }
        1
    });

    let mut client = NetworkSystem::<()>::initialize(Config::default()).unwrap();
    let client_sock = client.connect_to_server("127.0.0.1", port, Some(Security::PLAIN)).unwrap();

    let mut server_ctx = ServerCtx::default();
    let mut client_ctx = ();
    wait_connected(&mut server, &mut server_ctx, &mut client, &mut client_ctx, client_sock);

    // Force a transport window well under the 256 KiB payload, so the
    // event can only arrive split across many reads (spec.md §8 scenario
    // 6: "256 KiB payload... sent over a 1,500-byte transport").
    let accepted_sock = server_sock + 1;
    server.set_socket_buffer_size(accepted_sock, 1500);
    client.set_socket_buffer_size(client_sock, 1500);

    let payload: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
    let mut e = client.new_event(str_to_tag("app "), str_to_tag("cRqs"));
    e.attach_buf(&payload);
    assert!(client.send(&e, client_sock));

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline && server_ctx.received.is_none() {
        server.process_queue(&mut server_ctx);
        client.process_queue(&mut client_ctx);
        std::thread::sleep(TICK);
    }

    assert_eq!(server_ctx.received, Some(payload));
}
