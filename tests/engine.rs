use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use mill_conn::{
    handler, Connection, ConnectionConfig, Engine, EngineConfig, Error, ExecutionMode, HandlerChain,
    HandlerPrototype, HandlerSet,
};
use parking_lot::Mutex;

fn listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Connects a client to `listener` and returns both ends, the server end
/// still unadmitted.
fn accept_pair(listener: &TcpListener, addr: SocketAddr) -> (TcpStream, TcpStream) {
    let client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    let (server, _) = listener.accept().unwrap();
    (server, client)
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached in time");
}

fn read_line(client: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        client.read_exact(&mut byte).unwrap();
        if byte[0] == b'\n' {
            return String::from_utf8(line).unwrap();
        }
        line.push(byte[0]);
    }
}

fn assert_eof(client: &mut TcpStream) {
    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).unwrap(), 0, "expected the engine to close the socket");
}

fn line_echo(mode: ExecutionMode) -> HandlerSet {
    HandlerSet::builder()
        .mode(mode)
        .on_data(handler::from_fn(|conn: &Connection| {
            let line = conn.read_bytes_by_delimiter(b"\n")?;
            conn.write(&line)?;
            conn.write(b"\n")?;
            Ok(true)
        }))
        .build()
}

fn timeout_config(idle: Duration) -> EngineConfig {
    EngineConfig::builder()
        .dispatchers(1)
        .timeout_check_period(Duration::from_millis(20))
        .connection(ConnectionConfig::builder().idle_timeout(idle).build())
        .build()
}

#[test]
fn test_connections_are_assigned_round_robin() {
    let engine = Engine::new(EngineConfig::builder().dispatchers(2).build(), HandlerSet::default()).unwrap();
    let (listener, addr) = listener();

    let mut clients = Vec::new();
    let mut indexes = Vec::new();
    for _ in 0..4 {
        let (server, client) = accept_pair(&listener, addr);
        indexes.push(engine.admit(server).unwrap().dispatcher_index());
        clients.push(client);
    }

    assert_eq!(indexes, vec![0, 1, 0, 1]);
    wait_until(|| engine.open_connections() == 4);
    assert_eq!(engine.dispatcher_count(), 2);
}

#[test]
fn test_echo_inline_and_threaded() {
    for mode in [ExecutionMode::Inline, ExecutionMode::Threaded] {
        let engine = Engine::new(EngineConfig::default(), line_echo(mode)).unwrap();
        let (listener, addr) = listener();
        let (server, mut client) = accept_pair(&listener, addr);
        engine.admit(server).unwrap();

        client.write_all(b"first\nsec").unwrap();
        assert_eq!(read_line(&mut client), "first");
        client.write_all(b"ond\n").unwrap();
        assert_eq!(read_line(&mut client), "second");
    }
}

#[test]
fn test_callbacks_never_overlap() {
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (a, m, s) = (active.clone(), max_active.clone(), seen.clone());
    let handlers = HandlerSet::builder()
        .on_data(handler::from_fn(move |conn: &Connection| {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            m.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            let result = conn.read_string_by_delimiter("\n");
            a.fetch_sub(1, Ordering::SeqCst);
            s.lock().push(result?);
            Ok(true)
        }))
        .build();

    let engine = Engine::new(EngineConfig::builder().workers(4).build(), handlers).unwrap();
    let (listener, addr) = listener();
    let (server, mut client) = accept_pair(&listener, addr);
    engine.admit(server).unwrap();

    let expected: Vec<String> = (0..20).map(|i| format!("msg-{i}")).collect();
    for line in &expected {
        client.write_all(format!("{line}\n").as_bytes()).unwrap();
        thread::sleep(Duration::from_millis(1));
    }

    wait_until(|| seen.lock().len() == expected.len());
    assert_eq!(*seen.lock(), expected);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failing_data_handler_closes_connection() {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = disconnects.clone();
    let handlers = HandlerSet::builder()
        .on_data(handler::from_fn(|_conn: &Connection| Err(Error::handler("rejected"))))
        .on_disconnect(handler::from_fn(move |_conn: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }))
        .build();

    let engine = Engine::new(EngineConfig::default(), handlers).unwrap();
    let (listener, addr) = listener();
    let (server, mut client) = accept_pair(&listener, addr);
    let conn = engine.admit(server).unwrap();

    client.write_all(b"anything").unwrap();
    assert_eof(&mut client);
    wait_until(|| disconnects.load(Ordering::SeqCst) == 1);
    assert!(!conn.is_open());
}

#[test]
fn test_connect_handler_greets_peer() {
    let handlers = HandlerSet::builder()
        .on_connect(handler::from_fn(|conn: &Connection| {
            conn.write(b"welcome\n")?;
            Ok(true)
        }))
        .build();

    let engine = Engine::new(EngineConfig::default(), handlers).unwrap();
    let (listener, addr) = listener();
    let (server, mut client) = accept_pair(&listener, addr);
    let conn = engine.admit(server).unwrap();

    assert_eq!(read_line(&mut client), "welcome");
    assert!(conn.is_open());
}

#[test]
fn test_failing_connect_handler_closes_connection() {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = disconnects.clone();
    let handlers = HandlerSet::builder()
        .on_connect(handler::from_fn(|_conn: &Connection| Err(Error::handler("not accepting"))))
        .on_disconnect(handler::from_fn(move |_conn: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }))
        .build();

    let engine = Engine::new(EngineConfig::default(), handlers).unwrap();
    let (listener, addr) = listener();
    let (server, mut client) = accept_pair(&listener, addr);
    let conn = engine.admit(server).unwrap();

    assert_eof(&mut client);
    wait_until(|| disconnects.load(Ordering::SeqCst) == 1);
    assert!(!conn.is_open());
    wait_until(|| engine.open_connections() == 0);
}

#[test]
fn test_panicking_timeout_handler_does_not_stop_scan() {
    let panicking = HandlerPrototype::shared(
        HandlerSet::builder()
            .mode(ExecutionMode::Inline)
            .on_idle_timeout(handler::from_fn(|_conn: &Connection| -> mill_conn::Result<bool> {
                panic!("timeout handler bug")
            }))
            .build(),
    );
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let vetoing = HandlerPrototype::shared(
        HandlerSet::builder()
            .mode(ExecutionMode::Inline)
            .on_idle_timeout(handler::from_fn(move |_conn: &Connection| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }))
            .build(),
    );

    let engine = Engine::new(timeout_config(Duration::from_millis(100)), HandlerSet::default()).unwrap();
    let (listener, addr) = listener();
    let (first, mut c1) = accept_pair(&listener, addr);
    let (second, _c2) = accept_pair(&listener, addr);
    let broken = engine.admit_with(first, &panicking).unwrap();
    let healthy = engine.admit_with(second, &vetoing).unwrap();

    assert_eof(&mut c1);
    assert!(!broken.is_open());
    wait_until(|| fired.load(Ordering::SeqCst) == 1);

    // later expiries are still picked up
    let (third, _c3) = accept_pair(&listener, addr);
    engine.admit_with(third, &vetoing).unwrap();
    wait_until(|| fired.load(Ordering::SeqCst) == 2);
    assert!(healthy.is_open());
}

#[test]
fn test_unread_input_stays_bounded() {
    let threshold = 32 * 1024;
    let config = EngineConfig::builder()
        .dispatchers(1)
        .connection(
            ConnectionConfig::builder()
                .preallocation_size(8 * 1024)
                .min_buffer_size(512)
                .max_read_buffer_threshold(threshold)
                .build(),
        )
        .build();
    // never finds its delimiter
    let handlers = HandlerSet::builder()
        .on_data(handler::from_fn(|conn: &Connection| {
            conn.read_bytes_by_delimiter(b"\r\n")?;
            Ok(true)
        }))
        .build();

    let engine = Engine::new(config, handlers).unwrap();
    let (listener, addr) = listener();
    let (server, mut client) = accept_pair(&listener, addr);
    let conn = engine.admit(server).unwrap();

    let writer = thread::spawn(move || {
        client.set_write_timeout(Some(Duration::from_millis(500))).unwrap();
        let chunk = vec![b'z'; 64 * 1024];
        let mut sent = 0usize;
        while sent < 16 << 20 {
            match client.write(&chunk) {
                Ok(n) => sent += n,
                Err(_) => break,
            }
        }
        (sent, client)
    });
    let (sent, _client) = writer.join().unwrap();

    assert!(sent < 16 << 20, "the writer should have been pushed back");
    wait_until(|| conn.available() >= threshold);
    assert!(conn.available() < threshold + 8 * 1024);
    assert!(conn.is_open());
}

#[test]
fn test_idle_timeout_veto_keeps_connection() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let handlers = HandlerSet::builder()
        .on_idle_timeout(handler::from_fn(move |_conn: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }))
        .build();

    let engine = Engine::new(timeout_config(Duration::from_millis(100)), handlers).unwrap();
    let (listener, addr) = listener();
    let (server, _client) = accept_pair(&listener, addr);
    let conn = engine.admit(server).unwrap();

    wait_until(|| fired.load(Ordering::SeqCst) == 1);
    thread::sleep(Duration::from_millis(300));

    assert!(conn.is_open());
    // fires once per expiry until new activity re-arms it
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stats()[0].idle_timeouts, 1);
}

#[test]
fn test_idle_timeout_closes_when_not_vetoed() {
    let refuse = HandlerSet::builder()
        .on_idle_timeout(handler::from_fn(|conn: &Connection| {
            conn.write(b"bye\n")?;
            Ok(false)
        }))
        .build();

    for handlers in [refuse, HandlerSet::default()] {
        let expects_farewell = handlers.capabilities().idle_timeout;
        let engine = Engine::new(timeout_config(Duration::from_millis(100)), handlers).unwrap();
        let (listener, addr) = listener();
        let (server, mut client) = accept_pair(&listener, addr);
        let conn = engine.admit(server).unwrap();

        let started = Instant::now();
        if expects_farewell {
            assert_eq!(read_line(&mut client), "bye");
        }
        assert_eof(&mut client);
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert!(!conn.is_open());
    }
}

#[test]
fn test_connection_timeout_uses_its_own_handler() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let handlers = HandlerSet::builder()
        .on_connection_timeout(handler::from_fn(move |_conn: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }))
        .build();

    let config = EngineConfig::builder()
        .dispatchers(1)
        .timeout_check_period(Duration::from_millis(20))
        .connection(
            ConnectionConfig::builder()
                .connection_timeout(Duration::from_millis(150))
                .build(),
        )
        .build();
    let engine = Engine::new(config, handlers).unwrap();
    let (listener, addr) = listener();
    let (server, mut client) = accept_pair(&listener, addr);
    engine.admit(server).unwrap();

    // activity does not postpone a connection timeout
    for _ in 0..3 {
        client.write_all(b"tick").unwrap();
        thread::sleep(Duration::from_millis(30));
    }
    assert_eof(&mut client);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stats()[0].connection_timeouts, 1);
}

#[test]
fn test_per_connection_handlers() {
    let built = Arc::new(AtomicUsize::new(0));
    let factory_count = built.clone();
    let prototype = HandlerPrototype::per_connection(move || {
        factory_count.fetch_add(1, Ordering::SeqCst);
        let lines = Arc::new(AtomicUsize::new(0));
        HandlerSet::builder()
            .mode(ExecutionMode::Inline)
            .on_data(handler::from_fn(move |conn: &Connection| {
                conn.read_bytes_by_delimiter(b"\n")?;
                let n = lines.fetch_add(1, Ordering::SeqCst) + 1;
                conn.write_str(&format!("{n}\n"))?;
                Ok(true)
            }))
            .build()
    });

    let engine = Engine::new(EngineConfig::default(), prototype).unwrap();
    let (listener, addr) = listener();
    let (first, mut c1) = accept_pair(&listener, addr);
    let (second, mut c2) = accept_pair(&listener, addr);
    engine.admit(first).unwrap();
    engine.admit(second).unwrap();

    c1.write_all(b"a\n").unwrap();
    assert_eq!(read_line(&mut c1), "1");
    c1.write_all(b"b\n").unwrap();
    assert_eq!(read_line(&mut c1), "2");
    c2.write_all(b"c\n").unwrap();
    assert_eq!(read_line(&mut c2), "1");

    assert_eq!(built.load(Ordering::SeqCst), 2);
}

#[test]
fn test_chain_stops_at_first_handled() {
    let second_calls = Arc::new(AtomicUsize::new(0));
    let counter = second_calls.clone();

    let ping = HandlerSet::builder()
        .mode(ExecutionMode::Inline)
        .on_data(handler::from_fn(|conn: &Connection| {
            if conn.index_of(b"ping\n") != Some(0) {
                return Ok(false);
            }
            conn.read_bytes_by_length(5)?;
            conn.write(b"pong\n")?;
            Ok(true)
        }))
        .build();
    let fallback = HandlerSet::builder()
        .mode(ExecutionMode::Inline)
        .on_data(handler::from_fn(move |conn: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
            conn.read_bytes_by_delimiter(b"\n")?;
            conn.write(b"unknown\n")?;
            Ok(true)
        }))
        .build();

    let chain = HandlerChain::new().push(ping).push(fallback).build();
    let engine = Engine::new(EngineConfig::default(), chain).unwrap();
    let (listener, addr) = listener();
    let (server, mut client) = accept_pair(&listener, addr);
    engine.admit(server).unwrap();

    client.write_all(b"ping\n").unwrap();
    assert_eq!(read_line(&mut client), "pong");
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);

    client.write_all(b"hello\n").unwrap();
    assert_eq!(read_line(&mut client), "unknown");
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_blocking_client_round_trip() {
    let engine = Engine::new(EngineConfig::default(), line_echo(ExecutionMode::Threaded)).unwrap();
    let (listener, addr) = listener();

    let client = engine.connect_blocking(addr, Duration::from_secs(2)).unwrap();
    let (server, _) = listener.accept().unwrap();
    engine.admit(server).unwrap();

    client.write_str("ping\n").unwrap();
    assert_eq!(client.read_string_by_delimiter("\n").unwrap(), "ping");

    let mut client = client;
    client.set_receive_timeout(Duration::from_millis(100));
    assert!(matches!(client.read_bytes_by_length(10), Err(Error::Timeout(_))));

    client.close();
    wait_until(|| engine.open_connections() == 0);
}

#[test]
fn test_write_rate_limits_delivery() {
    let engine = Engine::new(EngineConfig::default(), HandlerSet::default()).unwrap();
    let (listener, addr) = listener();
    let (server, mut client) = accept_pair(&listener, addr);
    let conn = engine.admit(server).unwrap();

    conn.set_write_rate(Some(100)).unwrap();
    let started = Instant::now();
    conn.write(&[7u8; 100]).unwrap();
    assert!(conn.pending_write_size() > 0);

    let mut received = [0u8; 100];
    client.read_exact(&mut received).unwrap();

    // 25 bytes per 250ms window, the first window starts immediately
    assert!(started.elapsed() >= Duration::from_millis(700));
    assert_eq!(received, [7u8; 100]);
    wait_until(|| conn.pending_write_size() == 0);
}

#[test]
fn test_engine_from_toml() {
    let config = EngineConfig::from_toml_str(
        r#"
        dispatchers = 3
        workers = 2
        timeout_check_period_ms = 50

        [connection]
        idle_timeout_ms = 5000
        flush_mode = "async"
        "#,
    )
    .unwrap();

    let engine = Engine::new(config, line_echo(ExecutionMode::Inline)).unwrap();
    assert_eq!(engine.dispatcher_count(), 3);
    assert_eq!(engine.worker_count(), 2);

    let (listener, addr) = listener();
    let (server, mut client) = accept_pair(&listener, addr);
    let conn = engine.admit(server).unwrap();
    assert_eq!(conn.idle_timeout(), Some(Duration::from_secs(5)));

    client.write_all(b"queued\n").unwrap();
    assert_eq!(read_line(&mut client), "queued");
}

#[test]
fn test_shutdown_rejects_new_connections() {
    let engine = Engine::new(EngineConfig::default(), HandlerSet::default()).unwrap();
    let (listener, addr) = listener();
    let (server, mut client) = accept_pair(&listener, addr);
    engine.admit(server).unwrap();
    wait_until(|| engine.open_connections() == 1);

    engine.shutdown();
    assert_eof(&mut client);

    let (late, _peer) = accept_pair(&listener, addr);
    assert!(matches!(engine.admit(late), Err(Error::Shutdown)));
}
