use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    thread,
    time::{Duration, Instant},
};

use cantata::{Config, IdleEvents, Interpreter};
use cantata_network::{ClientManager, Listener, NotifyHandle};

fn start_daemon(config: Config) -> (SocketAddr, NotifyHandle, thread::JoinHandle<()>) {
    let mut listener = Listener::new();
    let addr = listener.bind_tcp("127.0.0.1:0".parse().unwrap()).expect("failed to bind");
    let mut manager = ClientManager::new(config, listener).expect("failed to set up reactor");
    let notify = manager.notify_handle();
    let handle = thread::spawn(move || {
        let mut interpreter = Interpreter;
        manager.run(&mut interpreter).expect("reactor failed");
    });
    (addr, notify, handle)
}

fn connect_raw(addr: SocketAddr) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(addr).expect("failed to connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.set_nodelay(true).unwrap();
    BufReader::new(stream)
}

fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
    let mut conn = connect_raw(addr);
    let mut greeting = String::new();
    conn.read_line(&mut greeting).expect("failed to read greeting");
    assert!(greeting.starts_with("OK MPD "));
    conn
}

/// Reads until the server hangs up, tolerating a reset when the server
/// discarded unread input.
fn read_until_closed(conn: &mut BufReader<TcpStream>) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut buf = [0_u8; 4096];
    loop {
        match conn.get_mut().read(&mut buf) {
            Ok(0) => return collected,
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
                ) =>
            {
                return collected;
            }
            Err(err) => panic!("expected the server to hang up, got {err}"),
        }
    }
}

#[test]
fn excess_connections_are_dropped_without_a_greeting() {
    let config = Config::from_limits(60, 2, 2048, 8192).unwrap();
    let (addr, notify, handle) = start_daemon(config);

    let _first = connect(addr);
    let _second = connect(addr);

    let mut third = connect_raw(addr);
    assert_eq!(read_until_closed(&mut third), b"");

    notify.shutdown();
    handle.join().unwrap();
}

#[test]
fn oversized_command_list_closes_the_connection() {
    // 1 KiB command list budget.
    let config = Config::from_limits(60, 10, 1, 8192).unwrap();
    let (addr, notify, handle) = start_daemon(config);
    let mut conn = connect(addr);

    let mut batch = b"command_list_begin\n".to_vec();
    for _ in 0..300 {
        batch.extend_from_slice(b"ping\n");
    }
    batch.extend_from_slice(b"command_list_end\n");
    conn.get_mut().write_all(&batch).expect("failed to send");

    assert_eq!(read_until_closed(&mut conn), b"");

    notify.shutdown();
    handle.join().unwrap();
}

#[test]
fn silent_connections_time_out() {
    let config = Config::from_limits(1, 10, 2048, 8192).unwrap();
    let (addr, notify, handle) = start_daemon(config);
    let mut conn = connect(addr);

    let started = Instant::now();
    assert_eq!(read_until_closed(&mut conn), b"");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "closed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "closed too late: {elapsed:?}");

    notify.shutdown();
    handle.join().unwrap();
}

#[test]
fn idle_waiters_are_exempt_from_the_timeout() {
    let config = Config::from_limits(1, 10, 2048, 8192).unwrap();
    let (addr, notify, handle) = start_daemon(config);
    let mut conn = connect(addr);

    conn.get_mut().write_all(b"idle player\n").expect("failed to send");
    // Well past the inactivity timeout.
    thread::sleep(Duration::from_millis(2500));

    notify.idle_add(IdleEvents::PLAYER);
    let mut line = String::new();
    conn.read_line(&mut line).expect("failed to read");
    assert_eq!(line, "changed: player\n");
    line.clear();
    conn.read_line(&mut line).expect("failed to read");
    assert_eq!(line, "OK\n");

    notify.shutdown();
    handle.join().unwrap();
}

#[test]
fn deferred_output_overflow_expires_the_session() {
    // 1 KiB deferred budget: any reply burst the kernel can't absorb
    // kills the session.
    let config = Config::from_limits(60, 10, 2048, 1).unwrap();
    let (addr, notify, handle) = start_daemon(config);
    let mut conn = connect(addr);

    const PINGS: usize = 200_000;
    let mut batch = b"command_list_ok_begin\n".to_vec();
    for _ in 0..PINGS {
        batch.extend_from_slice(b"ping\n");
    }
    batch.extend_from_slice(b"command_list_end\n");
    conn.get_mut().write_all(&batch).expect("failed to send");

    // Don't read until the server had to give up on us.
    thread::sleep(Duration::from_millis(800));
    let received = read_until_closed(&mut conn);
    let full_reply = PINGS * b"list_OK\n".len() + b"OK\n".len();
    assert!(
        received.len() < full_reply,
        "expected a truncated reply, got all {} bytes",
        received.len()
    );
    if !received.is_empty() {
        assert!(received.starts_with(b"list_OK\n"));
    }

    notify.shutdown();
    handle.join().unwrap();
}
