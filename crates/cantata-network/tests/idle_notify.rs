use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    thread,
    time::Duration,
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

fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(addr).expect("failed to connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.set_nodelay(true).unwrap();
    let mut conn = BufReader::new(stream);
    let mut greeting = String::new();
    conn.read_line(&mut greeting).expect("failed to read greeting");
    assert!(greeting.starts_with("OK MPD "));
    conn
}

fn read_line(conn: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    conn.read_line(&mut line).expect("failed to read line");
    line
}

fn send(conn: &mut BufReader<TcpStream>, bytes: &[u8]) {
    conn.get_mut().write_all(bytes).expect("failed to send");
}

fn assert_quiet(conn: &mut BufReader<TcpStream>) {
    assert!(conn.buffer().is_empty(), "unexpected buffered bytes: {:?}", conn.buffer());
    conn.get_mut().set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut byte = [0_u8; 1];
    match conn.get_mut().read(&mut byte) {
        Ok(n) => panic!("expected silence, got {n} bytes"),
        Err(err) => assert!(
            matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut),
            "unexpected error: {err}"
        ),
    }
    conn.get_mut().set_read_timeout(Some(Duration::from_secs(5))).unwrap();
}

#[test]
fn raise_after_wait_wakes_the_client_exactly_once() {
    let (addr, notify, handle) = start_daemon(Config::default());
    let mut conn = connect(addr);

    send(&mut conn, b"idle player\n");
    thread::sleep(Duration::from_millis(200));
    // Nothing may arrive before the event fires.
    assert_quiet(&mut conn);

    notify.idle_add(IdleEvents::PLAYER);
    assert_eq!(read_line(&mut conn), "changed: player\n");
    assert_eq!(read_line(&mut conn), "OK\n");
    assert_quiet(&mut conn);

    // A raise with nobody waiting stays pending silently.
    notify.idle_add(IdleEvents::PLAYER);
    thread::sleep(Duration::from_millis(200));
    assert_quiet(&mut conn);

    notify.shutdown();
    handle.join().unwrap();
}

#[test]
fn raise_before_wait_delivers_synchronously() {
    let (addr, notify, handle) = start_daemon(Config::default());
    let mut conn = connect(addr);

    notify.idle_add(IdleEvents::MIXER);
    thread::sleep(Duration::from_millis(200));

    send(&mut conn, b"idle mixer\n");
    assert_eq!(read_line(&mut conn), "changed: mixer\n");
    assert_eq!(read_line(&mut conn), "OK\n");

    notify.shutdown();
    handle.join().unwrap();
}

#[test]
fn unsubscribed_events_do_not_wake_the_client() {
    let (addr, notify, handle) = start_daemon(Config::default());
    let mut conn = connect(addr);

    send(&mut conn, b"idle player\n");
    thread::sleep(Duration::from_millis(200));

    notify.idle_add(IdleEvents::DATABASE);
    thread::sleep(Duration::from_millis(200));
    assert_quiet(&mut conn);

    // The subscribed event finally fires; only subscribed names are
    // reported even though `database` is still pending.
    notify.idle_add(IdleEvents::PLAYER);
    assert_eq!(read_line(&mut conn), "changed: player\n");
    assert_eq!(read_line(&mut conn), "OK\n");
    assert_quiet(&mut conn);

    notify.shutdown();
    handle.join().unwrap();
}

#[test]
fn multiple_events_come_out_in_canonical_order() {
    let (addr, notify, handle) = start_daemon(Config::default());
    let mut conn = connect(addr);

    notify.idle_add(IdleEvents::UPDATE | IdleEvents::DATABASE | IdleEvents::PLAYER);
    thread::sleep(Duration::from_millis(200));

    send(&mut conn, b"idle database player update\n");
    assert_eq!(read_line(&mut conn), "changed: database\n");
    assert_eq!(read_line(&mut conn), "changed: player\n");
    assert_eq!(read_line(&mut conn), "changed: update\n");
    assert_eq!(read_line(&mut conn), "OK\n");

    notify.shutdown();
    handle.join().unwrap();
}
