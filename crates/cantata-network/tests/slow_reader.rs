use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    thread,
    time::Duration,
};

use cantata::{Config, Interpreter};
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
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.set_nodelay(true).unwrap();
    let mut conn = BufReader::new(stream);
    let mut greeting = String::new();
    conn.read_line(&mut greeting).expect("failed to read greeting");
    assert!(greeting.starts_with("OK MPD "));
    conn
}

/// A reply much larger than the kernel will buffer reaches a slow reader
/// complete and in production order, and a backlogged session does not
/// hold up anyone else.
#[test]
fn deferred_replies_arrive_in_order_while_other_clients_stay_live() {
    const PINGS: usize = 100_000;

    let (addr, notify, handle) = start_daemon(Config::default());
    let mut slow = connect(addr);

    let mut batch = b"command_list_ok_begin\n".to_vec();
    for _ in 0..PINGS {
        batch.extend_from_slice(b"ping\n");
    }
    batch.extend_from_slice(b"command_list_end\n");
    slow.get_mut().write_all(&batch).expect("failed to send");

    // While the slow client sits on a swelling deferred queue, a second
    // client gets served promptly.
    thread::sleep(Duration::from_millis(200));
    let mut fast = connect(addr);
    fast.get_mut().write_all(b"ping\n").expect("failed to send");
    let mut line = String::new();
    fast.read_line(&mut line).expect("failed to read");
    assert_eq!(line, "OK\n");

    thread::sleep(Duration::from_millis(500));

    let mut expected = Vec::with_capacity(PINGS * 8 + 3);
    for _ in 0..PINGS {
        expected.extend_from_slice(b"list_OK\n");
    }
    expected.extend_from_slice(b"OK\n");

    let mut received = vec![0_u8; expected.len()];
    slow.read_exact(&mut received).expect("failed to read the full reply");
    assert!(received == expected, "reply bytes were reordered or corrupted");

    notify.shutdown();
    handle.join().unwrap();
}
