use std::{
    cell::RefCell,
    fs,
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream},
    path::PathBuf,
    rc::Rc,
    sync::{
        Arc, mpsc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use netfs_fs::LocalBackend;
use netfs_server::NetfsServer;
use netfs_wire::{CHUNK_NOTIFICATION, CHUNK_REPLY, CHUNK_REQUEST, Command, STATUS_OK};

struct TestServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    subscriptions: Arc<AtomicUsize>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(protocol: &'static str, root: PathBuf) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let gauge = Arc::clone(&subscriptions);
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let mut server = NetfsServer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            server
                .register_backend(
                    protocol,
                    Rc::new(RefCell::new(LocalBackend::new(root).unwrap())),
                )
                .unwrap();
            tx.send(server.local_addr()).unwrap();
            while !flag.load(Ordering::Relaxed) {
                server.poll(Some(Duration::from_millis(10))).unwrap();
                gauge.store(server.subscription_count(), Ordering::Relaxed);
            }
        });
        let addr = rx.recv().unwrap();
        Self { addr, stop, subscriptions, thread: Some(thread) }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn wait_for_subscriptions(&self, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.subscriptions.load(Ordering::Relaxed) == expected {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!(
            "subscription count stuck at {} instead of {expected}",
            self.subscriptions.load(Ordering::Relaxed)
        );
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Switch the connection onto the notification sub-protocol.
fn enter_notification_mode(stream: &mut TcpStream, protocol: &str) {
    let mut msg = Vec::new();
    msg.extend_from_slice(&(Command::Notification as u32).to_le_bytes());
    msg.extend_from_slice(&CHUNK_REQUEST.to_le_bytes());
    msg.extend_from_slice(&(protocol.len() as u64).to_le_bytes());
    msg.extend_from_slice(protocol.as_bytes());
    stream.write_all(&msg).unwrap();
}

/// Sub-protocol frames carry no magic: command id, size, payload.
fn send_sub_command(stream: &mut TcpStream, command: Command, payload: &[u8]) {
    let mut msg = Vec::new();
    msg.extend_from_slice(&(command as u32).to_le_bytes());
    msg.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    msg.extend_from_slice(payload);
    stream.write_all(&msg).unwrap();
}

fn read_exact_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn read_preamble(stream: &mut TcpStream) -> (u32, u32, u64) {
    let head = read_exact_n(stream, 16);
    (
        u32::from_le_bytes(head[0..4].try_into().unwrap()),
        u32::from_le_bytes(head[4..8].try_into().unwrap()),
        u64::from_le_bytes(head[8..16].try_into().unwrap()),
    )
}

fn register(stream: &mut TcpStream, path: &str) -> u64 {
    send_sub_command(stream, Command::RegisterNotification, path.as_bytes());
    let (magic, status, len) = read_preamble(stream);
    assert_eq!(magic, CHUNK_REPLY);
    assert_eq!(status, STATUS_OK);
    assert_eq!(len, 8);
    let payload = read_exact_n(stream, 8);
    u64::from_le_bytes(payload.try_into().unwrap())
}

fn parse_notification(payload: &[u8]) -> (String, u32) {
    let len = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    let path = String::from_utf8(payload[4..4 + len].to_vec()).unwrap();
    let kind = u32::from_le_bytes(payload[4 + len..4 + len + 4].try_into().unwrap());
    assert_eq!(payload.len(), 4 + len + 4);
    (path, kind)
}

/// Read frames until the pending unregister reply arrives, discarding any
/// notification frames still queued ahead of it (the queue is FIFO).
fn drain_until_reply(stream: &mut TcpStream) -> (u32, u64) {
    loop {
        let (magic, status, len) = read_preamble(stream);
        if magic == CHUNK_NOTIFICATION {
            read_exact_n(stream, len as usize);
            continue;
        }
        assert_eq!(magic, CHUNK_REPLY);
        return (status, len);
    }
}

fn expect_silence(stream: &mut TcpStream) {
    stream.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
        other => panic!("expected silence, got {other:?}"),
    }
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
}

#[test]
fn subscribe_notify_unsubscribe() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("watched")).unwrap();
    let server = TestServer::start("assets", dir.path().to_path_buf());

    let mut client = server.connect();
    enter_notification_mode(&mut client, "assets");
    let handle = register(&mut client, "watched");
    assert_ne!(handle, u64::MAX);

    fs::write(dir.path().join("watched/z.txt"), b"hello").unwrap();
    let (magic, status, len) = read_preamble(&mut client);
    assert_eq!(magic, CHUNK_NOTIFICATION);
    assert_eq!(status, STATUS_OK);
    let (path, kind) = parse_notification(&read_exact_n(&mut client, len as usize));
    assert_eq!(path, "watched/z.txt");
    assert!(kind <= 2);

    send_sub_command(
        &mut client,
        Command::UnregisterNotification,
        &handle.to_le_bytes(),
    );
    let (status, len) = drain_until_reply(&mut client);
    assert_eq!(status, STATUS_OK);
    assert_eq!(len, 0);

    // The subscription is gone; further changes stay quiet.
    fs::write(dir.path().join("watched/z.txt"), b"more").unwrap();
    expect_silence(&mut client);
}

#[test]
fn unregister_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("watched")).unwrap();
    let server = TestServer::start("assets", dir.path().to_path_buf());

    let mut client = server.connect();
    enter_notification_mode(&mut client, "assets");
    let handle = register(&mut client, "watched");

    for _ in 0..2 {
        send_sub_command(
            &mut client,
            Command::UnregisterNotification,
            &handle.to_le_bytes(),
        );
        let (status, len) = drain_until_reply(&mut client);
        assert_eq!(status, STATUS_OK);
        assert_eq!(len, 0);
    }
}

#[test]
fn unregistering_someone_elses_handle_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("watched")).unwrap();
    let server = TestServer::start("assets", dir.path().to_path_buf());

    let mut client = server.connect();
    enter_notification_mode(&mut client, "assets");
    let _handle = register(&mut client, "watched");

    send_sub_command(&mut client, Command::UnregisterNotification, &999u64.to_le_bytes());
    let (status, len) = drain_until_reply(&mut client);
    assert_eq!(status, STATUS_OK);
    assert_eq!(len, 0);

    // The real subscription still fires.
    fs::write(dir.path().join("watched/new.txt"), b"x").unwrap();
    let (magic, _, len) = read_preamble(&mut client);
    assert_eq!(magic, CHUNK_NOTIFICATION);
    read_exact_n(&mut client, len as usize);
}

#[test]
fn unknown_protocol_subscription_fails_softly() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start("assets", dir.path().to_path_buf());

    let mut client = server.connect();
    enter_notification_mode(&mut client, "no-such-proto");

    // -1 comes back as a normal reply and the connection stays up.
    let handle = register(&mut client, "anything");
    assert_eq!(handle, u64::MAX);
    let handle = register(&mut client, "anything-else");
    assert_eq!(handle, u64::MAX);
}

#[test]
fn disconnect_releases_every_subscription() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("watched")).unwrap();
    let server = TestServer::start("assets", dir.path().to_path_buf());

    let mut client = server.connect();
    enter_notification_mode(&mut client, "assets");
    let first = register(&mut client, "watched");
    let second = register(&mut client, "watched");
    assert_ne!(first, u64::MAX);
    assert_ne!(second, u64::MAX);
    assert_ne!(first, second);
    server.wait_for_subscriptions(2);

    drop(client);
    server.wait_for_subscriptions(0);
}

#[test]
fn garbage_in_notification_mode_kills_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start("assets", dir.path().to_path_buf());

    let mut client = server.connect();
    enter_notification_mode(&mut client, "assets");
    send_sub_command(&mut client, Command::Stat, b"a.txt");

    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(0) => {}
        other => panic!("expected close, got {other:?}"),
    }
}
