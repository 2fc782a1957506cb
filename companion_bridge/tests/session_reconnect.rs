use companion_bridge::protocol::{
    ButtonAddress, ButtonTarget, OutboundCommand, DEFAULT_DEVICE_ID, IMAGE_BUFFER_LEN,
};
use companion_bridge::{
    BridgeConfig, CacheKey, CommandSink, ImageCache, Session, SessionState, SessionStatus,
    StatusLevel,
};
use crossbeam_channel::Receiver;
use serde_json::json;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tungstenite::{Message, WebSocket};

const TIMEOUT: Duration = Duration::from_secs(5);

fn controller() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");
    let url = format!("ws://{}", listener.local_addr().expect("addr"));
    (listener, url)
}

fn test_config(url: &str, backoff_ms: u64) -> BridgeConfig {
    let mut config = BridgeConfig::default()
        .with_url(url)
        .with_backoff(Duration::from_millis(backoff_ms));
    config.connect_timeout = Duration::from_millis(500);
    config.poll_interval = Duration::from_millis(10);
    config
}

fn accept_tcp(listener: &TcpListener) -> TcpStream {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).expect("blocking");
                return stream;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    panic!("timeout waiting for the bridge to connect");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("accept failed: {e:?}"),
        }
    }
}

fn accept(listener: &TcpListener) -> WebSocket<TcpStream> {
    let ws = tungstenite::accept(accept_tcp(listener)).expect("ws accept");
    ws.get_ref()
        .set_read_timeout(Some(Duration::from_millis(20)))
        .expect("read timeout");
    ws
}

fn try_read_command(ws: &mut WebSocket<TcpStream>, within: Duration) -> Option<OutboundCommand> {
    let deadline = Instant::now() + within;
    loop {
        match ws.read() {
            Ok(Message::Text(s)) => {
                return Some(serde_json::from_str(s.as_str()).expect("valid client json"))
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => panic!("ws read failed: {e:?}"),
        }
        if Instant::now() >= deadline {
            return None;
        }
    }
}

fn read_command(ws: &mut WebSocket<TcpStream>) -> OutboundCommand {
    try_read_command(ws, TIMEOUT).expect("timeout waiting for client command")
}

fn assert_handshake(ws: &mut WebSocket<TcpStream>) {
    let version = read_command(ws);
    assert_eq!(version.command, "version");
    assert_eq!(version.arguments, json!({ "version": 2 }));

    let device = read_command(ws);
    assert_eq!(device.command, "new_device");
    assert_eq!(device.arguments, json!(DEFAULT_DEVICE_ID));
}

fn wait_status_where(
    rx: &Receiver<SessionStatus>,
    what: &str,
    pred: impl Fn(&SessionStatus) -> bool,
) -> SessionStatus {
    let deadline = Instant::now() + TIMEOUT;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(status) if pred(&status) => return status,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    panic!("timeout waiting for {what}");
}

fn wait_status(rx: &Receiver<SessionStatus>, wanted: &SessionStatus) {
    wait_status_where(rx, &format!("status {wanted:?}"), |s| s == wanted);
}

fn valid_fill(key_index: u32, value: u8) -> String {
    json!({
        "command": "fillImage",
        "arguments": {
            "keyIndex": key_index,
            "data": { "type": "Buffer", "data": vec![value; IMAGE_BUFFER_LEN] },
        },
    })
    .to_string()
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn close(mut ws: WebSocket<TcpStream>) {
    let _ = ws.close(None);
    let _ = ws.flush();
}

fn request(page: u32, bank: u32) -> OutboundCommand {
    OutboundCommand::request_button(ButtonAddress::new(page, bank))
}

#[test]
fn handshake_and_replay_precede_concurrent_sends() {
    let (listener, url) = controller();
    let (session, status_rx) = Session::new(test_config(&url, 100));
    let session = Arc::new(session);
    session.on_connect_command(request(3, 7));

    let spamming = Arc::new(AtomicBool::new(true));
    let spammer = {
        let session = Arc::clone(&session);
        let spamming = Arc::clone(&spamming);
        thread::spawn(move || {
            while spamming.load(Ordering::Relaxed) {
                session.send_command(OutboundCommand::keydown(ButtonTarget::Dynamic {
                    key_index: 1,
                }));
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    session.start().expect("start");
    let mut ws = accept(&listener);

    assert_handshake(&mut ws);
    assert_eq!(read_command(&mut ws), request(3, 7));
    for _ in 0..5 {
        assert_eq!(read_command(&mut ws).command, "keydown");
    }
    wait_status(&status_rx, &SessionStatus::Connected);

    spamming.store(false, Ordering::Relaxed);
    spammer.join().expect("spammer");
    session.stop();
}

#[test]
fn connect_commands_replay_after_every_reconnect() {
    let (listener, url) = controller();
    let (session, status_rx) = Session::new(test_config(&url, 100));
    session.on_connect_command(request(1, 0));
    session.start().expect("start");

    let mut first = accept(&listener);
    assert_handshake(&mut first);
    assert_eq!(read_command(&mut first), request(1, 0));
    assert!(wait_until(|| session.is_connected()));

    // Registered while connected: sent now and remembered for later.
    session.on_connect_command(request(2, 5));
    assert_eq!(read_command(&mut first), request(2, 5));

    let press = OutboundCommand::keydown(ButtonTarget::Dynamic { key_index: 4 });
    session.send_command(press.clone());
    assert_eq!(read_command(&mut first), press);

    close(first);
    wait_status(&status_rx, &SessionStatus::NotConnected);

    for _ in 0..2 {
        let mut next = accept(&listener);
        assert_handshake(&mut next);
        assert_eq!(read_command(&mut next), request(1, 0));
        assert_eq!(read_command(&mut next), request(2, 5));
        assert!(
            try_read_command(&mut next, Duration::from_millis(300)).is_none(),
            "ordinary commands must not be replayed"
        );
        assert!(
            matches!(listener.accept(), Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock),
            "no second connection while one is live"
        );
        close(next);
        wait_status(&status_rx, &SessionStatus::NotConnected);
    }

    assert_eq!(session.connect_commands(), vec![request(1, 0), request(2, 5)]);
    session.stop();
}

#[test]
fn unreachable_controller_keeps_retrying() {
    let (listener, url) = controller();
    drop(listener);

    let (session, status_rx) = Session::new(test_config(&url, 10));
    session.start().expect("start");

    for _ in 0..10 {
        wait_status(&status_rx, &SessionStatus::NotConnected);
        assert!(!session.is_connected());
    }

    session.send_command(OutboundCommand::keyup(ButtonTarget::Dynamic { key_index: 0 }));
    session.stop();
    assert_eq!(session.state(), SessionState::ShuttingDown);
}

#[test]
fn server_close_reconnects_within_one_backoff() {
    let (listener, url) = controller();
    let backoff = Duration::from_millis(300);
    let (session, status_rx) = Session::new(test_config(&url, backoff.as_millis() as u64));
    session.start().expect("start");

    let mut ws = accept(&listener);
    assert_handshake(&mut ws);
    wait_status(&status_rx, &SessionStatus::Connected);

    close(ws);
    wait_status(&status_rx, &SessionStatus::NotConnected);
    let closed_at = Instant::now();
    assert!(!session.is_connected());

    let mut ws = accept(&listener);
    assert!(
        closed_at.elapsed() < backoff + Duration::from_millis(500),
        "reconnect took {:?}",
        closed_at.elapsed()
    );
    assert_handshake(&mut ws);
    wait_status(&status_rx, &SessionStatus::Connected);
    assert!(wait_until(|| session.is_connected()));

    session.stop();
}

#[test]
fn stop_closes_the_connection_and_silences_sends() {
    let (listener, url) = controller();
    let (session, _status_rx) = Session::new(test_config(&url, 50));
    session.start().expect("start");

    let mut ws = accept(&listener);
    assert_handshake(&mut ws);
    assert!(wait_until(|| session.is_connected()));

    session.stop();
    assert!(!session.is_connected());
    session.send_command(OutboundCommand::keydown(ButtonTarget::Dynamic { key_index: 2 }));
    session.on_connect_command(request(4, 4));

    let deadline = Instant::now() + TIMEOUT;
    loop {
        match ws.read() {
            Ok(Message::Text(s)) => panic!("unexpected frame after stop: {s}"),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => break,
        }
        assert!(Instant::now() < deadline, "bridge did not close the socket");
    }

    // Stopped sessions do not restart.
    session.start().expect("start after stop");
    thread::sleep(Duration::from_millis(150));
    assert!(matches!(
        listener.accept(),
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock
    ));
}

#[test]
fn pushed_images_reach_attached_caches() {
    let (listener, url) = controller();
    let (session, _status_rx) = Session::new(test_config(&url, 100));
    let cache = Arc::new(ImageCache::new());
    let _subscription = cache.attach(session.fill_images());
    session.start().expect("start");

    let mut ws = accept(&listener);
    assert_handshake(&mut ws);

    let fill = |key_index: u32, value: u8, len: usize| {
        json!({
            "command": "fillImage",
            "arguments": {
                "keyIndex": key_index,
                "data": { "type": "Buffer", "data": vec![value; len] },
            },
        })
        .to_string()
    };

    ws.send(Message::Text(fill(10, 0x11, IMAGE_BUFFER_LEN).into()))
        .expect("send");
    ws.send(Message::Text("{ not json".to_string().into()))
        .expect("send");
    ws.send(Message::Text(fill(10, 0x22, 12).into())).expect("send");
    ws.send(Message::Text(fill(10, 0x33, IMAGE_BUFFER_LEN).into()))
        .expect("send");

    assert!(wait_until(|| {
        cache
            .lookup(CacheKey::Flat(10))
            .and_then(|b| b.pixel(0, 0))
            == Some([0x33, 0x33, 0x33])
    }));
    assert!(session.is_connected(), "protocol noise must not drop the connection");

    session.stop();
}

#[test]
fn panicking_image_handler_releases_the_connection() {
    let (listener, url) = controller();
    let (session, status_rx) = Session::new(test_config(&url, 100));
    let _subscription = session
        .fill_images()
        .subscribe(|_| panic!("host repaint failed"));
    session.start().expect("start");

    let mut ws = accept(&listener);
    assert_handshake(&mut ws);
    wait_status(&status_rx, &SessionStatus::Connected);

    ws.send(Message::Text(valid_fill(3, 0x40).into())).expect("send");

    let status = wait_status_where(&status_rx, "an error status", |s| {
        s.level() == StatusLevel::Error
    });
    assert_eq!(status, SessionStatus::Error("host repaint failed".to_string()));

    let mut next = accept(&listener);
    assert_handshake(&mut next);
    wait_status(&status_rx, &SessionStatus::Connected);
    assert!(wait_until(|| session.is_connected()));

    session.stop();
}

#[test]
fn non_websocket_peer_reports_error_and_keeps_retrying() {
    let (listener, url) = controller();
    let (session, status_rx) = Session::new(test_config(&url, 50));
    session.start().expect("start");

    for _ in 0..2 {
        let mut stream = accept_tcp(&listener);
        stream
            .set_read_timeout(Some(TIMEOUT))
            .expect("read timeout");
        let mut request = Vec::new();
        let mut buf = [0u8; 512];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).expect("read upgrade request");
            assert!(n > 0, "bridge hung up before finishing its request");
            request.extend_from_slice(&buf[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .expect("write reply");
        stream.flush().expect("flush");

        let status = wait_status_where(&status_rx, "an error status", |s| {
            s.level() == StatusLevel::Error
        });
        assert!(
            status.to_string().starts_with("Error: "),
            "unexpected status text {status}"
        );
        assert!(!session.is_connected());
    }

    session.stop();
}
