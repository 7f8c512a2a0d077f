use std::{
    io::{self, Read, Write},
    net::TcpStream,
    sync::{Mutex, mpsc},
    thread,
    time::{Duration, Instant},
};

use rtmq::{AuthEntry, QueueConf, Rtmq, RtmqConf};
use rtmq::wire::{
    AuthAck, AuthReq, AuthStatus, CtrlType, Decoded, FrameHeader, SubReq, decode, encode_frame,
};

fn broker_conf(name: &str, port: u16) -> RtmqConf {
    RtmqConf {
        name: name.into(),
        node_id: 1,
        port,
        recv_thd_num: 2,
        work_thd_num: 2,
        distq_num: 1,
        recvq: QueueConf { max: 1024, size: 4096 },
        sendq: QueueConf { max: 1024, size: 4096 },
        keepalive_sec: 30,
        auth: vec![
            AuthEntry { node_id: 17, user: "u".into(), passwd: "p".into() },
            AuthEntry { node_id: 18, user: "u".into(), passwd: "p".into() },
        ],
    }
}

struct TestClient {
    stream: TcpStream,
    node_id: u32,
    rx: Vec<u8>,
}

impl TestClient {
    fn connect(port: u16, node_id: u32) -> Self {
        // The listener thread may still be coming up.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
                    stream.set_nodelay(true).unwrap();
                    return Self { stream, node_id, rx: Vec::new() };
                }
                Err(_) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => panic!("couldn't reach broker: {e}"),
            }
        }
    }

    fn send_ctrl(&mut self, ctype: CtrlType, body: &[u8]) {
        let header = FrameHeader::system(ctype as u16, self.node_id, 0, body.len());
        self.stream.write_all(&encode_frame(&header, body)).unwrap();
    }

    fn send_data(&mut self, msg_type: u16, dest: u32, body: &[u8]) {
        let header = FrameHeader::express(msg_type, self.node_id, dest, body.len());
        self.stream.write_all(&encode_frame(&header, body)).unwrap();
    }

    fn read_frame(&mut self) -> io::Result<(FrameHeader, Vec<u8>)> {
        loop {
            let decoded =
                decode(&self.rx).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if let Decoded::Frame { header, body, consumed } = decoded {
                let body = body.to_vec();
                self.rx.drain(..consumed);
                return Ok((header, body));
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.rx.extend_from_slice(&chunk[..n]);
        }
    }

    fn auth(&mut self, user: &str, pass: &str) -> AuthStatus {
        let req =
            AuthReq { node_id: self.node_id, username: user.into(), password: pass.into() };
        let mut body = Vec::new();
        req.encode_into(&mut body);
        self.send_ctrl(CtrlType::Auth, &body);

        let (header, body) = self.read_frame().expect("auth ack");
        assert_eq!(header.msg_type, CtrlType::AuthAck as u16);
        AuthAck::parse(&body).unwrap().status
    }

    fn subscribe(&mut self, msg_type: u16) {
        let mut body = Vec::new();
        SubReq { msg_type }.encode_into(&mut body);
        self.send_ctrl(CtrlType::Sub, &body);
    }
}

fn sum_recv<F: Fn(&rtmq::RecvStatSnapshot) -> u64>(conf: &RtmqConf, field: F) -> u64 {
    rtmq::query_recv_stat(conf).unwrap().iter().map(field).sum()
}

fn wait_for<F: FnMut() -> bool>(mut cond: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn auth_then_registered_handler_dispatch() {
    let conf = broker_conf("it_dispatch", 24801);
    let mut broker = Rtmq::init(conf.clone()).unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    broker
        .register(100, move |msg_type, orig, body| {
            tx.lock().unwrap().send((msg_type, orig, body.to_vec())).unwrap();
        })
        .unwrap();
    broker.launch().unwrap();

    let mut client = TestClient::connect(conf.port, 17);
    assert_eq!(client.auth("u", "p"), AuthStatus::Ok);

    client.send_data(100, 0, b"hi");
    let got = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(got, (100, 17, b"hi".to_vec()));

    // Exactly once.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    broker.destroy();
}

#[test]
fn unregistered_type_hits_default_without_drops() {
    let conf = broker_conf("it_default", 24802);
    let mut broker = Rtmq::init(conf.clone()).unwrap();
    broker.launch().unwrap();

    let mut client = TestClient::connect(conf.port, 17);
    assert_eq!(client.auth("u", "p"), AuthStatus::Ok);
    client.send_data(100, 0, b"hi");

    // The default no-op still consumes the frame.
    wait_for(
        || {
            rtmq::query_work_stat(&conf)
                .unwrap()
                .iter()
                .map(|s| s.proc_total)
                .sum::<u64>() >=
                1
        },
        "default handler dispatch",
    );
    assert_eq!(sum_recv(&conf, |s| s.drop_total), 0);
    broker.destroy();
}

#[test]
fn newer_auth_replaces_older_connection() {
    let conf = broker_conf("it_replace", 24803);
    let mut broker = Rtmq::init(conf.clone()).unwrap();
    broker.launch().unwrap();

    let mut first = TestClient::connect(conf.port, 17);
    assert_eq!(first.auth("u", "p"), AuthStatus::Ok);

    // Round-robin assignment homes this one on the other receive server,
    // so the kick crosses threads.
    let mut second = TestClient::connect(conf.port, 17);
    assert_eq!(second.auth("u", "p"), AuthStatus::Ok);

    // The stale connection is closed by the broker.
    match first.read_frame() {
        Err(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
        Ok((header, _)) => panic!("expected close, got frame type {}", header.msg_type),
    }

    // The node map now points at the second connection.
    broker.async_send(7, 17, b"x").unwrap();
    let (header, body) = second.read_frame().unwrap();
    assert_eq!((header.msg_type, body.as_slice()), (7, b"x".as_slice()));

    broker.destroy();
}

#[test]
fn bad_magic_closes_connection() {
    let conf = broker_conf("it_badmagic", 24804);
    let mut broker = Rtmq::init(conf.clone()).unwrap();
    broker.launch().unwrap();

    let mut client = TestClient::connect(conf.port, 17);
    assert_eq!(client.auth("u", "p"), AuthStatus::Ok);

    let mut junk = encode_frame(&FrameHeader::express(100, 17, 0, 0), b"");
    junk[..4].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
    client.stream.write_all(&junk).unwrap();

    match client.read_frame() {
        Err(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
        Ok(_) => panic!("expected close after bad magic"),
    }
    wait_for(|| sum_recv(&conf, |s| s.err_total) == 1, "err_total");
    broker.destroy();
}

#[test]
fn outbound_frames_arrive_in_order() {
    let conf = broker_conf("it_order", 24805);
    let mut broker = Rtmq::init(conf.clone()).unwrap();
    broker.launch().unwrap();

    let mut client = TestClient::connect(conf.port, 17);
    assert_eq!(client.auth("u", "p"), AuthStatus::Ok);

    // One distq shard and one producer: delivery must be FIFO. The queue is
    // deeper than the burst, so nothing drops.
    let total = 300u32;
    for i in 0..total {
        broker.async_send(7, 17, &i.to_be_bytes()).unwrap();
    }
    for expect in 0..total {
        let (header, body) = client.read_frame().unwrap();
        assert_eq!(header.msg_type, 7);
        assert_eq!(u32::from_be_bytes(body.as_slice().try_into().unwrap()), expect);
    }

    broker.destroy();
}

#[test]
fn broadcast_reaches_every_subscriber_once() {
    let conf = broker_conf("it_fanout", 24806);
    let mut broker = Rtmq::init(conf.clone()).unwrap();
    broker.launch().unwrap();

    let mut a = TestClient::connect(conf.port, 17);
    assert_eq!(a.auth("u", "p"), AuthStatus::Ok);
    let mut b = TestClient::connect(conf.port, 18);
    assert_eq!(b.auth("u", "p"), AuthStatus::Ok);

    a.subscribe(42);
    b.subscribe(42);
    // Subscriptions are applied by the receive servers asynchronously.
    thread::sleep(Duration::from_millis(300));

    broker.async_send(42, 0, b"x").unwrap();

    for client in [&mut a, &mut b] {
        let (header, body) = client.read_frame().unwrap();
        assert_eq!((header.msg_type, body.as_slice()), (42, b"x".as_slice()));
    }

    // Exactly one copy each.
    a.stream.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    assert!(a.read_frame().is_err());

    broker.destroy();
}

#[test]
fn bad_credentials_are_refused() {
    let conf = broker_conf("it_badcred", 24807);
    let mut broker = Rtmq::init(conf.clone()).unwrap();
    broker.launch().unwrap();

    let mut client = TestClient::connect(conf.port, 17);
    assert_eq!(client.auth("u", "wrong"), AuthStatus::BadCred);
    match client.read_frame() {
        Err(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
        Ok(_) => panic!("expected close after failed auth"),
    }

    broker.destroy();
}

#[test]
fn unauthenticated_connections_time_out() {
    let mut conf = broker_conf("it_authwait", 24808);
    conf.keepalive_sec = 1;
    let mut broker = Rtmq::init(conf.clone()).unwrap();
    broker.launch().unwrap();

    let mut client = TestClient::connect(conf.port, 17);
    // Never authenticates; the sweep closes it after the deadline.
    match client.read_frame() {
        Err(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
        Ok(_) => panic!("expected timeout close"),
    }
    wait_for(|| sum_recv(&conf, |s| s.err_total) == 1, "err_total");

    broker.destroy();
}

#[test]
fn ping_is_answered_with_pong() {
    let conf = broker_conf("it_ping", 24809);
    let mut broker = Rtmq::init(conf.clone()).unwrap();
    broker.launch().unwrap();

    let mut client = TestClient::connect(conf.port, 17);
    assert_eq!(client.auth("u", "p"), AuthStatus::Ok);
    client.send_ctrl(CtrlType::Ping, &[]);

    let (header, body) = client.read_frame().unwrap();
    assert_eq!(header.msg_type, CtrlType::Pong as u16);
    assert_eq!(header.dest, 17);
    assert!(body.is_empty());

    broker.destroy();
}

#[test]
fn query_surface_reports_conf_and_stats() {
    let conf = broker_conf("it_query", 24810);
    let mut broker = Rtmq::init(conf.clone()).unwrap();
    broker.launch().unwrap();

    let snapshot = rtmq::query_conf(&conf).unwrap();
    assert_eq!(snapshot.name, conf.name);
    assert_eq!(snapshot.port, conf.port);
    assert_eq!(snapshot.recv_thd_num, conf.recv_thd_num as u32);
    assert_eq!(snapshot.work_thd_num, conf.work_thd_num as u32);

    let mut client = TestClient::connect(conf.port, 17);
    assert_eq!(client.auth("u", "p"), AuthStatus::Ok);
    wait_for(|| sum_recv(&conf, |s| s.connections as u64) == 1, "connection gauge");
    // The AUTH frame itself was counted.
    assert!(sum_recv(&conf, |s| s.recv_total) >= 1);

    drop(client);
    wait_for(|| sum_recv(&conf, |s| s.connections as u64) == 0, "disconnect gauge");

    broker.destroy();
}
