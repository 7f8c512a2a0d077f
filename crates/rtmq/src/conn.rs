use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    os::fd::FromRawFd,
    time::{Duration, Instant},
};

use mio::{Interest, Registry, Token, net::TcpStream};
use rtmq_wire::{FrameHeader, WireError};
use tracing::{debug, warn};

const RX_BUF_SIZE: usize = 32 * 1024;

/// Auth progression of a connection. Entered as `AuthWait` on adoption;
/// only a valid AUTH frame promotes to `Ready`. Closing is immediate, the
/// owning rsvr drops the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnPhase {
    AuthWait,
    Ready,
}

/// `Alive` means the connection is still usable; `Disconnected` means the
/// peer is gone and the record must be torn down.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConnState {
    Alive,
    Disconnected,
}

#[derive(Clone, Copy)]
enum RxState {
    /// Waiting for the fixed frame header.
    ReadingHeader { buf: [u8; FrameHeader::SIZE], have: usize },
    /// Reading the `header.length` payload bytes.
    ReadingPayload { header: FrameHeader, offset: usize },
}

pub(crate) enum ReadOutcome<'a> {
    /// One complete validated frame. Bytes are only valid until the next
    /// read call.
    FrameDone { header: FrameHeader, body: &'a [u8] },
    WouldBlock,
    /// Peer closed the stream cleanly.
    Closed,
    /// Socket fault.
    Error,
    /// Sentinel or bound violation; the stream cannot be resynced.
    Malformed(WireError),
}

/// One adopted TCP connection, owned exclusively by its receive server.
///
/// Inbound: reads the 24-byte header, validates sentinels, then reads
/// exactly `length` payload bytes; loops until `WouldBlock`.
///
/// Outbound: `write_or_enqueue` writes non-blocking; any remainder lands in
/// a backlog flushed on writable events. WRITABLE interest is registered
/// exactly while the backlog is non-empty (`writable_armed`).
pub(crate) struct Connection {
    stream: TcpStream,
    pub token: Token,
    pub peer: String,
    /// 0 until authenticated.
    pub node_id: u32,
    pub phase: ConnPhase,
    created: Instant,
    last_recv: Instant,
    last_send: Instant,

    rx_state: RxState,
    rx_buf: Vec<u8>,
    send_backlog: VecDeque<Vec<u8>>,
    writable_armed: bool,
}

impl Connection {
    /// Takes ownership of a raw fd handed over by the listener via ADD_SOCK.
    pub fn adopt(registry: &Registry, fd: i32, peer: String, token: Token) -> io::Result<Self> {
        // Safety: the listener transferred the fd through the command
        // channel and no longer touches it; this record is its sole owner.
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
        std_stream.set_nonblocking(true)?;
        let mut stream = TcpStream::from_std(std_stream);
        stream.set_nodelay(true)?;
        registry.register(&mut stream, token, Interest::READABLE)?;

        let now = Instant::now();
        Ok(Self {
            stream,
            token,
            peer,
            node_id: 0,
            phase: ConnPhase::AuthWait,
            created: now,
            last_recv: now,
            last_send: now,
            rx_state: RxState::ReadingHeader { buf: [0; FrameHeader::SIZE], have: 0 },
            rx_buf: vec![0; RX_BUF_SIZE],
            send_backlog: VecDeque::with_capacity(16),
            writable_armed: false,
        })
    }

    /// Read a single complete frame if present, looping until one is
    /// assembled or the read would block.
    pub fn read_frame(&mut self) -> ReadOutcome<'_> {
        loop {
            match self.rx_state {
                RxState::ReadingHeader { mut buf, mut have } => {
                    while have < FrameHeader::SIZE {
                        match self.stream.read(&mut buf[have..]) {
                            Ok(0) => return ReadOutcome::Closed,
                            Ok(n) => have += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::ReadingHeader { buf, have };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(peer = %self.peer, ?err, "header read");
                                return ReadOutcome::Error;
                            }
                        }
                    }
                    match FrameHeader::parse(&buf) {
                        Ok(header) => {
                            let need = header.length as usize;
                            if need > self.rx_buf.len() {
                                debug!(have = self.rx_buf.len(), need, "rx buffer resized");
                                self.rx_buf.resize(need, 0);
                            }
                            self.rx_state = RxState::ReadingPayload { header, offset: 0 };
                        }
                        Err(e) => return ReadOutcome::Malformed(e),
                    }
                }

                RxState::ReadingPayload { header, mut offset } => {
                    let msg_len = header.length as usize;
                    while offset < msg_len {
                        match self.stream.read(&mut self.rx_buf[offset..msg_len]) {
                            Ok(0) => return ReadOutcome::Closed,
                            Ok(n) => offset += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::ReadingPayload { header, offset };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(peer = %self.peer, ?err, "payload read");
                                return ReadOutcome::Error;
                            }
                        }
                    }
                    self.last_recv = Instant::now();
                    self.rx_state =
                        RxState::ReadingHeader { buf: [0; FrameHeader::SIZE], have: 0 };
                    return ReadOutcome::FrameDone { header, body: &self.rx_buf[..msg_len] };
                }
            }
        }
    }

    /// Happy path writes the frame straight to the socket; a partial or
    /// blocked write queues the remainder for the next writable event.
    pub fn write_or_enqueue(&mut self, registry: &Registry, frame: &[u8]) -> ConnState {
        self.last_send = Instant::now();

        if !self.send_backlog.is_empty() {
            return self.enqueue(registry, frame.to_vec());
        }

        match self.stream.write(frame) {
            Ok(0) => {
                warn!(peer = %self.peer, "stream refused write, disconnecting");
                ConnState::Disconnected
            }
            Ok(n) if n == frame.len() => ConnState::Alive,
            Ok(n) => self.enqueue(registry, frame[n..].to_vec()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue(registry, frame.to_vec())
            }
            Err(err) => {
                warn!(peer = %self.peer, ?err, "stream write failed");
                ConnState::Disconnected
            }
        }
    }

    /// Flush queued data until the kernel blocks or the backlog drains.
    pub fn drain_backlog(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(peer = %self.peer, ?err, "backlog write");
                    return ConnState::Disconnected;
                }
            }
        }

        // Drop WRITABLE interest only when fully drained.
        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) =
                registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(peer = %self.peer, ?err, "reregister drop writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    #[inline]
    fn enqueue(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        self.arm_writable(registry)
    }

    /// Arm WRITABLE notifications on the empty → non-empty transition.
    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(peer = %self.peer, ?err, "reregister arm writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    /// Deadline check for the periodic sweep: unauthenticated peers get the
    /// window from adoption, authenticated ones from their last frame.
    pub fn expired(&self, now: Instant, keepalive: Duration) -> bool {
        let since = match self.phase {
            ConnPhase::AuthWait => self.created,
            ConnPhase::Ready => self.last_recv,
        };
        now.duration_since(since) > keepalive
    }

    pub fn close(&mut self, registry: &Registry) {
        debug!(
            peer = %self.peer,
            node = self.node_id,
            idle_send_ms = self.last_send.elapsed().as_millis(),
            "closing connection"
        );
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
