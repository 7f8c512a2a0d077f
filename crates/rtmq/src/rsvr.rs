use std::{
    collections::HashMap,
    io,
    sync::{Arc, atomic::Ordering},
    time::Instant,
};

use mio::{Events, Poll, Token};
use rtmq_queue::ForwardHeader;
use rtmq_wire::{AuthAck, AuthReq, AuthStatus, CtrlType, FrameHeader, SubReq, encode_frame, is_ctrl};
use tracing::{Level, debug, error, info, span, warn};

use crate::{
    command::{CMD_BUF_SIZE, CmdSock, Command},
    config::{RECV_CMD_RESND_TIMES, TMOUT},
    conn::{ConnPhase, ConnState, Connection, ReadOutcome},
    context::RtmqCore,
    routing::NodeRoute,
    timing::Repeater,
};

const CMD: Token = Token(0);
/// Connection tokens start above the fixed per-thread tokens and are never
/// reused within a thread's lifetime, so a DEL_SOCK for an already-gone
/// connection cannot hit a newer one.
const CONN_TOKEN_BASE: usize = 16;

#[derive(Clone, Copy)]
enum CloseReason {
    /// Clean EOF from the peer.
    Peer,
    /// IO error, malformed frame, failed auth or expired deadline.
    Fault,
    /// A newer AUTH for the same node took over.
    Replaced,
}

enum FrameStep {
    Continue,
    Close(CloseReason),
    Ctrl(CtrlMsg),
}

enum CtrlMsg {
    Auth(AuthReq),
    Keepalive,
    Sub(u16),
    Unsub(u16),
    Ping,
}

/// One receive-server thread: multiplexes its adopted connections plus the
/// command socket, feeds decoded frames into the recvq shards and drains its
/// sendq towards the owning sockets.
pub(crate) struct Rsvr {
    tidx: usize,
    poll: Poll,
    events: Events,
    cmd: CmdSock,
    conns: Vec<Connection>,
    /// Reverse map for outbound resolution; only nodes homed here.
    node_conns: HashMap<u32, Token>,
    next_token: usize,
    sweep: Repeater,
    core: Arc<RtmqCore>,
}

impl Rsvr {
    pub fn new(tidx: usize, mut cmd: CmdSock, core: Arc<RtmqCore>) -> io::Result<Self> {
        let poll = Poll::new()?;
        cmd.register(poll.registry(), CMD)?;
        Ok(Self {
            tidx,
            poll,
            events: Events::with_capacity(256),
            cmd,
            conns: Vec::new(),
            node_conns: HashMap::new(),
            next_token: CONN_TOKEN_BASE,
            sweep: Repeater::every(TMOUT),
            core,
        })
    }

    pub fn run(mut self) {
        let _span = span!(Level::INFO, "rsvr", tidx = self.tidx).entered();
        info!("receive server up");

        let mut pending: Vec<(Token, bool, bool)> = Vec::with_capacity(256);
        while !self.core.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut self.events, Some(TMOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("poll failed: {e}");
                break;
            }

            pending.clear();
            for ev in self.events.iter() {
                pending.push((ev.token(), ev.is_readable(), ev.is_writable()));
            }
            for &(token, readable, writable) in &pending {
                if token == CMD {
                    self.handle_commands();
                } else {
                    self.handle_conn_event(token, readable, writable);
                }
            }

            if self.sweep.fired() {
                self.sweep_expired();
                // Covers a SEND wakeup that raced the poll.
                self.drain_sendq();
            }
        }

        self.teardown();
    }

    fn handle_commands(&mut self) {
        let mut buf = [0u8; CMD_BUF_SIZE];
        while let Some((cmd, _src)) = self.cmd.recv(&mut buf) {
            match cmd {
                Command::AddSock { fd, ip } => self.adopt(fd, ip),
                Command::Send { .. } => self.drain_sendq(),
                Command::DelSock { cid } => {
                    if let Some(idx) =
                        self.conns.iter().position(|c| c.token.0 as u64 == cid)
                    {
                        debug!(cid, "closing replaced connection");
                        self.close_at(idx, CloseReason::Replaced);
                    }
                }
                other => debug!(?other, "ignoring unexpected command"),
            }
        }
    }

    fn adopt(&mut self, fd: i32, ip: String) {
        let token = Token(self.next_token);
        self.next_token += 1;
        match Connection::adopt(self.poll.registry(), fd, ip, token) {
            Ok(conn) => {
                info!(peer = %conn.peer, "client connected");
                self.stats().connections.fetch_add(1, Ordering::Relaxed);
                self.conns.push(conn);
            }
            Err(e) => warn!("couldn't adopt accepted socket: {e}"),
        }
    }

    fn handle_conn_event(&mut self, token: Token, readable: bool, writable: bool) {
        if readable && !self.read_conn(token) {
            return;
        }
        if writable &&
            let Some(idx) = self.conns.iter().position(|c| c.token == token) &&
            self.conns[idx].drain_backlog(self.poll.registry()) == ConnState::Disconnected
        {
            self.close_at(idx, CloseReason::Fault);
        }
    }

    /// Drains the socket, routing every complete frame. Returns whether the
    /// connection is still alive.
    fn read_conn(&mut self, token: Token) -> bool {
        loop {
            // The index is re-resolved every iteration: control handling may
            // close other connections and shift the vec underneath us.
            let Some(idx) = self.conns.iter().position(|c| c.token == token) else {
                return false;
            };
            let phase = self.conns[idx].phase;

            let step = {
                let tidx = self.tidx;
                match self.conns[idx].read_frame() {
                    ReadOutcome::WouldBlock => return true,
                    ReadOutcome::Closed => FrameStep::Close(CloseReason::Peer),
                    ReadOutcome::Error => FrameStep::Close(CloseReason::Fault),
                    ReadOutcome::Malformed(e) => {
                        warn!("malformed frame: {e}");
                        FrameStep::Close(CloseReason::Fault)
                    }
                    ReadOutcome::FrameDone { header, body } => {
                        self.core.recv_stats[tidx].recv_total.fetch_add(1, Ordering::Relaxed);
                        if is_ctrl(header.msg_type) {
                            parse_ctrl(header.msg_type, body, phase)
                        } else if phase != ConnPhase::Ready {
                            warn!("data frame before auth");
                            FrameStep::Close(CloseReason::Fault)
                        } else {
                            enqueue_recv(&self.core, tidx, &header, body);
                            FrameStep::Continue
                        }
                    }
                }
            };

            match step {
                FrameStep::Continue => {}
                FrameStep::Close(reason) => {
                    self.close_at(idx, reason);
                    return false;
                }
                FrameStep::Ctrl(msg) => {
                    if !self.handle_ctrl(token, msg) {
                        return false;
                    }
                }
            }
        }
    }

    fn handle_ctrl(&mut self, token: Token, msg: CtrlMsg) -> bool {
        match msg {
            CtrlMsg::Auth(req) => self.handle_auth(token, req),
            CtrlMsg::Keepalive => true,
            CtrlMsg::Sub(t) => {
                let Some(node) = self.node_of(token) else { return false };
                debug!(node, msg_type = t, "subscribe");
                self.core.subs.subscribe(t, node);
                true
            }
            CtrlMsg::Unsub(t) => {
                let Some(node) = self.node_of(token) else { return false };
                debug!(node, msg_type = t, "unsubscribe");
                self.core.subs.unsubscribe(t, node);
                true
            }
            CtrlMsg::Ping => {
                let Some(idx) = self.conns.iter().position(|c| c.token == token) else {
                    return false;
                };
                let dest = self.conns[idx].node_id;
                let pong = self.ctrl_frame(CtrlType::Pong, dest, &[]);
                if self.conns[idx].write_or_enqueue(self.poll.registry(), &pong) ==
                    ConnState::Disconnected
                {
                    self.close_at(idx, CloseReason::Fault);
                    return false;
                }
                true
            }
        }
    }

    fn handle_auth(&mut self, token: Token, req: AuthReq) -> bool {
        let authorized = self.core.conf.auth.iter().any(|a| {
            a.node_id == req.node_id && a.user == req.username && a.passwd == req.password
        });

        if !authorized {
            warn!(node = req.node_id, "authentication failed");
            let Some(idx) = self.conns.iter().position(|c| c.token == token) else {
                return false;
            };
            let nack = self.auth_ack_frame(req.node_id, AuthStatus::BadCred);
            let _ = self.conns[idx].write_or_enqueue(self.poll.registry(), &nack);
            self.close_at(idx, CloseReason::Fault);
            return false;
        }

        // One live connection per node: the fresh auth wins, the displaced
        // holder is closed (locally or via DEL_SOCK to its owner thread).
        let route = NodeRoute { tidx: self.tidx, cid: token.0 as u64 };
        if let Some(stale) = self.core.node_map.bind(req.node_id, route) &&
            stale != route
        {
            self.kick_stale(req.node_id, stale);
        }

        let Some(idx) = self.conns.iter().position(|c| c.token == token) else {
            return false;
        };
        let conn = &mut self.conns[idx];
        conn.node_id = req.node_id;
        conn.phase = ConnPhase::Ready;
        self.node_conns.insert(req.node_id, token);
        info!(node = req.node_id, peer = %conn.peer, "node authenticated");

        let ack = self.auth_ack_frame(req.node_id, AuthStatus::Ok);
        if self.conns[idx].write_or_enqueue(self.poll.registry(), &ack) ==
            ConnState::Disconnected
        {
            self.close_at(idx, CloseReason::Fault);
            return false;
        }
        true
    }

    fn kick_stale(&mut self, node: u32, stale: NodeRoute) {
        if stale.tidx == self.tidx {
            if let Some(idx) = self.conns.iter().position(|c| c.token.0 as u64 == stale.cid) {
                info!(node, "auth replaced existing connection");
                self.close_at(idx, CloseReason::Replaced);
            }
        } else {
            let dest = self.core.conf.rsvr_usck(stale.tidx);
            self.cmd.send_retry(
                &Command::DelSock { cid: stale.cid },
                &dest,
                RECV_CMD_RESND_TIMES,
            );
        }
    }

    /// Moves staged outbound frames from this thread's sendq onto the wire.
    fn drain_sendq(&mut self) {
        loop {
            let q = &self.core.sendq[self.tidx];
            let Some(slot) = q.pop() else { break };
            let (fwd, body) = q.view(&slot);
            let header = FrameHeader::express(fwd.msg_type, fwd.orig, fwd.dest, body.len());
            let frame = encode_frame(&header, body);
            let dest = fwd.dest;
            q.release(slot);

            match self.node_conns.get(&dest).copied() {
                Some(token) => {
                    if let Some(idx) = self.conns.iter().position(|c| c.token == token) {
                        if self.conns[idx].write_or_enqueue(self.poll.registry(), &frame) ==
                            ConnState::Disconnected
                        {
                            self.close_at(idx, CloseReason::Fault);
                        }
                    } else {
                        self.stats().drop_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => {
                    // Node vanished between distribution and delivery.
                    debug!(dest, "destination no longer homed here, dropping");
                    self.stats().drop_total.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        let keepalive = self.core.conf.keepalive();
        let mut i = self.conns.len();
        while i != 0 {
            i -= 1;
            if self.conns[i].expired(now, keepalive) {
                warn!(peer = %self.conns[i].peer, node = self.conns[i].node_id, "keepalive expired");
                self.close_at(i, CloseReason::Fault);
            }
        }
    }

    fn close_at(&mut self, idx: usize, reason: CloseReason) {
        let mut conn = self.conns.swap_remove(idx);
        conn.close(self.poll.registry());

        let stats = &self.core.recv_stats[self.tidx];
        stats.connections.fetch_sub(1, Ordering::Relaxed);
        if matches!(reason, CloseReason::Fault) {
            stats.err_total.fetch_add(1, Ordering::Relaxed);
        }

        if conn.node_id != 0 {
            if self.node_conns.get(&conn.node_id) == Some(&conn.token) {
                self.node_conns.remove(&conn.node_id);
            }
            let route = NodeRoute { tidx: self.tidx, cid: conn.token.0 as u64 };
            self.core.node_map.unbind_if(conn.node_id, route);
        }
    }

    fn stats(&self) -> &crate::stats::RecvStats {
        &self.core.recv_stats[self.tidx]
    }

    fn node_of(&self, token: Token) -> Option<u32> {
        self.conns.iter().find(|c| c.token == token).map(|c| c.node_id)
    }

    fn ctrl_frame(&self, ctype: CtrlType, dest: u32, body: &[u8]) -> Vec<u8> {
        let header = FrameHeader::system(ctype as u16, self.core.conf.node_id, dest, body.len());
        encode_frame(&header, body)
    }

    fn auth_ack_frame(&self, dest: u32, status: AuthStatus) -> Vec<u8> {
        let mut body = Vec::with_capacity(4);
        AuthAck { status }.encode_into(&mut body);
        self.ctrl_frame(CtrlType::AuthAck, dest, &body)
    }

    fn teardown(&mut self) {
        let mut i = self.conns.len();
        while i != 0 {
            i -= 1;
            self.close_at(i, CloseReason::Peer);
        }
        info!("receive server down");
    }
}

/// Classifies a control frame into an owned action so the connection borrow
/// can be released before the action mutates the server.
fn parse_ctrl(msg_type: u16, body: &[u8], phase: ConnPhase) -> FrameStep {
    let ctype = match CtrlType::from_u16(msg_type) {
        Ok(c) => c,
        Err(e) => {
            warn!("bad control frame: {e}");
            return FrameStep::Close(CloseReason::Fault);
        }
    };

    // An unauthenticated connection may only speak AUTH.
    if phase == ConnPhase::AuthWait && ctype != CtrlType::Auth {
        return FrameStep::Close(CloseReason::Fault);
    }

    match ctype {
        CtrlType::Auth => match AuthReq::parse(body) {
            Ok(req) => FrameStep::Ctrl(CtrlMsg::Auth(req)),
            Err(e) => {
                warn!("bad auth body: {e}");
                FrameStep::Close(CloseReason::Fault)
            }
        },
        CtrlType::Keepalive => FrameStep::Ctrl(CtrlMsg::Keepalive),
        CtrlType::Sub => match SubReq::parse(body) {
            Ok(sub) => FrameStep::Ctrl(CtrlMsg::Sub(sub.msg_type)),
            Err(e) => {
                warn!("bad sub body: {e}");
                FrameStep::Close(CloseReason::Fault)
            }
        },
        CtrlType::Unsub => match SubReq::parse(body) {
            Ok(sub) => FrameStep::Ctrl(CtrlMsg::Unsub(sub.msg_type)),
            Err(e) => {
                warn!("bad unsub body: {e}");
                FrameStep::Close(CloseReason::Fault)
            }
        },
        CtrlType::Ping => FrameStep::Ctrl(CtrlMsg::Ping),
        // The broker never expects these server-bound.
        CtrlType::AuthAck | CtrlType::Pong => FrameStep::Continue,
    }
}

/// Shard by `(type + orig)` so a fixed pair stays FIFO on one worker queue.
fn enqueue_recv(core: &RtmqCore, tidx: usize, header: &FrameHeader, body: &[u8]) {
    let shard = (header.msg_type as usize + header.orig as usize) % core.recvq.len();
    let q = &core.recvq[shard];
    let stats = &core.recv_stats[tidx];

    let Some(mut slot) = q.reserve() else {
        stats.drop_total.fetch_add(1, Ordering::Relaxed);
        return;
    };
    let fwd = ForwardHeader {
        msg_type: header.msg_type,
        orig: header.orig,
        dest: header.dest,
        length: header.length,
    };
    if q.fill(&mut slot, fwd, body).is_err() {
        q.release(slot);
        stats.drop_total.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if let Err(slot) = q.push(slot) {
        q.release(slot);
        stats.drop_total.fetch_add(1, Ordering::Relaxed);
    }
}
