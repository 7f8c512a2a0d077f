use std::{
    io,
    os::fd::IntoRawFd,
    sync::{Arc, atomic::Ordering},
};

use mio::{Events, Interest, Poll, Token, net::TcpListener};
use tracing::{Level, debug, error, info, span, warn};

use crate::{
    command::{CMD_BUF_SIZE, CmdSock, Command},
    config::{RECV_CMD_RESND_TIMES, TMOUT},
    context::RtmqCore,
    stats::ConfSnapshot,
};

const CMD: Token = Token(0);
const LSN: Token = Token(1);

/// Accept thread: owns the TCP listening socket, hands every accepted
/// connection to a receive server round-robin, and answers the QUERY_*
/// commands on behalf of the whole broker.
pub(crate) struct Listener {
    poll: Poll,
    events: Events,
    lsn: TcpListener,
    cmd: CmdSock,
    accept_total: usize,
    core: Arc<RtmqCore>,
}

impl Listener {
    pub fn new(mut lsn: TcpListener, mut cmd: CmdSock, core: Arc<RtmqCore>) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry().register(&mut lsn, LSN, Interest::READABLE)?;
        cmd.register(poll.registry(), CMD)?;
        Ok(Self { poll, events: Events::with_capacity(64), lsn, cmd, accept_total: 0, core })
    }

    pub fn run(mut self) {
        let _span = span!(Level::INFO, "lsn").entered();
        info!(port = self.core.conf.port, "listener up");

        while !self.core.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut self.events, Some(TMOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("poll failed: {e}");
                break;
            }

            let mut accept = false;
            let mut commands = false;
            for ev in self.events.iter() {
                match ev.token() {
                    LSN => accept = true,
                    CMD => commands = true,
                    _ => {}
                }
            }
            if accept {
                self.accept_pending();
            }
            if commands {
                self.handle_queries();
            }
        }

        info!("listener down");
    }

    fn accept_pending(&mut self) {
        loop {
            match self.lsn.accept() {
                Ok((stream, addr)) => {
                    let tidx = self.accept_total % self.core.conf.recv_thd_num;
                    self.accept_total += 1;

                    let fd = stream.into_raw_fd();
                    let cmd = Command::AddSock { fd, ip: addr.to_string() };
                    let dest = self.core.conf.rsvr_usck(tidx);
                    if self.cmd.send_retry(&cmd, &dest, RECV_CMD_RESND_TIMES) {
                        debug!(%addr, tidx, "connection handed off");
                    } else {
                        error!(%addr, "handoff failed, closing accepted socket");
                        unsafe { libc::close(fd) };
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_queries(&mut self) {
        let mut buf = [0u8; CMD_BUF_SIZE];
        while let Some((cmd, src)) = self.cmd.recv(&mut buf) {
            let reply = match cmd {
                Command::QueryConfReq => {
                    let conf = &self.core.conf;
                    Some(Command::QueryConfRep(ConfSnapshot {
                        name: conf.name.clone(),
                        node_id: conf.node_id,
                        port: conf.port,
                        recv_thd_num: conf.recv_thd_num as u32,
                        work_thd_num: conf.work_thd_num as u32,
                        distq_num: conf.distq_num as u32,
                    }))
                }
                Command::QueryRecvStatReq => Some(Command::QueryRecvStatRep(
                    self.core
                        .recv_stats
                        .iter()
                        .enumerate()
                        .map(|(tidx, s)| s.snapshot(tidx as u32))
                        .collect(),
                )),
                Command::QueryWorkStatReq => Some(Command::QueryWorkStatRep(
                    self.core
                        .work_stats
                        .iter()
                        .enumerate()
                        .map(|(tidx, s)| s.snapshot(tidx as u32))
                        .collect(),
                )),
                other => {
                    debug!(?other, "ignoring unexpected command");
                    None
                }
            };
            if let Some(reply) = reply &&
                let Err(e) = self.cmd.send_to(&reply, &src)
            {
                warn!(src = %src.display(), "query reply failed: {e}");
            }
        }
    }
}
