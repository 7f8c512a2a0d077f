use std::{
    io,
    sync::{Arc, atomic::Ordering},
};

use mio::{Events, Poll, Token};
use rtmq_queue::ForwardHeader;
use tracing::{Level, debug, error, info, span};

use crate::{
    command::{CMD_BUF_SIZE, CmdSock, Command},
    config::{RECV_CMD_RESND_TIMES, TMOUT},
    context::RtmqCore,
};

const CMD: Token = Token(0);

/// Distributor thread: drains the outbound distq shards on DIST_REQ or on
/// its poll tick, resolves each item's destination through the node map (or
/// the subscription table for `dest == 0`), stages copies on the owning
/// receive server's sendq and wakes it with a SEND command.
pub(crate) struct Distributor {
    poll: Poll,
    events: Events,
    cmd: CmdSock,
    core: Arc<RtmqCore>,
}

impl Distributor {
    pub fn new(mut cmd: CmdSock, core: Arc<RtmqCore>) -> io::Result<Self> {
        let poll = Poll::new()?;
        cmd.register(poll.registry(), CMD)?;
        Ok(Self { poll, events: Events::with_capacity(8), cmd, core })
    }

    pub fn run(mut self) {
        let _span = span!(Level::INFO, "dsvr").entered();
        info!("distributor up");

        let mut touched = vec![false; self.core.conf.recv_thd_num];
        while !self.core.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut self.events, Some(TMOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("poll failed: {e}");
                break;
            }

            if !self.events.is_empty() {
                // Producer notifies are coalesced; one datagram may stand
                // for many enqueues and the pass below picks them all up.
                let mut buf = [0u8; CMD_BUF_SIZE];
                while let Some((cmd, _)) = self.cmd.recv(&mut buf) {
                    if !matches!(cmd, Command::DistReq) {
                        debug!(?cmd, "ignoring unexpected command");
                    }
                }
            }

            self.distribute(&mut touched);
        }

        info!("distributor down");
    }

    fn distribute(&self, touched: &mut [bool]) {
        touched.fill(false);

        for q in &self.core.distq {
            while let Some(slot) = q.pop() {
                let (fwd, body) = q.view(&slot);
                if fwd.dest != 0 {
                    self.stage(fwd, body, touched);
                } else {
                    // Broadcast: one copy per subscriber of this type.
                    for node in self.core.subs.subscribers(fwd.msg_type) {
                        let fanned = ForwardHeader { dest: node, ..fwd };
                        self.stage(fanned, body, touched);
                    }
                }
                q.release(slot);
            }
        }

        for (tidx, hit) in touched.iter().enumerate() {
            if *hit {
                self.cmd.send_retry(
                    &Command::Send { cid: 0 },
                    &self.core.conf.rsvr_usck(tidx),
                    RECV_CMD_RESND_TIMES,
                );
            }
        }
    }

    /// Copies one outbound item onto the sendq of the rsvr owning `dest`.
    fn stage(&self, fwd: ForwardHeader, body: &[u8], touched: &mut [bool]) {
        let Some(route) = self.core.node_map.resolve(fwd.dest) else {
            debug!(dest = fwd.dest, "destination not connected, dropping");
            self.core.dist_drop.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let sq = &self.core.sendq[route.tidx];
        let drops = &self.core.recv_stats[route.tidx].drop_total;
        let Some(mut slot) = sq.reserve() else {
            drops.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if sq.fill(&mut slot, fwd, body).is_err() {
            sq.release(slot);
            drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match sq.push(slot) {
            Ok(()) => touched[route.tidx] = true,
            Err(slot) => {
                sq.release(slot);
                drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
