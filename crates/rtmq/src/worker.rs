use std::{
    io,
    sync::{Arc, atomic::Ordering},
};

use mio::{Events, Poll, Token};
use tracing::{Level, debug, error, info, span};

use crate::{
    command::{CMD_BUF_SIZE, CmdSock},
    config::{TMOUT, WORKER_HDL_QNUM},
    context::RtmqCore,
};

const CMD: Token = Token(0);

/// Worker thread: on every tick drains its assigned recvq shards to empty
/// and dispatches each payload to the registered handler. The command socket
/// is a second wake source, currently control-only.
pub(crate) struct Worker {
    tidx: usize,
    poll: Poll,
    events: Events,
    cmd: CmdSock,
    core: Arc<RtmqCore>,
}

impl Worker {
    pub fn new(tidx: usize, mut cmd: CmdSock, core: Arc<RtmqCore>) -> io::Result<Self> {
        let poll = Poll::new()?;
        cmd.register(poll.registry(), CMD)?;
        Ok(Self { tidx, poll, events: Events::with_capacity(8), cmd, core })
    }

    pub fn run(mut self) {
        let _span = span!(Level::INFO, "worker", tidx = self.tidx).entered();
        info!("worker up");

        let first_shard = self.tidx * WORKER_HDL_QNUM;
        while !self.core.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut self.events, Some(TMOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("poll failed: {e}");
                break;
            }

            if !self.events.is_empty() {
                let mut buf = [0u8; CMD_BUF_SIZE];
                while let Some((cmd, _)) = self.cmd.recv(&mut buf) {
                    debug!(?cmd, "ignoring command");
                }
            }

            self.drain_shards(first_shard);
        }

        info!("worker down");
    }

    /// Drain-to-empty keeps throughput independent of the tick rate: a
    /// burst that arrived during one interval is fully consumed in one pass.
    fn drain_shards(&self, first_shard: usize) {
        let registry = self.core.registry.get();
        let stats = &self.core.work_stats[self.tidx];

        for shard in first_shard..first_shard + WORKER_HDL_QNUM {
            let q = &self.core.recvq[shard];
            while let Some(slot) = q.pop() {
                let (fwd, body) = q.view(&slot);
                if let Some(reg) = registry {
                    reg.dispatch(fwd.msg_type, fwd.orig, body);
                }
                q.release(slot);
                stats.proc_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
