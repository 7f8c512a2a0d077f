use std::{
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::RtmqError;

/// Recv-queue shards handled by one worker thread.
pub(crate) const WORKER_HDL_QNUM: usize = 4;
/// Bounded retries for inter-thread command sends before giving up.
pub(crate) const RECV_CMD_RESND_TIMES: usize = 3;
/// Poll timeout of every thread loop; bounds shutdown latency and sets the
/// keepalive sweep / worker tick resolution.
pub(crate) const TMOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QueueConf {
    pub max: usize,
    pub size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthEntry {
    pub node_id: u32,
    pub user: String,
    pub passwd: String,
}

/// Broker configuration, built by the embedding application.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RtmqConf {
    pub name: String,
    pub node_id: u32,
    pub port: u16,
    pub recv_thd_num: usize,
    pub work_thd_num: usize,
    pub distq_num: usize,
    pub recvq: QueueConf,
    pub sendq: QueueConf,
    pub keepalive_sec: u64,
    pub auth: Vec<AuthEntry>,
}

impl Default for RtmqConf {
    fn default() -> Self {
        Self {
            name: String::new(),
            node_id: 1,
            port: 0,
            recv_thd_num: 2,
            work_thd_num: 2,
            distq_num: 2,
            recvq: QueueConf { max: 1024, size: 4096 },
            sendq: QueueConf { max: 1024, size: 4096 },
            keepalive_sec: 30,
            auth: Vec::new(),
        }
    }
}

impl RtmqConf {
    pub(crate) fn validate(&self) -> Result<(), RtmqError> {
        if self.name.is_empty() {
            return Err(RtmqError::Config("name must not be empty"));
        }
        if self.node_id == 0 {
            return Err(RtmqError::Config("node_id 0 is reserved for broadcast"));
        }
        if self.recv_thd_num == 0 || self.work_thd_num == 0 || self.distq_num == 0 {
            return Err(RtmqError::Config("thread and queue counts must be non-zero"));
        }
        if self.recvq.max == 0 || self.recvq.size == 0 || self.sendq.max == 0 ||
            self.sendq.size == 0
        {
            return Err(RtmqError::Config("queue dimensions must be non-zero"));
        }
        if self.keepalive_sec == 0 {
            return Err(RtmqError::Config("keepalive_sec must be non-zero"));
        }
        Ok(())
    }

    pub(crate) fn recvq_num(&self) -> usize {
        self.work_thd_num * WORKER_HDL_QNUM
    }

    pub(crate) fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_sec)
    }

    /// All sockets and the lock file live under `./tmp/<name>/`.
    pub fn run_dir(&self) -> PathBuf {
        PathBuf::from("./tmp").join(&self.name)
    }

    pub fn lsn_usck(&self) -> PathBuf {
        self.run_dir().join("lsn.usck")
    }

    pub fn rsvr_usck(&self, tidx: usize) -> PathBuf {
        self.run_dir().join(format!("rsvr_{tidx}.usck"))
    }

    pub fn worker_usck(&self, tidx: usize) -> PathBuf {
        self.run_dir().join(format!("worker_{tidx}.usck"))
    }

    pub fn dsvr_usck(&self) -> PathBuf {
        self.run_dir().join("dsvr.usck")
    }

    pub(crate) fn cli_usck(&self) -> PathBuf {
        self.run_dir().join("cli.usck")
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.run_dir().join("server.lock")
    }
}
