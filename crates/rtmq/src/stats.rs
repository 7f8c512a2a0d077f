use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Per-receive-server counters, shared with the listener for QUERY replies.
#[derive(Debug, Default)]
pub(crate) struct RecvStats {
    pub connections: AtomicU32,
    pub recv_total: AtomicU64,
    pub drop_total: AtomicU64,
    pub err_total: AtomicU64,
}

impl RecvStats {
    pub fn snapshot(&self, tidx: u32) -> RecvStatSnapshot {
        RecvStatSnapshot {
            tidx,
            connections: self.connections.load(Ordering::Relaxed),
            recv_total: self.recv_total.load(Ordering::Relaxed),
            drop_total: self.drop_total.load(Ordering::Relaxed),
            err_total: self.err_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct WorkStats {
    pub proc_total: AtomicU64,
}

impl WorkStats {
    pub fn snapshot(&self, tidx: u32) -> WorkStatSnapshot {
        WorkStatSnapshot { tidx, proc_total: self.proc_total.load(Ordering::Relaxed) }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecvStatSnapshot {
    pub tidx: u32,
    pub connections: u32,
    pub recv_total: u64,
    pub drop_total: u64,
    pub err_total: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkStatSnapshot {
    pub tidx: u32,
    pub proc_total: u64,
}

/// Config echo returned by QUERY_CONF.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfSnapshot {
    pub name: String,
    pub node_id: u32,
    pub port: u16,
    pub recv_thd_num: u32,
    pub work_thd_num: u32,
    pub distq_num: u32,
}
