mod command;
mod config;
mod conn;
mod context;
mod dsvr;
mod error;
mod lockfile;
mod lsn;
mod query;
mod registry;
mod routing;
mod rsvr;
mod stats;
mod timing;
mod worker;

pub use config::{AuthEntry, QueueConf, RtmqConf};
pub use context::Rtmq;
pub use error::RtmqError;
pub use query::{query_conf, query_recv_stat, query_work_stat};
pub use registry::Handler;
pub use rtmq_queue as queue;
pub use rtmq_wire as wire;
pub use stats::{ConfSnapshot, RecvStatSnapshot, WorkStatSnapshot};
pub use tracing;
