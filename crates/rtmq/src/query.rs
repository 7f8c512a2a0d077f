use std::{
    fs, io,
    os::unix::net::UnixDatagram,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use crate::{
    command::{CMD_BUF_SIZE, Command},
    config::RtmqConf,
    stats::{ConfSnapshot, RecvStatSnapshot, WorkStatSnapshot},
};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

static QUERY_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Fetches the running broker's configuration echo over the local control
/// channel. Works from any process that can reach the broker's run dir.
pub fn query_conf(conf: &RtmqConf) -> io::Result<ConfSnapshot> {
    match roundtrip(conf, &Command::QueryConfReq)? {
        Command::QueryConfRep(snapshot) => Ok(snapshot),
        other => Err(unexpected(&other)),
    }
}

/// Per-receive-server counters of the running broker.
pub fn query_recv_stat(conf: &RtmqConf) -> io::Result<Vec<RecvStatSnapshot>> {
    match roundtrip(conf, &Command::QueryRecvStatReq)? {
        Command::QueryRecvStatRep(stats) => Ok(stats),
        other => Err(unexpected(&other)),
    }
}

/// Per-worker counters of the running broker.
pub fn query_work_stat(conf: &RtmqConf) -> io::Result<Vec<WorkStatSnapshot>> {
    match roundtrip(conf, &Command::QueryWorkStatReq)? {
        Command::QueryWorkStatRep(stats) => Ok(stats),
        other => Err(unexpected(&other)),
    }
}

fn roundtrip(conf: &RtmqConf, req: &Command) -> io::Result<Command> {
    let seq = QUERY_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = conf.run_dir().join(format!("cli_q_{}_{seq}.usck", std::process::id()));
    let _ = fs::remove_file(&path);

    let sock = UnixDatagram::bind(&path)?;
    let result = (|| {
        sock.set_read_timeout(Some(REPLY_TIMEOUT))?;
        sock.send_to(&req.encode(&path), conf.lsn_usck())?;
        let mut buf = [0u8; CMD_BUF_SIZE];
        let (n, _) = sock.recv_from(&mut buf)?;
        let (reply, _) = Command::decode(&buf[..n])?;
        Ok(reply)
    })();

    let _ = fs::remove_file(&path);
    result
}

fn unexpected(cmd: &Command) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("unexpected query reply: {cmd:?}"))
}
