use std::{
    fs, io,
    path::{Path, PathBuf},
};

use mio::{Registry, Token, net::UnixDatagram};
use tracing::warn;

use crate::stats::{ConfSnapshot, RecvStatSnapshot, WorkStatSnapshot};

pub(crate) const CMD_BUF_SIZE: usize = 4096;

/// Control messages exchanged between broker threads (and the query client)
/// over unix datagram sockets. Every datagram carries the sender's socket
/// path so queries can be answered to the requester directly.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Command {
    /// Listener hands a freshly accepted socket to a receive server.
    AddSock { fd: i32, ip: String },
    /// Distributor staged frames on the target's sendq; `cid` is advisory.
    Send { cid: u64 },
    /// Close a connection (auth replaced it from another thread).
    DelSock { cid: u64 },
    /// Producer notify: the distributor should drain the distqs.
    DistReq,
    QueryConfReq,
    QueryConfRep(ConfSnapshot),
    QueryRecvStatReq,
    QueryRecvStatRep(Vec<RecvStatSnapshot>),
    QueryWorkStatReq,
    QueryWorkStatRep(Vec<WorkStatSnapshot>),
}

impl Command {
    fn tag(&self) -> u32 {
        match self {
            Self::AddSock { .. } => 1,
            Self::Send { .. } => 2,
            Self::DelSock { .. } => 3,
            Self::DistReq => 4,
            Self::QueryConfReq => 5,
            Self::QueryConfRep(_) => 6,
            Self::QueryRecvStatReq => 7,
            Self::QueryRecvStatRep(_) => 8,
            Self::QueryWorkStatReq => 9,
            Self::QueryWorkStatRep(_) => 10,
        }
    }

    pub fn encode(&self, src: &Path) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.tag().to_be_bytes());
        put_str(&mut out, &src.to_string_lossy());
        match self {
            Self::AddSock { fd, ip } => {
                out.extend_from_slice(&fd.to_be_bytes());
                put_str(&mut out, ip);
            }
            Self::Send { cid } | Self::DelSock { cid } => {
                out.extend_from_slice(&cid.to_be_bytes());
            }
            Self::DistReq |
            Self::QueryConfReq |
            Self::QueryRecvStatReq |
            Self::QueryWorkStatReq => {}
            Self::QueryConfRep(conf) => {
                put_str(&mut out, &conf.name);
                out.extend_from_slice(&conf.node_id.to_be_bytes());
                out.extend_from_slice(&u32::from(conf.port).to_be_bytes());
                out.extend_from_slice(&conf.recv_thd_num.to_be_bytes());
                out.extend_from_slice(&conf.work_thd_num.to_be_bytes());
                out.extend_from_slice(&conf.distq_num.to_be_bytes());
            }
            Self::QueryRecvStatRep(stats) => {
                out.extend_from_slice(&(stats.len() as u32).to_be_bytes());
                for s in stats {
                    out.extend_from_slice(&s.tidx.to_be_bytes());
                    out.extend_from_slice(&s.connections.to_be_bytes());
                    out.extend_from_slice(&s.recv_total.to_be_bytes());
                    out.extend_from_slice(&s.drop_total.to_be_bytes());
                    out.extend_from_slice(&s.err_total.to_be_bytes());
                }
            }
            Self::QueryWorkStatRep(stats) => {
                out.extend_from_slice(&(stats.len() as u32).to_be_bytes());
                for s in stats {
                    out.extend_from_slice(&s.tidx.to_be_bytes());
                    out.extend_from_slice(&s.proc_total.to_be_bytes());
                }
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> io::Result<(Self, PathBuf)> {
        let mut cur = Reader { buf, pos: 0 };
        let tag = cur.u32()?;
        let src = PathBuf::from(cur.string()?);
        let cmd = match tag {
            1 => Self::AddSock { fd: cur.u32()? as i32, ip: cur.string()? },
            2 => Self::Send { cid: cur.u64()? },
            3 => Self::DelSock { cid: cur.u64()? },
            4 => Self::DistReq,
            5 => Self::QueryConfReq,
            6 => Self::QueryConfRep(ConfSnapshot {
                name: cur.string()?,
                node_id: cur.u32()?,
                port: cur.u32()? as u16,
                recv_thd_num: cur.u32()?,
                work_thd_num: cur.u32()?,
                distq_num: cur.u32()?,
            }),
            7 => Self::QueryRecvStatReq,
            8 => {
                let n = cur.u32()? as usize;
                let mut stats = Vec::with_capacity(n);
                for _ in 0..n {
                    stats.push(RecvStatSnapshot {
                        tidx: cur.u32()?,
                        connections: cur.u32()?,
                        recv_total: cur.u64()?,
                        drop_total: cur.u64()?,
                        err_total: cur.u64()?,
                    });
                }
                Self::QueryRecvStatRep(stats)
            }
            9 => Self::QueryWorkStatReq,
            10 => {
                let n = cur.u32()? as usize;
                let mut stats = Vec::with_capacity(n);
                for _ in 0..n {
                    stats.push(WorkStatSnapshot { tidx: cur.u32()?, proc_total: cur.u64()? });
                }
                Self::QueryWorkStatRep(stats)
            }
            other => return Err(bad_cmd(format!("unknown command tag {other}"))),
        };
        Ok((cmd, src))
    }
}

/// Bound unix datagram socket of one broker thread.
pub(crate) struct CmdSock {
    sock: UnixDatagram,
    path: PathBuf,
}

impl CmdSock {
    pub fn bind(path: PathBuf) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // A previous unclean shutdown may have left the socket file behind.
        let _ = fs::remove_file(&path);
        let sock = UnixDatagram::bind(&path)?;
        Ok(Self { sock, path })
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.sock, token, mio::Interest::READABLE)
    }

    /// Drains one well-formed command, skipping over undecodable datagrams.
    pub fn recv(&self, buf: &mut [u8]) -> Option<(Command, PathBuf)> {
        loop {
            match self.sock.recv_from(buf) {
                Ok((n, _)) => match Command::decode(&buf[..n]) {
                    Ok(decoded) => return Some(decoded),
                    Err(e) => {
                        warn!(path = %self.path.display(), "dropping bad command: {e}");
                    }
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) => {
                    warn!(path = %self.path.display(), "command recv failed: {e}");
                    return None;
                }
            }
        }
    }

    pub fn send_to(&self, cmd: &Command, dest: &Path) -> io::Result<()> {
        let bytes = cmd.encode(&self.path);
        let n = self.sock.send_to(&bytes, dest)?;
        if n != bytes.len() {
            return Err(bad_cmd(format!("short command send: {n}/{}", bytes.len())));
        }
        Ok(())
    }

    /// Bounded-retry send; commands between threads are expected to succeed
    /// since both endpoints are local and already bound.
    pub fn send_retry(&self, cmd: &Command, dest: &Path, tries: usize) -> bool {
        for attempt in 1..=tries {
            match self.send_to(cmd, dest) {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        dest = %dest.display(),
                        attempt,
                        "command send failed: {e}"
                    );
                }
            }
        }
        false
    }
}

fn bad_cmd(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn bytes(&mut self, n: usize) -> io::Result<&[u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(bad_cmd("truncated command".into()));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> io::Result<u64> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> io::Result<String> {
        let len = self.u32()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| bad_cmd("command string not utf-8".into()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codec_roundtrips() {
        let src = Path::new("./tmp/t/lsn.usck");
        let cmds = [
            Command::AddSock { fd: 42, ip: "127.0.0.1:5000".into() },
            Command::Send { cid: 7 },
            Command::DelSock { cid: 9 },
            Command::DistReq,
            Command::QueryConfReq,
            Command::QueryConfRep(ConfSnapshot {
                name: "t".into(),
                node_id: 3,
                port: 9100,
                recv_thd_num: 2,
                work_thd_num: 2,
                distq_num: 1,
            }),
            Command::QueryRecvStatReq,
            Command::QueryRecvStatRep(vec![RecvStatSnapshot {
                tidx: 0,
                connections: 2,
                recv_total: 10,
                drop_total: 1,
                err_total: 0,
            }]),
            Command::QueryWorkStatReq,
            Command::QueryWorkStatRep(vec![WorkStatSnapshot { tidx: 1, proc_total: 55 }]),
        ];
        for cmd in cmds {
            let bytes = cmd.encode(src);
            let (back, from) = Command::decode(&bytes).unwrap();
            assert_eq!(back, cmd);
            assert_eq!(from, src);
        }
    }

    #[test]
    fn truncated_rejected() {
        let bytes = Command::Send { cid: 7 }.encode(Path::new("x"));
        for cut in 0..bytes.len() {
            assert!(Command::decode(&bytes[..cut]).is_err());
        }
    }
}
