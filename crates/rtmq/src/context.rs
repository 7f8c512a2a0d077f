use std::{
    fs, io,
    net::SocketAddr,
    os::unix::net::UnixDatagram,
    path::PathBuf,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
};

use rand::Rng;
use rtmq_queue::{ForwardHeader, SlabQueue};
use tracing::{debug, info};

use crate::{
    command::{CmdSock, Command},
    config::RtmqConf,
    dsvr::Distributor,
    error::RtmqError,
    lockfile::ServerLock,
    lsn::Listener,
    registry::{Handler, HandlerRegistry},
    routing::{NodeMap, SubTable},
    rsvr::Rsvr,
    stats::{RecvStats, WorkStats},
    worker::Worker,
};

/// Everything shared across broker threads. Immutable after `launch` except
/// through the interior synchronization of each member.
pub(crate) struct RtmqCore {
    pub conf: RtmqConf,
    pub registry: OnceLock<HandlerRegistry>,
    pub recvq: Vec<SlabQueue>,
    pub sendq: Vec<SlabQueue>,
    pub distq: Vec<SlabQueue>,
    pub node_map: NodeMap,
    pub subs: SubTable,
    pub recv_stats: Vec<RecvStats>,
    pub work_stats: Vec<WorkStats>,
    pub stop: AtomicBool,
    pub dist_drop: AtomicU64,
}

/// The broker. `init` allocates every resource, `register` installs the
/// message handlers, `launch` spawns the thread pools, `destroy` joins them
/// and releases everything.
pub struct Rtmq {
    core: Arc<RtmqCore>,
    /// Present until `launch` freezes it into the core.
    registry: Option<HandlerRegistry>,
    _lock: ServerLock,

    lsn_sock: Option<mio::net::TcpListener>,
    lsn_cmd: Option<CmdSock>,
    rsvr_cmds: Vec<CmdSock>,
    worker_cmds: Vec<CmdSock>,
    dsvr_cmd: Option<CmdSock>,

    /// Producer-side command socket for coalesced DIST_REQ notifies.
    cli: UnixDatagram,
    cli_path: PathBuf,
    cmd_lock: spin::Mutex<()>,

    threads: Vec<JoinHandle<()>>,
}

impl Rtmq {
    /// Validates the configuration and allocates every broker resource:
    /// the run-dir lock, the TCP listening socket, all command sockets and
    /// all queues. Any failure here is fatal for the embedding process.
    pub fn init(conf: RtmqConf) -> Result<Self, RtmqError> {
        conf.validate()?;
        fs::create_dir_all(conf.run_dir())?;
        let lock = ServerLock::acquire(&conf.lock_path())?;

        let cli_path = conf.cli_usck();
        let _ = fs::remove_file(&cli_path);
        let cli = UnixDatagram::bind(&cli_path)?;
        cli.set_nonblocking(true)?;

        let addr = SocketAddr::from(([0, 0, 0, 0], conf.port));
        let lsn_sock = mio::net::TcpListener::bind(addr)?;

        let lsn_cmd = CmdSock::bind(conf.lsn_usck())?;
        let rsvr_cmds = (0..conf.recv_thd_num)
            .map(|i| CmdSock::bind(conf.rsvr_usck(i)))
            .collect::<io::Result<Vec<_>>>()?;
        let worker_cmds = (0..conf.work_thd_num)
            .map(|i| CmdSock::bind(conf.worker_usck(i)))
            .collect::<io::Result<Vec<_>>>()?;
        let dsvr_cmd = CmdSock::bind(conf.dsvr_usck())?;

        let recvq = (0..conf.recvq_num())
            .map(|_| SlabQueue::with_capacity(conf.recvq.max, conf.recvq.size))
            .collect::<Result<Vec<_>, _>>()?;
        let sendq = (0..conf.recv_thd_num)
            .map(|_| SlabQueue::with_capacity(conf.sendq.max, conf.sendq.size))
            .collect::<Result<Vec<_>, _>>()?;
        let distq = (0..conf.distq_num)
            .map(|_| SlabQueue::with_capacity(conf.sendq.max, conf.sendq.size))
            .collect::<Result<Vec<_>, _>>()?;

        let recv_stats = (0..conf.recv_thd_num).map(|_| RecvStats::default()).collect();
        let work_stats = (0..conf.work_thd_num).map(|_| WorkStats::default()).collect();

        info!(name = %conf.name, node_id = conf.node_id, port = conf.port, "broker initialized");

        let core = Arc::new(RtmqCore {
            conf,
            registry: OnceLock::new(),
            recvq,
            sendq,
            distq,
            node_map: NodeMap::default(),
            subs: SubTable::default(),
            recv_stats,
            work_stats,
            stop: AtomicBool::new(false),
            dist_drop: AtomicU64::new(0),
        });

        Ok(Self {
            core,
            registry: Some(HandlerRegistry::default()),
            _lock: lock,
            lsn_sock: Some(lsn_sock),
            lsn_cmd: Some(lsn_cmd),
            rsvr_cmds,
            worker_cmds,
            dsvr_cmd: Some(dsvr_cmd),
            cli,
            cli_path,
            cmd_lock: spin::Mutex::new(()),
            threads: Vec::new(),
        })
    }

    /// Installs the handler for one application message type. Allowed only
    /// before `launch`; repeat registration for a type is an error.
    pub fn register<F>(&mut self, msg_type: u16, handler: F) -> Result<(), RtmqError>
    where
        F: Fn(u16, u32, &[u8]) + Send + Sync + 'static,
    {
        let Some(reg) = self.registry.as_mut() else {
            return Err(RtmqError::Config("registration is closed after launch"));
        };
        reg.register(msg_type, Box::new(handler) as Handler)
    }

    /// Freezes the registry and spawns the fixed thread pools: one listener,
    /// `recv_thd_num` receive servers, `work_thd_num` workers, one
    /// distributor.
    pub fn launch(&mut self) -> Result<(), RtmqError> {
        let Some(reg) = self.registry.take() else {
            return Err(RtmqError::Config("broker already launched"));
        };
        let _ = self.core.registry.set(reg);

        let lsn_sock =
            self.lsn_sock.take().ok_or(RtmqError::Config("broker already launched"))?;
        let lsn_cmd = self.lsn_cmd.take().ok_or(RtmqError::Config("broker already launched"))?;
        let dsvr_cmd =
            self.dsvr_cmd.take().ok_or(RtmqError::Config("broker already launched"))?;

        let lsn = Listener::new(lsn_sock, lsn_cmd, Arc::clone(&self.core))?;
        let rsvrs = self
            .rsvr_cmds
            .drain(..)
            .enumerate()
            .map(|(tidx, cmd)| Rsvr::new(tidx, cmd, Arc::clone(&self.core)))
            .collect::<io::Result<Vec<_>>>()?;
        let workers = self
            .worker_cmds
            .drain(..)
            .enumerate()
            .map(|(tidx, cmd)| Worker::new(tidx, cmd, Arc::clone(&self.core)))
            .collect::<io::Result<Vec<_>>>()?;
        let dsvr = Distributor::new(dsvr_cmd, Arc::clone(&self.core))?;

        self.threads.push(spawn_named("rtmq-lsn".into(), move || lsn.run())?);
        for (tidx, rsvr) in rsvrs.into_iter().enumerate() {
            self.threads.push(spawn_named(format!("rtmq-rsvr-{tidx}"), move || rsvr.run())?);
        }
        for (tidx, worker) in workers.into_iter().enumerate() {
            self.threads.push(spawn_named(format!("rtmq-worker-{tidx}"), move || worker.run())?);
        }
        self.threads.push(spawn_named("rtmq-dsvr".into(), move || dsvr.run())?);

        info!("broker launched");
        Ok(())
    }

    /// Queues one outbound message towards `dest` (0 = broadcast to the
    /// subscribers of `msg_type`) and notifies the distributor. Never
    /// blocks: a full distq drops at source and reports `QueueFull`.
    pub fn async_send(&self, msg_type: u16, dest: u32, data: &[u8]) -> Result<(), RtmqError> {
        let core = &self.core;
        let idx = rand::rng().random_range(0..core.distq.len());
        let q = &core.distq[idx];

        let Some(mut slot) = q.reserve() else {
            core.dist_drop.fetch_add(1, Ordering::Relaxed);
            return Err(RtmqError::QueueFull);
        };
        let fwd = ForwardHeader {
            msg_type,
            orig: core.conf.node_id,
            dest,
            length: data.len() as u32,
        };
        if let Err(e) = q.fill(&mut slot, fwd, data) {
            q.release(slot);
            return Err(e.into());
        }
        if let Err(slot) = q.push(slot) {
            q.release(slot);
            core.dist_drop.fetch_add(1, Ordering::Relaxed);
            return Err(RtmqError::QueueFull);
        }

        self.notify_dist();
        Ok(())
    }

    /// Coalesced wakeup: if another producer holds the lock, its in-flight
    /// notify covers the item just queued and this call returns immediately.
    fn notify_dist(&self) {
        let Some(_guard) = self.cmd_lock.try_lock() else { return };
        let bytes = Command::DistReq.encode(&self.cli_path);
        if let Err(e) = self.cli.send_to(&bytes, self.core.conf.dsvr_usck()) {
            debug!("dist notify failed: {e}");
        }
    }

    /// Stops and joins every thread, then removes the control sockets.
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.threads.is_empty() && self.core.stop.load(Ordering::Relaxed) {
            return;
        }
        self.core.stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }

        let conf = &self.core.conf;
        let _ = fs::remove_file(conf.lsn_usck());
        for i in 0..conf.recv_thd_num {
            let _ = fs::remove_file(conf.rsvr_usck(i));
        }
        for i in 0..conf.work_thd_num {
            let _ = fs::remove_file(conf.worker_usck(i));
        }
        let _ = fs::remove_file(conf.dsvr_usck());
        let _ = fs::remove_file(&self.cli_path);
        info!("broker stopped");
    }
}

impl Drop for Rtmq {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_named<F>(name: String, body: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new().name(name).spawn(body)
}
