//! The virtual device engine.
//!
//! One thread per process owns a listen socket and every peer socket,
//! and drives them from a single epoll loop. Work requests arrive either
//! from in-process producers (loopback connections, `Post*` opcodes) or
//! from peer devices (`Request*`/`Response*`/`Notification*` opcodes).
//!
//! Outbound work discovered while handling a message goes through the
//! delayed FIFO: each loop tick scans it and, for every entry whose
//! target write half is idle, writes the header (and, for inlined
//! operations, the payload) and arms `EPOLLOUT` for streaming payloads.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::socket::{self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn};
use tracing::{debug, error, info, warn};

use hydra_wire::sn::HostRecord;
use hydra_wire::wr::{Opcode, WcOpcode, WorkCompletion, WorkRequest, WR_SIZE};
use hydra_wire::{CQ_NONE, MAX_QUEUES};

use crate::conn::{ConnState, ReadDest, ReadState, WriteSrc, WriteState};
use crate::cq::{CqTable, PassiveChannel};
use crate::inline::InlineSlab;
use crate::mem::MemRegistry;
use crate::queue::Queue;
use crate::{Cq, DevError};

/// Epoll token of the listen socket.
const LISTENER_TOKEN: u64 = u64::MAX;

/// How long one epoll wait may block; bounds delayed-queue latency.
const WAIT_MS: u16 = 500;

/// Chunk size for payload shuttling between sockets and regions.
const CHUNK_SIZE: usize = 64 * 1024;

/// Static description of the job the device participates in.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub rank: u16,
    pub tnc: u16,
    /// One record per rank: hostname plus port offset.
    pub hosts: Vec<HostRecord>,
    /// Base port; a rank's device listens on `dev_port + its offset`.
    pub dev_port: u16,
    pub conn_timeout: Duration,
}

impl DeviceConfig {
    fn port_of(&self, rank: u16) -> u16 {
        self.dev_port + u16::from(self.hosts[rank as usize].port_offset)
    }
}

/// Handle to a running device thread.
///
/// Owns the completion-queue table, the registered-memory table and the
/// inline-buffer slab shared with the engine. Dropping the handle stops
/// the device.
pub struct DeviceHandle {
    rank: u16,
    local_port: u16,
    cqs: Arc<CqTable>,
    registry: Arc<MemRegistry>,
    slab: Arc<InlineSlab>,
    queue_count: AtomicU32,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeviceHandle {
    pub fn rank(&self) -> u16 {
        self.rank
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn registry(&self) -> &Arc<MemRegistry> {
        &self.registry
    }

    /// Create a completion queue; `passive` attaches a wake pipe for
    /// blocking receive consumers.
    pub fn create_cq(&self, depth: usize, passive: bool) -> Result<Arc<Cq>, DevError> {
        let pchannel = if passive {
            Some(PassiveChannel::new()?)
        } else {
            None
        };
        self.cqs.create(depth, pchannel)
    }

    pub fn destroy_cq(&self, handle: u32) {
        self.cqs.destroy(handle);
    }

    /// Open a new work queue into the device.
    pub fn create_queue(&self) -> Result<Queue, DevError> {
        let num = self.queue_count.fetch_add(1, Ordering::Relaxed);
        if num as usize >= MAX_QUEUES + 1 {
            self.queue_count.fetch_sub(1, Ordering::Relaxed);
            return Err(DevError::TooManyCqs);
        }

        let stream = TcpStream::connect(("127.0.0.1", self.local_port))?;
        stream.set_nodelay(true)?;
        Ok(Queue::new(num, self.rank, stream, self.slab.clone()))
    }

    /// Ask the device loop to terminate and wait for it.
    pub fn stop(&mut self) -> Result<(), DevError> {
        if let Some(thread) = self.thread.take() {
            let mut wr = WorkRequest::new(Opcode::StopDevice);
            wr.source = self.rank;
            wr.target = self.rank;

            match TcpStream::connect(("127.0.0.1", self.local_port)) {
                Ok(mut stream) => {
                    let _ = stream.write_all(&wr.to_bytes());
                }
                Err(e) => warn!("stop: could not reach local device: {e}"),
            }
            let _ = thread.join();
        }
        Ok(())
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// The device: spawns the engine thread.
pub struct Device;

impl Device {
    /// Bind the device port and start the engine thread. Rank 0 connects
    /// outward to every higher rank immediately; other ranks connect when
    /// the master's registration arrives.
    pub fn spawn(cfg: DeviceConfig) -> Result<DeviceHandle, DevError> {
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

        let local_port = cfg.port_of(cfg.rank);
        let listener = bind_listener(local_port)?;

        let cqs = Arc::new(CqTable::new());
        let registry = Arc::new(MemRegistry::new());
        let slab = Arc::new(InlineSlab::new());

        let engine_cqs = cqs.clone();
        let engine_registry = registry.clone();
        let engine_slab = slab.clone();
        let rank = cfg.rank;

        let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(DevError::Os)?;

        let thread = std::thread::Builder::new()
            .name(format!("hydra-dev-{rank}"))
            .spawn(move || {
                let mut engine =
                    Engine::new(cfg, epoll, listener, engine_cqs, engine_registry, engine_slab);
                if let Err(e) = engine.run() {
                    error!("device loop failed: {e}");
                }
            })
            .map_err(DevError::Io)?;

        Ok(DeviceHandle {
            rank,
            local_port,
            cqs,
            registry,
            slab,
            queue_count: AtomicU32::new(0),
            thread: Some(thread),
        })
    }
}

fn bind_listener(port: u16) -> Result<TcpListener, DevError> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(DevError::Os)?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(DevError::Os)?;

    let addr = SockaddrIn::new(0, 0, 0, 0, port);
    socket::bind(fd.as_raw_fd(), &addr).map_err(|_| DevError::Bind(port))?;
    socket::listen(&fd, Backlog::MAXCONN).map_err(|_| DevError::Bind(port))?;

    let listener = TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn connect_with_deadline(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, DevError> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect((host, port)) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                warn!("connect to {host}:{port} failed: {e}");
                return Err(DevError::Connect { rank: 0, port });
            }
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Engine {
    cfg: DeviceConfig,
    epoll: Epoll,
    listener: TcpListener,
    conns: Vec<Option<ConnState>>,
    /// rank -> connection slot, once registered.
    rank_conn: Vec<Option<usize>>,
    delayed: VecDeque<WorkRequest>,
    recv_list: Vec<WorkRequest>,
    connected_all: bool,
    cqs: Arc<CqTable>,
    registry: Arc<MemRegistry>,
    slab: Arc<InlineSlab>,
    chunk: Vec<u8>,
}

impl Engine {
    fn new(
        cfg: DeviceConfig,
        epoll: Epoll,
        listener: TcpListener,
        cqs: Arc<CqTable>,
        registry: Arc<MemRegistry>,
        slab: Arc<InlineSlab>,
    ) -> Self {
        let tnc = cfg.tnc as usize;
        Self {
            cfg,
            epoll,
            listener,
            conns: Vec::new(),
            rank_conn: vec![None; tnc],
            delayed: VecDeque::new(),
            recv_list: Vec::new(),
            connected_all: false,
            cqs,
            registry,
            slab,
            chunk: vec![0u8; CHUNK_SIZE],
        }
    }

    fn run(&mut self) -> Result<(), DevError> {
        self.epoll
            .add(
                self.listener.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, LISTENER_TOKEN),
            )
            .map_err(DevError::Os)?;

        if self.cfg.rank == 0 && self.cfg.tnc > 1 {
            self.connect_all()?;
        }

        info!(
            rank = self.cfg.rank,
            port = self.cfg.port_of(self.cfg.rank),
            "device ready"
        );

        let mut events = [EpollEvent::empty(); 64];
        loop {
            let n = match self.epoll.wait(&mut events, EpollTimeout::from(WAIT_MS)) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => 0,
                Err(e) => return Err(DevError::Os(e)),
            };

            for ev in events.iter().take(n) {
                let token = ev.data();
                let flags = ev.events();

                if token == LISTENER_TOKEN {
                    self.accept_new();
                    continue;
                }

                let slot = token as usize;
                if self.conns.get(slot).map(|c| c.is_none()).unwrap_or(true) {
                    continue;
                }

                let io_err = flags.intersects(
                    EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP,
                );

                if io_err {
                    self.teardown(slot);
                    continue;
                }

                if flags.contains(EpollFlags::EPOLLIN) {
                    match self.drain_read(slot) {
                        Ok(Flow::Stop) => return self.cleanup(),
                        Ok(Flow::Continue) => {}
                        Err(_) => {
                            self.teardown(slot);
                            continue;
                        }
                    }
                }

                if self.conns[slot].is_some() && flags.contains(EpollFlags::EPOLLOUT) {
                    if self.drain_write(slot).is_err() {
                        self.teardown(slot);
                    }
                }
            }

            self.retry_parked();
            self.process_delayed();
        }
    }

    fn cleanup(&mut self) -> Result<(), DevError> {
        for slot in 0..self.conns.len() {
            if let Some(conn) = self.conns[slot].take() {
                let _ = self.epoll.delete(conn.stream.as_fd());
            }
        }
        self.rank_conn.iter_mut().for_each(|r| *r = None);
        info!(rank = self.cfg.rank, "device stopped");
        Ok(())
    }

    // ---- connection management -------------------------------------------

    fn insert_conn(&mut self, conn: ConnState) -> Result<usize, DevError> {
        let slot = self
            .conns
            .iter()
            .position(|c| c.is_none())
            .unwrap_or_else(|| {
                self.conns.push(None);
                self.conns.len() - 1
            });

        self.epoll
            .add(
                conn.stream.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP, slot as u64),
            )
            .map_err(DevError::Os)?;

        self.conns[slot] = Some(conn);
        Ok(slot)
    }

    fn accept_new(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if stream.set_nonblocking(true).is_err() || stream.set_nodelay(true).is_err() {
                        continue;
                    }
                    if let Err(e) = self.insert_conn(ConnState::new(stream)) {
                        warn!("failed to register inbound connection: {e}");
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Connect outward to every higher-ranked peer and register there.
    fn connect_all(&mut self) -> Result<(), DevError> {
        for peer in (self.cfg.rank + 1)..self.cfg.tnc {
            if self.rank_conn[peer as usize].is_some() {
                continue;
            }

            let host = self.cfg.hosts[peer as usize].hostname.clone();
            let port = self.cfg.port_of(peer);
            let mut stream = connect_with_deadline(&host, port, self.cfg.conn_timeout)
                .map_err(|_| DevError::Connect { rank: peer, port })?;

            let mut wr = WorkRequest::new(if self.cfg.rank == 0 {
                Opcode::RegisterMaster
            } else {
                Opcode::RegisterWorker
            });
            wr.wr_id = u64::from(self.cfg.tnc);
            wr.source = self.cfg.rank;
            wr.target = peer;
            wr.length = WR_SIZE as u32;
            stream.write_all(&wr.to_bytes())?;

            stream.set_nonblocking(true)?;
            let mut conn = ConnState::new(stream);
            conn.rank = Some(peer);
            let slot = self.insert_conn(conn)?;
            self.rank_conn[peer as usize] = Some(slot);

            debug!(rank = self.cfg.rank, peer, "registered with peer");
        }

        self.connected_all = true;
        Ok(())
    }

    fn teardown(&mut self, slot: usize) {
        let Some(conn) = self.conns[slot].take() else {
            return;
        };
        let _ = self.epoll.delete(conn.stream.as_fd());

        // An armed write half owes its producer a completion.
        if !conn.write.is_idle() {
            let op = match conn.write.state {
                WriteState::RdmaWrite => WcOpcode::RdmaWrite,
                WriteState::RdmaRead => WcOpcode::RdmaRead,
                _ => WcOpcode::Send,
            };
            self.cqs.post(
                conn.write.cq_handle,
                WorkCompletion::error(conn.write.wr_id, op),
            );
        }

        if let Some(rank) = conn.rank {
            self.rank_conn[rank as usize] = None;
            warn!(rank = self.cfg.rank, peer = rank, "peer connection lost");
        }
    }

    // ---- read path -------------------------------------------------------

    fn drain_read(&mut self, slot: usize) -> Result<Flow, DevError> {
        loop {
            let conn = self.conns[slot].as_mut().expect("live connection");

            if conn.read.parked.is_some() {
                // An unmatched send holds the half; retried each tick.
                return Ok(Flow::Continue);
            }

            let remaining = conn.read.length - conn.read.done;
            let n = match &conn.read.dest {
                ReadDest::Scratch => {
                    let done = conn.read.done;
                    let len = conn.read.length;
                    match conn.stream.read(&mut conn.read.scratch[done..len]) {
                        Ok(n) => n,
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            return Ok(Flow::Continue)
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(DevError::Io(e)),
                    }
                }
                ReadDest::Region { region, offset } => {
                    let want = remaining.min(CHUNK_SIZE);
                    let region = region.clone();
                    let offset = offset + conn.read.done;
                    match conn.stream.read(&mut self.chunk[..want]) {
                        Ok(0) => 0,
                        Ok(n) => {
                            region.write(offset, &self.chunk[..n]);
                            n
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            return Ok(Flow::Continue)
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(DevError::Io(e)),
                    }
                }
                ReadDest::Discard => {
                    let want = remaining.min(CHUNK_SIZE);
                    match conn.stream.read(&mut self.chunk[..want]) {
                        Ok(n) => n,
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            return Ok(Flow::Continue)
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(DevError::Io(e)),
                    }
                }
            };

            if n == 0 {
                // Peer closed.
                return Err(DevError::Stopped);
            }

            let conn = self.conns[slot].as_mut().expect("live connection");
            conn.read.done += n;

            if conn.read.done == conn.read.length {
                match self.process_recv(slot)? {
                    Flow::Stop => return Ok(Flow::Stop),
                    Flow::Continue => return Ok(Flow::Continue),
                }
            }
        }
    }

    /// A read unit (header or payload) completed; dispatch it.
    fn process_recv(&mut self, slot: usize) -> Result<Flow, DevError> {
        let conn = self.conns[slot].as_mut().expect("live connection");

        match conn.read.state {
            ReadState::Header => {
                let wr = match WorkRequest::from_bytes(&conn.read.scratch) {
                    Ok(wr) => wr,
                    Err(e) => {
                        warn!("bad header from peer: {e}");
                        return Err(DevError::Stopped);
                    }
                };
                self.dispatch_header(slot, wr)
            }
            ReadState::RdmaWrite => {
                // Remote write payload landed; nothing to report locally.
                conn.read.reset();
                Ok(Flow::Continue)
            }
            ReadState::RdmaRead => {
                let wc = WorkCompletion::success(conn.read.wr_id, WcOpcode::RdmaRead);
                let cq = conn.read.cq_handle;
                conn.read.reset();
                self.cqs.post(cq, wc);
                Ok(Flow::Continue)
            }
            ReadState::Send => {
                let mut wc = WorkCompletion::success(conn.read.wr_id, WcOpcode::Recv);
                wc.sender = conn.rank.unwrap_or(0);
                let cq = conn.read.cq_handle;
                conn.read.reset();
                self.cqs.post(cq, wc);
                Ok(Flow::Continue)
            }
        }
    }

    fn dispatch_header(&mut self, slot: usize, wr: WorkRequest) -> Result<Flow, DevError> {
        match wr.opcode {
            Opcode::RegisterMaster => {
                let conn = self.conns[slot].as_mut().expect("live connection");
                conn.rank = Some(0);
                conn.read.reset();
                self.rank_conn[0] = Some(slot);

                if !self.connected_all {
                    self.connect_all()?;
                }
            }
            Opcode::RegisterWorker => {
                if wr.source >= self.cfg.tnc {
                    warn!("registration from out-of-range rank {}", wr.source);
                    return Err(DevError::Stopped);
                }
                let conn = self.conns[slot].as_mut().expect("live connection");
                conn.rank = Some(wr.source);
                conn.read.reset();
                self.rank_conn[wr.source as usize] = Some(slot);
            }

            Opcode::PostRdmaWrite | Opcode::PostRdmaWriteInlined | Opcode::PostRdmaRead => {
                self.post_rdma(slot, wr);
            }

            Opcode::PostAtomicCmpSwp | Opcode::PostAtomicFetchAdd => {
                self.post_atomic(slot, wr);
            }

            Opcode::PostSend | Opcode::PostSendInlined => {
                let mut out = wr;
                out.opcode = Opcode::NotificationSend;
                out.compare_add = u64::from(wr.opcode == Opcode::PostSendInlined);
                // For inlined sends local_addr already carries the token.
                self.delayed.push_back(out);
                self.reset_read(slot);
            }

            Opcode::PostRecv => {
                self.recv_list.push(wr);
                self.reset_read(slot);
            }

            Opcode::NotificationRdmaWrite => {
                let len = wr.length as usize;
                match self.registry.find(wr.remote_addr, len) {
                    Ok((region, offset)) => {
                        let conn = self.conns[slot].as_mut().expect("live connection");
                        conn.read.expect_payload(
                            ReadState::RdmaWrite,
                            wr.wr_id,
                            wr.cq_handle,
                            region,
                            offset,
                            len,
                        );
                    }
                    Err(e) => {
                        warn!("remote write to unregistered memory: {e}");
                        let conn = self.conns[slot].as_mut().expect("live connection");
                        conn.read
                            .expect_discard(ReadState::RdmaWrite, wr.wr_id, CQ_NONE, len);
                    }
                }
            }

            Opcode::RequestRdmaRead => {
                let mut out = wr;
                out.opcode = Opcode::ResponseRdmaRead;
                out.source = wr.target;
                out.target = wr.source;
                out.local_addr = wr.remote_addr;
                out.remote_addr = wr.local_addr;
                self.delayed.push_back(out);
                self.reset_read(slot);
            }

            Opcode::ResponseRdmaRead => {
                let len = wr.length as usize;
                match self.registry.find(wr.remote_addr, len) {
                    Ok((region, offset)) => {
                        let conn = self.conns[slot].as_mut().expect("live connection");
                        conn.read.expect_payload(
                            ReadState::RdmaRead,
                            wr.wr_id,
                            wr.cq_handle,
                            region,
                            offset,
                            len,
                        );
                    }
                    Err(e) => {
                        warn!("read response to unregistered memory: {e}");
                        let conn = self.conns[slot].as_mut().expect("live connection");
                        conn.read
                            .expect_discard(ReadState::RdmaRead, wr.wr_id, wr.cq_handle, len);
                    }
                }
            }

            Opcode::RequestAtomicCmpSwp | Opcode::RequestAtomicFetchAdd => {
                let old = self.run_atomic(&wr);
                let mut out = wr;
                out.opcode = if wr.opcode == Opcode::RequestAtomicCmpSwp {
                    Opcode::ResponseAtomicCmpSwp
                } else {
                    Opcode::ResponseAtomicFetchAdd
                };
                out.source = wr.target;
                out.target = wr.source;
                out.local_addr = wr.remote_addr;
                out.remote_addr = wr.local_addr;
                out.compare_add = old.unwrap_or(0);
                self.delayed.push_back(out);
                self.reset_read(slot);
            }

            Opcode::ResponseAtomicCmpSwp | Opcode::ResponseAtomicFetchAdd => {
                let op = if wr.opcode == Opcode::ResponseAtomicCmpSwp {
                    WcOpcode::CmpSwap
                } else {
                    WcOpcode::FetchAdd
                };

                match self.registry.find(wr.remote_addr, 8) {
                    Ok((region, offset)) => {
                        region.write(offset, &wr.compare_add.to_le_bytes());
                        self.cqs
                            .post(wr.cq_handle, WorkCompletion::success(wr.wr_id, op));
                    }
                    Err(e) => {
                        warn!("atomic response to unregistered memory: {e}");
                        self.cqs
                            .post(wr.cq_handle, WorkCompletion::error(wr.wr_id, op));
                    }
                }
                self.reset_read(slot);
            }

            Opcode::NotificationSend => {
                if !self.try_match_send(slot, wr) {
                    let conn = self.conns[slot].as_mut().expect("live connection");
                    conn.read.parked = Some(wr);
                }
            }

            Opcode::ResponseSend => {
                self.cqs.post(
                    wr.cq_handle,
                    WorkCompletion::success(wr.wr_id, WcOpcode::Send),
                );
                self.reset_read(slot);
            }

            Opcode::StopDevice => return Ok(Flow::Stop),
        }

        Ok(Flow::Continue)
    }

    fn reset_read(&mut self, slot: usize) {
        if let Some(conn) = self.conns[slot].as_mut() {
            conn.read.reset();
        }
    }

    /// Local shortcut or delayed forwarding for posted RDMA operations.
    fn post_rdma(&mut self, slot: usize, wr: WorkRequest) {
        let op = if wr.opcode == Opcode::PostRdmaRead {
            WcOpcode::RdmaRead
        } else {
            WcOpcode::RdmaWrite
        };

        if wr.target == self.cfg.rank {
            let result = self.local_copy(&wr);
            let wc = match result {
                Ok(()) => WorkCompletion::success(wr.wr_id, op),
                Err(e) => {
                    warn!("local rdma failed: {e}");
                    WorkCompletion::error(wr.wr_id, op)
                }
            };
            self.cqs.post(wr.cq_handle, wc);
        } else {
            let mut out = wr;
            if wr.opcode == Opcode::PostRdmaRead {
                out.opcode = Opcode::RequestRdmaRead;
                out.compare_add = 0;
            } else {
                out.opcode = Opcode::NotificationRdmaWrite;
                out.compare_add = u64::from(wr.opcode == Opcode::PostRdmaWriteInlined);
            }
            out.swap = 0;
            self.delayed.push_back(out);
        }

        self.reset_read(slot);
    }

    fn local_copy(&mut self, wr: &WorkRequest) -> Result<(), DevError> {
        let len = wr.length as usize;

        if wr.opcode == Opcode::PostRdmaWriteInlined {
            let data = self
                .slab
                .take(wr.local_addr)
                .ok_or(DevError::UnregisteredAddr(wr.local_addr))?;
            let (dst, dst_off) = self.registry.find(wr.remote_addr, len)?;
            dst.write(dst_off, &data[..len]);
            return Ok(());
        }

        let (src_addr, dst_addr) = if wr.opcode == Opcode::PostRdmaRead {
            (wr.remote_addr, wr.local_addr)
        } else {
            (wr.local_addr, wr.remote_addr)
        };

        let (src, src_off) = self.registry.find(src_addr, len)?;
        let (dst, dst_off) = self.registry.find(dst_addr, len)?;

        let mut copied = 0usize;
        while copied < len {
            let n = (len - copied).min(CHUNK_SIZE);
            src.read(src_off + copied, &mut self.chunk[..n]);
            dst.write(dst_off + copied, &self.chunk[..n]);
            copied += n;
        }
        Ok(())
    }

    /// Local shortcut or delayed forwarding for posted atomics.
    fn post_atomic(&mut self, slot: usize, wr: WorkRequest) {
        let op = if wr.opcode == Opcode::PostAtomicFetchAdd {
            WcOpcode::FetchAdd
        } else {
            WcOpcode::CmpSwap
        };

        if wr.target == self.cfg.rank {
            let wc = match self.run_atomic(&wr).and_then(|old| {
                let (dst, off) = self.registry.find(wr.local_addr, 8)?;
                dst.write(off, &old.to_le_bytes());
                Ok(())
            }) {
                Ok(()) => WorkCompletion::success(wr.wr_id, op),
                Err(e) => {
                    warn!("local atomic failed: {e}");
                    WorkCompletion::error(wr.wr_id, op)
                }
            };
            self.cqs.post(wr.cq_handle, wc);
        } else {
            let mut out = wr;
            out.opcode = if wr.opcode == Opcode::PostAtomicFetchAdd {
                out.swap = 0;
                Opcode::RequestAtomicFetchAdd
            } else {
                Opcode::RequestAtomicCmpSwp
            };
            self.delayed.push_back(out);
        }

        self.reset_read(slot);
    }

    /// Execute an atomic against local registered memory, returning the
    /// previous value.
    fn run_atomic(&self, wr: &WorkRequest) -> Result<u64, DevError> {
        let (region, off) = self.registry.find(wr.remote_addr, 8)?;
        let word = region.atomic_u64(off)?;

        let old = match wr.opcode {
            Opcode::PostAtomicCmpSwp | Opcode::RequestAtomicCmpSwp => {
                match word.compare_exchange(
                    wr.compare_add,
                    wr.swap,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(prev) | Err(prev) => prev,
                }
            }
            _ => word.fetch_add(wr.compare_add, Ordering::AcqRel),
        };
        Ok(old)
    }

    // ---- send/recv matching ----------------------------------------------

    /// Smallest-fitting posted receive for a send of `length`; ties go to
    /// the oldest entry.
    fn find_recv(&self, length: u32) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, rwr) in self.recv_list.iter().enumerate() {
            if rwr.length >= length {
                let better = match best {
                    None => true,
                    Some(b) => rwr.length < self.recv_list[b].length,
                };
                if better {
                    best = Some(i);
                }
            }
        }
        best
    }

    /// Try to match an inbound send notification on `slot`. On success,
    /// queues the acknowledgement and arms the read half for the payload.
    fn try_match_send(&mut self, slot: usize, swr: WorkRequest) -> bool {
        let Some(idx) = self.find_recv(swr.length) else {
            return false;
        };
        let rwr = self.recv_list.remove(idx);

        let mut ack = swr;
        ack.opcode = Opcode::ResponseSend;
        ack.source = swr.target;
        ack.target = swr.source;
        self.delayed.push_back(ack);

        let sender = {
            let conn = self.conns[slot].as_ref().expect("live connection");
            conn.rank.unwrap_or(swr.source)
        };

        let len = swr.length as usize;
        match self.registry.find(rwr.local_addr, len) {
            Ok((region, offset)) => {
                let conn = self.conns[slot].as_mut().expect("live connection");
                conn.read.expect_payload(
                    ReadState::Send,
                    u64::from(sender),
                    rwr.cq_handle,
                    region,
                    offset,
                    len,
                );
            }
            Err(e) => {
                warn!("posted receive names unregistered memory: {e}");
                let conn = self.conns[slot].as_mut().expect("live connection");
                conn.read
                    .expect_discard(ReadState::Send, u64::from(sender), rwr.cq_handle, len);
            }
        }
        true
    }

    /// Retry parked send notifications; a receive posted after the send
    /// arrived re-drives progress here.
    fn retry_parked(&mut self) {
        for slot in 0..self.conns.len() {
            let Some(conn) = self.conns[slot].as_ref() else {
                continue;
            };
            let Some(swr) = conn.read.parked else {
                continue;
            };
            if self.find_recv(swr.length).is_none() {
                continue;
            }

            self.conns[slot]
                .as_mut()
                .expect("live connection")
                .read
                .parked = None;
            self.try_match_send(slot, swr);
        }
    }

    // ---- delayed queue ---------------------------------------------------

    fn process_delayed(&mut self) {
        let pending = std::mem::take(&mut self.delayed);

        for wr in pending {
            if !self.dispatch_delayed(&wr) {
                self.delayed.push_back(wr);
            }
        }
    }

    /// Attempt one delayed entry. Returns true when the entry is finished
    /// (sent, completed locally, or failed definitively).
    fn dispatch_delayed(&mut self, wr: &WorkRequest) -> bool {
        let self_send = wr.opcode == Opcode::NotificationSend && wr.target == self.cfg.rank;
        let target_slot = self.rank_conn.get(wr.target as usize).copied().flatten();

        if target_slot.is_none() && !self_send {
            self.fail_delayed(wr);
            return true;
        }

        if self_send {
            return self.dispatch_self_send(wr);
        }

        let slot = target_slot.expect("checked above");
        if !self.conns[slot]
            .as_ref()
            .map(|c| c.write.is_idle())
            .unwrap_or(false)
        {
            return false;
        }

        // Header goes out synchronously; payloads follow per-opcode.
        let mut header = *wr;
        if header.opcode == Opcode::NotificationSend && header.compare_add == 1 {
            // The token in local_addr means nothing to the peer.
            header.local_addr = 0;
        }
        if self.write_busy(slot, &header.to_bytes()).is_err() {
            self.teardown(slot);
            self.fail_delayed(wr);
            return true;
        }

        let inlined = (wr.opcode == Opcode::NotificationRdmaWrite
            || wr.opcode == Opcode::NotificationSend)
            && wr.compare_add == 1;

        if inlined {
            let Some(data) = self.slab.take(wr.local_addr) else {
                warn!("inlined payload token {} already taken", wr.local_addr);
                return true;
            };
            let len = wr.length as usize;
            if self.write_busy(slot, &data[..len]).is_err() {
                self.teardown(slot);
                self.fail_delayed(wr);
                return true;
            }
            let op = if wr.opcode == Opcode::NotificationRdmaWrite {
                WcOpcode::RdmaWrite
            } else {
                WcOpcode::Send
            };
            self.cqs
                .post(wr.cq_handle, WorkCompletion::success(wr.wr_id, op));
            return true;
        }

        match wr.opcode {
            Opcode::NotificationRdmaWrite | Opcode::ResponseRdmaRead | Opcode::NotificationSend => {
                let state = match wr.opcode {
                    Opcode::NotificationRdmaWrite => WriteState::RdmaWrite,
                    Opcode::ResponseRdmaRead => WriteState::RdmaRead,
                    _ => WriteState::Send,
                };

                let len = wr.length as usize;
                match self.registry.find(wr.local_addr, len) {
                    Ok((region, offset)) => {
                        let conn = self.conns[slot].as_mut().expect("live connection");
                        conn.write
                            .arm(state, wr.wr_id, wr.cq_handle, region, offset, len);
                        self.arm_epollout(slot, true);
                    }
                    Err(e) => {
                        // Header already went out; the stream would lose
                        // framing without the payload.
                        error!("outbound payload not registered: {e}");
                        self.teardown(slot);
                        self.fail_delayed(wr);
                    }
                }
            }
            // Header-only messages are done once written.
            _ => {}
        }
        true
    }

    fn dispatch_self_send(&mut self, wr: &WorkRequest) -> bool {
        let Some(idx) = self.find_recv(wr.length) else {
            return false; // wait for a posted receive
        };
        let rwr = self.recv_list.remove(idx);
        let len = wr.length as usize;

        let copy_result = if wr.compare_add == 1 {
            match self.slab.take(wr.local_addr) {
                Some(data) => self
                    .registry
                    .find(rwr.local_addr, len)
                    .map(|(dst, off)| dst.write(off, &data[..len])),
                None => Err(DevError::UnregisteredAddr(wr.local_addr)),
            }
        } else {
            self.registry.find(wr.local_addr, len).and_then(|(src, s)| {
                let (dst, d) = self.registry.find(rwr.local_addr, len)?;
                let mut copied = 0usize;
                while copied < len {
                    let n = (len - copied).min(CHUNK_SIZE);
                    src.read(s + copied, &mut self.chunk[..n]);
                    dst.write(d + copied, &self.chunk[..n]);
                    copied += n;
                }
                Ok(())
            })
        };

        match copy_result {
            Ok(()) => {
                self.cqs.post(
                    wr.cq_handle,
                    WorkCompletion::success(wr.wr_id, WcOpcode::Send),
                );
                let mut recv_wc =
                    WorkCompletion::success(u64::from(self.cfg.rank), WcOpcode::Recv);
                recv_wc.sender = self.cfg.rank;
                self.cqs.post(rwr.cq_handle, recv_wc);
            }
            Err(e) => {
                warn!("self send failed: {e}");
                self.cqs
                    .post(wr.cq_handle, WorkCompletion::error(wr.wr_id, WcOpcode::Send));
            }
        }
        true
    }

    /// Post the error completion for a delayed entry whose target is gone,
    /// releasing any inlined payload.
    fn fail_delayed(&mut self, wr: &WorkRequest) {
        let inlined = (wr.opcode == Opcode::NotificationRdmaWrite
            || wr.opcode == Opcode::NotificationSend)
            && wr.compare_add == 1;
        if inlined {
            self.slab.take(wr.local_addr);
        }

        let op = match wr.opcode {
            // Response entries carry the requester's queue handle, which
            // means nothing in this process; they die silently.
            Opcode::ResponseRdmaRead
            | Opcode::ResponseAtomicCmpSwp
            | Opcode::ResponseAtomicFetchAdd
            | Opcode::ResponseSend => {
                debug!("dropping response for vanished peer {}", wr.target);
                return;
            }
            Opcode::RequestRdmaRead => WcOpcode::RdmaRead,
            Opcode::RequestAtomicCmpSwp => WcOpcode::CmpSwap,
            Opcode::RequestAtomicFetchAdd => WcOpcode::FetchAdd,
            Opcode::NotificationSend => WcOpcode::Send,
            _ => WcOpcode::RdmaWrite,
        };
        self.cqs
            .post(wr.cq_handle, WorkCompletion::error(wr.wr_id, op));
    }

    /// Write a full buffer to a peer socket, spinning through would-block.
    fn write_busy(&mut self, slot: usize, buf: &[u8]) -> Result<(), DevError> {
        let conn = self.conns[slot].as_mut().expect("live connection");
        let mut done = 0usize;
        while done < buf.len() {
            match conn.stream.write(&buf[done..]) {
                Ok(0) => return Err(DevError::Stopped),
                Ok(n) => done += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::hint::spin_loop();
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(DevError::Io(e)),
            }
        }
        Ok(())
    }

    fn arm_epollout(&mut self, slot: usize, enable: bool) {
        let Some(conn) = self.conns[slot].as_ref() else {
            return;
        };
        let mut flags = EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
        if enable {
            flags |= EpollFlags::EPOLLOUT;
        }
        let mut ev = EpollEvent::new(flags, slot as u64);
        if let Err(e) = self.epoll.modify(conn.stream.as_fd(), &mut ev) {
            warn!("failed to modify event interest: {e}");
        }
    }

    // ---- write path ------------------------------------------------------

    fn drain_write(&mut self, slot: usize) -> Result<(), DevError> {
        loop {
            let conn = self.conns[slot].as_mut().expect("live connection");
            if conn.write.is_idle() {
                return Ok(());
            }

            let remaining = conn.write.length - conn.write.done;
            let n = {
                let WriteSrc::Region { region, offset } = &conn.write.src else {
                    return Ok(());
                };
                let want = remaining.min(CHUNK_SIZE);
                let region = region.clone();
                let offset = offset + conn.write.done;
                region.read(offset, &mut self.chunk[..want]);

                let conn = self.conns[slot].as_mut().expect("live connection");
                match conn.stream.write(&self.chunk[..want]) {
                    Ok(0) => return Err(DevError::Stopped),
                    Ok(n) => n,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(DevError::Io(e)),
                }
            };

            let conn = self.conns[slot].as_mut().expect("live connection");
            conn.write.done += n;

            if conn.write.done == conn.write.length {
                if conn.write.state == WriteState::RdmaWrite {
                    let wc = WorkCompletion::success(conn.write.wr_id, WcOpcode::RdmaWrite);
                    let cq = conn.write.cq_handle;
                    self.cqs.post(cq, wc);
                }
                let conn = self.conns[slot].as_mut().expect("live connection");
                conn.write.disarm();
                self.arm_epollout(slot, false);
                return Ok(());
            }
        }
    }
}
