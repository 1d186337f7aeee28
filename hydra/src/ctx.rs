//! The process context and the public runtime facade.
//!
//! All runtime state hangs off one [`Ctx`] passed by handle: the
//! resolved topology, the transport device, the group table, per-peer
//! endpoint and queue health, and the cached side-network sockets.
//! Nothing is process-global, so several ranks can live in one process
//! (which is how the integration tests run whole jobs).

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use hydra_dev::{Cq, Device, DeviceConfig, DeviceHandle, Queue};
use hydra_wire::sn::HostRecord;
use hydra_wire::{ALLREDUCE_ELEM_MAX, MAX_GROUPS, MAX_QUEUES, REDUX_BUF_SIZE};

use crate::coll::allreduce::Redux;
use crate::coll::ops::{Element, ReduceOp};
use crate::config::Config;
use crate::group::{self, GroupSlot};
use crate::sn;
use crate::sync::Timeout;
use crate::{coll, Error, GroupId, Result};

pub(crate) const EP_DISCONNECTED: u8 = 0;
pub(crate) const EP_CONNECTED: u8 = 1;

const QP_OK: u8 = 0;
const QP_CORRUPT: u8 = 1;

/// A remotely addressable segment descriptor, as installed by the
/// segment-register control op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDesc {
    pub rank: u16,
    pub seg_id: u8,
    pub addr: u64,
    pub size: u64,
    pub notif_addr: u64,
}

/// Process-wide runtime state, shared by handle between the caller
/// threads, the side-network server and (via its own tables) the device.
pub(crate) struct Ctx {
    pub rank: u16,
    pub tnc: u16,
    pub hosts: Vec<HostRecord>,
    pub config: Config,

    pub device: DeviceHandle,
    pub coll_cq: Arc<Cq>,
    pub coll_queue: Queue,
    /// Queues handed out by `queue_create`, kept alive here.
    pub extra_queues: spin::Mutex<Vec<Queue>>,

    /// Cached side-network client sockets, one per peer.
    pub sn_sockets: Vec<std::sync::Mutex<Option<TcpStream>>>,

    /// Logical endpoint state per peer.
    pub ep_status: Vec<AtomicU8>,

    /// Per-queue, per-peer health bits; poisoned on transport failure.
    qp_state: Vec<AtomicU8>,

    /// Outstanding collective completions.
    pub ne_count_grp: AtomicI64,

    pub groups: Vec<GroupSlot>,
    /// Live-group count; doubles as the membership-change lock.
    pub group_cnt: spin::Mutex<usize>,

    /// Foreign segment descriptors installed via the side network.
    pub segments: spin::Mutex<HashMap<(u8, u16), SegmentDesc>>,

    pub dev_init: AtomicBool,
    pub sn_stop: AtomicBool,
}

impl Ctx {
    pub fn group_slot(&self, g: GroupId) -> Result<&GroupSlot> {
        self.groups
            .get(g as usize)
            .filter(|slot| slot.state.read().is_some())
            .ok_or(Error::InvalidGroup)
    }

    fn qp_index(&self, queue: usize, peer: u16) -> usize {
        queue * self.tnc as usize + peer as usize
    }

    /// Poison the collective queue towards `peer`.
    pub fn poison_coll_queue(&self, peer: u16) {
        if peer < self.tnc {
            let idx = self.qp_index(MAX_QUEUES, peer);
            self.qp_state[idx].store(QP_CORRUPT, Ordering::Release);
        }
    }

    pub fn coll_queue_ok(&self, peer: u16) -> bool {
        let idx = self.qp_index(MAX_QUEUES, peer);
        self.qp_state[idx].load(Ordering::Acquire) == QP_OK
    }
}

/// The runtime handle.
///
/// Created by [`Hydra::init`]; dropping it stops the side-network and
/// transport threads.
pub struct Hydra {
    ctx: Arc<Ctx>,
    sn_thread: Option<std::thread::JoinHandle<()>>,
}

impl Hydra {
    /// Bootstrap the runtime: resolve the topology, start the transport
    /// device and side network, build `GROUP_ALL`, and synchronize with
    /// every other rank.
    pub fn init(config: Config) -> Result<Self> {
        let topo = sn::topology::broadcast(&config)?;
        let offset = u16::from(topo.hosts[topo.rank as usize].port_offset);

        let device = Device::spawn(DeviceConfig {
            rank: topo.rank,
            tnc: topo.tnc,
            hosts: topo.hosts.clone(),
            dev_port: config.dev_port,
            conn_timeout: Duration::from_millis(config.conn_timeout_ms),
        })?;

        let coll_cq = device.create_cq(config.queue_depth, false)?;
        let coll_queue = device.create_queue()?;

        let sn_listener = sn::server::bind(config.sn_port + offset)?;

        let tnc = topo.tnc as usize;
        let ctx = Arc::new(Ctx {
            rank: topo.rank,
            tnc: topo.tnc,
            hosts: topo.hosts,
            config,
            device,
            coll_cq,
            coll_queue,
            extra_queues: spin::Mutex::new(Vec::new()),
            sn_sockets: (0..tnc).map(|_| std::sync::Mutex::new(None)).collect(),
            ep_status: (0..tnc).map(|_| AtomicU8::new(EP_DISCONNECTED)).collect(),
            qp_state: (0..(MAX_QUEUES + 1) * tnc)
                .map(|_| AtomicU8::new(QP_OK))
                .collect(),
            ne_count_grp: AtomicI64::new(0),
            groups: (0..MAX_GROUPS).map(|_| GroupSlot::empty()).collect(),
            group_cnt: spin::Mutex::new(0),
            segments: spin::Mutex::new(HashMap::new()),
            dev_init: AtomicBool::new(false),
            sn_stop: AtomicBool::new(false),
        });
        ctx.dev_init.store(true, Ordering::Release);

        let sn_thread = sn::server::spawn(ctx.clone(), sn_listener);
        let mut runtime = Self {
            ctx,
            sn_thread: Some(sn_thread),
        };

        if let Err(e) = runtime.finish_init() {
            runtime.stop_threads();
            return Err(e);
        }

        info!(rank = runtime.ctx.rank, tnc = runtime.ctx.tnc, "runtime up");
        Ok(runtime)
    }

    fn finish_init(&mut self) -> Result<()> {
        group::create_group_all(&self.ctx)?;

        let deadline = Timeout::from_millis(self.ctx.config.conn_timeout_ms).deadline();
        sn::allgather::sn_barrier(&self.ctx, &deadline)
    }

    fn stop_threads(&mut self) {
        if let Some(thread) = self.sn_thread.take() {
            self.ctx.sn_stop.store(true, Ordering::Release);
            let _ = thread.join();
        }
    }

    pub fn rank(&self) -> u16 {
        self.ctx.rank
    }

    pub fn num_ranks(&self) -> u16 {
        self.ctx.tnc
    }

    // ---- groups ----------------------------------------------------------

    pub fn group_create(&self) -> Result<GroupId> {
        group::create(&self.ctx)
    }

    pub fn group_delete(&self, g: GroupId) -> Result<()> {
        group::delete(&self.ctx, g)
    }

    pub fn group_add(&self, g: GroupId, rank: u16) -> Result<()> {
        group::add(&self.ctx, g, rank)
    }

    pub fn group_commit(&self, g: GroupId, timeout: Timeout) -> Result<()> {
        group::commit(&self.ctx, g, &timeout.deadline())
    }

    /// Number of live groups.
    pub fn group_num(&self) -> usize {
        *self.ctx.group_cnt.lock()
    }

    pub fn group_size(&self, g: GroupId) -> Result<usize> {
        group::size(&self.ctx, g)
    }

    /// The group's member ranks, sorted ascending.
    pub fn group_ranks(&self, g: GroupId) -> Result<Vec<u16>> {
        group::ranks(&self.ctx, g)
    }

    pub fn group_max(&self) -> usize {
        MAX_GROUPS
    }

    // ---- collectives -----------------------------------------------------

    /// Block until every member of `g` has entered the same barrier.
    ///
    /// On `Timeout`, progress is parked in the group; call again to
    /// resume.
    pub fn barrier(&self, g: GroupId, timeout: Timeout) -> Result<()> {
        coll::barrier::barrier(&self.ctx, g, timeout)
    }

    /// Element-wise reduction of every member's `send` into every
    /// member's `recv`. `recv` is written only on success.
    pub fn allreduce<T: Element>(
        &self,
        send: &[T],
        recv: &mut [T],
        op: ReduceOp,
        g: GroupId,
        timeout: Timeout,
    ) -> Result<()> {
        if send.len() != recv.len() {
            return Err(Error::InvalidNum);
        }

        let elem_size = T::DTYPE.size();
        let mut send_bytes = Vec::with_capacity(send.len() * elem_size);
        for &v in send {
            v.write_le(&mut send_bytes);
        }
        let mut recv_bytes = vec![0u8; recv.len() * elem_size];

        coll::allreduce::allreduce(
            &self.ctx,
            g,
            &send_bytes,
            &mut recv_bytes,
            send.len(),
            elem_size,
            Redux::Op(op, T::DTYPE),
            timeout,
        )?;

        for (i, r) in recv.iter_mut().enumerate() {
            *r = T::read_le(&recv_bytes[i * elem_size..]);
        }
        Ok(())
    }

    /// Allreduce with a caller-supplied associative combiner
    /// `f(local, incoming, out)` over opaque elements.
    pub fn allreduce_user<F>(
        &self,
        send: &[u8],
        recv: &mut [u8],
        elem_cnt: usize,
        elem_size: usize,
        mut f: F,
        g: GroupId,
        timeout: Timeout,
    ) -> Result<()>
    where
        F: FnMut(&[u8], &[u8], &mut [u8]) -> Result<()>,
    {
        coll::allreduce::allreduce(
            &self.ctx,
            g,
            send,
            recv,
            elem_cnt,
            elem_size,
            Redux::User(&mut f),
            timeout,
        )
    }

    /// Largest staging buffer one allreduce may use, in bytes.
    pub fn allreduce_buf_size(&self) -> usize {
        REDUX_BUF_SIZE
    }

    /// Largest element count one allreduce may carry.
    pub fn allreduce_elem_max(&self) -> usize {
        ALLREDUCE_ELEM_MAX
    }

    // ---- endpoints and control plane -------------------------------------

    /// Establish the logical endpoint to `rank`.
    pub fn connect(&self, rank: u16, timeout: Timeout) -> Result<()> {
        sn::client::connect_cmd(&self.ctx, rank, &timeout.deadline())
    }

    /// Tear down the logical endpoint to `rank`.
    pub fn disconnect(&self, rank: u16, timeout: Timeout) -> Result<()> {
        sn::client::disconnect_cmd(&self.ctx, rank, &timeout.deadline())
    }

    /// Probe `rank`'s control plane.
    pub fn ping(&self, rank: u16, timeout: Timeout) -> Result<()> {
        sn::client::ping_cmd(&self.ctx, rank, &timeout.deadline())
    }

    /// Ask `rank` to exit.
    pub fn kill(&self, rank: u16, timeout: Timeout) -> Result<()> {
        sn::client::kill_cmd(&self.ctx, rank, &timeout.deadline())
    }

    /// Install one of our segment descriptors on `peer`.
    pub fn segment_register(
        &self,
        peer: u16,
        desc: SegmentDesc,
        timeout: Timeout,
    ) -> Result<()> {
        sn::client::seg_register_cmd(&self.ctx, peer, &desc, &timeout.deadline())
    }

    /// A foreign segment descriptor previously installed here.
    pub fn segment_lookup(&self, seg_id: u8, rank: u16) -> Option<SegmentDesc> {
        self.ctx.segments.lock().get(&(seg_id, rank)).copied()
    }

    /// Gather `src` from every member of `g` into `recv` over the side
    /// network (bootstrap-grade; no ordering guarantee).
    pub fn allgather(
        &self,
        g: GroupId,
        src: &[u8],
        recv: &mut [u8],
        timeout: Timeout,
    ) -> Result<()> {
        sn::allgather::allgather(&self.ctx, g, src, recv, &timeout.deadline())
    }

    /// Create an additional communication queue and announce it to every
    /// peer. Returns the queue number.
    pub fn queue_create(&self, timeout: Timeout) -> Result<u32> {
        let queue = self.ctx.device.create_queue()?;
        let num = queue.num();
        self.ctx.extra_queues.lock().push(queue);

        let deadline = timeout.deadline();
        for peer in 0..self.ctx.tnc {
            if peer != self.ctx.rank {
                sn::client::queue_create_cmd(&self.ctx, peer, num, &deadline)?;
            }
        }
        debug!(num, "queue created");
        Ok(num)
    }

    /// Whether the collective queue towards `peer` is healthy.
    pub fn queue_healthy(&self, peer: u16) -> bool {
        self.ctx.coll_queue_ok(peer)
    }
}

impl Drop for Hydra {
    fn drop(&mut self) {
        self.stop_threads();
    }
}
