//! Work queues: the posting side of the device.
//!
//! A queue is a loopback TCP connection into the local device thread.
//! Posting means writing one 64-byte work-request record to it; the
//! device picks the record up in its event loop like any other message.

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;

use hydra_wire::wr::{Opcode, WorkRequest};

use crate::inline::InlineSlab;
use crate::DevError;

/// A communication queue bound to the local device.
///
/// Cheap to share behind an `Arc`; posts are serialized by an internal
/// lock so concurrent producers cannot interleave records.
pub struct Queue {
    num: u32,
    rank: u16,
    stream: spin::Mutex<TcpStream>,
    slab: Arc<InlineSlab>,
}

impl Queue {
    pub(crate) fn new(num: u32, rank: u16, stream: TcpStream, slab: Arc<InlineSlab>) -> Self {
        Self {
            num,
            rank,
            stream: spin::Mutex::new(stream),
            slab,
        }
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    /// Post a raw work request.
    pub fn post(&self, wr: &WorkRequest) -> Result<(), DevError> {
        let bytes = wr.to_bytes();
        self.stream.lock().write_all(&bytes).map_err(DevError::Io)
    }

    /// One-sided write: `length` bytes from `local_addr` (a registered
    /// region of this rank) into `remote_addr` on `target`.
    pub fn post_write(
        &self,
        wr_id: u64,
        cq_handle: u32,
        target: u16,
        local_addr: u64,
        remote_addr: u64,
        length: u32,
    ) -> Result<(), DevError> {
        let mut wr = WorkRequest::new(Opcode::PostRdmaWrite);
        wr.wr_id = wr_id;
        wr.cq_handle = cq_handle;
        wr.source = self.rank;
        wr.target = target;
        wr.local_addr = local_addr;
        wr.remote_addr = remote_addr;
        wr.length = length;
        self.post(&wr)
    }

    /// One-sided write whose payload is captured at post time; the
    /// caller's buffer is reusable immediately.
    pub fn post_write_inlined(
        &self,
        wr_id: u64,
        cq_handle: u32,
        target: u16,
        data: &[u8],
        remote_addr: u64,
    ) -> Result<(), DevError> {
        let token = self.slab.insert(data.to_vec());

        let mut wr = WorkRequest::new(Opcode::PostRdmaWriteInlined);
        wr.wr_id = wr_id;
        wr.cq_handle = cq_handle;
        wr.source = self.rank;
        wr.target = target;
        wr.local_addr = token;
        wr.remote_addr = remote_addr;
        wr.length = data.len() as u32;
        self.post(&wr)
    }

    /// One-sided read: `length` bytes from `remote_addr` on `target` into
    /// `local_addr` here.
    pub fn post_read(
        &self,
        wr_id: u64,
        cq_handle: u32,
        target: u16,
        local_addr: u64,
        remote_addr: u64,
        length: u32,
    ) -> Result<(), DevError> {
        let mut wr = WorkRequest::new(Opcode::PostRdmaRead);
        wr.wr_id = wr_id;
        wr.cq_handle = cq_handle;
        wr.source = self.rank;
        wr.target = target;
        wr.local_addr = local_addr;
        wr.remote_addr = remote_addr;
        wr.length = length;
        self.post(&wr)
    }

    /// Atomic compare-and-swap on a 64-bit word at `remote_addr`; the
    /// previous value lands at `local_addr`.
    pub fn post_cmp_swap(
        &self,
        wr_id: u64,
        cq_handle: u32,
        target: u16,
        local_addr: u64,
        remote_addr: u64,
        compare: u64,
        swap: u64,
    ) -> Result<(), DevError> {
        let mut wr = WorkRequest::new(Opcode::PostAtomicCmpSwp);
        wr.wr_id = wr_id;
        wr.cq_handle = cq_handle;
        wr.source = self.rank;
        wr.target = target;
        wr.local_addr = local_addr;
        wr.remote_addr = remote_addr;
        wr.length = 8;
        wr.compare_add = compare;
        wr.swap = swap;
        self.post(&wr)
    }

    /// Atomic fetch-and-add on a 64-bit word at `remote_addr`; the
    /// previous value lands at `local_addr`.
    pub fn post_fetch_add(
        &self,
        wr_id: u64,
        cq_handle: u32,
        target: u16,
        local_addr: u64,
        remote_addr: u64,
        add: u64,
    ) -> Result<(), DevError> {
        let mut wr = WorkRequest::new(Opcode::PostAtomicFetchAdd);
        wr.wr_id = wr_id;
        wr.cq_handle = cq_handle;
        wr.source = self.rank;
        wr.target = target;
        wr.local_addr = local_addr;
        wr.remote_addr = remote_addr;
        wr.length = 8;
        wr.compare_add = add;
        self.post(&wr)
    }

    /// Two-sided send of `length` bytes at `local_addr`; completes when a
    /// matching receive is consumed on `target`.
    pub fn post_send(
        &self,
        wr_id: u64,
        cq_handle: u32,
        target: u16,
        local_addr: u64,
        length: u32,
    ) -> Result<(), DevError> {
        let mut wr = WorkRequest::new(Opcode::PostSend);
        wr.wr_id = wr_id;
        wr.cq_handle = cq_handle;
        wr.source = self.rank;
        wr.target = target;
        wr.local_addr = local_addr;
        wr.length = length;
        self.post(&wr)
    }

    /// Two-sided send with the payload captured at post time.
    pub fn post_send_inlined(
        &self,
        wr_id: u64,
        cq_handle: u32,
        target: u16,
        data: &[u8],
    ) -> Result<(), DevError> {
        let token = self.slab.insert(data.to_vec());

        let mut wr = WorkRequest::new(Opcode::PostSendInlined);
        wr.wr_id = wr_id;
        wr.cq_handle = cq_handle;
        wr.source = self.rank;
        wr.target = target;
        wr.local_addr = token;
        wr.length = data.len() as u32;
        self.post(&wr)
    }

    /// Post a receive buffer of `length` bytes at `local_addr`.
    pub fn post_recv(
        &self,
        wr_id: u64,
        cq_handle: u32,
        local_addr: u64,
        length: u32,
    ) -> Result<(), DevError> {
        let mut wr = WorkRequest::new(Opcode::PostRecv);
        wr.wr_id = wr_id;
        wr.cq_handle = cq_handle;
        wr.source = self.rank;
        wr.target = self.rank;
        wr.local_addr = local_addr;
        wr.length = length;
        self.post(&wr)
    }
}
