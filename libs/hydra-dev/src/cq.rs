//! Completion queues and the passive wake channel.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use hydra_wire::wr::{WcOpcode, WorkCompletion};
use hydra_wire::{CQ_NONE, MAX_CQS, MAX_QUEUE_DEPTH};
use tracing::warn;

use crate::ring::RingBuffer;
use crate::DevError;

/// A pipe used to wake a consumer blocked on receive completions.
///
/// The device writes one byte per `Recv` completion; a blocked consumer
/// reads one byte per completion it intends to poll.
pub struct PassiveChannel {
    read: OwnedFd,
    write: OwnedFd,
}

impl PassiveChannel {
    pub fn new() -> Result<Self, DevError> {
        let (read, write) = nix::unistd::pipe().map_err(DevError::Os)?;
        Ok(Self { read, write })
    }

    /// Signal one receive completion.
    pub fn notify(&self) {
        let byte = [1u8];
        let n = unsafe { libc::write(self.write.as_raw_fd(), byte.as_ptr().cast(), 1) };
        if n < 1 {
            warn!("failed to write completion wake byte");
        }
    }

    /// Block until one receive completion was signalled.
    pub fn wait(&self) -> Result<(), DevError> {
        let mut byte = [0u8; 1];
        loop {
            let n = unsafe { libc::read(self.read.as_raw_fd(), byte.as_mut_ptr().cast(), 1) };
            if n == 1 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(DevError::Io(err));
            }
        }
    }
}

/// A completion queue: one SPSC ring of work completions plus an optional
/// wake channel for blocking receive consumers.
pub struct Cq {
    handle: u32,
    ring: RingBuffer<WorkCompletion>,
    pchannel: Option<PassiveChannel>,
}

impl Cq {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Post a completion. Busy-waits while the ring is full; wakes the
    /// passive channel for `Recv` completions.
    pub fn post(&self, wc: WorkCompletion) {
        self.ring.insert(wc);

        if wc.opcode == WcOpcode::Recv {
            if let Some(ch) = &self.pchannel {
                ch.notify();
            }
        }
    }

    /// Poll one completion without blocking.
    pub fn poll(&self) -> Option<WorkCompletion> {
        self.ring.remove()
    }

    /// Block until a receive completion was posted, then poll it.
    pub fn wait_recv(&self) -> Result<WorkCompletion, DevError> {
        loop {
            if let Some(ch) = &self.pchannel {
                ch.wait()?;
            }
            if let Some(wc) = self.ring.remove() {
                return Ok(wc);
            }
            std::hint::spin_loop();
        }
    }
}

/// Registry handing out completion queues by handle.
///
/// Handles index a fixed table; the device resolves `cq_handle` fields of
/// work requests against it when posting completions.
pub struct CqTable {
    slots: spin::Mutex<Vec<Option<Arc<Cq>>>>,
}

impl CqTable {
    pub fn new() -> Self {
        Self {
            slots: spin::Mutex::new(vec![None; MAX_CQS]),
        }
    }

    /// Create a completion queue of the given depth.
    pub fn create(
        &self,
        depth: usize,
        pchannel: Option<PassiveChannel>,
    ) -> Result<Arc<Cq>, DevError> {
        if depth > MAX_QUEUE_DEPTH {
            return Err(DevError::QueueDepth(depth));
        }

        let mut slots = self.slots.lock();
        let handle = slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(DevError::TooManyCqs)?;

        let cq = Arc::new(Cq {
            handle: handle as u32,
            ring: RingBuffer::new(depth),
            pchannel,
        });
        slots[handle] = Some(cq.clone());
        Ok(cq)
    }

    pub fn destroy(&self, handle: u32) {
        if let Some(slot) = self.slots.lock().get_mut(handle as usize) {
            *slot = None;
        }
    }

    pub fn get(&self, handle: u32) -> Option<Arc<Cq>> {
        if handle == CQ_NONE {
            return None;
        }
        self.slots.lock().get(handle as usize)?.clone()
    }

    /// Post to the queue named by `handle`, dropping the completion when
    /// no completion was requested.
    pub fn post(&self, handle: u32, wc: WorkCompletion) {
        match self.get(handle) {
            Some(cq) => cq.post(wc),
            None => {
                if handle != CQ_NONE {
                    warn!(handle, "completion for unknown queue dropped");
                }
            }
        }
    }
}

impl Default for CqTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_wire::wr::WcStatus;

    #[test]
    fn test_post_and_poll() {
        let table = CqTable::new();
        let cq = table.create(64, None).unwrap();

        table.post(cq.handle(), WorkCompletion::success(7, WcOpcode::RdmaWrite));

        let wc = cq.poll().unwrap();
        assert_eq!(wc.wr_id, 7);
        assert_eq!(wc.status, WcStatus::Success);
        assert!(cq.poll().is_none());
    }

    #[test]
    fn test_unknown_handle_is_dropped() {
        let table = CqTable::new();
        table.post(CQ_NONE, WorkCompletion::success(1, WcOpcode::Send));
        table.post(12, WorkCompletion::success(1, WcOpcode::Send));
    }

    #[test]
    fn test_recv_wakes_passive_channel() {
        let table = CqTable::new();
        let cq = table
            .create(16, Some(PassiveChannel::new().unwrap()))
            .unwrap();

        let mut wc = WorkCompletion::success(3, WcOpcode::Recv);
        wc.sender = 3;
        cq.post(wc);

        let got = cq.wait_recv().unwrap();
        assert_eq!(got.sender, 3);
    }

    #[test]
    fn test_handles_are_reused() {
        let table = CqTable::new();
        let a = table.create(8, None).unwrap();
        let h = a.handle();
        table.destroy(h);
        let b = table.create(8, None).unwrap();
        assert_eq!(b.handle(), h);
    }
}
