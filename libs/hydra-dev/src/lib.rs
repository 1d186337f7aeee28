//! # hydra-dev
//!
//! The virtual transport device: one-sided RDMA verbs (write, read,
//! compare-and-swap, fetch-and-add) and two-sided send/recv with
//! notifications, emulated over connected TCP sockets.
//!
//! A dedicated device thread owns every peer socket and drives them from
//! a single epoll loop. In-process producers post [`wr::WorkRequest`]
//! records by writing them to a loopback connection ([`queue::Queue`]);
//! the device executes the opcode (shortcutting self-targeted operations)
//! and posts [`wr::WorkCompletion`] records to single-producer/
//! single-consumer completion queues ([`cq::Cq`]).

pub use hydra_wire::wr;

pub mod cq;
pub mod engine;
pub mod mem;
pub mod queue;
pub mod ring;

mod conn;
mod inline;

pub use cq::{Cq, CqTable, PassiveChannel};
pub use engine::{Device, DeviceConfig, DeviceHandle};
pub use mem::{MemRegistry, Region};
pub use queue::Queue;

/// Device-level failures.
#[derive(Debug, thiserror::Error)]
pub enum DevError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OS error: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("failed to bind device port {0}")]
    Bind(u16),

    #[error("failed to connect to rank {rank} on port {port}")]
    Connect { rank: u16, port: u16 },

    #[error("reached max number of completion queues")]
    TooManyCqs,

    #[error("completion queue depth {0} exceeds limit")]
    QueueDepth(usize),

    #[error("failed to allocate {0} bytes of registered memory")]
    MemAlloc(usize),

    #[error("address {0:#x} is not in any registered region")]
    UnregisteredAddr(u64),

    #[error("address {0:#x} is not valid for atomic access")]
    MisalignedAtomic(u64),

    #[error("device is not running")]
    Stopped,
}
