//! # hydra
//!
//! A PGAS communication runtime for tightly-coupled distributed
//! processes. Every participating process (a *rank*) exposes registered
//! memory that peers read and write one-sidedly through the virtual
//! transport device; completion is signalled through notification words
//! rather than remote CPU involvement.
//!
//! On top of the transport sit dynamic *groups* and two resumable
//! collectives: a dissemination barrier and a Rabenseifner-style
//! allreduce. A collective that runs out of its time budget returns
//! [`Error::Timeout`] with its progress parked in the group; calling it
//! again with a fresh budget resumes where it left off.
//!
//! ## Bootstrap
//!
//! Rank 0 knows the host table and broadcasts it; every other rank
//! learns the topology from the broadcast. Each process then starts its
//! side-network server (control plane) and its transport device, and
//! joins `GROUP_ALL`:
//!
//! ```no_run
//! use hydra::{Config, Hydra, Timeout, GROUP_ALL};
//!
//! # fn main() -> Result<(), hydra::Error> {
//! let config = Config::master(vec![("node-a".into(), 0), ("node-b".into(), 0)]);
//! let runtime = Hydra::init(config)?;
//! runtime.barrier(GROUP_ALL, Timeout::from_millis(1000))?;
//! # Ok(())
//! # }
//! ```

mod config;
mod ctx;
mod group;
mod sn;
mod sync;

pub mod coll;

pub use config::{Config, HostEntry};
pub use ctx::{Hydra, SegmentDesc};
pub use coll::ops::{DataType, Element, ReduceOp};
pub use sync::Timeout;

pub use hydra_wire::{ALLREDUCE_ELEM_MAX, MAX_GROUPS, REDUX_BUF_SIZE};

/// Group identifier; a small index into the per-process group table.
pub type GroupId = u8;

/// The implicit group containing every rank, available after init.
pub const GROUP_ALL: GroupId = 0;

/// Status of every fallible runtime call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The time budget ran out; collective calls can be re-entered to
    /// resume from their checkpoint.
    #[error("operation timed out")]
    Timeout,

    #[error("invalid group")]
    InvalidGroup,

    #[error("invalid rank")]
    InvalidRank,

    #[error("invalid element count")]
    InvalidNum,

    #[error("invalid element size")]
    InvalidSize,

    #[error("too many groups")]
    ManyGroups,

    #[error("memory allocation failed")]
    MemAlloc,

    #[error("another collective is in progress on this group")]
    ActiveCollective,

    #[error("transport device failure")]
    Device,

    #[error("side-network port unavailable")]
    SnPort,

    #[error("out of file descriptors")]
    Emfile,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<hydra_wire::WireError> for Error {
    fn from(e: hydra_wire::WireError) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<hydra_dev::DevError> for Error {
    fn from(e: hydra_dev::DevError) -> Self {
        use hydra_dev::DevError;
        match e {
            DevError::MemAlloc(_) => Error::MemAlloc,
            DevError::Io(e) => Error::Io(e),
            _ => Error::Device,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
