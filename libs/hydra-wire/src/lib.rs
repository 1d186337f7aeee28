//! # hydra-wire
//!
//! On-the-wire records shared by the hydra transport device and the
//! side-network control plane.
//!
//! Every message of the virtual transport starts with a fixed 64-byte
//! [`wr::WorkRequest`] record; every side-network request starts with a
//! fixed 64-byte [`sn::CdHeader`]. Both are encoded little-endian with
//! explicit field offsets so that the layout is identical across ranks
//! regardless of the compiler's struct layout.

pub mod sn;
pub mod wr;

/// Maximum number of simultaneously live groups per process.
pub const MAX_GROUPS: usize = 32;

/// Maximum number of user communication queues.
pub const MAX_QUEUES: usize = 16;

/// Queue index reserved for group collectives.
pub const COLL_QUEUE: usize = MAX_QUEUES;

/// Maximum completion-queue depth.
pub const MAX_QUEUE_DEPTH: usize = 4096;

/// Maximum number of completion queues a device will hand out.
pub const MAX_CQS: usize = 2 * MAX_QUEUES + 2;

/// Size of one staging slot used by the reduction pipeline.
pub const REDUX_BUF_SIZE: usize = 4096;

/// Maximum number of elements per allreduce call.
pub const ALLREDUCE_ELEM_MAX: usize = (1 << 8) - 1;

/// Sentinel completion-queue handle meaning "no completion requested".
pub const CQ_NONE: u32 = u32::MAX;

/// Default side-network base port.
pub const DEFAULT_SN_PORT: u16 = 10840;

/// Default transport-device base port.
pub const DEFAULT_DEV_PORT: u16 = 21212;

/// Default base port of the bootstrap allgather ring.
pub const DEFAULT_ALLGATHER_PORT: u16 = 23333;

/// Offset added to the side-network port for the topology handshake.
pub const TOPOLOGY_PORT_OFFSET: u16 = 64;

/// Bytes per topology record: 64 hostname bytes plus one port offset.
pub const HOST_RECORD_SIZE: usize = 65;

/// Wire-level decoding errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown transport opcode: {0}")]
    UnknownOpcode(u32),

    #[error("unknown side-network op: {0}")]
    UnknownSnOp(u32),

    #[error("truncated record: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
}

pub(crate) fn check_len(buf: &[u8], need: usize) -> Result<(), WireError> {
    if buf.len() < need {
        return Err(WireError::Truncated {
            need,
            got: buf.len(),
        });
    }
    Ok(())
}

pub(crate) fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}
