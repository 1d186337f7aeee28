//! Work-request and work-completion records of the virtual transport.
//!
//! A [`WorkRequest`] is both the posting interface (written by in-process
//! producers to the device's loopback socket) and the message header on
//! peer connections. Payload bytes, when present, immediately follow the
//! header on the same connection.

use crate::{check_len, get_u16, get_u32, get_u64, WireError};

/// Encoded size of a [`WorkRequest`].
pub const WR_SIZE: usize = 64;

/// Transport opcodes.
///
/// `Post*` opcodes arrive from local producers; `Request*`/`Response*`/
/// `Notification*` opcodes travel between peer devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    /// Bootstrap registration from rank 0.
    RegisterMaster = 0,
    /// Bootstrap registration from any other rank.
    RegisterWorker = 1,
    /// One-sided write of `length` bytes into the target's memory.
    PostRdmaWrite = 2,
    /// Like [`Opcode::PostRdmaWrite`] with a device-owned payload buffer.
    PostRdmaWriteInlined = 3,
    /// One-sided read of `length` bytes from the target's memory.
    PostRdmaRead = 4,
    /// Compare-and-swap on a 64-bit word in the target's memory.
    PostAtomicCmpSwp = 5,
    /// Fetch-and-add on a 64-bit word in the target's memory.
    PostAtomicFetchAdd = 6,
    /// Two-sided send; completes when matched by a posted receive.
    PostSend = 7,
    /// Like [`Opcode::PostSend`] with a device-owned payload buffer.
    PostSendInlined = 8,
    /// Post a receive buffer for incoming sends.
    PostRecv = 9,
    /// Peer-to-peer: payload of a remote write follows.
    NotificationRdmaWrite = 10,
    /// Peer-to-peer: please send back `length` bytes at `local_addr`.
    RequestRdmaRead = 11,
    /// Peer-to-peer: payload of a read response follows.
    ResponseRdmaRead = 12,
    /// Peer-to-peer: perform a compare-and-swap locally.
    RequestAtomicCmpSwp = 13,
    /// Peer-to-peer: perform a fetch-and-add locally.
    RequestAtomicFetchAdd = 14,
    /// Peer-to-peer: previous value of a compare-and-swap.
    ResponseAtomicCmpSwp = 15,
    /// Peer-to-peer: previous value of a fetch-and-add.
    ResponseAtomicFetchAdd = 16,
    /// Peer-to-peer: a send is in flight, payload follows once matched.
    NotificationSend = 17,
    /// Peer-to-peer: a send was matched and consumed.
    ResponseSend = 18,
    /// Terminate the local device loop.
    StopDevice = 19,
}

impl TryFrom<u32> for Opcode {
    type Error = WireError;

    fn try_from(v: u32) -> Result<Self, WireError> {
        Ok(match v {
            0 => Opcode::RegisterMaster,
            1 => Opcode::RegisterWorker,
            2 => Opcode::PostRdmaWrite,
            3 => Opcode::PostRdmaWriteInlined,
            4 => Opcode::PostRdmaRead,
            5 => Opcode::PostAtomicCmpSwp,
            6 => Opcode::PostAtomicFetchAdd,
            7 => Opcode::PostSend,
            8 => Opcode::PostSendInlined,
            9 => Opcode::PostRecv,
            10 => Opcode::NotificationRdmaWrite,
            11 => Opcode::RequestRdmaRead,
            12 => Opcode::ResponseRdmaRead,
            13 => Opcode::RequestAtomicCmpSwp,
            14 => Opcode::RequestAtomicFetchAdd,
            15 => Opcode::ResponseAtomicCmpSwp,
            16 => Opcode::ResponseAtomicFetchAdd,
            17 => Opcode::NotificationSend,
            18 => Opcode::ResponseSend,
            19 => Opcode::StopDevice,
            other => return Err(WireError::UnknownOpcode(other)),
        })
    }
}

/// A work request: the operation descriptor posted to the device and the
/// fixed header of every peer-to-peer transport message.
///
/// Addresses are raw addresses in the *owning* process: `local_addr` is
/// meaningful to the source rank, `remote_addr` to the target rank. For
/// inlined operations `local_addr` carries an inline-buffer token instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRequest {
    pub wr_id: u64,
    pub cq_handle: u32,
    pub opcode: Opcode,
    pub source: u16,
    pub target: u16,
    pub length: u32,
    pub local_addr: u64,
    pub remote_addr: u64,
    pub compare_add: u64,
    pub swap: u64,
}

impl WorkRequest {
    /// A zeroed request with the given opcode.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            wr_id: 0,
            cq_handle: crate::CQ_NONE,
            opcode,
            source: 0,
            target: 0,
            length: 0,
            local_addr: 0,
            remote_addr: 0,
            compare_add: 0,
            swap: 0,
        }
    }

    /// Encode to the fixed 64-byte wire layout.
    pub fn to_bytes(&self) -> [u8; WR_SIZE] {
        let mut b = [0u8; WR_SIZE];
        b[0..8].copy_from_slice(&self.wr_id.to_le_bytes());
        b[8..12].copy_from_slice(&self.cq_handle.to_le_bytes());
        b[12..16].copy_from_slice(&(self.opcode as u32).to_le_bytes());
        b[16..18].copy_from_slice(&self.source.to_le_bytes());
        b[18..20].copy_from_slice(&self.target.to_le_bytes());
        b[20..24].copy_from_slice(&self.length.to_le_bytes());
        b[24..32].copy_from_slice(&self.local_addr.to_le_bytes());
        b[32..40].copy_from_slice(&self.remote_addr.to_le_bytes());
        b[40..48].copy_from_slice(&self.compare_add.to_le_bytes());
        b[48..56].copy_from_slice(&self.swap.to_le_bytes());
        b
    }

    /// Decode from the fixed 64-byte wire layout.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        check_len(buf, WR_SIZE)?;
        Ok(Self {
            wr_id: get_u64(buf, 0),
            cq_handle: get_u32(buf, 8),
            opcode: Opcode::try_from(get_u32(buf, 12))?,
            source: get_u16(buf, 16),
            target: get_u16(buf, 18),
            length: get_u32(buf, 20),
            local_addr: get_u64(buf, 24),
            remote_addr: get_u64(buf, 32),
            compare_add: get_u64(buf, 40),
            swap: get_u64(buf, 48),
        })
    }
}

/// Operation class reported in a work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
    RdmaWrite,
    RdmaRead,
    CmpSwap,
    FetchAdd,
}

/// Completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// The remote side failed or disappeared mid-operation.
    RemOpError,
}

/// A work completion, delivered through a completion queue.
///
/// Completions never travel on the wire; they are produced by the local
/// device when an operation finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    /// Source rank, set for `Recv` completions.
    pub sender: u16,
}

impl WorkCompletion {
    pub fn success(wr_id: u64, opcode: WcOpcode) -> Self {
        Self {
            wr_id,
            status: WcStatus::Success,
            opcode,
            sender: 0,
        }
    }

    pub fn error(wr_id: u64, opcode: WcOpcode) -> Self {
        Self {
            wr_id,
            status: WcStatus::RemOpError,
            opcode,
            sender: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wr_roundtrip() {
        let wr = WorkRequest {
            wr_id: 0xdead_beef_0102_0304,
            cq_handle: 7,
            opcode: Opcode::PostRdmaWrite,
            source: 3,
            target: 11,
            length: 4096,
            local_addr: 0x7f00_0000_1000,
            remote_addr: 0x7f00_0000_2000,
            compare_add: 1,
            swap: 2,
        };

        let bytes = wr.to_bytes();
        assert_eq!(bytes.len(), WR_SIZE);
        assert_eq!(WorkRequest::from_bytes(&bytes).unwrap(), wr);
    }

    #[test]
    fn test_wr_rejects_unknown_opcode() {
        let mut bytes = WorkRequest::new(Opcode::PostSend).to_bytes();
        bytes[12..16].copy_from_slice(&999u32.to_le_bytes());
        assert_eq!(
            WorkRequest::from_bytes(&bytes),
            Err(WireError::UnknownOpcode(999))
        );
    }

    #[test]
    fn test_wr_rejects_short_buffer() {
        let bytes = WorkRequest::new(Opcode::PostSend).to_bytes();
        assert!(matches!(
            WorkRequest::from_bytes(&bytes[..32]),
            Err(WireError::Truncated { need: 64, got: 32 })
        ));
    }
}
