//! Per-peer connection state.
//!
//! Each peer socket carries two independent halves. The read half is
//! normally collecting a 64-byte header into its scratch buffer; opcode
//! dispatch can re-target it at a registered region to collect a payload.
//! The write half is disabled until the delayed queue arms it with an
//! outbound payload, at which point `EPOLLOUT` interest is raised.
//!
//! Both halves tolerate partial I/O: `done` advances by whatever the
//! socket accepted, and the half transitions only at `done == length`.

use std::net::TcpStream;
use std::sync::Arc;

use hydra_wire::wr::{WorkRequest, WR_SIZE};
use hydra_wire::CQ_NONE;

use crate::mem::Region;

/// What the read half is currently collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadState {
    /// The 64-byte work-request header, into the scratch buffer.
    Header,
    /// Payload of a remote write, into the addressed region.
    RdmaWrite,
    /// Payload of a read response, into the requesting buffer.
    RdmaRead,
    /// Payload of a matched send, into the posted receive buffer.
    Send,
}

/// What the write half is currently streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteState {
    /// Idle; `EPOLLOUT` is not armed.
    Disabled,
    RdmaWrite,
    RdmaRead,
    Send,
}

/// Destination of read-half payload bytes.
pub(crate) enum ReadDest {
    Scratch,
    Region { region: Arc<Region>, offset: usize },
    /// Consume and drop; used when the nominal buffer is invalid but the
    /// connection must stay framed.
    Discard,
}

pub(crate) struct ReadHalf {
    pub state: ReadState,
    pub wr_id: u64,
    pub cq_handle: u32,
    pub dest: ReadDest,
    pub length: usize,
    pub done: usize,
    pub scratch: [u8; WR_SIZE],
    /// A send notification waiting for a matching posted receive.
    pub parked: Option<WorkRequest>,
}

impl ReadHalf {
    fn new() -> Self {
        Self {
            state: ReadState::Header,
            wr_id: 0,
            cq_handle: CQ_NONE,
            dest: ReadDest::Scratch,
            length: WR_SIZE,
            done: 0,
            scratch: [0u8; WR_SIZE],
            parked: None,
        }
    }

    /// Back to collecting the next header.
    pub fn reset(&mut self) {
        self.state = ReadState::Header;
        self.wr_id = 0;
        self.cq_handle = CQ_NONE;
        self.dest = ReadDest::Scratch;
        self.length = WR_SIZE;
        self.done = 0;
    }

    /// Consume `length` payload bytes without storing them.
    pub fn expect_discard(&mut self, state: ReadState, wr_id: u64, cq_handle: u32, length: usize) {
        self.state = state;
        self.wr_id = wr_id;
        self.cq_handle = cq_handle;
        self.dest = ReadDest::Discard;
        self.length = length;
        self.done = 0;
    }

    /// Re-target at a region to collect `length` payload bytes.
    pub fn expect_payload(
        &mut self,
        state: ReadState,
        wr_id: u64,
        cq_handle: u32,
        region: Arc<Region>,
        offset: usize,
        length: usize,
    ) {
        self.state = state;
        self.wr_id = wr_id;
        self.cq_handle = cq_handle;
        self.dest = ReadDest::Region { region, offset };
        self.length = length;
        self.done = 0;
    }
}

/// Source of write-half payload bytes.
pub(crate) enum WriteSrc {
    None,
    Region { region: Arc<Region>, offset: usize },
}

pub(crate) struct WriteHalf {
    pub state: WriteState,
    pub wr_id: u64,
    pub cq_handle: u32,
    pub src: WriteSrc,
    pub length: usize,
    pub done: usize,
}

impl WriteHalf {
    fn new() -> Self {
        Self {
            state: WriteState::Disabled,
            wr_id: 0,
            cq_handle: CQ_NONE,
            src: WriteSrc::None,
            length: 0,
            done: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == WriteState::Disabled
    }

    /// Arm the half with an outbound payload.
    pub fn arm(
        &mut self,
        state: WriteState,
        wr_id: u64,
        cq_handle: u32,
        region: Arc<Region>,
        offset: usize,
        length: usize,
    ) {
        self.state = state;
        self.wr_id = wr_id;
        self.cq_handle = cq_handle;
        self.src = WriteSrc::Region { region, offset };
        self.length = length;
        self.done = 0;
    }

    /// Back to idle after the payload is fully streamed.
    pub fn disarm(&mut self) {
        self.state = WriteState::Disabled;
        self.wr_id = 0;
        self.cq_handle = CQ_NONE;
        self.src = WriteSrc::None;
        self.length = 0;
        self.done = 0;
    }
}

/// The full per-connection state bound to one epoll registration.
pub(crate) struct ConnState {
    pub stream: TcpStream,
    /// Peer rank, once known through registration.
    pub rank: Option<u16>,
    pub read: ReadHalf,
    pub write: WriteHalf,
}

impl ConnState {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            rank: None,
            read: ReadHalf::new(),
            write: WriteHalf::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_half_starts_at_header() {
        let half = ReadHalf::new();
        assert_eq!(half.state, ReadState::Header);
        assert_eq!(half.length, WR_SIZE);
        assert_eq!(half.done, 0);
    }

    #[test]
    fn test_expect_payload_then_reset() {
        let region = Region::alloc(4096).unwrap();
        let mut half = ReadHalf::new();

        half.expect_payload(ReadState::RdmaWrite, 9, 2, region, 64, 512);
        assert_eq!(half.state, ReadState::RdmaWrite);
        assert_eq!(half.length, 512);

        half.reset();
        assert_eq!(half.state, ReadState::Header);
        assert_eq!(half.cq_handle, CQ_NONE);
        assert!(matches!(half.dest, ReadDest::Scratch));
    }

    #[test]
    fn test_write_half_arm_disarm() {
        let region = Region::alloc(4096).unwrap();
        let mut half = WriteHalf::new();
        assert!(half.is_idle());

        half.arm(WriteState::Send, 1, 0, region, 0, 128);
        assert!(!half.is_idle());

        half.disarm();
        assert!(half.is_idle());
    }
}
