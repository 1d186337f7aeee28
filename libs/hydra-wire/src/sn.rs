//! Side-network control-plane records.
//!
//! Every control request starts with a fixed 64-byte [`CdHeader`],
//! optionally followed by an op-specific body. Replies are op-specific
//! fixed records ([`GroupDesc`], [`MsegDesc`], a bare `i32` status, ...).

use crate::{check_len, get_u32, get_u64, WireError, HOST_RECORD_SIZE};

/// Encoded size of a [`CdHeader`].
pub const CD_HEADER_SIZE: usize = 64;

/// Encoded size of a [`GroupDesc`].
pub const GROUP_DESC_SIZE: usize = 16;

/// Encoded size of a [`MsegDesc`].
pub const MSEG_DESC_SIZE: usize = 24;

/// Encoded size of an [`RcInfo`].
pub const RC_INFO_SIZE: usize = 8;

/// Side-network operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SnOp {
    /// Bootstrap topology dissemination.
    Topology = 1,
    /// Establish transport endpoints between two ranks.
    Connect = 2,
    /// Tear down the endpoint to the requesting rank.
    Disconnect = 3,
    /// Install a foreign segment descriptor.
    SegRegister = 4,
    /// Compare group membership checksums before commit.
    GrpCheck = 5,
    /// Fetch the remote group staging descriptor.
    GrpConnect = 6,
    /// Create an additional communication queue.
    QueueCreate = 7,
    /// Liveness probe.
    ProcPing = 8,
    /// Remote exit.
    ProcKill = 9,
}

impl TryFrom<u32> for SnOp {
    type Error = WireError;

    fn try_from(v: u32) -> Result<Self, WireError> {
        Ok(match v {
            1 => SnOp::Topology,
            2 => SnOp::Connect,
            3 => SnOp::Disconnect,
            4 => SnOp::SegRegister,
            5 => SnOp::GrpCheck,
            6 => SnOp::GrpConnect,
            7 => SnOp::QueueCreate,
            8 => SnOp::ProcPing,
            9 => SnOp::ProcKill,
            other => return Err(WireError::UnknownSnOp(other)),
        })
    }
}

/// The control-plane request header.
///
/// Field meaning varies per op; unused fields are zero. `rank` doubles as
/// the group id for `GrpCheck` and `ret` as the group id for `GrpConnect`,
/// mirroring the compact header reuse of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdHeader {
    pub op: SnOp,
    pub op_len: u32,
    pub rank: u32,
    pub tnc: u32,
    pub seg_id: u32,
    pub ret: i32,
    pub addr: u64,
    pub size: u64,
    pub notif_addr: u64,
    pub rkey: [u32; 2],
}

impl CdHeader {
    /// A zeroed header for the given op.
    pub fn new(op: SnOp) -> Self {
        Self {
            op,
            op_len: 0,
            rank: 0,
            tnc: 0,
            seg_id: 0,
            ret: 0,
            addr: 0,
            size: 0,
            notif_addr: 0,
            rkey: [0; 2],
        }
    }

    pub fn to_bytes(&self) -> [u8; CD_HEADER_SIZE] {
        let mut b = [0u8; CD_HEADER_SIZE];
        b[0..4].copy_from_slice(&(self.op as u32).to_le_bytes());
        b[4..8].copy_from_slice(&self.op_len.to_le_bytes());
        b[8..12].copy_from_slice(&self.rank.to_le_bytes());
        b[12..16].copy_from_slice(&self.tnc.to_le_bytes());
        b[16..20].copy_from_slice(&self.seg_id.to_le_bytes());
        b[20..24].copy_from_slice(&self.ret.to_le_bytes());
        b[24..32].copy_from_slice(&self.addr.to_le_bytes());
        b[32..40].copy_from_slice(&self.size.to_le_bytes());
        b[40..48].copy_from_slice(&self.notif_addr.to_le_bytes());
        b[48..52].copy_from_slice(&self.rkey[0].to_le_bytes());
        b[52..56].copy_from_slice(&self.rkey[1].to_le_bytes());
        b
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        check_len(buf, CD_HEADER_SIZE)?;
        Ok(Self {
            op: SnOp::try_from(get_u32(buf, 0))?,
            op_len: get_u32(buf, 4),
            rank: get_u32(buf, 8),
            tnc: get_u32(buf, 12),
            seg_id: get_u32(buf, 16),
            ret: get_u32(buf, 20) as i32,
            addr: get_u64(buf, 24),
            size: get_u64(buf, 32),
            notif_addr: get_u64(buf, 40),
            rkey: [get_u32(buf, 48), get_u32(buf, 52)],
        })
    }
}

/// Group-check body, identical in both directions.
///
/// `cs` is the XOR of all member ranks; a negative `ret` means the remote
/// side has no matching group yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDesc {
    pub group: i32,
    pub tnc: i32,
    pub cs: i32,
    pub ret: i32,
}

impl GroupDesc {
    pub fn to_bytes(&self) -> [u8; GROUP_DESC_SIZE] {
        let mut b = [0u8; GROUP_DESC_SIZE];
        b[0..4].copy_from_slice(&self.group.to_le_bytes());
        b[4..8].copy_from_slice(&self.tnc.to_le_bytes());
        b[8..12].copy_from_slice(&self.cs.to_le_bytes());
        b[12..16].copy_from_slice(&self.ret.to_le_bytes());
        b
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        check_len(buf, GROUP_DESC_SIZE)?;
        Ok(Self {
            group: get_u32(buf, 0) as i32,
            tnc: get_u32(buf, 4) as i32,
            cs: get_u32(buf, 8) as i32,
            ret: get_u32(buf, 12) as i32,
        })
    }
}

/// A registered-memory descriptor: how a peer addresses our staging area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsegDesc {
    pub addr: u64,
    pub size: u64,
    pub notif_addr: u64,
}

impl MsegDesc {
    pub fn to_bytes(&self) -> [u8; MSEG_DESC_SIZE] {
        let mut b = [0u8; MSEG_DESC_SIZE];
        b[0..8].copy_from_slice(&self.addr.to_le_bytes());
        b[8..16].copy_from_slice(&self.size.to_le_bytes());
        b[16..24].copy_from_slice(&self.notif_addr.to_le_bytes());
        b
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        check_len(buf, MSEG_DESC_SIZE)?;
        Ok(Self {
            addr: get_u64(buf, 0),
            size: get_u64(buf, 8),
            notif_addr: get_u64(buf, 16),
        })
    }
}

/// Connection material exchanged by the `Connect` op: enough for the TCP
/// device, which identifies endpoints by rank and port alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcInfo {
    pub rank: u16,
    pub dev_port: u16,
}

impl RcInfo {
    pub fn to_bytes(&self) -> [u8; RC_INFO_SIZE] {
        let mut b = [0u8; RC_INFO_SIZE];
        b[0..2].copy_from_slice(&self.rank.to_le_bytes());
        b[2..4].copy_from_slice(&self.dev_port.to_le_bytes());
        b
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        check_len(buf, RC_INFO_SIZE)?;
        Ok(Self {
            rank: crate::get_u16(buf, 0),
            dev_port: crate::get_u16(buf, 2),
        })
    }
}

/// One topology record: a fixed 64-byte hostname field plus the rank's
/// port offset. Treated as a fixed record, not a string convenience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub hostname: String,
    pub port_offset: u8,
}

impl HostRecord {
    pub fn new(hostname: impl Into<String>, port_offset: u8) -> Self {
        Self {
            hostname: hostname.into(),
            port_offset,
        }
    }

    /// Encode into a 65-byte record; the hostname is truncated to 64 bytes.
    pub fn to_bytes(&self) -> [u8; HOST_RECORD_SIZE] {
        let mut b = [0u8; HOST_RECORD_SIZE];
        let name = self.hostname.as_bytes();
        let n = name.len().min(64);
        b[..n].copy_from_slice(&name[..n]);
        b[64] = self.port_offset;
        b
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        check_len(buf, HOST_RECORD_SIZE)?;
        let end = buf[..64].iter().position(|&c| c == 0).unwrap_or(64);
        Ok(Self {
            hostname: String::from_utf8_lossy(&buf[..end]).into_owned(),
            port_offset: buf[64],
        })
    }
}

/// Encode a full topology table (`tnc` records back to back).
pub fn encode_topology(hosts: &[HostRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(hosts.len() * HOST_RECORD_SIZE);
    for h in hosts {
        out.extend_from_slice(&h.to_bytes());
    }
    out
}

/// Decode a full topology table.
pub fn decode_topology(buf: &[u8], tnc: usize) -> Result<Vec<HostRecord>, WireError> {
    check_len(buf, tnc * HOST_RECORD_SIZE)?;
    (0..tnc)
        .map(|i| HostRecord::from_bytes(&buf[i * HOST_RECORD_SIZE..]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cd_header_roundtrip() {
        let mut cdh = CdHeader::new(SnOp::GrpConnect);
        cdh.rank = 4;
        cdh.ret = -1;
        cdh.addr = 0xabcd_0000;
        cdh.size = 1 << 20;

        let decoded = CdHeader::from_bytes(&cdh.to_bytes()).unwrap();
        assert_eq!(decoded, cdh);
        assert_eq!(decoded.ret, -1);
    }

    #[test]
    fn test_group_desc_negative_ret() {
        let gb = GroupDesc {
            group: 3,
            tnc: 6,
            cs: 0 ^ 1 ^ 2 ^ 3 ^ 4 ^ 5,
            ret: -1,
        };
        assert_eq!(GroupDesc::from_bytes(&gb.to_bytes()).unwrap(), gb);
    }

    #[test]
    fn test_host_record_truncates_long_names() {
        let long = "h".repeat(80);
        let rec = HostRecord::new(long, 3);
        let decoded = HostRecord::from_bytes(&rec.to_bytes()).unwrap();
        assert_eq!(decoded.hostname.len(), 64);
        assert_eq!(decoded.port_offset, 3);
    }

    #[test]
    fn test_topology_table() {
        let hosts = vec![
            HostRecord::new("node-a", 0),
            HostRecord::new("node-a", 1),
            HostRecord::new("node-b", 0),
        ];
        let buf = encode_topology(&hosts);
        assert_eq!(buf.len(), 3 * HOST_RECORD_SIZE);
        assert_eq!(decode_topology(&buf, 3).unwrap(), hosts);
    }
}
