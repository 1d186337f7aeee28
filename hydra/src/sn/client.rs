//! Side-network client commands.
//!
//! One cached connection per peer; a command writes a [`CdHeader`]
//! (plus an op-specific body) and reads the op's reply. A socket that
//! fails is dropped so the next command reconnects.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use tracing::debug;

use hydra_wire::sn::{
    CdHeader, GroupDesc, MsegDesc, RcInfo, SnOp, GROUP_DESC_SIZE, MSEG_DESC_SIZE, RC_INFO_SIZE,
};

use crate::ctx::{Ctx, SegmentDesc, EP_CONNECTED, EP_DISCONNECTED};
use crate::sync::Deadline;
use crate::{Error, GroupId, Result};

/// Try to raise the open-files limit to its hard maximum.
fn raise_nofile_limit() -> bool {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) if soft < hard => setrlimit(Resource::RLIMIT_NOFILE, hard, hard).is_ok(),
        _ => false,
    }
}

/// Connect to a host/port, retrying until the deadline. On file-
/// descriptor exhaustion the limit is raised once before giving up.
pub(crate) fn connect_to_port(host: &str, port: u16, deadline: &Deadline) -> Result<TcpStream> {
    let mut raised = false;
    loop {
        match TcpStream::connect((host, port)) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                if raised || !raise_nofile_limit() {
                    return Err(Error::Emfile);
                }
                raised = true;
            }
            Err(e) => {
                if deadline.expired() {
                    debug!("connect to {host}:{port} gave up: {e}");
                    return Err(Error::Timeout);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

pub(crate) fn write_full(stream: &mut TcpStream, buf: &[u8]) -> Result<()> {
    stream.write_all(buf).map_err(io_to_err)
}

pub(crate) fn read_full(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    stream.read_exact(buf).map_err(io_to_err)
}

fn io_to_err(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Error::Timeout,
        _ => Error::Io(e),
    }
}

/// Run `f` against the cached connection to `rank`'s side network,
/// establishing it first if needed. A failed exchange drops the cache.
fn with_socket<T>(
    ctx: &Ctx,
    rank: u16,
    deadline: &Deadline,
    f: impl FnOnce(&mut TcpStream) -> Result<T>,
) -> Result<T> {
    if rank >= ctx.tnc {
        return Err(Error::InvalidRank);
    }

    let mut guard = ctx.sn_sockets[rank as usize]
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    if guard.is_none() {
        let host = &ctx.hosts[rank as usize];
        let port = ctx.config.sn_port + u16::from(host.port_offset);
        *guard = Some(connect_to_port(&host.hostname, port, deadline)?);
    }

    let stream = guard.as_mut().expect("socket cached above");
    let budget = deadline.remaining_ms();
    let io_timeout = if budget == u64::MAX {
        None
    } else {
        Some(Duration::from_millis(budget.max(1)))
    };
    let _ = stream.set_read_timeout(io_timeout);
    let _ = stream.set_write_timeout(io_timeout);

    match f(stream) {
        Ok(v) => Ok(v),
        Err(e) => {
            *guard = None;
            Err(e)
        }
    }
}

/// Establish transport endpoints with `rank`: exchange connection
/// material and mark the endpoint connected.
pub(crate) fn connect_cmd(ctx: &Ctx, rank: u16, deadline: &Deadline) -> Result<()> {
    with_socket(ctx, rank, deadline, |stream| {
        let mut cdh = CdHeader::new(SnOp::Connect);
        cdh.op_len = RC_INFO_SIZE as u32;
        cdh.rank = u32::from(ctx.rank);
        cdh.tnc = u32::from(ctx.tnc);
        write_full(stream, &cdh.to_bytes())?;

        let local = RcInfo {
            rank: ctx.rank,
            dev_port: ctx.device.local_port(),
        };
        write_full(stream, &local.to_bytes())?;

        let mut reply = [0u8; RC_INFO_SIZE];
        read_full(stream, &mut reply)?;
        let remote = RcInfo::from_bytes(&reply)?;
        if remote.rank != rank {
            return Err(Error::Protocol(format!(
                "connect reply names rank {}, expected {rank}",
                remote.rank
            )));
        }
        Ok(())
    })?;

    ctx.ep_status[rank as usize].store(EP_CONNECTED, std::sync::atomic::Ordering::Release);
    debug!(rank = ctx.rank, peer = rank, "endpoint connected");
    Ok(())
}

/// Header-only command: disconnect, ping or kill.
fn single_cmd(ctx: &Ctx, rank: u16, op: SnOp, deadline: &Deadline) -> Result<()> {
    with_socket(ctx, rank, deadline, |stream| {
        let mut cdh = CdHeader::new(op);
        cdh.op_len = 1;
        cdh.rank = u32::from(ctx.rank);
        cdh.tnc = u32::from(ctx.tnc);
        write_full(stream, &cdh.to_bytes())
    })
}

pub(crate) fn disconnect_cmd(ctx: &Ctx, rank: u16, deadline: &Deadline) -> Result<()> {
    single_cmd(ctx, rank, SnOp::Disconnect, deadline)?;
    ctx.ep_status[rank as usize].store(EP_DISCONNECTED, std::sync::atomic::Ordering::Release);
    Ok(())
}

/// Liveness probe. Fire-and-forget, like the wire protocol.
pub(crate) fn ping_cmd(ctx: &Ctx, rank: u16, deadline: &Deadline) -> Result<()> {
    single_cmd(ctx, rank, SnOp::ProcPing, deadline)
}

/// Ask a peer process to exit.
pub(crate) fn kill_cmd(ctx: &Ctx, rank: u16, deadline: &Deadline) -> Result<()> {
    single_cmd(ctx, rank, SnOp::ProcKill, deadline)
}

/// Install one of our segment descriptors on `rank`.
pub(crate) fn seg_register_cmd(
    ctx: &Ctx,
    rank: u16,
    desc: &SegmentDesc,
    deadline: &Deadline,
) -> Result<()> {
    with_socket(ctx, rank, deadline, |stream| {
        let mut cdh = CdHeader::new(SnOp::SegRegister);
        cdh.rank = u32::from(ctx.rank);
        cdh.seg_id = u32::from(desc.seg_id);
        cdh.addr = desc.addr;
        cdh.size = desc.size;
        cdh.notif_addr = desc.notif_addr;
        write_full(stream, &cdh.to_bytes())?;

        let mut reply = [0u8; 4];
        read_full(stream, &mut reply)?;
        let status = i32::from_le_bytes(reply);
        if status != 0 {
            return Err(Error::Protocol(format!(
                "segment registration refused: {status}"
            )));
        }
        Ok(())
    })
}

/// Compare group membership with `rank`, retrying with back-off until
/// the checksums agree or the deadline hits.
pub(crate) fn grp_check(
    ctx: &Ctx,
    rank: u16,
    group: GroupId,
    tnc_g: i32,
    cs: i32,
    deadline: &Deadline,
) -> Result<()> {
    let backoff = Duration::from_millis(ctx.config.grp_check_backoff_ms);

    loop {
        let remote = with_socket(ctx, rank, deadline, |stream| {
            let mut cdh = CdHeader::new(SnOp::GrpCheck);
            cdh.op_len = GROUP_DESC_SIZE as u32;
            cdh.rank = u32::from(group);
            cdh.tnc = tnc_g as u32;
            cdh.ret = cs;
            write_full(stream, &cdh.to_bytes())?;

            let mut reply = [0u8; GROUP_DESC_SIZE];
            read_full(stream, &mut reply)?;
            Ok(GroupDesc::from_bytes(&reply)?)
        })?;

        if remote.ret >= 0 && remote.cs == cs {
            return Ok(());
        }

        if deadline.expired() {
            return Err(Error::Timeout);
        }
        std::thread::sleep(backoff);
    }
}

/// Fetch `rank`'s staging descriptor for `group`.
pub(crate) fn grp_connect(
    ctx: &Ctx,
    rank: u16,
    group: GroupId,
    deadline: &Deadline,
) -> Result<MsegDesc> {
    with_socket(ctx, rank, deadline, |stream| {
        let mut cdh = CdHeader::new(SnOp::GrpConnect);
        cdh.op_len = MSEG_DESC_SIZE as u32;
        cdh.rank = u32::from(ctx.rank);
        cdh.ret = i32::from(group);
        write_full(stream, &cdh.to_bytes())?;

        let mut reply = [0u8; MSEG_DESC_SIZE];
        read_full(stream, &mut reply)?;
        Ok(MsegDesc::from_bytes(&reply)?)
    })
}

/// Announce an additional communication queue to `rank`.
pub(crate) fn queue_create_cmd(
    ctx: &Ctx,
    rank: u16,
    num_queues: u32,
    deadline: &Deadline,
) -> Result<()> {
    with_socket(ctx, rank, deadline, |stream| {
        let mut cdh = CdHeader::new(SnOp::QueueCreate);
        cdh.op_len = RC_INFO_SIZE as u32;
        cdh.rank = u32::from(ctx.rank);
        cdh.tnc = num_queues;
        write_full(stream, &cdh.to_bytes())?;

        let local = RcInfo {
            rank: ctx.rank,
            dev_port: ctx.device.local_port(),
        };
        write_full(stream, &local.to_bytes())?;

        let mut reply = [0u8; 4];
        read_full(stream, &mut reply)?;
        if i32::from_le_bytes(reply) != 0 {
            return Err(Error::Protocol("queue creation refused".into()));
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Timeout;
    use hydra_wire::sn::CD_HEADER_SIZE;

    #[test]
    fn test_connect_to_closed_port_times_out() {
        let deadline = Timeout::from_millis(50).deadline();
        let err = connect_to_port("127.0.0.1", 1, &deadline).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn test_full_io_roundtrip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; CD_HEADER_SIZE];
            read_full(&mut stream, &mut buf).unwrap();
            let cdh = CdHeader::from_bytes(&buf).unwrap();
            assert_eq!(cdh.op, SnOp::ProcPing);
            write_full(&mut stream, &0i32.to_le_bytes()).unwrap();
        });

        let deadline = Timeout::from_millis(2000).deadline();
        let mut stream = connect_to_port("127.0.0.1", addr.port(), &deadline).unwrap();

        let cdh = CdHeader::new(SnOp::ProcPing);
        write_full(&mut stream, &cdh.to_bytes()).unwrap();
        let mut reply = [0u8; 4];
        read_full(&mut stream, &mut reply).unwrap();
        assert_eq!(i32::from_le_bytes(reply), 0);

        server.join().unwrap();
    }
}
