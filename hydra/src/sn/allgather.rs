//! Ring allgather over the side network.
//!
//! A bootstrap-grade collective: group members connect in a ring on
//! `allgather_port + offset`, each contributes `size` bytes, and parts
//! circulate until every member holds all contributions. No ordering of
//! parts in the receive buffer is guaranteed. Also provides the
//! side-network barrier used at init, which is an allgather of one byte.

use std::net::TcpStream;
use std::time::Duration;

use tracing::debug;

use crate::ctx::Ctx;
use crate::sn::client::{connect_to_port, read_full, write_full};
use crate::sn::server;
use crate::sync::Deadline;
use crate::{Error, GroupId, Result, GROUP_ALL};

/// Accept a single ring connection on `port` before the deadline.
fn wait_connection(port: u16, deadline: &Deadline) -> Result<TcpStream> {
    let listener = server::bind(port)?;

    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if deadline.expired() {
                    return Err(Error::Timeout);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// Gather `src` from every member of `g` into `recv`.
///
/// `recv` must hold `group_size * src.len()` bytes. `recv` starts with
/// our own part; the rest arrives in ring order.
pub(crate) fn allgather(
    ctx: &Ctx,
    g: GroupId,
    src: &[u8],
    recv: &mut [u8],
    deadline: &Deadline,
) -> Result<()> {
    let (members, rank_in_grp) = {
        let slot = ctx.group_slot(g)?;
        let state = slot.state.read();
        let state = state.as_ref().ok_or(Error::InvalidGroup)?;
        let rig = state.rank_in_grp.ok_or(Error::InvalidGroup)?;
        (state.members.clone(), rig)
    };

    let tnc_g = members.len();
    let size = src.len();
    if recv.len() != tnc_g * size {
        return Err(Error::InvalidSize);
    }
    if tnc_g == 1 {
        recv.copy_from_slice(src);
        return Ok(());
    }

    let right = members[(rank_in_grp + 1) % tnc_g];
    let my_off = u16::from(ctx.hosts[ctx.rank as usize].port_offset);
    let right_off = u16::from(ctx.hosts[right as usize].port_offset);
    let right_host = ctx.hosts[right as usize].hostname.clone();

    let wait_port = ctx.config.allgather_port + my_off;
    let connect_port = ctx.config.allgather_port + right_off;

    // Ring formation: even members accept first, odd members connect
    // first. With an odd member count the last member flips so the ring
    // never deadlocks.
    let accept_first =
        rank_in_grp % 2 == 0 && !(rank_in_grp == tnc_g - 1 && tnc_g % 2 != 0);

    let (mut left, mut right_sock) = if accept_first {
        let left = wait_connection(wait_port, deadline)?;
        let right = connect_to_port(&right_host, connect_port, deadline)?;
        (left, right)
    } else {
        let right = connect_to_port(&right_host, connect_port, deadline)?;
        let left = wait_connection(wait_port, deadline)?;
        (left, right)
    };

    let budget = deadline.remaining_ms();
    let io_timeout = if budget == u64::MAX {
        None
    } else {
        Some(Duration::from_millis(budget.max(1)))
    };
    let _ = left.set_read_timeout(io_timeout);
    let _ = right_sock.set_write_timeout(io_timeout);

    // our own part first
    write_full(&mut right_sock, src)?;
    recv[..size].copy_from_slice(src);

    // then circulate the rest
    for r in 1..tnc_g {
        let chunk = &mut recv[r * size..(r + 1) * size];
        read_full(&mut left, chunk)?;
        let chunk = &recv[r * size..(r + 1) * size];
        write_full(&mut right_sock, chunk)?;
    }

    debug!(rank = ctx.rank, group = g, "allgather complete");
    Ok(())
}

/// Init-time barrier: a one-byte allgather over the whole job. Returns
/// once every rank has entered.
pub(crate) fn sn_barrier(ctx: &Ctx, deadline: &Deadline) -> Result<()> {
    if ctx.tnc == 1 {
        return Ok(());
    }
    let mut sink = vec![0u8; ctx.tnc as usize];
    allgather(ctx, GROUP_ALL, &[1u8], &mut sink, deadline)
}
