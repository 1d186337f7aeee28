//! Group collectives.
//!
//! The collective engine posts one-sided writes through a dedicated
//! queue/completion-queue pair and synchronizes through sync bytes in
//! the groups' staging regions. Both collectives checkpoint their
//! progress in the group and resume after a timeout.

pub mod ops;

pub(crate) mod allreduce;
pub(crate) mod barrier;

use std::sync::atomic::Ordering;
use std::time::Instant;

use hydra_wire::sn::MsegDesc;
use hydra_wire::wr::WcStatus;
use tracing::warn;

use crate::ctx::{Ctx, EP_CONNECTED};
use crate::group;
use crate::sync::Deadline;
use crate::{Error, GroupId, Result};

/// Cap on draining outstanding collective completions; a completion is
/// owed for every post, so hitting this means the device is wedged.
const DRAIN_CAP_SECS: u64 = 30;

/// Post a one-sided write on the collective queue.
///
/// The work-request id carries the destination rank so a failed
/// completion can poison the right queue state bit.
pub(crate) fn post_group_write(
    ctx: &Ctx,
    local_addr: u64,
    length: usize,
    dst: u16,
    remote_addr: u64,
) -> Result<()> {
    ctx.coll_queue
        .post_write(
            u64::from(dst),
            ctx.coll_cq.handle(),
            dst,
            local_addr,
            remote_addr,
            length as u32,
        )
        .map_err(|e| {
            warn!("collective post failed: {e}");
            Error::Device
        })?;

    ctx.ne_count_grp.fetch_add(1, Ordering::AcqRel);
    Ok(())
}

/// Drain every outstanding collective completion, blocking until all
/// arrive. An error completion poisons the peer's queue bit.
pub(crate) fn poll_groups(ctx: &Ctx) -> Result<()> {
    let nr = ctx.ne_count_grp.load(Ordering::Acquire);
    let t0 = Instant::now();

    for _ in 0..nr {
        let wc = loop {
            if let Some(wc) = ctx.coll_cq.poll() {
                break wc;
            }
            if t0.elapsed().as_secs() > DRAIN_CAP_SECS {
                return Err(Error::Device);
            }
            std::hint::spin_loop();
        };
        ctx.ne_count_grp.fetch_sub(1, Ordering::AcqRel);

        if wc.status != WcStatus::Success {
            let peer = wc.wr_id as u16;
            if ctx.ep_status[peer as usize].load(Ordering::Acquire) != EP_CONNECTED {
                // Peer already known gone; its failure was handled.
                continue;
            }
            ctx.poison_coll_queue(peer);
            return Err(Error::Device);
        }
    }

    Ok(())
}

/// Non-blocking drain used on the timeout path, so transport failures
/// surface as `Device` rather than an eternal `Timeout`.
pub(crate) fn try_drain(ctx: &Ctx) -> Result<()> {
    while let Some(wc) = ctx.coll_cq.poll() {
        ctx.ne_count_grp.fetch_sub(1, Ordering::AcqRel);

        if wc.status != WcStatus::Success {
            let peer = wc.wr_id as u16;
            ctx.poison_coll_queue(peer);
            return Err(Error::Device);
        }
    }
    Ok(())
}

/// Make `dst` usable for a collective round: endpoint connected, group
/// membership acknowledged, staging descriptor cached.
pub(crate) fn ensure_peer(
    ctx: &Ctx,
    g: GroupId,
    dst: u16,
    deadline: &Deadline,
) -> Result<MsegDesc> {
    if ctx.ep_status[dst as usize].load(Ordering::Acquire) != EP_CONNECTED {
        crate::sn::client::connect_cmd(ctx, dst, deadline)?;
    }

    let committed = {
        let slot = ctx.group_slot(g)?;
        let state = slot.state.read();
        state
            .as_ref()
            .ok_or(Error::InvalidGroup)?
            .committed[dst as usize]
    };
    if !committed {
        group::commit_to(ctx, g, dst, deadline)?;
    }

    let slot = ctx.group_slot(g)?;
    let state = slot.state.read();
    state
        .as_ref()
        .ok_or(Error::InvalidGroup)?
        .remote[dst as usize]
        .ok_or(Error::Device)
}
