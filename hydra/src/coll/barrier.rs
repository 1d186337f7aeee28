//! The dissemination barrier.
//!
//! Round `k` (mask `2^k`): write the barrier counter into the sync slot
//! we own on the member `mask` ahead of us, then poll our own slot for
//! the member `mask` behind us. After `log2` rounds every member has
//! transitively heard from every other.
//!
//! A timed-out poll parks the current mask (high bit set: "resume at
//! poll") in the group and returns; the next call re-enters the round
//! without re-posting.

use std::sync::Arc;

use hydra_dev::Region;

use crate::coll;
use crate::ctx::Ctx;
use crate::group::{CollOp, StagingLayout};
use crate::sync::{lock_timeout, sync_wait, Timeout};
use crate::{Error, GroupId, Result};

pub(crate) fn barrier(ctx: &Ctx, g: GroupId, timeout: Timeout) -> Result<()> {
    let slot = ctx.group_slot(g)?;
    let deadline = timeout.deadline();

    let Some(mut coll_state) = lock_timeout(&slot.coll, &deadline) else {
        return Err(Error::Timeout);
    };

    if !matches!(coll_state.coll_op, CollOp::None | CollOp::Barrier) {
        return Err(Error::ActiveCollective);
    }
    let fresh = matches!(coll_state.coll_op, CollOp::None);
    coll_state.coll_op = CollOp::Barrier;

    // First entry of a new barrier: take the next sync token. The value
    // 0 is skipped so a cleared slot can never satisfy a poll. Resumed
    // calls keep the token their peers already saw.
    if fresh {
        coll_state.barrier_cnt = coll_state.barrier_cnt.wrapping_add(1);
        if coll_state.barrier_cnt == 0 {
            coll_state.barrier_cnt = 1;
        }
    }

    let (members, rank_in_grp, layout, region): (Vec<u16>, usize, StagingLayout, Arc<Region>) = {
        let state = slot.state.read();
        let state = state.as_ref().ok_or(Error::InvalidGroup)?;
        (
            state.members.clone(),
            state.rank_in_grp.ok_or(Error::InvalidGroup)?,
            state.layout,
            state.local.clone(),
        )
    };

    let tnc_g = members.len();
    let togle = coll_state.togle;
    let cnt = coll_state.barrier_cnt;

    region.store_u8(layout.local_flag(togle), cnt);

    let mut mask = (coll_state.lastmask & 0x7fff_ffff) as usize;
    let mut jmp = coll_state.lastmask >> 31 == 1;

    while mask < tnc_g {
        let dst = members[(rank_in_grp + mask) % tnc_g];
        let src = (rank_in_grp + tnc_g - mask) % tnc_g;

        if jmp {
            jmp = false;
        } else {
            let remote = coll::ensure_peer(ctx, g, dst, &deadline)?;

            if coll::post_group_write(
                ctx,
                region.addr() + layout.local_flag(togle) as u64,
                1,
                dst,
                remote.addr + layout.sync_slot(rank_in_grp, togle) as u64,
            )
            .is_err()
            {
                ctx.poison_coll_queue(dst);
                return Err(Error::Device);
            }
        }

        if sync_wait(&region, layout.sync_slot(src, togle), cnt, &deadline).is_err() {
            coll::try_drain(ctx)?;
            coll_state.lastmask = mask as u32 | 0x8000_0000;
            return Err(Error::Timeout);
        }

        mask <<= 1;
    }

    coll::poll_groups(ctx)?;

    coll_state.togle ^= 1;
    coll_state.coll_op = CollOp::None;
    coll_state.lastmask = 0x1;

    Ok(())
}
