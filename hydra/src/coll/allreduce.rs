//! Rabenseifner-style allreduce.
//!
//! Four resumable levels:
//!
//! 0. Take a sync token; copy the caller's contribution into staging.
//! 1. Fold the group down to a power of two: among the first `2·rest`
//!    members, even members push their value to their odd neighbor and
//!    drop out; odd members fold it in.
//! 2. Recursive-halving butterfly among the surviving `next_pof2`
//!    members, one staging slot (`bid`) per round.
//! 3. Redistribute: odd members push the final value back to their even
//!    neighbor.
//!
//! A timeout at any poll parks `level` / `bid` / `tmprank` / `lastmask`
//! / `dsize` in the group; re-entry dispatches on `level` and the
//! high bit of `lastmask` ("resume at poll") and continues. The caller's
//! receive buffer is written only on success.

use std::sync::Arc;

use hydra_dev::Region;
use hydra_wire::{ALLREDUCE_ELEM_MAX, REDUX_BUF_SIZE};

use crate::coll::{self, ops};
use crate::ctx::Ctx;
use crate::group::{CollOp, CollState, StagingLayout};
use crate::sync::{lock_timeout, sync_wait, Deadline, Timeout};
use crate::{Error, GroupId, Result};

/// The reduction to apply: a built-in operator or a caller-supplied
/// combiner `f(local, incoming, out)`.
pub(crate) enum Redux<'a> {
    Op(ops::ReduceOp, ops::DataType),
    User(&'a mut dyn FnMut(&[u8], &[u8], &mut [u8]) -> Result<()>),
}

pub(crate) fn allreduce(
    ctx: &Ctx,
    g: GroupId,
    send: &[u8],
    recv: &mut [u8],
    elem_cnt: usize,
    elem_size: usize,
    mut redux: Redux<'_>,
    timeout: Timeout,
) -> Result<()> {
    if elem_cnt == 0 || elem_cnt > ALLREDUCE_ELEM_MAX {
        return Err(Error::InvalidNum);
    }
    let dsize = elem_cnt * elem_size;
    if dsize > REDUX_BUF_SIZE || send.len() < dsize || recv.len() < dsize {
        return Err(Error::InvalidSize);
    }

    let slot = ctx.group_slot(g)?;
    let deadline = timeout.deadline();

    let Some(mut coll_state) = lock_timeout(&slot.coll, &deadline) else {
        return Err(Error::Timeout);
    };

    let wanted = match redux {
        Redux::Op(..) => CollOp::Allreduce,
        Redux::User(_) => CollOp::AllreduceUser,
    };
    if !matches!(coll_state.coll_op, CollOp::None) && coll_state.coll_op != wanted {
        return Err(Error::ActiveCollective);
    }
    let fresh = matches!(coll_state.coll_op, CollOp::None);
    coll_state.coll_op = wanted;

    let (members, rank_in_grp, layout, region, next_pof2, pof2_exp) = {
        let state = slot.state.read();
        let state = state.as_ref().ok_or(Error::InvalidGroup)?;
        (
            state.members.clone(),
            state.rank_in_grp.ok_or(Error::InvalidGroup)?,
            state.layout,
            state.local.clone(),
            state.next_pof2,
            state.pof2_exp as usize,
        )
    };

    let run = Run {
        ctx,
        g,
        members,
        rank_in_grp,
        layout,
        region,
        next_pof2,
        pof2_exp,
        dsize,
    };

    let result = run.drive(&mut coll_state, fresh, send, recv, &mut redux, &deadline);

    if !matches!(result, Err(Error::Timeout)) && result.is_err() {
        // Non-resumable failure: clear the parked progress.
        coll_state.reset_progress();
    }
    result
}

struct Run<'a> {
    ctx: &'a Ctx,
    g: GroupId,
    members: Vec<u16>,
    rank_in_grp: usize,
    layout: StagingLayout,
    region: Arc<Region>,
    next_pof2: usize,
    pof2_exp: usize,
    dsize: usize,
}

impl Run<'_> {
    fn drive(
        &self,
        coll: &mut CollState,
        fresh: bool,
        send: &[u8],
        recv: &mut [u8],
        redux: &mut Redux<'_>,
        deadline: &Deadline,
    ) -> Result<()> {
        let tnc_g = self.members.len();
        let togle = coll.togle;
        let rank_in_grp = self.rank_in_grp;
        let rest = tnc_g - self.next_pof2;

        // Take the next sync token, skipping 0; resumed calls keep the
        // token their peers already saw.
        if fresh {
            coll.barrier_cnt = coll.barrier_cnt.wrapping_add(1);
            if coll.barrier_cnt == 0 {
                coll.barrier_cnt = 1;
            }
        }

        // The contribution is (re)staged on every entry; a resumed call
        // finds its partials beyond `coll.dsize` untouched.
        let send_base = self.layout.send_base(togle);
        self.region.write(send_base, &send[..self.dsize]);

        let mut cursor = send_base;
        let mut bid = 0usize;
        let mut tmprank: i32;

        if coll.level >= 2 {
            bid = coll.bid;
            tmprank = coll.tmprank;
            cursor += coll.dsize;

            if coll.level == 2 {
                self.butterfly(coll, &mut cursor, &mut bid, tmprank, redux, deadline)?;
                return self.redistribute(coll, cursor, bid, recv, deadline);
            }
            return self.redistribute(coll, cursor, bid, recv, deadline);
        }

        // level 0/1: fold down to the nearest power of two
        if rank_in_grp < 2 * rest {
            if rank_in_grp % 2 == 0 {
                let dst = self.members[rank_in_grp + 1];
                self.write_and_sync(coll, cursor, dst, bid, deadline)?;
                tmprank = -1;
            } else {
                let poll_off = self.layout.sync_slot(rank_in_grp - 1, togle);
                if sync_wait(&self.region, poll_off, coll.barrier_cnt, deadline).is_err() {
                    coll::try_drain(self.ctx)?;
                    coll.level = 1;
                    return Err(Error::Timeout);
                }
                self.apply(coll, &mut cursor, bid, redux)?;
                tmprank = (rank_in_grp >> 1) as i32;
            }
            bid += 1;
        } else {
            tmprank = (rank_in_grp - rest) as i32;
            if rest > 0 {
                bid += 1;
            }
        }

        coll.tmprank = tmprank;
        coll.bid = bid;
        coll.level = 2;

        self.butterfly(coll, &mut cursor, &mut bid, tmprank, redux, deadline)?;
        self.redistribute(coll, cursor, bid, recv, deadline)
    }

    /// Level 2: recursive halving among the power-of-two survivors.
    fn butterfly(
        &self,
        coll: &mut CollState,
        cursor: &mut usize,
        bid: &mut usize,
        tmprank: i32,
        redux: &mut Redux<'_>,
        deadline: &Deadline,
    ) -> Result<()> {
        let togle = coll.togle;
        let rest = self.members.len() - self.next_pof2;

        if tmprank != -1 {
            let mut mask = (coll.lastmask & 0x7fff_ffff) as usize;
            let mut jmp = coll.lastmask >> 31 == 1;

            while mask < self.next_pof2 {
                let tmpdst = (tmprank as usize) ^ mask;
                let idst = if tmpdst < rest {
                    tmpdst * 2 + 1
                } else {
                    tmpdst + rest
                };
                let dst = self.members[idst];

                if jmp {
                    jmp = false;
                } else if let Err(e) = self.write_and_sync(coll, *cursor, dst, *bid, deadline) {
                    if matches!(e, Error::Timeout) {
                        // resume at the post of this round
                        coll.lastmask = mask as u32;
                        coll.bid = *bid;
                    }
                    return Err(e);
                }

                let poll_off = self.layout.sync_slot(idst, togle);
                if sync_wait(&self.region, poll_off, coll.barrier_cnt, deadline).is_err() {
                    coll::try_drain(self.ctx)?;
                    coll.lastmask = mask as u32 | 0x8000_0000;
                    coll.bid = *bid;
                    return Err(Error::Timeout);
                }

                if let Err(e) = self.apply(coll, cursor, *bid, redux) {
                    if matches!(e, Error::Timeout) {
                        // the poll is already satisfied; re-apply on resume
                        coll.lastmask = mask as u32 | 0x8000_0000;
                        coll.bid = *bid;
                    }
                    return Err(e);
                }
                mask <<= 1;
                *bid += 1;
            }
        }

        coll.lastmask = 0x1;
        coll.bid = *bid;
        coll.level = 3;
        Ok(())
    }

    /// Level 3: hand the result back to the members dropped at level 1,
    /// then finish: drain completions, flip togle, deliver the result.
    fn redistribute(
        &self,
        coll: &mut CollState,
        cursor: usize,
        bid: usize,
        recv: &mut [u8],
        deadline: &Deadline,
    ) -> Result<()> {
        let togle = coll.togle;
        let tnc_g = self.members.len();
        let rest = tnc_g - self.next_pof2;
        let rank_in_grp = self.rank_in_grp;

        let mut cursor = cursor;
        let mut bid = bid;

        if rank_in_grp < 2 * rest {
            if rank_in_grp % 2 == 1 {
                let dst = self.members[rank_in_grp - 1];
                self.write_and_sync(coll, cursor, dst, bid, deadline)?;
            } else {
                // The odd partner writes its sync byte at its own group
                // index; poll that slot, not ours.
                let poll_off = self.layout.sync_slot(rank_in_grp + 1, togle);
                if sync_wait(&self.region, poll_off, coll.barrier_cnt, deadline).is_err() {
                    coll::try_drain(self.ctx)?;
                    return Err(Error::Timeout);
                }
                bid += self.pof2_exp;
                cursor = self.layout.recv_slot(bid, togle);
            }
        }

        coll::poll_groups(self.ctx)?;

        coll.togle ^= 1;
        coll.reset_progress();

        self.region.read(cursor, &mut recv[..self.dsize]);
        Ok(())
    }

    /// Push our current partial and sync byte to `dst`'s staging.
    fn write_and_sync(
        &self,
        coll: &CollState,
        cursor: usize,
        dst: u16,
        bid: usize,
        deadline: &Deadline,
    ) -> Result<()> {
        let togle = coll.togle;
        let remote = coll::ensure_peer(self.ctx, self.g, dst, deadline)?;

        let data_dst = remote.addr + self.layout.recv_slot(bid, togle) as u64;
        if coll::post_group_write(
            self.ctx,
            self.region.addr() + cursor as u64,
            self.dsize,
            dst,
            data_dst,
        )
        .is_err()
        {
            self.ctx.poison_coll_queue(dst);
            return Err(Error::Device);
        }

        let flag_off = self.layout.local_flag(togle);
        self.region.store_u8(flag_off, coll.barrier_cnt);

        let flag_dst = remote.addr + self.layout.sync_slot(self.rank_in_grp, togle) as u64;
        if coll::post_group_write(
            self.ctx,
            self.region.addr() + flag_off as u64,
            1,
            dst,
            flag_dst,
        )
        .is_err()
        {
            self.ctx.poison_coll_queue(dst);
            return Err(Error::Device);
        }

        Ok(())
    }

    /// Fold the partner's staged value into ours, advancing the cursor.
    fn apply(
        &self,
        coll: &mut CollState,
        cursor: &mut usize,
        bid: usize,
        redux: &mut Redux<'_>,
    ) -> Result<()> {
        let dsize = self.dsize;
        let stage_off = self.layout.recv_slot(bid, coll.togle);

        let mut local = vec![0u8; dsize];
        let mut incoming = vec![0u8; dsize];
        let mut out = vec![0u8; dsize];
        self.region.read(*cursor, &mut local);
        self.region.read(stage_off, &mut incoming);

        match redux {
            Redux::Op(op, ty) => {
                let count = dsize / ty.size();
                ops::apply(*op, *ty, &mut out, &local, &incoming, count)?;
            }
            Redux::User(f) => f(&local, &incoming, &mut out)?,
        }

        self.region.write(*cursor + dsize, &out);
        *cursor += dsize;
        coll.dsize += dsize;
        Ok(())
    }
}
