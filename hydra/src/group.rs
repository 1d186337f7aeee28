//! Groups: ordered subsets of ranks with private staging memory.
//!
//! Each live group owns a page-aligned staging region registered with
//! the transport. Peers write sync bytes and reduction fragments into
//! each other's staging regions; the layout is a pure function of the
//! job size, so every rank computes identical offsets.

use std::sync::Arc;

use hydra_dev::Region;
use hydra_wire::sn::MsegDesc;
use hydra_wire::{MAX_GROUPS, REDUX_BUF_SIZE};
use tracing::debug;

use crate::ctx::Ctx;
use crate::sync::{lock_timeout, Deadline};
use crate::{Error, GroupId, Result, GROUP_ALL};

/// Offsets into a group's staging region, identical on every rank.
///
/// Layout, in order: two sync bytes per rank (one per togle phase), the
/// two local sync flags, the doubled send scratch run, then the
/// per-stage receive slots indexed by `(bid, togle)`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StagingLayout {
    tnc: usize,
    send_off: usize,
    send_span: usize,
    recv_off: usize,
    pub size: usize,
}

impl StagingLayout {
    pub fn new(tnc: usize) -> Self {
        let exp = tnc.max(1).ilog2() as usize;

        let sync_len = (2 * tnc + 2).div_ceil(64) * 64;
        let send_span = (exp + 2) * REDUX_BUF_SIZE;
        let recv_slots = 4 * exp + 6;

        let send_off = sync_len;
        let recv_off = send_off + 2 * send_span;
        Self {
            tnc,
            send_off,
            send_span,
            recv_off,
            size: recv_off + recv_slots * REDUX_BUF_SIZE,
        }
    }

    /// The sync slot written by group-relative rank `idx`.
    pub fn sync_slot(&self, idx: usize, togle: u8) -> usize {
        2 * idx + togle as usize
    }

    /// The local flag byte whose value is pushed into peers' sync slots.
    pub fn local_flag(&self, togle: u8) -> usize {
        2 * self.tnc + togle as usize
    }

    /// Base of the send scratch run for one togle phase.
    pub fn send_base(&self, togle: u8) -> usize {
        self.send_off + togle as usize * self.send_span
    }

    /// One receive staging slot, by butterfly stage and togle phase.
    pub fn recv_slot(&self, bid: usize, togle: u8) -> usize {
        self.recv_off + (2 * bid + togle as usize) * REDUX_BUF_SIZE
    }
}

/// Which collective currently holds a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum CollOp {
    #[default]
    None,
    Barrier,
    Allreduce,
    AllreduceUser,
}

/// The resumable collective state of one group.
#[derive(Debug, Default)]
pub(crate) struct CollState {
    pub coll_op: CollOp,
    /// Non-zero wrapping sync token; bumped once per collective.
    pub barrier_cnt: u8,
    /// Double-buffer parity, flipped once per completed collective.
    pub togle: u8,
    /// Round checkpoint; high bit means "resume at poll, not at post".
    pub lastmask: u32,
    pub level: u8,
    pub bid: usize,
    pub tmprank: i32,
    pub dsize: usize,
}

impl CollState {
    pub fn reset_progress(&mut self) {
        self.coll_op = CollOp::None;
        self.lastmask = 1;
        self.level = 0;
        self.bid = 0;
        self.tmprank = 0;
        self.dsize = 0;
    }
}

/// Membership and staging memory of a committed (or in-progress) group.
pub(crate) struct GroupState {
    pub id: GroupId,
    /// Member ranks, sorted ascending, duplicate-free.
    pub members: Vec<u16>,
    /// This rank's index within `members`, set at commit.
    pub rank_in_grp: Option<usize>,
    pub next_pof2: usize,
    pub pof2_exp: u32,
    pub layout: StagingLayout,
    /// The local staging region, registered with the device.
    pub local: Arc<Region>,
    /// Peers' staging descriptors, learned via group connect.
    pub remote: Vec<Option<MsegDesc>>,
    /// Which peers have acknowledged our membership.
    pub committed: Vec<bool>,
}

impl GroupState {
    pub fn checksum(&self) -> i32 {
        self.members.iter().fold(0i32, |cs, &r| cs ^ i32::from(r))
    }
}

/// One slot of the fixed group table.
pub(crate) struct GroupSlot {
    /// Teardown exclusion.
    pub del: spin::Mutex<()>,
    /// Membership and staging; read by the side-network server.
    pub state: spin::RwLock<Option<GroupState>>,
    /// The collective lock and its parked progress.
    pub coll: spin::Mutex<CollState>,
}

impl GroupSlot {
    pub fn empty() -> Self {
        Self {
            del: spin::Mutex::new(()),
            state: spin::RwLock::new(None),
            coll: spin::Mutex::new(CollState::default()),
        }
    }
}

// ---- lifecycle -----------------------------------------------------------

/// Reserve a slot and allocate its staging memory.
pub(crate) fn create(ctx: &Ctx) -> Result<GroupId> {
    let mut cnt = ctx.group_cnt.lock();
    if *cnt >= MAX_GROUPS {
        return Err(Error::ManyGroups);
    }

    let id = ctx
        .groups
        .iter()
        .position(|slot| slot.state.read().is_none())
        .ok_or(Error::ManyGroups)? as GroupId;

    let layout = StagingLayout::new(ctx.tnc as usize);
    let local = Region::alloc(layout.size).map_err(|_| Error::MemAlloc)?;
    ctx.device.registry().register(local.clone());

    let state = GroupState {
        id,
        members: Vec::new(),
        rank_in_grp: None,
        next_pof2: 0,
        pof2_exp: 0,
        layout,
        local,
        remote: vec![None; ctx.tnc as usize],
        committed: vec![false; ctx.tnc as usize],
    };

    let slot = &ctx.groups[id as usize];
    *slot.state.write() = Some(state);
    *slot.coll.lock() = CollState {
        lastmask: 1,
        ..CollState::default()
    };

    *cnt += 1;
    debug!(group = id, "group created");
    Ok(id)
}

/// Tear down a group; forbidden on `GROUP_ALL`.
pub(crate) fn delete(ctx: &Ctx, g: GroupId) -> Result<()> {
    if g == GROUP_ALL {
        return Err(Error::InvalidGroup);
    }
    let slot = ctx.group_slot(g)?;

    let _del = slot.del.lock();
    let state = slot.state.write().take().ok_or(Error::InvalidGroup)?;
    ctx.device.registry().unregister(state.local.addr());
    *slot.coll.lock() = CollState::default();
    drop(state);

    let mut cnt = ctx.group_cnt.lock();
    *cnt = cnt.saturating_sub(1);
    debug!(group = g, "group deleted");
    Ok(())
}

/// Add a rank; the member list stays sorted and duplicate-free.
pub(crate) fn add(ctx: &Ctx, g: GroupId, rank: u16) -> Result<()> {
    if rank >= ctx.tnc {
        return Err(Error::InvalidRank);
    }
    let slot = ctx.group_slot(g)?;

    let _cnt = ctx.group_cnt.lock();
    let mut state = slot.state.write();
    let state = state.as_mut().ok_or(Error::InvalidGroup)?;

    if state.members.contains(&rank) {
        return Err(Error::InvalidRank);
    }
    state.members.push(rank);
    state.members.sort_unstable();
    Ok(())
}

fn compute_pof2(members: usize) -> (usize, u32) {
    let mut pof2 = 1usize;
    while pof2 <= members {
        pof2 <<= 1;
    }
    pof2 >>= 1;
    (pof2, pof2.ilog2())
}

/// Fix membership, then check and connect with every peer.
///
/// The group check retries with back-off until both sides hold the same
/// member checksum; the connect pulls the peer's staging descriptor.
pub(crate) fn commit(ctx: &Ctx, g: GroupId, deadline: &Deadline) -> Result<()> {
    let slot = ctx.group_slot(g)?;

    let Some(_cnt) = lock_timeout(&ctx.group_cnt, deadline) else {
        return Err(Error::Timeout);
    };

    let (members, rank_in_grp, cs, tnc_g) = {
        let mut state = slot.state.write();
        let state = state.as_mut().ok_or(Error::InvalidGroup)?;

        if state.members.len() < 2 && ctx.tnc != 1 {
            return Err(Error::InvalidGroup);
        }

        let rank_in_grp = state
            .members
            .iter()
            .position(|&r| r == ctx.rank)
            .ok_or(Error::InvalidGroup)?;
        state.rank_in_grp = Some(rank_in_grp);

        let (pof2, exp) = compute_pof2(state.members.len());
        state.next_pof2 = pof2;
        state.pof2_exp = exp;

        (
            state.members.clone(),
            rank_in_grp,
            state.checksum(),
            state.members.len(),
        )
    };

    for r in 1..=tnc_g {
        let peer = members[(rank_in_grp + r) % tnc_g];
        if peer == ctx.rank {
            continue;
        }

        crate::sn::client::grp_check(ctx, peer, g, tnc_g as i32, cs, deadline)?;
        commit_to(ctx, g, peer, deadline)?;
    }

    debug!(group = g, size = tnc_g, "group committed");
    Ok(())
}

/// Pull `peer`'s staging descriptor and mark it committed.
pub(crate) fn commit_to(ctx: &Ctx, g: GroupId, peer: u16, deadline: &Deadline) -> Result<()> {
    let desc = crate::sn::client::grp_connect(ctx, peer, g, deadline)?;

    let slot = ctx.group_slot(g)?;
    let mut state = slot.state.write();
    let state = state.as_mut().ok_or(Error::InvalidGroup)?;
    state.remote[peer as usize] = Some(desc);
    state.committed[peer as usize] = true;
    Ok(())
}

/// Build `GROUP_ALL` without any control-plane exchange: membership is
/// known a priori and peers connect lazily on first use.
pub(crate) fn create_group_all(ctx: &Ctx) -> Result<()> {
    let id = create(ctx)?;
    if id != GROUP_ALL {
        return Err(Error::InvalidGroup);
    }

    let slot = &ctx.groups[GROUP_ALL as usize];
    let mut state = slot.state.write();
    let state = state.as_mut().ok_or(Error::InvalidGroup)?;

    state.members = (0..ctx.tnc).collect();
    state.rank_in_grp = Some(ctx.rank as usize);
    let (pof2, exp) = compute_pof2(state.members.len());
    state.next_pof2 = pof2;
    state.pof2_exp = exp;
    Ok(())
}

pub(crate) fn size(ctx: &Ctx, g: GroupId) -> Result<usize> {
    let slot = ctx.group_slot(g)?;
    let state = slot.state.read();
    Ok(state.as_ref().ok_or(Error::InvalidGroup)?.members.len())
}

pub(crate) fn ranks(ctx: &Ctx, g: GroupId) -> Result<Vec<u16>> {
    let slot = ctx.group_slot(g)?;
    let state = slot.state.read();
    Ok(state.as_ref().ok_or(Error::InvalidGroup)?.members.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pof2() {
        assert_eq!(compute_pof2(1), (1, 0));
        assert_eq!(compute_pof2(2), (2, 1));
        assert_eq!(compute_pof2(3), (2, 1));
        assert_eq!(compute_pof2(6), (4, 2));
        assert_eq!(compute_pof2(8), (8, 3));
        assert_eq!(compute_pof2(9), (8, 3));
    }

    #[test]
    fn test_layout_offsets_disjoint() {
        let l = StagingLayout::new(6);

        // sync slots and flags stay below the send area
        assert!(l.local_flag(1) < l.send_base(0));
        assert!(l.sync_slot(5, 1) < l.local_flag(0));

        // send runs of the two phases do not overlap
        assert!(l.send_base(0) + l.send_span <= l.send_base(1));

        // receive slots are distinct per (bid, togle)
        assert_eq!(l.recv_slot(0, 1) - l.recv_slot(0, 0), REDUX_BUF_SIZE);
        assert!(l.recv_slot(0, 1) < l.recv_slot(1, 0));

        // worst-case stage index stays inside the region
        let exp = 6usize.ilog2() as usize;
        let max_bid = 1 + 2 * exp;
        assert!(l.recv_slot(max_bid, 1) + REDUX_BUF_SIZE <= l.size);
    }

    #[test]
    fn test_layout_identical_across_ranks() {
        let a = StagingLayout::new(4);
        let b = StagingLayout::new(4);
        assert_eq!(a.sync_slot(2, 1), b.sync_slot(2, 1));
        assert_eq!(a.recv_slot(3, 0), b.recv_slot(3, 0));
        assert_eq!(a.size, b.size);
    }

    #[test]
    fn test_checksum_xor() {
        let state_members = [0u16, 1, 2, 5];
        let cs = state_members.iter().fold(0i32, |cs, &r| cs ^ i32::from(r));
        assert_eq!(cs, 0 ^ 1 ^ 2 ^ 5);
    }
}
