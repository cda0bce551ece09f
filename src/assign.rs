//! Physical/virtual assignment maps.
//!
//! An [Assignment] records, at one program point, which work register every
//! physical register holds and which physical register every work register
//! sits in. The two directions are kept strictly inverse; `verify` checks
//! that and the local allocator runs it after every instruction in debug
//! builds.
//!
//! Each work register also carries a dirty bit: set when the value in the
//! register is newer than the value in its stack home, which is exactly when
//! an eviction has to store before it can reuse the register.

use index_vec::{index_vec, IndexVec};
use vob::Vob;

use crate::reg::{ByGroup, PhysId, RegGroup, RegMask};
use crate::workreg::WorkIdx;
use crate::AllocError;

/// Up to 32 physical registers per group, matching [RegMask].
const PHYS_PER_GROUP: usize = 32;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Assignment {
    phys_to_work: ByGroup<[Option<WorkIdx>; PHYS_PER_GROUP]>,
    work_to_phys: IndexVec<WorkIdx, Option<PhysId>>,
    /// Which physical ids are occupied, per group. Redundant with
    /// `phys_to_work` but makes free-register choice a mask operation.
    assigned: ByGroup<RegMask>,
    dirty: Vob,
}

impl Assignment {
    pub fn new(work_count: usize) -> Self {
        Assignment {
            phys_to_work: ByGroup::new(),
            work_to_phys: index_vec![None; work_count],
            assigned: ByGroup::new(),
            dirty: Vob::from_elem(false, work_count),
        }
    }

    /// The physical register currently holding `w`, or `None` when spilled.
    pub fn phys_of(&self, w: WorkIdx) -> Option<PhysId> {
        self.work_to_phys[w]
    }

    /// The work register currently held by `(g, p)`.
    pub fn work_at(&self, g: RegGroup, p: PhysId) -> Option<WorkIdx> {
        self.phys_to_work[g][p.index()]
    }

    /// Occupied ids of a group.
    pub fn assigned(&self, g: RegGroup) -> RegMask {
        self.assigned[g]
    }

    pub fn is_dirty(&self, w: WorkIdx) -> bool {
        self.dirty.get(w.index()).unwrap_or(false)
    }

    pub fn set_dirty(&mut self, w: WorkIdx, dirty: bool) {
        self.dirty.set(w.index(), dirty);
    }

    /// Place `w` into a free `(g, p)`.
    pub fn assign(&mut self, g: RegGroup, w: WorkIdx, p: PhysId, dirty: bool) {
        debug_assert!(self.work_to_phys[w].is_none());
        debug_assert!(self.phys_to_work[g][p.index()].is_none());
        self.phys_to_work[g][p.index()] = Some(w);
        self.work_to_phys[w] = Some(p);
        self.assigned[g].add(p);
        self.dirty.set(w.index(), dirty);
    }

    /// Remove `w` from `(g, p)`. The dirty bit is cleared; callers that
    /// needed a store have already emitted it.
    pub fn unassign(&mut self, g: RegGroup, w: WorkIdx, p: PhysId) {
        debug_assert_eq!(self.work_to_phys[w], Some(p));
        debug_assert_eq!(self.phys_to_work[g][p.index()], Some(w));
        self.phys_to_work[g][p.index()] = None;
        self.work_to_phys[w] = None;
        self.assigned[g].remove(p);
        self.dirty.set(w.index(), false);
    }

    /// Move `w` from `src` to the free id `dst` within its group, keeping
    /// the dirty bit.
    pub fn reassign(&mut self, g: RegGroup, w: WorkIdx, dst: PhysId, src: PhysId) {
        debug_assert_ne!(dst, src);
        debug_assert_eq!(self.work_to_phys[w], Some(src));
        debug_assert!(self.phys_to_work[g][dst.index()].is_none());
        self.phys_to_work[g][src.index()] = None;
        self.phys_to_work[g][dst.index()] = Some(w);
        self.work_to_phys[w] = Some(dst);
        self.assigned[g].remove(src);
        self.assigned[g].add(dst);
    }

    /// Exchange the contents of two occupied ids of one group.
    pub fn swap(&mut self, g: RegGroup, a_work: WorkIdx, a_phys: PhysId, b_work: WorkIdx, b_phys: PhysId) {
        debug_assert_eq!(self.work_to_phys[a_work], Some(a_phys));
        debug_assert_eq!(self.work_to_phys[b_work], Some(b_phys));
        self.phys_to_work[g][a_phys.index()] = Some(b_work);
        self.phys_to_work[g][b_phys.index()] = Some(a_work);
        self.work_to_phys[a_work] = Some(b_phys);
        self.work_to_phys[b_work] = Some(a_phys);
    }

    /// Check that the two maps are inverse on their occupied entries.
    pub fn verify(&self, group_of: impl Fn(WorkIdx) -> RegGroup) -> Result<(), AllocError> {
        for (w, p) in self.work_to_phys.iter_enumerated() {
            if let Some(p) = p {
                if self.phys_to_work[group_of(w)][p.index()] != Some(w) {
                    return Err(AllocError::InconsistentState);
                }
            }
        }
        for (g, slots) in self.phys_to_work.iter() {
            for (i, slot) in slots.iter().enumerate() {
                if let Some(w) = slot {
                    if self.work_to_phys[*w] != Some(PhysId(i as u8)) {
                        return Err(AllocError::InconsistentState);
                    }
                    if !self.assigned[g].contains(PhysId(i as u8)) {
                        return Err(AllocError::InconsistentState);
                    }
                }
            }
        }
        Ok(())
    }

    /// Iterate occupied `(group, phys, work)` triples in deterministic
    /// order.
    pub fn iter_assigned(&self) -> impl Iterator<Item = (RegGroup, PhysId, WorkIdx)> + '_ {
        self.phys_to_work.iter().flat_map(|(g, slots)| {
            slots
                .iter()
                .enumerate()
                .filter_map(move |(i, w)| (*w).map(|w| (g, PhysId(i as u8), w)))
        })
    }
}
