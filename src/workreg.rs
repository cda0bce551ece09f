//! Work registers: the allocator's per-virtual-register records.
//!
//! The first time an instruction mentions a virtual register, the registry
//! interns it as a *work register* with a dense [WorkIdx]. Dense ids are what
//! make the liveness bitsets and the assignment maps cheap; everything
//! downstream of CFG construction speaks work ids only.

use index_vec::IndexVec;
use strum::IntoEnumIterator;

use crate::reg::{PhysId, RegGroup, VirtIdx};
use crate::stack::SlotIdx;
use crate::{AllocError, ByGroup, FuncBody};

index_vec::define_index_type! {
    /// Dense index of a work register.
    pub struct WorkIdx = u32;
}

/// A half-open interval `[start, end)` of linear instruction positions in
/// which a work register carries a value that is still needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiveSpan {
    pub start: u32,
    pub end: u32,
}

impl LiveSpan {
    pub fn overlaps(self, other: LiveSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// The allocator's mirror of one virtual register.
#[derive(Clone, Debug)]
pub struct WorkReg {
    pub virt: VirtIdx,
    pub group: RegGroup,
    /// Live spans in ascending position order, coalesced.
    pub spans: Vec<LiveSpan>,
    /// Number of tied references across the function.
    pub ref_count: u32,
    /// Loop-weighted reference count; the global allocator packs high
    /// priority registers first and the local allocator evicts low priority
    /// ones first.
    pub priority: u64,
    /// Preferred physical register decided by the global allocator.
    pub home: Option<PhysId>,
    /// A fixed use id observed during CFG construction. The global
    /// allocator pins the register to it instead of packing it elsewhere.
    pub fixed_use: Option<PhysId>,
    /// Set when two different fixed use ids were observed; pinning is then
    /// pointless and the register is left to the local allocator.
    pub fixed_use_conflict: bool,
    /// Stack home, created lazily on first spill.
    pub slot: Option<SlotIdx>,
    /// The register's value lives in memory at some point.
    pub stack_used: bool,
}

impl WorkReg {
    /// Total length of all live spans, used as a packing tie-break.
    pub fn span_width(&self) -> u32 {
        self.spans.iter().map(|s| s.end - s.start).sum()
    }

    /// Whether any span overlaps `span`.
    pub fn live_at(&self, span: LiveSpan) -> bool {
        self.spans.iter().any(|s| s.overlaps(span))
    }
}

/// The registry of all work registers of one function.
#[derive(Debug, Default)]
pub struct WorkRegs {
    regs: IndexVec<WorkIdx, WorkReg>,
    by_virt: IndexVec<VirtIdx, Option<WorkIdx>>,
    by_group: ByGroup<Vec<WorkIdx>>,
}

impl WorkRegs {
    pub fn clear(&mut self) {
        self.regs.clear();
        self.by_virt.clear();
        for g in RegGroup::iter() {
            self.by_group[g].clear();
        }
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn get(&self, w: WorkIdx) -> &WorkReg {
        &self.regs[w]
    }

    pub fn get_mut(&mut self, w: WorkIdx) -> &mut WorkReg {
        &mut self.regs[w]
    }

    pub fn iter(&self) -> impl Iterator<Item = (WorkIdx, &WorkReg)> {
        self.regs.iter_enumerated()
    }

    pub fn of_group(&self, g: RegGroup) -> &[WorkIdx] {
        &self.by_group[g]
    }

    /// Intern `virt`, creating the work register on first encounter.
    /// Fails with [AllocError::InvalidVirtId] if the id was never created on
    /// the function body.
    pub fn as_work_reg(&mut self, body: &FuncBody, virt: VirtIdx) -> Result<WorkIdx, AllocError> {
        if virt.index() >= body.virt_reg_count() {
            return Err(AllocError::InvalidVirtId(virt.raw()));
        }
        if self.by_virt.len() < body.virt_reg_count() {
            self.by_virt.resize(body.virt_reg_count(), None);
        }
        if let Some(w) = self.by_virt[virt] {
            return Ok(w);
        }
        let group = body.virt_reg(virt).group;
        let w = self.regs.push(WorkReg {
            virt,
            group,
            spans: Vec::new(),
            ref_count: 0,
            priority: 0,
            home: None,
            fixed_use: None,
            fixed_use_conflict: false,
            slot: None,
            stack_used: false,
        });
        self.by_virt[virt] = Some(w);
        self.by_group[group].push(w);
        Ok(w)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reg::RegGroup;

    #[test]
    fn interning_is_stable_and_dense() {
        let mut body = FuncBody::new();
        let v0 = body.new_virt_reg(RegGroup::Gp, 8, 8);
        let v1 = body.new_virt_reg(RegGroup::Vec, 16, 16);
        let mut works = WorkRegs::default();
        let w1 = works.as_work_reg(&body, v1).unwrap();
        let w0 = works.as_work_reg(&body, v0).unwrap();
        assert_eq!(works.as_work_reg(&body, v1).unwrap(), w1);
        assert_eq!(works.len(), 2);
        assert_eq!(w1.index(), 0);
        assert_eq!(w0.index(), 1);
        assert_eq!(works.of_group(RegGroup::Gp), &[w0]);
        assert_eq!(works.of_group(RegGroup::Vec), &[w1]);
    }

    #[test]
    fn unknown_virt_id_is_an_error() {
        let body = FuncBody::new();
        let mut works = WorkRegs::default();
        let err = works.as_work_reg(&body, VirtIdx::from_raw(3)).unwrap_err();
        assert_eq!(err, AllocError::InvalidVirtId(3));
    }

    #[test]
    fn span_overlap() {
        let a = LiveSpan { start: 0, end: 4 };
        let b = LiveSpan { start: 4, end: 8 };
        let c = LiveSpan { start: 3, end: 5 };
        assert!(!a.overlaps(b));
        assert!(a.overlaps(c));
        assert!(c.overlaps(b));
    }
}
