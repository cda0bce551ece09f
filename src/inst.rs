//! Per-instruction allocator records.
//!
//! While the backend walks the node stream it describes every instruction to
//! the allocator through a [RaInstBuilder]: one [TiedReg] per (instruction,
//! work register) pair, carrying how the register is accessed, which
//! physical ids are acceptable, and which operand slots must be rewritten
//! once ids are resolved. The builder's contents are then frozen into a
//! [RaInst] attached to the node.

use smallvec::SmallVec;

use crate::cfg::BlockIdx;
use crate::reg::{ByGroup, PhysId, RegGroup, RegMask, GROUP_COUNT};
use crate::workreg::WorkIdx;
use crate::AllocError;

index_vec::define_index_type! {
    /// Index of a [RaInst] in the pass store.
    pub struct RaInstIdx = u32;
}

/// Access flags of one [TiedReg].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TiedFlags(u16);

impl TiedFlags {
    /// The instruction reads the register.
    pub const USE: TiedFlags = TiedFlags(1 << 0);
    /// The instruction writes the register.
    pub const OUT: TiedFlags = TiedFlags(1 << 1);
    /// The read must happen in a specific physical register.
    pub const USE_FIXED: TiedFlags = TiedFlags(1 << 2);
    /// The write must happen in a specific physical register.
    pub const OUT_FIXED: TiedFlags = TiedFlags(1 << 3);
    /// This is the last read of the current value. Stamped by liveness.
    pub const LAST_USE: TiedFlags = TiedFlags(1 << 4);
    /// The written value is never read. Stamped by liveness.
    pub const KILL: TiedFlags = TiedFlags(1 << 5);
    /// Keeping use and out in one register is not allowed for this entry.
    pub const NO_COALESCE: TiedFlags = TiedFlags(1 << 6);

    pub fn empty() -> TiedFlags {
        TiedFlags(0)
    }

    pub fn has(self, f: TiedFlags) -> bool {
        self.0 & f.0 != 0
    }

    pub fn with(self, f: TiedFlags) -> TiedFlags {
        TiedFlags(self.0 | f.0)
    }

    pub fn add(&mut self, f: TiedFlags) {
        self.0 |= f.0;
    }
}

/// Links one work register to one instruction: how it is accessed, where it
/// may or must live, and which operand slots to rewrite.
#[derive(Clone, Copy, Debug)]
pub struct TiedReg {
    pub work: WorkIdx,
    pub flags: TiedFlags,
    /// Physical ids acceptable for this register at this instruction.
    pub allocable: RegMask,
    /// Required (before allocation) and resolved (after) read register.
    pub use_id: Option<PhysId>,
    /// Required and resolved write register.
    pub out_id: Option<PhysId>,
    /// Bit `k` set: operand slot `k` takes the resolved use id.
    pub use_rewrite: u32,
    /// Bit `k` set: operand slot `k` takes the resolved out id.
    pub out_rewrite: u32,
    /// How many times the instruction mentioned this register.
    pub ref_count: u8,
}

impl TiedReg {
    pub fn is_use(&self) -> bool {
        self.flags.has(TiedFlags::USE)
    }

    pub fn is_out(&self) -> bool {
        self.flags.has(TiedFlags::OUT)
    }

    pub fn is_use_fixed(&self) -> bool {
        self.flags.has(TiedFlags::USE_FIXED)
    }

    pub fn is_out_fixed(&self) -> bool {
        self.flags.has(TiedFlags::OUT_FIXED)
    }

    pub fn is_last_use(&self) -> bool {
        self.flags.has(TiedFlags::LAST_USE)
    }

    pub fn is_kill(&self) -> bool {
        self.flags.has(TiedFlags::KILL)
    }
}

/// Instruction-level flags of a [RaInst].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstFlags(u8);

impl InstFlags {
    /// The instruction ends its block (jump, conditional jump, return).
    pub const TERMINATOR: InstFlags = InstFlags(1 << 0);

    pub fn empty() -> InstFlags {
        InstFlags(0)
    }

    pub fn has(self, f: InstFlags) -> bool {
        self.0 & f.0 != 0
    }

    pub fn add(&mut self, f: InstFlags) {
        self.0 |= f.0;
    }
}

/// The allocator's record for one instruction node: the tied registers
/// grouped by register group, plus the fixed and clobbered id masks.
#[derive(Clone, Debug)]
pub struct RaInst {
    pub block: BlockIdx,
    pub flags: InstFlags,
    /// Linear position; even, one slot of two per instruction.
    pub pos: u32,
    /// Tied registers, contiguous and ordered by group.
    tied: SmallVec<[TiedReg; 4]>,
    /// Start offset of each group's slice in `tied`, plus a total sentinel.
    tied_index: [u8; GROUP_COUNT + 1],
    /// Number of simultaneously live registers per group at this point.
    pub live_count: ByGroup<u32>,
    /// Fixed physical ids consumed by this instruction.
    pub used: ByGroup<RegMask>,
    /// Physical ids destroyed by this instruction (calls, fixed outputs).
    pub clobbered: ByGroup<RegMask>,
}

impl RaInst {
    pub fn is_terminator(&self) -> bool {
        self.flags.has(InstFlags::TERMINATOR)
    }

    pub fn tied_regs(&self) -> &[TiedReg] {
        &self.tied
    }

    pub fn tied_regs_mut(&mut self) -> &mut [TiedReg] {
        &mut self.tied
    }

    pub fn tied_count(&self) -> usize {
        self.tied.len()
    }

    /// The tied registers of one group.
    pub fn tied_of(&self, g: RegGroup) -> &[TiedReg] {
        let lo = usize::from(self.tied_index[g as usize]);
        let hi = usize::from(self.tied_index[g as usize + 1]);
        &self.tied[lo..hi]
    }
}

/// Accumulates [TiedReg]s for one instruction. Reset between instructions.
///
/// Repeated mentions of the same work register merge into one entry: flags
/// and rewrite masks are unioned, the allocable set is intersected, and a
/// second fixed out id is an error.
#[derive(Debug, Default)]
pub struct RaInstBuilder {
    flags: InstFlags,
    tied: SmallVec<[TiedReg; 8]>,
    count: ByGroup<u8>,
    used: ByGroup<RegMask>,
    clobbered: ByGroup<RegMask>,
}

impl RaInstBuilder {
    pub fn new() -> Self {
        RaInstBuilder::default()
    }

    pub fn reset(&mut self) {
        self.flags = InstFlags::empty();
        self.tied.clear();
        self.count = ByGroup::new();
        self.used = ByGroup::new();
        self.clobbered = ByGroup::new();
    }

    pub fn tied_count(&self) -> usize {
        self.tied.len()
    }

    pub fn add_flags(&mut self, f: InstFlags) {
        self.flags.add(f);
    }

    /// Mark additional clobbered ids, typically a call's caller-saved set.
    pub fn add_clobbers(&mut self, g: RegGroup, mask: RegMask) {
        self.clobbered[g] = self.clobbered[g].or(mask);
    }

    /// Record one mention of `work`. `use_id`/`out_id` carry fixed
    /// constraints; `use_rewrite`/`out_rewrite` select the operand slots to
    /// patch with the resolved ids.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        work: WorkIdx,
        group: RegGroup,
        mut flags: TiedFlags,
        allocable: RegMask,
        use_id: Option<PhysId>,
        use_rewrite: u32,
        out_id: Option<PhysId>,
        out_rewrite: u32,
    ) -> Result<(), AllocError> {
        if let Some(id) = use_id {
            flags.add(TiedFlags::USE_FIXED);
            self.used[group].add(id);
        }
        if let Some(id) = out_id {
            flags.add(TiedFlags::OUT_FIXED);
            self.clobbered[group].add(id);
            // A fixed output also blocks other allocations at this point.
            self.used[group].add(id);
        }

        if let Some(tied) = self.tied.iter_mut().find(|t| t.work == work) {
            if let Some(id) = out_id {
                if tied.out_id.is_some() {
                    return Err(AllocError::OverlappedRegs);
                }
                tied.out_id = Some(id);
                // A fixed output landing on an entry that already has a use
                // cannot share one register; the use gets a separate
                // pre-move instead.
                if tied.is_use() {
                    flags.add(TiedFlags::NO_COALESCE);
                }
            }
            tied.ref_count += 1;
            tied.flags.add(flags);
            tied.allocable = tied.allocable.and(allocable);
            tied.use_rewrite |= use_rewrite;
            tied.out_rewrite |= out_rewrite;
            if tied.use_id.is_none() {
                tied.use_id = use_id;
            }
            return Ok(());
        }

        self.tied.push(TiedReg {
            work,
            flags,
            allocable,
            use_id,
            out_id,
            use_rewrite,
            out_rewrite,
            ref_count: 1,
        });
        self.count[group] += 1;
        Ok(())
    }

    /// Freeze the builder into a [RaInst], grouping tied entries by register
    /// group. `groups` maps each entry's work register to its group.
    pub(crate) fn build(
        &self,
        block: BlockIdx,
        pos: u32,
        group_of: impl Fn(WorkIdx) -> RegGroup,
    ) -> RaInst {
        let mut tied_index = [0u8; GROUP_COUNT + 1];
        for g in 0..GROUP_COUNT {
            tied_index[g + 1] = tied_index[g] + self.count_at(g);
        }
        let mut cursor = tied_index;
        let mut tied: SmallVec<[TiedReg; 4]> = SmallVec::new();
        tied.resize(
            self.tied.len(),
            TiedReg {
                work: WorkIdx::from_raw(0),
                flags: TiedFlags::empty(),
                allocable: RegMask::EMPTY,
                use_id: None,
                out_id: None,
                use_rewrite: 0,
                out_rewrite: 0,
                ref_count: 0,
            },
        );
        for t in &self.tied {
            let g = group_of(t.work);
            let at = usize::from(cursor[g as usize]);
            cursor[g as usize] += 1;
            let mut entry = *t;
            // Fixed ids consumed by other entries are not allocable here.
            entry.allocable = entry.allocable.and_not(self.used[g]);
            tied[at] = entry;
        }
        RaInst {
            block,
            flags: self.flags,
            pos,
            tied,
            tied_index,
            live_count: ByGroup::new(),
            used: self.used,
            clobbered: self.clobbered,
        }
    }

    fn count_at(&self, g: usize) -> u8 {
        let group = RegGroup::from_repr(g as u8).unwrap();
        self.count[group]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn any_mask() -> RegMask {
        RegMask(0b1111)
    }

    #[test]
    fn repeated_mentions_merge() {
        let mut ib = RaInstBuilder::new();
        let w = WorkIdx::from_raw(0);
        ib.add(
            w,
            RegGroup::Gp,
            TiedFlags::USE,
            any_mask(),
            None,
            1 << 1,
            None,
            0,
        )
        .unwrap();
        ib.add(
            w,
            RegGroup::Gp,
            TiedFlags::OUT,
            RegMask(0b0111),
            None,
            0,
            None,
            1 << 0,
        )
        .unwrap();
        assert_eq!(ib.tied_count(), 1);
        let ra = ib.build(BlockIdx::from_raw(0), 0, |_| RegGroup::Gp);
        let t = &ra.tied_regs()[0];
        assert!(t.is_use() && t.is_out());
        assert_eq!(t.allocable, RegMask(0b0111));
        assert_eq!(t.use_rewrite, 1 << 1);
        assert_eq!(t.out_rewrite, 1 << 0);
        assert_eq!(t.ref_count, 2);
    }

    #[test]
    fn second_fixed_out_is_overlap() {
        let mut ib = RaInstBuilder::new();
        let w = WorkIdx::from_raw(0);
        ib.add(
            w,
            RegGroup::Gp,
            TiedFlags::OUT,
            any_mask(),
            None,
            0,
            Some(PhysId(1)),
            1,
        )
        .unwrap();
        let err = ib
            .add(
                w,
                RegGroup::Gp,
                TiedFlags::OUT,
                any_mask(),
                None,
                0,
                Some(PhysId(2)),
                1,
            )
            .unwrap_err();
        assert_eq!(err, AllocError::OverlappedRegs);
    }

    #[test]
    fn fixed_out_on_used_entry_bans_coalescing() {
        let mut ib = RaInstBuilder::new();
        let w = WorkIdx::from_raw(0);
        ib.add(
            w,
            RegGroup::Gp,
            TiedFlags::USE,
            any_mask(),
            None,
            1,
            None,
            0,
        )
        .unwrap();
        ib.add(
            w,
            RegGroup::Gp,
            TiedFlags::OUT,
            any_mask(),
            None,
            0,
            Some(PhysId(2)),
            2,
        )
        .unwrap();
        let ra = ib.build(BlockIdx::from_raw(0), 0, |_| RegGroup::Gp);
        let t = &ra.tied_regs()[0];
        assert!(t.flags.has(TiedFlags::NO_COALESCE));
        assert_eq!(t.out_id, Some(PhysId(2)));
    }

    #[test]
    fn fixed_ids_join_used_mask_and_shrink_other_allocables() {
        let mut ib = RaInstBuilder::new();
        let w0 = WorkIdx::from_raw(0);
        let w1 = WorkIdx::from_raw(1);
        ib.add(
            w0,
            RegGroup::Gp,
            TiedFlags::USE,
            any_mask(),
            Some(PhysId(0)),
            1,
            None,
            0,
        )
        .unwrap();
        ib.add(
            w1,
            RegGroup::Gp,
            TiedFlags::OUT,
            any_mask(),
            None,
            0,
            Some(PhysId(2)),
            1,
        )
        .unwrap();
        let ra = ib.build(BlockIdx::from_raw(0), 0, |_| RegGroup::Gp);
        // Both the fixed use id and the fixed out id are blocked for other
        // entries at this instruction.
        assert_eq!(ra.used[RegGroup::Gp], RegMask(0b0101));
        assert_eq!(ra.clobbered[RegGroup::Gp], RegMask(0b0100));
        for t in ra.tied_regs() {
            assert_eq!(t.allocable, RegMask(0b1010));
        }
    }

    #[test]
    fn build_groups_entries_by_register_group() {
        let mut ib = RaInstBuilder::new();
        let wg = WorkIdx::from_raw(0);
        let wv = WorkIdx::from_raw(1);
        let group_of = |w: WorkIdx| {
            if w == WorkIdx::from_raw(1) {
                RegGroup::Vec
            } else {
                RegGroup::Gp
            }
        };
        ib.add(wv, RegGroup::Vec, TiedFlags::USE, any_mask(), None, 1, None, 0)
            .unwrap();
        ib.add(wg, RegGroup::Gp, TiedFlags::USE, any_mask(), None, 2, None, 0)
            .unwrap();
        let ra = ib.build(BlockIdx::from_raw(0), 0, group_of);
        assert_eq!(ra.tied_of(RegGroup::Gp).len(), 1);
        assert_eq!(ra.tied_of(RegGroup::Gp)[0].work, wg);
        assert_eq!(ra.tied_of(RegGroup::Vec).len(), 1);
        assert_eq!(ra.tied_of(RegGroup::Vec)[0].work, wv);
    }
}
