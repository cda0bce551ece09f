//! Local allocation.
//!
//! Walks the reachable blocks in reverse post-order carrying a live
//! [Assignment]. Per instruction the steps are fixed:
//!
//!  1. place fixed uses, evicting whatever is in the way;
//!  2. give every remaining use a register, reloading spilled values;
//!  3. flush call-clobbered registers whose values survive the call;
//!  4. release registers whose value dies at this instruction;
//!  5. place outputs, preferring the global allocator's home register.
//!
//! The first edge into a block donates the block's entry assignment,
//! restricted to the registers live into it. Every later edge gets
//! compensation code that permutes the arriving assignment into the entry
//! assignment: moves where the target register is free, swaps to break
//! two-register cycles where the machine has an exchange, and a spill plus
//! reload otherwise. Compensation lands before the terminator of a
//! single-successor block, directly after a conditional branch for its
//! fallthrough edge, and in a synthetic block at the end of the function
//! for everything else.

use index_vec::IndexVec;
use strum::IntoEnumIterator;

use crate::arch::{ArchBackend, EmitCtx};
use crate::assign::Assignment;
use crate::cfg::{BlockFlags, BlockIdx, Cfg};
use crate::inst::{RaInst, RaInstIdx, TiedFlags};
use crate::node::{FuncBody, NodeIdx, NodeKind, Operand};
use crate::reg::{ByGroup, MachineDesc, PhysId, RegGroup, RegMask};
use crate::stack::StackAllocator;
use crate::workreg::{WorkIdx, WorkRegs};
use crate::AllocError;

/// Where emitted code goes. `before` keeps inserting in front of `node`;
/// otherwise insertion trails `node` and the anchor advances.
#[derive(Clone, Copy, Debug)]
struct Anchor {
    node: NodeIdx,
    before: bool,
}

impl Anchor {
    fn before(node: NodeIdx) -> Self {
        Anchor { node, before: true }
    }

    fn after(node: NodeIdx) -> Self {
        Anchor { node, before: false }
    }
}

pub(crate) struct LocalAlloc<'a, A: ArchBackend> {
    pub arch: &'a mut A,
    pub body: &'a mut FuncBody,
    pub cfg: &'a mut Cfg,
    pub works: &'a mut WorkRegs,
    pub ra_insts: &'a mut IndexVec<RaInstIdx, RaInst>,
    pub stack: &'a mut StackAllocator,
    pub machine: &'a MachineDesc,
    /// Pass-level set of physical registers the function writes; feeds the
    /// callee-saved area.
    pub clobbered: &'a mut ByGroup<RegMask>,
    pub cur: Assignment,
    /// The function-end marker, used to append synthetic edge blocks.
    pub func_end: Option<NodeIdx>,
}

impl<'a, A: ArchBackend> LocalAlloc<'a, A> {
    pub fn run(&mut self) -> Result<(), AllocError> {
        let rpo: Vec<BlockIdx> = self.cfg.rpo().collect();
        for b in rpo {
            self.cur = match &self.cfg.block(b).entry_assign {
                Some(a) => a.clone(),
                None => Assignment::new(self.works.len()),
            };
            if self.cfg.block(b).entry_assign.is_none() {
                // Entry block, or a block no processed predecessor reaches.
                self.cfg.block_mut(b).entry_assign = Some(self.cur.clone());
            }

            let nodes = self.cfg.block_nodes(self.body, b);
            for node in nodes {
                if let Some(ra) = self.body.node(node).ra {
                    self.alloc_inst(node, ra)?;
                }
            }
            self.cfg.block_mut(b).flags.add(BlockFlags::ALLOCATED);

            if cfg!(debug_assertions) {
                let works = &*self.works;
                self.cur.verify(|w| works.get(w).group)?;
            }

            let succs: Vec<BlockIdx> = self.cfg.block(b).successors.to_vec();
            for s in succs {
                if self.cfg.block(s).entry_assign.is_some() {
                    self.reconcile_edge(b, s)?;
                } else {
                    let entry = self.restricted_clone(s);
                    self.cfg.block_mut(s).entry_assign = Some(entry);
                }
            }
        }
        Ok(())
    }

    /// Clone the current assignment for use as `s`'s entry assignment,
    /// dropping registers that are not live into `s`. A value that is not
    /// live in cannot be read on any path through `s`, so no store is
    /// needed.
    fn restricted_clone(&self, s: BlockIdx) -> Assignment {
        let mut entry = self.cur.clone();
        let live_in = &self.cfg.block(s).live_in;
        let assigned: Vec<_> = entry.iter_assigned().collect();
        for (g, p, w) in assigned {
            if !live_in.get(w.index()).unwrap_or(false) {
                entry.unassign(g, w, p);
            }
        }
        entry
    }

    fn alloc_inst(&mut self, node: NodeIdx, ra: RaInstIdx) -> Result<(), AllocError> {
        let mut anchor = Anchor::before(node);
        let tied_count = self.ra_insts[ra].tied_count();

        for g in RegGroup::iter() {
            self.clobbered[g] = self.clobbered[g].or(self.ra_insts[ra].clobbered[g]);
        }

        // Physical ids consumed by this instruction's reads.
        let mut inst_used: ByGroup<RegMask> = ByGroup::new();
        // Physical ids taken by this instruction's writes.
        let mut out_taken: ByGroup<RegMask> = ByGroup::new();

        // Step 1: fixed uses.
        for ti in 0..tied_count {
            let t = self.ra_insts[ra].tied_regs()[ti];
            if !t.is_use() || !t.is_use_fixed() {
                continue;
            }
            let g = self.works.get(t.work).group;
            let target = t.use_id.expect("fixed use without id");
            self.make_resident(&mut anchor, g, t.work, target, inst_used[g])?;
            inst_used[g].add(target);
        }

        // Step 2: remaining uses.
        for ti in 0..tied_count {
            let t = self.ra_insts[ra].tied_regs()[ti];
            if !t.is_use() || t.is_use_fixed() {
                continue;
            }
            let g = self.works.get(t.work).group;
            let allocable = t
                .allocable
                .and(self.machine.available[g])
                .and_not(inst_used[g]);
            let p = match self.cur.phys_of(t.work) {
                Some(p) if t.allocable.contains(p) => p,
                Some(p) => {
                    // Parked in a register this instruction cannot use.
                    let q = self.choose_reg(&mut anchor, g, allocable, t.work)?;
                    self.hook_move(&mut anchor, t.work, q, p)?;
                    self.cur.reassign(g, t.work, q, p);
                    q
                }
                None => {
                    let q = self.choose_reg(&mut anchor, g, allocable, t.work)?;
                    self.load_into(&mut anchor, g, t.work, q)?;
                    q
                }
            };
            inst_used[g].add(p);
            self.ra_insts[ra].tied_regs_mut()[ti].use_id = Some(p);
        }

        // Step 3: values sitting in call-clobbered registers must not stay
        // there. Values that die here or are redefined here need no rescue;
        // survivors move to a safe free register, or spill when none is
        // left.
        for g in RegGroup::iter() {
            let mask = self.ra_insts[ra].clobbered[g];
            for p in mask.iter() {
                let Some(w2) = self.cur.work_at(g, p) else { continue };
                let tied = self.tied_for(ra, w2);
                let dies = tied.map(|t| t.is_last_use() && !t.is_out()).unwrap_or(false);
                let redefined = tied.map(|t| t.is_out()).unwrap_or(false);
                if dies || redefined {
                    continue;
                }
                let safe = self
                    .machine
                    .available[g]
                    .and_not(self.cur.assigned(g))
                    .and_not(self.ra_insts[ra].clobbered[g])
                    .and_not(self.ra_insts[ra].used[g])
                    .and_not(inst_used[g]);
                if let Some(q) = safe.lowest() {
                    self.hook_move(&mut anchor, w2, q, p)?;
                    self.cur.reassign(g, w2, q, p);
                } else {
                    self.save_if_dirty(&mut anchor, w2, p)?;
                    self.cur.unassign(g, w2, p);
                }
            }
        }

        // Step 4: last uses release their registers.
        for ti in 0..tied_count {
            let t = self.ra_insts[ra].tied_regs()[ti];
            if t.is_use() && t.is_last_use() && !t.is_out() {
                let g = self.works.get(t.work).group;
                if let Some(p) = self.cur.phys_of(t.work) {
                    self.cur.unassign(g, t.work, p);
                }
            }
        }

        // Step 5: outputs.
        for ti in 0..tied_count {
            let t = self.ra_insts[ra].tied_regs()[ti];
            if !t.is_out() {
                continue;
            }
            let w = t.work;
            let g = self.works.get(w).group;
            let p = match t.out_id {
                Some(fixed) => fixed,
                None => {
                    let in_place = t.is_use()
                        && !t.flags.has(TiedFlags::NO_COALESCE)
                        && self.cur.phys_of(w).is_some_and(|p| {
                            t.allocable.contains(p) && !out_taken[g].contains(p)
                        });
                    if in_place {
                        self.cur.phys_of(w).unwrap()
                    } else {
                        let allocable = t
                            .allocable
                            .and(self.machine.available[g])
                            .and_not(inst_used[g])
                            .and_not(out_taken[g]);
                        self.choose_reg(&mut anchor, g, allocable, w)?
                    }
                }
            };

            // The write destroys whatever the target register holds.
            if let Some(w2) = self.cur.work_at(g, p) {
                if w2 != w {
                    let survives = self
                        .tied_for(ra, w2)
                        .map(|t2| !t2.is_last_use() && !t2.is_out())
                        .unwrap_or(true);
                    if survives {
                        let safe = self
                            .machine
                            .available[g]
                            .and_not(self.cur.assigned(g))
                            .and_not(self.ra_insts[ra].clobbered[g])
                            .and_not(self.ra_insts[ra].used[g])
                            .and_not(inst_used[g])
                            .and_not(out_taken[g]);
                        if let Some(q) = safe.lowest() {
                            self.hook_move(&mut anchor, w2, q, p)?;
                            self.cur.reassign(g, w2, q, p);
                        } else {
                            self.save_if_dirty(&mut anchor, w2, p)?;
                            self.cur.unassign(g, w2, p);
                        }
                    } else {
                        self.cur.unassign(g, w2, p);
                    }
                }
            }

            match self.cur.phys_of(w) {
                Some(q) if q == p => {}
                Some(q) => {
                    // Redefinition into a different register; the old copy
                    // is stale, not moved.
                    self.cur.unassign(g, w, q);
                    self.cur.assign(g, w, p, true);
                }
                None => self.cur.assign(g, w, p, true),
            }
            self.cur.set_dirty(w, true);
            self.clobbered[g].add(p);
            out_taken[g].add(p);
            self.ra_insts[ra].tied_regs_mut()[ti].out_id = Some(p);

            if t.is_kill() {
                // Dead write; the register is free again right after.
                self.cur.unassign(g, w, p);
            }
        }

        if cfg!(debug_assertions) {
            let works = &*self.works;
            self.cur.verify(|w| works.get(w).group)?;
        }
        Ok(())
    }

    /// The tied entry of `w` on instruction `ra`, if any.
    fn tied_for(&self, ra: RaInstIdx, w: WorkIdx) -> Option<&crate::inst::TiedReg> {
        self.ra_insts[ra].tied_regs().iter().find(|t| t.work == w)
    }

    /// Bring `w` into exactly `target`, evicting or swapping as needed.
    /// `reserved` are ids this instruction already consumed; eviction never
    /// moves the obstacle there.
    fn make_resident(
        &mut self,
        anchor: &mut Anchor,
        g: RegGroup,
        w: WorkIdx,
        target: PhysId,
        reserved: RegMask,
    ) -> Result<(), AllocError> {
        if self.cur.phys_of(w) == Some(target) {
            return Ok(());
        }
        let occupant = self.cur.work_at(g, target);
        match (self.cur.phys_of(w), occupant) {
            (Some(p), None) => {
                self.hook_move(anchor, w, target, p)?;
                self.cur.reassign(g, w, target, p);
            }
            (Some(p), Some(w2)) => {
                let free = self
                    .machine
                    .available[g]
                    .and_not(self.cur.assigned(g))
                    .and_not(reserved);
                if let Some(q) = free.lowest() {
                    self.hook_move(anchor, w2, q, target)?;
                    self.cur.reassign(g, w2, q, target);
                    self.hook_move(anchor, w, target, p)?;
                    self.cur.reassign(g, w, target, p);
                } else if self.machine.has_swap[g] {
                    self.hook_swap(anchor, w, p, w2, target)?;
                    self.cur.swap(g, w, p, w2, target);
                } else {
                    self.save_if_dirty(anchor, w2, target)?;
                    self.cur.unassign(g, w2, target);
                    self.hook_move(anchor, w, target, p)?;
                    self.cur.reassign(g, w, target, p);
                }
            }
            (None, None) => {
                self.load_into(anchor, g, w, target)?;
            }
            (None, Some(w2)) => {
                let free = self
                    .machine
                    .available[g]
                    .and_not(self.cur.assigned(g))
                    .and_not(reserved);
                if let Some(q) = free.lowest() {
                    self.hook_move(anchor, w2, q, target)?;
                    self.cur.reassign(g, w2, q, target);
                } else {
                    self.save_if_dirty(anchor, w2, target)?;
                    self.cur.unassign(g, w2, target);
                }
                self.load_into(anchor, g, w, target)?;
            }
        }
        Ok(())
    }

    /// Pick a register from `mask`, preferring the global home, then the
    /// lowest free id, then evicting the cheapest occupant.
    fn choose_reg(
        &mut self,
        anchor: &mut Anchor,
        g: RegGroup,
        mask: RegMask,
        w: WorkIdx,
    ) -> Result<PhysId, AllocError> {
        let free = mask.and_not(self.cur.assigned(g));
        if let Some(h) = self.works.get(w).home {
            if free.contains(h) {
                return Ok(h);
            }
        }
        if let Some(p) = free.lowest() {
            return Ok(p);
        }
        let candidates = mask.and(self.cur.assigned(g));
        let victim = self.pick_victim(g, candidates)?;
        let p = self.cur.phys_of(victim).expect("victim not assigned");
        self.save_if_dirty(anchor, victim, p)?;
        self.cur.unassign(g, victim, p);
        Ok(p)
    }

    /// The eviction victim: lowest loop-weighted priority, ties to the
    /// higher work id.
    fn pick_victim(&self, g: RegGroup, candidates: RegMask) -> Result<WorkIdx, AllocError> {
        let mut best: Option<WorkIdx> = None;
        for p in candidates.iter() {
            let Some(w) = self.cur.work_at(g, p) else { continue };
            best = Some(match best {
                None => w,
                Some(cur_best) => {
                    let a = self.works.get(w).priority;
                    let b = self.works.get(cur_best).priority;
                    if a < b || (a == b && w > cur_best) {
                        w
                    } else {
                        cur_best
                    }
                }
            });
        }
        best.ok_or(AllocError::NoRegistersToAllocate(g))
    }

    fn save_if_dirty(&mut self, anchor: &mut Anchor, w: WorkIdx, p: PhysId) -> Result<(), AllocError> {
        if self.cur.is_dirty(w) {
            self.stack.slot_for(self.works, self.body, w);
            self.hook_save(anchor, w, p)?;
            self.cur.set_dirty(w, false);
        }
        Ok(())
    }

    fn load_into(
        &mut self,
        anchor: &mut Anchor,
        g: RegGroup,
        w: WorkIdx,
        p: PhysId,
    ) -> Result<(), AllocError> {
        self.stack.slot_for(self.works, self.body, w);
        self.hook_load(anchor, w, p)?;
        self.cur.assign(g, w, p, false);
        Ok(())
    }

    // Hook shims; each builds a fresh emission context at the anchor.

    fn hook_move(&mut self, anchor: &mut Anchor, w: WorkIdx, dst: PhysId, src: PhysId) -> Result<(), AllocError> {
        let mut e = ectx(self.body, self.works, *anchor);
        self.arch.emit_move(&mut e, w, dst, src)?;
        advance(anchor, &e);
        Ok(())
    }

    fn hook_swap(
        &mut self,
        anchor: &mut Anchor,
        a_work: WorkIdx,
        a_phys: PhysId,
        b_work: WorkIdx,
        b_phys: PhysId,
    ) -> Result<(), AllocError> {
        let mut e = ectx(self.body, self.works, *anchor);
        self.arch.emit_swap(&mut e, a_work, a_phys, b_work, b_phys)?;
        advance(anchor, &e);
        Ok(())
    }

    fn hook_load(&mut self, anchor: &mut Anchor, w: WorkIdx, dst: PhysId) -> Result<(), AllocError> {
        let mut e = ectx(self.body, self.works, *anchor);
        self.arch.emit_load(&mut e, w, dst)?;
        advance(anchor, &e);
        Ok(())
    }

    fn hook_save(&mut self, anchor: &mut Anchor, w: WorkIdx, src: PhysId) -> Result<(), AllocError> {
        let mut e = ectx(self.body, self.works, *anchor);
        self.arch.emit_save(&mut e, w, src)?;
        advance(anchor, &e);
        Ok(())
    }

    /// Compensate the edge `b -> s`: transform the assignment at the end of
    /// `b` into `s`'s entry assignment.
    fn reconcile_edge(&mut self, b: BlockIdx, s: BlockIdx) -> Result<(), AllocError> {
        let target = self
            .cfg
            .block(s)
            .entry_assign
            .clone()
            .expect("edge target has no entry assignment");
        let live_in = self.cfg.block(s).live_in.clone();

        // Most edges arrive with a matching assignment; creating an edge
        // block for them would be pure noise, so check first.
        let mut needs_code = false;
        for wi in live_in.iter_set_bits(..) {
            let w = WorkIdx::from_usize(wi);
            let want = target.phys_of(w);
            let have = self.cur.phys_of(w);
            if want != have
                || (have.is_some() && self.cur.is_dirty(w) && !target.is_dirty(w))
            {
                needs_code = true;
                break;
            }
        }
        if !needs_code {
            return Ok(());
        }

        let mut cur = self.cur.clone();
        let mut anchor = self.edge_anchor(b, s)?;

        // Drop values dead on this edge first; that frees registers for the
        // permutation below.
        let assigned: Vec<_> = cur.iter_assigned().collect();
        for (g, p, w) in assigned {
            if !live_in.get(w.index()).unwrap_or(false) {
                cur.unassign(g, w, p);
            }
        }

        loop {
            let mut progress = false;
            let mut pending = false;
            for wi in live_in.iter_set_bits(..) {
                let w = WorkIdx::from_usize(wi);
                let g = self.works.get(w).group;
                let want = target.phys_of(w);
                let have = cur.phys_of(w);
                if want == have {
                    if let Some(p) = have {
                        // The target entry believes the stack home is
                        // current; make it so.
                        if cur.is_dirty(w) && !target.is_dirty(w) {
                            self.save_edge(&mut anchor, &mut cur, w, p)?;
                        }
                    }
                    continue;
                }
                match (have, want) {
                    (Some(p), None) => {
                        self.save_edge(&mut anchor, &mut cur, w, p)?;
                        cur.unassign(g, w, p);
                        progress = true;
                    }
                    (None, Some(p)) => {
                        if cur.work_at(g, p).is_none() {
                            self.stack.slot_for(self.works, self.body, w);
                            self.hook_load_edge(&mut anchor, w, p)?;
                            cur.assign(g, w, p, false);
                            progress = true;
                        } else {
                            pending = true;
                        }
                    }
                    (Some(p), Some(q)) => match cur.work_at(g, q) {
                        None => {
                            self.hook_move_edge(&mut anchor, w, q, p)?;
                            cur.reassign(g, w, q, p);
                            if cur.is_dirty(w) && !target.is_dirty(w) {
                                self.save_edge(&mut anchor, &mut cur, w, q)?;
                            }
                            progress = true;
                        }
                        Some(w2) => {
                            if target.phys_of(w2) == Some(p) && self.machine.has_swap[g] {
                                self.hook_swap_edge(&mut anchor, w, p, w2, q)?;
                                cur.swap(g, w, p, w2, q);
                                progress = true;
                            } else {
                                pending = true;
                            }
                        }
                    },
                    (None, None) => {}
                }
            }
            if !pending {
                break;
            }
            if !progress {
                // A cycle with no usable swap; break it by spilling one
                // obstacle, lowest pending register first.
                let mut broke = false;
                for wi in live_in.iter_set_bits(..) {
                    let w = WorkIdx::from_usize(wi);
                    let g = self.works.get(w).group;
                    let want = target.phys_of(w);
                    if want == cur.phys_of(w) {
                        continue;
                    }
                    if let Some(q) = want {
                        if let Some(w2) = cur.work_at(g, q) {
                            self.save_edge(&mut anchor, &mut cur, w2, q)?;
                            cur.unassign(g, w2, q);
                            broke = true;
                            break;
                        }
                    }
                }
                if !broke {
                    return Err(AllocError::InconsistentState);
                }
            }
        }
        Ok(())
    }

    fn save_edge(
        &mut self,
        anchor: &mut Anchor,
        cur: &mut Assignment,
        w: WorkIdx,
        p: PhysId,
    ) -> Result<(), AllocError> {
        if cur.is_dirty(w) {
            self.stack.slot_for(self.works, self.body, w);
            let mut e = ectx(self.body, self.works, *anchor);
            self.arch.emit_save(&mut e, w, p)?;
            advance(anchor, &e);
            cur.set_dirty(w, false);
        }
        Ok(())
    }

    fn hook_move_edge(&mut self, anchor: &mut Anchor, w: WorkIdx, dst: PhysId, src: PhysId) -> Result<(), AllocError> {
        let mut e = ectx(self.body, self.works, *anchor);
        self.arch.emit_move(&mut e, w, dst, src)?;
        advance(anchor, &e);
        Ok(())
    }

    fn hook_load_edge(&mut self, anchor: &mut Anchor, w: WorkIdx, dst: PhysId) -> Result<(), AllocError> {
        let mut e = ectx(self.body, self.works, *anchor);
        self.arch.emit_load(&mut e, w, dst)?;
        advance(anchor, &e);
        Ok(())
    }

    fn hook_swap_edge(
        &mut self,
        anchor: &mut Anchor,
        a_work: WorkIdx,
        a_phys: PhysId,
        b_work: WorkIdx,
        b_phys: PhysId,
    ) -> Result<(), AllocError> {
        let mut e = ectx(self.body, self.works, *anchor);
        self.arch.emit_swap(&mut e, a_work, a_phys, b_work, b_phys)?;
        advance(anchor, &e);
        Ok(())
    }

    /// Decide where edge compensation for `b -> s` goes, creating a
    /// synthetic block when it cannot live inside `b`.
    fn edge_anchor(&mut self, b: BlockIdx, s: BlockIdx) -> Result<Anchor, AllocError> {
        let blk = self.cfg.block(b);
        let single = blk.successors.len() == 1;
        let last = blk.last;
        let fallthrough = blk.consecutive() == Some(s);
        let has_term = blk.has_terminator();
        if single {
            let Some(last) = last.or(blk.first) else {
                return Err(AllocError::InconsistentState);
            };
            return Ok(if has_term {
                Anchor::before(last)
            } else {
                Anchor::after(last)
            });
        }
        if fallthrough {
            let Some(last) = last else {
                return Err(AllocError::InconsistentState);
            };
            return Ok(Anchor::after(last));
        }

        // Taken edge of a multi-successor block: synthesise an edge block
        // at the end of the function and retarget the branch through it.
        let Some(s_label) = self.cfg.block(s).label else {
            return Err(AllocError::InconsistentState);
        };
        let Some(func_end) = self.func_end else {
            return Err(AllocError::InconsistentState);
        };
        let edge_label = self.body.new_label();
        let label_node = self.body.insert_before(func_end, NodeKind::Label(edge_label));
        {
            let mut e = EmitCtx::before(self.body, func_end, self.works);
            self.arch.emit_jump(&mut e, s_label)?;
        }
        let Some(term) = self.cfg.block(b).last else {
            return Err(AllocError::InconsistentState);
        };
        retarget_branch(self.body, term, s_label, edge_label);
        // Compensation goes between the new label and the jump.
        let Some(first_jump) = self.body.node(label_node).next else {
            return Err(AllocError::InconsistentState);
        };
        Ok(Anchor::before(first_jump))
    }
}

fn ectx<'m>(body: &'m mut FuncBody, works: &'m WorkRegs, anchor: Anchor) -> EmitCtx<'m> {
    if anchor.before {
        EmitCtx::before(body, anchor.node, works)
    } else {
        EmitCtx::after(body, anchor.node, works)
    }
}

fn advance(anchor: &mut Anchor, e: &EmitCtx<'_>) {
    if !anchor.before {
        anchor.node = e.at_node();
    }
}

/// Replace every `from` label operand of the branch at `term` with `to`.
fn retarget_branch(body: &mut FuncBody, term: NodeIdx, from: crate::node::LabelIdx, to: crate::node::LabelIdx) {
    if let NodeKind::Inst(data) = &mut body.node_mut(term).kind {
        for op in data.operands.iter_mut() {
            if *op == Operand::Label(from) {
                *op = Operand::Label(to);
            }
        }
    }
}
