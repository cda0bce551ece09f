//! Stack slots and the function frame.
//!
//! Slots are created lazily the first time a work register needs a memory
//! home. Frame layout happens once, after allocation: local slots are
//! packed tightest alignment first, the callee-saved area is sized from the
//! registers the function actually clobbered, and incoming stack arguments
//! whose home must stay addressable keep their caller-frame slots.

use index_vec::IndexVec;
use strum::IntoEnumIterator;

use crate::arch::{ArchBackend, EmitCtx};
use crate::cfg::Cfg;
use crate::node::{ArgLoc, FuncBody, NodeKind};
use crate::reg::{ByGroup, MachineDesc, PhysId, RegGroup, RegMask};
use crate::workreg::{WorkIdx, WorkRegs};
use crate::AllocError;

index_vec::define_index_type! {
    /// Index of a stack slot.
    pub struct SlotIdx = u32;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotKind {
    /// A spill slot in the function's own frame.
    Local,
    /// The caller-frame home of an incoming stack argument, at this byte
    /// offset into the argument area.
    ArgHome(u32),
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct StackSlot {
    pub size: u32,
    pub align: u32,
    pub kind: SlotKind,
    /// Final displacement from the stack pointer; valid after
    /// [StackAllocator::finalize].
    pub offset: i32,
}

#[derive(Debug, Default)]
pub(crate) struct StackAllocator {
    slots: IndexVec<SlotIdx, StackSlot>,
}

impl StackAllocator {
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn slot(&self, s: SlotIdx) -> &StackSlot {
        &self.slots[s]
    }

    /// The stack home of `w`, created on first request.
    pub fn slot_for(&mut self, works: &mut WorkRegs, body: &FuncBody, w: WorkIdx) -> SlotIdx {
        if let Some(s) = works.get(w).slot {
            return s;
        }
        let virt = works.get(w).virt;
        let vr = *body.virt_reg(virt);
        let s = self.slots.push(StackSlot {
            size: vr.size,
            align: vr.align,
            kind: SlotKind::Local,
            offset: 0,
        });
        let wr = works.get_mut(w);
        wr.slot = Some(s);
        wr.stack_used = true;
        s
    }

    /// Pack the local slots and return the local area size. Largest
    /// alignment first so padding only ever shrinks.
    pub fn finalize(&mut self) -> u32 {
        let mut order: Vec<SlotIdx> = self
            .slots
            .iter_enumerated()
            .filter(|(_, s)| s.kind == SlotKind::Local)
            .map(|(i, _)| i)
            .collect();
        order.sort_by(|a, b| {
            let sa = &self.slots[*a];
            let sb = &self.slots[*b];
            sb.align
                .cmp(&sa.align)
                .then(sb.size.cmp(&sa.size))
                .then(a.cmp(b))
        });
        let mut off = 0u32;
        let mut max_align = 1u32;
        for i in order {
            let slot = &mut self.slots[i];
            off = align_up(off, slot.align);
            slot.offset = off as i32;
            off += slot.size;
            max_align = max_align.max(slot.align);
        }
        align_up(off, max_align)
    }

    /// Give every argument-home slot its displacement above the frame.
    pub fn resolve_arg_homes(&mut self, frame: &Frame) {
        for (_, slot) in self.slots.iter_mut_enumerated() {
            if let SlotKind::ArgHome(arg_off) = slot.kind {
                slot.offset = frame.incoming_arg_disp(arg_off);
            }
        }
    }
}

fn align_up(v: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

/// The finalized stack frame handed to the backend's prolog and epilog
/// hooks.
///
/// Layout below the return address, stack growing down:
/// incoming args / return address / callee-saved area / local slots, with
/// the stack pointer resting at the bottom of the locals.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    /// Bytes of packed spill slots.
    pub local_size: u32,
    /// Callee-saved registers the function clobbers and must preserve.
    pub saved: ByGroup<RegMask>,
    /// Bytes of the incoming argument area that must stay addressable.
    pub arg_area: u32,
    /// The stack pointer register.
    pub sp: PhysId,
    /// Size of one frame word.
    pub reg_size: u32,
}

impl Frame {
    /// Bytes occupied by the callee-saved area.
    pub fn saved_bytes(&self) -> u32 {
        let mut n = 0;
        for (_, m) in self.saved.iter() {
            n += m.count() * self.reg_size;
        }
        n
    }

    /// Displacement from the post-prolog stack pointer to byte `arg_off` of
    /// the incoming argument area.
    pub fn incoming_arg_disp(&self, arg_off: u32) -> i32 {
        (self.local_size + self.saved_bytes() + self.reg_size + arg_off) as i32
    }
}

/// Compute the final frame: keep needed argument homes, pack the locals and
/// collect the callee-saved set.
pub(crate) fn update_stack_frame(
    body: &FuncBody,
    works: &mut WorkRegs,
    stack: &mut StackAllocator,
    machine: &MachineDesc,
    clobbered: &ByGroup<RegMask>,
) -> Frame {
    // Incoming stack arguments whose work register needs a memory home keep
    // the home they arrived in instead of getting a fresh local slot.
    let mut arg_area = 0u32;
    for arg in &body.args {
        let ArgLoc::Stack(arg_off) = arg.loc else { continue };
        let Some(w) = works
            .iter()
            .find(|(_, wr)| wr.virt == arg.virt)
            .map(|(w, _)| w)
        else {
            continue;
        };
        if let Some(s) = works.get(w).slot {
            stack.slots[s].kind = SlotKind::ArgHome(arg_off);
            arg_area = arg_area.max(arg_off + body.virt_reg(arg.virt).size);
        }
    }

    let local_size = stack.finalize();
    let mut saved: ByGroup<RegMask> = ByGroup::new();
    for g in RegGroup::iter() {
        saved[g] = clobbered[g].and(machine.callee_saved[g]);
    }
    let frame = Frame {
        local_size,
        saved,
        arg_area,
        sp: machine.sp,
        reg_size: machine.reg_size,
    };
    stack.resolve_arg_homes(&frame);
    log::debug!(
        "frame: locals={} saved={} arg_area={}",
        frame.local_size,
        frame.saved_bytes(),
        frame.arg_area
    );
    frame
}

/// Insert the frame setup after the function entry node and the teardown
/// before the terminator of every exit block.
pub(crate) fn insert_prolog_epilog<A: ArchBackend>(
    arch: &mut A,
    body: &mut FuncBody,
    cfg: &Cfg,
    works: &WorkRegs,
    frame: &Frame,
) -> Result<(), AllocError> {
    let entry_node = body
        .iter()
        .find(|n| matches!(body.node(*n).kind, NodeKind::FuncEntry));
    if let Some(at) = entry_node {
        let mut e = EmitCtx::after(body, at, works);
        arch.emit_prolog(&mut e, frame)?;
    }
    for b in cfg.exits() {
        let blk = cfg.block(*b);
        let Some(last) = blk.last else { continue };
        let mut e = if blk.has_terminator() {
            EmitCtx::before(body, last, works)
        } else {
            EmitCtx::after(body, last, works)
        };
        arch.emit_epilog(&mut e, frame)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::FuncBody;

    #[test]
    fn packing_is_largest_alignment_first() {
        let mut body = FuncBody::new();
        let mut works = WorkRegs::default();
        let mut stack = StackAllocator::default();
        let mut mk = |size, align| {
            let v = body.new_virt_reg(RegGroup::Gp, size, align);
            let w = works.as_work_reg(&body, v).unwrap();
            stack.slot_for(&mut works, &body, w)
        };
        let s8 = mk(8, 8);
        let s4 = mk(4, 4);
        let s16 = mk(16, 16);
        let total = stack.finalize();
        assert_eq!(stack.slot(s16).offset, 0);
        assert_eq!(stack.slot(s8).offset, 16);
        assert_eq!(stack.slot(s4).offset, 24);
        assert_eq!(total, 32);
    }

    #[test]
    fn slot_is_created_once() {
        let mut body = FuncBody::new();
        let mut works = WorkRegs::default();
        let mut stack = StackAllocator::default();
        let v = body.new_virt_reg(RegGroup::Gp, 8, 8);
        let w = works.as_work_reg(&body, v).unwrap();
        let a = stack.slot_for(&mut works, &body, w);
        let b = stack.slot_for(&mut works, &body, w);
        assert_eq!(a, b);
        assert!(works.get(w).stack_used);
    }

    #[test]
    fn arg_home_resolves_above_the_frame() {
        let frame = Frame {
            local_size: 32,
            saved: {
                let mut s: ByGroup<RegMask> = ByGroup::new();
                s[RegGroup::Gp] = RegMask(0b11);
                s
            },
            arg_area: 16,
            sp: PhysId(7),
            reg_size: 8,
        };
        assert_eq!(frame.saved_bytes(), 16);
        // locals + saved + return address + offset.
        assert_eq!(frame.incoming_arg_disp(8), 32 + 16 + 8 + 8);
    }
}
