//! The final rewrite.
//!
//! Purely mechanical: the rewrite masks computed during CFG construction
//! say which operand slots take which resolved id, so no instruction is
//! ever decoded here. Slot pseudo-operands left behind by spill and reload
//! code become stack-pointer relative memory operands now that the frame is
//! final.

use index_vec::IndexVec;

use crate::inst::{RaInst, RaInstIdx};
use crate::node::{FuncBody, NodeKind, Operand, RegRef};
use crate::reg::PhysId;
use crate::stack::StackAllocator;
use crate::workreg::WorkRegs;
use crate::AllocError;

pub(crate) fn run(
    body: &mut FuncBody,
    works: &WorkRegs,
    stack: &StackAllocator,
    ra_insts: &IndexVec<RaInstIdx, RaInst>,
    sp: PhysId,
) -> Result<(), AllocError> {
    let nodes: Vec<_> = body.iter().collect();
    for n in nodes {
        let ra = body.node(n).ra;
        if let Some(ra) = ra {
            let inst = &ra_insts[ra];
            for t in inst.tied_regs() {
                if t.use_rewrite != 0 {
                    let id = t.use_id.ok_or(AllocError::InconsistentState)?;
                    patch(body, n, t.use_rewrite, id)?;
                }
                if t.out_rewrite != 0 {
                    let id = t.out_id.ok_or(AllocError::InconsistentState)?;
                    patch(body, n, t.out_rewrite, id)?;
                }
            }
        }

        if let NodeKind::Inst(data) = &mut body.node_mut(n).kind {
            for op in data.operands.iter_mut() {
                if let Operand::Slot(w) = op {
                    let slot = works.get(*w).slot.ok_or(AllocError::InconsistentState)?;
                    *op = Operand::Mem {
                        base: RegRef::Phys(sp),
                        disp: stack.slot(slot).offset,
                    };
                }
            }
        }

        if cfg!(debug_assertions) {
            if let NodeKind::Inst(data) = &body.node(n).kind {
                for op in data.operands.iter() {
                    let virt = matches!(
                        op,
                        Operand::Reg(RegRef::Virt(_)) | Operand::Mem { base: RegRef::Virt(_), .. }
                    );
                    debug_assert!(!virt, "virtual register survived the rewrite");
                }
            }
        }
    }
    Ok(())
}

/// Overwrite the register of every operand slot selected by `mask`.
fn patch(body: &mut FuncBody, n: crate::node::NodeIdx, mask: u32, id: PhysId) -> Result<(), AllocError> {
    let NodeKind::Inst(data) = &mut body.node_mut(n).kind else {
        return Err(AllocError::InconsistentState);
    };
    let mut bits = mask;
    while bits != 0 {
        let slot = bits.trailing_zeros() as usize;
        bits &= bits - 1;
        let Some(op) = data.operands.get_mut(slot) else {
            return Err(AllocError::InconsistentState);
        };
        match op {
            Operand::Reg(r) => *r = RegRef::Phys(id),
            Operand::Mem { base, .. } => *base = RegRef::Phys(id),
            _ => return Err(AllocError::InconsistentState),
        }
    }
    Ok(())
}
