//! Global allocation: bin packing live spans onto physical registers.
//!
//! Per register group, work registers are packed in priority order onto the
//! first physical id whose already-committed spans they do not overlap. The
//! result is only a *home* preference: registers that fail to pack stay
//! homeless and the local allocator deals with them, spilling if it must.
//!
//! Two kinds of spans are committed up front: the spans of registers pinned
//! by an observed fixed use id, and one-position spans for every physical id
//! an instruction clobbers, which keeps any crossing live range out of
//! call-clobbered registers.

use index_vec::IndexVec;
use strum::IntoEnumIterator;

use crate::inst::{RaInst, RaInstIdx};
use crate::reg::{MachineDesc, RegGroup};
use crate::workreg::{LiveSpan, WorkIdx, WorkRegs};
use crate::AllocError;

/// Committed spans per physical id of one group.
struct PhysSpans {
    spans: Vec<Vec<LiveSpan>>,
}

impl PhysSpans {
    fn new() -> Self {
        PhysSpans {
            spans: vec![Vec::new(); 32],
        }
    }

    fn interferes(&self, id: usize, candidate: &[LiveSpan]) -> bool {
        self.spans[id]
            .iter()
            .any(|s| candidate.iter().any(|c| c.overlaps(*s)))
    }

    fn commit(&mut self, id: usize, spans: &[LiveSpan]) {
        self.spans[id].extend_from_slice(spans);
    }
}

pub(crate) fn run(
    works: &mut WorkRegs,
    ra_insts: &IndexVec<RaInstIdx, RaInst>,
    machine: &MachineDesc,
) -> Result<(), AllocError> {
    for g in RegGroup::iter() {
        let ids: Vec<WorkIdx> = works.of_group(g).to_vec();
        if ids.is_empty() {
            continue;
        }
        let avail = machine.available[g];
        if avail.is_empty() {
            return Err(AllocError::NoRegistersToAllocate(g));
        }

        let mut phys = PhysSpans::new();
        for (_, ra) in ra_insts.iter_enumerated() {
            for p in ra.clobbered[g].iter() {
                phys.spans[p.index()].push(LiveSpan {
                    start: ra.pos + 1,
                    end: ra.pos + 2,
                });
            }
        }

        // Registers pinned by a fixed use go first; they are not packed
        // anywhere else.
        let mut unpinned: Vec<WorkIdx> = Vec::with_capacity(ids.len());
        for w in ids {
            let wr = works.get(w);
            match wr.fixed_use {
                Some(id) if !wr.fixed_use_conflict => {
                    phys.commit(id.index(), &wr.spans);
                    works.get_mut(w).home = Some(id);
                }
                _ => unpinned.push(w),
            }
        }

        unpinned.sort_by(|a, b| {
            let ra = works.get(*a);
            let rb = works.get(*b);
            rb.priority
                .cmp(&ra.priority)
                .then(rb.span_width().cmp(&ra.span_width()))
                .then(a.cmp(b))
        });

        let mut packed = 0usize;
        for w in unpinned.iter().copied() {
            let spans = works.get(w).spans.clone();
            let choice = avail
                .iter()
                .find(|p| !phys.interferes(p.index(), &spans));
            if let Some(p) = choice {
                phys.commit(p.index(), &spans);
                works.get_mut(w).home = Some(p);
                packed += 1;
            }
        }
        log::debug!(
            "global {:?}: packed {packed}/{} register(s)",
            g,
            unpinned.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reg::{ByGroup, PhysId, RegMask};
    use crate::FuncBody;

    fn machine(gp: RegMask) -> MachineDesc {
        let mut available: ByGroup<RegMask> = ByGroup::new();
        available[RegGroup::Gp] = gp;
        MachineDesc {
            available,
            ..MachineDesc::default()
        }
    }

    fn setup(spans: &[&[LiveSpan]]) -> (WorkRegs, Vec<WorkIdx>) {
        let mut body = FuncBody::new();
        let mut works = WorkRegs::default();
        let mut ids = Vec::new();
        for ss in spans {
            let v = body.new_virt_reg(RegGroup::Gp, 8, 8);
            let w = works.as_work_reg(&body, v).unwrap();
            works.get_mut(w).spans = ss.to_vec();
            ids.push(w);
        }
        (works, ids)
    }

    #[test]
    fn disjoint_ranges_share_a_register() {
        let (mut works, ids) = setup(&[
            &[LiveSpan { start: 0, end: 4 }],
            &[LiveSpan { start: 4, end: 8 }],
        ]);
        let ra_insts = IndexVec::new();
        run(&mut works, &ra_insts, &machine(RegMask(0b11))).unwrap();
        assert_eq!(works.get(ids[0]).home, Some(PhysId(0)));
        assert_eq!(works.get(ids[1]).home, Some(PhysId(0)));
    }

    #[test]
    fn interfering_ranges_get_distinct_registers() {
        let (mut works, ids) = setup(&[
            &[LiveSpan { start: 0, end: 8 }],
            &[LiveSpan { start: 2, end: 6 }],
        ]);
        let ra_insts = IndexVec::new();
        run(&mut works, &ra_insts, &machine(RegMask(0b11))).unwrap();
        let h0 = works.get(ids[0]).home.unwrap();
        let h1 = works.get(ids[1]).home.unwrap();
        assert_ne!(h0, h1);
    }

    #[test]
    fn overflow_stays_homeless() {
        let (mut works, ids) = setup(&[
            &[LiveSpan { start: 0, end: 8 }],
            &[LiveSpan { start: 0, end: 8 }],
        ]);
        // Give the first register the higher priority.
        works.get_mut(ids[0]).priority = 10;
        works.get_mut(ids[1]).priority = 1;
        let ra_insts = IndexVec::new();
        run(&mut works, &ra_insts, &machine(RegMask(0b1))).unwrap();
        assert_eq!(works.get(ids[0]).home, Some(PhysId(0)));
        assert_eq!(works.get(ids[1]).home, None);
    }

    #[test]
    fn empty_group_with_live_registers_fails() {
        let (mut works, _) = setup(&[&[LiveSpan { start: 0, end: 2 }]]);
        let ra_insts = IndexVec::new();
        let err = run(&mut works, &ra_insts, &machine(RegMask::EMPTY)).unwrap_err();
        assert_eq!(err, AllocError::NoRegistersToAllocate(RegGroup::Gp));
    }

    #[test]
    fn fixed_use_pins_and_blocks_others() {
        let (mut works, ids) = setup(&[
            &[LiveSpan { start: 0, end: 8 }],
            &[LiveSpan { start: 0, end: 8 }],
        ]);
        works.get_mut(ids[1]).fixed_use = Some(PhysId(0));
        works.get_mut(ids[1]).priority = 0;
        works.get_mut(ids[0]).priority = 100;
        let ra_insts = IndexVec::new();
        run(&mut works, &ra_insts, &machine(RegMask(0b11))).unwrap();
        assert_eq!(works.get(ids[1]).home, Some(PhysId(0)));
        // The pinned span keeps the high priority register out of p0.
        assert_eq!(works.get(ids[0]).home, Some(PhysId(1)));
    }
}
