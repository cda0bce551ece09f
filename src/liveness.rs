//! Liveness analysis.
//!
//! Works in three steps over the reachable blocks:
//!
//!  1. Derive GEN/KILL per block from the tied-register records: a read
//!     before any write of the same register adds it to GEN, the first
//!     write adds it to KILL.
//!  2. Run the classic backward dataflow to a fixed point:
//!     `OUT(b) = union of IN(s)` over successors, `IN(b) = GEN(b) |
//!     (OUT(b) & !KILL(b))`.
//!  3. Scan each block's instructions in reverse to stamp last-use and
//!     dead-write flags on the tied records, build every work register's
//!     live spans, and record register pressure per block and instruction.
//!
//! Positions are twice the instruction index: the even slot is where the
//! instruction reads, the odd slot directly after it is where it writes.
//! A span is half open, `[start, end)`.

use index_vec::IndexVec;
use vob::Vob;

use crate::cfg::Cfg;
use crate::inst::{RaInst, RaInstIdx, TiedFlags};
use crate::node::FuncBody;
use crate::reg::ByGroup;
use crate::workreg::{LiveSpan, WorkRegs};

/// Run the analysis. Returns the per-group maximum of simultaneously live
/// registers over the whole function.
pub(crate) fn build(
    body: &FuncBody,
    cfg: &mut Cfg,
    works: &mut WorkRegs,
    ra_insts: &mut IndexVec<RaInstIdx, RaInst>,
) -> ByGroup<u32> {
    let n = works.len();
    let pov: Vec<_> = cfg.pov().to_vec();
    for b in pov.iter().copied() {
        cfg.block_mut(b).resize_live_bits(n);
    }

    // Step 1: GEN/KILL. All reads of an instruction happen before its
    // writes, so uses are considered first.
    for b in pov.iter().copied() {
        let nodes = cfg.block_nodes(body, b);
        for node in nodes {
            let Some(ra) = body.node(node).ra else { continue };
            let blk = cfg.block_mut(b);
            for t in ra_insts[ra].tied_regs() {
                if t.is_use() && !blk.kill.get(t.work.index()).unwrap_or(false) {
                    blk.gen.set(t.work.index(), true);
                }
            }
            for t in ra_insts[ra].tied_regs() {
                if t.is_out() {
                    blk.kill.set(t.work.index(), true);
                }
            }
        }
    }

    // Step 2: IN/OUT fixed point. Iterating the post-order view converges
    // quickly for a backward problem.
    let mut iters = 0usize;
    let mut changed = true;
    while changed {
        changed = false;
        iters += 1;
        for b in pov.iter().copied() {
            let mut out_new = Vob::from_elem(false, n);
            for i in 0..cfg.block(b).successors.len() {
                let s = cfg.block(b).successors[i];
                for w in cfg.block(s).live_in.iter_set_bits(..) {
                    out_new.set(w, true);
                }
            }
            let mut in_new = cfg.block(b).gen.clone();
            for w in out_new.iter_set_bits(..) {
                if !cfg.block(b).kill.get(w).unwrap_or(false) {
                    in_new.set(w, true);
                }
            }
            let blk = cfg.block_mut(b);
            if out_new != blk.live_out {
                blk.live_out = out_new;
                changed = true;
            }
            if in_new != blk.live_in {
                blk.live_in = in_new;
                changed = true;
            }
        }
    }
    log::debug!("liveness stable after {iters} iteration(s)");

    // Step 3: last-use flags, live spans and statistics.
    let mut global_max: ByGroup<u32> = ByGroup::new();
    let mut span_end: Vec<u32> = vec![0; n];
    for b in pov.iter().copied() {
        let weight = u64::from(cfg.block(b).weight) + 1;
        let mut live = cfg.block(b).live_out.clone();
        let mut counts: ByGroup<u32> = ByGroup::new();
        for w in live.iter_set_bits(..) {
            let wi = crate::workreg::WorkIdx::from_usize(w);
            counts[works.get(wi).group] += 1;
            span_end[w] = cfg.block(b).end_pos;
        }
        let mut max_live = counts;

        let nodes = cfg.block_nodes(body, b);
        for node in nodes.iter().rev().copied() {
            let Some(ra) = body.node(node).ra else { continue };
            let pos = ra_insts[ra].pos;

            // Writes first: scanning backward, the write is the later
            // event of the instruction.
            for ti in 0..ra_insts[ra].tied_count() {
                let t = ra_insts[ra].tied_regs()[ti];
                if !t.is_out() {
                    continue;
                }
                let w = t.work;
                let g = works.get(w).group;
                if live.get(w.index()).unwrap_or(false) {
                    works
                        .get_mut(w)
                        .spans
                        .push(LiveSpan { start: pos + 1, end: span_end[w.index()] });
                    live.set(w.index(), false);
                    counts[g] -= 1;
                } else {
                    // The written value is never read.
                    ra_insts[ra].tied_regs_mut()[ti].flags.add(TiedFlags::KILL);
                    works
                        .get_mut(w)
                        .spans
                        .push(LiveSpan { start: pos + 1, end: pos + 2 });
                }
            }
            for ti in 0..ra_insts[ra].tied_count() {
                let t = ra_insts[ra].tied_regs()[ti];
                if !t.is_use() {
                    continue;
                }
                let w = t.work;
                let g = works.get(w).group;
                if !live.get(w.index()).unwrap_or(false) {
                    ra_insts[ra].tied_regs_mut()[ti]
                        .flags
                        .add(TiedFlags::LAST_USE);
                    live.set(w.index(), true);
                    counts[g] += 1;
                    if counts[g] > max_live[g] {
                        max_live[g] = counts[g];
                    }
                    span_end[w.index()] = pos + 1;
                }
            }

            for (g, c) in counts.iter() {
                ra_insts[ra].live_count[g] = *c;
            }

            // Reference statistics, weighted by loop nesting.
            for t in ra_insts[ra].tied_regs() {
                let wr = works.get_mut(t.work);
                wr.ref_count += u32::from(t.ref_count);
                wr.priority += weight * u64::from(t.ref_count);
            }
        }

        // Whatever is still live was live on entry.
        debug_assert_eq!(live, cfg.block(b).live_in);
        let first_pos = cfg.block(b).first_pos;
        for w in live.iter_set_bits(..) {
            if span_end[w] <= first_pos {
                // Label-only block; the value flows through without
                // occupying a position.
                continue;
            }
            let wi = crate::workreg::WorkIdx::from_usize(w);
            works.get_mut(wi).spans.push(LiveSpan {
                start: first_pos,
                end: span_end[w],
            });
        }

        let blk = cfg.block_mut(b);
        blk.max_live = max_live;
        for (g, m) in max_live.iter() {
            if *m > global_max[g] {
                global_max[g] = *m;
            }
        }
    }

    // Spans were collected block by block; normalise them per register.
    for w in 0..works.len() {
        let wi = crate::workreg::WorkIdx::from_usize(w);
        let spans = &mut works.get_mut(wi).spans;
        spans.sort_by_key(|s| (s.start, s.end));
        let mut merged: Vec<LiveSpan> = Vec::with_capacity(spans.len());
        for s in spans.iter().copied() {
            match merged.last_mut() {
                Some(last) if s.start <= last.end => {
                    if s.end > last.end {
                        last.end = s.end;
                    }
                }
                _ => merged.push(s),
            }
        }
        *spans = merged;
    }

    global_max
}
