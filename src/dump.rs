//! Diagnostic renderings of the allocator's intermediate state.
//!
//! Everything goes out through `log::debug!`, driven by
//! [crate::LoggerFlags]. The renderings are strings rather than structured
//! data on purpose; they exist for humans reading pass logs.

use std::fmt::Write;

use crate::cfg::Cfg;
use crate::node::{FuncBody, NodeKind};
use crate::workreg::WorkRegs;

pub(crate) fn dump_blocks(cfg: &Cfg) -> String {
    let mut s = String::new();
    for b in cfg.blocks_in_order() {
        let blk = cfg.block(*b);
        let _ = write!(
            s,
            "B{}: pos=[{},{}) weight={} succ=[",
            b.index(),
            blk.first_pos,
            blk.end_pos,
            blk.weight
        );
        for (i, x) in blk.successors.iter().enumerate() {
            if i > 0 {
                let _ = write!(s, ",");
            }
            let _ = write!(s, "B{}", x.index());
        }
        let _ = write!(s, "] pred=[");
        for (i, x) in blk.predecessors.iter().enumerate() {
            if i > 0 {
                let _ = write!(s, ",");
            }
            let _ = write!(s, "B{}", x.index());
        }
        let _ = writeln!(
            s,
            "]{}{}",
            if blk.is_reachable() { "" } else { " unreachable" },
            if blk.is_func_exit() { " exit" } else { "" },
        );
    }
    s
}

pub(crate) fn dump_liveness(cfg: &Cfg) -> String {
    let mut s = String::new();
    for b in cfg.pov() {
        let blk = cfg.block(*b);
        let set = |v: &vob::Vob| {
            let ids: Vec<String> = v.iter_set_bits(..).map(|w| format!("w{w}")).collect();
            ids.join(",")
        };
        let _ = writeln!(
            s,
            "B{}: in={{{}}} out={{{}}} gen={{{}}} kill={{{}}}",
            b.index(),
            set(&blk.live_in),
            set(&blk.live_out),
            set(&blk.gen),
            set(&blk.kill),
        );
    }
    s
}

pub(crate) fn dump_live_spans(works: &WorkRegs) -> String {
    let mut s = String::new();
    for (w, wr) in works.iter() {
        let _ = write!(
            s,
            "w{} (v{}, {:?}): prio={} refs={} spans=",
            w.index(),
            wr.virt.index(),
            wr.group,
            wr.priority,
            wr.ref_count
        );
        for (i, span) in wr.spans.iter().enumerate() {
            if i > 0 {
                let _ = write!(s, " ");
            }
            let _ = write!(s, "[{},{})", span.start, span.end);
        }
        let _ = writeln!(s);
    }
    s
}

/// Attach a comment node after every block's first node naming the block
/// and its position range.
pub(crate) fn annotate_code(body: &mut FuncBody, cfg: &Cfg) {
    for b in cfg.blocks_in_order() {
        let blk = cfg.block(*b);
        let Some(first) = blk.first else { continue };
        // Skip nodes already carrying an annotation.
        if let Some(next) = body.node(first).next {
            if matches!(body.node(next).kind, NodeKind::Comment(_)) {
                continue;
            }
        }
        let text = format!(
            "block B{} [{},{}) weight={}",
            b.index(),
            blk.first_pos,
            blk.end_pos,
            blk.weight
        );
        body.insert_after(first, NodeKind::Comment(text));
    }
}
