//! Control-flow graph over the node stream.
//!
//! Blocks live in an arena and are referenced by [BlockIdx] everywhere; the
//! ordered block array (entry first), the function-exit list and the
//! post-order view hold indices into that arena. Creating a block
//! ([Cfg::new_block]) and registering it ([Cfg::add_block]) are separate
//! steps so the pass can verify the backend did not leave dangling blocks
//! behind.
//!
//! Edges are kept symmetric by construction: [Cfg::append_successor] and
//! [Cfg::prepend_successor] are the only way to connect blocks and they
//! always update both sides. The first successor of a block with a natural
//! fallthrough is that fallthrough.

use smallvec::SmallVec;
use vob::Vob;

use crate::assign::Assignment;
use crate::node::{FuncBody, LabelIdx, NodeIdx, NodeKind};
use crate::reg::ByGroup;

index_vec::define_index_type! {
    /// Index of a block in the CFG arena.
    pub struct BlockIdx = u32;
}

/// Lifecycle and property flags of a [Block].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockFlags(u16);

impl BlockFlags {
    /// The backend finished describing the block's instructions.
    pub const CONSTRUCTED: BlockFlags = BlockFlags(1 << 0);
    /// Reachable from the entry block; set by the post-order walk.
    pub const REACHABLE: BlockFlags = BlockFlags(1 << 1);
    /// The local allocator finished the block.
    pub const ALLOCATED: BlockFlags = BlockFlags(1 << 2);
    /// The block returns from the function.
    pub const FUNC_EXIT: BlockFlags = BlockFlags(1 << 3);
    /// The block ends in a jump, conditional jump or return.
    pub const HAS_TERMINATOR: BlockFlags = BlockFlags(1 << 4);
    /// Control can fall through to the next block in the stream; the
    /// fallthrough is always successor 0.
    pub const HAS_CONSECUTIVE: BlockFlags = BlockFlags(1 << 5);
    /// Some instruction in the block carries a fixed register constraint.
    pub const HAS_FIXED_REGS: BlockFlags = BlockFlags(1 << 6);
    /// The block contains a function call.
    pub const HAS_CALLS: BlockFlags = BlockFlags(1 << 7);

    pub fn has(self, f: BlockFlags) -> bool {
        self.0 & f.0 != 0
    }

    pub fn add(&mut self, f: BlockFlags) {
        self.0 |= f.0;
    }
}

/// A basic block.
#[derive(Debug)]
pub struct Block {
    pub flags: BlockFlags,
    /// The label starting the block, if the front-end gave it one.
    pub label: Option<LabelIdx>,
    /// First and last node of the block, both inclusive.
    pub first: Option<NodeIdx>,
    pub last: Option<NodeIdx>,
    /// Linear position range `[first_pos, end_pos)` of the block's
    /// instructions.
    pub first_pos: u32,
    pub end_pos: u32,
    /// Loop nesting weight; every enclosing natural loop adds one.
    pub weight: u32,
    /// Index into the post-order view, assigned by [Cfg::build_views].
    pub pov_order: u32,
    /// Visited mark for graph walks; compared against the pass timestamp.
    pub timestamp: u64,
    /// Immediate dominator. The entry block is its own dominator.
    pub idom: Option<BlockIdx>,
    pub predecessors: SmallVec<[BlockIdx; 2]>,
    pub successors: SmallVec<[BlockIdx; 2]>,
    /// Liveness bitsets over work register ids.
    pub live_in: Vob,
    pub live_out: Vob,
    pub gen: Vob,
    pub kill: Vob,
    /// Maximum number of simultaneously live registers per group.
    pub max_live: ByGroup<u32>,
    /// Register assignment on entry, established by the local allocator on
    /// the first incoming edge.
    pub(crate) entry_assign: Option<Assignment>,
}

impl Block {
    fn new() -> Self {
        Block {
            flags: BlockFlags::default(),
            label: None,
            first: None,
            last: None,
            first_pos: 0,
            end_pos: 0,
            weight: 0,
            pov_order: u32::MAX,
            timestamp: 0,
            idom: None,
            predecessors: SmallVec::new(),
            successors: SmallVec::new(),
            live_in: Vob::new(),
            live_out: Vob::new(),
            gen: Vob::new(),
            kill: Vob::new(),
            max_live: ByGroup::new(),
            entry_assign: None,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.flags.has(BlockFlags::REACHABLE)
    }

    pub fn is_func_exit(&self) -> bool {
        self.flags.has(BlockFlags::FUNC_EXIT)
    }

    pub fn has_terminator(&self) -> bool {
        self.flags.has(BlockFlags::HAS_TERMINATOR)
    }

    pub fn has_consecutive(&self) -> bool {
        self.flags.has(BlockFlags::HAS_CONSECUTIVE)
    }

    /// The natural fallthrough successor, if the block has one.
    pub fn consecutive(&self) -> Option<BlockIdx> {
        if self.has_consecutive() {
            self.successors.first().copied()
        } else {
            None
        }
    }

    pub(crate) fn resize_live_bits(&mut self, n: usize) {
        self.live_in = Vob::from_elem(false, n);
        self.live_out = Vob::from_elem(false, n);
        self.gen = Vob::from_elem(false, n);
        self.kill = Vob::from_elem(false, n);
    }
}

/// The CFG of one function.
#[derive(Debug, Default)]
pub struct Cfg {
    blocks: index_vec::IndexVec<BlockIdx, Block>,
    /// Registered blocks in registration order; entry first.
    order: Vec<BlockIdx>,
    /// Function-exit blocks.
    exits: Vec<BlockIdx>,
    /// Post-order view over reachable blocks.
    pov: Vec<BlockIdx>,
    /// Blocks handed out by [Cfg::new_block]; must match `order.len()` when
    /// construction finishes.
    created: u32,
    last_timestamp: u64,
    /// Label to block association.
    label_block: index_vec::IndexVec<LabelIdx, Option<BlockIdx>>,
}

impl Cfg {
    pub fn clear(&mut self) {
        *self = Cfg::default();
    }

    pub fn block(&self, b: BlockIdx) -> &Block {
        &self.blocks[b]
    }

    pub fn block_mut(&mut self, b: BlockIdx) -> &mut Block {
        &mut self.blocks[b]
    }

    /// The entry block. Only valid once the backend registered it.
    pub fn entry(&self) -> BlockIdx {
        debug_assert!(!self.order.is_empty());
        self.order[0]
    }

    pub fn block_count(&self) -> usize {
        self.order.len()
    }

    pub fn reachable_count(&self) -> usize {
        self.pov.len()
    }

    pub fn blocks_in_order(&self) -> &[BlockIdx] {
        &self.order
    }

    pub fn exits(&self) -> &[BlockIdx] {
        &self.exits
    }

    pub fn pov(&self) -> &[BlockIdx] {
        &self.pov
    }

    /// Reverse post-order, the order both allocators process blocks in.
    pub fn rpo(&self) -> impl Iterator<Item = BlockIdx> + '_ {
        self.pov.iter().rev().copied()
    }

    pub fn has_dangling_blocks(&self) -> bool {
        self.created as usize != self.order.len()
    }

    pub fn next_timestamp(&mut self) -> u64 {
        self.last_timestamp += 1;
        self.last_timestamp
    }

    /// Create a block without registering it.
    pub fn new_block(&mut self) -> BlockIdx {
        self.created += 1;
        self.blocks.push(Block::new())
    }

    /// Register a created block, giving it a place in the block array.
    pub fn add_block(&mut self, b: BlockIdx) {
        debug_assert!(!self.order.contains(&b));
        self.order.push(b);
    }

    /// Register `b` as a function exit.
    pub fn add_exit_block(&mut self, b: BlockIdx) {
        self.blocks[b].flags.add(BlockFlags::FUNC_EXIT);
        self.exits.push(b);
    }

    /// Connect `b -> s`, appending `s` to `b`'s successor list.
    pub fn append_successor(&mut self, b: BlockIdx, s: BlockIdx) {
        debug_assert!(!self.blocks[b].successors.contains(&s));
        self.blocks[b].successors.push(s);
        self.blocks[s].predecessors.push(b);
    }

    /// Connect `b -> s` with `s` forced to be the first successor. Used for
    /// the natural fallthrough edge.
    pub fn prepend_successor(&mut self, b: BlockIdx, s: BlockIdx) {
        debug_assert!(!self.blocks[b].successors.contains(&s));
        self.blocks[b].successors.insert(0, s);
        self.blocks[s].predecessors.push(b);
    }

    /// Disconnect `b -> s`, removing the edge from both sides.
    pub fn remove_successor(&mut self, b: BlockIdx, s: BlockIdx) {
        self.blocks[b].successors.retain(|x| *x != s);
        self.blocks[s].predecessors.retain(|x| *x != b);
    }

    /// The block a label belongs to, if one was associated yet.
    pub fn block_of_label(&self, l: LabelIdx) -> Option<BlockIdx> {
        self.label_block.get(l).copied().flatten()
    }

    fn set_block_of_label(&mut self, l: LabelIdx, b: BlockIdx) {
        if self.label_block.len() <= l.index() {
            self.label_block.resize(l.index() + 1, None);
        }
        self.label_block[l] = Some(b);
        if self.blocks[b].label.is_none() {
            self.blocks[b].label = Some(l);
        }
    }

    /// Return the block starting at `label_node`, creating it if no label in
    /// the same label run has one yet. A run is a sequence of adjacent label
    /// and comment nodes with no code in between; all its labels share one
    /// block.
    pub fn new_block_or_existing_at(&mut self, body: &FuncBody, label_node: NodeIdx) -> BlockIdx {
        debug_assert!(matches!(body.node(label_node).kind, NodeKind::Label(_)));
        let mut run: SmallVec<[LabelIdx; 4]> = SmallVec::new();
        let mut first_node = label_node;
        let mut existing = None;

        let mut scan = Some(label_node);
        while let Some(n) = scan {
            match &body.node(n).kind {
                NodeKind::Label(l) => {
                    run.push(*l);
                    first_node = n;
                    if existing.is_none() {
                        existing = self.block_of_label(*l);
                    }
                }
                NodeKind::Comment(_) => {}
                _ => break,
            }
            scan = body.node(n).prev;
        }
        let mut scan = body.node(label_node).next;
        while let Some(n) = scan {
            match &body.node(n).kind {
                NodeKind::Label(l) => {
                    run.push(*l);
                    if existing.is_none() {
                        existing = self.block_of_label(*l);
                    }
                }
                NodeKind::Comment(_) => {}
                _ => break,
            }
            scan = body.node(n).next;
        }

        let b = existing.unwrap_or_else(|| self.new_block());
        for l in run {
            self.set_block_of_label(l, b);
        }
        if self.blocks[b].first.is_none() {
            self.blocks[b].first = Some(first_node);
        }
        b
    }

    /// Compute the post-order view from the entry block, marking every
    /// visited block reachable and stamping its post-order index.
    pub fn build_views(&mut self) {
        self.pov.clear();
        if self.order.is_empty() {
            return;
        }
        let ts = self.next_timestamp();
        let entry = self.entry();
        // Iterative DFS; each stack slot remembers how many successors have
        // been explored already.
        let mut stack: Vec<(BlockIdx, usize)> = vec![(entry, 0)];
        self.blocks[entry].timestamp = ts;
        while let Some((b, i)) = stack.pop() {
            if i < self.blocks[b].successors.len() {
                stack.push((b, i + 1));
                let s = self.blocks[b].successors[i];
                if self.blocks[s].timestamp != ts {
                    self.blocks[s].timestamp = ts;
                    stack.push((s, 0));
                }
            } else {
                self.blocks[b].flags.add(BlockFlags::REACHABLE);
                self.blocks[b].pov_order = self.pov.len() as u32;
                self.pov.push(b);
            }
        }
    }

    /// Drop every unreachable block: its nodes are unlinked from the stream,
    /// its edges are cut, and it is removed from the block array and the
    /// exit list. Must run after [Cfg::build_views].
    pub fn remove_unreachable_blocks(&mut self, body: &mut FuncBody) {
        let dead: Vec<BlockIdx> = self
            .order
            .iter()
            .copied()
            .filter(|b| !self.blocks[*b].is_reachable())
            .collect();
        if dead.is_empty() {
            return;
        }
        log::debug!("removing {} unreachable block(s)", dead.len());
        for b in dead.iter().copied() {
            if let (Some(first), Some(last)) = (self.blocks[b].first, self.blocks[b].last) {
                let mut cur = first;
                loop {
                    let next = body.node(cur).next;
                    body.unlink(cur);
                    if cur == last {
                        break;
                    }
                    match next {
                        Some(n) => cur = n,
                        None => break,
                    }
                }
            }
            for s in std::mem::take(&mut self.blocks[b].successors) {
                self.blocks[s].predecessors.retain(|x| *x != b);
            }
            for p in std::mem::take(&mut self.blocks[b].predecessors) {
                self.blocks[p].successors.retain(|x| *x != b);
            }
        }
        let blocks = &self.blocks;
        self.order.retain(|b| blocks[*b].is_reachable());
        self.exits.retain(|b| blocks[*b].is_reachable());
    }

    /// Build the immediate-dominator tree over the reachable blocks.
    ///
    /// Iterative fixed point on reverse post-order: each block's dominator
    /// is the intersection of its processed predecessors, where intersection
    /// climbs the idom chains until the post-order indices meet.
    pub fn build_dominators(&mut self) {
        if self.pov.is_empty() {
            return;
        }
        let entry = self.entry();
        self.blocks[entry].idom = Some(entry);
        let mut changed = true;
        let mut iters = 0usize;
        while changed {
            changed = false;
            iters += 1;
            let rpo: Vec<BlockIdx> = self.pov.iter().rev().copied().collect();
            for b in rpo {
                if b == entry {
                    continue;
                }
                let mut new_idom: Option<BlockIdx> = None;
                for i in 0..self.blocks[b].predecessors.len() {
                    let p = self.blocks[b].predecessors[i];
                    if self.blocks[p].idom.is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => self.intersect(cur, p),
                    });
                }
                if new_idom.is_some() && self.blocks[b].idom != new_idom {
                    self.blocks[b].idom = new_idom;
                    changed = true;
                }
            }
        }
        log::debug!("dominator tree stable after {iters} iteration(s)");
    }

    fn intersect(&self, mut a: BlockIdx, mut b: BlockIdx) -> BlockIdx {
        while a != b {
            while self.blocks[a].pov_order < self.blocks[b].pov_order {
                a = self.blocks[a].idom.unwrap();
            }
            while self.blocks[b].pov_order < self.blocks[a].pov_order {
                b = self.blocks[b].idom.unwrap();
            }
        }
        a
    }

    /// Whether `a` strictly dominates `b` (`a != b` and every path from the
    /// entry to `b` goes through `a`).
    pub fn strictly_dominates(&self, a: BlockIdx, b: BlockIdx) -> bool {
        if a == b {
            return false;
        }
        let entry = self.entry();
        if a == entry {
            return true;
        }
        let mut x = b;
        while x != entry {
            x = match self.blocks[x].idom {
                Some(i) => i,
                None => return false,
            };
            if x == a {
                return true;
            }
        }
        false
    }

    /// Non-strict dominance.
    pub fn dominates(&self, a: BlockIdx, b: BlockIdx) -> bool {
        a == b || self.strictly_dominates(a, b)
    }

    /// The nearest block dominating both `a` and `b`.
    pub fn nearest_common_dominator(&self, a: BlockIdx, b: BlockIdx) -> BlockIdx {
        self.intersect(a, b)
    }

    /// Collect a block's node indices front to back.
    pub(crate) fn block_nodes(&self, body: &FuncBody, b: BlockIdx) -> Vec<NodeIdx> {
        let blk = self.block(b);
        let (Some(first), Some(last)) = (blk.first, blk.last) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut cur = first;
        loop {
            out.push(cur);
            if cur == last {
                break;
            }
            match body.node(cur).next {
                Some(n) => cur = n,
                None => break,
            }
        }
        out
    }

    /// Find loop back edges and bump the weight of every block inside each
    /// natural loop. A back edge is an edge whose target dominates its
    /// source; the loop body is everything that reaches the source without
    /// passing the header.
    pub fn build_loop_weights(&mut self) {
        let order = self.order.clone();
        for b in order {
            for i in 0..self.blocks[b].successors.len() {
                let header = self.blocks[b].successors[i];
                if !self.dominates(header, b) {
                    continue;
                }
                let ts = self.next_timestamp();
                self.blocks[header].timestamp = ts;
                let mut members = vec![header];
                let mut stack = vec![b];
                while let Some(x) = stack.pop() {
                    if self.blocks[x].timestamp == ts {
                        continue;
                    }
                    self.blocks[x].timestamp = ts;
                    members.push(x);
                    for j in 0..self.blocks[x].predecessors.len() {
                        stack.push(self.blocks[x].predecessors[j]);
                    }
                }
                for m in members {
                    self.blocks[m].weight += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// entry -> a, b; a -> join; b -> join.
    fn diamond() -> (Cfg, [BlockIdx; 4]) {
        let mut cfg = Cfg::default();
        let entry = cfg.new_block();
        let a = cfg.new_block();
        let b = cfg.new_block();
        let join = cfg.new_block();
        for blk in [entry, a, b, join] {
            cfg.add_block(blk);
        }
        cfg.append_successor(entry, a);
        cfg.append_successor(entry, b);
        cfg.append_successor(a, join);
        cfg.append_successor(b, join);
        (cfg, [entry, a, b, join])
    }

    #[test]
    fn edges_are_symmetric() {
        let (cfg, [entry, a, b, join]) = diamond();
        for (p, s) in [(entry, a), (entry, b), (a, join), (b, join)] {
            assert!(cfg.block(p).successors.contains(&s));
            assert!(cfg.block(s).predecessors.contains(&p));
        }
    }

    #[test]
    fn append_then_remove_round_trips() {
        let (mut cfg, [entry, a, ..]) = diamond();
        let before_succ = cfg.block(entry).successors.clone();
        let before_pred = cfg.block(a).predecessors.clone();
        let extra = cfg.new_block();
        cfg.add_block(extra);
        cfg.append_successor(entry, extra);
        cfg.append_successor(extra, a);
        cfg.remove_successor(entry, extra);
        cfg.remove_successor(extra, a);
        assert_eq!(cfg.block(entry).successors, before_succ);
        assert_eq!(cfg.block(a).predecessors, before_pred);
    }

    #[test]
    fn prepend_makes_fallthrough_first() {
        let mut cfg = Cfg::default();
        let b0 = cfg.new_block();
        let taken = cfg.new_block();
        let fall = cfg.new_block();
        for b in [b0, taken, fall] {
            cfg.add_block(b);
        }
        cfg.append_successor(b0, taken);
        cfg.prepend_successor(b0, fall);
        cfg.block_mut(b0).flags.add(BlockFlags::HAS_CONSECUTIVE);
        assert_eq!(cfg.block(b0).consecutive(), Some(fall));
    }

    #[test]
    fn views_mark_reachable_and_assign_po() {
        let (mut cfg, [entry, a, b, join]) = diamond();
        let dead = cfg.new_block();
        cfg.add_block(dead);
        cfg.build_views();
        assert_eq!(cfg.reachable_count(), 4);
        for blk in [entry, a, b, join] {
            assert!(cfg.block(blk).is_reachable());
        }
        assert!(!cfg.block(dead).is_reachable());
        // Post order ends with the entry block.
        assert_eq!(*cfg.pov().last().unwrap(), entry);
        assert_eq!(cfg.block(entry).pov_order as usize, cfg.pov().len() - 1);
    }

    #[test]
    fn dominators_of_a_diamond() {
        let (mut cfg, [entry, a, b, join]) = diamond();
        cfg.build_views();
        cfg.build_dominators();
        assert_eq!(cfg.block(entry).idom, Some(entry));
        assert_eq!(cfg.block(a).idom, Some(entry));
        assert_eq!(cfg.block(b).idom, Some(entry));
        assert_eq!(cfg.block(join).idom, Some(entry));
        assert!(cfg.strictly_dominates(entry, join));
        assert!(!cfg.strictly_dominates(a, join));
        assert!(!cfg.strictly_dominates(join, join));
        assert_eq!(cfg.nearest_common_dominator(a, b), entry);
        // Every reachable block's idom chain reaches the entry.
        for blk in [a, b, join] {
            assert_ne!(cfg.block(blk).idom, Some(blk));
            let mut x = blk;
            let mut steps = 0;
            while x != entry {
                x = cfg.block(x).idom.unwrap();
                steps += 1;
                assert!(steps < 16);
            }
        }
    }

    #[test]
    fn loop_weights_count_nesting() {
        // entry -> header; header -> body, exit; body -> header.
        let mut cfg = Cfg::default();
        let entry = cfg.new_block();
        let header = cfg.new_block();
        let body = cfg.new_block();
        let exit = cfg.new_block();
        for b in [entry, header, body, exit] {
            cfg.add_block(b);
        }
        cfg.append_successor(entry, header);
        cfg.append_successor(header, body);
        cfg.append_successor(header, exit);
        cfg.append_successor(body, header);
        cfg.build_views();
        cfg.build_dominators();
        cfg.build_loop_weights();
        assert_eq!(cfg.block(entry).weight, 0);
        assert_eq!(cfg.block(header).weight, 1);
        assert_eq!(cfg.block(body).weight, 1);
        assert_eq!(cfg.block(exit).weight, 0);
    }

    #[test]
    fn dangling_blocks_are_detected() {
        let mut cfg = Cfg::default();
        let b = cfg.new_block();
        cfg.add_block(b);
        assert!(!cfg.has_dangling_blocks());
        let _ = cfg.new_block();
        assert!(cfg.has_dangling_blocks());
    }
}
