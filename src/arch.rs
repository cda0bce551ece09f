//! The architecture backend seam.
//!
//! The allocator core never inspects an opcode. Everything target specific
//! is behind [ArchBackend]: the backend describes the machine, walks the
//! node stream to build the CFG and the per-instruction tied-register
//! records (through a [CfgCtx]), and materialises the move/swap/load/save
//! and prolog/epilog code the allocator requests (through an [EmitCtx]).

use index_vec::IndexVec;

use crate::cfg::{BlockFlags, BlockIdx, Cfg};
use crate::inst::{RaInst, RaInstBuilder, RaInstIdx, TiedFlags};
use crate::node::{FuncBody, LabelIdx, NodeIdx, NodeKind};
use crate::reg::{MachineDesc, PhysId, VirtIdx};
use crate::stack::Frame;
use crate::workreg::{WorkIdx, WorkRegs};
use crate::AllocError;

/// Provided by the architecture layer; drives everything the allocator
/// cannot know on its own.
///
/// `on_done` is called on every exit path, including failed runs, so
/// backends can release per-function resources unconditionally.
pub trait ArchBackend {
    /// Describe the machine. Called once per function before anything else.
    fn on_init(&mut self) -> MachineDesc;

    /// Tear down per-function state. Always called, even on error.
    fn on_done(&mut self);

    /// Walk the node stream: create and register blocks, connect edges, and
    /// describe every instruction's register references via
    /// [CfgCtx::assign_ra_inst].
    fn build_cfg(&mut self, ctx: &mut CfgCtx<'_>) -> Result<(), AllocError>;

    /// Emit a register to register move of `work`.
    fn emit_move(
        &mut self,
        e: &mut EmitCtx<'_>,
        work: WorkIdx,
        dst: PhysId,
        src: PhysId,
    ) -> Result<(), AllocError>;

    /// Emit an exchange of two registers. Only called for groups whose
    /// machine description advertises swap support.
    fn emit_swap(
        &mut self,
        e: &mut EmitCtx<'_>,
        a_work: WorkIdx,
        a_phys: PhysId,
        b_work: WorkIdx,
        b_phys: PhysId,
    ) -> Result<(), AllocError>;

    /// Emit a reload of `work` from its stack home into `dst`.
    fn emit_load(&mut self, e: &mut EmitCtx<'_>, work: WorkIdx, dst: PhysId)
        -> Result<(), AllocError>;

    /// Emit a store of `work` from `src` to its stack home.
    fn emit_save(&mut self, e: &mut EmitCtx<'_>, work: WorkIdx, src: PhysId)
        -> Result<(), AllocError>;

    /// Emit an unconditional jump to `label`. Used to close synthetic edge
    /// blocks.
    fn emit_jump(&mut self, e: &mut EmitCtx<'_>, label: LabelIdx) -> Result<(), AllocError>;

    /// Emit the frame setup at function entry.
    fn emit_prolog(&mut self, e: &mut EmitCtx<'_>, frame: &Frame) -> Result<(), AllocError>;

    /// Emit the frame teardown before a function exit.
    fn emit_epilog(&mut self, e: &mut EmitCtx<'_>, frame: &Frame) -> Result<(), AllocError>;
}

/// Where an [EmitCtx] places the next node.
#[derive(Clone, Copy, Debug)]
enum Cursor {
    /// Insert after this node, then advance past the inserted node, so a
    /// sequence of emissions appears in emission order.
    After(NodeIdx),
    /// Keep inserting directly before this node; emission order is
    /// preserved as well.
    Before(NodeIdx),
}

/// Hands the backend a place in the node stream to emit into.
pub struct EmitCtx<'a> {
    body: &'a mut FuncBody,
    cursor: Cursor,
    works: &'a WorkRegs,
}

impl<'a> EmitCtx<'a> {
    pub(crate) fn after(body: &'a mut FuncBody, at: NodeIdx, works: &'a WorkRegs) -> Self {
        EmitCtx {
            body,
            cursor: Cursor::After(at),
            works,
        }
    }

    pub(crate) fn before(body: &'a mut FuncBody, at: NodeIdx, works: &'a WorkRegs) -> Self {
        EmitCtx {
            body,
            cursor: Cursor::Before(at),
            works,
        }
    }

    /// Append one node at the cursor.
    pub fn emit(&mut self, kind: NodeKind) -> NodeIdx {
        match self.cursor {
            Cursor::After(at) => {
                let n = self.body.insert_after(at, kind);
                self.cursor = Cursor::After(n);
                n
            }
            Cursor::Before(at) => self.body.insert_before(at, kind),
        }
    }

    /// The virtual register a work register mirrors; lets backends pick an
    /// opcode from the register's group and size.
    pub fn virt_of(&self, w: WorkIdx) -> VirtIdx {
        self.works.get(w).virt
    }

    /// The node the cursor currently rests on.
    pub(crate) fn at_node(&self) -> NodeIdx {
        match self.cursor {
            Cursor::After(n) | Cursor::Before(n) => n,
        }
    }

    pub fn body(&self) -> &FuncBody {
        self.body
    }
}

/// The CFG construction context handed to [ArchBackend::build_cfg].
pub struct CfgCtx<'a> {
    pub(crate) body: &'a mut FuncBody,
    pub(crate) cfg: &'a mut Cfg,
    pub(crate) works: &'a mut WorkRegs,
    pub(crate) ra_insts: &'a mut IndexVec<RaInstIdx, RaInst>,
    pub(crate) machine: &'a MachineDesc,
    pub(crate) inst_count: &'a mut u32,
}

impl<'a> CfgCtx<'a> {
    pub fn body(&self) -> &FuncBody {
        self.body
    }

    pub fn machine(&self) -> &MachineDesc {
        self.machine
    }

    /// Unlink a node the walk decided is unreachable (code following an
    /// unconditional terminator with no label in between).
    pub fn remove_node(&mut self, n: NodeIdx) {
        self.body.unlink(n);
    }

    pub fn new_block(&mut self) -> BlockIdx {
        self.cfg.new_block()
    }

    pub fn add_block(&mut self, b: BlockIdx) {
        self.cfg.add_block(b);
    }

    pub fn add_exit_block(&mut self, b: BlockIdx) {
        self.cfg.add_exit_block(b);
    }

    pub fn new_block_or_existing_at(&mut self, label_node: NodeIdx) -> BlockIdx {
        self.cfg.new_block_or_existing_at(self.body, label_node)
    }

    pub fn block_of_label(&self, l: LabelIdx) -> Option<BlockIdx> {
        self.cfg.block_of_label(l)
    }

    pub fn append_successor(&mut self, b: BlockIdx, s: BlockIdx) {
        self.cfg.append_successor(b, s);
    }

    pub fn prepend_successor(&mut self, b: BlockIdx, s: BlockIdx) {
        self.cfg.prepend_successor(b, s);
    }

    pub fn block_mut(&mut self, b: BlockIdx) -> &mut crate::cfg::Block {
        self.cfg.block_mut(b)
    }

    pub fn block(&self, b: BlockIdx) -> &crate::cfg::Block {
        self.cfg.block(b)
    }

    /// Intern a virtual register, yielding its dense work id.
    pub fn as_work_reg(&mut self, virt: VirtIdx) -> Result<WorkIdx, AllocError> {
        self.works.as_work_reg(self.body, virt)
    }

    /// Skip non-code nodes starting at `n`; the result is where a successor
    /// block would begin.
    pub fn find_successor_starting_at(&self, mut n: NodeIdx) -> Option<NodeIdx> {
        loop {
            match &self.body.node(n).kind {
                NodeKind::Comment(_) => n = self.body.node(n).next?,
                _ => return Some(n),
            }
        }
    }

    /// Whether control can flow from `n` to `target` without crossing code.
    pub fn is_next_to(&self, n: NodeIdx, target: NodeIdx) -> bool {
        let mut cur = self.body.node(n).next;
        while let Some(x) = cur {
            if x == target {
                return true;
            }
            match &self.body.node(x).kind {
                NodeKind::Comment(_) | NodeKind::Label(_) => cur = self.body.node(x).next,
                _ => return false,
            }
        }
        false
    }

    /// Freeze the builder's tied records into the allocator's store and
    /// attach them to `node`. Assigns the node its linear position and
    /// resets the builder for the next instruction.
    pub fn assign_ra_inst(
        &mut self,
        node: NodeIdx,
        block: BlockIdx,
        ib: &mut RaInstBuilder,
    ) -> Result<(), AllocError> {
        let pos = *self.inst_count * 2;
        *self.inst_count += 1;

        let works = &*self.works;
        let ra = ib.build(block, pos, |w| works.get(w).group);

        for t in ra.tied_regs() {
            if t.flags.has(TiedFlags::USE_FIXED) || t.flags.has(TiedFlags::OUT_FIXED) {
                self.cfg.block_mut(block).flags.add(BlockFlags::HAS_FIXED_REGS);
            }
            if t.flags.has(TiedFlags::USE_FIXED) {
                let wr = self.works.get_mut(t.work);
                match (wr.fixed_use, t.use_id) {
                    (None, Some(id)) => wr.fixed_use = Some(id),
                    (Some(old), Some(id)) if old != id => wr.fixed_use_conflict = true,
                    _ => {}
                }
            }
        }

        {
            let blk = self.cfg.block_mut(block);
            if blk.first.is_none() {
                blk.first = Some(node);
            }
            blk.last = Some(node);
            if blk.end_pos == 0 {
                blk.first_pos = pos;
            }
            blk.end_pos = pos + 2;
            if ra.is_terminator() {
                blk.flags.add(BlockFlags::HAS_TERMINATOR);
            }
        }

        let idx = self.ra_insts.push(ra);
        let n = self.body.node_mut(node);
        n.pos = pos;
        n.ra = Some(idx);
        ib.reset();
        Ok(())
    }
}
