//! The pass driver.
//!
//! [RegAlloc] owns every per-function store; [RegAlloc::run_on_function]
//! resets them, asks the backend to describe the machine, and runs the
//! stages in a fixed order. The backend's `on_done` runs on every exit
//! path, success or failure, so its per-function state never leaks between
//! runs.

use index_vec::IndexVec;

use crate::arch::{ArchBackend, CfgCtx};
use crate::assign::Assignment;
use crate::cfg::{BlockIdx, Cfg};
use crate::inst::{RaInst, RaInstIdx};
use crate::local::LocalAlloc;
use crate::node::{FuncBody, NodeKind};
use crate::reg::{ByGroup, MachineDesc, RegMask};
use crate::stack::{self, Frame, StackAllocator};
use crate::workreg::WorkRegs;
use crate::{dump, global, liveness, rewrite, AllocError, Config};

/// The register allocation pass. One instance can be reused across many
/// functions; it must not be re-entered for the same function.
#[derive(Debug, Default)]
pub struct RegAlloc {
    config: Config,
    machine: MachineDesc,
    cfg: Cfg,
    works: WorkRegs,
    ra_insts: IndexVec<RaInstIdx, RaInst>,
    stack: StackAllocator,
    clobbered: ByGroup<RegMask>,
    global_max_live: ByGroup<u32>,
    inst_count: u32,
    frame: Frame,
}

impl RegAlloc {
    pub fn new(config: Config) -> Self {
        RegAlloc {
            config,
            ..RegAlloc::default()
        }
    }

    /// Allocate registers for the function in `body`, rewriting it in
    /// place. On error the body is left partially rewritten and must be
    /// discarded by the caller.
    pub fn run_on_function<A: ArchBackend>(
        &mut self,
        arch: &mut A,
        body: &mut FuncBody,
    ) -> Result<(), AllocError> {
        self.reset();
        self.machine = arch.on_init();
        let result = self.run_steps(arch, body);
        arch.on_done();
        if let Err(e) = &result {
            log::debug!("register allocation failed: {e}");
        }
        result
    }

    fn reset(&mut self) {
        self.cfg.clear();
        self.works.clear();
        self.ra_insts.clear();
        self.stack.clear();
        self.clobbered = ByGroup::new();
        self.global_max_live = ByGroup::new();
        self.inst_count = 0;
        self.frame = Frame::default();
    }

    fn run_steps<A: ArchBackend>(
        &mut self,
        arch: &mut A,
        body: &mut FuncBody,
    ) -> Result<(), AllocError> {
        self.stage("cfg");
        {
            let mut ctx = CfgCtx {
                body,
                cfg: &mut self.cfg,
                works: &mut self.works,
                ra_insts: &mut self.ra_insts,
                machine: &self.machine,
                inst_count: &mut self.inst_count,
            };
            arch.build_cfg(&mut ctx)?;
        }
        if self.cfg.has_dangling_blocks() {
            return Err(AllocError::DanglingBlocks);
        }
        if self.cfg.block_count() == 0 {
            return Ok(());
        }

        self.stage("views");
        self.cfg.build_views();
        if self.config.logger_flags.dump_blocks {
            log::debug!("blocks:\n{}", dump::dump_blocks(&self.cfg));
        }

        self.stage("prune");
        self.cfg.remove_unreachable_blocks(body);

        self.stage("dominators");
        self.cfg.build_dominators();
        self.cfg.build_loop_weights();

        self.stage("liveness");
        self.global_max_live =
            liveness::build(body, &mut self.cfg, &mut self.works, &mut self.ra_insts);
        if self.config.logger_flags.dump_liveness {
            log::debug!("liveness:\n{}", dump::dump_liveness(&self.cfg));
        }
        if self.config.logger_flags.dump_live_spans {
            log::debug!("live spans:\n{}", dump::dump_live_spans(&self.works));
        }

        self.stage("global");
        global::run(&mut self.works, &self.ra_insts, &self.machine)?;

        self.stage("local");
        let func_end = body
            .iter()
            .find(|n| matches!(body.node(*n).kind, NodeKind::FuncEnd));
        let cur = Assignment::new(self.works.len());
        LocalAlloc {
            arch,
            body,
            cfg: &mut self.cfg,
            works: &mut self.works,
            ra_insts: &mut self.ra_insts,
            stack: &mut self.stack,
            machine: &self.machine,
            clobbered: &mut self.clobbered,
            cur,
            func_end,
        }
        .run()?;

        self.stage("frame");
        self.frame = stack::update_stack_frame(
            body,
            &mut self.works,
            &mut self.stack,
            &self.machine,
            &self.clobbered,
        );
        stack::insert_prolog_epilog(arch, body, &self.cfg, &self.works, &self.frame)?;

        if self.config.logger_flags.annotate_code {
            dump::annotate_code(body, &self.cfg);
        }

        self.stage("rewrite");
        rewrite::run(
            body,
            &self.works,
            &self.stack,
            &self.ra_insts,
            self.machine.sp,
        )?;
        Ok(())
    }

    fn stage(&self, name: &str) {
        if self.config.debug_passes {
            log::debug!("pass stage: {name}");
        }
    }

    /// The entry block, once a CFG exists.
    pub fn entry_block(&self) -> Option<BlockIdx> {
        if self.cfg.block_count() == 0 {
            None
        } else {
            Some(self.cfg.entry())
        }
    }

    pub fn block_count(&self) -> usize {
        self.cfg.block_count()
    }

    pub fn reachable_block_count(&self) -> usize {
        self.cfg.reachable_count()
    }

    /// Physical registers the rewritten function writes.
    pub fn clobbered_regs(&self) -> &ByGroup<RegMask> {
        &self.clobbered
    }

    /// Per-group maximum of simultaneously live registers.
    pub fn global_max_live_count(&self) -> &ByGroup<u32> {
        &self.global_max_live
    }

    pub fn work_reg_count(&self) -> usize {
        self.works.len()
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Read access to the CFG for inspection and tests.
    pub fn cfg(&self) -> &Cfg {
        &self.cfg
    }
}
