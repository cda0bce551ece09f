//! A register allocation pass for JIT assembler back-ends.
//!
//! The pass consumes a linear stream of pseudo-instruction nodes produced by a
//! higher-level compiler front-end. Instructions reference an unbounded supply
//! of *virtual* registers; the pass rewrites the stream so that every register
//! reference is either a concrete physical register or an explicit spill or
//! reload through a stack slot, and adjusts the function's prolog and epilog
//! so the stack frame reflects the spill decisions that were made.
//!
//! The allocator is architecture independent. Everything it needs to know
//! about the target is hidden behind the [ArchBackend] trait: the backend
//! describes the machine (register groups, allocatable and callee-saved
//! masks), builds the control-flow graph by walking the node stream, and
//! materialises the moves, swaps, loads and saves the allocator asks for.
//!
//! Allocation proceeds in stages, each operating on state owned by
//! [RegAlloc] and reset per function:
//!
//!  1. The backend constructs the CFG and a tied-register record per
//!     instruction.
//!  2. A post-order view is built, unreachable blocks are pruned, and an
//!     immediate-dominator tree is computed iteratively.
//!  3. Backward dataflow produces per-block live-in/out sets, per-register
//!     live spans and pressure statistics.
//!  4. A global pass bin-packs non-interfering live spans onto physical
//!     registers, giving each virtual register a preferred home.
//!  5. A local pass walks blocks in reverse post-order, satisfying fixed
//!     constraints, spilling under pressure and reconciling register
//!     assignments across CFG edges.
//!  6. The stack frame is finalised and prolog/epilog code is inserted, and
//!     the rewriter stamps physical ids into the node stream.
//!
//! The pass is single threaded and deterministic: identical input produces a
//! byte-identical rewritten stream.

mod arch;
mod assign;
mod cfg;
mod dump;
mod global;
mod inst;
mod liveness;
mod local;
mod node;
mod pass;
mod reg;
mod rewrite;
mod stack;
mod workreg;


pub use arch::{ArchBackend, CfgCtx, EmitCtx};
pub use cfg::{Block, BlockFlags, BlockIdx};
pub use inst::{InstFlags, RaInstBuilder, TiedFlags};
pub use node::{
    ArgLoc, FuncArg, FuncBody, InstData, LabelIdx, Node, NodeIdx, NodeKind, Operand, RegRef,
};
pub use pass::RegAlloc;
pub use reg::{ByGroup, MachineDesc, PhysId, RegGroup, RegMask, VirtIdx, VirtReg};
pub use stack::Frame;
pub use workreg::WorkIdx;

use thiserror::Error;

/// Errors surfaced by [RegAlloc::run_on_function]. Any error is terminal for
/// the pass: the first failure aborts allocation, the backend's `on_done` is
/// still invoked, and no code is produced for the function.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// A per-function store could not grow.
    #[error("out of memory")]
    OutOfMemory,
    /// An instruction referenced a virtual register id that was never
    /// created on the function body.
    #[error("invalid virtual register id {0}")]
    InvalidVirtId(u32),
    /// Two conflicting fixed output registers were requested for the same
    /// virtual register in one instruction.
    #[error("overlapping fixed registers in one instruction")]
    OverlappedRegs,
    /// A register group has live registers but an empty allocatable set.
    #[error("no registers to allocate in group {0:?}")]
    NoRegistersToAllocate(RegGroup),
    /// The physical/virtual assignment maps went out of sync. This indicates
    /// a bug in the allocator itself and is asserted in debug builds.
    #[error("inconsistent register assignment state")]
    InconsistentState,
    /// The CFG builder left blocks that were created but never added.
    #[error("CFG contains dangling blocks")]
    DanglingBlocks,
    /// An error reported by the architecture backend while emitting code.
    #[error("backend: {0}")]
    Backend(String),
}

/// Selects which intermediate structures are rendered to the `log` crate
/// output while the pass runs. All dumps go out at `debug` level; flags
/// exist so embedders can keep the cheap progress lines while skipping the
/// expensive per-register renderings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoggerFlags {
    /// Attach a comment node to each block header describing the block.
    pub annotate_code: bool,
    /// Dump per-block GEN/KILL/IN/OUT bitsets after the dataflow fixpoint.
    pub dump_liveness: bool,
    /// Dump the live span list of every work register.
    pub dump_live_spans: bool,
    /// Dump the block array with edges and flags after CFG construction.
    pub dump_blocks: bool,
}

impl LoggerFlags {
    /// Enable every dump. Used by embedders that run with a debug logger.
    pub fn all() -> Self {
        LoggerFlags {
            annotate_code: true,
            dump_liveness: true,
            dump_live_spans: true,
            dump_blocks: true,
        }
    }
}

/// Pass configuration, handed to [RegAlloc::new] once and immutable
/// afterwards.
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
    /// Log a progress line per pipeline stage.
    pub debug_passes: bool,
    /// Which intermediate dumps to produce.
    pub logger_flags: LoggerFlags,
}
