//! The pseudo-instruction node stream.
//!
//! A [FuncBody] owns everything the front-end emitted for one function: an
//! arena of [Node]s threaded into a doubly linked list by index, the label
//! table, and the virtual register table. The allocator mutates the stream
//! in two ways only: it unlinks unreachable code, and it splices in the
//! moves, loads, saves and frame adjustments that allocation requires.
//!
//! Instruction operands are *slots*: the per-instruction rewrite masks built
//! during CFG construction select operand slots by index, so the final
//! rewrite never has to decode an instruction again.

use smallvec::SmallVec;

use crate::inst::RaInstIdx;
use crate::reg::{PhysId, RegGroup, VirtIdx, VirtReg};
use crate::workreg::WorkIdx;
use index_vec::IndexVec;

index_vec::define_index_type! {
    /// Index of a node in a [FuncBody] arena.
    pub struct NodeIdx = u32;
}

index_vec::define_index_type! {
    /// Index of a label on a [FuncBody].
    pub struct LabelIdx = u32;
}

/// A register reference inside an operand slot. Virtual before the pass,
/// physical after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegRef {
    Virt(VirtIdx),
    Phys(PhysId),
}

/// One operand slot of an instruction node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    None,
    Reg(RegRef),
    /// A memory reference through a base register.
    Mem { base: RegRef, disp: i32 },
    /// The stack home of a work register. Emitted by backend load/save
    /// hooks before frame layout is known; the rewriter replaces it with a
    /// stack-pointer relative [Operand::Mem].
    Slot(WorkIdx),
    Imm(i64),
    Label(LabelIdx),
}

/// An instruction node: an opcode whose meaning only the backend knows, plus
/// operand slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstData {
    pub op: u32,
    pub operands: SmallVec<[Operand; 4]>,
}

impl InstData {
    pub fn new(op: u32, operands: impl IntoIterator<Item = Operand>) -> Self {
        InstData {
            op,
            operands: operands.into_iter().collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Start of the function; the backend models incoming arguments as
    /// fixed outputs of this node.
    FuncEntry,
    /// End of the function body. Nothing is allocated past this node.
    FuncEnd,
    Label(LabelIdx),
    Inst(InstData),
    /// Free-form annotation. Ignored by everything except logging.
    Comment(String),
}

/// A node in the stream. `prev`/`next` thread the arena into a list;
/// unlinked nodes stay in the arena but are unreachable from the list.
#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub prev: Option<NodeIdx>,
    pub next: Option<NodeIdx>,
    /// Linear position assigned during CFG construction. Instruction
    /// positions are even; odd positions address the write point of the
    /// instruction before them.
    pub pos: u32,
    /// The allocator's per-instruction record, if this is an instruction
    /// the CFG builder analysed.
    pub ra: Option<RaInstIdx>,
}

/// Where an incoming function argument lives on entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgLoc {
    Reg(PhysId),
    /// Byte offset into the caller-pushed argument area.
    Stack(u32),
}

/// One incoming function argument.
#[derive(Clone, Copy, Debug)]
pub struct FuncArg {
    pub virt: VirtIdx,
    pub loc: ArgLoc,
}

/// The node stream of one function, together with its labels and virtual
/// registers.
#[derive(Debug, Default)]
pub struct FuncBody {
    nodes: IndexVec<NodeIdx, Node>,
    head: Option<NodeIdx>,
    tail: Option<NodeIdx>,
    labels: IndexVec<LabelIdx, Option<NodeIdx>>,
    virt_regs: IndexVec<VirtIdx, VirtReg>,
    /// Incoming arguments, in declaration order.
    pub args: SmallVec<[FuncArg; 6]>,
}

impl FuncBody {
    pub fn new() -> Self {
        FuncBody::default()
    }

    /// Create a new label. It is unbound until a `Label` node carrying it is
    /// linked into the stream.
    pub fn new_label(&mut self) -> LabelIdx {
        self.labels.push(None)
    }

    pub fn new_virt_reg(&mut self, group: RegGroup, size: u32, align: u32) -> VirtIdx {
        self.virt_regs.push(VirtReg::new(group, size, align))
    }

    pub fn virt_reg(&self, v: VirtIdx) -> &VirtReg {
        &self.virt_regs[v]
    }

    pub fn virt_reg_count(&self) -> usize {
        self.virt_regs.len()
    }

    pub fn node(&self, n: NodeIdx) -> &Node {
        &self.nodes[n]
    }

    pub fn node_mut(&mut self, n: NodeIdx) -> &mut Node {
        &mut self.nodes[n]
    }

    pub fn head(&self) -> Option<NodeIdx> {
        self.head
    }

    pub fn tail(&self) -> Option<NodeIdx> {
        self.tail
    }

    /// The node a label is bound to, if any.
    pub fn label_node(&self, l: LabelIdx) -> Option<NodeIdx> {
        self.labels[l]
    }

    fn alloc(&mut self, kind: NodeKind) -> NodeIdx {
        let n = self.nodes.push(Node {
            kind,
            prev: None,
            next: None,
            pos: 0,
            ra: None,
        });
        if let NodeKind::Label(l) = &self.nodes[n].kind {
            let l = *l;
            debug_assert!(self.labels[l].is_none(), "label bound twice");
            self.labels[l] = Some(n);
        }
        n
    }

    /// Append a node at the end of the stream.
    pub fn append(&mut self, kind: NodeKind) -> NodeIdx {
        let n = self.alloc(kind);
        match self.tail {
            Some(t) => {
                self.nodes[t].next = Some(n);
                self.nodes[n].prev = Some(t);
            }
            None => self.head = Some(n),
        }
        self.tail = Some(n);
        n
    }

    /// Insert a new node right after `at`.
    pub fn insert_after(&mut self, at: NodeIdx, kind: NodeKind) -> NodeIdx {
        let n = self.alloc(kind);
        let next = self.nodes[at].next;
        self.nodes[n].prev = Some(at);
        self.nodes[n].next = next;
        self.nodes[at].next = Some(n);
        match next {
            Some(nx) => self.nodes[nx].prev = Some(n),
            None => self.tail = Some(n),
        }
        n
    }

    /// Insert a new node right before `at`.
    pub fn insert_before(&mut self, at: NodeIdx, kind: NodeKind) -> NodeIdx {
        let n = self.alloc(kind);
        let prev = self.nodes[at].prev;
        self.nodes[n].next = Some(at);
        self.nodes[n].prev = prev;
        self.nodes[at].prev = Some(n);
        match prev {
            Some(pv) => self.nodes[pv].next = Some(n),
            None => self.head = Some(n),
        }
        n
    }

    /// Remove `n` from the stream. The arena entry stays behind; only the
    /// links are cut.
    pub fn unlink(&mut self, n: NodeIdx) {
        let (prev, next) = (self.nodes[n].prev, self.nodes[n].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(nx) => self.nodes[nx].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[n].prev = None;
        self.nodes[n].next = None;
        if let NodeKind::Label(l) = &self.nodes[n].kind {
            self.labels[*l] = None;
        }
    }

    /// Iterate the stream in order, front to back.
    pub fn iter(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let n = cur?;
            cur = self.nodes[n].next;
            Some(n)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn kinds(body: &FuncBody) -> Vec<NodeKind> {
        body.iter().map(|n| body.node(n).kind.clone()).collect()
    }

    #[test]
    fn append_links_in_order() {
        let mut b = FuncBody::new();
        b.append(NodeKind::FuncEntry);
        b.append(NodeKind::FuncEnd);
        assert_eq!(kinds(&b), vec![NodeKind::FuncEntry, NodeKind::FuncEnd]);
    }

    #[test]
    fn splice_before_and_after() {
        let mut b = FuncBody::new();
        let first = b.append(NodeKind::FuncEntry);
        let last = b.append(NodeKind::FuncEnd);
        let mid = b.insert_after(first, NodeKind::Comment("mid".into()));
        b.insert_before(last, NodeKind::Comment("late".into()));
        b.insert_before(mid, NodeKind::Comment("early".into()));
        assert_eq!(
            kinds(&b),
            vec![
                NodeKind::FuncEntry,
                NodeKind::Comment("early".into()),
                NodeKind::Comment("mid".into()),
                NodeKind::Comment("late".into()),
                NodeKind::FuncEnd,
            ]
        );
    }

    #[test]
    fn unlink_repairs_links_and_labels() {
        let mut b = FuncBody::new();
        let first = b.append(NodeKind::FuncEntry);
        let l = b.new_label();
        let lab = b.append(NodeKind::Label(l));
        let last = b.append(NodeKind::FuncEnd);
        assert_eq!(b.label_node(l), Some(lab));
        b.unlink(lab);
        assert_eq!(b.label_node(l), None);
        assert_eq!(b.node(first).next, Some(last));
        assert_eq!(b.node(last).prev, Some(first));
        assert_eq!(kinds(&b).len(), 2);
    }
}
