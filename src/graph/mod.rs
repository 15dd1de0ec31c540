//! The control-flow graph over JVM instructions
//!
//! Blocks live in an arena keyed by integer label and edges hold labels, never references, so
//! removing or rewriting a block can never dangle. Two singleton labels exist in every graph:
//! [`Label::RETURN`] and [`Label::RETHROW`], which all return/throw terminators flow into.

mod assemble;
mod block;
mod disassemble;
mod edge;

pub use assemble::*;
pub use block::*;
pub use disassemble::*;
pub use edge::*;

use crate::classfile::Constant;
use crate::code::Instruction;
use crate::verifier::{ErrorKind, Source, Verifier};
use std::collections::BTreeMap;

/// A method body as a graph of basic blocks
pub struct InsnGraph {
    pub entry: Label,
    blocks: BTreeMap<Label, Block>,
    forward: BTreeMap<Label, Vec<Edge>>,
    backward: BTreeMap<Label, Vec<Edge>>,
    next_label: i32,
}

impl InsnGraph {
    /// New graph containing the entry block and the return/rethrow singletons
    pub fn new() -> InsnGraph {
        let mut blocks = BTreeMap::new();
        let entry = Label(0);
        blocks.insert(entry, Block::new(entry));
        blocks.insert(Label::RETURN, Block::new(Label::RETURN));
        blocks.insert(Label::RETHROW, Block::new(Label::RETHROW));
        InsnGraph {
            entry,
            blocks,
            forward: BTreeMap::new(),
            backward: BTreeMap::new(),
            next_label: 1,
        }
    }

    /// Allocate a label no block uses yet
    pub fn fresh_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Add a block; its label must be fresh
    pub fn add(&mut self, block: Block) -> Label {
        let label = block.label;
        if label.0 >= self.next_label {
            self.next_label = label.0 + 1;
        }
        self.blocks.insert(label, block);
        label
    }

    /// Create and add an empty block
    pub fn new_block(&mut self) -> Label {
        let label = self.fresh_label();
        self.blocks.insert(label, Block::new(label));
        label
    }

    /// Create and add a block holding the given instructions
    pub fn block_of(&mut self, instructions: Vec<Instruction>) -> Label {
        let label = self.fresh_label();
        self.blocks
            .insert(label, Block::with_instructions(label, instructions));
        label
    }

    pub fn block(&self, label: Label) -> Option<&Block> {
        self.blocks.get(&label)
    }

    pub fn block_mut(&mut self, label: Label) -> Option<&mut Block> {
        self.blocks.get_mut(&label)
    }

    pub fn contains(&self, label: Label) -> bool {
        self.blocks.contains_key(&label)
    }

    /// Blocks in ascending label order (the singletons sort first)
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Remove a block along with every edge that touches it
    pub fn remove(&mut self, label: Label) -> Option<Block> {
        let block = self.blocks.remove(&label)?;
        let outgoing = self.forward.remove(&label).unwrap_or_default();
        for edge in outgoing {
            if let Some(to) = edge.to {
                if let Some(incoming) = self.backward.get_mut(&to) {
                    incoming.retain(|e| e != &edge);
                }
            }
        }
        let incoming = self.backward.remove(&label).unwrap_or_default();
        for edge in incoming {
            if let Some(outgoing) = self.forward.get_mut(&edge.from) {
                outgoing.retain(|e| e != &edge);
            }
        }
        Some(block)
    }

    /// Edges leaving a block
    pub fn out_edges(&self, label: Label) -> &[Edge] {
        self.forward.get(&label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Edges entering a block (opaque edges appear nowhere here until resolved)
    pub fn in_edges(&self, label: Label) -> &[Edge] {
        self.backward.get(&label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All edges in the graph
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.forward.values().flatten()
    }

    /// Edges whose target is still unknown (unresolved `ret`s)
    pub fn opaque_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges().filter(|edge| edge.is_opaque())
    }

    /// Connect two blocks
    ///
    /// Duplicate edges are dropped silently (re-disassembling overlapping exception rows must
    /// not double up edges).
    pub fn connect(&mut self, edge: Edge) {
        let outgoing = self.forward.entry(edge.from).or_default();
        if outgoing.contains(&edge) {
            return;
        }
        outgoing.push(edge.clone());
        if let Some(to) = edge.to {
            self.backward.entry(to).or_default().push(edge);
        }
    }

    /// Connect two blocks, enforcing the structural invariants and reporting violations
    ///
    /// The checks: the singletons have no outgoing edges, the entry block has no incoming
    /// edges, and parallel edges of a limited kind do not exceed the kind's limit.
    pub fn connect_checked(&mut self, edge: Edge, verifier: &mut Verifier) {
        let source = Source::Edge {
            from: edge.from,
            to: edge.to,
        };

        if edge.from.is_return() || edge.from.is_rethrow() {
            verifier.report(
                ErrorKind::InvalidEdge,
                source,
                String::from("return/rethrow blocks cannot have outgoing edges"),
            );
            return;
        }
        if edge.to == Some(self.entry) {
            verifier.report(
                ErrorKind::InvalidEdge,
                source,
                String::from("the entry block cannot have incoming edges"),
            );
            return;
        }
        if let Some(limit) = edge.limit() {
            let same_kind = self
                .out_edges(edge.from)
                .iter()
                .filter(|other| other.same_kind(&edge))
                .count();
            if same_kind >= limit {
                verifier.report(
                    ErrorKind::InvalidEdge,
                    source,
                    format!("block already has {} edge(s) of this kind", same_kind),
                );
                return;
            }
        }
        self.connect(edge);
    }

    /// Remove one edge
    pub fn disconnect(&mut self, edge: &Edge) {
        if let Some(outgoing) = self.forward.get_mut(&edge.from) {
            outgoing.retain(|e| e != edge);
        }
        if let Some(to) = edge.to {
            if let Some(incoming) = self.backward.get_mut(&to) {
                incoming.retain(|e| e != edge);
            }
        }
    }

    /// Resolve an opaque edge in place: same kind and origin, new target
    pub fn resolve_opaque(&mut self, edge: &Edge, to: Label) -> Edge {
        self.disconnect(edge);
        let mut resolved = edge.clone();
        resolved.to = Some(to);
        self.connect(resolved.clone());
        resolved
    }

    // ------------------------------ Builder conveniences ------------------------------ //

    /// Connect `from` to `to` with an explicit jump
    pub fn jump(&mut self, from: Label, to: Label, instruction: Instruction) {
        self.connect(Edge::jump(from, Some(to), instruction));
    }

    /// Connect `from` to `to` with a fallthrough
    pub fn fallthrough(&mut self, from: Label, to: Label) {
        self.connect(Edge::fallthrough(from, to));
    }

    /// Terminate `from` with a return instruction
    pub fn return_from(&mut self, from: Label, instruction: Instruction) {
        self.connect(Edge::terminator(from, Label::RETURN, instruction));
    }

    /// Terminate `from` with `athrow`
    pub fn throw_from(&mut self, from: Label) {
        self.connect(Edge::terminator(from, Label::RETHROW, Instruction::AThrow));
    }

    /// Cover `from` with an exception handler at `handler`
    pub fn catch_from(
        &mut self,
        from: Label,
        handler: Label,
        priority: u16,
        throwable: Option<Constant>,
    ) {
        self.connect(Edge {
            from,
            to: Some(handler),
            kind: EdgeKind::Exception {
                priority,
                throwable,
                inline_coverage: false,
            },
        });
    }
}

impl Default for InsnGraph {
    fn default() -> InsnGraph {
        InsnGraph::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::code::OrdComparison;

    #[test]
    fn connect_and_remove_keep_edge_maps_in_sync() {
        let mut graph = InsnGraph::new();
        let a = graph.entry;
        let b = graph.new_block();
        let c = graph.new_block();

        graph.jump(a, c, Instruction::Goto(None));
        graph.fallthrough(b, c);
        assert_eq!(graph.out_edges(a).len(), 1);
        assert_eq!(graph.in_edges(c).len(), 2);

        graph.remove(b);
        assert_eq!(graph.in_edges(c).len(), 1);
        assert!(graph.block(b).is_none());
    }

    #[test]
    fn duplicate_edges_collapse() {
        let mut graph = InsnGraph::new();
        let a = graph.entry;
        let b = graph.new_block();
        graph.fallthrough(a, b);
        graph.fallthrough(a, b);
        assert_eq!(graph.out_edges(a).len(), 1);
    }

    #[test]
    fn limits_are_enforced_by_checked_connect() {
        let mut graph = InsnGraph::new();
        let a = graph.entry;
        let b = graph.new_block();
        let c = graph.new_block();

        let mut verifier = Verifier::new(false);
        graph.connect_checked(
            Edge::jump(a, Some(b), Instruction::If(OrdComparison::EQ, None)),
            &mut verifier,
        );
        graph.connect_checked(
            Edge::jump(a, Some(c), Instruction::Goto(None)),
            &mut verifier,
        );
        assert_eq!(verifier.errors().len(), 1);
        assert_eq!(verifier.errors()[0].kind, ErrorKind::InvalidEdge);
        assert_eq!(graph.out_edges(a).len(), 1);
    }

    #[test]
    fn singletons_reject_out_edges() {
        let mut graph = InsnGraph::new();
        let b = graph.new_block();
        let mut verifier = Verifier::new(false);
        graph.connect_checked(Edge::fallthrough(Label::RETURN, b), &mut verifier);
        assert_eq!(verifier.errors().len(), 1);
        assert!(graph.out_edges(Label::RETURN).is_empty());
    }

    #[test]
    fn opaque_edges_resolve_in_place() {
        let mut graph = InsnGraph::new();
        let a = graph.entry;
        let b = graph.new_block();
        graph.connect(Edge {
            from: a,
            to: None,
            kind: EdgeKind::Ret {
                instruction: Instruction::Ret(1),
            },
        });
        assert_eq!(graph.opaque_edges().count(), 1);

        let opaque = graph.opaque_edges().next().unwrap().clone();
        graph.resolve_opaque(&opaque, b);
        assert_eq!(graph.opaque_edges().count(), 0);
        assert_eq!(graph.in_edges(b).len(), 1);
    }
}
