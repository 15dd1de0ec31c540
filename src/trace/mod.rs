//! Abstract interpretation over the instruction graph
//!
//! The trace walks every path through a [`InsnGraph`] with a symbolic [`Frame`], recording the
//! `(entry, exit)` states each block is reached with, the locals each block reads and writes,
//! running `max_stack`/`max_locals`, back edges, leaf edges, and the resolution of `jsr`
//! subroutines. The walk is an explicit iterative DFS: deeply nested (or deliberately
//! obfuscated) methods must not be able to overflow the host stack.

mod exec;
mod frame;
mod liveness;

pub use frame::*;
pub use liveness::*;

use crate::class_graph::{CoreClasses, RefType};
use crate::code::Instruction;
use crate::descriptors::MethodDescriptor;
use crate::graph::{Edge, EdgeKind, InsnGraph, Label};
use crate::verifier::{ErrorKind, Source, TypeChecker, VerificationType, Verifier};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Everything an instruction's transfer function can see
pub struct TraceContext<'g, 'a> {
    pub checker: &'a TypeChecker<'g>,
    pub core: &'a CoreClasses<'g>,
    pub verifier: &'a mut Verifier,

    /// Provenance attached to entries and errors produced right now
    pub source: Source,

    /// The class that `UninitializedThis` initializes to, when analysing a constructor
    pub this_class: Option<RefType<'g>>,
}

/// The method whose body is being analysed
pub struct MethodContext<'g> {
    pub class: RefType<'g>,
    pub name: String,
    pub descriptor: MethodDescriptor,
    pub is_static: bool,
}

impl<'g> MethodContext<'g> {
    pub fn is_constructor(&self) -> bool {
        self.name == "<init>" && self.descriptor.return_type.is_none()
    }

    /// The frame a method starts with: receiver at local 0, then parameters by category
    pub fn initial_frame(&self, checker: &TypeChecker<'g>) -> Frame<'g> {
        let mut frame = Frame::new();
        let mut index: u16 = 0;

        if !self.is_static {
            let ty = if self.is_constructor() {
                VerificationType::UninitializedThis
            } else {
                VerificationType::Reference(self.class)
            };
            let receiver = frame.entry(ty, Source::Parameter(0));
            frame.locals.insert(0, receiver);
            index = 1;
        }

        for parameter in &self.descriptor.parameters {
            let ty = VerificationType::of_field_type(parameter, checker.graph);
            let entry = frame.entry(ty, Source::Parameter(index));
            let wide = ty.is_wide();
            frame.locals.insert(index, entry);
            index += 1;
            if wide {
                let sentinel = frame.entry(VerificationType::Top, Source::Parameter(index));
                frame.locals.insert(index, sentinel);
                index += 1;
            }
        }

        frame.max_locals = index as usize;
        frame
    }
}

/// A resolved `jsr`/`ret` pairing
#[derive(Clone, Debug)]
pub struct Subroutine {
    /// The `jsr` edge that enters the subroutine
    pub jsr_edge: Edge,

    /// The `ret` edge, with its target rewritten to the `jsr`'s fallthrough target
    pub ret_edge: Edge,

    /// The block the `ret` lives in
    pub exit_block: Label,
}

/// Everything the abstract interpretation learned about one method body
pub struct Trace<'g> {
    /// Entry frames recorded per block, one per distinct path shape
    pub entries: BTreeMap<Label, Vec<Frame<'g>>>,

    /// Exit frames recorded per block
    pub exits: BTreeMap<Label, Vec<Frame<'g>>>,

    /// Frozen `(entry, exit)` pairs, the memoization constraints
    pub constraints: BTreeMap<Label, Vec<(FrozenFrame<'g>, FrozenFrame<'g>)>>,

    pub max_stack: usize,
    pub max_locals: usize,

    /// Edges that closed a cycle during the walk
    pub back_edges: Vec<Edge>,

    /// Edges into the return/rethrow singletons
    pub leaf_edges: Vec<Edge>,

    pub subroutines: Vec<Subroutine>,

    /// Locals read before being overwritten, per block
    pub uses: BTreeMap<Label, BTreeSet<u16>>,

    /// Locals written, per block
    pub defs: BTreeMap<Label, BTreeSet<u16>>,

    /// Post-instruction snapshots, recorded only in exact mode
    pub exact_states: BTreeMap<(Label, usize), FrozenFrame<'g>>,

    /// Per-instruction deltas, recorded only in exact mode
    pub deltas: BTreeMap<(Label, usize), FrameDelta<'g>>,
}

impl<'g> Trace<'g> {
    /// Was this block reached by any path?
    pub fn reached(&self, label: Label) -> bool {
        self.entries.contains_key(&label)
    }

    /// Run the abstract interpretation
    pub fn run(
        graph: &InsnGraph,
        method: &MethodContext<'g>,
        checker: &TypeChecker<'g>,
        core: &CoreClasses<'g>,
        exact: bool,
        verifier: &mut Verifier,
    ) -> Trace<'g> {
        log::debug!("computing trace information for {}", method.name);

        let mut trace = Trace {
            entries: BTreeMap::new(),
            exits: BTreeMap::new(),
            constraints: BTreeMap::new(),
            max_stack: 0,
            max_locals: 0,
            back_edges: vec![],
            leaf_edges: vec![],
            subroutines: vec![],
            uses: BTreeMap::new(),
            defs: BTreeMap::new(),
            exact_states: BTreeMap::new(),
            deltas: BTreeMap::new(),
        };

        let mut cx = TraceContext {
            checker,
            core,
            verifier,
            source: Source::None,
            this_class: if method.is_constructor() {
                Some(method.class)
            } else {
                None
            },
        };

        let initial = method.initial_frame(checker);
        trace.max_locals = initial.max_locals;

        // Explicit DFS: each stack item is a visited block plus the successor work left for it.
        // The stack contents double as the current traversal path (for back-edge detection).
        struct DfsItem<'g> {
            block: Label,
            out: VecDeque<(Edge, Frame<'g>)>,
        }

        let mut dfs: Vec<DfsItem<'g>> = vec![];
        let mut on_path: HashMap<Label, usize> = HashMap::new();

        if let Some(out) = trace.visit(graph, None, initial, exact, &mut cx) {
            *on_path.entry(graph.entry).or_insert(0) += 1;
            dfs.push(DfsItem {
                block: graph.entry,
                out,
            });
        }

        while let Some(top) = dfs.last_mut() {
            let (edge, frame) = match top.out.pop_front() {
                Some(next) => next,
                None => {
                    let finished = dfs.pop().expect("non-empty dfs stack");
                    if let Some(count) = on_path.get_mut(&finished.block) {
                        *count -= 1;
                        if *count == 0 {
                            on_path.remove(&finished.block);
                        }
                    }
                    continue;
                }
            };

            let target = match trace.resolve_target(graph, &edge, &frame, &mut cx) {
                Some(target) => target,
                None => continue,
            };

            if target.is_return() || target.is_rethrow() {
                trace.record_leaf(target, &edge, frame);
                continue;
            }

            // Revisiting a block already on the traversal path closes a cycle
            if on_path.contains_key(&target) && !trace.back_edges.contains(&edge) {
                trace.back_edges.push(edge.clone());
            }

            if let Some(matched) = trace.find_constraint(target, &frame) {
                trace.merge_constraint(target, matched, &frame);
                continue;
            }

            let mut edge = edge;
            edge.to = Some(target);
            if let Some(out) = trace.visit(graph, Some(&edge), frame, exact, &mut cx) {
                *on_path.entry(target).or_insert(0) += 1;
                dfs.push(DfsItem { block: target, out });
            }
        }

        // Anything still opaque was never resolved by any traversed path
        for edge in graph.opaque_edges() {
            let resolved = trace
                .subroutines
                .iter()
                .any(|subroutine| subroutine.ret_edge.from == edge.from);
            if !resolved {
                cx.verifier.report(
                    ErrorKind::InvalidBlock,
                    Source::Edge {
                        from: edge.from,
                        to: None,
                    },
                    String::from("ret edge was never resolved to a subroutine"),
                );
            }
        }

        log::debug!(
            "trace done: {} block(s) reached, max_stack {}, max_locals {}",
            trace.entries.len(),
            trace.max_stack,
            trace.max_locals
        );

        trace
    }

    /// Decide where an edge actually goes, resolving opaque `ret` edges along the way
    fn resolve_target(
        &mut self,
        graph: &InsnGraph,
        edge: &Edge,
        frame: &Frame<'g>,
        cx: &mut TraceContext<'g, '_>,
    ) -> Option<Label> {
        if let EdgeKind::Ret { instruction } = &edge.kind {
            let index = match instruction {
                Instruction::Ret(index) => *index,
                _ => 0,
            };

            let return_address = frame
                .locals
                .get(&index)
                .and_then(|entry| match entry.ty {
                    VerificationType::ReturnAddress(source) => Some(source),
                    _ => None,
                });

            let jsr_block = match return_address {
                Some(Source::Instruction { block, .. }) => Some(block),
                Some(Source::Edge { from, .. }) => Some(from),
                _ => None,
            };

            if let Some(jsr_block) = jsr_block {
                let jsr_jump = graph
                    .out_edges(jsr_block)
                    .iter()
                    .find(|out| matches!(out.kind, EdgeKind::JsrJump { .. }))
                    .cloned();
                let jsr_fallthrough = graph
                    .out_edges(jsr_block)
                    .iter()
                    .find(|out| matches!(out.kind, EdgeKind::JsrFallthrough { .. }))
                    .cloned();

                match (jsr_jump, jsr_fallthrough.and_then(|e| e.to)) {
                    (Some(jsr_edge), Some(return_to)) => {
                        let mut resolved = edge.clone();
                        resolved.to = Some(return_to);
                        self.subroutines.push(Subroutine {
                            jsr_edge,
                            ret_edge: resolved,
                            exit_block: edge.from,
                        });
                        return Some(return_to);
                    }
                    _ => {
                        // No jsr pair on the origin: degrade to an absolute jump if the
                        // operator supplied a target, otherwise the path dead-ends here
                        cx.verifier.report(
                            ErrorKind::InvalidBlock,
                            Source::Edge {
                                from: edge.from,
                                to: edge.to,
                            },
                            format!("no jsr jump on block {} for subroutine return", jsr_block),
                        );
                        return edge.to;
                    }
                }
            }

            cx.verifier.report(
                ErrorKind::InvalidBlock,
                Source::Edge {
                    from: edge.from,
                    to: edge.to,
                },
                format!("local {} does not hold a return address", index),
            );
            return edge.to;
        }

        edge.to
    }

    /// Already seen this block with a state that agrees on the stack and the relevant locals?
    ///
    /// Returns the index of the matching constraint so the caller can fold the new path's
    /// entries into it.
    fn find_constraint(&self, block: Label, frame: &Frame<'g>) -> Option<usize> {
        let constraints = self.constraints.get(&block)?;

        // The locals that matter: whatever the block reads before overwriting, plus whatever
        // the incoming frame still carries
        let mut relevant: Vec<u16> = frame.locals.keys().copied().collect();
        if let Some(uses) = self.uses.get(&block) {
            for index in uses {
                if !relevant.contains(index) {
                    relevant.push(*index);
                }
            }
        }

        let frozen = frame.freeze();
        constraints
            .iter()
            .position(|(entry, _)| entry.matches(&frozen, &relevant))
    }

    /// A repeat visit matched an existing constraint: record the join on its entries
    fn merge_constraint(&mut self, block: Label, index: usize, frame: &Frame<'g>) {
        if let Some(recorded) = self
            .entries
            .get_mut(&block)
            .and_then(|frames| frames.get_mut(index))
        {
            recorded.merge(frame);
        }
    }

    fn record_leaf(&mut self, singleton: Label, edge: &Edge, frame: Frame<'g>) {
        if !self.leaf_edges.contains(edge) {
            self.leaf_edges.push(edge.clone());
        }
        let frozen = frame.freeze();
        self.entries.entry(singleton).or_default().push(frame);
        self.constraints
            .entry(singleton)
            .or_default()
            .push((frozen.clone(), frozen));
    }

    /// Trace one block: run its instructions and terminator, record states, queue successors
    fn visit(
        &mut self,
        graph: &InsnGraph,
        edge_in: Option<&Edge>,
        frame: Frame<'g>,
        exact: bool,
        cx: &mut TraceContext<'g, '_>,
    ) -> Option<VecDeque<(Edge, Frame<'g>)>> {
        let block_label = match edge_in {
            Some(edge) => edge.to.expect("resolved edge"),
            None => graph.entry,
        };
        let block = graph.block(block_label)?;

        let entry_frozen = frame.freeze();
        let mut working = frame.copy(false);
        self.entries
            .entry(block_label)
            .or_default()
            .push(frame.copy(true));

        for (index, instruction) in block.instructions.iter().enumerate() {
            cx.source = Source::Instruction {
                block: block_label,
                index,
            };
            if exact {
                working.start(cx.source);
            }
            instruction.trace(&mut working, cx);
            if exact {
                if let Some(delta) = working.finish() {
                    self.deltas.insert((block_label, index), delta);
                }
                self.exact_states
                    .insert((block_label, index), working.freeze());
            }
        }

        // The terminator runs once, shared by every out edge it creates
        if let Some(terminator) = terminator_of(graph, block_label) {
            cx.source = Source::Instruction {
                block: block_label,
                index: block.instructions.len(),
            };
            terminator.trace(&mut working, cx);
        }

        // Locals read before overwrite, and locals defined, for this visit
        let uses = self.uses.entry(block_label).or_default();
        let defs = self.defs.entry(block_label).or_default();
        let mut defined: BTreeSet<u16> = BTreeSet::new();
        for access in &working.accesses {
            if access.read {
                if !defined.contains(&access.index) {
                    uses.insert(access.index);
                }
            } else {
                defined.insert(access.index);
                defs.insert(access.index);
            }
        }

        if working.max_stack > self.max_stack {
            self.max_stack = working.max_stack;
        }
        if working.max_locals > self.max_locals {
            self.max_locals = working.max_locals;
        }

        self.constraints
            .entry(block_label)
            .or_default()
            .push((entry_frozen, working.freeze()));

        let mut successors = VecDeque::new();
        for out in graph.out_edges(block_label) {
            match &out.kind {
                // Only entered when a subroutine returns; the matching ret edge brings us back
                EdgeKind::JsrFallthrough { .. } => continue,

                EdgeKind::Exception {
                    throwable, ..
                } => {
                    let mut handler = working.copy(false);
                    handler.stack.clear();

                    let source = Source::Edge {
                        from: out.from,
                        to: out.to,
                    };
                    let thrown = match throwable {
                        Some(constant) => match constant.class_name() {
                            Some(name) => {
                                let class = cx.checker.graph.get_or_insert(name);
                                if !class.assumed
                                    && !cx.checker.graph.is_assignable(class, cx.core.throwable)
                                {
                                    cx.verifier.report(
                                        ErrorKind::InvalidType,
                                        source,
                                        format!(
                                            "caught class {} is not a java/lang/Throwable",
                                            name
                                        ),
                                    );
                                }
                                VerificationType::Reference(RefType::Object(class))
                            }
                            None => {
                                cx.verifier.report(
                                    ErrorKind::InvalidType,
                                    source,
                                    format!("unusable catch type {:?}", constant),
                                );
                                VerificationType::Reference(RefType::Object(cx.core.throwable))
                            }
                        },
                        None => VerificationType::Reference(RefType::Object(cx.core.throwable)),
                    };
                    handler.push_type(thrown, source);
                    successors.push_back((out.clone(), handler));
                }

                _ => {
                    successors.push_back((out.clone(), working.copy(false)));
                }
            }
        }

        self.exits.entry(block_label).or_default().push(working);

        Some(successors)
    }
}

/// The instruction that terminates a block, taken from its out edges
fn terminator_of<'a>(graph: &'a InsnGraph, block: Label) -> Option<&'a Instruction> {
    let mut fallthrough_terminator = None;
    let mut switch = None;
    let mut ret = None;

    for edge in graph.out_edges(block) {
        match &edge.kind {
            EdgeKind::Jump { instruction } | EdgeKind::JsrJump { instruction } => {
                return Some(instruction)
            }
            EdgeKind::Switch { instruction, .. } => switch = Some(instruction),
            EdgeKind::Ret { instruction } => ret = Some(instruction),
            EdgeKind::Fallthrough {
                instruction: Some(instruction),
            } => fallthrough_terminator = Some(instruction),
            _ => {}
        }
    }

    switch.or(fallthrough_terminator).or(ret)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::class_graph::{ClassGraph, ClassGraphArenas};
    use crate::classfile::Constant;
    use crate::code::OrdComparison;
    use crate::descriptors::Descriptor;
    use crate::graph::Block;

    fn method<'g>(
        class: RefType<'g>,
        name: &str,
        descriptor: &str,
        is_static: bool,
    ) -> MethodContext<'g> {
        MethodContext {
            class,
            name: String::from(name),
            descriptor: MethodDescriptor::parse(descriptor).unwrap(),
            is_static,
        }
    }

    #[test]
    fn exact_mode_records_deltas_and_snapshots() {
        let arenas = ClassGraphArenas::new();
        let class_graph = ClassGraph::new(&arenas);
        let core = class_graph.insert_core_classes();
        let checker = TypeChecker::new(&class_graph);

        let mut graph = InsnGraph::new();
        let entry = graph.entry;
        graph.block_mut(entry).unwrap().instructions = vec![
            Instruction::ILoad(0),
            Instruction::ILoad(1),
            Instruction::IAdd,
        ];
        graph.return_from(entry, Instruction::IReturn);

        let mut verifier = Verifier::new(true);
        let context = method(RefType::Object(core.object), "add", "(II)I", true);
        let trace = Trace::run(&graph, &context, &checker, &core, true, &mut verifier);

        assert!(verifier.errors().is_empty());
        assert_eq!(trace.deltas.len(), 3);
        assert_eq!(trace.exact_states.len(), 3);

        // After iload_0 the stack holds one int; after iadd, one again
        assert_eq!(trace.exact_states[&(entry, 0)].stack.len(), 1);
        assert_eq!(trace.exact_states[&(entry, 1)].stack.len(), 2);
        assert_eq!(trace.exact_states[&(entry, 2)].stack.len(), 1);

        let load = &trace.deltas[&(entry, 0)];
        assert!(load.pops.is_empty());
        assert_eq!(load.pushes.len(), 1);
    }

    #[test]
    fn constructor_receiver_initializes_on_init_call() {
        let arenas = ClassGraphArenas::new();
        let class_graph = ClassGraph::new(&arenas);
        let core = class_graph.insert_core_classes();
        let checker = TypeChecker::new(&class_graph);

        // aload_0; invokespecial Object.<init>; return
        let mut graph = InsnGraph::new();
        let entry = graph.entry;
        graph.block_mut(entry).unwrap().instructions = vec![
            Instruction::ALoad(0),
            Instruction::Invoke(
                crate::code::InvokeType::Special,
                Constant::MethodRef {
                    class: Box::new(Constant::class("java/lang/Object")),
                    name_and_type: Box::new(Constant::name_and_type("<init>", "()V")),
                },
            ),
        ];
        graph.return_from(entry, Instruction::Return);

        let mut verifier = Verifier::new(true);
        let context = method(RefType::Object(core.object), "<init>", "()V", false);
        let trace = Trace::run(&graph, &context, &checker, &core, false, &mut verifier);

        assert!(verifier.errors().is_empty());

        // The receiver starts uninitialized and leaves the block as a real object
        let entry_frame = &trace.entries[&entry][0];
        assert_eq!(
            entry_frame.locals[&0].ty,
            VerificationType::UninitializedThis
        );
        let exit_frame = &trace.exits[&entry][0];
        assert_eq!(
            exit_frame.locals[&0].ty,
            VerificationType::Reference(RefType::Object(core.object))
        );
    }

    #[test]
    fn loops_close_with_back_edges_and_memoize() {
        let arenas = ClassGraphArenas::new();
        let class_graph = ClassGraph::new(&arenas);
        let core = class_graph.insert_core_classes();
        let checker = TypeChecker::new(&class_graph);

        // entry -> loop; loop: iload_0 ifne loop | fallthrough exit; exit: return
        let mut graph = InsnGraph::new();
        let entry = graph.entry;
        let looping = graph.block_of(vec![Instruction::ILoad(0)]);
        let exit = graph.add(Block::new(Label(9)));

        graph.fallthrough(entry, looping);
        graph.jump(
            looping,
            looping,
            Instruction::If(OrdComparison::NE, None),
        );
        graph.fallthrough(looping, exit);
        graph.return_from(exit, Instruction::Return);

        let mut verifier = Verifier::new(true);
        let context = method(RefType::Object(core.object), "spin", "(I)V", true);
        let trace = Trace::run(&graph, &context, &checker, &core, false, &mut verifier);

        assert!(verifier.errors().is_empty());
        assert_eq!(trace.back_edges.len(), 1);
        assert_eq!(trace.back_edges[0].to, Some(looping));

        // The revisit matched the recorded constraint instead of re-tracing
        assert_eq!(trace.entries[&looping].len(), 1);
        assert!(trace.reached(exit));
        assert_eq!(trace.max_stack, 1);
    }

    #[test]
    fn subroutines_resolve_through_return_addresses() {
        let arenas = ClassGraphArenas::new();
        let class_graph = ClassGraph::new(&arenas);
        let core = class_graph.insert_core_classes();
        let checker = TypeChecker::new(&class_graph);

        // entry: jsr sub, fallthrough home (inline); home: return
        // sub: astore_1; ret 1
        let mut graph = InsnGraph::new();
        let entry = graph.entry;
        let home = graph.new_block();
        let sub = graph.block_of(vec![Instruction::AStore(1)]);
        graph.block_mut(home).unwrap().inline = true;

        graph.connect(Edge {
            from: entry,
            to: Some(sub),
            kind: EdgeKind::JsrJump {
                instruction: Instruction::Jsr(None),
            },
        });
        graph.connect(Edge {
            from: entry,
            to: Some(home),
            kind: EdgeKind::JsrFallthrough {
                instruction: Instruction::Jsr(None),
            },
        });
        graph.connect(Edge {
            from: sub,
            to: None,
            kind: EdgeKind::Ret {
                instruction: Instruction::Ret(1),
            },
        });
        graph.return_from(home, Instruction::Return);

        let mut verifier = Verifier::new(true);
        let context = method(RefType::Object(core.object), "go", "()V", true);
        let trace = Trace::run(&graph, &context, &checker, &core, false, &mut verifier);

        assert!(verifier.errors().is_empty(), "{:?}", verifier.errors());
        assert_eq!(trace.subroutines.len(), 1);
        let subroutine = &trace.subroutines[0];
        assert_eq!(subroutine.exit_block, sub);
        assert_eq!(subroutine.ret_edge.to, Some(home));
        assert!(trace.reached(home));
    }
}
