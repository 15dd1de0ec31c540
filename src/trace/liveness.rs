use super::Trace;
use crate::graph::{EdgeKind, InsnGraph, Label};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Which locals are live at each block boundary
///
/// Live-in is "read before overwritten on some path from here"; live-out is the union of the
/// successors' live-ins. Exception successors are special: the exception may fire anywhere in
/// the covered block, so none of the block's own definitions can be assumed and the handler's
/// live-in propagates into the block's live-in wholesale.
pub struct Liveness {
    pub entries: BTreeMap<Label, BTreeSet<u16>>,
    pub exits: BTreeMap<Label, BTreeSet<u16>>,
}

impl Liveness {
    /// Backward dataflow over the traced graph
    pub fn from_trace(trace: &Trace, graph: &InsnGraph) -> Liveness {
        let mut entries: BTreeMap<Label, BTreeSet<u16>> = BTreeMap::new();
        let mut exits: BTreeMap<Label, BTreeSet<u16>> = BTreeMap::new();

        // The singletons cannot access locals
        entries.insert(Label::RETURN, BTreeSet::new());
        entries.insert(Label::RETHROW, BTreeSet::new());

        // Seed with every edge: this covers leaf edges, cyclic regions that never reach a
        // return (infinite loops), and resolved subroutine returns alike
        let mut worklist: VecDeque<(Label, Option<Label>)> = graph
            .edges()
            .map(|edge| (edge.from, edge.to))
            .collect();
        for subroutine in &trace.subroutines {
            worklist.push_back((subroutine.ret_edge.from, subroutine.ret_edge.to));
        }

        let empty = BTreeSet::new();
        while let Some((from, to)) = worklist.pop_front() {
            let to = match to {
                Some(to) => to,
                None => continue, // opaque edge that never resolved
            };

            let successor_in = entries.get(&to).unwrap_or(&empty).clone();

            let old_out = exits.get(&from).cloned().unwrap_or_default();
            let old_in = entries.get(&from).cloned().unwrap_or_default();

            let mut new_out = old_out.clone();
            new_out.extend(successor_in.iter().copied());

            let mut new_in = old_in.clone();
            if let Some(uses) = trace.uses.get(&from) {
                new_in.extend(uses.iter().copied());
            }

            let is_exception = graph.out_edges(from).iter().any(|edge| {
                edge.to == Some(to) && matches!(edge.kind, EdgeKind::Exception { .. })
            });
            if is_exception {
                // The throw can happen before any of this block's definitions
                new_in.extend(successor_in.iter().copied());
            } else {
                let defs = trace.defs.get(&from);
                for index in &new_out {
                    let defined = defs.map(|defs| defs.contains(index)).unwrap_or(false);
                    if !defined {
                        new_in.insert(*index);
                    }
                }
            }

            let out_changed = new_out != old_out;
            let in_changed = new_in != old_in;

            if out_changed {
                exits.insert(from, new_out);
            }
            if in_changed {
                entries.insert(from, new_in);
            }

            if out_changed || in_changed {
                for edge in graph.in_edges(from) {
                    worklist.push_back((edge.from, Some(from)));
                }
                for subroutine in &trace.subroutines {
                    if subroutine.ret_edge.to == Some(from) {
                        worklist.push_back((subroutine.ret_edge.from, Some(from)));
                    }
                }
            }
        }

        Liveness { entries, exits }
    }

    /// Live locals at a block's entry
    pub fn live_in(&self, block: Label) -> &BTreeSet<u16> {
        static EMPTY: BTreeSet<u16> = BTreeSet::new();
        self.entries.get(&block).unwrap_or(&EMPTY)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::class_graph::{ClassGraph, ClassGraphArenas, RefType};
    use crate::code::{Instruction, OrdComparison};
    use crate::descriptors::{Descriptor, MethodDescriptor};
    use crate::graph::{Edge, InsnGraph};
    use crate::trace::MethodContext;
    use crate::verifier::{TypeChecker, Verifier};

    #[test]
    fn loop_counter_stays_live_around_the_cycle() {
        // entry: iconst_0 istore_1 -> loop
        // loop:  iinc 1 1, iload_1 ifeq loop | fallthrough exit
        // exit:  return
        let mut graph = InsnGraph::new();
        let entry = graph.entry;
        graph.block_mut(entry).unwrap().instructions =
            vec![Instruction::IConst0, Instruction::IStore(1)];

        let looping = graph.block_of(vec![Instruction::IInc(1, 1), Instruction::ILoad(1)]);
        let exit = graph.block_of(vec![]);

        graph.fallthrough(entry, looping);
        graph.jump(
            looping,
            looping,
            Instruction::If(OrdComparison::EQ, None),
        );
        graph.fallthrough(looping, exit);
        graph.return_from(exit, Instruction::Return);

        let arenas = ClassGraphArenas::new();
        let class_graph = ClassGraph::new(&arenas);
        let core = class_graph.insert_core_classes();
        let checker = TypeChecker::new(&class_graph);
        let mut verifier = Verifier::new(false);

        let method = MethodContext {
            class: RefType::Object(core.object),
            name: String::from("spin"),
            descriptor: MethodDescriptor::parse("()V").unwrap(),
            is_static: true,
        };

        let trace = Trace::run(&graph, &method, &checker, &core, false, &mut verifier);
        assert!(verifier.errors().is_empty());

        let liveness = Liveness::from_trace(&trace, &graph);
        assert!(liveness.live_in(looping).contains(&1));
        assert!(!liveness.live_in(entry).contains(&1));
        assert!(!liveness.live_in(exit).contains(&1));
    }
}
