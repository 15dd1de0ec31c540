use super::{Block, Edge, EdgeKind, InsnGraph, Label};
use crate::classfile::{CodeAttribute, ConstantPool, Error};
use crate::code::Instruction;
use std::collections::{BTreeMap, HashMap, HashSet};

/// A forward jump whose target offset has not been split into a block yet
///
/// `edge` already carries the operand-cleared instruction; `raw` keeps the original so that a
/// jump which never binds (obfuscated input pointing outside the method) can be preserved
/// byte-for-byte.
struct PendingJump {
    edge: Edge,
    raw: Instruction,
}

impl InsnGraph {
    /// Disassemble a `Code` attribute into a control-flow graph
    pub fn disassemble(
        code: &CodeAttribute,
        pool: &ConstantPool,
    ) -> Result<InsnGraph, Error> {
        let instructions = code.instructions(pool)?;

        let (jump_targets, handler_targets, exception_bounds) =
            find_targets_and_bounds(&instructions, code);
        let mut graph = InsnGraph::new();
        create_blocks_and_edges(
            &mut graph,
            code,
            pool,
            &instructions,
            &jump_targets,
            &handler_targets,
            &exception_bounds,
        );
        Ok(graph)
    }
}

/// Finds jump targets, exception handler targets and exception bounds
fn find_targets_and_bounds(
    instructions: &BTreeMap<usize, Instruction>,
    code: &CodeAttribute,
) -> (HashSet<i64>, HashSet<i64>, HashSet<i64>) {
    let mut jump_targets: HashSet<i64> = HashSet::new();
    let mut handler_targets: HashSet<i64> = HashSet::new();
    let mut exception_bounds: HashSet<i64> = HashSet::new();

    for (&offset, instruction) in instructions {
        let offset = offset as i64;
        if let Some(delta) = instruction.jump_offset() {
            jump_targets.insert(offset + delta as i64);
        }
        match instruction {
            Instruction::TableSwitch {
                default, offsets, ..
            } => {
                if let Some(delta) = default {
                    jump_targets.insert(offset + *delta as i64);
                }
                for delta in offsets.iter().flatten() {
                    jump_targets.insert(offset + *delta as i64);
                }
            }
            Instruction::LookupSwitch { default, pairs } => {
                if let Some(delta) = default {
                    jump_targets.insert(offset + *delta as i64);
                }
                for (_, delta) in pairs {
                    if let Some(delta) = delta {
                        jump_targets.insert(offset + *delta as i64);
                    }
                }
            }
            _ => {}
        }
    }

    for handler in &code.exception_table {
        handler_targets.insert(handler.handler_pc as i64);
        exception_bounds.insert(handler.start_pc as i64);
        exception_bounds.insert(handler.end_pc as i64);
    }

    (jump_targets, handler_targets, exception_bounds)
}

/// Creates basic blocks and the edges between them
fn create_blocks_and_edges(
    graph: &mut InsnGraph,
    code: &CodeAttribute,
    pool: &ConstantPool,
    instructions: &BTreeMap<usize, Instruction>,
    jump_targets: &HashSet<i64>,
    handler_targets: &HashSet<i64>,
    exception_bounds: &HashSet<i64>,
) {
    let mut starting: BTreeMap<usize, Label> = BTreeMap::new();
    let mut forward_jumps: HashMap<i64, Vec<PendingJump>> = HashMap::new();

    let mut block = graph.entry;
    let mut is_new_block = false;

    for (&offset, instruction) in instructions {
        let at = offset as i64;
        let is_forward_target = forward_jumps.contains_key(&at);

        // Is this offset entered from somewhere other than straight-line flow?
        if !is_new_block
            && (is_forward_target
                || jump_targets.contains(&at)
                || exception_bounds.contains(&at)
                || handler_targets.contains(&at))
        {
            // If the current block has instructions, we need to start a new one
            let current_has_instructions = graph
                .block(block)
                .map(|b| !b.instructions.is_empty())
                .unwrap_or(false);
            if current_has_instructions || block == graph.entry {
                let previous = block;
                block = graph.new_block();
                is_new_block = true;
                graph.fallthrough(previous, block);
            }
        }

        if is_new_block {
            is_new_block = false;
            starting.insert(offset, block);

            // Bind any earlier jumps that were waiting for this offset
            if let Some(pendings) = forward_jumps.remove(&at) {
                for pending in pendings {
                    let mut edge = pending.edge;
                    edge.to = Some(block);
                    graph.connect(edge);
                }
            }
        }

        let instruction = instruction.clone();

        if instruction.is_jump() {
            let is_jsr = instruction.is_jsr();

            if let Instruction::Ret(_) = instruction {
                graph.connect(Edge {
                    from: block,
                    to: None,
                    kind: EdgeKind::Ret { instruction },
                });
                block = graph.new_block();
                is_new_block = true;
            } else if !is_jsr {
                let target = at + instruction.jump_offset().unwrap_or(0) as i64;
                let mut cleared = instruction.clone();
                cleared.set_jump_offset(None);
                let edge = Edge {
                    from: block,
                    to: None,
                    kind: EdgeKind::Jump {
                        instruction: cleared,
                    },
                };
                bind_or_queue(graph, &starting, &mut forward_jumps, target, edge, &instruction);

                let previous = block;
                block = graph.new_block();
                is_new_block = true;
                if instruction.is_conditional() {
                    graph.fallthrough(previous, block);
                }
            } else {
                let target = at + instruction.jump_offset().unwrap_or(0) as i64;
                let mut cleared = instruction.clone();
                cleared.set_jump_offset(None);

                let previous = block;
                block = graph.new_block();
                is_new_block = true;

                let edge = Edge {
                    from: previous,
                    to: None,
                    kind: EdgeKind::JsrJump {
                        instruction: cleared.clone(),
                    },
                };
                bind_or_queue(graph, &starting, &mut forward_jumps, target, edge, &instruction);

                // The fallthrough target must be inlinable no matter what: the subroutine's
                // `ret` comes back here, potentially from several call sites
                if let Some(new_block) = graph.block_mut(block) {
                    new_block.inline = true;
                }
                graph.connect(Edge {
                    from: previous,
                    to: Some(block),
                    kind: EdgeKind::JsrFallthrough {
                        instruction: cleared,
                    },
                });
            }
        } else if instruction.is_switch() {
            let cleared = clear_switch(&instruction);
            let cases = switch_cases(&instruction);
            for (value, delta) in cases {
                let edge = Edge {
                    from: block,
                    to: None,
                    kind: EdgeKind::Switch {
                        instruction: cleared.clone(),
                        value,
                    },
                };
                match delta {
                    Some(delta) => {
                        let target = at + delta as i64;
                        bind_or_queue(
                            graph,
                            &starting,
                            &mut forward_jumps,
                            target,
                            edge,
                            &instruction,
                        );
                    }
                    // An already-absent operand cannot be bound; drop the case
                    None => {}
                }
            }
            block = graph.new_block();
            is_new_block = true;
        } else if instruction.is_return() {
            graph.return_from(block, instruction);
            block = graph.new_block();
            is_new_block = true;
        } else if instruction == Instruction::AThrow {
            graph.throw_from(block);
            block = graph.new_block();
            is_new_block = true;
        } else {
            // Otherwise, we can add the instruction to the block
            if let Some(current) = graph.block_mut(block) {
                current.instructions.push(instruction);
            }
        }
    }

    // Jumps whose target offsets never became blocks (eg. a goto pointing past the end of the
    // code). The raw instruction is kept in its block, followed by a synthetic fallthrough to
    // the numerically-next block: the code is invalid as it stands, so what matters is
    // faithfully preserving the original instruction order.
    if !forward_jumps.is_empty() {
        let mut unbound = 0;
        let mut pendings: Vec<PendingJump> = forward_jumps
            .into_iter()
            .flat_map(|(_, pendings)| pendings)
            .collect();
        pendings.sort_by_key(|pending| pending.edge.from);

        for pending in pendings {
            let from = pending.edge.from;
            if let Some(from_block) = graph.block_mut(from) {
                if from_block.instructions.last() != Some(&pending.raw) {
                    from_block.instructions.push(pending.raw.clone());
                }
            }

            let next = Label(from.0 + 1);
            if graph.contains(next) {
                // A conditional jump already has this fallthrough; connect dedups it
                graph.fallthrough(from, next);
            }
            unbound += 1;
        }
        log::debug!(" - {} unbound forward jump(s)!", unbound);
    }

    // Remove the final block if it is empty and has no out edges. There are cases where the
    // final instruction in a method does not break control flow, and we only want to drop the
    // trailing block when nothing refers out of it.
    let trailing_empty = block != graph.entry
        && graph.block(block).map(Block::is_empty).unwrap_or(false)
        && graph.out_edges(block).is_empty();
    if trailing_empty {
        graph.remove(block);
    }

    // Exception edges from the table: every block whose starting offset lies in a handler's
    // range gets an edge to the handler, prioritised by table position
    for (&start, &covered) in &starting {
        for (index, handler) in code.exception_table.iter().enumerate() {
            if (handler.start_pc as usize) <= start && start < handler.end_pc as usize {
                if let Some(&target) = starting.get(&(handler.handler_pc as usize)) {
                    // The original range covered these bytes contiguously, so any inlined
                    // copy spliced after a covered block keeps its protection
                    graph.connect(Edge {
                        from: covered,
                        to: Some(target),
                        kind: EdgeKind::Exception {
                            priority: index as u16,
                            throwable: code.catch_type(handler, pool),
                            inline_coverage: true,
                        },
                    });
                }
            }
        }
    }
}

fn bind_or_queue(
    graph: &mut InsnGraph,
    starting: &BTreeMap<usize, Label>,
    forward_jumps: &mut HashMap<i64, Vec<PendingJump>>,
    target: i64,
    edge: Edge,
    raw: &Instruction,
) {
    let bound = if target >= 0 {
        starting.get(&(target as usize)).copied()
    } else {
        None
    };
    match bound {
        Some(to) => {
            let mut edge = edge;
            edge.to = Some(to);
            graph.connect(edge);
        }
        None => {
            forward_jumps.entry(target).or_default().push(PendingJump {
                edge,
                raw: raw.clone(),
            });
        }
    }
}

/// The `(value, relative offset)` list of a switch: each case by key, then the default as `None`
fn switch_cases(instruction: &Instruction) -> Vec<(Option<i32>, Option<i32>)> {
    match instruction {
        Instruction::TableSwitch {
            default,
            low,
            offsets,
        } => {
            let mut cases: Vec<(Option<i32>, Option<i32>)> = vec![(None, *default)];
            for (index, delta) in offsets.iter().enumerate() {
                cases.push((Some(low + index as i32), *delta));
            }
            cases
        }
        Instruction::LookupSwitch { default, pairs } => {
            let mut cases: Vec<(Option<i32>, Option<i32>)> = vec![(None, *default)];
            for (key, delta) in pairs {
                cases.push((Some(*key), *delta));
            }
            cases
        }
        _ => vec![],
    }
}

/// A copy of a switch with every target operand cleared (the edges own the targets now)
fn clear_switch(instruction: &Instruction) -> Instruction {
    match instruction {
        Instruction::TableSwitch { low, offsets, .. } => Instruction::TableSwitch {
            default: None,
            low: *low,
            offsets: offsets.iter().map(|_| None).collect(),
        },
        Instruction::LookupSwitch { pairs, .. } => Instruction::LookupSwitch {
            default: None,
            pairs: pairs.iter().map(|(key, _)| (*key, None)).collect(),
        },
        other => other.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::ExceptionHandler;
    use crate::code::OrdComparison;

    fn code_of(bytes: Vec<u8>) -> CodeAttribute {
        CodeAttribute {
            max_stack: 0,
            max_locals: 0,
            code: bytes,
            exception_table: vec![],
            attributes: vec![],
        }
    }

    #[test]
    fn straight_line_method_is_one_block() {
        // iload_0 iload_1 iadd ireturn
        let code = code_of(vec![0x1a, 0x1b, 0x60, 0xac]);
        let pool = ConstantPool::new();
        let graph = InsnGraph::disassemble(&code, &pool).unwrap();

        let entry = graph.block(graph.entry).unwrap();
        assert_eq!(
            entry.instructions,
            vec![
                Instruction::ILoad(0),
                Instruction::ILoad(1),
                Instruction::IAdd
            ]
        );

        let edges = graph.out_edges(graph.entry);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to, Some(Label::RETURN));
        assert_eq!(
            edges[0].instruction(),
            Some(&Instruction::IReturn)
        );

        // No trailing empty block survives
        assert_eq!(graph.blocks().count(), 3); // entry + return + rethrow
    }

    #[test]
    fn conditional_produces_jump_and_fallthrough() {
        // iload_0 ifeq +5; iconst_1 ireturn; iconst_0 ireturn
        let code = code_of(vec![0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac]);
        let pool = ConstantPool::new();
        let graph = InsnGraph::disassemble(&code, &pool).unwrap();

        let out = graph.out_edges(graph.entry);
        assert_eq!(out.len(), 2);

        let jump = out
            .iter()
            .find(|edge| matches!(edge.kind, EdgeKind::Jump { .. }))
            .unwrap();
        let fallthrough = out
            .iter()
            .find(|edge| matches!(edge.kind, EdgeKind::Fallthrough { .. }))
            .unwrap();

        // The bound jump no longer carries a numeric displacement
        match &jump.kind {
            EdgeKind::Jump { instruction } => {
                assert_eq!(*instruction, Instruction::If(OrdComparison::EQ, None));
            }
            _ => unreachable!(),
        }
        assert_ne!(jump.to, fallthrough.to);
    }

    #[test]
    fn switches_fan_out_per_case_plus_default() {
        // iload_0; tableswitch at offset 1, padding 2, default +27, low 1, high 3,
        // cases +29, +31, +33; then 4 iconst/ireturn pairs at offsets 28..36
        let mut bytes = vec![0x1a, 0xaa, 0, 0];
        for value in [27i32, 1, 3, 29, 31, 33] {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        bytes.extend_from_slice(&[0x04, 0xac, 0x05, 0xac, 0x06, 0xac, 0x03, 0xac]);
        let code = code_of(bytes);
        let pool = ConstantPool::new();
        let graph = InsnGraph::disassemble(&code, &pool).unwrap();

        let switch_edges: Vec<&Edge> = graph
            .edges()
            .filter(|edge| matches!(edge.kind, EdgeKind::Switch { .. }))
            .collect();
        assert_eq!(switch_edges.len(), 4);

        let mut values: Vec<Option<i32>> = switch_edges
            .iter()
            .map(|edge| match edge.kind {
                EdgeKind::Switch { value, .. } => value,
                _ => unreachable!(),
            })
            .collect();
        values.sort();
        assert_eq!(values, vec![None, Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn jsr_marks_fallthrough_inline() {
        // jsr +4; return; astore_1 ret 1
        let code = code_of(vec![0xa8, 0x00, 0x04, 0xb1, 0x4c, 0xa9, 0x01]);
        let pool = ConstantPool::new();
        let graph = InsnGraph::disassemble(&code, &pool).unwrap();

        let jsr_jump = graph
            .edges()
            .find(|edge| matches!(edge.kind, EdgeKind::JsrJump { .. }))
            .unwrap();
        let jsr_fallthrough = graph
            .edges()
            .find(|edge| matches!(edge.kind, EdgeKind::JsrFallthrough { .. }))
            .unwrap();
        assert_eq!(jsr_jump.from, jsr_fallthrough.from);

        let fallthrough_block = graph.block(jsr_fallthrough.to.unwrap()).unwrap();
        assert!(fallthrough_block.inline);

        // The ret edge is opaque until the trace resolves it
        assert_eq!(graph.opaque_edges().count(), 1);
    }

    #[test]
    fn exception_rows_cover_blocks_by_priority() {
        // iconst_0 istore_1 (covered); iconst_0 ireturn; handler: athrow
        let code = CodeAttribute {
            max_stack: 1,
            max_locals: 2,
            code: vec![0x03, 0x3c, 0x03, 0xac, 0xbf],
            exception_table: vec![ExceptionHandler {
                start_pc: 0,
                end_pc: 4,
                handler_pc: 4,
                catch_type: 0,
            }],
            attributes: vec![],
        };
        let pool = ConstantPool::new();
        let graph = InsnGraph::disassemble(&code, &pool).unwrap();

        let exception_edges: Vec<&Edge> = graph
            .edges()
            .filter(|edge| matches!(edge.kind, EdgeKind::Exception { .. }))
            .collect();
        assert!(!exception_edges.is_empty());
        for edge in exception_edges {
            match &edge.kind {
                EdgeKind::Exception {
                    priority,
                    throwable,
                    ..
                } => {
                    assert_eq!(*priority, 0);
                    assert!(throwable.is_none()); // catch-all
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn goto_past_end_is_preserved_raw() {
        // goto +32767; return
        let code = code_of(vec![0xa7, 0x7f, 0xff, 0xb1]);
        let pool = ConstantPool::new();
        let graph = InsnGraph::disassemble(&code, &pool).unwrap();

        // The raw goto (displacement intact) stays in the entry block
        let entry = graph.block(graph.entry).unwrap();
        assert_eq!(entry.instructions, vec![Instruction::Goto(Some(32767))]);

        // And the synthetic fallthrough keeps the return reachable in original order
        let out = graph.out_edges(graph.entry);
        assert_eq!(out.len(), 1);
        let next = out[0].to.unwrap();
        assert_eq!(graph.out_edges(next)[0].to, Some(Label::RETURN));
    }
}
