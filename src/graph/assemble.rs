use super::{Edge, EdgeKind, InsnGraph, Label};
use crate::classfile::{
    AttributeLike, CodeAttribute, Constant, ConstantPool, Error, ExceptionHandler, StackMapFrame,
    StackMapTable, Version, VerificationTypeInfo,
};
use crate::code::{switch_padding, Instruction};
use crate::trace::{Frame, Liveness, Trace};
use crate::verifier::{ErrorKind, Source, TypeChecker, VerificationType, Verifier};
use std::collections::{BTreeMap, BTreeSet};

/// Knobs for lowering a graph back to bytecode
pub struct AssembleOptions {
    /// Skip blocks the trace never reached (instead of writing and nopping them)
    pub remove_dead_blocks: bool,

    /// Compute a `StackMapTable` (ignored below class version 50.0, or when live `jsr`s remain)
    pub compute_frames: bool,

    /// Use the compressed frame kinds instead of emitting `full_frame` everywhere
    pub compress_frames: bool,
}

impl Default for AssembleOptions {
    fn default() -> AssembleOptions {
        AssembleOptions {
            remove_dead_blocks: true,
            compute_frames: true,
            compress_frames: true,
        }
    }
}

/// Where a recorded jump points
#[derive(Clone, Debug)]
enum JumpTarget {
    Block(Label),

    /// A finished position in the stream (used when routing through intermediary blocks)
    Absolute(usize),
}

/// One emitted jump instruction awaiting its displacement
struct RecordedJump {
    edge: Edge,
    target: JumpTarget,

    /// Is the operand a 32-bit displacement (`goto_w`/`jsr_w`)?
    wide: bool,
}

/// One contiguous range a block was written at (inline blocks can have several)
#[derive(Clone, Debug)]
struct Span {
    start: usize,
    end: usize,

    /// Bytecode offset of each `new`, by instruction index
    news: BTreeMap<usize, usize>,
}

struct Assembler<'a, 'g> {
    graph: &'a InsnGraph,
    trace: &'a Trace<'g>,
    pool: &'a mut ConstantPool,

    buf: Vec<u8>,
    offsets: BTreeMap<Label, Vec<Span>>,
    written_order: Vec<Label>,
    jumps: BTreeMap<usize, RecordedJump>,
    switches: BTreeMap<usize, Vec<Edge>>,
    exceptions: Vec<Edge>,
    inlined: Vec<(Edge, (usize, usize))>,

    /// `(position, final target)` of each synthetic `goto_w` intermediary; the position is a
    /// bytecode jump target and needs the same stack map frame as the final target
    intermediaries: Vec<(usize, Label)>,
    dead: BTreeSet<Label>,
}

impl InsnGraph {
    /// Lower this graph to a `Code` attribute
    ///
    /// All diagnostics accumulate in `verifier`; callers decide at the end whether a non-empty
    /// log is fatal (`verifier.finish()`) or whether they want the best-effort bytes anyway.
    pub fn assemble<'g>(
        &self,
        trace: &Trace<'g>,
        checker: &TypeChecker<'g>,
        version: Version,
        options: &AssembleOptions,
        pool: &mut ConstantPool,
        verifier: &mut Verifier,
    ) -> Result<CodeAttribute, Error> {
        let mut assembler = Assembler {
            graph: self,
            trace,
            pool,
            buf: vec![],
            offsets: BTreeMap::new(),
            written_order: vec![],
            jumps: BTreeMap::new(),
            switches: BTreeMap::new(),
            exceptions: vec![],
            inlined: vec![],
            intermediaries: vec![],
            dead: BTreeSet::new(),
        };

        assembler.write_blocks(options, verifier)?;
        assembler.fix_jumps(verifier);
        let exception_table = assembler.exception_table(verifier)?;
        let attributes = assembler.stack_map_frames(checker, version, options, verifier)?;

        Ok(CodeAttribute {
            max_stack: trace.max_stack as u16,
            max_locals: trace.max_locals as u16,
            code: assembler.buf,
            exception_table,
            attributes,
        })
    }
}

impl<'a, 'g> Assembler<'a, 'g> {
    // ------------------------------ Phase 1: block layout ------------------------------ //

    fn write_blocks(
        &mut self,
        options: &AssembleOptions,
        verifier: &mut Verifier,
    ) -> Result<(), Error> {
        let order: Vec<Label> = std::iter::once(self.graph.entry)
            .chain(
                self.graph
                    .blocks()
                    .map(|block| block.label)
                    .filter(|label| {
                        *label != self.graph.entry && !label.is_return() && !label.is_rethrow()
                    }),
            )
            .collect();

        for label in order {
            if !self.trace.reached(label) {
                if options.remove_dead_blocks {
                    log::debug!("skipping dead block {}", label);
                    continue;
                }
                self.dead.insert(label);
            }
            self.write_block(label, false, verifier)?;
        }
        Ok(())
    }

    fn write_block(
        &mut self,
        label: Label,
        inline: bool,
        verifier: &mut Verifier,
    ) -> Result<(), Error> {
        let inline = inline
            && self
                .graph
                .block(label)
                .map(|block| block.inline)
                .unwrap_or(false);
        if self.offsets.contains_key(&label) && !inline {
            return Ok(());
        }
        let block = match self.graph.block(label) {
            Some(block) => block,
            None => return Ok(()),
        };
        // Nothing to write and nothing flowing out: skip entirely
        if block.instructions.is_empty() && self.graph.out_edges(label).is_empty() {
            return Ok(());
        }

        self.widen_distant_jumps(label)?;
        self.repair_previous_fallthrough(label, verifier)?;

        let start = self.buf.len();
        let mut news: BTreeMap<usize, usize> = BTreeMap::new();

        let mut unbound_jumps = false;
        let mut unbound_returns = false;
        let mut unbound_athrows = false;

        for (index, instruction) in block.instructions.iter().enumerate() {
            if let Instruction::New(_) = instruction {
                news.insert(index, self.buf.len());
            }
            if instruction.is_jump() || instruction.is_switch() {
                unbound_jumps = true;
            } else if instruction.is_return() {
                unbound_returns = true;
            } else if *instruction == Instruction::AThrow {
                unbound_athrows = true;
            }
            instruction.write(&mut self.buf, self.pool)?;
        }

        if unbound_jumps {
            verifier.report(
                ErrorKind::InvalidBlock,
                Source::Block(label),
                String::from("block has unbound jumps"),
            );
        }
        if unbound_returns {
            verifier.report(
                ErrorKind::InvalidBlock,
                Source::Block(label),
                String::from("block has unbound returns"),
            );
        }
        if unbound_athrows {
            verifier.report(
                ErrorKind::InvalidBlock,
                Source::Block(label),
                String::from("block has unbound athrows"),
            );
        }

        // Classify the out edges; exception edges just accumulate for phase 3
        let mut fallthrough_edge: Option<Edge> = None;
        let mut jump_edge: Option<Edge> = None;
        let mut switch_edges: Vec<Edge> = vec![];
        let mut multiple_fallthroughs = false;
        let mut multiple_jumps = false;
        let mut has_out_edges = false;

        for edge in self.graph.out_edges(label) {
            match &edge.kind {
                EdgeKind::Fallthrough { .. } | EdgeKind::JsrFallthrough { .. } => {
                    if fallthrough_edge.is_some() {
                        multiple_fallthroughs = true;
                    }
                    fallthrough_edge = Some(edge.clone());
                    has_out_edges = true;
                }
                EdgeKind::Switch { .. } => {
                    switch_edges.push(edge.clone());
                    has_out_edges = true;
                }
                EdgeKind::Exception { .. } => {
                    if !inline {
                        self.exceptions.push(edge.clone());
                    }
                }
                EdgeKind::Jump { .. } | EdgeKind::JsrJump { .. } | EdgeKind::Ret { .. } => {
                    if matches!(edge.kind, EdgeKind::Ret { .. }) {
                        // A ret is written like any other terminator, but jumps nowhere that
                        // the assembler needs to fix up
                        has_out_edges = true;
                        if let Some(instruction) = edge.instruction() {
                            instruction.write(&mut self.buf, self.pool)?;
                        }
                        continue;
                    }
                    if jump_edge.is_some() {
                        multiple_jumps = true;
                    }
                    jump_edge = Some(edge.clone());
                    has_out_edges = true;
                }
            }
        }

        if multiple_fallthroughs {
            verifier.report(
                ErrorKind::InvalidBlock,
                Source::Block(label),
                String::from("multiple fallthrough edges on block"),
            );
        }

        let mut inlined_tail: Option<(Edge, Label)> = None;

        if let Some(edge) = &jump_edge {
            if multiple_jumps {
                verifier.report(
                    ErrorKind::InvalidBlock,
                    Source::Block(label),
                    String::from("multiple jumps on block"),
                );
            }
            if !switch_edges.is_empty() {
                verifier.report(
                    ErrorKind::InvalidBlock,
                    Source::Block(label),
                    String::from("jump and switch edges on block"),
                );
            }

            let instruction = edge.instruction().cloned().unwrap_or(Instruction::Goto(None));
            let is_conditional = instruction.is_conditional();
            let is_jsr = matches!(edge.kind, EdgeKind::JsrJump { .. });

            if is_jsr
                && !matches!(
                    fallthrough_edge.as_ref().map(|edge| &edge.kind),
                    Some(EdgeKind::JsrFallthrough { .. })
                )
            {
                verifier.report(
                    ErrorKind::InvalidBlock,
                    Source::Block(label),
                    String::from("jsr jump edge with no jsr fallthrough edge on block"),
                );
            } else if is_conditional && fallthrough_edge.is_none() {
                verifier.report(
                    ErrorKind::InvalidBlock,
                    Source::Block(label),
                    String::from("conditional jump edge with no fallthrough edge on block"),
                );
            } else if !is_conditional && !is_jsr && fallthrough_edge.is_some() {
                verifier.report(
                    ErrorKind::InvalidBlock,
                    Source::Block(label),
                    String::from("unconditional jump edge with a fallthrough edge on block"),
                );
            }

            let target = edge.to;

            // An unconditional jump to an inline block with at most one out edge: splice the
            // target here instead of jumping to it
            let can_splice = !is_conditional
                && !is_jsr
                && matches!(instruction, Instruction::Goto(_) | Instruction::GotoW(_))
                && target.is_some()
                && target != Some(label)
                && self
                    .graph
                    .block(target.unwrap())
                    .map(|block| block.inline)
                    .unwrap_or(false)
                && self.graph.out_edges(target.unwrap()).len() <= 1;

            if can_splice {
                inlined_tail = Some((edge.clone(), target.unwrap()));
            } else {
                let fallthrough_to = fallthrough_edge.as_ref().and_then(|edge| edge.to);
                self.write_jump(edge, instruction, fallthrough_to, verifier)?;
            }
        } else if !switch_edges.is_empty() {
            self.write_switch(label, &switch_edges, verifier)?;
        }

        if !has_out_edges && !label.is_return() && !label.is_rethrow() {
            verifier.report(
                ErrorKind::InvalidBlock,
                Source::Block(label),
                String::from("block has no out edges"),
            );
        }

        // Fallthrough handling: a terminator into the singletons writes the terminator; an
        // already-written target needs an explicit goto; an inline target is spliced in place
        let mut fallthrough_splice: Option<(Edge, Label)> = None;
        if let Some(edge) = &fallthrough_edge {
            match edge.to {
                Some(to) if to.is_return() || to.is_rethrow() => match edge.instruction() {
                    Some(instruction) => {
                        instruction.write(&mut self.buf, self.pool)?;
                    }
                    None => {
                        verifier.report(
                            ErrorKind::InvalidEdge,
                            Source::Edge {
                                from: edge.from,
                                to: edge.to,
                            },
                            String::from("fallthrough into return/rethrow with no terminator"),
                        );
                    }
                },
                Some(to)
                    if self
                        .graph
                        .block(to)
                        .map(|block| block.inline)
                        .unwrap_or(false)
                        && to != label
                        && !matches!(edge.kind, EdgeKind::JsrFallthrough { .. }) =>
                {
                    fallthrough_splice = Some((edge.clone(), to));
                }
                Some(to) if self.offsets.contains_key(&to) => {
                    let nearest = self.nearest_start(to, self.buf.len());
                    let delta = nearest as i64 - self.buf.len() as i64;
                    let goto = if delta >= -32767 {
                        Instruction::Goto(None)
                    } else {
                        Instruction::GotoW(None)
                    };
                    let wide = matches!(goto, Instruction::GotoW(_));
                    self.jumps.insert(
                        self.buf.len(),
                        RecordedJump {
                            edge: Edge::jump(label, Some(to), goto.clone()),
                            target: JumpTarget::Block(to),
                            wide,
                        },
                    );
                    goto.write(&mut self.buf, self.pool)?;
                    log::debug!("generated {:?} to account for edge {}", goto, edge);
                }
                _ => {} // natural fallthrough; the next block write lands here
            }
        }

        self.offsets.entry(label).or_default().push(Span {
            start,
            end: self.buf.len(),
            news,
        });
        self.written_order.push(label);

        // Tail splices happen after this block's span is closed, so inline copies get their
        // own ranges
        if let Some((edge, target)) = inlined_tail {
            self.write_block(target, true, verifier)?;
            if let Some(span) = self.offsets.get(&target).and_then(|spans| spans.last()) {
                self.inlined.push((edge, (span.start, span.end)));
            }
        }
        if let Some((edge, target)) = fallthrough_splice {
            self.write_block(target, true, verifier)?;
            if let Some(span) = self.offsets.get(&target).and_then(|spans| spans.last()) {
                self.inlined.push((edge, (span.start, span.end)));
            }
        }

        Ok(())
    }

    /// Emit a jump instruction for an edge, widening backward jumps that cannot reach
    fn write_jump(
        &mut self,
        edge: &Edge,
        instruction: Instruction,
        fallthrough_to: Option<Label>,
        verifier: &mut Verifier,
    ) -> Result<(), Error> {
        let target = match edge.to {
            Some(target) => target,
            None => {
                verifier.report(
                    ErrorKind::InvalidEdge,
                    Source::Edge {
                        from: edge.from,
                        to: None,
                    },
                    String::from("jump edge with no target"),
                );
                return Ok(());
            }
        };

        let already_written = self.offsets.get(&target).is_some();
        let mut wide = matches!(instruction, Instruction::GotoW(_) | Instruction::JsrW(_));
        let mut write_instruction = instruction.clone();

        if already_written && !wide {
            let nearest = self.nearest_start(target, self.buf.len());
            let delta = nearest as i64 - self.buf.len() as i64;
            if delta <= -32768 {
                if instruction.is_conditional() {
                    // Rewrite `if* far` as `ifnot* next; goto_w far`, where `next` is the
                    // fallthrough block the original branch would have continued into. Both
                    // sides of the rewrite then land on real blocks, so the stack map frames
                    // come out of the ordinary target computation.
                    let inverted = instruction
                        .invert()
                        .expect("conditional instructions invert");
                    let inverted_target = match fallthrough_to {
                        Some(next) => JumpTarget::Block(next),
                        // Structurally broken block (already reported); hop over the goto_w
                        None => JumpTarget::Absolute(self.buf.len() + 8),
                    };
                    self.jumps.insert(
                        self.buf.len(),
                        RecordedJump {
                            edge: edge.clone(),
                            target: inverted_target,
                            wide: false,
                        },
                    );
                    inverted.write(&mut self.buf, self.pool)?;

                    self.jumps.insert(
                        self.buf.len(),
                        RecordedJump {
                            edge: edge.clone(),
                            target: JumpTarget::Block(target),
                            wide: true,
                        },
                    );
                    Instruction::GotoW(None).write(&mut self.buf, self.pool)?;
                    log::debug!("widened conditional edge {} via inverted branch", edge);
                    return Ok(());
                }

                write_instruction = if instruction.is_jsr() {
                    Instruction::JsrW(None)
                } else {
                    Instruction::GotoW(None)
                };
                wide = true;
                log::debug!("adjusted edge {} to wide jump {:?}", edge, write_instruction);
            }
        }

        self.jumps.insert(
            self.buf.len(),
            RecordedJump {
                edge: edge.clone(),
                target: JumpTarget::Block(target),
                wide,
            },
        );
        write_instruction.write(&mut self.buf, self.pool)?;
        Ok(())
    }

    /// Emit the switch instruction shared by a block's switch edges
    fn write_switch(
        &mut self,
        label: Label,
        edges: &[Edge],
        verifier: &mut Verifier,
    ) -> Result<(), Error> {
        let mut instruction: Option<&Instruction> = None;
        let mut multiple = false;
        for edge in edges {
            if let EdgeKind::Switch {
                instruction: found, ..
            } = &edge.kind
            {
                if let Some(existing) = instruction {
                    if existing != found {
                        multiple = true;
                    }
                }
                instruction = Some(found);
            }
        }
        if multiple {
            verifier.report(
                ErrorKind::InvalidBlock,
                Source::Block(label),
                String::from("block has switch edges which reference different switch instructions"),
            );
        }
        let instruction = match instruction {
            Some(instruction) => instruction.clone(),
            None => return Ok(()),
        };

        self.switches.insert(self.buf.len(), edges.to_vec());
        instruction.write(&mut self.buf, self.pool)?;
        Ok(())
    }

    /// Route already-written narrow jumps through `goto_w` intermediaries once the method has
    /// outgrown 16-bit displacements
    fn widen_distant_jumps(&mut self, next: Label) -> Result<(), Error> {
        // The about-to-be-written block's size decides whether pending narrow jumps would be
        // pushed out of range by it. The estimate errs high; the slack absorbs goto repairs
        // and switch padding wobble.
        let upcoming = self.estimated_block_width(next) + 80;
        if self.buf.len() + upcoming <= 32767 {
            return Ok(());
        }

        loop {
            let distant: Vec<usize> = self
                .jumps
                .iter()
                .filter(|(offset, recorded)| {
                    !recorded.wide
                        && match &recorded.target {
                            JumpTarget::Block(target) => {
                                !self.offsets.contains_key(target)
                                    && self.buf.len() + upcoming - **offset > 32767
                            }
                            JumpTarget::Absolute(_) => false,
                        }
                })
                .map(|(offset, _)| *offset)
                .collect();
            if distant.is_empty() {
                return Ok(());
            }

            // If the last written block flows into the next block, the intermediaries we are
            // about to append would land in its path; hop over them with a wide goto whose
            // target is a real block (so it gets a stack map frame like any jump target)
            if let Some(&previous) = self.written_order.last() {
                let falls_into_next = self.graph.out_edges(previous).iter().any(|edge| {
                    matches!(edge.kind, EdgeKind::Fallthrough { instruction: None })
                        && edge.to == Some(next)
                });
                if falls_into_next {
                    let goto = Instruction::GotoW(None);
                    self.jumps.insert(
                        self.buf.len(),
                        RecordedJump {
                            edge: Edge::jump(previous, Some(next), goto.clone()),
                            target: JumpTarget::Block(next),
                            wide: true,
                        },
                    );
                    goto.write(&mut self.buf, self.pool)?;
                }
            }

            for offset in distant {
                let (edge, target) = match self.jumps.get(&offset) {
                    Some(recorded) => (recorded.edge.clone(), recorded.target.clone()),
                    None => continue,
                };
                let final_target = match &target {
                    JumpTarget::Block(label) => *label,
                    JumpTarget::Absolute(_) => continue,
                };
                let intermediary = self.buf.len();
                self.jumps.insert(
                    intermediary,
                    RecordedJump {
                        edge,
                        target,
                        wide: true,
                    },
                );
                Instruction::GotoW(None).write(&mut self.buf, self.pool)?;
                self.intermediaries.push((intermediary, final_target));

                if let Some(original) = self.jumps.get_mut(&offset) {
                    original.target = JumpTarget::Absolute(intermediary);
                }
                log::debug!(
                    "generated intermediary block at {} for distant jump at {}",
                    intermediary,
                    offset
                );
            }
        }
    }

    /// Upper-bound estimate of a block's emitted size (body plus terminators)
    fn estimated_block_width(&self, label: Label) -> usize {
        let block = match self.graph.block(label) {
            Some(block) => block,
            None => return 0,
        };
        let mut width = 0;
        for instruction in &block.instructions {
            width += instruction.width(self.buf.len() + width, self.pool);
        }
        for edge in self.graph.out_edges(label) {
            if let Some(instruction) = edge.instruction() {
                width += instruction.width(self.buf.len() + width, self.pool);
            }
        }
        width
    }

    /// The previous block falls through somewhere that is not about to be written: bridge the
    /// gap with an explicit wide goto
    fn repair_previous_fallthrough(
        &mut self,
        label: Label,
        _verifier: &mut Verifier,
    ) -> Result<(), Error> {
        let previous = match self.written_order.last() {
            Some(previous) => *previous,
            None => return Ok(()),
        };
        let fallthrough = self
            .graph
            .out_edges(previous)
            .iter()
            .find(|edge| {
                matches!(
                    edge.kind,
                    EdgeKind::Fallthrough { instruction: None } | EdgeKind::JsrFallthrough { .. }
                )
            })
            .cloned();

        if let Some(edge) = fallthrough {
            if let Some(to) = edge.to {
                if to != label
                    && !to.is_return()
                    && !to.is_rethrow()
                    && !self.offsets.contains_key(&to)
                {
                    // Wide by default: the real displacement is unknown until the target lands
                    let goto = Instruction::GotoW(None);
                    self.jumps.insert(
                        self.buf.len(),
                        RecordedJump {
                            edge: Edge::jump(previous, Some(to), goto.clone()),
                            target: JumpTarget::Block(to),
                            wide: true,
                        },
                    );
                    goto.write(&mut self.buf, self.pool)?;
                    log::debug!("generated jump to account for edge {}", edge);
                }
            }
        }
        Ok(())
    }

    /// Start offset of the target copy nearest to `from`
    fn nearest_start(&self, target: Label, from: usize) -> usize {
        self.offsets
            .get(&target)
            .map(|spans| {
                spans
                    .iter()
                    .map(|span| span.start)
                    .min_by_key(|start| (*start as i64 - from as i64).abs())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    // ------------------------------ Phase 2: edge fixup ------------------------------ //

    fn fix_jumps(&mut self, verifier: &mut Verifier) {
        let mut patches: Vec<(usize, i64, bool)> = vec![];

        for (&offset, recorded) in &self.jumps {
            let target_offset = match &recorded.target {
                JumpTarget::Absolute(position) => *position as i64,
                JumpTarget::Block(target) => match self.offsets.get(target) {
                    Some(_) => self.nearest_start(*target, offset) as i64,
                    None => {
                        verifier.report(
                            ErrorKind::InvalidEdge,
                            Source::Edge {
                                from: recorded.edge.from,
                                to: recorded.edge.to,
                            },
                            String::from("jump edge to a block that was never written"),
                        );
                        continue;
                    }
                },
            };
            let delta = target_offset - offset as i64;
            if !recorded.wide && i16::try_from(delta).is_err() {
                verifier.report(
                    ErrorKind::InvalidEdge,
                    Source::Edge {
                        from: recorded.edge.from,
                        to: recorded.edge.to,
                    },
                    format!("jump displacement {} does not fit in 16 bits", delta),
                );
                continue;
            }
            patches.push((offset, delta, recorded.wide));
        }
        if !patches.is_empty() {
            log::debug!("adjusted {} jump(s)", patches.len());
        }
        for (offset, delta, wide) in patches {
            if wide {
                patch_i32(&mut self.buf, offset + 1, delta as i32);
            } else {
                patch_i16(&mut self.buf, offset + 1, delta as i16);
            }
        }

        let switches = std::mem::take(&mut self.switches);
        for (&offset, edges) in &switches {
            let padding = switch_padding(offset);
            let base = offset + 1 + padding;
            let is_table = self.buf[offset] == 0xaa;
            let low = if is_table {
                read_i32(&self.buf, base + 4)
            } else {
                0
            };

            for edge in edges {
                let (value, target) = match &edge.kind {
                    EdgeKind::Switch { value, .. } => (*value, edge.to),
                    _ => continue,
                };
                let target = match target.filter(|to| self.offsets.contains_key(to)) {
                    Some(target) => target,
                    None => {
                        verifier.report(
                            ErrorKind::InvalidEdge,
                            Source::Edge {
                                from: edge.from,
                                to: edge.to,
                            },
                            String::from("switch edge to a block that was never written"),
                        );
                        continue;
                    }
                };
                let delta = (self.nearest_start(target, offset) as i64 - offset as i64) as i32;

                match value {
                    None => patch_i32(&mut self.buf, base, delta),
                    Some(value) if is_table => {
                        if value < low {
                            continue;
                        }
                        let slot = (value - low) as usize;
                        patch_i32(&mut self.buf, base + 12 + 4 * slot, delta);
                    }
                    Some(value) => {
                        // Lookup switch: scan the emitted pairs for the matching key
                        let npairs = read_i32(&self.buf, base + 4) as usize;
                        for pair in 0..npairs {
                            let key_at = base + 8 + 8 * pair;
                            if read_i32(&self.buf, key_at) == value {
                                patch_i32(&mut self.buf, key_at + 4, delta);
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.switches = switches;
    }

    // ------------------------------ Phase 3: exception table ------------------------------ //

    fn exception_table(&mut self, verifier: &mut Verifier) -> Result<Vec<ExceptionHandler>, Error> {
        let mut edges = self.exceptions.clone();
        edges.sort_by_key(|edge| match edge.kind {
            EdgeKind::Exception { priority, .. } => priority,
            _ => u16::MAX,
        });

        let mut table = vec![];
        for edge in edges {
            let (throwable, inline_coverage) = match &edge.kind {
                EdgeKind::Exception {
                    throwable,
                    inline_coverage,
                    ..
                } => (throwable.clone(), *inline_coverage),
                _ => continue,
            };

            let target = match edge.to {
                Some(target) => target,
                None => continue,
            };
            let handler_spans = match self.offsets.get(&target) {
                Some(spans) => spans,
                None => {
                    verifier.report(
                        ErrorKind::InvalidEdge,
                        Source::Edge {
                            from: edge.from,
                            to: edge.to,
                        },
                        String::from("exception edge to a block that was never written"),
                    );
                    continue;
                }
            };
            if handler_spans.len() > 1 {
                verifier.report(
                    ErrorKind::InvalidEdge,
                    Source::Edge {
                        from: edge.from,
                        to: edge.to,
                    },
                    String::from("multiple exception handler targets; is the handler inlined?"),
                );
            }
            let handler = handler_spans[0].start;

            let catch_type = match &throwable {
                Some(constant) => self.pool.add_deep(constant)?,
                None => 0,
            };

            let covered: Vec<(usize, usize)> = self
                .offsets
                .get(&edge.from)
                .map(|spans| spans.iter().map(|span| (span.start, span.end)).collect())
                .unwrap_or_default();

            for (start, mut end) in covered {
                if inline_coverage {
                    for (inlined_edge, (_, inlined_end)) in &self.inlined {
                        if inlined_edge.from == edge.from && *inlined_end > end {
                            end = *inlined_end;
                        }
                    }
                }
                table.push(ExceptionHandler {
                    start_pc: start as u16,
                    end_pc: end as u16,
                    handler_pc: handler as u16,
                    catch_type,
                });
            }
        }

        if !table.is_empty() {
            log::debug!("generated {} exception handler(s)", table.len());
        }
        Ok(table)
    }

    // ------------------------------ Phase 4: stack map frames ------------------------------ //

    fn stack_map_frames(
        &mut self,
        checker: &TypeChecker<'g>,
        version: Version,
        options: &AssembleOptions,
        verifier: &mut Verifier,
    ) -> Result<Vec<crate::classfile::Attribute>, Error> {
        // Dead blocks that were written anyway become nop...athrow so they still verify
        let dead_labels: Vec<Label> = self.dead.iter().copied().collect();
        if !dead_labels.is_empty() {
            log::debug!("{} dead block(s)", dead_labels.len());
        }
        for label in &dead_labels {
            if let Some(spans) = self.offsets.get(label) {
                for span in spans.clone() {
                    for offset in span.start..span.end.saturating_sub(1) {
                        self.buf[offset] = 0x00; // nop
                        self.jumps.remove(&offset);
                        self.switches.remove(&offset);
                    }
                    if span.end > span.start {
                        self.buf[span.end - 1] = 0xbf; // athrow
                        self.jumps.remove(&(span.end - 1));
                        self.switches.remove(&(span.end - 1));
                    }
                }
            }
        }

        let worth_writing = !dead_labels.is_empty()
            || !self.jumps.is_empty()
            || !self.switches.is_empty()
            || !self.exceptions.is_empty();
        if !options.compute_frames || !version.has_stack_maps() || !worth_writing {
            return Ok(vec![]);
        }

        // Any live jsr makes frames unrepresentable: the jump target's frame would need a
        // returnAddress on the stack
        let live_jsr = self
            .jumps
            .values()
            .any(|recorded| matches!(recorded.edge.kind, EdgeKind::JsrJump { .. }));
        if live_jsr {
            log::debug!("not computing frames as live jsr edges were found");
            return Ok(vec![]);
        }

        let trace = self.trace;
        let liveness = Liveness::from_trace(trace, self.graph);

        // Offset -> rendered frame. The bootstrap (implicit) frame sits at -1 and is never
        // emitted; it only anchors the first offset delta.
        let mut rendered: BTreeMap<i64, RenderedFrame> = BTreeMap::new();

        if let Some(first) = trace
            .entries
            .get(&self.graph.entry)
            .and_then(|frames| frames.first())
        {
            let all: BTreeSet<u16> = first.locals.keys().copied().collect();
            let bootstrap = self.render_frame(first, &all, verifier)?;
            rendered.insert(-1, bootstrap);
        }

        for label in &dead_labels {
            if let Some(spans) = self.offsets.get(label).cloned() {
                for span in spans {
                    rendered.insert(
                        span.start as i64,
                        RenderedFrame {
                            locals: vec![],
                            stack: vec![VerificationTypeInfo::Object(
                                self.pool.add_deep(&Constant::class("java/lang/Throwable"))?,
                            )],
                            max_actual: 0,
                        },
                    );
                }
            }
        }

        // Every jump, switch and exception target needs a frame; merge the entry constraints
        // of each such block
        let mut targets: Vec<(Edge, Label)> = vec![];
        for recorded in self.jumps.values() {
            if let Some(to) = recorded.edge.to {
                targets.push((recorded.edge.clone(), to));
            }
        }
        for edges in self.switches.values() {
            for edge in edges {
                if let Some(to) = edge.to {
                    targets.push((edge.clone(), to));
                }
            }
        }
        for edge in &self.exceptions {
            if let Some(to) = edge.to {
                targets.push((edge.clone(), to));
            }
        }

        let mut visited: BTreeSet<Label> = BTreeSet::new();
        for (edge, block) in targets {
            if !self.offsets.contains_key(&block)
                || self.dead.contains(&block)
                || !visited.insert(block)
            {
                continue;
            }

            let frames = match trace.entries.get(&block) {
                Some(frames) if !frames.is_empty() => frames,
                _ => continue,
            };
            let live = liveness.live_in(block).clone();

            let mut stack: Vec<VerificationType<'g>> =
                frames[0].stack.iter().map(|entry| entry.ty).collect();
            let mut locals: BTreeMap<u16, VerificationType<'g>> = frames[0]
                .locals
                .iter()
                .map(|(index, entry)| (*index, entry.ty))
                .collect();

            for frame in &frames[1..] {
                if frame.stack.len() != stack.len() {
                    verifier.report(
                        ErrorKind::InvalidStackMerge,
                        Source::Edge {
                            from: edge.from,
                            to: edge.to,
                        },
                        format!(
                            "expected stack size {} for edge, got size {}",
                            stack.len(),
                            frame.stack.len()
                        ),
                    );
                    continue;
                }
                for (index, entry) in frame.stack.iter().enumerate() {
                    if !checker.check_merge(stack[index], entry.ty) {
                        verifier.report(
                            ErrorKind::InvalidStackMerge,
                            Source::Edge {
                                from: edge.from,
                                to: edge.to,
                            },
                            format!(
                                "invalid stack type merge at index {} ({} and {})",
                                index, stack[index], entry.ty
                            ),
                        );
                    }
                    stack[index] = checker.merge(stack[index], entry.ty);
                }
                for index in &live {
                    let theirs = frame.locals.get(index).map(|entry| entry.ty);
                    let ours = locals.get(index).copied();
                    match (ours, theirs) {
                        (Some(a), Some(b)) => {
                            if !checker.check_merge(a, b) {
                                verifier.report(
                                    ErrorKind::InvalidLocalsMerge,
                                    Source::Edge {
                                        from: edge.from,
                                        to: edge.to,
                                    },
                                    format!(
                                        "invalid locals type merge at index {} ({} and {})",
                                        index, a, b
                                    ),
                                );
                            }
                            locals.insert(*index, checker.merge(a, b));
                        }
                        (None, Some(b)) => {
                            verifier.report(
                                ErrorKind::InvalidLocalsMerge,
                                Source::Edge {
                                    from: edge.from,
                                    to: edge.to,
                                },
                                format!(
                                    "invalid locals type merge at index {}, expected live local (have {})",
                                    index, b
                                ),
                            );
                            locals.insert(*index, b);
                        }
                        (Some(a), None) => {
                            verifier.report(
                                ErrorKind::InvalidLocalsMerge,
                                Source::Edge {
                                    from: edge.from,
                                    to: edge.to,
                                },
                                format!(
                                    "invalid locals type merge at index {}, expected live local (have {})",
                                    index, a
                                ),
                            );
                        }
                        (None, None) => {
                            verifier.report(
                                ErrorKind::InvalidLocalsMerge,
                                Source::Edge {
                                    from: edge.from,
                                    to: edge.to,
                                },
                                format!(
                                    "illegal locals type merge at index {}, expected live local",
                                    index
                                ),
                            );
                        }
                    }
                }
            }

            let merged = MergedFrame { stack, locals };
            let frame_rendered = self.render_merged(&merged, &live, verifier)?;
            let start = self.offsets[&block][0].start;
            rendered.insert(start as i64, frame_rendered);
        }

        // Intermediary gotos are bytecode-level jump targets too; each carries the same frame
        // as the block it forwards to
        for (position, target) in self.intermediaries.clone() {
            if let Some(spans) = self.offsets.get(&target) {
                let start = spans[0].start as i64;
                if let Some(frame) = rendered.get(&start).cloned() {
                    rendered.insert(position as i64, frame);
                }
            }
        }

        // Emit in offset order, compressing each frame against its predecessor. The bootstrap
        // frame (key -1) is never emitted; it only primes the compression state.
        let mut frames: Vec<StackMapFrame> = vec![];
        let mut prev_offset: i64 = -1;
        let mut prev_locals: Vec<VerificationTypeInfo> = vec![];
        let mut prev_max_actual: usize = 0;

        for (&offset, frame) in &rendered {
            if offset < 0 {
                prev_locals = frame.locals.clone();
                prev_max_actual = frame.max_actual;
                continue;
            }

            let offset_delta = (offset - (prev_offset + 1)).max(0) as u16;
            let compressed = if options.compress_frames {
                compress(frame, offset_delta, &prev_locals, prev_max_actual)
            } else {
                None
            };
            frames.push(compressed.unwrap_or(StackMapFrame::Full {
                offset_delta,
                locals: frame.locals.clone(),
                stack: frame.stack.clone(),
            }));
            prev_locals = frame.locals.clone();
            prev_max_actual = frame.max_actual;
            prev_offset = offset;
        }

        if frames.is_empty() {
            return Ok(vec![]);
        }
        log::debug!("generated {} stackmap frame(s)", frames.len());
        let table = StackMapTable(frames);
        Ok(vec![table.to_attribute(self.pool)?])
    }

    /// Render a traced frame into serialized verification types, with all the given locals live
    fn render_frame(
        &mut self,
        frame: &Frame<'g>,
        live: &BTreeSet<u16>,
        verifier: &mut Verifier,
    ) -> Result<RenderedFrame, Error> {
        let merged = MergedFrame {
            stack: frame.stack.iter().map(|entry| entry.ty).collect(),
            locals: frame
                .locals
                .iter()
                .map(|(index, entry)| (*index, entry.ty))
                .collect(),
        };
        self.render_merged(&merged, live, verifier)
    }

    fn render_merged(
        &mut self,
        frame: &MergedFrame<'g>,
        live: &BTreeSet<u16>,
        verifier: &mut Verifier,
    ) -> Result<RenderedFrame, Error> {
        let mut locals: Vec<VerificationTypeInfo> = vec![];
        let mut max_local = 0;
        let max_actual = live.iter().next_back().map(|i| *i as usize + 1).unwrap_or(0);

        if let Some(&highest) = frame.locals.keys().next_back() {
            let mut index: u16 = 0;
            while index <= highest {
                let ty = frame
                    .locals
                    .get(&index)
                    .copied()
                    .unwrap_or(VerificationType::Top);

                // uninitializedThis must be spelled out whether or not the local is live
                let keep = live.contains(&index) || ty == VerificationType::UninitializedThis;
                if keep {
                    locals.push(self.render_type(ty, verifier)?);
                    max_local = locals.len();
                } else {
                    locals.push(VerificationTypeInfo::Top);
                }

                index += if ty.is_wide() { 2 } else { 1 };
            }
            locals.truncate(max_local);
        }

        let mut stack: Vec<VerificationTypeInfo> = vec![];
        let mut skip_sentinel = false;
        for ty in &frame.stack {
            if skip_sentinel {
                skip_sentinel = false;
                continue;
            }
            stack.push(self.render_type(*ty, verifier)?);
            skip_sentinel = ty.is_wide();
        }

        Ok(RenderedFrame {
            locals,
            stack,
            max_actual,
        })
    }

    /// Serialize one verification type, materialising `uninitialized` offsets
    fn render_type(
        &mut self,
        ty: VerificationType<'g>,
        verifier: &mut Verifier,
    ) -> Result<VerificationTypeInfo, Error> {
        Ok(match ty {
            VerificationType::Top => VerificationTypeInfo::Top,
            VerificationType::Int => VerificationTypeInfo::Integer,
            VerificationType::Float => VerificationTypeInfo::Float,
            VerificationType::Long => VerificationTypeInfo::Long,
            VerificationType::Double => VerificationTypeInfo::Double,
            VerificationType::Null => VerificationTypeInfo::Null,
            VerificationType::UninitializedThis => VerificationTypeInfo::UninitializedThis,
            VerificationType::Reference(ref_type) => {
                let index = self
                    .pool
                    .add_deep(&Constant::class(&ref_type.class_name()))?;
                VerificationTypeInfo::Object(index)
            }
            VerificationType::Uninitialized(source) => {
                let offset = match source {
                    Source::Instruction { block, index } => {
                        let spans = self.offsets.get(&block);
                        match spans {
                            Some(spans) if spans.len() == 1 => {
                                spans[0].news.get(&index).copied()
                            }
                            Some(spans) if spans.len() > 1 => {
                                verifier.report(
                                    ErrorKind::InvalidType,
                                    source,
                                    String::from(
                                        "unable to determine source of uninitialised type as block is written multiple times",
                                    ),
                                );
                                spans[0].news.get(&index).copied()
                            }
                            _ => None,
                        }
                    }
                    _ => None,
                };
                match offset {
                    Some(offset) => VerificationTypeInfo::Uninitialized(offset as u16),
                    None => {
                        verifier.report(
                            ErrorKind::InvalidType,
                            source,
                            String::from("uninitialized type with no written new instruction"),
                        );
                        VerificationTypeInfo::Top
                    }
                }
            }
            VerificationType::ReturnAddress(source) => {
                verifier.report(
                    ErrorKind::InvalidType,
                    source,
                    String::from("return addresses cannot appear in stack map frames"),
                );
                VerificationTypeInfo::Top
            }
        })
    }
}

/// A merged (multi-path) frame at one jump target, types only
struct MergedFrame<'g> {
    stack: Vec<VerificationType<'g>>,
    locals: BTreeMap<u16, VerificationType<'g>>,
}

/// A frame rendered into serialized verification types
#[derive(Clone)]
struct RenderedFrame {
    locals: Vec<VerificationTypeInfo>,
    stack: Vec<VerificationTypeInfo>,

    /// One past the highest live local (drives chop/append decisions)
    max_actual: usize,
}

/// Try to compress a frame against its predecessor
fn compress(
    frame: &RenderedFrame,
    offset_delta: u16,
    prev_locals: &[VerificationTypeInfo],
    prev_max_actual: usize,
) -> Option<StackMapFrame> {
    let same_locals = frame.locals == prev_locals;

    if same_locals {
        match frame.stack.len() {
            0 => return Some(StackMapFrame::SameLocalsNoStack { offset_delta }),
            1 => {
                return Some(StackMapFrame::SameLocalsOneStack {
                    offset_delta,
                    stack: frame.stack[0],
                })
            }
            _ => return None,
        }
    }

    if frame.stack.is_empty() && frame.max_actual != prev_max_actual {
        let ours = frame.locals.len() as i64;
        let theirs = prev_locals.len() as i64;
        let delta = ours - theirs;
        if (-3..0).contains(&delta) && frame.locals[..] == prev_locals[..ours as usize] {
            return Some(StackMapFrame::ChopLocalsNoStack {
                offset_delta,
                chopped_k: (-delta) as u8,
            });
        }
        if (1..=3).contains(&delta) && frame.locals[..theirs as usize] == prev_locals[..] {
            return Some(StackMapFrame::AppendLocalsNoStack {
                offset_delta,
                locals: frame.locals[theirs as usize..].to_vec(),
            });
        }
    }

    None
}

fn patch_i16(buf: &mut [u8], at: usize, value: i16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

fn patch_i32(buf: &mut [u8], at: usize, value: i32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
